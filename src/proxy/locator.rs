use crate::{Error, Result};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Address-of-record key for a URI: `user@host`, lowercased. The port is
/// not part of the identity, so `sip:bob@example.com:5060` and
/// `sip:bob@example.com` resolve to the same record.
pub fn aor_from_uri(uri: &rsip::Uri) -> Result<String> {
    let user = uri
        .auth
        .as_ref()
        .map(|auth| auth.user.as_str())
        .ok_or_else(|| Error::ProxyError(format!("no user part in uri: {}", uri)))?;
    Ok(format!(
        "{}@{}",
        user.to_lowercase(),
        uri.host_with_port.host.to_string().to_lowercase()
    ))
}

/// One registered contact of an address-of-record.
#[derive(Clone, Debug)]
pub struct ContactBinding {
    pub uri: rsip::Uri,
    /// Absolute expiry; bindings past this point are dropped on read.
    pub expires_at: Instant,
    /// The granted lifetime in seconds, as answered in the 200.
    pub expires: u32,
    /// Call-ID and CSeq of the REGISTER that created this binding, used
    /// to drop out-of-order refreshes (RFC 3261 10.3 step 7).
    pub call_id: String,
    pub cseq: u32,
}

impl ContactBinding {
    pub fn new(uri: rsip::Uri, expires: u32, call_id: String, cseq: u32) -> Self {
        ContactBinding {
            uri,
            expires_at: Instant::now() + Duration::from_secs(expires as u64),
            expires,
            call_id,
            cseq,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Seconds left before expiry, rounded up so a freshly granted
    /// binding reports the full lifetime.
    pub fn remaining(&self) -> u32 {
        let ms = self
            .expires_at
            .saturating_duration_since(Instant::now())
            .as_millis();
        ms.div_ceil(1000) as u32
    }
}

/// Location service the registrar writes and the proxy reads. Lookups
/// never return expired bindings.
pub trait Locator: Send + Sync {
    fn has_user(&self, aor: &str) -> bool;
    fn add_user(&self, aor: &str);
    fn remove_user(&self, aor: &str);
    fn get_user_contacts(&self, aor: &str) -> Vec<ContactBinding>;
    /// Insert or refresh one binding. A refresh with the same Call-ID but
    /// a CSeq not above the stored one is ignored.
    fn add_user_contact(&self, aor: &str, binding: ContactBinding);
    fn remove_user_contact(&self, aor: &str, contact: &rsip::Uri);
    fn remove_user_contacts(&self, aor: &str);
}

/// In-memory location service. A user may exist with zero bindings; that
/// still counts as known for `has_user`.
#[derive(Default)]
pub struct MemoryLocator {
    users: DashMap<String, Vec<ContactBinding>>,
}

impl MemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locator for MemoryLocator {
    fn has_user(&self, aor: &str) -> bool {
        self.users.contains_key(aor)
    }

    fn add_user(&self, aor: &str) {
        self.users.entry(aor.to_string()).or_default();
    }

    fn remove_user(&self, aor: &str) {
        self.users.remove(aor);
    }

    fn get_user_contacts(&self, aor: &str) -> Vec<ContactBinding> {
        match self.users.get_mut(aor) {
            Some(mut bindings) => {
                bindings.retain(|b| !b.is_expired());
                bindings.clone()
            }
            None => Vec::new(),
        }
    }

    fn add_user_contact(&self, aor: &str, binding: ContactBinding) {
        let mut bindings = self.users.entry(aor.to_string()).or_default();
        let contact = binding.uri.to_string();
        if let Some(existing) = bindings.iter_mut().find(|b| b.uri.to_string() == contact) {
            if existing.call_id == binding.call_id && binding.cseq <= existing.cseq {
                debug!(aor, contact, "stale registration refresh ignored");
                return;
            }
            *existing = binding;
        } else {
            bindings.push(binding);
        }
    }

    fn remove_user_contact(&self, aor: &str, contact: &rsip::Uri) {
        if let Some(mut bindings) = self.users.get_mut(aor) {
            let contact = contact.to_string();
            bindings.retain(|b| b.uri.to_string() != contact);
        }
    }

    fn remove_user_contacts(&self, aor: &str) {
        if let Some(mut bindings) = self.users.get_mut(aor) {
            bindings.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> rsip::Uri {
        rsip::Uri::try_from(s).expect("uri")
    }

    #[test]
    fn test_aor_ignores_port_and_case() {
        let a = aor_from_uri(&uri("sip:Bob@Example.COM:5060")).unwrap();
        let b = aor_from_uri(&uri("sip:bob@example.com")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "bob@example.com");

        assert!(aor_from_uri(&uri("sip:example.com")).is_err());
    }

    #[test]
    fn test_expired_bindings_are_filtered() {
        let locator = MemoryLocator::new();
        let mut binding =
            ContactBinding::new(uri("sip:bob@10.0.0.7:5062"), 600, "c1".into(), 1);
        locator.add_user_contact("bob@example.com", binding.clone());
        assert_eq!(locator.get_user_contacts("bob@example.com").len(), 1);

        binding.expires_at = Instant::now() - Duration::from_secs(1);
        locator.add_user_contact(
            "bob@example.com",
            ContactBinding {
                cseq: 2,
                ..binding
            },
        );
        assert!(locator.get_user_contacts("bob@example.com").is_empty());
        assert!(locator.has_user("bob@example.com"));
    }

    #[test]
    fn test_refresh_replaces_and_stale_cseq_is_ignored() {
        let locator = MemoryLocator::new();
        let aor = "bob@example.com";
        locator.add_user_contact(
            aor,
            ContactBinding::new(uri("sip:bob@10.0.0.7:5062"), 600, "c1".into(), 5),
        );
        // Same Call-ID, lower CSeq: out-of-order retransmission, dropped.
        locator.add_user_contact(
            aor,
            ContactBinding::new(uri("sip:bob@10.0.0.7:5062"), 60, "c1".into(), 4),
        );
        assert_eq!(locator.get_user_contacts(aor)[0].expires, 600);
        // New Call-ID always wins.
        locator.add_user_contact(
            aor,
            ContactBinding::new(uri("sip:bob@10.0.0.7:5062"), 120, "c2".into(), 1),
        );
        assert_eq!(locator.get_user_contacts(aor)[0].expires, 120);

        // A second device is a second binding, not a replacement.
        locator.add_user_contact(
            aor,
            ContactBinding::new(uri("sip:bob@10.0.0.8:5064"), 120, "c3".into(), 1),
        );
        assert_eq!(locator.get_user_contacts(aor).len(), 2);

        locator.remove_user_contact(aor, &uri("sip:bob@10.0.0.7:5062"));
        assert_eq!(locator.get_user_contacts(aor).len(), 1);
        locator.remove_user_contacts(aor);
        assert!(locator.get_user_contacts(aor).is_empty());
    }
}
