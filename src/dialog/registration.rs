use super::DialogId;
use crate::{
    rsip_ext::RsipResponseExt,
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        make_call_id, make_tag,
        transaction::Transaction,
    },
    transport::SipAddr,
    Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Response, SipMessage, StatusCode,
};
use tracing::info;

/// REGISTER client.
///
/// Binds a user to this endpoint's address at a registrar and keeps the
/// binding fresh: call [`register`](Self::register) again before
/// [`expires`](Self::expires) runs out (a margin of ~25% is customary).
/// All refreshes reuse one Call-ID with an increasing CSeq, as the
/// registrar expects.
///
/// The registrar reports the address it saw us from in the top Via's
/// `received`/`rport`; the client captures it and advertises it in the
/// Contact of subsequent registrations, so bindings stay reachable from
/// behind NAT. Not thread-safe: drive one `Registration` from one task.
pub struct Registration {
    pub last_seq: u32,
    pub endpoint: EndpointInnerRef,
    /// User part of the address-of-record to register.
    pub user: Option<String>,
    pub contact: Option<rsip::typed::Contact>,
    pub allow: rsip::headers::Allow,
    /// Public address of this client as seen by the registrar.
    pub public_address: Option<rsip::HostWithPort>,
    pub call_id: rsip::headers::CallId,
}

impl Registration {
    pub fn new(endpoint: EndpointInnerRef, user: Option<String>) -> Self {
        let call_id = make_call_id(endpoint.option.callid_suffix.as_deref());
        let allow = endpoint
            .option
            .allows
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", ")
            .into();
        Self {
            last_seq: 0,
            endpoint,
            user,
            contact: None,
            allow,
            public_address: None,
            call_id,
        }
    }

    pub fn discovered_public_address(&self) -> Option<rsip::HostWithPort> {
        self.public_address.clone()
    }

    /// Remaining validity of the current binding in seconds, from the
    /// `expires` parameter the registrar put on our Contact. Defaults to
    /// 50 when the registrar did not say.
    pub fn expires(&self) -> u32 {
        self.contact
            .as_ref()
            .and_then(|c| c.expires())
            .map(|e| e.seconds().unwrap_or(50))
            .unwrap_or(50)
    }

    /// Send one REGISTER to `server` and wait for its final response.
    ///
    /// The Request-URI is the server as given; the To/From address is
    /// the server with [`user`](Self::user) as user part. The Contact is
    /// taken from the last 200 when there was one, else built from the
    /// discovered public address, else from the local Via address.
    /// `expires` of `Some(0)` unregisters.
    pub async fn register(&mut self, server: rsip::Uri, expires: Option<u32>) -> Result<Response> {
        self.last_seq += 1;

        let mut to = rsip::typed::To {
            display_name: None,
            uri: server.clone(),
            params: vec![],
        };

        if let Some(user) = &self.user {
            to.uri.auth = Some(rsip::auth::Auth {
                user: user.clone(),
                password: None,
            });
        }

        let from = rsip::typed::From {
            display_name: None,
            uri: to.uri.clone(),
            params: vec![],
        }
        .with_tag(make_tag());

        let via = self.endpoint.get_via(None, None)?;

        let contact = self.contact.clone().unwrap_or_else(|| {
            let contact_host_with_port = self
                .public_address
                .clone()
                .unwrap_or_else(|| via.uri.host_with_port.clone());
            rsip::typed::Contact {
                display_name: None,
                uri: rsip::Uri {
                    auth: to.uri.auth.clone(),
                    scheme: Some(rsip::Scheme::Sip),
                    host_with_port: contact_host_with_port,
                    params: vec![],
                    headers: vec![],
                },
                params: vec![],
            }
        });
        let mut request = self.endpoint.make_request(
            rsip::Method::Register,
            server,
            via,
            from,
            to,
            self.last_seq,
            Some(self.call_id.clone()),
        );

        request.headers.unique_push(contact.into());
        request.headers.unique_push(self.allow.clone().into());
        if let Some(expires) = expires {
            request
                .headers
                .unique_push(rsip::headers::Expires::from(expires).into());
        }

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);

        tx.send().await?;

        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Response(resp) => match resp.status_code {
                    StatusCode::Trying => {
                        continue;
                    }
                    StatusCode::OK => {
                        let received = resp.via_received();
                        if let Ok(contact) = resp.contact_header() {
                            self.contact = contact.typed().ok();
                        };
                        if self.public_address != received {
                            info!(
                                "discovered public address: {:?} -> {:?}",
                                self.public_address, received
                            );
                            self.public_address = received;
                        }
                        info!(
                            "registration done: {:?} {:?}",
                            resp.status_code,
                            self.contact.as_ref().map(|c| c.uri.to_string())
                        );
                        return Ok(resp);
                    }
                    _ => {
                        info!("registration done: {:?}", resp.status_code);
                        return Ok(resp);
                    }
                },
                _ => break,
            }
        }
        Err(crate::Error::DialogError(
            "registration transaction is already terminated".to_string(),
            DialogId::try_from(&tx.original)?,
            StatusCode::BadRequest,
        ))
    }

    /// Contact for in-dialog use that prefers the registrar-discovered
    /// public address over the local one.
    pub fn create_nat_aware_contact(
        username: &str,
        public_address: Option<rsip::HostWithPort>,
        local_address: &SipAddr,
    ) -> rsip::typed::Contact {
        let contact_host_with_port = public_address.unwrap_or_else(|| local_address.addr.clone());

        rsip::typed::Contact {
            display_name: None,
            uri: rsip::Uri {
                scheme: Some(rsip::Scheme::Sip),
                auth: Some(rsip::Auth {
                    user: username.to_string(),
                    password: None,
                }),
                host_with_port: contact_host_with_port,
                params: vec![],
                headers: vec![],
            },
            params: vec![],
        }
    }
}
