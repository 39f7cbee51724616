use crate::{Error, Result};
use rsip::headers::UntypedHeader;
use rsip::{
    param::Tag,
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Method,
};
use std::hash::Hash;

/// Which side of the exchange a transaction plays. The role is part of
/// the key so that a client and a server transaction for the same
/// message (loopback, proxy legs on one endpoint) never collide in the
/// dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl std::fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "uac"),
            TransactionRole::Server => write!(f, "uas"),
        }
    }
}

/// RFC 3261 17.2.3 matching signature: the Via branch plus method,
/// CSeq number, From tag and Call-ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261 {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
}

impl Hash for Rfc3261 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
    }
}

/// Fallback signature for peers that send pre-RFC-3261 branches
/// (no `z9hG4bK` cookie): method, CSeq, From tag, Call-ID and the Via
/// sent-by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543 {
    pub role: TransactionRole,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
    pub via_host_port: HostWithPort,
}

impl Hash for Rfc2543 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
        self.via_host_port.to_string().hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TransactionKey {
    RFC3261(Rfc3261),
    RFC2543(Rfc2543),
    Invalid,
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::RFC3261(key) => write!(
                f,
                "{} {} {}/{} {}({})",
                key.role, key.call_id, key.method, key.cseq, key.from_tag, key.branch,
            ),
            TransactionKey::RFC2543(key) => write!(
                f,
                "{} {} {}/{} {}[{}]",
                key.role, key.call_id, key.method, key.cseq, key.from_tag, key.via_host_port
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

impl TransactionKey {
    /// Key for a request. ACK maps onto the INVITE it acknowledges so a
    /// non-2xx ACK reaches the INVITE transaction; a 2xx ACK carries a
    /// fresh branch and is correlated by the endpoint instead.
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let mut method = req.method().clone();
        if method == Method::Ack {
            method = Method::Invite;
        }
        let from_tag = req.from_header()?.tag()?.ok_or(Error::TransactionError(
            "from tag missing".to_string(),
            TransactionKey::Invalid,
        ))?;
        let call_id = req.call_id_header()?.value().to_string();
        match via.branch() {
            Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
                role,
                branch: branch.to_string(),
                method,
                cseq: req.cseq_header()?.seq()?,
                from_tag,
                call_id,
            })),
            None => Ok(TransactionKey::RFC2543(Rfc2543 {
                role,
                method,
                cseq: req.cseq_header()?.seq()?,
                from_tag,
                call_id,
                via_host_port: via.uri.host_with_port,
            })),
        }
    }

    /// Key for an inbound response; responses always target a client
    /// transaction.
    pub fn from_response(resp: &rsip::Response) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        let method = cseq.method()?;
        let from_tag = resp.from_header()?.tag()?.ok_or(Error::TransactionError(
            "from tag missing".to_string(),
            TransactionKey::Invalid,
        ))?;
        let call_id = resp.call_id_header()?.value().to_string();
        match via.branch() {
            Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
                role: TransactionRole::Client,
                branch: branch.to_string(),
                method,
                cseq: cseq.seq()?,
                from_tag,
                call_id,
            })),
            None => Ok(TransactionKey::RFC2543(Rfc2543 {
                role: TransactionRole::Client,
                method,
                cseq: cseq.seq()?,
                from_tag,
                call_id,
                via_host_port: via.uri.host_with_port,
            })),
        }
    }

    /// Same signature with the method swapped, used to route a CANCEL
    /// to the INVITE server transaction it targets.
    pub fn with_method(&self, method: Method) -> Self {
        match self {
            TransactionKey::RFC3261(key) => TransactionKey::RFC3261(Rfc3261 {
                method,
                ..key.clone()
            }),
            TransactionKey::RFC2543(key) => TransactionKey::RFC2543(Rfc2543 {
                method,
                ..key.clone()
            }),
            TransactionKey::Invalid => TransactionKey::Invalid,
        }
    }
}

#[test]
fn test_transaction_key() -> Result<()> {
    use rsip::headers::*;
    let register_req = rsip::message::Request {
        method: rsip::method::Method::Register,
        uri: rsip::Uri {
            scheme: Some(rsip::Scheme::Sips),
            host_with_port: rsip::Domain::from("example.com").into(),
            ..Default::default()
        },
        headers: vec![
            Via::new("SIP/2.0/TLS client.biloxi.example.com:5061;branch=z9hG4bKnashd92").into(),
            CSeq::new("2 REGISTER").into(),
            From::new("Bob <sips:bob@biloxi.example.com>;tag=ja743ks76zlflH").into(),
            CallId::new("1j9FpLxk3uxtm8tn@biloxi.example.com").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    };
    let key = TransactionKey::from_request(&register_req, TransactionRole::Server)?;
    assert_eq!(
        key,
        TransactionKey::RFC3261(Rfc3261 {
            role: TransactionRole::Server,
            branch: "z9hG4bKnashd92".to_string(),
            method: Method::Register,
            cseq: 2,
            from_tag: Tag::new("ja743ks76zlflH"),
            call_id: "1j9FpLxk3uxtm8tn@biloxi.example.com".to_string(),
        })
    );

    let register_resp = rsip::message::Response {
        status_code: rsip::StatusCode::OK,
        version: rsip::Version::V2,
        headers: vec![
            Via::new("SIP/2.0/TLS client.biloxi.example.com:5061;branch=z9hG4bKnashd92").into(),
            CSeq::new("2 REGISTER").into(),
            From::new("Bob <sips:bob@biloxi.example.com>;tag=ja743ks76zlflH").into(),
            CallId::new("1j9FpLxk3uxtm8tn@biloxi.example.com").into(),
        ]
        .into(),
        body: Default::default(),
    };
    let key = TransactionKey::from_response(&register_resp)?;
    assert_eq!(
        key,
        TransactionKey::RFC3261(Rfc3261 {
            role: TransactionRole::Client,
            branch: "z9hG4bKnashd92".to_string(),
            method: Method::Register,
            cseq: 2,
            from_tag: Tag::new("ja743ks76zlflH"),
            call_id: "1j9FpLxk3uxtm8tn@biloxi.example.com".to_string(),
        })
    );

    // ACK folds into the INVITE signature
    let mut ack_req = register_req.clone();
    ack_req.method = Method::Ack;
    ack_req.headers.unique_push(CSeq::new("2 ACK").into());

    let key = TransactionKey::from_request(&ack_req, TransactionRole::Server)?;
    assert_eq!(
        key,
        TransactionKey::RFC3261(Rfc3261 {
            role: TransactionRole::Server,
            branch: "z9hG4bKnashd92".to_string(),
            method: Method::Invite,
            cseq: 2,
            from_tag: Tag::new("ja743ks76zlflH"),
            call_id: "1j9FpLxk3uxtm8tn@biloxi.example.com".to_string(),
        })
    );

    assert_eq!(
        key.with_method(Method::Cancel),
        TransactionKey::RFC3261(Rfc3261 {
            role: TransactionRole::Server,
            branch: "z9hG4bKnashd92".to_string(),
            method: Method::Cancel,
            cseq: 2,
            from_tag: Tag::new("ja743ks76zlflH"),
            call_id: "1j9FpLxk3uxtm8tn@biloxi.example.com".to_string(),
        })
    );
    Ok(())
}
