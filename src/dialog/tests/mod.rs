use crate::transport::TransportLayer;
use crate::EndpointBuilder;
use rsip::headers::*;
use rsip::{Request, Uri};
use tokio_util::sync::CancellationToken;

mod test_server_dialog;

pub(super) async fn create_test_endpoint() -> crate::Result<crate::transaction::endpoint::Endpoint>
{
    let token = CancellationToken::new();
    let tl = TransportLayer::new(token.child_token());
    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipline-test")
        .with_transport_layer(tl)
        .build();
    Ok(endpoint)
}

pub(super) fn create_invite_request(from_tag: &str, to_tag: &str, call_id: &str) -> Request {
    let to = if to_tag.is_empty() {
        To::new("Bob <sip:bob@example.com>")
    } else {
        To::new(format!("Bob <sip:bob@example.com>;tag={}", to_tag))
    };
    Request {
        method: rsip::Method::Invite,
        uri: Uri::try_from("sip:bob@example.com:5060").unwrap(),
        headers: vec![
            Via::new("SIP/2.0/UDP alice.example.com:5060;received=172.0.0.1;branch=z9hG4bKnashds")
                .into(),
            CSeq::new("1 INVITE").into(),
            From::new(format!("Alice <sip:alice@example.com>;tag={}", from_tag)).into(),
            to.into(),
            CallId::new(call_id).into(),
            Contact::new("<sip:alice@alice.example.com:5060>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: b"v=0\r\no=alice 2890844526 2890844527 IN IP4 host.atlanta.com\r\n".to_vec(),
    }
}
