use super::{endpoint::Endpoint, EndpointBuilder};
use crate::{
    transport::{udp::UdpConnection, TransportLayer},
    Result,
};
use tokio_util::sync::CancellationToken;

mod test_endpoint;
mod test_reliable;

pub(super) async fn create_test_endpoint(addr: Option<&str>) -> Result<Endpoint> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());

    if let Some(addr) = addr {
        let socket = UdpConnection::create_connection(addr.parse()?, None, None).await?;
        transport_layer.add_transport(socket.into());
    }

    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipline-test")
        .with_cancel_token(token)
        .with_transport_layer(transport_layer)
        .build();
    Ok(endpoint)
}

#[test]
fn test_random_identifiers() {
    use crate::transaction::{make_call_id, make_tag, make_via_branch, random_text};

    assert_eq!(random_text(16).len(), 16);
    assert_ne!(random_text(16), random_text(16));

    // ;branch=z9hG4bK plus the random part
    let branch = make_via_branch().to_string();
    assert_eq!(branch.len(), 27);
    assert!(branch.starts_with(";branch=z9hG4bK"));

    assert_eq!(make_tag().to_string().len(), 8);

    let call_id = make_call_id(None).to_string();
    assert!(!call_id.contains('@'));
    let call_id = make_call_id(Some("sip.example.com")).to_string();
    assert!(call_id.ends_with("@sip.example.com"));
}

#[test]
fn test_tolerant_contact_parsing() {
    use crate::rsip_ext::extract_uri_from_contact;

    let line = "<sip:carol@localhost;transport=udp>;expires=600;+org.linphone.specs=\"lime\"";
    let uri = extract_uri_from_contact(line).expect("contact with feature params");
    assert_eq!(uri.to_string(), "sip:carol@localhost;transport=UDP");

    let line = "\"Carol\" <sip:carol@10.0.0.7:5062;transport=udp>;+sip.instance=\"<urn:uuid:0ac36078-21a2-4a53-aa42-0d20d9a4a65b>\"";
    let uri = extract_uri_from_contact(line).expect("contact with display name");
    assert_eq!(uri.to_string(), "sip:carol@10.0.0.7:5062;transport=UDP");
}
