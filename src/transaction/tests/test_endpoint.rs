use super::create_test_endpoint;
use crate::Result;
use rsip::headers::UntypedHeader;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::Method;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_incoming_transactions_has_one_consumer() -> Result<()> {
    let endpoint = create_test_endpoint(None).await?;
    let _incoming = endpoint.incoming_transactions()?;
    assert!(endpoint.incoming_transactions().is_err());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_serve() -> Result<()> {
    let endpoint = create_test_endpoint(Some("127.0.0.1:0")).await?;
    let serve = tokio::spawn(endpoint.inner.clone().serve());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!serve.is_finished());

    endpoint.shutdown();
    let joined = timeout(Duration::from_secs(1), serve).await;
    assert!(matches!(joined, Ok(Ok(Ok(())))));
    Ok(())
}

#[tokio::test]
async fn test_get_addrs_reports_listens() -> Result<()> {
    let endpoint = create_test_endpoint(Some("127.0.0.1:0")).await?;
    let addrs = endpoint.get_addrs();
    assert_eq!(addrs.len(), 1);
    assert_eq!(addrs[0].r#type, Some(rsip::transport::Transport::Udp));

    let no_transport = create_test_endpoint(None).await?;
    assert!(no_transport.get_addrs().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_make_request_carries_endpoint_identity() -> Result<()> {
    let endpoint = create_test_endpoint(Some("127.0.0.1:0")).await?;

    let recipient = rsip::Uri::try_from("sip:bob@sipline.dev")?;
    let via = endpoint.inner.get_via(None, None)?;
    let from = rsip::typed::From {
        display_name: None,
        uri: rsip::Uri::try_from("sip:alice@sipline.dev")?,
        params: vec![rsip::Param::Tag(crate::transaction::make_tag())],
    };
    let to = rsip::typed::To {
        display_name: None,
        uri: recipient.clone(),
        params: vec![],
    };
    let request = endpoint
        .inner
        .make_request(Method::Register, recipient, via, from, to, 2, None);

    let cseq = request.cseq_header()?.typed()?;
    assert_eq!(cseq.seq, 2);
    assert_eq!(cseq.method, Method::Register);
    // generated Call-ID, no suffix configured
    assert_eq!(request.call_id_header()?.value().len(), 22);
    assert!(request
        .via_header()?
        .value()
        .contains("branch=z9hG4bK"));

    let printed = request.to_string();
    assert!(printed.contains("User-Agent: sipline-test"));
    assert!(printed.contains("Max-Forwards: 70"));
    Ok(())
}

#[tokio::test]
async fn test_make_response_echoes_request_identity() -> Result<()> {
    let endpoint = create_test_endpoint(None).await?;

    let request = rsip::Request {
        method: Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@sipline.dev")?,
        headers: vec![
            rsip::headers::Via::new("SIP/2.0/UDP 10.0.0.7:5060;branch=z9hG4bK74bf9").into(),
            rsip::headers::CSeq::new("1 INVITE").into(),
            rsip::headers::From::new("<sip:alice@sipline.dev>;tag=88ad1c2f").into(),
            rsip::headers::To::new("<sip:bob@sipline.dev>").into(),
            rsip::headers::CallId::new("f3a62090cc1@ua1.sipline.dev").into(),
            rsip::headers::RecordRoute::new("<sip:p1.sipline.dev;lr>").into(),
            rsip::headers::Contact::new("<sip:alice@10.0.0.7:5060>").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    };

    let resp = endpoint
        .inner
        .make_response(&request, rsip::StatusCode::Ringing, None);
    assert_eq!(resp.status_code, rsip::StatusCode::Ringing);
    assert_eq!(
        resp.via_header()?.value(),
        "SIP/2.0/UDP 10.0.0.7:5060;branch=z9hG4bK74bf9"
    );
    assert_eq!(
        resp.call_id_header()?.value(),
        "f3a62090cc1@ua1.sipline.dev"
    );
    // dialog identity is the transaction user's business; no local tag
    // is invented here
    assert_eq!(resp.to_header()?.value(), "<sip:bob@sipline.dev>");

    let printed = resp.to_string();
    // record routes survive so a dialog can be built from the response
    assert!(printed.contains("Record-Route: <sip:p1.sipline.dev;lr>"));
    assert!(printed.contains("Content-Length: 0"));
    // the request contact is not echoed
    assert!(!printed.contains("Contact:"));
    Ok(())
}

/// The ACK for a 2xx carries the session answer when one is supplied
/// (delayed offer/answer), borrowing the Content-Type of the 2xx; with
/// no answer it stays bodyless and untyped.
#[tokio::test]
async fn test_make_ack_body_and_content_type() -> Result<()> {
    let endpoint = create_test_endpoint(None).await?;

    let ok_resp = rsip::Response {
        status_code: rsip::StatusCode::OK,
        version: rsip::Version::V2,
        headers: vec![
            rsip::headers::Via::new("SIP/2.0/UDP 10.0.0.7:5060;branch=z9hG4bK74bf9").into(),
            rsip::headers::CSeq::new("3 INVITE").into(),
            rsip::headers::From::new("<sip:alice@sipline.dev>;tag=88ad1c2f").into(),
            rsip::headers::To::new("<sip:bob@sipline.dev>;tag=b0b1").into(),
            rsip::headers::CallId::new("f3a62090cc1@ua1.sipline.dev").into(),
            rsip::headers::Contact::new("<sip:bob@192.0.2.40:5080>").into(),
            rsip::headers::ContentType::new("application/sdp").into(),
        ]
        .into(),
        body: b"v=0\r\no=uas 1 1 IN IP4 192.0.2.40\r\n".to_vec(),
    };

    let answer = b"v=0\r\no=uac 2 2 IN IP4 10.0.0.7\r\n".to_vec();
    let ack = endpoint
        .inner
        .make_ack(&ok_resp, None, None, Some(answer.clone()))?;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.body, answer);
    let cseq = ack.cseq_header()?.typed()?;
    assert_eq!(cseq.method, Method::Ack);
    assert_eq!(cseq.seq, 3);
    let printed = ack.to_string();
    assert!(printed.contains("Content-Type: application/sdp"));
    assert!(printed.contains(&format!("Content-Length: {}", answer.len())));

    let empty_ack = endpoint.inner.make_ack(&ok_resp, None, None, None)?;
    assert!(empty_ack.body.is_empty());
    let printed = empty_ack.to_string();
    assert!(!printed.contains("Content-Type"));
    assert!(printed.contains("Content-Length: 0"));
    Ok(())
}
