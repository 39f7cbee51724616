use super::create_test_endpoint;
use crate::rsip_ext::parse_rseq_header;
use crate::transaction::{
    endpoint::{EndpointBuilder, EndpointOption},
    key::{TransactionKey, TransactionRole},
    reliable::ReliableProvisionalResponder,
    transaction::Transaction,
    TransactionState,
};
use crate::transport::{channel::ChannelConnection, SipAddr, SipConnection, TransportEvent};
use crate::transport::TransportLayer;
use crate::{Error, Result};
use rsip::{headers::*, Header, Method, SipMessage, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn invite_request() -> rsip::Request {
    rsip::Request {
        method: Method::Invite,
        uri: rsip::Uri::try_from("sip:dave@sipline.dev").unwrap(),
        headers: vec![
            Via::new("SIP/2.0/UDP 127.0.0.1:2026;branch=z9hG4bK101rel").into(),
            CSeq::new("1 INVITE").into(),
            From::new("Carol <sip:carol@sipline.dev>;tag=9fxced76sl").into(),
            To::new("Dave <sip:dave@sipline.dev>").into(),
            CallId::new("101rel-test@127.0.0.1").into(),
            MaxForwards::new("70").into(),
            Supported::new("100rel").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

fn prack_request(branch: &str, cseq: u32, rack: Option<String>) -> rsip::Request {
    let mut headers: Vec<Header> = vec![
        Via::new(format!("SIP/2.0/UDP 127.0.0.1:2026;branch={}", branch)).into(),
        CSeq::new(format!("{} PRACK", cseq)).into(),
        From::new("Carol <sip:carol@sipline.dev>;tag=9fxced76sl").into(),
        To::new("Dave <sip:dave@sipline.dev>;tag=314159").into(),
        CallId::new("101rel-test@127.0.0.1").into(),
        MaxForwards::new("70").into(),
    ];
    if let Some(rack) = rack {
        headers.push(Header::Other("RAck".to_string(), rack));
    }
    rsip::Request {
        method: Method::PRack,
        uri: rsip::Uri::try_from("sip:dave@sipline.dev").unwrap(),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

async fn sent_response(rx: &mut UnboundedReceiver<TransportEvent>) -> Result<rsip::Response> {
    let event = timeout(Duration::from_secs(1), rx.recv())
        .await
        .map_err(|_| Error::Error("timeout waiting for response".to_string()))?
        .ok_or_else(|| Error::Error("transport closed".to_string()))?;
    match event {
        TransportEvent::Incoming(SipMessage::Response(resp), _, _) => Ok(resp),
        other => Err(Error::Error(format!("expected response, got {:?}", other))),
    }
}

fn requires_100rel(resp: &rsip::Response) -> bool {
    resp.headers.iter().any(|h| match h {
        Header::Require(r) => r.to_string().contains("100rel"),
        _ => false,
    })
}

#[tokio::test]
async fn test_reliable_provisionals_are_serialized() -> Result<()> {
    let endpoint = create_test_endpoint(None).await?;

    let (_to_uas, transport_incoming) = unbounded_channel();
    let (transport_outgoing, mut from_uas) = unbounded_channel();
    let addr = SipAddr::new(
        rsip::transport::Transport::Udp,
        rsip::HostWithPort::try_from("127.0.0.1:2025")?,
    );
    let connection: SipConnection =
        ChannelConnection::create_connection(transport_incoming, transport_outgoing, addr, None)
            .await?
            .into();

    let invite = invite_request();
    let invite_key = TransactionKey::from_request(&invite, TransactionRole::Server)?;
    let mut invite_tx = Transaction::new_server(
        invite_key,
        invite.clone(),
        endpoint.inner.clone(),
        Some(connection.clone()),
    );

    let responder = ReliableProvisionalResponder::new(endpoint.inner.clone());

    // 100 Trying can never be reliable
    let trying = endpoint
        .inner
        .make_response(&invite, StatusCode::Trying, None);
    assert!(responder.respond(&mut invite_tx, trying).await.is_err());

    let progress = endpoint
        .inner
        .make_response(&invite, StatusCode::SessionProgress, None);
    let first_rseq = responder.respond(&mut invite_tx, progress).await?;
    assert_eq!(invite_tx.state, TransactionState::Proceeding);

    let sent = sent_response(&mut from_uas).await?;
    assert_eq!(sent.status_code, StatusCode::SessionProgress);
    assert_eq!(parse_rseq_header(&sent.headers), Some(first_rseq));
    assert!(requires_100rel(&sent));

    // The second reliable provisional queues behind the unacknowledged
    // first one.
    let ringing = endpoint
        .inner
        .make_response(&invite, StatusCode::Ringing, None);
    let second_rseq = responder.respond(&mut invite_tx, ringing).await?;
    assert_eq!(second_rseq, first_rseq + 1);
    assert!(responder.has_pending());
    assert!(from_uas.try_recv().is_err(), "180 must wait for the PRACK");

    // PRACK with the wrong RSeq leaves the queue alone.
    let bad_prack = prack_request(
        "z9hG4bKprack1",
        2,
        Some(format!("{} 1 INVITE", first_rseq.wrapping_add(7))),
    );
    let bad_key = TransactionKey::from_request(&bad_prack, TransactionRole::Server)?;
    let mut bad_tx = Transaction::new_server(
        bad_key,
        bad_prack,
        endpoint.inner.clone(),
        Some(connection.clone()),
    );
    let confirmed = responder.process_prack(&mut bad_tx).await?;
    assert!(confirmed.is_none());
    let rejected = sent_response(&mut from_uas).await?;
    assert_eq!(
        rejected.status_code,
        StatusCode::CallTransactionDoesNotExist
    );
    assert!(responder.has_pending());

    // The matching PRACK confirms the 183 and releases the queued 180.
    let prack = prack_request(
        "z9hG4bKprack2",
        3,
        Some(format!("{} 1 INVITE", first_rseq)),
    );
    let prack_key = TransactionKey::from_request(&prack, TransactionRole::Server)?;
    let mut prack_tx = Transaction::new_server(
        prack_key,
        prack,
        endpoint.inner.clone(),
        Some(connection.clone()),
    );
    let confirmed = responder
        .process_prack(&mut prack_tx)
        .await?
        .expect("183 should be confirmed");
    assert_eq!(confirmed.status_code, StatusCode::SessionProgress);

    let prack_ok = sent_response(&mut from_uas).await?;
    assert_eq!(prack_ok.status_code, StatusCode::OK);
    assert!(prack_ok.to_string().contains("3 PRACK"));

    let released = sent_response(&mut from_uas).await?;
    assert_eq!(released.status_code, StatusCode::Ringing);
    assert_eq!(parse_rseq_header(&released.headers), Some(second_rseq));

    // PRACK without RAck is malformed.
    let naked_prack = prack_request("z9hG4bKprack3", 4, None);
    let naked_key = TransactionKey::from_request(&naked_prack, TransactionRole::Server)?;
    let mut naked_tx = Transaction::new_server(
        naked_key,
        naked_prack,
        endpoint.inner.clone(),
        Some(connection),
    );
    let confirmed = responder.process_prack(&mut naked_tx).await?;
    assert!(confirmed.is_none());
    let malformed = sent_response(&mut from_uas).await?;
    assert_eq!(malformed.status_code, StatusCode::BadRequest);

    responder.stop();
    assert!(!responder.has_pending());
    Ok(())
}

/// A reliable provisional that is never PRACKed is given up on after
/// 64*T1, and the owner hears about it on the timeout channel so it can
/// decide what a missed PRACK means for the call.
#[tokio::test]
async fn test_unconfirmed_provisional_times_out_to_owner() -> Result<()> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipline-test")
        .with_cancel_token(token)
        .with_transport_layer(transport_layer)
        .with_option(EndpointOption {
            t1: Duration::from_millis(10),
            t1x64: Duration::from_millis(60),
            ..Default::default()
        })
        .build();

    let (_to_uas, transport_incoming) = unbounded_channel();
    let (transport_outgoing, mut from_uas) = unbounded_channel();
    let addr = SipAddr::new(
        rsip::transport::Transport::Udp,
        rsip::HostWithPort::try_from("127.0.0.1:2027")?,
    );
    let connection: SipConnection =
        ChannelConnection::create_connection(transport_incoming, transport_outgoing, addr, None)
            .await?
            .into();

    let invite = invite_request();
    let invite_key = TransactionKey::from_request(&invite, TransactionRole::Server)?;
    let mut invite_tx = Transaction::new_server(
        invite_key,
        invite.clone(),
        endpoint.inner.clone(),
        Some(connection),
    );

    let responder = ReliableProvisionalResponder::new(endpoint.inner.clone());
    let mut timeouts = responder
        .take_timeouts()
        .expect("first take yields the receiver");
    assert!(
        responder.take_timeouts().is_none(),
        "the receiver is handed out once"
    );

    let ringing = endpoint
        .inner
        .make_response(&invite, StatusCode::Ringing, None);
    responder.respond(&mut invite_tx, ringing).await?;
    let sent = sent_response(&mut from_uas).await?;
    assert_eq!(sent.status_code, StatusCode::Ringing);

    let timed_out = timeout(Duration::from_secs(2), timeouts.recv())
        .await
        .map_err(|_| Error::Error("timeout channel stayed quiet".to_string()))?
        .ok_or_else(|| Error::Error("timeout channel closed".to_string()))?;
    assert_eq!(timed_out.status_code, StatusCode::Ringing);
    assert!(!responder.has_pending());
    Ok(())
}
