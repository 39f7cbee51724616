use super::{create_invite_request, create_test_endpoint};
use crate::transport::{channel::ChannelConnection, SipAddr, SipConnection};
use crate::{
    dialog::{
        dialog::{DialogInner, DialogState, TerminatedReason},
        server_dialog::ServerInviteDialog,
        DialogId,
    },
    transaction::{
        key::{TransactionKey, TransactionRole},
        reliable::ReliableProvisionalResponder,
        transaction::{Transaction, TransactionEvent},
    },
};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Param};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;

#[tokio::test]
async fn test_dialog_make_request() -> crate::Result<()> {
    let dialog_id = DialogId {
        call_id: "test-call-id-123".to_string(),
        local_tag: "bob-tag-456".to_string(),
        remote_tag: "alice-tag-789".to_string(),
    };

    let endpoint = create_test_endpoint().await?;
    let (tu_sender, _tu_receiver) = unbounded_channel();
    let (state_sender, _state_receiver) = unbounded_channel();
    let invite_req = create_invite_request("alice-tag-789", "", "test-call-id-123");
    let dialog_inner = DialogInner::new(
        TransactionRole::Server,
        dialog_id.clone(),
        invite_req.clone(),
        endpoint.inner.clone(),
        state_sender,
        Some(rsip::Uri::try_from("sip:bob@bob.example.com:5060")?),
        tu_sender,
    )
    .expect("Failed to create dialog inner");

    // ACK and CANCEL style requests reuse the INVITE's Via but must get
    // a fresh branch while keeping the received parameter.
    let bye = dialog_inner
        .make_request_with_vias(
            rsip::Method::Bye,
            None,
            dialog_inner
                .build_vias_from_request()
                .expect("Failed to build vias"),
            None,
            None,
        )
        .expect("Failed to make request");
    assert_eq!(bye.method, rsip::Method::Bye);

    assert_eq!(
        bye.via_header()
            .expect("not via header")
            .typed()?
            .received()?,
        "172.0.0.1".parse().ok()
    );
    assert!(
        bye.via_header().expect("not via header").typed()?.branch()
            != invite_req
                .via_header()
                .expect("not via header")
                .typed()?
                .branch()
    );
    Ok(())
}

#[tokio::test]
async fn test_uas_route_set_keeps_record_route_order() -> crate::Result<()> {
    let dialog_id = DialogId {
        call_id: "uas-route-call".to_string(),
        local_tag: "bob-tag".to_string(),
        remote_tag: "alice-tag".to_string(),
    };

    let endpoint = create_test_endpoint().await?;
    let (tu_sender, _tu_receiver) = unbounded_channel();
    let (state_sender, _state_receiver) = unbounded_channel();

    let mut invite_req = create_invite_request("alice-tag", "", "uas-route-call");
    // Record-Routes as received, topmost proxy is the one next to us.
    invite_req.headers.push(Header::RecordRoute(
        rsip::headers::RecordRoute::new("<sip:near.example.net:5070;transport=udp;lr>"),
    ));
    invite_req.headers.push(Header::RecordRoute(
        rsip::headers::RecordRoute::new("<sip:far.example.net:5080;transport=udp;lr>"),
    ));

    let dialog_inner = DialogInner::new(
        TransactionRole::Server,
        dialog_id,
        invite_req,
        endpoint.inner.clone(),
        state_sender,
        Some(rsip::Uri::try_from("sip:bob@bob.example.com:5060")?),
        tu_sender,
    )?;

    let routes: Vec<String> = dialog_inner
        .route_set
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.value().to_string())
        .collect();
    assert_eq!(
        routes,
        vec![
            "<sip:near.example.net:5070;transport=udp;lr>".to_string(),
            "<sip:far.example.net:5080;transport=udp;lr>".to_string(),
        ],
        "UAS route set keeps the request's Record-Route order (RFC 3261 12.1.1)",
    );
    Ok(())
}

#[tokio::test]
async fn test_accept_sends_ok_with_to_tag_and_contact() -> crate::Result<()> {
    let dialog_id = DialogId {
        call_id: "accept-call".to_string(),
        local_tag: "bob-tag-1".to_string(),
        remote_tag: "alice-tag-1".to_string(),
    };

    let endpoint = create_test_endpoint().await?;
    let (tu_sender, mut tu_receiver) = unbounded_channel();
    let (state_sender, _state_receiver) = unbounded_channel();

    let invite_req = create_invite_request("alice-tag-1", "", "accept-call");
    let dialog_inner = DialogInner::new(
        TransactionRole::Server,
        dialog_id,
        invite_req,
        endpoint.inner.clone(),
        state_sender,
        Some(rsip::Uri::try_from("sip:bob@192.0.2.9:5060")?),
        tu_sender,
    )?;

    let server_dialog = ServerInviteDialog {
        inner: Arc::new(dialog_inner),
    };

    server_dialog.accept(None, Some(b"v=0\r\n".to_vec()))?;

    let event = tu_receiver
        .recv()
        .await
        .expect("Should receive transaction event");
    match event {
        TransactionEvent::Respond(response) => {
            assert_eq!(response.status_code, rsip::StatusCode::OK);
            let to = response.to_header()?.typed()?;
            assert!(
                to.params
                    .iter()
                    .any(|p| matches!(p, Param::Tag(tag) if tag.value() == "bob-tag-1")),
                "2xx must carry the dialog's local tag in To"
            );
            let contact = response
                .contact_header()
                .expect("Response should have Contact header")
                .typed()
                .expect("Contact header should be parseable");
            assert_eq!(contact.uri.host_with_port.to_string(), "192.0.2.9:5060");
            assert_eq!(response.body, b"v=0\r\n".to_vec());
        }
        _other => panic!("Expected TransactionEvent::Respond, got different event type"),
    }

    assert!(server_dialog.inner.waiting_ack());
    Ok(())
}

#[tokio::test]
async fn test_reject_sends_decline_and_terminates() -> crate::Result<()> {
    let dialog_id = DialogId {
        call_id: "reject-call".to_string(),
        local_tag: "bob-tag-2".to_string(),
        remote_tag: "alice-tag-2".to_string(),
    };

    let endpoint = create_test_endpoint().await?;
    let (tu_sender, mut tu_receiver) = unbounded_channel();
    let (state_sender, mut state_receiver) = unbounded_channel();

    let invite_req = create_invite_request("alice-tag-2", "", "reject-call");
    let dialog_inner = DialogInner::new(
        TransactionRole::Server,
        dialog_id,
        invite_req,
        endpoint.inner.clone(),
        state_sender,
        None,
        tu_sender,
    )?;

    let server_dialog = ServerInviteDialog {
        inner: Arc::new(dialog_inner),
    };

    server_dialog.reject(None, Some("User busy elsewhere".to_string()));

    let event = tu_receiver
        .recv()
        .await
        .expect("Should receive transaction event");
    match event {
        TransactionEvent::Respond(response) => {
            assert_eq!(response.status_code, rsip::StatusCode::Decline);
            let has_reason = response.headers.iter().any(|h| {
                matches!(h, Header::Other(name, value)
                    if name.eq_ignore_ascii_case("Reason") && value == "User busy elsewhere")
            });
            assert!(has_reason, "Reason text must be carried in the response");
        }
        _other => panic!("Expected TransactionEvent::Respond, got different event type"),
    }

    assert!(server_dialog.inner.is_terminated());
    let mut saw_decline = false;
    while let Ok(state) = state_receiver.try_recv() {
        if matches!(
            state,
            DialogState::Terminated(_, TerminatedReason::UasDecline)
        ) {
            saw_decline = true;
        }
    }
    assert!(saw_decline, "state stream must report the decline");

    // A second reject is a no-op once terminated.
    server_dialog.reject(Some(rsip::StatusCode::BusyHere), None);
    assert!(tu_receiver.try_recv().is_err());
    Ok(())
}

/// The UAS side drops in-dialog requests whose CSeq is at or below the
/// highest already seen, without answering them (RFC 3261 12.2.2).
#[tokio::test]
async fn test_uas_discards_stale_cseq_without_reply() -> crate::Result<()> {
    let dialog_id = DialogId {
        call_id: "uas-stale-call".to_string(),
        local_tag: "bob-tag-4".to_string(),
        remote_tag: "alice-tag-4".to_string(),
    };

    let endpoint = create_test_endpoint().await?;
    let (tu_sender, _tu_receiver) = unbounded_channel();
    let (state_sender, _state_receiver) = unbounded_channel();

    let invite_req = create_invite_request("alice-tag-4", "", "uas-stale-call");
    let dialog_inner = DialogInner::new(
        TransactionRole::Server,
        dialog_id.clone(),
        invite_req,
        endpoint.inner.clone(),
        state_sender,
        Some(rsip::Uri::try_from("sip:bob@bob.example.com:5060")?),
        tu_sender,
    )?;

    let mut server_dialog = ServerInviteDialog {
        inner: Arc::new(dialog_inner),
    };
    server_dialog.inner.transition(DialogState::Confirmed(
        dialog_id,
        rsip::Response::default(),
    ))?;
    server_dialog.inner.remote_seq.store(5, Ordering::Relaxed);

    let (_to_dialog, transport_incoming) = unbounded_channel();
    let (transport_outgoing, mut from_dialog) = unbounded_channel();
    let addr = SipAddr::new(
        rsip::transport::Transport::Udp,
        rsip::HostWithPort::try_from("127.0.0.1:5071")?,
    );
    let connection: SipConnection = ChannelConnection::create_connection(
        transport_incoming,
        transport_outgoing,
        addr,
        None,
    )
    .await?
    .into();

    let in_dialog_bye = |cseq: u32| rsip::Request {
        method: rsip::Method::Bye,
        uri: rsip::Uri::try_from("sip:bob@bob.example.com:5060").unwrap(),
        headers: vec![
            rsip::headers::Via::new(format!(
                "SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKuas{}",
                cseq
            ))
            .into(),
            rsip::headers::CSeq::new(format!("{} BYE", cseq)).into(),
            rsip::headers::From::new("Alice <sip:alice@example.com>;tag=alice-tag-4").into(),
            rsip::headers::To::new("Bob <sip:bob@example.com>;tag=bob-tag-4").into(),
            rsip::headers::CallId::new("uas-stale-call").into(),
            rsip::headers::MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    };

    for stale_cseq in [4u32, 5] {
        let bye = in_dialog_bye(stale_cseq);
        let key = TransactionKey::from_request(&bye, TransactionRole::Server)?;
        let mut tx =
            Transaction::new_server(key, bye, endpoint.inner.clone(), Some(connection.clone()));
        server_dialog.handle(&mut tx).await?;
        assert!(
            tx.last_response.is_none(),
            "stale CSeq {} must not be answered",
            stale_cseq
        );
        assert!(from_dialog.try_recv().is_err());
        assert!(
            !server_dialog.inner.is_terminated(),
            "a stale BYE must not tear the dialog down"
        );
    }
    assert_eq!(server_dialog.inner.remote_seq.load(Ordering::Relaxed), 5);

    // the genuinely next request is served
    let bye = in_dialog_bye(6);
    let key = TransactionKey::from_request(&bye, TransactionRole::Server)?;
    let mut tx = Transaction::new_server(key, bye, endpoint.inner.clone(), Some(connection));
    server_dialog.handle(&mut tx).await?;
    assert_eq!(
        tx.last_response.clone().map(|r| r.status_code),
        Some(rsip::StatusCode::OK)
    );
    assert!(server_dialog.inner.is_terminated());
    Ok(())
}

#[tokio::test]
async fn test_ringing_reliable_carries_rseq() -> crate::Result<()> {
    let dialog_id = DialogId {
        call_id: "prack-call".to_string(),
        local_tag: "bob-tag-3".to_string(),
        remote_tag: "alice-tag-3".to_string(),
    };

    let endpoint = create_test_endpoint().await?;
    let (tu_sender, mut tu_receiver) = unbounded_channel();
    let (state_sender, _state_receiver) = unbounded_channel();

    let mut invite_req = create_invite_request("alice-tag-3", "", "prack-call");
    invite_req
        .headers
        .push(Header::Supported(rsip::headers::Supported::new("100rel")));

    let dialog_inner = DialogInner::new(
        TransactionRole::Server,
        dialog_id,
        invite_req,
        endpoint.inner.clone(),
        state_sender,
        Some(rsip::Uri::try_from("sip:bob@bob.example.com:5060")?),
        tu_sender,
    )?;

    let server_dialog = ServerInviteDialog {
        inner: Arc::new(dialog_inner),
    };
    let responder = ReliableProvisionalResponder::new(endpoint.inner.clone());
    *server_dialog.inner.local_reliable.lock().unwrap() = Some(responder);

    server_dialog.ringing(None, None)?;

    let event = tu_receiver
        .recv()
        .await
        .expect("Should receive transaction event");
    match event {
        TransactionEvent::Respond(response) => {
            assert_eq!(response.status_code, rsip::StatusCode::Ringing);
            let rseq = response.headers.iter().find_map(|h| match h {
                Header::Other(name, value) if name.eq_ignore_ascii_case("RSeq") => {
                    value.parse::<u32>().ok()
                }
                _ => None,
            });
            let rseq = rseq.expect("reliable provisional must carry RSeq");
            assert!(rseq >= 1, "initial RSeq is at least 1");
            let requires_100rel = response.headers.iter().any(|h| {
                matches!(h, Header::Require(r) if r.value().contains("100rel"))
            });
            assert!(requires_100rel, "reliable provisional must require 100rel");
        }
        _other => panic!("Expected TransactionEvent::Respond, got different event type"),
    }

    let state = server_dialog.inner.state.lock().unwrap().clone();
    assert!(matches!(state, DialogState::Early(_, _)));
    Ok(())
}
