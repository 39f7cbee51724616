//! End-to-end call flows over real UDP sockets: two user agents talking
//! directly, and through a proxy with a registrar in between.

use rsip::prelude::{HeadersExt, UntypedHeader};
use sipline::{
    dialog::{
        dialog::{DialogState, DialogStateReceiver, TerminatedReason},
        dialog_layer::DialogLayer,
        invitation::{AnswerFn, InviteOption, OfferPlacement},
        registration::Registration,
    },
    proxy::{MemoryLocator, ProxyOption, ProxyServer},
    transaction::endpoint::Endpoint,
    transport::{udp::UdpConnection, TransportLayer},
    EndpointBuilder,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Endpoint bound to a fresh localhost UDP port, already serving.
async fn create_ua(name: &str) -> sipline::Result<(Endpoint, u16)> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let udp = UdpConnection::create_connection(
        "127.0.0.1:0".parse()?,
        None,
        Some(token.child_token()),
    )
    .await?;
    let port = udp.get_addr().addr.port.map(u16::from).unwrap_or(0);
    transport_layer.add_transport(udp.into());

    let endpoint = EndpointBuilder::new()
        .with_user_agent(name)
        .with_cancel_token(token)
        .with_transport_layer(transport_layer)
        .build();
    endpoint.inner.transport_layer.serve_listens().await?;
    let inner = endpoint.inner.clone();
    tokio::spawn(async move {
        inner.serve().await.ok();
    });
    Ok((endpoint, port))
}

/// Answer every INVITE on `endpoint` the same way: accept when `busy` is
/// false, 486 otherwise. In-dialog requests are routed to their dialog.
fn spawn_uas(
    endpoint: &Endpoint,
    port: u16,
    busy: bool,
) -> sipline::Result<DialogStateReceiver> {
    let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    let mut incoming = endpoint.incoming_transactions()?;
    let (state_sender, state_receiver) = unbounded_channel();
    let contact = rsip::Uri::try_from(format!("sip:bob@127.0.0.1:{}", port))?;

    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            match tx.original.method {
                rsip::Method::Invite => {
                    let dialog = match dialog_layer.get_or_create_server_invite(
                        &tx,
                        state_sender.clone(),
                        Some(contact.clone()),
                    ) {
                        Ok(dialog) => dialog,
                        Err(_) => continue,
                    };
                    tokio::spawn(async move {
                        let mut dialog = dialog;
                        if busy {
                            dialog.reject(Some(rsip::StatusCode::BusyHere), None);
                        } else {
                            dialog.ringing(None, None).ok();
                            dialog.accept(None, Some(b"v=0\r\n".to_vec())).ok();
                        }
                        dialog.handle(&mut tx).await.ok();
                    });
                }
                _ => {
                    if let Some(mut dialog) = dialog_layer.match_dialog(&tx) {
                        tokio::spawn(async move {
                            dialog.handle(&mut tx).await.ok();
                        });
                    }
                }
            }
        }
    });
    Ok(state_receiver)
}

async fn wait_for_state<F>(receiver: &mut DialogStateReceiver, pred: F) -> bool
where
    F: Fn(&DialogState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(state) = receiver.recv().await {
            if pred(&state) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

#[tokio::test]
async fn test_direct_call_accept_and_hangup() -> sipline::Result<()> {
    init_logging();
    let (uas_endpoint, uas_port) = create_ua("sipline-uas").await?;
    let (uac_endpoint, uac_port) = create_ua("sipline-uac").await?;
    let mut uas_states = spawn_uas(&uas_endpoint, uas_port, false)?;

    let uac_dialog_layer = DialogLayer::new(uac_endpoint.inner.clone());
    let (state_sender, _state_receiver) = unbounded_channel();
    let invite_option = InviteOption {
        caller: rsip::Uri::try_from("sip:alice@example.com")?,
        callee: rsip::Uri::try_from(format!("sip:bob@127.0.0.1:{}", uas_port))?,
        contact: rsip::Uri::try_from(format!("sip:alice@127.0.0.1:{}", uac_port))?,
        offer: Some(b"v=0\r\n".to_vec()),
        ..Default::default()
    };

    let (client_dialog, resp) = uac_dialog_layer
        .do_invite(invite_option, state_sender)
        .await?;

    let resp = resp.expect("INVITE must get a final response");
    assert_eq!(resp.status_code, rsip::StatusCode::OK);
    assert_eq!(resp.body, b"v=0\r\n".to_vec());
    assert!(client_dialog.is_confirmed());

    assert!(
        wait_for_state(&mut uas_states, |s| matches!(s, DialogState::Confirmed(_, _))).await,
        "UAS must reach Confirmed after the ACK"
    );

    client_dialog.bye().await?;
    assert!(
        wait_for_state(&mut uas_states, |s| matches!(
            s,
            DialogState::Terminated(_, TerminatedReason::UacBye)
        ))
        .await,
        "UAS must see the BYE"
    );
    Ok(())
}

#[tokio::test]
async fn test_direct_call_busy_here() -> sipline::Result<()> {
    init_logging();
    let (uas_endpoint, uas_port) = create_ua("sipline-uas-busy").await?;
    let (uac_endpoint, uac_port) = create_ua("sipline-uac-busy").await?;
    let _uas_states = spawn_uas(&uas_endpoint, uas_port, true)?;

    let uac_dialog_layer = DialogLayer::new(uac_endpoint.inner.clone());
    let (state_sender, _state_receiver) = unbounded_channel();
    let invite_option = InviteOption {
        caller: rsip::Uri::try_from("sip:alice@example.com")?,
        callee: rsip::Uri::try_from(format!("sip:bob@127.0.0.1:{}", uas_port))?,
        contact: rsip::Uri::try_from(format!("sip:alice@127.0.0.1:{}", uac_port))?,
        ..Default::default()
    };

    let (client_dialog, resp) = uac_dialog_layer
        .do_invite(invite_option, state_sender)
        .await?;

    let resp = resp.expect("INVITE must get a final response");
    assert_eq!(resp.status_code, rsip::StatusCode::BusyHere);
    assert!(!client_dialog.is_confirmed());
    Ok(())
}

/// Delayed offer/answer against a scripted peer: the INVITE leaves
/// without a body, the peer's 200 OK carries the offer, and the answer
/// produced by the application callback rides in the ACK.
#[tokio::test]
async fn test_delayed_offer_answer_in_ack() -> sipline::Result<()> {
    init_logging();
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let uas_port = socket.local_addr()?.port();
    let (uac_endpoint, uac_port) = create_ua("sipline-uac-delayed").await?;

    let offer = b"v=0\r\no=uas 1 1 IN IP4 127.0.0.1\r\n".to_vec();
    let uas_offer = offer.clone();
    let uas = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let (len, from) = socket.recv_from(&mut buf).await?;
        let msg = std::str::from_utf8(&buf[..len]).unwrap();
        let invite: rsip::Request = rsip::SipMessage::try_from(msg)?.try_into()?;
        assert_eq!(invite.method, rsip::Method::Invite);
        assert!(
            invite.body.is_empty(),
            "a delayed-offer INVITE must leave bodyless"
        );

        let ok = rsip::Response {
            status_code: rsip::StatusCode::OK,
            version: rsip::Version::V2,
            headers: vec![
                invite.via_header()?.clone().into(),
                invite.cseq_header()?.clone().into(),
                invite.from_header()?.clone().into(),
                rsip::headers::To::new(format!(
                    "{};tag=uas-delayed",
                    invite.to_header()?.value()
                ))
                .into(),
                invite.call_id_header()?.clone().into(),
                rsip::headers::Contact::new(format!("<sip:bob@127.0.0.1:{}>", uas_port)).into(),
                rsip::headers::ContentType::new("application/sdp").into(),
                rsip::headers::ContentLength::new(uas_offer.len().to_string()).into(),
            ]
            .into(),
            body: uas_offer,
        };
        socket.send_to(ok.to_string().as_bytes(), from).await?;

        // skip INVITE retransmissions until the ACK shows up
        loop {
            let (len, _) = socket.recv_from(&mut buf).await?;
            let msg = std::str::from_utf8(&buf[..len]).unwrap();
            if let rsip::SipMessage::Request(req) = rsip::SipMessage::try_from(msg)? {
                if req.method == rsip::Method::Ack {
                    return Ok::<rsip::Request, sipline::Error>(req);
                }
            }
        }
    });

    let uac_dialog_layer = DialogLayer::new(uac_endpoint.inner.clone());
    let (state_sender, _state_receiver) = unbounded_channel();
    let answer: AnswerFn = Arc::new(|offer: &[u8]| {
        let mut body = b"a=answer-to:".to_vec();
        body.extend_from_slice(offer);
        Some(body)
    });
    let invite_option = InviteOption {
        caller: rsip::Uri::try_from("sip:alice@example.com")?,
        callee: rsip::Uri::try_from(format!("sip:bob@127.0.0.1:{}", uas_port))?,
        contact: rsip::Uri::try_from(format!("sip:alice@127.0.0.1:{}", uac_port))?,
        offer_placement: OfferPlacement::InAccept,
        answer: Some(answer),
        ..Default::default()
    };

    let (client_dialog, resp) = uac_dialog_layer
        .do_invite(invite_option, state_sender)
        .await?;

    let resp = resp.expect("INVITE must get a final response");
    assert_eq!(resp.status_code, rsip::StatusCode::OK);
    assert_eq!(resp.body, offer);
    assert!(client_dialog.is_confirmed());

    let ack = tokio::time::timeout(Duration::from_secs(3), uas)
        .await
        .expect("peer must see the ACK in time")
        .expect("peer task must not panic")?;
    let mut expected = b"a=answer-to:".to_vec();
    expected.extend_from_slice(&offer);
    assert_eq!(ack.body, expected);
    let printed = ack.to_string();
    assert!(printed.contains("Content-Type: application/sdp"));
    assert!(printed.contains(&format!("Content-Length: {}", expected.len())));
    Ok(())
}

/// Full proxied flow: the callee REGISTERs with the proxy, the caller
/// INVITEs the callee's address-of-record at the proxy, the proxy fans
/// out to the registered contact and stays on the path via Record-Route.
#[tokio::test]
async fn test_proxied_call_with_registration() -> sipline::Result<()> {
    init_logging();

    // proxy with registrar
    let proxy_token = CancellationToken::new();
    let proxy_transport = TransportLayer::new(proxy_token.child_token());
    let proxy_udp = UdpConnection::create_connection(
        "127.0.0.1:0".parse()?,
        None,
        Some(proxy_token.child_token()),
    )
    .await?;
    let proxy_port = proxy_udp.get_addr().addr.port.map(u16::from).unwrap_or(0);
    proxy_transport.add_transport(proxy_udp.into());

    let proxy = ProxyServer::new(
        proxy_transport,
        Arc::new(MemoryLocator::new()),
        ProxyOption {
            user_agent: "sipline-proxy-test".to_string(),
            ..Default::default()
        },
        proxy_token.clone(),
    );
    tokio::spawn(async move {
        proxy.serve().await.ok();
    });

    let (uas_endpoint, uas_port) = create_ua("sipline-uas-reg").await?;
    let (uac_endpoint, uac_port) = create_ua("sipline-uac-reg").await?;
    let mut uas_states = spawn_uas(&uas_endpoint, uas_port, false)?;

    // callee registers; the short lifetime is raised to the minimum
    let proxy_uri = rsip::Uri::try_from(format!("sip:127.0.0.1:{}", proxy_port))?;
    let mut registration =
        Registration::new(uas_endpoint.inner.clone(), Some("bob".to_string()));
    let reg_resp = registration.register(proxy_uri, Some(30)).await?;
    assert_eq!(reg_resp.status_code, rsip::StatusCode::OK);
    assert_eq!(registration.expires(), 60);

    // caller invites the address-of-record through the proxy
    let uac_dialog_layer = DialogLayer::new(uac_endpoint.inner.clone());
    let (state_sender, _state_receiver) = unbounded_channel();
    let invite_option = InviteOption {
        caller: rsip::Uri::try_from("sip:alice@example.com")?,
        callee: rsip::Uri::try_from(format!("sip:bob@127.0.0.1:{}", proxy_port))?,
        contact: rsip::Uri::try_from(format!("sip:alice@127.0.0.1:{}", uac_port))?,
        offer: Some(b"v=0\r\n".to_vec()),
        ..Default::default()
    };

    let (client_dialog, resp) = uac_dialog_layer
        .do_invite(invite_option, state_sender)
        .await?;

    let resp = resp.expect("INVITE must get a final response");
    assert_eq!(resp.status_code, rsip::StatusCode::OK);
    assert!(client_dialog.is_confirmed());

    // the proxy put itself on the record route and the UAS echoed it
    let record_route = resp
        .headers
        .iter()
        .find_map(|h| match h {
            rsip::Header::RecordRoute(rr) => Some(rr.value().to_string()),
            _ => None,
        })
        .expect("200 must carry the proxy's Record-Route");
    assert!(record_route.contains(&format!("127.0.0.1:{}", proxy_port)));

    // only the proxy's Via was consumed on the way back
    assert!(resp.via_header().is_ok());

    assert!(
        wait_for_state(&mut uas_states, |s| matches!(s, DialogState::Confirmed(_, _))).await,
        "UAS must reach Confirmed after the proxied ACK"
    );

    // BYE follows the route set through the proxy
    client_dialog.bye().await?;
    assert!(
        wait_for_state(&mut uas_states, |s| matches!(
            s,
            DialogState::Terminated(_, TerminatedReason::UacBye)
        ))
        .await,
        "UAS must see the proxied BYE"
    );

    proxy_token.cancel();
    Ok(())
}
