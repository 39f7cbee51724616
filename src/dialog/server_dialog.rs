use super::dialog::{Dialog, DialogInnerRef, DialogState, TerminatedReason, TransactionHandle};
use super::DialogId;
use crate::rsip_ext::parse_rack_header;
use crate::transaction::reliable::ReliableProvisionalResponder;
use crate::{
    transaction::transaction::{Transaction, TransactionEvent},
    Result,
};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Request, SipMessage, StatusCode};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Server-side INVITE dialog (UAS).
///
/// Created by the dialog layer when an INVITE server transaction
/// arrives. The application answers with [`ringing`](Self::ringing),
/// [`accept`](Self::accept) or [`reject`](Self::reject) while the
/// transaction sits in [`handle`](Self::handle); once confirmed the
/// dialog serves in-dialog requests and can send its own BYE,
/// re-INVITE, UPDATE or INFO.
///
/// Cloning is cheap, all clones share the same dialog state.
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ServerInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state.lock().unwrap().clone()
    }

    /// True once the 2xx/ACK exchange completed and the dialog is live.
    pub fn is_confirmed(&self) -> bool {
        self.inner.is_confirmed()
    }

    pub fn from_inner(inner: DialogInnerRef) -> Self {
        Self { inner }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// The INVITE that created this dialog.
    pub fn initial_request(&self) -> Request {
        self.inner
            .initial_request
            .lock()
            .expect("get initial request poisoned")
            .clone()
    }

    /// Send a provisional response: 180 Ringing, or 183 Session Progress
    /// when an early-media body is given. When the INVITE negotiated
    /// 100rel the response goes out reliably and retransmits until the
    /// matching PRACK. No-op once a final response was sent.
    pub fn ringing(&self, headers: Option<Vec<Header>>, body: Option<Vec<u8>>) -> Result<()> {
        if !self.inner.can_cancel() {
            return Ok(());
        }
        debug!(id = %self.id(), "sending ringing response");
        let resp = self.inner.make_response(
            &self.initial_request(),
            if body.is_some() {
                StatusCode::SessionProgress
            } else {
                StatusCode::Ringing
            },
            headers,
            body,
        );
        let responder = self.inner.local_reliable.lock().unwrap().clone();
        if let Some(responder) = responder {
            let cseq = self.initial_request().cseq_header()?.typed()?;
            responder.respond_via(&self.inner.tu_sender, cseq, resp.clone())?;
        } else {
            self.inner
                .tu_sender
                .send(TransactionEvent::Respond(resp.clone()))?;
        }
        self.inner
            .transition(DialogState::Early(self.id(), resp))
            .ok();
        Ok(())
    }

    /// Answer the INVITE with 200 OK, carrying the answer body when the
    /// offer arrived in the INVITE. The dialog moves to WaitAck until the
    /// peer's ACK confirms it.
    pub fn accept(&self, headers: Option<Vec<Header>>, body: Option<Vec<u8>>) -> Result<()> {
        // A final response ends any outstanding reliable provisional.
        if let Some(responder) = self.inner.local_reliable.lock().unwrap().take() {
            responder.stop();
        }
        let resp =
            self.inner
                .make_response(&self.initial_request(), rsip::StatusCode::OK, headers, body);
        self.inner
            .tu_sender
            .send(TransactionEvent::Respond(resp.clone()))?;

        self.inner
            .transition(DialogState::WaitAck(self.id(), resp))
            .ok();
        Ok(())
    }

    /// Refuse the INVITE, 603 Decline unless another code is given. The
    /// optional reason text goes out in a `Reason` header. No-op once the
    /// dialog is confirmed or already gone.
    pub fn reject(&self, code: Option<rsip::StatusCode>, reason: Option<String>) {
        if self.inner.is_terminated() || self.inner.is_confirmed() {
            return;
        }
        debug!(id = %self.id(), ?code, ?reason, "rejecting dialog");
        if let Some(responder) = self.inner.local_reliable.lock().unwrap().take() {
            responder.stop();
        }
        let headers = reason
            .map(|reason| vec![rsip::Header::Other("Reason".into(), reason)]);
        let resp = self.inner.make_response(
            &self.initial_request(),
            code.unwrap_or(rsip::StatusCode::Decline),
            headers,
            None,
        );
        self.inner
            .tu_sender
            .send(TransactionEvent::Respond(resp))
            .ok();
        self.inner
            .transition(DialogState::Terminated(
                self.id(),
                TerminatedReason::UasDecline,
            ))
            .ok();
    }

    /// Terminate the confirmed dialog with BYE. No-op unless the dialog
    /// is confirmed or waiting for its ACK.
    pub async fn bye(&self) -> Result<()> {
        self.bye_with_headers(None).await
    }

    pub async fn bye_with_headers(&self, headers: Option<Vec<rsip::Header>>) -> Result<()> {
        if !self.inner.is_confirmed() && !self.inner.waiting_ack() {
            return Ok(());
        }

        let request =
            self.inner
                .make_request(rsip::Method::Bye, None, None, None, headers, None)?;

        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye))
            .ok();
        self.inner.do_request(request).await.map(|_| ())
    }

    /// BYE with a `Reason` header, e.g. `SIP;cause=408;text="keepalive
    /// timeout"`.
    pub async fn bye_with_reason(&self, reason: String) -> Result<()> {
        self.bye_with_headers(Some(vec![rsip::Header::Other("Reason".into(), reason)]))
            .await
    }

    /// Modify the established session with a re-INVITE.
    pub async fn reinvite(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        debug!(id = %self.id(), ?body, "sending re-invite request");
        let request =
            self.inner
                .make_request(rsip::Method::Invite, None, None, None, headers, body)?;
        let resp = self.inner.do_request(request.clone()).await;
        if let Ok(Some(ref resp)) = resp {
            if resp.status_code == StatusCode::OK {
                let (handle, _) = TransactionHandle::new();
                self.inner
                    .transition(DialogState::Updated(self.id(), request, handle))
                    .ok();
            }
        }
        resp
    }

    pub async fn update(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        debug!(id = %self.id(), ?body, "sending update request");
        let request =
            self.inner
                .make_request(rsip::Method::Update, None, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    pub async fn info(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        debug!(id = %self.id(), ?body, "sending info request");
        let request =
            self.inner
                .make_request(rsip::Method::Info, None, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    /// Send a generic in-dialog request.
    pub async fn request(
        &self,
        method: rsip::Method,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        debug!(id = %self.id(), %method, "sending request");
        let request = self
            .inner
            .make_request(method, None, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    /// Feed an incoming transaction belonging to this dialog. Requests
    /// whose CSeq is not above the highest seen are silently discarded
    /// (ACK and CANCEL excepted, they reuse the INVITE's CSeq);
    /// everything else is dispatched by method and dialog state.
    pub async fn handle(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(
            id = %self.id(),
            method = %tx.original.method,
            state = %self.inner.state.lock().unwrap(),
            "handle request"
        );

        let cseq = tx.original.cseq_header()?.seq()?;
        let remote_seq = self.inner.remote_seq.load(Ordering::Relaxed);
        let ordered_by_cseq = !matches!(
            tx.original.method,
            rsip::Method::Ack | rsip::Method::Cancel
        );
        if ordered_by_cseq && remote_seq > 0 && cseq <= remote_seq {
            debug!(
                id = %self.id(),
                method = %tx.original.method,
                remote_seq = %remote_seq,
                cseq = %cseq,
                "discarding stale request"
            );
            return Ok(());
        }
        self.inner
            .remote_seq
            .compare_exchange(remote_seq, cseq, Ordering::Relaxed, Ordering::Relaxed)
            .ok();

        if self.inner.is_confirmed() {
            match tx.original.method {
                rsip::Method::Cancel => {
                    debug!(
                        id = %self.id(),
                        method = %tx.original.method,
                        uri = %tx.original.uri,
                        "invalid request received"
                    );
                    tx.reply(rsip::StatusCode::OK).await?;
                    return Ok(());
                }
                rsip::Method::Ack => {
                    debug!(
                        id = %self.id(),
                        method = %tx.original.method,
                        uri = %tx.original.uri,
                        "invalid request received"
                    );
                    return Err(crate::Error::DialogError(
                        "invalid request in confirmed state".to_string(),
                        self.id(),
                        rsip::StatusCode::MethodNotAllowed,
                    ));
                }
                rsip::Method::Invite => return self.handle_reinvite(tx).await,
                rsip::Method::Bye => return self.handle_bye(tx).await,
                rsip::Method::PRack => return self.handle_prack(tx).await,
                rsip::Method::Info => return self.handle_info(tx).await,
                rsip::Method::Options => return self.handle_options(tx).await,
                rsip::Method::Update => return self.handle_update(tx).await,
                _ => {
                    debug!(id = %self.id(), method = ?tx.original.method, "invalid request method");
                    tx.reply(rsip::StatusCode::MethodNotAllowed).await?;
                    return Err(crate::Error::DialogError(
                        "invalid request".to_string(),
                        self.id(),
                        rsip::StatusCode::MethodNotAllowed,
                    ));
                }
            }
        }

        match tx.original.method {
            rsip::Method::Invite => self.handle_invite(tx).await,
            rsip::Method::PRack => self.handle_prack(tx).await,
            rsip::Method::Ack => {
                // Late ACK for a 2xx whose transaction already finished;
                // hand it to the INVITE transaction's receive loop.
                self.inner.tu_sender.send(TransactionEvent::Received(
                    tx.original.clone().into(),
                    tx.connection.clone(),
                ))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_bye(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received bye");
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye))
            .ok();
        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_info(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received info");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Info(self.id(), tx.original.clone(), handle))
            .ok();
        self.inner.process_transaction_handle(tx, rx).await
    }

    async fn handle_prack(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received prack");

        let responder = self.inner.local_reliable.lock().unwrap().clone();
        if let Some(responder) = responder {
            responder.process_prack(tx).await?;
            return Ok(());
        }

        if parse_rack_header(&tx.original.headers).is_none() {
            warn!(id = %self.id(), "received PRACK without RAck header");
            tx.reply(rsip::StatusCode::BadRequest).await?;
            return Ok(());
        }

        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_options(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received options");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Options(self.id(), tx.original.clone(), handle))
            .ok();

        self.inner.process_transaction_handle(tx, rx).await
    }

    async fn handle_update(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received update");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone(), handle))
            .ok();

        self.inner.process_transaction_handle(tx, rx).await
    }

    async fn handle_reinvite(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), "received re-invite {}", tx.original.uri);
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone(), handle))
            .ok();

        self.inner.process_transaction_handle(tx, rx).await?;

        while let Some(msg) = tx.receive().await {
            if let SipMessage::Request(req) = msg {
                if req.method == rsip::Method::Ack {
                    debug!(id = %self.id(), "received ack for re-invite {}", req.uri);
                    self.inner
                        .transition(DialogState::Confirmed(
                            self.id(),
                            tx.last_response.clone().unwrap_or_default(),
                        ))
                        .ok();
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_invite(&mut self, tx: &mut Transaction) -> Result<()> {
        let mut reliable_timeouts = None;
        if self.inner.supports_100rel && !self.inner.is_confirmed() {
            let responder = ReliableProvisionalResponder::new(self.inner.endpoint_inner.clone());
            responder.set_connection(tx.connection.clone());
            reliable_timeouts = responder.take_timeouts();
            *self.inner.local_reliable.lock().unwrap() = Some(responder);
        }

        let handle_loop = async {
            if !self.inner.is_confirmed() && matches!(tx.original.method, rsip::Method::Invite) {
                self.inner
                    .transition(DialogState::Calling(self.id()))
                    .ok();
                tx.send_trying().await.ok();
            }

            loop {
                tokio::select! {
                    msg = tx.receive() => {
                        let msg = match msg {
                            Some(msg) => msg,
                            None => break,
                        };
                        match msg {
                            SipMessage::Request(req) => match req.method {
                                rsip::Method::Ack => {
                                    if self.inner.is_terminated() {
                                        break;
                                    }
                                    debug!(id = %self.id(), "received ack {}", req.uri);
                                    self.inner
                                        .transition(DialogState::Confirmed(
                                            self.id(),
                                            tx.last_response.clone().unwrap_or_default(),
                                        ))
                                        .ok();
                                    break;
                                }
                                rsip::Method::Cancel => {
                                    debug!(id = %self.id(), "received cancel {}", req.uri);
                                    tx.reply(rsip::StatusCode::RequestTerminated).await?;
                                    self.inner
                                        .transition(DialogState::Terminated(
                                            self.id(),
                                            TerminatedReason::UacCancel,
                                        ))
                                        .ok();
                                    break;
                                }
                                _ => {}
                            },
                            SipMessage::Response(_) => {}
                        }
                    }
                    timed_out = recv_reliable_timeout(&mut reliable_timeouts) => {
                        match timed_out {
                            Some(resp) => {
                                // RFC 3262 3: a reliable provisional that
                                // was never PRACKed ends the INVITE with
                                // a 5xx.
                                warn!(
                                    id = %self.id(),
                                    status = %resp.status_code,
                                    "reliable provisional unacknowledged, rejecting invite"
                                );
                                tx.reply(rsip::StatusCode::ServerInternalError).await?;
                                self.inner
                                    .transition(DialogState::Terminated(
                                        self.id(),
                                        TerminatedReason::Timeout,
                                    ))
                                    .ok();
                                break;
                            }
                            None => {
                                reliable_timeouts = None;
                            }
                        }
                    }
                }
            }
            Ok::<(), crate::Error>(())
        };
        let result = handle_loop.await;
        if let Some(responder) = self.inner.local_reliable.lock().unwrap().take() {
            responder.stop();
        }
        match result {
            Ok(_) => {
                trace!(id = %self.id(), "process done");
                Ok(())
            }
            Err(e) => {
                warn!(id = %self.id(), "handle_invite error: {:?}", e);
                Err(e)
            }
        }
    }
}

/// Waits on the responder's timeout channel, or forever when there is
/// none (no 100rel, or the channel was drained and closed).
async fn recv_reliable_timeout(
    rx: &mut Option<tokio::sync::mpsc::UnboundedReceiver<rsip::Response>>,
) -> Option<rsip::Response> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl TryFrom<&Dialog> for ServerInviteDialog {
    type Error = crate::Error;

    fn try_from(dlg: &Dialog) -> Result<Self> {
        match dlg {
            Dialog::ServerInvite(dlg) => Ok(dlg.clone()),
            _ => Err(crate::Error::DialogError(
                "Dialog is not a ServerInviteDialog".to_string(),
                dlg.id(),
                rsip::StatusCode::BadRequest,
            )),
        }
    }
}
