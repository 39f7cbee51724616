use super::dialog::DialogInnerRef;
use super::invitation::OfferPlacement;
use super::DialogId;
use crate::dialog::dialog::{DialogState, TerminatedReason, TransactionHandle};
use crate::rsip_ext::{destination_from_request, RsipResponseExt};
use crate::transaction::transaction::Transaction;
use crate::Result;
use rsip::prelude::HasHeaders;
use rsip::{prelude::HeadersExt, Header};
use rsip::{Response, SipMessage, StatusCode};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Client-side INVITE dialog (UAC).
///
/// Created by [`DialogLayer::do_invite`](super::dialog_layer) around an
/// outgoing INVITE. [`process_invite`](Self::process_invite) drives the
/// transaction to its final response, ACKs a 2xx and leaves the ACK
/// parked with the endpoint so retransmitted 2xx get it replayed. Once
/// confirmed the dialog sends BYE, re-INVITE, UPDATE, INFO or OPTIONS
/// and serves the peer's in-dialog requests.
///
/// Cloning is cheap, all clones share the same dialog state.
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ClientInviteDialog {
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

    /// Terminate the confirmed dialog with BYE. No-op while the dialog
    /// is not confirmed; use [`cancel`](Self::cancel) for that phase.
    pub async fn bye(&self) -> Result<()> {
        self.bye_with_headers(None).await
    }

    pub async fn bye_with_headers(&self, headers: Option<Vec<rsip::Header>>) -> Result<()> {
        if !self.inner.is_confirmed() {
            return Ok(());
        }

        let request =
            self.inner
                .make_request(rsip::Method::Bye, None, None, None, headers, None)?;

        if let Err(e) = self.inner.do_request(request).await {
            info!(error = %e, "bye error");
        }

        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye))?;
        Ok(())
    }

    /// BYE with a `Reason` header, e.g. `SIP;cause=408;text="keepalive
    /// timeout"`.
    pub async fn bye_with_reason(&self, reason: String) -> Result<()> {
        self.bye_with_headers(Some(vec![rsip::Header::Other("Reason".into(), reason)]))
            .await
    }

    /// Tear the call down in whatever way fits the current state: CANCEL
    /// while still establishing, BYE once confirmed.
    pub async fn hangup(&self) -> Result<()> {
        self.hangup_with_headers(None).await
    }

    /// Like [`hangup`](Self::hangup); the headers ride on the BYE when
    /// BYE is what goes out (CANCEL never carries them).
    pub async fn hangup_with_headers(&self, headers: Option<Vec<rsip::Header>>) -> Result<()> {
        if self.inner.can_cancel() {
            self.cancel().await
        } else {
            self.bye_with_headers(headers).await
        }
    }

    pub async fn hangup_with_reason(&self, reason: String) -> Result<()> {
        self.hangup_with_headers(Some(vec![rsip::Header::Other("Reason".into(), reason)]))
            .await
    }

    /// Abort the pending INVITE with CANCEL. The CANCEL mirrors the
    /// INVITE's CSeq number and Via branch so the UAS can match it.
    /// No-op once the dialog is confirmed.
    pub async fn cancel(&self) -> Result<()> {
        if self.inner.is_confirmed() {
            return Ok(());
        }
        debug!(id = %self.id(), "sending cancel request");
        let mut cancel_request = self
            .inner
            .initial_request
            .lock()
            .expect("cancel mutex poisoned")
            .clone();
        let invite_seq = cancel_request.cseq_header()?.seq()?;
        cancel_request
            .headers_mut()
            .retain(|h| !matches!(h, Header::ContentLength(_) | Header::ContentType(_)));

        cancel_request.method = rsip::Method::Cancel;
        cancel_request
            .cseq_header_mut()?
            .mut_seq(invite_seq)?
            .mut_method(rsip::Method::Cancel)?;
        cancel_request.body = vec![];
        self.inner.do_request(cancel_request).await?;
        Ok(())
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
                    .transition(DialogState::Updated(self.id(), request, handle))?;
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

    pub async fn options(
        &self,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        if !self.inner.is_confirmed() {
            return Ok(None);
        }
        debug!(id = %self.id(), ?body, "sending options request");
        let request =
            self.inner
                .make_request(rsip::Method::Options, None, None, None, headers, body)?;
        self.inner.do_request(request).await
    }

    /// Send a generic in-dialog request. CSeq, Call-ID, tags and the
    /// route set are filled in from the dialog.
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
    /// everything else is dispatched by method.
    pub async fn handle(&mut self, tx: &mut Transaction) -> Result<()> {
        trace!(
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
                rsip::Method::Invite => return self.handle_reinvite(tx).await,
                rsip::Method::Bye => return self.handle_bye(tx).await,
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
        } else {
            debug!(
                id = %self.id(),
                method = ?tx.original.method,
                "received request not confirmed"
            );
        }
        Ok(())
    }

    async fn handle_bye(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received bye");
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye))?;
        tx.reply(rsip::StatusCode::OK).await?;
        Ok(())
    }

    async fn handle_info(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received info");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Info(self.id(), tx.original.clone(), handle))?;
        self.inner.process_transaction_handle(tx, rx).await
    }

    async fn handle_options(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received options");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Options(self.id(), tx.original.clone(), handle))?;
        self.inner.process_transaction_handle(tx, rx).await
    }

    async fn handle_update(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received update");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone(), handle))?;
        self.inner.process_transaction_handle(tx, rx).await
    }

    async fn handle_reinvite(&mut self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), uri = %tx.original.uri, "received reinvite");
        let (handle, rx) = TransactionHandle::new();
        self.inner
            .transition(DialogState::Updated(self.id(), tx.original.clone(), handle))?;

        self.inner.process_transaction_handle(tx, rx).await?;

        // wait for ACK
        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Request(req) if req.method == rsip::Method::Ack => {
                    debug!(id = %self.id(), "received ACK for re-INVITE");
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Drive the INVITE client transaction to its conclusion: forward
    /// provisionals (auto-PRACKing reliable ones), and on a 2xx capture
    /// the route set and remote target, send the ACK and park it with
    /// the endpoint for 2xx retransmissions. Returns the final dialog id
    /// and the final response, if any arrived.
    pub async fn process_invite(
        &self,
        tx: &mut Transaction,
    ) -> Result<(DialogId, Option<Response>)> {
        self.inner.transition(DialogState::Calling(self.id()))?;
        tx.send().await?;
        let mut dialog_id = self.id();
        let mut final_response = None;
        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Request(_) => {}
                SipMessage::Response(resp) => {
                    let status = resp.status_code.clone();

                    if status == StatusCode::Trying {
                        self.inner.transition(DialogState::Trying(self.id()))?;
                        continue;
                    }

                    if matches!(status.kind(), rsip::StatusCodeKind::Provisional) {
                        self.inner.handle_provisional_response(&resp).await?;
                        self.inner.transition(DialogState::Early(self.id(), resp))?;
                        continue;
                    }

                    final_response = Some(resp.clone());
                    match resp.to_header()?.tag()? {
                        Some(tag) => self.inner.update_remote_tag(tag.value())?,
                        None => {}
                    }

                    if let Ok(id) = DialogId::from_uac_response(&resp) {
                        dialog_id = id;
                    }
                    match resp.status_code {
                        StatusCode::OK => {
                            self.inner.update_route_set_from_response(&resp);
                            // 2xx to INVITE always carries a Contact
                            let contact = resp.contact_header()?;
                            self.inner
                                .remote_contact
                                .lock()
                                .unwrap()
                                .replace(contact.clone());

                            *self.inner.remote_uri.lock().unwrap() =
                                resp.remote_uri(tx.destination.as_ref())?;

                            // When the INVITE went out bodyless the 2xx
                            // carries the offer and the answer rides in
                            // the ACK.
                            let ack_body = match *self.inner.offer_placement.lock().unwrap() {
                                OfferPlacement::InAccept => {
                                    let answer =
                                        self.inner.answer_builder.lock().unwrap().clone();
                                    answer.and_then(|make_answer| make_answer(&resp.body))
                                }
                                OfferPlacement::InInvite => None,
                            };
                            let ack = self.inner.endpoint_inner.make_ack(
                                &resp,
                                None,
                                tx.destination.as_ref(),
                                ack_body,
                            )?;
                            self.send_ack(tx, ack.clone()).await?;
                            self.inner
                                .endpoint_inner
                                .detach_transaction(&tx.key, Some(ack.into()));
                            // the placement holds for one exchange only
                            self.inner
                                .set_offer_placement(OfferPlacement::InInvite, None);

                            self.inner
                                .transition(DialogState::Confirmed(dialog_id.clone(), resp))?;
                        }
                        _ => {
                            let reason = match resp.status_code {
                                StatusCode::BusyHere | StatusCode::BusyEverywhere => {
                                    TerminatedReason::UasBusy
                                }
                                _ => TerminatedReason::UasOther(resp.status_code.clone()),
                            };
                            self.inner
                                .transition(DialogState::Terminated(self.id(), reason))?;
                        }
                    }
                    break;
                }
            }
        }
        Ok((dialog_id, final_response))
    }

    /// The 2xx ACK is end-to-end, not part of the INVITE transaction. It
    /// reuses the INVITE's connection when one exists and follows the
    /// ACK's own Route/Request-URI otherwise.
    async fn send_ack(&self, tx: &Transaction, ack: rsip::Request) -> Result<()> {
        let destination = match tx.destination.clone() {
            Some(addr) => Some(addr),
            None => destination_from_request(&ack),
        };
        let connection = match tx.connection.clone() {
            Some(connection) => connection,
            None => {
                let target = destination.clone().ok_or_else(|| {
                    crate::Error::DialogError(
                        "no destination for ack".to_string(),
                        self.id(),
                        rsip::StatusCode::ServerInternalError,
                    )
                })?;
                self.inner
                    .endpoint_inner
                    .transport_layer
                    .lookup(&target)
                    .await?
            }
        };
        debug!(id = %self.id(), "sending ack for 2xx response");
        connection.send(ack.into(), destination.as_ref()).await
    }
}
