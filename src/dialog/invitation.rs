use super::{
    client_dialog::ClientInviteDialog,
    dialog::{DialogInner, DialogStateSender},
    dialog_layer::DialogLayer,
};
use crate::{
    dialog::{
        dialog::{Dialog, DialogState, TerminatedReason},
        dialog_layer::DialogLayerInnerRef,
        DialogId,
    },
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
    },
    transport::SipAddr,
    Result,
};
use futures::FutureExt;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Request, Response, SipMessage, StatusCodeKind,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where the SDP offer rides in the INVITE exchange (RFC 3261 13.2.1).
///
/// The choice holds for one call leg and reverts to the default once
/// the ACK exchange completes.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub enum OfferPlacement {
    /// Offer in the INVITE, answer in the 2xx, empty ACK.
    #[default]
    InInvite,
    /// Bodyless INVITE: the peer offers in its 2xx and the answer goes
    /// out in the ACK.
    InAccept,
}

/// Produces the session answer for an offer that arrived in a 2xx under
/// [`OfferPlacement::InAccept`]. The returned bytes become the ACK
/// body; `None` sends the ACK empty.
pub type AnswerFn = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Parameters for an outbound INVITE.
///
/// `caller`/`callee` become the From/To headers, `callee` doubles as the
/// Request-URI. `offer` is the message body (typically SDP) with
/// `content_type` defaulting to `application/sdp`; with
/// `offer_placement` set to [`OfferPlacement::InAccept`] the INVITE
/// goes out without a body and `answer` supplies the ACK body instead.
/// `contact` is this user agent's reachable URI. Set `destination` to
/// force the next hop instead of resolving the Request-URI, and
/// `support_prack` to advertise `Supported: 100rel` so the far end may
/// answer with reliable provisionals.
#[derive(Default, Clone)]
pub struct InviteOption {
    pub caller_display_name: Option<String>,
    pub caller_params: Vec<rsip::uri::Param>,
    pub caller: rsip::Uri,
    pub callee: rsip::Uri,
    pub destination: Option<SipAddr>,
    pub content_type: Option<String>,
    pub offer: Option<Vec<u8>>,
    pub offer_placement: OfferPlacement,
    pub answer: Option<AnswerFn>,
    pub contact: rsip::Uri,
    pub headers: Option<Vec<rsip::Header>>,
    pub support_prack: bool,
    pub call_id: Option<String>,
}

/// Unregisters the dialog when the invite future is dropped before a
/// final response, cancelling the pending INVITE so the far end does
/// not keep ringing.
pub(super) struct DialogGuardForUnconfirmed<'a> {
    pub dialog_layer_inner: &'a DialogLayerInnerRef,
    pub id: &'a DialogId,
    invite_tx: Option<Transaction>,
}

impl<'a> Drop for DialogGuardForUnconfirmed<'a> {
    fn drop(&mut self) {
        if let Some(dlg) = self.dialog_layer_inner.untrack(self.id) {
            debug!(%self.id, "unconfirmed dialog dropped, cancelling it");
            let invite_tx = self.invite_tx.take();
            let _ = tokio::spawn(async move {
                if let Dialog::ClientInvite(ref client_dialog) = dlg {
                    if client_dialog.inner.can_cancel() {
                        if let Err(e) = client_dialog.cancel().await {
                            warn!(id = %client_dialog.id(), error = %e, "dialog cancel failed");
                            return;
                        }

                        // Drain the INVITE transaction until its 487
                        // (or any final) arrives, bounded in time.
                        if let Some(mut invite_tx) = invite_tx {
                            let duration = tokio::time::Duration::from_secs(2);
                            let timeout = tokio::time::sleep(duration);
                            tokio::pin!(timeout);
                            loop {
                                tokio::select! {
                                    _ = &mut timeout => break,
                                    msg = invite_tx.receive() => {
                                        match msg {
                                            Some(SipMessage::Response(resp))
                                                if resp.status_code.kind()
                                                    != StatusCodeKind::Provisional =>
                                            {
                                                debug!(
                                                    id = %client_dialog.id(),
                                                    status = %resp.status_code,
                                                    "received final response"
                                                );
                                                break;
                                            }
                                            Some(_) => {}
                                            None => break,
                                        }
                                    }
                                }
                            }
                        }
                        client_dialog
                            .inner
                            .transition(DialogState::Terminated(
                                client_dialog.id(),
                                TerminatedReason::UacCancel,
                            ))
                            .ok();
                        debug!(id = %client_dialog.id(), "dialog terminated");
                        return;
                    }
                }

                if let Err(e) = dlg.hangup().await {
                    debug!(id = %dlg.id(), error = %e, "failed to hangup unconfirmed dialog");
                }
            });
        }
    }
}

impl DialogLayer {
    /// Build the initial INVITE from the options: fresh From tag, Via
    /// branch and CSeq, untagged To, Contact and Content-Type filled
    /// in. Extra headers are appended as given, except Max-Forwards
    /// which replaces the generated one so the request never carries
    /// two.
    pub fn make_invite_request(&self, opt: &InviteOption) -> Result<Request> {
        let last_seq = self.increment_last_seq();
        let to = rsip::typed::To {
            display_name: None,
            uri: opt.callee.clone(),
            params: vec![],
        };
        let recipient = to.uri.clone();

        let from = rsip::typed::From {
            display_name: opt.caller_display_name.clone(),
            uri: opt.caller.clone(),
            params: opt.caller_params.clone(),
        }
        .with_tag(make_tag());

        let call_id = opt
            .call_id
            .as_ref()
            .map(|id| rsip::headers::CallId::from(id.clone()));

        let via = self.endpoint.get_via(None, None)?;
        let mut request = self.endpoint.make_request(
            rsip::Method::Invite,
            recipient,
            via,
            from,
            to,
            last_seq,
            call_id,
        );

        let contact = rsip::typed::Contact {
            display_name: None,
            uri: opt.contact.clone(),
            params: vec![],
        };

        request
            .headers
            .unique_push(rsip::Header::Contact(contact.into()));

        request.headers.unique_push(rsip::Header::ContentType(
            opt.content_type
                .clone()
                .unwrap_or("application/sdp".to_string())
                .into(),
        ));

        if opt.support_prack {
            request
                .headers
                .unique_push(rsip::Header::Supported("100rel".into()));
        }
        if let Some(headers) = opt.headers.as_ref() {
            for header in headers {
                match header {
                    rsip::Header::MaxForwards(_) => request.headers.unique_push(header.clone()),
                    _ => request.headers.push(header.clone()),
                }
            }
        }
        Ok(request)
    }

    /// Place an outbound call and drive it to its final response.
    ///
    /// The dialog is registered under its early id (Call-ID + From tag)
    /// while the INVITE runs so in-dialog requests can be matched, and
    /// re-registered under the confirmed id (with the remote tag) after
    /// a 2xx. The returned response is the final one, `None` when the
    /// transaction ended without any (local cancel, transport teardown).
    ///
    /// Dropping the future before a final response cancels the INVITE.
    pub async fn do_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let (dialog, tx) = self.create_client_invite_dialog(opt, state_sender)?;
        let id = dialog.id();

        self.inner
            .track(id.clone(), Dialog::ClientInvite(dialog.clone()));

        debug!(%id, "client invite dialog created");
        let mut guard = DialogGuardForUnconfirmed {
            dialog_layer_inner: &self.inner,
            id: &id,
            invite_tx: Some(tx),
        };

        let tx = guard
            .invite_tx
            .as_mut()
            .expect("invite transaction present");

        let r = dialog.process_invite(tx).boxed().await;
        self.inner.untrack(&id);

        let (new_dialog_id, resp) = r?;
        if let Some(ref r) = resp {
            if r.status_code.kind() == rsip::StatusCodeKind::Successful {
                debug!("client invite dialog confirmed: {} => {}", id, new_dialog_id);
                self.inner
                    .track(new_dialog_id, Dialog::ClientInvite(dialog.clone()));
            }
        }
        Ok((dialog, resp))
    }

    pub fn create_client_invite_dialog(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let mut request = self.make_invite_request(&opt)?;
        match opt.offer_placement {
            OfferPlacement::InInvite => {
                request.body = opt.offer.unwrap_or_default();
            }
            OfferPlacement::InAccept => {
                // The offer comes back in the 2xx; the INVITE stays
                // bodyless.
                request
                    .headers
                    .retain(|h| !matches!(h, rsip::Header::ContentType(_)));
            }
        }
        request.headers.unique_push(rsip::Header::ContentLength(
            (request.body.len() as u32).into(),
        ));
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request.clone(), self.endpoint.clone(), None);

        if opt.destination.is_some() {
            tx.destination = opt.destination;
        } else if let Some(route) = tx.original.route_header() {
            if let Some(first_route) = route.typed().ok().and_then(|r| r.uris().first().cloned()) {
                tx.destination = SipAddr::try_from(&first_route.uri).ok();
            }
        }

        let id = DialogId::from_uac_request(&request)?;
        let dlg_inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            request.clone(),
            self.endpoint.clone(),
            state_sender,
            Some(opt.contact),
            tx.tu_sender.clone(),
        )?;
        dlg_inner.set_offer_placement(opt.offer_placement, opt.answer);

        if let Some(destination) = &tx.destination {
            let uri = rsip::Uri::from(destination);
            dlg_inner
                .remote_uri
                .lock()
                .map(|mut guard| {
                    *guard = uri;
                })
                .ok();
        }
        let dialog = ClientInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        Ok((dialog, tx))
    }
}
