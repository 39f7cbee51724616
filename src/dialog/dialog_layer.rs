use super::{dialog::Dialog, server_dialog::ServerInviteDialog, DialogId};
use crate::dialog::dialog::{DialogInner, DialogStateReceiver, DialogStateSender};
use crate::transaction::key::TransactionRole;
use crate::transaction::make_tag;
use crate::transaction::{endpoint::EndpointInnerRef, transaction::Transaction};
use crate::Result;
use dashmap::DashMap;
use rsip::prelude::HeadersExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Shared dialog registry plus the CSeq counter for outbound requests.
///
/// Kept behind an `Arc` so drop guards and spawned tasks can untrack a
/// dialog without holding the whole layer.
pub struct DialogLayerInner {
    pub(super) last_seq: AtomicU32,
    dialogs: DashMap<DialogId, Dialog>,
}
pub type DialogLayerInnerRef = Arc<DialogLayerInner>;

impl DialogLayerInner {
    pub(super) fn track(&self, id: DialogId, dialog: Dialog) {
        self.dialogs.insert(id, dialog);
    }

    pub(super) fn seek(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|entry| entry.value().clone())
    }

    /// Drops the registry entry and hands the dialog back, if it was
    /// still tracked.
    pub(super) fn untrack(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.remove(id).map(|(_, dialog)| dialog)
    }
}

/// Registry of active dialogs, keyed by [`DialogId`].
///
/// The layer sits between the endpoint's transaction dispatch and the
/// application: incoming INVITE transactions become
/// [`ServerInviteDialog`]s via
/// [`get_or_create_server_invite`](Self::get_or_create_server_invite),
/// in-dialog requests find their dialog through
/// [`match_dialog`](Self::match_dialog), and outgoing calls are placed
/// with the helpers in [`invitation`](super::invitation). The registry
/// is sharded, so lookups and insertions from different tasks do not
/// contend on one lock. Dialogs are removed explicitly with
/// [`remove_dialog`](Self::remove_dialog) once Terminated.
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub inner: DialogLayerInnerRef,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        Self {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                last_seq: AtomicU32::new(0),
                dialogs: DashMap::new(),
            }),
        }
    }

    /// Look up the dialog for an incoming INVITE transaction, creating
    /// a fresh server dialog (with a newly minted To tag) when the
    /// INVITE is dialog-establishing. A tagged INVITE that matches no
    /// known dialog is an error: the caller replies 481.
    pub fn get_or_create_server_invite(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
        local_contact: Option<rsip::Uri>,
    ) -> Result<ServerInviteDialog> {
        let id = DialogId::try_from(&tx.original)?;
        if !id.local_tag.is_empty() {
            // Tagged INVITE: a re-INVITE for a dialog we should know.
            return match self.inner.seek(&id) {
                Some(Dialog::ServerInvite(dialog)) => Ok(dialog),
                _ => Err(crate::Error::DialogError(
                    "the dialog not found".to_string(),
                    id,
                    rsip::StatusCode::CallTransactionDoesNotExist,
                )),
            };
        }
        let id = DialogId {
            local_tag: make_tag().to_string(),
            ..id
        };

        let local_contact =
            local_contact.or_else(|| self.build_local_contact(None, None).ok());

        let dlg_inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.endpoint.clone(),
            state_sender,
            local_contact,
            tx.tu_sender.clone(),
        )?;
        *dlg_inner.remote_contact.lock().unwrap() = tx.original.contact_header().ok().cloned();

        let dialog = ServerInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        self.inner
            .track(id.clone(), Dialog::ServerInvite(dialog.clone()));
        debug!(%id, "server invite dialog created");
        Ok(dialog)
    }

    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.dialogs.is_empty()
    }

    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.seek(id)
    }

    pub fn remove_dialog(&self, id: &DialogId) {
        if let Some(dialog) = self.inner.untrack(id) {
            debug!(%id, "dialog removed");
            dialog.on_remove();
        }
    }

    /// Match an incoming transaction to an existing dialog by the
    /// (Call-ID, To tag, From tag) triple of its request.
    pub fn match_dialog(&self, tx: &Transaction) -> Option<Dialog> {
        let id = DialogId::try_from(&tx.original).ok()?;
        self.get_dialog(&id)
    }

    pub fn new_dialog_state_channel(&self) -> (DialogStateSender, DialogStateReceiver) {
        tokio::sync::mpsc::unbounded_channel()
    }

    /// Contact URI advertising the first listening address of the
    /// endpoint. Non-UDP transports get a `transport` parameter, TLS
    /// switches the scheme to `sips`.
    pub fn build_local_contact(
        &self,
        username: Option<String>,
        params: Option<Vec<rsip::Param>>,
    ) -> Result<rsip::Uri> {
        let addr = self
            .endpoint
            .transport_layer
            .get_addrs()
            .into_iter()
            .next()
            .ok_or_else(|| crate::Error::EndpointError("no listening address".to_string()))?;

        let scheme = match addr.r#type {
            Some(rsip::Transport::Tls) => rsip::Scheme::Sips,
            _ => rsip::Scheme::Sip,
        };
        let mut params = params.unwrap_or_default();
        match addr.r#type {
            Some(rsip::Transport::Udp) | None => {}
            Some(transport) => params.push(rsip::Param::Transport(transport)),
        }

        Ok(rsip::Uri {
            scheme: Some(scheme),
            auth: username.map(|user| rsip::Auth {
                user,
                password: None,
            }),
            host_with_port: addr.addr.into(),
            params,
            ..Default::default()
        })
    }
}
