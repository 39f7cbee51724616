use super::invitation::{AnswerFn, OfferPlacement};
use super::{client_dialog::ClientInviteDialog, server_dialog::ServerInviteDialog, DialogId};
use crate::{
    rsip_ext::{extract_uri_from_contact, header_contains_token, parse_rseq_header},
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        make_via_branch,
        reliable::ReliableProvisionalResponder,
        transaction::{Transaction, TransactionEventSender},
    },
    transport::SipAddr,
    Result,
};
use futures::FutureExt;
use rsip::{
    headers::Route,
    message::HasHeaders,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::{CSeq, Contact, Via},
    Header, Method, Param, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type TransactionCommandSender = mpsc::Sender<TransactionCommand>;
pub type TransactionCommandReceiver = mpsc::Receiver<TransactionCommand>;

#[derive(Debug)]
pub enum TransactionCommand {
    Respond {
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    },
}

/// Handle passed to the application with [`DialogState::Updated`],
/// [`DialogState::Info`] and [`DialogState::Options`] so it can answer
/// the in-dialog request itself. The dialog keeps the transaction alive
/// until a final response goes through the handle (or a timeout answers
/// 501 on the application's behalf).
#[derive(Clone, Debug)]
pub struct TransactionHandle {
    sender: TransactionCommandSender,
}

impl TransactionHandle {
    pub fn new() -> (Self, TransactionCommandReceiver) {
        let (tx, rx) = mpsc::channel(4);
        (Self { sender: tx }, rx)
    }

    pub async fn reply(
        &self,
        status: StatusCode,
    ) -> std::result::Result<(), mpsc::error::SendError<TransactionCommand>> {
        self.respond(status, None, None).await
    }

    pub async fn respond(
        &self,
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> std::result::Result<(), mpsc::error::SendError<TransactionCommand>> {
        self.sender
            .send(TransactionCommand::Respond {
                status,
                headers,
                body,
            })
            .await
    }
}

/// Dialog lifecycle states, also delivered on the dialog state channel
/// as events.
///
/// * `Calling` - initial INVITE sent or received
/// * `Trying` - 100 Trying seen
/// * `Early` - non-100 provisional seen, early dialog exists
/// * `WaitAck` - UAS sent a 2xx and waits for the ACK
/// * `Confirmed` - 2xx plus ACK on both sides, dialog established
/// * `Updated` / `Info` / `Options` - in-dialog request arrived, answer
///   through the carried [`TransactionHandle`]
/// * `Terminated` - dialog is gone, with the reason
///
/// `Updated`, `Info` and `Options` are pure notifications and never
/// become the stored state.
#[derive(Clone)]
pub enum DialogState {
    Calling(DialogId),
    Trying(DialogId),
    Early(DialogId, rsip::Response),
    WaitAck(DialogId, rsip::Response),
    Confirmed(DialogId, rsip::Response),
    Updated(DialogId, rsip::Request, TransactionHandle),
    Info(DialogId, rsip::Request, TransactionHandle),
    Options(DialogId, rsip::Request, TransactionHandle),
    Terminated(DialogId, TerminatedReason),
}

#[derive(Debug, Clone)]
pub enum TerminatedReason {
    Timeout,
    UacCancel,
    UacBye,
    UasBye,
    UacBusy,
    UasBusy,
    UasDecline,
    ProxyError(rsip::StatusCode),
    UacOther(rsip::StatusCode),
    UasOther(rsip::StatusCode),
}

/// An established or establishing dialog, UAS or UAC side.
#[derive(Clone)]
pub enum Dialog {
    ServerInvite(ServerInviteDialog),
    ClientInvite(ClientInviteDialog),
}

/// Last reliable provisional we answered, so retransmissions reuse the
/// same PRACK instead of burning a new CSeq.
#[derive(Clone)]
pub(super) struct RemoteReliableState {
    last_rseq: u32,
    prack_request: Request,
}

/// State shared by both dialog sides: identifiers, sequence numbers,
/// the negotiated To/From pair, the route set and the channels back to
/// the transaction layer and the application.
pub struct DialogInner {
    pub role: TransactionRole,
    pub cancel_token: CancellationToken,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,

    pub local_seq: AtomicU32,
    pub local_contact: Option<rsip::Uri>,
    pub remote_contact: Mutex<Option<rsip::headers::untyped::Contact>>,

    pub remote_seq: AtomicU32,
    pub remote_uri: Mutex<rsip::Uri>,

    pub from: rsip::typed::From,
    pub to: Mutex<rsip::typed::To>,

    pub route_set: Mutex<Vec<Route>>,

    pub(super) endpoint_inner: EndpointInnerRef,
    pub(super) state_sender: DialogStateSender,
    pub(super) tu_sender: TransactionEventSender,
    pub(super) initial_request: Mutex<Request>,
    pub(super) supports_100rel: bool,
    pub(super) remote_reliable: Mutex<Option<RemoteReliableState>>,
    pub(super) local_reliable: Mutex<Option<ReliableProvisionalResponder>>,
    pub(super) offer_placement: Mutex<OfferPlacement>,
    pub(super) answer_builder: Mutex<Option<AnswerFn>>,
}

pub type DialogStateReceiver = UnboundedReceiver<DialogState>;
pub type DialogStateSender = UnboundedSender<DialogState>;

pub(super) type DialogInnerRef = Arc<DialogInner>;

impl DialogState {
    pub fn id(&self) -> &DialogId {
        match self {
            DialogState::Calling(id)
            | DialogState::Trying(id)
            | DialogState::Early(id, _)
            | DialogState::WaitAck(id, _)
            | DialogState::Confirmed(id, _)
            | DialogState::Updated(id, _, _)
            | DialogState::Info(id, _, _)
            | DialogState::Options(id, _, _)
            | DialogState::Terminated(id, _) => id,
        }
    }

    /// A CANCEL is only meaningful before any final response.
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            DialogState::Calling(_) | DialogState::Trying(_) | DialogState::Early(_, _)
        )
    }
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_, _))
    }
    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_, _))
    }
    pub fn waiting_ack(&self) -> bool {
        matches!(self, DialogState::WaitAck(_, _))
    }
}

impl DialogInner {
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
        local_contact: Option<rsip::Uri>,
        tu_sender: TransactionEventSender,
    ) -> Result<Self> {
        let cseq = initial_request.cseq_header()?.seq()?;

        let remote_uri = match role {
            TransactionRole::Client => initial_request.uri.clone(),
            TransactionRole::Server => {
                extract_uri_from_contact(initial_request.contact_header()?.value())?
            }
        };

        let from = initial_request.from_header()?.typed()?;
        let mut to = initial_request.to_header()?.typed()?;
        if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            let tag = match role {
                TransactionRole::Client => &id.remote_tag,
                TransactionRole::Server => &id.local_tag,
            };
            if !tag.is_empty() {
                to.params.push(rsip::Param::Tag(tag.clone().into()));
            }
        }

        // RFC 3261 12.1.1/12.1.2: a UAS keeps the request's Record-Route
        // order, a UAC reverses it.
        let mut route_set = vec![];
        for h in initial_request.headers.iter() {
            if let Header::RecordRoute(rr) = h {
                route_set.push(Route::from(rr.value()));
            }
        }
        if matches!(role, TransactionRole::Client) {
            route_set.reverse();
        }

        let supports_100rel =
            header_contains_token(&initial_request.headers, "Supported", "100rel")
                || header_contains_token(&initial_request.headers, "Require", "100rel");

        Ok(Self {
            role,
            cancel_token: CancellationToken::new(),
            id: Mutex::new(id.clone()),
            from,
            to: Mutex::new(to),
            local_seq: AtomicU32::new(cseq),
            remote_uri: Mutex::new(remote_uri),
            remote_seq: AtomicU32::new(0),
            route_set: Mutex::new(route_set),
            endpoint_inner,
            state_sender,
            tu_sender,
            state: Mutex::new(DialogState::Calling(id)),
            initial_request: Mutex::new(initial_request),
            local_contact,
            remote_contact: Mutex::new(None),
            supports_100rel,
            remote_reliable: Mutex::new(None),
            local_reliable: Mutex::new(None),
            offer_placement: Mutex::new(OfferPlacement::default()),
            answer_builder: Mutex::new(None),
        })
    }

    /// Fix the offer placement for the current INVITE exchange. It
    /// reverts to [`OfferPlacement::InInvite`] once the ACK goes out.
    pub(super) fn set_offer_placement(&self, placement: OfferPlacement, answer: Option<AnswerFn>) {
        *self.offer_placement.lock().unwrap() = placement;
        *self.answer_builder.lock().unwrap() = answer;
    }

    pub fn can_cancel(&self) -> bool {
        self.state.lock().unwrap().can_cancel()
    }
    pub fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }
    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().is_terminated()
    }
    pub fn waiting_ack(&self) -> bool {
        self.state.lock().unwrap().waiting_ack()
    }
    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }
    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed);
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn update_remote_tag(&self, tag: &str) -> Result<()> {
        self.id.lock().unwrap().remote_tag = tag.to_string();

        if self.role == TransactionRole::Client {
            let mut to = self.to.lock().unwrap();
            *to = to.clone().with_tag(tag.into());
        }
        Ok(())
    }

    fn clear_remote_reliable(&self) {
        self.remote_reliable.lock().unwrap().take();
    }

    /// Turn a `Require: 100rel` provisional into the PRACK answering it.
    /// Retransmitted provisionals (same RSeq) get the cached PRACK back,
    /// stale ones (lower RSeq) get nothing.
    pub(super) fn prepare_prack_request(&self, resp: &Response) -> Result<Option<Request>> {
        if !header_contains_token(resp.headers(), "Require", "100rel") {
            return Ok(None);
        }

        let rseq = match parse_rseq_header(resp.headers()) {
            Some(rseq) => rseq,
            None => {
                warn!(
                    id = self.id.lock().unwrap().to_string(),
                    "received reliable provisional response without RSeq"
                );
                return Ok(None);
            }
        };

        let cseq_header = resp.cseq_header()?;
        let cseq = cseq_header.seq()?;
        let method = cseq_header.method()?;

        {
            let state_guard = self.remote_reliable.lock().unwrap();
            if let Some(state) = state_guard.as_ref() {
                if state.last_rseq == rseq {
                    return Ok(Some(state.prack_request.clone()));
                }

                if state.last_rseq > rseq {
                    return Ok(None);
                }
            }
        }

        let rack_value = format!("{} {} {}", rseq, cseq, method);
        let mut headers = vec![Header::Other("RAck".into(), rack_value)];
        if self.supports_100rel {
            headers.push(Header::Other("Supported".into(), "100rel".into()));
        }

        let prack_request = self.make_request(
            Method::PRack,
            Some(self.increment_local_seq()),
            None,
            None,
            Some(headers),
            None,
        )?;

        let state = RemoteReliableState {
            last_rseq: rseq,
            prack_request: prack_request.clone(),
        };

        {
            let mut state_guard = self.remote_reliable.lock().unwrap();
            *state_guard = Some(state);
        }

        Ok(Some(prack_request))
    }

    pub(super) async fn handle_provisional_response(&self, resp: &Response) -> Result<()> {
        let to_header = resp.to_header()?;
        if let Ok(Some(tag)) = to_header.tag() {
            self.update_remote_tag(tag.value())?;
        }

        if let Some(prack) = self.prepare_prack_request(resp)? {
            let _ = self.send_prack_request(prack).await?;
        }

        Ok(())
    }

    pub(super) async fn send_prack_request(&self, request: Request) -> Result<Option<Response>> {
        let method = request.method().to_owned();
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);

        if let Some(route) = tx.original.route_header() {
            if let Some(first_route) = route.typed().ok().and_then(|r| r.uris().first().cloned()) {
                tx.destination = SipAddr::try_from(&first_route.uri).ok();
            }
        }

        match tx.send().await {
            Ok(_) => {
                debug!(
                    id = self.id.lock().unwrap().to_string(),
                    method = %method,
                    destination = tx.destination.as_ref().map(|d| d.to_string()).as_deref(),
                    key = %tx.key,
                    "request sent done",
                );
            }
            Err(e) => {
                warn!(
                    id = self.id.lock().unwrap().to_string(),
                    destination = tx.destination.as_ref().map(|d| d.to_string()).as_deref(),
                    "failed to send request error: {}\n{}",
                    e,
                    tx.original
                );
                return Err(e);
            }
        }

        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Response(resp) => match resp.status_code {
                    StatusCode::Trying => continue,
                    _ => {
                        return Ok(Some(resp));
                    }
                },
                _ => break,
            }
        }
        Ok(None)
    }

    /// Point subsequent in-dialog requests at a new remote target, e.g.
    /// after a re-INVITE moved the peer's Contact.
    pub fn set_remote_target(
        &self,
        uri: rsip::Uri,
        contact: Option<rsip::headers::untyped::Contact>,
    ) {
        *self.remote_uri.lock().unwrap() = uri;
        *self.remote_contact.lock().unwrap() = contact;
    }

    /// Client dialogs learn their route set from the Record-Route of the
    /// dialog-forming response (RFC 3261 12.1.2), reversed so in-dialog
    /// requests retrace the proxy chain.
    pub(crate) fn update_route_set_from_response(&self, resp: &Response) {
        if !matches!(self.role, TransactionRole::Client) {
            return;
        }

        let mut new_route_set: Vec<Route> = resp
            .headers()
            .iter()
            .filter_map(|header| match header {
                Header::RecordRoute(rr) => Some(Route::from(rr.value())),
                _ => None,
            })
            .collect();

        new_route_set.reverse();
        *self.route_set.lock().unwrap() = new_route_set;
    }

    /// CANCEL and ACK reuse the INVITE's Via with a fresh branch.
    pub(super) fn build_vias_from_request(&self) -> Result<Vec<Via>> {
        let mut vias = vec![];
        let initial_request = self
            .initial_request
            .lock()
            .expect("build vias from request poisoned mutex");
        for header in initial_request.headers.iter() {
            if let Header::Via(via) = header {
                if let Ok(mut typed_via) = via.typed() {
                    for param in typed_via.params.iter_mut() {
                        if let Param::Branch(_) = param {
                            *param = make_via_branch();
                        }
                    }
                    vias.push(typed_via);
                    return Ok(vias);
                }
            }
        }
        let via = self.endpoint_inner.get_via(None, None)?;
        vias.push(via);
        Ok(vias)
    }

    pub(super) fn make_request_with_vias(
        &self,
        method: rsip::Method,
        cseq: Option<u32>,
        vias: Vec<rsip::headers::typed::Via>,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<rsip::Request> {
        let mut headers = headers.unwrap_or_default();
        let cseq_header = CSeq {
            seq: cseq.unwrap_or_else(|| self.increment_local_seq()),
            method,
        };

        for via in vias {
            headers.push(Header::Via(via.into()));
        }
        headers.push(Header::CallId(
            self.id.lock().unwrap().call_id.clone().into(),
        ));

        let to = self
            .to
            .lock()
            .unwrap()
            .clone()
            .untyped()
            .value()
            .to_string();

        let from = self.from.clone().untyped().value().to_string();
        match self.role {
            TransactionRole::Client => {
                headers.push(Header::From(from.into()));
                headers.push(Header::To(to.into()));
            }
            TransactionRole::Server => {
                headers.push(Header::From(to.into()));
                headers.push(Header::To(from.into()));
            }
        }
        headers.push(Header::CSeq(cseq_header.into()));
        headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));

        self.local_contact
            .as_ref()
            .map(|c| headers.push(Contact::from(c.clone()).into()));

        {
            let route_set = self.route_set.lock().unwrap();
            headers.extend(route_set.iter().cloned().map(Header::Route));
        }
        headers.push(Header::MaxForwards(70.into()));

        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        let req = rsip::Request {
            method,
            uri: self.remote_uri.lock().unwrap().clone(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        };
        Ok(req)
    }

    pub(super) fn make_request(
        &self,
        method: rsip::Method,
        cseq: Option<u32>,
        addr: Option<crate::transport::SipAddr>,
        branch: Option<Param>,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<rsip::Request> {
        let via = self.endpoint_inner.get_via(addr, branch)?;
        self.make_request_with_vias(method, cseq, vec![via], headers, body)
    }

    /// Response builder mirroring the request: Via/From/CSeq/Call-ID and
    /// Record-Route echoed, To tagged with our local tag except on 100.
    pub(super) fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> rsip::Response {
        let mut resp_headers = rsip::Headers::default();

        for header in request.headers.iter() {
            match header {
                Header::Via(via) => {
                    resp_headers.push(Header::Via(via.clone()));
                }
                Header::From(from) => {
                    resp_headers.push(Header::From(from.clone()));
                }
                Header::To(to) => {
                    let mut to = match to.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            info!(error = %e, "error parsing to header");
                            continue;
                        }
                    };

                    if status != StatusCode::Trying
                        && !to.params.iter().any(|p| matches!(p, Param::Tag(_)))
                    {
                        to.params.push(rsip::Param::Tag(
                            self.id.lock().unwrap().local_tag.clone().into(),
                        ));
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                Header::CSeq(cseq) => {
                    resp_headers.push(Header::CSeq(cseq.clone()));
                }
                Header::CallId(call_id) => {
                    resp_headers.push(Header::CallId(call_id.clone()));
                }
                Header::RecordRoute(rr) => {
                    resp_headers.push(Header::RecordRoute(rr.clone()));
                }
                _ => {}
            }
        }

        self.local_contact
            .as_ref()
            .map(|c| resp_headers.push(Contact::from(c.clone()).into()));

        if let Some(headers) = headers {
            for header in headers {
                resp_headers.unique_push(header);
            }
        }

        resp_headers.retain(|h| !matches!(h, Header::ContentLength(_) | Header::UserAgent(_)));

        resp_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        resp_headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));

        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: request.version().clone(),
        }
    }

    async fn send_dialog_request(&self, request: Request) -> Result<Option<Response>> {
        let method = request.method().to_owned();
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);

        if matches!(method, Method::Cancel) {
            self.remote_uri
                .lock()
                .map(|guard| {
                    tx.destination = SipAddr::try_from(&*guard).ok();
                })
                .ok();
        }

        if let Some(route) = tx.original.route_header() {
            if let Some(first_route) = route.typed().ok().and_then(|r| r.uris().first().cloned()) {
                tx.destination = SipAddr::try_from(&first_route.uri).ok();
            }
        }
        match tx.send().await {
            Ok(_) => {
                debug!(
                    id = self.id.lock().unwrap().to_string(),
                    method = %method,
                    destination = tx.destination.as_ref().map(|d| d.to_string()).as_deref(),
                    key = %tx.key,
                    "request sent done",
                );
            }
            Err(e) => {
                warn!(
                    id = self.id.lock().unwrap().to_string(),
                    destination = tx.destination.as_ref().map(|d| d.to_string()).as_deref(),
                    "failed to send request error: {}\n{}",
                    e,
                    tx.original
                );
                return Err(e);
            }
        }
        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Response(resp) => {
                    let status = resp.status_code.clone();
                    if status == StatusCode::Trying {
                        continue;
                    }

                    if status.kind() == StatusCodeKind::Provisional {
                        if method == Method::Invite {
                            self.handle_provisional_response(&resp).await?;
                        }
                        self.transition(DialogState::Early(
                            self.id.lock().unwrap().clone(),
                            resp,
                        ))?;
                        continue;
                    }

                    debug!(
                        id = self.id.lock().unwrap().to_string(),
                        method = %method,
                        "dialog do_request done: {:?}", status
                    );
                    // A final response to anything but our PRACK means the
                    // reliable provisional exchange is over.
                    if !matches!(method, Method::PRack) {
                        self.clear_remote_reliable();
                    }
                    return Ok(Some(resp));
                }
                _ => break,
            }
        }
        Ok(None)
    }

    pub(super) async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        self.send_dialog_request(request).boxed().await
    }

    /// Publish the state to the application, then store it. Notification
    /// states pass through without being stored; a terminated dialog
    /// stays terminated; a late WaitAck cannot demote Confirmed.
    pub(super) fn transition(&self, state: DialogState) -> Result<()> {
        self.state_sender.send(state.clone()).ok();

        match state {
            DialogState::Updated(_, _, _)
            | DialogState::Info(_, _, _)
            | DialogState::Options(_, _, _) => {
                return Ok(());
            }
            _ => {}
        }
        let mut old_state = self.state.lock().unwrap();
        match (&*old_state, &state) {
            (DialogState::Terminated(id, _), _) => {
                warn!(
                    id = %id,
                    target = %state,
                    "dialog already terminated, ignoring transition"
                );
                return Ok(());
            }
            (DialogState::Confirmed(_, _), DialogState::WaitAck(_, _)) => {
                warn!(target = %state, "dialog already confirmed, ignoring transition");
                return Ok(());
            }
            _ => {}
        }
        debug!(from = %old_state, to = %state, "transitioning state");
        *old_state = state;
        Ok(())
    }

    /// Drive a server transaction from a [`TransactionHandle`] until the
    /// application sends a final response. No final response within
    /// 64*T1 (or a dropped handle) answers 501.
    pub async fn process_transaction_handle(
        &self,
        tx: &mut Transaction,
        mut rx: TransactionCommandReceiver,
    ) -> Result<()> {
        let timeout_duration = self.endpoint_inner.option.t1x64;
        let result = tokio::time::timeout(timeout_duration, async {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    TransactionCommand::Respond {
                        status,
                        headers,
                        body,
                    } => {
                        let is_final = status.kind() != StatusCodeKind::Provisional;
                        let response = self.make_response(&tx.original, status, headers, body);
                        tx.respond(response).await?;

                        if is_final {
                            return Ok(());
                        }
                    }
                }
            }
            Err(crate::Error::TransactionError(
                "User dropped handle without final response".into(),
                tx.key.clone(),
            ))
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                let id = self.id.lock().unwrap().to_string();
                warn!(
                    id,
                    "{} handle dropped or timed out without final reply, returning 501",
                    tx.original.method,
                );
                tx.reply(StatusCode::NotImplemented).await
            }
        }
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Calling(id) => write!(f, "{}(Calling)", id),
            DialogState::Trying(id) => write!(f, "{}(Trying)", id),
            DialogState::Early(id, _) => write!(f, "{}(Early)", id),
            DialogState::WaitAck(id, _) => write!(f, "{}(WaitAck)", id),
            DialogState::Confirmed(id, _) => write!(f, "{}(Confirmed)", id),
            DialogState::Updated(id, _, _) => write!(f, "{}(Updated)", id),
            DialogState::Info(id, _, _) => write!(f, "{}(Info)", id),
            DialogState::Options(id, _, _) => write!(f, "{}(Options)", id),
            DialogState::Terminated(id, reason) => write!(f, "{}(Terminated {:?})", id, reason),
        }
    }
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        match self {
            Dialog::ServerInvite(d) => d.inner.id.lock().unwrap().clone(),
            Dialog::ClientInvite(d) => d.inner.id.lock().unwrap().clone(),
        }
    }

    pub fn state(&self) -> DialogState {
        match self {
            Dialog::ServerInvite(d) => d.state(),
            Dialog::ClientInvite(d) => d.state(),
        }
    }

    pub fn from(&self) -> &rsip::typed::From {
        match self {
            Dialog::ServerInvite(d) => &d.inner.from,
            Dialog::ClientInvite(d) => &d.inner.from,
        }
    }

    pub fn to(&self) -> rsip::typed::To {
        match self {
            Dialog::ServerInvite(d) => d.inner.to.lock().unwrap().clone(),
            Dialog::ClientInvite(d) => d.inner.to.lock().unwrap().clone(),
        }
    }

    pub(super) fn from_inner(role: TransactionRole, inner: DialogInnerRef) -> Self {
        match role {
            TransactionRole::Client => Dialog::ClientInvite(ClientInviteDialog { inner }),
            TransactionRole::Server => Dialog::ServerInvite(ServerInviteDialog { inner }),
        }
    }

    pub fn remote_contact(&self) -> Option<rsip::Uri> {
        let inner = match self {
            Dialog::ServerInvite(d) => &d.inner,
            Dialog::ClientInvite(d) => &d.inner,
        };
        let contact = inner.remote_contact.lock().unwrap();
        contact
            .as_ref()
            .and_then(|c| extract_uri_from_contact(c.value()).ok())
    }

    pub fn set_remote_target(
        &self,
        uri: rsip::Uri,
        contact: Option<rsip::headers::untyped::Contact>,
    ) {
        match self {
            Dialog::ServerInvite(d) => d.inner.set_remote_target(uri, contact),
            Dialog::ClientInvite(d) => d.inner.set_remote_target(uri, contact),
        }
    }

    pub async fn handle(&mut self, tx: &mut Transaction) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.handle(tx).await,
            Dialog::ClientInvite(d) => d.handle(tx).await,
        }
    }

    /// Send an arbitrary in-dialog request and wait for its final
    /// response. The dialog must be confirmed.
    pub async fn request(
        &self,
        method: rsip::Method,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Option<rsip::Response>> {
        match self {
            Dialog::ServerInvite(d) => d.request(method, headers, body).await,
            Dialog::ClientInvite(d) => d.request(method, headers, body).await,
        }
    }

    /// Graceful teardown appropriate for the current state: CANCEL while
    /// still establishing, BYE once confirmed.
    pub async fn hangup(&self) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.bye().await,
            Dialog::ClientInvite(d) => d.hangup().await,
        }
    }

    pub fn can_cancel(&self) -> bool {
        match self {
            Dialog::ServerInvite(d) => d.inner.can_cancel(),
            Dialog::ClientInvite(d) => d.inner.can_cancel(),
        }
    }

    /// Called by the dialog layer when the dialog is dropped from the
    /// registry; stops whatever the dialog still has in flight.
    pub fn on_remove(&self) {
        match self {
            Dialog::ServerInvite(d) => d.inner.cancel_token.cancel(),
            Dialog::ClientInvite(d) => d.inner.cancel_token.cancel(),
        }
    }
}
