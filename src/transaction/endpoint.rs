use super::key::{TransactionKey, TransactionRole};
use super::timer::Timer;
use super::transaction::{
    Transaction, TransactionEvent, TransactionEventSender, TransactionReceiver, TransactionSender,
    TransactionTimer,
};
use super::{make_call_id, make_via_branch, T1, T1X64, T2, T4};
use crate::rsip_ext::RsipResponseExt;
use crate::transport::{SipAddr, SipConnection, TransportEvent, TransportLayer};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Param, Request, Response, SipMessage, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const USER_AGENT: &str = concat!("sipline/", env!("CARGO_PKG_VERSION"));

/// Tunables shared by every transaction the endpoint runs.
///
/// The `t*` values are the RFC 3261 timer bases. `t1x64` is both the
/// transaction timeout and the lifetime of a finished transaction's
/// retransmission record.
#[derive(Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub t1x64: Duration,
    /// Granularity of the timer wheel poll.
    pub timer_interval: Duration,
    /// Answer incoming INVITE with 100 Trying before the transaction
    /// user sees the transaction.
    pub auto_trying: bool,
    /// Methods advertised in Allow headers.
    pub allows: Vec<Method>,
    /// Appended to generated Call-IDs as `random@suffix`.
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: T1,
            t2: T2,
            t4: T4,
            t1x64: T1X64,
            timer_interval: Duration::from_millis(20),
            auto_trying: true,
            allows: vec![
                Method::Invite,
                Method::Ack,
                Method::Cancel,
                Method::Bye,
                Method::Options,
                Method::Info,
                Method::Update,
                Method::PRack,
            ],
            callid_suffix: None,
        }
    }
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// Shared core of the endpoint. Transactions keep a reference to it for
/// timers, transport lookup and message building; the serve loop owns
/// dispatch of incoming messages to live transactions.
pub struct EndpointInner {
    pub user_agent: String,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    pub option: EndpointOption,

    /// Live transactions by key. The sender feeds the transaction's
    /// event loop.
    pub tu_senders: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    /// Transactions that have sent or absorbed their final response.
    /// `Some` is replayed when the peer retransmits into the dead
    /// transaction, `None` absorbs silently. Entries are purged by the
    /// wait timers of RFC 3261 section 17.
    pub finished_transactions: Mutex<HashMap<TransactionKey, Option<SipMessage>>>,
    incoming_sender: Mutex<Option<TransactionSender>>,
}

/// A SIP endpoint: one transport layer, one timer wheel, any number of
/// client and server transactions.
///
/// ```no_run
/// # use sipline::transport::TransportLayer;
/// # use sipline::EndpointBuilder;
/// # use tokio_util::sync::CancellationToken;
/// let token = CancellationToken::new();
/// let transport_layer = TransportLayer::new(token.child_token());
/// let endpoint = EndpointBuilder::new()
///     .with_cancel_token(token)
///     .with_transport_layer(transport_layer)
///     .build();
/// ```
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    option: Option<EndpointOption>,
}

impl EndpointInner {
    /// Run the endpoint: serve registered transports, poll the timer
    /// wheel and dispatch every incoming message. Returns when the
    /// cancel token fires or the transport layer closes.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let mut transport_rx = self.transport_layer.inner.take_receiver()?;
        self.transport_layer.serve_listens().await?;

        let mut timer_interval = tokio::time::interval(self.option.timer_interval);
        info!(user_agent = %self.user_agent, "endpoint serving");

        loop {
            select! {
                _ = self.cancel_token.cancelled() => {
                    info!("endpoint cancelled");
                    break;
                }
                _ = timer_interval.tick() => {
                    self.process_timers().await;
                }
                event = transport_rx.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = EndpointInner::on_transport_event(&self, event).await {
                                warn!("error handling transport event: {}", e);
                            }
                        }
                        None => {
                            warn!("transport layer closed");
                            break;
                        }
                    }
                }
            }
        }
        self.tu_senders.lock().unwrap().clear();
        Ok(())
    }

    /// Fire due timers. Retransmission timers of live transactions are
    /// forwarded to their event loops; timers of finished transactions
    /// are handled here because nobody polls those anymore.
    async fn process_timers(&self) {
        for t in self.timers.poll(Instant::now()) {
            match t {
                TransactionTimer::TimerG(key, duration) => {
                    self.retransmit_final(&key, duration).await;
                }
                TransactionTimer::TimerCleanup(_)
                | TransactionTimer::TimerD(_)
                | TransactionTimer::TimerH(_)
                | TransactionTimer::TimerI(_)
                | TransactionTimer::TimerJ(_)
                | TransactionTimer::TimerK(_)
                | TransactionTimer::TimerL(_) => {
                    let key = t.key().clone();
                    trace!(%key, timer = %t, "clearing finished transaction");
                    self.finished_transactions.lock().unwrap().remove(&key);
                    // The owner may still be waiting on the transaction;
                    // let it observe the end of the wait period.
                    let sender = self.tu_senders.lock().unwrap().get(&key).cloned();
                    if let Some(sender) = sender {
                        sender.send(TransactionEvent::Timer(t)).ok();
                    }
                }
                _ => {
                    let sender = self.tu_senders.lock().unwrap().get(t.key()).cloned();
                    if let Some(sender) = sender {
                        sender.send(TransactionEvent::Timer(t)).ok();
                    }
                }
            }
        }
    }

    /// Timer G: replay the parked final response and re-arm with the
    /// interval doubled up to T2. A `None` record means the final was
    /// acknowledged, which stops the retransmissions.
    async fn retransmit_final(&self, key: &TransactionKey, duration: Duration) {
        let parked = self.finished_transactions.lock().unwrap().get(key).cloned();
        let msg = match parked {
            Some(Some(msg)) => msg,
            _ => return,
        };
        debug!(%key, "retransmitting final response");
        if let Err(e) = self.send_parked(msg).await {
            warn!(%key, "error retransmitting final response: {}", e);
        }
        let next = (duration * 2).min(self.option.t2);
        self.timers
            .timeout(next, TransactionTimer::TimerG(key.clone(), next));
    }

    async fn send_parked(&self, msg: SipMessage) -> Result<()> {
        let target = SipAddr::from(SipConnection::get_destination(&msg)?);
        let connection = self.transport_layer.lookup(&target).await?;
        connection.send(msg, Some(&target)).await
    }

    async fn on_transport_event(inner: &EndpointInnerRef, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Incoming(msg, connection, source) => match msg {
                SipMessage::Request(req) => {
                    EndpointInner::on_incoming_request(inner, req, connection, source).await
                }
                SipMessage::Response(resp) => inner.on_incoming_response(resp, connection).await,
            },
            TransportEvent::New(connection) => {
                debug!(%connection, "new connection");
                Ok(())
            }
            TransportEvent::Closed(connection) => {
                debug!(%connection, "connection closed");
                Ok(())
            }
        }
    }

    async fn on_incoming_request(
        inner: &EndpointInnerRef,
        req: Request,
        connection: SipConnection,
        source: SipAddr,
    ) -> Result<()> {
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
        trace!(%key, %source, method = %req.method, "incoming request");

        // Live transaction gets the message: retransmissions, the
        // non-2xx ACK and anything else that matches its signature.
        let sender = inner.tu_senders.lock().unwrap().get(&key).cloned();
        if let Some(sender) = sender {
            sender
                .send(TransactionEvent::Received(
                    SipMessage::Request(req),
                    Some(connection),
                ))
                .map_err(|e| Error::TransactionError(e.to_string(), key))?;
            return Ok(());
        }

        // Finished transaction: the non-2xx ACK stops the final response
        // retransmissions, anything else replays the parked final. A 2xx
        // is not replayed on INVITE retransmissions; timer G already
        // drives those.
        let parked = inner.finished_transactions.lock().unwrap().get(&key).cloned();
        if let Some(parked) = parked {
            if req.method == Method::Ack {
                debug!(%key, "ack received for finished transaction");
                inner
                    .finished_transactions
                    .lock()
                    .unwrap()
                    .insert(key, None);
                return Ok(());
            }
            match parked {
                Some(SipMessage::Response(ref resp))
                    if req.method == Method::Invite
                        && resp.status_code.kind() == rsip::StatusCodeKind::Successful =>
                {
                    trace!(%key, "absorbing invite retransmission in accepted state");
                }
                Some(msg) => {
                    debug!(%key, "replaying final response for retransmission");
                    connection.send(msg, None).await?;
                }
                None => {
                    trace!(%key, "absorbing retransmission of finished transaction");
                }
            }
            return Ok(());
        }

        match req.method {
            // CANCEL is answered by the INVITE transaction it targets,
            // or statelessly with 481 when that transaction is gone.
            Method::Cancel => {
                let invite_key = key.with_method(Method::Invite);
                let sender = inner.tu_senders.lock().unwrap().get(&invite_key).cloned();
                match sender {
                    Some(sender) => {
                        debug!(%invite_key, "routing cancel to invite transaction");
                        sender
                            .send(TransactionEvent::Received(
                                SipMessage::Request(req),
                                Some(connection),
                            ))
                            .map_err(|e| Error::TransactionError(e.to_string(), invite_key))?;
                    }
                    None => {
                        debug!(%key, "cancel without matching transaction, answering 481");
                        let resp = inner.make_response(
                            &req,
                            StatusCode::CallTransactionDoesNotExist,
                            None,
                        );
                        connection.send(resp.into(), None).await?;
                    }
                }
                Ok(())
            }
            // The ACK for a 2xx opens a fresh branch, so it can only be
            // matched by the dialog identity of the INVITE transaction.
            Method::Ack => {
                match inner.correlate_ack(&key) {
                    Some(sender) => {
                        debug!(%key, "correlated 2xx ack to invite transaction");
                        sender
                            .send(TransactionEvent::Received(
                                SipMessage::Request(req),
                                Some(connection),
                            ))
                            .map_err(|e| Error::TransactionError(e.to_string(), key))?;
                    }
                    None => {
                        debug!(%key, "dropping ack without matching transaction");
                    }
                }
                Ok(())
            }
            _ => EndpointInner::on_new_server_transaction(inner, key, req, connection).await,
        }
    }

    /// Find the INVITE server transaction belonging to an ACK whose
    /// branch does not match any transaction directly.
    fn correlate_ack(&self, ack_key: &TransactionKey) -> Option<TransactionEventSender> {
        let ack = match ack_key {
            TransactionKey::RFC3261(ack) => ack,
            _ => return None,
        };
        let senders = self.tu_senders.lock().unwrap();
        for (key, sender) in senders.iter() {
            if let TransactionKey::RFC3261(candidate) = key {
                if candidate.role == TransactionRole::Server
                    && candidate.method == Method::Invite
                    && candidate.cseq == ack.cseq
                    && candidate.call_id == ack.call_id
                    && candidate.from_tag == ack.from_tag
                {
                    return Some(sender.clone());
                }
            }
        }
        None
    }

    async fn on_new_server_transaction(
        inner: &EndpointInnerRef,
        key: TransactionKey,
        req: Request,
        connection: SipConnection,
    ) -> Result<()> {
        let incoming = inner.incoming_sender.lock().unwrap().clone();
        let sender = match incoming {
            Some(sender) => sender,
            None => {
                debug!(%key, "no transaction user attached, answering 503");
                let resp = inner.make_response(&req, StatusCode::ServiceUnavailable, None);
                return connection.send(resp.into(), None).await;
            }
        };

        let method = req.method;
        let mut tx = Transaction::new_server(key.clone(), req, inner.clone(), Some(connection));
        if method == Method::Invite && inner.option.auto_trying {
            if let Err(e) = tx.send_trying().await {
                warn!(%key, "error sending trying: {}", e);
            }
        }
        sender
            .send(tx)
            .map_err(|e| Error::TransactionError(e.to_string(), key))
    }

    async fn on_incoming_response(
        &self,
        resp: Response,
        connection: SipConnection,
    ) -> Result<()> {
        let key = TransactionKey::from_response(&resp)?;
        trace!(%key, status = %resp.status_code, "incoming response");

        let sender = self.tu_senders.lock().unwrap().get(&key).cloned();
        if let Some(sender) = sender {
            return sender
                .send(TransactionEvent::Received(
                    SipMessage::Response(resp),
                    Some(connection),
                ))
                .map_err(|e| Error::TransactionError(e.to_string(), key));
        }

        // A retransmitted final for a finished INVITE client transaction
        // is answered with the parked ACK.
        let parked = self.finished_transactions.lock().unwrap().get(&key).cloned();
        if let Some(Some(msg)) = parked {
            debug!(%key, "replaying ack for retransmitted final response");
            return connection.send(msg, None).await;
        }

        debug!(%key, status = %resp.status_code, "dropping response without transaction");
        Ok(())
    }

    pub fn attach_transaction(&self, key: &TransactionKey, tu_sender: TransactionEventSender) {
        trace!(%key, "attach transaction");
        self.tu_senders
            .lock()
            .unwrap()
            .insert(key.clone(), tu_sender);
    }

    /// Remove a transaction from dispatch. When a message is given it is
    /// parked so retransmissions keep getting answered until the cleanup
    /// timer fires.
    pub fn detach_transaction(&self, key: &TransactionKey, last_message: Option<SipMessage>) {
        trace!(%key, "detach transaction");
        self.tu_senders.lock().unwrap().remove(key);

        if let Some(msg) = last_message {
            self.timers.timeout(
                self.option.t1x64,
                TransactionTimer::TimerCleanup(key.clone()),
            );
            self.finished_transactions
                .lock()
                .unwrap()
                .insert(key.clone(), Some(msg));
        }
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.transport_layer.get_addrs()
    }

    /// Build a Via for an outgoing request. `addr` picks the transport,
    /// defaulting to the first one; `branch` defaults to a fresh one.
    pub fn get_via(
        &self,
        addr: Option<SipAddr>,
        branch: Option<Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = addr
            .or_else(|| self.get_addrs().into_iter().next())
            .ok_or_else(|| {
                Error::EndpointError("no transport available for via".to_string())
            })?;

        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.r#type.unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: addr.addr.clone(),
                ..Default::default()
            },
            params: vec![
                branch.unwrap_or_else(make_via_branch),
                Param::Other(rsip::param::OtherParam::new("rport"), None),
            ],
        })
    }

    /// Build a bare request with the headers every request carries. The
    /// caller adds Contact, Content-Type and the rest.
    pub fn make_request(
        &self,
        method: Method,
        recipient: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
        call_id: Option<rsip::headers::CallId>,
    ) -> Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(
                call_id
                    .unwrap_or_else(|| make_call_id(self.option.callid_suffix.as_deref())),
            ),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];

        Request {
            method,
            uri: recipient,
            headers: headers.into(),
            version: rsip::Version::V2,
            body: Default::default(),
        }
    }

    /// Build a response echoing the request's Via/From/To/Call-ID/CSeq,
    /// without any dialog state. Used for stateless replies; dialogs
    /// build their own responses with the local tag.
    pub fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(v) => headers.push(Header::Via(v.clone())),
                Header::From(v) => headers.push(Header::From(v.clone())),
                Header::To(v) => headers.push(Header::To(v.clone())),
                Header::CallId(v) => headers.push(Header::CallId(v.clone())),
                Header::CSeq(v) => headers.push(Header::CSeq(v.clone())),
                Header::RecordRoute(v) => headers.push(Header::RecordRoute(v.clone())),
                _ => {}
            }
        }
        headers.push(Header::UserAgent(self.user_agent.clone().into()));
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Response {
            status_code: status,
            headers,
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        }
    }

    /// Build the ACK for a 2xx response. The request line targets the
    /// remote Contact, the route set is the reversed Record-Route of the
    /// response, and the Via reuses the sent-by of the INVITE under a
    /// fresh branch. `destination` overrides the Contact host when the
    /// peer advertised an outbound flow ("ob" parameter). `body` carries
    /// the session answer when the offer arrived in the 2xx.
    pub fn make_ack(
        &self,
        response: &Response,
        headers: Option<Vec<Header>>,
        destination: Option<&SipAddr>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let uri = response.remote_uri(destination)?;

        let mut via = response.via_header()?.typed()?;
        for param in via.params.iter_mut() {
            if let Param::Branch(_) = param {
                *param = make_via_branch();
            }
        }

        let cseq = response.cseq_header()?.typed()?;

        let mut ack_headers = headers.unwrap_or_default();
        ack_headers.push(Header::Via(via.into()));
        ack_headers.push(Header::CallId(response.call_id_header()?.clone()));
        ack_headers.push(Header::From(response.from_header()?.clone()));
        ack_headers.push(Header::To(response.to_header()?.clone()));
        ack_headers.push(Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq.seq,
                method: Method::Ack,
            }
            .into(),
        ));
        ack_headers.push(Header::MaxForwards(70.into()));
        ack_headers.push(Header::UserAgent(self.user_agent.clone().into()));

        let mut routes: Vec<Header> = response
            .headers
            .iter()
            .filter_map(|header| match header {
                Header::RecordRoute(rr) => {
                    Some(Header::Route(rsip::headers::Route::from(rr.value())))
                }
                _ => None,
            })
            .collect();
        routes.reverse();
        ack_headers.extend(routes);
        if body.is_some() {
            let content_type = response
                .headers
                .iter()
                .find_map(|h| match h {
                    Header::ContentType(ct) => Some(ct.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "application/sdp".to_string().into());
            ack_headers.push(Header::ContentType(content_type));
        }
        ack_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Ok(Request {
            method: Method::Ack,
            uri,
            headers: ack_headers.into(),
            version: rsip::Version::V2,
            body: body.unwrap_or_default(),
        })
    }
}

impl Endpoint {
    /// Serve until shutdown. Most callers spawn `inner.serve()` instead
    /// to keep ownership of the endpoint handle.
    pub async fn serve(&self) {
        let inner = self.inner.clone();
        if let Err(e) = inner.serve().await {
            warn!("endpoint serve error: {}", e);
        }
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.inner.cancel_token.cancel();
    }

    /// Receive the server transactions created for incoming requests.
    /// There is exactly one consumer; a second call fails.
    pub fn incoming_transactions(&self) -> Result<TransactionReceiver> {
        let (tx, rx) = unbounded_channel();
        let mut sender = self.inner.incoming_sender.lock().unwrap();
        if sender.is_some() {
            return Err(Error::EndpointError(
                "incoming transactions receiver already taken".to_string(),
            ));
        }
        *sender = Some(tx);
        Ok(rx)
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.get_addrs()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: USER_AGENT.to_string(),
            transport_layer: None,
            cancel_token: None,
            option: None,
        }
    }

    pub fn with_user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn with_transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn with_option(&mut self, option: EndpointOption) -> &mut Self {
        self.option.replace(option);
        self
    }

    pub fn with_timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        let mut option = self.option.take().unwrap_or_default();
        option.timer_interval = timer_interval;
        self.option.replace(option);
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));

        let inner = EndpointInner {
            user_agent: self.user_agent.clone(),
            timers: Timer::new(),
            transport_layer,
            cancel_token,
            option: self.option.take().unwrap_or_default(),
            tu_senders: Mutex::new(HashMap::new()),
            finished_transactions: Mutex::new(HashMap::new()),
            incoming_sender: Mutex::new(None),
        };

        Endpoint {
            inner: Arc::new(inner),
        }
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}
