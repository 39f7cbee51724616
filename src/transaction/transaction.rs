use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionReceiver = UnboundedReceiver<Transaction>;
pub type TransactionSender = UnboundedSender<Transaction>;

/// Events fed into a transaction's loop: messages dispatched by the
/// endpoint, fired timers, and responses the transaction user queued
/// from synchronous code.
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Respond(Response),
    Terminate,
}

/// RFC 3261 section 17 timers, each carrying the key of the transaction
/// it belongs to. A, B, E and F drive a live transaction; the rest act
/// on the endpoint's record of a finished one.
#[derive(Debug, Clone)]
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey, Duration),
    TimerF(TransactionKey),
    TimerG(TransactionKey, Duration),
    TimerH(TransactionKey),
    TimerI(TransactionKey),
    TimerJ(TransactionKey),
    TimerK(TransactionKey),
    TimerL(TransactionKey),
    TimerCleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerL(key)
            | TransactionTimer::TimerCleanup(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerA(key, duration) => {
                write!(f, "TimerA({}, {})", key, duration.as_millis())
            }
            TransactionTimer::TimerB(key) => write!(f, "TimerB({})", key),
            TransactionTimer::TimerD(key) => write!(f, "TimerD({})", key),
            TransactionTimer::TimerE(key, duration) => {
                write!(f, "TimerE({}, {})", key, duration.as_millis())
            }
            TransactionTimer::TimerF(key) => write!(f, "TimerF({})", key),
            TransactionTimer::TimerG(key, duration) => {
                write!(f, "TimerG({}, {})", key, duration.as_millis())
            }
            TransactionTimer::TimerH(key) => write!(f, "TimerH({})", key),
            TransactionTimer::TimerI(key) => write!(f, "TimerI({})", key),
            TransactionTimer::TimerJ(key) => write!(f, "TimerJ({})", key),
            TransactionTimer::TimerK(key) => write!(f, "TimerK({})", key),
            TransactionTimer::TimerL(key) => write!(f, "TimerL({})", key),
            TransactionTimer::TimerCleanup(key) => write!(f, "TimerCleanup({})", key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Client transaction built but not sent yet.
    Nothing,
    Calling,
    Trying,
    Proceeding,
    Completed,
    /// INVITE transaction that has sent or received a 2xx (RFC 6026).
    Accepted,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// A single RFC 3261 transaction.
///
/// Client side: build with [`Transaction::new_client`], call `send`,
/// then pull responses out of `receive` until the final one. A non-2xx
/// final to an INVITE is acknowledged automatically.
///
/// Server side: transactions arrive via
/// `Endpoint::incoming_transactions`. Answer with `respond` or `reply`;
/// `receive` yields the CANCEL or ACK requests routed to this
/// transaction.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    /// Explicit next hop. When unset the request line or route set
    /// decides where messages go.
    pub destination: Option<SipAddr>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,
    timer_retransmit: Option<u64>,
    timer_timeout: Option<u64>,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        state: TransactionState,
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        endpoint_inner.attach_transaction(&key, tu_sender.clone());
        trace!(%key, ?transaction_type, "transaction created");
        Transaction {
            transaction_type,
            key,
            original,
            state,
            endpoint_inner,
            connection,
            destination: None,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            timer_retransmit: None,
            timer_timeout: None,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(
            transaction_type,
            TransactionState::Nothing,
            key,
            original,
            endpoint_inner,
            connection,
        )
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        Transaction::new(
            transaction_type,
            TransactionState::Trying,
            key,
            original,
            endpoint_inner,
            connection,
        )
    }

    fn is_client(&self) -> bool {
        matches!(
            self.transaction_type,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }

    async fn connection(&mut self) -> Result<SipConnection> {
        if let Some(ref connection) = self.connection {
            return Ok(connection.clone());
        }
        let target = match self.destination {
            Some(ref destination) => destination.clone(),
            None => SipAddr::try_from(&self.original.uri)?,
        };
        let connection = self.endpoint_inner.transport_layer.lookup(&target).await?;
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Send the original request and arm the retransmission and timeout
    /// timers. Client transactions only.
    pub async fn send(&mut self) -> Result<()> {
        if !self.is_client() {
            return Err(Error::TransactionError(
                "send only applies to client transactions".to_string(),
                self.key.clone(),
            ));
        }

        let connection = self.connection().await?;
        connection
            .send(self.original.to_owned().into(), self.destination.as_ref())
            .await?;

        let option = &self.endpoint_inner.option;
        if !connection.is_reliable() {
            let t1 = option.t1;
            let timer = match self.transaction_type {
                TransactionType::ClientInvite => TransactionTimer::TimerA(self.key.clone(), t1),
                _ => TransactionTimer::TimerE(self.key.clone(), t1),
            };
            self.timer_retransmit = Some(self.endpoint_inner.timers.timeout(t1, timer));
        }
        let timer = match self.transaction_type {
            TransactionType::ClientInvite => TransactionTimer::TimerB(self.key.clone()),
            _ => TransactionTimer::TimerF(self.key.clone()),
        };
        self.timer_timeout = Some(self.endpoint_inner.timers.timeout(option.t1x64, timer));

        match self.transaction_type {
            TransactionType::ClientInvite => self.transition(TransactionState::Calling),
            _ => self.transition(TransactionState::Trying),
        }
    }

    /// Answer with `status` and no body. Server transactions only.
    pub async fn reply(&mut self, status: StatusCode) -> Result<()> {
        let response = self
            .endpoint_inner
            .make_response(&self.original, status, None);
        self.respond(response).await
    }

    /// Answer 100 Trying unless some response already went out.
    pub async fn send_trying(&mut self) -> Result<()> {
        if self.last_response.is_some() {
            return Ok(());
        }
        self.reply(StatusCode::Trying).await
    }

    /// Send a response. A final response moves the transaction into its
    /// wait state and parks the response with the endpoint so
    /// retransmissions keep being answered after the transaction is
    /// dropped.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.is_client() {
            return Err(Error::TransactionError(
                "respond only applies to server transactions".to_string(),
                self.key.clone(),
            ));
        }
        let connection = match self.connection {
            Some(ref connection) => connection.clone(),
            None => {
                return Err(Error::TransactionError(
                    "server transaction without connection".to_string(),
                    self.key.clone(),
                ))
            }
        };

        debug!(key = %self.key, status = %response.status_code, "sending response");
        connection.send(response.clone().into(), None).await?;

        let provisional = response.status_code.kind() == StatusCodeKind::Provisional;
        self.last_response = Some(response.clone());
        if provisional {
            return self.transition(TransactionState::Proceeding);
        }

        let option = &self.endpoint_inner.option;
        match self.transaction_type {
            TransactionType::ServerNonInvite => {
                // Timer J is zero on reliable transports: no
                // retransmissions to absorb, terminate at once.
                if connection.is_reliable() {
                    return self.transition(TransactionState::Terminated);
                }
                self.park_final(response.into());
                self.endpoint_inner
                    .timers
                    .timeout(option.t1x64, TransactionTimer::TimerJ(self.key.clone()));
                self.transition(TransactionState::Completed)
            }
            TransactionType::ServerInvite => {
                let accepted = response.status_code.kind() == StatusCodeKind::Successful;
                self.park_final(response.into());
                if !connection.is_reliable() {
                    let t1 = option.t1;
                    self.endpoint_inner
                        .timers
                        .timeout(t1, TransactionTimer::TimerG(self.key.clone(), t1));
                }
                if accepted {
                    self.endpoint_inner
                        .timers
                        .timeout(option.t1x64, TransactionTimer::TimerL(self.key.clone()));
                    self.transition(TransactionState::Accepted)
                } else {
                    self.endpoint_inner
                        .timers
                        .timeout(option.t1x64, TransactionTimer::TimerH(self.key.clone()));
                    self.transition(TransactionState::Completed)
                }
            }
            _ => Ok(()),
        }
    }

    fn park_final(&self, msg: SipMessage) {
        self.endpoint_inner
            .finished_transactions
            .lock()
            .unwrap()
            .insert(self.key.clone(), Some(msg));
    }

    /// Drive the transaction and hand messages to the transaction user:
    /// responses on the client side, CANCEL and ACK on the server side.
    /// Returns `None` once the transaction reached its end, or on
    /// timeout without a final response.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        if self.state == TransactionState::Terminated {
            return None;
        }
        while let Some(event) = self.tu_receiver.recv().await {
            let result = match event {
                TransactionEvent::Received(msg, connection) => {
                    if self.connection.is_none() {
                        self.connection = connection;
                    }
                    match msg {
                        SipMessage::Request(req) => self.on_received_request(req).await,
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    }
                }
                TransactionEvent::Timer(timer) => self.on_timer(timer).await,
                TransactionEvent::Respond(response) => {
                    self.respond(response).await.map(|_| None)
                }
                TransactionEvent::Terminate => {
                    self.transition(TransactionState::Terminated).map(|_| None)
                }
            };

            match result {
                Ok(Some(msg)) => return Some(msg),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %self.key, "error handling transaction event: {}", e);
                }
            }
            if self.state == TransactionState::Terminated {
                return None;
            }
        }
        None
    }

    async fn on_received_request(&mut self, req: Request) -> Result<Option<SipMessage>> {
        if self.is_client() {
            trace!(key = %self.key, method = %req.method, "client transaction ignoring request");
            return Ok(None);
        }

        match req.method {
            method if method == self.original.method => {
                // RFC 3261 17.2: a retransmission of the request replays
                // the most recent response in Proceeding and Completed.
                // Trying has nothing to replay yet; in Accepted the 2xx
                // is retransmitted by timer G, not by request arrival.
                let replay = matches!(
                    self.state,
                    TransactionState::Proceeding | TransactionState::Completed
                );
                if replay {
                    if let Some(last) = self.last_response.clone() {
                        if let Some(ref connection) = self.connection {
                            trace!(key = %self.key, "replaying response for retransmission");
                            connection.send(last.into(), None).await?;
                        }
                    }
                } else {
                    trace!(key = %self.key, state = ?self.state, "absorbing request retransmission");
                }
                Ok(None)
            }
            Method::Ack => {
                // Flipping the endpoint record to absorb-only stops the
                // final-response retransmissions; timer I clears it.
                debug!(key = %self.key, "ack received, confirming transaction");
                self.last_ack = Some(req.clone());
                if self.is_reliable_transport() {
                    // Timer I is zero on reliable transports.
                    self.transition(TransactionState::Terminated)?;
                    return Ok(Some(req.into()));
                }
                self.endpoint_inner
                    .finished_transactions
                    .lock()
                    .unwrap()
                    .insert(self.key.clone(), None);
                self.endpoint_inner.timers.timeout(
                    self.endpoint_inner.option.t4,
                    TransactionTimer::TimerI(self.key.clone()),
                );
                self.transition(TransactionState::Confirmed)?;
                Ok(Some(req.into()))
            }
            Method::Cancel => {
                // Answer the CANCEL here; the transaction user sees it
                // and rejects the INVITE with 487.
                debug!(key = %self.key, "cancel received");
                let resp = self
                    .endpoint_inner
                    .make_response(&req, StatusCode::OK, None);
                if let Some(ref connection) = self.connection {
                    connection.send(resp.into(), None).await?;
                }
                Ok(Some(req.into()))
            }
            method => {
                trace!(key = %self.key, %method, "ignoring request in server transaction");
                Ok(None)
            }
        }
    }

    async fn on_received_response(&mut self, resp: Response) -> Result<Option<SipMessage>> {
        if !self.is_client() {
            trace!(key = %self.key, "server transaction ignoring response");
            return Ok(None);
        }

        let live = matches!(
            self.state,
            TransactionState::Nothing
                | TransactionState::Calling
                | TransactionState::Trying
                | TransactionState::Proceeding
        );

        match resp.status_code.kind() {
            StatusCodeKind::Provisional => {
                if !live {
                    return Ok(None);
                }
                // Ignore exact retransmissions of a provisional.
                if self.last_response.as_ref() == Some(&resp) {
                    trace!(key = %self.key, "ignoring retransmitted provisional");
                    return Ok(None);
                }
                if self.transaction_type == TransactionType::ClientInvite {
                    // INVITE retransmissions stop at the first response.
                    // Non-INVITE keeps retransmitting at the capped
                    // interval until a final arrives.
                    self.cancel_retransmit();
                }
                self.last_response = Some(resp.clone());
                self.transition(TransactionState::Proceeding)?;
                Ok(Some(resp.into()))
            }
            StatusCodeKind::Successful => {
                if !live {
                    return Ok(None);
                }
                self.cancel_retransmit();
                self.cancel_timeout();
                self.last_response = Some(resp.clone());
                if self.transaction_type != TransactionType::ClientInvite {
                    self.absorb_remainder();
                }
                // A 2xx to an INVITE ends the transaction at once; the
                // ACK for it is the dialog's, addressed to the Contact
                // learned from the response.
                self.transition(TransactionState::Terminated)?;
                Ok(Some(resp.into()))
            }
            _ => {
                if !live {
                    // A retransmitted final failure is answered with the
                    // same ACK while timer D runs out.
                    if self.state == TransactionState::Completed {
                        if let (Some(ack), Some(connection)) =
                            (self.last_ack.clone(), self.connection.clone())
                        {
                            if !connection.is_reliable() {
                                trace!(key = %self.key, "re-acking retransmitted failure");
                                connection.send(ack.into(), self.destination.as_ref()).await?;
                            }
                        }
                    }
                    return Ok(None);
                }
                self.cancel_retransmit();
                self.cancel_timeout();
                self.last_response = Some(resp.clone());
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        self.send_ack_for_failure(&resp).await?;
                        // Timer D is zero on reliable transports.
                        if self.is_reliable_transport() {
                            self.transition(TransactionState::Terminated)?;
                        } else {
                            self.transition(TransactionState::Completed)?;
                        }
                    }
                    _ => {
                        self.absorb_remainder();
                        self.transition(TransactionState::Terminated)?;
                    }
                }
                Ok(Some(resp.into()))
            }
        }
    }

    /// ACK a non-2xx final within this transaction: same branch, same
    /// request line as the INVITE (RFC 3261 section 17.1.1.3).
    async fn send_ack_for_failure(&mut self, resp: &Response) -> Result<()> {
        let mut headers = vec![];
        for header in self.original.headers.iter() {
            match header {
                Header::Via(v) => headers.push(Header::Via(v.clone())),
                Header::From(v) => headers.push(Header::From(v.clone())),
                Header::CallId(v) => headers.push(Header::CallId(v.clone())),
                Header::Route(v) => headers.push(Header::Route(v.clone())),
                Header::MaxForwards(v) => headers.push(Header::MaxForwards(v.clone())),
                _ => {}
            }
        }
        // The To of the response carries the tag assigned by the peer.
        headers.push(Header::To(resp.to_header()?.clone()));
        let cseq = self.original.cseq_header()?.typed()?;
        headers.push(Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq.seq,
                method: Method::Ack,
            }
            .into(),
        ));
        headers.push(Header::ContentLength(0.into()));

        let ack = Request {
            method: Method::Ack,
            uri: self.original.uri.clone(),
            headers: headers.into(),
            version: rsip::Version::V2,
            body: Default::default(),
        };

        let connection = self.connection().await?;
        debug!(key = %self.key, "sending ack for non-2xx final");
        connection
            .send(ack.clone().into(), self.destination.as_ref())
            .await?;
        self.last_ack = Some(ack.clone());
        if connection.is_reliable() {
            return Ok(());
        }
        // Retransmitted finals are answered with this ACK until timer D.
        self.park_final(ack.into());
        self.endpoint_inner
            .timers
            .timeout(
                self.endpoint_inner.option.t1x64,
                TransactionTimer::TimerD(self.key.clone()),
            );
        Ok(())
    }

    fn is_reliable_transport(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(false)
    }

    /// Leave an absorb-only record behind so late retransmissions die
    /// quietly instead of spawning new transactions. Timer K clears it,
    /// and reliable transports need neither (timer K is zero there).
    fn absorb_remainder(&self) {
        if self.is_reliable_transport() {
            return;
        }
        self.endpoint_inner
            .finished_transactions
            .lock()
            .unwrap()
            .insert(self.key.clone(), None);
        self.endpoint_inner.timers.timeout(
            self.endpoint_inner.option.t4,
            TransactionTimer::TimerK(self.key.clone()),
        );
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<Option<SipMessage>> {
        match timer {
            TransactionTimer::TimerA(key, duration) => {
                if self.state == TransactionState::Calling {
                    trace!(%key, "timer A fired, retransmitting invite");
                    let connection = self.connection().await?;
                    connection
                        .send(self.original.to_owned().into(), self.destination.as_ref())
                        .await?;
                    let next = duration * 2;
                    self.timer_retransmit = Some(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerA(key, next)),
                    );
                }
            }
            TransactionTimer::TimerE(key, duration) => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Proceeding
                ) {
                    trace!(%key, "timer E fired, retransmitting request");
                    let connection = self.connection().await?;
                    connection
                        .send(self.original.to_owned().into(), self.destination.as_ref())
                        .await?;
                    // Doubling stops once a provisional arrived; from
                    // then on retransmit at the T2 cap.
                    let next = match self.state {
                        TransactionState::Proceeding => self.endpoint_inner.option.t2,
                        _ => (duration * 2).min(self.endpoint_inner.option.t2),
                    };
                    self.timer_retransmit = Some(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerE(key, next)),
                    );
                }
            }
            TransactionTimer::TimerB(key) => {
                if self.state == TransactionState::Calling {
                    debug!(%key, "timer B fired, transaction timed out");
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerF(key) => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Proceeding
                ) {
                    debug!(%key, "timer F fired, transaction timed out");
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerH(key) => {
                if self.state == TransactionState::Completed {
                    debug!(%key, "timer H fired, no ack for final response");
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerL(key) => {
                if self.state == TransactionState::Accepted {
                    debug!(%key, "timer L fired, no ack for 2xx");
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerD(_) | TransactionTimer::TimerJ(_) => {
                if self.state == TransactionState::Completed {
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerI(_) => {
                if self.state == TransactionState::Confirmed {
                    self.transition(TransactionState::Terminated)?;
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn cancel_retransmit(&mut self) {
        if let Some(id) = self.timer_retransmit.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(id) = self.timer_timeout.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    pub fn transition(&mut self, state: TransactionState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        trace!(key = %self.key, "transaction state {:?} -> {:?}", self.state, state);
        self.state = state;
        if state == TransactionState::Terminated {
            self.cancel_retransmit();
            self.cancel_timeout();
            self.endpoint_inner.detach_transaction(&self.key, None);
        }
        Ok(())
    }

    /// Force-stop the transaction. Idempotent.
    pub fn terminate(&mut self) -> Result<()> {
        self.transition(TransactionState::Terminated)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cancel_retransmit();
        self.cancel_timeout();
        self.endpoint_inner.detach_transaction(&self.key, None);
        trace!(key = %self.key, state = ?self.state, "transaction dropped");
    }
}
