use super::endpoint::EndpointInnerRef;
use super::transaction::{Transaction, TransactionEvent, TransactionEventSender};
use crate::rsip_ext::{header_contains_token, parse_rack_header};
use crate::transport::SipConnection;
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, Response, StatusCode, StatusCodeKind};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Clone)]
struct PendingProvisional {
    rseq: u32,
    cseq: u32,
    method: Method,
    response: Response,
    guard: CancellationToken,
}

struct ResponderInner {
    next_rseq: AtomicU32,
    queue: Mutex<VecDeque<PendingProvisional>>,
    connection: Mutex<Option<SipConnection>>,
    endpoint_inner: EndpointInnerRef,
    cancel_token: CancellationToken,
    timeout_tx: UnboundedSender<Response>,
    timeout_rx: Mutex<Option<UnboundedReceiver<Response>>>,
}

/// Reliable provisional responses for one INVITE server transaction
/// (RFC 3262).
///
/// Each response gets an `RSeq` one higher than the previous and a
/// `Require: 100rel`. Responses confirm strictly in order and only the
/// head of the queue is ever on the wire; it retransmits with doubling
/// intervals until the matching PRACK arrives or 64*T1 passes, at which
/// point the next queued response goes out.
#[derive(Clone)]
pub struct ReliableProvisionalResponder {
    inner: Arc<ResponderInner>,
}

impl ReliableProvisionalResponder {
    pub fn new(endpoint_inner: EndpointInnerRef) -> Self {
        use rand::Rng;
        // RFC 3262 3: initial RSeq between 1 and 2**31 - 1.
        let initial = rand::thread_rng().gen_range(1..1u32 << 31);
        let cancel_token = endpoint_inner.cancel_token.child_token();
        let (timeout_tx, timeout_rx) = unbounded_channel();
        ReliableProvisionalResponder {
            inner: Arc::new(ResponderInner {
                next_rseq: AtomicU32::new(initial),
                queue: Mutex::new(VecDeque::new()),
                connection: Mutex::new(None),
                endpoint_inner,
                cancel_token,
                timeout_tx,
                timeout_rx: Mutex::new(Some(timeout_rx)),
            }),
        }
    }

    /// Receiver for responses that went unacknowledged past 64*T1. The
    /// owner decides what a missed PRACK means for the call. Yields the
    /// receiver once.
    pub fn take_timeouts(&self) -> Option<UnboundedReceiver<Response>> {
        self.inner.timeout_rx.lock().unwrap().take()
    }

    /// Stamp and send `response` reliably through `tx`, or queue it when
    /// an earlier one is still unconfirmed. Returns the assigned RSeq.
    pub async fn respond(&self, tx: &mut Transaction, mut response: Response) -> Result<u32> {
        if response.status_code.kind() != StatusCodeKind::Provisional
            || response.status_code == StatusCode::Trying
        {
            return Err(Error::TransactionError(
                format!(
                    "cannot send {} reliably, only 101-199 allowed",
                    response.status_code
                ),
                tx.key.clone(),
            ));
        }

        let cseq = tx.original.cseq_header()?.typed()?;
        let rseq = self.inner.next_rseq.fetch_add(1, Ordering::SeqCst);
        response
            .headers
            .unique_push(Header::Other("RSeq".into(), rseq.to_string()));
        if !header_contains_token(&response.headers, "Require", "100rel") {
            response.headers.push(Header::Require("100rel".into()));
        }
        *self.inner.connection.lock().unwrap() = tx.connection.clone();

        let pending = PendingProvisional {
            rseq,
            cseq: cseq.seq,
            method: cseq.method.clone(),
            response: response.clone(),
            guard: self.inner.cancel_token.child_token(),
        };

        let head = {
            let mut queue = self.inner.queue.lock().unwrap();
            let head = queue.is_empty();
            queue.push_back(pending.clone());
            head
        };
        if !head {
            debug!(key = %tx.key, rseq, "queued reliable provisional behind unconfirmed one");
            return Ok(rseq);
        }

        debug!(key = %tx.key, rseq, "sending reliable provisional");
        tx.respond(response).await?;
        Self::spawn_retransmit(self.inner.clone(), pending);
        Ok(rseq)
    }

    /// Variant of [`respond`](Self::respond) for the dialog layer: the
    /// INVITE transaction sits in its owner's receive loop, so the first
    /// copy goes through its event channel instead of a borrowed
    /// transaction. Retransmissions still go out on the connection set
    /// with [`set_connection`](Self::set_connection).
    pub fn respond_via(
        &self,
        tu_sender: &TransactionEventSender,
        cseq: rsip::typed::CSeq,
        mut response: Response,
    ) -> Result<u32> {
        if response.status_code.kind() != StatusCodeKind::Provisional
            || response.status_code == StatusCode::Trying
        {
            return Err(Error::Error(format!(
                "cannot send {} reliably, only 101-199 allowed",
                response.status_code
            )));
        }

        let rseq = self.inner.next_rseq.fetch_add(1, Ordering::SeqCst);
        response
            .headers
            .unique_push(Header::Other("RSeq".into(), rseq.to_string()));
        if !header_contains_token(&response.headers, "Require", "100rel") {
            response.headers.push(Header::Require("100rel".into()));
        }

        let pending = PendingProvisional {
            rseq,
            cseq: cseq.seq,
            method: cseq.method,
            response: response.clone(),
            guard: self.inner.cancel_token.child_token(),
        };

        let head = {
            let mut queue = self.inner.queue.lock().unwrap();
            let head = queue.is_empty();
            queue.push_back(pending.clone());
            head
        };
        if !head {
            debug!(rseq, "queued reliable provisional behind unconfirmed one");
            return Ok(rseq);
        }

        debug!(rseq, "sending reliable provisional");
        tu_sender.send(TransactionEvent::Respond(response))?;
        Self::spawn_retransmit(self.inner.clone(), pending);
        Ok(rseq)
    }

    pub fn set_connection(&self, connection: Option<SipConnection>) {
        *self.inner.connection.lock().unwrap() = connection;
    }

    /// Handle a PRACK for this INVITE. Answers it 200 and returns the
    /// confirmed response when the RAck matches the head of the queue,
    /// 481 otherwise. A match puts the next queued response on the wire.
    pub async fn process_prack(&self, tx: &mut Transaction) -> Result<Option<Response>> {
        let rack = match parse_rack_header(&tx.original.headers) {
            Some(rack) => rack,
            None => {
                warn!(key = %tx.key, "prack without rack header");
                tx.reply(StatusCode::BadRequest).await?;
                return Ok(None);
            }
        };

        let confirmed = {
            let mut queue = self.inner.queue.lock().unwrap();
            let matched = queue
                .front()
                .map(|head| (head.rseq, head.cseq, head.method.clone()) == rack)
                .unwrap_or(false);
            if matched {
                queue.pop_front()
            } else {
                None
            }
        };

        match confirmed {
            Some(head) => {
                debug!(key = %tx.key, rseq = head.rseq, "provisional confirmed by prack");
                head.guard.cancel();
                tx.reply(StatusCode::OK).await?;
                Self::send_head(&self.inner).await;
                Ok(Some(head.response))
            }
            None => {
                warn!(
                    key = %tx.key,
                    rseq = rack.0,
                    cseq = rack.1,
                    "prack does not match the unconfirmed provisional"
                );
                tx.reply(StatusCode::CallTransactionDoesNotExist).await?;
                Ok(None)
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.queue.lock().unwrap().is_empty()
    }

    /// Cancel retransmissions and drop everything unconfirmed.
    pub fn stop(&self) {
        self.inner.cancel_token.cancel();
        self.inner.queue.lock().unwrap().clear();
    }

    /// Put the current queue head on the wire and start its timers.
    async fn send_head(inner: &Arc<ResponderInner>) {
        let head = inner.queue.lock().unwrap().front().cloned();
        let head = match head {
            Some(head) => head,
            None => return,
        };
        let connection = inner.connection.lock().unwrap().clone();
        if let Some(connection) = connection {
            debug!(rseq = head.rseq, "sending next reliable provisional");
            if let Err(e) = connection.send(head.response.clone().into(), None).await {
                warn!(rseq = head.rseq, "error sending reliable provisional: {}", e);
            }
        }
        Self::spawn_retransmit(inner.clone(), head);
    }

    fn spawn_retransmit(inner: Arc<ResponderInner>, pending: PendingProvisional) {
        let option = &inner.endpoint_inner.option;
        let (t2, t1x64) = (option.t2, option.t1x64);
        let mut interval = option.t1;

        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + t1x64;
            loop {
                tokio::select! {
                    _ = pending.guard.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {
                        Self::on_timeout(&inner, &pending).await;
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let connection = inner.connection.lock().unwrap().clone();
                        if let Some(connection) = connection {
                            trace!(rseq = pending.rseq, "retransmitting reliable provisional");
                            connection
                                .send(pending.response.clone().into(), None)
                                .await
                                .ok();
                        }
                        interval = (interval * 2).min(t2);
                    }
                }
            }
        });
    }

    /// No PRACK within 64*T1: report it to the owner, give up on this
    /// response and move on to the next queued one.
    async fn on_timeout(inner: &Arc<ResponderInner>, pending: &PendingProvisional) {
        let timed_out = {
            let mut queue = inner.queue.lock().unwrap();
            let head = queue
                .front()
                .map(|head| head.rseq == pending.rseq)
                .unwrap_or(false);
            if head {
                queue.pop_front();
            }
            head
        };
        if !timed_out {
            return;
        }
        warn!(rseq = pending.rseq, "reliable provisional not confirmed in time");
        inner.timeout_tx.send(pending.response.clone()).ok();
        Self::send_head(inner).await;
    }
}
