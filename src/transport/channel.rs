use super::{
    connection::{TransportReceiver, TransportSender},
    SipAddr, TransportEvent,
};
use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct ChannelInner {
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
    addr: SipAddr,
    cancel_token: Option<CancellationToken>,
}

/// In-process transport built on a channel pair. Everything sent over
/// the connection appears as an `Incoming` event on `outgoing`, and
/// events fed into `incoming` are what `serve_loop` yields. Tests and
/// embedders use it to drive a stack without sockets.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        Ok(ChannelConnection {
            inner: Arc::new(ChannelInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
                cancel_token,
            }),
        })
    }

    pub async fn send(&self, msg: rsip::SipMessage) -> Result<()> {
        let connection = self.clone().into();
        let source = self.get_addr().clone();
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(msg, connection, source))
            .map_err(|e| e.into())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let Some(mut incoming) = incoming else {
            return Err(Error::Error(
                "ChannelConnection::serve_loop called twice".to_string(),
            ));
        };
        loop {
            let event = match self.inner.cancel_token.as_ref() {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => None,
                        event = incoming.recv() => event,
                    }
                }
                None => incoming.recv().await,
            };
            match event {
                Some(event) => sender.send(event)?,
                None => break,
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}
