use super::{
    connection::{TransportReceiver, TransportSender},
    SipAddr, SipConnection, TransportEvent,
};
use crate::{Error, Result};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type TransportLayerInnerRef = Arc<TransportLayerInner>;

/// Registry of listening connections plus the event channel they all
/// report into. The receiver side is taken exactly once, by whatever
/// drives the stack (the endpoint event loop, or a proxy server).
pub struct TransportLayerInner {
    pub cancel_token: CancellationToken,
    transport_tx: TransportSender,
    transport_rx: Mutex<Option<TransportReceiver>>,
    listens: RwLock<HashMap<SipAddr, SipConnection>>,
    /// Connections registered but not yet served; drained by
    /// `serve_listens`.
    pending: Mutex<Vec<SipConnection>>,
}

pub struct TransportLayer {
    /// When set, every outbound request goes through this address
    /// instead of the one derived from the target URI.
    pub outbound: Option<SipAddr>,
    pub inner: TransportLayerInnerRef,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        let (transport_tx, transport_rx) = tokio::sync::mpsc::unbounded_channel();
        let inner = TransportLayerInner {
            cancel_token,
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
            listens: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        };
        Self {
            outbound: None,
            inner: Arc::new(inner),
        }
    }

    /// Register a connection to be served by the next `serve_listens`
    /// call.
    pub fn add_transport(&self, connection: SipConnection) {
        self.inner
            .listens
            .write()
            .unwrap()
            .insert(connection.get_addr().to_owned(), connection.clone());
        self.inner.pending.lock().unwrap().push(connection);
    }

    /// Register a connection and start serving it immediately. Used for
    /// connections established while the stack is already running.
    pub fn add_connection(&self, connection: SipConnection) {
        self.inner
            .listens
            .write()
            .unwrap()
            .insert(connection.get_addr().to_owned(), connection.clone());
        self.inner
            .transport_tx
            .send(TransportEvent::New(connection.clone()))
            .ok();
        self.inner.serve_connection(connection);
    }

    pub fn del_transport(&self, addr: &SipAddr) {
        self.inner.listens.write().unwrap().remove(addr);
    }

    /// Pick the connection to reach `target`: the configured outbound
    /// first, then an exact listen match, then any UDP listen.
    pub async fn lookup(&self, target: &SipAddr) -> Result<SipConnection> {
        self.inner.lookup(target, self.outbound.as_ref()).await
    }

    /// Spawn a serve loop for every connection registered so far.
    pub async fn serve_listens(&self) -> Result<()> {
        let pending = {
            let mut pending = self.inner.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for connection in pending {
            self.inner.serve_connection(connection);
        }
        Ok(())
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.listens.read().unwrap().keys().cloned().collect()
    }
}

impl TransportLayerInner {
    /// Hand out the inbound event stream. Fails on the second call; the
    /// stream has exactly one consumer.
    pub fn take_receiver(&self) -> Result<TransportReceiver> {
        self.transport_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Error("transport receiver already taken".to_string()))
    }

    pub fn sender(&self) -> TransportSender {
        self.transport_tx.clone()
    }

    async fn lookup(&self, target: &SipAddr, outbound: Option<&SipAddr>) -> Result<SipConnection> {
        let target = outbound.unwrap_or(target);
        debug!(%target, "lookup target connection");

        if let Some(connection) = self.listens.read().unwrap().get(target) {
            return Ok(connection.clone());
        }

        match target.r#type {
            Some(rsip::transport::Transport::Udp) | None => {
                let listens = self.listens.read().unwrap();
                for (_, connection) in listens.iter() {
                    if connection.get_addr().r#type == Some(rsip::transport::Transport::Udp) {
                        return Ok(connection.clone());
                    }
                }
            }
            _ => {}
        }
        Err(Error::TransportLayerError(
            format!("no connection for transport: {:?}", target.r#type),
            target.to_owned(),
        ))
    }

    fn serve_connection(self: &Arc<Self>, connection: SipConnection) {
        let inner = self.clone();
        let sub_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            let sender = inner.transport_tx.clone();
            select! {
                _ = sub_token.cancelled() => {}
                _ = connection.serve_loop(sender.clone()) => {}
            }
            inner
                .listens
                .write()
                .unwrap()
                .remove(connection.get_addr());
            warn!(addr = %connection.get_addr(), "transport serve loop exited");
            sender.send(TransportEvent::Closed(connection)).ok();
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::transport::{udp::UdpConnection, SipAddr};
    use crate::Result;

    #[tokio::test]
    async fn test_lookup() -> Result<()> {
        let mut tl = super::TransportLayer::new(tokio_util::sync::CancellationToken::new());

        let first_uri = rsip::Uri::try_from("sip:bob@127.0.0.1:5060").expect("parse uri");
        let target = SipAddr::try_from(&first_uri)?;
        assert!(tl.lookup(&target).await.is_err());

        let udp_peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
        let udp_peer_addr = udp_peer.get_addr().to_owned();
        tl.add_transport(udp_peer.into());

        let connection = tl.lookup(&target).await?;
        assert_eq!(connection.get_addr(), &udp_peer_addr);

        let outbound_peer =
            UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
        let outbound = outbound_peer.get_addr().to_owned();
        tl.add_transport(outbound_peer.into());
        tl.outbound = Some(outbound.clone());

        // the outbound override wins over the target-derived address
        let connection = tl.lookup(&target).await?;
        assert_eq!(connection.get_addr(), &outbound);
        Ok(())
    }
}
