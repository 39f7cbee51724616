use super::{
    connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    SipAddr, SipConnection, TransportEvent,
};
use crate::{Error, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

struct UdpInner {
    conn: UdpSocket,
    addr: SipAddr,
    cancel_token: Option<CancellationToken>,
}

/// Connectionless UDP transport. One instance serves every peer; the
/// destination is carried per send.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    /// Bind a UDP socket. `external` overrides the advertised address
    /// when the socket sits behind a NAT; the given token, when present,
    /// stops `serve_loop` independently of the transport layer.
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let local = conn.local_addr()?;

        let addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: external.unwrap_or(local).into(),
        };

        let connection = UdpConnection {
            inner: Arc::new(UdpInner {
                conn,
                addr,
                cancel_token,
            }),
        };
        info!(addr = %connection.get_addr(), external = ?external, "created udp connection");
        Ok(connection)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self.inner.cancel_token.as_ref() {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    result = self.recv_loop(sender) => result,
                }
            }
            None => self.recv_loop(sender).await,
        }
    }

    async fn recv_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    warn!(addr = %self.get_addr(), error = %e, "error receiving udp packet");
                    continue;
                }
            };

            match &buf[..len] {
                KEEPALIVE_REQUEST => {
                    self.inner.conn.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                _ => {
                    if buf[..len].iter().all(|&b| b.is_ascii_whitespace()) {
                        continue;
                    }
                }
            }

            let undecoded = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(e) => {
                    info!(from = %addr, error = %e, "received non-utf8 packet");
                    continue;
                }
            };

            let msg = match rsip::SipMessage::try_from(undecoded) {
                Ok(msg) => msg,
                Err(e) => {
                    info!(from = %addr, error = %e, buf = undecoded, "error parsing sip message");
                    continue;
                }
            };

            let msg =
                match SipConnection::update_msg_received(msg, addr, rsip::transport::Transport::Udp)
                {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(from = %addr, error = %e, "error updating via received");
                        continue;
                    }
                };

            debug!(len, from = %addr, to = %self.get_addr(), "received udp packet");

            sender.send(TransportEvent::Incoming(
                msg,
                self.clone().into(),
                SipAddr {
                    r#type: Some(rsip::transport::Transport::Udp),
                    addr: addr.into(),
                },
            ))?;
        }
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let target = match destination {
            Some(addr) => self.resolve(addr).await?,
            None => SipConnection::get_destination(&msg)?,
        };
        let buf = msg.to_string();

        trace!(len = buf.len(), to = %target, buf = %buf, "sending udp packet");

        self.inner
            .conn
            .send_to(buf.as_bytes(), target)
            .await
            .map_err(|e| Error::TransportLayerError(e.to_string(), self.get_addr().to_owned()))
            .map(|_| ())
    }

    /// Send raw bytes without going through the SIP codec. Used for
    /// keepalives and by tests that inject hand-built datagrams.
    pub async fn send_raw(&self, buf: &[u8], destination: &SipAddr) -> Result<()> {
        let target = self.resolve(destination).await?;
        trace!(len = buf.len(), to = %target, "sending raw udp packet");
        self.inner
            .conn
            .send_to(buf, target)
            .await
            .map_err(|e| Error::TransportLayerError(e.to_string(), self.get_addr().to_owned()))
            .map(|_| ())
    }

    /// Resolve a destination to a socket address, going through DNS for
    /// domain hosts.
    async fn resolve(&self, addr: &SipAddr) -> Result<SocketAddr> {
        if let Ok(socketaddr) = addr.get_socketaddr() {
            return Ok(socketaddr);
        }
        let port = addr.addr.port.as_ref().map_or(5060, |p| *p.value());
        let host = addr.addr.host.to_string();
        tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::TransportLayerError("dns lookup returned no address".to_string(), addr.clone())
            })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.conn.local_addr() {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(f, "*:*"),
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        debug!(addr = %self.addr, "dropping udp connection");
    }
}
