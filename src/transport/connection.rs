use super::{channel::ChannelConnection, udp::UdpConnection, SipAddr};
use crate::Result;
use rsip::{
    param::{OtherParam, OtherParamValue, Received},
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Param, SipMessage,
};
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Events a connection reports to the transport layer.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A decoded SIP message, the connection it arrived on and the
    /// source address.
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// A transport-level connection a SIP message can be sent over.
///
/// UDP is connectionless so one `UdpConnection` serves all peers and
/// every send carries an explicit destination. The channel variant is an
/// in-process pair used by tests and embedders.
#[derive(Clone, Debug)]
pub enum SipConnection {
    Udp(UdpConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    /// Reliable transports suppress the retransmission timers of
    /// RFC 3261 section 17; UDP keeps them.
    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Udp(_) => false,
            // A channel carries whatever transport it stands in for.
            SipConnection::Channel(c) => !matches!(
                c.get_addr().r#type,
                Some(rsip::transport::Transport::Udp) | None
            ),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(transport) => transport.get_addr(),
            SipConnection::Channel(transport) => transport.get_addr(),
        }
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(transport) => transport.send(msg, destination).await,
            SipConnection::Channel(transport) => transport.send(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(transport) => transport.serve_loop(sender).await,
            SipConnection::Channel(transport) => transport.serve_loop(sender).await,
        }
    }
}

impl SipConnection {
    /// Stamp `received`/`rport` on the top Via of an inbound request when
    /// the source address differs from the Via sent-by (RFC 3581).
    /// Responses pass through untouched.
    pub fn update_msg_received(
        msg: SipMessage,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                let via = req.via_header_mut()?;
                Self::build_via_received(via, addr, transport)?;
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    pub fn build_via_received(
        via: &mut rsip::headers::Via,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<()> {
        let received: HostWithPort = addr.into();
        let mut typed_via = via.typed()?;
        if typed_via.transport == transport && typed_via.uri.host_with_port == received {
            return Ok(());
        }
        typed_via.params.retain(|param| {
            if let Param::Other(key, _) = param {
                !key.value().eq_ignore_ascii_case("rport")
            } else {
                true
            }
        });
        *via = typed_via
            .with_param(Param::Received(Received::new(received.host.to_string())))
            .with_param(Param::Other(
                OtherParam::new("rport"),
                Some(OtherParamValue::new(addr.port().to_string())),
            ))
            .into();
        Ok(())
    }

    /// Response target from a Via header: the sent-by host/port with
    /// `received`/`rport` overrides applied when present.
    pub fn parse_target_from_via(
        via: &rsip::headers::untyped::Via,
    ) -> Result<(rsip::transport::Transport, HostWithPort)> {
        let typed_via = via.typed()?;
        let mut host_with_port = typed_via.uri.host_with_port.clone();
        for param in typed_via.params.iter() {
            match param {
                Param::Received(v) => {
                    if let Ok(addr) = v.parse() {
                        host_with_port.host = addr.into();
                    }
                }
                Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                    if let Ok(port) = value.value().try_into() {
                        host_with_port.port = Some(port);
                    }
                }
                _ => {}
            }
        }
        Ok((typed_via.transport, host_with_port))
    }

    pub fn get_destination(msg: &rsip::SipMessage) -> Result<SocketAddr> {
        let host_with_port = match msg {
            rsip::SipMessage::Request(req) => req.uri().host_with_port.clone(),
            rsip::SipMessage::Response(res) => {
                Self::parse_target_from_via(res.via_header()?)?.1
            }
        };
        host_with_port.try_into().map_err(Into::into)
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Channel(t) => write!(f, "CHANNEL {}", t),
        }
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}

impl From<SipAddr> for HostWithPort {
    fn from(addr: SipAddr) -> Self {
        addr.addr
    }
}

impl From<SipAddr> for rsip::Uri {
    fn from(addr: SipAddr) -> Self {
        let scheme = match addr.r#type {
            Some(rsip::transport::Transport::Wss) | Some(rsip::transport::Transport::Tls) => {
                rsip::Scheme::Sips
            }
            _ => rsip::Scheme::Sip,
        };
        rsip::Uri {
            scheme: Some(scheme),
            host_with_port: addr.addr,
            ..Default::default()
        }
    }
}
