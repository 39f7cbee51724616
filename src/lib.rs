//! A SIP (RFC 3261) signaling stack.
//!
//! The crate is layered bottom-up:
//!
//! * [`transport`] — UDP and in-process channel transports behind a
//!   [`transport::SipConnection`] enum, plus the listener registry.
//! * [`transaction`] — client/server transaction state machines with the
//!   RFC 3261 timers, driven by an [`transaction::endpoint::Endpoint`]
//!   that dispatches inbound messages by transaction key.
//! * [`dialog`] — INVITE dialogs (UAC and UAS), dialog registry,
//!   outbound invitations and a REGISTER refresh client.
//! * [`proxy`] — a stateless forwarding proxy with a registrar and an
//!   in-memory location service.
//!
//! Applications create an endpoint, attach transports, then either accept
//! server transactions from [`transaction::endpoint::Endpoint::incoming_transactions`]
//! and hand them to a [`dialog::dialog_layer::DialogLayer`], or mount a
//! [`proxy::server::ProxyServer`] directly on the transport layer.

pub mod dialog;
pub mod error;
pub mod proxy;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;

pub use error::Error;
pub use transaction::endpoint::EndpointBuilder;

pub type Result<T, E = Error> = std::result::Result<T, E>;
