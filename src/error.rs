use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Error(String),
    EndpointError(String),
    TransportLayerError(String, SipAddr),
    TransactionError(String, TransactionKey),
    DialogError(String, DialogId, rsip::StatusCode),
    ProxyError(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Error(e) => write!(f, "{}", e),
            Error::EndpointError(e) => write!(f, "endpoint error: {}", e),
            Error::TransportLayerError(e, addr) => {
                write!(f, "transport layer error: {} {}", e, addr)
            }
            Error::TransactionError(e, key) => write!(f, "transaction error: {} {}", e, key),
            Error::DialogError(e, id, code) => write!(f, "dialog error: {} {} {}", e, id, code),
            Error::ProxyError(e) => write!(f, "proxy error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
