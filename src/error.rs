use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Address resolution, bind or listen failed at startup.
    #[error("failed to bind server socket: {0}")]
    Bind(#[source] io::Error),

    /// Unparsable start-line or headers, or an unsupported HTTP version.
    #[error("malformed request")]
    MalformedRequest,

    /// Declared Content-Length above `max_buffer_size`.
    #[error("request body larger than the configured limit")]
    PayloadTooLarge,

    /// The read buffer grew past `max_buffer_size` without the pending
    /// read completing.
    #[error("read buffer exceeded max_buffer_size")]
    ParserOverflow,

    /// The peer closed the socket, or a socket error other than
    /// would-block/interrupted occurred.
    #[error("stream closed")]
    StreamClosed,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// `add_handler` for a descriptor that is already registered.
    #[error("descriptor {0} is already registered with the reactor")]
    HandlerExists(RawFd),

    /// A read was registered while another one is still pending.
    #[error("a read operation is already in progress")]
    ReadInProgress,

    /// Invariant violation while a request is in flight.
    #[error("internal error: {0}")]
    Internal(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<httparse::Error> for Error {
    fn from(_: httparse::Error) -> Error {
        Error::MalformedRequest
    }
}

impl From<http::method::InvalidMethod> for Error {
    fn from(_: http::method::InvalidMethod) -> Error {
        Error::MalformedRequest
    }
}

impl From<http::uri::InvalidUri> for Error {
    fn from(_: http::uri::InvalidUri) -> Error {
        Error::MalformedRequest
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(_: http::header::InvalidHeaderName) -> Error {
        Error::MalformedRequest
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(_: http::header::InvalidHeaderValue) -> Error {
        Error::MalformedRequest
    }
}
