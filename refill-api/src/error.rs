//! The error type shared by every crate in the refill supervisor.
//!
//! Authors of new collaborators (nozzle transports, directory clients,
//! store backends) should map their failures into one of these
//! variants. If none fits, add a new one -- but keep it generic enough
//! to be useful outside the collaborator that first needed it.

use std::fmt;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// A resource (tag, transaction, device) could not be found.
    NotFound,

    /// Reported when the peer of a communication channel has closed
    /// its handle.
    MissingPeer(String),

    /// A type/shape mismatch is preventing the operation from
    /// continuing.
    TypeError,

    /// An invalid value was provided.
    InvArgument(String),

    /// A general error returned by a storage backend.
    BackendError(String),

    /// Communication was disrupted because a peer didn't follow the
    /// wire protocol.
    ProtocolError(String),

    /// A frame or record could not be parsed at all.
    Malformed(String),

    /// The requested operation cannot complete because the process
    /// hasn't provided proper authentication credentials.
    AuthenticationError,

    /// An operation didn't complete within its deadline.
    TimeoutError,

    /// The requested operation couldn't complete. The string carries
    /// detail for logs/operator messages.
    OperationError(String),

    /// A bad parameter was given in configuration, or a required
    /// parameter was missing.
    ConfigError(String),

    /// A string failed to parse into the expected type.
    ParseError(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "item not found"),
            Error::MissingPeer(detail) => write!(f, "{} is missing peer", detail),
            Error::TypeError => write!(f, "incorrect type"),
            Error::InvArgument(v) => write!(f, "{}", v),
            Error::BackendError(v) => write!(f, "backend error: {}", v),
            Error::ProtocolError(v) => write!(f, "protocol error: {}", v),
            Error::Malformed(v) => write!(f, "malformed frame: {}", v),
            Error::AuthenticationError => write!(f, "permission error"),
            Error::TimeoutError => write!(f, "timeout"),
            Error::OperationError(v) => write!(f, "couldn't complete operation: {}", v),
            Error::ConfigError(v) => write!(f, "config error: {}", v),
            Error::ParseError(v) => write!(f, "parse error: {}", v),
        }
    }
}

// Allows any code that sends requests over an `mpsc` channel and
// expects the reply in a `oneshot` to easily translate channel errors
// into a refill-supervisor error.

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_error: mpsc::error::SendError<T>) -> Self {
        Error::MissingPeer(String::from("request channel is closed"))
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_error: oneshot::error::RecvError) -> Self {
        Error::MissingPeer(String::from("request dropped"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::OperationError(format!("I/O error: {}", e))
    }
}
