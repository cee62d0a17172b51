use std::io;
use std::sync::Arc;

/// Error returned by client and listener operations.
///
/// A read-side failure on a pipelined connection has to be reported to every
/// caller with a response still pending, so the type is `Clone`; I/O causes
/// are shared behind an `Arc` for that reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Transport failure (dial, read or write).
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A configured deadline expired before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// The reply stream is malformed. Positional response matching is
    /// unrecoverable after this, so the connection is torn down.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error reply (`-...`) from the server. Local to one command; the
    /// connection stays healthy.
    #[error("server error: {0}")]
    Server(String),

    /// A well-formed reply of a shape the command does not accept.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The client or listener was shut down.
    #[error("connection closed")]
    Closed,
}

/// A specialized `Result` for client operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::Io(Arc::new(src))
    }
}
