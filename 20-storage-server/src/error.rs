use std::io;

/// Failures raised by the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database file is corrupt: {0}")]
    Corrupt(String),

    #[error("invalid table identifier {0:?}")]
    InvalidTable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures raised while exchanging a framed message.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no progress for {0:?}")]
    Timeout(std::time::Duration),

    #[error("peer closed the connection")]
    Closed,

    #[error("unexpected handshake token {0:?}")]
    UnexpectedToken(String),

    #[error("payload contains the frame terminator")]
    EmbeddedTerminator,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures seen by the client side of a request.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("storage server is not running at {0}")]
    Unavailable(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed response: {0}")]
    Codec(#[from] serde_json::Error),
}
