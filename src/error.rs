//! Error types

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error kind surfaced to the application after a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No control endpoint configured
    ServerNotFound,
    /// Control channel could not be connected
    ServerNotConnected,
    /// Server hello did not arrive in time
    ServerTimeout,
    /// Any other server-side or protocol failure
    ServerError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ServerNotFound => "server not found",
            Self::ServerNotConnected => "server not connected",
            Self::ServerTimeout => "server timeout",
            Self::ServerError => "server error",
        };
        f.write_str(s)
    }
}

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map to the error kind reported by the channel
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::ServerNotFound,
            Self::Network(NetworkError::ConnectFailed(_))
            | Self::Network(NetworkError::NotConnected) => ErrorKind::ServerNotConnected,
            Self::Handshake(HandshakeError::Timeout(_)) => ErrorKind::ServerTimeout,
            _ => ErrorKind::ServerError,
        }
    }
}

/// Network errors (control link and datagram socket)
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to bind socket: {0}")]
    BindFailed(String),

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("failed to resolve {0}")]
    Resolve(String),

    #[error("failed to send: {0}")]
    SendFailed(String),

    #[error("failed to receive: {0}")]
    ReceiveFailed(String),

    #[error("control channel is not connected")]
    NotConnected,
}

/// Handshake failures
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no server hello within {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid server hello: {0}")]
    Invalid(#[from] HelloError),

    #[error("failed to publish hello: {0}")]
    Publish(NetworkError),

    #[error("handshake cancelled")]
    Cancelled,
}

/// Reasons a server hello is rejected
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HelloError {
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),

    #[error("field `{field}` is not {expected} hex characters")]
    BadHex {
        field: &'static str,
        expected: usize,
    },
}

/// Malformed audio frames
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("unexpected frame type: {0:#04x}")]
    BadType(u8),

    #[error("payload too large for a frame: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Frame cipher errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key or nonce length")]
    InvalidKey,

    #[error("keystream exhausted")]
    Keystream,

    #[error("local sequence exhausted, session must be renegotiated")]
    SequenceExhausted,
}
