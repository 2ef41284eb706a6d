//! Error types for Fynx

use std::fmt;
use std::sync::Arc;

/// SSH disconnect reason: protocol error (RFC 4253 Section 11.1).
pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;
/// SSH disconnect reason: key exchange failed.
pub const DISCONNECT_KEY_EXCHANGE_FAILED: u32 = 3;
/// SSH disconnect reason: MAC error.
pub const DISCONNECT_MAC_ERROR: u32 = 5;
/// SSH disconnect reason: host key not verifiable.
pub const DISCONNECT_HOST_KEY_NOT_VERIFIABLE: u32 = 9;
/// SSH disconnect reason: connection lost.
pub const DISCONNECT_CONNECTION_LOST: u32 = 10;
/// SSH disconnect reason: by application.
pub const DISCONNECT_BY_APPLICATION: u32 = 11;

/// Unified error type for all Fynx operations
///
/// The type is `Clone` so that a single connection-fatal error can be handed
/// to every thread that was blocked on that connection.
#[derive(Debug, Clone)]
pub enum FynxError {
    /// I/O error
    Io(Arc<std::io::Error>),

    /// Configuration error
    Config(String),

    /// Protocol violation (unexpected message type or order, malformed
    /// packet length or padding)
    Protocol(String),

    /// An incoming packet failed MAC or AEAD tag verification
    MacVerification,

    /// No algorithm in a negotiated category is supported by both sides
    UnsupportedAlgorithm {
        /// Category name (e.g. "cipher client->server")
        category: String,
        /// Local preference list
        local: Vec<String>,
        /// Peer's advertised list
        remote: Vec<String>,
    },

    /// Security error (host key rejected, bad signature, etc.)
    Security(String),

    /// A bounded local resource (such as the channel table) is full
    ResourceExhausted(String),

    /// The peer refused to open a channel
    ChannelOpenRejected {
        /// Reason code sent by the peer
        reason_code: u32,
        /// Human readable description sent by the peer
        description: String,
    },

    /// The channel was closed before the operation could complete
    ChannelClosed,

    /// The peer answered a request with a failure reply
    RequestRejected(String),

    /// A blocking wait ran out of time
    Timeout(String),

    /// The underlying stream failed or ended unexpectedly
    UnexpectedTermination(String),

    /// SSH_MSG_DISCONNECT was sent or received
    Disconnected {
        /// Disconnect reason code
        reason_code: u32,
        /// Human readable description
        description: String,
    },

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl FynxError {
    /// Returns true if this error tears down the whole connection.
    ///
    /// Channel- and call-local errors (timeouts, rejected opens, a full
    /// channel table) return false.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FynxError::Io(_)
                | FynxError::Protocol(_)
                | FynxError::MacVerification
                | FynxError::UnsupportedAlgorithm { .. }
                | FynxError::Security(_)
                | FynxError::UnexpectedTermination(_)
                | FynxError::Disconnected { .. }
        )
    }

    /// Returns the SSH disconnect reason code to announce to the peer
    /// before tearing down the connection, if one should be sent.
    pub fn disconnect_reason(&self) -> Option<u32> {
        match self {
            FynxError::Protocol(_) => Some(DISCONNECT_PROTOCOL_ERROR),
            FynxError::MacVerification => Some(DISCONNECT_MAC_ERROR),
            FynxError::UnsupportedAlgorithm { .. } => Some(DISCONNECT_KEY_EXCHANGE_FAILED),
            FynxError::Security(_) => Some(DISCONNECT_HOST_KEY_NOT_VERIFIABLE),
            _ => None,
        }
    }
}

impl fmt::Display for FynxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FynxError::Io(e) => write!(f, "IO error: {}", e),
            FynxError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FynxError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FynxError::MacVerification => write!(f, "MAC verification failed"),
            FynxError::UnsupportedAlgorithm {
                category,
                local,
                remote,
            } => write!(
                f,
                "No common {} algorithm (local: [{}], remote: [{}])",
                category,
                local.join(","),
                remote.join(",")
            ),
            FynxError::Security(msg) => write!(f, "Security error: {}", msg),
            FynxError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            FynxError::ChannelOpenRejected {
                reason_code,
                description,
            } => write!(
                f,
                "Channel open rejected (reason {}): {}",
                reason_code, description
            ),
            FynxError::ChannelClosed => write!(f, "Channel closed"),
            FynxError::RequestRejected(name) => write!(f, "Request rejected by peer: {}", name),
            FynxError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            FynxError::UnexpectedTermination(msg) => {
                write!(f, "Connection terminated unexpectedly: {}", msg)
            }
            FynxError::Disconnected {
                reason_code,
                description,
            } => write!(
                f,
                "Disconnected (reason {}): {}",
                reason_code, description
            ),
            FynxError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            FynxError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for FynxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FynxError::Io(e) => Some(e.as_ref()),
            FynxError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FynxError {
    fn from(err: std::io::Error) -> Self {
        FynxError::Io(Arc::new(err))
    }
}

/// Result type for Fynx operations
pub type FynxResult<T> = Result<T, FynxError>;
