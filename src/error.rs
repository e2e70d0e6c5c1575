//! Error taxonomy shared across the transport and obfuscation engine.
//!
//! Tags follow spec §7: `ConfigInvalid`, `CryptoKeyParse`, `HandshakeFailed`,
//! `TlsPinMismatch`, `ConnectStatus`, `ConnectionError`, `Timeout`,
//! `Cancelled`, `InternalBug`. Each component wraps its own lower-level
//! errors into one of these variants rather than propagating raw library
//! errors across module boundaries.

use thiserror::Error;

/// Errors surfaced by the Connect-IP client (module E) and, by extension,
/// the tunnel supervisor (module F) when a session fails.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("TLS peer key did not match the pinned fingerprint")]
    TlsPinMismatch,

    #[error("login failed; check enrollment")]
    TlsAccessDenied,

    #[error("CONNECT rejected with status {0}")]
    ConnectStatus(u16),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("quiche error: {0}")]
    Quiche(#[from] quiche::Error),

    #[error("http/3 error: {0}")]
    H3(#[from] quiche::h3::Error),

    #[error("http/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid certificate: {0}")]
    CryptoKeyParse(String),

    #[error("internal bug: {0}")]
    InternalBug(String),
}

/// Fragments of OS/runtime error text treated as a recoverable connection
/// reset rather than a fatal configuration problem (spec §4.E).
const CONNECTION_ERROR_SUBSTRINGS: &[&str] = &[
    "use of closed network connection",
    "connection reset by peer",
    "connection reset",
    "connection refused",
    "connection aborted",
    "broken pipe",
    "not connected",
    "i/o timeout",
    "context deadline exceeded",
    "permission denied",
    "protocol not available",
];

impl ConnectError {
    fn matches_connection_error(msg: &str) -> bool {
        let lower = msg.to_lowercase();
        CONNECTION_ERROR_SUBSTRINGS
            .iter()
            .any(|needle| lower.contains(needle))
    }

    /// Classifies a lower-level transport failure by substring match, per
    /// spec §4.E: a fixed set of OS/runtime error fragments are treated as
    /// `ConnectionError`s (recoverable by reconnecting) rather than fatal
    /// configuration problems.
    pub fn classify_transport(msg: &str) -> Self {
        if Self::matches_connection_error(msg) {
            ConnectError::ConnectionError(msg.to_string())
        } else if msg.contains("timeout") || msg.contains("deadline") {
            ConnectError::Timeout(msg.to_string())
        } else {
            ConnectError::InternalBug(msg.to_string())
        }
    }

    /// True if this error should be handled by the supervisor's
    /// connection-error path (local/global failure counters, recovery after
    /// 3 consecutive occurrences) rather than logged-and-backed-off. Wrapped
    /// transport errors (`Io`/`H2`/`H3`/`Quiche`) are classified by their
    /// message text, since quiche/h2/io all surface OS-level reset strings
    /// through their own `Display` impls rather than a dedicated variant.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ConnectError::ConnectionError(_) => true,
            ConnectError::Io(_) | ConnectError::H2(_) | ConnectError::H3(_) | ConnectError::Quiche(_) => {
                matches!(
                    Self::classify_transport(&self.to_string()),
                    ConnectError::ConnectionError(_)
                )
            }
            _ => false,
        }
    }

    /// True if a read/recv timeout, per the supervisor's timeout back-off
    /// path (spec §4.F.2).
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectError::Timeout(_))
    }
}

/// Errors surfaced by the noize configuration model (module A).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// Errors surfaced by the CPS packet compiler (module B).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CpsError {
    #[error("bad hex literal in <b> tag: {0}")]
    BadHex(String),

    #[error("bad length for <r N> tag: {0}")]
    BadLength(String),

    #[error("failed to obtain random bytes")]
    RngFailure,

    #[error("unterminated or malformed tag at byte {0}")]
    BadTag(usize),
}
