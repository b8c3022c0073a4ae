//! # Error Taxonomy
//!
//! PeerTalk's public API is fallible end to end: every mutating entry point
//! returns a [`Result<T, Error>`], and every [`Error`] variant maps to one of
//! the stable integer codes a C re-implementation would hand across process
//! boundaries (used on the wire only inside DISCONNECT control payloads, see
//! [`crate::codec`]).
//!
//! The taxonomy mirrors the five buckets called out in the spec: parameter
//! and state errors, resource errors, protocol/framing errors, network
//! errors, and platform/lifecycle errors.

use std::io;

use thiserror::Error;

/// The full PeerTalk error taxonomy.
///
/// Variant order matches the stable wire-code order; `code()` returns the
/// integer that a DISCONNECT frame embeds when closing a peer for a
/// protocol-level reason. Application code should match on variants, not
/// codes — the codes exist for wire compatibility, not as the primary Rust
/// API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("out of memory")]
    NoMemory,
    #[error("context not initialized")]
    NotInitialized,
    #[error("context already initialized")]
    AlreadyInitialized,
    #[error("invalid state transition")]
    InvalidState,
    #[error("operation not supported")]
    NotSupported,
    #[error("network error: {0}")]
    Network(String),
    #[error("operation timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no network available")]
    NoNetwork,
    #[error("peer is not connected")]
    NotConnected,
    #[error("operation would block")]
    WouldBlock,
    #[error("buffer is full")]
    BufferFull,
    #[error("queue is empty")]
    QueueEmpty,
    #[error("message exceeds maximum size")]
    MessageTooLarge,
    #[error("rejected by flow control backpressure")]
    Backpressure,
    #[error("peer not found")]
    PeerNotFound,
    #[error("discovery is already active")]
    DiscoveryActive,
    #[error("CRC mismatch")]
    Crc,
    #[error("bad magic value")]
    Magic,
    #[error("truncated frame")]
    Truncated,
    #[error("unsupported protocol version")]
    Version,
    #[error("capacity is not a power of two")]
    NotPowerOfTwo,
    #[error("platform error: {0}")]
    Platform(String),
    #[error("resource exhausted")]
    Resource,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("busy")]
    Busy,
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// The stable wire/API integer code for this error kind.
    ///
    /// Codes are assigned in taxonomy order starting at 1; `0` is reserved
    /// for "ok" and is never produced by this enum (success is represented
    /// by `Result::Ok`, not by a variant).
    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidParam => 1,
            Error::NoMemory => 2,
            Error::NotInitialized => 3,
            Error::AlreadyInitialized => 4,
            Error::InvalidState => 5,
            Error::NotSupported => 6,
            Error::Network(_) => 7,
            Error::Timeout => 8,
            Error::ConnectionRefused => 9,
            Error::ConnectionClosed => 10,
            Error::NoNetwork => 11,
            Error::NotConnected => 12,
            Error::WouldBlock => 13,
            Error::BufferFull => 14,
            Error::QueueEmpty => 15,
            Error::MessageTooLarge => 16,
            Error::Backpressure => 17,
            Error::PeerNotFound => 18,
            Error::DiscoveryActive => 19,
            Error::Crc => 20,
            Error::Magic => 21,
            Error::Truncated => 22,
            Error::Version => 23,
            Error::NotPowerOfTwo => 24,
            Error::Platform(_) => 25,
            Error::Resource => 26,
            Error::Internal(_) => 27,
            Error::Busy => 28,
            Error::Cancelled => 29,
        }
    }

    /// A stable, human-readable label — the Rust equivalent of the C API's
    /// `error_string(err)`, which must answer for every defined code and
    /// fall back to `"Unknown error"` for anything out of range.
    pub fn as_str(&self) -> &'static str {
        match self {
            Error::InvalidParam => "invalid parameter",
            Error::NoMemory => "out of memory",
            Error::NotInitialized => "context not initialized",
            Error::AlreadyInitialized => "context already initialized",
            Error::InvalidState => "invalid state transition",
            Error::NotSupported => "operation not supported",
            Error::Network(_) => "network error",
            Error::Timeout => "operation timed out",
            Error::ConnectionRefused => "connection refused",
            Error::ConnectionClosed => "connection closed",
            Error::NoNetwork => "no network available",
            Error::NotConnected => "peer is not connected",
            Error::WouldBlock => "operation would block",
            Error::BufferFull => "buffer is full",
            Error::QueueEmpty => "queue is empty",
            Error::MessageTooLarge => "message exceeds maximum size",
            Error::Backpressure => "rejected by flow control backpressure",
            Error::PeerNotFound => "peer not found",
            Error::DiscoveryActive => "discovery is already active",
            Error::Crc => "CRC mismatch",
            Error::Magic => "bad magic value",
            Error::Truncated => "truncated frame",
            Error::Version => "unsupported protocol version",
            Error::NotPowerOfTwo => "capacity is not a power of two",
            Error::Platform(_) => "platform error",
            Error::Resource => "resource exhausted",
            Error::Internal(_) => "internal error",
            Error::Busy => "busy",
            Error::Cancelled => "cancelled",
        }
    }
}

/// Free-function form of the C API's `error_string(err)`.
///
/// Returns `"Unknown error"` for a code with no matching variant, exactly as
/// spec.md §7 requires.
pub fn error_string(code: u16) -> &'static str {
    let known = [
        Error::InvalidParam,
        Error::NoMemory,
        Error::NotInitialized,
        Error::AlreadyInitialized,
        Error::InvalidState,
        Error::NotSupported,
        Error::Network(String::new()),
        Error::Timeout,
        Error::ConnectionRefused,
        Error::ConnectionClosed,
        Error::NoNetwork,
        Error::NotConnected,
        Error::WouldBlock,
        Error::BufferFull,
        Error::QueueEmpty,
        Error::MessageTooLarge,
        Error::Backpressure,
        Error::PeerNotFound,
        Error::DiscoveryActive,
        Error::Crc,
        Error::Magic,
        Error::Truncated,
        Error::Version,
        Error::NotPowerOfTwo,
        Error::Platform(String::new()),
        Error::Resource,
        Error::Internal(String::new()),
        Error::Busy,
        Error::Cancelled,
    ];
    for variant in &known {
        if variant.code() == code {
            return variant.as_str();
        }
    }
    "Unknown error"
}

impl From<io::Error> for Error {
    /// Maps a transport-layer I/O error onto the nearest taxonomy member.
    ///
    /// Non-blocking transports should prefer returning `Error::WouldBlock`
    /// directly from `ErrorKind::WouldBlock`; this impl exists so platform
    /// shims built directly on `std::net`/`mio` can use `?` freely.
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Error::ConnectionClosed
            }
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Network(err.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_assignment_is_stable_and_unique() {
        let variants = [
            Error::InvalidParam,
            Error::NoMemory,
            Error::NotInitialized,
            Error::AlreadyInitialized,
            Error::InvalidState,
            Error::NotSupported,
            Error::Network(String::new()),
            Error::Timeout,
            Error::ConnectionRefused,
            Error::ConnectionClosed,
            Error::NoNetwork,
            Error::NotConnected,
            Error::WouldBlock,
            Error::BufferFull,
            Error::QueueEmpty,
            Error::MessageTooLarge,
            Error::Backpressure,
            Error::PeerNotFound,
            Error::DiscoveryActive,
            Error::Crc,
            Error::Magic,
            Error::Truncated,
            Error::Version,
            Error::NotPowerOfTwo,
            Error::Platform(String::new()),
            Error::Resource,
            Error::Internal(String::new()),
            Error::Busy,
            Error::Cancelled,
        ];
        let mut seen = std::collections::HashSet::new();
        for v in &variants {
            assert!(seen.insert(v.code()), "duplicate code for {v:?}");
        }
    }

    #[test]
    fn error_string_matches_variant_and_falls_back() {
        assert_eq!(error_string(Error::Crc.code()), "CRC mismatch");
        assert_eq!(error_string(0), "Unknown error");
        assert_eq!(error_string(9999), "Unknown error");
    }

    #[test]
    fn io_error_mapping() {
        let e: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(e, Error::WouldBlock);
        let e: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(e, Error::ConnectionClosed);
    }
}
