//! Error types for the media transport engine
//!
//! Malformed wire data and stream-level loss are *not* errors at this layer;
//! they are handled locally (packets silently discarded, loss propagated as
//! a flag). The variants here cover parse failures surfaced to codec code,
//! transport I/O, and the one fatal condition: the event loop's readiness
//! wait failing for a non-benign reason.

use thiserror::Error;

/// Errors produced by the RTP/RTCP engine
#[derive(Error, Debug)]
pub enum Error {
    /// Buffer too small for the requested parse or serialize
    #[error("Buffer too small: required {required} bytes, available {available}")]
    BufferTooSmall {
        /// Bytes needed to proceed
        required: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Packet failed structural validation
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Packet carried an unexpected payload type
    #[error("Payload type mismatch: expected {expected}, got {actual}")]
    PayloadTypeMismatch {
        /// Payload type the pipeline was configured for
        expected: u8,
        /// Payload type found in the packet
        actual: u8,
    },

    /// Underlying datagram I/O failed
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The event loop's readiness wait failed and cannot make progress
    #[error("Event loop failure: {0}")]
    EventLoop(String),

    /// Invalid engine configuration or state
    #[error("Session error: {0}")]
    Session(String),
}
