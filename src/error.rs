//! HDP error kinds (spec §7).
//!
//! Every variant maps to a documented recovery policy: decode and
//! identity errors are absorbed at the handler boundary (logged and
//! dropped), transport/store errors propagate only as far as the
//! caller needs to decide whether to retry or give up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HdpError {
    /// Malformed JSON or a missing required envelope field (§4.1, §7.1).
    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    /// Command aimed at a protocol this adapter doesn't own (§7.2).
    #[error("protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },

    /// Resolver found nothing and could not synthesize a device (§7.3).
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Publish/subscribe failure at the transport boundary (§7.4).
    #[error("transport error: {0}")]
    Transport(String),

    /// Repository or cache failure (§7.5).
    #[error("store error: {0}")]
    Store(String),
}
