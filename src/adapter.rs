//! The `ProtocolAdapter` trait every per-protocol adapter implements
//! (spec §9 "Adapter pluralism"): composition over inheritance, one
//! trait, `Name`/`Start`/`Stop`.
//!
//! Drawn from `wayle`'s `async-trait` service pattern — the teacher has
//! no trait-object adapter abstraction of its own (its bridges are
//! concrete structs wired directly into `main.rs`), so this is learned
//! from the rest of the pack rather than from the teacher.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::HdpError;

#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// The protocol tag this adapter owns, e.g. `"zigbee"`.
    fn name(&self) -> &str;

    /// Runs the adapter's startup sequence (spec §4.10): hello,
    /// starting→online status, index priming, device-list request,
    /// cached-state republish. Returns once startup has completed or
    /// subscription setup failed fatally.
    ///
    /// Takes `Arc<Self>` rather than `&self` so inbound-message
    /// handlers registered with the transport can hold their own
    /// strong reference to the adapter for as long as the subscription
    /// lives, instead of capturing a borrowed pointer.
    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), HdpError>;

    /// Publishes `status="offline"` with `reason="shutdown"`, cancels
    /// all owned timers, and forces the pairing state machine to
    /// `Idle` if applicable.
    async fn stop(&self) -> Result<(), HdpError>;

    /// Re-publishes retained `status="online"` on the supervisor's
    /// heartbeat tick (spec §4.11, default every 20s). Adapters with
    /// nothing to say beyond liveness can leave this as a no-op.
    async fn heartbeat(&self) {}
}
