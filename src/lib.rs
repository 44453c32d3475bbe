//! Flowtrack - Stateful flow tracking core for inline IPS
//!
//! Turns a stream of decoded packets into tracked bidirectional
//! conversations ("flows"), each bound to a protocol-specific session
//! state machine, with deterministic memory bounds and pinhole support
//! for protocols that negotiate secondary channels in-band.
//!
//! ## Components
//!
//! - **FlowKey**: direction-insensitive flow identity (5-tuple or
//!   fragment shape)
//! - **FlowCache**: bounded slot-arena of flows with age- and
//!   capacity-based pruning
//! - **ExpectCache**: bounded pool of expected-flow registrations
//!   ("pinholes")
//! - **FlowControl**: per-protocol orchestrator wiring packets to
//!   caches, sessions, and binders
//!
//! ## Concurrency model
//!
//! One `FlowControl` instance per worker. A worker processes one packet
//! to completion before the next; housekeeping sweeps run on the same
//! worker between packet batches. Nothing here locks, blocks, or
//! suspends.

#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod control;
pub mod expect;
pub mod flow;
pub mod key;
pub mod packet;
pub mod stats;

pub use cache::{FlowCache, FlowId};
pub use config::FlowConfig;
pub use control::{ActiveControl, FlowBinder, FlowControl, NullBinder, SessionFactory};
pub use expect::{ExpectCache, ExpectMode, ExpectStats};
pub use flow::{
    Flow, FlowData, FlowFlags, IgnoreDirection, Protocol, ReleaseReason, Session,
};
pub use key::FlowKey;
pub use packet::Packet;
pub use stats::{CacheStats, FlowCounts};

use thiserror::Error;

/// Flow tracking errors
#[derive(Error, Debug)]
pub enum FlowError {
    /// Expectation pool is at capacity and nothing could be reclaimed
    #[error("expect cache full ({capacity} records)")]
    ExpectCacheFull {
        /// Configured record capacity
        capacity: usize,
    },

    /// Registration attempted before the expect cache was initialized
    #[error("expect cache not initialized")]
    ExpectDisabled,

    /// Operation against a protocol whose cache is disabled
    #[error("flow cache disabled for {0}")]
    Disabled(Protocol),
}

/// Result type for flowtrack
pub type Result<T> = std::result::Result<T, FlowError>;
