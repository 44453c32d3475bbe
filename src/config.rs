//! Per-protocol flow cache configuration
//!
//! Supplied once at init and never mutated afterward. `max_sessions`
//! of 0 disables tracking for that protocol.

use serde::Deserialize;

/// Configuration for one protocol's flow cache
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Maximum concurrently tracked flows (0 disables the cache)
    pub max_sessions: u32,
    /// Idle seconds before a flow is eligible for stale pruning
    pub pruning_timeout: u64,
    /// Idle seconds before the housekeeping sweep times a flow out
    pub nominal_timeout: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_sessions: 262_144,
            pruning_timeout: 30,
            nominal_timeout: 3600,
        }
    }
}

impl FlowConfig {
    /// Config with a given capacity and the default timeouts
    pub fn with_max_sessions(max_sessions: u32) -> Self {
        Self {
            max_sessions,
            ..Self::default()
        }
    }

    /// Disabled cache (protocol untracked)
    pub fn disabled() -> Self {
        Self {
            max_sessions: 0,
            ..Self::default()
        }
    }

    /// Whether this protocol is tracked at all
    pub fn enabled(&self) -> bool {
        self.max_sessions > 0
    }
}
