//! Event definitions for the supervisor loop.
//!
//! Everything that happens off the supervisor task -- reader completions,
//! child exits, probe results, timer expiries -- is posted as an `Event`
//! and applied to server state in channel order.

/// Represents an event delivered to the supervisor task.
#[derive(Debug, Clone)]
pub enum Event {
    /// A line of output was received from a server's child.
    Output { id: String, line: String },
    /// A child exited; `pid` identifies which child generation it was.
    Exited {
        id: String,
        pid: u32,
        code: Option<i32>,
    },
    /// A health probe completed.
    Health { id: String, healthy: bool },
    /// The post-crash restart backoff elapsed.
    BackoffExpired { id: String },
    /// A cooldown lockout elapsed.
    CooldownExpired { id: String },
    /// The settle delay of a manual restart elapsed.
    SettleExpired { id: String },
}
