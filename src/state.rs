//! Data structures for tracking server state.
//!
//! This module defines the lifecycle status of a managed server, the full
//! runtime state object that accompanies each spec, and the snapshot shape
//! served to API and UI consumers.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ServerSpec;
use crate::output::LogBuffer;

/// The current lifecycle status of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Not running and not scheduled to run.
    Stopped,
    /// A spawn is in flight.
    Starting,
    /// The child process is alive.
    Running,
    /// The child exited abnormally; a restart may be pending.
    Crashed,
    /// Locked out after repeated crashes.
    Cooldown,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Starting => write!(f, "starting"),
            ServerStatus::Running => write!(f, "running"),
            ServerStatus::Crashed => write!(f, "crashed"),
            ServerStatus::Cooldown => write!(f, "cooldown"),
        }
    }
}

/// Runtime state of a single server.
///
/// Owned by the manager and mutated only on its serialization point.
#[derive(Debug)]
pub struct ServerState {
    /// The immutable configuration for this server.
    pub spec: ServerSpec,
    /// Current lifecycle status.
    pub status: ServerStatus,
    /// Result of the latest TCP probe; meaningful only while Running.
    pub healthy: bool,
    /// Last spawn or exit failure, if any.
    pub last_error: Option<String>,
    /// PID of the live child's process group; 0 when no child.
    pub pid: u32,
    /// Recent output of the current and previous children.
    pub logs: LogBuffer,
    /// Crash instants inside the rolling crash window.
    pub crash_times: Vec<Instant>,
    /// Set while the server sits in cooldown, so a late restart timer
    /// cannot revive it mid-transition.
    pub in_cooldown: bool,
}

impl ServerState {
    /// Creates the runtime companion for a spec.
    pub fn new(spec: ServerSpec, max_log_lines: usize) -> Self {
        Self {
            spec,
            status: ServerStatus::Stopped,
            healthy: false,
            last_error: None,
            pid: 0,
            logs: LogBuffer::new(max_log_lines),
            crash_times: Vec::new(),
            in_cooldown: false,
        }
    }

    /// Records a crash at `now`, evicts entries older than `window`, and
    /// returns the number of crashes still inside the window.
    pub fn record_crash(&mut self, now: Instant, window: Duration) -> usize {
        self.crash_times.push(now);
        self.crash_times
            .retain(|t| now.duration_since(*t) <= window);
        self.crash_times.len()
    }

    /// Clears the crash window; called on manual recovery and on entering
    /// Stopped or Cooldown.
    pub fn reset_crashes(&mut self) {
        self.crash_times.clear();
    }

    /// Snapshot served to API and UI consumers.
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            status: self.status,
            healthy: self.healthy,
            port: self.spec.port,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only snapshot of one server's state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub healthy: bool,
    pub port: Option<u16>,
    pub last_error: Option<String>,
}
