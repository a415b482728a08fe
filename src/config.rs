//! Settings persistence for dockhand.
//!
//! This module defines the structure of the `~/.servers/settings.json`
//! document and provides loading, validation, and atomic saving.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Port the control API binds to when the settings file does not set one.
pub const DEFAULT_API_PORT: u16 = 7378;

/// Top-level settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// The declared servers, in configuration order.
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    /// Port for the loopback control API.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Extra bin directories prepended to each child's PATH.
    #[serde(default)]
    pub extra_paths: Vec<String>,
}

/// Declarative description of one managed server.
///
/// Immutable once loaded; a reload replaces the whole set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Unique identifier, used in API routes.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Working directory for the command; a leading `~` is expanded.
    pub working_dir: String,
    /// Shell command line, executed via `/bin/sh -c`.
    pub command: String,
    /// TCP port the server is expected to listen on, if any.
    #[serde(default)]
    pub port: Option<u16>,
    /// Hostname probed for liveness.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Reserved for a future HTTP probe; the TCP prober ignores it.
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    /// Reserved for a future HTTP probe.
    #[serde(default)]
    pub use_https: bool,
    /// Start this server when the supervisor boots.
    #[serde(default)]
    pub auto_start: bool,
    /// Whether UI layers should list this server.
    #[serde(default = "default_true")]
    pub visible: bool,
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_health_check_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            api_port: DEFAULT_API_PORT,
            extra_paths: Vec::new(),
        }
    }
}

impl Settings {
    /// Reads and validates the settings document.
    ///
    /// A missing or unreadable file is an error like any other: the
    /// manager records it and keeps running with an empty server set, so
    /// the control API stays reachable for diagnostics.
    pub fn load(path: &Path) -> Result<Settings> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Writes the document atomically: temp file in the same directory,
    /// then rename over the target. The directory is created if missing.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .with_context(|| format!("settings path {} has no parent", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let body = serde_json::to_vec_pretty(self).context("failed to encode settings")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in &self.servers {
            if spec.id.is_empty() {
                bail!("server id must not be empty");
            }
            if !seen.insert(spec.id.clone()) {
                bail!("duplicate server id: {}", spec.id);
            }
        }
        Ok(())
    }
}

/// Default location of the settings document.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".servers")
        .join("settings.json")
}

/// Expands a leading `~` against the invoking user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
