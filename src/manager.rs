//! Server orchestration: the supervisor state machine and crash governor.
//!
//! The `Manager` owns every `ServerState` behind a single lock, which is
//! the crate's one serialization point. Everything that happens off the
//! supervisor -- reader lines, child exits, probe results, timer expiries --
//! arrives as an `Event` on an mpsc channel and is applied under that lock,
//! in channel order. Manager methods take the same lock directly and never
//! hold it across I/O or sleeps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::config::Settings;
use crate::events::Event;
use crate::health::{self, ProbeTiming};
use crate::runner;
use crate::state::{ServerInfo, ServerState, ServerStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Delay between the group SIGKILLs and the per-port survivor sweep.
const PORT_SWEEP_DELAY: Duration = Duration::from_millis(400);
/// Final wait for the kernel to release the swept ports.
const PORT_RELEASE_WAIT: Duration = Duration::from_secs(1);

/// Timing knobs for the supervisor. The defaults are the production
/// values; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    /// Per-server log ring capacity.
    pub max_log_lines: usize,
    /// Rolling window the crash governor counts within.
    pub crash_window: Duration,
    /// Crashes inside the window that trigger a cooldown.
    pub max_crashes: usize,
    /// Lockout after too many crashes.
    pub cooldown: Duration,
    /// Interval between health probes.
    pub health_interval: Duration,
    /// Per-address connect timeout of a probe.
    pub health_connect_timeout: Duration,
    /// Delay before the first probe after a server reaches Running.
    pub first_probe_delay: Duration,
    /// Grace between SIGTERM and SIGKILL when stopping a child.
    pub stop_grace: Duration,
    /// Delay before a post-crash restart.
    pub restart_backoff: Duration,
    /// Settle delay between the stop and start halves of a manual restart.
    pub restart_settle: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_log_lines: 5000,
            crash_window: Duration::from_secs(60),
            max_crashes: 3,
            cooldown: Duration::from_secs(300),
            health_interval: Duration::from_secs(5),
            health_connect_timeout: Duration::from_secs(2),
            first_probe_delay: Duration::from_secs(3),
            stop_grace: Duration::from_secs(1),
            restart_backoff: Duration::from_secs(2),
            restart_settle: Duration::from_millis(500),
        }
    }
}

struct Inner {
    settings: Settings,
    config_error: Option<String>,
    states: HashMap<String, ServerState>,
    /// Ids in configuration order, for stable listings.
    order: Vec<String>,
    /// Pending restart/cooldown/settle timer per server.
    timers: HashMap<String, JoinHandle<()>>,
    /// Health probe task per running server with a port.
    probers: HashMap<String, JoinHandle<()>>,
}

/// Handle to the supervisor. Cheap to clone; every clone shares the same
/// state, event channel, and change feed.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::Sender<Event>,
    changes: broadcast::Sender<ServerInfo>,
    tunables: Tunables,
    config_path: PathBuf,
}

impl Manager {
    /// Builds a manager from the settings file and starts its supervisor
    /// task. A broken settings file is tolerated: the manager runs with an
    /// empty server set and reports the problem via [`Manager::config_error`].
    pub fn new(config_path: PathBuf) -> Manager {
        Self::with_tunables(config_path, Tunables::default())
    }

    /// Like [`Manager::new`] with explicit timing knobs.
    pub fn with_tunables(config_path: PathBuf, tunables: Tunables) -> Manager {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let mut inner = Inner {
            settings: Settings::default(),
            config_error: None,
            states: HashMap::new(),
            order: Vec::new(),
            timers: HashMap::new(),
            probers: HashMap::new(),
        };
        match Settings::load(&config_path) {
            Ok(settings) => build_states(&mut inner, settings, tunables.max_log_lines),
            Err(err) => inner.config_error = Some(format!("{err:#}")),
        }
        let manager = Manager {
            inner: Arc::new(Mutex::new(inner)),
            event_tx,
            changes,
            tunables,
            config_path,
        };
        let supervisor = manager.clone();
        tokio::spawn(supervisor.run_events(event_rx));
        manager
    }

    /// Starts a server. A no-op returning success when it is already
    /// Starting or Running; starting out of Cooldown cancels the lockout.
    pub async fn start(&self, id: &str) -> Result<String> {
        self.start_inner(id, |_| true).await
    }

    /// Stops a server: pending timers and the prober are cancelled, the
    /// child group gets SIGTERM now and SIGKILL after the grace period.
    /// A no-op returning success when already Stopped.
    pub async fn stop(&self, id: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let state = inner
            .states
            .get_mut(id)
            .with_context(|| format!("unknown server: {id}"))?;
        if let Some(timer) = inner.timers.remove(id) {
            timer.abort();
        }
        if let Some(prober) = inner.probers.remove(id) {
            prober.abort();
        }
        state.healthy = false;
        state.in_cooldown = false;
        if state.status == ServerStatus::Stopped {
            return Ok(format!("{} is not running", state.spec.name));
        }
        if state.pid != 0 {
            runner::stop_group(state.pid, self.tunables.stop_grace);
        }
        state.status = ServerStatus::Stopped;
        state.reset_crashes();
        info!(server = %state.spec.name, "stopped");
        self.publish(state);
        Ok(format!("Stopping {}", state.spec.name))
    }

    /// Manual restart: stop, settle, start. Resets the crash governor and
    /// clears any cooldown.
    pub async fn restart(&self, id: &str) -> Result<String> {
        self.stop(id).await?;
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let name = inner
            .states
            .get(id)
            .map(|s| s.spec.name.clone())
            .with_context(|| format!("unknown server: {id}"))?;
        self.schedule(
            &mut inner.timers,
            id,
            self.tunables.restart_settle,
            Event::SettleExpired { id: id.to_string() },
        );
        Ok(format!("Restarting {name}"))
    }

    /// Empties a server's log ring.
    pub async fn clear_logs(&self, id: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .states
            .get_mut(id)
            .with_context(|| format!("unknown server: {id}"))?;
        state.logs.clear();
        Ok(format!("Cleared logs for {}", state.spec.name))
    }

    /// Starts every configured server, in configuration order.
    pub async fn start_all(&self) -> Result<String> {
        for id in self.ordered_ids().await {
            if let Err(err) = self.start(&id).await {
                warn!(server = %id, "start failed: {err:#}");
            }
        }
        Ok("Started all servers".to_string())
    }

    /// Stops every configured server.
    pub async fn stop_all(&self) -> Result<String> {
        for id in self.ordered_ids().await {
            if let Err(err) = self.stop(&id).await {
                warn!(server = %id, "stop failed: {err:#}");
            }
        }
        Ok("Stopped all servers".to_string())
    }

    /// Boot-time autostart. Reloads never call this; it mirrors the
    /// first-launch behavior of the UI layer.
    pub async fn start_autostart(&self) {
        let ids: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .order
                .iter()
                .filter(|id| {
                    inner
                        .states
                        .get(*id)
                        .is_some_and(|s| s.spec.auto_start)
                })
                .cloned()
                .collect()
        };
        for id in ids {
            if let Err(err) = self.start(&id).await {
                warn!(server = %id, "autostart failed: {err:#}");
            }
        }
    }

    /// Stops every current server, drops all state, and rebuilds it from
    /// the settings file. Safe to invoke while servers are running. Servers
    /// are not auto-started afterwards.
    pub async fn reload_settings(&self) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        for (_, prober) in inner.probers.drain() {
            prober.abort();
        }
        for state in inner.states.values() {
            if state.pid != 0 {
                runner::stop_group(state.pid, self.tunables.stop_grace);
            }
        }
        inner.states.clear();
        inner.order.clear();
        match Settings::load(&self.config_path) {
            Ok(settings) => {
                inner.config_error = None;
                build_states(inner, settings, self.tunables.max_log_lines);
                info!("settings reloaded");
                Ok("Settings reloaded".to_string())
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!("settings reload failed: {message}");
                inner.settings.servers.clear();
                inner.config_error = Some(message.clone());
                Err(anyhow!("{message}"))
            }
        }
    }

    /// Synchronous-best-effort teardown for process exit: SIGKILL every
    /// live group, sweep lingering holders of the configured ports, then
    /// wait for the ports to be released. The only operation that is
    /// allowed to block its caller.
    pub async fn force_stop_all(&self) {
        let ports: Vec<u16> = {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;
            for (_, timer) in inner.timers.drain() {
                timer.abort();
            }
            for (_, prober) in inner.probers.drain() {
                prober.abort();
            }
            for state in inner.states.values_mut() {
                if state.pid != 0 {
                    runner::kill_group(state.pid);
                    state.pid = 0;
                }
                state.status = ServerStatus::Stopped;
                state.healthy = false;
                state.in_cooldown = false;
                state.reset_crashes();
            }
            inner.settings.servers.iter().filter_map(|s| s.port).collect()
        };
        time::sleep(PORT_SWEEP_DELAY).await;
        for port in &ports {
            runner::kill_port_holders(*port).await;
        }
        time::sleep(PORT_RELEASE_WAIT).await;
    }

    /// Snapshots of every server, in configuration order.
    pub async fn list_info(&self) -> Vec<ServerInfo> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.states.get(id))
            .map(ServerState::info)
            .collect()
    }

    /// Snapshot of one server.
    pub async fn get_info(&self, id: &str) -> Option<ServerInfo> {
        self.inner.lock().await.states.get(id).map(ServerState::info)
    }

    /// Last `lines` log lines of one server plus the total buffered count.
    pub async fn get_logs(&self, id: &str, lines: usize) -> Option<(Vec<String>, usize)> {
        let inner = self.inner.lock().await;
        let state = inner.states.get(id)?;
        let texts = state
            .logs
            .snapshot(lines)
            .into_iter()
            .map(|entry| entry.text)
            .collect();
        Some((texts, state.logs.len()))
    }

    /// Error from the last settings load, if any.
    pub async fn config_error(&self) -> Option<String> {
        self.inner.lock().await.config_error.clone()
    }

    /// Configured control API port.
    pub async fn api_port(&self) -> u16 {
        self.inner.lock().await.settings.api_port
    }

    /// Change feed of state snapshots, for UI layers. The HTTP layer polls
    /// instead.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerInfo> {
        self.changes.subscribe()
    }

    async fn run_events(self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.apply(event).await;
        }
    }

    async fn apply(&self, event: Event) {
        match event {
            Event::Output { id, line } => {
                let mut inner = self.inner.lock().await;
                if let Some(state) = inner.states.get_mut(&id) {
                    state.logs.append(&line);
                }
            }
            Event::Exited { id, pid, code } => self.apply_exit(&id, pid, code).await,
            Event::Health { id, healthy } => {
                let mut inner = self.inner.lock().await;
                if let Some(state) = inner.states.get_mut(&id) {
                    if state.status == ServerStatus::Running && state.healthy != healthy {
                        state.healthy = healthy;
                        info!(server = %state.spec.name, healthy, "health changed");
                        self.publish(state);
                    }
                }
            }
            Event::BackoffExpired { id } => {
                // Skip when the server was stopped or entered cooldown
                // after the timer was armed.
                let _ = self
                    .start_inner(&id, |s| {
                        s.status == ServerStatus::Crashed && !s.in_cooldown
                    })
                    .await;
            }
            Event::CooldownExpired { id } => {
                let due = {
                    let mut inner = self.inner.lock().await;
                    match inner.states.get_mut(&id) {
                        Some(state) if state.status == ServerStatus::Cooldown => {
                            state.logs.append("[system] Cooldown over — restarting");
                            info!(server = %state.spec.name, "cooldown over");
                            true
                        }
                        _ => false,
                    }
                };
                if due {
                    let _ = self
                        .start_inner(&id, |s| s.status == ServerStatus::Cooldown)
                        .await;
                }
            }
            Event::SettleExpired { id } => {
                let _ = self
                    .start_inner(&id, |s| s.status == ServerStatus::Stopped)
                    .await;
            }
        }
    }

    /// The start path. `precondition` runs under the lock so governor
    /// timers cannot revive a server the user has since stopped.
    async fn start_inner(
        &self,
        id: &str,
        precondition: impl FnOnce(&ServerState) -> bool,
    ) -> Result<String> {
        let spec;
        let extra_paths;
        {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;
            let state = inner
                .states
                .get_mut(id)
                .with_context(|| format!("unknown server: {id}"))?;
            if !precondition(state) {
                return Ok(format!("{} left alone", state.spec.name));
            }
            match state.status {
                ServerStatus::Starting | ServerStatus::Running => {
                    return Ok(format!("{} is already running", state.spec.name));
                }
                ServerStatus::Cooldown => {
                    state.in_cooldown = false;
                    state.reset_crashes();
                }
                ServerStatus::Crashed | ServerStatus::Stopped => {}
            }
            if let Some(timer) = inner.timers.remove(id) {
                timer.abort();
            }
            state.status = ServerStatus::Starting;
            // A new generation begins; a late exit event from the previous
            // child must not be mistaken for this one.
            state.pid = 0;
            state.last_error = None;
            self.publish(state);
            spec = state.spec.clone();
            extra_paths = inner.settings.extra_paths.clone();
        }

        // Spawn without the lock; Starting acts as the overlap guard.
        let spawned = runner::spawn(&spec, &extra_paths, self.event_tx.clone()).await;

        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let Some(state) = inner.states.get_mut(id) else {
            // Removed by a reload while the spawn was in flight.
            if let Ok(spawned) = spawned {
                runner::kill_group(spawned.pid);
                runner::watch(spawned, self.event_tx.clone());
            }
            bail!("server {id} was removed during start");
        };
        if state.status != ServerStatus::Starting {
            if let Ok(spawned) = spawned {
                runner::kill_group(spawned.pid);
                runner::watch(spawned, self.event_tx.clone());
            }
            return Ok(format!("{} start cancelled", state.spec.name));
        }
        match spawned {
            Ok(spawned) => {
                state.pid = spawned.pid;
                state.status = ServerStatus::Running;
                state.healthy = false;
                state
                    .logs
                    .append(&format!("[system] Started with PID {}", spawned.pid));
                info!(server = %state.spec.name, pid = spawned.pid, "started");
                if let Some(port) = state.spec.port {
                    let prober = health::spawn_prober(
                        id.to_string(),
                        state.spec.hostname.clone(),
                        port,
                        self.probe_timing(),
                        self.event_tx.clone(),
                    );
                    if let Some(old) = inner.probers.insert(id.to_string(), prober) {
                        old.abort();
                    }
                }
                let name = state.spec.name.clone();
                self.publish(state);
                runner::watch(spawned, self.event_tx.clone());
                Ok(format!("Started {name}"))
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(server = %state.spec.name, "spawn failed: {message}");
                state.status = ServerStatus::Crashed;
                state.last_error = Some(message.clone());
                state.logs.append(&format!("[system] Failed to start: {message}"));
                self.publish(state);
                self.govern_crash(inner, id);
                Err(anyhow!("{message}"))
            }
        }
    }

    async fn apply_exit(&self, id: &str, pid: u32, code: Option<i32>) {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let Some(state) = inner.states.get_mut(id) else {
            return;
        };
        // A child from a previous generation; its state was already settled.
        if state.pid != pid {
            return;
        }
        state.pid = 0;
        if let Some(prober) = inner.probers.remove(id) {
            prober.abort();
        }
        state.healthy = false;
        let line = match code {
            Some(n) => format!("[system] Process exited with code {n}"),
            None => "[system] Process terminated by signal".to_string(),
        };
        state.logs.append(&line);
        let crashed = match state.status {
            // The user already stopped the server; the exit is expected.
            ServerStatus::Stopped | ServerStatus::Cooldown => {
                self.publish(state);
                false
            }
            _ => {
                if code == Some(0) {
                    info!(server = %state.spec.name, "exited cleanly");
                    state.status = ServerStatus::Stopped;
                    state.reset_crashes();
                    self.publish(state);
                    false
                } else {
                    warn!(server = %state.spec.name, ?code, "crashed");
                    state.status = ServerStatus::Crashed;
                    state.last_error = Some(line.clone());
                    self.publish(state);
                    true
                }
            }
        };
        if crashed {
            self.govern_crash(inner, id);
        }
    }

    /// Decides, after a crash, between a delayed restart and a cooldown.
    fn govern_crash(&self, inner: &mut Inner, id: &str) {
        let Some(state) = inner.states.get_mut(id) else {
            return;
        };
        let count = state.record_crash(Instant::now(), self.tunables.crash_window);
        if count >= self.tunables.max_crashes {
            state.status = ServerStatus::Cooldown;
            state.in_cooldown = true;
            state.reset_crashes();
            let minutes = self.tunables.cooldown.as_secs().div_ceil(60);
            state.logs.append(&format!(
                "[system] Too many crashes — cooldown for {minutes} minutes"
            ));
            warn!(server = %state.spec.name, "too many crashes, entering cooldown");
            self.publish(state);
            self.schedule(
                &mut inner.timers,
                id,
                self.tunables.cooldown,
                Event::CooldownExpired { id: id.to_string() },
            );
        } else {
            state.logs.append(&format!(
                "[system] Crashed — restarting ({count}/{})",
                self.tunables.max_crashes
            ));
            self.publish(state);
            self.schedule(
                &mut inner.timers,
                id,
                self.tunables.restart_backoff,
                Event::BackoffExpired { id: id.to_string() },
            );
        }
    }

    /// Arms the server's single pending timer, replacing any previous one.
    fn schedule(
        &self,
        timers: &mut HashMap<String, JoinHandle<()>>,
        id: &str,
        delay: Duration,
        event: Event,
    ) {
        let tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(event).await;
        });
        if let Some(old) = timers.insert(id.to_string(), handle) {
            old.abort();
        }
    }

    fn probe_timing(&self) -> ProbeTiming {
        ProbeTiming {
            first_delay: self.tunables.first_probe_delay,
            interval: self.tunables.health_interval,
            connect_timeout: self.tunables.health_connect_timeout,
        }
    }

    fn publish(&self, state: &ServerState) {
        let _ = self.changes.send(state.info());
    }

    async fn ordered_ids(&self) -> Vec<String> {
        self.inner.lock().await.order.clone()
    }
}

fn build_states(inner: &mut Inner, settings: Settings, max_log_lines: usize) {
    inner.order = settings.servers.iter().map(|s| s.id.clone()).collect();
    inner.states = settings
        .servers
        .iter()
        .map(|s| (s.id.clone(), ServerState::new(s.clone(), max_log_lines)))
        .collect();
    inner.settings = settings;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fast_tunables() -> Tunables {
        Tunables {
            max_log_lines: 200,
            crash_window: Duration::from_secs(30),
            max_crashes: 3,
            cooldown: Duration::from_millis(400),
            health_interval: Duration::from_millis(100),
            health_connect_timeout: Duration::from_millis(300),
            first_probe_delay: Duration::from_millis(50),
            stop_grace: Duration::from_millis(200),
            restart_backoff: Duration::from_millis(100),
            restart_settle: Duration::from_millis(100),
        }
    }

    fn write_settings(dir: &Path, specs: &[(&str, &str, Option<u16>)]) -> PathBuf {
        let servers: Vec<serde_json::Value> = specs
            .iter()
            .map(|(id, command, port)| {
                serde_json::json!({
                    "id": id,
                    "name": id,
                    "workingDir": "/tmp",
                    "command": command,
                    "port": port,
                })
            })
            .collect();
        let path = dir.join("settings.json");
        std::fs::write(&path, serde_json::json!({ "servers": servers }).to_string()).unwrap();
        path
    }

    async fn manager_for(dir: &Path, specs: &[(&str, &str, Option<u16>)]) -> Manager {
        let path = write_settings(dir, specs);
        Manager::with_tunables(path, fast_tunables())
    }

    async fn wait_for_status(manager: &Manager, id: &str, status: ServerStatus) {
        for _ in 0..200 {
            if manager.get_info(id).await.map(|i| i.status) == Some(status) {
                return;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "server {id} never reached {status}, last seen {:?}",
            manager.get_info(id).await
        );
    }

    async fn wait_for_log(manager: &Manager, id: &str, needle: &str) {
        for _ in 0..200 {
            if let Some((lines, _)) = manager.get_logs(id, 1000).await {
                if lines.iter().any(|l| l.contains(needle)) {
                    return;
                }
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        let lines = manager.get_logs(id, 1000).await;
        panic!("server {id} never logged {needle:?}; logs: {lines:?}");
    }

    async fn current_pid(manager: &Manager, id: &str) -> u32 {
        manager.inner.lock().await.states.get(id).unwrap().pid
    }

    fn pid_alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn start_is_idempotent_on_running() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "sleep 10", None)]).await;
        manager.start("a").await.unwrap();
        wait_for_status(&manager, "a", ServerStatus::Running).await;
        let pid = current_pid(&manager, "a").await;
        let message = manager.start("a").await.unwrap();
        assert!(message.contains("already running"));
        assert_eq!(current_pid(&manager, "a").await, pid, "no second child");
        manager.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn stop_on_stopped_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "sleep 10", None)]).await;
        let message = manager.stop("a").await.unwrap();
        assert!(message.contains("not running"));
        assert_eq!(
            manager.get_info("a").await.unwrap().status,
            ServerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn unknown_ids_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[]).await;
        assert!(manager.start("ghost").await.is_err());
        assert!(manager.stop("ghost").await.is_err());
        assert!(manager.get_info("ghost").await.is_none());
        assert!(manager.get_logs("ghost", 10).await.is_none());
    }

    #[tokio::test]
    async fn clean_exit_transitions_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "echo done", None)]).await;
        manager.start("a").await.unwrap();
        wait_for_status(&manager, "a", ServerStatus::Stopped).await;
        wait_for_log(&manager, "a", "done").await;
        wait_for_log(&manager, "a", "Process exited with code 0").await;
        assert!(manager.inner.lock().await.states["a"].crash_times.is_empty());
    }

    #[tokio::test]
    async fn stop_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "sleep 30", None)]).await;
        manager.start("a").await.unwrap();
        wait_for_status(&manager, "a", ServerStatus::Running).await;
        let pid = current_pid(&manager, "a").await;
        assert!(pid_alive(pid));
        manager.stop("a").await.unwrap();
        wait_for_log(&manager, "a", "Process terminated by signal").await;
        assert!(!pid_alive(pid));
        assert_eq!(
            manager.get_info("a").await.unwrap().status,
            ServerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn repeated_crashes_enter_cooldown_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "sh -c 'exit 3'", None)]).await;
        manager.start("a").await.unwrap();
        wait_for_log(&manager, "a", "Too many crashes").await;
        wait_for_status(&manager, "a", ServerStatus::Cooldown).await;
        // The 400ms test cooldown elapses and the governor starts it again.
        wait_for_log(&manager, "a", "Cooldown over").await;
        manager.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn one_crash_short_of_the_limit_does_not_cool_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(dir.path(), &[("a", "sh -c 'exit 3'", None)]);
        // A long backoff keeps the governor from racing ahead, so each
        // crash in the window happens only when the test asks for it.
        let tunables = Tunables {
            restart_backoff: Duration::from_secs(60),
            ..fast_tunables()
        };
        let manager = Manager::with_tunables(path, tunables);

        manager.start("a").await.unwrap();
        wait_for_log(&manager, "a", "(1/3)").await;
        manager.start("a").await.unwrap();
        wait_for_log(&manager, "a", "(2/3)").await;
        assert_ne!(
            manager.get_info("a").await.unwrap().status,
            ServerStatus::Cooldown,
            "two crashes inside the window must not trigger cooldown"
        );

        // The third crash inside the window is the one that locks it out.
        manager.start("a").await.unwrap();
        wait_for_status(&manager, "a", ServerStatus::Cooldown).await;
        manager.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn manual_restart_clears_the_governor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(dir.path(), &[("a", "sh -c 'exit 3'", None)]);
        let tunables = Tunables {
            cooldown: Duration::from_secs(60),
            ..fast_tunables()
        };
        let manager = Manager::with_tunables(path, tunables);
        manager.start("a").await.unwrap();
        wait_for_status(&manager, "a", ServerStatus::Cooldown).await;

        manager.restart("a").await.unwrap();
        // The settle timer fires and the governor starts a fresh window.
        wait_for_status(&manager, "a", ServerStatus::Crashed).await;
        let (lines, _) = manager.get_logs("a", 1000).await.unwrap();
        let fresh_windows = lines.iter().filter(|l| l.contains("(1/3)")).count();
        assert!(
            fresh_windows >= 2,
            "restart should reset the crash count, logs: {lines:?}"
        );
        manager.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn start_during_cooldown_cancels_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(dir.path(), &[("a", "sh -c 'exit 3'", None)]);
        let tunables = Tunables {
            cooldown: Duration::from_secs(60),
            ..fast_tunables()
        };
        let manager = Manager::with_tunables(path, tunables);
        manager.start("a").await.unwrap();
        wait_for_status(&manager, "a", ServerStatus::Cooldown).await;
        let _ = manager.start("a").await;
        let status = manager.get_info("a").await.unwrap().status;
        assert_ne!(status, ServerStatus::Cooldown);
        manager.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn health_follows_the_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "sleep 10", Some(port))]).await;
        manager.start("a").await.unwrap();
        for _ in 0..100 {
            if manager.get_info("a").await.unwrap().healthy {
                break;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        assert!(manager.get_info("a").await.unwrap().healthy);
        manager.stop("a").await.unwrap();
        let info = manager.get_info("a").await.unwrap();
        assert!(!info.healthy, "leaving Running forces healthy to false");
        drop(listener);
    }

    #[tokio::test]
    async fn spawn_failure_is_governed_like_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            manager_for(dir.path(), &[("a", "sleep 10", None)]).await;
        {
            // Point the spec at a directory that does not exist.
            let mut inner = manager.inner.lock().await;
            inner.states.get_mut("a").unwrap().spec.working_dir =
                "/nonexistent/dockhand".to_string();
        }
        let err = manager.start("a").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        let info = manager.get_info("a").await.unwrap();
        assert_eq!(info.status, ServerStatus::Crashed);
        assert!(info.last_error.is_some());
        manager.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn logs_flow_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            manager_for(dir.path(), &[("a", "sh -c 'echo hello; echo world >&2'", None)]).await;
        manager.start("a").await.unwrap();
        wait_for_log(&manager, "a", "hello").await;
        wait_for_log(&manager, "a", "[stderr] world").await;
        manager.clear_logs("a").await.unwrap();
        let (lines, total) = manager.get_logs("a", 100).await.unwrap();
        assert!(lines.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn list_preserves_configuration_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(
            dir.path(),
            &[("zeta", "sleep 1", None), ("alpha", "sleep 1", None)],
        )
        .await;
        let ids: Vec<String> = manager.list_info().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn reload_replaces_the_server_set() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(
            dir.path(),
            &[("a", "sleep 30", None), ("b", "sleep 30", None)],
        )
        .await;
        manager.start("a").await.unwrap();
        wait_for_status(&manager, "a", ServerStatus::Running).await;
        let old_pid = current_pid(&manager, "a").await;

        write_settings(
            dir.path(),
            &[("a", "sleep 30", None), ("c", "sleep 30", None)],
        );
        manager.reload_settings().await.unwrap();

        let ids: Vec<String> = manager.list_info().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(
            manager.get_info("a").await.unwrap().status,
            ServerStatus::Stopped
        );
        assert!(manager.get_info("b").await.is_none());
        for _ in 0..100 {
            if !pid_alive(old_pid) {
                break;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!pid_alive(old_pid), "the old child must be gone");
    }

    #[tokio::test]
    async fn broken_settings_reload_keeps_api_alive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "sleep 1", None)]).await;
        std::fs::write(dir.path().join("settings.json"), "{ broken").unwrap();
        assert!(manager.reload_settings().await.is_err());
        assert!(manager.list_info().await.is_empty());
        assert!(manager.config_error().await.is_some());
    }

    #[tokio::test]
    async fn force_stop_all_kills_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "sleep 30", None)]).await;
        manager.start("a").await.unwrap();
        wait_for_status(&manager, "a", ServerStatus::Running).await;
        let pid = current_pid(&manager, "a").await;
        manager.force_stop_all().await;
        assert!(!pid_alive(pid));
        assert_eq!(
            manager.get_info("a").await.unwrap().status,
            ServerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn change_feed_reports_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[("a", "sleep 5", None)]).await;
        let mut changes = manager.subscribe();
        manager.start("a").await.unwrap();
        let first = time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.status, ServerStatus::Starting);
        manager.stop("a").await.unwrap();
    }
}
