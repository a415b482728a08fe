//! Child process execution and stream capture.
//!
//! This module spawns each server under `/bin/sh` in its own process group,
//! pumps stdout/stderr into the supervisor's event channel, and reports
//! exits. It also owns group signaling and the pre-spawn cleanup of orphans
//! and stale toolchain lock files.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time;
use tracing::debug;

use crate::config::{expand_tilde, ServerSpec};
use crate::events::Event;
use crate::output::StreamKind;

/// Lock files left behind by dev toolchains that block a clean restart.
const STALE_LOCK_FILES: &[&str] = &[".next/dev/lock"];

const PREFLIGHT_TIMEOUT: Duration = Duration::from_millis(500);

/// A spawned child with its reader tasks already pumping output events.
///
/// Exit reporting is deliberately split out: the caller records the PID
/// first and only then hands the child to [`watch`], so an exit event can
/// never outrun the bookkeeping for the spawn that produced it. Stopping a
/// child goes through its process group, not this handle.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: u32,
    id: String,
    child: tokio::process::Child,
    stdout_task: Option<tokio::task::JoinHandle<()>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
}

/// Spawns the server's command and wires up its streams.
///
/// The child runs under `/bin/sh -c` with an augmented PATH and
/// `FORCE_COLOR=1`, in its own process group so the whole shell subtree can
/// be signaled via the group id. Reader tasks post each output line as an
/// event.
pub async fn spawn(
    spec: &ServerSpec,
    extra_paths: &[String],
    tx: mpsc::Sender<Event>,
) -> Result<SpawnedChild> {
    let working_dir = expand_tilde(&spec.working_dir);
    if !working_dir.is_dir() {
        bail!("working directory {} does not exist", working_dir.display());
    }
    preflight(&spec.command, &working_dir).await;

    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(shell_line(&spec.command, &resolve_extra_paths(extra_paths)));
    command.current_dir(&working_dir);
    command.env("FORCE_COLOR", "1");
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.name))?;
    let pid = child.id().unwrap_or(0);

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_stream(spec.id.clone(), StreamKind::Stdout, out, tx.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_stream(spec.id.clone(), StreamKind::Stderr, err, tx.clone())));

    Ok(SpawnedChild {
        pid,
        id: spec.id.clone(),
        child,
        stdout_task,
        stderr_task,
    })
}

/// Hands the child to a waiter task that reaps it and reports the exit.
///
/// The waiter drains both readers before posting the exit, which keeps
/// every output line ahead of the exit event in the channel.
pub fn watch(mut spawned: SpawnedChild, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let status = spawned.child.wait().await;
        if let Some(task) = spawned.stdout_task.take() {
            let _ = task.await;
        }
        if let Some(task) = spawned.stderr_task.take() {
            let _ = task.await;
        }
        let code = match status {
            Ok(status) => status.code(),
            Err(_) => None,
        };
        let _ = tx
            .send(Event::Exited {
                id: spawned.id,
                pid: spawned.pid,
                code,
            })
            .await;
    });
}

/// Sends a signal to the child's whole process group. A dead group is not
/// an error.
pub fn signal_group(pid: u32, sig: Signal) {
    if pid == 0 {
        return;
    }
    if let Err(err) = signal::killpg(Pid::from_raw(pid as i32), sig) {
        debug!("signal {sig:?} to group {pid} failed: {err}");
    }
}

/// Graceful stop: SIGTERM the group now, SIGKILL it after `grace`.
///
/// The escalation runs detached so callers never block; the exit itself is
/// observed through the waiter task's event.
pub fn stop_group(pid: u32, grace: Duration) {
    signal_group(pid, Signal::SIGTERM);
    tokio::spawn(async move {
        time::sleep(grace).await;
        signal_group(pid, Signal::SIGKILL);
    });
}

/// Immediate SIGKILL of the group.
pub fn kill_group(pid: u32) {
    signal_group(pid, Signal::SIGKILL);
}

/// SIGKILLs whatever still holds `port`, using `lsof` when available.
pub async fn kill_port_holders(port: u16) {
    let output = Command::new("lsof")
        .args(["-ti", &format!(":{port}")])
        .output()
        .await;
    let output = match output {
        Ok(output) => output,
        Err(err) => {
            debug!("lsof unavailable, skipping port {port} sweep: {err}");
            return;
        }
    };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Ok(pid) = line.trim().parse::<i32>() {
            debug!("killing pid {pid} still holding port {port}");
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

// Best-effort cleanup before a spawn: kill orphans from a previous
// supervisor life that match this server's working dir and command word,
// and remove stale toolchain lock files. Failures are normal here.
async fn preflight(command_line: &str, working_dir: &Path) {
    if let Some(first) = first_word(command_line) {
        let pattern = format!("{}.*{}", working_dir.display(), first);
        let _ = time::timeout(
            PREFLIGHT_TIMEOUT,
            Command::new("pkill").arg("-f").arg(&pattern).status(),
        )
        .await;
    }
    for rel in STALE_LOCK_FILES {
        let lock = working_dir.join(rel);
        if lock.exists() {
            if let Err(err) = std::fs::remove_file(&lock) {
                debug!("could not remove stale lock {}: {err}", lock.display());
            }
        }
    }
}

fn first_word(command_line: &str) -> Option<String> {
    shell_words::split(command_line)
        .ok()
        .and_then(|words| words.into_iter().next())
}

/// Existing directories from the configured extras plus a best-effort NVM
/// toolchain, tilde-expanded.
fn resolve_extra_paths(extra: &[String]) -> Vec<String> {
    let mut paths: Vec<String> = extra
        .iter()
        .map(|p| expand_tilde(p))
        .filter(|p| p.is_dir())
        .map(|p| p.display().to_string())
        .collect();
    if let Some(node_bin) = node_toolchain_candidate() {
        paths.push(node_bin.display().to_string());
    }
    paths
}

// Newest installed NVM node version, if any.
fn node_toolchain_candidate() -> Option<PathBuf> {
    let versions = dirs::home_dir()?.join(".nvm/versions/node");
    let mut installed: Vec<PathBuf> = std::fs::read_dir(&versions)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    installed.sort();
    let bin = installed.pop()?.join("bin");
    bin.is_dir().then_some(bin)
}

fn shell_line(command_line: &str, paths: &[String]) -> String {
    if paths.is_empty() {
        format!("exec {command_line}")
    } else {
        format!(
            "export PATH=\"{}:$PATH\" && exec {command_line}",
            paths.join(":")
        )
    }
}

async fn read_stream<R>(id: String, stream: StreamKind, reader: R, tx: mpsc::Sender<Event>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                let text = String::from_utf8_lossy(&buf);
                let line = match stream {
                    StreamKind::Stdout => text.into_owned(),
                    StreamKind::Stderr => format!("[stderr] {text}"),
                };
                if tx.send(Event::Output { id: id.clone(), line }).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}
