//! Helpers for driving a real dockhand daemon over its control API.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running dockhand daemon.
pub struct Daemon {
    child: Child,
    pub api_port: u16,
    config_path: PathBuf,
    _config_dir: TempDir,
}

impl Daemon {
    /// Start the daemon against a fresh settings file on the given API port.
    pub fn start(api_port: u16, settings_json: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("settings.json");
        std::fs::write(&config_path, settings_json).expect("write settings");

        let bin = env!("CARGO_BIN_EXE_dockhand");
        let child = Command::new(bin)
            .arg("--config")
            .arg(&config_path)
            .args(["--api-port", &api_port.to_string()])
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to start dockhand");

        let daemon = Self {
            child,
            api_port,
            config_path,
            _config_dir: dir,
        };
        assert!(
            wait_until(STARTUP_TIMEOUT, || daemon.get("/servers").is_some()),
            "daemon API never came up on port {api_port}"
        );
        daemon
    }

    /// Replace the settings file contents (the daemon re-reads on reload).
    pub fn rewrite_settings(&self, settings_json: &str) {
        std::fs::write(&self.config_path, settings_json).expect("rewrite settings");
    }

    pub fn get(&self, path: &str) -> Option<(u16, serde_json::Value)> {
        self.request("GET", path)
    }

    pub fn post(&self, path: &str) -> (u16, serde_json::Value) {
        self.request("POST", path)
            .unwrap_or_else(|| panic!("POST {path} got no response"))
    }

    pub fn request(&self, method: &str, path: &str) -> Option<(u16, serde_json::Value)> {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let text = self.raw_request(&raw)?;
        let status: u16 = text.split_whitespace().nth(1)?.parse().ok()?;
        let body = text.split_once("\r\n\r\n")?.1;
        Some((status, serde_json::from_str(body).ok()?))
    }

    /// Send raw bytes and return the full response text.
    pub fn raw_request(&self, raw: &str) -> Option<String> {
        let mut stream = TcpStream::connect(("127.0.0.1", self.api_port)).ok()?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT)).ok()?;
        stream.write_all(raw.as_bytes()).ok()?;
        let mut text = String::new();
        stream.read_to_string(&mut text).ok()?;
        Some(text)
    }

    pub fn server_status(&self, id: &str) -> Option<String> {
        let (status, body) = self.get(&format!("/servers/{id}"))?;
        if status != 200 {
            return None;
        }
        Some(body["status"].as_str()?.to_string())
    }

    pub fn server_healthy(&self, id: &str) -> bool {
        self.get(&format!("/servers/{id}"))
            .map(|(_, body)| body["healthy"] == true)
            .unwrap_or(false)
    }

    pub fn logs(&self, id: &str) -> Vec<String> {
        self.get(&format!("/servers/{id}/logs?lines=1000"))
            .map(|(_, body)| {
                body["lines"]
                    .as_array()
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(|l| l.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn wait_for_log(&self, id: &str, needle: &str, timeout: Duration) -> bool {
        wait_until(timeout, || {
            self.logs(id).iter().any(|l| l.contains(needle))
        })
    }

    pub fn wait_for_status(&self, id: &str, status: &str, timeout: Duration) -> bool {
        wait_until(timeout, || self.server_status(id).as_deref() == Some(status))
    }

    /// Extract the child PID from the "[system] Started with PID N" line.
    pub fn pid_from_logs(&self, id: &str) -> Option<u32> {
        let marker = "Started with PID ";
        self.logs(id).iter().rev().find_map(|line| {
            let start = line.find(marker)? + marker.len();
            let end = line[start..]
                .find(|c: char| !c.is_ascii_digit())
                .map(|i| i + start)
                .unwrap_or(line.len());
            line[start..end].parse().ok()
        })
    }

    pub fn send_signal(&self, sig: Signal) {
        signal::kill(Pid::from_raw(self.child.id() as i32), sig)
            .expect("failed to signal daemon");
    }

    /// Wait for the daemon process to exit within the timeout.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait().expect("try_wait failed") {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("wait on killed daemon");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_some() {
            return;
        }
        // A graceful signal first, so the daemon reaps its children.
        let _ = signal::kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.child.try_wait().ok().flatten().is_some() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Poll `f` until it returns true or the timeout elapses.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Check if a PID is still alive.
pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Wait until a PID is gone, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    wait_until(timeout, || !pid_is_alive(pid))
}

/// Settings document with the given `(id, command, port)` servers.
pub fn settings(servers: &[(&str, &str, Option<u16>)]) -> String {
    let servers: Vec<serde_json::Value> = servers
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
    serde_json::json!({ "servers": servers }).to_string()
}
