//! Signal handling and orderly teardown.
//!
//! SIGINT and SIGTERM both funnel into one shutdown trigger; the
//! coordinator then stops the control listener, force-kills every child
//! group, and waits briefly for the ports to come free. Teardown runs at
//! most once no matter how many signals land.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::info;

use crate::manager::Manager;

const FINAL_RELEASE_DELAY: Duration = Duration::from_millis(200);

/// Listens for SIGINT/SIGTERM and posts one trigger per delivery.
///
/// The loop keeps the handlers installed for the life of the process, so a
/// second signal during teardown is swallowed instead of killing us
/// mid-cleanup.
pub fn spawn_signal_listener(tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                let _ = tx.try_send(());
            }
        }
        #[cfg(not(unix))]
        {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                let _ = tx.try_send(());
            }
        }
    });
}

/// Runs the teardown sequence exactly once.
pub struct ShutdownCoordinator {
    manager: Manager,
    api_stop: Mutex<Option<oneshot::Sender<()>>>,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(manager: Manager, api_stop: oneshot::Sender<()>) -> Self {
        Self {
            manager,
            api_stop: Mutex::new(Some(api_stop)),
            started: AtomicBool::new(false),
        }
    }

    /// Banner, API stop, forced teardown, port-release pause. Idempotent:
    /// re-entry returns immediately while the first run proceeds.
    pub async fn run(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        if let Ok(mut api_stop) = self.api_stop.lock() {
            if let Some(stop) = api_stop.take() {
                let _ = stop.send(());
            }
        }
        self.manager.force_stop_all().await;
        time::sleep(FINAL_RELEASE_DELAY).await;
        info!("shutdown complete");
    }
}
