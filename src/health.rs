//! TCP liveness probing.
//!
//! Each running server with a configured port gets a probe task that
//! periodically attempts a plain TCP connect and reports the outcome to the
//! supervisor. The probe never writes application bytes, so it cannot leak
//! into the child's logs.

use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::events::Event;

/// Probe cadence for one server.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTiming {
    /// Delay before the first probe after the server reaches Running.
    pub first_delay: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Per-address connect timeout.
    pub connect_timeout: Duration,
}

/// Spawns the periodic probe task for one server.
///
/// The task runs until aborted or until the supervisor channel closes;
/// the manager aborts it whenever the server leaves Running.
pub fn spawn_prober(
    id: String,
    hostname: String,
    port: u16,
    timing: ProbeTiming,
    tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        time::sleep(timing.first_delay).await;
        loop {
            let healthy = probe(&hostname, port, timing.connect_timeout).await;
            if tx
                .send(Event::Health {
                    id: id.clone(),
                    healthy,
                })
                .await
                .is_err()
            {
                return;
            }
            time::sleep(timing.interval).await;
        }
    })
}

/// Resolves `hostname:port` (IPv4 and IPv6) and walks the addresses in
/// order; healthy iff any address accepts a connection within the timeout.
pub async fn probe(hostname: &str, port: u16, connect_timeout: Duration) -> bool {
    let addrs = match lookup_host((hostname, port)).await {
        Ok(addrs) => addrs,
        Err(_) => return false,
    };
    for addr in addrs {
        if let Ok(Ok(_stream)) = time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            return true;
        }
    }
    false
}
