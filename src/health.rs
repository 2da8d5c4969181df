//! Background probing of idle connections.
//!
//! Pipelines are spread over connections round-robin by a shared sequence
//! number. If `d` pipelines were created since the last tick and `d` is
//! smaller than the pool size `n`, only the `d` connections after the
//! previous position saw traffic; the other `n - d`, starting at the current
//! position, get a `version` probe. A busy pool is never probed.
//!
//! The probes of one tick run concurrently, each bounded by the interval.
//! Stopping the checker aborts whatever is still outstanding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::batch::CommandBuilder;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{encode_version, DecodeResponse, VersionResponse};
use crate::transport::with_deadline;

/// Handle to the running health-check task.
pub(crate) struct HealthChecker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthChecker {
    pub fn spawn(conns: Vec<Arc<Connection>>, seq: Arc<AtomicU64>, interval: Duration) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(conns, seq, interval, stop_rx));
        Self { stop, task }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::error!("Health checker task failed: {}", e);
        }
    }
}

async fn run(
    conns: Vec<Arc<Connection>>,
    seq: Arc<AtomicU64>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let n = conns.len() as u64;
    if n == 0 {
        return;
    }

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut prev = seq.load(Ordering::Acquire);

    loop {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            _ = ticker.tick() => {}
        }

        let cur = seq.load(Ordering::Acquire);
        let active = cur.wrapping_sub(prev);
        prev = cur;
        if active >= n {
            continue;
        }

        let mut probes = JoinSet::new();
        for k in 0..(n - active) {
            let conn = conns[(cur.wrapping_add(k) % n) as usize].clone();
            probes.spawn(async move {
                match probe(&conn, interval).await {
                    Ok(version) => {
                        tracing::debug!("Health probe to {} ok ({})", conn.addr(), version.version)
                    }
                    Err(e) => tracing::warn!("Health probe to {} failed: {}", conn.addr(), e),
                }
            });
        }

        tokio::select! {
            biased;
            // Dropping the set aborts the probes still running.
            _ = stop.wait_for(|stopped| *stopped) => break,
            _ = join_all(&mut probes) => {}
        }
    }
}

async fn join_all(probes: &mut JoinSet<()>) {
    while let Some(joined) = probes.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Health probe task failed: {}", e);
        }
    }
}

/// Send one `version` command on `conn` and wait for the reply.
pub(crate) async fn probe(conn: &Connection, timeout: Duration) -> Result<VersionResponse> {
    let mut builder = CommandBuilder::new(1);
    let (shared, index) = builder.push(encode_version);
    if let Some(batch) = builder.seal() {
        shared.mark_submitted();
        conn.publish(batch);
    }
    with_deadline(Some(timeout), "health probe", shared.wait()).await?;
    shared.with_record(index, VersionResponse::decode)
}
