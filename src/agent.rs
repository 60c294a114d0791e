//! Agent loops: poll, sweep, upload.
//!
//! Three long-lived tasks share only the work queue, the sweep nudge, and
//! the spool directory itself:
//!
//! - the **poll loop** queries the device on a fixed interval, decodes the
//!   payload, and persists the reading off the poll path;
//! - the **sweep task** lists the spool (on a nudge from a fresh write, on
//!   a defensive timer, and once at startup) and feeds every entry name
//!   into the unbounded work queue;
//! - the **upload worker** drains the queue one entry at a time, uploads,
//!   and deletes the spool file only on confirmed success.
//!
//! Every error short of process startup is absorbed here with a log line:
//! a failed poll tick is dropped, a failed upload leaves its file for the
//! next sweep. All three loops observe a shared shutdown signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::device::{MinerClient, Reading};
use crate::spool::SpoolStore;
use crate::uploader::Uploader;

/// Command polled from the device each tick.
const POLL_COMMAND: &str = "devs";

/// First retry delay after an upload failure.
const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Upper bound on the per-entry retry delay.
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// The assembled agent: owns its collaborators, spawns the loops.
///
/// Collaborators are constructed by the caller and injected here, so tests
/// can point them at temp directories and local listeners.
#[derive(Debug)]
pub struct Agent {
    miner: MinerClient,
    spool: SpoolStore,
    uploader: Uploader,
    device_name: String,
    poll_interval: Duration,
    sweep_interval: Duration,
}

/// Handles to the running agent tasks.
pub struct AgentHandles {
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandles {
    /// Wait for all agent tasks to stop, up to `grace`.
    ///
    /// Tasks still running after the grace period are abandoned; the
    /// in-flight upload, if any, is already bounded by the client timeout.
    pub async fn join(self, grace: Duration) {
        let drain = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("Agent tasks did not stop within the grace period");
        }
    }
}

impl Agent {
    /// Assemble an agent from its collaborators.
    pub fn new(
        miner: MinerClient,
        spool: SpoolStore,
        uploader: Uploader,
        device_name: impl Into<String>,
        poll_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            miner,
            spool,
            uploader,
            device_name: device_name.into(),
            poll_interval,
            sweep_interval,
        }
    }

    /// Spawn the poll loop, sweep task, and upload worker.
    ///
    /// All three stop when `shutdown` flips to `true`.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> AgentHandles {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<String>();
        let nudge = Arc::new(Notify::new());

        let poll = tokio::spawn(poll_loop(
            self.miner,
            self.spool.clone(),
            self.device_name,
            self.poll_interval,
            Arc::clone(&nudge),
            shutdown.clone(),
        ));
        let sweep = tokio::spawn(sweep_loop(
            self.spool.clone(),
            queue_tx,
            nudge,
            self.sweep_interval,
            shutdown.clone(),
        ));
        let upload = tokio::spawn(upload_worker(self.spool, self.uploader, queue_rx, shutdown));

        AgentHandles {
            tasks: vec![poll, sweep, upload],
        }
    }
}

/// Query, decode, persist; one tick per interval.
///
/// A transport or decode failure drops the reading and waits for the next
/// tick: polling has no durability requirement, the next tick re-samples.
/// Persistence runs in a spawned task so a slow disk never delays the
/// next poll.
async fn poll_loop(
    miner: MinerClient,
    spool: SpoolStore,
    device_name: String,
    poll_interval: Duration,
    nudge: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    // First tick only after one full interval: the loop starts in its
    // sleeping state.
    let mut ticker =
        tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let raw = match miner.query(POLL_COMMAND, "").await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Device query failed, tick dropped");
                continue;
            }
        };

        let reading = match Reading::decode(&raw, &device_name) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(error = %e, "Device payload rejected, tick dropped");
                continue;
            }
        };

        let (spool, nudge) = (spool.clone(), Arc::clone(&nudge));
        tokio::spawn(async move {
            match spool.put(&reading).await {
                Ok(name) => {
                    tracing::debug!(entry = %name, "Reading spooled");
                    nudge.notify_one();
                }
                Err(e) => {
                    // Nothing retries this reading; it is gone.
                    tracing::error!(error = %e, "Failed to spool reading, data lost");
                }
            }
        });
    }
    tracing::debug!("Poll loop stopped");
}

/// List the spool and enqueue every entry name.
///
/// Runs immediately at startup (recovering entries left by a previous
/// run), on every nudge from a fresh write, and on a defensive timer so
/// failed entries are retried even while polling is idle. Nudges arriving
/// mid-sweep coalesce into at most one follow-up sweep.
async fn sweep_loop(
    spool: SpoolStore,
    queue: mpsc::UnboundedSender<String>,
    nudge: Arc<Notify>,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // The first ticker.tick() completes at once, giving the startup sweep.
        tokio::select! {
            _ = ticker.tick() => {}
            _ = nudge.notified() => {}
            _ = shutdown.changed() => break,
        }

        match spool.list().await {
            Ok(entries) => {
                let count = entries.len();
                for entry in entries {
                    // Unbounded send never blocks and never drops; a lost
                    // name would only mean latency until the next sweep,
                    // but there is no reason to accept even that.
                    if queue.send(entry.name().to_string()).is_err() {
                        tracing::debug!("Upload worker gone, stopping sweeps");
                        return;
                    }
                }
                if count > 0 {
                    tracing::debug!(count, "Sweep enqueued pending entries");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sweep failed to list spool directory");
            }
        }
    }
    tracing::debug!("Sweep task stopped");
}

/// Per-entry retry state kept by the upload worker.
///
/// In-memory only; the spool file itself is the durable record, so losing
/// this on restart just means one early retry.
#[derive(Debug, Default)]
struct BackoffState {
    failures: u32,
    not_before: Option<Instant>,
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_CAP)
}

/// Drain the queue one entry at a time: open lazily, upload, delete on 201.
///
/// Entries inside their backoff window are skipped; the file stays on disk
/// and a later sweep re-offers it. An entry whose file is gone at open
/// time was already delivered by a duplicate enqueue and is skipped
/// silently.
async fn upload_worker(
    spool: SpoolStore,
    uploader: Uploader,
    mut queue: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff: HashMap<String, BackoffState> = HashMap::new();

    loop {
        let name = tokio::select! {
            name = queue.recv() => match name {
                Some(name) => name,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        if let Some(not_before) = backoff.get(&name).and_then(|s| s.not_before) {
            if Instant::now() < not_before {
                tracing::debug!(entry = %name, "Entry inside backoff window, skipping");
                continue;
            }
        }

        let content = match spool.entry(&name).read().await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(entry = %name, "Entry already delivered, skipping");
                backoff.remove(&name);
                continue;
            }
            Err(e) => {
                tracing::warn!(entry = %name, error = %e, "Failed to read spool entry");
                continue;
            }
        };

        match uploader.upload(&name, content).await {
            Ok(()) => {
                backoff.remove(&name);
                tracing::info!(entry = %name, "Reading delivered");
                if let Err(e) = spool.remove(&name).await {
                    // A leftover file is re-uploaded later, which the
                    // at-least-once contract allows.
                    tracing::warn!(entry = %name, error = %e, "Failed to delete delivered entry");
                }
            }
            Err(e) => {
                let state = backoff.entry(name.clone()).or_default();
                state.failures += 1;
                let delay = backoff_delay(state.failures);
                state.not_before = Some(Instant::now() + delay);
                tracing::warn!(
                    entry = %name,
                    error = %e,
                    failures = state.failures,
                    retry_in = ?delay,
                    "Upload failed, entry left in spool"
                );
            }
        }
    }
    tracing::debug!("Upload worker stopped");
}
