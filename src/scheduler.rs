//! Background-task scheduler and compaction-scheduler hooks.
//!
//! The heavy compaction scheduling (which node, which action, which run
//! length) lives outside this crate; it observes the tree through sampling
//! stats and [`IngestObserver`] notifications and dispatches jobs onto its
//! own workers. What runs *here* are the lightweight periodic chores a tree
//! needs regardless: the capped-tree trim tick and the shape report.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Notification hook consumed by the external compaction scheduler.
///
/// Called after each ingest with the deltas in the root's raw allocated and
/// written lengths, which is what spill scheduling keys off.
pub trait IngestObserver: Send + Sync {
    fn notify_ingest(&self, cnid: u64, d_r_alen: i64, d_r_wlen: i64);
}

/// Observer that ignores every notification.
pub struct NullObserver;

impl IngestObserver for NullObserver {
    fn notify_ingest(&self, _cnid: u64, _d_r_alen: i64, _d_r_wlen: i64) {}
}

/// A periodic background chore.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute one tick.
    async fn execute(&self) -> Result<()>;
}

/// Runs registered tasks on their intervals until shutdown.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = task.interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.execute().await {
                            tracing::error!(task = task.name(), error = %e, "background task failed");
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "background task shutting down");
                        break;
                    }
                }
            }
        });

        self.tasks.lock().push(handle);
        self
    }

    /// Graceful shutdown: signal every task and wait for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.await?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
