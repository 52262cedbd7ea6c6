//! Supervised background maintenance.
//!
//! One tokio task ticks at a fixed interval and runs a sweep closure. The task
//! is owned by a [`MaintenanceHandle`]: dropping the handle stops the task,
//! and [`MaintenanceHandle::shutdown`] stops it and reports whether it panicked.

use std::any::Any;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Error returned when the maintenance task did not stop cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    /// The task panicked during a sweep
    #[error("maintenance task panicked: {0}")]
    TaskPanicked(String),
    /// The task was aborted by the runtime
    #[error("maintenance task was cancelled")]
    TaskCancelled,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired rollback records removed
    pub rollbacks_expired: usize,
    /// Stale transactions rolled back
    pub transactions_swept: usize,
    /// Stale lock holders force-released
    pub stale_locks_released: usize,
    /// Idle rate-limit keys forgotten
    pub idle_keys_removed: usize,
}

impl MaintenanceReport {
    /// Total number of removed items.
    pub fn total(&self) -> usize {
        self.rollbacks_expired
            + self.transactions_swept
            + self.stale_locks_released
            + self.idle_keys_removed
    }
}

/// Owner of the running maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Spawn a task that calls `sweep` every `period`, starting one period from now.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn<F>(period: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> MaintenanceReport + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let report = sweep();
                        if report.total() > 0 {
                            info!(
                                rollbacks_expired = report.rollbacks_expired,
                                transactions_swept = report.transactions_swept,
                                stale_locks_released = report.stale_locks_released,
                                idle_keys_removed = report.idle_keys_removed,
                                "maintenance pass"
                            );
                        } else {
                            debug!("maintenance pass, nothing to clean");
                        }
                    }
                }
            }
            debug!("maintenance task stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Stop the task and wait for it to finish.
    ///
    /// # Errors
    /// [`ShutdownError::TaskPanicked`] if a sweep panicked.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The receiver is gone only if the task already ended
            let _ = tx.send(());
        }
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        match join.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_panic() => Err(ShutdownError::TaskPanicked(panic_message(e.into_panic()))),
            Err(_) => Err(ShutdownError::TaskCancelled),
        }
    }

    /// Check if the task has stopped (shut down or panicked).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
