use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::{BackoffConfig, DispatchConfig};
use crate::dispatcher::Dispatcher;

/// Runs the dispatch core with its HTTP API and background loops.
pub struct DispatchNode {
    pub config: DispatchConfig,
    pub dispatcher: Arc<Dispatcher>,
}

impl DispatchNode {
    /// Open the dispatcher, restoring any saved state before the node starts
    /// accepting operations.
    pub async fn new(config: DispatchConfig) -> crate::error::Result<Self> {
        let dispatcher = Arc::new(Dispatcher::open(&config).await?);
        Ok(Self { config, dispatcher })
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Spawns the assignment loop (drains pending jobs onto idle engines)
    /// 2. Spawns the liveness sweep (stale engines, timed-out assignments)
    /// 3. Runs the HTTP API (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if the API listener cannot be bound or fails. The
    /// background loops log their own errors and stop with the API.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let assign_task = tokio::spawn(Self::assignment_loop(
            self.dispatcher.clone(),
            Duration::from_millis(self.config.assign_interval_ms),
            self.config.backoff,
            shutdown.clone(),
        ));

        let sweep_task = tokio::spawn(Self::sweep_loop(
            self.dispatcher.clone(),
            Duration::from_millis(self.config.sweep_interval_ms),
            shutdown.clone(),
        ));

        let state = ApiState {
            dispatcher: self.dispatcher.clone(),
        };
        let result = run_api(self.config.listen_addr, state, shutdown.clone()).await;

        // Stop the loops however the API exited.
        shutdown.cancel();
        let _ = assign_task.await;
        let _ = sweep_task.await;

        result?;
        tracing::info!("Dispatch node stopped");
        Ok(())
    }

    /// Assign pending jobs whenever work may have become possible.
    ///
    /// Wakes on dispatcher notifications (submission, idle engine, benchmark)
    /// and otherwise after `interval`. While jobs are pending but nothing can
    /// be assigned, the timed wake backs off exponentially up to the backoff
    /// cap; a notification still wakes it immediately.
    pub async fn assignment_loop(
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        backoff: BackoffConfig,
        shutdown: CancellationToken,
    ) {
        let mut delay = interval;
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = dispatcher.work_available().notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }

            match dispatcher.assign_all().await {
                Ok(assigned) if !assigned.is_empty() => {
                    tracing::debug!(count = assigned.len(), "Assignment pass bound jobs");
                    attempts = 0;
                    delay = interval;
                }
                Ok(_) => {
                    if dispatcher.pending_count().await > 0 {
                        delay = backoff.delay(attempts);
                        attempts = attempts.saturating_add(1);
                    } else {
                        attempts = 0;
                        delay = interval;
                    }
                }
                Err(e) => {
                    delay = backoff.delay(attempts);
                    attempts = attempts.saturating_add(1);
                    tracing::error!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Assignment pass failed"
                    );
                }
            }
        }

        tracing::info!("Assignment loop stopped");
    }

    /// Periodically reclaim timed-out assignments and report stale engines.
    pub async fn sweep_loop(
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match dispatcher.reclaim_expired_assignments().await {
                Ok(reclaimed) if !reclaimed.is_empty() => {
                    tracing::info!(count = reclaimed.len(), "Reclaimed timed-out assignments");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Failed to reclaim timed-out assignments"),
            }

            for engine_id in dispatcher.stale_engines().await {
                tracing::warn!(engine_id = %engine_id, "Engine heartbeat is stale");
            }
        }

        tracing::info!("Sweep loop stopped");
    }
}
