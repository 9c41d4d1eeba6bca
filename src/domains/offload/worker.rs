use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;

use super::orchestrator::{OffloadOrchestrator, TickReport, TickStatus, TickTrigger};
use crate::errors::DomainResult;

/// Background worker running a scheduled tick of both queues at a fixed interval.
pub struct OffloadWorker {
    orchestrator: Arc<OffloadOrchestrator>,
    interval: Duration,
    shutdown_signal: Option<oneshot::Receiver<()>>,
}

impl OffloadWorker {
    pub fn new(orchestrator: Arc<OffloadOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown_signal: None,
        }
    }

    /// Set shutdown signal receiver
    pub fn with_shutdown_signal(mut self, receiver: oneshot::Receiver<()>) -> Self {
        self.shutdown_signal = Some(receiver);
        self
    }

    /// Start the worker loop
    pub async fn start(mut self) {
        log::info!("Starting offload worker (interval {:?})", self.interval);
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        // Held outside the loop so a tick winning the select does not drop the receiver.
        let mut shutdown = self.shutdown_signal.take();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = async {
                    match shutdown.as_mut() {
                        Some(signal) => {
                            let _ = signal.await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    log::info!("Received shutdown signal, stopping offload worker");
                    break;
                }
            }
        }
    }

    /// One scheduled pass: optimization first, so freshly optimized files can
    /// be picked up by the migration queue in the same pass.
    pub async fn tick(&self) {
        log_tick(self.orchestrator.run_optimization_tick(TickTrigger::Scheduled).await);
        log_tick(self.orchestrator.run_migration_tick(TickTrigger::Scheduled).await);
    }
}

fn log_tick(result: DomainResult<TickReport>) {
    match result {
        Ok(report) => match report.status {
            TickStatus::Processed | TickStatus::Failed => log::info!(
                "{} tick {:?}: {} succeeded, {} failed, {} remaining",
                report.queue,
                report.status,
                report.succeeded,
                report.failed,
                report.remaining
            ),
            TickStatus::NotConfigured => {
                log::warn!("{} tick skipped: {}", report.queue, report.messages.join("; "))
            }
            _ => log::debug!("{} tick {:?}", report.queue, report.status),
        },
        Err(e) => log::error!("Error running offload tick: {:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffloadConfig;
    use crate::domains::offload::services::tests_support::Harness;

    fn webp_bytes(len: usize) -> Vec<u8> {
        let mut bytes = b"RIFF\x00\x00\x00\x00WEBPVP8 ".to_vec();
        bytes.resize(len, 1);
        bytes
    }

    #[tokio::test]
    async fn test_worker_migrates_then_stops_on_signal() {
        let h = Harness::new(OffloadConfig { auto_migrate: true, ..Harness::config() }).await;
        let id = h.add_image("2024/05/a.webp", "image/webp", webp_bytes(2048)).await;

        let orchestrator = Arc::new(OffloadOrchestrator::new(h.services.clone()));
        let (tx, rx) = oneshot::channel();
        let worker = OffloadWorker::new(orchestrator, Duration::from_millis(20)).with_shutdown_signal(rx);
        let handle = tokio::spawn(worker.start());

        // The first interval tick fires immediately.
        let mut migrated = false;
        for _ in 0..50 {
            time::sleep(Duration::from_millis(20)).await;
            if h.services.resolver.require_asset(id).await.unwrap().flags.migrated {
                migrated = true;
                break;
            }
        }
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(migrated);
    }

    #[tokio::test]
    async fn test_disabled_switches_leave_queues_alone() {
        let h = Harness::new(Harness::config()).await;
        h.add_image("2024/05/a.webp", "image/webp", webp_bytes(2048)).await;
        let worker = OffloadWorker::new(
            Arc::new(OffloadOrchestrator::new(h.services.clone())),
            Duration::from_secs(60),
        );
        worker.tick().await;
        assert_eq!(h.services.migration_queue.size().await.unwrap(), 0);
        assert!(h.remote_storage.keys().is_empty());
    }
}
