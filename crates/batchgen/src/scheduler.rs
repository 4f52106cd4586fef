//! Periodic orchestration loop.
//!
//! Each cycle submits at most one batch from the queue, polls due jobs and
//! reconciles finished ones. Cycles run on a fixed interval on a dedicated
//! thread, and can be triggered early through a broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::orchestrator::{Orchestrator, TickReport};
use crate::queue::ItemQueue;
use crate::reconciler::{ReconcileReport, Reconciler};

/// What one cycle did. A failed step is logged and leaves its field empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<TickReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileReport>,
}

/// Runs one submit, tick and reconcile cycle.
pub async fn run_cycle(
    orchestrator: &Orchestrator,
    reconciler: &Reconciler,
    queue: Option<&dyn ItemQueue>,
) -> CycleReport {
    let mut report = CycleReport::default();

    if let Some(queue) = queue {
        match orchestrator.submit_from_queue(queue).await {
            Ok(Some(job)) => {
                log::info!("Submitted job {} ({})", job.id, job.status);
                report.submitted_job = Some(job.id);
            }
            Ok(None) => {}
            Err(e) => log::error!("Submitting from queue failed: {}", e),
        }
    }

    match orchestrator.tick().await {
        Ok(tick) => report.tick = Some(tick),
        Err(e) => log::error!("Polling tick failed: {}", e),
    }

    match reconciler.run().await {
        Ok(reconcile) => report.reconcile = Some(reconcile),
        Err(e) => log::error!("Reconciliation failed: {}", e),
    }

    report
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    reconciler: Arc<Reconciler>,
    queue: Option<Arc<dyn ItemQueue>>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        reconciler: Arc<Reconciler>,
        queue: Option<Arc<dyn ItemQueue>>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            reconciler,
            queue,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the loop in a background thread. The first cycle runs
    /// immediately; `trigger_rx` requests an early cycle.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let reconciler = Arc::clone(&self.reconciler);
        let queue = self.queue.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start scheduler runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await;

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    run_cycle(&orchestrator, &reconciler, queue.as_deref()).await;

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Cycle triggered");
                        },
                    }
                }
                log::info!("Scheduler stopped");
            });
        })
    }

    /// Signals the loop to stop after the current cycle.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
