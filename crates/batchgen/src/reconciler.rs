//! Reconciliation: hands completed items to the artifact sink and surfaces
//! failed items to operators.
//!
//! Both passes are driven by flags in the store (`delivered_at`,
//! `surfaced_at`), so a pass interrupted half-way simply resumes on the
//! next run. The sink is called before an item is flagged; a crash in
//! between redelivers the same `item_id`.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::db::DatabaseError;
use crate::sink::{ArtifactSink, Delivery};
use crate::store::JobStore;

/// A failed item reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItemReport {
    pub item_id: String,
    pub job_id: String,
    pub source_reference: String,
    pub error_detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub delivered: usize,
    /// Delivered by someone else between read and flag.
    pub already_delivered: usize,
    pub delivery_failures: usize,
    pub failed_items: Vec<FailedItemReport>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.delivered == 0
            && self.already_delivered == 0
            && self.delivery_failures == 0
            && self.failed_items.is_empty()
    }
}

pub struct Reconciler {
    store: JobStore,
    sink: Arc<dyn ArtifactSink>,
}

impl Reconciler {
    pub fn new(store: JobStore, sink: Arc<dyn ArtifactSink>) -> Self {
        Self { store, sink }
    }

    /// Runs one delivery pass and one failure-surfacing pass.
    ///
    /// A sink error leaves the item undelivered for the next run and does
    /// not stop the pass. Storage errors abort it.
    pub async fn run(&self) -> Result<ReconcileReport, DatabaseError> {
        async {
            let mut report = ReconcileReport::default();
            self.deliver_completed(&mut report).await?;
            self.surface_failed(&mut report)?;

            if !report.is_empty() {
                info!(
                    "Reconciled: {} delivered, {} delivery failures, {} failed items surfaced",
                    report.delivered,
                    report.delivery_failures,
                    report.failed_items.len()
                );
            }
            Ok(report)
        }
        .instrument(info_span!("reconcile"))
        .await
    }

    async fn deliver_completed(&self, report: &mut ReconcileReport) -> Result<(), DatabaseError> {
        for item in self.store.undelivered_items()? {
            let Some(artifact_reference) = item.artifact_reference.clone() else {
                warn!("Completed item {} has no artifact reference, skipping", item.id);
                report.delivery_failures += 1;
                continue;
            };

            let delivery = Delivery {
                item_id: item.id.clone(),
                source_reference: item.source_reference.clone(),
                artifact_reference,
            };

            if let Err(e) = self.sink.deliver(&delivery).await {
                warn!("Delivery of item {} (job {}) failed: {}", item.id, item.job_id, e);
                report.delivery_failures += 1;
                continue;
            }

            if self.store.mark_delivered(&item.id, Utc::now())? {
                debug!("Delivered item {} of job {}", item.id, item.job_id);
                report.delivered += 1;
            } else {
                report.already_delivered += 1;
            }
        }
        Ok(())
    }

    fn surface_failed(&self, report: &mut ReconcileReport) -> Result<(), DatabaseError> {
        for item in self.store.unsurfaced_failed_items()? {
            let error_detail = item
                .error_detail
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());

            if !self.store.mark_surfaced(&item.id, Utc::now())? {
                continue;
            }

            warn!(
                "Item {} of job {} failed ({}): {}",
                item.id, item.job_id, item.source_reference, error_detail
            );
            report.failed_items.push(FailedItemReport {
                item_id: item.id,
                job_id: item.job_id,
                source_reference: item.source_reference,
                error_detail,
            });
        }
        Ok(())
    }
}
