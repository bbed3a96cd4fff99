//! Lease-driven worker loop.
//!
//! A worker repeatedly leases the next dataset due for its stage, runs the
//! stage against the lease's connection and settles the lease, until the
//! stage is drained. A failing dataset is charged a retry and the loop moves
//! on; only errors that mean the store itself is unusable stop it.

use std::future::Future;

use diesel_async::AsyncPgConnection;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::Dataset;
use crate::database::get_dataset;
use crate::error::PipelineError;
use crate::inference::find_all_inclusions;
use crate::profiler::profile_dataset;
use crate::queue::{Lease, LeaseQueue, Stage};
use crate::raw::load_descriptor;

/// Work performed for one dataset under a lease.
///
/// Implementations write only through `conn`, whose transaction is committed
/// together with the stage watermark or rolled back as a whole.
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    fn run(
        &self,
        conn: &mut AsyncPgConnection,
        dataset: &Dataset,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;
}

/// Profiles a scraped dataset and recomputes its inclusion edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStage;

impl StageHandler for ProcessStage {
    fn stage(&self) -> Stage {
        Stage::Process
    }

    async fn run(
        &self,
        conn: &mut AsyncPgConnection,
        dataset: &Dataset,
    ) -> Result<(), PipelineError> {
        let descriptor =
            load_descriptor(conn, &dataset.id)
                .await?
                .ok_or_else(|| PipelineError::Parse {
                    message: format!("No raw table recorded for {}", dataset.id),
                })?;

        profile_dataset(conn, dataset, &descriptor).await?;
        find_all_inclusions(conn, &dataset.id).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Worker<H> {
    id: Uuid,
    queue: LeaseQueue,
    handler: H,
}

impl<H: StageHandler> Worker<H> {
    pub fn new(queue: LeaseQueue, handler: H) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            handler,
        }
    }

    /// Runs the stage until no dataset is due for it.
    #[instrument(skip(self), fields(worker_id = %self.id, stage = %self.handler.stage()), err)]
    pub async fn run(&self) -> Result<WorkerReport, PipelineError> {
        let stage = self.handler.stage();
        let mut report = WorkerReport::default();

        while let Some(mut lease) = self.queue.lease(stage).await? {
            let dataset_id = lease.dataset_id().clone();
            let retries = lease.retries();

            let outcome = self.run_leased(&mut lease).await;
            match outcome {
                Ok(()) => match lease.commit().await {
                    Ok(()) => {
                        report.succeeded += 1;
                        info!(%dataset_id, "stage completed");
                    }
                    Err(err) if err.is_fatal() => {
                        error!(%dataset_id, error = %err, "lost the store while committing");
                        return Err(err);
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(%dataset_id, retries = retries + 1, error = %err, "stage commit failed");
                        self.queue.record_failure(&dataset_id).await?;
                    }
                },
                Err(err) => {
                    report.failed += 1;
                    warn!(%dataset_id, retries = retries + 1, error = %err, "stage failed");

                    let settled = lease.fail().await;
                    if err.is_fatal() {
                        error!(%dataset_id, error = %err, "store unavailable; stopping worker");
                        return Err(err);
                    }
                    match settled {
                        Ok(()) => {}
                        Err(settle_err) if settle_err.is_fatal() => return Err(settle_err),
                        Err(settle_err) => {
                            warn!(%dataset_id, error = %settle_err, "failed to settle lease");
                            self.queue.record_failure(&dataset_id).await?;
                        }
                    }
                }
            }
        }

        let stats = self.queue.stats().await?;
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            parked = stats.parked(stage),
            "queue drained"
        );
        Ok(report)
    }

    async fn run_leased(&self, lease: &mut Lease) -> Result<(), PipelineError> {
        let dataset_id = lease.dataset_id().clone();
        let conn = lease.conn();
        let dataset = get_dataset(conn, &dataset_id)
            .await?
            .ok_or_else(|| PipelineError::DatasetNotFound {
                dataset_id: dataset_id.to_string(),
            })?;
        self.handler.run(conn, &dataset).await
    }
}
