use tracing::info;

use crate::catalog::DatasetId;
use crate::config::DatabaseArgs;
use crate::database::DatabaseManager;
use crate::error::PipelineError;
use crate::queue::{LeaseQueue, QueueStats};
use crate::scrape::ScrapeStage;
use crate::socrata::{SocrataClient, SocrataConfig};
use crate::worker::{ProcessStage, Worker, WorkerReport};

/// Entry point tying the catalog, the queue and the stages to one pool.
pub struct Pipeline {
    database: DatabaseManager,
    queue: LeaseQueue,
}

impl Pipeline {
    pub fn new(args: &DatabaseArgs) -> Result<Self, PipelineError> {
        info!(max_connections = args.max_db_connections, "Initializing pipeline");

        let database = DatabaseManager::new(&args.database_url, args.max_db_connections as usize)?;
        let queue = LeaseQueue::new(database.pool());

        Ok(Self { database, queue })
    }

    /// Fetches the portal's catalog and stores every representable entry.
    pub async fn ingest(&self, socrata: SocrataConfig) -> Result<usize, PipelineError> {
        let client = SocrataClient::new(socrata)?;
        let datasets = client.fetch_catalog().await?;
        self.database.upsert_datasets(&datasets).await
    }

    pub async fn sync(&self) -> Result<usize, PipelineError> {
        self.queue.sync_from_catalog().await
    }

    pub async fn scrape(&self, socrata: SocrataConfig) -> Result<WorkerReport, PipelineError> {
        let stage = ScrapeStage::new(SocrataClient::new(socrata)?);
        Worker::new(self.queue.clone(), stage).run().await
    }

    pub async fn process(&self) -> Result<WorkerReport, PipelineError> {
        Worker::new(self.queue.clone(), ProcessStage).run().await
    }

    pub async fn status(&self) -> Result<QueueStats, PipelineError> {
        self.queue.stats().await
    }

    pub async fn requeue(&self, dataset_id: &DatasetId) -> Result<(), PipelineError> {
        if self.queue.requeue(dataset_id).await? {
            Ok(())
        } else {
            Err(PipelineError::DatasetNotFound {
                dataset_id: dataset_id.to_string(),
            })
        }
    }
}
