use diesel::prelude::*;
use diesel_async::{
    pooled_connection::{
        deadpool::{Object, Pool},
        AsyncDieselConnectionManager,
    },
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::{debug, info, instrument};

use crate::catalog::{Dataset, DatasetId};
use crate::error::PipelineError;
use crate::models::DatasetRow;
use crate::schema::dataset;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Clone)]
pub struct DatabaseManager {
    pool: Pool<AsyncPgConnection>,
}

impl DatabaseManager {
    /// Builds the connection pool. Migrations are run separately, see
    /// [`DatabaseManager::run_migrations`].
    pub fn new(database_url: &str, max_connections: usize) -> Result<Self, PipelineError> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(config)
            .max_size(max_connections)
            .build()
            .map_err(|e| PipelineError::Config {
                message: format!("Failed to create database pool: {}", e),
            })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> Pool<AsyncPgConnection> {
        self.pool.clone()
    }

    pub async fn conn(&self) -> Result<Object<AsyncPgConnection>, PipelineError> {
        Ok(self.pool.get().await?)
    }

    pub async fn run_migrations(database_url: &str) -> Result<(), PipelineError> {
        // diesel_migrations only drives synchronous connections.
        let database_url = database_url.to_string();
        tokio::task::spawn_blocking(move || {
            let mut connection =
                PgConnection::establish(&database_url).map_err(|e| PipelineError::Migration {
                    message: format!("Failed to establish connection for migrations: {}", e),
                })?;

            let applied = connection
                .run_pending_migrations(MIGRATIONS)
                .map_err(|e| PipelineError::Migration {
                    message: format!("Failed to run migrations: {}", e),
                })?;

            for version in &applied {
                info!(%version, "migration applied");
            }
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Migration {
            message: format!("Migration task failed: {}", e),
        })?
    }

    /// Inserts or refreshes catalog entries, one transaction per dataset.
    #[instrument(skip_all, fields(datasets = datasets.len()), err)]
    pub async fn upsert_datasets(&self, datasets: &[Dataset]) -> Result<usize, PipelineError> {
        let mut conn = self.conn().await?;

        for entry in datasets {
            let row = DatasetRow::from(entry);
            conn.transaction::<_, PipelineError, _>(|conn| {
                Box::pin(async move {
                    diesel::insert_into(dataset::table)
                        .values(&row)
                        .on_conflict(dataset::id)
                        .do_update()
                        .set(&row)
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;
            debug!(dataset_id = %entry.id, "dataset upserted");
        }

        info!(upserted = datasets.len(), "catalog updated");
        Ok(datasets.len())
    }

    pub async fn get_dataset(&self, dataset_id: &DatasetId) -> Result<Option<Dataset>, PipelineError> {
        let mut conn = self.conn().await?;
        get_dataset(&mut conn, dataset_id).await
    }
}

/// Loads one catalog entry through an existing connection, e.g. a lease's.
pub async fn get_dataset(
    conn: &mut AsyncPgConnection,
    dataset_id: &DatasetId,
) -> Result<Option<Dataset>, PipelineError> {
    dataset::table
        .find(dataset_id.as_str())
        .select(DatasetRow::as_select())
        .first::<DatasetRow>(conn)
        .await
        .optional()?
        .map(Dataset::try_from)
        .transpose()
}
