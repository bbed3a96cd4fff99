//! A Postgres-backed lease queue sequencing the per-dataset pipeline.
//!
//! Every schedulable dataset owns one `queue` row holding three watermarks:
//! the catalog freshness, the last successful scrape and the last
//! successful processing run. A stage is due for a dataset while its
//! upstream watermark is newer than its own.
//!
//! A worker claims a row with `SELECT ... FOR UPDATE SKIP LOCKED` inside a
//! transaction that stays open for the whole stage, so concurrent workers
//! receive different rows instead of waiting on each other. The stage's own
//! writes run inside a savepoint nested in that transaction: on success the
//! savepoint is released and the watermark advanced, on failure it is
//! rolled back and only the retry increment is committed. A worker that
//! dies mid-stage never commits, which leaves the row untouched and
//! unlocked.

use diesel::dsl::sql;
use diesel::expression::SqlLiteral;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, SmallInt, Timestamptz};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use tracing::{debug, info, instrument, warn};

use crate::catalog::DatasetId;
use crate::error::PipelineError;
use crate::models::QueueEntry;
use crate::schema::queue;

/// Entries that failed this many times are parked until the next resync.
pub const RETRY_CAP: i16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Scrape,
    Process,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::Process => "process",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database clock, so every watermark is written by the same clock.
fn db_now() -> SqlLiteral<Nullable<Timestamptz>> {
    sql::<Nullable<Timestamptz>>("now()")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, QueryableByName)]
pub struct QueueStats {
    #[diesel(sql_type = BigInt)]
    pub total: i64,
    #[diesel(sql_type = BigInt)]
    pub scrape_pending: i64,
    #[diesel(sql_type = BigInt)]
    pub process_pending: i64,
    /// Due for scraping but out of retries.
    #[diesel(sql_type = BigInt)]
    pub scrape_parked: i64,
    /// Due for processing but out of retries.
    #[diesel(sql_type = BigInt)]
    pub process_parked: i64,
}

impl QueueStats {
    pub fn parked(&self, stage: Stage) -> i64 {
        match stage {
            Stage::Scrape => self.scrape_parked,
            Stage::Process => self.process_parked,
        }
    }
}

#[derive(Clone)]
pub struct LeaseQueue {
    pool: Pool<AsyncPgConnection>,
}

impl LeaseQueue {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }

    pub async fn lease_for_scrape(&self) -> Result<Option<Lease>, PipelineError> {
        self.lease(Stage::Scrape).await
    }

    pub async fn lease_for_process(&self) -> Result<Option<Lease>, PipelineError> {
        self.lease(Stage::Process).await
    }

    /// Claims one entry due for `stage`, preferring entries with fewer
    /// failures. `None` means the stage is currently drained.
    #[instrument(skip(self), err)]
    pub async fn lease(&self, stage: Stage) -> Result<Option<Lease>, PipelineError> {
        let mut conn = self.pool.get().await?;

        AnsiTransactionManager::begin_transaction(&mut *conn).await?;
        let claimed = match claim(&mut conn, stage).await {
            Ok(claimed) => claimed,
            Err(err) => {
                discard(conn);
                return Err(err.into());
            }
        };

        let Some((dataset_id, retries)) = claimed else {
            AnsiTransactionManager::commit_transaction(&mut *conn).await?;
            debug!("queue drained");
            return Ok(None);
        };

        let dataset_id: DatasetId = match dataset_id.try_into() {
            Ok(id) => id,
            Err(err) => {
                discard(conn);
                return Err(err);
            }
        };

        // Savepoint isolating the stage's writes from the queue bookkeeping.
        AnsiTransactionManager::begin_transaction(&mut *conn).await?;

        debug!(%dataset_id, retries, "lease acquired");
        Ok(Some(Lease {
            conn: Some(conn),
            stage,
            dataset_id,
            retries,
        }))
    }

    /// Seeds and refreshes queue entries from the catalog.
    ///
    /// Only root datasets and maps are queued. Freshness is clamped to the
    /// current time, and an existing entry is only touched when the catalog
    /// reports a strictly newer, non-future timestamp, in which case its
    /// retries are reset. Running it twice on an unchanged catalog changes
    /// nothing.
    #[instrument(skip(self), err)]
    pub async fn sync_from_catalog(&self) -> Result<usize, PipelineError> {
        let mut conn = self.pool.get().await?;
        let affected = diesel::sql_query(indoc::indoc! {r#"
            INSERT INTO queue (dataset_id, freshness)
            SELECT id, LEAST(updated_at, now())
            FROM metadata.dataset
            WHERE asset_type IN ('dataset', 'map') AND cardinality(parents) = 0
            ON CONFLICT (dataset_id) DO UPDATE
                SET freshness = excluded.freshness, retries = 0
                WHERE excluded.freshness > queue.freshness
                  AND excluded.freshness < now()
        "#})
        .execute(&mut conn)
        .await?;

        info!(affected, "queue synced from catalog");
        Ok(affected)
    }

    /// Forces a dataset through the whole pipeline again and clears its
    /// retry counter.
    #[instrument(skip(self), err)]
    pub async fn requeue(&self, dataset_id: &DatasetId) -> Result<bool, PipelineError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(queue::table.find(dataset_id.as_str()))
            .set((
                queue::scraped_at.eq(None::<chrono::DateTime<chrono::Utc>>),
                queue::processed_at.eq(None::<chrono::DateTime<chrono::Utc>>),
                queue::retries.eq(0i16),
            ))
            .execute(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    /// Charges a retry outside of any lease, for when settling the lease
    /// itself failed and its connection was discarded.
    #[instrument(skip(self), err)]
    pub async fn record_failure(&self, dataset_id: &DatasetId) -> Result<(), PipelineError> {
        let mut conn = self.pool.get().await?;
        diesel::update(queue::table.find(dataset_id.as_str()))
            .set(queue::retries.eq(queue::retries + 1i16))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn entry(&self, dataset_id: &DatasetId) -> Result<Option<QueueEntry>, PipelineError> {
        let mut conn = self.pool.get().await?;
        let entry = queue::table
            .find(dataset_id.as_str())
            .select(QueueEntry::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(entry)
    }

    pub async fn stats(&self) -> Result<QueueStats, PipelineError> {
        let mut conn = self.pool.get().await?;
        let stats = diesel::sql_query(indoc::indoc! {r#"
            SELECT
                count(*) AS total,
                count(*) FILTER (WHERE scrape_due AND retries < $1) AS scrape_pending,
                count(*) FILTER (WHERE process_due AND retries < $1) AS process_pending,
                count(*) FILTER (WHERE scrape_due AND retries >= $1) AS scrape_parked,
                count(*) FILTER (WHERE process_due AND retries >= $1) AS process_parked
            FROM (
                SELECT
                    retries,
                    (scraped_at IS NULL OR freshness > scraped_at) AS scrape_due,
                    (scraped_at IS NOT NULL
                        AND (processed_at IS NULL OR scraped_at > processed_at)) AS process_due
                FROM queue
            ) q
        "#})
        .bind::<SmallInt, _>(RETRY_CAP)
        .get_result::<QueueStats>(&mut conn)
        .await?;
        Ok(stats)
    }
}

/// Selects and row-locks one entry due for `stage`, skipping rows locked by
/// other lessees.
async fn claim(
    conn: &mut AsyncPgConnection,
    stage: Stage,
) -> Result<Option<(String, i16)>, diesel::result::Error> {
    match stage {
        Stage::Scrape => {
            queue::table
                .select((queue::dataset_id, queue::retries))
                .filter(queue::retries.lt(RETRY_CAP))
                .filter(
                    queue::scraped_at
                        .is_null()
                        .or(queue::freshness.gt(queue::scraped_at.assume_not_null())),
                )
                .order(queue::retries.asc())
                .limit(1)
                .for_update()
                .skip_locked()
                .get_result::<(String, i16)>(conn)
                .await
                .optional()
        }
        Stage::Process => {
            queue::table
                .select((queue::dataset_id, queue::retries))
                .filter(queue::retries.lt(RETRY_CAP))
                .filter(queue::scraped_at.is_not_null())
                .filter(
                    queue::processed_at.is_null().or(queue::scraped_at
                        .assume_not_null()
                        .gt(queue::processed_at.assume_not_null())),
                )
                .order(queue::retries.asc())
                .limit(1)
                .for_update()
                .skip_locked()
                .get_result::<(String, i16)>(conn)
                .await
                .optional()
        }
    }
}

/// Detaches a connection from the pool and closes it, which makes Postgres
/// roll back whatever transaction it still has open.
fn discard(conn: Object<AsyncPgConnection>) {
    drop(Object::take(conn));
}

/// An exclusive claim on one queue entry for one stage.
///
/// The stage runs its queries through [`Lease::conn`] and then calls
/// [`Lease::commit`] or [`Lease::fail`]. Dropping a lease without either
/// closes its connection: nothing is committed and the entry becomes
/// available again with its retry counter unchanged.
pub struct Lease {
    conn: Option<Object<AsyncPgConnection>>,
    stage: Stage,
    dataset_id: DatasetId,
    retries: i16,
}

impl Lease {
    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Failures recorded for this entry before this attempt.
    pub fn retries(&self) -> i16 {
        self.retries
    }

    /// Connection whose open transaction holds the lease.
    pub fn conn(&mut self) -> &mut AsyncPgConnection {
        self.conn
            .as_deref_mut()
            .expect("lease connection is held until commit or fail")
    }

    fn take_conn(&mut self) -> Object<AsyncPgConnection> {
        self.conn
            .take()
            .expect("lease connection is held until commit or fail")
    }

    /// Keeps the stage's writes, advances the stage watermark to now and
    /// resets the retry counter, all in one commit.
    #[instrument(skip(self), fields(dataset_id = %self.dataset_id, stage = %self.stage), err)]
    pub async fn commit(mut self) -> Result<(), PipelineError> {
        let mut conn = self.take_conn();
        match complete(&mut conn, self.stage, &self.dataset_id).await {
            Ok(()) => {
                debug!("lease committed");
                Ok(())
            }
            Err(err) => {
                discard(conn);
                Err(err.into())
            }
        }
    }

    /// Discards the stage's writes and commits a retry increment, leaving the
    /// watermarks untouched.
    #[instrument(skip(self), fields(dataset_id = %self.dataset_id, stage = %self.stage), err)]
    pub async fn fail(mut self) -> Result<(), PipelineError> {
        let mut conn = self.take_conn();
        match charge_retry(&mut conn, &self.dataset_id).await {
            Ok(()) => {
                debug!(retries = self.retries + 1, "lease failed");
                Ok(())
            }
            Err(err) => {
                discard(conn);
                Err(err.into())
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                dataset_id = %self.dataset_id,
                stage = %self.stage,
                "lease abandoned without commit or fail; rolling back"
            );
            discard(conn);
        }
    }
}

async fn complete(
    conn: &mut AsyncPgConnection,
    stage: Stage,
    dataset_id: &DatasetId,
) -> Result<(), diesel::result::Error> {
    AnsiTransactionManager::commit_transaction(conn).await?;

    let entry = queue::table.find(dataset_id.as_str());
    match stage {
        Stage::Scrape => {
            diesel::update(entry)
                .set((queue::scraped_at.eq(db_now()), queue::retries.eq(0i16)))
                .execute(conn)
                .await?
        }
        Stage::Process => {
            diesel::update(entry)
                .set((queue::processed_at.eq(db_now()), queue::retries.eq(0i16)))
                .execute(conn)
                .await?
        }
    };

    AnsiTransactionManager::commit_transaction(conn).await
}

async fn charge_retry(
    conn: &mut AsyncPgConnection,
    dataset_id: &DatasetId,
) -> Result<(), diesel::result::Error> {
    AnsiTransactionManager::rollback_transaction(conn).await?;

    diesel::update(queue::table.find(dataset_id.as_str()))
        .set(queue::retries.eq(queue::retries + 1i16))
        .execute(conn)
        .await?;

    AnsiTransactionManager::commit_transaction(conn).await
}
