//! Shared fixtures for the database integration tests.

#![allow(dead_code)]

use std::sync::Once;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::Object;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use pgtemp::PgTempDB;

use pipeline_service::catalog::{AssetType, DataType, Dataset, DatasetId, DeclaredColumn};
use pipeline_service::database::DatabaseManager;
use pipeline_service::models::QueueEntry;
use pipeline_service::queue::{Lease, LeaseQueue, Stage};
use pipeline_service::schema::queue;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "pipeline_service=debug".into()),
            )
            .with_test_writer()
            .init();
    });
}

/// A migrated throwaway database. Dropping it deletes the database.
pub struct TestDb {
    pub db: DatabaseManager,
    pub queue: LeaseQueue,
    _temp_db: PgTempDB,
}

impl TestDb {
    pub async fn new() -> Self {
        init_tracing();

        let temp_db = PgTempDB::new();
        let url = temp_db.connection_uri();
        DatabaseManager::run_migrations(&url)
            .await
            .expect("Failed to run migrations");

        let db = DatabaseManager::new(&url, 8).expect("Failed to build pool");
        let queue = LeaseQueue::new(db.pool());

        Self {
            db,
            queue,
            _temp_db: temp_db,
        }
    }

    pub async fn conn(&self) -> Object<AsyncPgConnection> {
        self.db.conn().await.expect("Failed to get connection")
    }

    pub async fn insert_datasets(&self, datasets: &[Dataset]) {
        self.db
            .upsert_datasets(datasets)
            .await
            .expect("Failed to insert datasets");
    }

    /// Inserts a queue entry directly, bypassing queue sync.
    pub async fn insert_entry(&self, entry: QueueEntry) {
        let mut conn = self.conn().await;
        diesel::insert_into(queue::table)
            .values(&entry)
            .execute(&mut conn)
            .await
            .expect("Failed to insert queue entry");
    }

    pub async fn entry(&self, id: &DatasetId) -> QueueEntry {
        self.queue
            .entry(id)
            .await
            .expect("Failed to read queue entry")
            .expect("Queue entry not found")
    }

    pub async fn entries(&self) -> Vec<QueueEntry> {
        let mut conn = self.conn().await;
        queue::table
            .order(queue::dataset_id.asc())
            .select(QueueEntry::as_select())
            .load(&mut conn)
            .await
            .expect("Failed to list queue entries")
    }

    pub async fn set_retries(&self, id: &DatasetId, retries: i16) {
        let mut conn = self.conn().await;
        diesel::update(queue::table.find(id.as_str()))
            .set(queue::retries.eq(retries))
            .execute(&mut conn)
            .await
            .expect("Failed to set retries");
    }

    /// Leases `stage`, retrying for a while so that locks held by connections
    /// closed moments ago have time to be released by the server.
    pub async fn lease_eventually(&self, stage: Stage) -> Option<Lease> {
        for _ in 0..50 {
            if let Some(lease) = self.queue.lease(stage).await.expect("Failed to lease") {
                return Some(lease);
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        None
    }
}

pub fn id(value: &str) -> DatasetId {
    value.parse().expect("Invalid dataset id")
}

/// Current time at the microsecond precision Postgres stores.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    (Utc::now() - Duration::days(days)).trunc_subsecs(6)
}

pub fn column(name: &str, data_type: DataType) -> DeclaredColumn {
    DeclaredColumn {
        name: name.to_uppercase(),
        field_name: name.to_string(),
        sql_name: name.to_string(),
        data_type,
        description: String::new(),
    }
}

pub fn dataset(value: &str, asset_type: AssetType, updated_at: DateTime<Utc>) -> Dataset {
    Dataset {
        id: id(value),
        asset_type,
        name: format!("Dataset {}", value),
        description: String::new(),
        is_official: true,
        created_at: days_ago(30),
        updated_at,
        parents: vec![],
        columns: vec![column("a", DataType::Number), column("b", DataType::Text)],
    }
}

pub fn entry(value: &str, freshness: DateTime<Utc>) -> QueueEntry {
    QueueEntry {
        dataset_id: value.to_string(),
        freshness,
        scraped_at: None,
        processed_at: None,
        retries: 0,
    }
}

pub fn assert_near_now(timestamp: Option<DateTime<Utc>>) {
    let timestamp = timestamp.expect("Timestamp not set");
    let drift = (Utc::now() - timestamp).num_seconds().abs();
    assert!(drift < 30, "timestamp {} is {}s away from now", timestamp, drift);
}
