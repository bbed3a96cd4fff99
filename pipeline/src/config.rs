use clap::{Args, Parser, Subcommand};

use crate::catalog::DatasetId;
use crate::socrata::{SocrataConfig, DEFAULT_CATALOG_URL, DEFAULT_DOMAIN, DEFAULT_MAX_DOWNLOAD_BYTES};

#[derive(Parser, Debug, Clone)]
#[command(name = "pipeline")]
#[command(version)]
#[command(about = "Open-data catalog scraper, column profiler and inclusion inference", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub database: DatabaseArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// PostgreSQL connection URL (required)
    ///
    /// Format: postgresql://[user]:[password]@[host]:[port]/[database]
    /// Can also be set via DATABASE_URL environment variable
    #[arg(long, env = "DATABASE_URL", required = true)]
    pub database_url: String,

    /// Maximum database connections (default: 10, valid range: 1-1000)
    ///
    /// Can also be set via MAX_DB_CONNECTIONS environment variable
    #[arg(long, env = "MAX_DB_CONNECTIONS", default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub max_db_connections: u32,
}

#[derive(Args, Debug, Clone)]
pub struct PortalArgs {
    /// Open-data portal domain (default: data.cityofnewyork.us)
    ///
    /// Can also be set via SOCRATA_DOMAIN environment variable
    #[arg(long, env = "SOCRATA_DOMAIN", default_value = DEFAULT_DOMAIN)]
    pub socrata_domain: String,

    /// Discovery API endpoint
    ///
    /// Can also be set via SOCRATA_CATALOG_URL environment variable
    #[arg(long, env = "SOCRATA_CATALOG_URL", default_value = DEFAULT_CATALOG_URL)]
    pub socrata_catalog_url: String,

    /// Size cap for a single export download, in bytes (default: 128 MiB)
    ///
    /// Can also be set via MAX_DOWNLOAD_BYTES environment variable
    #[arg(long, env = "MAX_DOWNLOAD_BYTES", default_value_t = DEFAULT_MAX_DOWNLOAD_BYTES, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_download_bytes: u64,
}

impl PortalArgs {
    pub fn socrata(&self) -> SocrataConfig {
        SocrataConfig {
            domain: self.socrata_domain.clone(),
            catalog_url: self.socrata_catalog_url.clone(),
            max_download_bytes: self.max_download_bytes,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Fetch catalog metadata and upsert it into the database
    Ingest(PortalArgs),
    /// Seed and refresh queue entries from the catalog
    Sync,
    /// Scrape due datasets until the queue is drained
    Scrape(PortalArgs),
    /// Profile due datasets and infer their inclusion dependencies
    Process,
    /// Print queue statistics
    Status,
    /// Send one dataset through the whole pipeline again
    Requeue {
        #[arg(value_parser = parse_dataset_id)]
        dataset_id: DatasetId,
    },
}

fn parse_dataset_id(value: &str) -> Result<DatasetId, String> {
    value.parse().map_err(|e: crate::error::PipelineError| e.to_string())
}
