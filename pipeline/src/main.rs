use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_service::config::{Cli, Command};
use pipeline_service::database::DatabaseManager;
use pipeline_service::Pipeline;

/// Hides credentials before the URL reaches the logs.
fn redact(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeline_service=info,pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %redact(&cli.database.database_url),
        "Starting pipeline"
    );

    DatabaseManager::run_migrations(&cli.database.database_url)
        .await
        .context("Failed to migrate database")?;

    let pipeline = Pipeline::new(&cli.database)?;

    match cli.command {
        Command::Migrate => info!("Database is up to date"),
        Command::Ingest(portal) => {
            let upserted = pipeline.ingest(portal.socrata()).await?;
            info!(upserted, "Catalog ingested");
        }
        Command::Sync => {
            let affected = pipeline.sync().await?;
            info!(affected, "Queue synced");
        }
        Command::Scrape(portal) => {
            let report = pipeline.scrape(portal.socrata()).await?;
            info!(succeeded = report.succeeded, failed = report.failed, "Scrape finished");
        }
        Command::Process => {
            let report = pipeline.process().await?;
            info!(succeeded = report.succeeded, failed = report.failed, "Processing finished");
        }
        Command::Status => {
            let stats = pipeline.status().await?;
            println!("datasets queued:    {}", stats.total);
            println!("scrape pending:     {}", stats.scrape_pending);
            println!("process pending:    {}", stats.process_pending);
            println!("scrape parked:      {}", stats.scrape_parked);
            println!("process parked:     {}", stats.process_parked);
        }
        Command::Requeue { dataset_id } => {
            pipeline
                .requeue(&dataset_id)
                .await
                .with_context(|| format!("Failed to requeue {}", dataset_id))?;
            info!(%dataset_id, "Dataset requeued");
        }
    }

    Ok(())
}
