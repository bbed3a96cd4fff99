//! Client for the Socrata discovery API and the portal's export endpoints.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::catalog::{AssetType, DataType, Dataset, DatasetId, DeclaredColumn};
use crate::error::PipelineError;

pub const DEFAULT_DOMAIN: &str = "data.cityofnewyork.us";
pub const DEFAULT_CATALOG_URL: &str = "https://api.us.socrata.com/api/catalog/v1";
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 128 * 1024 * 1024;

/// The catalog API refuses larger pages.
const CATALOG_PAGE_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SocrataConfig {
    pub domain: String,
    pub catalog_url: String,
    pub max_download_bytes: u64,
}

impl Default for SocrataConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    results: Vec<CatalogResult>,
}

#[derive(Debug, Deserialize)]
struct CatalogResult {
    resource: Resource,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "type")]
    asset_type: String,
    #[serde(default)]
    provenance: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    parent_fxf: Vec<String>,
    #[serde(default)]
    columns_name: Vec<String>,
    #[serde(default)]
    columns_field_name: Vec<String>,
    #[serde(default)]
    columns_datatype: Vec<String>,
    #[serde(default)]
    columns_description: Vec<Option<String>>,
}

/// Derives the raw-table column name from a Socrata field name.
pub fn sql_name(field_name: &str) -> String {
    field_name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl TryFrom<Resource> for Dataset {
    type Error = PipelineError;

    fn try_from(resource: Resource) -> Result<Self, Self::Error> {
        let id: DatasetId = resource.id.parse()?;
        let asset_type: AssetType = resource.asset_type.parse()?;

        let arity = resource.columns_name.len();
        if resource.columns_field_name.len() != arity || resource.columns_datatype.len() != arity {
            return Err(PipelineError::Parse {
                message: format!("Column listings of {} differ in length", id),
            });
        }

        let mut descriptions = resource.columns_description.into_iter();
        let columns = resource
            .columns_name
            .into_iter()
            .zip(resource.columns_field_name)
            .zip(resource.columns_datatype)
            .map(|((name, field_name), datatype)| {
                Ok(DeclaredColumn {
                    sql_name: sql_name(&field_name),
                    name,
                    field_name,
                    data_type: datatype.parse::<DataType>()?,
                    description: descriptions.next().flatten().unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;

        let parents = resource
            .parent_fxf
            .into_iter()
            .map(DatasetId::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Dataset {
            id,
            asset_type,
            name: resource.name,
            description: resource.description.unwrap_or_default(),
            is_official: resource.provenance.as_deref() == Some("official"),
            created_at: resource.created_at,
            updated_at: resource.updated_at,
            parents,
            columns,
        })
    }
}

/// Parses a discovery API response. Entries the catalog model cannot
/// represent are logged and skipped.
pub fn parse_catalog(body: &str) -> Result<Vec<Dataset>, PipelineError> {
    let page: CatalogPage = serde_json::from_str(body)?;
    let total = page.results.len();

    let datasets: Vec<Dataset> = page
        .results
        .into_iter()
        .filter_map(|result| {
            let id = result.resource.id.clone();
            match Dataset::try_from(result.resource) {
                Ok(dataset) => Some(dataset),
                Err(error) => {
                    warn!(dataset_id = %id, %error, "skipping catalog entry");
                    None
                }
            }
        })
        .collect();

    debug!(total, parsed = datasets.len(), "catalog page parsed");
    Ok(datasets)
}

#[derive(Clone)]
pub struct SocrataClient {
    client: reqwest::Client,
    config: SocrataConfig,
}

impl SocrataClient {
    pub fn new(config: SocrataConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pipeline-service/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &SocrataConfig {
        &self.config
    }

    fn portal_url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, PipelineError> {
        let base = format!("https://{}{}", self.config.domain, path);
        Url::parse_with_params(&base, params).map_err(|e| PipelineError::Config {
            message: format!("Invalid portal URL {}: {}", base, e),
        })
    }

    pub fn rows_csv_url(&self, dataset_id: &DatasetId) -> Result<Url, PipelineError> {
        self.portal_url(
            &format!("/api/views/{}/rows.csv", dataset_id),
            &[("accessType", "DOWNLOAD")],
        )
    }

    pub fn geojson_url(&self, dataset_id: &DatasetId) -> Result<Url, PipelineError> {
        self.portal_url(
            &format!("/api/geospatial/{}", dataset_id),
            &[("method", "export"), ("format", "GeoJSON")],
        )
    }

    /// Fetches every catalog entry published on the configured domain.
    #[instrument(skip(self), fields(domain = %self.config.domain), err)]
    pub async fn fetch_catalog(&self) -> Result<Vec<Dataset>, PipelineError> {
        let limit = CATALOG_PAGE_LIMIT.to_string();
        let url = Url::parse_with_params(
            &self.config.catalog_url,
            &[
                ("domains", self.config.domain.as_str()),
                ("search_context", self.config.domain.as_str()),
                ("limit", limit.as_str()),
            ],
        )
        .map_err(|e| PipelineError::Config {
            message: format!("Invalid catalog URL {}: {}", self.config.catalog_url, e),
        })?;

        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let datasets = parse_catalog(&body)?;

        if datasets.len() >= CATALOG_PAGE_LIMIT {
            warn!(
                limit = CATALOG_PAGE_LIMIT,
                "catalog response filled a whole page; entries may be missing"
            );
        }
        info!(datasets = datasets.len(), "catalog fetched");
        Ok(datasets)
    }

    pub async fn download_rows_csv(&self, dataset_id: &DatasetId) -> Result<NamedTempFile, PipelineError> {
        self.download(self.rows_csv_url(dataset_id)?).await
    }

    pub async fn download_geojson(&self, dataset_id: &DatasetId) -> Result<NamedTempFile, PipelineError> {
        self.download(self.geojson_url(dataset_id)?).await
    }

    /// Streams `url` into a temporary file, aborting once the body exceeds
    /// the configured size cap.
    #[instrument(skip(self), fields(url = %url), err)]
    async fn download(&self, url: Url) -> Result<NamedTempFile, PipelineError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;

        let file = NamedTempFile::new()?;
        let mut out = tokio::fs::File::from_std(file.reopen()?);
        let mut size: u64 = 0;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            if size > self.config.max_download_bytes {
                return Err(PipelineError::DownloadTooLarge {
                    url: url.to_string(),
                    limit: self.config.max_download_bytes,
                });
            }
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        debug!(bytes = size, "download complete");
        Ok(file)
    }
}
