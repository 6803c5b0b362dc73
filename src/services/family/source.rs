//! Data sources that produce the aggregated family dataset.

use crate::error::HearthError;
use crate::services::family::model::FamilyData;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can fetch the full family dataset.
///
/// Calls may fail; callers decide whether and how to retry.
pub trait FamilyDataSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn fetch(&self) -> BoxFuture<'_, Result<FamilyData, HearthError>>;
}

/// Fetches the dataset as JSON over HTTP
#[derive(Clone)]
pub struct HttpFamilySource {
    client: Client,
    url: String,
}

impl HttpFamilySource {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.to_string(),
        }
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_json(&self) -> Result<FamilyData, HearthError> {
        let start = Instant::now();
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();

        if !status.is_success() {
            debug!(
                status = %status,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Family data request rejected"
            );
            return Err(HearthError::Upstream(format!("HTTP {}", status)));
        }

        let data: FamilyData = resp.json().await?;
        debug!(
            status = %status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            members = data.members.len(),
            todos = data.todos.len(),
            "Family data fetched"
        );
        Ok(data)
    }
}

impl FamilyDataSource for HttpFamilySource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn fetch(&self) -> BoxFuture<'_, Result<FamilyData, HearthError>> {
        self.fetch_json().boxed()
    }
}

/// Reads the dataset from a JSON file on every fetch
#[derive(Debug, Clone)]
pub struct FileFamilySource {
    path: PathBuf,
}

impl FileFamilySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<FamilyData, HearthError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            HearthError::Io(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        let data: FamilyData = serde_json::from_str(&raw)?;
        debug!(path = %self.path.display(), bytes = raw.len(), "Family data loaded from file");
        Ok(data)
    }
}

impl FamilyDataSource for FileFamilySource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn fetch(&self) -> BoxFuture<'_, Result<FamilyData, HearthError>> {
        self.read().boxed()
    }
}
