//! Upstream data source contracts + HTTP and fixture-directory implementations.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiersync_core::{ChildRecord, GrandchildRecord, ParentRecord};
use tiersync_storage::{content_digest, HttpFetcher};
use tracing::info;

pub const CRATE_NAME: &str = "tiersync-source";

/// One of the three upstream collections fetched per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Parents,
    Children,
    Grandchildren,
}

impl Collection {
    pub fn file_name(&self) -> &'static str {
        match self {
            Collection::Parents => "parents.json",
            Collection::Children => "children.json",
            Collection::Grandchildren => "grandchildren.json",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Collection::Parents => "parents",
            Collection::Children => "children",
            Collection::Grandchildren => "grandchildren",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{collection} source unavailable: {reason}")]
    Unavailable { collection: Collection, reason: String },
    #[error("{collection} payload could not be decoded: {source}")]
    Decode {
        collection: Collection,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything fetched for one cycle, in upstream order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBatch {
    pub parents: Vec<ParentRecord>,
    pub children: Vec<ChildRecord>,
    pub grandchildren: Vec<GrandchildRecord>,
    /// SHA-256 over the three collection digests; changes whenever upstream content does.
    pub digest: String,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch all three collections. Any failed retrieval fails the whole batch.
    async fn fetch_batch(&self) -> Result<SourceBatch, SourceError>;
}

/// URLs of the three collections, as listed in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceEndpoints {
    pub parents: String,
    pub children: String,
    pub grandchildren: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceRegistry {
    sources: SourceEndpoints,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        Self {
            parents: "https://jsonplaceholder.typicode.com/users".to_string(),
            children: "https://jsonplaceholder.typicode.com/posts".to_string(),
            grandchildren: "https://jsonplaceholder.typicode.com/comments".to_string(),
        }
    }
}

impl SourceEndpoints {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        Ok(registry.sources)
    }

    /// Load the registry at `path`, falling back to the defaults when the file is absent.
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn url_for(&self, collection: Collection) -> &str {
        match collection {
            Collection::Parents => &self.parents,
            Collection::Children => &self.children,
            Collection::Grandchildren => &self.grandchildren,
        }
    }
}

fn decode<T: DeserializeOwned>(collection: Collection, bytes: &[u8]) -> Result<Vec<T>, SourceError> {
    serde_json::from_slice(bytes).map_err(|source| SourceError::Decode { collection, source })
}

fn combined_digest(parts: [&str; 3]) -> String {
    content_digest(parts.join(":").as_bytes())
}

/// Fetches the three collections over HTTP, concurrently.
#[derive(Debug, Clone)]
pub struct HttpDataSource {
    http: HttpFetcher,
    endpoints: SourceEndpoints,
}

impl HttpDataSource {
    pub fn new(http: HttpFetcher, endpoints: SourceEndpoints) -> Self {
        Self { http, endpoints }
    }

    async fn fetch_collection<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> Result<(Vec<T>, String), SourceError> {
        let url = self.endpoints.url_for(collection);
        let response = self
            .http
            .fetch_bytes(&collection.to_string(), url)
            .await
            .map_err(|err| SourceError::Unavailable {
                collection,
                reason: err.to_string(),
            })?;
        let records = decode(collection, &response.body)?;
        Ok((records, response.digest))
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_batch(&self) -> Result<SourceBatch, SourceError> {
        let (parents, children, grandchildren) = tokio::try_join!(
            self.fetch_collection::<ParentRecord>(Collection::Parents),
            self.fetch_collection::<ChildRecord>(Collection::Children),
            self.fetch_collection::<GrandchildRecord>(Collection::Grandchildren),
        )?;
        let digest = combined_digest([
            parents.1.as_str(),
            children.1.as_str(),
            grandchildren.1.as_str(),
        ]);
        Ok(SourceBatch {
            parents: parents.0,
            children: children.0,
            grandchildren: grandchildren.0,
            digest,
        })
    }
}

/// Reads `parents.json`, `children.json` and `grandchildren.json` from a directory.
#[derive(Debug, Clone)]
pub struct FixtureDataSource {
    dir: PathBuf,
}

impl FixtureDataSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_collection<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> Result<(Vec<T>, String), SourceError> {
        let path = self.dir.join(collection.file_name());
        let bytes = fs::read(&path).map_err(|err| SourceError::Unavailable {
            collection,
            reason: format!("reading {}: {err}", path.display()),
        })?;
        let records = decode(collection, &bytes)?;
        Ok((records, content_digest(&bytes)))
    }
}

#[async_trait]
impl DataSource for FixtureDataSource {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_batch(&self) -> Result<SourceBatch, SourceError> {
        let (parents, parents_digest) = self.read_collection::<ParentRecord>(Collection::Parents)?;
        let (children, children_digest) = self.read_collection::<ChildRecord>(Collection::Children)?;
        let (grandchildren, grandchildren_digest) =
            self.read_collection::<GrandchildRecord>(Collection::Grandchildren)?;
        info!(dir = %self.dir.display(), "loaded fixture batch");
        Ok(SourceBatch {
            parents,
            children,
            grandchildren,
            digest: combined_digest([
                parents_digest.as_str(),
                children_digest.as_str(),
                grandchildren_digest.as_str(),
            ]),
        })
    }
}

/// Serves a prebuilt batch on every call.
#[derive(Debug, Clone, Default)]
pub struct StaticDataSource {
    batch: SourceBatch,
}

impl StaticDataSource {
    pub fn new(batch: SourceBatch) -> Self {
        Self { batch }
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch_batch(&self) -> Result<SourceBatch, SourceError> {
        Ok(self.batch.clone())
    }
}
