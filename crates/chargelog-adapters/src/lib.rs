//! Snapshot source contracts + the OpenChargeMap and fixture-file sources.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chargelog_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

pub const OCM_POI_ENDPOINT: &str = "https://api.openchargemap.io/v3/poi/";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("response body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("expected a JSON array of stations, got {0}")]
    UnexpectedShape(&'static str),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces one poll's worth of raw station snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_snapshots(&self) -> Result<Vec<JsonValue>, SourceError>;
}

fn into_records(value: JsonValue) -> Result<Vec<JsonValue>, SourceError> {
    match value {
        JsonValue::Array(records) => Ok(records),
        JsonValue::Object(_) => Err(SourceError::UnexpectedShape("object")),
        JsonValue::String(_) => Err(SourceError::UnexpectedShape("string")),
        JsonValue::Number(_) => Err(SourceError::UnexpectedShape("number")),
        JsonValue::Bool(_) => Err(SourceError::UnexpectedShape("boolean")),
        JsonValue::Null => Err(SourceError::UnexpectedShape("null")),
    }
}

/// Parse a provider response body into snapshot records.
pub fn parse_snapshot_body(body: &[u8]) -> Result<Vec<JsonValue>, SourceError> {
    into_records(serde_json::from_slice(body)?)
}

#[derive(Debug, Clone)]
pub struct OpenChargeMapQuery {
    pub country_code: String,
    pub max_results: usize,
    pub api_key: Option<String>,
}

impl OpenChargeMapQuery {
    pub fn url(&self) -> Result<Url, SourceError> {
        let max_results = self.max_results.to_string();
        let mut params = vec![
            ("output", "json"),
            ("countrycode", self.country_code.as_str()),
            ("maxresults", max_results.as_str()),
        ];
        if let Some(key) = self.api_key.as_deref() {
            params.push(("key", key));
        }
        let url = Url::parse_with_params(OCM_POI_ENDPOINT, &params)
            .context("building OpenChargeMap request url")?;
        Ok(url)
    }
}

pub struct OpenChargeMapSource {
    http: HttpFetcher,
    query: OpenChargeMapQuery,
}

impl OpenChargeMapSource {
    pub fn new(http: HttpFetcher, query: OpenChargeMapQuery) -> Self {
        Self { http, query }
    }
}

#[async_trait]
impl SnapshotSource for OpenChargeMapSource {
    fn source_id(&self) -> &'static str {
        "openchargemap"
    }

    async fn fetch_snapshots(&self) -> Result<Vec<JsonValue>, SourceError> {
        let url = self.query.url()?;
        let response = self.http.fetch_bytes(&url).await?;
        let records = parse_snapshot_body(&response.body)?;
        info!(
            country = %self.query.country_code,
            http_status = response.status.as_u16(),
            records = records.len(),
            "fetched station snapshots"
        );
        Ok(records)
    }
}

/// Reads a previously captured provider response from disk.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_snapshots(&self) -> Result<Vec<JsonValue>, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_snapshot_body(&bytes)
    }
}
