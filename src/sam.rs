//! HTTP client for the SAM.gov opportunity, attachment, and federal
//! hierarchy APIs.
//!
//! One [`SamClient`] is built per process and shared by every worker. It
//! implements the three upstream traits used by the pipeline:
//!
//! | Trait | Endpoint |
//! |-------|----------|
//! | [`OpportunitySource`] | `GET {opportunities_url}?postedFrom&postedTo&limit&offset` |
//! | [`ArchiveSource`] | `GET {archive_url}` with `{notice_id}` substituted |
//! | [`HierarchySource`] | `GET {hierarchy_url}?fhorgid=<code>` |
//!
//! The client makes exactly one request per call. Retries belong to the
//! callers ([`crate::fetcher`], [`crate::archive`], [`crate::hierarchy`]) so
//! that test doubles get the same policy.
//!
//! The API key is sent as the `api_key` query parameter and is never logged.
//! Attachment bundles are read chunk by chunk and refused once they pass
//! `max_archive_bytes`.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::archive::ArchiveSource;
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::fetcher::{OpportunitySource, SearchPage};
use crate::hierarchy::{HierarchySource, OrgNames};
use crate::models::DateWindow;

pub struct SamClient {
    http: reqwest::Client,
    api_key: String,
    opportunities_url: String,
    archive_url: String,
    hierarchy_url: String,
    max_archive_bytes: u64,
}

impl SamClient {
    /// Build the client from config and an already-resolved API key.
    pub fn new(config: &UpstreamConfig, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("srt-scraper/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_key,
            opportunities_url: config.opportunities_url.clone(),
            archive_url: config.archive_url.clone(),
            hierarchy_url: config.hierarchy_url.clone(),
            max_archive_bytes: config.max_archive_bytes,
        })
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .http
            .get(url)
            .query(&[("api_key", self.api_key.as_str())])
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(UpstreamError::from_status(status, truncate(&body, 200)))
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[async_trait]
impl OpportunitySource for SamClient {
    async fn search(
        &self,
        window: &DateWindow,
        offset: u64,
        limit: u32,
    ) -> Result<SearchPage, UpstreamError> {
        let query = [
            ("postedFrom", window.from.format("%m/%d/%Y").to_string()),
            ("postedTo", window.to.format("%m/%d/%Y").to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        let json: Value = self
            .get(&self.opportunities_url, &query)
            .await?
            .json()
            .await?;
        parse_search_page(&json)
    }
}

/// Split a search response into its record list and reported total.
pub fn parse_search_page(json: &Value) -> Result<SearchPage, UpstreamError> {
    let records = match json.get("opportunitiesData") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(UpstreamError::Malformed(format!(
                "opportunitiesData is not an array: {}",
                truncate(&other.to_string(), 80)
            )))
        }
    };
    let total_records = json.get("totalRecords").and_then(Value::as_u64);
    Ok(SearchPage {
        total_records,
        records,
    })
}

#[async_trait]
impl ArchiveSource for SamClient {
    async fn download(&self, notice_id: &str) -> Result<Vec<u8>, UpstreamError> {
        let url = self.archive_url.replace("{notice_id}", notice_id);
        let mut response = self.get(&url, &[]).await?;
        let limit = self.max_archive_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(UpstreamError::TooLarge { limit });
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (bytes.len() + chunk.len()) as u64 > limit {
                return Err(UpstreamError::TooLarge { limit });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

#[async_trait]
impl HierarchySource for SamClient {
    async fn lookup(&self, code: &str) -> Result<Option<OrgNames>, UpstreamError> {
        let json: Value = match self
            .get(&self.hierarchy_url, &[("fhorgid", code.to_string())])
            .await
        {
            Ok(resp) => resp.json().await?,
            Err(UpstreamError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(parse_org_response(&json))
    }
}

/// Read the first organisation out of a federal hierarchy response.
///
/// The agency is the first segment of `fhfullparentpathname`; the office is
/// the organisation's own name.
pub fn parse_org_response(json: &Value) -> Option<OrgNames> {
    let org = json
        .get("orglist")
        .or_else(|| json.get("orgList"))
        .and_then(Value::as_array)
        .and_then(|list| list.first())?;

    let office = org.get("fhorgname").and_then(Value::as_str)?.trim().to_string();
    let agency = org
        .get("fhfullparentpathname")
        .and_then(Value::as_str)
        .and_then(|p| p.split('.').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| office.clone());

    Some(OrgNames { agency, office })
}
