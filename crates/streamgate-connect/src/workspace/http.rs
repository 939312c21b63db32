//! Portal HTTP API transport
//!
//! Talks to the workspace portal with a bearer token:
//!
//! | Request | Purpose |
//! |---------|---------|
//! | `GET /workspaces/{id}` | workspace info (status, broker) |
//! | `GET /workspaces` | lookup by name when the id lookup 404s |
//! | `GET /workspaces/{id}/topics` | topic resolution |
//! | `GET /workspaces/{id}/topics/{topic}/records?offset=&limit=` | record pages |
//!
//! Record keys and values travel base64 encoded. Ids and topic names are
//! percent-encoded as single path segments.

use super::{prepend_workspace_id, FetchBatch, FetchRequest, WorkspaceTransport};
use crate::error::{ConnectorError, ConnectorResult};
use crate::record::Record;
use crate::types::SensitiveString;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::DateTime;
use reqwest::{Client, Response, StatusCode};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use validator::Validate;

fn default_timeout_ms() -> u64 {
    30_000
}

/// Where the portal API lives
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct PortalConfig {
    /// Portal base URL (e.g. `https://portal.example.com/api`)
    #[validate(url)]
    pub portal_url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

/// Broker settings block of a workspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSettings {
    #[serde(default)]
    pub broker_type: String,
    #[serde(default)]
    pub sync_topics: bool,
}

/// Broker connection details of a workspace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub security_mode: Option<String>,
    #[serde(default)]
    pub sasl_mechanism: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SensitiveString>,
    #[serde(default)]
    pub has_certificate: bool,
}

/// Workspace as described by the portal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub workspace_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    /// Top-level broker type; v1 payloads carry only this
    #[serde(default)]
    pub broker_type: Option<String>,
    #[serde(default)]
    pub broker: Option<BrokerInfo>,
    #[serde(default)]
    pub broker_settings: Option<BrokerSettings>,
    #[serde(default)]
    pub version: Option<u32>,
}

impl WorkspaceInfo {
    pub const READY: &'static str = "Ready";

    pub fn is_ready(&self) -> bool {
        self.status == Self::READY
    }

    /// Broker settings, derived from the top-level broker type for v1 payloads
    pub fn broker_settings(&self) -> BrokerSettings {
        self.broker_settings.clone().unwrap_or_else(|| BrokerSettings {
            broker_type: self.broker_type.clone().unwrap_or_default(),
            sync_topics: false,
        })
    }

    fn matches(&self, id_or_name: &str) -> bool {
        self.workspace_id == id_or_name || self.name == id_or_name
    }
}

#[derive(Debug, Deserialize)]
struct TopicInfo {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RecordsPage {
    #[serde(default)]
    records: Vec<WireRecord>,
    next_offset: u64,
    #[serde(default)]
    end_of_stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    offset: u64,
    #[serde(default)]
    key: Option<String>,
    value: String,
    #[serde(default)]
    timestamp_ms: Option<i64>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// Authenticated access to one workspace
#[derive(Debug)]
pub struct HttpHandle {
    pub workspace: WorkspaceInfo,
    token: SensitiveString,
}

/// Which call an HTTP failure happened in; connect-time failures are
/// `Unavailable`, stream-time failures are `Transient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Stream,
}

/// [`WorkspaceTransport`] over the portal HTTP API
#[derive(Debug, Clone)]
pub struct HttpWorkspaceTransport {
    client: Client,
    base_url: url::Url,
}

impl HttpWorkspaceTransport {
    pub fn new(config: &PortalConfig) -> ConnectorResult<Self> {
        let parsed = url::Url::parse(&config.portal_url).map_err(|e| {
            ConnectorError::config(format!("invalid portal_url '{}': {}", config.portal_url, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConnectorError::config(format!(
                "portal_url must use http or https, got '{}'",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ConnectorError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    /// Base URL with `segments` appended, each encoded as one path segment
    fn endpoint(&self, segments: &[&str]) -> ConnectorResult<url::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ConnectorError::config(format!("portal_url '{}' cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Look a workspace up by id, falling back to a search by name
    pub async fn find_workspace(
        &self,
        id_or_name: &str,
        token: &SensitiveString,
    ) -> ConnectorResult<WorkspaceInfo> {
        let url = self.endpoint(&["workspaces", id_or_name])?;
        let response = self.get(url, token, Phase::Connect).await?;

        if response.status() != StatusCode::NOT_FOUND {
            return parse_json(check_status(response, Phase::Connect).await?).await;
        }

        debug!(workspace = id_or_name, "Workspace id not found, searching by name");
        let url = self.endpoint(&["workspaces"])?;
        let response = self.get(url, token, Phase::Connect).await?;
        let all: Vec<WorkspaceInfo> = parse_json(check_status(response, Phase::Connect).await?).await?;
        select_workspace(all, id_or_name)
    }

    async fn get(&self, url: url::Url, token: &SensitiveString, phase: Phase) -> ConnectorResult<Response> {
        self.client
            .get(url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| send_error(e, phase))
    }
}

#[async_trait]
impl WorkspaceTransport for HttpWorkspaceTransport {
    type Handle = HttpHandle;

    async fn authenticate(
        &self,
        workspace_id: &str,
        token: &SensitiveString,
    ) -> ConnectorResult<HttpHandle> {
        let workspace = self.find_workspace(workspace_id, token).await?;
        if !workspace.is_ready() {
            return Err(ConnectorError::unavailable(format!(
                "workspace '{}' is in status '{}' (expected '{}')",
                workspace.workspace_id,
                workspace.status,
                WorkspaceInfo::READY
            )));
        }

        info!(
            workspace = %workspace.workspace_id,
            broker_type = %workspace.broker_settings().broker_type,
            "Authenticated against workspace"
        );
        Ok(HttpHandle {
            workspace,
            token: token.clone(),
        })
    }

    async fn resolve_topic(&self, handle: &HttpHandle, topic: &str) -> ConnectorResult<String> {
        let workspace_id = &handle.workspace.workspace_id;
        let url = self.endpoint(&["workspaces", workspace_id.as_str(), "topics"])?;
        let response = self.get(url, &handle.token, Phase::Connect).await?;
        let topics: Vec<TopicInfo> =
            parse_json(check_status(response, Phase::Connect).await?).await?;

        let full_id = prepend_workspace_id(workspace_id, topic);
        topics
            .into_iter()
            .find(|t| t.name == topic || t.id == topic || t.id == full_id)
            .map(|t| t.id)
            .ok_or_else(|| {
                ConnectorError::NotFound(format!(
                    "topic '{}' not found in workspace '{}'",
                    topic, workspace_id
                ))
            })
    }

    async fn fetch(&self, handle: &HttpHandle, request: FetchRequest) -> ConnectorResult<FetchBatch> {
        let mut url = self.endpoint(&[
            "workspaces",
            handle.workspace.workspace_id.as_str(),
            "topics",
            request.topic.as_str(),
            "records",
        ])?;
        url.query_pairs_mut()
            .append_pair("offset", &request.offset.to_string())
            .append_pair("limit", &request.max_records.to_string());
        let response = self.get(url, &handle.token, Phase::Stream).await?;
        let page: RecordsPage = parse_json(check_status(response, Phase::Stream).await?).await?;
        decode_page(&request.topic, page)
    }

    async fn release(&self, handle: &HttpHandle) -> ConnectorResult<()> {
        // Portal tokens are stateless; nothing is held server-side.
        debug!(workspace = %handle.workspace.workspace_id, "Released workspace handle");
        Ok(())
    }
}

fn select_workspace(all: Vec<WorkspaceInfo>, id_or_name: &str) -> ConnectorResult<WorkspaceInfo> {
    let mut matching: Vec<WorkspaceInfo> = all.into_iter().filter(|w| w.matches(id_or_name)).collect();
    match matching.len() {
        0 => Err(ConnectorError::NotFound(format!(
            "no workspace with id or name '{}'",
            id_or_name
        ))),
        1 => Ok(matching.remove(0)),
        n => Err(ConnectorError::config(format!(
            "{} workspaces match '{}'; use the workspace id",
            n, id_or_name
        ))),
    }
}

fn send_error(e: reqwest::Error, phase: Phase) -> ConnectorError {
    let message = if e.is_timeout() {
        format!("request timed out: {}", e)
    } else {
        format!("request failed: {}", e)
    };
    match phase {
        Phase::Connect => ConnectorError::unavailable(message),
        Phase::Stream => ConnectorError::transient(message),
    }
}

async fn check_status(response: Response, phase: Phase) -> ConnectorResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body, phase))
}

fn status_error(status: StatusCode, body: &str, phase: Phase) -> ConnectorError {
    let message = format!("portal returned {}: {}", status, body.trim());
    match status.as_u16() {
        401 | 403 => ConnectorError::auth(message),
        404 => ConnectorError::NotFound(message),
        408 | 429 | 500..=599 => match phase {
            Phase::Connect => ConnectorError::unavailable(message),
            Phase::Stream => ConnectorError::transient(message),
        },
        _ => ConnectorError::fatal(message),
    }
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> ConnectorResult<T> {
    let body = response
        .bytes()
        .await
        .map_err(|e| ConnectorError::transient(format!("failed to read response body: {}", e)))?;
    Ok(serde_json::from_slice(&body)?)
}

fn decode_page(topic: &str, page: RecordsPage) -> ConnectorResult<FetchBatch> {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut records = Vec::with_capacity(page.records.len());
    for wire in page.records {
        let value = engine.decode(&wire.value).map_err(|e| {
            ConnectorError::Serialization(format!("record {} value: {}", wire.offset, e))
        })?;
        let mut record = Record::new(topic, value).with_offset(wire.offset);
        if let Some(key) = wire.key {
            let key = engine.decode(&key).map_err(|e| {
                ConnectorError::Serialization(format!("record {} key: {}", wire.offset, e))
            })?;
            record = record.with_key(key);
        }
        if let Some(ts) = wire.timestamp_ms.and_then(DateTime::from_timestamp_millis) {
            record = record.with_timestamp(ts);
        }
        for (name, value) in wire.headers {
            record = record.with_header(name, Bytes::from(value));
        }
        records.push(record);
    }

    Ok(FetchBatch {
        records,
        next_offset: page.next_offset,
        end_of_stream: page.end_of_stream,
    })
}
