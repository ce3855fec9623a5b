//! Generic network endpoint adapter.
//!
//! `fetch` probes the bare URL with `OPTIONS` and `GET` and records what the
//! responses reveal (status codes, `Allow`, content type, MCP protocol and
//! session markers). When those markers suggest an MCP server, `parse` runs
//! a bounded JSON-RPC introspection handshake:
//!
//! 1. `initialize`
//! 2. `notifications/initialized`
//! 3. `tools/list`, `resources/list`, `prompts/list`
//!
//! Every request has its own timeout. Responses arrive either as JSON or
//! as SSE `data:` frames; a failing list call only loses that list.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, ALLOW, CONNECTION, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::analysis::{HealthProfile, HealthScorer, HealthSignals};
use crate::config::EndpointConfig;
use crate::harvest::http::check_status;
use crate::harvest::retry::RetryPolicy;
use crate::harvest::sources::{capabilities, risk};
use crate::harvest::store::CatalogStore;
use crate::harvest::traits::{HarvestError, RawArtifact, SourceAdapter};
use crate::model::{Capability, CapabilityKind, CatalogEntry, SourceType};

const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const SESSION_HEADER: &str = "mcp-session-id";

/// Upper bound on one JSON-RPC response body.
const MAX_RPC_BYTES: usize = 1024 * 1024;

const LIST_METHODS: &[(&str, &str, CapabilityKind)] = &[
    ("tools/list", "tools", CapabilityKind::Tool),
    ("resources/list", "resources", CapabilityKind::Resource),
    ("prompts/list", "prompts", CapabilityKind::Prompt),
];

// ============================================================================
// Probe Results
// ============================================================================

/// What the bare `OPTIONS` and `GET` requests revealed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointProbe {
    /// Normalized endpoint URL, also the locator
    pub url: String,
    pub options_status: Option<u16>,
    pub get_status: Option<u16>,
    pub allow: Option<String>,
    pub content_type: Option<String>,
    pub protocol_version: Option<String>,
    pub session_id: Option<String>,
}

impl EndpointProbe {
    pub fn is_streaming(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
    }

    /// Whether the probe is worth a handshake.
    pub fn speaks_mcp(&self) -> bool {
        self.is_streaming() || self.protocol_version.is_some() || self.session_id.is_some()
    }

    pub fn uses_https(&self) -> bool {
        self.url.starts_with("https://")
    }

    fn record(&mut self, method: &Method, response: &Response) {
        let status = Some(response.status().as_u16());
        let headers = response.headers();
        if *method == Method::OPTIONS {
            self.options_status = status;
            self.allow = header(headers, ALLOW.as_str());
        } else {
            self.get_status = status;
            self.content_type = header(headers, CONTENT_TYPE.as_str());
        }
        self.protocol_version = self.protocol_version.take().or_else(|| header(headers, PROTOCOL_HEADER));
        self.session_id = self.session_id.take().or_else(|| header(headers, SESSION_HEADER));
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Result of a completed `initialize` and whatever lists followed it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Handshake {
    pub protocol_version: Option<String>,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub instructions: Option<String>,
    pub capabilities: Vec<Capability>,
}

impl Handshake {
    /// Reads the `initialize` result.
    pub fn from_initialize(result: &Value) -> Self {
        let text = |pointer: &str| {
            result
                .pointer(pointer)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            protocol_version: text("/protocolVersion"),
            server_name: text("/serverInfo/name"),
            server_version: text("/serverInfo/version"),
            instructions: text("/instructions"),
            capabilities: Vec::new(),
        }
    }
}

// ============================================================================
// Pure Helpers
// ============================================================================

/// Lowercase scheme and host, no fragment, no trailing slash.
///
/// # Errors
///
/// Returns [`HarvestError::MalformedSource`] unless `identifier` is an
/// `http://` or `https://` URL with a host.
pub fn normalize_url(identifier: &str) -> Result<String, HarvestError> {
    let malformed = |why: &str| {
        HarvestError::MalformedSource(format!("'{}' is not an endpoint URL: {}", identifier, why))
    };
    let mut url = url::Url::parse(identifier.trim()).map_err(|e| malformed(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(malformed("scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(malformed("missing host"));
    }
    url.set_fragment(None);

    let mut normalized = url.to_string();
    if url.query().is_none() {
        while normalized.ends_with('/') {
            normalized.pop();
        }
    }
    Ok(normalized)
}

/// The JSON-RPC message answering `id` in a JSON or SSE body.
///
/// Returns `None` while the body is incomplete or carries only other
/// messages (notifications, server requests).
pub fn find_rpc_response(body: &str, id: i64) -> Option<Value> {
    let matches = |message: &Value| message.get("id").and_then(Value::as_i64) == Some(id);

    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok().filter(matches);
    }

    let normalized = body.replace("\r\n", "\n");
    normalized.split("\n\n").find_map(|event| {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if data.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(&data.join("\n")).ok().filter(matches)
    })
}

/// `result` of a response, or its `error` as a malformed-source failure.
fn rpc_result(message: Value, method: &str) -> Result<Value, HarvestError> {
    if let Some(error) = message.get("error") {
        return Err(HarvestError::MalformedSource(format!(
            "{} returned error: {}",
            method, error
        )));
    }
    message
        .get("result")
        .cloned()
        .ok_or_else(|| HarvestError::MalformedSource(format!("{} returned no result", method)))
}

/// Builds and scores the entry for a probed endpoint.
pub fn build_entry(
    probe: &EndpointProbe,
    handshake: Option<&Handshake>,
    scorer: &HealthScorer,
    now: DateTime<Utc>,
) -> CatalogEntry {
    let host = url::Url::parse(&probe.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| probe.url.clone());
    let name = handshake
        .and_then(|h| h.server_name.clone())
        .unwrap_or(host);

    let mut entry = CatalogEntry::new(&probe.url, SourceType::Endpoint, name);
    entry.version = handshake.and_then(|h| h.server_version.clone());
    entry.description = handshake.and_then(|h| h.instructions.clone());
    entry.homepage = Some(probe.url.clone());
    entry.verified = false;
    entry.harvested_at = now;
    entry.capabilities = handshake.map(|h| h.capabilities.clone()).unwrap_or_default();

    entry.metadata.insert(
        "transport".to_string(),
        json!({
            "scheme": if probe.uses_https() { "https" } else { "http" },
            "streaming": probe.is_streaming(),
            "options_status": probe.options_status,
            "get_status": probe.get_status,
            "allow": probe.allow,
            "content_type": probe.content_type,
            "protocol_version": handshake
                .and_then(|h| h.protocol_version.clone())
                .or_else(|| probe.protocol_version.clone()),
            "session": probe.session_id.is_some(),
        }),
    );
    entry
        .metadata
        .insert("handshake".to_string(), json!(handshake.is_some()));

    entry.risk_level = risk::assess(&entry, &[]);

    let signals = HealthSignals {
        uses_https: probe.uses_https(),
        handshake_ok: handshake.is_some(),
        has_server_info: handshake.is_some_and(|h| h.server_name.is_some()),
        capability_count: entry.capabilities.len(),
        ..HealthSignals::default()
    };
    entry.health_score = scorer.score(&signals);

    entry
}

// ============================================================================
// Adapter
// ============================================================================

pub struct EndpointAdapter {
    client: Client,
    catalog: CatalogStore,
    policy: RetryPolicy,
    config: EndpointConfig,
    scorer: HealthScorer,
}

impl EndpointAdapter {
    pub fn new(
        client: Client,
        catalog: CatalogStore,
        policy: RetryPolicy,
        config: EndpointConfig,
        profile: HealthProfile,
    ) -> Self {
        Self {
            client,
            catalog,
            policy,
            config,
            scorer: HealthScorer::new(profile),
        }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.config.probe_timeout_secs)
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.config.handshake_timeout_secs)
    }

    /// Any status is an answer; only transport failures are errors.
    async fn probe(&self, method: Method, url: &str) -> Result<Response, HarvestError> {
        self.policy
            .run("endpoint probe", || async {
                let response = self
                    .client
                    .request(method.clone(), url)
                    .header(CONNECTION, "close")
                    .timeout(self.probe_timeout())
                    .send()
                    .await?;
                Ok(response)
            })
            .await
    }

    /// Sends one JSON-RPC message. Notifications (`id == None`) only need
    /// a 2xx; requests wait for the matching response.
    async fn rpc(
        &self,
        url: &str,
        session: Option<&str>,
        protocol_version: Option<&str>,
        id: Option<i64>,
        method: &str,
        params: Value,
    ) -> Result<(Option<Value>, Option<String>), HarvestError> {
        let mut message = json!({"jsonrpc": "2.0", "method": method, "params": params});
        if let Some(id) = id {
            message["id"] = json!(id);
        }

        let mut request = self
            .client
            .post(url)
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(self.handshake_timeout())
            .json(&message);
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        if let Some(version) = protocol_version {
            request = request.header(PROTOCOL_HEADER, version);
        }

        let response = check_status(request.send().await?, method)?;
        let session_id = header(response.headers(), SESSION_HEADER);
        let Some(id) = id else {
            return Ok((None, session_id));
        };
        if response.status() == StatusCode::ACCEPTED {
            return Err(HarvestError::MalformedSource(format!(
                "{} was accepted without a response",
                method
            )));
        }

        let message = read_rpc_response(response, id, method).await?;
        Ok((Some(rpc_result(message, method)?), session_id))
    }

    #[instrument(skip(self, probe), fields(url = %probe.url))]
    async fn handshake(&self, probe: &EndpointProbe) -> Result<Handshake, HarvestError> {
        let url = probe.url.as_str();
        let params = json!({
            "protocolVersion": self.config.protocol_version,
            "capabilities": {},
            "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
        });
        let (result, session) = self.rpc(url, None, None, Some(1), "initialize", params).await?;
        let mut handshake = Handshake::from_initialize(&result.unwrap_or(Value::Null));
        let session = session.or_else(|| probe.session_id.clone());
        let version = handshake
            .protocol_version
            .clone()
            .unwrap_or_else(|| self.config.protocol_version.clone());

        if let Err(e) = self
            .rpc(url, session.as_deref(), Some(version.as_str()), None, "notifications/initialized", json!({}))
            .await
        {
            warn!(error = %e, "initialized notification rejected");
        }

        for (offset, (method, key, kind)) in LIST_METHODS.iter().enumerate() {
            let id = 2 + offset as i64;
            match self
                .rpc(url, session.as_deref(), Some(version.as_str()), Some(id), method, json!({}))
                .await
            {
                Ok((Some(result), _)) => {
                    let items = result.get(*key).and_then(Value::as_array).cloned().unwrap_or_default();
                    capabilities::merge(&mut handshake.capabilities, capabilities::from_items(*kind, &items));
                }
                Ok((None, _)) => {}
                Err(e) => warn!(method = *method, error = %e, "Capability list unavailable"),
            }
        }

        info!(
            server = ?handshake.server_name,
            capabilities = handshake.capabilities.len(),
            "Handshake completed"
        );
        Ok(handshake)
    }
}

/// Reads until the response to `id` arrives; SSE streams may stay open.
async fn read_rpc_response(mut response: Response, id: i64, method: &str) -> Result<Value, HarvestError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
        if body.len() > MAX_RPC_BYTES {
            return Err(HarvestError::MalformedSource(format!(
                "{} response exceeds {} bytes",
                method, MAX_RPC_BYTES
            )));
        }
        if let Some(message) = find_rpc_response(&String::from_utf8_lossy(&body), id) {
            return Ok(message);
        }
    }
    find_rpc_response(&String::from_utf8_lossy(&body), id)
        .ok_or_else(|| HarvestError::MalformedSource(format!("{} returned no response", method)))
}

#[async_trait]
impl SourceAdapter for EndpointAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Endpoint
    }

    fn locator_for(&self, identifier: &str) -> Result<String, HarvestError> {
        normalize_url(identifier)
    }

    fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    #[instrument(skip(self), fields(source = "endpoint"))]
    async fn fetch(&self, identifier: &str) -> Result<RawArtifact, HarvestError> {
        let url = normalize_url(identifier)?;
        let mut probe = EndpointProbe {
            url: url.clone(),
            ..EndpointProbe::default()
        };

        let options = self.probe(Method::OPTIONS, &url).await;
        let get = self.probe(Method::GET, &url).await;
        let (options, get) = match (options, get) {
            (Err(_), Err(e)) => return Err(e),
            pair => pair,
        };
        match &options {
            Ok(response) => probe.record(&Method::OPTIONS, response),
            Err(e) => debug!(error = %e, "OPTIONS probe failed"),
        }
        match &get {
            Ok(response) => probe.record(&Method::GET, response),
            Err(e) => debug!(error = %e, "GET probe failed"),
        }

        let not_found = Some(StatusCode::NOT_FOUND.as_u16());
        if probe.options_status == not_found && probe.get_status == not_found {
            return Err(HarvestError::NotFound(url));
        }

        debug!(
            options = ?probe.options_status,
            get = ?probe.get_status,
            streaming = probe.is_streaming(),
            protocol = ?probe.protocol_version,
            "Endpoint probed"
        );
        Ok(RawArtifact::Endpoint(Box::new(probe)))
    }

    async fn parse(&self, raw: RawArtifact) -> Result<CatalogEntry, HarvestError> {
        let probe = match raw {
            RawArtifact::Endpoint(probe) => probe,
            other => {
                return Err(HarvestError::MalformedSource(format!(
                    "endpoint adapter cannot parse a {} artifact",
                    other.kind()
                )))
            }
        };

        let handshake = if probe.speaks_mcp() {
            match self.handshake(&probe).await {
                Ok(handshake) => Some(handshake),
                Err(e) => {
                    warn!(url = %probe.url, error = %e, "Handshake failed, keeping probe results");
                    None
                }
            }
        } else {
            None
        };

        Ok(build_entry(&probe, handshake.as_ref(), &self.scorer, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RiskLevel;

    fn scorer() -> HealthScorer {
        HealthScorer::new(HealthProfile::endpoint())
    }

    fn handshake(names: &[&str]) -> Handshake {
        Handshake {
            protocol_version: Some("2025-03-26".to_string()),
            server_name: Some("weather".to_string()),
            server_version: Some("1.0.0".to_string()),
            instructions: None,
            capabilities: names.iter().map(|n| Capability::new(CapabilityKind::Tool, *n)).collect(),
        }
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("HTTPS://Example.COM/mcp/#frag").unwrap(), "https://example.com/mcp");
        assert_eq!(normalize_url("http://example.com").unwrap(), "http://example.com");
        assert_eq!(
            normalize_url("https://example.com/mcp?key=1").unwrap(),
            "https://example.com/mcp?key=1"
        );
        assert!(normalize_url("ftp://example.com").is_err());
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn test_find_rpc_response_json_and_sse() {
        let json_body = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26"}}"#;
        assert!(find_rpc_response(json_body, 1).is_some());
        assert!(find_rpc_response(json_body, 2).is_none());
        assert!(find_rpc_response(r#"{"jsonrpc":"2.0","id":1,"res"#, 1).is_none());

        let sse = "event: message\r\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\r\n\r\n\
                   event: message\r\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"tools\":[]}}\r\n\r\n";
        let message = find_rpc_response(sse, 3).unwrap();
        assert_eq!(message["result"]["tools"], json!([]));
    }

    #[test]
    fn test_rpc_error_is_malformed() {
        let err = rpc_result(json!({"id": 2, "error": {"code": -32601}}), "tools/list").unwrap_err();
        assert!(matches!(err, HarvestError::MalformedSource(_)));
        assert_eq!(rpc_result(json!({"id": 2, "result": {"x": 1}}), "m").unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_initialize_result() {
        let result = json!({
            "protocolVersion": "2025-03-26",
            "serverInfo": {"name": "weather", "version": "0.4.1"},
            "instructions": "Ask about the weather"
        });
        let handshake = Handshake::from_initialize(&result);
        assert_eq!(handshake.server_name.as_deref(), Some("weather"));
        assert_eq!(handshake.server_version.as_deref(), Some("0.4.1"));
        assert_eq!(handshake.instructions.as_deref(), Some("Ask about the weather"));
    }

    #[test]
    fn test_probe_markers() {
        let mut probe = EndpointProbe {
            url: "https://example.com/mcp".to_string(),
            ..EndpointProbe::default()
        };
        assert!(!probe.speaks_mcp());
        probe.content_type = Some("text/event-stream; charset=utf-8".to_string());
        assert!(probe.is_streaming());
        assert!(probe.speaks_mcp());
    }

    #[test]
    fn test_plain_http_with_rich_capabilities_is_high() {
        let probe = EndpointProbe {
            url: "http://tools.example.com/mcp".to_string(),
            get_status: Some(200),
            ..EndpointProbe::default()
        };
        let shake = handshake(&["forecast", "alerts", "radar", "stations", "history"]);
        let entry = build_entry(&probe, Some(&shake), &scorer(), Utc::now());

        assert_eq!(entry.capabilities.len(), 5);
        assert_eq!(entry.risk_level, RiskLevel::High);
        assert_eq!(entry.metadata["transport"]["scheme"], json!("http"));
        // 20 base + 20 handshake + 10 server info + 15 capabilities
        assert_eq!(entry.health_score, 65);
    }

    #[test]
    fn test_https_endpoint_without_handshake_is_moderate() {
        let probe = EndpointProbe {
            url: "https://example.com/api".to_string(),
            get_status: Some(200),
            ..EndpointProbe::default()
        };
        let entry = build_entry(&probe, None, &scorer(), Utc::now());
        assert_eq!(entry.name, "example.com");
        assert_eq!(entry.risk_level, RiskLevel::Moderate);
        assert_eq!(entry.metadata["handshake"], json!(false));
        assert_eq!(entry.health_score, 40);
    }
}
