//! Consul HTTP API client.
//!
//! Operations are split between two kinds of endpoint: the node-local agent
//! derived from a task's host (service register/deregister/list) and the
//! cluster-wide endpoint from configuration (node catalog, KV store).
//! Agent requests run under the shorter agent timeout so one dead worker
//! cannot stall a full reconciliation; when fallback is enabled a failed
//! registration is retried once against the cluster endpoint.

use std::collections::HashMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::warn;

use crate::errors::BridgeError;
use crate::http;

/// Port every node-local Consul agent listens on.
pub const AGENT_PORT: u16 = 8500;

/// Characters that cannot appear verbatim in a URL path segment. Marathon
/// label keys are arbitrary strings, so each segment of a KV key is
/// percent-encoded; the `/` separators between segments stay as-is since
/// they define the KV hierarchy.
const KV_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/');

/// Percent-encodes every segment of a KV key or prefix, preserving the
/// `/` separators (including a trailing one on directory prefixes).
fn encode_kv_path(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, KV_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Body of `PUT /v1/agent/service/register`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
}

/// One service as reported by `GET /v1/agent/services`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Service", default)]
    pub service: String,
    /// Consul reports `null` rather than `[]` for untagged services.
    #[serde(rename = "Tags", default)]
    pub tags: Option<Vec<String>>,
}

/// One entry of `GET /v1/catalog/nodes`.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    #[serde(rename = "Node", default)]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
}

pub struct ConsulClient {
    endpoint: String,
    client: reqwest::Client,
    default_timeout: Duration,
    agent_timeout: Duration,
    enable_fallback: bool,
    agent_port: u16,
}

impl ConsulClient {
    pub fn new(
        endpoint: &str,
        client: reqwest::Client,
        default_timeout: Duration,
        agent_timeout: Duration,
        enable_fallback: bool,
    ) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            default_timeout,
            agent_timeout,
            enable_fallback,
            agent_port: AGENT_PORT,
        }
    }

    /// Overrides the agent port, letting tests route agent traffic to a
    /// mock listener on an ephemeral port.
    pub fn with_agent_port(mut self, port: u16) -> Self {
        self.agent_port = port;
        self
    }

    /// HTTP endpoint of the node-local agent on `host`.
    pub fn agent_endpoint(&self, host: &str) -> String {
        format!("http://{}:{}", host, self.agent_port)
    }

    async fn put_empty(&self, url: &str, timeout: Duration) -> Result<(), BridgeError> {
        let request = self.client.put(url).timeout(timeout);
        let response = http::execute(request, url).await?;
        http::require_success(response, url)?;
        Ok(())
    }

    /// Registers a service at the given agent. Consul upserts on repeated
    /// registration of the same ID, so this is idempotent. With fallback
    /// enabled a failure is retried once against the cluster endpoint,
    /// still under the agent timeout.
    pub async fn register_service(
        &self,
        agent: &str,
        registration: &ServiceRegistration,
    ) -> Result<(), BridgeError> {
        let url = format!("{}/v1/agent/service/register", agent);
        match self.put_registration(&url, registration).await {
            Ok(()) => Ok(()),
            Err(err) if self.enable_fallback => {
                warn!(
                    service = %registration.id,
                    agent = %agent,
                    error = %err,
                    "agent registration failed, retrying against cluster endpoint"
                );
                let fallback_url = format!("{}/v1/agent/service/register", self.endpoint);
                self.put_registration(&fallback_url, registration).await
            }
            Err(err) => Err(err),
        }
    }

    async fn put_registration(
        &self,
        url: &str,
        registration: &ServiceRegistration,
    ) -> Result<(), BridgeError> {
        let request = self
            .client
            .put(url)
            .json(registration)
            .timeout(self.agent_timeout);
        let response = http::execute(request, url).await?;
        http::require_success(response, url)?;
        Ok(())
    }

    /// Deregisters a service at the given agent. Never falls back: the
    /// cluster endpoint cannot deregister on behalf of an arbitrary
    /// worker's local agent, so a failure is left to the next purge.
    pub async fn deregister_service(&self, agent: &str, service_id: &str) -> Result<(), BridgeError> {
        let url = format!("{}/v1/agent/service/deregister/{}", agent, service_id);
        self.put_empty(&url, self.agent_timeout).await
    }

    /// Services registered at the given agent, keyed by service id.
    pub async fn agent_services(
        &self,
        agent: &str,
    ) -> Result<HashMap<String, AgentService>, BridgeError> {
        let url = format!("{}/v1/agent/services", agent);
        let request = self.client.get(&url).timeout(self.agent_timeout);
        let response = http::execute(request, &url).await?;
        let response = http::require_success(response, &url)?;
        http::read_json(response, &url).await
    }

    /// All nodes known to the cluster.
    pub async fn nodes(&self) -> Result<Vec<Node>, BridgeError> {
        let url = format!("{}/v1/catalog/nodes", self.endpoint);
        let request = self.client.get(&url).timeout(self.default_timeout);
        let response = http::execute(request, &url).await?;
        let response = http::require_success(response, &url)?;
        http::read_json(response, &url).await
    }

    /// Writes a raw string value under `key`.
    pub async fn put_kv(&self, key: &str, value: &str) -> Result<(), BridgeError> {
        let url = format!("{}/v1/kv/{}", self.endpoint, encode_kv_path(key));
        let request = self
            .client
            .put(&url)
            .body(value.to_string())
            .timeout(self.default_timeout);
        let response = http::execute(request, &url).await?;
        http::require_success(response, &url)?;
        Ok(())
    }

    /// Deletes `key`, or the whole subtree under it when `recurse` is set.
    pub async fn delete_kv(&self, key: &str, recurse: bool) -> Result<(), BridgeError> {
        let url = format!(
            "{}/v1/kv/{}{}",
            self.endpoint,
            encode_kv_path(key),
            if recurse { "?recurse" } else { "" }
        );
        let request = self.client.delete(&url).timeout(self.default_timeout);
        let response = http::execute(request, &url).await?;
        http::require_success(response, &url)?;
        Ok(())
    }

    /// Keys under `prefix`. Without a separator the listing is recursive;
    /// with `separator = "/"` Consul returns one entry per direct child.
    /// A prefix with no keys answers 404, which is an empty list here.
    pub async fn kv_keys(
        &self,
        prefix: &str,
        separator: Option<&str>,
    ) -> Result<Vec<String>, BridgeError> {
        let mut url = format!("{}/v1/kv/{}?keys", self.endpoint, encode_kv_path(prefix));
        if let Some(separator) = separator {
            url.push_str("&separator=");
            url.push_str(separator);
        }

        let request = self.client.get(&url).timeout(self.default_timeout);
        let response = http::execute(request, &url).await?;
        match http::tolerate_not_found(response, &url)? {
            Some(response) => http::read_json(response, &url).await,
            None => Ok(Vec::new()),
        }
    }
}
