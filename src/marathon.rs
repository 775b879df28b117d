//! Marathon HTTP API client.
//!
//! Marathon wraps every collection in an envelope object (`{"apps": [...]}`,
//! `{"tasks": [...]}`), so responses are read as raw JSON first and the
//! payload field is extracted explicitly. A missing field is a schema error
//! except where the caller opts into treating it as empty.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Duration;
use tracing::{error, info};

use crate::errors::BridgeError;
use crate::http;

/// A Marathon application: the template tasks are launched from.
#[derive(Debug, Clone, Deserialize)]
pub struct App {
    /// Hierarchical path id beginning with `/`, e.g. `/group/my-app`.
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// One running instance of an app.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    pub id: String,
    pub host: String,
    /// Host ports in the order Marathon allocated them; only the first one
    /// becomes the Consul service port.
    #[serde(default)]
    pub ports: Vec<u16>,
}

pub struct MarathonClient {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl MarathonClient {
    pub fn new(endpoint: &str, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn get_value(&self, url: &str) -> Result<Value, BridgeError> {
        let request = self.client.get(url).timeout(self.timeout);
        let response = http::execute(request, url).await?;
        let response = http::require_success(response, url)?;
        http::read_json(response, url).await
    }

    fn json_field<T: DeserializeOwned>(
        mut body: Value,
        field: &'static str,
        url: &str,
    ) -> Result<T, BridgeError> {
        match body.get_mut(field) {
            Some(value) => {
                serde_json::from_value(value.take()).map_err(|source| BridgeError::Decode {
                    url: url.to_string(),
                    source,
                })
            }
            None => {
                error!(url = %url, field = field, "field missing from Marathon response");
                Err(BridgeError::Schema {
                    url: url.to_string(),
                    field,
                })
            }
        }
    }

    /// Currently registered event callback URLs.
    pub async fn get_event_subscriptions(&self) -> Result<Vec<String>, BridgeError> {
        let url = self.url("/v2/eventSubscriptions");
        let body = self.get_value(&url).await?;
        Self::json_field(body, "callbackUrls", &url)
    }

    /// Subscribes `callback_url` to Marathon's event stream. Returns whether
    /// Marathon confirmed with HTTP 200.
    pub async fn post_event_subscription(&self, callback_url: &str) -> Result<bool, BridgeError> {
        let url = self.url("/v2/eventSubscriptions");
        let request = self
            .client
            .post(&url)
            .query(&[("callbackUrl", callback_url)])
            .timeout(self.timeout);
        let response = http::execute(request, &url).await?;
        let response = http::require_success(response, &url)?;
        Ok(response.status() == reqwest::StatusCode::OK)
    }

    pub async fn get_apps(&self) -> Result<Vec<App>, BridgeError> {
        let url = self.url("/v2/apps");
        let body = self.get_value(&url).await?;
        Self::json_field(body, "apps", &url)
    }

    /// Fetches a single app. `app_id` already starts with `/`, so it is
    /// appended to `/v2/apps` without another separator.
    pub async fn get_app(&self, app_id: &str) -> Result<App, BridgeError> {
        let url = self.url(&format!("/v2/apps{}", app_id));
        let body = self.get_value(&url).await?;
        Self::json_field(body, "app", &url)
    }

    pub async fn get_app_tasks(&self, app_id: &str) -> Result<Vec<Task>, BridgeError> {
        let url = self.url(&format!("/v2/apps{}/tasks", app_id));
        let body = self.get_value(&url).await?;
        Self::json_field(body, "tasks", &url)
    }

    /// Like [`get_app_tasks`](Self::get_app_tasks), but an app that has
    /// disappeared (HTTP 404) or a response without a `tasks` field yields
    /// an empty list. Purge uses this: apps may be deleted between the node
    /// scan and the per-app task fetch.
    pub async fn get_app_tasks_or_empty(&self, app_id: &str) -> Result<Vec<Task>, BridgeError> {
        let url = self.url(&format!("/v2/apps{}/tasks", app_id));
        let request = self.client.get(&url).timeout(self.timeout);
        let response = http::execute(request, &url).await?;
        let response = match http::tolerate_not_found(response, &url)? {
            Some(response) => response,
            None => return Ok(Vec::new()),
        };
        let body: Value = http::read_json(response, &url).await?;
        if body.get("tasks").is_none() {
            return Ok(Vec::new());
        }
        Self::json_field(body, "tasks", &url)
    }

    /// Makes sure Marathon posts events to `events_url`, registering the
    /// callback if it is not already in the subscription list. Returns
    /// whether the callback is in place.
    pub async fn register_event_callback(&self, events_url: &str) -> Result<bool, BridgeError> {
        let existing = self.get_event_subscriptions().await?;
        if existing.iter().any(|url| url == events_url) {
            info!(events_url = %events_url, "event callback already registered");
            return Ok(true);
        }

        let registered = self.post_event_subscription(events_url).await?;
        if registered {
            info!(events_url = %events_url, "event callback registered");
        } else {
            error!(events_url = %events_url, "event callback registration failed");
        }
        Ok(registered)
    }
}
