//! Error taxonomy for the bridge.
//!
//! Every upstream variant carries the request URL so failures in a fan-out
//! can be traced to the node or endpoint that produced them.

use std::fmt;

use thiserror::Error;

/// One group of Marathon apps whose ids collapse to the same Consul
/// service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameClash {
    pub app_name: String,
    pub app_ids: Vec<String>,
}

impl fmt::Display for NameClash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- [{}]", self.app_name, self.app_ids.join(", "))
    }
}

fn format_clashes(clashes: &[NameClash]) -> String {
    clashes
        .iter()
        .map(NameClash::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced by the sync, purge, and event-handling paths.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Transport-level failure (connect, DNS, timeout) talking to Marathon
    /// or Consul.
    #[error("request to {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Upstream answered with a non-2xx status.
    #[error("{url} returned HTTP {status}")]
    UpstreamStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    /// Upstream body was not the JSON we expected.
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// A required field was absent from a Marathon response.
    #[error("field \"{field}\" missing from response of {url}")]
    Schema { url: String, field: &'static str },

    /// Multiple apps map to the same Consul service name. Syncing any of
    /// them would cross-register tasks, so the whole sync aborts before
    /// any write.
    #[error("multiple apps map to the same service name: {}", format_clashes(.clashes))]
    NamespaceClash { clashes: Vec<NameClash> },

    /// A catalog service carries more than one app-id tag, so it cannot be
    /// correlated back to a single Marathon app.
    #[error("service \"{service_id}\" carries more than one app-id tag")]
    AmbiguousOwnership { service_id: String },
}

impl BridgeError {
    /// True when the error is an HTTP 404 from upstream. Some read paths
    /// (KV key listings, task fetches during purge) treat 404 as "empty".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BridgeError::UpstreamStatus { status, .. }
                if *status == reqwest::StatusCode::NOT_FOUND
        )
    }
}
