//! Shared HTTP plumbing for the Marathon and Consul clients.
//!
//! Both clients send and receive JSON over a single shared `reqwest::Client`.
//! Connections are not reused between requests: the bridge talks to many
//! short-lived per-node agents and a dead worker holding a pooled connection
//! would stall later requests to the same host.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::errors::BridgeError;

/// Builds the shared HTTP client: JSON headers on every request, no idle
/// connection reuse.
pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    reqwest::Client::builder()
        .default_headers(headers)
        .pool_max_idle_per_host(0)
        .build()
}

/// Sends a request and maps transport failures to [`BridgeError::Upstream`].
///
/// Status codes are not inspected here; callers that require a 2xx go
/// through [`require_success`], callers that tolerate 404 check first.
pub(crate) async fn execute(
    builder: RequestBuilder,
    url: &str,
) -> Result<reqwest::Response, BridgeError> {
    let response = builder.send().await.map_err(|source| {
        error!(url = %url, error = %source, "request failed");
        BridgeError::Upstream {
            url: url.to_string(),
            source,
        }
    })?;

    debug!(url = %url, status = %response.status(), "request completed");
    Ok(response)
}

/// Classifies a non-2xx response as [`BridgeError::UpstreamStatus`]
/// without logging. Callers that tolerate certain statuses decide what is
/// an error.
pub(crate) fn status_error(
    response: reqwest::Response,
    url: &str,
) -> Result<reqwest::Response, BridgeError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(BridgeError::UpstreamStatus {
            url: url.to_string(),
            status,
        })
    }
}

/// Rejects non-2xx responses, logging with the URL context.
pub(crate) fn require_success(
    response: reqwest::Response,
    url: &str,
) -> Result<reqwest::Response, BridgeError> {
    status_error(response, url).map_err(|err| {
        error!(url = %url, error = %err, "request returned error status");
        err
    })
}

/// Status check for reads where 404 means "nothing there": `None` for a
/// 404, the response for a 2xx, a logged error otherwise.
pub(crate) fn tolerate_not_found(
    response: reqwest::Response,
    url: &str,
) -> Result<Option<reqwest::Response>, BridgeError> {
    match status_error(response, url) {
        Ok(response) => Ok(Some(response)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => {
            error!(url = %url, error = %err, "request returned error status");
            Err(err)
        }
    }
}

/// Reads and deserializes a JSON response body.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    url: &str,
) -> Result<T, BridgeError> {
    let bytes = response.bytes().await.map_err(|source| {
        error!(url = %url, error = %source, "failed reading response body");
        BridgeError::Upstream {
            url: url.to_string(),
            source,
        }
    })?;

    serde_json::from_slice(&bytes).map_err(|source| {
        error!(url = %url, error = %source, "invalid JSON in response");
        BridgeError::Decode {
            url: url.to_string(),
            source,
        }
    })
}
