//! HTTP listener for Marathon's event callbacks.
//!
//! Two routes: `GET /` answers `[]` as a liveness probe, `POST /events`
//! consumes event bodies. Responses are always `application/json`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{self, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::events::StatusUpdateEvent;
use crate::sync::Syncer;

/// Binds the listener and returns the bound address together with the
/// serve future. Binding on port 0 yields an ephemeral port, which tests
/// rely on.
pub fn bind(
    addr: &SocketAddr,
    syncer: Arc<Syncer>,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let syncer = syncer.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let syncer = syncer.clone();
                async move { Ok::<_, Infallible>(handle_request(syncer, request).await) }
            }))
        }
    });

    let server = Server::try_bind(addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    Ok((local_addr, server))
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    json_response(status, json!({ "error": message }))
}

/// Routes a single request.
pub async fn handle_request(syncer: Arc<Syncer>, request: Request<Body>) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/") => json_response(StatusCode::OK, json!([])),
        (&Method::POST, "/events") => handle_events(syncer, request).await,
        _ => error_response(StatusCode::NOT_FOUND, "Not found.".to_string()),
    }
}

async fn handle_events(syncer: Arc<Syncer>, request: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed reading event body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid request body.".to_string());
        }
    };

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "event body is not JSON");
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body.".to_string());
        }
    };

    let event_type = value
        .get("eventType")
        .and_then(Value::as_str)
        .unwrap_or("null")
        .to_string();

    match event_type.as_str() {
        "status_update_event" => {
            let event: StatusUpdateEvent = match serde_json::from_value(value) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "malformed status_update_event");
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        format!("Invalid status_update_event: {}.", err),
                    );
                }
            };
            match syncer.handle_status_update(&event).await {
                Ok(()) => json_response(StatusCode::OK, json!({ "status": "ok" })),
                Err(err) => {
                    error!(error = %err, task = %event.task_id, "event handling failed");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                }
            }
        }
        other => {
            warn!(event_type = %other, "not handling event type");
            error_response(
                StatusCode::BAD_REQUEST,
                format!("Event type {} not supported.", other),
            )
        }
    }
}
