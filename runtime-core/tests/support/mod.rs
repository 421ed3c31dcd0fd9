#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::BodyExt;
use runtime_core::api::{ApiRequest, ApiResponse, Cors, InternalRoutes, Server};
use runtime_core::metrics::EndpointMetrics;
use runtime_core::platform::RequestValidator;
use runtime_core::pubsub::PushRegistry;
use runtime_core::trace::Tracer;
use std::sync::Arc;

/// An API server with no CORS restrictions, no platform keys, and
/// tracing disabled. Register endpoints, then wrap in an `Arc` to
/// dispatch.
pub fn test_server() -> Server {
    let metrics = Arc::new(EndpointMetrics::new());
    Server::new(
        Cors::from_config(None),
        Arc::new(RequestValidator::new(Vec::new())),
        InternalRoutes::new(Arc::new(PushRegistry::new()), metrics.clone()),
        Tracer::noop(),
        metrics,
        false,
    )
}

pub fn request(method: &str, uri: &str, headers: &[(&str, &str)], body: &[u8]) -> ApiRequest {
    let mut builder = http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::copy_from_slice(body)).expect("valid request")
}

pub async fn response_json(resp: ApiResponse) -> (u16, serde_json::Value) {
    let status = resp.status().as_u16();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("JSON body")
    };
    (status, value)
}
