use super::endpoints::{ApiRequest, ApiResponse};
use super::server::json_response;
use crate::error::{Code, Error};
use crate::metrics::EndpointMetrics;
use crate::pubsub::PushRegistry;
use std::sync::Arc;

/// Routes under `/__encore/`: health checks, an endpoint-metrics
/// snapshot, and the pub/sub push receiver.
pub struct InternalRoutes {
    push: Arc<PushRegistry>,
    metrics: Arc<EndpointMetrics>,
}

pub const INTERNAL_PREFIX: &str = "/__encore/";

impl InternalRoutes {
    pub fn new(push: Arc<PushRegistry>, metrics: Arc<EndpointMetrics>) -> Self {
        InternalRoutes { push, metrics }
    }

    pub fn matches(path: &str) -> bool {
        path.starts_with(INTERNAL_PREFIX)
    }

    /// Handles an internal route; `from_platform` marks requests bearing
    /// a valid platform signature.
    pub async fn handle(&self, req: ApiRequest, from_platform: bool) -> ApiResponse {
        let path = req.uri().path().to_string();
        let rest = path.strip_prefix(INTERNAL_PREFIX).unwrap_or("");

        match (req.method().as_str(), rest) {
            ("GET", "healthz") => json_response(
                200,
                serde_json::json!({"code": "ok", "message": "runtime is healthy", "details": null}),
            ),
            ("GET", "metrics") => self.metrics_snapshot(),
            ("POST", _) if rest.starts_with("pubsub/push/") => {
                let subscription_id = rest.trim_start_matches("pubsub/push/");
                if subscription_id.is_empty() || subscription_id.contains('/') {
                    return error_response(&Error::new(
                        Code::NotFound,
                        "missing or malformed subscription id",
                    ));
                }
                self.push_delivery(req, subscription_id, from_platform).await
            }
            _ => json_response(404, Error::unknown_endpoint()),
        }
    }

    fn metrics_snapshot(&self) -> ApiResponse {
        let series: Vec<serde_json::Value> = self
            .metrics
            .snapshot()
            .into_iter()
            .map(|stat| {
                serde_json::json!({
                    "service": stat.service,
                    "endpoint": stat.endpoint,
                    "code": stat.code.as_str(),
                    "count": stat.count,
                    "p50_ns": stat.p50_ns,
                    "p99_ns": stat.p99_ns,
                    "max_ns": stat.max_ns,
                })
            })
            .collect();
        json_response(200, serde_json::json!({"endpoints": series}))
    }

    async fn push_delivery(
        &self,
        req: ApiRequest,
        subscription_id: &str,
        from_platform: bool,
    ) -> ApiResponse {
        let bearer = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let result = self
            .push
            .handle(subscription_id, from_platform, bearer.as_deref(), req.body())
            .await;
        match result {
            Ok(()) => json_response(200, serde_json::json!({"code": "ok"})),
            Err(err) => error_response(&err),
        }
    }
}

fn error_response(err: &Error) -> ApiResponse {
    json_response(err.code.http_status(), err.to_json_body())
}
