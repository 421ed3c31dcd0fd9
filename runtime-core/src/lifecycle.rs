//! Beginning and finishing requests: uid/auth inheritance, span id
//! allocation, the per-request logger, span events, completion logging
//! and endpoint metrics.

use crate::error::{Code, Error};
use crate::metrics::EndpointMetrics;
use crate::model::{MessageData, Request, RequestType};
use crate::stack::Stack;
use crate::trace::{SpanEndData, Tracer};
use crate::tracker;
use runtime_api::{SpanId, TraceId};
use std::sync::Arc;

/// Everything needed to begin a request. Fields left `None` inherit from
/// the parent request where inheritance applies.
#[derive(Debug, Default)]
pub struct RequestDesc {
    pub typ: Option<RequestType>,
    pub service: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub path_params: Vec<(String, String)>,
    pub require_auth: bool,
    pub uid: Option<String>,
    pub auth_data: Option<serde_json::Value>,
    pub ext_correlation_id: Option<String>,
    pub span_id: Option<SpanId>,
    pub parent_span: Option<SpanId>,
    pub parent_trace: Option<TraceId>,
    pub msg: Option<MessageData>,
    /// Request payload recorded on the span-start event.
    pub payload: Vec<u8>,
    pub traced: bool,
}

/// Begins a request on the current task, creating an operation when the
/// task is untagged.
///
/// Enforces `require_auth`, merges uid/auth data with the parent request,
/// allocates a span id when none was supplied, and emits the span-start
/// event when traced.
pub fn begin_request(tracer: &Tracer, desc: RequestDesc) -> Result<Arc<Request>, Error> {
    let parent = tracker::current_request();

    let uid = desc.uid.or_else(|| parent.as_ref().and_then(|p| p.uid.clone()));
    let auth_data = desc
        .auth_data
        .or_else(|| parent.as_ref().and_then(|p| p.auth_data.clone()));
    if desc.require_auth && uid.as_deref().map_or(true, str::is_empty) {
        return Err(Error::new(Code::Unauthenticated, "an auth token is required"));
    }

    let ensured = tracker::ensure_op(tracer, desc.traced)
        .map_err(|err| Error::internal(format!("failed to begin operation: {err}")))?;
    let op = ensured.op;
    let traced = desc.traced && op.trace.is_some();

    let trace_id = parent
        .as_ref()
        .map(|p| p.trace_id)
        .filter(|id| !id.is_zero())
        .or_else(|| op.trace_id())
        .unwrap_or_default();
    let span_id = match desc.span_id {
        Some(id) => id,
        None => SpanId::generate()
            .map_err(|err| Error::internal(format!("failed to allocate span id: {err}")))?,
    };
    let parent_span = desc.parent_span.or_else(|| parent.as_ref().map(|p| p.span_id));
    let parent_trace = desc
        .parent_trace
        .or_else(|| parent.as_ref().map(|p| p.trace_id).filter(|id| !id.is_zero()));

    let typ = desc.typ.unwrap_or(RequestType::Rpc);
    let logger = tracing::info_span!(
        "request",
        service = %desc.service,
        endpoint = %desc.endpoint,
        uid = uid.as_deref().unwrap_or(""),
    );

    let req = Arc::new(Request::new(
        typ,
        trace_id,
        span_id,
        parent_trace,
        parent_span,
        desc.ext_correlation_id,
        uid,
        auth_data,
        desc.service,
        desc.endpoint,
        desc.method,
        desc.path,
        desc.path_params,
        desc.msg,
        logger,
        traced,
    ));

    tracker::attach_request(req.clone(), ensured.created);

    if traced {
        if let (Some(trace), Some(tag)) = (&op.trace, tracker::current()) {
            trace.span_start(tag.taskctr, &req, &desc.payload);
        }
    }
    Ok(req)
}

/// How the request ended, for [`finish_request`].
pub struct RequestOutcome<'a> {
    /// Response payload: encoded outputs, or auth user data for auth
    /// handler requests.
    pub outputs: &'a [u8],
    pub err: Option<&'a Error>,
    pub http_status: u16,
    /// Stack of a recovered panic, when the failure was one.
    pub panic_stack: Option<&'a Stack>,
}

/// Finishes the current request: emits the span-end event, logs a
/// completion line, records endpoint metrics and drops the request's
/// operation reference. Safe to call once per request; later calls are
/// no-ops.
pub fn finish_request(metrics: &EndpointMetrics, outcome: RequestOutcome<'_>) -> Option<Arc<Request>> {
    let tag = tracker::current()?;
    let req = tag.req.clone()?;
    if !req.mark_finished() {
        return None;
    }

    let code = outcome.err.map(|e| e.code).unwrap_or(Code::Ok);
    let duration = req.start.elapsed();

    if req.traced {
        if let Some(trace) = &tag.op.trace {
            let data = match req.typ {
                RequestType::Rpc => SpanEndData::Request {
                    http_status: outcome.http_status,
                    outputs: outcome.outputs,
                },
                RequestType::AuthHandler => SpanEndData::Auth {
                    user_data: outcome.outputs,
                },
                RequestType::PubSubMessage => SpanEndData::PubsubMessage,
                RequestType::Test => SpanEndData::Test {
                    failed: outcome.err.is_some(),
                    skipped: false,
                },
            };
            trace.span_end(&req, outcome.err, outcome.panic_stack, data);
        }
    }

    {
        let _guard = req.logger.enter();
        let duration_ms = duration.as_secs_f64() * 1e3;
        match outcome.err {
            None => tracing::info!(code = code.as_str(), duration_ms, "request completed"),
            Some(err) => {
                tracing::error!(code = code.as_str(), duration_ms, error = %err, "request failed")
            }
        }
    }

    metrics.record(&req.service, &req.endpoint, code, duration);
    tracker::finish_request()
}
