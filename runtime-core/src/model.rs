use crate::trace::TraceBuf;
use runtime_api::{SpanId, TraceId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;

/// What kind of externally triggered work a request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Rpc,
    AuthHandler,
    PubSubMessage,
    Test,
}

/// Delivery metadata carried by pub/sub message requests.
#[derive(Debug, Clone)]
pub struct MessageData {
    pub topic: String,
    pub subscription: String,
    pub message_id: String,
    pub attempt: u32,
    pub published: SystemTime,
}

/// A root unit of externally triggered work. One operation may span many
/// requests (auth handler plus endpoint, fan-out children) and many tasks.
#[derive(Debug)]
pub struct Operation {
    pub start: Instant,
    /// The operation's trace buffer; `None` when the operation is not
    /// being traced.
    pub trace: Option<Arc<TraceBuf>>,
    refs: AtomicUsize,
    taskctr: AtomicU32,
}

impl Operation {
    /// A fresh operation holds one reference, owned by the task that
    /// began it.
    pub fn new(trace: Option<Arc<TraceBuf>>) -> Arc<Self> {
        Arc::new(Operation {
            start: Instant::now(),
            trace,
            refs: AtomicUsize::new(1),
            taskctr: AtomicU32::new(0),
        })
    }

    pub fn trace_id(&self) -> Option<TraceId> {
        self.trace.as_ref().map(|t| t.trace_id())
    }

    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference. When the count hits zero a traced operation's
    /// buffer is submitted to the reporter, exactly once.
    pub fn dec_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(trace) = &self.trace {
                trace.submit();
            }
        }
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Allocates the next task counter within this operation.
    pub fn next_task(&self) -> u32 {
        self.taskctr.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A single API call, auth handler invocation, pub/sub delivery, or test.
#[derive(Debug)]
pub struct Request {
    pub typ: RequestType,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_trace: Option<TraceId>,
    pub parent_span: Option<SpanId>,
    pub ext_correlation_id: Option<String>,
    pub uid: Option<String>,
    pub auth_data: Option<serde_json::Value>,
    pub service: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    /// Path parameters in route order.
    pub path_params: Vec<(String, String)>,
    pub msg: Option<MessageData>,
    pub start: Instant,
    pub start_time: SystemTime,
    pub logger: tracing::Span,
    pub traced: bool,
    finished: AtomicBool,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        typ: RequestType,
        trace_id: TraceId,
        span_id: SpanId,
        parent_trace: Option<TraceId>,
        parent_span: Option<SpanId>,
        ext_correlation_id: Option<String>,
        uid: Option<String>,
        auth_data: Option<serde_json::Value>,
        service: String,
        endpoint: String,
        method: String,
        path: String,
        path_params: Vec<(String, String)>,
        msg: Option<MessageData>,
        logger: tracing::Span,
        traced: bool,
    ) -> Self {
        Request {
            typ,
            trace_id,
            span_id,
            parent_trace,
            parent_span,
            ext_correlation_id,
            uid,
            auth_data,
            service,
            endpoint,
            method,
            path,
            path_params,
            msg,
            start: Instant::now(),
            start_time: SystemTime::now(),
            logger,
            traced,
            finished: AtomicBool::new(false),
        }
    }

    /// Marks the request finished; returns false if it already was.
    /// Finishing twice is a lifecycle bug in the caller.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }
}
