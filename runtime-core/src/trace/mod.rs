//! The trace pipeline: per-operation event buffers, payload emitters, and
//! the reporter that ships completed traces to the platform ingest
//! endpoint.

mod anchor;
mod buf;
mod reporter;
mod tracer;

pub use anchor::TimeAnchor;
pub use buf::{CompletedTrace, TraceBuf, Tracer};
pub use reporter::{streaming_tracer, Reporter, ReporterConfig};
pub use tracer::{LogField, LogFieldValue, LogLevel, RoundTrip, SpanEndData};

use runtime_api::SpanId;
use std::sync::Arc;

/// Runs `f` with the current task's trace buffer, request span and task
/// counter when the task is working on behalf of a traced request.
pub(crate) fn with_current<R>(f: impl FnOnce(&Arc<TraceBuf>, SpanId, u32) -> R) -> Option<R> {
    let tag = crate::tracker::current()?;
    let req = tag.req.as_ref()?;
    if !req.traced {
        return None;
    }
    let trace = tag.op.trace.as_ref()?;
    Some(f(trace, req.span_id, tag.taskctr))
}
