//! Per-task tracking of the current operation and request.
//!
//! There is no runtime hook that copies state into spawned tasks, so the
//! tag lives in a task-local and [`spawn`] is the default way runtime and
//! user code start tasks: it transfers the `(operation, request)` pair and
//! allocates a fresh task counter under the same operation.

use crate::model::{Operation, Request};
use crate::trace::Tracer;
use runtime_api::{EntropyError, EventBuffer, EventType, SpanId};
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

tokio::task_local! {
    static CURRENT: RefCell<Option<TaskTag>>;
}

/// The per-task tuple `(operation, request, task counter)`.
///
/// Shared across await points within one task; transferred (with a fresh
/// counter) into tasks started via [`spawn`]. Never crosses operation
/// boundaries.
#[derive(Debug, Clone)]
pub struct TaskTag {
    pub op: Arc<Operation>,
    pub req: Option<Arc<Request>>,
    pub taskctr: u32,
}

/// Runs `fut` inside a fresh tracking scope with no tag set.
///
/// Every externally triggered entry point (API dispatch, pub/sub
/// delivery, tests) wraps its work in a scope; the tracking operations
/// below are no-ops outside one.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    CURRENT.scope(RefCell::new(None), fut).await
}

fn with_tag<R>(f: impl FnOnce(&mut Option<TaskTag>) -> R) -> Option<R> {
    CURRENT.try_with(|cell| f(&mut cell.borrow_mut())).ok()
}

/// The current task's tag, if any.
pub fn current() -> Option<TaskTag> {
    with_tag(|tag| tag.clone()).flatten()
}

/// The request the current task is working on behalf of, if any.
pub fn current_request() -> Option<Arc<Request>> {
    with_tag(|tag| tag.as_ref().and_then(|t| t.req.clone())).flatten()
}

/// Result of [`ensure_op`]: the operation plus whether this call created
/// it (and therefore whether the caller's request adopts the initial
/// reference instead of adding one).
pub struct EnsuredOp {
    pub op: Arc<Operation>,
    pub created: bool,
}

/// Begins a new operation on an untagged task.
///
/// The fresh operation holds one reference, owned by the caller; balance
/// it with [`finish_op`] unless a request adopts it via the untagged
/// [`attach_request`] path.
pub fn begin_op(tracer: &Tracer, trace: bool) -> Result<Arc<Operation>, EntropyError> {
    let buf = if trace { Some(tracer.new_trace()?) } else { None };
    let op = Operation::new(buf);
    let taskctr = op.next_task();
    with_tag(|tag| {
        *tag = Some(TaskTag {
            op: op.clone(),
            req: None,
            taskctr,
        });
    });
    Ok(op)
}

/// Unsets the tag and drops the operation reference taken by
/// [`begin_op`].
pub fn finish_op() {
    let taken = with_tag(|tag| tag.take()).flatten();
    if let Some(tag) = taken {
        tag.op.dec_ref();
    }
}

/// Returns the current operation, creating one (and tagging the task)
/// when the task is untagged.
pub fn ensure_op(tracer: &Tracer, trace: bool) -> Result<EnsuredOp, EntropyError> {
    if let Some(tag) = current() {
        return Ok(EnsuredOp {
            op: tag.op,
            created: false,
        });
    }
    let op = begin_op(tracer, trace)?;
    Ok(EnsuredOp { op, created: true })
}

/// Makes `req` the current request.
///
/// On a task that was already tagged before this request began, the
/// operation gains a reference; when the operation was created for this
/// request (`op_created`), the request adopts the initial reference and
/// the final [`finish_request`] completes the operation.
pub fn attach_request(req: Arc<Request>, op_created: bool) {
    with_tag(|tag| {
        let Some(tag) = tag.as_mut() else { return };
        if !op_created {
            tag.op.inc_ref();
        }
        tag.req = Some(req);
    });
}

/// Replaces the current request without touching reference counts, and
/// returns the previous one. Used by callers that interleave requests on
/// one task (an auth handler before its endpoint, nested in-process
/// calls).
pub fn swap_request(new: Option<Arc<Request>>) -> Option<Arc<Request>> {
    with_tag(|tag| {
        let tag = tag.as_mut()?;
        let clearing = new.is_none();
        let prev = std::mem::replace(&mut tag.req, new);
        if clearing {
            if let (Some(prev), Some(trace)) = (&prev, &tag.op.trace) {
                if prev.traced {
                    let mut buf = EventBuffer::new();
                    buf.uvar(tag.taskctr as u64);
                    trace.push(EventType::TaskClear, prev.span_id, buf.as_slice());
                }
            }
        }
        prev
    })
    .flatten()
}

/// Ends the current request: removes it from the tag and drops its
/// operation reference. Returns the request so the lifecycle layer can
/// emit its end event *before* calling this (a zero refcount submits the
/// trace).
pub fn finish_request() -> Option<Arc<Request>> {
    let taken = with_tag(|tag| {
        let tag = tag.as_mut()?;
        tag.req.take().map(|req| (tag.op.clone(), req))
    })
    .flatten();
    let (op, req) = taken?;
    op.dec_ref();
    Some(req)
}

/// Spawns a task that inherits the current `(operation, request)` under a
/// fresh task counter. Exiting the child does not affect the operation's
/// reference count; the operation is held by its requests.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(tag) => {
            let taskctr = tag.op.next_task();
            let child = TaskTag {
                op: tag.op.clone(),
                req: tag.req.clone(),
                taskctr,
            };
            let span = child.req.as_ref().map(|r| r.span_id).unwrap_or_default();
            let traced = child.req.as_ref().map(|r| r.traced).unwrap_or(false);
            if traced {
                if let Some(trace) = &child.op.trace {
                    let mut buf = EventBuffer::new();
                    buf.uvar(taskctr as u64);
                    buf.uvar(tag.taskctr as u64);
                    trace.push(EventType::TaskStart, span, buf.as_slice());
                }
            }
            let op = child.op.clone();
            tokio::spawn(CURRENT.scope(RefCell::new(Some(child)), async move {
                let out = fut.await;
                if traced {
                    if let Some(trace) = &op.trace {
                        let mut buf = EventBuffer::new();
                        buf.uvar(taskctr as u64);
                        trace.push(EventType::TaskEnd, span, buf.as_slice());
                    }
                }
                out
            }))
        }
        None => tokio::spawn(CURRENT.scope(RefCell::new(None), fut)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestType;
    use runtime_api::TraceId;

    fn test_request(span: u64, traced: bool) -> Arc<Request> {
        Arc::new(Request::new(
            RequestType::Rpc,
            TraceId::default(),
            SpanId::from_u64(span),
            None,
            None,
            None,
            None,
            None,
            "svc".into(),
            "ep".into(),
            "GET".into(),
            "/x".into(),
            Vec::new(),
            None,
            tracing::Span::none(),
            traced,
        ))
    }

    #[tokio::test]
    async fn untagged_task_has_no_tag() {
        scope(async {
            assert!(current().is_none());
            assert!(current_request().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn begin_and_finish_op_balance() {
        scope(async {
            let tracer = Tracer::noop();
            let op = begin_op(&tracer, false).unwrap();
            assert_eq!(op.refs(), 1);
            assert!(current().is_some());
            finish_op();
            assert_eq!(op.refs(), 0);
            assert!(current().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn matched_request_pairs_restore_the_ref_count() {
        scope(async {
            let tracer = Tracer::noop();
            let op = begin_op(&tracer, false).unwrap();
            let before = op.refs();

            let ensured = ensure_op(&tracer, false).unwrap();
            assert!(!ensured.created);
            attach_request(test_request(1, false), ensured.created);
            assert_eq!(op.refs(), before + 1);

            finish_request().expect("request attached");
            assert_eq!(op.refs(), before);
            finish_op();
        })
        .await;
    }

    #[tokio::test]
    async fn first_request_adopts_an_implicit_op() {
        scope(async {
            let tracer = Tracer::noop();
            let ensured = ensure_op(&tracer, false).unwrap();
            assert!(ensured.created);
            let op = ensured.op.clone();
            attach_request(test_request(1, false), ensured.created);
            assert_eq!(op.refs(), 1);

            finish_request().expect("request attached");
            assert_eq!(op.refs(), 0);
        })
        .await;
    }

    #[tokio::test]
    async fn spawned_tasks_inherit_op_and_request() {
        scope(async {
            let tracer = Tracer::noop();
            let ensured = ensure_op(&tracer, false).unwrap();
            let op = ensured.op.clone();
            attach_request(test_request(9, false), ensured.created);

            let handle = spawn(async move {
                let tag = current().expect("inherited tag");
                assert_eq!(tag.req.as_ref().unwrap().span_id, SpanId::from_u64(9));
                tag.taskctr
            });
            let child_ctr = handle.await.unwrap();
            assert!(child_ctr > current().unwrap().taskctr);

            // Child exit left the refcount untouched.
            assert_eq!(op.refs(), 1);
            finish_request();
        })
        .await;
    }

    #[tokio::test]
    async fn swap_request_does_not_touch_refs() {
        scope(async {
            let tracer = Tracer::noop();
            let ensured = ensure_op(&tracer, false).unwrap();
            let op = ensured.op.clone();
            attach_request(test_request(1, false), ensured.created);
            let before = op.refs();

            let prev = swap_request(None);
            assert!(prev.is_some());
            assert_eq!(op.refs(), before);
            assert!(current_request().is_none());

            swap_request(prev);
            assert!(current_request().is_some());
            finish_request();
        })
        .await;
    }
}
