use super::TimeAnchor;
use bytes::Bytes;
use runtime_api::{signed_to_unsigned_i64, EntropyError, EventId, EventType, SpanId, TraceId, EVENT_HEADER_LEN};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A finished trace, ready to be shipped by the reporter.
#[derive(Debug)]
pub struct CompletedTrace {
    pub trace_id: TraceId,
    pub data: Bytes,
}

/// Hands out per-operation trace buffers and the channel they are
/// submitted on once their operation completes.
#[derive(Debug, Clone)]
pub struct Tracer {
    tx: mpsc::UnboundedSender<CompletedTrace>,
    anchor: TimeAnchor,
}

impl Tracer {
    pub(super) fn new(tx: mpsc::UnboundedSender<CompletedTrace>, anchor: TimeAnchor) -> Self {
        Tracer { tx, anchor }
    }

    /// A tracer whose completed traces are discarded; used by tests and by
    /// environments with no trace endpoint configured.
    pub fn noop() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Tracer {
            tx,
            anchor: TimeAnchor::new(),
        }
    }

    /// A tracer whose completed traces are handed to the returned
    /// receiver instead of a reporter; for tests and local tooling.
    pub fn capturing() -> (Self, mpsc::UnboundedReceiver<CompletedTrace>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Tracer {
                tx,
                anchor: TimeAnchor::new(),
            },
            rx,
        )
    }

    pub fn anchor(&self) -> &TimeAnchor {
        &self.anchor
    }

    /// Allocates the buffer for a new traced operation, generating its
    /// trace id. Fails only when the entropy source does; callers abort
    /// the operation in that case.
    pub fn new_trace(&self) -> Result<Arc<TraceBuf>, EntropyError> {
        let trace_id = TraceId::generate()?;
        Ok(Arc::new(TraceBuf {
            trace_id,
            anchor: self.anchor.clone(),
            events: Mutex::new(Vec::with_capacity(4 * 1024)),
            event_ctr: AtomicU64::new(0),
            submitted: AtomicBool::new(false),
            tx: self.tx.clone(),
        }))
    }
}

/// The append-only buffer of framed events for one operation.
///
/// Appends are serialized under a mutex; the append-time timestamp is
/// taken inside the critical section so events in the buffer are totally
/// ordered by nanotime.
#[derive(Debug)]
pub struct TraceBuf {
    trace_id: TraceId,
    anchor: TimeAnchor,
    events: Mutex<Vec<u8>>,
    event_ctr: AtomicU64,
    submitted: AtomicBool,
    tx: mpsc::UnboundedSender<CompletedTrace>,
}

impl TraceBuf {
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn anchor(&self) -> &TimeAnchor {
        &self.anchor
    }

    /// Frames `payload` as an event under `span` and appends it. Events
    /// pushed after the trace was submitted are dropped.
    pub fn push(&self, typ: EventType, span: SpanId, payload: &[u8]) -> EventId {
        if self.submitted.load(Ordering::Acquire) {
            return EventId(0);
        }
        let event_id = self.event_ctr.fetch_add(1, Ordering::Relaxed) + 1;
        let mut events = self.events.lock().expect("trace buffer poisoned");
        let ts = signed_to_unsigned_i64(self.anchor.nanotime(Instant::now()));

        events.reserve(EVENT_HEADER_LEN + payload.len());
        events.push(typ as u8);
        events.extend_from_slice(&event_id.to_le_bytes());
        events.extend_from_slice(&ts.to_le_bytes());
        events.extend_from_slice(&self.trace_id.0);
        events.extend_from_slice(&span.0);
        events.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        events.extend_from_slice(payload);
        EventId(event_id)
    }

    /// Marks the trace done and hands it to the reporter. Later calls are
    /// no-ops, as are appends racing the submit (their events are simply
    /// dropped with the operation).
    pub fn submit(&self) {
        if self.submitted.swap(true, Ordering::AcqRel) {
            return;
        }
        let data = {
            let mut events = self.events.lock().expect("trace buffer poisoned");
            std::mem::take(&mut *events)
        };
        let _ = self.tx.send(CompletedTrace {
            trace_id: self.trace_id,
            data: Bytes::from(data),
        });
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.events.lock().expect("trace buffer poisoned").clone()
    }
}
