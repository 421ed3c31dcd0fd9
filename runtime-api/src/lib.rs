//! Identifier types and the binary trace wire format for the request
//! runtime.
//!
//! This crate is pure data: it defines trace/span identifiers, the
//! append-only [`EventBuffer`] codec that trace payloads are built with,
//! and the event-type constants and framing used on the wire. It performs
//! no I/O and holds no runtime state; the `runtime-core` crate layers the
//! actual tracking, emission and transport on top.

mod eventbuf;
mod id;
mod protocol;

pub use eventbuf::{signed_to_unsigned_i64, unsigned_to_signed_i64, EventBuffer, ReadBuffer, ReadError};
pub use id::{EntropyError, EventId, SpanId, TraceId};
pub use protocol::{EventType, HttpEventCode, EVENT_HEADER_LEN, MAX_STACK_FRAMES, TRACE_VERSION};
