//! Payload emitters: how each event kind is encoded into an operation's
//! trace buffer. Readers must consume fields in exactly this order.

use super::TraceBuf;
use crate::error::Error;
use crate::model::{Request, RequestType};
use crate::stack::{self, Stack};
use runtime_api::{EventBuffer, EventId, EventType, HttpEventCode, SpanId, TraceId};
use std::sync::Mutex;
use tokio::time::Instant;

/// Severity of a log message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

#[derive(Debug, Clone)]
pub enum LogFieldValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Json(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct LogField {
    pub key: String,
    pub value: LogFieldValue,
}

/// What a span-end event carries beyond the shared error/duration fields.
pub enum SpanEndData<'a> {
    Request { http_status: u16, outputs: &'a [u8] },
    Auth { user_data: &'a [u8] },
    PubsubMessage,
    Test { failed: bool, skipped: bool },
}

fn opt_trace_id(buf: &mut EventBuffer, id: Option<TraceId>) {
    match id {
        Some(id) => {
            buf.bool(true);
            buf.bytes(&id.0);
        }
        None => buf.bool(false),
    }
}

fn opt_span_id(buf: &mut EventBuffer, id: Option<SpanId>) {
    match id {
        Some(id) => {
            buf.bool(true);
            buf.bytes(&id.0);
        }
        None => buf.bool(false),
    }
}

fn opt_error(buf: &mut EventBuffer, err: Option<&Error>) {
    match err {
        Some(err) => {
            buf.bool(true);
            buf.str(&err.message);
            stack::encode_opt(err.stack.as_ref(), buf);
        }
        None => buf.bool(false),
    }
}

/// The prefix shared by all span-start kinds.
fn span_start_prefix(buf: &mut EventBuffer, taskctr: u32, req: &Request) {
    buf.uvar(taskctr as u64);
    opt_trace_id(buf, req.parent_trace);
    opt_span_id(buf, req.parent_span);
    buf.opt_str(req.ext_correlation_id.as_deref());
}

impl TraceBuf {
    /// Emits the span-start event matching the request's type. `payload`
    /// is the request payload: the API request body, the auth payload, or
    /// the pub/sub message body.
    pub fn span_start(&self, taskctr: u32, req: &Request, payload: &[u8]) -> EventId {
        let mut buf = EventBuffer::with_capacity(128);
        span_start_prefix(&mut buf, taskctr, req);
        let typ = match req.typ {
            RequestType::Rpc => {
                buf.str(&req.service);
                buf.str(&req.endpoint);
                buf.str(&req.method);
                buf.str(&req.path);
                buf.uvar(req.path_params.len() as u64);
                for (_, value) in &req.path_params {
                    buf.str(value);
                }
                buf.opt_str(req.uid.as_deref());
                buf.byte_string(payload);
                EventType::RequestSpanStart
            }
            RequestType::AuthHandler => {
                buf.str(&req.service);
                buf.str(&req.endpoint);
                buf.byte_string(payload);
                EventType::AuthSpanStart
            }
            RequestType::PubSubMessage => {
                let msg = req.msg.as_ref();
                buf.str(&req.service);
                buf.str(msg.map(|m| m.topic.as_str()).unwrap_or(""));
                buf.str(msg.map(|m| m.subscription.as_str()).unwrap_or(""));
                buf.str(msg.map(|m| m.message_id.as_str()).unwrap_or(""));
                buf.uvar(msg.map(|m| m.attempt).unwrap_or(0) as u64);
                buf.time(msg.map(|m| m.published).unwrap_or(std::time::UNIX_EPOCH));
                buf.byte_string(payload);
                EventType::PubsubMessageSpanStart
            }
            RequestType::Test => {
                buf.str(&req.service);
                buf.str(&req.endpoint);
                buf.opt_str(req.uid.as_deref());
                EventType::TestSpanStart
            }
        };
        self.push(typ, req.span_id, buf.as_slice())
    }

    /// Emits the span-end event for a finished request.
    pub fn span_end(
        &self,
        req: &Request,
        err: Option<&Error>,
        panic_stack: Option<&Stack>,
        data: SpanEndData<'_>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(128);
        buf.duration(req.start.elapsed().as_nanos() as i64);
        buf.byte(err.map(|e| e.code as u8).unwrap_or(0));
        opt_error(&mut buf, err);
        match panic_stack {
            Some(s) => {
                buf.bool(true);
                s.encode(&mut buf);
            }
            None => buf.bool(false),
        }
        opt_trace_id(&mut buf, req.parent_trace);
        opt_span_id(&mut buf, req.parent_span);

        let typ = match data {
            SpanEndData::Request { http_status, outputs } => {
                buf.str(&req.service);
                buf.str(&req.endpoint);
                buf.uvar(http_status as u64);
                buf.byte_string(outputs);
                buf.opt_str(req.uid.as_deref());
                EventType::RequestSpanEnd
            }
            SpanEndData::Auth { user_data } => {
                buf.str(&req.service);
                buf.str(&req.endpoint);
                buf.opt_str(req.uid.as_deref());
                buf.byte_string(user_data);
                EventType::AuthSpanEnd
            }
            SpanEndData::PubsubMessage => {
                let msg = req.msg.as_ref();
                buf.str(&req.service);
                buf.str(msg.map(|m| m.topic.as_str()).unwrap_or(""));
                buf.str(msg.map(|m| m.subscription.as_str()).unwrap_or(""));
                buf.str(msg.map(|m| m.message_id.as_str()).unwrap_or(""));
                EventType::PubsubMessageSpanEnd
            }
            SpanEndData::Test { failed, skipped } => {
                buf.bool(failed);
                buf.bool(skipped);
                EventType::TestSpanEnd
            }
        };
        self.push(typ, req.span_id, buf.as_slice())
    }

    pub fn rpc_call_start(
        &self,
        span: SpanId,
        taskctr: u32,
        target_service: &str,
        target_endpoint: &str,
        stack: Option<&Stack>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(64);
        buf.uvar(taskctr as u64);
        buf.str(target_service);
        buf.str(target_endpoint);
        stack::encode_opt(stack, &mut buf);
        self.push(EventType::RpcCallStart, span, buf.as_slice())
    }

    pub fn rpc_call_end(&self, span: SpanId, err: Option<&Error>) -> EventId {
        let mut buf = EventBuffer::with_capacity(16);
        opt_error(&mut buf, err);
        self.push(EventType::RpcCallEnd, span, buf.as_slice())
    }

    pub fn db_query_start(
        &self,
        span: SpanId,
        taskctr: u32,
        qid: u64,
        txid: u64,
        query: &str,
        stack: Option<&Stack>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(128);
        buf.uvar(taskctr as u64);
        buf.uvar(qid);
        buf.uvar(txid);
        buf.str(query);
        stack::encode_opt(stack, &mut buf);
        self.push(EventType::DbQueryStart, span, buf.as_slice())
    }

    pub fn db_query_end(&self, span: SpanId, qid: u64, err: Option<&Error>) -> EventId {
        let mut buf = EventBuffer::with_capacity(16);
        buf.uvar(qid);
        opt_error(&mut buf, err);
        self.push(EventType::DbQueryEnd, span, buf.as_slice())
    }

    pub fn db_tx_start(
        &self,
        span: SpanId,
        taskctr: u32,
        txid: u64,
        stack: Option<&Stack>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(32);
        buf.uvar(taskctr as u64);
        buf.uvar(txid);
        stack::encode_opt(stack, &mut buf);
        self.push(EventType::DbTransactionStart, span, buf.as_slice())
    }

    pub fn db_tx_end(
        &self,
        span: SpanId,
        taskctr: u32,
        txid: u64,
        commit: bool,
        err: Option<&Error>,
        stack: Option<&Stack>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(32);
        buf.uvar(taskctr as u64);
        buf.uvar(txid);
        buf.bool(commit);
        opt_error(&mut buf, err);
        stack::encode_opt(stack, &mut buf);
        self.push(EventType::DbTransactionEnd, span, buf.as_slice())
    }

    pub fn pubsub_publish_start(
        &self,
        span: SpanId,
        taskctr: u32,
        publish_id: u64,
        topic: &str,
        message: &[u8],
        stack: Option<&Stack>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(128);
        buf.uvar(taskctr as u64);
        buf.uvar(publish_id);
        buf.str(topic);
        buf.byte_string(message);
        stack::encode_opt(stack, &mut buf);
        self.push(EventType::PubsubPublishStart, span, buf.as_slice())
    }

    pub fn pubsub_publish_end(
        &self,
        span: SpanId,
        publish_id: u64,
        message_id: Option<&str>,
        err: Option<&Error>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(32);
        buf.uvar(publish_id);
        buf.opt_str(message_id);
        opt_error(&mut buf, err);
        self.push(EventType::PubsubPublishEnd, span, buf.as_slice())
    }

    pub fn cache_call_start(
        &self,
        span: SpanId,
        taskctr: u32,
        operation: &str,
        write: bool,
        keys: &[String],
        stack: Option<&Stack>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(64);
        buf.uvar(taskctr as u64);
        buf.str(operation);
        buf.bool(write);
        buf.uvar(keys.len() as u64);
        for key in keys {
            buf.str(key);
        }
        stack::encode_opt(stack, &mut buf);
        self.push(EventType::CacheCallStart, span, buf.as_slice())
    }

    /// `result` bytes: 1 ok, 2 no such key, 3 conflict, 4 error.
    pub fn cache_call_end(&self, span: SpanId, result: u8, err: Option<&Error>) -> EventId {
        let mut buf = EventBuffer::with_capacity(16);
        buf.byte(result);
        opt_error(&mut buf, err);
        self.push(EventType::CacheCallEnd, span, buf.as_slice())
    }

    pub fn http_call_start(
        &self,
        span: SpanId,
        taskctr: u32,
        correlation: SpanId,
        method: &str,
        url: &str,
        stack: Option<&Stack>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(128);
        buf.uvar(taskctr as u64);
        buf.bytes(&correlation.0);
        buf.str(method);
        buf.str(url);
        stack::encode_opt(stack, &mut buf);
        self.push(EventType::HttpCallStart, span, buf.as_slice())
    }

    pub fn http_call_end(
        &self,
        span: SpanId,
        correlation: SpanId,
        status: Option<u16>,
        err: Option<&Error>,
        round_trip: &RoundTrip,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(128);
        buf.bytes(&correlation.0);
        match status {
            Some(code) => {
                buf.bool(true);
                buf.uvar(code as u64);
            }
            None => buf.bool(false),
        }
        opt_error(&mut buf, err);
        let events = round_trip.events.lock().expect("round trip poisoned");
        buf.uvar(events.len() as u64);
        for ev in events.iter() {
            buf.byte(ev.code as u8);
            buf.ivar(ev.nanotime);
            buf.byte_string(&ev.payload);
        }
        self.push(EventType::HttpCallEnd, span, buf.as_slice())
    }

    pub fn log_message(
        &self,
        span: SpanId,
        taskctr: u32,
        level: LogLevel,
        msg: &str,
        fields: &[LogField],
        stack: Option<&Stack>,
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(128);
        buf.uvar(taskctr as u64);
        buf.byte(level as u8);
        buf.str(msg);
        buf.uvar(fields.len() as u64);
        for field in fields {
            buf.str(&field.key);
            match &field.value {
                LogFieldValue::Str(v) => {
                    buf.byte(1);
                    buf.str(v);
                }
                LogFieldValue::Bool(v) => {
                    buf.byte(2);
                    buf.bool(*v);
                }
                LogFieldValue::Int(v) => {
                    buf.byte(3);
                    buf.ivar(*v);
                }
                LogFieldValue::Uint(v) => {
                    buf.byte(4);
                    buf.uvar(*v);
                }
                LogFieldValue::Float(v) => {
                    buf.byte(5);
                    buf.f64(*v);
                }
                LogFieldValue::Json(v) => {
                    buf.byte(6);
                    buf.str(v);
                }
                LogFieldValue::Error(v) => {
                    buf.byte(7);
                    buf.str(v);
                }
            }
        }
        stack::encode_opt(stack, &mut buf);
        self.push(EventType::LogMessage, span, buf.as_slice())
    }

    pub fn service_init_start(&self, span: SpanId, service: &str) -> EventId {
        let mut buf = EventBuffer::with_capacity(32);
        buf.str(service);
        self.push(EventType::ServiceInitStart, span, buf.as_slice())
    }

    pub fn service_init_end(&self, span: SpanId, err: Option<&Error>) -> EventId {
        let mut buf = EventBuffer::with_capacity(16);
        opt_error(&mut buf, err);
        self.push(EventType::ServiceInitEnd, span, buf.as_slice())
    }

    pub fn body_stream(
        &self,
        span: SpanId,
        is_response: bool,
        overflowed: bool,
        data: &[u8],
    ) -> EventId {
        let mut buf = EventBuffer::with_capacity(64 + data.len());
        buf.bool(is_response);
        buf.bool(overflowed);
        buf.byte_string(data);
        self.push(EventType::BodyStream, span, buf.as_slice())
    }
}

/// One recorded HTTP round-trip sub-event.
#[derive(Debug)]
pub struct RoundTripEvent {
    pub code: HttpEventCode,
    pub nanotime: i64,
    pub payload: Vec<u8>,
}

/// Collects the sub-events of one outbound HTTP round-trip. The
/// collection is encoded into the `HttpCallEnd` event.
#[derive(Debug)]
pub struct RoundTrip {
    start: Instant,
    events: Mutex<Vec<RoundTripEvent>>,
}

impl RoundTrip {
    pub fn new() -> Self {
        RoundTrip {
            start: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, code: HttpEventCode, payload: Vec<u8>) {
        let nanotime = self.start.elapsed().as_nanos() as i64;
        self.events.lock().expect("round trip poisoned").push(RoundTripEvent {
            code,
            nanotime,
            payload,
        });
    }

    pub fn get_conn(&self, host_port: &str) {
        let mut buf = EventBuffer::with_capacity(32);
        buf.str(host_port);
        self.record(HttpEventCode::GetConn, buf.into_vec());
    }

    pub fn got_conn(&self, reused: bool) {
        let mut buf = EventBuffer::with_capacity(8);
        buf.bool(reused);
        self.record(HttpEventCode::GotConn, buf.into_vec());
    }

    pub fn got_first_response_byte(&self) {
        self.record(HttpEventCode::GotFirstResponseByte, Vec::new());
    }

    pub fn got_1xx_response(&self, code: u16) {
        let mut buf = EventBuffer::with_capacity(8);
        buf.uvar(code as u64);
        self.record(HttpEventCode::Got1xxResponse, buf.into_vec());
    }

    pub fn dns_start(&self, host: &str) {
        let mut buf = EventBuffer::with_capacity(32);
        buf.str(host);
        self.record(HttpEventCode::DnsStart, buf.into_vec());
    }

    pub fn dns_done(&self, err: Option<&str>) {
        let mut buf = EventBuffer::with_capacity(32);
        buf.opt_str(err);
        self.record(HttpEventCode::DnsDone, buf.into_vec());
    }

    pub fn connect_start(&self, addr: &str) {
        let mut buf = EventBuffer::with_capacity(32);
        buf.str(addr);
        self.record(HttpEventCode::ConnectStart, buf.into_vec());
    }

    pub fn connect_done(&self, addr: &str, err: Option<&str>) {
        let mut buf = EventBuffer::with_capacity(32);
        buf.str(addr);
        buf.opt_str(err);
        self.record(HttpEventCode::ConnectDone, buf.into_vec());
    }

    pub fn tls_handshake_start(&self) {
        self.record(HttpEventCode::TlsHandshakeStart, Vec::new());
    }

    pub fn tls_handshake_done(&self, err: Option<&str>) {
        let mut buf = EventBuffer::with_capacity(32);
        buf.opt_str(err);
        self.record(HttpEventCode::TlsHandshakeDone, buf.into_vec());
    }

    pub fn wrote_headers(&self) {
        self.record(HttpEventCode::WroteHeaders, Vec::new());
    }

    pub fn wrote_request(&self, err: Option<&str>) {
        let mut buf = EventBuffer::with_capacity(32);
        buf.opt_str(err);
        self.record(HttpEventCode::WroteRequest, buf.into_vec());
    }

    pub fn wait_100_continue(&self) {
        self.record(HttpEventCode::Wait100Continue, Vec::new());
    }

    pub fn closed_body(&self, err: Option<&str>) {
        let mut buf = EventBuffer::with_capacity(32);
        buf.opt_str(err);
        self.record(HttpEventCode::ClosedBody, buf.into_vec());
    }

    #[cfg(test)]
    pub(crate) fn codes(&self) -> Vec<HttpEventCode> {
        self.events
            .lock()
            .expect("round trip poisoned")
            .iter()
            .map(|e| e.code)
            .collect()
    }
}

impl Default for RoundTrip {
    fn default() -> Self {
        Self::new()
    }
}
