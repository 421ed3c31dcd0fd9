//! Forwards `tracing` events emitted on a traced request into the trace
//! stream as `LogMessage` events.

use crate::trace::{LogField, LogFieldValue, LogLevel};
use crate::tracker;
use tracing_core::field::{Field, Visit};
use tracing_core::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A [`Layer`] that catches log events on tasks tagged with a traced
/// request and appends them to the operation's trace buffer. Events on
/// untagged or untraced tasks pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceLogLayer;

impl TraceLogLayer {
    pub fn new() -> Self {
        TraceLogLayer
    }
}

fn wire_level(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE => LogLevel::Trace,
        Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warn,
        Level::ERROR => LogLevel::Error,
    }
}

impl<S: Subscriber> Layer<S> for TraceLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(tag) = tracker::current() else { return };
        let Some(req) = tag.req.as_ref() else { return };
        if !req.traced {
            return;
        }
        let Some(trace) = tag.op.trace.as_ref() else { return };

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);
        trace.log_message(
            req.span_id,
            tag.taskctr,
            wire_level(event.metadata().level()),
            &visitor.message,
            &visitor.fields,
            None,
        );
    }
}

#[derive(Default)]
struct LogVisitor {
    message: String,
    fields: Vec<LogField>,
}

impl LogVisitor {
    fn push(&mut self, field: &Field, value: LogFieldValue) {
        self.fields.push(LogField {
            key: field.name().to_string(),
            value,
        });
    }
}

impl Visit for LogVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push(field, LogFieldValue::Str(value.to_string()));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, LogFieldValue::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, LogFieldValue::Int(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, LogFieldValue::Uint(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, LogFieldValue::Float(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, LogFieldValue::Error(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.push(field, LogFieldValue::Str(rendered));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visitor_separates_message_from_fields() {
        // Drive the visitor through a real event dispatch.
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Capture(Arc<Mutex<Option<(String, usize)>>>);

        impl<S: Subscriber> Layer<S> for Capture {
            fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
                let mut visitor = LogVisitor::default();
                event.record(&mut visitor);
                *self.0.lock().unwrap() = Some((visitor.message, visitor.fields.len()));
            }
        }

        use tracing_subscriber::layer::SubscriberExt;
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(user = "u-1", attempts = 3u64, "it happened");
        });

        let (message, nfields) = capture.0.lock().unwrap().clone().expect("event seen");
        assert_eq!(message, "it happened");
        assert_eq!(nfields, 2);
    }
}
