//! The per-message delivery pipeline: every delivery runs as its own
//! operation and request, with the handler isolated behind a panic
//! catcher and its verdict propagated verbatim to the provider.

use super::{
    DeliveryCallback, DeliveryContext, Message, MessageDelivery, SubscriptionHandler,
    PARENT_TRACE_ID_ATTR,
};
use crate::error::{Code, Error};
use crate::lifecycle::{self, RequestDesc, RequestOutcome};
use crate::metrics::EndpointMetrics;
use crate::model::{MessageData, RequestType};
use crate::stack::Stack;
use crate::trace::Tracer;
use crate::tracker;
use futures::FutureExt;
use runtime_api::TraceId;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(super) struct PipelineConfig<T: Message> {
    pub service: String,
    pub topic: String,
    pub subscription: String,
    pub tracer: Tracer,
    pub metrics: Arc<EndpointMetrics>,
    pub tracing_enabled: bool,
    pub force: CancellationToken,
    pub handler: Arc<dyn SubscriptionHandler<T>>,
}

/// Renders a panic payload into the message surfaced on the request's
/// `Internal` error.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(super) fn delivery_pipeline<T: Message>(cfg: PipelineConfig<T>) -> Arc<DeliveryCallback> {
    let cfg = Arc::new(cfg);
    DeliveryCallback::new(move |delivery: MessageDelivery| {
        let cfg = cfg.clone();
        async move { deliver(cfg, delivery).await }.boxed()
    })
}

async fn deliver<T: Message>(
    cfg: Arc<PipelineConfig<T>>,
    delivery: MessageDelivery,
) -> Result<(), Error> {
    tracker::scope(async move {
        let parent_trace = delivery
            .attrs
            .get(PARENT_TRACE_ID_ATTR)
            .and_then(|raw| TraceId::from_base64(raw));

        let desc = RequestDesc {
            typ: Some(RequestType::PubSubMessage),
            service: cfg.service.clone(),
            endpoint: cfg.subscription.clone(),
            method: String::new(),
            path: String::new(),
            parent_trace,
            msg: Some(MessageData {
                topic: cfg.topic.clone(),
                subscription: cfg.subscription.clone(),
                message_id: delivery.message_id.clone(),
                attempt: delivery.attempt,
                published: delivery.published,
            }),
            payload: delivery.data.clone(),
            traced: cfg.tracing_enabled,
            ..Default::default()
        };
        lifecycle::begin_request(&cfg.tracer, desc)?;

        let verdict = run_handler(&cfg, delivery).await;

        let (err, panic_stack) = match &verdict {
            Ok(()) => (None, None),
            Err((err, stack)) => (Some(err), stack.as_ref()),
        };
        lifecycle::finish_request(
            &cfg.metrics,
            RequestOutcome {
                outputs: b"",
                err,
                http_status: err.map(|e| e.code.http_status()).unwrap_or(200),
                panic_stack,
            },
        );

        verdict.map_err(|(err, _)| err)
    })
    .await
}

async fn run_handler<T: Message>(
    cfg: &PipelineConfig<T>,
    delivery: MessageDelivery,
) -> Result<(), (Error, Option<Stack>)> {
    let mut msg: T = serde_json::from_slice(&delivery.data).map_err(|err| {
        (
            Error::new(Code::InvalidArgument, format!("failed to decode message: {err}")),
            None,
        )
    })?;
    msg.apply_attributes(&delivery.attrs);

    let ctx = DeliveryContext {
        force: cfg.force.clone(),
        message_id: delivery.message_id,
        attempt: delivery.attempt,
        published: delivery.published,
    };

    match AssertUnwindSafe(cfg.handler.handle(ctx, msg)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err((err, None)),
        Err(payload) => {
            let msg = panic_message(payload);
            Err((
                Error::new(Code::Internal, format!("subscription handler panicked: {msg}")),
                Some(Stack::capture()),
            ))
        }
    }
}
