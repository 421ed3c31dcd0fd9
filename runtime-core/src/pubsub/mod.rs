//! Provider-agnostic pub/sub: typed topics with attribute marshaling,
//! per-message request tracking with panic isolation, retry with
//! exponential backoff, and push-endpoint delivery.

mod memory;
mod push;
mod retry;
mod sub;

pub use memory::MemoryProvider;
pub use push::{PushAuth, PushClaims, PushPayload, PushProvider, PushRegistry};
pub use retry::{
    RetryPolicy, DEFAULT_ACK_DEADLINE, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES,
    DEFAULT_MIN_BACKOFF,
};

use crate::config::{PubsubProviderConfig, PubsubSubscriptionConfig, PubsubTopicConfig};
use crate::error::{Code, Error};
use crate::metrics::EndpointMetrics;
use crate::trace::Tracer;
use crate::tracker;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Attribute carrying the publishing request's trace id, correlating the
/// delivery span back to its publisher.
pub const PARENT_TRACE_ID_ATTR: &str = "parent_trace_id";

/// A message that can travel over a topic. Attribute-designated fields are
/// carried in the provider attribute map instead of the JSON body;
/// implementations extract them on publish and re-apply them on delivery.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn attributes(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn apply_attributes(&mut self, _attrs: &HashMap<String, String>) {}
}

/// A message as handed to a subscription by its provider.
#[derive(Debug, Clone)]
pub struct MessageDelivery {
    pub message_id: String,
    pub published: SystemTime,
    pub attempt: u32,
    pub attrs: HashMap<String, String>,
    pub data: Vec<u8>,
}

/// Delivery-scoped context handed to subscription handlers.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// Cancelled when shutdown forces in-flight work to stop.
    pub force: CancellationToken,
    pub message_id: String,
    pub attempt: u32,
    pub published: SystemTime,
}

/// A typed subscription handler.
#[async_trait]
pub trait SubscriptionHandler<T: Message>: Send + Sync + 'static {
    async fn handle(&self, ctx: DeliveryContext, msg: T) -> Result<(), Error>;
}

struct FnSubscriptionHandler<F>(F);

#[async_trait]
impl<T, F, Fut> SubscriptionHandler<T> for FnSubscriptionHandler<F>
where
    T: Message,
    F: Fn(DeliveryContext, T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn handle(&self, ctx: DeliveryContext, msg: T) -> Result<(), Error> {
        (self.0)(ctx, msg).await
    }
}

/// Wraps an async closure as a [`SubscriptionHandler`].
pub fn subscription_handler<T, F, Fut>(f: F) -> Arc<dyn SubscriptionHandler<T>>
where
    T: Message,
    F: Fn(DeliveryContext, T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(FnSubscriptionHandler(f))
}

/// The type-erased per-message callback handed to providers. The result
/// is the provider's ack/nack verdict, propagated verbatim from the
/// user handler.
pub struct DeliveryCallback {
    f: Box<dyn Fn(MessageDelivery) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>,
}

impl DeliveryCallback {
    pub fn new(
        f: impl Fn(MessageDelivery) -> BoxFuture<'static, Result<(), Error>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(DeliveryCallback { f: Box::new(f) })
    }

    pub async fn call(&self, delivery: MessageDelivery) -> Result<(), Error> {
        (self.f)(delivery).await
    }
}

impl std::fmt::Debug for DeliveryCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeliveryCallback")
    }
}

/// Shared machinery a provider needs to drive subscriptions.
#[derive(Clone)]
pub struct SubscribeContext {
    /// Cancelled when the manager stops fetching new messages.
    pub stop: CancellationToken,
    /// Cancelled when shutdown forces in-flight deliveries to stop.
    pub force: CancellationToken,
    /// Tracks in-flight delivery tasks for the shutdown drain.
    pub tasks: TaskTracker,
    /// Push-endpoint registry for push-capable providers.
    pub push: Arc<PushRegistry>,
}

/// A topic at a concrete provider.
#[async_trait]
pub trait TopicImplementation: Send + Sync + 'static {
    async fn publish_message(
        &self,
        ordering_key: Option<String>,
        attrs: HashMap<String, String>,
        data: Vec<u8>,
    ) -> Result<String, Error>;

    fn subscribe(
        &self,
        cfg: &PubsubSubscriptionConfig,
        ack_deadline: Duration,
        retry: RetryPolicy,
        ctx: &SubscribeContext,
        callback: Arc<DeliveryCallback>,
    );
}

/// A pub/sub provider. Registered explicitly at startup; the first
/// provider whose `matches` accepts a provider config block wins.
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn matches(&self, cfg: &PubsubProviderConfig) -> bool;
    fn new_topic(
        &self,
        provider_cfg: &PubsubProviderConfig,
        topic_cfg: &PubsubTopicConfig,
    ) -> Arc<dyn TopicImplementation>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    pub fn resolve(&self, cfg: &PubsubProviderConfig) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.matches(cfg)).cloned()
    }
}

/// Owns providers, topics and the delivery machinery for one service
/// instance.
pub struct Manager {
    tracer: Tracer,
    metrics: Arc<EndpointMetrics>,
    tracing_enabled: bool,
    registry: ProviderRegistry,
    providers_cfg: Vec<PubsubProviderConfig>,
    topics_cfg: HashMap<String, PubsubTopicConfig>,
    topics: Mutex<HashMap<String, Arc<dyn TopicImplementation>>>,
    push: Arc<PushRegistry>,
    stop: CancellationToken,
    force: CancellationToken,
    tasks: TaskTracker,
    publish_ctr: AtomicU64,
}

impl Manager {
    pub fn new(
        tracer: Tracer,
        metrics: Arc<EndpointMetrics>,
        tracing_enabled: bool,
        registry: ProviderRegistry,
        providers_cfg: Vec<PubsubProviderConfig>,
        topics_cfg: HashMap<String, PubsubTopicConfig>,
    ) -> Self {
        Manager {
            tracer,
            metrics,
            tracing_enabled,
            registry,
            providers_cfg,
            topics_cfg,
            topics: Mutex::new(HashMap::new()),
            push: Arc::new(PushRegistry::new()),
            stop: CancellationToken::new(),
            force: CancellationToken::new(),
            tasks: TaskTracker::new(),
            publish_ctr: AtomicU64::new(0),
        }
    }

    pub fn push_registry(&self) -> Arc<PushRegistry> {
        self.push.clone()
    }

    fn subscribe_context(&self) -> SubscribeContext {
        SubscribeContext {
            stop: self.stop.clone(),
            force: self.force.clone(),
            tasks: self.tasks.clone(),
            push: self.push.clone(),
        }
    }

    fn implementation(&self, name: &str) -> Result<(Arc<dyn TopicImplementation>, PubsubTopicConfig), Error> {
        let topic_cfg = self
            .topics_cfg
            .get(name)
            .ok_or_else(|| Error::new(Code::NotFound, format!("topic {name} is not configured")))?
            .clone();
        let mut topics = self.topics.lock().expect("topics poisoned");
        if let Some(imp) = topics.get(name) {
            return Ok((imp.clone(), topic_cfg));
        }

        let provider_cfg = self
            .providers_cfg
            .get(topic_cfg.provider_id)
            .ok_or_else(|| {
                Error::internal(format!(
                    "topic {name} references unknown provider {}",
                    topic_cfg.provider_id
                ))
            })?;
        let provider = self.registry.resolve(provider_cfg).ok_or_else(|| {
            Error::internal(format!("no registered provider accepts the config for topic {name}"))
        })?;
        let imp = provider.new_topic(provider_cfg, &topic_cfg);
        topics.insert(name.to_string(), imp.clone());
        Ok((imp, topic_cfg))
    }

    /// Resolves the typed handle for a configured topic.
    pub fn topic<T: Message>(self: &Arc<Self>, name: &str) -> Result<Topic<T>, Error> {
        let (imp, cfg) = self.implementation(name)?;
        Ok(Topic {
            name: name.to_string(),
            imp,
            cfg,
            manager: self.clone(),
            _msg: PhantomData,
        })
    }

    /// Stops fetching new messages, waits for in-flight deliveries, then
    /// releases provider resources. Bounded by the `force` token: when it
    /// fires, in-flight handlers observe their context's cancellation.
    pub async fn shutdown(&self, force_deadline: CancellationToken) {
        self.stop.cancel();
        self.tasks.close();
        tokio::select! {
            _ = self.tasks.wait() => {}
            _ = force_deadline.cancelled() => {
                self.force.cancel();
                // Give handlers a moment to observe the cancellation.
                let _ = tokio::time::timeout(Duration::from_secs(1), self.tasks.wait()).await;
            }
        }
        self.topics.lock().expect("topics poisoned").clear();
    }
}

/// A typed handle to a configured topic.
pub struct Topic<T: Message> {
    name: String,
    imp: Arc<dyn TopicImplementation>,
    cfg: PubsubTopicConfig,
    manager: Arc<Manager>,
    _msg: PhantomData<fn(T)>,
}

impl<T: Message> Topic<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes `msg`: attribute-designated fields go to the provider
    /// attribute map, the JSON encoding of the message is the body, and a
    /// traced publisher stamps its trace id into the attributes.
    pub async fn publish(&self, msg: &T) -> Result<String, Error> {
        let mut attrs: HashMap<String, String> = msg.attributes().into_iter().collect();
        let data = serde_json::to_vec(msg)
            .map_err(|err| Error::internal(format!("failed to encode message: {err}")))?;

        let current = tracker::current();
        let traced_req = current
            .as_ref()
            .and_then(|tag| tag.req.as_ref())
            .filter(|req| req.traced);
        if let Some(req) = traced_req {
            attrs.insert(PARENT_TRACE_ID_ATTR.to_string(), req.trace_id.to_base64());
        }

        let ordering_key = self
            .cfg
            .ordering_attr
            .as_ref()
            .and_then(|attr| attrs.get(attr).cloned());

        let publish_id = self.manager.publish_ctr.fetch_add(1, Ordering::Relaxed) + 1;
        let span_info = current.as_ref().and_then(|tag| {
            let req = tag.req.as_ref().filter(|r| r.traced)?;
            let trace = tag.op.trace.clone()?;
            Some((trace, req.span_id, tag.taskctr))
        });
        if let Some((trace, span, taskctr)) = &span_info {
            trace.pubsub_publish_start(
                *span,
                *taskctr,
                publish_id,
                &self.name,
                &data,
                Some(&crate::stack::Stack::capture()),
            );
        }

        let result = self.imp.publish_message(ordering_key, attrs, data).await;

        if let Some((trace, span, _)) = &span_info {
            trace.pubsub_publish_end(
                *span,
                publish_id,
                result.as_deref().ok(),
                result.as_ref().err(),
            );
        }
        result
    }

    /// Attaches `handler` to the named subscription of this topic. The
    /// per-message pipeline begins a fresh operation and request, catches
    /// panics, and propagates the handler verdict to the provider.
    pub fn subscribe(
        &self,
        service: &str,
        sub_name: &str,
        handler: Arc<dyn SubscriptionHandler<T>>,
    ) -> Result<(), Error> {
        let sub_cfg = self.cfg.subscriptions.get(sub_name).ok_or_else(|| {
            Error::new(
                Code::NotFound,
                format!("subscription {sub_name} of topic {} is not configured", self.name),
            )
        })?;

        let retry = RetryPolicy::from_config(sub_cfg.retry_policy.as_ref())?;
        let ack_deadline = if sub_cfg.ack_deadline > 0 {
            Duration::from_nanos(sub_cfg.ack_deadline as u64)
        } else {
            DEFAULT_ACK_DEADLINE
        };

        let ctx = self.manager.subscribe_context();
        let callback = sub::delivery_pipeline::<T>(sub::PipelineConfig {
            service: service.to_string(),
            topic: self.name.clone(),
            subscription: sub_name.to_string(),
            tracer: self.manager.tracer.clone(),
            metrics: self.manager.metrics.clone(),
            tracing_enabled: self.manager.tracing_enabled,
            force: ctx.force.clone(),
            handler,
        });

        self.imp.subscribe(sub_cfg, ack_deadline, retry, &ctx, callback);
        Ok(())
    }
}
