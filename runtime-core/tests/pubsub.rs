//! Pub/sub: attribute marshaling, in-process delivery, retry with
//! backoff, panic isolation, and publish-side trace correlation.

use async_trait::async_trait;
use runtime_core::config::{
    MemoryProviderConfig, PubsubProviderConfig, PubsubSubscriptionConfig, PubsubTopicConfig,
    RetryPolicyConfig,
};
use runtime_core::error::Error;
use runtime_core::metrics::EndpointMetrics;
use runtime_core::pubsub::{
    subscription_handler, DeliveryCallback, Manager, Message, MemoryProvider, Provider,
    ProviderRegistry, RetryPolicy, SubscribeContext, TopicImplementation, PARENT_TRACE_ID_ATTR,
};
use runtime_core::trace::Tracer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EmailMsg {
    #[serde(rename = "Foo")]
    foo: String,
    #[serde(skip)]
    x: u64,
}

impl Message for EmailMsg {
    fn attributes(&self) -> Vec<(String, String)> {
        vec![("x".to_string(), self.x.to_string())]
    }

    fn apply_attributes(&mut self, attrs: &HashMap<String, String>) {
        if let Some(raw) = attrs.get("x") {
            self.x = raw.parse().unwrap_or(0);
        }
    }
}

fn topic_cfg(retry: Option<RetryPolicyConfig>) -> HashMap<String, PubsubTopicConfig> {
    let mut subscriptions = HashMap::new();
    subscriptions.insert(
        "send".to_string(),
        PubsubSubscriptionConfig {
            id: "sub-1".to_string(),
            provider_name: "send-local".to_string(),
            push_only: false,
            ack_deadline: 0,
            message_retention: 0,
            retry_policy: retry,
        },
    );
    let mut topics = HashMap::new();
    topics.insert(
        "emails".to_string(),
        PubsubTopicConfig {
            provider_id: 0,
            provider_name: "emails-local".to_string(),
            ordering_attr: None,
            subscriptions,
        },
    );
    topics
}

fn memory_manager(retry: Option<RetryPolicyConfig>) -> Arc<Manager> {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(MemoryProvider));
    Arc::new(Manager::new(
        Tracer::noop(),
        Arc::new(EndpointMetrics::new()),
        false,
        registry,
        vec![PubsubProviderConfig {
            memory: Some(MemoryProviderConfig {}),
            push: None,
        }],
        topic_cfg(retry),
    ))
}

fn fast_retry(max_retries: i64) -> RetryPolicyConfig {
    RetryPolicyConfig {
        min_backoff: 1_000_000, // 1ms
        max_backoff: 4_000_000,
        max_retries,
    }
}

/// A provider that records publish calls instead of delivering them.
#[derive(Default)]
struct CaptureProvider {
    published: Arc<Mutex<Vec<(HashMap<String, String>, Vec<u8>)>>>,
}

struct CaptureTopic {
    published: Arc<Mutex<Vec<(HashMap<String, String>, Vec<u8>)>>>,
}

impl Provider for CaptureProvider {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn matches(&self, cfg: &PubsubProviderConfig) -> bool {
        cfg.memory.is_some()
    }

    fn new_topic(
        &self,
        _provider_cfg: &PubsubProviderConfig,
        _topic_cfg: &PubsubTopicConfig,
    ) -> Arc<dyn TopicImplementation> {
        Arc::new(CaptureTopic {
            published: self.published.clone(),
        })
    }
}

#[async_trait]
impl TopicImplementation for CaptureTopic {
    async fn publish_message(
        &self,
        _ordering_key: Option<String>,
        attrs: HashMap<String, String>,
        data: Vec<u8>,
    ) -> Result<String, Error> {
        self.published.lock().unwrap().push((attrs, data));
        Ok("captured-1".to_string())
    }

    fn subscribe(
        &self,
        _cfg: &PubsubSubscriptionConfig,
        _ack_deadline: Duration,
        _retry: RetryPolicy,
        _ctx: &SubscribeContext,
        _callback: Arc<DeliveryCallback>,
    ) {
    }
}

#[tokio::test]
async fn publish_marshals_attributes_and_body() {
    let capture = Arc::new(CaptureProvider::default());
    let published = capture.published.clone();
    let mut registry = ProviderRegistry::new();
    registry.register(capture);
    let manager = Arc::new(Manager::new(
        Tracer::noop(),
        Arc::new(EndpointMetrics::new()),
        false,
        registry,
        vec![PubsubProviderConfig {
            memory: Some(MemoryProviderConfig {}),
            push: None,
        }],
        topic_cfg(None),
    ));

    let topic = manager.topic::<EmailMsg>("emails").unwrap();
    let id = topic
        .publish(&EmailMsg {
            foo: "bar".into(),
            x: 1,
        })
        .await
        .unwrap();
    assert_eq!(id, "captured-1");

    let published = published.lock().unwrap();
    let (attrs, data) = &published[0];
    assert_eq!(data.as_slice(), br#"{"Foo":"bar"}"#);
    assert_eq!(attrs.get("x").map(String::as_str), Some("1"));
    // No traced request was active, so no correlation attribute.
    assert!(!attrs.contains_key(PARENT_TRACE_ID_ATTR));
}

#[tokio::test]
async fn subscriber_receives_the_identical_message() {
    let manager = memory_manager(None);
    let topic = manager.topic::<EmailMsg>("emails").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    topic
        .subscribe(
            "svc",
            "send",
            subscription_handler(move |_ctx, msg: EmailMsg| {
                let tx = tx.clone();
                async move {
                    tx.send(msg).expect("test channel");
                    Ok(())
                }
            }),
        )
        .unwrap();

    let sent = EmailMsg {
        foo: "bar".into(),
        x: 1,
    };
    topic.publish(&sent).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("message delivered");
    assert_eq!(received, sent);
}

#[tokio::test]
async fn failed_deliveries_are_retried_with_incrementing_attempts() {
    let manager = memory_manager(Some(fast_retry(10)));
    let topic = manager.topic::<EmailMsg>("emails").unwrap();

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let seen = attempts.clone();
    topic
        .subscribe(
            "svc",
            "send",
            subscription_handler(move |ctx, _msg: EmailMsg| {
                let seen = seen.clone();
                let tx = tx.clone();
                async move {
                    seen.lock().unwrap().push(ctx.attempt);
                    if ctx.attempt < 3 {
                        Err(Error::unavailable("transient failure"))
                    } else {
                        tx.send(()).expect("test channel");
                        Ok(())
                    }
                }
            }),
        )
        .unwrap();

    topic
        .publish(&EmailMsg {
            foo: "retry".into(),
            x: 0,
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("eventual success");
    assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn panicking_handlers_nack_and_do_not_crash() {
    let manager = memory_manager(Some(fast_retry(2)));
    let topic = manager.topic::<EmailMsg>("emails").unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    topic
        .subscribe(
            "svc",
            "send",
            subscription_handler(move |_ctx, _msg: EmailMsg| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    panic!("boom");
                    #[allow(unreachable_code)]
                    Ok(())
                }
            }),
        )
        .unwrap();

    topic
        .publish(&EmailMsg {
            foo: "panic".into(),
            x: 0,
        })
        .await
        .unwrap();

    // The panic nacks the delivery, so the retry policy redelivers:
    // initial attempt + 2 retries, then the message is dropped.
    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all attempts within deadline");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_drop_the_message() {
    let manager = memory_manager(Some(fast_retry(1)));
    let topic = manager.topic::<EmailMsg>("emails").unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    topic
        .subscribe(
            "svc",
            "send",
            subscription_handler(move |_ctx, _msg: EmailMsg| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(Error::unavailable("always failing"))
                }
            }),
        )
        .unwrap();

    topic
        .publish(&EmailMsg {
            foo: "doomed".into(),
            x: 0,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // Initial attempt plus exactly one retry.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn traced_publishers_stamp_the_parent_trace_attribute() {
    use runtime_core::lifecycle::{self, RequestDesc};
    use runtime_core::tracker;

    let capture = Arc::new(CaptureProvider::default());
    let published = capture.published.clone();
    let mut registry = ProviderRegistry::new();
    registry.register(capture);
    let (tracer, _completed) = Tracer::capturing();
    let manager = Arc::new(Manager::new(
        tracer.clone(),
        Arc::new(EndpointMetrics::new()),
        true,
        registry,
        vec![PubsubProviderConfig {
            memory: Some(MemoryProviderConfig {}),
            push: None,
        }],
        topic_cfg(None),
    ));
    let topic = manager.topic::<EmailMsg>("emails").unwrap();

    tracker::scope(async {
        let req = lifecycle::begin_request(
            &tracer,
            RequestDesc {
                service: "svc".into(),
                endpoint: "publish".into(),
                method: "POST".into(),
                path: "/publish".into(),
                traced: true,
                ..Default::default()
            },
        )
        .unwrap();

        topic
            .publish(&EmailMsg {
                foo: "traced".into(),
                x: 0,
            })
            .await
            .unwrap();

        let published = published.lock().unwrap();
        let (attrs, _) = &published[0];
        assert_eq!(
            attrs.get(PARENT_TRACE_ID_ATTR).map(String::as_str),
            Some(req.trace_id.to_base64().as_str())
        );
    })
    .await;
}
