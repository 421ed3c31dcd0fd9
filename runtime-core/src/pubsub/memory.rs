//! The in-process provider, backing local development and tests: topics
//! are channels, subscriptions are worker tasks, and delivery/retry runs
//! entirely inside the process.

use super::{
    DeliveryCallback, MessageDelivery, Provider, RetryPolicy, SubscribeContext,
    TopicImplementation,
};
use crate::config::{PubsubProviderConfig, PubsubSubscriptionConfig, PubsubTopicConfig};
use crate::error::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

pub struct MemoryProvider;

impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn matches(&self, cfg: &PubsubProviderConfig) -> bool {
        cfg.memory.is_some()
    }

    fn new_topic(
        &self,
        _provider_cfg: &PubsubProviderConfig,
        topic_cfg: &PubsubTopicConfig,
    ) -> Arc<dyn TopicImplementation> {
        Arc::new(MemoryTopic {
            provider_name: topic_cfg.provider_name.clone(),
            subscribers: Mutex::new(Vec::new()),
        })
    }
}

#[derive(Debug, Clone)]
struct MemoryMessage {
    id: String,
    attrs: HashMap<String, String>,
    data: Vec<u8>,
    published: SystemTime,
}

struct MemoryTopic {
    provider_name: String,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MemoryMessage>>>,
}

#[async_trait]
impl TopicImplementation for MemoryTopic {
    async fn publish_message(
        &self,
        _ordering_key: Option<String>,
        attrs: HashMap<String, String>,
        data: Vec<u8>,
    ) -> Result<String, Error> {
        let msg = MemoryMessage {
            id: uuid::Uuid::new_v4().simple().to_string(),
            attrs,
            data,
            published: SystemTime::now(),
        };
        let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
        // Dead subscribers (shut down workers) are dropped as we go.
        subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
        Ok(msg.id)
    }

    fn subscribe(
        &self,
        cfg: &PubsubSubscriptionConfig,
        ack_deadline: Duration,
        retry: RetryPolicy,
        ctx: &SubscribeContext,
        callback: Arc<DeliveryCallback>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("subscribers poisoned").push(tx);

        let worker = Worker {
            topic: self.provider_name.clone(),
            subscription: cfg.provider_name.clone(),
            ack_deadline,
            retry,
            ctx: ctx.clone(),
            callback,
        };
        let _ = ctx.tasks.spawn(worker.run(rx));
    }
}

struct Worker {
    topic: String,
    subscription: String,
    ack_deadline: Duration,
    retry: RetryPolicy,
    ctx: SubscribeContext,
    callback: Arc<DeliveryCallback>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<MemoryMessage>) {
        loop {
            // Stop fetching on shutdown; the message being processed is
            // allowed to finish first.
            let msg = tokio::select! {
                _ = self.ctx.stop.cancelled() => break,
                next = rx.recv() => match next {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.process(msg).await;
        }
    }

    async fn process(&self, msg: MemoryMessage) {
        let mut attempt: u32 = 1;
        loop {
            let delivery = MessageDelivery {
                message_id: msg.id.clone(),
                published: msg.published,
                attempt,
                attrs: msg.attrs.clone(),
                data: msg.data.clone(),
            };

            let verdict = tokio::time::timeout(self.ack_deadline, self.callback.call(delivery)).await;
            let err = match verdict {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err,
                Err(_) => Error::unavailable(format!(
                    "delivery exceeded the {:?} ack deadline",
                    self.ack_deadline
                )),
            };

            match self.retry.backoff(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        topic = %self.topic,
                        subscription = %self.subscription,
                        message_id = %msg.id,
                        attempt,
                        error = %err,
                        "delivery failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.ctx.force.cancelled() => return,
                    }
                    attempt += 1;
                }
                None => {
                    tracing::error!(
                        topic = %self.topic,
                        subscription = %self.subscription,
                        message_id = %msg.id,
                        attempt,
                        error = %err,
                        "delivery failed permanently, dropping message"
                    );
                    return;
                }
            }
        }
    }
}
