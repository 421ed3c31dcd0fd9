//! Push-endpoint delivery: providers that push messages over HTTP rather
//! than being pulled from. The internal router dispatches
//! `POST /__encore/pubsub/push/:subscription_id` into this registry.

use super::{
    DeliveryCallback, MessageDelivery, Provider, RetryPolicy, SubscribeContext,
    TopicImplementation,
};
use crate::config::{PubsubProviderConfig, PubsubSubscriptionConfig, PubsubTopicConfig};
use crate::error::{Code, Error};
use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

/// The JSON body of a push delivery.
#[derive(Debug, Deserialize)]
pub struct PushPayload {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Base64-encoded message body.
    #[serde(default)]
    pub data: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "publishTime", default)]
    pub publish_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "deliveryAttempt", default)]
    pub delivery_attempt: Option<u32>,
}

/// Claims carried by a provider push JWT.
#[derive(Debug, Deserialize)]
pub struct PushClaims {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
}

/// How non-platform push requests authenticate: a bearer JWT whose email
/// claim must match the configured service account.
#[derive(Clone)]
pub struct PushAuth {
    pub service_account_email: String,
    pub decoding_key: Arc<DecodingKey>,
    pub validation: Validation,
}

impl std::fmt::Debug for PushAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushAuth")
            .field("service_account_email", &self.service_account_email)
            .finish_non_exhaustive()
    }
}

impl PushAuth {
    pub fn verify(&self, bearer: &str) -> Result<PushClaims, Error> {
        let data = decode::<PushClaims>(bearer, &self.decoding_key, &self.validation)
            .map_err(|err| Error::new(Code::Unauthenticated, format!("invalid push token: {err}")))?;
        if data.claims.email != self.service_account_email {
            return Err(Error::new(
                Code::PermissionDenied,
                "push token is not from the configured service account",
            ));
        }
        Ok(data.claims)
    }
}

struct PushHandler {
    auth: Option<PushAuth>,
    callback: Arc<DeliveryCallback>,
}

/// Push handlers keyed by subscription id. Populated while subscriptions
/// are registered at startup and read-only afterwards.
#[derive(Default)]
pub struct PushRegistry {
    handlers: RwLock<HashMap<String, Arc<PushHandler>>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        subscription_id: impl Into<String>,
        auth: Option<PushAuth>,
        callback: Arc<DeliveryCallback>,
    ) {
        self.handlers
            .write()
            .expect("push registry poisoned")
            .insert(subscription_id.into(), Arc::new(PushHandler { auth, callback }));
    }

    pub fn is_registered(&self, subscription_id: &str) -> bool {
        self.handlers
            .read()
            .expect("push registry poisoned")
            .contains_key(subscription_id)
    }

    /// Dispatches one push delivery. `from_platform` marks requests that
    /// arrived with a valid platform signature; anything else must carry
    /// a verifiable provider bearer token.
    pub async fn handle(
        &self,
        subscription_id: &str,
        from_platform: bool,
        bearer: Option<&str>,
        body: &[u8],
    ) -> Result<(), Error> {
        let handler = self
            .handlers
            .read()
            .expect("push registry poisoned")
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    Code::NotFound,
                    format!("no push subscription with id {subscription_id}"),
                )
            })?;

        if !from_platform {
            let auth = handler.auth.as_ref().ok_or_else(|| {
                Error::new(Code::PermissionDenied, "subscription does not accept provider pushes")
            })?;
            let bearer = bearer.ok_or_else(|| {
                Error::new(Code::Unauthenticated, "missing push bearer token")
            })?;
            auth.verify(bearer)?;
        }

        let payload: PushPayload = serde_json::from_slice(body)
            .map_err(|err| Error::new(Code::InvalidArgument, format!("invalid push payload: {err}")))?;

        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let data = STANDARD
            .decode(payload.message.data.as_bytes())
            .map_err(|err| Error::new(Code::InvalidArgument, format!("invalid push data: {err}")))?;

        let delivery = MessageDelivery {
            message_id: payload.message.message_id,
            published: payload
                .message
                .publish_time
                .map(SystemTime::from)
                .unwrap_or_else(SystemTime::now),
            attempt: payload.message.delivery_attempt.unwrap_or(1),
            attrs: payload.message.attributes,
            data,
        };
        handler.callback.call(delivery).await
    }
}

/// The provider for push-only topics: deliveries arrive exclusively via
/// the push registry; there is nothing to pull and nothing to publish
/// from this side.
pub struct PushProvider;

impl Provider for PushProvider {
    fn name(&self) -> &'static str {
        "push"
    }

    fn matches(&self, cfg: &PubsubProviderConfig) -> bool {
        cfg.push.is_some()
    }

    fn new_topic(
        &self,
        provider_cfg: &PubsubProviderConfig,
        topic_cfg: &PubsubTopicConfig,
    ) -> Arc<dyn TopicImplementation> {
        let push_cfg = provider_cfg.push.clone().unwrap_or_default();
        Arc::new(PushTopic {
            provider_name: topic_cfg.provider_name.clone(),
            service_account_email: push_cfg.service_account_email,
        })
    }
}

struct PushTopic {
    provider_name: String,
    service_account_email: String,
}

#[async_trait]
impl TopicImplementation for PushTopic {
    async fn publish_message(
        &self,
        _ordering_key: Option<String>,
        _attrs: HashMap<String, String>,
        _data: Vec<u8>,
    ) -> Result<String, Error> {
        Err(Error::new(
            Code::Unimplemented,
            format!("topic {} is push-only and cannot be published to from here", self.provider_name),
        ))
    }

    fn subscribe(
        &self,
        cfg: &PubsubSubscriptionConfig,
        _ack_deadline: Duration,
        _retry: RetryPolicy,
        ctx: &SubscribeContext,
        callback: Arc<DeliveryCallback>,
    ) {
        // Provider-signed pushes are only accepted when a verification key
        // is available; platform-signed pushes always are.
        let auth = push_decoding_key(&self.service_account_email).map(|(key, validation)| PushAuth {
            service_account_email: self.service_account_email.clone(),
            decoding_key: Arc::new(key),
            validation,
        });
        ctx.push.register(cfg.id.clone(), auth, callback);
    }
}

/// Resolves the verification key for provider-signed push JWTs from the
/// environment (`ENCORE_PUSH_JWT_KEY`, HS256). Cloud deployments that
/// rely on platform-signed pushes run without one.
fn push_decoding_key(_service_account: &str) -> Option<(DecodingKey, Validation)> {
    let secret = std::env::var("ENCORE_PUSH_JWT_KEY").ok()?;
    let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    Some((DecodingKey::from_secret(secret.as_bytes()), validation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_callback() -> (Arc<DeliveryCallback>, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let inner = count.clone();
        let cb = DeliveryCallback::new(move |delivery: MessageDelivery| {
            let inner = inner.clone();
            async move {
                assert_eq!(delivery.message_id, "m-1");
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });
        (cb, count)
    }

    fn payload() -> Vec<u8> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        serde_json::json!({
            "message": {
                "attributes": {"x": "1"},
                "data": STANDARD.encode(b"{\"foo\":\"bar\"}"),
                "messageId": "m-1",
                "deliveryAttempt": 2
            },
            "subscription": "sub-1"
        })
        .to_string()
        .into_bytes()
    }

    fn hs256_auth(email: &str) -> (PushAuth, String) {
        let secret = b"push-secret";
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let auth = PushAuth {
            service_account_email: email.to_string(),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            validation,
        };
        let token = encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &serde_json::json!({"email": email, "email_verified": true}),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();
        (auth, token)
    }

    #[tokio::test]
    async fn platform_pushes_bypass_jwt() {
        let registry = PushRegistry::new();
        let (cb, count) = counting_callback();
        registry.register("sub-1", None, cb);

        registry
            .handle("sub-1", true, None, &payload())
            .await
            .expect("platform push accepted");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_pushes_require_matching_email() {
        let registry = PushRegistry::new();
        let (cb, count) = counting_callback();
        let (auth, token) = hs256_auth("pusher@example.iam.gserviceaccount.com");
        registry.register("sub-1", Some(auth), cb);

        // No bearer token: rejected.
        let err = registry.handle("sub-1", false, None, &payload()).await.unwrap_err();
        assert_eq!(err.code, Code::Unauthenticated);

        // Valid token: accepted.
        registry
            .handle("sub-1", false, Some(&token), &payload())
            .await
            .expect("valid provider push");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Token signed for a different account: rejected.
        let (_, other_token) = hs256_auth("other@example.com");
        let err = registry
            .handle("sub-1", false, Some(&other_token), &payload())
            .await
            .unwrap_err();
        // The signature check fails first: different key material.
        assert_eq!(err.code, Code::Unauthenticated);
    }

    #[tokio::test]
    async fn mismatched_email_with_same_key_is_denied() {
        let registry = PushRegistry::new();
        let (cb, _count) = counting_callback();
        let (mut auth, token) = hs256_auth("pusher@example.com");
        auth.service_account_email = "expected@example.com".into();
        registry.register("sub-1", Some(auth), cb);

        let err = registry
            .handle("sub-1", false, Some(&token), &payload())
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let registry = PushRegistry::new();
        let err = registry.handle("nope", true, None, &payload()).await.unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }
}
