use super::options::{expiry_args, ExpiryPolicy, WriteOptions};
use super::{CacheError, CacheErrorKind, Cluster};
use crate::stack::Stack;
use crate::trace;
use redis::{FromRedisValue, ToRedisArgs};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Keys with this prefix are reserved for the runtime itself; mapping a
/// user key onto it is refused.
pub const RESERVED_PREFIX: &str = "__encore";

/// A typed cache key: a pure mapping onto the parameter segments of the
/// keyspace pattern.
pub trait CacheKey: Send + Sync {
    fn key_parts(&self) -> Vec<String>;
}

impl CacheKey for String {
    fn key_parts(&self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl CacheKey for &str {
    fn key_parts(&self) -> Vec<String> {
        vec![(*self).to_string()]
    }
}

impl CacheKey for i64 {
    fn key_parts(&self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl CacheKey for u64 {
    fn key_parts(&self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl CacheKey for uuid::Uuid {
    fn key_parts(&self) -> Vec<String> {
        vec![self.simple().to_string()]
    }
}

impl<A: CacheKey, B: CacheKey> CacheKey for (A, B) {
    fn key_parts(&self) -> Vec<String> {
        let mut parts = self.0.key_parts();
        parts.extend(self.1.key_parts());
        parts
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param,
}

/// A parsed key pattern like `posts/:user/:id`.
#[derive(Debug, Clone)]
pub(crate) struct KeyPattern {
    raw: String,
    segments: Vec<Segment>,
    params: usize,
}

impl KeyPattern {
    fn parse(pattern: &str) -> Self {
        let segments: Vec<Segment> = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.starts_with(':') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        let params = segments.iter().filter(|s| matches!(s, Segment::Param)).count();
        KeyPattern {
            raw: pattern.to_string(),
            segments,
            params,
        }
    }

    fn render(&self, op: &'static str, parts: &[String]) -> Result<String, CacheError> {
        if parts.len() != self.params {
            return Err(CacheError::new(
                op,
                self.raw.clone(),
                CacheErrorKind::InvalidKey(format!(
                    "pattern has {} parameters but the key provided {}",
                    self.params,
                    parts.len()
                )),
            ));
        }
        let mut out = Vec::with_capacity(self.segments.len());
        let mut next = parts.iter();
        for seg in &self.segments {
            match seg {
                Segment::Literal(lit) => out.push(lit.as_str()),
                Segment::Param => out.push(next.next().expect("counted above").as_str()),
            }
        }
        let rendered = out.join("/");
        if rendered.starts_with(RESERVED_PREFIX) {
            return Err(CacheError::new(
                op,
                rendered.clone(),
                CacheErrorKind::InvalidKey(format!("the {RESERVED_PREFIX} prefix is reserved")),
            ));
        }
        Ok(rendered)
    }
}

fn trace_start(op: &'static str, write: bool, key: &str) {
    trace::with_current(|trace, span, taskctr| {
        trace.cache_call_start(span, taskctr, op, write, &[key.to_string()], Some(&Stack::capture()));
    });
}

fn trace_end(result: &Result<impl Sized, CacheError>) {
    trace::with_current(|trace, span, _| {
        let (byte, err) = match result {
            Ok(_) => (1, None),
            Err(err) if err.is_miss() => (2, None),
            Err(err) => (4, Some(crate::error::Error::unavailable(err.to_string()))),
        };
        trace.cache_call_end(span, byte, err.as_ref());
    });
}

/// Shared machinery for all keyspace flavors.
struct Core {
    cluster: Arc<Cluster>,
    pattern: KeyPattern,
    default_expiry: Option<ExpiryPolicy>,
}

impl Core {
    fn new(cluster: Arc<Cluster>, pattern: &str) -> Self {
        Core {
            cluster,
            pattern: KeyPattern::parse(pattern),
            default_expiry: None,
        }
    }

    fn map_key(&self, op: &'static str, key: &dyn CacheKey) -> Result<String, CacheError> {
        let rendered = self.pattern.render(op, &key.key_parts())?;
        Ok(match self.cluster.key_prefix() {
            Some(prefix) => format!("{prefix}{rendered}"),
            None => rendered,
        })
    }

    async fn run<T: FromRedisValue>(
        &self,
        op: &'static str,
        write: bool,
        key: &str,
        cmd: redis::Cmd,
    ) -> Result<T, CacheError> {
        trace_start(op, write, key);
        let result = async {
            let mut conn = self.cluster.conn(op, key).await?;
            cmd.query_async::<T>(&mut conn)
                .await
                .map_err(|err| CacheError::new(op, key, CacheErrorKind::Transport(err)))
        }
        .await;
        trace_end(&result);
        result
    }

    fn expiry(&self, opts: Option<&WriteOptions>) -> Vec<String> {
        let policy = opts.and_then(|o| o.expiry.as_ref()).or(self.default_expiry.as_ref());
        expiry_args(policy, chrono::Utc::now())
    }
}

/// A keyspace of scalar values (strings, ints, floats).
pub struct Keyspace<K: CacheKey, V> {
    core: Core,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K: CacheKey, V> Keyspace<K, V>
where
    V: ToRedisArgs + FromRedisValue + Send + Sync,
{
    pub(super) fn new(cluster: Arc<Cluster>, pattern: &str) -> Self {
        Keyspace {
            core: Core::new(cluster, pattern),
            _marker: PhantomData,
        }
    }

    pub fn with_default_expiry(mut self, policy: ExpiryPolicy) -> Self {
        self.core.default_expiry = Some(policy);
        self
    }

    pub async fn get(&self, key: K) -> Result<V, CacheError> {
        let raw = self.core.map_key("get", &key)?;
        let mut cmd = redis::cmd("GET");
        cmd.arg(&raw);
        let value: Option<V> = self.core.run("get", false, &raw, cmd).await?;
        value.ok_or_else(|| CacheError::new("get", raw, CacheErrorKind::Miss))
    }

    pub async fn set(&self, key: K, value: V) -> Result<(), CacheError> {
        self.set_with(key, value, WriteOptions::default()).await
    }

    pub async fn set_with(&self, key: K, value: V, opts: WriteOptions) -> Result<(), CacheError> {
        let raw = self.core.map_key("set", &key)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&raw).arg(&value);
        for arg in self.core.expiry(Some(&opts)) {
            cmd.arg(arg);
        }
        self.core.run::<()>("set", true, &raw, cmd).await
    }

    /// `SET NX`: writes only when the key is absent; returns whether it
    /// wrote.
    pub async fn set_if_not_exists(&self, key: K, value: V) -> Result<bool, CacheError> {
        let raw = self.core.map_key("set_if_not_exists", &key)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&raw).arg(&value).arg("NX");
        for arg in self.core.expiry(None) {
            cmd.arg(arg);
        }
        let reply: Option<String> = self.core.run("set_if_not_exists", true, &raw, cmd).await?;
        Ok(reply.is_some())
    }

    /// `SET XX`: replaces an existing value; a missing key is a miss.
    pub async fn replace(&self, key: K, value: V) -> Result<(), CacheError> {
        let raw = self.core.map_key("replace", &key)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&raw).arg(&value).arg("XX");
        for arg in self.core.expiry(None) {
            cmd.arg(arg);
        }
        let reply: Option<String> = self.core.run("replace", true, &raw, cmd).await?;
        match reply {
            Some(_) => Ok(()),
            None => Err(CacheError::new("replace", raw, CacheErrorKind::Miss)),
        }
    }

    /// `SET GET`: writes and returns the previous value, if any.
    pub async fn get_and_set(&self, key: K, value: V) -> Result<Option<V>, CacheError> {
        let raw = self.core.map_key("get_and_set", &key)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&raw).arg(&value).arg("GET");
        for arg in self.core.expiry(None) {
            cmd.arg(arg);
        }
        self.core.run("get_and_set", true, &raw, cmd).await
    }

    pub async fn delete(&self, key: K) -> Result<bool, CacheError> {
        let raw = self.core.map_key("delete", &key)?;
        let mut cmd = redis::cmd("DEL");
        cmd.arg(&raw);
        let removed: u64 = self.core.run("delete", true, &raw, cmd).await?;
        Ok(removed > 0)
    }
}

impl<K: CacheKey> Keyspace<K, i64> {
    pub async fn increment(&self, key: K, delta: i64) -> Result<i64, CacheError> {
        let raw = self.core.map_key("increment", &key)?;
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(&raw).arg(delta);
        self.core.run("increment", true, &raw, cmd).await
    }

    pub async fn decrement(&self, key: K, delta: i64) -> Result<i64, CacheError> {
        let raw = self.core.map_key("decrement", &key)?;
        let mut cmd = redis::cmd("DECRBY");
        cmd.arg(&raw).arg(delta);
        self.core.run("decrement", true, &raw, cmd).await
    }
}

impl<K: CacheKey> Keyspace<K, f64> {
    pub async fn increment_by(&self, key: K, delta: f64) -> Result<f64, CacheError> {
        let raw = self.core.map_key("increment_by", &key)?;
        let mut cmd = redis::cmd("INCRBYFLOAT");
        cmd.arg(&raw).arg(delta);
        self.core.run("increment_by", true, &raw, cmd).await
    }
}

/// JSON-encoded struct values on top of the string keyspace.
pub struct StructKeyspace<K: CacheKey, T> {
    inner: Keyspace<K, String>,
    _marker: PhantomData<fn() -> T>,
}

impl<K: CacheKey, T: Serialize + DeserializeOwned> StructKeyspace<K, T> {
    pub(super) fn new(cluster: Arc<Cluster>, pattern: &str) -> Self {
        StructKeyspace {
            inner: Keyspace::new(cluster, pattern),
            _marker: PhantomData,
        }
    }

    pub fn with_default_expiry(mut self, policy: ExpiryPolicy) -> Self {
        self.inner = self.inner.with_default_expiry(policy);
        self
    }

    fn encode(value: &T) -> Result<String, CacheError> {
        serde_json::to_string(value)
            .map_err(|err| CacheError::new("set", "", CacheErrorKind::Decode(err.to_string())))
    }

    fn decode(raw_key: &str, encoded: &str) -> Result<T, CacheError> {
        serde_json::from_str(encoded)
            .map_err(|err| CacheError::new("get", raw_key, CacheErrorKind::Decode(err.to_string())))
    }

    pub async fn get(&self, key: K) -> Result<T, CacheError> {
        let raw = self.inner.core.map_key("get", &key)?;
        let encoded = self.inner.get(key).await?;
        Self::decode(&raw, &encoded)
    }

    pub async fn set(&self, key: K, value: &T) -> Result<(), CacheError> {
        self.inner.set(key, Self::encode(value)?).await
    }

    pub async fn set_with(&self, key: K, value: &T, opts: WriteOptions) -> Result<(), CacheError> {
        self.inner.set_with(key, Self::encode(value)?, opts).await
    }

    pub async fn delete(&self, key: K) -> Result<bool, CacheError> {
        self.inner.delete(key).await
    }
}

/// Lists of basic values.
pub struct ListKeyspace<K: CacheKey, V> {
    core: Core,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K: CacheKey, V> ListKeyspace<K, V>
where
    V: ToRedisArgs + FromRedisValue + Send + Sync,
{
    pub(super) fn new(cluster: Arc<Cluster>, pattern: &str) -> Self {
        ListKeyspace {
            core: Core::new(cluster, pattern),
            _marker: PhantomData,
        }
    }

    pub async fn push_left(&self, key: K, value: V) -> Result<u64, CacheError> {
        let raw = self.core.map_key("push_left", &key)?;
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(&raw).arg(&value);
        self.core.run("push_left", true, &raw, cmd).await
    }

    pub async fn push_right(&self, key: K, value: V) -> Result<u64, CacheError> {
        let raw = self.core.map_key("push_right", &key)?;
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(&raw).arg(&value);
        self.core.run("push_right", true, &raw, cmd).await
    }

    pub async fn pop_left(&self, key: K) -> Result<Option<V>, CacheError> {
        let raw = self.core.map_key("pop_left", &key)?;
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(&raw);
        self.core.run("pop_left", true, &raw, cmd).await
    }

    pub async fn pop_right(&self, key: K) -> Result<Option<V>, CacheError> {
        let raw = self.core.map_key("pop_right", &key)?;
        let mut cmd = redis::cmd("RPOP");
        cmd.arg(&raw);
        self.core.run("pop_right", true, &raw, cmd).await
    }

    pub async fn items(&self, key: K) -> Result<Vec<V>, CacheError> {
        let raw = self.core.map_key("items", &key)?;
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(&raw).arg(0).arg(-1);
        self.core.run("items", false, &raw, cmd).await
    }

    pub async fn len(&self, key: K) -> Result<u64, CacheError> {
        let raw = self.core.map_key("len", &key)?;
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(&raw);
        self.core.run("len", false, &raw, cmd).await
    }
}

/// Unordered sets of basic values.
pub struct SetKeyspace<K: CacheKey, V> {
    core: Core,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K: CacheKey, V> SetKeyspace<K, V>
where
    V: ToRedisArgs + FromRedisValue + Send + Sync,
{
    pub(super) fn new(cluster: Arc<Cluster>, pattern: &str) -> Self {
        SetKeyspace {
            core: Core::new(cluster, pattern),
            _marker: PhantomData,
        }
    }

    /// Returns whether the value was newly added.
    pub async fn add(&self, key: K, value: V) -> Result<bool, CacheError> {
        let raw = self.core.map_key("add", &key)?;
        let mut cmd = redis::cmd("SADD");
        cmd.arg(&raw).arg(&value);
        let added: u64 = self.core.run("add", true, &raw, cmd).await?;
        Ok(added > 0)
    }

    pub async fn remove(&self, key: K, value: V) -> Result<bool, CacheError> {
        let raw = self.core.map_key("remove", &key)?;
        let mut cmd = redis::cmd("SREM");
        cmd.arg(&raw).arg(&value);
        let removed: u64 = self.core.run("remove", true, &raw, cmd).await?;
        Ok(removed > 0)
    }

    pub async fn contains(&self, key: K, value: V) -> Result<bool, CacheError> {
        let raw = self.core.map_key("contains", &key)?;
        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(&raw).arg(&value);
        self.core.run("contains", false, &raw, cmd).await
    }

    pub async fn items(&self, key: K) -> Result<Vec<V>, CacheError> {
        let raw = self.core.map_key("items", &key)?;
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(&raw);
        self.core.run("items", false, &raw, cmd).await
    }

    pub async fn len(&self, key: K) -> Result<u64, CacheError> {
        let raw = self.core.map_key("len", &key)?;
        let mut cmd = redis::cmd("SCARD");
        cmd.arg(&raw);
        self.core.run("len", false, &raw, cmd).await
    }
}
