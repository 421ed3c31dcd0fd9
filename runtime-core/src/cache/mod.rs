//! Typed cache keyspaces over Redis: string/int/float/struct values plus
//! lists and sets, with per-write expiry options and cache-call trace
//! events.

mod keyspace;
mod options;

pub use keyspace::{
    CacheKey, Keyspace, ListKeyspace, SetKeyspace, StructKeyspace, RESERVED_PREFIX,
};
pub use options::{ExpiryPolicy, WriteOptions};

use crate::config::{RedisDatabaseConfig, RedisServerConfig};
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Why a cache operation failed. A missing key (`Miss`) is ordinary
/// control flow and distinct from transport failures.
#[derive(Debug)]
pub enum CacheErrorKind {
    Miss,
    InvalidKey(String),
    Transport(redis::RedisError),
    Decode(String),
}

/// A cache failure, carrying the operation and the raw key it applied to.
#[derive(Debug)]
pub struct CacheError {
    pub op: &'static str,
    pub key: String,
    pub kind: CacheErrorKind,
}

impl CacheError {
    pub(crate) fn new(op: &'static str, key: impl Into<String>, kind: CacheErrorKind) -> Self {
        CacheError {
            op,
            key: key.into(),
            kind,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self.kind, CacheErrorKind::Miss)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CacheErrorKind::Miss => write!(f, "cache {} {:?}: key missing", self.op, self.key),
            CacheErrorKind::InvalidKey(reason) => {
                write!(f, "cache {} {:?}: invalid key: {reason}", self.op, self.key)
            }
            CacheErrorKind::Transport(err) => {
                write!(f, "cache {} {:?}: {err}", self.op, self.key)
            }
            CacheErrorKind::Decode(reason) => {
                write!(f, "cache {} {:?}: decode failed: {reason}", self.op, self.key)
            }
        }
    }
}

impl std::error::Error for CacheError {}

/// One configured Redis database, shared by its keyspaces. The
/// connection is established on first use.
pub struct Cluster {
    name: String,
    url: String,
    key_prefix: Option<String>,
    conn: OnceCell<ConnectionManager>,
}

impl Cluster {
    pub fn new(server: &RedisServerConfig, db: &RedisDatabaseConfig) -> Arc<Self> {
        let scheme = if server.enable_tls { "rediss" } else { "redis" };
        let auth = match (&server.user, &server.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            _ => String::new(),
        };
        let url = format!("{scheme}://{auth}{}/{}", server.host, db.database);
        Arc::new(Cluster {
            name: db.name.clone(),
            url,
            key_prefix: db.key_prefix.clone(),
            conn: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    pub(crate) async fn conn(&self, op: &'static str, key: &str) -> Result<ConnectionManager, CacheError> {
        let manager = self
            .conn
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.url.as_str())?;
                client.get_connection_manager().await
            })
            .await
            .map_err(|err: redis::RedisError| {
                CacheError::new(op, key, CacheErrorKind::Transport(err))
            })?;
        Ok(manager.clone())
    }

    pub fn string_keyspace<K: CacheKey>(self: &Arc<Self>, pattern: &str) -> Keyspace<K, String> {
        Keyspace::new(self.clone(), pattern)
    }

    pub fn int_keyspace<K: CacheKey>(self: &Arc<Self>, pattern: &str) -> Keyspace<K, i64> {
        Keyspace::new(self.clone(), pattern)
    }

    pub fn float_keyspace<K: CacheKey>(self: &Arc<Self>, pattern: &str) -> Keyspace<K, f64> {
        Keyspace::new(self.clone(), pattern)
    }

    pub fn struct_keyspace<K: CacheKey, T: Serialize + DeserializeOwned>(
        self: &Arc<Self>,
        pattern: &str,
    ) -> StructKeyspace<K, T> {
        StructKeyspace::new(self.clone(), pattern)
    }

    pub fn list_keyspace<K: CacheKey, V>(self: &Arc<Self>, pattern: &str) -> ListKeyspace<K, V>
    where
        V: redis::ToRedisArgs + redis::FromRedisValue + Send + Sync,
    {
        ListKeyspace::new(self.clone(), pattern)
    }

    pub fn set_keyspace<K: CacheKey, V>(self: &Arc<Self>, pattern: &str) -> SetKeyspace<K, V>
    where
        V: redis::ToRedisArgs + redis::FromRedisValue + Send + Sync,
    {
        SetKeyspace::new(self.clone(), pattern)
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}
