//! SQL access with query/transaction trace events and framework error
//! mapping, over a lazily created Postgres pool.

use crate::config::{SqlDatabaseConfig, SqlServerConfig};
use crate::error::{Code, Error};
use crate::stack::Stack;
use crate::trace;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static QUERY_CTR: AtomicU64 = AtomicU64::new(0);
static TX_CTR: AtomicU64 = AtomicU64::new(0);

fn next_query_id() -> u64 {
    QUERY_CTR.fetch_add(1, Ordering::Relaxed) + 1
}

fn next_tx_id() -> u64 {
    TX_CTR.fetch_add(1, Ordering::Relaxed) + 1
}

/// A bind parameter. The driver surface is dynamic, so parameters travel
/// as a small value enum rather than a generic bind list.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

fn bind<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    params: &'q [SqlValue],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Str(v) => query.bind(v.as_str()),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
            SqlValue::Json(v) => query.bind(v),
        };
    }
    query
}

/// Maps driver errors onto framework error codes: no rows is `NotFound`,
/// a closed pool or crashed worker is `Internal`, and everything else is
/// `Unavailable`.
fn map_sqlx_err(err: sqlx::Error) -> Error {
    let code = match &err {
        sqlx::Error::RowNotFound => Code::NotFound,
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => Code::Internal,
        _ => Code::Unavailable,
    };
    Error::new(code, err.to_string())
}

fn query_start(qid: u64, txid: u64, sql: &str) {
    trace::with_current(|trace, span, taskctr| {
        trace.db_query_start(span, taskctr, qid, txid, sql, Some(&Stack::capture()));
    });
}

fn query_end(qid: u64, err: Option<&Error>) {
    trace::with_current(|trace, span, _| {
        trace.db_query_end(span, qid, err);
    });
}

/// A named application database backed by a lazily created pool.
pub struct Database {
    name: String,
    server: SqlServerConfig,
    cfg: SqlDatabaseConfig,
    pool: OnceLock<PgPool>,
}

impl Database {
    pub fn new(server: SqlServerConfig, cfg: SqlDatabaseConfig) -> Self {
        Database {
            name: cfg.name.clone(),
            server,
            cfg,
            pool: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying pool, created on first use. Connections are
    /// established lazily by the pool itself.
    pub fn pool(&self) -> &PgPool {
        self.pool.get_or_init(|| {
            let (host, port) = match self.server.host.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().unwrap_or(5432)),
                None => (self.server.host.clone(), 5432),
            };
            let options = PgConnectOptions::new()
                .host(&host)
                .port(port)
                .username(&self.cfg.user)
                .password(&self.cfg.password)
                .database(&self.cfg.database_name);
            PgPoolOptions::new()
                .min_connections(self.cfg.min_connections)
                .max_connections(self.cfg.max_connections.max(1))
                .connect_lazy_with(options)
        })
    }

    /// Runs a statement and returns the number of rows affected.
    pub async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<u64, Error> {
        let qid = next_query_id();
        query_start(qid, 0, sql);
        let result = bind(sqlx::query(sql), params)
            .execute(self.pool())
            .await
            .map(|done| done.rows_affected())
            .map_err(map_sqlx_err);
        query_end(qid, result.as_ref().err());
        result
    }

    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<PgRow>, Error> {
        let qid = next_query_id();
        query_start(qid, 0, sql);
        let result = bind(sqlx::query(sql), params)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err);
        query_end(qid, result.as_ref().err());
        result
    }

    /// Runs a query expected to return exactly one row; zero rows is
    /// `NotFound`.
    pub async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<PgRow, Error> {
        let qid = next_query_id();
        query_start(qid, 0, sql);
        let result = bind(sqlx::query(sql), params)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_err);
        query_end(qid, result.as_ref().err());
        result
    }

    pub async fn begin(&self) -> Result<Transaction, Error> {
        let txid = next_tx_id();
        let result = self.pool().begin().await.map_err(map_sqlx_err);
        trace::with_current(|trace, span, taskctr| {
            trace.db_tx_start(span, taskctr, txid, Some(&Stack::capture()));
            if let Err(err) = &result {
                trace.db_tx_end(span, taskctr, txid, false, Some(err), None);
            }
        });
        Ok(Transaction {
            inner: Some(result?),
            txid,
        })
    }

    /// Closes the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }
}

/// An open transaction. Dropping it without an explicit `commit` or
/// `rollback` rolls back at the driver level without a trace event.
pub struct Transaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
    txid: u64,
}

impl Transaction {
    fn tx(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, Error> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::internal("transaction already completed"))
    }

    pub fn id(&self) -> u64 {
        self.txid
    }

    pub async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Error> {
        let qid = next_query_id();
        query_start(qid, self.txid, sql);
        let result = match self.tx() {
            Ok(tx) => bind(sqlx::query(sql), params)
                .execute(&mut **tx)
                .await
                .map(|done| done.rows_affected())
                .map_err(map_sqlx_err),
            Err(err) => Err(err),
        };
        query_end(qid, result.as_ref().err());
        result
    }

    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<PgRow>, Error> {
        let qid = next_query_id();
        query_start(qid, self.txid, sql);
        let result = match self.tx() {
            Ok(tx) => bind(sqlx::query(sql), params)
                .fetch_all(&mut **tx)
                .await
                .map_err(map_sqlx_err),
            Err(err) => Err(err),
        };
        query_end(qid, result.as_ref().err());
        result
    }

    pub async fn query_row(&mut self, sql: &str, params: &[SqlValue]) -> Result<PgRow, Error> {
        let qid = next_query_id();
        query_start(qid, self.txid, sql);
        let result = match self.tx() {
            Ok(tx) => bind(sqlx::query(sql), params)
                .fetch_one(&mut **tx)
                .await
                .map_err(map_sqlx_err),
            Err(err) => Err(err),
        };
        query_end(qid, result.as_ref().err());
        result
    }

    pub async fn commit(mut self) -> Result<(), Error> {
        let tx = self.inner.take().ok_or_else(|| Error::internal("transaction already completed"))?;
        let result = tx.commit().await.map_err(map_sqlx_err);
        let txid = self.txid;
        trace::with_current(|trace, span, taskctr| {
            trace.db_tx_end(
                span,
                taskctr,
                txid,
                true,
                result.as_ref().err(),
                Some(&Stack::capture()),
            );
        });
        result
    }

    pub async fn rollback(mut self) -> Result<(), Error> {
        let tx = self.inner.take().ok_or_else(|| Error::internal("transaction already completed"))?;
        let result = tx.rollback().await.map_err(map_sqlx_err);
        let txid = self.txid;
        trace::with_current(|trace, span, taskctr| {
            trace.db_tx_end(
                span,
                taskctr,
                txid,
                false,
                result.as_ref().err(),
                Some(&Stack::capture()),
            );
        });
        result
    }
}
