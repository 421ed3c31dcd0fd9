//! Assembly and bootstrap: decode configuration, wire the components
//! together, register application endpoints and subscriptions, serve, and
//! coordinate shutdown.

use crate::api::{AuthHandlerDesc, Cors, Endpoint, InternalRoutes, ListenMode, Server};
use crate::cache::Cluster;
use crate::config::{self, ConfigError};
use crate::error::Error;
use crate::logger::TraceLogLayer;
use crate::metrics::EndpointMetrics;
use crate::platform::RequestValidator;
use crate::pubsub::{self, MemoryProvider, PushProvider};
use crate::secrets::{SecretError, Secrets};
use crate::shutdown::Shutdown;
use crate::sqldb::Database;
use crate::trace::{streaming_tracer, Reporter, ReporterConfig, Tracer};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Secrets(#[from] SecretError),
    #[error("auth key {kid} is not valid base64")]
    AuthKey { kid: u32 },
    #[error("invalid trace endpoint: {0}")]
    TraceEndpoint(String),
}

/// One service instance's runtime.
pub struct Runtime {
    cfg: config::Runtime,
    secrets: Secrets,
    tracer: Tracer,
    reporter: Mutex<Option<Reporter>>,
    validator: Arc<RequestValidator>,
    metrics: Arc<EndpointMetrics>,
    pubsub: Arc<pubsub::Manager>,
    databases: HashMap<String, Arc<Database>>,
    caches: HashMap<String, Arc<Cluster>>,
    shutdown: Arc<Shutdown>,
    server: Mutex<Option<Server>>,
}

impl Runtime {
    pub fn from_env() -> Result<Self, BootstrapError> {
        let cfg = config::Runtime::from_env()?;
        let secrets = Secrets::from_env()?;
        Self::new(cfg, secrets)
    }

    pub fn new(cfg: config::Runtime, secrets: Secrets) -> Result<Self, BootstrapError> {
        let mut keys = Vec::with_capacity(cfg.auth_keys.len());
        for key in &cfg.auth_keys {
            keys.push(key.decode().map_err(|_| BootstrapError::AuthKey { kid: key.kid })?);
        }
        let validator = Arc::new(RequestValidator::new(keys));
        let metrics = Arc::new(EndpointMetrics::new());

        let (tracer, reporter) = match cfg.trace_endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => {
                let url = endpoint
                    .parse::<reqwest::Url>()
                    .map_err(|err| BootstrapError::TraceEndpoint(err.to_string()))?;
                let (tracer, reporter) = streaming_tracer(
                    reqwest::Client::new(),
                    ReporterConfig {
                        app_id: cfg.app_id.clone(),
                        env_id: cfg.env_id.clone(),
                        deploy_id: cfg.deploy_id.clone(),
                        app_commit: cfg.app_commit.clone(),
                        trace_endpoint: url,
                        validator: validator.clone(),
                    },
                );
                (tracer, Some(reporter))
            }
            None => (Tracer::noop(), None),
        };
        let tracing_enabled = reporter.is_some();

        let mut registry = pubsub::ProviderRegistry::new();
        registry.register(Arc::new(MemoryProvider));
        registry.register(Arc::new(PushProvider));
        let pubsub = Arc::new(pubsub::Manager::new(
            tracer.clone(),
            metrics.clone(),
            tracing_enabled,
            registry,
            cfg.pubsub_providers.clone(),
            cfg.pubsub_topics.clone(),
        ));

        let mut databases = HashMap::new();
        for db in &cfg.sql_databases {
            if let Some(server) = cfg.sql_servers.get(db.server_id) {
                databases.insert(
                    db.name.clone(),
                    Arc::new(Database::new(server.clone(), db.clone())),
                );
            } else {
                tracing::warn!(db = %db.name, server_id = db.server_id, "database references unknown server");
            }
        }

        let mut caches = HashMap::new();
        for db in &cfg.redis_databases {
            if let Some(server) = cfg.redis_servers.get(db.server_id) {
                caches.insert(db.name.clone(), Cluster::new(server, db));
            } else {
                tracing::warn!(cache = %db.name, server_id = db.server_id, "cache references unknown server");
            }
        }

        let server = Server::new(
            Cors::from_config(cfg.cors.as_ref()),
            validator.clone(),
            InternalRoutes::new(pubsub.push_registry(), metrics.clone()),
            tracer.clone(),
            metrics.clone(),
            tracing_enabled,
        );
        let shutdown = Arc::new(Shutdown::new(cfg.shutdown_timeout()));

        Ok(Runtime {
            cfg,
            secrets,
            tracer,
            reporter: Mutex::new(reporter),
            validator,
            metrics,
            pubsub,
            databases,
            caches,
            shutdown,
            server: Mutex::new(Some(server)),
        })
    }

    pub fn config(&self) -> &config::Runtime {
        &self.cfg
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn metrics(&self) -> &Arc<EndpointMetrics> {
        &self.metrics
    }

    pub fn validator(&self) -> &Arc<RequestValidator> {
        &self.validator
    }

    pub fn pubsub(&self) -> &Arc<pubsub::Manager> {
        &self.pubsub
    }

    pub fn shutdown(&self) -> &Arc<Shutdown> {
        &self.shutdown
    }

    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get_str(name)
    }

    pub fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.get(name).cloned()
    }

    pub fn cache_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.caches.get(name).cloned()
    }

    /// Registers an endpoint. Must happen before [`run`](Self::run).
    pub fn register_endpoint(&self, endpoint: Arc<Endpoint>) -> Result<(), Error> {
        let mut server = self.server.lock().expect("server poisoned");
        let server = server
            .as_mut()
            .ok_or_else(|| Error::internal("endpoints must be registered before the server starts"))?;
        server
            .register(endpoint)
            .map_err(|err| Error::internal(err.to_string()))
    }

    /// Installs the application's auth handler. Must happen before
    /// [`run`](Self::run).
    pub fn set_auth_handler(&self, desc: AuthHandlerDesc) -> Result<(), Error> {
        let mut server = self.server.lock().expect("server poisoned");
        let server = server
            .as_mut()
            .ok_or_else(|| Error::internal("the auth handler must be set before the server starts"))?;
        server.set_auth_handler(desc);
        Ok(())
    }

    /// Serves until a termination signal arrives, then coordinates the
    /// graceful-then-forced shutdown across all components.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let serve_stop = self.shutdown.started();

        // Trace reporter: flushes best-effort until shutdown completes.
        let reporter_stop = CancellationToken::new();
        let reporter_task = self
            .reporter
            .lock()
            .expect("reporter poisoned")
            .take()
            .map(|reporter| tokio::spawn(reporter.start_reporting(reporter_stop.clone())));

        // Pub/sub: stop fetching, drain in-flight, then close providers.
        {
            let pubsub = self.pubsub.clone();
            self.shutdown
                .on_shutdown(move |force| async move { pubsub.shutdown(force).await });
        }
        // SQL pools close once shutdown is underway, bounded by the force
        // deadline like everything else.
        for db in self.databases.values() {
            let db = db.clone();
            self.shutdown.on_shutdown(move |_force| async move { db.close().await });
        }

        let server = Arc::new(
            self.server
                .lock()
                .expect("server poisoned")
                .take()
                .ok_or_else(|| Error::internal("runtime already running"))?,
        );
        let mode = ListenMode::from_env();
        let server_task = tokio::spawn(server.serve(mode, serve_stop));

        self.shutdown.listen().await;

        // Shutdown has run; stop the reporter after a final flush and
        // reap the server task.
        reporter_stop.cancel();
        if let Some(task) = reporter_task {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), task).await;
        }
        server_task.abort();
        Ok(())
    }
}

/// Entry point for service binaries: installs logging, decodes the
/// runtime config and secrets, lets `init` register the application's
/// endpoints and subscriptions, then serves until shutdown.
///
/// Exit codes: 0 on normal shutdown, 1 on an unrecoverable runtime
/// error, 2 on missing or unparseable configuration.
pub fn start(init: impl FnOnce(&Arc<Runtime>) -> Result<(), Error>) -> ExitCode {
    init_logging();

    let runtime = match Runtime::from_env() {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            eprintln!("encore runtime: {err}");
            return ExitCode::from(2);
        }
    };

    if let Err(err) = init(&runtime) {
        eprintln!("encore runtime: {err}");
        return ExitCode::from(1);
    }

    let tokio_runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("encore runtime: failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match tokio_runtime.block_on(runtime.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("encore runtime: {err}");
            ExitCode::from(1)
        }
    }
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(TraceLogLayer::new())
        .try_init();
}
