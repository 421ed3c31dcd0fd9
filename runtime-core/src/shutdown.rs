//! Graceful-then-forced shutdown: handlers registered by the runtime's
//! components run concurrently on SIGINT/SIGTERM, bounded by a force
//! deadline from the runtime config.

use futures::future::BoxFuture;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Handler = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// The shutdown coordinator. Handlers receive the force context: a token
/// cancelled once the shutdown timeout elapses, after which they must
/// release resources immediately.
pub struct Shutdown {
    handlers: Mutex<Vec<Handler>>,
    timeout: Duration,
    started: CancellationToken,
}

impl Shutdown {
    pub fn new(timeout: Duration) -> Self {
        Shutdown {
            handlers: Mutex::new(Vec::new()),
            timeout,
            started: CancellationToken::new(),
        }
    }

    /// Registers a handler to run when shutdown begins.
    pub fn on_shutdown<F, Fut>(&self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .lock()
            .expect("shutdown handlers poisoned")
            .push(Box::new(move |force| Box::pin(f(force))));
    }

    /// Cancelled the moment shutdown begins; servers use it to stop
    /// accepting work.
    pub fn started(&self) -> CancellationToken {
        self.started.clone()
    }

    /// Waits for SIGINT/SIGTERM, then runs the shutdown.
    pub async fn listen(&self) {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        self.run().await;
    }

    /// Runs all registered handlers concurrently. Each must finish before
    /// the timeout or observe the force context's cancellation.
    pub async fn run(&self) {
        self.started.cancel();
        let handlers: Vec<Handler> =
            std::mem::take(&mut *self.handlers.lock().expect("shutdown handlers poisoned"));

        let force = CancellationToken::new();
        let all = futures::future::join_all(
            handlers.into_iter().map(|handler| handler(force.clone())),
        );

        match tokio::time::timeout(self.timeout, all).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "shutdown deadline reached, forcing");
                force.cancel();
                // A short grace period for handlers to observe the force
                // context before the process exits.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler installs");
    let mut terminate = signal(SignalKind::terminate()).expect("signal handler installs");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
