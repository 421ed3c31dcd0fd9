use super::{CompletedTrace, TimeAnchor, Tracer};
use crate::platform::RequestValidator;
use runtime_api::TRACE_VERSION;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub app_id: String,
    pub env_id: String,
    pub deploy_id: String,
    pub app_commit: String,
    pub trace_endpoint: reqwest::Url,
    pub validator: Arc<RequestValidator>,
}

/// Ships completed traces to the platform ingest endpoint.
///
/// Traces are best-effort: failures are logged and the trace dropped, and
/// nothing on the request path ever waits for ingestion.
#[must_use]
pub struct Reporter {
    rx: mpsc::UnboundedReceiver<CompletedTrace>,
    http_client: reqwest::Client,
    config: ReporterConfig,
    anchor: TimeAnchor,
}

/// Creates the tracer/reporter pair sharing one submission channel.
pub fn streaming_tracer(
    http_client: reqwest::Client,
    config: ReporterConfig,
) -> (Tracer, Reporter) {
    let (tx, rx) = mpsc::unbounded_channel();
    let anchor = TimeAnchor::new();
    let tracer = Tracer::new(tx, anchor.clone());
    let reporter = Reporter {
        rx,
        http_client,
        config,
        anchor,
    };
    (tracer, reporter)
}

impl Reporter {
    /// Drains submitted traces until shutdown is forced; traces already
    /// submitted when the token fires are flushed best-effort.
    pub async fn start_reporting(mut self, force: CancellationToken) {
        loop {
            tokio::select! {
                trace = self.rx.recv() => match trace {
                    Some(trace) => self.flush(trace).await,
                    // All tracer handles dropped; nothing more will arrive.
                    None => return,
                },
                _ = force.cancelled() => break,
            }
        }

        // Final flush of whatever was already submitted.
        while let Ok(trace) = self.rx.try_recv() {
            self.flush(trace).await;
        }
    }

    async fn flush(&self, trace: CompletedTrace) {
        if trace.data.is_empty() {
            return;
        }

        let req = self
            .http_client
            .post(self.config.trace_endpoint.clone())
            .header("X-Encore-App-ID", &self.config.app_id)
            .header("X-Encore-Env-ID", &self.config.env_id)
            .header("X-Encore-Deploy-ID", &self.config.deploy_id)
            .header("X-Encore-App-Commit", &self.config.app_commit)
            .header("X-Encore-Trace-ID", trace.trace_id.to_base64())
            .header("X-Encore-Trace-Version", TRACE_VERSION)
            .header("X-Encore-Trace-TimeAnchor", self.anchor.trace_header())
            .body(trace.data)
            .build();
        let mut req = match req {
            Ok(req) => req,
            Err(err) => {
                tracing::error!(%err, "failed to build trace request");
                return;
            }
        };

        if let Err(err) = self.config.validator.sign_outgoing_request(&mut req) {
            tracing::error!(%err, "failed to sign trace request");
            return;
        }

        match self.http_client.execute(req).await {
            Ok(resp) if !resp.status().is_success() => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(%status, body, trace_id = %trace.trace_id, "trace ingest rejected trace");
            }
            Err(err) => {
                tracing::error!(%err, trace_id = %trace.trace_id, "failed to send trace");
            }
            _ => {}
        }
    }
}
