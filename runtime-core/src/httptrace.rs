//! Outbound HTTP tracing: requests made from a traced task produce a
//! round-trip span with sub-events, and the response body is wrapped so
//! the body-closed event fires exactly once.

use crate::error::Error;
use crate::stack::Stack;
use crate::trace::{self, RoundTrip, TraceBuf};
use bytes::Bytes;
use runtime_api::SpanId;
use std::sync::Arc;

/// A `reqwest::Client` wrapper that records round-trip spans for calls
/// made on behalf of a traced request. Calls from untraced tasks pass
/// through unchanged.
#[derive(Debug, Clone)]
pub struct TracedClient {
    inner: reqwest::Client,
}

struct CallFinisher {
    trace: Arc<TraceBuf>,
    span: SpanId,
    correlation: SpanId,
    status: u16,
    round_trip: Arc<RoundTrip>,
    wrap_body: bool,
}

impl CallFinisher {
    fn finish(self, body_err: Option<&str>) {
        if self.wrap_body {
            self.round_trip.closed_body(body_err);
        }
        self.trace.http_call_end(
            self.span,
            self.correlation,
            Some(self.status),
            None,
            &self.round_trip,
        );
    }
}

impl TracedClient {
    pub fn new(inner: reqwest::Client) -> Self {
        TracedClient { inner }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    pub async fn get(&self, url: &str) -> Result<TracedResponse, Error> {
        let req = self
            .inner
            .get(url)
            .build()
            .map_err(|err| Error::invalid_argument(format!("invalid request: {err}")))?;
        self.execute(req).await
    }

    /// Executes `req`, emitting `HttpCallStart`/`HttpCallEnd` and the
    /// observable sub-events when called from a traced task.
    pub async fn execute(&self, req: reqwest::Request) -> Result<TracedResponse, Error> {
        let Some(ctx) = trace::with_current(|trace, span, taskctr| (trace.clone(), span, taskctr))
        else {
            // Untraced: plain passthrough.
            let resp = self
                .inner
                .execute(req)
                .await
                .map_err(|err| Error::unavailable(format!("http request failed: {err}")))?;
            return Ok(TracedResponse {
                inner: Some(resp),
                finisher: None,
            });
        };
        let (trace, span, taskctr) = ctx;

        let correlation = SpanId::generate()
            .map_err(|err| Error::internal(format!("failed to allocate call id: {err}")))?;
        let method = req.method().clone();
        let url = req.url().clone();
        trace.http_call_start(
            span,
            taskctr,
            correlation,
            method.as_str(),
            url.as_str(),
            Some(&Stack::capture()),
        );

        let round_trip = Arc::new(RoundTrip::new());
        if let Some(host) = url.host_str() {
            let port = url.port_or_known_default().unwrap_or(80);
            round_trip.get_conn(&format!("{host}:{port}"));
        }

        match self.inner.execute(req).await {
            Ok(resp) => {
                round_trip.wrote_request(None);
                round_trip.got_first_response_byte();
                let status = resp.status().as_u16();
                // HEAD responses have no body to wrap; the round trip is
                // complete at the headers.
                let head = method == reqwest::Method::HEAD;
                let finisher = CallFinisher {
                    trace,
                    span,
                    correlation,
                    status,
                    round_trip,
                    wrap_body: !head,
                };
                if head {
                    finisher.finish(None);
                    Ok(TracedResponse {
                        inner: Some(resp),
                        finisher: None,
                    })
                } else {
                    Ok(TracedResponse {
                        inner: Some(resp),
                        finisher: Some(finisher),
                    })
                }
            }
            Err(err) => {
                let msg = err.to_string();
                round_trip.wrote_request(Some(&msg));
                let failure = Error::unavailable(format!("http request failed: {err}"));
                trace.http_call_end(span, correlation, None, Some(&failure), &round_trip);
                Err(failure)
            }
        }
    }
}

/// A response whose body consumption completes the round-trip span.
/// Dropping it unconsumed records the close as well, exactly once.
pub struct TracedResponse {
    inner: Option<reqwest::Response>,
    finisher: Option<CallFinisher>,
}

impl TracedResponse {
    pub fn status(&self) -> u16 {
        self.inner.as_ref().map(|r| r.status().as_u16()).unwrap_or(0)
    }

    pub fn headers(&self) -> Option<&reqwest::header::HeaderMap> {
        self.inner.as_ref().map(|r| r.headers())
    }

    pub async fn bytes(mut self) -> Result<Bytes, Error> {
        let resp = self.inner.take().expect("body consumed once");
        let result = resp.bytes().await;
        let finisher = self.finisher.take();
        match result {
            Ok(bytes) => {
                if let Some(f) = finisher {
                    f.finish(None);
                }
                Ok(bytes)
            }
            Err(err) => {
                let msg = err.to_string();
                if let Some(f) = finisher {
                    f.finish(Some(&msg));
                }
                Err(Error::unavailable(format!("failed to read response body: {err}")))
            }
        }
    }

    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| Error::invalid_argument(format!("response is not utf-8: {err}")))
    }

    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, Error> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| Error::invalid_argument(format!("invalid response JSON: {err}")))
    }
}

impl Drop for TracedResponse {
    fn drop(&mut self) {
        if let Some(f) = self.finisher.take() {
            f.finish(None);
        }
    }
}
