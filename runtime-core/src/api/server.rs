use super::cors::Cors;
use super::endpoints::{Access, ApiRequest, ApiResponse, Endpoint, Handler, TypedHandler};
use super::internal::InternalRoutes;
use super::router::{Router, RouterError};
use crate::error::{Code, Error};
use crate::lifecycle::{self, RequestDesc, RequestOutcome};
use crate::metrics::EndpointMetrics;
use crate::model::RequestType;
use crate::platform::RequestValidator;
use crate::stack::Stack;
use crate::trace::Tracer;
use crate::tracker;
use bytes::Bytes;
use futures::FutureExt;
use http::header;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where the server listens: TCP in cloud environments, a multiplexed
/// pipe session when run under the local development daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    Tcp(SocketAddr),
    Pipe,
}

impl ListenMode {
    /// `$PORT` selects TCP; its absence means the parent process handed
    /// us a duplex pipe on fds 3 and 4.
    pub fn from_env() -> Self {
        match std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok()) {
            Some(port) => ListenMode::Tcp(SocketAddr::from(([0, 0, 0, 0], port))),
            None => ListenMode::Pipe,
        }
    }
}

/// Builds a JSON response with the given status.
pub fn json_response(status: u16, body: serde_json::Value) -> ApiResponse {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    http::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response parts are valid")
}

fn error_response(err: &Error) -> ApiResponse {
    json_response(err.code.http_status(), err.to_json_body())
}

/// The application's auth handler: resolves request credentials into a
/// uid and auth data before protected endpoints run.
pub struct AuthHandlerDesc {
    pub service: String,
    pub name: String,
    pub handler: Arc<dyn TypedHandler>,
}

/// The API server: two routers (private sees everything, public sees
/// `Public` and `Auth` endpoints), CORS, internal routes, and dispatch.
pub struct Server {
    private: Router,
    public: Router,
    cors: Cors,
    validator: Arc<RequestValidator>,
    internal: InternalRoutes,
    tracer: Tracer,
    metrics: Arc<EndpointMetrics>,
    tracing_enabled: bool,
    auth_handler: Option<AuthHandlerDesc>,
}

impl Server {
    pub fn new(
        cors: Cors,
        validator: Arc<RequestValidator>,
        internal: InternalRoutes,
        tracer: Tracer,
        metrics: Arc<EndpointMetrics>,
        tracing_enabled: bool,
    ) -> Self {
        Server {
            private: Router::new(),
            public: Router::new(),
            cors,
            validator,
            internal,
            tracer,
            metrics,
            tracing_enabled,
            auth_handler: None,
        }
    }

    pub fn set_auth_handler(&mut self, desc: AuthHandlerDesc) {
        self.auth_handler = Some(desc);
    }

    /// Registers an endpoint on the private router, and on the public one
    /// when its access class is externally reachable.
    pub fn register(&mut self, endpoint: Arc<Endpoint>) -> Result<(), RouterError> {
        self.private.register(endpoint.clone())?;
        if matches!(endpoint.access, Access::Public | Access::Auth) {
            self.public.register(endpoint)?;
        }
        Ok(())
    }

    /// Dispatches one inbound request to completion.
    pub async fn dispatch(self: &Arc<Self>, req: ApiRequest) -> ApiResponse {
        let path = req.uri().path().to_string();
        let from_platform = self.validator.has_keys()
            && self.validator.incoming_is_platform(req.headers(), &path);

        if InternalRoutes::matches(&path) {
            return self.internal.handle(req, from_platform).await;
        }

        // CORS preflight and origin gating. Platform traffic is not
        // browser traffic and bypasses both.
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !from_platform {
            if req.method() == http::Method::OPTIONS
                && req.headers().contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
            {
                return self.preflight(req);
            }
            if let Some(false) = self.cors.check(req.headers(), false) {
                return error_response(&Error::new(
                    Code::PermissionDenied,
                    "origin not allowed",
                ));
            }
        }
        let with_credentials = Cors::request_has_credentials(req.headers(), false);

        let router = if from_platform { &self.private } else { &self.public };
        let Some((endpoint, path_params)) = router.lookup(req.method().as_str(), &path) else {
            return json_response(404, Error::unknown_endpoint());
        };

        let mut resp = self.handle_endpoint(req, endpoint, path_params).await;
        if let Some(origin) = origin {
            let headers = resp.headers_mut();
            self.cors.response_headers(&origin, with_credentials, headers);
        }
        resp
    }

    fn preflight(&self, req: ApiRequest) -> ApiResponse {
        let Some(origin) = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
        else {
            return json_response(400, Error::new(Code::InvalidArgument, "missing origin").to_json_body());
        };
        let creds = Cors::request_has_credentials(req.headers(), false);
        if !self.cors.origin_allowed(origin, creds) {
            return error_response(&Error::new(Code::PermissionDenied, "origin not allowed"));
        }
        let mut resp = http::Response::builder()
            .status(204)
            .body(Full::new(Bytes::new()))
            .expect("static response parts are valid");
        self.cors.response_headers(origin, creds, resp.headers_mut());
        self.cors.preflight_headers(resp.headers_mut());
        resp
    }

    /// Runs the endpoint inside a fresh operation: optional auth handler
    /// request, then the endpoint request, with panics surfaced as
    /// `Internal` errors.
    async fn handle_endpoint(
        self: &Arc<Self>,
        req: ApiRequest,
        endpoint: Arc<Endpoint>,
        path_params: Vec<(String, String)>,
    ) -> ApiResponse {
        let this = self.clone();
        tracker::scope(async move {
            if this.tracer_begin_op().is_err() {
                return error_response(&Error::internal("failed to begin operation"));
            }
            let resp = this.run_requests(req, endpoint, path_params).await;
            tracker::finish_op();
            resp
        })
        .await
    }

    fn tracer_begin_op(&self) -> Result<(), runtime_api::EntropyError> {
        tracker::begin_op(&self.tracer, self.tracing_enabled)?;
        Ok(())
    }

    async fn run_requests(
        self: &Arc<Self>,
        req: ApiRequest,
        endpoint: Arc<Endpoint>,
        path_params: Vec<(String, String)>,
    ) -> ApiResponse {
        // Resolve auth first: it runs as its own request so that the
        // endpoint request observes the resolved uid.
        let auth = match self.run_auth_handler(req.headers()).await {
            Ok(auth) => auth,
            Err(err) => return error_response(&err),
        };
        let (uid, auth_data) = auth.unzip();

        let desc = RequestDesc {
            typ: Some(RequestType::Rpc),
            service: endpoint.service.clone(),
            endpoint: endpoint.name.clone(),
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            path_params: path_params.clone(),
            require_auth: endpoint.require_auth(),
            uid,
            auth_data,
            payload: if endpoint.raw { Vec::new() } else { req.body().to_vec() },
            traced: self.tracing_enabled,
            ..Default::default()
        };
        if let Err(err) = lifecycle::begin_request(&self.tracer, desc) {
            return error_response(&err);
        }

        let outcome = self.invoke_handler(&endpoint, req, path_params).await;
        let (resp, outputs, err, panic_stack) = match outcome {
            Ok(resp) => {
                let outputs = resp.1;
                (resp.0, outputs, None, None)
            }
            Err((err, stack)) => {
                let resp = error_response(&err);
                (resp, Vec::new(), Some(err), stack)
            }
        };

        lifecycle::finish_request(
            &self.metrics,
            RequestOutcome {
                outputs: &outputs,
                err: err.as_ref(),
                http_status: resp.status().as_u16(),
                panic_stack: panic_stack.as_ref(),
            },
        );
        resp
    }

    async fn invoke_handler(
        &self,
        endpoint: &Endpoint,
        req: ApiRequest,
        path_params: Vec<(String, String)>,
    ) -> Result<(ApiResponse, Vec<u8>), (Error, Option<Stack>)> {
        let fut = async {
            match &endpoint.handler {
                Handler::Typed(handler) => {
                    let payload = if req.body().is_empty() {
                        serde_json::Value::Null
                    } else {
                        serde_json::from_slice(req.body()).map_err(|err| {
                            Error::new(Code::InvalidArgument, format!("invalid request body: {err}"))
                        })?
                    };
                    let output = handler.handle(path_params, payload).await?;
                    let encoded = serde_json::to_vec(&output).unwrap_or_default();
                    Ok((json_response(200, output), encoded))
                }
                Handler::Raw(handler) => {
                    let resp = handler.handle(req).await?;
                    Ok((resp, Vec::new()))
                }
            }
        };
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(err)) => Err((err, None)),
            Err(payload) => {
                let msg = panic_message(payload);
                Err((
                    Error::new(Code::Internal, format!("handler panicked: {msg}")),
                    Some(Stack::capture()),
                ))
            }
        }
    }

    /// Runs the configured auth handler when the request carries an
    /// `Authorization` header; returns the resolved `(uid, auth data)`.
    async fn run_auth_handler(
        &self,
        headers: &http::HeaderMap,
    ) -> Result<Option<(String, serde_json::Value)>, Error> {
        let Some(desc) = &self.auth_handler else {
            return Ok(None);
        };
        let Some(token) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return Ok(None);
        };

        lifecycle::begin_request(
            &self.tracer,
            RequestDesc {
                typ: Some(RequestType::AuthHandler),
                service: desc.service.clone(),
                endpoint: desc.name.clone(),
                payload: token.clone().into_bytes(),
                traced: self.tracing_enabled,
                ..Default::default()
            },
        )?;

        let fut = desc
            .handler
            .handle(Vec::new(), serde_json::json!({"authorization": token}));
        let result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(Error::new(
                Code::Internal,
                format!("auth handler panicked: {}", panic_message(payload)),
            )),
        };

        let (outputs, err) = match &result {
            Ok(value) => (serde_json::to_vec(value).unwrap_or_default(), None),
            Err(err) => (Vec::new(), Some(err)),
        };
        lifecycle::finish_request(
            &self.metrics,
            RequestOutcome {
                outputs: &outputs,
                err,
                http_status: err.map(|e| e.code.http_status()).unwrap_or(200),
                panic_stack: None,
            },
        );

        let value = result?;
        let uid = value
            .get("uid")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if uid.is_empty() {
            return Err(Error::new(Code::Unauthenticated, "auth handler returned no uid"));
        }
        let user_data = value.get("user_data").cloned().unwrap_or(serde_json::Value::Null);
        Ok(Some((uid, user_data)))
    }

    /// Serves connections until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        mode: ListenMode,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        match mode {
            ListenMode::Tcp(addr) => self.serve_tcp(addr, shutdown).await,
            ListenMode::Pipe => self.serve_pipe(shutdown).await,
        }
    }

    async fn serve_tcp(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| Error::unavailable(format!("failed to bind {addr}: {err}")))?;
        tracing::info!(%addr, "api server listening");

        loop {
            let (stream, _peer) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept connection");
                        continue;
                    }
                },
            };
            self.clone().spawn_connection(TokioIo::new(stream), shutdown.clone());
        }
    }

    #[cfg(windows)]
    async fn serve_pipe(self: Arc<Self>, _shutdown: CancellationToken) -> Result<(), Error> {
        // `ENCORE_EXTRA_FILES` carries "<rfd>,<wfd>" on this platform;
        // wiring the handles up is not implemented yet.
        Err(Error::new(
            Code::Unimplemented,
            "pipe listener is not supported on windows; set $PORT to use TCP",
        ))
    }

    #[cfg(unix)]
    async fn serve_pipe(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), Error> {
        let io = pipe::inherited_pipe()?;
        let mut conn = yamux::Connection::new(io, yamux::Config::default(), yamux::Mode::Server);
        tracing::info!("api server listening on inherited pipe");

        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                inbound = futures::future::poll_fn(|cx| conn.poll_next_inbound(cx)) => inbound,
            };
            match inbound {
                Some(Ok(stream)) => {
                    use tokio_util::compat::FuturesAsyncReadCompatExt;
                    self.clone()
                        .spawn_connection(TokioIo::new(stream.compat()), shutdown.clone());
                }
                Some(Err(err)) => {
                    tracing::error!(%err, "pipe session failed");
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    fn spawn_connection<I>(self: Arc<Self>, io: I, shutdown: CancellationToken)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let server = self.clone();
            let service = service_fn(move |req: http::Request<Incoming>| {
                let server = server.clone();
                async move {
                    let (parts, body) = req.into_parts();
                    let body = match body.collect().await {
                        Ok(collected) => collected.to_bytes(),
                        Err(_) => Bytes::new(),
                    };
                    let req = http::Request::from_parts(parts, body);
                    Ok::<_, std::convert::Infallible>(server.dispatch(req).await)
                }
            });

            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            let serving = builder.serve_connection(io, service);
            tokio::select! {
                result = serving => {
                    if let Err(err) = result {
                        tracing::debug!(%err, "connection closed with error");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(unix)]
mod pipe {
    use crate::error::Error;
    use std::os::unix::io::FromRawFd;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

    /// The duplex pipe inherited from the parent process: fd 3 is ours to
    /// read, fd 4 ours to write.
    pub(super) struct InheritedPipe {
        reader: tokio::fs::File,
        writer: tokio::fs::File,
    }

    pub(super) fn inherited_pipe() -> Result<Compat<InheritedPipe>, Error> {
        // Safety: the parent process owns fds 3/4 for exactly this
        // purpose and nothing else in this process touches them.
        let reader = unsafe { std::fs::File::from_raw_fd(3) };
        let writer = unsafe { std::fs::File::from_raw_fd(4) };
        let pipe = InheritedPipe {
            reader: tokio::fs::File::from_std(reader),
            writer: tokio::fs::File::from_std(writer),
        };
        Ok(pipe.compat())
    }

    impl AsyncRead for InheritedPipe {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.reader).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for InheritedPipe {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.writer).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.writer).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.writer).poll_shutdown(cx)
        }
    }
}

