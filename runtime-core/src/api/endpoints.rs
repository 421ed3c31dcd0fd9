use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use std::future::Future;
use std::sync::Arc;

/// Sentinel method under which an endpoint registered for `*` is stored.
pub const WILDCARD_METHOD: &str = "*";

/// Who may call an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Anyone.
    Public,
    /// Anyone carrying valid auth; the request must resolve to a uid.
    Auth,
    /// Platform-signed or internal traffic only.
    Private,
}

/// An inbound request as handlers see it: the body is fully read before
/// dispatch.
pub type ApiRequest = http::Request<Bytes>;
pub type ApiResponse = http::Response<Full<Bytes>>;

/// A handler taking decoded inputs and returning a JSON-encodable output.
#[async_trait]
pub trait TypedHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        path_params: Vec<(String, String)>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, Error>;
}

/// A handler that works with the HTTP request and response directly.
#[async_trait]
pub trait RawHandler: Send + Sync + 'static {
    async fn handle(&self, req: ApiRequest) -> Result<ApiResponse, Error>;
}

pub enum Handler {
    Typed(Arc<dyn TypedHandler>),
    Raw(Arc<dyn RawHandler>),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Typed(_) => f.write_str("Handler::Typed"),
            Handler::Raw(_) => f.write_str("Handler::Raw"),
        }
    }
}

/// A registered endpoint.
#[derive(Debug)]
pub struct Endpoint {
    pub service: String,
    pub name: String,
    pub path: String,
    /// Uppercased method names; may contain [`WILDCARD_METHOD`].
    pub methods: Vec<String>,
    pub raw: bool,
    pub access: Access,
    pub handler: Handler,
}

impl Endpoint {
    pub fn new(
        service: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<String>,
        methods: &[&str],
        access: Access,
        handler: Handler,
    ) -> Arc<Self> {
        Arc::new(Endpoint {
            service: service.into(),
            name: name.into(),
            path: path.into(),
            methods: methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            raw: matches!(handler, Handler::Raw(_)),
            access,
            handler,
        })
    }

    pub fn require_auth(&self) -> bool {
        self.access == Access::Auth
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TypedHandler for FnHandler<F>
where
    F: Fn(Vec<(String, String)>, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, Error>> + Send + 'static,
{
    async fn handle(
        &self,
        path_params: Vec<(String, String)>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        (self.0)(path_params, payload).await
    }
}

/// Wraps an async closure as a [`TypedHandler`].
pub fn typed_handler<F, Fut>(f: F) -> Arc<dyn TypedHandler>
where
    F: Fn(Vec<(String, String)>, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, Error>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
