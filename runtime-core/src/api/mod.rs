//! The API server: endpoint registration, routing, CORS, trust gating,
//! internal routes, and request dispatch.

mod cors;
mod endpoints;
mod internal;
mod router;
mod server;

pub use cors::Cors;
pub use endpoints::{
    typed_handler, Access, ApiRequest, ApiResponse, Endpoint, Handler, RawHandler, TypedHandler,
    WILDCARD_METHOD,
};
pub use internal::InternalRoutes;
pub use router::{Router, RouterError};
pub use server::{json_response, AuthHandlerDesc, ListenMode, Server};
