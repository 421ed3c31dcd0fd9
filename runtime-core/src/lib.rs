//! The application request runtime.
//!
//! Each service instance links against this crate, which tracks every
//! externally triggered unit of work (an *operation*) and each task
//! participating in it, emits a binary trace stream of request
//! boundaries, outbound calls, SQL queries, cache commands and pub/sub
//! events, routes inbound HTTP requests to registered endpoints, drives
//! pub/sub delivery with retry and panic isolation, and coordinates a
//! graceful-then-forced shutdown.
//!
//! The task-local tag carrying the current operation and request is
//! transferred into spawned tasks via [`tracker::spawn`]; that helper is
//! the default way code running under the runtime starts concurrent
//! work.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod httptrace;
pub mod lifecycle;
pub mod logger;
pub mod metrics;
pub mod model;
pub mod platform;
pub mod pubsub;
pub mod secrets;
pub mod shutdown;
pub mod sqldb;
pub mod stack;
pub mod trace;
pub mod tracker;

mod runtime;

pub use error::{Code, Error};
pub use runtime::{start, BootstrapError, Runtime};
