//! # http-engine
//!
//! An event-driven HTTP/1.0 and HTTP/1.1 server engine built on tokio.
//!
//! One dispatcher task owns the listening socket and every connection that
//! is waiting for a request. Readable connections are handed to worker tasks
//! that parse, route, filter and answer a single exchange, then hand the
//! connection back. A registry tracks each connection's lifecycle state and
//! enforces ceilings on open and idle connections, while two reapers close
//! connections that stay idle, silent or busy for too long.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use http_engine::{HttpServer, ServerConfig, StatusCode, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = HttpServer::bind("127.0.0.1:8080", ServerConfig::default()).await?;
//!     server.create_context("/", handler_fn(|ex| Box::pin(async move {
//!         ex.respond(StatusCode::OK, "Hello, World!").await
//!     })))?;
//!     server.start()?;
//!     println!("Listening on http://{}", server.local_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop(Duration::from_secs(2)).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod context;
pub mod filter;
pub mod http;
pub mod router;
pub mod server;

/// A boxed, sendable future, as returned by handlers, filters and executors.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use config::{ConfigError, ServerConfig};
pub use context::{Attributes, HttpContext};
pub use filter::{Chain, Filter, HttpHandler, TraceFilter, filter_fn, handler_fn};
pub use http::{Headers, Method, ResponseLength, StatusCode, Version};
pub use router::{ContextError, ContextRouter, MatchMode};
pub use server::{Exchange, HttpServer, ServerError};
