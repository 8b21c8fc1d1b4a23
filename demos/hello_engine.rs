//! A small server showing contexts, filters and graceful shutdown.
//!
//! ```text
//! RUST_LOG=http_engine=debug cargo run --example hello_engine
//! curl -i http://127.0.0.1:8080/hello/world
//! curl -i -X POST --data 'ping' http://127.0.0.1:8080/echo
//! ```
//!
//! Settings are read from `HTTP_ENGINE_*` environment variables, e.g.
//! `HTTP_ENGINE_MAX_IDLE_CONNECTIONS=1`.

use std::sync::Arc;
use std::time::Duration;

use http_engine::{HttpServer, ServerConfig, StatusCode, TraceFilter, filter_fn, handler_fn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:8080".to_owned());
    let server = HttpServer::bind(&addr, ServerConfig::from_env()?).await?;

    let hello = server.create_context(
        "/hello",
        handler_fn(|ex| {
            Box::pin(async move {
                let rest = ex.path().strip_prefix("/hello").unwrap_or_default();
                let name = match rest.trim_start_matches('/') {
                    "" => "World".to_owned(),
                    name => name.to_owned(),
                };
                ex.response_headers_mut().set("Content-Type", "text/plain; charset=utf-8");
                ex.respond(StatusCode::OK, format!("Hello, {name}!\n")).await
            })
        }),
    )?;
    hello.add_system_filter(Arc::new(TraceFilter));
    hello.add_filter(filter_fn(|ex, chain| {
        Box::pin(async move {
            ex.response_headers_mut().set("X-Served-By", "http-engine");
            chain.proceed(ex).await
        })
    }));

    let echo = server.create_context(
        "/echo",
        handler_fn(|ex| {
            Box::pin(async move {
                let body = ex.read_to_end().await?;
                ex.respond(StatusCode::OK, body).await
            })
        }),
    )?;
    echo.add_system_filter(Arc::new(TraceFilter));

    server.start()?;
    tracing::info!(address = %server.local_addr(), "listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop(Duration::from_secs(2)).await?;
    Ok(())
}
