//! Filter chain: ordered interceptors wrapped around a context's handler.
//!
//! Each [`Filter`] receives the [`Exchange`] and a [`Chain`] cursor over the
//! remaining filters. Calling [`Chain::proceed`] runs the next filter, or
//! the handler once the filters are exhausted. A filter may also answer the
//! exchange itself and never proceed.
//!
//! ## Core types
//!
//! - [`HttpHandler`]: the terminal request handler of a context.
//! - [`Filter`]: an interceptor in the chain.
//! - [`Chain`]: cursor into the remaining chain; consumed by `proceed`.
//! - [`handler_fn`] / [`filter_fn`]: adapters from closures.
//! - [`TraceFilter`]: built-in per-exchange log line.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use crate::BoxFuture;
use crate::server::Exchange;

/// The terminal handler of a context.
///
/// Handlers read the request body and write the response through the
/// [`Exchange`]. Returning an error closes the connection; if no response
/// had been started a `500` page is sent first.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, io::Result<()>>;
}

/// An interceptor placed in front of a handler.
pub trait Filter: Send + Sync + 'static {
    fn filter<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        chain: Chain<'a>,
    ) -> BoxFuture<'a, io::Result<()>>;

    /// Short description used in logs.
    fn description(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A cursor into the remaining filters of one exchange.
///
/// `Chain` is consumed by [`proceed`](Self::proceed), so each filter can
/// pass control onwards at most once.
pub struct Chain<'a> {
    filters: &'a [Arc<dyn Filter>],
    handler: &'a dyn HttpHandler,
}

impl<'a> Chain<'a> {
    pub fn new(filters: &'a [Arc<dyn Filter>], handler: &'a dyn HttpHandler) -> Self {
        Self { filters, handler }
    }

    /// Runs the next filter, or the handler at the end of the chain.
    ///
    /// The exchange is only reborrowed, so a filter can still inspect it
    /// after the downstream chain has returned.
    pub fn proceed<'b>(self, exchange: &'b mut Exchange) -> BoxFuture<'b, io::Result<()>>
    where
        'a: 'b,
    {
        match self.filters.split_first() {
            Some((next, rest)) => next.filter(
                exchange,
                Chain {
                    filters: rest,
                    handler: self.handler,
                },
            ),
            None => self.handler.handle(exchange),
        }
    }
}

struct FnHandler<F>(F);

impl<F> HttpHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut Exchange) -> BoxFuture<'a, io::Result<()>> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, io::Result<()>> {
        (self.0)(exchange)
    }
}

/// Wraps a closure as a shared [`HttpHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use http_engine::filter::handler_fn;
/// use http_engine::http::StatusCode;
///
/// let hello = handler_fn(|ex| Box::pin(async move {
///     ex.respond(StatusCode::OK, "hello").await
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn HttpHandler>
where
    F: for<'a> Fn(&'a mut Exchange) -> BoxFuture<'a, io::Result<()>> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnFilter<F>(F);

impl<F> Filter for FnFilter<F>
where
    F: for<'a> Fn(&'a mut Exchange, Chain<'a>) -> BoxFuture<'a, io::Result<()>>
        + Send
        + Sync
        + 'static,
{
    fn filter<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        chain: Chain<'a>,
    ) -> BoxFuture<'a, io::Result<()>> {
        (self.0)(exchange, chain)
    }

    fn description(&self) -> &str {
        "closure filter"
    }
}

/// Wraps a closure as a shared [`Filter`].
///
/// # Examples
///
/// ```rust,no_run
/// use http_engine::filter::filter_fn;
///
/// let tag = filter_fn(|ex, chain| Box::pin(async move {
///     ex.response_headers_mut().set("X-Served-By", "http-engine");
///     chain.proceed(ex).await
/// }));
/// ```
pub fn filter_fn<F>(f: F) -> Arc<dyn Filter>
where
    F: for<'a> Fn(&'a mut Exchange, Chain<'a>) -> BoxFuture<'a, io::Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnFilter(f))
}

/// Logs method, path, status and duration of every exchange it wraps.
///
/// Emits a single `tracing::info!` line once the downstream chain returns:
///
/// ```text
/// GET /path - 200 (1.2ms)
/// ```
pub struct TraceFilter;

impl Filter for TraceFilter {
    fn filter<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        chain: Chain<'a>,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = exchange.method().to_string();
            let path = exchange.path().to_owned();

            let result = chain.proceed(&mut *exchange).await;

            let status = exchange.response_code().map_or(0, |s| s.as_u16());
            let elapsed = start.elapsed();
            match &result {
                Ok(()) => tracing::info!("{} {} - {} ({:?})", method, path, status, elapsed),
                Err(e) => {
                    tracing::warn!(error = %e, "{} {} - {} ({:?})", method, path, status, elapsed)
                }
            }
            result
        })
    }

    fn description(&self) -> &str {
        "trace filter"
    }
}
