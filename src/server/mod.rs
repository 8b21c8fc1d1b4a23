//! The server facade and the machinery behind it.
//!
//! [`HttpServer`] binds a listening socket, holds the registered contexts and
//! owns the background tasks once started:
//!
//! - the dispatcher, a single task that accepts connections and watches
//!   idle ones for readability;
//! - exchange workers, submitted to an [`Executor`] for every readable
//!   connection;
//! - the idle reaper and, when timeouts are configured, the
//!   request/response reaper.
//!
//! All of them share one [`ConnectionRegistry`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::context::HttpContext;
use crate::filter::HttpHandler;
use crate::router::{ContextError, ContextRouter};

mod dispatcher;
mod exchange;
pub mod executor;
mod reaper;
pub mod registry;
pub mod transport;

pub use exchange::Exchange;
pub use executor::{BoundedExecutor, Executor, SpawnExecutor};
pub use registry::{ConnectionRegistry, ConnectionStats};
pub use transport::{TlsWrapper, Transport};

use dispatcher::{Dispatcher, Phase};
use registry::StateKind;

/// Listen backlog used by [`HttpServer::bind`].
pub const DEFAULT_BACKLOG: u32 = 128;

/// How often [`HttpServer::stop`] re-checks for in-flight exchanges.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error("TLS must be configured before any context is created")]
    ContextsRegistered,

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// State shared by the dispatcher, the exchange workers and the reapers.
pub(crate) struct Shared {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) router: Arc<ContextRouter>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) tls: Option<Arc<dyn TlsWrapper>>,
    pub(crate) protocol: &'static str,
    pub(crate) local_addr: SocketAddr,
}

struct Running {
    control: watch::Sender<Phase>,
    dispatcher: JoinHandle<()>,
    idle_reaper: JoinHandle<()>,
    exchange_reaper: Option<JoinHandle<()>>,
}

enum Lifecycle {
    Bound(TcpListener),
    Running(Running),
    Stopped,
}

/// An HTTP/1.0 and HTTP/1.1 server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use http_engine::config::ServerConfig;
/// use http_engine::filter::handler_fn;
/// use http_engine::http::StatusCode;
/// use http_engine::server::HttpServer;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = HttpServer::bind("127.0.0.1:8080", ServerConfig::from_env()?).await?;
///     server.create_context("/", handler_fn(|ex| Box::pin(async move {
///         ex.respond(StatusCode::OK, "Hello!").await
///     })))?;
///     server.start()?;
///
///     tokio::signal::ctrl_c().await?;
///     server.stop(Duration::from_secs(5)).await?;
///     Ok(())
/// }
/// ```
pub struct HttpServer {
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<ContextRouter>,
    executor: Mutex<Arc<dyn Executor>>,
    tls: Option<Arc<dyn TlsWrapper>>,
    lifecycle: Mutex<Lifecycle>,
}

impl HttpServer {
    /// Binds to `addr` with the default backlog.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be resolved or
    /// bound (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>, config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with_backlog(addr, DEFAULT_BACKLOG, config).await
    }

    /// Binds to `addr`, queueing at most `backlog` pending connections.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be resolved or bound.
    pub async fn bind_with_backlog(
        addr: impl AsRef<str>,
        backlog: u32,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let bind_err = |source| ServerError::Bind {
            addr: addr.to_owned(),
            source,
        };

        let resolved = tokio::net::lookup_host(addr)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "no address resolved",
                ))
            })?;
        let listener = listen(resolved, backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.max_idle_connections,
        ));
        Ok(Self {
            local_addr,
            router: Arc::new(ContextRouter::new(config.match_mode)),
            config: Arc::new(config),
            registry,
            executor: Mutex::new(Arc::new(SpawnExecutor)),
            tls: None,
            lifecycle: Mutex::new(Lifecycle::Bound(listener)),
        })
    }

    /// Serves HTTPS: every accepted socket is passed through `tls` first and
    /// contexts are registered under the `https` protocol.
    ///
    /// # Errors
    ///
    /// [`ServerError::ContextsRegistered`] if a context already exists, since
    /// it was registered under `http`.
    pub fn with_tls(mut self, tls: Arc<dyn TlsWrapper>) -> Result<Self, ServerError> {
        if !self.router.is_empty() {
            return Err(ServerError::ContextsRegistered);
        }
        self.tls = Some(tls);
        Ok(self)
    }

    /// Replaces the executor that runs exchanges.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyStarted`] once [`start`](Self::start) has been called.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) -> Result<(), ServerError> {
        if !matches!(*self.lifecycle(), Lifecycle::Bound(_)) {
            return Err(ServerError::AlreadyStarted);
        }
        *self.executor.lock().unwrap_or_else(PoisonError::into_inner) = executor;
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `"http"`, or `"https"` when a [`TlsWrapper`] is configured.
    pub fn protocol(&self) -> &'static str {
        if self.tls.is_some() { "https" } else { "http" }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registers `handler` for requests under `path`.
    ///
    /// # Errors
    ///
    /// [`ContextError::DuplicateContext`] or [`ContextError::InvalidPath`].
    pub fn create_context(
        &self,
        path: &str,
        handler: Arc<dyn HttpHandler>,
    ) -> Result<Arc<HttpContext>, ServerError> {
        let context = HttpContext::new(self.protocol(), path);
        context.set_handler(handler);
        self.register(context)
    }

    /// Registers `path` without a handler; attach one through the returned
    /// handle. Until then requests routed here get a `500`.
    pub fn create_context_empty(&self, path: &str) -> Result<Arc<HttpContext>, ServerError> {
        self.register(HttpContext::new(self.protocol(), path))
    }

    fn register(&self, context: HttpContext) -> Result<Arc<HttpContext>, ServerError> {
        let context = self.router.add(context)?;
        debug!(protocol = context.protocol(), path = context.path(), "context registered");
        Ok(context)
    }

    /// Removes the context registered for exactly `path`.
    pub fn remove_context(&self, path: &str) -> Result<(), ServerError> {
        self.router.remove(self.protocol(), path)?;
        Ok(())
    }

    /// Removes this context instance.
    pub fn remove_context_ref(&self, context: &Arc<HttpContext>) -> Result<(), ServerError> {
        self.router.remove_context(context)?;
        Ok(())
    }

    /// Per-state connection counts.
    pub fn connection_stats(&self) -> ConnectionStats {
        self.registry.stats()
    }

    /// Starts the dispatcher and the reapers on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyStarted`] if called more than once.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle();
        let listener = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Bound(listener) => listener,
            other => {
                *lifecycle = other;
                return Err(ServerError::AlreadyStarted);
            }
        };

        let executor = self.executor.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let shared = Arc::new(Shared {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            executor,
            tls: self.tls.clone(),
            protocol: self.protocol(),
            local_addr: self.local_addr,
        });

        let (control, control_rx) = watch::channel(Phase::Running);
        let dispatcher = Dispatcher::new(Arc::clone(&shared), listener, control_rx);
        let dispatcher = tokio::spawn(dispatcher.run());
        let idle_reaper =
            reaper::spawn_idle_reaper(Arc::clone(&self.registry), Arc::clone(&self.config));
        let exchange_reaper =
            reaper::spawn_exchange_reaper(Arc::clone(&self.registry), Arc::clone(&self.config));

        *lifecycle = Lifecycle::Running(Running {
            control,
            dispatcher,
            idle_reaper,
            exchange_reaper,
        });
        info!(address = %self.local_addr, protocol = self.protocol(), "server started");
        Ok(())
    }

    /// Stops the server.
    ///
    /// New connections are refused at once and idle connections closed.
    /// Exchanges in progress get up to `grace` to finish; whatever remains
    /// after that is closed, then the background tasks are stopped.
    ///
    /// # Errors
    ///
    /// [`ServerError::NotStarted`] if the server is not running.
    pub async fn stop(&self, grace: Duration) -> Result<(), ServerError> {
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return Err(ServerError::NotStarted);
                }
            }
        };

        info!(grace = ?grace, "stopping server");
        running.control.send_replace(Phase::Draining);
        let idle = self.registry.close_state(StateKind::Idle)
            + self.registry.close_state(StateKind::NewlyAccepted);
        debug!(closed = idle, "closed idle connections");

        let deadline = tokio::time::Instant::now() + grace;
        while self.registry.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        running.control.send_replace(Phase::Terminated);
        let forced = self.registry.close_all();
        if forced > 0 {
            warn!(connections = forced, "grace period elapsed, closing remaining connections");
        }

        running.idle_reaper.abort();
        if let Some(reaper) = running.exchange_reaper {
            reaper.abort();
        }
        if let Err(e) = running.dispatcher.await {
            warn!(error = %e, "dispatcher task ended abnormally");
        }
        info!("server stopped");
        Ok(())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Running(running) = std::mem::replace(lifecycle, Lifecycle::Stopped) {
            running.control.send_replace(Phase::Terminated);
            running.idle_reaper.abort();
            if let Some(reaper) = running.exchange_reaper {
                reaper.abort();
            }
            self.registry.close_all();
        }
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}
