//! Pluggable execution of exchange work.
//!
//! The dispatcher hands every ready connection to an [`Executor`] as a
//! boxed future. The default [`SpawnExecutor`] spawns each one on the tokio
//! runtime; [`BoundedExecutor`] caps how many run at once.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::BoxFuture;

/// Runs exchange futures to completion.
///
/// Implementations must not block the caller: the dispatcher invokes
/// `execute` from its own event loop.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: BoxFuture<'static, ()>);
}

/// Spawns every task directly on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpawnExecutor;

impl Executor for SpawnExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

/// Spawns tasks but lets at most `limit` of them run concurrently.
///
/// Tasks over the limit wait for a permit inside their own spawned future,
/// so `execute` still returns immediately.
///
/// # Examples
///
/// ```
/// use http_engine::server::executor::BoundedExecutor;
///
/// let executor = BoundedExecutor::new(16);
/// assert_eq!(executor.available(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
}

impl BoundedExecutor {
    /// A limit of zero is raised to one.
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Permits not currently held by a running task.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Executor for BoundedExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => task.await,
                Err(_) => warn!("executor semaphore closed, dropping task"),
            }
        });
    }
}
