//! Periodic timeout enforcement.
//!
//! Both reapers work the same way: take a snapshot of the connections that
//! look expired, then close each one only if the registry confirms, under
//! its lock, that it is still in the scanned state and still over the
//! threshold. A connection that moved on in between is left alone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::debug;

use super::registry::{ConnectionRegistry, StateKind};
use crate::config::ServerConfig;

/// Closes IDLE connections older than the idle interval and silent
/// NEWLY_ACCEPTED connections older than the newly-accepted interval.
/// Returns the number closed.
pub(crate) fn reap_idle(
    registry: &ConnectionRegistry,
    config: &ServerConfig,
    now: Instant,
) -> usize {
    sweep(registry, StateKind::Idle, config.idle_interval, now)
        + sweep(registry, StateKind::NewlyAccepted, config.newly_accepted_interval(), now)
}

/// Closes connections that have spent too long in REQUEST or RESPONSE.
/// Returns the number closed.
pub(crate) fn reap_exchanges(
    registry: &ConnectionRegistry,
    config: &ServerConfig,
    now: Instant,
) -> usize {
    let mut closed = 0;
    if let Some(max) = config.max_request_time {
        closed += sweep(registry, StateKind::Request, max, now);
    }
    if let Some(max) = config.max_response_time {
        closed += sweep(registry, StateKind::Response, max, now);
    }
    closed
}

fn sweep(
    registry: &ConnectionRegistry,
    kind: StateKind,
    threshold: Duration,
    now: Instant,
) -> usize {
    registry
        .expired(kind, threshold, now)
        .iter()
        .filter(|conn| registry.close_if_expired(conn, kind, threshold, now))
        .inspect(|conn| debug!(conn = conn.id(), state = ?kind, "connection timed out"))
        .count()
}

pub(crate) fn spawn_idle_reaper(
    registry: Arc<ConnectionRegistry>,
    config: Arc<ServerConfig>,
) -> JoinHandle<()> {
    spawn_periodic(config.idle_check, move || {
        reap_idle(&registry, &config, Instant::now())
    })
}

/// Returns `None` when neither a request nor a response maximum is configured.
pub(crate) fn spawn_exchange_reaper(
    registry: Arc<ConnectionRegistry>,
    config: Arc<ServerConfig>,
) -> Option<JoinHandle<()>> {
    if !config.has_exchange_timeouts() {
        return None;
    }
    Some(spawn_periodic(config.timer_check, move || {
        reap_exchanges(&registry, &config, Instant::now())
    }))
}

fn spawn_periodic<F>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> usize + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let closed = tick();
            if closed > 0 {
                debug!(closed, "reaper closed connections");
            }
        }
    })
}
