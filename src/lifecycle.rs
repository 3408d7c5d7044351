//! Process lifecycle: running state, periodic refresh, and graceful shutdown.
//!
//! The node starts in the running state.  A background loop periodically
//! reloads settings, pushes cache limits to the engine and re-pings the
//! control plane.  On SIGINT/SIGTERM the node flips to draining, sends the
//! control plane a stop notice, and waits until either no request has
//! completed for `drain_idle_seconds` or `graceful_shutdown_in_seconds` have
//! passed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::{load_settings, ClientSettings};
use crate::coordination::{ControlPlaneClient, ServerAssignment};
use crate::shared::Shared;

/// Interval between refresh ticks; the first tick also waits this long.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Upper bound on the stop notice so an unresponsive control plane cannot
/// hold up the drain.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

const DRAIN_POLL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

/// Process-wide running flag and time of the last completed request.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

#[derive(Debug)]
struct LifecycleInner {
    running: AtomicBool,
    epoch: Instant,
    /// Milliseconds after `epoch` at which the last request completed.
    last_request_ms: AtomicU64,
    draining: CancellationToken,
    terminated: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                running: AtomicBool::new(true),
                epoch: Instant::now(),
                last_request_ms: AtomicU64::new(0),
                draining: CancellationToken::new(),
                terminated: CancellationToken::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Record that a request just completed.
    pub fn mark_request(&self) {
        let now = self.inner.epoch.elapsed().as_millis() as u64;
        self.inner.last_request_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last completed request (or since startup).
    pub fn since_last_request(&self) -> Duration {
        let last = Duration::from_millis(self.inner.last_request_ms.load(Ordering::Relaxed));
        self.inner.epoch.elapsed().saturating_sub(last)
    }

    /// Leave the running state.  Returns `false` if already draining.
    pub fn begin_draining(&self) -> bool {
        let was_running = self.inner.running.swap(false, Ordering::AcqRel);
        self.inner.draining.cancel();
        was_running
    }

    /// Cancelled once draining starts.
    pub fn draining(&self) -> CancellationToken {
        self.inner.draining.clone()
    }

    /// Mark the drain as finished; the listener stops accepting.
    pub fn terminate(&self) {
        self.inner.terminated.cancel();
    }

    /// Cancelled once the drain has finished.
    pub fn terminated(&self) -> CancellationToken {
        self.inner.terminated.clone()
    }
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No request completed within the idle threshold.
    Idle,
    /// The graceful-shutdown budget ran out first.
    BudgetExhausted,
}

/// Poll once per second until traffic has been idle for `idle_threshold`,
/// giving up after `budget`.
pub async fn drain(lifecycle: &Lifecycle, idle_threshold: Duration, budget: Duration) -> DrainOutcome {
    let started = Instant::now();
    loop {
        let idle = lifecycle.since_last_request();
        if idle >= idle_threshold {
            info!(idle_secs = idle.as_secs_f64(), "traffic drained");
            return DrainOutcome::Idle;
        }
        info!(
            idle_secs = idle.as_secs_f64(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "waiting for traffic to drain"
        );
        if started.elapsed() > budget {
            warn!(budget_secs = budget.as_secs(), "drain budget exhausted; quitting now");
            return DrainOutcome::BudgetExhausted;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns the refresh loop and the shutdown sequence.
#[derive(Clone)]
pub struct Coordinator {
    pub settings_path: PathBuf,
    pub settings: Shared<ClientSettings>,
    pub assignment: Shared<ServerAssignment>,
    pub cache: Arc<dyn CacheStore>,
    pub control: ControlPlaneClient,
    pub lifecycle: Lifecycle,
    pub refresh_interval: Duration,
}

impl Coordinator {
    /// Run refresh ticks until draining starts.
    pub async fn run_refresh_loop(self) {
        info!(interval_secs = self.refresh_interval.as_secs(), "starting background jobs");
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let draining = self.lifecycle.draining();

        while self.lifecycle.is_running() {
            tokio::select! {
                () = draining.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                () = draining.cancelled() => {
                    info!("draining started; abandoning refresh in progress");
                    break;
                }
                _ = self.refresh_once() => {}
            }
        }
        info!("background jobs stopped");
    }

    /// One refresh tick.  Returns `true` when a new assignment was installed.
    ///
    /// Failures keep the previously held settings or assignment.
    pub async fn refresh_once(&self) -> bool {
        debug!(path = %self.settings_path.display(), "reloading client settings");
        match load_settings(&self.settings_path) {
            Ok(next) => self.settings.store(next),
            Err(e) => warn!(error = %format!("{e:#}"), "settings reload failed; keeping previous settings"),
        }

        let settings = self.settings.load();
        self.cache
            .update_cache_limit(settings.cache_limit_bytes())
            .await;
        self.cache
            .update_cache_scan_interval(settings.cache_scan_interval_in_seconds)
            .await;
        self.cache
            .update_cache_refresh_age(settings.cache_refresh_age_in_seconds)
            .await;

        match self.control.ping(&settings).await {
            Ok(next) => {
                let previous = self.assignment.load();
                if next.image_server != previous.image_server {
                    info!(
                        from = %previous.image_server,
                        to = %next.image_server,
                        "origin assignment changed"
                    );
                }
                self.assignment.store(next.inherit_tls(&previous));
                true
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "control plane re-ping failed; keeping previous assignment");
                false
            }
        }
    }

    /// Drain and deregister.  The caller exits once this returns.
    ///
    /// The graceful-shutdown budget covers the stop notice and the drain
    /// together.
    pub async fn shutdown(&self) -> DrainOutcome {
        info!("shutting down gracefully");
        let started = Instant::now();
        self.lifecycle.begin_draining();

        let settings = self.settings.load();
        let budget = Duration::from_secs(settings.graceful_shutdown_in_seconds);
        let stop_timeout = STOP_TIMEOUT.min(budget);
        match tokio::time::timeout(stop_timeout, self.control.stop(&settings.client_secret)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "failed to deregister from control plane"),
            Err(_) => warn!(timeout_ms = stop_timeout.as_millis() as u64, "deregistration timed out"),
        }

        let outcome = drain(
            &self.lifecycle,
            Duration::from_secs(settings.drain_idle_seconds),
            budget.saturating_sub(started.elapsed()),
        )
        .await;
        self.lifecycle.terminate();
        outcome
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
