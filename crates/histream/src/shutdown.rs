//! Two-stage graceful shutdown.
//!
//! The first signal requests a graceful stop: the shared cancellation token
//! fires, fetchers and workers wind down between iterations, and cleanup
//! hooks run. A second signal inside the force window exits immediately
//! with code 130. Registered hooks run in registration order, synchronous
//! first, then asynchronous; a failing hook is logged and skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Normal termination.
pub const EXIT_OK: i32 = 0;
/// Fatal error (unresolvable entity, unreadable session).
pub const EXIT_FATAL: i32 = 1;
/// Forced second-signal termination.
pub const EXIT_FORCED: i32 = 130;

/// Default window in which a second signal forces exit.
pub const DEFAULT_FORCE_WINDOW: Duration = Duration::from_secs(5);

/// What a signal meant, given the controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// First signal: graceful shutdown initiated.
    Graceful,
    /// Second signal inside the window: force exit.
    Forced,
    /// Second signal after the window expired: counts as a fresh graceful
    /// request.
    Restarted,
}

type SyncHook = Box<dyn FnOnce() + Send>;
type AsyncHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Coordinates shutdown across the engine.
pub struct ShutdownController {
    token: CancellationToken,
    force_window: Duration,
    first_signal: Mutex<Option<Instant>>,
    forced: AtomicBool,
    cleanup_ran: AtomicBool,
    sync_hooks: Mutex<Vec<SyncHook>>,
    async_hooks: Mutex<Vec<AsyncHook>>,
}

impl ShutdownController {
    pub fn new(force_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            force_window,
            first_signal: Mutex::new(None),
            forced: AtomicBool::new(false),
            cleanup_ran: AtomicBool::new(false),
            sync_hooks: Mutex::new(Vec::new()),
            async_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Token observed by fetchers and workers between iterations.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Relaxed)
    }

    /// Registers a synchronous cleanup hook.
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        self.sync_hooks.lock().push(Box::new(hook));
    }

    /// Registers an asynchronous cleanup hook.
    pub fn on_shutdown_async<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.async_hooks
            .lock()
            .push(Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(hook())
            }));
    }

    /// Applies one signal to the two-stage state machine.
    pub fn handle_signal(&self) -> SignalOutcome {
        let mut first = self.first_signal.lock();
        match *first {
            None => {
                *first = Some(Instant::now());
                self.token.cancel();
                tracing::info!(
                    window_secs = self.force_window.as_secs(),
                    "graceful shutdown requested, signal again to force"
                );
                SignalOutcome::Graceful
            }
            Some(at) if at.elapsed() < self.force_window => {
                self.forced.store(true, Ordering::Relaxed);
                tracing::warn!("force shutdown requested");
                SignalOutcome::Forced
            }
            Some(_) => {
                *first = Some(Instant::now());
                tracing::info!("force window expired, restarting graceful shutdown");
                SignalOutcome::Restarted
            }
        }
    }

    /// Installs the process signal handlers: listens for interrupt (and
    /// SIGTERM on unix) and applies the two-stage logic. A forced signal
    /// exits the process with [`EXIT_FORCED`].
    pub fn install(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                wait_for_signal().await;
                if controller.handle_signal() == SignalOutcome::Forced {
                    std::process::exit(EXIT_FORCED);
                }
            }
        });
    }

    /// Runs all registered hooks once: sync hooks first, then async hooks,
    /// each in registration order. Safe to call twice; the second call is a
    /// no-op. A call before shutdown was requested does nothing.
    pub async fn run_graceful_cleanup(&self) {
        if !self.is_requested() {
            tracing::debug!("cleanup called without shutdown request, skipping");
            return;
        }
        if self.cleanup_ran.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("running graceful cleanup");

        let sync_hooks = std::mem::take(&mut *self.sync_hooks.lock());
        for hook in sync_hooks {
            hook();
        }
        let async_hooks = std::mem::take(&mut *self.async_hooks.lock());
        for hook in async_hooks {
            hook().await;
        }
        tracing::info!("graceful cleanup finished");
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
