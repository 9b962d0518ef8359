//! Cooperative cancellation for the blocking workflow.
//!
//! A [`Cancellation`] is a cloneable flag that every suspension point checks:
//! the start delay, the lease readiness poll, the upload body reads and the
//! keepalive period. Waits are done on a condvar so a cancel wakes sleepers
//! immediately instead of after the current interval.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ImportError, ImportResult, EXIT_INTERRUPTED};

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// A shared, cloneable cancellation flag with interruptible waits.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    /// Create a new, untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token and wake every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    /// Whether the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return [`ImportError::Cancelled`] if the token has been tripped.
    pub fn check(&self) -> ImportResult<()> {
        if self.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        Ok(())
    }

    /// Sleep for up to `timeout`, returning early if cancelled.
    ///
    /// Returns `true` if the token was tripped before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
        true
    }

    /// Like [`Self::wait_timeout`] but as a `Result`.
    pub fn sleep(&self, timeout: Duration) -> ImportResult<()> {
        if self.wait_timeout(timeout) {
            return Err(ImportError::Cancelled);
        }
        Ok(())
    }
}

/// Trip `token` when the process receives an interrupt.
///
/// The listener runs on its own thread with a current-thread tokio runtime.
/// The first interrupt only cancels, letting the main flow abort the lease
/// and log out; a second interrupt exits immediately with
/// [`EXIT_INTERRUPTED`].
pub fn install_interrupt_handler(token: Cancellation) -> std::io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("interrupt".into())
        .spawn(move || {
            rt.block_on(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for interrupts: {e}");
                    return;
                }
                eprintln!("Interrupted, cancelling import and logging off...");
                token.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    debug!("Second interrupt, exiting immediately");
                    std::process::exit(EXIT_INTERRUPTED);
                }
            })
        })?;
    Ok(())
}
