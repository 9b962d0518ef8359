//! Transfer lease lifecycle.
//!
//! `ImportVApp` hands back an `HttpNfcLease`. The server expires an idle
//! lease, so while the disk is streaming a background [`KeepAlive`] thread
//! reports progress on a fixed period. [`LeaseCoordinator`] drives the local
//! state machine:
//!
//! ```text
//! REQUESTED -> READY -> TRANSFERRING -> COMPLETING -> DONE
//!     |          |           |              |
//!     +----------+-----------+--------------+--> ERROR
//!     |          |           |
//!     +----------+-----------+--> ABORTED
//! ```
//!
//! The keepalive thread is always stopped and joined before the lease is
//! completed or aborted, so no progress ping can follow either call.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::error::{ImportError, ImportResult};
use crate::plane::{DeviceUrl, ImportSpec, LeaseStatus, ManagementPlane, MoRef};
use crate::upload::{UploadTarget, Uploader};

/// Progress percentage reported by keepalive pings.
pub const KEEPALIVE_PERCENT: u8 = 50;

/// Timing knobs for the lease.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Delay between readiness polls
    pub poll_interval: Duration,
    /// Give up waiting for readiness after this long; `None` waits forever
    pub ready_timeout: Option<Duration>,
    /// Period of keepalive pings
    pub keepalive_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ready_timeout: None,
            keepalive_interval: Duration::from_secs(5),
        }
    }
}

/// Local view of the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Requested,
    Ready,
    Transferring,
    Completing,
    Done,
    Error,
    Aborted,
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Done | LeaseState::Error | LeaseState::Aborted)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaseState::Requested => "requested",
            LeaseState::Ready => "ready",
            LeaseState::Transferring => "transferring",
            LeaseState::Completing => "completing",
            LeaseState::Done => "done",
            LeaseState::Error => "error",
            LeaseState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Background progress pinger for one lease.
///
/// Each period it sends a progress ping and then reads the lease state. It
/// exits on its own when the lease is done or failed, or when a ping or
/// state read fails (the lease is assumed gone; nothing is retried). A
/// failure reported by the server is kept for [`KeepAlive::lease_error`].
#[derive(Debug)]
pub struct KeepAlive {
    stop: Cancellation,
    lease_error: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn start(
        plane: Arc<dyn ManagementPlane>,
        lease: MoRef,
        period: Duration,
    ) -> ImportResult<Self> {
        let stop = Cancellation::new();
        let lease_error = Arc::new(Mutex::new(None));
        let token = stop.clone();
        let observed = Arc::clone(&lease_error);
        let handle = std::thread::Builder::new()
            .name("lease-keepalive".into())
            .spawn(move || {
                if let Some(detail) = keepalive_loop(plane.as_ref(), &lease, period, &token) {
                    *observed.lock().unwrap_or_else(PoisonError::into_inner) = Some(detail);
                }
            })
            .map_err(|e| ImportError::Lease(format!("failed to start keepalive: {e}")))?;
        debug!("Keepalive started, period {period:?}");
        Ok(Self {
            stop,
            lease_error,
            handle: Some(handle),
        })
    }

    /// The failure detail if the keepalive saw the server fail the lease.
    pub fn lease_error(&self) -> Option<String> {
        self.lease_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("Keepalive thread panicked");
            }
            debug!("Keepalive stopped");
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns the server's failure detail if the lease went to error.
fn keepalive_loop(
    plane: &dyn ManagementPlane,
    lease: &MoRef,
    period: Duration,
    stop: &Cancellation,
) -> Option<String> {
    loop {
        if stop.wait_timeout(period) {
            return None;
        }
        if let Err(e) = plane.lease_progress(lease, KEEPALIVE_PERCENT) {
            debug!("Keepalive ping failed, lease is gone: {e}");
            return None;
        }
        match plane.lease_status(lease) {
            Ok(LeaseStatus::Error(detail)) => {
                warn!("Lease {lease} failed during transfer: {detail}");
                return Some(detail);
            }
            Ok(s) if s.is_terminal() => {
                debug!("Keepalive observed terminal lease state {s:?}");
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Keepalive could not read lease state: {e}");
                return None;
            }
        }
    }
}

/// Owns one transfer lease from request to completion or abort.
pub struct LeaseCoordinator {
    plane: Arc<dyn ManagementPlane>,
    lease: MoRef,
    config: LeaseConfig,
    cancel: Cancellation,
    state: LeaseState,
    transitions: Vec<LeaseState>,
    device_urls: Vec<DeviceUrl>,
    uploaded: bool,
    keepalive: Option<KeepAlive>,
}

impl fmt::Debug for LeaseCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCoordinator")
            .field("lease", &self.lease)
            .field("state", &self.state)
            .field("device_urls", &self.device_urls)
            .finish()
    }
}

impl LeaseCoordinator {
    /// Start the import and take ownership of the resulting lease.
    pub fn request_import(
        plane: Arc<dyn ManagementPlane>,
        spec: &ImportSpec,
        resource_pool: &MoRef,
        folder: &MoRef,
        config: LeaseConfig,
        cancel: Cancellation,
    ) -> ImportResult<Self> {
        let lease = plane.import_vapp(spec, resource_pool, folder)?;
        info!("Import requested, lease {lease}");
        Ok(Self {
            plane,
            lease,
            config,
            cancel,
            state: LeaseState::Requested,
            transitions: vec![LeaseState::Requested],
            device_urls: Vec::new(),
            uploaded: false,
            keepalive: None,
        })
    }

    pub fn lease(&self) -> &MoRef {
        &self.lease
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[LeaseState] {
        &self.transitions
    }

    /// Whether a keepalive thread is currently owned by this lease.
    #[cfg(test)]
    pub fn keepalive_running(&self) -> bool {
        self.keepalive.as_ref().is_some_and(|k| !k.is_finished())
    }

    fn transition(&mut self, to: LeaseState) {
        debug!("Lease {}: {} -> {to}", self.lease, self.state);
        self.state = to;
        self.transitions.push(to);
    }

    fn expect_state(&self, expected: LeaseState, op: &str) -> ImportResult<()> {
        if self.state != expected {
            return Err(ImportError::Lease(format!(
                "cannot {op} while lease is {}",
                self.state
            )));
        }
        Ok(())
    }

    /// Poll until the lease is ready, then start the keepalive.
    pub fn wait_ready(&mut self) -> ImportResult<&[DeviceUrl]> {
        self.expect_state(LeaseState::Requested, "wait for readiness")?;
        let started = Instant::now();
        loop {
            if let Err(e) = self.cancel.check() {
                self.abort("import cancelled while waiting for lease");
                return Err(e);
            }
            let status = match self.plane.lease_status(&self.lease) {
                Ok(s) => s,
                Err(e) => {
                    self.abort("failed to read lease state");
                    return Err(e);
                }
            };
            match status {
                LeaseStatus::Ready => break,
                LeaseStatus::Error(detail) => {
                    self.transition(LeaseState::Error);
                    return Err(ImportError::Lease(detail));
                }
                LeaseStatus::Done => {
                    self.transition(LeaseState::Error);
                    return Err(ImportError::Lease(
                        "lease finished before any data was sent".into(),
                    ));
                }
                LeaseStatus::Initializing => {}
            }
            if let Some(limit) = self.config.ready_timeout {
                if started.elapsed() >= limit {
                    self.abort("timed out waiting for lease");
                    return Err(ImportError::Lease(format!(
                        "lease not ready after {}s",
                        limit.as_secs()
                    )));
                }
            }
            if let Err(e) = self.cancel.sleep(self.config.poll_interval) {
                self.abort("import cancelled while waiting for lease");
                return Err(e);
            }
        }

        let urls = match self.plane.lease_device_urls(&self.lease) {
            Ok(u) => u,
            Err(e) => {
                self.abort("failed to read device URLs");
                return Err(e);
            }
        };
        if !urls.iter().any(|u| u.disk) {
            self.abort("no disk device URL");
            return Err(ImportError::Lease("lease has no disk device URL".into()));
        }
        self.device_urls = urls;
        self.transition(LeaseState::Ready);

        match KeepAlive::start(
            Arc::clone(&self.plane),
            self.lease.clone(),
            self.config.keepalive_interval,
        ) {
            Ok(k) => self.keepalive = Some(k),
            Err(e) => {
                self.abort("failed to start keepalive");
                return Err(e);
            }
        }
        Ok(&self.device_urls)
    }

    /// Stream `disk` to the first disk device URL.
    ///
    /// On failure the lease is aborted before the error is returned.
    pub fn transfer(&mut self, uploader: &dyn Uploader, disk: &Utf8Path) -> ImportResult<()> {
        self.expect_state(LeaseState::Ready, "upload")?;
        let device = self
            .device_urls
            .iter()
            .find(|u| u.disk)
            .ok_or_else(|| ImportError::Lease("lease has no disk device URL".into()))?;
        debug!("Disk device {} (import key {})", device.key, device.import_key);
        let url = device.url.clone();
        let target = match UploadTarget::new(disk, url) {
            Ok(t) => t,
            Err(e) => {
                self.abort(&e.to_string());
                return Err(e);
            }
        };

        self.transition(LeaseState::Transferring);
        info!("Uploading {} ({} bytes) to {}", target.path, target.len, target.url);
        let result = uploader
            .upload(&target, &self.cancel)
            .and_then(|()| self.cancel.check());
        if let Err(e) = result {
            let reason = match &e {
                ImportError::Cancelled => "import cancelled by user".to_string(),
                other => other.to_string(),
            };
            self.abort(&reason);
            return Err(e);
        }
        self.uploaded = true;
        Ok(())
    }

    /// Stop the keepalive, then tell the server the transfer is finished.
    ///
    /// A lease the server already failed is not completed; its failure
    /// detail is returned instead.
    pub fn complete(&mut self) -> ImportResult<()> {
        self.expect_state(LeaseState::Transferring, "complete")?;
        if !self.uploaded {
            return Err(ImportError::Lease(
                "cannot complete before the upload succeeded".into(),
            ));
        }
        let failure = match self.stop_keepalive() {
            Some(detail) => Some(detail),
            None => match self.plane.lease_status(&self.lease) {
                Ok(LeaseStatus::Error(detail)) => Some(detail),
                Ok(_) => None,
                Err(e) => {
                    warn!("Could not read lease state before completing: {e}");
                    None
                }
            },
        };
        if let Some(detail) = failure {
            self.transition(LeaseState::Error);
            return Err(ImportError::Lease(detail));
        }
        self.transition(LeaseState::Completing);
        if let Err(e) = self.plane.lease_complete(&self.lease) {
            self.transition(LeaseState::Error);
            return Err(e);
        }
        self.transition(LeaseState::Done);
        info!("Lease {} completed", self.lease);
        Ok(())
    }

    /// Wait for readiness, upload, and complete.
    pub fn run(&mut self, uploader: &dyn Uploader, disk: &Utf8Path) -> ImportResult<()> {
        self.wait_ready()?;
        self.transfer(uploader, disk)?;
        self.complete()
    }

    /// Abandon the lease. Does nothing once the lease is terminal.
    ///
    /// The abort call itself is best-effort.
    pub fn abort(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.stop_keepalive();
        match self.plane.lease_abort(&self.lease, reason) {
            Ok(()) => debug!("Aborted lease {}: {reason}", self.lease),
            Err(e) => warn!("Failed to abort lease {}: {e}", self.lease),
        }
        self.transition(LeaseState::Aborted);
    }

    /// Stop and join the keepalive, returning any lease failure it saw.
    fn stop_keepalive(&mut self) -> Option<String> {
        let mut k = self.keepalive.take()?;
        if k.is_finished() {
            debug!("Keepalive for {} had already exited", self.lease);
        }
        k.stop();
        k.lease_error()
    }
}

impl Drop for LeaseCoordinator {
    fn drop(&mut self) {
        self.abort("import abandoned");
    }
}
