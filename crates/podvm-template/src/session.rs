//! Authenticated sessions with guaranteed logout.
//!
//! A [`Session`] owns the connected plane and logs out exactly once: either
//! through [`Session::logout`] or, failing that, on drop. Logout failures are
//! logged and never replace the outcome of the work done in the session.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ImportResult;
use crate::plane::ManagementPlane;
use crate::vim::VimClient;

/// Connection parameters for the vCenter / ESXi endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Host name or address
    pub host: String,
    /// HTTPS port
    pub port: u16,
    /// User name
    pub user: String,
    /// Password
    pub password: String,
    /// Verify the server's TLS certificate
    pub verify_ssl: bool,
    /// Per-request timeout
    pub timeout: Duration,
    /// Timeout for lease state reads and keepalive pings, which must not
    /// hold up stopping the keepalive
    pub lease_call_timeout: Duration,
}

impl ConnectionConfig {
    /// Default HTTPS port.
    pub const DEFAULT_PORT: u16 = 443;
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
    /// Default timeout for lease state reads and keepalive pings.
    pub const DEFAULT_LEASE_CALL_TIMEOUT: Duration = Duration::from_secs(20);
}

/// A logged-in session.
pub struct Session {
    plane: Arc<dyn ManagementPlane>,
    logged_out: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.plane.host())
            .field("logged_out", &self.logged_out)
            .finish()
    }
}

impl Session {
    /// Connect and authenticate against a real endpoint.
    pub fn connect(config: &ConnectionConfig) -> ImportResult<Self> {
        debug!(
            "Connecting to {}:{} as {}",
            config.host, config.port, config.user
        );
        let client = VimClient::connect(config)?;
        client.login(&config.user, &config.password)?;
        Ok(Self::from_plane(Arc::new(client)))
    }

    /// Wrap an already-authenticated plane.
    pub fn from_plane(plane: Arc<dyn ManagementPlane>) -> Self {
        Self {
            plane,
            logged_out: false,
        }
    }

    /// The plane this session talks to.
    pub fn plane(&self) -> &Arc<dyn ManagementPlane> {
        &self.plane
    }

    /// Log out now. Subsequent calls and drop do nothing.
    pub fn logout(&mut self) {
        if std::mem::replace(&mut self.logged_out, true) {
            return;
        }
        match self.plane.logout() {
            Ok(()) => debug!("Logged out of {}", self.plane.host()),
            Err(e) => warn!("Failed to log out of {}: {e}", self.plane.host()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.logout();
    }
}

/// Run `f` inside `session`, logging out afterwards regardless of outcome.
///
/// The result of `f` is returned unchanged; a logout failure only warns.
pub fn with_session<T, E>(
    mut session: Session,
    f: impl FnOnce(&Session) -> Result<T, E>,
) -> Result<T, E> {
    let r = f(&session);
    session.logout();
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;
    use crate::testutil::{Call, FakePlane};

    #[test]
    fn test_logout_once_on_success() {
        let plane = Arc::new(FakePlane::new());
        let r: Result<u32, ImportError> =
            with_session(Session::from_plane(plane.clone()), |_| Ok(7));
        assert_eq!(r.unwrap(), 7);
        assert_eq!(plane.count(&Call::Logout), 1);
    }

    #[test]
    fn test_logout_once_on_failure() {
        let plane = Arc::new(FakePlane::new());
        let r: Result<(), ImportError> = with_session(Session::from_plane(plane.clone()), |_| {
            Err(ImportError::Lease("boom".into()))
        });
        assert!(matches!(r, Err(ImportError::Lease(_))));
        assert_eq!(plane.count(&Call::Logout), 1);
    }

    #[test]
    fn test_logout_failure_does_not_mask_result() {
        let mut fake = FakePlane::new();
        fake.logout_fails = true;
        let plane = Arc::new(fake);
        let r: Result<&str, ImportError> =
            with_session(Session::from_plane(plane.clone()), |_| Ok("done"));
        assert_eq!(r.unwrap(), "done");
        assert_eq!(plane.count(&Call::Logout), 1);
    }

    #[test]
    fn test_drop_logs_out() {
        let plane = Arc::new(FakePlane::new());
        {
            let _session = Session::from_plane(plane.clone());
        }
        assert_eq!(plane.count(&Call::Logout), 1);
    }

    #[test]
    fn test_explicit_logout_then_drop() {
        let plane = Arc::new(FakePlane::new());
        let mut session = Session::from_plane(plane.clone());
        session.logout();
        session.logout();
        drop(session);
        assert_eq!(plane.count(&Call::Logout), 1);
    }
}
