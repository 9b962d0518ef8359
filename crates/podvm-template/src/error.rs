//! Error taxonomy for the template import workflow.
//!
//! Every failure the workflow can hit maps onto one [`ImportError`] variant.
//! Orchestration code wraps these in `color_eyre` reports to name the
//! failing stage; `main` inspects the root cause to pick the exit status.

use std::fmt;

/// Process exit status for any failed run.
pub const EXIT_FAILURE: i32 = 1;

/// Process exit status when the user interrupts the run (128 + SIGINT).
pub const EXIT_INTERRUPTED: i32 = 130;

/// Kind of inventory object being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryKind {
    /// A datacenter under the root folder
    Datacenter,
    /// A compute cluster under a datacenter's host folder
    Cluster,
    /// A datastore under a datacenter's datastore folder
    Datastore,
}

impl fmt::Display for InventoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InventoryKind::Datacenter => "datacenter",
            InventoryKind::Cluster => "cluster",
            InventoryKind::Datastore => "datastore",
        };
        f.write_str(s)
    }
}

/// Errors raised while importing a template.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The management endpoint rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The management endpoint could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// A named inventory object does not exist.
    #[error("unable to find {kind} '{name}' (available: {})", format_candidates(.candidates))]
    NotFound {
        /// What was being looked up
        kind: InventoryKind,
        /// The requested name
        name: String,
        /// Names that were present
        candidates: Vec<String>,
    },

    /// No name was given and the inventory list is empty.
    #[error("no {0} found")]
    EmptyInventory(InventoryKind),

    /// The server could not build an import spec from the descriptor.
    #[error("invalid OVF descriptor: {0}")]
    InvalidDescriptor(String),

    /// The server reported the transfer lease as failed.
    #[error("lease error: {0}")]
    Lease(String),

    /// Streaming the disk image failed.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// The external image converter failed.
    #[error("image conversion failed: {0}")]
    Conversion(String),

    /// The server replied with a fault or something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The run was cancelled by the user.
    #[error("cancelled by user")]
    Cancelled,
}

fn format_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        return "none".to_string();
    }
    candidates.join(", ")
}

impl ImportError {
    /// Exit status for a run that failed with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ImportError::Cancelled => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<quick_xml::Error> for ImportError {
    fn from(e: quick_xml::Error) -> Self {
        ImportError::Protocol(format!("malformed XML: {e}"))
    }
}

/// Pick the process exit status for a failed run.
///
/// Walks the report chain looking for an [`ImportError`]; anything else is
/// a plain failure.
pub fn exit_code_for(report: &color_eyre::Report) -> i32 {
    report
        .chain()
        .find_map(|e| e.downcast_ref::<ImportError>())
        .map(ImportError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}

/// Convenience alias for results carrying an [`ImportError`].
pub type ImportResult<T> = Result<T, ImportError>;
