//! The management-plane seam.
//!
//! Everything the workflow asks of vCenter goes through [`ManagementPlane`]:
//! inventory reads, the import-spec call, the import call that yields a
//! lease, lease polling/keepalive/finalization and logout. The production
//! implementation is [`crate::vim::VimClient`]; tests substitute fakes.

use std::fmt;

use crate::error::{ImportResult, InventoryKind};
use crate::inventory::InventoryItem;
use crate::vim::xml::Element;

/// Reference to a remote managed object, e.g. `Datacenter:datacenter-3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MoRef {
    /// Managed object type
    pub r#type: String,
    /// Server-assigned identifier
    pub value: String,
}

impl MoRef {
    /// Create a reference from a type and value.
    pub fn new(r#type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for MoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.r#type, self.value)
    }
}

/// Server-computed plan for materializing a template.
///
/// The spec itself is opaque to us; it is kept as the element returned by
/// `CreateImportSpec` (including its `xsi:type`) and handed back verbatim
/// to `ImportVApp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    /// The `importSpec` element from the server
    pub spec: Element,
    /// Non-fatal warnings reported alongside the spec
    pub warnings: Vec<String>,
}

/// Lease state as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The server is still preparing the import
    Initializing,
    /// Device URLs are available
    Ready,
    /// The lease has been completed
    Done,
    /// The lease failed; carries the server-provided detail
    Error(String),
}

impl LeaseStatus {
    /// Whether the lease can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeaseStatus::Done | LeaseStatus::Error(_))
    }
}

/// Upload endpoint for one virtual disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUrl {
    /// Device key of the disk
    pub key: String,
    /// Key matching the import spec's file item
    pub import_key: String,
    /// Upload URL, with any wildcard host already substituted
    pub url: String,
    /// Whether this device is a disk
    pub disk: bool,
}

/// Remote operations used by the import workflow.
///
/// Implementations must be shareable across threads: the keepalive task
/// pings the lease while the main flow is uploading.
pub trait ManagementPlane: Send + Sync {
    /// Host name the session is connected to.
    fn host(&self) -> &str;

    /// The root inventory folder.
    fn root_folder(&self) -> &MoRef;

    /// Named children of a folder, tagged with the expected kind.
    fn child_entities(&self, folder: &MoRef, kind: InventoryKind)
        -> ImportResult<Vec<InventoryItem>>;

    /// Read a property that holds a single managed object reference.
    fn property_ref(&self, obj: &MoRef, property: &str) -> ImportResult<MoRef>;

    /// Ask the server to build an import spec from an OVF descriptor.
    fn create_import_spec(
        &self,
        descriptor: &str,
        resource_pool: &MoRef,
        datastore: &MoRef,
        entity_name: &str,
    ) -> ImportResult<ImportSpec>;

    /// Start the import; returns the transfer lease.
    fn import_vapp(
        &self,
        spec: &ImportSpec,
        resource_pool: &MoRef,
        folder: &MoRef,
    ) -> ImportResult<MoRef>;

    /// Current lease state.
    fn lease_status(&self, lease: &MoRef) -> ImportResult<LeaseStatus>;

    /// Device URLs of a ready lease.
    fn lease_device_urls(&self, lease: &MoRef) -> ImportResult<Vec<DeviceUrl>>;

    /// Keepalive progress ping.
    fn lease_progress(&self, lease: &MoRef, percent: u8) -> ImportResult<()>;

    /// Signal that all uploads finished.
    fn lease_complete(&self, lease: &MoRef) -> ImportResult<()>;

    /// Abandon the lease.
    fn lease_abort(&self, lease: &MoRef, reason: &str) -> ImportResult<()>;

    /// End the session.
    fn logout(&self) -> ImportResult<()>;
}
