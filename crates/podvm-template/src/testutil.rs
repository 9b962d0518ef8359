//! In-memory management plane for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::Cancellation;
use crate::error::{ImportError, ImportResult, InventoryKind};
use crate::inventory::InventoryItem;
use crate::plane::{DeviceUrl, ImportSpec, LeaseStatus, ManagementPlane, MoRef};
use crate::upload::{UploadTarget, Uploader};
use crate::vim::xml::Element;

/// A recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreateImportSpec(String),
    ImportVApp,
    Status,
    DeviceUrls,
    Progress(u8),
    Complete,
    Abort(String),
    Logout,
    Upload(String),
}

pub(crate) struct FakePlane {
    root: MoRef,
    children: HashMap<MoRef, Vec<InventoryItem>>,
    refs: HashMap<(MoRef, String), MoRef>,
    statuses: Mutex<VecDeque<LeaseStatus>>,
    device_urls: Vec<DeviceUrl>,
    pub(crate) import_spec_errors: Vec<String>,
    pub(crate) status_fails: AtomicBool,
    pub(crate) progress_fails: AtomicBool,
    pub(crate) logout_fails: bool,
    calls: Mutex<Vec<Call>>,
}

pub(crate) fn lease_ref() -> MoRef {
    MoRef::new("HttpNfcLease", "session[52f1]52f3")
}

impl FakePlane {
    /// A plane whose lease is ready immediately with one disk URL.
    pub(crate) fn new() -> Self {
        Self {
            root: MoRef::new("Folder", "group-d1"),
            children: HashMap::new(),
            refs: HashMap::new(),
            statuses: Mutex::new(VecDeque::from([LeaseStatus::Ready])),
            device_urls: vec![DeviceUrl {
                key: "/vm-101/VirtualLsiLogicController0:0".into(),
                import_key: "/podvm-base/VirtualLsiLogicController0:0".into(),
                url: "https://host/disk-0".into(),
                disk: true,
            }],
            import_spec_errors: Vec::new(),
            status_fails: AtomicBool::new(false),
            progress_fails: AtomicBool::new(false),
            logout_fails: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Lease states returned by successive polls; the last one repeats.
    pub(crate) fn with_statuses(self, statuses: impl IntoIterator<Item = LeaseStatus>) -> Self {
        *self.statuses.lock().unwrap() = statuses.into_iter().collect();
        self
    }

    /// Replace the lease state seen by subsequent polls.
    pub(crate) fn set_status(&self, status: LeaseStatus) {
        *self.statuses.lock().unwrap() = VecDeque::from([status]);
    }

    pub(crate) fn with_children(mut self, folder: &MoRef, items: Vec<InventoryItem>) -> Self {
        self.children.insert(folder.clone(), items);
        self
    }

    pub(crate) fn with_ref(mut self, obj: &MoRef, property: &str, target: MoRef) -> Self {
        self.refs.insert((obj.clone(), property.to_string()), target);
        self
    }

    /// A standard single-datacenter inventory.
    pub(crate) fn with_inventory(self) -> Self {
        let dc = MoRef::new("Datacenter", "datacenter-3");
        let hosts = MoRef::new("Folder", "group-h5");
        let stores = MoRef::new("Folder", "group-s6");
        let vms = MoRef::new("Folder", "group-v4");
        let cluster = MoRef::new("ClusterComputeResource", "domain-c8");
        let root = self.root.clone();
        self.with_children(
            &root,
            vec![InventoryItem::new(InventoryKind::Datacenter, "dc1", dc.clone())],
        )
        .with_ref(&dc, "hostFolder", hosts.clone())
        .with_ref(&dc, "datastoreFolder", stores.clone())
        .with_ref(&dc, "vmFolder", vms)
        .with_children(
            &hosts,
            vec![InventoryItem::new(InventoryKind::Cluster, "cluster1", cluster.clone())],
        )
        .with_children(
            &stores,
            vec![
                InventoryItem::new(
                    InventoryKind::Datastore,
                    "datastore1",
                    MoRef::new("Datastore", "datastore-11"),
                ),
                InventoryItem::new(
                    InventoryKind::Datastore,
                    "vsanDatastore",
                    MoRef::new("Datastore", "datastore-12"),
                ),
            ],
        )
        .with_ref(&cluster, "resourcePool", MoRef::new("ResourcePool", "resgroup-9"))
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub(crate) fn progress_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Progress(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ManagementPlane for FakePlane {
    fn host(&self) -> &str {
        "vc.example.com"
    }

    fn root_folder(&self) -> &MoRef {
        &self.root
    }

    fn child_entities(&self, folder: &MoRef, _: InventoryKind) -> ImportResult<Vec<InventoryItem>> {
        Ok(self.children.get(folder).cloned().unwrap_or_default())
    }

    fn property_ref(&self, obj: &MoRef, property: &str) -> ImportResult<MoRef> {
        self.refs
            .get(&(obj.clone(), property.to_string()))
            .cloned()
            .ok_or_else(|| ImportError::Protocol(format!("{obj} has no {property}")))
    }

    fn create_import_spec(
        &self,
        _descriptor: &str,
        _resource_pool: &MoRef,
        _datastore: &MoRef,
        entity_name: &str,
    ) -> ImportResult<ImportSpec> {
        self.record(Call::CreateImportSpec(entity_name.to_string()));
        if !self.import_spec_errors.is_empty() {
            return Err(ImportError::InvalidDescriptor(self.import_spec_errors.join("; ")));
        }
        let mut spec = Element::new("importSpec");
        spec.attrs
            .push(("xsi:type".into(), "VirtualMachineImportSpec".into()));
        Ok(ImportSpec {
            spec,
            warnings: vec!["Line 12: Unsupported hardware family 'vmx-14'.".into()],
        })
    }

    fn import_vapp(&self, _: &ImportSpec, _: &MoRef, _: &MoRef) -> ImportResult<MoRef> {
        self.record(Call::ImportVApp);
        Ok(lease_ref())
    }

    fn lease_status(&self, _: &MoRef) -> ImportResult<LeaseStatus> {
        self.record(Call::Status);
        if self.status_fails.load(Ordering::SeqCst) {
            return Err(ImportError::Network("connection refused".into()));
        }
        let mut q = self.statuses.lock().unwrap();
        let status = if q.len() > 1 {
            q.pop_front()
        } else {
            q.front().cloned()
        };
        Ok(status.unwrap_or(LeaseStatus::Initializing))
    }

    fn lease_device_urls(&self, _: &MoRef) -> ImportResult<Vec<DeviceUrl>> {
        self.record(Call::DeviceUrls);
        Ok(self.device_urls.clone())
    }

    fn lease_progress(&self, _: &MoRef, percent: u8) -> ImportResult<()> {
        self.record(Call::Progress(percent));
        if self.progress_fails.load(Ordering::SeqCst) {
            return Err(ImportError::Network("connection reset".into()));
        }
        Ok(())
    }

    fn lease_complete(&self, _: &MoRef) -> ImportResult<()> {
        self.record(Call::Complete);
        self.set_status(LeaseStatus::Done);
        Ok(())
    }

    fn lease_abort(&self, _: &MoRef, reason: &str) -> ImportResult<()> {
        self.record(Call::Abort(reason.to_string()));
        self.set_status(LeaseStatus::Error(reason.to_string()));
        Ok(())
    }

    fn logout(&self) -> ImportResult<()> {
        self.record(Call::Logout);
        if self.logout_fails {
            return Err(ImportError::Network("connection reset".into()));
        }
        Ok(())
    }
}

/// Uploader that records into a [`FakePlane`]'s call log.
pub(crate) struct FakeUploader {
    plane: Arc<FakePlane>,
    pub(crate) duration: Duration,
    pub(crate) fail: Option<String>,
    /// Trip the token halfway through, like an interrupt would
    pub(crate) interrupt: bool,
}

impl FakeUploader {
    pub(crate) fn new(plane: Arc<FakePlane>) -> Self {
        Self {
            plane,
            duration: Duration::ZERO,
            fail: None,
            interrupt: false,
        }
    }
}

impl Uploader for FakeUploader {
    fn upload(&self, target: &UploadTarget, cancel: &Cancellation) -> ImportResult<()> {
        self.plane.record(Call::Upload(target.url.clone()));
        if self.interrupt {
            std::thread::sleep(self.duration / 2);
            cancel.cancel();
        }
        cancel.sleep(self.duration)?;
        match &self.fail {
            Some(msg) => Err(ImportError::Transfer(msg.clone())),
            None => Ok(()),
        }
    }
}
