//! Inventory resolution: datacenter, cluster and datastore by name or default.

use tracing::debug;

use crate::error::{ImportError, ImportResult, InventoryKind};
use crate::plane::{ManagementPlane, MoRef};

/// A named inventory object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub name: String,
    pub moref: MoRef,
}

impl InventoryItem {
    pub fn new(kind: InventoryKind, name: impl Into<String>, moref: MoRef) -> Self {
        Self {
            kind,
            name: name.into(),
            moref,
        }
    }
}

/// Pick an item by exact name, or the first one when no name is given.
pub fn resolve<'a>(
    kind: InventoryKind,
    items: &'a [InventoryItem],
    name: Option<&str>,
) -> ImportResult<&'a InventoryItem> {
    let item = match name {
        Some(name) => items.iter().find(|i| i.name == name).ok_or_else(|| {
            ImportError::NotFound {
                kind,
                name: name.to_string(),
                candidates: items.iter().map(|i| i.name.clone()).collect(),
            }
        })?,
        None => items.first().ok_or(ImportError::EmptyInventory(kind))?,
    };
    debug!("Using {} {} ({})", item.kind, item.name, item.moref);
    Ok(item)
}

/// Names requested for each level of the placement; `None` means default.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub datacenter: Option<String>,
    pub cluster: Option<String>,
    pub datastore: Option<String>,
}

/// Where the template will be created.
#[derive(Debug, Clone)]
pub struct Placement {
    pub datacenter: InventoryItem,
    pub cluster: InventoryItem,
    pub datastore: InventoryItem,
    /// The cluster's root resource pool
    pub resource_pool: MoRef,
    /// The datacenter's VM folder
    pub vm_folder: MoRef,
}

impl Placement {
    /// Walk the inventory and resolve every level of `req`.
    pub fn resolve(plane: &dyn ManagementPlane, req: &PlacementRequest) -> ImportResult<Self> {
        let datacenters = plane.child_entities(plane.root_folder(), InventoryKind::Datacenter)?;
        let datacenter = resolve(
            InventoryKind::Datacenter,
            &datacenters,
            req.datacenter.as_deref(),
        )?
        .clone();

        let host_folder = plane.property_ref(&datacenter.moref, "hostFolder")?;
        let clusters = plane.child_entities(&host_folder, InventoryKind::Cluster)?;
        let cluster = resolve(InventoryKind::Cluster, &clusters, req.cluster.as_deref())?.clone();

        let ds_folder = plane.property_ref(&datacenter.moref, "datastoreFolder")?;
        let datastores = plane.child_entities(&ds_folder, InventoryKind::Datastore)?;
        let datastore = resolve(
            InventoryKind::Datastore,
            &datastores,
            req.datastore.as_deref(),
        )?
        .clone();

        let resource_pool = plane.property_ref(&cluster.moref, "resourcePool")?;
        let vm_folder = plane.property_ref(&datacenter.moref, "vmFolder")?;

        Ok(Self {
            datacenter,
            cluster,
            datastore,
            resource_pool,
            vm_folder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePlane;

    fn items(names: &[&str]) -> Vec<InventoryItem> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                InventoryItem::new(
                    InventoryKind::Datastore,
                    *n,
                    MoRef::new("Datastore", format!("datastore-{i}")),
                )
            })
            .collect()
    }

    #[test]
    fn test_resolve_by_name() {
        let list = items(&["datastore1", "nfs", "vsan"]);
        for (i, name) in ["datastore1", "nfs", "vsan"].iter().enumerate() {
            let found = resolve(InventoryKind::Datastore, &list, Some(name)).unwrap();
            assert_eq!(found, &list[i]);
        }
    }

    #[test]
    fn test_resolve_is_case_sensitive() {
        let list = items(&["Datastore1"]);
        let err = resolve(InventoryKind::Datastore, &list, Some("datastore1")).unwrap_err();
        assert!(matches!(err, ImportError::NotFound { .. }));
    }

    #[test]
    fn test_resolve_not_found_lists_candidates() {
        let list = items(&["datastore1", "nfs"]);
        let err = resolve(InventoryKind::Datastore, &list, Some("missing")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to find datastore 'missing' (available: datastore1, nfs)"
        );
    }

    #[test]
    fn test_resolve_named_in_empty_list() {
        let err = resolve(InventoryKind::Cluster, &[], Some("c1")).unwrap_err();
        assert_eq!(err.to_string(), "unable to find cluster 'c1' (available: none)");
    }

    #[test]
    fn test_resolve_default_is_first() {
        let list = items(&["b", "a", "c"]);
        let found = resolve(InventoryKind::Datastore, &list, None).unwrap();
        assert_eq!(found.name, "b");
    }

    #[test]
    fn test_resolve_empty_without_name() {
        let err = resolve(InventoryKind::Datacenter, &[], None).unwrap_err();
        assert!(matches!(
            err,
            ImportError::EmptyInventory(InventoryKind::Datacenter)
        ));
        assert_eq!(err.to_string(), "no datacenter found");
    }

    #[test]
    fn test_placement_defaults() {
        let plane = FakePlane::new().with_inventory();
        let p = Placement::resolve(&plane, &PlacementRequest::default()).unwrap();
        assert_eq!(p.datacenter.name, "dc1");
        assert_eq!(p.cluster.name, "cluster1");
        assert_eq!(p.datastore.name, "datastore1");
        assert_eq!(p.resource_pool, MoRef::new("ResourcePool", "resgroup-9"));
        assert_eq!(p.vm_folder, MoRef::new("Folder", "group-v4"));
    }

    #[test]
    fn test_placement_named_datastore() {
        let plane = FakePlane::new().with_inventory();
        let req = PlacementRequest {
            datastore: Some("vsanDatastore".into()),
            ..Default::default()
        };
        let p = Placement::resolve(&plane, &req).unwrap();
        assert_eq!(p.datastore.moref, MoRef::new("Datastore", "datastore-12"));
    }

    #[test]
    fn test_placement_unknown_cluster() {
        let plane = FakePlane::new().with_inventory();
        let req = PlacementRequest {
            cluster: Some("prod".into()),
            ..Default::default()
        };
        let err = Placement::resolve(&plane, &req).unwrap_err();
        assert!(matches!(
            err,
            ImportError::NotFound {
                kind: InventoryKind::Cluster,
                ..
            }
        ));
    }

    #[test]
    fn test_placement_empty_inventory() {
        let plane = FakePlane::new();
        let err = Placement::resolve(&plane, &PlacementRequest::default()).unwrap_err();
        assert!(matches!(
            err,
            ImportError::EmptyInventory(InventoryKind::Datacenter)
        ));
    }
}
