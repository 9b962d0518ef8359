//! Import spec construction.

use tracing::{debug, warn};

use crate::error::{ImportError, ImportResult};
use crate::plane::{ImportSpec, ManagementPlane, MoRef};

/// Ask the server to turn an OVF descriptor into an import spec.
///
/// Empty descriptors are rejected without a round trip. Server warnings are
/// logged and kept on the returned spec.
pub fn build(
    plane: &dyn ManagementPlane,
    descriptor: &str,
    resource_pool: &MoRef,
    datastore: &MoRef,
    entity_name: &str,
) -> ImportResult<ImportSpec> {
    if descriptor.trim().is_empty() {
        return Err(ImportError::InvalidDescriptor("descriptor is empty".into()));
    }
    debug!("Creating import spec for {entity_name} on {datastore}");
    let spec = plane.create_import_spec(descriptor, resource_pool, datastore, entity_name)?;
    for w in &spec.warnings {
        warn!("Import spec warning: {w}");
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Call, FakePlane};

    fn pool() -> MoRef {
        MoRef::new("ResourcePool", "resgroup-9")
    }

    fn ds() -> MoRef {
        MoRef::new("Datastore", "datastore-11")
    }

    #[test]
    fn test_empty_descriptor_rejected_locally() {
        let plane = FakePlane::new();
        let err = build(&plane, "  \n", &pool(), &ds(), "podvm-base").unwrap_err();
        assert!(matches!(err, ImportError::InvalidDescriptor(_)));
        assert!(plane.calls().is_empty());
    }

    #[test]
    fn test_build_passes_entity_name() {
        let plane = FakePlane::new();
        let spec = build(&plane, "<Envelope/>", &pool(), &ds(), "podvm-base").unwrap();
        assert_eq!(spec.spec.xsi_type(), Some("VirtualMachineImportSpec"));
        assert_eq!(spec.warnings.len(), 1);
        assert_eq!(
            plane.calls(),
            vec![Call::CreateImportSpec("podvm-base".into())]
        );
    }

    #[test]
    fn test_server_errors_are_invalid_descriptor() {
        let mut plane = FakePlane::new();
        plane.import_spec_errors = vec!["Line 3: Unsupported element 'Foo'".into()];
        let err = build(&plane, "<Envelope/>", &pool(), &ds(), "t").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid OVF descriptor: Line 3: Unsupported element 'Foo'"
        );
    }
}
