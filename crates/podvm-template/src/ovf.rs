//! OVF descriptor generation
//!
//! Produces a minimal OVF 1.0 envelope for a single stream-optimized VMDK:
//! one virtual system with CPU, memory, an LSI Logic SCSI controller and the
//! disk. vCenter turns this into an import spec.

use indoc::formatdoc;
use quick_xml::escape::escape;

use crate::error::{ImportError, ImportResult};

/// Disk format URI for stream-optimized VMDKs.
pub const STREAM_OPTIMIZED_FORMAT: &str =
    "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized";

/// Builder for OVF descriptors
#[derive(Debug, Default)]
pub struct OvfBuilder {
    name: Option<String>,
    disk_file: Option<String>,
    capacity: Option<u64>,
    populated_size: Option<u64>,
    memory: Option<u64>, // in MB
    vcpus: Option<u32>,
    os_type: Option<String>,
    hardware_version: Option<String>,
}

impl OvfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the virtual system name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set the VMDK file name, relative to the descriptor
    pub fn with_disk_file(mut self, file: &str) -> Self {
        self.disk_file = Some(file.to_string());
        self
    }

    /// Set the disk's virtual size in bytes
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Set the bytes actually used by the disk file
    pub fn with_populated_size(mut self, bytes: u64) -> Self {
        self.populated_size = Some(bytes);
        self
    }

    /// Set memory in MB
    pub fn with_memory(mut self, memory_mb: u64) -> Self {
        self.memory = Some(memory_mb);
        self
    }

    /// Set number of vCPUs
    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = Some(vcpus);
        self
    }

    /// Set the VMware guest OS identifier
    pub fn with_os_type(mut self, os_type: &str) -> Self {
        self.os_type = Some(os_type.to_string());
        self
    }

    /// Set the virtual hardware family, e.g. `vmx-13`
    pub fn with_hardware_version(mut self, version: &str) -> Self {
        self.hardware_version = Some(version.to_string());
        self
    }

    /// Build the descriptor text
    pub fn build_xml(self) -> ImportResult<String> {
        let name = self
            .name
            .ok_or_else(|| ImportError::InvalidDescriptor("template name is required".into()))?;
        let disk_file = self
            .disk_file
            .ok_or_else(|| ImportError::InvalidDescriptor("disk file is required".into()))?;
        let capacity = self
            .capacity
            .ok_or_else(|| ImportError::InvalidDescriptor("disk capacity is required".into()))?;
        let populated = self.populated_size.unwrap_or(capacity);
        let memory = self.memory.unwrap_or(2048);
        let vcpus = self.vcpus.unwrap_or(2);
        let os_type = self.os_type.as_deref().unwrap_or("otherLinux64Guest");
        let hw = self.hardware_version.as_deref().unwrap_or("vmx-13");
        let name = escape(name.as_str());
        let disk_file = escape(disk_file.as_str());

        Ok(formatdoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1" xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData" xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData" xmlns:vmw="http://www.vmware.com/schema/ovf" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
              <References>
                <File ovf:href="{disk_file}" ovf:id="file1" ovf:size="{populated}"/>
              </References>
              <DiskSection>
                <Info>Virtual disk information</Info>
                <Disk ovf:capacity="{capacity}" ovf:capacityAllocationUnits="byte" ovf:diskId="vmdisk1" ovf:fileRef="file1" ovf:format="{STREAM_OPTIMIZED_FORMAT}" ovf:populatedSize="{populated}"/>
              </DiskSection>
              <VirtualSystem ovf:id="{name}">
                <Info>A virtual machine</Info>
                <Name>{name}</Name>
                <OperatingSystemSection ovf:id="101" vmw:osType="{os_type}">
                  <Info>The kind of installed guest operating system</Info>
                </OperatingSystemSection>
                <VirtualHardwareSection>
                  <Info>Virtual hardware requirements</Info>
                  <System>
                    <vssd:ElementName>Virtual Hardware Family</vssd:ElementName>
                    <vssd:InstanceID>0</vssd:InstanceID>
                    <vssd:VirtualSystemIdentifier>{name}</vssd:VirtualSystemIdentifier>
                    <vssd:VirtualSystemType>{hw}</vssd:VirtualSystemType>
                  </System>
                  <Item>
                    <rasd:AllocationUnits>hertz * 10^6</rasd:AllocationUnits>
                    <rasd:Description>Number of Virtual CPUs</rasd:Description>
                    <rasd:ElementName>{vcpus} virtual CPU(s)</rasd:ElementName>
                    <rasd:InstanceID>1</rasd:InstanceID>
                    <rasd:ResourceType>3</rasd:ResourceType>
                    <rasd:VirtualQuantity>{vcpus}</rasd:VirtualQuantity>
                  </Item>
                  <Item>
                    <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
                    <rasd:Description>Memory Size</rasd:Description>
                    <rasd:ElementName>{memory}MB of memory</rasd:ElementName>
                    <rasd:InstanceID>2</rasd:InstanceID>
                    <rasd:ResourceType>4</rasd:ResourceType>
                    <rasd:VirtualQuantity>{memory}</rasd:VirtualQuantity>
                  </Item>
                  <Item>
                    <rasd:Address>0</rasd:Address>
                    <rasd:Description>SCSI Controller</rasd:Description>
                    <rasd:ElementName>SCSI Controller 0</rasd:ElementName>
                    <rasd:InstanceID>3</rasd:InstanceID>
                    <rasd:ResourceSubType>lsilogic</rasd:ResourceSubType>
                    <rasd:ResourceType>6</rasd:ResourceType>
                  </Item>
                  <Item>
                    <rasd:AddressOnParent>0</rasd:AddressOnParent>
                    <rasd:ElementName>Hard Disk 1</rasd:ElementName>
                    <rasd:HostResource>ovf:/disk/vmdisk1</rasd:HostResource>
                    <rasd:InstanceID>4</rasd:InstanceID>
                    <rasd:Parent>3</rasd:Parent>
                    <rasd:ResourceType>17</rasd:ResourceType>
                  </Item>
                </VirtualHardwareSection>
              </VirtualSystem>
            </Envelope>
        "#})
    }
}
