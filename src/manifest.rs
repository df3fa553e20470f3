// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Static VM configuration read from the `hypervisor` node of a device tree.
//!
//! ```text
//! hypervisor {
//!     compatible = "hafnium,hafnium";
//!     vm1 {
//!         debug_name = "primary";
//!         kernel_filename = "vmlinuz";
//!     };
//!     vm2 {
//!         debug_name = "secondary";
//!         mem_size = <0x0 0x100000>;
//!         vcpu_count = <2>;
//!     };
//! };
//! ```
//!
//! Node `vmN` describes the VM with id `N`. Nodes are read from `vm1` up to
//! the first missing one; `vm1` is the primary VM.

use arrayvec::{ArrayString, ArrayVec};
use axerrno::AxError;
use thiserror::Error;

use crate::config::{
    VCpuCount, VmId, MANIFEST_COMPATIBLE, MANIFEST_NAME_MAX_SIZE, MAX_VMS, PRIMARY_VM_ID,
    VM_ID_OFFSET,
};

/// Why a manifest was rejected. Any of these is fatal to boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("Manifest is not a valid device tree blob")]
    InvalidFdt,
    #[error("Could not find \"hypervisor\" node in manifest")]
    NoHypervisorFdtNode,
    #[error("Hypervisor manifest entry not compatible with this hypervisor")]
    NotCompatible,
    #[error("Manifest defines a VM with a reserved ID")]
    ReservedVmId,
    #[error("Manifest does not contain a primary VM entry")]
    NoPrimaryVm,
    #[error("Manifest specifies more VMs than there is statically allocated space for")]
    TooManyVms,
    #[error("Property not found")]
    PropertyNotFound,
    #[error("Malformed string property")]
    MalformedString,
    #[error("String too long")]
    StringTooLong,
    #[error("Malformed string list property")]
    MalformedStringList,
    #[error("Malformed integer property")]
    MalformedInteger,
    #[error("Integer overflow")]
    IntegerOverflow,
}

impl From<ManifestError> for AxError {
    fn from(_: ManifestError) -> Self {
        AxError::InvalidData
    }
}

type ManifestResult<T> = Result<T, ManifestError>;

/// A device tree node, as much of it as the manifest parser needs.
pub trait ManifestNode: Sized {
    /// Returns the direct child called exactly `name`.
    fn find_child(&self, name: &str) -> Option<Self>;

    /// Returns the raw value of property `name`.
    fn read_property(&self, name: &str) -> Option<&[u8]>;
}

impl<'b, 'a: 'b> ManifestNode for fdt::node::FdtNode<'b, 'a> {
    fn find_child(&self, name: &str) -> Option<Self> {
        self.children().find(|child| child.name == name)
    }

    fn read_property(&self, name: &str) -> Option<&[u8]> {
        self.property(name).map(|prop| prop.value)
    }
}

/// Configuration specific to secondary VMs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecondaryVm {
    /// Memory given to the VM, in bytes.
    pub mem_size: u64,
    /// Number of vcpus of the VM.
    pub vcpu_count: VCpuCount,
}

/// One VM of the manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestVm {
    /// Id the VM will be created with.
    pub id: VmId,
    /// Name used in diagnostics.
    pub debug_name: ArrayString<MANIFEST_NAME_MAX_SIZE>,
    /// Name of the kernel image, if any.
    pub kernel_filename: Option<ArrayString<MANIFEST_NAME_MAX_SIZE>>,
    /// `None` for the primary VM, whose resources are those of the machine.
    pub secondary: Option<SecondaryVm>,
}

/// The parsed manifest.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    vms: ArrayVec<ManifestVm, MAX_VMS>,
}

impl Manifest {
    /// Parses the manifest from a flattened device tree blob.
    pub fn from_fdt(blob: &[u8]) -> ManifestResult<Self> {
        let fdt = fdt::Fdt::new(blob).map_err(|_| ManifestError::InvalidFdt)?;
        let root = fdt.find_node("/").ok_or(ManifestError::InvalidFdt)?;
        Self::parse(&root)
    }

    /// Parses the manifest below the device tree root node `root`.
    ///
    /// Nothing is returned unless the whole manifest is valid.
    pub fn parse<N: ManifestNode>(root: &N) -> ManifestResult<Self> {
        let hyp_node = root
            .find_child("hypervisor")
            .ok_or(ManifestError::NoHypervisorFdtNode)?;

        if !read_stringlist(&hyp_node, "compatible")?
            .any(|entry| entry == MANIFEST_COMPATIBLE.as_bytes())
        {
            return Err(ManifestError::NotCompatible);
        }

        for vm_id in 0..VM_ID_OFFSET {
            if hyp_node.find_child(&vm_node_name(vm_id)).is_some() {
                return Err(ManifestError::ReservedVmId);
            }
        }

        let mut manifest = Manifest::default();
        let mut found_primary_vm = false;
        for i in 0..=MAX_VMS {
            let vm_id = VM_ID_OFFSET + i as VmId;
            let Some(vm_node) = hyp_node.find_child(&vm_node_name(vm_id)) else {
                break;
            };
            if i == MAX_VMS {
                return Err(ManifestError::TooManyVms);
            }
            if vm_id == PRIMARY_VM_ID {
                assert!(!found_primary_vm);
                found_primary_vm = true;
            }
            manifest.vms.push(parse_vm(&vm_node, vm_id)?);
        }

        if !found_primary_vm {
            return Err(ManifestError::NoPrimaryVm);
        }
        Ok(manifest)
    }

    /// Number of VMs, primary included.
    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    /// The VMs in id order; the first one is the primary.
    pub fn vms(&self) -> &[ManifestVm] {
        &self.vms
    }
}

fn vm_node_name(vm_id: VmId) -> alloc::string::String {
    format!("vm{}", vm_id)
}

fn parse_vm<N: ManifestNode>(node: &N, vm_id: VmId) -> ManifestResult<ManifestVm> {
    let debug_name = read_string(node, "debug_name")?;
    let kernel_filename = match node.read_property("kernel_filename") {
        Some(data) => Some(extract_string(data)?),
        None => None,
    };
    let secondary = if vm_id != PRIMARY_VM_ID {
        Some(SecondaryVm {
            mem_size: read_u64(node, "mem_size")?,
            vcpu_count: read_u16(node, "vcpu_count")?,
        })
    } else {
        None
    };
    Ok(ManifestVm {
        id: vm_id,
        debug_name,
        kernel_filename,
        secondary,
    })
}

/// Requires exactly one NUL, as the last byte, and room for it in the output.
fn extract_string(data: &[u8]) -> ManifestResult<ArrayString<MANIFEST_NAME_MAX_SIZE>> {
    let Some((&0, content)) = data.split_last() else {
        return Err(ManifestError::MalformedString);
    };
    if content.contains(&0) {
        return Err(ManifestError::MalformedString);
    }
    if data.len() > MANIFEST_NAME_MAX_SIZE {
        return Err(ManifestError::StringTooLong);
    }
    let content = core::str::from_utf8(content).map_err(|_| ManifestError::MalformedString)?;
    ArrayString::from(content).map_err(|_| ManifestError::StringTooLong)
}

fn read_string<N: ManifestNode>(
    node: &N,
    property: &str,
) -> ManifestResult<ArrayString<MANIFEST_NAME_MAX_SIZE>> {
    let data = node
        .read_property(property)
        .ok_or(ManifestError::PropertyNotFound)?;
    extract_string(data)
}

/// Returns the NUL-separated entries of a string list property.
fn read_stringlist<'n, N: ManifestNode>(
    node: &'n N,
    property: &str,
) -> ManifestResult<impl Iterator<Item = &'n [u8]>> {
    let data = node
        .read_property(property)
        .ok_or(ManifestError::PropertyNotFound)?;
    let Some((&0, entries)) = data.split_last() else {
        return Err(ManifestError::MalformedStringList);
    };
    Ok(entries.split(|&b| b == 0))
}

/// Integers are one or two big-endian 32-bit cells.
fn read_u64<N: ManifestNode>(node: &N, property: &str) -> ManifestResult<u64> {
    let data = node
        .read_property(property)
        .ok_or(ManifestError::PropertyNotFound)?;
    if let Ok(cell) = <[u8; 4]>::try_from(data) {
        Ok(u32::from_be_bytes(cell) as u64)
    } else if let Ok(cells) = <[u8; 8]>::try_from(data) {
        Ok(u64::from_be_bytes(cells))
    } else {
        Err(ManifestError::MalformedInteger)
    }
}

fn read_u16<N: ManifestNode>(node: &N, property: &str) -> ManifestResult<u16> {
    let value = read_u64(node, property)?;
    u16::try_from(value).map_err(|_| ManifestError::IntegerOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Prop(&'static [u8]);

    impl ManifestNode for Prop {
        fn find_child(&self, _name: &str) -> Option<Self> {
            None
        }

        fn read_property(&self, name: &str) -> Option<&[u8]> {
            (name == "p").then_some(self.0)
        }
    }

    #[test]
    fn test_extract_string() {
        assert_eq!(extract_string(b"linux\0").unwrap().as_str(), "linux");
        assert_eq!(extract_string(b"\0").unwrap().as_str(), "");
        assert_eq!(extract_string(b""), Err(ManifestError::MalformedString));
        assert_eq!(extract_string(b"linux"), Err(ManifestError::MalformedString));
        assert_eq!(extract_string(b"li\0nux\0"), Err(ManifestError::MalformedString));
        assert_eq!(
            extract_string(b"this-name-is-exactly-32-bytes-xx\0"),
            Err(ManifestError::StringTooLong)
        );
        assert!(extract_string(b"this-name-fits-in-31-bytes-xxxx\0").is_ok());
    }

    #[test]
    fn test_read_integers() {
        assert_eq!(read_u64(&Prop(&[0, 0, 0x12, 0x34]), "p"), Ok(0x1234));
        assert_eq!(
            read_u64(&Prop(&[0, 0, 0, 1, 0, 0, 0, 2]), "p"),
            Ok(0x1_0000_0002)
        );
        assert_eq!(
            read_u64(&Prop(&[0, 1]), "p"),
            Err(ManifestError::MalformedInteger)
        );
        assert_eq!(
            read_u64(&Prop(&[0, 1]), "q"),
            Err(ManifestError::PropertyNotFound)
        );
        assert_eq!(read_u16(&Prop(&[0, 0, 0xff, 0xff]), "p"), Ok(0xffff));
        assert_eq!(
            read_u16(&Prop(&[0, 1, 0, 0]), "p"),
            Err(ManifestError::IntegerOverflow)
        );
    }

    #[test]
    fn test_read_stringlist() {
        let node = Prop(b"foo,bar\0hafnium,hafnium\0");
        let entries: alloc::vec::Vec<&[u8]> = read_stringlist(&node, "p").unwrap().collect();
        assert_eq!(entries, [&b"foo,bar"[..], &b"hafnium,hafnium"[..]]);

        assert!(matches!(
            read_stringlist(&Prop(b"foo"), "p"),
            Err(ManifestError::MalformedStringList)
        ));
    }

    #[test]
    fn test_error_messages() {
        use alloc::string::ToString;
        assert_eq!(
            ManifestError::NoHypervisorFdtNode.to_string(),
            "Could not find \"hypervisor\" node in manifest"
        );
        assert_eq!(AxError::from(ManifestError::TooManyVms), AxError::InvalidData);
    }
}
