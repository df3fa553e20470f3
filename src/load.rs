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

//! Boot-time creation of the VMs described by the manifest.

use axerrno::{AxError, AxResult};

use crate::config::VCpuCount;
use crate::hal::PagePool;
use crate::{Manifest, PartitionHal, VmRegistry};

/// Creates every VM of `manifest` in id order.
///
/// The primary VM gets one vcpu per physical CPU; secondaries get the count
/// they declare. Any failure is fatal to boot.
pub fn create_vms<H: PartitionHal>(
    vms: &mut VmRegistry<H>,
    manifest: &Manifest,
    cpu_count: usize,
    pool: &PagePool<H>,
) -> AxResult {
    assert_eq!(vms.count(), 0, "VMs have already been created");

    for config in manifest.vms() {
        let vcpu_count = match &config.secondary {
            Some(secondary) => secondary.vcpu_count,
            None => VCpuCount::try_from(cpu_count).map_err(|_| AxError::InvalidInput)?,
        };
        let vm = vms.create(vcpu_count, pool).inspect_err(|err| {
            error!("Unable to create VM {} ({}): {:?}", config.id, config.debug_name, err);
        })?;
        assert_eq!(vm.id(), config.id);
        info!(
            "Created VM {} ({}) with {} vcpus, kernel {}",
            vm.id(),
            config.debug_name,
            vcpu_count,
            config.kernel_filename.as_deref().unwrap_or("<none>")
        );
    }
    Ok(())
}

/// Parses the manifest in `blob` and creates its VMs.
pub fn boot_vms<H: PartitionHal>(
    vms: &mut VmRegistry<H>,
    blob: &[u8],
    cpu_count: usize,
    pool: &PagePool<H>,
) -> AxResult<Manifest> {
    let manifest = Manifest::from_fdt(blob).map_err(|err| {
        error!("Could not parse manifest: {}", err);
        AxError::from(err)
    })?;
    create_vms(vms, &manifest, cpu_count, pool)?;
    Ok(manifest)
}
