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

//! Compile-time capacities and reserved identifiers.

use memory_addr::PAGE_SIZE_4K;

/// Platform-assigned identifier of a physical CPU (e.g. the MPIDR affinity bits).
pub type CpuId = u64;
/// Identifier of a VM. Ids below [`VM_ID_OFFSET`] are reserved.
pub type VmId = u16;
/// Index of a vCPU inside its VM.
pub type VCpuIndex = u16;
/// Number of vCPUs of a VM.
pub type VCpuCount = u16;

/// Maximum number of physical CPUs, and of vCPUs per VM.
pub const MAX_CPUS: usize = 8;
/// Maximum number of VMs, primary included.
pub const MAX_VMS: usize = 16;

/// Ids `0..VM_ID_OFFSET` are reserved; VM slot `i` gets id `VM_ID_OFFSET + i`.
pub const VM_ID_OFFSET: VmId = 1;
/// The primary VM is always the first one created.
pub const PRIMARY_VM_ID: VmId = VM_ID_OFFSET;

/// Size of the per-CPU hypervisor stack.
pub const STACK_SIZE: usize = PAGE_SIZE_4K;
/// Size of the per-VM debug log line buffer.
pub const LOG_BUFFER_SIZE: usize = 256;
/// Size of a mailbox send or receive page.
pub const MAILBOX_SIZE: usize = PAGE_SIZE_4K;

/// Capacity of the name strings read from the manifest, terminator included.
pub const MANIFEST_NAME_MAX_SIZE: usize = 32;
/// Entry the `hypervisor` manifest node must list in its `compatible` property.
pub const MANIFEST_COMPATIBLE: &str = "hafnium,hafnium";

/// Converts a VM id into its slot index, or `None` for reserved ids.
pub const fn vm_index(id: VmId) -> Option<usize> {
    if id < VM_ID_OFFSET {
        None
    } else {
        Some((id - VM_ID_OFFSET) as usize)
    }
}
