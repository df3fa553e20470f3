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

use axerrno::AxResult;
use bitflags::bitflags;

pub use memory_addr::{PhysAddr as HostPhysAddr, VirtAddr as HostVirtAddr};

memory_addr::def_usize_addr! {
    /// Guest virtual address.
    pub type GuestVirtAddr;
    /// Guest physical (intermediate physical) address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestVirtAddr = "GVA:{}";
    GuestPhysAddr = "GPA:{}";
}

bitflags! {
    /// Access mode of a stage-2 mapping, as reported by the page-table layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemMode: u32 {
        /// Readable.
        const R = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// Executable.
        const X = 1 << 2;
        /// Device memory.
        const D = 1 << 3;
        /// The mapping is not valid; any access faults.
        const INVALID = 1 << 4;
        /// The memory is not owned by the VM.
        const UNOWNED = 1 << 5;
        /// The memory is shared with another VM.
        const SHARED = 1 << 6;
    }
}

/// The query side of a VM's second-stage page table.
///
/// Building and editing the table is done elsewhere; callers that edit it must
/// hold the owning VM's lock for the whole remap and TLB invalidation, which is
/// what makes re-querying under that lock meaningful (see [`crate::fault`]).
pub trait Stage2PageTable: Sized + Send {
    /// Page allocator the table takes its root from.
    type PagePool: ?Sized + Sync;

    /// Creates an empty table, allocating its root from `pool`.
    fn new(pool: &Self::PagePool) -> AxResult<Self>;

    /// Physical address of the root table, as loaded into the stage-2 base register.
    fn root(&self) -> HostPhysAddr;

    /// Returns the mode shared by every page in `[begin, end)`, or `None` if the
    /// pages disagree.
    fn get_mode(&self, begin: GuestPhysAddr, end: GuestPhysAddr) -> Option<MemMode>;
}

/// Information about a trapped stage-2 fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Faulting guest physical address.
    pub ipaddr: GuestPhysAddr,
    /// Faulting guest virtual address.
    pub vaddr: GuestVirtAddr,
    /// Program counter of the faulting instruction.
    pub pc: GuestVirtAddr,
    /// The access that was attempted.
    pub mode: MemMode,
}
