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

use crate::config::{VCpuIndex, VmId};
use crate::mm::{GuestPhysAddr, HostPhysAddr};

/// Architecture-specific register file of a virtual CPU.
///
/// The register file is opaque to this crate: it is only reset and updated
/// through the primitives below, and only while the owning vCPU is locked and
/// its registers are not in use by another physical CPU.
///
/// `Default` yields the zeroed register file a vCPU starts with.
pub trait ArchRegs: Default + Send {
    /// Resets every register other than the program counter and argument.
    ///
    /// `table` is the root of the VM's stage-2 page table. For a secondary VM
    /// the vCPU id seen by the guest is its index, since secondaries migrate
    /// between physical CPUs.
    fn reset(&mut self, is_primary: bool, vm_id: VmId, vcpu_index: VCpuIndex, table: HostPhysAddr);

    /// Sets the registers so that the vCPU starts at `pc` with `arg` as its
    /// first argument.
    fn set_pc_arg(&mut self, pc: GuestPhysAddr, arg: usize);

    /// Sets the register holding the return value of a call into the hypervisor.
    fn set_retval(&mut self, value: usize);
}
