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

use crate::mm::{FaultInfo, MemMode};
use crate::{PartitionHal, Stage2PageTable, VCpu, VmRegistry};

impl<H: PartitionHal> VmRegistry<H> {
    /// Handles a stage-2 fault taken by `current`, telling a genuine fault
    /// apart from one caused by another CPU remapping the same memory.
    ///
    /// Whoever updates a VM's page table holds the VM lock across the update
    /// and the TLB invalidation that follows it. Re-reading the mapping under
    /// that lock therefore sees either the old mapping, and the fault is
    /// genuine, or the completed new one, and the access can simply be retried.
    ///
    /// Returns `true` if `current` should be resumed, or `false` if its VM
    /// should be aborted.
    pub fn handle_page_fault(&self, current: &VCpu<H>, fault: &FaultInfo) -> bool {
        let Some(vm) = self.find(current.vm_id()) else {
            panic!("vcpu of unknown VM {}", current.vm_id());
        };
        let mask = fault.mode | MemMode::INVALID;

        let resume = {
            let locked = vm.lock();
            locked
                .ptable()
                .get_mode(fault.ipaddr, fault.ipaddr + 1)
                .is_some_and(|mode| mode & mask == fault.mode)
        };

        if !resume {
            info!(
                "Stage-2 page fault: pc={:#x}, vm={}, vcpu={}, va={:#x}, ipa={:#x}, mode={:#x}",
                fault.pc.as_usize(),
                vm.id(),
                current.index(),
                fault.vaddr.as_usize(),
                fault.ipaddr.as_usize(),
                fault.mode.bits()
            );
        }
        resume
    }
}
