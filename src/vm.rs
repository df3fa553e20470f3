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

use core::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayVec;
use axerrno::{ax_err, AxResult};
use spin::{Mutex, MutexGuard};

use crate::config::{
    vm_index, VCpuCount, VmId, LOG_BUFFER_SIZE, MAX_CPUS, MAX_VMS, PRIMARY_VM_ID, VM_ID_OFFSET,
};
use crate::hal::PagePool;
use crate::mailbox::{Mailbox, WaitEntry};
use crate::mm::HostPhysAddr;
use crate::{PartitionHal, Stage2PageTable, VCpu};

/// The part of [`Vm`] protected by its lock.
pub(crate) struct VmInner<H: PartitionHal> {
    pub(crate) ptable: H::PageTable,
    pub(crate) mailbox: Mailbox,
    log_buffer: ArrayVec<u8, LOG_BUFFER_SIZE>,
}

/// A virtual machine.
///
/// VMs are created once at boot by [`VmRegistry::create`] and live as long as
/// the registry. The immutable parts (id, vcpus, wait entries) are freely
/// shared; the page table, mailbox and log buffer are only reachable through
/// a [`VmLocked`] token.
pub struct Vm<H: PartitionHal> {
    id: VmId,
    vcpus: ArrayVec<VCpu<H>, MAX_CPUS>,
    ptable_root: HostPhysAddr,
    /// Entries used when this VM waits for another VM's mailbox to become
    /// writable, indexed by the slot of the VM waited on.
    wait_entries: [WaitEntry; MAX_VMS],
    aborting: AtomicBool,
    inner: Mutex<VmInner<H>>,
}

impl<H: PartitionHal> Vm<H> {
    /// Id of the VM.
    pub const fn id(&self) -> VmId {
        self.id
    }

    /// Slot of the VM in its registry.
    pub const fn index(&self) -> usize {
        (self.id - VM_ID_OFFSET) as usize
    }

    /// Whether this is the primary VM.
    pub const fn is_primary(&self) -> bool {
        self.id == PRIMARY_VM_ID
    }

    /// Number of vcpus of the VM.
    pub fn vcpu_count(&self) -> VCpuCount {
        self.vcpus.len() as VCpuCount
    }

    /// Iterates over the vcpus of the VM.
    pub fn vcpus(&self) -> impl Iterator<Item = &VCpu<H>> {
        self.vcpus.iter()
    }

    /// Returns the vcpu at `index`. Panics if the VM has no such vcpu.
    pub fn vcpu(&self, index: usize) -> &VCpu<H> {
        assert!(index < self.vcpus.len(), "VM {} has no vcpu {}", self.id, index);
        &self.vcpus[index]
    }

    /// Root of the VM's stage-2 page table.
    pub const fn ptable_root(&self) -> HostPhysAddr {
        self.ptable_root
    }

    pub(crate) fn wait_entry(&self, target_index: usize) -> &WaitEntry {
        &self.wait_entries[target_index]
    }

    /// Locks the VM.
    pub fn lock(&self) -> VmLocked<'_, H> {
        VmLocked {
            vm: self,
            inner: self.inner.lock(),
        }
    }

    /// Locks two distinct VMs.
    ///
    /// This is the only way to hold two VM locks at once. The locks are always
    /// taken in ascending id order, whatever the argument order, so two cores
    /// locking the same pair never deadlock.
    pub fn lock_both<'a>(vm1: &'a Vm<H>, vm2: &'a Vm<H>) -> TwoVmLocked<'a, H> {
        assert_ne!(vm1.id, vm2.id, "cannot lock VM {} twice", vm1.id);
        if vm1.id < vm2.id {
            let first = vm1.lock();
            let second = vm2.lock();
            TwoVmLocked {
                vm1: first,
                vm2: second,
            }
        } else {
            let first = vm2.lock();
            let second = vm1.lock();
            TwoVmLocked {
                vm1: second,
                vm2: first,
            }
        }
    }

    /// Whether the VM is being aborted. The scheduler must not resume any of
    /// its vcpus once this is set.
    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    /// Aborts the VM on behalf of its vcpu `current`, which is marked aborted.
    ///
    /// Returns whether the VM was already aborting.
    pub fn abort(&self, current: &VCpu<H>) -> bool {
        assert_eq!(current.vm_id(), self.id, "vcpu does not belong to VM");
        let was_aborting = self.aborting.swap(true, Ordering::AcqRel);
        current.lock().abort();
        if !was_aborting {
            warn!("Aborting VM {} (vcpu {})", self.id, current.index());
        }
        was_aborting
    }

    /// Appends a character to the VM's debug log, flushing the line on a
    /// newline, a NUL or when the buffer fills up.
    pub fn debug_log(&self, c: u8) {
        let mut locked = self.lock();
        let buffer = &mut locked.inner.log_buffer;
        let flush = if c == b'\n' || c == b'\0' {
            true
        } else {
            buffer.push(c);
            buffer.is_full()
        };
        if flush {
            match core::str::from_utf8(&buffer[..]) {
                Ok(line) => info!("VM {}: {}", self.id, line),
                Err(_) => info!("VM {}: {}", self.id, buffer.escape_ascii()),
            }
            buffer.clear();
        }
    }
}

/// A [`Vm`] whose lock is held.
pub struct VmLocked<'a, H: PartitionHal> {
    vm: &'a Vm<H>,
    pub(crate) inner: MutexGuard<'a, VmInner<H>>,
}

impl<'a, H: PartitionHal> VmLocked<'a, H> {
    /// The locked VM.
    pub fn vm(&self) -> &'a Vm<H> {
        self.vm
    }

    /// Releases the lock.
    pub fn unlock(self) {}

    /// The VM's stage-2 page table.
    pub fn ptable(&self) -> &H::PageTable {
        &self.inner.ptable
    }

    /// The VM's stage-2 page table, for updating. Remapping and the TLB
    /// invalidation that follows must both happen before the lock is released.
    pub fn ptable_mut(&mut self) -> &mut H::PageTable {
        &mut self.inner.ptable
    }

    /// The VM's mailbox.
    pub fn mailbox(&self) -> &Mailbox {
        &self.inner.mailbox
    }
}

/// Two VMs locked by [`Vm::lock_both`]; `vm1` and `vm2` follow the argument order.
pub struct TwoVmLocked<'a, H: PartitionHal> {
    pub vm1: VmLocked<'a, H>,
    pub vm2: VmLocked<'a, H>,
}

/// The fixed-capacity table of all VMs.
///
/// VMs are only added during boot, through `&mut self`; afterwards the
/// registry is shared by every physical CPU.
pub struct VmRegistry<H: PartitionHal> {
    vms: ArrayVec<Vm<H>, MAX_VMS>,
}

impl<H: PartitionHal> Default for VmRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: PartitionHal> VmRegistry<H> {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            vms: ArrayVec::new_const(),
        }
    }

    /// Creates a VM with `vcpu_count` vcpus in the next free slot, taking its
    /// page table from `pool`.
    ///
    /// The first VM created is the primary. Nothing is committed on failure.
    pub fn create(&mut self, vcpu_count: VCpuCount, pool: &PagePool<H>) -> AxResult<&Vm<H>> {
        if self.vms.is_full() {
            return ax_err!(NoMemory, "no free VM slot");
        }
        if vcpu_count as usize > MAX_CPUS {
            return ax_err!(
                InvalidInput,
                format!("{} vcpus requested, at most {} supported", vcpu_count, MAX_CPUS)
            );
        }
        let Some(id) = VmId::try_from(self.vms.len())
            .ok()
            .and_then(|index| index.checked_add(VM_ID_OFFSET))
        else {
            return ax_err!(NoMemory, "VM id space exhausted");
        };

        let ptable = H::PageTable::new(pool)?;
        let ptable_root = ptable.root();
        let vm = Vm {
            id,
            vcpus: (0..vcpu_count as usize)
                .map(|index| VCpu::new(id, index, ptable_root))
                .collect(),
            ptable_root,
            wait_entries: core::array::from_fn(|target| WaitEntry::new(id, target)),
            aborting: AtomicBool::new(false),
            inner: Mutex::new(VmInner {
                ptable,
                mailbox: Mailbox::new(),
                log_buffer: ArrayVec::new(),
            }),
        };
        self.vms.push(vm);
        debug!("Created VM {} with {} vcpus", id, vcpu_count);
        Ok(&self.vms[self.vms.len() - 1])
    }

    /// Number of VMs created so far.
    pub fn count(&self) -> usize {
        self.vms.len()
    }

    /// Looks up a VM by id.
    pub fn find(&self, id: VmId) -> Option<&Vm<H>> {
        self.vms.get(vm_index(id)?)
    }

    /// The primary VM, if it has been created.
    pub fn primary(&self) -> Option<&Vm<H>> {
        self.find(PRIMARY_VM_ID)
    }

    /// Iterates over all VMs in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Vm<H>> {
        self.vms.iter()
    }

    pub(crate) fn vm_at(&self, index: usize) -> &Vm<H> {
        &self.vms[index]
    }
}

#[cfg(test)]
mod tests {
    use crate::test::new_registry;

    #[test]
    fn test_debug_log_flushes_lines() {
        let vms = new_registry(&[1]);
        let vm = vms.primary().unwrap();

        for &c in b"hello" {
            vm.debug_log(c);
        }
        assert_eq!(&vm.lock().inner.log_buffer[..], b"hello");
        vm.debug_log(b'\n');
        assert!(vm.lock().inner.log_buffer.is_empty());

        vm.debug_log(b'x');
        vm.debug_log(b'\0');
        assert!(vm.lock().inner.log_buffer.is_empty());
    }

    #[test]
    fn test_debug_log_flushes_invalid_utf8() {
        let vms = new_registry(&[1]);
        let vm = vms.primary().unwrap();

        for &c in b"ab\xff\xfe" {
            vm.debug_log(c);
        }
        assert_eq!(vm.lock().inner.log_buffer.len(), 4);
        vm.debug_log(b'\n');
        assert!(vm.lock().inner.log_buffer.is_empty());
    }

    #[test]
    fn test_debug_log_flushes_full_buffer() {
        let vms = new_registry(&[1]);
        let vm = vms.primary().unwrap();

        for _ in 0..super::LOG_BUFFER_SIZE - 1 {
            vm.debug_log(b'a');
        }
        assert_eq!(vm.lock().inner.log_buffer.len(), super::LOG_BUFFER_SIZE - 1);
        vm.debug_log(b'a');
        assert!(vm.lock().inner.log_buffer.is_empty());
    }
}
