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

use axerrno::{ax_err, AxError, AxResult};
use spin::{Mutex, MutexGuard};

use crate::config::{VCpuIndex, VmId, PRIMARY_VM_ID};
use crate::mm::{GuestPhysAddr, HostPhysAddr};
use crate::{ArchRegs, PartitionHal};

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// The vcpu is switched off, or has never been switched on.
    Off = 0,
    /// The vcpu is ready to be run.
    Ready = 1,
    /// The vcpu is currently running on some physical CPU.
    Running = 2,
    /// The vcpu is waiting for a message in its VM's mailbox.
    BlockedMailbox = 3,
    /// The vcpu is waiting for an interrupt.
    BlockedInterrupt = 4,
    /// The vcpu has aborted and must never run again.
    Aborted = 5,
}

impl VCpuState {
    /// Whether this state counts as "off" for power management.
    ///
    /// Aborted still counts as on: a core is only off once it has been turned
    /// off, or if it has never been turned on.
    pub const fn is_off(self) -> bool {
        match self {
            VCpuState::Off => true,
            VCpuState::Ready
            | VCpuState::Running
            | VCpuState::BlockedMailbox
            | VCpuState::BlockedInterrupt
            | VCpuState::Aborted => false,
        }
    }
}

/// The part of [`VCpu`] protected by its lock.
struct VCpuInner<R> {
    state: VCpuState,
    regs: R,
    /// Whether `regs` may be inspected or modified. It is `false` while some
    /// physical CPU executes the vcpu out of it.
    regs_available: bool,
}

/// A virtual CPU of a VM.
///
/// Everything mutable sits behind the vcpu's spinlock and is only reachable
/// through the [`VCpuLocked`] token returned by [`VCpu::lock`].
pub struct VCpu<H: PartitionHal> {
    /// Id of the VM this vcpu belongs to.
    vm_id: VmId,
    /// Index of this vcpu inside its VM.
    index: VCpuIndex,
    /// Root of the owning VM's stage-2 page table.
    ptable_root: HostPhysAddr,
    inner: Mutex<VCpuInner<H::Regs>>,
}

impl<H: PartitionHal> VCpu<H> {
    /// Creates a vcpu in the [`VCpuState::Off`] state with a zeroed register file.
    pub(crate) fn new(vm_id: VmId, index: usize, ptable_root: HostPhysAddr) -> Self {
        assert!(index < VCpuIndex::MAX as usize, "vcpu index {index} out of range");
        Self {
            vm_id,
            index: index as VCpuIndex,
            ptable_root,
            inner: Mutex::new(VCpuInner {
                state: VCpuState::Off,
                regs: H::Regs::default(),
                regs_available: true,
            }),
        }
    }

    /// Id of the VM owning this vcpu.
    pub const fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Index of this vcpu inside its VM.
    pub const fn index(&self) -> VCpuIndex {
        self.index
    }

    /// Locks the vcpu.
    pub fn lock(&self) -> VCpuLocked<'_, H> {
        VCpuLocked {
            vcpu: self,
            inner: self.inner.lock(),
        }
    }

    /// Resets and starts a vcpu of a secondary VM if it is off.
    ///
    /// The register file is put in the state of a freshly booting core: as
    /// secondaries migrate between physical CPUs, the id the guest sees is the
    /// vcpu index rather than the id of any physical CPU.
    ///
    /// Returns `true` if the vcpu was off and has been started, or `false` if
    /// it was already on and nothing was done.
    pub fn reset_and_start_secondary(&self, entry: GuestPhysAddr, arg: usize) -> bool {
        assert_ne!(
            self.vm_id, PRIMARY_VM_ID,
            "only vcpus of secondary VMs can be reset"
        );

        let mut locked = self.lock();
        if !locked.is_off() {
            return false;
        }
        let (vm_id, index, root) = (self.vm_id, self.index, self.ptable_root);
        locked.regs_mut().reset(false, vm_id, index, root);
        locked.start(entry, arg)
    }
}

/// A [`VCpu`] whose lock is held.
///
/// Dropping it (or calling [`VCpuLocked::unlock`]) releases the lock.
pub struct VCpuLocked<'a, H: PartitionHal> {
    vcpu: &'a VCpu<H>,
    inner: MutexGuard<'a, VCpuInner<H::Regs>>,
}

impl<'a, H: PartitionHal> VCpuLocked<'a, H> {
    /// The locked vcpu.
    pub fn vcpu(&self) -> &'a VCpu<H> {
        self.vcpu
    }

    /// Releases the lock.
    pub fn unlock(self) {}

    /// Current state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.inner.state
    }

    /// Whether the vcpu is off for power-management purposes.
    pub fn is_off(&self) -> bool {
        self.inner.state.is_off()
    }

    /// Points the vcpu at `entry` with `arg` as its argument and makes it
    /// [`VCpuState::Ready`].
    ///
    /// The caller has already decided that starting the vcpu is appropriate.
    /// An aborted vcpu is left untouched and `false` is returned.
    pub fn start(&mut self, entry: GuestPhysAddr, arg: usize) -> bool {
        if self.inner.state == VCpuState::Aborted {
            return false;
        }
        self.regs_mut().set_pc_arg(entry, arg);
        self.inner.state = VCpuState::Ready;
        true
    }

    /// Transitions the state of the vcpu. If the current state is not `from`,
    /// returns an error and leaves the state untouched.
    ///
    /// Nothing transitions out of [`VCpuState::Aborted`].
    pub fn transition_state(&mut self, from: VCpuState, to: VCpuState) -> AxResult {
        if self.inner.state != from {
            warn!("vcpu state is not {:?}, but {:?}", from, self.inner.state);
            Err(AxError::BadState)
        } else if from == VCpuState::Aborted && to != VCpuState::Aborted {
            ax_err!(BadState, "an aborted vcpu cannot be revived")
        } else {
            self.inner.state = to;
            Ok(())
        }
    }

    /// Moves the vcpu to [`VCpuState::Aborted`], returning the previous state.
    pub fn abort(&mut self) -> VCpuState {
        core::mem::replace(&mut self.inner.state, VCpuState::Aborted)
    }

    /// Whether the register file is free to be inspected or modified.
    pub fn regs_available(&self) -> bool {
        self.inner.regs_available
    }

    /// Claims the register file for a physical CPU about to run the vcpu.
    ///
    /// Returns `false` if another physical CPU is still using it, in which case
    /// the caller must pick something else to run.
    pub fn take_regs(&mut self) -> bool {
        core::mem::replace(&mut self.inner.regs_available, false)
    }

    /// Marks the register file as saved and available again.
    pub fn release_regs(&mut self) {
        assert!(
            !self.inner.regs_available,
            "releasing registers that were not taken"
        );
        self.inner.regs_available = true;
    }

    /// The register file.
    pub fn regs(&self) -> &H::Regs {
        assert!(self.inner.regs_available, "vcpu registers are in use");
        &self.inner.regs
    }

    /// The register file, for modification.
    pub fn regs_mut(&mut self) -> &mut H::Regs {
        assert!(self.inner.regs_available, "vcpu registers are in use");
        &mut self.inner.regs
    }

    /// Sets the value returned to the guest by its pending call.
    pub fn set_retval(&mut self, value: usize) {
        self.regs_mut().set_retval(value);
    }
}
