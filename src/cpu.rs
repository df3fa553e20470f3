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

use core::cell::UnsafeCell;

use spin::Mutex;

use crate::config::{CpuId, MAX_CPUS, STACK_SIZE};
use crate::mm::{GuestPhysAddr, HostVirtAddr};
use crate::percpu::{current_cpu_index, set_current_cpu_index};
use crate::{PartitionHal, VmRegistry};

/// A physical CPU.
pub struct PhysCpu {
    /// Platform-assigned id of the CPU.
    id: CpuId,
    /// Whether the CPU has been turned on.
    is_on: Mutex<bool>,
}

impl PhysCpu {
    const fn new(id: CpuId, is_on: bool) -> Self {
        Self {
            id,
            is_on: Mutex::new(is_on),
        }
    }

    /// Platform-assigned id of the CPU.
    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// Whether the CPU is on.
    pub fn is_on(&self) -> bool {
        *self.is_on.lock()
    }
}

/// Hypervisor stack of one physical CPU.
#[repr(C, align(16))]
struct CpuStack(UnsafeCell<[u8; STACK_SIZE]>);

// SAFETY: the hypervisor never accesses a stack through this type; each stack
// is only handed out as an address for the CPU of the same slot to run on.
unsafe impl Sync for CpuStack {}

const EMPTY_STACK: CpuStack = CpuStack(UnsafeCell::new([0; STACK_SIZE]));

/// One stack per CPU slot, bound to the slot for the lifetime of the system.
static CPU_STACKS: [CpuStack; MAX_CPUS] = [EMPTY_STACK; MAX_CPUS];

/// The table of physical CPUs.
///
/// Slot 0 is the boot CPU, which is on from the start. The other slots get
/// their ids once, in [`CpuRegistry::init`], before any secondary CPU starts.
/// Slot `k` always runs on the static stack `k`, wherever the registry lives.
pub struct CpuRegistry {
    cpus: [PhysCpu; MAX_CPUS],
    count: usize,
    initialized: bool,
}

impl CpuRegistry {
    /// Creates the registry with the boot CPU, whose id is `boot_cpu_id`, as
    /// its only member.
    pub fn new(boot_cpu_id: CpuId) -> Self {
        Self {
            cpus: core::array::from_fn(|i| match i {
                0 => PhysCpu::new(boot_cpu_id, true),
                _ => PhysCpu::new(0, false),
            }),
            count: 1,
            initialized: false,
        }
    }

    /// Assigns the platform CPU ids.
    ///
    /// The boot CPU keeps slot 0; the other CPUs fill the table from the end.
    /// If the boot CPU's id is missing from `ids`, slot 0 is given the first
    /// listed id instead so the system can still come up.
    pub fn init(&mut self, ids: &[CpuId]) {
        assert!(!self.initialized, "CPU registry initialized twice");
        assert!(
            !ids.is_empty() && ids.len() <= MAX_CPUS,
            "{} CPUs given, 1 to {} supported",
            ids.len(),
            MAX_CPUS
        );

        let mut boot_cpu_id = self.cpus[0].id;
        if !ids.contains(&boot_cpu_id) {
            warn!("Boot CPU's ID {:#x} not found in config, using {:#x}", boot_cpu_id, ids[0]);
            boot_cpu_id = ids[0];
        }

        let mut found_boot_cpu = false;
        let mut next = ids.len();
        for &id in ids {
            let slot = if found_boot_cpu || id != boot_cpu_id {
                next -= 1;
                next
            } else {
                found_boot_cpu = true;
                0
            };
            self.cpus[slot].id = id;
        }

        self.count = ids.len();
        self.initialized = true;
    }

    /// Number of CPUs in the registry.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Iterates over the CPUs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &PhysCpu> {
        self.cpus[..self.count].iter()
    }

    /// Looks up a CPU by its platform id.
    pub fn find(&self, id: CpuId) -> Option<&PhysCpu> {
        self.iter().find(|cpu| cpu.id == id)
    }

    /// Slot of `cpu` in the registry.
    pub fn index(&self, cpu: &PhysCpu) -> usize {
        let index = self
            .cpus
            .iter()
            .position(|c| core::ptr::eq(c, cpu))
            .unwrap_or_else(|| panic!("CPU {:#x} is not in this registry", cpu.id));
        assert!(index < self.count);
        index
    }

    /// Returns the CPU at slot `index`.
    pub fn get(&self, index: usize) -> Option<&PhysCpu> {
        self.cpus[..self.count].get(index)
    }

    /// Address just past the top of the hypervisor stack of `cpu`.
    pub fn stack_bottom(&self, cpu: &PhysCpu) -> HostVirtAddr {
        let stack = CPU_STACKS[self.index(cpu)].0.get();
        HostVirtAddr::from(stack as usize + STACK_SIZE)
    }

    /// Records `cpu` as the CPU this code runs on.
    ///
    /// The per-CPU areas must have been set up with `percpu::init` first.
    pub fn bind_current(&self, cpu: &PhysCpu) {
        set_current_cpu_index(self.index(cpu));
    }

    /// The CPU this code runs on, once bound with [`CpuRegistry::bind_current`].
    pub fn current(&self) -> Option<&PhysCpu> {
        self.get(current_cpu_index()?)
    }

    /// Turns `cpu` on and returns whether it was already on.
    ///
    /// When the CPU really changes state, the primary VM's vcpu with the same
    /// index is started at `entry` with argument `arg`, unless it has aborted.
    pub fn turn_on<H: PartitionHal>(
        &self,
        cpu: &PhysCpu,
        vms: &VmRegistry<H>,
        entry: GuestPhysAddr,
        arg: usize,
    ) -> bool {
        let prev = core::mem::replace(&mut *cpu.is_on.lock(), true);

        if !prev {
            let Some(primary) = vms.primary() else {
                panic!("CPU {:#x} turned on before the primary VM exists", cpu.id);
            };
            let mut vcpu = primary.vcpu(self.index(cpu)).lock();
            if !vcpu.start(entry, arg) {
                warn!("CPU {:#x} turned on, but its primary vcpu has aborted", cpu.id);
            }
        }

        prev
    }

    /// Marks `cpu` as off. Halting it is up to the caller.
    pub fn turn_off(&self, cpu: &PhysCpu) {
        *cpu.is_on.lock() = false;
    }
}
