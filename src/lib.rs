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

//! AxPartition - VM and vCPU lifecycle core of a partitioning hypervisor.
//!
//! This crate keeps track of the physical CPUs and of the statically
//! partitioned virtual machines running on them, and enforces the locking that
//! lets every physical CPU manipulate them at the same time. Choosing what to
//! run, saving and restoring registers, and building page tables are left to
//! the caller, through the `ArchRegs`, `Stage2PageTable` and `PartitionHal`
//! traits.
//!
//! # Features
//!
//! - CPU registry with idempotent power on/off
//! - vCPU state machine (Off → Ready → Running → Blocked → ..., Aborted)
//!   behind capability-typed lock tokens
//! - Fixed-capacity VM registry with deadlock-free paired locking
//! - Single-message mailboxes with writable-notification wait queues
//! - Stage-2 fault classification against concurrent remapping
//! - Manifest parsing and boot-time VM creation

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod arch_vcpu; // Architecture-specific register file trait
mod cpu; // Physical CPU registry
mod fault; // Stage-2 fault disambiguation
mod hal; // Hardware abstraction layer interfaces
mod mailbox; // Mailboxes and wait queues
mod percpu; // Per-CPU binding to a registry slot
mod vcpu; // VCpu state machine and locking
mod vm; // VM registry and locking

pub mod config; // Capacities and reserved ids
pub mod load; // Boot-time VM creation
pub mod manifest; // Static VM configuration
pub mod mm; // Addresses, access modes and page-table queries


// Public API exports
pub use arch_vcpu::ArchRegs;
pub use cpu::{CpuRegistry, PhysCpu};
pub use hal::{PagePool, PartitionHal};
pub use mailbox::{Mailbox, MailboxState, Message, WaitEntry};
pub use manifest::{Manifest, ManifestError, ManifestNode, ManifestVm};
pub use mm::{FaultInfo, MemMode, Stage2PageTable};
pub use vcpu::{VCpu, VCpuLocked, VCpuState};
pub use vm::{TwoVmLocked, Vm, VmLocked, VmRegistry};
