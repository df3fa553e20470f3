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

use crate::{ArchRegs, Stage2PageTable};

/// The interfaces which the underlying platform must provide.
pub trait PartitionHal: 'static {
    /// Register file of a virtual CPU.
    type Regs: ArchRegs;
    /// Second-stage page table of a VM.
    type PageTable: Stage2PageTable;
}

/// Page pool consumed by [`PartitionHal::PageTable`].
pub type PagePool<H> = <<H as PartitionHal>::PageTable as Stage2PageTable>::PagePool;
