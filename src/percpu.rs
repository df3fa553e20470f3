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

//! Per-physical-CPU binding to a slot of the [`CpuRegistry`](crate::CpuRegistry).
//!
//! Each core records which registry slot it runs as once it has started, so
//! that hypercall handlers can find their own [`PhysCpu`](crate::PhysCpu)
//! without scanning ids:
//!
//! ```ignore
//! let cpu = cpus.find(hw_cpu_id).expect("unknown CPU");
//! cpus.bind_current(cpu);
//! // later, on the same core
//! let me = cpus.current().unwrap();
//! ```

const UNBOUND: usize = usize::MAX;

#[percpu::def_percpu]
static CURRENT_CPU_INDEX: usize = UNBOUND;

/// Records `index` as the registry slot of the calling physical CPU.
pub(crate) fn set_current_cpu_index(index: usize) {
    CURRENT_CPU_INDEX.write_current(index);
}

/// Returns the registry slot of the calling physical CPU, if it has been bound.
pub(crate) fn current_cpu_index() -> Option<usize> {
    match CURRENT_CPU_INDEX.read_current() {
        UNBOUND => None,
        index => Some(index),
    }
}
