// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Pointer sanity checks.
//!
//! Everything here compares addresses against the memory map and never
//! touches target memory, so it is safe to call with wild pointers pulled out
//! of a corrupted TCB.

use crate::memory::{MemoryClass, MemoryMap};

#[derive(Debug, Clone, Copy)]
pub struct SanityOracle<'a> {
    map: &'a MemoryMap,
    tcb_size: u32,
}

impl<'a> SanityOracle<'a> {
    pub fn new(map: &'a MemoryMap, tcb_size: u32) -> Self {
        Self { map, tcb_size }
    }

    /// True iff `[addr, addr + len)` lies entirely inside the region of `class`.
    pub fn is_in_class(&self, addr: u32, len: u32, class: MemoryClass) -> bool {
        self.map
            .range(class)
            .is_some_and(|range| range.contains_range(addr, len))
    }

    /// True iff the segment lies in memory that may hold kernel data.
    pub fn mem_seg_is_sane(&self, addr: u32, len: u32) -> bool {
        self.is_in_class(addr, len, MemoryClass::Dram)
            || self.is_in_class(addr, len, MemoryClass::RtcSlow)
            || self.is_in_class(addr, len, MemoryClass::RtcFast)
            || (self.map.iram_data_access && self.is_in_class(addr, len, MemoryClass::Iram))
    }

    pub fn tcb_address_is_sane(&self, addr: u32) -> bool {
        self.mem_seg_is_sane(addr, self.tcb_size)
    }

    pub fn stack_ptr_is_sane(&self, addr: u32) -> bool {
        self.map.dram.contains(addr)
    }

    /// Stack ends are exclusive, so the address right past DRAM is accepted too.
    pub fn stack_end_is_sane(&self, addr: u32) -> bool {
        self.map.dram.contains(addr) || addr == self.map.dram.end
    }
}
