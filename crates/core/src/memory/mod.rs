// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{DumpError, DumpResult, TargetMemory};
use labwired_coredump_config::MemoryMapConfig;
use serde::{Deserialize, Serialize};

/// Memory classes known to the sanity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryClass {
    /// Internal data RAM, the only class thread stacks live in.
    Dram,
    Iram,
    /// Slow RTC memory, retained across deep sleep.
    RtcSlow,
    RtcFast,
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u32,
    pub end: u32,
}

impl AddressRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }

    /// True if every byte of `[addr, addr + len)` lies in the range.
    pub fn contains_range(&self, addr: u32, len: u32) -> bool {
        if len == 0 {
            return self.contains(addr);
        }
        let last = u64::from(addr) + u64::from(len);
        addr >= self.start && last <= u64::from(self.end)
    }
}

/// Physical memory layout of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub dram: AddressRange,
    pub iram: Option<AddressRange>,
    pub rtc_slow: Option<AddressRange>,
    pub rtc_fast: Option<AddressRange>,
    pub iram_data_access: bool,
}

impl MemoryMap {
    /// ESP32 internal memory.
    pub const fn esp32() -> Self {
        Self {
            dram: AddressRange::new(0x3FFA_E000, 0x4000_0000),
            iram: Some(AddressRange::new(0x4008_0000, 0x400A_0000)),
            rtc_slow: Some(AddressRange::new(0x5000_0000, 0x5000_2000)),
            rtc_fast: Some(AddressRange::new(0x3FF8_0000, 0x3FF8_2000)),
            iram_data_access: false,
        }
    }

    pub fn from_config(config: &MemoryMapConfig) -> anyhow::Result<Self> {
        let range = |r: &labwired_coredump_config::MemoryRange| -> anyhow::Result<AddressRange> {
            let (start, end) = r.bounds()?;
            Ok(AddressRange::new(start, end))
        };

        Ok(Self {
            dram: range(&config.dram)?,
            iram: config.iram.as_ref().map(range).transpose()?,
            rtc_slow: config.rtc_slow.as_ref().map(range).transpose()?,
            rtc_fast: config.rtc_fast.as_ref().map(range).transpose()?,
            iram_data_access: config.iram_data_access,
        })
    }

    pub fn range(&self, class: MemoryClass) -> Option<AddressRange> {
        match class {
            MemoryClass::Dram => Some(self.dram),
            MemoryClass::Iram => self.iram,
            MemoryClass::RtcSlow => self.rtc_slow,
            MemoryClass::RtcFast => self.rtc_fast,
        }
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::esp32()
    }
}

/// A simple flat memory storage
#[derive(Debug, Clone)]
pub struct LinearMemory {
    pub data: Vec<u8>,
    pub base_addr: u32,
}

impl LinearMemory {
    pub fn new(size: usize, base_addr: u32) -> Self {
        Self {
            data: vec![0; size],
            base_addr,
        }
    }

    pub fn from_bytes(base_addr: u32, data: Vec<u8>) -> Self {
        Self { data, base_addr }
    }

    fn offset(&self, addr: u32) -> Option<usize> {
        let offset = addr.checked_sub(self.base_addr)? as usize;
        (offset < self.data.len()).then_some(offset)
    }

    pub fn read_u8(&self, addr: u32) -> Option<u8> {
        self.offset(addr).map(|offset| self.data[offset])
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> bool {
        match self.offset(addr) {
            Some(offset) => {
                self.data[offset] = value;
                true
            }
            None => false,
        }
    }

    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> bool {
        let Some(offset) = self.offset(addr) else {
            return false;
        };
        if offset + bytes.len() > self.data.len() {
            return false;
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        true
    }
}

/// RAM of the crashed target, made of independent banks.
#[derive(Debug, Clone, Default)]
pub struct TargetRam {
    pub banks: Vec<LinearMemory>,
}

impl TargetRam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bank(&mut self, bank: LinearMemory) {
        self.banks.push(bank);
    }

    /// Copies `bytes` into whichever bank fully holds them.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> bool {
        self.banks.iter_mut().any(|bank| bank.load(addr, bytes))
    }

    /// Loads `bytes` into an existing bank, or maps a new bank for them.
    pub fn load_or_map(&mut self, addr: u32, bytes: &[u8]) {
        if !self.load(addr, bytes) {
            tracing::debug!(
                "Mapping new bank at {:#x} ({} bytes)",
                addr,
                bytes.len()
            );
            self.add_bank(LinearMemory::from_bytes(addr, bytes.to_vec()));
        }
    }
}

impl TargetMemory for TargetRam {
    fn read_u8(&self, addr: u32) -> DumpResult<u8> {
        self.banks
            .iter()
            .find_map(|bank| bank.read_u8(addr))
            .ok_or(DumpError::MemoryViolation(addr))
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> DumpResult<()> {
        if self.banks.iter_mut().any(|bank| bank.write_u8(addr, value)) {
            return Ok(());
        }
        Err(DumpError::MemoryViolation(addr))
    }
}
