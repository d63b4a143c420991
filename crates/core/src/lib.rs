// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Post-mortem thread capture for windowed-register (Xtensa) targets.
//!
//! The capture path runs after every other thread has stopped: it enumerates
//! the scheduler's threads, validates (and if needed replaces) their stacks,
//! decodes each saved register frame and streams a checksummed core image.

pub mod checksum;
pub mod config;
pub mod episode;
pub mod frame;
pub mod image;
pub mod memory;
pub mod regions;
pub mod sanity;
pub mod snapshot;
pub mod stack;


pub use checksum::{ChecksumAccumulator, ChecksumKind, ChecksumValue};
pub use config::CaptureConfig;
pub use episode::{CoreDumper, EpisodeContext, EpisodeSummary, FaultContext, ThreadRecord};
pub use frame::{RegisterFrame, StackFrame};
pub use regions::{RegionCatalog, RegionClass};
pub use snapshot::{Scheduler, ThreadSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("Stack frame needs {needed} bytes but only {available} are available")]
    InsufficientBuffer { needed: usize, available: usize },
    #[error("Stack of task {tcb:#x} is corrupted ({start:#x}, {end:#x})")]
    CorruptStack { tcb: u32, start: u32, end: u32 },
    #[error("Memory region {0:?} is not configured")]
    UnknownRegionClass(RegionClass),
    #[error("Checksum misuse: {0}")]
    ChecksumMisuse(&'static str),
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u32),
    #[error("Task snapshot record is {got} bytes, at least {min} expected")]
    ShortSnapshot { got: usize, min: usize },
    #[error("Synthetic stack window exhausted after {0} slots")]
    FakeStackExhausted(u32),
    #[error("Failed to write core image: {0}")]
    Io(#[from] std::io::Error),
}

pub type DumpResult<T> = Result<T, DumpError>;

/// Byte-addressable view of the crashed target's memory.
pub trait TargetMemory {
    fn read_u8(&self, addr: u32) -> DumpResult<u8>;
    fn write_u8(&mut self, addr: u32, value: u8) -> DumpResult<()>;

    fn read_u32(&self, addr: u32) -> DumpResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_bytes(addr, &mut bytes)?;
        // Little Endian
        Ok(u32::from_le_bytes(bytes))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> DumpResult<()> {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            let at = addr
                .checked_add(i as u32)
                .ok_or(DumpError::MemoryViolation(addr))?;
            self.write_u8(at, byte)?;
        }
        Ok(())
    }

    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> DumpResult<()> {
        for (i, slot) in buf.iter_mut().enumerate() {
            let at = addr
                .checked_add(i as u32)
                .ok_or(DumpError::MemoryViolation(addr))?;
            *slot = self.read_u8(at)?;
        }
        Ok(())
    }
}

/// Saved special registers of the faulting core (EPC/EPS per interrupt level).
pub trait SpecialRegisters {
    fn read_sr(&self, index: u32) -> u32;
}
