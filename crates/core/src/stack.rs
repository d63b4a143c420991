// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Stack validation and the synthetic stacks substituted for corrupted ones.

use crate::frame::{offset, Ps, EXC_FRAME_SIZE, INVALID_CAUSE_VALUE};
use crate::memory::AddressRange;
use crate::sanity::SanityOracle;
use crate::snapshot::ThreadSnapshot;
use crate::{DumpError, DumpResult, TargetMemory};
use serde::Serialize;

/// Reserved window for synthetic stacks. Nothing real is mapped here.
pub const FAKE_STACK_START: u32 = 0x2000_0000;
pub const FAKE_STACK_LIMIT: u32 = 0x3000_0000;

/// Byte the capture handler's own stack is pre-filled with.
pub const DUMP_STACK_FILL_BYTE: u8 = 0xA5;

/// Raw bounds as the scheduler reported them; either end may be the lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackBounds {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSource {
    Memory,
    /// Bytes come from [`fake_frame`], not from target memory.
    Synthetic,
}

/// Where a thread's stack bytes can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackView {
    pub vaddr: u32,
    pub len: u32,
    pub source: StackSource,
}

/// Interrupt stacks, one `size`-byte block per core laid out from `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IsrStacks {
    pub base: u32,
    pub size: u32,
    pub cores: u32,
}

impl IsrStacks {
    /// Exclusive top of `core_id`'s interrupt stack.
    pub fn end(&self, core_id: u32) -> Option<u32> {
        if core_id >= self.cores {
            return None;
        }
        core_id
            .checked_add(1)?
            .checked_mul(self.size)?
            .checked_add(self.base)
    }
}

pub fn is_fake_stack(addr: u32) -> bool {
    (FAKE_STACK_START..FAKE_STACK_LIMIT).contains(&addr)
}

pub fn resolve_stack(task: &ThreadSnapshot) -> StackView {
    let (vaddr, len) = if task.stack_end > task.stack_start {
        (task.stack_start, task.stack_end - task.stack_start)
    } else {
        (task.stack_end, task.stack_start - task.stack_end)
    };
    let source = if is_fake_stack(vaddr) {
        StackSource::Synthetic
    } else {
        StackSource::Memory
    };
    StackView { vaddr, len, source }
}

/// Checks a thread's stack bounds. A start above the end wraps to a huge
/// length and fails the size check.
pub fn check_stack(oracle: &SanityOracle<'_>, start: u32, end: u32, max_len: u32) -> bool {
    let len = end.wrapping_sub(start);
    if !oracle.stack_ptr_is_sane(start) || !oracle.stack_end_is_sane(end) || len > max_len {
        return false;
    }
    tracing::debug!("Stack len = {} ({:#x} {:#x})", len, start, end);
    true
}

/// Frame handed to the debugger for a thread whose stack could not be trusted.
///
/// It is a solicited frame, so no interrupt state is recovered from it, and
/// its null return address stops any backtrace right away.
pub fn fake_frame() -> [u8; EXC_FRAME_SIZE] {
    let mut words = [0u32; EXC_FRAME_SIZE / 4];
    words[offset::EXIT] = 0;
    words[offset::SOL_PC] = FAKE_STACK_START;
    words[offset::SOL_PS] = (Ps::UM | Ps::EXCM).bits();
    words[offset::SOL_AR_START] = 0;
    words[offset::SOL_AR_START + 1] = FAKE_STACK_START + EXC_FRAME_SIZE as u32;
    words[offset::STK_EXCCAUSE] = INVALID_CAUSE_VALUE;

    let mut bytes = [0u8; EXC_FRAME_SIZE];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Hands out synthetic stack slots for one episode.
#[derive(Debug, Default)]
pub struct FakeStackAllocator {
    issued: u32,
}

impl FakeStackAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> u32 {
        self.issued
    }

    /// Returns the next unused slot, exactly one frame long.
    pub fn allocate(&mut self) -> DumpResult<StackBounds> {
        let size = EXC_FRAME_SIZE as u32;
        let start = self
            .issued
            .checked_mul(size)
            .and_then(|offset| FAKE_STACK_START.checked_add(offset))
            .filter(|start| start.saturating_add(size) <= FAKE_STACK_LIMIT)
            .ok_or(DumpError::FakeStackExhausted(self.issued))?;
        self.issued += 1;
        Ok(StackBounds {
            start,
            end: start + size,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackUsage {
    pub used: u32,
    pub free: u32,
}

/// Measures the capture handler's own stack by counting untouched fill bytes
/// from the low end. The stack grows down, so they sit at the bottom.
pub fn free_stack_space(memory: &dyn TargetMemory, stack: AddressRange) -> StackUsage {
    let mut free = 0;
    for addr in stack.start..stack.end {
        match memory.read_u8(addr) {
            Ok(DUMP_STACK_FILL_BYTE) => free += 1,
            _ => break,
        }
    }
    StackUsage {
        used: stack.len() - free,
        free,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, FrameKind, SpecialRegisterFile, XtensaCore};
    use crate::memory::{LinearMemory, MemoryMap, TargetRam};
    use proptest::prelude::*;

    const MAX_STACK: u32 = 64 * 1024;

    fn map() -> MemoryMap {
        MemoryMap {
            dram: AddressRange::new(0x3FFB_0000, 0x4000_0000),
            ..MemoryMap::esp32()
        }
    }

    #[test]
    fn test_check_stack_rejects_bad_bounds() {
        let map = map();
        let oracle = SanityOracle::new(&map, 0x160);

        assert!(check_stack(&oracle, 0x3FFB_2000, 0x3FFB_3000, MAX_STACK));
        assert!(!check_stack(&oracle, 0, 0, MAX_STACK));
        // Reversed bounds wrap to a huge length.
        assert!(!check_stack(&oracle, 0x3FFB_3000, 0x3FFB_2000, MAX_STACK));
        assert!(!check_stack(&oracle, 0x3FFB_0000, 0x3FFD_0000, MAX_STACK));
        assert!(!check_stack(&oracle, 0x5000_0000, 0x5000_1000, MAX_STACK));
        // Sane start and a short enough length, but the end runs past DRAM.
        assert!(!check_stack(&oracle, 0x3FFF_F000, 0x4000_1000, MAX_STACK));
        // Ending exactly at the top of DRAM is fine.
        assert!(check_stack(&oracle, 0x3FFF_F000, 0x4000_0000, MAX_STACK));
    }

    proptest! {
        #[test]
        fn prop_check_stack_accepts_sane_bounds(
            start in 0x3FFB_0000u32..0x3FFF_0000,
            len in 1u32..=MAX_STACK,
        ) {
            let map = map();
            let oracle = SanityOracle::new(&map, 0x160);
            prop_assert!(check_stack(&oracle, start, start + len, MAX_STACK));
        }

        #[test]
        fn prop_check_stack_rejects_oversized(
            start in 0x3FFB_0000u32..0x3FFD_0000,
            extra in 1u32..0x1000,
        ) {
            let map = map();
            let oracle = SanityOracle::new(&map, 0x160);
            prop_assert!(!check_stack(&oracle, start, start + MAX_STACK + extra, MAX_STACK));
        }

        #[test]
        fn prop_check_stack_rejects_insane_start(
            start in 0u32..0x3FFB_0000,
            len in 1u32..=MAX_STACK,
        ) {
            let map = map();
            let oracle = SanityOracle::new(&map, 0x160);
            prop_assert!(!check_stack(&oracle, start, start.wrapping_add(len), MAX_STACK));
        }

        #[test]
        fn prop_check_stack_rejects_end_past_dram(
            end in 0x4000_0001u32..0x4000_1000,
            len in 0x1000u32..=MAX_STACK,
        ) {
            let map = map();
            let oracle = SanityOracle::new(&map, 0x160);
            let start = end - len;
            prop_assert!(oracle.stack_ptr_is_sane(start));
            prop_assert!(!check_stack(&oracle, start, end, MAX_STACK));
        }
    }

    #[test]
    fn test_fake_stacks_never_overlap() {
        let mut alloc = FakeStackAllocator::new();
        let slots: Vec<_> = (0..32).map(|_| alloc.allocate().unwrap()).collect();

        for pair in slots.windows(2) {
            assert!(pair[0].end <= pair[1].start);
            assert!(pair[0].start < pair[1].start);
        }
        for slot in &slots {
            assert_eq!(slot.end - slot.start, EXC_FRAME_SIZE as u32);
            assert!(is_fake_stack(slot.start));
        }
        assert_eq!(alloc.issued(), 32);
    }

    #[test]
    fn test_fake_stack_window_exhaustion() {
        let slots = (FAKE_STACK_LIMIT - FAKE_STACK_START) / EXC_FRAME_SIZE as u32;
        let mut alloc = FakeStackAllocator { issued: slots - 1 };
        assert!(alloc.allocate().is_ok());
        assert!(matches!(
            alloc.allocate(),
            Err(DumpError::FakeStackExhausted(_))
        ));
    }

    #[test]
    fn test_resolve_stack_orders_bounds() {
        let task = ThreadSnapshot {
            tcb: 0x3FFB_1000,
            stack_start: 0x3FFB_3000,
            stack_end: 0x3FFB_2000,
        };
        let view = resolve_stack(&task);
        assert_eq!(view.vaddr, 0x3FFB_2000);
        assert_eq!(view.len, 0x1000);
        assert_eq!(view.source, StackSource::Memory);

        let task = ThreadSnapshot {
            tcb: 0x3FFB_1000,
            stack_start: FAKE_STACK_START + EXC_FRAME_SIZE as u32,
            stack_end: FAKE_STACK_START + 2 * EXC_FRAME_SIZE as u32,
        };
        assert_eq!(resolve_stack(&task).source, StackSource::Synthetic);
    }

    #[test]
    fn test_fake_frame_stops_backtrace() {
        let sregs = SpecialRegisterFile::new();
        let decoded = FrameDecoder::new(XtensaCore::default(), &sregs)
            .decode_bytes(&fake_frame())
            .unwrap();

        assert_eq!(decoded.kind, FrameKind::Solicited);
        assert!(decoded.exception.is_none());
        assert_eq!(decoded.regs.pc, FAKE_STACK_START);
        assert_eq!(decoded.regs.ar[0], 0);
        assert_eq!(decoded.regs.ar[1], FAKE_STACK_START + EXC_FRAME_SIZE as u32);
        // Solicited frames keep UM|EXCM as written.
        assert_eq!(decoded.regs.ps, (Ps::UM | Ps::EXCM).bits());
    }

    #[test]
    fn test_isr_stack_per_core() {
        let isr = IsrStacks {
            base: 0x3FFB_E000,
            size: 0x600,
            cores: 2,
        };
        assert_eq!(isr.end(0), Some(0x3FFB_E600));
        assert_eq!(isr.end(1), Some(0x3FFB_EC00));
        assert_eq!(isr.end(2), None);

        let wrapping = IsrStacks {
            base: 0xFFFF_F000,
            size: 0x1000,
            cores: 2,
        };
        assert_eq!(wrapping.end(1), None);
    }

    #[test]
    fn test_free_stack_space() {
        let mut ram = TargetRam::new();
        let mut bank = LinearMemory::new(0x100, 0x3FFB_0000);
        bank.data[..0x40].fill(DUMP_STACK_FILL_BYTE);
        ram.add_bank(bank);

        let usage = free_stack_space(&ram, AddressRange::new(0x3FFB_0000, 0x3FFB_0100));
        assert_eq!(usage, StackUsage { used: 0xC0, free: 0x40 });
    }
}
