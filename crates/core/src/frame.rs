// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Saved register frames of the Xtensa windowed ABI.
//!
//! A suspended thread's stack starts with one of two frames: the exception
//! frame pushed by a trap, or the smaller solicited frame saved by a voluntary
//! context switch. The first word tells them apart; the crashed thread's
//! exception frame is tagged with [`CURRENT_TASK_MARKER`] by the orchestrator.

use crate::stack::{StackSource, StackView};
use crate::{DumpError, DumpResult, SpecialRegisters, TargetMemory};
use bitflags::bitflags;
use serde::{Serialize, Serializer};

pub const CURRENT_TASK_MARKER: u32 = 0xDEAD_BEEF;
pub const INVALID_CAUSE_VALUE: u32 = 0xFFFF;
/// Number of hardware exception causes; software causes are offset past it.
pub const EXCCAUSE_NUM: u32 = 64;

pub const EXC_FRAME_WORDS: usize = 28;
pub const EXC_FRAME_SIZE: usize = EXC_FRAME_WORDS * 4;
pub const NUM_AREGS: usize = 64;
pub const MAX_INT_LEVELS: u8 = 7;
pub const EXTRA_REG_NUM: usize = 16;

/// Word offsets inside the exception (`STK_*`) and solicited (`SOL_*`) frames.
pub mod offset {
    pub const EXIT: usize = 0;

    pub const STK_PC: usize = 1;
    pub const STK_PS: usize = 2;
    pub const STK_AR_START: usize = 3;
    pub const STK_AR_NUM: usize = 16;
    pub const STK_SAR: usize = 19;
    pub const STK_EXCCAUSE: usize = 20;
    pub const STK_EXCVADDR: usize = 21;
    pub const STK_LBEG: usize = 22;
    pub const STK_LEND: usize = 23;
    pub const STK_LCOUNT: usize = 24;

    pub const SOL_PC: usize = 1;
    pub const SOL_PS: usize = 2;
    pub const SOL_NEXT: usize = 3;
    pub const SOL_AR_START: usize = 4;
    pub const SOL_AR_NUM: usize = 4;
}

/// Special register numbers as the host debugger knows them.
pub mod sr {
    pub const EPC_1: u32 = 177;
    pub const EPS_2: u32 = 194;
    pub const EXCCAUSE: u32 = 232;
    pub const EXCVADDR: u32 = 238;

    pub const fn epc(level: u8) -> u32 {
        EPC_1 + level as u32 - 1
    }

    pub const fn eps(level: u8) -> u32 {
        EPS_2 + level as u32 - 2
    }
}

bitflags! {
    /// Processor status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ps: u32 {
        const INTLEVEL = 0x0000_000F;
        const EXCM = 0x0000_0010;
        const UM = 0x0000_0020;
        const RING = 0x0000_00C0;
        const OWB = 0x0000_0F00;
        const CALLINC = 0x0003_0000;
        const WOE = 0x0004_0000;
    }
}

/// Core configuration that changes how frames are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XtensaCore {
    pub num_int_levels: u8,
    /// Zero-overhead loop option (LBEG/LEND/LCOUNT in the frame).
    pub loop_registers: bool,
}

impl Default for XtensaCore {
    fn default() -> Self {
        Self {
            num_int_levels: 6,
            loop_registers: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegPair {
    pub index: u32,
    pub value: u32,
}

impl RegPair {
    pub const fn new(index: u32, value: u32) -> Self {
        Self { index, value }
    }
}

/// Fixed-capacity list of register pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtraRegisters {
    pairs: [RegPair; EXTRA_REG_NUM],
    len: usize,
}

impl ExtraRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pair; returns false once the list is full.
    pub fn push(&mut self, pair: RegPair) -> bool {
        if self.len == EXTRA_REG_NUM {
            return false;
        }
        self.pairs[self.len] = pair;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[RegPair] {
        &self.pairs[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All slots, unused ones zeroed, as laid out in the image.
    pub fn slots(&self) -> &[RegPair; EXTRA_REG_NUM] {
        &self.pairs
    }
}

impl Serialize for ExtraRegisters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.as_slice())
    }
}

/// State only the crashed thread carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub exccause: RegPair,
    pub excvaddr: RegPair,
    pub extra: ExtraRegisters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExceptionFrame {
    pub exit: u32,
    pub pc: u32,
    pub ps: u32,
    pub ar: [u32; offset::STK_AR_NUM],
    pub sar: u32,
    pub exccause: u32,
    pub excvaddr: u32,
    pub lbeg: u32,
    pub lend: u32,
    pub lcount: u32,
}

impl ExceptionFrame {
    fn from_words(words: &[u32; EXC_FRAME_WORDS]) -> Self {
        let mut ar = [0; offset::STK_AR_NUM];
        ar.copy_from_slice(
            &words[offset::STK_AR_START..offset::STK_AR_START + offset::STK_AR_NUM],
        );
        Self {
            exit: words[offset::EXIT],
            pc: words[offset::STK_PC],
            ps: words[offset::STK_PS],
            ar,
            sar: words[offset::STK_SAR],
            exccause: words[offset::STK_EXCCAUSE],
            excvaddr: words[offset::STK_EXCVADDR],
            lbeg: words[offset::STK_LBEG],
            lend: words[offset::STK_LEND],
            lcount: words[offset::STK_LCOUNT],
        }
    }
}

/// Only a0..a3 are saved by a voluntary switch; the rest live in spill areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SolicitedFrame {
    pub pc: u32,
    pub ps: u32,
    pub ar: [u32; offset::SOL_AR_NUM],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Crashed,
    Interrupted,
    Solicited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFrame {
    Crashed(ExceptionFrame),
    /// Pre-empted by a trap. The cause fields are already reset to
    /// [`INVALID_CAUSE_VALUE`] / 0: only the crashed thread's cause is meaningful.
    Interrupted(ExceptionFrame),
    Solicited(SolicitedFrame),
}

impl StackFrame {
    pub fn parse(bytes: &[u8]) -> DumpResult<Self> {
        if bytes.len() < EXC_FRAME_SIZE {
            tracing::error!("Too small stack to keep frame: {} bytes!", bytes.len());
            return Err(DumpError::InsufficientBuffer {
                needed: EXC_FRAME_SIZE,
                available: bytes.len(),
            });
        }

        let mut words = [0u32; EXC_FRAME_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let frame = match words[offset::EXIT] {
            CURRENT_TASK_MARKER => Self::Crashed(ExceptionFrame::from_words(&words)),
            0 => {
                let mut ar = [0; offset::SOL_AR_NUM];
                ar.copy_from_slice(
                    &words[offset::SOL_AR_START..offset::SOL_AR_START + offset::SOL_AR_NUM],
                );
                Self::Solicited(SolicitedFrame {
                    pc: words[offset::SOL_PC],
                    ps: words[offset::SOL_PS],
                    ar,
                })
            }
            _ => {
                let mut frame = ExceptionFrame::from_words(&words);
                frame.exccause = INVALID_CAUSE_VALUE;
                frame.excvaddr = 0;
                Self::Interrupted(frame)
            }
        };
        Ok(frame)
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Crashed(_) => FrameKind::Crashed,
            Self::Interrupted(_) => FrameKind::Interrupted,
            Self::Solicited(_) => FrameKind::Solicited,
        }
    }
}

/// Register set in the layout of the host debugger's `.reg` note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFrame {
    pub pc: u32,
    pub ps: u32,
    pub lbeg: u32,
    pub lend: u32,
    pub lcount: u32,
    pub sar: u32,
    pub windowstart: u32,
    pub windowbase: u32,
    pub ar: [u32; NUM_AREGS],
}

impl Default for RegisterFrame {
    fn default() -> Self {
        Self {
            pc: 0,
            ps: 0,
            lbeg: 0,
            lend: 0,
            lcount: 0,
            sar: 0,
            windowstart: 0,
            windowbase: 0,
            ar: [0; NUM_AREGS],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub kind: FrameKind,
    pub regs: RegisterFrame,
    pub exception: Option<ExceptionInfo>,
}

/// Bit 31 flags a windowed call in a saved return address.
fn strip_call_marker(value: u32) -> u32 {
    if value & 0x8000_0000 != 0 {
        value & 0x3FFF_FFFF
    } else {
        value
    }
}

pub struct FrameDecoder<'a> {
    core: XtensaCore,
    sregs: &'a dyn SpecialRegisters,
}

impl<'a> FrameDecoder<'a> {
    pub fn new(core: XtensaCore, sregs: &'a dyn SpecialRegisters) -> Self {
        Self { core, sregs }
    }

    /// EPS of levels 2..=N followed by EPC of levels 1..=N.
    pub fn interrupt_registers(&self) -> ExtraRegisters {
        let levels = self.core.num_int_levels.min(MAX_INT_LEVELS);
        let mut extra = ExtraRegisters::new();
        for level in 2..=levels {
            let index = sr::eps(level);
            extra.push(RegPair::new(index, self.sregs.read_sr(index)));
        }
        for level in 1..=levels {
            let index = sr::epc(level);
            extra.push(RegPair::new(index, self.sregs.read_sr(index)));
        }
        extra
    }

    pub fn decode(&self, frame: &StackFrame) -> DecodedFrame {
        let mut regs = RegisterFrame::default();
        let mut exception = None;

        match frame {
            StackFrame::Crashed(f) | StackFrame::Interrupted(f) => {
                regs.pc = f.pc;
                regs.ar[..offset::STK_AR_NUM].copy_from_slice(&f.ar);
                regs.sar = f.sar;
                if self.core.loop_registers {
                    regs.lbeg = f.lbeg;
                    regs.lend = f.lend;
                    regs.lcount = f.lcount;
                }
                // The host unwinder cannot step through EXCM on a thread that
                // is back in user mode, so drop the flag there.
                let mut ps = Ps::from_bits_retain(f.ps);
                if ps.contains(Ps::UM) {
                    ps.remove(Ps::EXCM);
                }
                regs.ps = ps.bits();
                if let StackFrame::Crashed(_) = frame {
                    exception = Some(ExceptionInfo {
                        exccause: RegPair::new(sr::EXCCAUSE, f.exccause),
                        excvaddr: RegPair::new(sr::EXCVADDR, f.excvaddr),
                        extra: self.interrupt_registers(),
                    });
                }
            }
            StackFrame::Solicited(f) => {
                regs.pc = strip_call_marker(f.pc);
                regs.ps = f.ps;
                regs.ar[..offset::SOL_AR_NUM].copy_from_slice(&f.ar);
                regs.ar[0] = strip_call_marker(f.ar[0]);
            }
        }

        DecodedFrame {
            kind: frame.kind(),
            regs,
            exception,
        }
    }

    pub fn decode_bytes(&self, bytes: &[u8]) -> DumpResult<DecodedFrame> {
        Ok(self.decode(&StackFrame::parse(bytes)?))
    }

    /// Decodes the frame at the top of `view`.
    ///
    /// Interrupted frames get their cause fields reset in target memory as
    /// well, so the dumped stack bytes agree with the decoded registers.
    pub fn decode_at(
        &self,
        memory: &mut dyn TargetMemory,
        view: &StackView,
    ) -> DumpResult<DecodedFrame> {
        if (view.len as usize) < EXC_FRAME_SIZE {
            tracing::error!("Too small stack to keep frame: {} bytes!", view.len);
            return Err(DumpError::InsufficientBuffer {
                needed: EXC_FRAME_SIZE,
                available: view.len as usize,
            });
        }

        let mut bytes = [0u8; EXC_FRAME_SIZE];
        match view.source {
            StackSource::Synthetic => bytes = crate::stack::fake_frame(),
            StackSource::Memory => memory.read_bytes(view.vaddr, &mut bytes)?,
        }

        let frame = StackFrame::parse(&bytes)?;
        if let (StackFrame::Interrupted(f), StackSource::Memory) = (&frame, view.source) {
            let base = view.vaddr;
            memory.write_u32(base + 4 * offset::STK_EXCCAUSE as u32, f.exccause)?;
            memory.write_u32(base + 4 * offset::STK_EXCVADDR as u32, f.excvaddr)?;
        }
        Ok(self.decode(&frame))
    }
}

/// Saved special registers indexed by register number.
#[derive(Debug, Clone)]
pub struct SpecialRegisterFile {
    regs: [u32; 256],
}

impl Default for SpecialRegisterFile {
    fn default() -> Self {
        Self { regs: [0; 256] }
    }
}

impl SpecialRegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: u32, value: u32) {
        if let Some(slot) = self.regs.get_mut(index as usize) {
            *slot = value;
        }
    }
}

impl SpecialRegisters for SpecialRegisterFile {
    fn read_sr(&self, index: u32) -> u32 {
        self.regs.get(index as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn frame_bytes(words: &[(usize, u32)]) -> [u8; EXC_FRAME_SIZE] {
        let mut bytes = [0u8; EXC_FRAME_SIZE];
        for &(idx, value) in words {
            bytes[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    fn exception_words(exit: u32) -> Vec<(usize, u32)> {
        let mut words = vec![
            (offset::EXIT, exit),
            (offset::STK_PC, 0x400D_1234),
            (offset::STK_PS, 0x0006_0030),
            (offset::STK_SAR, 7),
            (offset::STK_EXCCAUSE, 28),
            (offset::STK_EXCVADDR, 0x0000_0004),
            (offset::STK_LBEG, 0x400D_0000),
            (offset::STK_LEND, 0x400D_0010),
            (offset::STK_LCOUNT, 3),
        ];
        for i in 0..16 {
            words.push((offset::STK_AR_START + i, 0x1000 + i as u32));
        }
        words
    }

    fn sregs() -> SpecialRegisterFile {
        let mut sregs = SpecialRegisterFile::new();
        for level in 1..=7 {
            sregs.set(sr::epc(level), 0x4000_0000 + level as u32);
        }
        for level in 2..=7 {
            sregs.set(sr::eps(level), 0x20 + level as u32);
        }
        sregs
    }

    #[test]
    fn test_insufficient_size() {
        let sregs = sregs();
        let decoder = FrameDecoder::new(XtensaCore::default(), &sregs);
        let err = decoder.decode_bytes(&[0u8; EXC_FRAME_SIZE - 4]).unwrap_err();
        assert!(matches!(
            err,
            DumpError::InsufficientBuffer {
                needed: EXC_FRAME_SIZE,
                available: 108
            }
        ));
    }

    #[test]
    fn test_crashed_frame_extra_registers() {
        let sregs = sregs();
        let bytes = frame_bytes(&exception_words(CURRENT_TASK_MARKER));

        for levels in [1u8, 2, MAX_INT_LEVELS] {
            let core = XtensaCore {
                num_int_levels: levels,
                loop_registers: true,
            };
            let decoded = FrameDecoder::new(core, &sregs).decode_bytes(&bytes).unwrap();
            assert_eq!(decoded.kind, FrameKind::Crashed);

            let info = decoded.exception.unwrap();
            assert_eq!(info.exccause, RegPair::new(sr::EXCCAUSE, 28));
            assert_eq!(info.excvaddr, RegPair::new(sr::EXCVADDR, 4));

            let extra = info.extra.as_slice();
            let epc: Vec<_> = extra.iter().filter(|p| p.index < sr::EPS_2).collect();
            let eps: Vec<_> = extra.iter().filter(|p| p.index >= sr::EPS_2).collect();
            assert_eq!(epc.len(), levels as usize);
            assert_eq!(eps.len(), levels as usize - 1);

            // EPS pairs come first, then EPC, each in level order.
            assert_eq!(extra.last().unwrap().index, sr::epc(levels));
            assert_eq!(extra.last().unwrap().value, 0x4000_0000 + levels as u32);
            if levels > 1 {
                assert_eq!(extra[0], RegPair::new(sr::eps(2), 0x22));
            }
        }
    }

    #[test]
    fn test_int_levels_are_capped() {
        let sregs = sregs();
        let core = XtensaCore {
            num_int_levels: 12,
            loop_registers: true,
        };
        let extra = FrameDecoder::new(core, &sregs).interrupt_registers();
        assert_eq!(extra.len(), 13);
        assert!(extra.len() <= EXTRA_REG_NUM);
    }

    #[test]
    fn test_interrupted_frame_resets_cause() {
        let sregs = sregs();
        let bytes = frame_bytes(&exception_words(0x4000_0100));
        let frame = StackFrame::parse(&bytes).unwrap();
        let StackFrame::Interrupted(f) = frame else {
            panic!("expected interrupted frame, got {:?}", frame);
        };
        assert_eq!(f.exccause, INVALID_CAUSE_VALUE);
        assert_eq!(f.excvaddr, 0);

        let decoded = FrameDecoder::new(XtensaCore::default(), &sregs).decode(&frame);
        assert!(decoded.exception.is_none());
        assert_eq!(decoded.regs.pc, 0x400D_1234);
        assert_eq!(decoded.regs.sar, 7);
        assert_eq!(decoded.regs.lcount, 3);
        assert_eq!(&decoded.regs.ar[..16], &(0x1000..0x1010).collect::<Vec<u32>>()[..]);
        assert!(decoded.regs.ar[16..].iter().all(|r| *r == 0));
    }

    #[test]
    fn test_loop_registers_follow_core_variant() {
        let sregs = sregs();
        let bytes = frame_bytes(&exception_words(1));
        let core = XtensaCore {
            num_int_levels: 6,
            loop_registers: false,
        };
        let decoded = FrameDecoder::new(core, &sregs).decode_bytes(&bytes).unwrap();
        assert_eq!((decoded.regs.lbeg, decoded.regs.lend, decoded.regs.lcount), (0, 0, 0));
    }

    #[test]
    fn test_user_mode_clears_excm() {
        let sregs = sregs();
        let decoder = FrameDecoder::new(XtensaCore::default(), &sregs);

        let user = frame_bytes(&[(offset::EXIT, 1), (offset::STK_PS, 0x0006_0030)]);
        assert_eq!(decoder.decode_bytes(&user).unwrap().regs.ps, 0x0006_0020);

        // Kernel mode keeps EXCM.
        let kernel = frame_bytes(&[(offset::EXIT, 1), (offset::STK_PS, 0x0000_0013)]);
        assert_eq!(decoder.decode_bytes(&kernel).unwrap().regs.ps, 0x0000_0013);

        let crashed = frame_bytes(&exception_words(CURRENT_TASK_MARKER));
        assert_eq!(decoder.decode_bytes(&crashed).unwrap().regs.ps, 0x0006_0020);
    }

    #[test]
    fn test_solicited_frame_keeps_ps() {
        let sregs = sregs();
        let decoder = FrameDecoder::new(XtensaCore::default(), &sregs);

        let bytes = frame_bytes(&[
            (offset::SOL_PC, 0x400D_2345),
            (offset::SOL_PS, (Ps::UM | Ps::EXCM).bits()),
        ]);
        let decoded = decoder.decode_bytes(&bytes).unwrap();
        assert_eq!(decoded.kind, FrameKind::Solicited);
        assert_eq!(decoded.regs.ps, 0x30);
    }

    #[test]
    fn test_solicited_frame_strips_call_marker() {
        let sregs = sregs();
        let decoder = FrameDecoder::new(XtensaCore::default(), &sregs);

        let marked = frame_bytes(&[
            (offset::SOL_PC, 0x800D_2345),
            (offset::SOL_PS, 0x0000_0001),
            (offset::SOL_NEXT, 0xAAAA_AAAA),
            (offset::SOL_AR_START, 0xC00D_3456),
            (offset::SOL_AR_START + 1, 0x3FFB_4000),
            (offset::SOL_AR_START + 2, 0x8000_0001),
            (offset::SOL_AR_START + 3, 0x33),
            // Beyond the solicited frame; must not show up as a4.
            (offset::SOL_AR_START + 4, 0x4444),
        ]);
        let decoded = decoder.decode_bytes(&marked).unwrap();
        assert_eq!(decoded.kind, FrameKind::Solicited);
        assert_eq!(decoded.regs.pc, 0x000D_2345);
        assert_eq!(decoded.regs.ar[0], 0x000D_3456);
        assert_eq!(decoded.regs.ar[1], 0x3FFB_4000);
        // Only pc and a0 carry the marker.
        assert_eq!(decoded.regs.ar[2], 0x8000_0001);
        assert_eq!(decoded.regs.ar[3], 0x33);
        assert_eq!(decoded.regs.ar[4], 0);

        let plain = frame_bytes(&[
            (offset::SOL_PC, 0x400D_2345),
            (offset::SOL_AR_START, 0x400D_3456),
        ]);
        let decoded = decoder.decode_bytes(&plain).unwrap();
        assert_eq!(decoded.regs.pc, 0x400D_2345);
        assert_eq!(decoded.regs.ar[0], 0x400D_3456);
    }
}
