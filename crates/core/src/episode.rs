// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! One capture episode: thread checks, frame decoding and image emission.

use crate::checksum::{ChecksumAccumulator, ChecksumValue};
use crate::config::CaptureConfig;
use crate::frame::{
    offset, sr, ExceptionInfo, ExtraRegisters, FrameDecoder, FrameKind, RegPair, RegisterFrame,
    CURRENT_TASK_MARKER, EXCCAUSE_NUM, EXC_FRAME_SIZE, INVALID_CAUSE_VALUE,
};
use crate::image::{
    thread_record_len, ImageHeader, ImageWriter, EXTRA_INFO_SIZE, HEADER_SIZE,
    REGION_HEADER_SIZE,
};
use crate::regions::{RegionClass, RegionDescriptor};
use crate::sanity::SanityOracle;
use crate::snapshot::{Scheduler, ThreadSnapshot};
use crate::stack::{
    check_stack, free_stack_space, resolve_stack, FakeStackAllocator, StackUsage, StackView,
};
use crate::{DumpError, DumpResult, SpecialRegisters, TargetMemory};
use serde::Serialize;
use std::io::Write;

/// How the fault was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultContext {
    /// Address of the exception frame the trap pushed.
    pub frame: u32,
    /// The trap hit while an interrupt handler was running.
    pub in_isr: bool,
    /// Software-raised cause (e.g. interrupt watchdog) sharing a hardware cause number.
    pub pseudo_cause: bool,
    pub core_id: u32,
}

/// Crash-wide state written once at the end of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtraInfo {
    pub crashed_tcb: u32,
    pub exccause: RegPair,
    pub excvaddr: RegPair,
    pub extra: ExtraRegisters,
}

impl ExtraInfo {
    pub fn new() -> Self {
        Self {
            crashed_tcb: CURRENT_TASK_MARKER,
            exccause: RegPair::new(sr::EXCCAUSE, INVALID_CAUSE_VALUE),
            excvaddr: RegPair::new(sr::EXCVADDR, 0),
            extra: ExtraRegisters::new(),
        }
    }

    fn record_exception(&mut self, info: &ExceptionInfo) {
        self.exccause = info.exccause;
        self.excvaddr = info.excvaddr;
        self.extra = info.extra;
    }

    /// TCB of the crashed thread, if one was found.
    pub fn crashed_tcb(&self) -> Option<u32> {
        (self.crashed_tcb != CURRENT_TASK_MARKER).then_some(self.crashed_tcb)
    }
}

impl Default for ExtraInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread that passed the checks and goes into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRecord {
    /// Bounds after repair; a repaired thread points into the synthetic window.
    pub snapshot: ThreadSnapshot,
    pub stack: StackView,
    pub crashed: bool,
    pub repaired: bool,
    /// `None` until decoded, or if the frame could not be read.
    pub kind: Option<FrameKind>,
    pub regs: RegisterFrame,
}

/// Per-episode state. Buffers are sized up front so nothing allocates once
/// the episode is running.
#[derive(Debug)]
pub struct EpisodeContext {
    snapshots: Vec<ThreadSnapshot>,
    records: Vec<ThreadRecord>,
    fake_stacks: FakeStackAllocator,
    extra_info: ExtraInfo,
    checksum: ChecksumAccumulator,
    skipped: u32,
}

impl EpisodeContext {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            snapshots: vec![ThreadSnapshot::default(); config.max_tasks],
            records: Vec::with_capacity(config.max_tasks),
            fake_stacks: FakeStackAllocator::new(),
            extra_info: ExtraInfo::new(),
            checksum: ChecksumAccumulator::new(config.checksum),
            skipped: 0,
        }
    }

    fn reset(&mut self) {
        self.records.clear();
        self.fake_stacks = FakeStackAllocator::new();
        self.extra_info = ExtraInfo::new();
        self.checksum.init();
        self.skipped = 0;
    }

    pub fn records(&self) -> &[ThreadRecord] {
        &self.records
    }

    pub fn extra_info(&self) -> &ExtraInfo {
        &self.extra_info
    }

    pub fn checksum(&self) -> &ChecksumAccumulator {
        &self.checksum
    }

    pub fn fake_stacks_issued(&self) -> u32 {
        self.fake_stacks.issued()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeSummary {
    pub image_len: u32,
    /// Bytes covered by the checksum, i.e. everything but the trailer.
    pub hashed_len: u32,
    pub threads: u32,
    pub skipped: u32,
    pub repaired: u32,
    pub crashed_tcb: Option<u32>,
    pub checksum: ChecksumValue,
    pub unreadable_bytes: u32,
    pub dump_stack: Option<StackUsage>,
    /// Interrupt stack slice dumped for a fault taken in an ISR.
    pub isr_stack: Option<RegionDescriptor>,
}

pub struct CoreDumper {
    config: CaptureConfig,
}

impl CoreDumper {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn new_context(&self) -> EpisodeContext {
        EpisodeContext::new(&self.config)
    }

    /// Runs one full episode and streams the image into `sink`.
    pub fn run<W: Write>(
        &self,
        ctx: &mut EpisodeContext,
        scheduler: &dyn Scheduler,
        memory: &mut dyn TargetMemory,
        sregs: &dyn SpecialRegisters,
        fault: &FaultContext,
        sink: W,
    ) -> DumpResult<EpisodeSummary> {
        ctx.reset();

        let found = scheduler.snapshot_all(&mut ctx.snapshots);
        let current = scheduler.current_thread(fault.core_id);
        tracing::debug!("Found tasks: {}", found);

        for i in 0..found {
            let task = ctx.snapshots[i];
            match self.check_thread(ctx, memory, task, current, fault) {
                Some(record) => ctx.records.push(record),
                None => ctx.skipped += 1,
            }
        }

        let isr_stack = self.isr_stack_region(fault);

        let tcb_size = self.config.tcb_size;
        let regions = &self.config.regions;
        let total_len = ctx
            .records
            .iter()
            .map(|r| thread_record_len(tcb_size, r.stack.len))
            .chain(
                regions
                    .regions()
                    .chain(isr_stack)
                    .map(|r| REGION_HEADER_SIZE + r.len),
            )
            .fold(HEADER_SIZE, u32::wrapping_add)
            .wrapping_add(EXTRA_INFO_SIZE as u32)
            .wrapping_add(self.config.checksum.digest_len() as u32);

        let header = ImageHeader {
            total_len,
            thread_count: ctx.records.len() as u32,
            tcb_size,
            region_count: regions.region_count() + u32::from(isr_stack.is_some()),
            region_size: regions
                .region_size()
                .saturating_add(isr_stack.map_or(0, |r| r.len)),
        };
        tracing::debug!(
            "Core dump length = {}, tasks = {}, regions = {}",
            header.total_len,
            header.thread_count,
            header.region_count
        );

        let mut writer = ImageWriter::new(sink, &mut ctx.checksum);
        writer.write_header(&header)?;

        for record in ctx.records.iter_mut() {
            self.capture_thread(record, memory, sregs, &mut ctx.extra_info);
            writer.write_thread(memory, record, tcb_size)?;
        }
        if let Some(region) = &isr_stack {
            self.capture_isr_frame(region, memory, sregs, &mut ctx.extra_info);
        }
        for region in regions.regions().chain(isr_stack) {
            writer.write_region(memory, &region)?;
        }
        writer.write_extra_info(&ctx.extra_info)?;

        let unreadable_bytes = writer.unreadable();
        let checksum = writer.finish()?;
        let hashed_len = ctx.checksum.total_len();

        let dump_stack = self.config.dump_stack.map(|range| {
            let usage = free_stack_space(memory, range);
            tracing::debug!(
                "Core dump used {} bytes on stack. {} bytes left free.",
                usage.used,
                usage.free
            );
            usage
        });

        Ok(EpisodeSummary {
            image_len: hashed_len.wrapping_add(checksum.as_bytes().len() as u32),
            hashed_len,
            threads: ctx.records.len() as u32,
            skipped: ctx.skipped,
            repaired: ctx.records.iter().filter(|r| r.repaired).count() as u32,
            crashed_tcb: ctx.extra_info.crashed_tcb(),
            checksum,
            unreadable_bytes,
            dump_stack,
            isr_stack,
        })
    }

    /// The faulting core's interrupt stack from the exception frame up to
    /// its top. Only faults taken in an ISR have one.
    fn isr_stack_region(&self, fault: &FaultContext) -> Option<RegionDescriptor> {
        if !fault.in_isr {
            return None;
        }
        let (isr, end) = match (self.config.isr_stack, self.config.isr_stack_end(fault.core_id)) {
            (Some(isr), Some(end)) => (isr, end),
            _ => {
                tracing::warn!("No ISR stack for core {}", fault.core_id);
                return None;
            }
        };
        let start = end - isr.size;
        if fault.frame < start || fault.frame >= end {
            tracing::warn!(
                "Exception frame {:#x} is outside ISR stack {:#x}..{:#x}",
                fault.frame,
                start,
                end
            );
            return None;
        }
        tracing::debug!("ISR stack {:#x}..{:#x}", fault.frame, end);
        Some(RegionDescriptor {
            class: RegionClass::IsrStack,
            start: fault.frame,
            len: end - fault.frame,
        })
    }

    /// Pass one for a single thread. Marks the crashed thread and swaps a
    /// corrupted stack for a synthetic one. `None` means the thread is left
    /// out of the image.
    pub fn check_thread(
        &self,
        ctx: &mut EpisodeContext,
        memory: &mut dyn TargetMemory,
        mut task: ThreadSnapshot,
        current: u32,
        fault: &FaultContext,
    ) -> Option<ThreadRecord> {
        let oracle = SanityOracle::new(&self.config.memory_map, self.config.tcb_size);
        if !oracle.tcb_address_is_sane(task.tcb) {
            tracing::warn!("Skip task with bad TCB addr {:#x}", task.tcb);
            return None;
        }

        let crashed = task.tcb == current;
        if crashed {
            ctx.extra_info.crashed_tcb = task.tcb;
            if let Err(e) = self.mark_crashed(memory, &mut task, fault) {
                tracing::error!("Failed to tag exception frame at {:#x}: {}", fault.frame, e);
            }
        }

        let mut repaired = false;
        if let Err(e) = self.validate_stack(&oracle, &task) {
            if crashed {
                tracing::warn!("Current task {:#x} is broken!", task.tcb);
            }
            tracing::warn!("{}. Replaced with fake stack.", e);
            match ctx.fake_stacks.allocate() {
                Ok(slot) => {
                    task.stack_start = slot.start;
                    task.stack_end = slot.end;
                    repaired = true;
                }
                Err(e) => {
                    tracing::error!("Skip task {:#x}: {}", task.tcb, e);
                    return None;
                }
            }
        }

        Some(ThreadRecord {
            snapshot: task,
            stack: resolve_stack(&task),
            crashed,
            repaired,
            kind: None,
            regs: RegisterFrame::default(),
        })
    }

    fn mark_crashed(
        &self,
        memory: &mut dyn TargetMemory,
        task: &mut ThreadSnapshot,
        fault: &FaultContext,
    ) -> DumpResult<()> {
        tracing::debug!("Task {:#x} is first crashed task.", task.tcb);
        if !fault.in_isr {
            task.stack_start = fault.frame;
        }
        memory.write_u32(fault.frame, CURRENT_TASK_MARKER)?;
        if fault.pseudo_cause {
            let at = fault.frame.wrapping_add(4 * offset::STK_EXCCAUSE as u32);
            let cause = memory.read_u32(at)?;
            memory.write_u32(at, cause.wrapping_add(EXCCAUSE_NUM))?;
        }
        Ok(())
    }

    /// A stack too short to hold a frame cannot be decoded and is treated
    /// like any other corruption.
    fn validate_stack(&self, oracle: &SanityOracle<'_>, task: &ThreadSnapshot) -> DumpResult<()> {
        let (start, end) = (task.stack_start, task.stack_end);
        let sane = check_stack(oracle, start, end, self.config.max_task_stack_size)
            && end.wrapping_sub(start) >= EXC_FRAME_SIZE as u32;
        if sane {
            Ok(())
        } else {
            Err(DumpError::CorruptStack {
                tcb: task.tcb,
                start,
                end,
            })
        }
    }

    /// Pass two for a single thread: decodes its saved frame. The crashed
    /// thread's exception state goes into `extra_info`.
    pub fn capture_thread(
        &self,
        record: &mut ThreadRecord,
        memory: &mut dyn TargetMemory,
        sregs: &dyn SpecialRegisters,
        extra_info: &mut ExtraInfo,
    ) {
        let decoder = FrameDecoder::new(self.config.core, sregs);
        match decoder.decode_at(memory, &record.stack) {
            Ok(decoded) => {
                tracing::debug!(
                    "Task {:#x}: {:?} frame, PC {:#x}, PS {:#x}, A0 {:#x}, SP {:#x}",
                    record.snapshot.tcb,
                    decoded.kind,
                    decoded.regs.pc,
                    decoded.regs.ps,
                    decoded.regs.ar[0],
                    decoded.regs.ar[1]
                );
                record.kind = Some(decoded.kind);
                record.regs = decoded.regs;
                if let (true, Some(info)) = (record.crashed, decoded.exception.as_ref()) {
                    extra_info.record_exception(info);
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to get registers of task {:#x}: {}",
                    record.snapshot.tcb,
                    e
                );
            }
        }
    }

    /// Decodes the frame at the bottom of the ISR stack slice. A fault taken
    /// in an ISR leaves the crashed thread's own stack without the exception
    /// state, so it is recovered from here.
    fn capture_isr_frame(
        &self,
        region: &RegionDescriptor,
        memory: &dyn TargetMemory,
        sregs: &dyn SpecialRegisters,
        extra_info: &mut ExtraInfo,
    ) {
        let mut bytes = [0u8; EXC_FRAME_SIZE];
        let len = (region.len as usize).min(EXC_FRAME_SIZE);
        let decoder = FrameDecoder::new(self.config.core, sregs);
        let decoded = memory
            .read_bytes(region.start, &mut bytes[..len])
            .and_then(|_| decoder.decode_bytes(&bytes[..len]));
        match decoded {
            Ok(decoded) => {
                tracing::debug!(
                    "ISR frame at {:#x}: {:?}, PC {:#x}",
                    region.start,
                    decoded.kind,
                    decoded.regs.pc
                );
                if let Some(info) = decoded.exception.as_ref() {
                    extra_info.record_exception(info);
                }
            }
            Err(e) => {
                tracing::error!("Failed to get ISR frame at {:#x}: {}", region.start, e);
            }
        }
    }
}
