// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Core image serialization.
//!
//! Every byte except the trailer passes through the checksum accumulator on
//! its way to the sink, so the trailer covers exactly what precedes it.

use crate::checksum::{ChecksumAccumulator, ChecksumValue};
use crate::episode::{ExtraInfo, ThreadRecord};
use crate::frame::{RegisterFrame, EXTRA_REG_NUM, NUM_AREGS};
use crate::regions::RegionDescriptor;
use crate::stack::{fake_frame, StackSource};
use crate::{DumpResult, TargetMemory};
use std::io::Write;

pub const IMAGE_VERSION: u32 = 1;
/// ELF machine number of Xtensa.
pub const ARCH_XTENSA: u32 = 0x5E;

pub const HEADER_SIZE: u32 = 7 * 4;
pub const THREAD_HEADER_SIZE: u32 = 4 * 4;
pub const REGION_HEADER_SIZE: u32 = 2 * 4;

const PRSTATUS_SIZE: usize = 72;
const PRSTATUS_PID_OFFSET: usize = 24;
const GREGSET_WORDS: usize = 128;
const GREGSET_RESERVED: usize = GREGSET_WORDS - 8 - NUM_AREGS;
/// prstatus block, general register set and one trailing reserved word.
pub const REG_DUMP_SIZE: usize = PRSTATUS_SIZE + GREGSET_WORDS * 4 + 4;
pub const EXTRA_INFO_SIZE: usize = 4 + 2 * 8 + EXTRA_REG_NUM * 8;

pub const FLAG_CRASHED: u32 = 1 << 0;
pub const FLAG_REPAIRED: u32 = 1 << 1;

/// Bytes copied per target read.
const COPY_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub total_len: u32,
    pub thread_count: u32,
    pub tcb_size: u32,
    pub region_count: u32,
    pub region_size: u32,
}

/// Bytes one thread record occupies for a stack of `stack_len` bytes.
pub fn thread_record_len(tcb_size: u32, stack_len: u32) -> u32 {
    THREAD_HEADER_SIZE + REG_DUMP_SIZE as u32 + tcb_size + stack_len
}

pub fn encode_reg_dump(tcb: u32, regs: &RegisterFrame) -> [u8; REG_DUMP_SIZE] {
    let mut out = [0u8; REG_DUMP_SIZE];
    // Only pr_pid is meaningful; the signal fields stay zero.
    out[PRSTATUS_PID_OFFSET..PRSTATUS_PID_OFFSET + 4].copy_from_slice(&tcb.to_le_bytes());

    let head = [
        regs.pc,
        regs.ps,
        regs.lbeg,
        regs.lend,
        regs.lcount,
        regs.sar,
        regs.windowstart,
        regs.windowbase,
    ];
    let gregs = head
        .iter()
        .chain(std::iter::repeat(&0).take(GREGSET_RESERVED))
        .chain(regs.ar.iter());
    for (chunk, word) in out[PRSTATUS_SIZE..PRSTATUS_SIZE + GREGSET_WORDS * 4]
        .chunks_exact_mut(4)
        .zip(gregs)
    {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

pub fn encode_extra_info(info: &ExtraInfo) -> [u8; EXTRA_INFO_SIZE] {
    let mut out = [0u8; EXTRA_INFO_SIZE];
    let words = [
        info.crashed_tcb,
        info.exccause.index,
        info.exccause.value,
        info.excvaddr.index,
        info.excvaddr.value,
    ]
    .into_iter()
    .chain(
        info.extra
            .slots()
            .iter()
            .flat_map(|pair| [pair.index, pair.value]),
    );
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// Streams one image into `sink`.
pub struct ImageWriter<'a, W: Write> {
    sink: W,
    checksum: &'a mut ChecksumAccumulator,
    written: u32,
    unreadable: u32,
}

impl<'a, W: Write> ImageWriter<'a, W> {
    /// `checksum` must already be initialized for this episode.
    pub fn new(sink: W, checksum: &'a mut ChecksumAccumulator) -> Self {
        Self {
            sink,
            checksum,
            written: 0,
            unreadable: 0,
        }
    }

    /// Bytes written so far, trailer included once [`finish`](Self::finish) ran.
    pub fn written(&self) -> u32 {
        self.written
    }

    /// Target bytes that could not be read and were emitted as zero.
    pub fn unreadable(&self) -> u32 {
        self.unreadable
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> DumpResult<()> {
        self.checksum.update(data)?;
        self.sink.write_all(data)?;
        self.written = self.written.wrapping_add(data.len() as u32);
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> DumpResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_header(&mut self, header: &ImageHeader) -> DumpResult<()> {
        for word in [
            header.total_len,
            IMAGE_VERSION,
            ARCH_XTENSA,
            header.thread_count,
            header.tcb_size,
            header.region_count,
            header.region_size,
        ] {
            self.write_u32(word)?;
        }
        Ok(())
    }

    pub fn write_thread(
        &mut self,
        memory: &dyn TargetMemory,
        record: &ThreadRecord,
        tcb_size: u32,
    ) -> DumpResult<()> {
        let mut flags = 0;
        if record.crashed {
            flags |= FLAG_CRASHED;
        }
        if record.repaired {
            flags |= FLAG_REPAIRED;
        }
        for word in [
            record.snapshot.tcb,
            record.snapshot.stack_start,
            record.snapshot.stack_end,
            flags,
        ] {
            self.write_u32(word)?;
        }
        self.write_bytes(&encode_reg_dump(record.snapshot.tcb, &record.regs))?;
        self.write_memory(memory, record.snapshot.tcb, tcb_size)?;

        let view = record.stack;
        match view.source {
            StackSource::Memory => self.write_memory(memory, view.vaddr, view.len),
            StackSource::Synthetic => self.write_bytes(&fake_frame()),
        }
    }

    pub fn write_region(
        &mut self,
        memory: &dyn TargetMemory,
        region: &RegionDescriptor,
    ) -> DumpResult<()> {
        tracing::debug!(
            "Dump {:?} region {:#x}..{:#x}",
            region.class,
            region.start,
            region.start.wrapping_add(region.len)
        );
        self.write_u32(region.start)?;
        self.write_u32(region.len)?;
        self.write_memory(memory, region.start, region.len)
    }

    pub fn write_extra_info(&mut self, info: &ExtraInfo) -> DumpResult<()> {
        self.write_bytes(&encode_extra_info(info))
    }

    /// Copies target memory through a fixed scratch buffer. Unreadable bytes
    /// become zero so the layout announced in the header still holds.
    pub fn write_memory(
        &mut self,
        memory: &dyn TargetMemory,
        addr: u32,
        len: u32,
    ) -> DumpResult<()> {
        let mut scratch = [0u8; COPY_CHUNK];
        let mut missing = 0u32;
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(COPY_CHUNK as u32) as usize;
            let at = addr.wrapping_add(done);
            let chunk = &mut scratch[..n];
            if memory.read_bytes(at, chunk).is_err() {
                for (i, byte) in chunk.iter_mut().enumerate() {
                    *byte = match memory.read_u8(at.wrapping_add(i as u32)) {
                        Ok(value) => value,
                        Err(_) => {
                            missing += 1;
                            0
                        }
                    };
                }
            }
            self.write_bytes(chunk)?;
            done += n as u32;
        }
        if missing > 0 {
            tracing::warn!(
                "{} of {} bytes at {:#x} unreadable, written as zero",
                missing,
                len,
                addr
            );
            self.unreadable += missing;
        }
        Ok(())
    }

    /// Finalizes the checksum and appends it, unhashed, as the trailer.
    pub fn finish(mut self) -> DumpResult<ChecksumValue> {
        let value = self.checksum.finalize()?;
        self.sink.write_all(value.as_bytes())?;
        self.sink.flush()?;
        self.written = self.written.wrapping_add(value.as_bytes().len() as u32);
        tracing::debug!("Core image complete: {} bytes", self.written);
        Ok(value)
    }
}
