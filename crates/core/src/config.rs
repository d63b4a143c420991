// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::checksum::ChecksumKind;
use crate::frame::XtensaCore;
use crate::memory::{AddressRange, MemoryMap};
use crate::regions::{RegionCatalog, RegionClass};
use crate::stack::IsrStacks;
use anyhow::Context;
use labwired_coredump_config::{parse_size, TargetDescriptor};

/// Everything the capture path needs to know about the target, resolved once
/// before any episode runs.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub memory_map: MemoryMap,
    pub regions: RegionCatalog,
    pub core: XtensaCore,
    pub tcb_size: u32,
    pub max_task_stack_size: u32,
    pub checksum: ChecksumKind,
    pub max_tasks: usize,
    /// Stack the capture handler runs on; its untouched depth is reported.
    pub dump_stack: Option<AddressRange>,
    pub isr_stack: Option<IsrStacks>,
}

impl CaptureConfig {
    pub fn esp32() -> Self {
        let map = MemoryMap::esp32();
        let regions = RegionCatalog::new()
            .with_region(RegionClass::Rtc, 0x5000_0000, 0x5000_0000)
            .with_region(RegionClass::RtcFast, 0x3FF8_0000, 0x3FF8_0000);
        Self {
            memory_map: map,
            regions,
            core: XtensaCore::default(),
            tcb_size: 0x160,
            max_task_stack_size: 64 * 1024,
            checksum: ChecksumKind::Crc32,
            max_tasks: 64,
            dump_stack: None,
            isr_stack: None,
        }
    }

    /// Top of the interrupt stack `core_id` was running on, if one is configured.
    pub fn isr_stack_end(&self, core_id: u32) -> Option<u32> {
        self.isr_stack.and_then(|isr| isr.end(core_id))
    }

    pub fn from_descriptor(target: &TargetDescriptor) -> anyhow::Result<Self> {
        let max_task_stack_size = parse_size(&target.core.max_task_stack_size)
            .context("Invalid 'max_task_stack_size'")?;
        let max_task_stack_size = u32::try_from(max_task_stack_size)
            .context("'max_task_stack_size' does not fit a 32-bit target")?;

        let dump_stack = target
            .dump_stack
            .as_ref()
            .map(|range| range.bounds().map(|(start, end)| AddressRange::new(start, end)))
            .transpose()
            .context("Invalid 'dump_stack'")?;

        let isr_stack = target
            .isr_stack
            .as_ref()
            .map(|isr| {
                isr.resolve().map(|(base, size)| IsrStacks {
                    base,
                    size,
                    cores: isr.cores,
                })
            })
            .transpose()
            .context("Invalid 'isr_stack'")?;

        Ok(Self {
            memory_map: MemoryMap::from_config(&target.memory)?,
            regions: RegionCatalog::from_config(&target.dump_regions)?,
            core: XtensaCore {
                num_int_levels: target.core.num_int_levels,
                loop_registers: target.core.loop_registers,
            },
            tcb_size: target.core.tcb_size,
            max_task_stack_size,
            checksum: target.checksum.into(),
            max_tasks: target.core.max_tasks,
            dump_stack,
            isr_stack,
        })
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::esp32()
    }
}
