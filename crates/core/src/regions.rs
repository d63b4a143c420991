// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{DumpError, DumpResult};
use labwired_coredump_config::DumpRegionsConfig;
use serde::Serialize;

/// RAM regions that are dumped verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionClass {
    Dram,
    Iram,
    Rtc,
    RtcFast,
    /// Live part of the interrupt stack a fault was taken on. Sized per
    /// episode, after the linker sections.
    IsrStack,
}

impl RegionClass {
    /// Linker sections, in emission order.
    pub const ALL: [RegionClass; 4] = [Self::Dram, Self::Iram, Self::Rtc, Self::RtcFast];
    const COUNT: usize = 5;

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionDescriptor {
    pub class: RegionClass,
    pub start: u32,
    pub len: u32,
}

/// Region bounds as `(start, end)`. The linker is trusted; only the length is
/// checked, and an end below the start counts as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionCatalog {
    bounds: [Option<(u32, u32)>; RegionClass::COUNT],
}

impl RegionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, class: RegionClass, start: u32, end: u32) -> Self {
        self.bounds[class.slot()] = Some((start, end));
        self
    }

    pub fn from_config(config: &DumpRegionsConfig) -> anyhow::Result<Self> {
        let mut catalog = Self::new();
        let entries = [
            (RegionClass::Dram, &config.dram),
            (RegionClass::Iram, &config.iram),
            (RegionClass::Rtc, &config.rtc),
            (RegionClass::RtcFast, &config.rtc_fast),
        ];
        for (class, range) in entries {
            if let Some(range) = range {
                let (start, end) = range.bounds()?;
                catalog = catalog.with_region(class, start, end);
            }
        }
        Ok(catalog)
    }

    pub fn region_info(&self, class: RegionClass) -> DumpResult<RegionDescriptor> {
        let (start, end) =
            self.bounds[class.slot()].ok_or(DumpError::UnknownRegionClass(class))?;
        Ok(RegionDescriptor {
            class,
            start,
            len: end.saturating_sub(start),
        })
    }

    /// Configured regions with a non-zero length, in emission order.
    pub fn regions(&self) -> impl Iterator<Item = RegionDescriptor> + '_ {
        RegionClass::ALL
            .into_iter()
            .filter_map(|class| self.region_info(class).ok())
            .filter(|region| region.len > 0)
    }

    pub fn region_count(&self) -> u32 {
        self.regions().count() as u32
    }

    pub fn region_size(&self) -> u32 {
        self.regions()
            .fold(0u32, |total, region| total.saturating_add(region.len))
    }
}
