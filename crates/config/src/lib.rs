use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryRange {
    pub base: u64,
    pub size: String, // e.g. "320 KiB"
}

impl MemoryRange {
    /// Resolves the range into `(start, end)` with `end` exclusive.
    pub fn bounds(&self) -> Result<(u32, u32)> {
        let size = parse_size(&self.size)
            .with_context(|| format!("Invalid size for range at {:#x}", self.base))?;
        let start = u32::try_from(self.base)
            .with_context(|| format!("Range base {:#x} is not a 32-bit address", self.base))?;
        // The exclusive end must itself be a 32-bit address, so the last byte
        // of the address space cannot be covered.
        let end = self
            .base
            .checked_add(size)
            .and_then(|end| u32::try_from(end).ok())
            .with_context(|| format!("Range at {:#x} overflows the address space", self.base))?;
        Ok((start, end))
    }
}

/// Interrupt stacks, one block of `size` bytes per core laid out from `base`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct IsrStackConfig {
    pub base: u64,
    /// Per-core size, e.g. "2 KiB".
    pub size: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
}

impl IsrStackConfig {
    /// Resolves into `(base, per-core size)`. Every core's block must end
    /// inside the 32-bit address space.
    pub fn resolve(&self) -> Result<(u32, u32)> {
        if self.cores == 0 {
            anyhow::bail!("ISR stack needs at least one core");
        }
        let size = parse_size(&self.size)
            .with_context(|| format!("Invalid size for ISR stack at {:#x}", self.base))?;
        let base = u32::try_from(self.base)
            .with_context(|| format!("ISR stack base {:#x} is not a 32-bit address", self.base))?;
        let size = u32::try_from(size)
            .with_context(|| format!("ISR stack size {} does not fit a 32-bit target", size))?;
        let end = u64::from(base) + u64::from(size) * u64::from(self.cores);
        if end > u64::from(u32::MAX) {
            anyhow::bail!(
                "ISR stacks at {:#x} overflow the address space for {} cores",
                base,
                self.cores
            );
        }
        Ok((base, size))
    }
}

fn default_cores() -> u32 {
    1
}

/// Memory classes a thread control block or stack may legitimately live in.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MemoryMapConfig {
    pub dram: MemoryRange,
    #[serde(default)]
    pub iram: Option<MemoryRange>,
    #[serde(default)]
    pub rtc_slow: Option<MemoryRange>,
    #[serde(default)]
    pub rtc_fast: Option<MemoryRange>,
    /// IRAM is only treated as data memory when the chip allows byte access to it.
    #[serde(default)]
    pub iram_data_access: bool,
}

/// Linker-defined regions whose contents go into the dump.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct DumpRegionsConfig {
    #[serde(default)]
    pub dram: Option<MemoryRange>,
    #[serde(default)]
    pub iram: Option<MemoryRange>,
    #[serde(default)]
    pub rtc: Option<MemoryRange>,
    #[serde(default)]
    pub rtc_fast: Option<MemoryRange>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CoreOptions {
    #[serde(default = "default_num_int_levels")]
    pub num_int_levels: u8,
    /// Zero-overhead loop option (LBEG/LEND/LCOUNT).
    #[serde(default = "default_true")]
    pub loop_registers: bool,
    #[serde(default = "default_tcb_size")]
    pub tcb_size: u32,
    #[serde(default = "default_max_task_stack_size")]
    pub max_task_stack_size: String,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            num_int_levels: default_num_int_levels(),
            loop_registers: true,
            tcb_size: default_tcb_size(),
            max_task_stack_size: default_max_task_stack_size(),
            max_tasks: default_max_tasks(),
        }
    }
}

fn default_num_int_levels() -> u8 {
    6
}

fn default_true() -> bool {
    true
}

fn default_tcb_size() -> u32 {
    0x160
}

fn default_max_task_stack_size() -> String {
    "64 KiB".to_string()
}

fn default_max_tasks() -> usize {
    64
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    #[default]
    Crc32,
    Sha256,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TargetDescriptor {
    pub name: String,
    pub arch: String, // e.g. "xtensa-lx6"
    pub memory: MemoryMapConfig,
    #[serde(default)]
    pub dump_regions: DumpRegionsConfig,
    #[serde(default)]
    pub core: CoreOptions,
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,
    /// Stack the capture handler itself runs on, pre-filled with a marker byte.
    #[serde(default)]
    pub dump_stack: Option<MemoryRange>,
    /// Interrupt stacks; a fault taken in an ISR dumps the live part of its core's block.
    #[serde(default)]
    pub isr_stack: Option<IsrStackConfig>,
}

impl TargetDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open target descriptor at {:?}", path.as_ref()))?;
        let target: Self =
            serde_yaml::from_reader(f).context("Failed to parse Target Descriptor")?;
        target.validate()?;
        Ok(target)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.arch.starts_with("xtensa") {
            anyhow::bail!(
                "Unsupported arch '{}'. Only windowed Xtensa cores are supported",
                self.arch
            );
        }

        if self.core.num_int_levels == 0 || self.core.num_int_levels > 7 {
            anyhow::bail!(
                "Core option 'num_int_levels' must be between 1 and 7, got {}",
                self.core.num_int_levels
            );
        }

        if self.core.max_tasks == 0 {
            anyhow::bail!("Core option 'max_tasks' must be greater than zero");
        }

        self.memory.dram.bounds().context("Invalid 'memory.dram'")?;
        parse_size(&self.core.max_task_stack_size).context("Invalid 'max_task_stack_size'")?;
        if let Some(isr) = &self.isr_stack {
            isr.resolve().context("Invalid 'isr_stack'")?;
        }

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MemoryBlock {
    pub base: u32,
    /// Hex encoded bytes, e.g. "efbeadde".
    pub data: String,
}

impl MemoryBlock {
    pub fn bytes(&self) -> Result<Vec<u8>> {
        hex::decode(self.data.trim())
            .with_context(|| format!("Invalid hex data in memory block at {:#x}", self.base))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ThreadEntry {
    pub tcb: u32,
    pub stack_start: u32,
    pub stack_end: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct FaultEntry {
    /// Address of the exception frame pushed by the trap.
    pub frame: u32,
    #[serde(default)]
    pub in_isr: bool,
    #[serde(default)]
    pub pseudo_cause: bool,
    #[serde(default)]
    pub core: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CrashScenario {
    pub schema_version: String,
    /// Target descriptor path, relative to the scenario file.
    pub target: String,
    #[serde(default)]
    pub memory: Vec<MemoryBlock>,
    pub threads: Vec<ThreadEntry>,
    pub current_thread: u32,
    pub fault: FaultEntry,
    /// Saved EPC values, level 1 first.
    #[serde(default)]
    pub epc: Vec<u32>,
    /// Saved EPS values, level 2 first.
    #[serde(default)]
    pub eps: Vec<u32>,
}

impl CrashScenario {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open crash scenario at {:?}", path.as_ref()))?;
        let scenario: Self =
            serde_yaml::from_reader(f).context("Failed to parse Crash Scenario YAML")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.target.trim().is_empty() {
            anyhow::bail!("Input 'target' path cannot be empty");
        }

        if self.threads.is_empty() {
            anyhow::bail!("Scenario must list at least one thread in 'threads'");
        }

        if self.epc.len() > 7 {
            anyhow::bail!("At most 7 'epc' values can be given, got {}", self.epc.len());
        }

        if self.eps.len() > 6 {
            anyhow::bail!("At most 6 'eps' values can be given, got {}", self.eps.len());
        }

        for block in &self.memory {
            block.bytes()?;
        }

        Ok(())
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = r#"
name: "esp32"
arch: "xtensa-lx6"
memory:
  dram: { base: 0x3FFAE000, size: "328 KiB" }
  iram: { base: 0x40080000, size: "128 KiB" }
  rtc_slow: { base: 0x50000000, size: "8 KiB" }
  rtc_fast: { base: 0x3FF80000, size: "8 KiB" }
dump_regions:
  dram: { base: 0x3FFB0000, size: "4 KiB" }
core:
  num_int_levels: 6
  max_task_stack_size: "64 KiB"
checksum: sha256
"#;

    #[test]
    fn test_valid_target() {
        let target: TargetDescriptor = serde_yaml::from_str(TARGET).unwrap();
        assert!(target.validate().is_ok());
        assert_eq!(target.checksum, ChecksumAlgorithm::Sha256);
        assert_eq!(target.core.tcb_size, 0x160);
        assert!(target.core.loop_registers);
        assert_eq!(
            target.memory.dram.bounds().unwrap(),
            (0x3FFA_E000, 0x4000_0000)
        );
        assert!(target.dump_regions.iram.is_none());
    }

    #[test]
    fn test_invalid_int_levels() {
        let mut target: TargetDescriptor = serde_yaml::from_str(TARGET).unwrap();
        target.core.num_int_levels = 8;
        let err = target.validate().unwrap_err();
        assert!(err.to_string().contains("num_int_levels"));
    }

    #[test]
    fn test_range_end_must_be_addressable() {
        let top = MemoryRange {
            base: 0xFFFF_F000,
            size: "4 KiB".to_string(),
        };
        let err = top.bounds().unwrap_err();
        assert!(err.to_string().contains("overflows the address space"));

        let below_top = MemoryRange {
            base: 0xFFFF_E000,
            size: "4 KiB".to_string(),
        };
        assert_eq!(below_top.bounds().unwrap(), (0xFFFF_E000, 0xFFFF_F000));
    }

    #[test]
    fn test_isr_stack() {
        let mut target: TargetDescriptor = serde_yaml::from_str(TARGET).unwrap();
        assert!(target.isr_stack.is_none());

        target.isr_stack = Some(IsrStackConfig {
            base: 0x3FFB_E000,
            size: "2 KiB".to_string(),
            cores: 2,
        });
        assert!(target.validate().is_ok());
        let isr = target.isr_stack.as_ref().unwrap();
        assert_eq!(isr.resolve().unwrap(), (0x3FFB_E000, 2048));

        target.isr_stack = Some(IsrStackConfig {
            base: 0xFFFF_F000,
            size: "4 KiB".to_string(),
            cores: 2,
        });
        let err = target.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("isr_stack"));
    }

    #[test]
    fn test_invalid_arch() {
        let mut target: TargetDescriptor = serde_yaml::from_str(TARGET).unwrap();
        target.arch = "cortex-m3".to_string();
        let err = target.validate().unwrap_err();
        assert!(err.to_string().contains("Unsupported arch"));
    }

    #[test]
    fn test_valid_scenario() {
        let yaml = r#"
schema_version: "1.0"
target: "esp32.yaml"
memory:
  - base: 0x3FFB0000
    data: "efbeadde00000000"
threads:
  - { tcb: 0x3FFB1000, stack_start: 0x3FFB2000, stack_end: 0x3FFB3000 }
current_thread: 0x3FFB1000
fault:
  frame: 0x3FFB2000
epc: [0x400D1234]
"#;
        let scenario: CrashScenario = serde_yaml::from_str(yaml).unwrap();
        assert!(scenario.validate().is_ok());
        assert_eq!(scenario.threads.len(), 1);
        assert!(!scenario.fault.in_isr);
        assert_eq!(
            scenario.memory[0].bytes().unwrap(),
            vec![0xef, 0xbe, 0xad, 0xde, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_scenario_invalid_version() {
        let yaml = r#"
schema_version: "2.0"
target: "esp32.yaml"
threads:
  - { tcb: 1, stack_start: 2, stack_end: 3 }
current_thread: 1
fault:
  frame: 2
"#;
        let scenario: CrashScenario = serde_yaml::from_str(yaml).unwrap();
        let err = scenario.validate().unwrap_err();
        assert!(err.to_string().contains("Unsupported schema_version"));
    }

    #[test]
    fn test_scenario_bad_hex() {
        let yaml = r#"
schema_version: "1.0"
target: "esp32.yaml"
memory:
  - base: 0x3FFB0000
    data: "xyz"
threads:
  - { tcb: 1, stack_start: 2, stack_end: 3 }
current_thread: 1
fault:
  frame: 2
"#;
        let scenario: CrashScenario = serde_yaml::from_str(yaml).unwrap();
        let err = scenario.validate().unwrap_err();
        assert!(err.to_string().contains("hex"));
    }
}
