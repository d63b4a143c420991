// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use clap::Parser;
use labwired_coredump::checksum::sha256_oneshot;
use labwired_coredump::episode::ExtraInfo;
use labwired_coredump::frame::{sr, FrameKind, SpecialRegisterFile};
use labwired_coredump::memory::{LinearMemory, MemoryMap, TargetRam};
use labwired_coredump::{
    CaptureConfig, CoreDumper, EpisodeSummary, FaultContext, Scheduler, ThreadRecord,
    ThreadSnapshot,
};
use labwired_coredump_config::{CrashScenario, TargetDescriptor};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "LabWired core dump capture", long_about = None)]
struct Args {
    /// Path to the crash scenario (YAML)
    #[arg(short, long)]
    scenario: PathBuf,

    /// Where to write the core image
    #[arg(short, long)]
    output: PathBuf,

    /// Optional JSON summary of the capture
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Enable per-thread debug logging
    #[arg(short, long)]
    trace: bool,
}

/// Scheduler view over the scenario's thread list.
struct ScenarioScheduler {
    threads: Vec<ThreadSnapshot>,
    current: u32,
}

impl Scheduler for ScenarioScheduler {
    fn snapshot_all(&self, out: &mut [ThreadSnapshot]) -> usize {
        let n = self.threads.len().min(out.len());
        out[..n].copy_from_slice(&self.threads[..n]);
        n
    }

    fn current_thread(&self, _core_id: u32) -> u32 {
        self.current
    }
}

#[derive(Serialize)]
struct ThreadSummary {
    tcb: u32,
    stack_start: u32,
    stack_end: u32,
    crashed: bool,
    repaired: bool,
    frame: Option<FrameKind>,
    pc: u32,
    ps: u32,
    /// a0..a3; the rest is only meaningful for exception frames.
    ar: [u32; 4],
}

impl From<&ThreadRecord> for ThreadSummary {
    fn from(record: &ThreadRecord) -> Self {
        Self {
            tcb: record.snapshot.tcb,
            stack_start: record.snapshot.stack_start,
            stack_end: record.snapshot.stack_end,
            crashed: record.crashed,
            repaired: record.repaired,
            frame: record.kind,
            pc: record.regs.pc,
            ps: record.regs.ps,
            ar: [
                record.regs.ar[0],
                record.regs.ar[1],
                record.regs.ar[2],
                record.regs.ar[3],
            ],
        }
    }
}

#[derive(Serialize)]
struct CaptureSummary<'a> {
    target: &'a str,
    image_sha256: String,
    episode: &'a EpisodeSummary,
    threads: Vec<ThreadSummary>,
    extra_info: &'a ExtraInfo,
}

/// Zeroed RAM for every data class of the map, with the scenario's blocks on top.
fn build_memory(map: &MemoryMap, scenario: &CrashScenario) -> anyhow::Result<TargetRam> {
    let mut ram = TargetRam::new();
    for range in [Some(map.dram), map.rtc_slow, map.rtc_fast, map.iram]
        .into_iter()
        .flatten()
        .filter(|r| !r.is_empty())
    {
        ram.add_bank(LinearMemory::new(range.len() as usize, range.start));
    }
    for block in &scenario.memory {
        ram.load_or_map(block.base, &block.bytes()?);
    }
    Ok(ram)
}

fn special_registers(scenario: &CrashScenario) -> SpecialRegisterFile {
    let mut sregs = SpecialRegisterFile::new();
    for (level, value) in (1u8..).zip(&scenario.epc) {
        sregs.set(sr::epc(level), *value);
    }
    for (level, value) in (2u8..).zip(&scenario.eps) {
        sregs.set(sr::eps(level), *value);
    }
    sregs
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    info!("Loading crash scenario: {:?}", args.scenario);
    let scenario = CrashScenario::from_file(&args.scenario)?;
    let target_path = args
        .scenario
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&scenario.target);
    info!("Loading target descriptor: {:?}", target_path);
    let target = TargetDescriptor::from_file(&target_path)?;
    let config = CaptureConfig::from_descriptor(&target)?;

    let mut memory = build_memory(&config.memory_map, &scenario)?;
    let sregs = special_registers(&scenario);
    let scheduler = ScenarioScheduler {
        threads: scenario
            .threads
            .iter()
            .map(|t| ThreadSnapshot {
                tcb: t.tcb,
                stack_start: t.stack_start,
                stack_end: t.stack_end,
            })
            .collect(),
        current: scenario.current_thread,
    };
    let fault = FaultContext {
        frame: scenario.fault.frame,
        in_isr: scenario.fault.in_isr,
        pseudo_cause: scenario.fault.pseudo_cause,
        core_id: scenario.fault.core,
    };

    let dumper = CoreDumper::new(config);
    let mut ctx = dumper.new_context();
    let mut image = Vec::new();
    let summary = dumper
        .run(&mut ctx, &scheduler, &mut memory, &sregs, &fault, &mut image)
        .context("Core dump capture failed")?;

    std::fs::write(&args.output, &image)
        .with_context(|| format!("Failed to write core image to {:?}", args.output))?;
    info!(
        "Core image written: {} bytes, {} threads ({} repaired), checksum {}",
        summary.image_len,
        summary.threads,
        summary.repaired,
        summary.checksum.to_hex()
    );

    if let Some(path) = &args.summary {
        let report = CaptureSummary {
            target: &target.name,
            image_sha256: sha256_oneshot(&image).to_hex(),
            episode: &summary,
            threads: ctx.records().iter().map(ThreadSummary::from).collect(),
            extra_info: ctx.extra_info(),
        };
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create summary file {:?}", path))?;
        serde_json::to_writer_pretty(file, &report).context("Failed to write summary")?;
        info!("Summary written to {:?}", path);
    }

    Ok(())
}
