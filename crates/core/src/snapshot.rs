// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{DumpError, DumpResult};
use serde::{Deserialize, Serialize};

/// One live thread as the scheduler reported it at fault time.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadSnapshot {
    /// TCB address; doubles as the thread's identity.
    pub tcb: u32,
    pub stack_start: u32,
    pub stack_end: u32,
}

impl ThreadSnapshot {
    /// Size of the common prefix every scheduler record starts with.
    pub const RAW_SIZE: usize = 12;

    /// Decodes the prefix of a scheduler record. Trailing scheduler-specific
    /// fields are ignored.
    pub fn from_raw(bytes: &[u8]) -> DumpResult<Self> {
        if bytes.len() < Self::RAW_SIZE {
            return Err(DumpError::ShortSnapshot {
                got: bytes.len(),
                min: Self::RAW_SIZE,
            });
        }
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        Ok(Self {
            tcb: word(0),
            stack_start: word(4),
            stack_end: word(8),
        })
    }
}

/// Scheduler collaborator queried once per episode.
pub trait Scheduler {
    /// Fills `out` with up to `out.len()` threads and returns how many were written.
    fn snapshot_all(&self, out: &mut [ThreadSnapshot]) -> usize;
    /// TCB of the thread running on `core_id` when the fault hit.
    fn current_thread(&self, core_id: u32) -> u32;
}

/// Scheduler records in their native binary form.
#[derive(Debug, Clone)]
pub struct RawTaskList {
    records: Vec<u8>,
    stride: usize,
    current: u32,
}

impl RawTaskList {
    pub fn new(records: Vec<u8>, stride: usize, current: u32) -> DumpResult<Self> {
        if stride < ThreadSnapshot::RAW_SIZE {
            return Err(DumpError::ShortSnapshot {
                got: stride,
                min: ThreadSnapshot::RAW_SIZE,
            });
        }
        Ok(Self {
            records,
            stride,
            current,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len() / self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Scheduler for RawTaskList {
    fn snapshot_all(&self, out: &mut [ThreadSnapshot]) -> usize {
        let mut count = 0;
        for (slot, record) in out.iter_mut().zip(self.records.chunks_exact(self.stride)) {
            match ThreadSnapshot::from_raw(record) {
                Ok(task) => {
                    *slot = task;
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!("Dropping scheduler record: {}", e);
                    break;
                }
            }
        }
        if self.len() > out.len() {
            tracing::warn!(
                "Snapshot truncated: {} threads, room for {}",
                self.len(),
                out.len()
            );
        }
        count
    }

    fn current_thread(&self, _core_id: u32) -> u32 {
        self.current
    }
}
