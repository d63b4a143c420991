// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Streaming integrity checksum over the emitted image.

use crate::{DumpError, DumpResult};
use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use labwired_coredump_config::ChecksumAlgorithm;
use serde::{Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Same polynomial and chaining as the ROM `crc32_le` routine.
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const CRC32_LEN: usize = 4;
pub const SHA256_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    #[default]
    Crc32,
    Sha256,
}

impl ChecksumKind {
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Crc32 => CRC32_LEN,
            Self::Sha256 => SHA256_LEN,
        }
    }
}

impl From<ChecksumAlgorithm> for ChecksumKind {
    fn from(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => Self::Crc32,
            ChecksumAlgorithm::Sha256 => Self::Sha256,
        }
    }
}

/// Finished checksum as it is written to the image trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumValue {
    kind: ChecksumKind,
    bytes: [u8; SHA256_LEN],
}

impl ChecksumValue {
    fn crc32(crc: u32) -> Self {
        let mut bytes = [0u8; SHA256_LEN];
        bytes[..CRC32_LEN].copy_from_slice(&crc.to_le_bytes());
        Self {
            kind: ChecksumKind::Crc32,
            bytes,
        }
    }

    fn sha256(digest: &[u8]) -> Self {
        let mut bytes = [0u8; SHA256_LEN];
        bytes.copy_from_slice(digest);
        Self {
            kind: ChecksumKind::Sha256,
            bytes,
        }
    }

    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.kind.digest_len()]
    }

    pub fn as_crc32(&self) -> Option<u32> {
        match self.kind {
            ChecksumKind::Crc32 => Some(u32::from_le_bytes([
                self.bytes[0],
                self.bytes[1],
                self.bytes[2],
                self.bytes[3],
            ])),
            ChecksumKind::Sha256 => None,
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl Serialize for ChecksumValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

enum Engine {
    Crc32(Digest<'static, u32>),
    Sha256(Sha256),
}

enum State {
    Uninitialized,
    Active(Engine),
    Finalized,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Active(_) => "active",
            Self::Finalized => "finalized",
        }
    }
}

pub struct ChecksumAccumulator {
    kind: ChecksumKind,
    state: State,
    total_len: u32,
}

impl std::fmt::Debug for ChecksumAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumAccumulator")
            .field("kind", &self.kind)
            .field("state", &self.state.name())
            .field("total_len", &self.total_len)
            .finish()
    }
}

impl ChecksumAccumulator {
    pub fn new(kind: ChecksumKind) -> Self {
        Self {
            kind,
            state: State::Uninitialized,
            total_len: 0,
        }
    }

    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    /// Bytes fed since the last `init`.
    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    pub fn init(&mut self) {
        let engine = match self.kind {
            ChecksumKind::Crc32 => Engine::Crc32(CRC32.digest()),
            ChecksumKind::Sha256 => Engine::Sha256(Sha256::new()),
        };
        self.state = State::Active(engine);
        self.total_len = 0;
    }

    pub fn update(&mut self, data: &[u8]) -> DumpResult<()> {
        let engine = match &mut self.state {
            State::Active(engine) => engine,
            other => {
                tracing::error!(
                    "Checksum update of {} bytes while {}",
                    data.len(),
                    other.name()
                );
                return Err(DumpError::ChecksumMisuse("update outside of an active episode"));
            }
        };
        match engine {
            Engine::Crc32(digest) => digest.update(data),
            Engine::Sha256(hasher) => hasher.update(data),
        }
        self.total_len = self.total_len.wrapping_add(data.len() as u32);
        Ok(())
    }

    /// Consumes the engine. A second call is an error: the hash context is gone.
    pub fn finalize(&mut self) -> DumpResult<ChecksumValue> {
        let engine = match std::mem::replace(&mut self.state, State::Finalized) {
            State::Active(engine) => engine,
            other => {
                tracing::error!("Checksum finalize while {}", other.name());
                self.state = other;
                return Err(DumpError::ChecksumMisuse("finalize without an active checksum"));
            }
        };

        let value = match engine {
            Engine::Crc32(digest) => {
                let crc = digest.finalize();
                tracing::debug!("Dump data CRC = {:#x}", crc);
                ChecksumValue::crc32(crc)
            }
            Engine::Sha256(hasher) => ChecksumValue::sha256(&hasher.finalize()),
        };
        tracing::debug!("Total length of hashed data: {}!", self.total_len);
        Ok(value)
    }
}

/// Hashes one solid buffer, outside of any accumulator.
pub fn sha256_oneshot(input: &[u8]) -> ChecksumValue {
    let value = ChecksumValue::sha256(&Sha256::digest(input));
    tracing::info!("Coredump SHA256='{}'", value.to_hex());
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn digest_chunked(kind: ChecksumKind, data: &[u8], cuts: &[usize]) -> (ChecksumValue, u32) {
        let mut acc = ChecksumAccumulator::new(kind);
        acc.init();
        let mut pos = 0;
        for &cut in cuts {
            let cut = cut.min(data.len()).max(pos);
            acc.update(&data[pos..cut]).unwrap();
            pos = cut;
        }
        acc.update(&data[pos..]).unwrap();
        let total = acc.total_len();
        (acc.finalize().unwrap(), total)
    }

    #[test]
    fn test_crc32_matches_reference() {
        let (value, total) = digest_chunked(ChecksumKind::Crc32, b"123456789", &[]);
        assert_eq!(value.as_crc32(), Some(0xCBF4_3926));
        assert_eq!(value.as_bytes(), &0xCBF4_3926u32.to_le_bytes());
        assert_eq!(total, 9);
    }

    #[test]
    fn test_sha256_matches_oneshot() {
        let data = b"core dump payload";
        let (value, _) = digest_chunked(ChecksumKind::Sha256, data, &[4, 9]);
        assert_eq!(value, sha256_oneshot(data));
        assert_eq!(value.as_bytes().len(), SHA256_LEN);
        assert_eq!(value.as_crc32(), None);
    }

    #[test]
    fn test_update_before_init_is_rejected() {
        let mut acc = ChecksumAccumulator::new(ChecksumKind::Crc32);
        assert!(matches!(
            acc.update(b"abc"),
            Err(DumpError::ChecksumMisuse(_))
        ));
        assert_eq!(acc.total_len(), 0);
    }

    #[test]
    fn test_finalize_twice_fails() {
        for kind in [ChecksumKind::Crc32, ChecksumKind::Sha256] {
            let mut acc = ChecksumAccumulator::new(kind);
            acc.init();
            acc.update(b"abc").unwrap();
            assert!(acc.finalize().is_ok());
            assert!(matches!(acc.finalize(), Err(DumpError::ChecksumMisuse(_))));
            assert!(matches!(acc.update(b"d"), Err(DumpError::ChecksumMisuse(_))));
            // The counter survives finalize.
            assert_eq!(acc.total_len(), 3);
        }
    }

    #[test]
    fn test_init_resets_counter() {
        let mut acc = ChecksumAccumulator::new(ChecksumKind::Sha256);
        acc.init();
        acc.update(&[0u8; 10]).unwrap();
        acc.init();
        assert_eq!(acc.total_len(), 0);
        assert!(acc.is_active());
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_digest(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            mut cuts in proptest::collection::vec(0usize..512, 0..8),
        ) {
            cuts.sort_unstable();
            for kind in [ChecksumKind::Crc32, ChecksumKind::Sha256] {
                let (whole, whole_len) = digest_chunked(kind, &data, &[]);
                let (chunked, chunked_len) = digest_chunked(kind, &data, &cuts);
                prop_assert_eq!(whole, chunked);
                prop_assert_eq!(whole_len, chunked_len);
                prop_assert_eq!(whole_len as usize, data.len());
            }
        }
    }
}
