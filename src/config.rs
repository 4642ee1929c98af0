//! Mount configuration (spec §3 "Parameters", §9 "Config").
//!
//! Spec design note 9 flags the teacher's style of ambient globals
//! (`lazy_static!` + `MutStatic` cells read by every layer, see
//! `examples/chiro2001-rfs/src/lib.rs`) as something to avoid here: an
//! explicit context is threaded through instead. `Parameters` is the
//! immutable-after-mkfs half (spec §3); `Tunables` is the per-mount,
//! operator-settable half (spec §9).

use crate::error::{Result, S3qlError};

/// Compression algorithm selectable at write time (spec §2.2, §4.2).
///
/// The spec names `{none, zlib, bzip2, lzma}`. The retrieval pack has no
/// attested `bzip2` crate anywhere (checked across all manifests), so the
/// fourth slot is implemented with `zstd` instead — the modern equivalent
/// the pack actually reaches for (`wcampbell0x2a-backhand`). See
/// DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    None = 0,
    Zlib = 1,
    Lzma = 2,
    Zstd = 3,
}

impl CompressionAlgorithm {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Zlib),
            2 => Ok(CompressionAlgorithm::Lzma),
            3 => Ok(CompressionAlgorithm::Zstd),
            other => Err(S3qlError::VersionMismatch(format!(
                "unknown compression algorithm byte {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Hash algorithm identifier stored at mkfs time (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Blake3,
}

/// Immutable-after-mkfs filesystem parameters (spec §3).
#[derive(Debug, Clone)]
pub struct Parameters {
    pub data_block_size: u64,
    pub label: String,
    pub fs_uuid: uuid::Uuid,
    pub hash_algorithm: HashAlgorithm,
}

pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;
pub const DEFAULT_BLOCK_SIZE: u64 = 10 * 1024 * 1024;

impl Parameters {
    pub fn new(data_block_size: u64, label: String) -> Result<Self> {
        if data_block_size < MIN_BLOCK_SIZE || !data_block_size.is_power_of_two() {
            return Err(S3qlError::InvalidArgument(format!(
                "data_block_size {data_block_size} must be a power of two >= {MIN_BLOCK_SIZE}"
            )));
        }
        Ok(Self {
            data_block_size,
            label,
            fs_uuid: uuid::Uuid::new_v4(),
            hash_algorithm: HashAlgorithm::Blake3,
        })
    }

    /// Reconstructs parameters already validated once at mkfs time, read
    /// back from a downloaded metadata snapshot (spec §6's mount path).
    pub fn from_parts(data_block_size: u64, label: String, fs_uuid: uuid::Uuid) -> Self {
        Self {
            data_block_size,
            label,
            fs_uuid,
            hash_algorithm: HashAlgorithm::Blake3,
        }
    }
}

/// Per-mount operator tunables (spec §9).
#[derive(Debug, Clone)]
pub struct Tunables {
    pub max_cache_entries: usize,
    pub max_cache_size: u64,
    pub upload_threads: usize,
    pub compression_algorithm: CompressionAlgorithm,
    pub compression_level: i32,
    pub metadata_upload_interval: std::time::Duration,
    pub ssl_verify: bool,
    pub backend_options: std::collections::HashMap<String, String>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_cache_entries: 1024,
            max_cache_size: 512 * 1024 * 1024,
            upload_threads: 4,
            compression_algorithm: CompressionAlgorithm::Lzma,
            compression_level: 6,
            metadata_upload_interval: std::time::Duration::from_secs(24 * 3600),
            ssl_verify: true,
            backend_options: std::collections::HashMap::new(),
        }
    }
}

impl Tunables {
    /// Validates cross-field invariants. Spec §9's Open Question: behavior
    /// when `max_cache_size < data_block_size` is unspecified in the
    /// original; resolved here as `invalid-argument` (documented decision,
    /// see DESIGN.md).
    pub fn validate(&self, params: &Parameters) -> Result<()> {
        if self.max_cache_size < params.data_block_size {
            return Err(S3qlError::InvalidArgument(format!(
                "max_cache_size ({}) must be >= data_block_size ({})",
                self.max_cache_size, params.data_block_size
            )));
        }
        if self.max_cache_entries == 0 {
            return Err(S3qlError::InvalidArgument(
                "max_cache_entries must be > 0".to_string(),
            ));
        }
        if self.upload_threads == 0 {
            return Err(S3qlError::InvalidArgument(
                "upload_threads must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bundles everything a mount needs to construct [`crate::filesystem::S3ql`]
/// (spec §9 design note: an explicit context passed into the filesystem,
/// built once in `main.rs`, instead of the teacher's ambient globals).
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub cache_dir: std::path::PathBuf,
    pub params: Parameters,
    pub tunables: Tunables,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_block_size() {
        assert!(Parameters::new(100_000, "test".into()).is_err());
    }

    #[test]
    fn rejects_cache_smaller_than_block_size() {
        let params = Parameters::new(DEFAULT_BLOCK_SIZE, "test".into()).unwrap();
        let mut tunables = Tunables::default();
        tunables.max_cache_size = DEFAULT_BLOCK_SIZE - 1;
        assert!(matches!(
            tunables.validate(&params),
            Err(S3qlError::InvalidArgument(_))
        ));
    }
}
