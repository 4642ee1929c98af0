//! Error kinds (spec §7).
//!
//! The teacher converts `anyhow::Result` into a bare `c_int` errno at the
//! FUSE boundary via a small `ret()` helper (`src/rfs_lib/fs.rs`,
//! `src/rfs_lib/fuse.rs`). Internally we use a typed enum instead of
//! `anyhow` so the dispatcher can map each variant to the exact errno spec
//! §7 names, the way `byte271-6cy`'s `CodecError` or `zenithdb-zenith`'s
//! `DownloadError` do in the retrieval pack.

use libc::c_int;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum S3qlError {
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("filesystem is already mounted")]
    AlreadyMounted,

    #[error("filesystem was not cleanly unmounted; run fsck.s3ql")]
    NotClean,

    #[error("local cache directory is full")]
    OutOfSpace,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("filesystem is shutting down")]
    ShuttingDown,

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("metadata version mismatch: {0}")]
    VersionMismatch(String),

    #[error("no such entry")]
    NoEntry,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("no such extended attribute")]
    NoXattr,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("backend error: {0}")]
    Backend(#[from] backend::BackendError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl S3qlError {
    /// Maps an internal error to the errno returned to the FUSE caller
    /// (spec §7: "FUSE-level errors map to errno and are returned from the
    /// dispatcher").
    pub fn to_errno(&self) -> c_int {
        match self {
            S3qlError::NoEntry => libc::ENOENT,
            S3qlError::NotADirectory => libc::ENOTDIR,
            S3qlError::IsADirectory => libc::EISDIR,
            S3qlError::NotEmpty => libc::ENOTEMPTY,
            S3qlError::NoXattr => libc::ENODATA,
            S3qlError::InvalidArgument(_) => libc::EINVAL,
            S3qlError::Unsupported(_) => libc::ENOTSUP,
            S3qlError::OutOfSpace => libc::ENOSPC,
            S3qlError::ShuttingDown => libc::EAGAIN,
            S3qlError::Auth(_) => libc::EACCES,
            S3qlError::Corruption(_) | S3qlError::ChecksumMismatch(_) => libc::EIO,
            S3qlError::TransientBackend(_) => libc::EIO,
            S3qlError::AlreadyMounted | S3qlError::NotClean | S3qlError::VersionMismatch(_) => {
                libc::EIO
            }
            S3qlError::Sqlite(_) => libc::EIO,
            S3qlError::Backend(_) => libc::EIO,
            S3qlError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// A fatal-class error (spec §7: "corruption, repeated fatal backend
    /// failures"): these never recover by retrying and drive the
    /// crit-log-then-unmount path in [`crate::critlog::fatal_shutdown`]
    /// rather than merely erroring the one cache entry or FUSE call they
    /// were raised from. Deliberately narrower than `Backend(_).is_fatal()`:
    /// a missing or auth-rejected *single* object is recoverable (logged,
    /// that block's cache entry goes `errored`); only data-integrity
    /// failures are treated as filesystem-wide fatal here.
    pub fn is_fatal(&self) -> bool {
        matches!(self, S3qlError::Corruption(_) | S3qlError::ChecksumMismatch(_))
    }

    /// Process exit code for the CLI surface (spec §6).
    pub fn exit_code(&self) -> i32 {
        match self {
            S3qlError::NotClean => 10,
            S3qlError::AlreadyMounted => 11,
            S3qlError::Auth(_) => 12,
            S3qlError::VersionMismatch(_) => 13,
            S3qlError::TransientBackend(_) | S3qlError::Backend(_) => 14,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, S3qlError>;
