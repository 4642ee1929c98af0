//! Backend abstraction (spec §4.1).
//!
//! A uniform key→bytes object store with list/get/put/delete/rename, the
//! same shape as the teacher's `DiskDriver` trait but addressed by string
//! key instead of a single block device. Each backend variant brings its
//! own retry policy (spec §9's "dynamic dispatch on backend" note); here
//! that policy is the shared [`retrying`] wrapper applied uniformly, since
//! the only concrete variant we ship is [`local::LocalBackend`].

pub mod error;
pub mod local;
pub mod retrying;

use std::collections::HashMap;

pub use error::{BackendError, Result};

/// Server-side (or header-inline, where unsupported) object metadata.
pub type ObjectMetadata = HashMap<String, String>;

/// One entry returned by [`Backend::list`].
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub key: String,
}

/// Capability object modeling one backend connection.
///
/// Implementors must provide read-after-write consistency on their own keys
/// (§4.1); list-after-write is explicitly NOT required, so callers must
/// never rely on `list` for correctness — only for fsck/enumeration.
pub trait Backend: Send + Sync {
    /// Returns object metadata if the key exists, `Ok(None)` if it does not.
    fn lookup(&self, key: &str) -> Result<Option<ObjectMetadata>>;

    /// Downloads the full object body.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Uploads `body` under `key`, replacing any existing object.
    fn put(&self, key: &str, body: &[u8], metadata: &ObjectMetadata) -> Result<()>;

    /// Deletes the object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Lists keys with the given prefix. Eventually consistent — never used
    /// for correctness, only for fsck/enumeration (spec §4.1).
    fn list(&self, prefix: &str) -> Result<Vec<ListEntry>>;

    /// Server-side (or read+write, where unsupported) copy.
    fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// Atomic (where the backend supports it) rename.
    fn rename(&self, src: &str, dst: &str) -> Result<()>;

    /// Releases backend-held resources (connections, file handles).
    fn close(&self) -> Result<()>;
}
