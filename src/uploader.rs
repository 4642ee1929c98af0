//! Metadata uploader (spec §4.7): periodic incremental snapshots plus a
//! full snapshot with rotation on clean unmount.
//!
//! Grounded on the teacher's `retry_with_index`-driven loop in `main.rs`
//! (exponential backoff around a fallible operation) generalized into a
//! periodic background task, and on `rusqlite::Connection::serialize`
//! (already used by [`crate::metadata::MetadataStore::serialize`]) as the
//! snapshot mechanism.
//!
//! Simplification versus spec §4.7: true incremental deltas would ship only
//! changed SQLite pages (requires tracking the WAL page list between
//! snapshots). This implementation instead uploads the same full serialized
//! database image under a numbered `s3ql_metadata_delta_<N>` key each
//! period; "replay" on mount degenerates to loading the newest one. This
//! keeps the external object namespace and mount-time behavior faithful to
//! spec §4.7/§6 while avoiding a hand-rolled page-diffing engine with no
//! grounding anywhere in the retrieval pack. See DESIGN.md.

use std::sync::Arc;
use std::time::Duration;

use crate::codec;
use crate::config::{CompressionAlgorithm, Parameters};
use crate::crypto::MasterKey;
use crate::error::{Result, S3qlError};
use crate::metadata::MetadataStore;
use crate::shutdown::ShutdownFlag;
use backend::Backend;

pub const METADATA_KEY: &str = "s3ql_metadata";
const METADATA_BACKUP_COUNT: u32 = 10;
const METADATA_DELTA_PREFIX: &str = "s3ql_metadata_delta_";
/// `obj_id` reserved for metadata objects in the codec's per-object key
/// derivation; metadata never collides with data objects, which start at 1.
const METADATA_OBJ_ID: u64 = u64::MAX;

pub struct MetadataUploader {
    store: Arc<MetadataStore>,
    backend: Arc<dyn Backend>,
    master_key: MasterKey,
    compression_algorithm: CompressionAlgorithm,
    compression_level: i32,
}

impl MetadataUploader {
    pub fn new(
        store: Arc<MetadataStore>,
        backend: Arc<dyn Backend>,
        master_key: MasterKey,
        compression_algorithm: CompressionAlgorithm,
        compression_level: i32,
    ) -> Self {
        Self {
            store,
            backend,
            master_key,
            compression_algorithm,
            compression_level,
        }
    }

    fn encode_snapshot(&self) -> Result<Vec<u8>> {
        let raw = self.store.serialize()?;
        codec::encode_object(
            METADATA_OBJ_ID,
            &raw,
            self.compression_algorithm,
            self.compression_level,
            &self.master_key,
        )
    }

    fn next_delta_no(&self) -> Result<u64> {
        let entries = self.backend.list(METADATA_DELTA_PREFIX)?;
        let max = entries
            .iter()
            .filter_map(|e| e.key.strip_prefix(METADATA_DELTA_PREFIX))
            .filter_map(|n| n.parse::<u64>().ok())
            .max();
        Ok(max.map(|n| n + 1).unwrap_or(0))
    }

    /// Uploads one incremental snapshot (spec §4.7 cadence (i)).
    pub fn upload_incremental(&self) -> Result<u64> {
        let delta_no = self.next_delta_no()?;
        let encoded = self.encode_snapshot()?;
        let key = format!("{METADATA_DELTA_PREFIX}{delta_no}");
        self.backend.put(&key, &encoded, &Default::default())?;
        Ok(delta_no)
    }

    /// Writes `s3ql_metadata`, rotating previous copies to
    /// `s3ql_metadata_bakN` and keeping the latest `METADATA_BACKUP_COUNT`
    /// (spec §4.7 cadence (ii)).
    pub fn upload_full(&self) -> Result<()> {
        for n in (0..METADATA_BACKUP_COUNT).rev() {
            let src = if n == 0 {
                METADATA_KEY.to_string()
            } else {
                format!("{METADATA_KEY}_bak{}", n - 1)
            };
            let dst = format!("{METADATA_KEY}_bak{n}");
            if self.backend.lookup(&src)?.is_some() {
                self.backend.copy(&src, &dst)?;
            }
        }
        let encoded = self.encode_snapshot()?;
        self.backend.put(METADATA_KEY, &encoded, &Default::default())
            .map_err(S3qlError::from)
    }

    /// Downloads and applies the latest complete metadata image, then
    /// replays deltas newer than it (spec §4.7: "On mount, the latest
    /// complete metadata is downloaded and applied, then deltas are
    /// replayed in order").
    pub fn download_and_apply(&self) -> Result<()> {
        if let Some(_meta) = self.backend.lookup(METADATA_KEY)? {
            let bytes = self.backend.get(METADATA_KEY)?;
            let (_, raw) = codec::decode_object(&bytes, &self.master_key)?;
            self.store.load_serialized(&raw)?;
        }

        let mut deltas: Vec<(u64, String)> = self
            .backend
            .list(METADATA_DELTA_PREFIX)?
            .into_iter()
            .filter_map(|e| {
                e.key
                    .strip_prefix(METADATA_DELTA_PREFIX)
                    .and_then(|n| n.parse::<u64>().ok())
                    .map(|n| (n, e.key))
            })
            .collect();
        deltas.sort_by_key(|(n, _)| *n);

        if let Some((_, key)) = deltas.last() {
            let bytes = self.backend.get(key)?;
            let (_, raw) = codec::decode_object(&bytes, &self.master_key)?;
            self.store.load_serialized(&raw)?;
        }
        Ok(())
    }

    /// Runs the periodic upload cadence until shutdown (spec §4.7 default
    /// interval: 24h, configurable via [`Parameters`]/`Tunables`).
    pub fn run_periodic(&self, shutdown: &ShutdownFlag, interval: Duration) {
        let mut waited = Duration::ZERO;
        let tick = Duration::from_secs(1).min(interval);
        while !shutdown.is_set() {
            std::thread::sleep(tick);
            waited += tick;
            if waited >= interval {
                waited = Duration::ZERO;
                if let Err(e) = self.upload_incremental() {
                    log::error!("periodic metadata upload failed: {e}");
                    if e.is_fatal() {
                        crate::critlog::fatal_shutdown(
                            &format!("periodic metadata upload failed fatally: {e}"),
                            e.exit_code(),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemBackend {
        objects: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    impl Backend for MemBackend {
        fn lookup(&self, key: &str) -> backend::Result<Option<backend::ObjectMetadata>> {
            Ok(self.objects.lock().unwrap().get(key).map(|_| Default::default()))
        }
        fn get(&self, key: &str) -> backend::Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| backend::BackendError::NoSuchKey(key.to_string()))
        }
        fn put(&self, key: &str, body: &[u8], _metadata: &backend::ObjectMetadata) -> backend::Result<()> {
            self.objects.lock().unwrap().insert(key.to_string(), body.to_vec());
            Ok(())
        }
        fn delete(&self, key: &str) -> backend::Result<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
        fn list(&self, prefix: &str) -> backend::Result<Vec<backend::ListEntry>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .map(|k| backend::ListEntry { key: k.clone() })
                .collect())
        }
        fn copy(&self, src: &str, dst: &str) -> backend::Result<()> {
            let body = self.get(src)?;
            self.put(dst, &body, &Default::default())
        }
        fn rename(&self, src: &str, dst: &str) -> backend::Result<()> {
            self.copy(src, dst)?;
            self.delete(src)
        }
        fn close(&self) -> backend::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn full_upload_then_download_restores_inodes() {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        store.init_fresh().unwrap();
        store
            .transaction(|tx| store.create_inode(tx, libc::S_IFREG | 0o644, 0, 0, 0))
            .unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::default());
        let uploader = MetadataUploader::new(
            store.clone(),
            backend.clone(),
            MasterKey::generate(),
            CompressionAlgorithm::None,
            1,
        );
        uploader.upload_full().unwrap();

        let fresh_store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let restore_uploader = MetadataUploader::new(
            fresh_store.clone(),
            backend,
            uploader.master_key.clone(),
            CompressionAlgorithm::None,
            1,
        );
        restore_uploader.download_and_apply().unwrap();
        fresh_store
            .transaction(|tx| {
                let inodes = fresh_store.all_inode_ids(tx)?;
                assert_eq!(inodes.len(), 2); // root + the created file
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn incremental_upload_numbers_increase_monotonically() {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        store.init_fresh().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::default());
        let uploader = MetadataUploader::new(store, backend, MasterKey::generate(), CompressionAlgorithm::None, 1);
        let n1 = uploader.upload_incremental().unwrap();
        let n2 = uploader.upload_incremental().unwrap();
        assert!(n2 > n1);
    }
}
