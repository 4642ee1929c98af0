//! Mount-exclusion protocol (spec §4.8): seq-no objects at the backend root
//! detect concurrent or unclean mounts.
//!
//! Grounded on the teacher's own mount-retry loop in `src/main.rs`
//! (`retry_with_index(Exponential::from_millis(...), || { ... })` around the
//! FUSE mount attempt); the same backoff shape is reused here for the
//! "wait for the backend consistency window" step.

use std::thread::sleep;
use std::time::Duration;

use crate::error::{Result, S3qlError};
use backend::Backend;

pub const SEQ_NO_PREFIX: &str = "s3ql_seq_no_";

/// `mount_state` key recording the seq_no claimed by the mount that last
/// shut down cleanly (spec §4.8). Lives inside the metadata snapshot itself,
/// so it travels with `s3ql_metadata` rather than as a separate backend
/// object.
pub const CLEAN_SEQ_NO_KEY: &str = "clean_seq_no";

/// How long to wait for the backend's eventual-consistency window to settle
/// before re-listing (spec §4.8: "waits for the backend consistency window").
const CONSISTENCY_WINDOW: Duration = Duration::from_secs(3);

fn parse_seq_no(key: &str) -> Option<u64> {
    key.strip_prefix(SEQ_NO_PREFIX)?.parse().ok()
}

/// Highest `s3ql_seq_no_<N>` currently visible at the backend, if any.
/// Exposed so callers can tell clean vs. unclean shutdown apart *before*
/// claiming the next slot (spec §4.8).
pub fn highest_seq_no(backend: &dyn Backend) -> Result<Option<u64>> {
    let entries = backend.list(SEQ_NO_PREFIX)?;
    Ok(entries.iter().filter_map(|e| parse_seq_no(&e.key)).max())
}

/// Claims the next seq-no slot. Returns `already-mounted` if, after waiting
/// out the consistency window, a higher seq-no than the one just written
/// appears — meaning another mounter raced us (spec §4.8).
pub fn claim_mount(backend: &dyn Backend) -> Result<u64> {
    let highest = highest_seq_no(backend)?;
    let claimed = highest.map(|n| n + 1).unwrap_or(0);
    let key = format!("{SEQ_NO_PREFIX}{claimed}");
    backend.put(&key, &[], &Default::default())?;

    sleep(CONSISTENCY_WINDOW);

    let after = highest_seq_no(backend)?.unwrap_or(0);
    if after > claimed {
        return Err(S3qlError::AlreadyMounted);
    }
    Ok(claimed)
}

/// True if the last mount shut down cleanly, i.e. the `clean_seq_no`
/// recorded in the downloaded metadata snapshot matches the highest seq-no
/// object actually present at the backend. A higher seq-no than recorded
/// means some mount claimed a slot and never got to record its own clean
/// shutdown — it was killed rather than unmounted (spec §4.8: "on unclean
/// exit, the next mount detects a seq_no gap ... and requires fsck").
/// `recorded_seq_no` of `None` means the snapshot predates this field
/// (nothing shut down cleanly, since nothing ever recorded itself).
pub fn was_clean_shutdown(backend: &dyn Backend, recorded_seq_no: Option<u64>) -> Result<bool> {
    let highest = highest_seq_no(backend)?.unwrap_or(0);
    match recorded_seq_no {
        Some(recorded) => Ok(highest <= recorded),
        None => Ok(false),
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
        fn copy(&self, _src: &str, _dst: &str) -> backend::Result<()> {
            Ok(())
        }
        fn rename(&self, _src: &str, _dst: &str) -> backend::Result<()> {
            Ok(())
        }
        fn close(&self) -> backend::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fresh_backend_claims_seq_no_zero() {
        let backend = MemBackend::default();
        let claimed = claim_mount(&backend).unwrap();
        assert_eq!(claimed, 0);
    }

    #[test]
    fn second_claim_increments_past_first() {
        let backend = MemBackend::default();
        let first = claim_mount(&backend).unwrap();
        let second = claim_mount(&backend).unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn unrecorded_snapshot_after_a_claim_is_not_clean() {
        let backend = MemBackend::default();
        claim_mount(&backend).unwrap();
        assert!(!was_clean_shutdown(&backend, None).unwrap());
    }

    #[test]
    fn seq_no_gap_past_the_recorded_value_is_not_clean() {
        let backend = MemBackend::default();
        claim_mount(&backend).unwrap(); // seq_no 0, recorded as clean
        claim_mount(&backend).unwrap(); // seq_no 1, killed before recording
        assert!(!was_clean_shutdown(&backend, Some(0)).unwrap());
    }

    #[test]
    fn recorded_seq_no_matching_the_highest_is_clean() {
        let backend = MemBackend::default();
        claim_mount(&backend).unwrap();
        assert!(was_clean_shutdown(&backend, Some(0)).unwrap());
    }
}
