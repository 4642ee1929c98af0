//! Exponential backoff around backend operations (spec §4.1).
//!
//! Mirrors the teacher's use of the `retry` crate in `main.rs` (there used
//! to retry a failed FUSE mount); here the same crate retries a transient
//! backend call instead of a mount attempt.

use log::{debug, warn};
use retry::delay::Exponential;
use retry::{retry_with_index, OperationResult};

use crate::error::BackendError;
use crate::{Backend, ListEntry, ObjectMetadata, Result};

/// Default backoff ladder: 100ms, 200ms, 400ms, ... capped at 6 attempts.
const INITIAL_DELAY_MS: u64 = 100;
const MAX_ATTEMPTS: u64 = 6;

/// Runs `op`, retrying on [`BackendError::Transient`] with exponential
/// backoff. Any other error (the "fatal class" of spec §4.1) surfaces
/// immediately without retry.
pub fn with_retry<T, F>(description: &str, mut op: F) -> Result<T, BackendError>
where
    F: FnMut() -> Result<T, BackendError>,
{
    let result = retry_with_index(Exponential::from_millis(INITIAL_DELAY_MS), |attempt| {
        match op() {
            Ok(v) => OperationResult::Ok(v),
            Err(e) if e.is_fatal() => OperationResult::Err(e),
            Err(e) => {
                if attempt >= MAX_ATTEMPTS {
                    OperationResult::Err(e)
                } else {
                    warn!("{description}: transient error on attempt {attempt}: {e}");
                    OperationResult::Retry(e)
                }
            }
        }
    });
    match result {
        Ok(v) => Ok(v),
        Err(retry::Error { error, .. }) => {
            debug!("{description}: giving up after retries: {error}");
            Err(error)
        }
    }
}

/// Wraps any [`Backend`] so every operation goes through [`with_retry`]
/// (spec §4.1: "Every operation is retried with exponential backoff on
/// transient errors"; §9: "each variant keeps its own retry policy" — this
/// decorator applies one uniform policy across whichever concrete backend
/// it wraps, since `LocalBackend` is the only variant this core ships).
pub struct RetryingBackend<B> {
    inner: B,
}

impl<B: Backend> RetryingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

impl<B: Backend> Backend for RetryingBackend<B> {
    fn lookup(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        with_retry("lookup", || self.inner.lookup(key))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        with_retry("get", || self.inner.get(key))
    }

    fn put(&self, key: &str, body: &[u8], metadata: &ObjectMetadata) -> Result<()> {
        with_retry("put", || self.inner.put(key, body, metadata))
    }

    fn delete(&self, key: &str) -> Result<()> {
        with_retry("delete", || self.inner.delete(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<ListEntry>> {
        with_retry("list", || self.inner.list(prefix))
    }

    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        with_retry("copy", || self.inner.copy(src, dst))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        with_retry("rename", || self.inner.rename(src, dst))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyOnceBackend {
        objects: Mutex<std::collections::HashMap<String, Vec<u8>>>,
        get_calls: AtomicU32,
    }

    impl Backend for FlakyOnceBackend {
        fn lookup(&self, key: &str) -> Result<Option<ObjectMetadata>> {
            Ok(self.objects.lock().unwrap().get(key).map(|_| Default::default()))
        }
        fn get(&self, key: &str) -> Result<Vec<u8>> {
            if self.get_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(BackendError::Transient("simulated network blip".to_string()));
            }
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| BackendError::NoSuchKey(key.to_string()))
        }
        fn put(&self, key: &str, body: &[u8], _metadata: &ObjectMetadata) -> Result<()> {
            self.objects.lock().unwrap().insert(key.to_string(), body.to_vec());
            Ok(())
        }
        fn delete(&self, key: &str) -> Result<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
        fn list(&self, _prefix: &str) -> Result<Vec<ListEntry>> {
            Ok(vec![])
        }
        fn copy(&self, _src: &str, _dst: &str) -> Result<()> {
            Ok(())
        }
        fn rename(&self, _src: &str, _dst: &str) -> Result<()> {
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transient_get_failure_is_retried_until_success() {
        let backend = RetryingBackend::new(FlakyOnceBackend {
            objects: Mutex::new(std::collections::HashMap::from([(
                "k".to_string(),
                b"v".to_vec(),
            )])),
            get_calls: AtomicU32::new(0),
        });
        assert_eq!(backend.get("k").unwrap(), b"v");
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("probe", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Auth("bad credentials".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
