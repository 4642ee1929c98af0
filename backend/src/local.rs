//! Local-directory backend (spec §1, §9: one of the supported backend
//! variants; the only one implemented in this core — S3/Azure/GCS/B2/SFTP
//! drivers are explicitly out of scope).
//!
//! Layout on disk mirrors the object namespace directly: a key
//! `s3ql_data_42` becomes a file `<root>/s3ql_data_42`. Metadata is stored
//! inline as a tiny sidecar `<key>.meta` file, since a plain directory has
//! no server-side key-value store (spec §4.1: "else inline at object head" —
//! here it is inline next to the object instead, which is simpler for a
//! directory backend and does not change the codec, whose own header is
//! still authoritative).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::error::{BackendError, Result};
use crate::{Backend, ListEntry, ObjectMetadata};

pub struct LocalBackend {
    root: PathBuf,
    // Teacher's `FileDiskDriver` keeps a single in-process cursor guarded by
    // `&mut self`; a backend is shared across upload/compression/cache
    // worker threads, so a directory backend needs its own mutex instead.
    lock: Mutex<()>,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.meta"))
    }

    fn write_atomic(&self, path: &Path, body: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(body)?;
        tmp.persist(path)
            .map_err(|e| BackendError::Io(e.error))?;
        Ok(())
    }

    fn serialize_metadata(meta: &ObjectMetadata) -> String {
        meta.iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect::<String>()
    }

    fn deserialize_metadata(s: &str) -> ObjectMetadata {
        s.lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

impl Backend for LocalBackend {
    fn lookup(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let _guard = self.lock.lock().unwrap();
        let path = self.object_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let meta = match fs::read_to_string(self.meta_path(key)) {
            Ok(s) => Self::deserialize_metadata(&s),
            Err(_) => HashMap::new(),
        };
        Ok(Some(meta))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().unwrap();
        let path = self.object_path(key);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::NoSuchKey(key.to_string()),
            _ => BackendError::Io(e),
        })
    }

    fn put(&self, key: &str, body: &[u8], metadata: &ObjectMetadata) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        self.write_atomic(&self.object_path(key), body)?;
        if !metadata.is_empty() {
            self.write_atomic(
                &self.meta_path(key),
                Self::serialize_metadata(metadata).as_bytes(),
            )?;
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        match fs::remove_file(self.object_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BackendError::Io(e)),
        }
        let _ = fs::remove_file(self.meta_path(key));
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ListEntry>> {
        let _guard = self.lock.lock().unwrap();
        let mut entries = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".meta") {
                continue;
            }
            if name.starts_with(prefix) {
                entries.push(ListEntry {
                    key: name.into_owned(),
                });
            }
        }
        Ok(entries)
    }

    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        fs::copy(self.object_path(src), self.object_path(dst))?;
        if self.meta_path(src).exists() {
            fs::copy(self.meta_path(src), self.meta_path(dst))?;
        }
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        fs::rename(self.object_path(src), self.object_path(dst))?;
        if self.meta_path(src).exists() {
            fs::rename(self.meta_path(src), self.meta_path(dst))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.put("s3ql_data_1", b"hello", &HashMap::new()).unwrap();
        assert_eq!(backend.get("s3ql_data_1").unwrap(), b"hello");
        assert!(backend.lookup("s3ql_data_1").unwrap().is_some());
        assert!(backend.lookup("s3ql_data_2").unwrap().is_none());
    }

    #[test]
    fn delete_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.delete("does_not_exist").unwrap();
    }

    #[test]
    fn list_excludes_sidecar_files_and_respects_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let mut meta = HashMap::new();
        meta.insert("k".to_string(), "v".to_string());
        backend.put("s3ql_data_1", b"a", &meta).unwrap();
        backend.put("s3ql_seq_no_0", b"", &HashMap::new()).unwrap();
        let data_keys = backend.list("s3ql_data_").unwrap();
        assert_eq!(data_keys.len(), 1);
        assert_eq!(data_keys[0].key, "s3ql_data_1");
    }

    #[test]
    fn rename_moves_object_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let mut meta = HashMap::new();
        meta.insert("k".to_string(), "v".to_string());
        backend.put("a", b"body", &meta).unwrap();
        backend.rename("a", "b").unwrap();
        assert!(backend.lookup("a").unwrap().is_none());
        assert_eq!(backend.get("b").unwrap(), b"body");
    }
}
