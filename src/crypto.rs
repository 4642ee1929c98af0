//! Master key management and per-object AEAD (spec §4.2).
//!
//! Grounded on `byte271-6cy`'s `crypto::encrypt`/`crypto::decrypt` pair
//! (`src/block.rs` calls exactly these two functions around compression),
//! generalized from that crate's fixed key to s3ql's per-object subkey
//! derived via HMAC, as spec §4.2 requires: "a per-object subkey derived as
//! `HMAC(master_key, obj_id || nonce)`".

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, S3qlError};

pub const NONCE_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct MasterKey(pub [u8; KEY_LEN]);

impl MasterKey {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Derives the per-object subkey: `HMAC(master_key, obj_id || nonce)`.
    pub fn derive_object_key(&self, obj_id: u64, nonce: &[u8; NONCE_LEN]) -> [u8; KEY_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length");
        mac.update(&obj_id.to_le_bytes());
        mac.update(nonce);
        let result = mac.finalize().into_bytes();
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&result);
        out
    }
}

/// Encrypts `plaintext` under the subkey derived for `obj_id`, returning the
/// freshly generated nonce and the ciphertext (with the AEAD tag appended,
/// matching the wire layout of spec §6: `... | ciphertext | auth_tag(16)`).
pub fn encrypt_object(
    master_key: &MasterKey,
    obj_id: u64,
    plaintext: &[u8],
) -> ([u8; NONCE_LEN], Vec<u8>) {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
    }
    let subkey = master_key.derive_object_key(obj_id, &nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&subkey));
    // AES-GCM's own nonce is 12 bytes; we carry a wider 16-byte nonce on the
    // wire (spec §6) and use its first 12 bytes as the AEAD nonce, keeping
    // the remaining 4 bytes as additional per-object entropy folded into
    // subkey derivation above.
    let aead_nonce = Nonce::from_slice(&nonce_bytes[..12]);
    let ciphertext = cipher
        .encrypt(aead_nonce, plaintext)
        .expect("AES-256-GCM encryption over in-memory buffers cannot fail");
    (nonce_bytes, ciphertext)
}

/// Decrypts and authenticates an object payload. Tampering (header or
/// payload) surfaces as `checksum-mismatch` per spec §4.2/§7.
pub fn decrypt_object(
    master_key: &MasterKey,
    obj_id: u64,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let subkey = master_key.derive_object_key(obj_id, nonce);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&subkey));
    let aead_nonce = Nonce::from_slice(&nonce[..12]);
    cipher
        .decrypt(aead_nonce, ciphertext)
        .map_err(|_| S3qlError::ChecksumMismatch("AEAD tag verification failed".to_string()))
}

/// `s3ql_passphrase` object contents (spec §4.2, §6): the master key
/// wrapped by a passphrase-derived key, itself run through the same AEAD
/// primitive above under a fixed nonce of zero plus a salt, using
/// `obj_id = 0` as a reserved id (no data object ever claims id 0).
pub struct WrappedMasterKey {
    pub salt: [u8; 16],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

const PASSPHRASE_RESERVED_OBJ_ID: u64 = 0;

fn derive_passphrase_key(passphrase: &str, salt: &[u8; 16]) -> MasterKey {
    // HMAC-SHA256-based KDF: sufficient here since this mirrors the
    // teacher's general "derive a subkey via HMAC" idiom (spec §4.2) rather
    // than reimplementing a dedicated password-hashing scheme, which is out
    // of scope for the storage engine core.
    let mut mac = HmacSha256::new_from_slice(b"s3ql-passphrase-kdf-v1")
        .expect("HMAC accepts any key length");
    mac.update(salt);
    mac.update(passphrase.as_bytes());
    let result = mac.finalize().into_bytes();
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&result);
    MasterKey(key)
}

pub fn wrap_master_key(passphrase: &str, master_key: &MasterKey) -> WrappedMasterKey {
    let mut salt = [0u8; 16];
    {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut salt);
    }
    let wrapping_key = derive_passphrase_key(passphrase, &salt);
    let (nonce, ciphertext) =
        encrypt_object(&wrapping_key, PASSPHRASE_RESERVED_OBJ_ID, &master_key.0);
    WrappedMasterKey {
        salt,
        nonce,
        ciphertext,
    }
}

pub fn unwrap_master_key(passphrase: &str, wrapped: &WrappedMasterKey) -> Result<MasterKey> {
    let wrapping_key = derive_passphrase_key(passphrase, &wrapped.salt);
    let plaintext = decrypt_object(
        &wrapping_key,
        PASSPHRASE_RESERVED_OBJ_ID,
        &wrapped.nonce,
        &wrapped.ciphertext,
    )
    .map_err(|_| S3qlError::Auth("wrong passphrase".to_string()))?;
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&plaintext);
    Ok(MasterKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = MasterKey::generate();
        let (nonce, ct) = encrypt_object(&key, 42, b"hello block");
        let pt = decrypt_object(&key, 42, &nonce, &ct).unwrap();
        assert_eq!(pt, b"hello block");
    }

    #[test]
    fn tampered_ciphertext_fails_checksum() {
        let key = MasterKey::generate();
        let (nonce, mut ct) = encrypt_object(&key, 1, b"data");
        ct[0] ^= 0xff;
        assert!(decrypt_object(&key, 1, &nonce, &ct).is_err());
    }

    #[test]
    fn wrong_obj_id_fails_to_decrypt() {
        let key = MasterKey::generate();
        let (nonce, ct) = encrypt_object(&key, 1, b"data");
        assert!(decrypt_object(&key, 2, &nonce, &ct).is_err());
    }

    #[test]
    fn passphrase_wrap_unwrap_roundtrip() {
        let master = MasterKey::generate();
        let wrapped = wrap_master_key("hunter2", &master);
        let unwrapped = unwrap_master_key("hunter2", &wrapped).unwrap();
        assert_eq!(master.0, unwrapped.0);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let master = MasterKey::generate();
        let wrapped = wrap_master_key("hunter2", &master);
        assert!(unwrap_master_key("wrong", &wrapped).is_err());
    }
}
