//! Per-object wire format (spec §4.2, §6).
//!
//! Header layout: `magic(5) | version(1) | obj_id(8) | alg(1) | nonce(16) |
//! ct_len(8) | ciphertext | auth_tag(16)`. `aes-gcm` returns the
//! authentication tag appended to the ciphertext, so on the wire `ct_len`
//! covers `ciphertext || auth_tag` as one contiguous run rather than the
//! tag being a trailing sibling field — same bytes, simpler bookkeeping.
//! `alg` packs the compression algorithm only: encryption is unconditional
//! here (always AES-256-GCM), unlike `byte271-6cy`'s `BlockHeader::flags`
//! bit which makes encryption optional — spec §4.2 has no encryption
//! opt-out for s3ql, so there's no flags byte to carry.
//!
//! Compression is chosen at write time from configuration and is authority
//! of the header at read time (spec §4.2: "read-time is dictated by header
//! bytes, so algorithm may change across the filesystem").

use std::io::{Read, Write};

use crate::config::CompressionAlgorithm;
use crate::crypto::{self, MasterKey, NONCE_LEN};
use crate::error::{Result, S3qlError};

pub const MAGIC: &[u8; 5] = b"s3ql_";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 5 + 1 + 8 + 1 + NONCE_LEN + 8;

pub struct ObjectHeader {
    pub obj_id: u64,
    pub algorithm: CompressionAlgorithm,
    pub nonce: [u8; NONCE_LEN],
    pub ct_len: u64,
}

impl ObjectHeader {
    pub fn write<W: Write>(&self, mut w: W) -> Result<()> {
        let mut buf = [0u8; HEADER_LEN];
        let mut pos = 0;
        buf[pos..pos + 5].copy_from_slice(MAGIC);
        pos += 5;
        buf[pos] = FORMAT_VERSION;
        pos += 1;
        buf[pos..pos + 8].copy_from_slice(&self.obj_id.to_le_bytes());
        pos += 8;
        buf[pos] = self.algorithm.as_byte();
        pos += 1;
        buf[pos..pos + NONCE_LEN].copy_from_slice(&self.nonce);
        pos += NONCE_LEN;
        buf[pos..pos + 8].copy_from_slice(&self.ct_len.to_le_bytes());
        pos += 8;
        debug_assert_eq!(pos, HEADER_LEN);
        w.write_all(&buf)?;
        Ok(())
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        r.read_exact(&mut buf)?;
        if &buf[0..5] != MAGIC {
            return Err(S3qlError::Corruption("bad object magic".to_string()));
        }
        let version = buf[5];
        if version != FORMAT_VERSION {
            return Err(S3qlError::VersionMismatch(format!(
                "object format version {version}, expected {FORMAT_VERSION}"
            )));
        }
        let obj_id = u64::from_le_bytes(buf[6..14].try_into().unwrap());
        let algorithm = CompressionAlgorithm::from_byte(buf[14])?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[15..15 + NONCE_LEN]);
        let ct_len_offset = 15 + NONCE_LEN;
        let ct_len = u64::from_le_bytes(buf[ct_len_offset..ct_len_offset + 8].try_into().unwrap());
        Ok(Self {
            obj_id,
            algorithm,
            nonce,
            ct_len,
        })
    }
}

fn compress(algorithm: CompressionAlgorithm, level: i32, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zlib => {
            use flate2::write::ZlibEncoder;
            use flate2::Compression;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.clamp(0, 9) as u32));
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgorithm::Lzma => {
            use xz2::write::XzEncoder;
            let mut encoder = XzEncoder::new(Vec::new(), level.clamp(0, 9) as u32);
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgorithm::Zstd => {
            zstd::encode_all(data, level.clamp(1, 22))
                .map_err(|e| S3qlError::Io(e))
        }
    }
}

fn decompress(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zlib => {
            use flate2::read::ZlibDecoder;
            let mut decoder = ZlibDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionAlgorithm::Lzma => {
            use xz2::read::XzDecoder;
            let mut decoder = XzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionAlgorithm::Zstd => {
            zstd::decode_all(data).map_err(|e| S3qlError::Io(e))
        }
    }
}

/// Encodes one block (or metadata snapshot) into a full backend object:
/// header + authenticated ciphertext of the compressed plaintext.
pub fn encode_object(
    obj_id: u64,
    plaintext: &[u8],
    algorithm: CompressionAlgorithm,
    level: i32,
    master_key: &MasterKey,
) -> Result<Vec<u8>> {
    let compressed = compress(algorithm, level, plaintext)?;
    let (nonce, ciphertext) = crypto::encrypt_object(master_key, obj_id, &compressed);
    let header = ObjectHeader {
        obj_id,
        algorithm,
        nonce,
        ct_len: ciphertext.len() as u64,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    header.write(&mut out)?;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decodes a full backend object back into plaintext, verifying the AEAD
/// tag (spec §4.2: "Integrity covers header+payload; tampering fails with
/// `checksum-mismatch`").
pub fn decode_object(obj_bytes: &[u8], master_key: &MasterKey) -> Result<(u64, Vec<u8>)> {
    let header = ObjectHeader::read(obj_bytes)?;
    let ciphertext = &obj_bytes[HEADER_LEN..];
    if ciphertext.len() as u64 != header.ct_len {
        return Err(S3qlError::Corruption(format!(
            "object {} declares ct_len {} but has {} ciphertext bytes",
            header.obj_id,
            header.ct_len,
            ciphertext.len()
        )));
    }
    let compressed = crypto::decrypt_object(master_key, header.obj_id, &header.nonce, ciphertext)?;
    let plaintext = decompress(header.algorithm, &compressed)?;
    Ok((header.obj_id, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algorithm: CompressionAlgorithm) {
        let master_key = MasterKey::generate();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let encoded = encode_object(7, &data, algorithm, 6, &master_key).unwrap();
        let (obj_id, decoded) = decode_object(&encoded, &master_key).unwrap();
        assert_eq!(obj_id, 7);
        assert_eq!(decoded, data);
    }

    #[test]
    fn roundtrip_none() {
        roundtrip(CompressionAlgorithm::None);
    }

    #[test]
    fn roundtrip_zlib() {
        roundtrip(CompressionAlgorithm::Zlib);
    }

    #[test]
    fn roundtrip_lzma() {
        roundtrip(CompressionAlgorithm::Lzma);
    }

    #[test]
    fn roundtrip_zstd() {
        roundtrip(CompressionAlgorithm::Zstd);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let master_key = MasterKey::generate();
        let mut encoded = encode_object(1, b"data", CompressionAlgorithm::None, 1, &master_key).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(decode_object(&encoded, &master_key).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let master_key = MasterKey::generate();
        let other_key = MasterKey::generate();
        let encoded = encode_object(1, b"data", CompressionAlgorithm::Zlib, 1, &master_key).unwrap();
        assert!(decode_object(&encoded, &other_key).is_err());
    }
}
