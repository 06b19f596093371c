// Segment persistence: optional decryption of the buffered payload, then an atomic write.

use std::path::Path;
use std::sync::Arc;

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use tracing::{trace, warn};

use crate::config::EngineConfig;
use crate::error::{DecryptError, DownloadError};
use crate::model::{EncryptionInfo, EncryptionMethod, Segment, SegmentId};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// The block-cipher primitive used for encrypted segments.
pub trait SegmentCipher: Send + Sync {
    fn supports(&self, method: EncryptionMethod) -> bool;

    fn decrypt(
        &self,
        method: EncryptionMethod,
        data: Vec<u8>,
        key: &[u8],
        iv: &[u8; 16],
    ) -> Result<Vec<u8>, DecryptError>;
}

/// AES-128-CBC with PKCS#7 padding, as used by HLS `METHOD=AES-128`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesCbcCipher;

impl SegmentCipher for AesCbcCipher {
    fn supports(&self, method: EncryptionMethod) -> bool {
        method == EncryptionMethod::Aes128
    }

    fn decrypt(
        &self,
        method: EncryptionMethod,
        mut data: Vec<u8>,
        key: &[u8],
        iv: &[u8; 16],
    ) -> Result<Vec<u8>, DecryptError> {
        if !self.supports(method) {
            return Err(DecryptError::Cipher(format!("unsupported method {method:?}")));
        }
        let cipher = Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| DecryptError::InvalidKey(format!("failed to initialize AES decryptor: {e}")))?;
        let len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut data)
            .map_err(|e| DecryptError::Cipher(format!("decryption failed: {e}")))?
            .len();
        data.truncate(len);
        Ok(data)
    }
}

/// HLS default IV: the media sequence number as a big-endian 128-bit integer.
pub fn sequence_iv(id: SegmentId) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&id.0.to_be_bytes());
    iv
}

/// Parse a hex IV, with or without a `0x` prefix.
pub fn parse_iv(iv_hex_str: &str) -> Result<[u8; 16], DecryptError> {
    let iv_str = iv_hex_str
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut iv_bytes = [0u8; 16];
    hex::decode_to_slice(iv_str, &mut iv_bytes)
        .map_err(|_| DecryptError::InvalidIv(iv_hex_str.to_string()))?;
    Ok(iv_bytes)
}

/// Writes a fetched segment to its output path, decrypting on the way when asked to.
pub struct DecryptionAdapter {
    cipher: Arc<dyn SegmentCipher>,
    enabled: bool,
    offload: bool,
}

impl DecryptionAdapter {
    pub fn new(cipher: Arc<dyn SegmentCipher>, config: &EngineConfig) -> Self {
        Self {
            cipher,
            enabled: config.decrypt,
            offload: config.offload_decryption,
        }
    }

    /// Drain the segment buffer to disk. Returns the number of bytes written.
    ///
    /// Unsupported encryption methods are written as-is so the payload can be
    /// decrypted out of band.
    pub async fn persist(&self, segment: &mut Segment) -> Result<u64, DownloadError> {
        let data = segment.take_buffer();

        let data = match &segment.encryption {
            Some(info) if self.enabled && self.cipher.supports(info.method) => {
                self.decrypt(segment.id, info, data).await?
            }
            Some(info) if self.enabled => {
                warn!(
                    segment = %segment.id,
                    method = ?info.method,
                    "Unsupported encryption method, keeping encrypted payload"
                );
                data
            }
            _ => data,
        };

        write_atomic(&segment.part_path(), &segment.path, &data).await?;
        trace!(segment = %segment.id, bytes = data.len(), "Segment persisted");
        Ok(data.len() as u64)
    }

    async fn decrypt(
        &self,
        id: SegmentId,
        info: &EncryptionInfo,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, DownloadError> {
        let iv = info.iv.unwrap_or_else(|| sequence_iv(id));
        if self.offload {
            let cipher = Arc::clone(&self.cipher);
            let method = info.method;
            let key = info.key.clone();
            tokio::task::spawn_blocking(move || cipher.decrypt(method, data, &key, &iv))
                .await
                .map_err(|e| DownloadError::Internal {
                    reason: format!("decryption offload task failed: {e}"),
                })?
                .map_err(DownloadError::from)
        } else {
            Ok(self.cipher.decrypt(info.method, data, &info.key, &iv)?)
        }
    }
}

async fn write_atomic(part: &Path, dest: &Path, data: &[u8]) -> Result<(), DownloadError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let result = async {
        tokio::fs::write(part, data).await?;
        tokio::fs::rename(part, dest).await
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(part).await;
    }
    Ok(result?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use cbc::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    pub(crate) fn encrypt_data(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = ((plaintext.len() / 16) + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    fn adapter(decrypt: bool, offload: bool) -> DecryptionAdapter {
        let config = EngineConfig::default()
            .with_decrypt(decrypt)
            .with_offload_decryption(offload);
        DecryptionAdapter::new(Arc::new(AesCbcCipher), &config)
    }

    fn encrypted_segment(dir: &Path, method: EncryptionMethod, iv: Option<[u8; 16]>) -> Segment {
        let key = [0x42u8; 16];
        let payload_iv = iv.unwrap_or_else(|| sequence_iv(SegmentId(9)));
        let mut seg = Segment::new(9, "http://cdn/9.ts", dir.join("9.ts")).with_encryption(
            EncryptionInfo {
                method,
                key: key.to_vec(),
                iv,
            },
        );
        seg.push_chunk(Bytes::from(encrypt_data(b"transport stream bytes", &key, &payload_iv)));
        seg
    }

    #[test]
    fn sequence_iv_is_big_endian() {
        let iv = sequence_iv(SegmentId(0x0102));
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);
    }

    #[test]
    fn parse_iv_accepts_prefix() {
        let iv = parse_iv("0x000102030405060708090A0B0C0D0E0F").unwrap();
        assert_eq!(iv[15], 0x0f);
        assert!(parse_iv("0x1234").is_err());
    }

    #[tokio::test]
    async fn decrypts_with_explicit_iv() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = encrypted_segment(dir.path(), EncryptionMethod::Aes128, Some([7u8; 16]));
        let written = adapter(true, false).persist(&mut seg).await.unwrap();
        assert_eq!(std::fs::read(&seg.path).unwrap(), b"transport stream bytes");
        assert_eq!(written, 22);
        assert!(!seg.part_path().exists());
    }

    #[tokio::test]
    async fn decrypts_with_sequence_iv_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = encrypted_segment(dir.path(), EncryptionMethod::Aes128, None);
        adapter(true, true).persist(&mut seg).await.unwrap();
        assert_eq!(std::fs::read(&seg.path).unwrap(), b"transport stream bytes");
    }

    #[tokio::test]
    async fn disabled_decryption_writes_raw() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = encrypted_segment(dir.path(), EncryptionMethod::Aes128, Some([7u8; 16]));
        let expected = encrypt_data(b"transport stream bytes", &[0x42; 16], &[7u8; 16]);
        adapter(false, false).persist(&mut seg).await.unwrap();
        assert_eq!(std::fs::read(&seg.path).unwrap(), expected);
    }

    #[tokio::test]
    async fn unsupported_method_falls_back_to_raw() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = encrypted_segment(dir.path(), EncryptionMethod::SampleAes, Some([7u8; 16]));
        let expected = encrypt_data(b"transport stream bytes", &[0x42; 16], &[7u8; 16]);
        adapter(true, false).persist(&mut seg).await.unwrap();
        assert_eq!(std::fs::read(&seg.path).unwrap(), expected);
    }

    #[tokio::test]
    async fn wrong_key_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = encrypted_segment(dir.path(), EncryptionMethod::Aes128, Some([7u8; 16]));
        if let Some(info) = seg.encryption.as_mut() {
            info.key = vec![0u8; 15];
        }
        let err = adapter(true, false).persist(&mut seg).await.unwrap_err();
        assert!(matches!(err, DownloadError::Decryption { .. }));
        assert!(!seg.path.exists());
    }
}
