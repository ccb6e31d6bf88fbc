//! AES-CBC protection of document fragments.
//!
//! Protected values travel inside resolved documents as
//! `$ocm_encrypted:<base64 of AES-CBC ciphertext>`. The IV is configured
//! out-of-band and never embedded in the fragment. PKCS#7 padding is applied
//! in-crate so unpadding failures carry a usable diagnostic and so the
//! fallback-key policy can tell key-dependent failures from structural ones.

mod pipeline;

pub use pipeline::{decrypt_embedded, DecryptPassError};

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::config::{EncryptionConfig, IV_SIZE};

/// Marker prefix of an encrypted fragment in a stored document.
pub const ENCRYPTED_PREFIX: &str = "$ocm_encrypted:";

/// AES block size in bytes, independent of key size.
pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("the AES key is invalid: unsupported key length {0}")]
    InvalidAesKey(usize),

    #[error("the initialization vector must be 128 bits")]
    InvalidIv,

    #[error("the encrypted string is invalid base64: {0}")]
    InvalidBase64(String),

    #[error("the ciphertext does not align to the AES block size")]
    MisalignedCiphertext,

    #[error("invalid PCKS7 padding: {0}")]
    InvalidPadding(&'static str),

    #[error("the decrypted value is not valid UTF-8")]
    NotUtf8,
}

/// Validated key material for one resolve call.
#[derive(Clone)]
pub struct CipherSettings {
    key: Vec<u8>,
    fallback_key: Option<Vec<u8>>,
    iv: [u8; IV_SIZE],
}

impl CipherSettings {
    pub fn new(
        key: Vec<u8>,
        fallback_key: Option<Vec<u8>>,
        iv: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        check_key_length(&key)?;
        if let Some(fallback) = &fallback_key {
            check_key_length(fallback)?;
        }
        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| CryptoError::InvalidIv)?;

        Ok(Self {
            key,
            fallback_key,
            iv,
        })
    }

    /// Builds settings from an [`EncryptionConfig`] with either mode enabled.
    /// Returns `None` when both modes are disabled.
    pub fn from_config(config: &EncryptionConfig) -> Result<Option<Self>, CryptoError> {
        if !config.encryption_enabled && !config.decryption_enabled {
            return Ok(None);
        }

        let key = config.aes_key.clone().ok_or(CryptoError::InvalidAesKey(0))?;
        let iv = config
            .initialization_vector
            .clone()
            .ok_or(CryptoError::InvalidIv)?;

        Self::new(key, config.aes_key_fallback.clone(), iv).map(Some)
    }
}

impl std::fmt::Debug for CipherSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSettings")
            .field("key_len", &self.key.len())
            .field("has_fallback", &self.fallback_key.is_some())
            .finish_non_exhaustive()
    }
}

fn check_key_length(key: &[u8]) -> Result<(), CryptoError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        other => Err(CryptoError::InvalidAesKey(other)),
    }
}

/// Encrypts a value into the `$ocm_encrypted:<base64>` wire form.
///
/// Empty input stays empty and is never prefixed.
pub fn protect(settings: &CipherSettings, value: &str) -> Result<String, CryptoError> {
    if value.is_empty() {
        return Ok(String::new());
    }

    let padded = pkcs7_pad(value.as_bytes(), AES_BLOCK_SIZE);
    let ciphertext = cbc_encrypt(&settings.key, &settings.iv, &padded)?;

    Ok(format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(ciphertext)))
}

/// Decrypts the base64 payload of one fragment (without its prefix).
///
/// Structural failures (bad base64, truncated ciphertext) are reported
/// directly. Key-dependent failures (padding, non-UTF-8 plaintext) are
/// retried once with the fallback key when one is configured; only when both
/// keys fail is an error returned.
pub fn decrypt_fragment(settings: &CipherSettings, b64: &str) -> Result<String, CryptoError> {
    let ciphertext = BASE64
        .decode(b64)
        .map_err(|err| CryptoError::InvalidBase64(err.to_string()))?;

    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::MisalignedCiphertext);
    }

    match decrypt_with_key(&settings.key, &settings.iv, &ciphertext) {
        Ok(plaintext) => Ok(plaintext),
        Err(primary_err) => {
            let Some(fallback) = &settings.fallback_key else {
                return Err(primary_err);
            };

            tracing::debug!(
                error = %primary_err,
                "the primary AES key failed to decrypt a fragment, retrying with the fallback key"
            );

            decrypt_with_key(fallback, &settings.iv, &ciphertext)
        }
    }
}

fn decrypt_with_key(
    key: &[u8],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
) -> Result<String, CryptoError> {
    let padded = cbc_decrypt(key, iv, ciphertext)?;
    let plaintext = pkcs7_unpad(&padded)?;

    String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::NotUtf8)
}

fn cbc_encrypt(key: &[u8], iv: &[u8; IV_SIZE], padded: &[u8]) -> Result<Vec<u8>, CryptoError> {
    // The input is always padded to a whole number of blocks, so NoPadding
    // cannot fail here.
    match key.len() {
        16 => Ok(cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidAesKey(key.len()))?
            .encrypt_padded_vec_mut::<NoPadding>(padded)),
        24 => Ok(cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidAesKey(key.len()))?
            .encrypt_padded_vec_mut::<NoPadding>(padded)),
        32 => Ok(cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidAesKey(key.len()))?
            .encrypt_padded_vec_mut::<NoPadding>(padded)),
        other => Err(CryptoError::InvalidAesKey(other)),
    }
}

fn cbc_decrypt(key: &[u8], iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidAesKey(key.len()))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CryptoError::MisalignedCiphertext),
        24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidAesKey(key.len()))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CryptoError::MisalignedCiphertext),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidAesKey(key.len()))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CryptoError::MisalignedCiphertext),
        other => Err(CryptoError::InvalidAesKey(other)),
    }
}

/// Right-pads to a whole number of blocks. Padding is always present: when
/// the value is already aligned, a full block of padding is added. Each
/// padding byte holds the padding amount, so the last byte of the padded
/// value says how much to remove.
pub fn pkcs7_pad(value: &[u8], block_size: usize) -> Vec<u8> {
    let padding = block_size - (value.len() % block_size);
    let mut padded = Vec::with_capacity(value.len() + padding);
    padded.extend_from_slice(value);
    padded.extend(std::iter::repeat(padding as u8).take(padding));

    padded
}

/// Removes PKCS#7 padding. The last byte must be a padding length within
/// `[1, len]` and all declared padding bytes must match it.
pub fn pkcs7_unpad(padded: &[u8]) -> Result<&[u8], CryptoError> {
    let Some(&last) = padded.last() else {
        return Err(CryptoError::InvalidPadding("the padding length is invalid"));
    };

    let num_padding = last as usize;
    if num_padding == 0 || num_padding > padded.len() {
        return Err(CryptoError::InvalidPadding("the padding length is invalid"));
    }

    if padded[padded.len() - num_padding..]
        .iter()
        .any(|&byte| byte != last)
    {
        return Err(CryptoError::InvalidPadding(
            "not all the padding bytes match",
        ));
    }

    Ok(&padded[..padded.len() - num_padding])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(key: Vec<u8>, fallback: Option<Vec<u8>>) -> CipherSettings {
        CipherSettings::new(key, fallback, b"abcdefghijklmnop".to_vec())
            .expect("valid test settings")
    }

    #[test]
    fn test_protect_round_trips_for_every_key_size() {
        for key_len in [16, 24, 32] {
            let settings = settings(vec![7u8; key_len], None);
            for plaintext in ["a", "sixteen bytes!!!", "a longer value that spans blocks\n"] {
                let protected = protect(&settings, plaintext).expect("encrypt");
                let b64 = protected
                    .strip_prefix(ENCRYPTED_PREFIX)
                    .expect("fragment must carry the wire prefix");
                let decrypted = decrypt_fragment(&settings, b64).expect("decrypt");
                assert_eq!(decrypted, plaintext);
            }
        }
    }

    #[test]
    fn test_protect_keeps_empty_input_empty() {
        let settings = settings(vec![7u8; 32], None);
        assert_eq!(protect(&settings, "").expect("encrypt"), "");
    }

    #[test]
    fn test_pkcs7_pad_always_pads_to_whole_blocks() {
        for len in 0..=48 {
            let value = vec![0x41u8; len];
            let padded = pkcs7_pad(&value, AES_BLOCK_SIZE);

            assert_eq!(padded.len() % AES_BLOCK_SIZE, 0);
            assert!(padded.len() > value.len(), "padding must always be added");

            let last = *padded.last().expect("padded value is never empty") as usize;
            assert!((1..=AES_BLOCK_SIZE).contains(&last));
            assert!(padded[padded.len() - last..]
                .iter()
                .all(|&b| b as usize == last));
            assert_eq!(pkcs7_unpad(&padded).expect("unpad"), value.as_slice());
        }
    }

    #[test]
    fn test_pkcs7_unpad_rejects_bad_padding() {
        match pkcs7_unpad(&[1, 2, 3, 0]) {
            Err(CryptoError::InvalidPadding(reason)) => {
                assert_eq!(reason, "the padding length is invalid");
            }
            other => panic!("expected a padding error, got {:?}", other),
        }

        match pkcs7_unpad(&[1, 2, 3, 200]) {
            Err(CryptoError::InvalidPadding(reason)) => {
                assert_eq!(reason, "the padding length is invalid");
            }
            other => panic!("expected a padding error, got {:?}", other),
        }

        match pkcs7_unpad(&[1, 2, 2, 3, 3]) {
            Err(CryptoError::InvalidPadding(reason)) => {
                assert_eq!(reason, "not all the padding bytes match");
            }
            other => panic!("expected a padding error, got {:?}", other),
        }
    }

    #[test]
    fn test_padding_error_message_spelling() {
        // The wire diagnostic is load-bearing for callers that match on it.
        let err = pkcs7_unpad(&[0u8; 4]).expect_err("invalid padding");
        assert_eq!(
            err.to_string(),
            "invalid PCKS7 padding: the padding length is invalid"
        );
    }

    #[test]
    fn test_decrypt_rejects_invalid_base64_without_retry() {
        let settings = settings(vec![7u8; 16], Some(vec![9u8; 16]));
        match decrypt_fragment(&settings, "!!! not base64 !!!") {
            Err(CryptoError::InvalidBase64(_)) => {}
            other => panic!("expected a base64 error, got {:?}", other),
        }
    }

    #[test]
    fn test_decrypt_rejects_misaligned_ciphertext() {
        let settings = settings(vec![7u8; 16], None);
        // "aGVsbG8=" decodes to 5 bytes, which is not a whole AES block.
        match decrypt_fragment(&settings, "aGVsbG8=") {
            Err(CryptoError::MisalignedCiphertext) => {}
            other => panic!("expected a misalignment error, got {:?}", other),
        }
    }

    #[test]
    fn test_fallback_key_recovers_rotated_fragments() {
        let old_key = vec![1u8; 32];
        let new_key = vec![2u8; 32];

        let old_settings = settings(old_key.clone(), None);
        let protected = protect(&old_settings, "rotated secret").expect("encrypt");
        let b64 = protected
            .strip_prefix(ENCRYPTED_PREFIX)
            .expect("wire prefix");

        // Primary key changed; fallback still covers the old fragment.
        let rotated = settings(new_key.clone(), Some(old_key));
        assert_eq!(
            decrypt_fragment(&rotated, b64).expect("decrypt via fallback"),
            "rotated secret"
        );

        // Without the fallback the fragment is unreadable.
        let rotated_without_fallback = settings(new_key, None);
        let recovered = decrypt_fragment(&rotated_without_fallback, b64).ok();
        assert_ne!(recovered.as_deref(), Some("rotated secret"));
    }

    #[test]
    fn test_settings_validate_key_material() {
        match CipherSettings::new(vec![0u8; 11], None, vec![0u8; IV_SIZE]) {
            Err(CryptoError::InvalidAesKey(11)) => {}
            other => panic!("expected an invalid key error, got {:?}", other),
        }

        match CipherSettings::new(vec![0u8; 16], None, vec![0u8; 8]) {
            Err(CryptoError::InvalidIv) => {}
            other => panic!("expected an invalid IV error, got {:?}", other),
        }
    }
}
