//! Chunk encryption
//!
//! AES-256-GCM with a fresh random key and nonce per chunk. The auth tag is
//! kept detached so the ciphertext keeps the plaintext length and frag sizes
//! stay a function of the compressed size.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use rand::RngCore;

use crate::coding::CipherType;
use crate::error::{Error, Result};
use crate::model::CipherParams;

pub const AES_256_GCM_KEY_LEN: usize = 32;
pub const AES_256_GCM_NONCE_LEN: usize = 12;
pub const AES_256_GCM_TAG_LEN: usize = 16;

fn cipher_err(cipher_type: CipherType, reason: impl Into<String>) -> Error {
    Error::Cipher {
        cipher: cipher_type.name().to_string(),
        reason: reason.into(),
    }
}

/// Encrypt `buf` in place under a freshly generated key.
pub fn encrypt(cipher_type: CipherType, buf: &mut Vec<u8>) -> Result<CipherParams> {
    match cipher_type {
        CipherType::Aes256Gcm => {
            let mut key = vec![0u8; AES_256_GCM_KEY_LEN];
            let mut iv = vec![0u8; AES_256_GCM_NONCE_LEN];
            let mut rng = rand::rng();
            rng.fill_bytes(&mut key);
            rng.fill_bytes(&mut iv);

            let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
            let tag = cipher
                .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", buf.as_mut_slice())
                .map_err(|e| cipher_err(cipher_type, format!("encryption failed: {e}")))?;

            Ok(CipherParams {
                cipher_type,
                key,
                iv,
                auth_tag: tag.to_vec(),
            })
        }
    }
}

/// Decrypt `buf` in place and verify its auth tag.
pub fn decrypt(params: &CipherParams, buf: &mut [u8]) -> Result<()> {
    match params.cipher_type {
        CipherType::Aes256Gcm => {
            if params.key.len() != AES_256_GCM_KEY_LEN
                || params.iv.len() != AES_256_GCM_NONCE_LEN
                || params.auth_tag.len() != AES_256_GCM_TAG_LEN
            {
                return Err(cipher_err(
                    params.cipher_type,
                    "key, iv or auth tag has the wrong length",
                ));
            }
            let cipher = Aes256Gcm::new(GenericArray::from_slice(&params.key));
            cipher
                .decrypt_in_place_detached(
                    GenericArray::from_slice(&params.iv),
                    b"",
                    buf,
                    GenericArray::from_slice(&params.auth_tag),
                )
                .map_err(|_| cipher_err(params.cipher_type, "authentication failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_preserves_length() {
        let plain = b"some chunk bytes".to_vec();
        let mut buf = plain.clone();
        let params = encrypt(CipherType::Aes256Gcm, &mut buf).unwrap();
        assert_eq!(buf.len(), plain.len());
        assert_ne!(buf, plain);
        assert_eq!(params.key.len(), AES_256_GCM_KEY_LEN);
        assert_eq!(params.auth_tag.len(), AES_256_GCM_TAG_LEN);

        decrypt(&params, &mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut buf = b"tamper with me".to_vec();
        let params = encrypt(CipherType::Aes256Gcm, &mut buf).unwrap();
        buf[0] ^= 0xff;
        assert!(matches!(decrypt(&params, &mut buf), Err(Error::Cipher { .. })));
    }

    #[test]
    fn test_keys_are_fresh_per_chunk() {
        let a = encrypt(CipherType::Aes256Gcm, &mut vec![0u8; 8]).unwrap();
        let b = encrypt(CipherType::Aes256Gcm, &mut vec![0u8; 8]).unwrap();
        assert_ne!(a.key, b.key);
    }
}
