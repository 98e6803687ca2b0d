//! Encrypted attachments (`v2`): AES-256-CTR with a JWK key and an unpadded
//! base64 SHA-256 of the ciphertext.

use std::collections::BTreeMap;

use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::types::{EncryptedFile, JsonWebKey, MatrixError};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Encrypts `data` in place. The returned descriptor has an empty `url`
/// until the ciphertext is uploaded.
pub fn encrypt(data: &mut [u8]) -> Result<EncryptedFile, MatrixError> {
    let mut rng = rand::thread_rng();
    let mut key = [0u8; 32];
    rng.fill_bytes(&mut key);
    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut iv[..8]);

    let mut cipher = Aes256Ctr::new_from_slices(&key, &iv)
        .map_err(|e| MatrixError::Attachment(e.to_string()))?;
    cipher.apply_keystream(data);

    let mut hashes = BTreeMap::new();
    hashes.insert("sha256".to_string(), STANDARD_NO_PAD.encode(Sha256::digest(&*data)));

    Ok(EncryptedFile {
        url: String::new(),
        key: JsonWebKey {
            kty: "oct".to_string(),
            key_ops: vec!["encrypt".to_string(), "decrypt".to_string()],
            alg: "A256CTR".to_string(),
            k: URL_SAFE_NO_PAD.encode(key),
            ext: true,
        },
        iv: STANDARD_NO_PAD.encode(iv),
        hashes,
        v: "v2".to_string(),
    })
}

pub fn decrypt(ciphertext: &[u8], file: &EncryptedFile) -> Result<Vec<u8>, MatrixError> {
    if let Some(expected) = file.hashes.get("sha256") {
        let actual = STANDARD_NO_PAD.encode(Sha256::digest(ciphertext));
        if actual != expected.trim_end_matches('=') {
            return Err(MatrixError::Attachment("hash mismatch".to_string()));
        }
    }

    let key = URL_SAFE_NO_PAD
        .decode(file.key.k.trim_end_matches('='))
        .map_err(|e| MatrixError::Attachment(format!("bad key: {e}")))?;
    let iv = STANDARD_NO_PAD
        .decode(file.iv.trim_end_matches('='))
        .map_err(|e| MatrixError::Attachment(format!("bad iv: {e}")))?;

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new_from_slices(&key, &iv)
        .map_err(|e| MatrixError::Attachment(e.to_string()))?;
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_attachment_decrypts_back() {
        let original = b"hello attachment".to_vec();
        let mut data = original.clone();
        let file = encrypt(&mut data).expect("encrypt");
        assert_ne!(data, original);
        assert_eq!(file.key.alg, "A256CTR");
        assert_eq!(decrypt(&data, &file).expect("decrypt"), original);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let mut data = b"payload".to_vec();
        let file = encrypt(&mut data).expect("encrypt");
        data[0] ^= 0xff;
        assert!(matches!(decrypt(&data, &file), Err(MatrixError::Attachment(_))));
    }
}
