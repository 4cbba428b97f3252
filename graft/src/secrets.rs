//! Connection secrets are kept encrypted at rest. The secret payload is a flat
//! JSON object (credential name to value) serialized and sealed with
//! AES-256-GCM; the nonce is prepended to the ciphertext.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead},
    Aes256Gcm, KeyInit,
};
use anyhow::{anyhow, bail, Context, Result};
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use std::collections::HashMap;

const NONCE_SIZE: usize = 12; // Standard nonce size for AES-GCM

pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Invalid encryption key; {e}"))?;

    let mut n = vec![0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut n);
    let nonce = GenericArray::from_slice(&n);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| anyhow!("Could not encrypt secret payload; {e}"))?;
    Ok([nonce.as_slice(), ciphertext.as_slice()].concat())
}

pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE {
        bail!("Ciphertext is too short and may be malformed");
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Invalid encryption key; {e}"))?;
    let (nonce, ciphertext) = ciphertext.split_at(NONCE_SIZE);
    let nonce = GenericArray::from_slice(nonce);
    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|e| anyhow!("Could not decrypt secret payload; {e}"))
}

/// Serialize and encrypt a credentials map for storage.
pub fn seal(key: &[u8], secrets: &HashMap<String, Value>) -> Result<Vec<u8>> {
    let plaintext =
        serde_json::to_vec(secrets).context("Could not serialize secret payload")?;
    encrypt(key, &plaintext)
}

/// Decrypt and deserialize a stored credentials blob. An empty blob is an
/// empty map; connections without secrets store nothing.
pub fn unseal(key: &[u8], blob: &[u8]) -> Result<HashMap<String, Value>> {
    if blob.is_empty() {
        return Ok(HashMap::new());
    }

    let plaintext = decrypt(key, blob)?;
    serde_json::from_slice(&plaintext).context("Could not deserialize secret payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY: &[u8] = b"changemechangemechangemechangeme";

    #[test]
    fn seal_then_unseal() {
        let mut secrets = HashMap::new();
        secrets.insert("password".to_string(), Value::String("hunter2".into()));
        secrets.insert("port".to_string(), Value::from(5432));

        let blob = seal(KEY, &secrets).unwrap();
        assert_ne!(blob, serde_json::to_vec(&secrets).unwrap());

        let recovered = unseal(KEY, &blob).unwrap();
        assert_eq!(recovered, secrets);
    }

    #[test]
    fn empty_blob_is_empty_map() {
        let recovered = unseal(KEY, &[]).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn wrong_key_fails() {
        let mut secrets = HashMap::new();
        secrets.insert("token".to_string(), Value::String("abc".into()));

        let blob = seal(KEY, &secrets).unwrap();
        let other_key = b"00000000000000000000000000000000";
        assert!(unseal(other_key, &blob).is_err());
    }

    #[test]
    fn truncated_blob_rejected() {
        assert!(decrypt(KEY, &[0u8; 4]).is_err());
    }

    #[test]
    fn key_must_be_exactly_32_bytes() {
        let long_key = b"0123456789012345678901234567890123456789";
        let err = seal(long_key, &HashMap::new()).unwrap_err();
        assert!(err.to_string().starts_with("Invalid encryption key"));

        let short_key = b"tooshort";
        assert!(seal(short_key, &HashMap::new()).is_err());
    }
}
