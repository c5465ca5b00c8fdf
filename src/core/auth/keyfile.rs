// src/core/auth/keyfile.rs

//! The pool key file and AES wrapping of stored passwords.
//!
//! Key and IV are derived from the key-file contents with the OpenSSL
//! `EVP_BytesToKey` construction (SHA-1, no salt, one round), which the
//! original tooling used; ciphertexts are AES-256-CBC with PKCS#7 padding,
//! base64-encoded behind an `AES` prefix in the password store.

use crate::core::errors::PoolError;
use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha1::{Digest, Sha1};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Environment variable overriding the key-file location.
pub const KEY_FILE_ENV: &str = "PGFLOCKKEYFILE";
/// Fallback under the invoking user's home directory.
pub const DEFAULT_KEY_FILE: &str = ".pgflockkey";
/// Key files larger than this are rejected as misconfiguration.
const MAX_KEY_LEN: usize = 256;

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

/// Locates the key file: explicit config path, then the environment
/// variable, then `$HOME/.pgflockkey`.
pub fn locate(config_path: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = config_path {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var(KEY_FILE_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var("HOME")
        .ok()
        .map(|home| Path::new(&home).join(DEFAULT_KEY_FILE))
}

/// Reads the single-line key. A group/world-accessible file draws a warning
/// but is not fatal.
pub fn read_key(path: &Path) -> Result<String, PoolError> {
    let metadata = fs::metadata(path)
        .map_err(|e| PoolError::Config(format!("cannot stat key file {path:?}: {e}")))?;
    if metadata.permissions().mode() & 0o077 != 0 {
        warn!(
            "key file {:?} is accessible by group or other; permissions should be u=rw (0600) or less",
            path
        );
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| PoolError::Config(format!("cannot read key file {path:?}: {e}")))?;
    let key = contents.lines().next().unwrap_or("").trim().to_string();
    if key.is_empty() {
        return Err(PoolError::Config(format!("key file {path:?} is empty")));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(PoolError::Config(format!(
            "key file {path:?} exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(key)
}

/// `EVP_BytesToKey` with SHA-1, no salt and a single round: digests are
/// chained as D1 = H(pass), D2 = H(D1 || pass), ... and concatenated until
/// key and IV are filled.
fn derive_key_iv(key_material: &str) -> ([u8; AES_KEY_LEN], [u8; AES_IV_LEN]) {
    let mut derived = Vec::with_capacity(AES_KEY_LEN + AES_IV_LEN + 20);
    let mut previous: Vec<u8> = Vec::new();
    while derived.len() < AES_KEY_LEN + AES_IV_LEN {
        let mut hasher = Sha1::new();
        hasher.update(&previous);
        hasher.update(key_material.as_bytes());
        previous = hasher.finalize().to_vec();
        derived.extend_from_slice(&previous);
    }
    let mut key = [0u8; AES_KEY_LEN];
    let mut iv = [0u8; AES_IV_LEN];
    key.copy_from_slice(&derived[..AES_KEY_LEN]);
    iv.copy_from_slice(&derived[AES_KEY_LEN..AES_KEY_LEN + AES_IV_LEN]);
    (key, iv)
}

/// Encrypts a cleartext password into the base64 payload of an `AES` entry.
pub fn wrap(cleartext: &str, key_material: &str) -> String {
    let (key, iv) = derive_key_iv(key_material);
    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(cleartext.as_bytes());
    BASE64.encode(ciphertext)
}

/// Decrypts the base64 payload of an `AES` entry back to cleartext.
pub fn unwrap(encoded: &str, key_material: &str) -> Result<String, PoolError> {
    let ciphertext = BASE64
        .decode(encoded)
        .map_err(|_| PoolError::Config("bad base64 in AES password entry".into()))?;
    let (key, iv) = derive_key_iv(key_material);
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| PoolError::Config("AES password entry does not decrypt; wrong key file?".into()))?;
    String::from_utf8(plaintext)
        .map_err(|_| PoolError::Config("decrypted password is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap_returns_cleartext() {
        let encoded = wrap("wonderland", "master-key");
        let cleartext = unwrap(&encoded, "master-key").unwrap();
        assert_eq!(cleartext, "wonderland");
    }

    #[test]
    fn wrong_key_fails_to_unwrap() {
        let encoded = wrap("wonderland", "master-key");
        assert!(unwrap(&encoded, "other-key").is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let (k1, iv1) = derive_key_iv("abc");
        let (k2, iv2) = derive_key_iv("abc");
        assert_eq!(k1, k2);
        assert_eq!(iv1, iv2);
        let (k3, _) = derive_key_iv("abd");
        assert_ne!(k1, k3);
    }
}
