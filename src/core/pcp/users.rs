// src/core/pcp/users.rs

//! The PCP user file: `user:secret` lines, where the secret is either the
//! `md5`-prefixed inner digest of the MD5 scheme or a plaintext password.

use crate::core::auth::md5;
use crate::core::errors::PoolError;
use std::path::Path;
use subtle::ConstantTimeEq;

/// User name and password together may not exceed this many bytes.
const MAX_ENTRY_LEN: usize = 128;

#[derive(Debug, Clone, Default)]
pub struct PcpUsers {
    entries: Vec<(String, String)>,
}

impl PcpUsers {
    pub fn load(path: &Path) -> Result<Self, PoolError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("cannot read PCP user file {path:?}: {e}")))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, PoolError> {
        let mut entries = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, secret)) = line.split_once(':') else {
                return Err(PoolError::Config(format!(
                    "PCP user file line {}: expected user:secret",
                    idx + 1
                )));
            };
            if user.len() + secret.len() > MAX_ENTRY_LEN {
                return Err(PoolError::Config(format!(
                    "PCP user file line {}: entry exceeds {MAX_ENTRY_LEN} bytes",
                    idx + 1
                )));
            }
            entries.push((user.to_string(), secret.to_string()));
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The inner digest for a user, derived from whichever form is stored.
    fn inner_digest(&self, user: &str) -> Option<String> {
        let (_, secret) = self.entries.iter().find(|(u, _)| u == user)?;
        match md5::strip_prefix(secret) {
            Some(inner) => Some(inner.to_string()),
            None => {
                let stored = md5::encrypt_password(secret, user);
                Some(stored[md5::MD5_PREFIX.len()..].to_string())
            }
        }
    }

    /// Verifies the challenge response `hex(md5(inner_hex || salt))`.
    pub fn verify(&self, user: &str, salt: &[u8; 4], response: &str) -> bool {
        let Some(inner) = self.inner_digest(user) else {
            return false;
        };
        let expected = expected_response(&inner, salt);
        expected.as_bytes().ct_eq(response.as_bytes()).into()
    }
}

/// The response a client must present for a given inner digest and salt.
pub fn expected_response(inner_hex: &str, salt: &[u8; 4]) -> String {
    let mut data = Vec::with_capacity(inner_hex.len() + 4);
    data.extend_from_slice(inner_hex.as_bytes());
    data.extend_from_slice(salt);
    hex::encode(::md5::compute(&data).0)
}

/// The client-side computation from a cleartext password.
pub fn client_response(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let stored = md5::encrypt_password(password, user);
    expected_response(&stored[md5::MD5_PREFIX.len()..], salt)
}
