// src/core/auth/passwd.rs

//! The user/password store: an append-mostly text file of
//! `user:secret[:backend_user:backend_secret]` lines, where each secret
//! carries a prefix naming its encoding.

use super::{keyfile, md5, scram};
use crate::core::errors::PoolError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const TEXT_PREFIX: &str = "TEXT";
pub const AES_PREFIX: &str = "AES";

/// One stored secret, decoded by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredSecret {
    /// `md5` + 32 hex digits: the inner digest of the MD5 scheme.
    Md5(String),
    /// A full SCRAM-SHA-256 verifier string.
    Scram(String),
    /// Base64 AES-256-CBC ciphertext of a cleartext password.
    Aes(String),
    /// Explicitly prefixed cleartext.
    Text(String),
    /// Bare cleartext (no prefix).
    Plain(String),
}

impl StoredSecret {
    pub fn parse(raw: &str) -> Self {
        if md5::strip_prefix(raw).is_some() {
            StoredSecret::Md5(raw[md5::MD5_PREFIX.len()..].to_string())
        } else if raw.starts_with(scram::SCRAM_VERIFIER_PREFIX) {
            StoredSecret::Scram(raw.to_string())
        } else if let Some(rest) = raw.strip_prefix(AES_PREFIX) {
            StoredSecret::Aes(rest.to_string())
        } else if let Some(rest) = raw.strip_prefix(TEXT_PREFIX) {
            StoredSecret::Text(rest.to_string())
        } else {
            StoredSecret::Plain(raw.to_string())
        }
    }

    pub fn serialize(&self) -> String {
        match self {
            StoredSecret::Md5(inner) => format!("{}{inner}", md5::MD5_PREFIX),
            StoredSecret::Scram(verifier) => verifier.clone(),
            StoredSecret::Aes(b64) => format!("{AES_PREFIX}{b64}"),
            StoredSecret::Text(text) => format!("{TEXT_PREFIX}{text}"),
            StoredSecret::Plain(text) => text.clone(),
        }
    }

    /// Recovers a cleartext password where the encoding permits it. AES
    /// entries need the pool key; digest entries cannot be reversed.
    pub fn cleartext(&self, key: Option<&str>) -> Result<Option<String>, PoolError> {
        match self {
            StoredSecret::Plain(text) | StoredSecret::Text(text) => Ok(Some(text.clone())),
            StoredSecret::Aes(b64) => {
                let key = key.ok_or_else(|| {
                    PoolError::Config("AES password entry found but no key file is available".into())
                })?;
                keyfile::unwrap(b64, key).map(Some)
            }
            StoredSecret::Md5(_) | StoredSecret::Scram(_) => Ok(None),
        }
    }
}

/// One line of the store.
#[derive(Debug, Clone)]
pub struct PasswdEntry {
    pub user: String,
    pub secret: StoredSecret,
    /// Optional mapping to different credentials on the backends.
    pub backend_user: Option<String>,
    pub backend_secret: Option<StoredSecret>,
}

/// The in-memory store; lookups are linear, matching the file's scale.
#[derive(Debug, Clone, Default)]
pub struct PasswordStore {
    path: PathBuf,
    entries: Vec<PasswdEntry>,
}

impl PasswordStore {
    /// Loads the store. A missing file yields an empty store so that
    /// HBA methods not needing passwords keep working.
    pub fn load(path: &Path) -> Result<Self, PoolError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("password file {:?} does not exist; starting empty", path);
                return Ok(Self {
                    path: path.to_path_buf(),
                    entries: Vec::new(),
                });
            }
            Err(e) => {
                return Err(PoolError::Config(format!(
                    "cannot read password file {path:?}: {e}"
                )));
            }
        };

        let mut entries = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() != 2 && fields.len() != 4 {
                return Err(PoolError::Config(format!(
                    "password file {path:?} line {}: expected 2 or 4 fields, found {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            entries.push(PasswdEntry {
                user: fields[0].to_string(),
                secret: StoredSecret::parse(fields[1]),
                backend_user: fields.get(2).map(|s| s.to_string()),
                backend_secret: fields.get(3).map(|s| StoredSecret::parse(s)),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn lookup(&self, user: &str) -> Option<&PasswdEntry> {
        self.entries.iter().find(|e| e.user == user)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces an entry, then rewrites the file.
    pub fn upsert(&mut self, entry: PasswdEntry) -> Result<(), PoolError> {
        match self.entries.iter_mut().find(|e| e.user == entry.user) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.save()
    }

    pub fn remove(&mut self, user: &str) -> Result<bool, PoolError> {
        let before = self.entries.len();
        self.entries.retain(|e| e.user != user);
        if self.entries.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Truncate-and-rewrite under a single writer; atomic via rename.
    fn save(&self) -> Result<(), PoolError> {
        let mut contents = String::new();
        for entry in &self.entries {
            contents.push_str(&entry.user);
            contents.push(':');
            contents.push_str(&entry.secret.serialize());
            if let (Some(bu), Some(bs)) = (&entry.backend_user, &entry.backend_secret) {
                contents.push(':');
                contents.push_str(bu);
                contents.push(':');
                contents.push_str(&bs.serialize());
            }
            contents.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents.as_bytes())
            .map_err(|e| PoolError::Config(format!("cannot write password file {tmp:?}: {e}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| PoolError::Config(format!("cannot replace password file: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_dispatch_to_the_right_encoding() {
        assert!(matches!(
            StoredSecret::parse("md50123456789abcdef0123456789abcdef"),
            StoredSecret::Md5(_)
        ));
        assert!(matches!(
            StoredSecret::parse("SCRAM-SHA-256$4096:c2FsdA==$a2V5:c2Vy"),
            StoredSecret::Scram(_)
        ));
        assert!(matches!(
            StoredSecret::parse("AESq83vEJmZzQ=="),
            StoredSecret::Aes(_)
        ));
        assert!(matches!(
            StoredSecret::parse("TEXTwonderland"),
            StoredSecret::Text(_)
        ));
        assert!(matches!(
            StoredSecret::parse("wonderland"),
            StoredSecret::Plain(_)
        ));
    }

    #[test]
    fn text_and_plain_yield_cleartext() {
        assert_eq!(
            StoredSecret::parse("TEXTpw").cleartext(None).unwrap(),
            Some("pw".to_string())
        );
        assert_eq!(
            StoredSecret::parse("pw").cleartext(None).unwrap(),
            Some("pw".to_string())
        );
        assert_eq!(
            StoredSecret::parse("md50123456789abcdef0123456789abcdef")
                .cleartext(None)
                .unwrap(),
            None
        );
    }
}
