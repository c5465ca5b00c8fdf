// src/core/state/persistence.rs

//! Reading and writing the persistent backend status file.
//!
//! The on-disk format is one line per backend with a token `up`, `down` or
//! `unused`. A legacy fixed-size binary layout (one status byte per backend,
//! the remainder of the file zero) is accepted on read for compatibility but
//! never written.

use super::backend::BackendStatus;
use crate::core::errors::PoolError;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Decodes one legacy binary status byte.
fn status_from_byte(b: u8) -> Option<BackendStatus> {
    match b {
        0 => Some(BackendStatus::Unused),
        1 => Some(BackendStatus::ConnectWait),
        2 => Some(BackendStatus::Up),
        3 => Some(BackendStatus::Down),
        _ => None,
    }
}

/// Detects and decodes the legacy binary layout: the first `num_backends`
/// bytes must each be a valid status discriminant and every remaining byte
/// must be zero.
fn try_decode_legacy(raw: &[u8], num_backends: usize) -> Option<Vec<BackendStatus>> {
    if raw.len() < num_backends {
        return None;
    }
    let mut statuses = Vec::with_capacity(num_backends);
    for &b in &raw[..num_backends] {
        statuses.push(status_from_byte(b)?);
    }
    if raw[num_backends..].iter().any(|&b| b != 0) {
        return None;
    }
    Some(statuses)
}

/// Parses the newline-separated ASCII layout.
fn decode_ascii(raw: &[u8], num_backends: usize) -> Result<Vec<BackendStatus>, PoolError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| PoolError::Config("status file is neither legacy binary nor ASCII".into()))?;
    let mut statuses = Vec::with_capacity(num_backends);
    for line in text.lines() {
        let token = line.trim();
        if token.is_empty() {
            continue;
        }
        let status = match token {
            "up" => BackendStatus::Up,
            "down" => BackendStatus::Down,
            "unused" => BackendStatus::Unused,
            other => {
                return Err(PoolError::Config(format!(
                    "unknown token \"{other}\" in status file"
                )));
            }
        };
        statuses.push(status);
    }
    Ok(statuses)
}

/// Reads the persistent status file. Returns one entry per line/slot; the
/// caller reconciles the count against the configured backends. A missing
/// file is not an error, it simply yields `None`.
pub fn read_status_file(
    path: &Path,
    num_backends: usize,
) -> Result<Option<Vec<BackendStatus>>, PoolError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if raw.is_empty() {
        return Ok(None);
    }

    if let Some(statuses) = try_decode_legacy(&raw, num_backends) {
        info!("accepted legacy binary backend status file {:?}", path);
        return Ok(Some(statuses));
    }
    decode_ascii(&raw, num_backends).map(Some)
}

/// Writes the ASCII status file atomically (write-then-rename).
pub fn write_status_file(path: &Path, statuses: &[BackendStatus]) -> Result<(), PoolError> {
    let mut contents = String::with_capacity(statuses.len() * 7);
    for status in statuses {
        contents.push_str(status.as_file_token());
        contents.push('\n');
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents.as_bytes())
        .map_err(|e| PoolError::Fatal(format!("cannot write status file {tmp_path:?}: {e}")))?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(PoolError::Fatal(format!(
            "cannot move status file into place at {path:?}: {e}"
        )));
    }
    Ok(())
}

/// Reconciles a loaded status vector against the configured backend count.
/// Extra entries are dropped; missing entries come up as `ConnectWait`.
pub fn reconcile(loaded: Vec<BackendStatus>, num_backends: usize) -> Vec<BackendStatus> {
    if loaded.len() != num_backends {
        warn!(
            "status file holds {} entries but {} backends are configured; padding with connect_wait",
            loaded.len(),
            num_backends
        );
    }
    let mut statuses = loaded;
    statuses.truncate(num_backends);
    while statuses.len() < num_backends {
        statuses.push(BackendStatus::ConnectWait);
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_binary_is_detected() {
        // up, down, connect_wait followed by zero padding
        let raw = [2u8, 3, 1, 0, 0, 0];
        let statuses = try_decode_legacy(&raw, 3).expect("legacy layout");
        assert_eq!(
            statuses,
            vec![
                BackendStatus::Up,
                BackendStatus::Down,
                BackendStatus::ConnectWait
            ]
        );
    }

    #[test]
    fn ascii_wins_when_bytes_are_not_statuses() {
        let raw = b"up\ndown\nunused\n";
        assert!(try_decode_legacy(raw, 3).is_none());
        let statuses = decode_ascii(raw, 3).unwrap();
        assert_eq!(
            statuses,
            vec![
                BackendStatus::Up,
                BackendStatus::Down,
                BackendStatus::Unused
            ]
        );
    }
}
