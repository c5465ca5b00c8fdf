// src/core/auth/md5.rs

//! The PostgreSQL MD5 password scheme.
//!
//! The stored form is `"md5" || hex(md5(password || user))`; the wire
//! response to a salted challenge is `"md5" || hex(md5(inner_hex || salt))`
//! where `inner_hex` is the stored form without its prefix.

use subtle::ConstantTimeEq;

pub const MD5_PREFIX: &str = "md5";
/// Prefix plus 32 hex digits.
pub const MD5_PASSWD_LEN: usize = 35;

fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

/// Produces the stored form: `md5` + hex(md5(password || user)).
pub fn encrypt_password(password: &str, user: &str) -> String {
    let mut data = Vec::with_capacity(password.len() + user.len());
    data.extend_from_slice(password.as_bytes());
    data.extend_from_slice(user.as_bytes());
    format!("{MD5_PREFIX}{}", md5_hex(&data))
}

/// Produces the salted wire response from the *inner* hex digest.
pub fn salted_response(inner_hex: &str, salt: &[u8; 4]) -> String {
    let mut data = Vec::with_capacity(inner_hex.len() + salt.len());
    data.extend_from_slice(inner_hex.as_bytes());
    data.extend_from_slice(salt);
    format!("{MD5_PREFIX}{}", md5_hex(&data))
}

/// Extracts the inner digest from a stored `md5...` secret.
pub fn strip_prefix(stored: &str) -> Option<&str> {
    stored.strip_prefix(MD5_PREFIX).filter(|rest| {
        rest.len() == 32 && rest.bytes().all(|b| b.is_ascii_hexdigit())
    })
}

/// Verifies a client's challenge response against the stored inner digest.
/// Comparison is constant-time; a response of the wrong length fails.
pub fn verify_salted(inner_hex: &str, salt: &[u8; 4], client_response: &str) -> bool {
    let expected = salted_response(inner_hex, salt);
    expected.as_bytes().ct_eq(client_response.as_bytes()).into()
}

/// Full verification from a cleartext password.
pub fn verify_password(password: &str, user: &str, salt: &[u8; 4], client_response: &str) -> bool {
    let stored = encrypt_password(password, user);
    let inner = &stored[MD5_PREFIX.len()..];
    verify_salted(inner, salt, client_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_response_verifies() {
        let salt = [0x01, 0x02, 0x03, 0x04];
        let stored = encrypt_password("wonderland", "alice");
        let inner = strip_prefix(&stored).unwrap();
        let response = salted_response(inner, &salt);
        assert!(verify_salted(inner, &salt, &response));
        assert!(verify_password("wonderland", "alice", &salt, &response));
    }

    #[test]
    fn flipped_bit_fails() {
        let salt = [9, 9, 9, 9];
        let stored = encrypt_password("secret", "bob");
        let inner = strip_prefix(&stored).unwrap();
        let mut response = salted_response(inner, &salt).into_bytes();
        // flip one hex digit
        response[10] = if response[10] == b'a' { b'b' } else { b'a' };
        let response = String::from_utf8(response).unwrap();
        assert!(!verify_salted(inner, &salt, &response));
    }

    #[test]
    fn prefix_is_checked() {
        assert!(strip_prefix("md5deadbeef").is_none());
        assert!(strip_prefix("scram-whatever").is_none());
        let stored = encrypt_password("pw", "u");
        assert!(strip_prefix(&stored).is_some());
    }
}
