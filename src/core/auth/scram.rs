// src/core/auth/scram.rs

//! SCRAM-SHA-256, both sides of it: the server exchange run against clients
//! of the pool, and the client exchange the probe uses against backends.
//!
//! Verifier format, as stored by the backend and the password store:
//! `SCRAM-SHA-256$<iterations>:<salt_b64>$<stored_key_b64>:<server_key_b64>`.

use crate::core::errors::PoolError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const SCRAM_VERIFIER_PREFIX: &str = "SCRAM-SHA-256$";
pub const DEFAULT_ITERATIONS: u32 = 4096;
const NONCE_LEN: usize = 18;
const SALT_LEN: usize = 16;

/// A parsed SCRAM verifier.
#[derive(Debug, Clone)]
pub struct ScramVerifier {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramVerifier {
    /// Parses the `SCRAM-SHA-256$iter:salt$stored:server` form.
    pub fn parse(stored: &str) -> Result<Self, PoolError> {
        let rest = stored
            .strip_prefix(SCRAM_VERIFIER_PREFIX)
            .ok_or_else(|| PoolError::Protocol("not a SCRAM verifier".into()))?;
        let (params, keys) = rest
            .split_once('$')
            .ok_or_else(|| PoolError::Protocol("malformed SCRAM verifier".into()))?;
        let (iter_s, salt_b64) = params
            .split_once(':')
            .ok_or_else(|| PoolError::Protocol("malformed SCRAM verifier".into()))?;
        let (stored_b64, server_b64) = keys
            .split_once(':')
            .ok_or_else(|| PoolError::Protocol("malformed SCRAM verifier".into()))?;
        let decode = |s: &str| {
            BASE64
                .decode(s)
                .map_err(|_| PoolError::Protocol("bad base64 in SCRAM verifier".into()))
        };
        Ok(Self {
            iterations: iter_s
                .parse()
                .map_err(|_| PoolError::Protocol("bad iteration count in SCRAM verifier".into()))?,
            salt: decode(salt_b64)?,
            stored_key: decode(stored_b64)?,
            server_key: decode(server_b64)?,
        })
    }

    /// Builds a fresh verifier from a cleartext password.
    pub fn build(password: &str) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::build_with_salt(password, &salt, DEFAULT_ITERATIONS)
    }

    pub fn build_with_salt(password: &str, salt: &[u8], iterations: u32) -> Self {
        let salted = hi(password.as_bytes(), salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = sha256(&client_key);
        let server_key = hmac(&salted, b"Server Key");
        Self {
            iterations,
            salt: salt.to_vec(),
            stored_key,
            server_key,
        }
    }

    pub fn serialize(&self) -> String {
        format!(
            "{SCRAM_VERIFIER_PREFIX}{}:{}${}:{}",
            self.iterations,
            BASE64.encode(&self.salt),
            BASE64.encode(&self.stored_key),
            BASE64.encode(&self.server_key)
        )
    }
}

/// `Hi()` from RFC 5802: PBKDF2 with HMAC-SHA-256, expressed directly with
/// the HMAC primitive since only one output block is needed.
pub fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &block);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

fn gen_nonce() -> String {
    let mut raw = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut raw);
    BASE64.encode(raw)
}

fn attr<'a>(part: &'a str, tag: &str) -> Result<&'a str, PoolError> {
    part.strip_prefix(tag)
        .ok_or_else(|| PoolError::Protocol(format!("missing SCRAM attribute \"{tag}\"")))
}

// --- Server side ---

/// The server half of the exchange, verifying a client of the pool against a
/// stored verifier.
pub struct ScramServer {
    verifier: ScramVerifier,
    server_nonce: String,
    client_first_bare: Option<String>,
    combined_nonce: Option<String>,
    server_first: Option<String>,
}

impl ScramServer {
    pub fn new(verifier: ScramVerifier) -> Self {
        Self {
            verifier,
            server_nonce: gen_nonce(),
            client_first_bare: None,
            combined_nonce: None,
            server_first: None,
        }
    }

    /// Consumes `client-first-message`, returns `server-first-message`.
    pub fn handle_client_first(&mut self, message: &str) -> Result<String, PoolError> {
        // gs2 header: "n,," (no channel binding) or "y,,".
        let bare = message
            .strip_prefix("n,,")
            .or_else(|| message.strip_prefix("y,,"))
            .ok_or_else(|| {
                PoolError::Protocol("unsupported SCRAM channel binding header".into())
            })?;
        let mut parts = bare.split(',');
        let _user = attr(parts.next().unwrap_or_default(), "n=")?;
        let client_nonce = attr(parts.next().unwrap_or_default(), "r=")?;

        let combined = format!("{client_nonce}{}", self.server_nonce);
        let server_first = format!(
            "r={combined},s={},i={}",
            BASE64.encode(&self.verifier.salt),
            self.verifier.iterations
        );
        self.client_first_bare = Some(bare.to_string());
        self.combined_nonce = Some(combined);
        self.server_first = Some(server_first.clone());
        Ok(server_first)
    }

    /// Consumes `client-final-message`; on success returns
    /// `server-final-message` carrying the server signature.
    pub fn handle_client_final(&mut self, message: &str) -> Result<String, PoolError> {
        let (client_first_bare, combined_nonce, server_first) = match (
            &self.client_first_bare,
            &self.combined_nonce,
            &self.server_first,
        ) {
            (Some(a), Some(b), Some(c)) => (a.clone(), b.clone(), c.clone()),
            _ => return Err(PoolError::Protocol("SCRAM messages out of order".into())),
        };

        let mut parts = message.split(',');
        let channel = attr(parts.next().unwrap_or_default(), "c=")?;
        let nonce = attr(parts.next().unwrap_or_default(), "r=")?;
        let rest: Vec<&str> = parts.collect();
        let proof_b64 = rest
            .iter()
            .find_map(|p| p.strip_prefix("p="))
            .ok_or_else(|| PoolError::Protocol("missing SCRAM proof".into()))?;

        if nonce != combined_nonce {
            return Err(PoolError::AuthFailed {
                detail: "SCRAM nonce mismatch".into(),
            });
        }
        let client_final_without_proof = format!("c={channel},r={nonce}");
        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");

        let client_proof = BASE64
            .decode(proof_b64)
            .map_err(|_| PoolError::Protocol("bad base64 in SCRAM proof".into()))?;
        let client_signature = hmac(&self.verifier.stored_key, auth_message.as_bytes());
        if client_proof.len() != client_signature.len() {
            return Err(PoolError::AuthFailed {
                detail: "SCRAM proof has wrong length".into(),
            });
        }
        let client_key: Vec<u8> = client_proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        let ok: bool = sha256(&client_key)
            .as_slice()
            .ct_eq(self.verifier.stored_key.as_slice())
            .into();
        if !ok {
            return Err(PoolError::AuthFailed {
                detail: "SCRAM proof verification failed".into(),
            });
        }

        let server_signature = hmac(&self.verifier.server_key, auth_message.as_bytes());
        Ok(format!("v={}", BASE64.encode(server_signature)))
    }
}

// --- Client side ---

/// The client half of the exchange, run by the probe against a backend.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    server_first: Option<String>,
    auth_message: Option<String>,
    salted_password: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let client_nonce = gen_nonce();
        let client_first_bare = format!("n=,r={client_nonce}");
        Self {
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            server_first: None,
            auth_message: None,
            salted_password: None,
        }
    }

    /// The `client-first-message`, gs2 header included.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consumes `server-first-message`, returns `client-final-message`.
    pub fn handle_server_first(&mut self, message: &str) -> Result<String, PoolError> {
        let mut parts = message.split(',');
        let nonce = attr(parts.next().unwrap_or_default(), "r=")?.to_string();
        let salt_b64 = attr(parts.next().unwrap_or_default(), "s=")?;
        let iterations: u32 = attr(parts.next().unwrap_or_default(), "i=")?
            .parse()
            .map_err(|_| PoolError::Protocol("bad SCRAM iteration count".into()))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(PoolError::Protocol("server dropped our SCRAM nonce".into()));
        }
        let salt = BASE64
            .decode(salt_b64)
            .map_err(|_| PoolError::Protocol("bad base64 in SCRAM salt".into()))?;

        let salted = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!(
            "{},{message},{client_final_without_proof}",
            self.client_first_bare
        );
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.server_first = Some(message.to_string());
        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted);
        Ok(format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(proof)
        ))
    }

    /// Verifies the backend's `server-final-message`.
    pub fn handle_server_final(&self, message: &str) -> Result<(), PoolError> {
        let signature_b64 = message
            .strip_prefix("v=")
            .ok_or_else(|| PoolError::Protocol("malformed SCRAM server-final".into()))?;
        let signature = BASE64
            .decode(signature_b64)
            .map_err(|_| PoolError::Protocol("bad base64 in SCRAM signature".into()))?;
        let (auth_message, salted) = match (&self.auth_message, &self.salted_password) {
            (Some(a), Some(s)) => (a, s),
            _ => return Err(PoolError::Protocol("SCRAM messages out of order".into())),
        };
        let server_key = hmac(salted, b"Server Key");
        let expected = hmac(&server_key, auth_message.as_bytes());
        let ok: bool = expected.as_slice().ct_eq(signature.as_slice()).into();
        if ok {
            Ok(())
        } else {
            Err(PoolError::Backend(
                "backend SCRAM signature did not verify".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_round_trips_through_text() {
        let v = ScramVerifier::build_with_salt("hunter2", b"0123456789abcdef", 4096);
        let text = v.serialize();
        let parsed = ScramVerifier::parse(&text).unwrap();
        assert_eq!(parsed.iterations, 4096);
        assert_eq!(parsed.stored_key, v.stored_key);
        assert_eq!(parsed.server_key, v.server_key);
    }

    #[test]
    fn full_exchange_succeeds_with_right_password() {
        let verifier = ScramVerifier::build("wonderland");
        let mut server = ScramServer::new(verifier);
        let mut client = ScramClient::new("wonderland");

        let server_first = server.handle_client_first(&client.client_first()).unwrap();
        let client_final = client.handle_server_first(&server_first).unwrap();
        let server_final = server.handle_client_final(&client_final).unwrap();
        client.handle_server_final(&server_final).unwrap();
    }

    #[test]
    fn wrong_password_is_rejected() {
        let verifier = ScramVerifier::build("wonderland");
        let mut server = ScramServer::new(verifier);
        let mut client = ScramClient::new("not-wonderland");

        let server_first = server.handle_client_first(&client.client_first()).unwrap();
        let client_final = client.handle_server_first(&server_first).unwrap();
        let err = server.handle_client_final(&client_final).unwrap_err();
        assert!(matches!(err, PoolError::AuthFailed { .. }));
    }
}
