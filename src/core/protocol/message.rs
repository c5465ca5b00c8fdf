// src/core/protocol/message.rs

//! Builders and readers for the PostgreSQL v3 message format. Every regular
//! message is `tag:1 || length:4 (self-inclusive) || body`; the startup
//! packet has no tag.

use crate::core::errors::PoolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION_3: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// Authentication request codes carried in 'R' messages.
pub const AUTH_OK: i32 = 0;
pub const AUTH_CLEARTEXT_PASSWORD: i32 = 3;
pub const AUTH_MD5_PASSWORD: i32 = 5;
pub const AUTH_SASL: i32 = 10;
pub const AUTH_SASL_CONTINUE: i32 = 11;
pub const AUTH_SASL_FINAL: i32 = 12;

/// Upper bound on any single message body; a malformed length field must not
/// make us allocate unbounded memory.
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;
/// Startup packets are tiny; anything large is garbage or an attack.
const MAX_STARTUP_LEN: usize = 10_000;

/// The key/value parameter list of a startup packet.
#[derive(Debug, Clone, Default)]
pub struct StartupPacket {
    pub params: Vec<(String, String)>,
}

impl StartupPacket {
    fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    /// The database falls back to the user name, as the backend does.
    pub fn database(&self) -> Option<&str> {
        self.get("database").or_else(|| self.user())
    }

    pub fn application_name(&self) -> Option<&str> {
        self.get("application_name")
    }
}

/// What a client opened the connection with.
#[derive(Debug, Clone)]
pub enum StartupRequest {
    Startup(StartupPacket),
    SslRequest,
    Cancel { process_id: i32, secret_key: i32 },
}

/// A tagged protocol message, body only (length stripped).
#[derive(Debug, Clone)]
pub struct BackendMessage {
    pub tag: u8,
    pub body: Bytes,
}

/// Reads the untagged startup packet (or SSLRequest / CancelRequest).
pub async fn read_startup<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<StartupRequest, PoolError> {
    let len = stream.read_i32().await.map_err(sanitize_eof)? as usize;
    if len < 8 || len > MAX_STARTUP_LEN {
        return Err(PoolError::Protocol(format!(
            "invalid startup packet length {len}"
        )));
    }
    let code = stream.read_i32().await.map_err(sanitize_eof)?;
    let mut body = vec![0u8; len - 8];
    stream.read_exact(&mut body).await.map_err(sanitize_eof)?;

    match code {
        SSL_REQUEST_CODE => Ok(StartupRequest::SslRequest),
        CANCEL_REQUEST_CODE => {
            if body.len() != 8 {
                return Err(PoolError::Protocol("truncated cancel request".into()));
            }
            let mut buf = &body[..];
            Ok(StartupRequest::Cancel {
                process_id: buf.get_i32(),
                secret_key: buf.get_i32(),
            })
        }
        PROTOCOL_VERSION_3 => {
            let mut params = Vec::new();
            let mut rest = &body[..];
            loop {
                let key = take_cstr(&mut rest)?;
                if key.is_empty() {
                    break;
                }
                let value = take_cstr(&mut rest)?;
                params.push((key, value));
            }
            Ok(StartupRequest::Startup(StartupPacket { params }))
        }
        other => Err(PoolError::Protocol(format!(
            "unsupported protocol version {other}"
        ))),
    }
}

/// Reads one tagged message from either side of the wire.
pub async fn read_message<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<BackendMessage, PoolError> {
    let tag = stream.read_u8().await.map_err(sanitize_eof)?;
    let len = stream.read_i32().await.map_err(sanitize_eof)? as usize;
    if len < 4 || len - 4 > MAX_MESSAGE_LEN {
        return Err(PoolError::Protocol(format!(
            "invalid message length {len} for tag '{}'",
            tag as char
        )));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await.map_err(sanitize_eof)?;
    Ok(BackendMessage {
        tag,
        body: Bytes::from(body),
    })
}

/// Writes one tagged message.
pub async fn write_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    tag: u8,
    body: &[u8],
) -> Result<(), PoolError> {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

fn sanitize_eof(e: std::io::Error) -> PoolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PoolError::UnexpectedEof
    } else {
        e.into()
    }
}

fn take_cstr(buf: &mut &[u8]) -> Result<String, PoolError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PoolError::Protocol("unterminated string in message".into()))?;
    let s = String::from_utf8(buf[..pos].to_vec())?;
    *buf = &buf[pos + 1..];
    Ok(s)
}

// --- Body builders, server role ---

pub fn auth_request_body(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + extra.len());
    body.extend_from_slice(&code.to_be_bytes());
    body.extend_from_slice(extra);
    body
}

pub fn auth_ok_body() -> Vec<u8> {
    auth_request_body(AUTH_OK, &[])
}

pub fn auth_cleartext_body() -> Vec<u8> {
    auth_request_body(AUTH_CLEARTEXT_PASSWORD, &[])
}

pub fn auth_md5_body(salt: [u8; 4]) -> Vec<u8> {
    auth_request_body(AUTH_MD5_PASSWORD, &salt)
}

pub fn auth_sasl_body(mechanisms: &[&str]) -> Vec<u8> {
    let mut extra = Vec::new();
    for mech in mechanisms {
        extra.extend_from_slice(mech.as_bytes());
        extra.push(0);
    }
    extra.push(0);
    auth_request_body(AUTH_SASL, &extra)
}

pub fn auth_sasl_continue_body(data: &[u8]) -> Vec<u8> {
    auth_request_body(AUTH_SASL_CONTINUE, data)
}

pub fn auth_sasl_final_body(data: &[u8]) -> Vec<u8> {
    auth_request_body(AUTH_SASL_FINAL, data)
}

/// Builds an ErrorResponse body with severity/code/message(/detail) fields.
pub fn error_response_body(
    severity: &str,
    sqlstate: &str,
    message: &str,
    detail: Option<&str>,
) -> Vec<u8> {
    let mut body = Vec::new();
    for (tag, value) in [(b'S', severity), (b'C', sqlstate), (b'M', message)] {
        body.push(tag);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    if let Some(detail) = detail {
        body.push(b'D');
        body.extend_from_slice(detail.as_bytes());
        body.push(0);
    }
    body.push(0);
    body
}

pub fn ready_for_query_body(txn_status: u8) -> Vec<u8> {
    vec![txn_status]
}

pub fn parameter_status_body(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    body
}

pub fn backend_key_data_body(process_id: i32, secret_key: i32) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&process_id.to_be_bytes());
    body.extend_from_slice(&secret_key.to_be_bytes());
    body
}

// --- Body builders, client role ---

pub fn startup_body(user: &str, database: &str, application_name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
    for (key, value) in [
        ("user", user),
        ("database", database),
        ("application_name", application_name),
    ] {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    body
}

/// Writes the untagged startup packet.
pub async fn write_startup<S: AsyncWrite + Unpin>(
    stream: &mut S,
    user: &str,
    database: &str,
    application_name: &str,
) -> Result<(), PoolError> {
    let body = startup_body(user, database, application_name);
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(&body);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub fn password_message_body(secret: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(secret.len() + 1);
    body.extend_from_slice(secret.as_bytes());
    body.push(0);
    body
}

pub fn sasl_initial_response_body(mechanism: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(mechanism.as_bytes());
    body.push(0);
    body.extend_from_slice(&(data.len() as i32).to_be_bytes());
    body.extend_from_slice(data);
    body
}

pub fn query_body(sql: &str) -> Vec<u8> {
    password_message_body(sql)
}

// --- Parsers ---

/// Splits an ErrorResponse/NoticeResponse body into its tagged fields.
pub fn parse_error_fields(body: &[u8]) -> HashMap<u8, String> {
    let mut fields = HashMap::new();
    let mut rest = body;
    while let Some((&tag, after)) = rest.split_first() {
        if tag == 0 {
            break;
        }
        rest = after;
        let Some(pos) = rest.iter().position(|&b| b == 0) else {
            break;
        };
        fields.insert(tag, String::from_utf8_lossy(&rest[..pos]).to_string());
        rest = &rest[pos + 1..];
    }
    fields
}

/// Renders the human-relevant part of an ErrorResponse.
pub fn error_fields_to_string(body: &[u8]) -> String {
    let fields = parse_error_fields(body);
    let severity = fields.get(&b'S').cloned().unwrap_or_default();
    let message = fields.get(&b'M').cloned().unwrap_or_default();
    match fields.get(&b'D') {
        Some(detail) => format!("{severity}: {message} ({detail})"),
        None => format!("{severity}: {message}"),
    }
}

/// Parses the authentication request code out of an 'R' message body.
pub fn parse_auth_code(body: &[u8]) -> Result<(i32, &[u8]), PoolError> {
    if body.len() < 4 {
        return Err(PoolError::Protocol("truncated authentication request".into()));
    }
    let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    Ok((code, &body[4..]))
}

/// Parses the columns of one DataRow body into text values.
pub fn parse_data_row(body: &[u8]) -> Result<Vec<Option<String>>, PoolError> {
    let mut rest = body;
    if rest.len() < 2 {
        return Err(PoolError::Protocol("truncated DataRow".into()));
    }
    let count = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    rest = &rest[2..];
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(PoolError::Protocol("truncated DataRow column".into()));
        }
        let len = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        rest = &rest[4..];
        if len < 0 {
            columns.push(None);
            continue;
        }
        let len = len as usize;
        if rest.len() < len {
            return Err(PoolError::Protocol("truncated DataRow column".into()));
        }
        columns.push(Some(String::from_utf8_lossy(&rest[..len]).to_string()));
        rest = &rest[len..];
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_round_trips() {
        let body = error_response_body("FATAL", "28000", "client authentication failed", None);
        let fields = parse_error_fields(&body);
        assert_eq!(fields.get(&b'S').unwrap(), "FATAL");
        assert_eq!(fields.get(&b'C').unwrap(), "28000");
        assert_eq!(fields.get(&b'M').unwrap(), "client authentication failed");
        assert!(!fields.contains_key(&b'D'));
    }

    #[test]
    fn data_row_parses_nulls_and_text() {
        // two columns: "t" and NULL
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.push(b't');
        body.extend_from_slice(&(-1i32).to_be_bytes());
        let row = parse_data_row(&body).unwrap();
        assert_eq!(row, vec![Some("t".to_string()), None]);
    }

    #[test]
    fn startup_body_terminates_param_list() {
        let body = startup_body("alice", "appdb", "pgflock");
        assert_eq!(&body[0..4], &PROTOCOL_VERSION_3.to_be_bytes());
        assert_eq!(body.last(), Some(&0u8));
    }
}
