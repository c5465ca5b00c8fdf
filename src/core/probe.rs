// src/core/probe.rs

//! The verification connection: a minimal PostgreSQL client used by the
//! health checker and the replication verifier. It can authenticate with
//! trust, cleartext, MD5 and SCRAM-SHA-256, and run simple text queries.

use crate::core::auth::md5;
use crate::core::auth::scram::{SCRAM_SHA_256, ScramClient};
use crate::core::errors::PoolError;
use crate::core::protocol::message;
use crate::core::state::BackendDesc;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials the probe presents to a backend.
#[derive(Debug, Clone)]
pub struct ProbeCredentials {
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

/// TCP or Unix-domain transport to a backend.
pub enum ProbeStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for ProbeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProbeStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ProbeStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProbeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            ProbeStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ProbeStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ProbeStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ProbeStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ProbeStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ProbeStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// An authenticated verification connection.
pub struct ProbeConnection {
    stream: ProbeStream,
}

impl ProbeConnection {
    /// Connects, performs the startup exchange and authenticates.
    pub async fn connect(
        desc: &BackendDesc,
        creds: &ProbeCredentials,
    ) -> Result<Self, PoolError> {
        let stream = if desc.is_unix() {
            let path = format!("{}/.s.PGSQL.{}", desc.hostname, desc.port);
            let unix = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&path))
                .await
                .map_err(|_| {
                    PoolError::BackendTimeout(format!("connect to {path} timed out"))
                })??;
            ProbeStream::Unix(unix)
        } else {
            let addr = (desc.hostname.as_str(), desc.port);
            let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    PoolError::BackendTimeout(format!(
                        "connect to {}:{} timed out",
                        desc.hostname, desc.port
                    ))
                })??;
            tcp.set_nodelay(true)?;
            ProbeStream::Tcp(tcp)
        };

        let mut conn = Self { stream };
        message::write_startup(&mut conn.stream, &creds.user, &creds.database, "pgflock").await?;
        conn.authenticate(creds).await?;
        Ok(conn)
    }

    async fn authenticate(&mut self, creds: &ProbeCredentials) -> Result<(), PoolError> {
        let mut scram: Option<ScramClient> = None;
        loop {
            let msg = message::read_message(&mut self.stream).await?;
            match msg.tag {
                b'R' => {
                    let (code, extra) = message::parse_auth_code(&msg.body)?;
                    match code {
                        message::AUTH_OK => {}
                        message::AUTH_CLEARTEXT_PASSWORD => {
                            let password = creds.password.as_deref().ok_or_else(|| {
                                PoolError::Backend(
                                    "backend wants a password but none is configured".into(),
                                )
                            })?;
                            message::write_message(
                                &mut self.stream,
                                b'p',
                                &message::password_message_body(password),
                            )
                            .await?;
                        }
                        message::AUTH_MD5_PASSWORD => {
                            let password = creds.password.as_deref().ok_or_else(|| {
                                PoolError::Backend(
                                    "backend wants a password but none is configured".into(),
                                )
                            })?;
                            if extra.len() != 4 {
                                return Err(PoolError::Protocol(
                                    "MD5 challenge without a 4-byte salt".into(),
                                ));
                            }
                            let salt = [extra[0], extra[1], extra[2], extra[3]];
                            let stored = md5::encrypt_password(password, &creds.user);
                            let inner = &stored[md5::MD5_PREFIX.len()..];
                            let response = md5::salted_response(inner, &salt);
                            message::write_message(
                                &mut self.stream,
                                b'p',
                                &message::password_message_body(&response),
                            )
                            .await?;
                        }
                        message::AUTH_SASL => {
                            let password = creds.password.as_deref().ok_or_else(|| {
                                PoolError::Backend(
                                    "backend wants a password but none is configured".into(),
                                )
                            })?;
                            let client = ScramClient::new(password);
                            let first = client.client_first();
                            message::write_message(
                                &mut self.stream,
                                b'p',
                                &message::sasl_initial_response_body(
                                    SCRAM_SHA_256,
                                    first.as_bytes(),
                                ),
                            )
                            .await?;
                            scram = Some(client);
                        }
                        message::AUTH_SASL_CONTINUE => {
                            let client = scram.as_mut().ok_or_else(|| {
                                PoolError::Protocol("SASL continue before SASL start".into())
                            })?;
                            let server_first = std::str::from_utf8(extra)?;
                            let client_final = client.handle_server_first(server_first)?;
                            message::write_message(
                                &mut self.stream,
                                b'p',
                                client_final.as_bytes(),
                            )
                            .await?;
                        }
                        message::AUTH_SASL_FINAL => {
                            let client = scram.as_ref().ok_or_else(|| {
                                PoolError::Protocol("SASL final before SASL start".into())
                            })?;
                            client.handle_server_final(std::str::from_utf8(extra)?)?;
                        }
                        other => {
                            return Err(PoolError::Backend(format!(
                                "backend requested unsupported authentication (code {other})"
                            )));
                        }
                    }
                }
                b'S' | b'K' | b'N' => {}
                b'Z' => return Ok(()),
                b'E' => {
                    return Err(PoolError::Backend(message::error_fields_to_string(
                        &msg.body,
                    )));
                }
                other => {
                    return Err(PoolError::Protocol(format!(
                        "unexpected message '{}' during startup",
                        other as char
                    )));
                }
            }
        }
    }

    /// Runs one simple-protocol query, collecting text rows.
    pub async fn simple_query(
        &mut self,
        sql: &str,
    ) -> Result<Vec<Vec<Option<String>>>, PoolError> {
        message::write_message(&mut self.stream, b'Q', &message::query_body(sql)).await?;
        let mut rows = Vec::new();
        let mut error: Option<PoolError> = None;
        loop {
            let msg = message::read_message(&mut self.stream).await?;
            match msg.tag {
                b'T' | b'C' | b'S' | b'N' | b'I' => {}
                b'D' => rows.push(message::parse_data_row(&msg.body)?),
                b'E' => {
                    error = Some(PoolError::Backend(message::error_fields_to_string(
                        &msg.body,
                    )));
                }
                b'Z' => break,
                other => {
                    return Err(PoolError::Protocol(format!(
                        "unexpected message '{}' in query response",
                        other as char
                    )));
                }
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Runs a query expected to yield one value.
    pub async fn query_one(&mut self, sql: &str) -> Result<Option<String>, PoolError> {
        let rows = self.simple_query(sql).await?;
        Ok(rows.into_iter().next().and_then(|r| r.into_iter().next()).flatten())
    }

    /// Sends Terminate and drops the connection.
    pub async fn close(mut self) {
        let _ = message::write_message(&mut self.stream, b'X', &[]).await;
    }

    /// Forwards one already-framed message; used by the session relay.
    pub async fn send_message(&mut self, tag: u8, body: &[u8]) -> Result<(), PoolError> {
        message::write_message(&mut self.stream, tag, body).await
    }

    /// Reads one message off the backend; used by the session relay.
    pub async fn recv_message(&mut self) -> Result<message::BackendMessage, PoolError> {
        message::read_message(&mut self.stream).await
    }
}

/// Parses a WAL location of the form `XXXXXXXX/YYYYYYYY` into a byte offset.
pub fn parse_lsn(text: &str) -> Result<u64, PoolError> {
    let (hi, lo) = text
        .split_once('/')
        .ok_or_else(|| PoolError::Protocol(format!("malformed LSN \"{text}\"")))?;
    let hi = u64::from_str_radix(hi, 16)
        .map_err(|_| PoolError::Protocol(format!("malformed LSN \"{text}\"")))?;
    let lo = u64::from_str_radix(lo, 16)
        .map_err(|_| PoolError::Protocol(format!("malformed LSN \"{text}\"")))?;
    Ok((hi << 32) | lo)
}

/// Pulls `host` and `port` out of a libpq conninfo string.
pub fn parse_conninfo_host_port(conninfo: &str) -> (Option<String>, Option<u16>) {
    let mut host = None;
    let mut port = None;
    for part in conninfo.split_whitespace() {
        if let Some(value) = part.strip_prefix("host=") {
            host = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("port=") {
            port = value.parse().ok();
        }
    }
    (host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_parsing() {
        assert_eq!(parse_lsn("0/0").unwrap(), 0);
        assert_eq!(parse_lsn("0/10").unwrap(), 16);
        assert_eq!(parse_lsn("16/B374D848").unwrap(), (0x16 << 32) | 0xB374D848);
        assert!(parse_lsn("nonsense").is_err());
    }

    #[test]
    fn conninfo_extraction() {
        let (host, port) =
            parse_conninfo_host_port("user=rep host=db1.example.net port=5433 sslmode=prefer");
        assert_eq!(host.as_deref(), Some("db1.example.net"));
        assert_eq!(port, Some(5433));

        let (host, port) = parse_conninfo_host_port("dbname=x");
        assert!(host.is_none());
        assert!(port.is_none());
    }
}
