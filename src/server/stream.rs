// src/server/stream.rs

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::server::TlsStream;

/// An enum to wrap the client-facing stream types (plain TCP, TLS or Unix
/// domain) into a single type.
pub enum AnyStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl AnyStream {
    /// The CN of the TLS client certificate, when one was presented.
    pub fn peer_common_name(&self) -> Option<String> {
        match self {
            AnyStream::Tls(stream) => {
                let (_, connection) = stream.get_ref();
                let certs = connection.peer_certificates()?;
                extract_common_name(certs.first()?.as_ref())
            }
            _ => None,
        }
    }
}

impl AsyncRead for AnyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            AnyStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            AnyStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            AnyStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            AnyStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Pulls the subject CN out of a DER-encoded certificate by scanning for the
/// commonName attribute (OID 2.5.4.3) and taking the string that follows.
/// Enough for the cert authentication method; full X.509 parsing is not
/// needed anywhere else.
fn extract_common_name(der: &[u8]) -> Option<String> {
    const CN_OID: &[u8] = &[0x06, 0x03, 0x55, 0x04, 0x03];
    let mut i = 0;
    let mut last: Option<String> = None;
    while i + CN_OID.len() + 2 <= der.len() {
        if &der[i..i + CN_OID.len()] == CN_OID {
            let tag = der[i + CN_OID.len()];
            // PrintableString (0x13) or UTF8String (0x0c), short-form length.
            if (tag == 0x13 || tag == 0x0c) && i + CN_OID.len() + 1 < der.len() {
                let len = der[i + CN_OID.len() + 1] as usize;
                let start = i + CN_OID.len() + 2;
                if len < 0x80 && start + len <= der.len() {
                    if let Ok(cn) = std::str::from_utf8(&der[start..start + len]) {
                        // The subject CN appears after the issuer CN; keep
                        // the last occurrence.
                        last = Some(cn.to_string());
                    }
                }
            }
        }
        i += 1;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_common_name_in_der_fragment() {
        // SEQUENCE { OID 2.5.4.3, UTF8String "alice" }
        let fragment = [
            0x30, 0x0c, 0x06, 0x03, 0x55, 0x04, 0x03, 0x0c, 0x05, b'a', b'l', b'i', b'c', b'e',
        ];
        assert_eq!(extract_common_name(&fragment).as_deref(), Some("alice"));
    }

    #[test]
    fn missing_cn_yields_none() {
        assert_eq!(extract_common_name(&[0x30, 0x03, 0x02, 0x01, 0x01]), None);
    }
}
