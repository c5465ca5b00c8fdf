// src/server/listener.rs

//! The client-facing listening sockets, shared by every session worker.
//! Accept contention between workers is resolved by the runtime.

use crate::config::TlsConfig;
use anyhow::{Context, Result, anyhow};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tracing::info;

/// One accepted client transport.
pub enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

/// The shared listener set: TCP always, a Unix socket and a TLS acceptor
/// when configured.
pub struct Listeners {
    tcp: TcpListener,
    unix: Option<UnixListener>,
    pub tls: Option<TlsAcceptor>,
}

impl Listeners {
    pub async fn bind(
        host: &str,
        port: u16,
        socket_dir: Option<&str>,
        tls: &TlsConfig,
    ) -> Result<Self> {
        let tcp = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("cannot listen on {host}:{port}"))?;
        info!("listening for clients on {}:{}", host, port);

        let unix = match socket_dir {
            Some(dir) => {
                let path = format!("{dir}/.s.PGSQL.{port}");
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)
                    .with_context(|| format!("cannot bind unix socket {path}"))?;
                info!("listening for clients on {}", path);
                Some(listener)
            }
            None => None,
        };

        let tls = if tls.enabled {
            Some(build_tls_acceptor(tls)?)
        } else {
            None
        };

        Ok(Self { tcp, unix, tls })
    }

    /// Accepts the next client on whichever socket delivers one first.
    pub async fn accept(&self) -> std::io::Result<Accepted> {
        match &self.unix {
            Some(unix) => {
                tokio::select! {
                    accepted = self.tcp.accept() => {
                        accepted.map(|(stream, addr)| Accepted::Tcp(stream, addr))
                    }
                    accepted = unix.accept() => {
                        accepted.map(|(stream, _)| Accepted::Unix(stream))
                    }
                }
            }
            None => self
                .tcp
                .accept()
                .await
                .map(|(stream, addr)| Accepted::Tcp(stream, addr)),
        }
    }
}

/// Builds the TLS acceptor from the configured certificate and key. With a
/// CA bundle configured, client certificates are requested but optional so
/// the cert authentication method can read the CN while other methods keep
/// working.
fn build_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(&config.cert_path)
            .with_context(|| format!("cannot open certificate {}", config.cert_path))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("cannot parse certificate file")?;

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(&config.key_path)
            .with_context(|| format!("cannot open private key {}", config.key_path))?,
    ))
    .context("cannot parse private key file")?
    .ok_or_else(|| anyhow!("no private key found in {}", config.key_path))?;

    let builder = ServerConfig::builder();
    let server_config = match &config.ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            let ca_certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
                std::fs::File::open(ca_path)
                    .with_context(|| format!("cannot open CA bundle {ca_path}"))?,
            ))
            .collect::<Result<Vec<_>, _>>()
            .context("cannot parse CA bundle")?;
            for cert in ca_certs {
                roots.add(cert).context("cannot add CA certificate")?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .context("cannot build client certificate verifier")?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .context("cannot build TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
