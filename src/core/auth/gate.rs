// src/core/auth/gate.rs

//! Runs a client's authentication to completion before the session is
//! admitted. The method comes from the first matching HBA rule; every
//! failure is surfaced to the client as the same uniform error, with the
//! diagnostic detail kept for the log.

use super::hba::{ClientInfo, HbaRules};
use super::methods::{AuthMethod, LdapOptions};
use super::passwd::{PasswdEntry, PasswordStore, StoredSecret};
use super::scram::{SCRAM_SHA_256, ScramServer, ScramVerifier};
use super::md5;
use crate::core::errors::PoolError;
use crate::core::protocol::message;
use rand::RngCore;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Everything the gate needs, shared across sessions and swapped on reload.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub hba: Arc<HbaRules>,
    pub passwd: Arc<PasswordStore>,
    /// Pool key material for AES password entries, when a key file exists.
    pub key: Option<String>,
}

impl AuthContext {
    fn entry_for<'a>(&'a self, user: &str) -> Option<&'a PasswdEntry> {
        self.passwd.lookup(user)
    }
}

fn detail_for(client: &ClientInfo, why: &str) -> String {
    let host = match (&client.addr, client.is_local) {
        (_, true) => "[local]".to_string(),
        (Some(addr), _) => addr.to_string(),
        (None, _) => "[unknown]".to_string(),
    };
    format!(
        "host={host} user={} database={} tls={}: {why}",
        client.user, client.database, client.tls
    )
}

fn auth_failed(client: &ClientInfo, why: &str) -> PoolError {
    PoolError::AuthFailed {
        detail: detail_for(client, why),
    }
}

/// Verifies a cleartext password against whatever form the store holds.
fn verify_cleartext(
    password: &str,
    user: &str,
    secret: &StoredSecret,
    key: Option<&str>,
) -> Result<bool, PoolError> {
    match secret {
        StoredSecret::Md5(inner) => {
            let computed = md5::encrypt_password(password, user);
            let computed_inner = &computed[md5::MD5_PREFIX.len()..];
            Ok(computed_inner.as_bytes().ct_eq(inner.as_bytes()).into())
        }
        StoredSecret::Scram(verifier_text) => {
            let verifier = ScramVerifier::parse(verifier_text)?;
            let rebuilt =
                ScramVerifier::build_with_salt(password, &verifier.salt, verifier.iterations);
            Ok(rebuilt
                .stored_key
                .as_slice()
                .ct_eq(verifier.stored_key.as_slice())
                .into())
        }
        other => {
            let stored = other.cleartext(key)?.unwrap_or_default();
            Ok(stored.as_bytes().ct_eq(password.as_bytes()).into())
        }
    }
}

/// Reads one frontend message and insists it is a PasswordMessage-family
/// frame (`p`).
async fn read_password_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Vec<u8>, PoolError> {
    let msg = message::read_message(stream).await?;
    if msg.tag != b'p' {
        return Err(PoolError::Protocol(format!(
            "expected password message, got '{}'",
            msg.tag as char
        )));
    }
    Ok(msg.body.to_vec())
}

fn body_as_cstr(body: &[u8]) -> Result<String, PoolError> {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    Ok(String::from_utf8(body[..end].to_vec())?)
}

/// Runs the whole gate for one client. On success the caller owns sending
/// AuthenticationOk and the session greeting; on error it must send the
/// uniform failure and close.
pub async fn authenticate_client<S>(
    stream: &mut S,
    client: &ClientInfo,
    ctx: &AuthContext,
    tls_common_name: Option<&str>,
) -> Result<(), PoolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(rule) = ctx.hba.find_match(client).await else {
        // An unmatched client is an implicit reject.
        return Err(auth_failed(client, "no matching HBA rule"));
    };
    debug!(
        "HBA rule at line {} selects method \"{}\" for user \"{}\"",
        rule.line_number,
        rule.method.name(),
        client.user
    );

    match &rule.method {
        AuthMethod::Trust => Ok(()),
        AuthMethod::Reject => Err(auth_failed(client, "rejected by HBA rule")),
        AuthMethod::Password => run_cleartext(stream, client, ctx).await,
        AuthMethod::Md5 => run_md5(stream, client, ctx).await,
        AuthMethod::ScramSha256 => run_scram(stream, client, ctx).await,
        AuthMethod::Cert => run_cert(client, tls_common_name),
        AuthMethod::Pam(_) => Err(auth_failed(
            client,
            "PAM authentication is not available in this build",
        )),
        AuthMethod::Ldap(options) => run_ldap_precheck(client, options),
    }
}

async fn run_cleartext<S>(
    stream: &mut S,
    client: &ClientInfo,
    ctx: &AuthContext,
) -> Result<(), PoolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    message::write_message(stream, b'R', &message::auth_cleartext_body()).await?;
    let body = read_password_frame(stream).await?;
    let password = body_as_cstr(&body)?;

    let Some(entry) = ctx.entry_for(&client.user) else {
        return Err(auth_failed(client, "no password store entry"));
    };
    if verify_cleartext(&password, &client.user, &entry.secret, ctx.key.as_deref())? {
        Ok(())
    } else {
        Err(auth_failed(client, "password mismatch"))
    }
}

async fn run_md5<S>(
    stream: &mut S,
    client: &ClientInfo,
    ctx: &AuthContext,
) -> Result<(), PoolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut salt = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut salt);
    message::write_message(stream, b'R', &message::auth_md5_body(salt)).await?;
    let body = read_password_frame(stream).await?;
    let response = body_as_cstr(&body)?;

    let Some(entry) = ctx.entry_for(&client.user) else {
        return Err(auth_failed(client, "no password store entry"));
    };
    let ok = match &entry.secret {
        StoredSecret::Md5(inner) => md5::verify_salted(inner, &salt, &response),
        StoredSecret::Scram(_) => {
            return Err(auth_failed(
                client,
                "stored secret is SCRAM-only and cannot answer an MD5 challenge",
            ));
        }
        other => match other.cleartext(ctx.key.as_deref())? {
            Some(password) => md5::verify_password(&password, &client.user, &salt, &response),
            None => false,
        },
    };
    if ok {
        Ok(())
    } else {
        Err(auth_failed(client, "MD5 challenge response mismatch"))
    }
}

async fn run_scram<S>(
    stream: &mut S,
    client: &ClientInfo,
    ctx: &AuthContext,
) -> Result<(), PoolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(entry) = ctx.entry_for(&client.user) else {
        return Err(auth_failed(client, "no password store entry"));
    };
    let verifier = match &entry.secret {
        StoredSecret::Scram(text) => ScramVerifier::parse(text)?,
        StoredSecret::Md5(_) => {
            return Err(auth_failed(
                client,
                "stored secret is MD5-only and cannot answer a SCRAM exchange",
            ));
        }
        other => match other.cleartext(ctx.key.as_deref())? {
            Some(password) => ScramVerifier::build(&password),
            None => return Err(auth_failed(client, "no usable secret for SCRAM")),
        },
    };

    message::write_message(stream, b'R', &message::auth_sasl_body(&[SCRAM_SHA_256])).await?;

    // SASLInitialResponse: mechanism name, then length-prefixed payload.
    let body = read_password_frame(stream).await?;
    let mut rest = &body[..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PoolError::Protocol("malformed SASLInitialResponse".into()))?;
    let mechanism = String::from_utf8(rest[..nul].to_vec())?;
    rest = &rest[nul + 1..];
    if mechanism != SCRAM_SHA_256 {
        return Err(auth_failed(
            client,
            &format!("unsupported SASL mechanism \"{mechanism}\""),
        ));
    }
    if rest.len() < 4 {
        return Err(PoolError::Protocol("malformed SASLInitialResponse".into()));
    }
    let len = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    rest = &rest[4..];
    if len < 0 || rest.len() != len as usize {
        return Err(PoolError::Protocol("malformed SASLInitialResponse".into()));
    }
    let client_first = std::str::from_utf8(rest)?.to_string();

    let mut server = ScramServer::new(verifier);
    let server_first = server
        .handle_client_first(&client_first)
        .map_err(|e| auth_failed(client, &e.to_string()))?;
    message::write_message(
        stream,
        b'R',
        &message::auth_sasl_continue_body(server_first.as_bytes()),
    )
    .await?;

    let final_body = read_password_frame(stream).await?;
    let client_final = std::str::from_utf8(&final_body)?.to_string();
    let server_final = server
        .handle_client_final(&client_final)
        .map_err(|e| auth_failed(client, &e.to_string()))?;
    message::write_message(
        stream,
        b'R',
        &message::auth_sasl_final_body(server_final.as_bytes()),
    )
    .await?;
    Ok(())
}

fn run_cert(client: &ClientInfo, tls_common_name: Option<&str>) -> Result<(), PoolError> {
    match tls_common_name {
        Some(cn) if cn == client.user => {
            info!("certificate CN \"{}\" accepted for role", cn);
            Ok(())
        }
        Some(cn) => Err(auth_failed(
            client,
            &format!("certificate CN \"{cn}\" does not match the role"),
        )),
        None => Err(auth_failed(
            client,
            "cert method requires a TLS client certificate",
        )),
    }
}

/// The LDAP username guard runs even though the bind itself is declined;
/// forbidden characters are an authentication failure, never a pool failure.
fn run_ldap_precheck(client: &ClientInfo, options: &LdapOptions) -> Result<(), PoolError> {
    LdapOptions::check_username(&client.user)
        .map_err(|_| auth_failed(client, "user name not permitted in an LDAP filter"))?;
    let target = if options.is_search_bind() {
        options.search_filter_for(&client.user)
    } else {
        options.simple_bind_dn(&client.user)
    };
    Err(auth_failed(
        client,
        &format!("LDAP authentication is not available in this build (would bind {target})"),
    ))
}
