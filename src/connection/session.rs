// src/connection/session.rs

//! The session worker: accepts a client, negotiates SSL, runs the
//! authentication gate, attaches a pooled backend connection and relays
//! traffic until the client leaves. Workers loop back to accepting, keeping
//! their pooled connections warm, until asked to restart or retire.

use crate::config::SharedConfig;
use crate::connection::registry::{SessionRegistry, SessionStatus};
use crate::core::auth::gate::authenticate_client;
use crate::core::auth::hba::ClientInfo;
use crate::core::auth::passwd::StoredSecret;
use crate::core::errors::PoolError;
use crate::core::probe::{ProbeConnection, ProbeCredentials};
use crate::core::protocol::message;
use crate::core::protocol::{StartupPacket, StartupRequest};
use crate::core::state::{ClusterState, NO_NODE, NodeId};
use crate::server::context::SharedAuth;
use crate::server::listener::{Accepted, Listeners};
use crate::server::stream::AnyStream;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

/// Everything a session worker needs, cloned per worker.
#[derive(Clone)]
pub struct SessionWorkerDeps {
    pub state: Arc<ClusterState>,
    pub config: SharedConfig,
    pub sessions: Arc<SessionRegistry>,
    pub auth: SharedAuth,
    pub listeners: Arc<Listeners>,
    pub accepting: Arc<AtomicBool>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Spawns one session worker task.
pub fn spawn_session_worker(deps: SessionWorkerDeps) {
    tokio::spawn(async move {
        run_worker(deps).await;
    });
}

type PoolKey = (String, String, NodeId);

async fn run_worker(deps: SessionWorkerDeps) {
    let (worker_id, kill) = deps.sessions.register();
    let mut shutdown_rx = deps.shutdown_tx.subscribe();
    let mut pool: HashMap<PoolKey, ProbeConnection> = HashMap::new();
    debug!("session worker {} started", worker_id);

    loop {
        let Some(slot) = deps.sessions.get(worker_id) else {
            break;
        };
        if slot.need_restart {
            debug!("session worker {} restarting after topology change", worker_id);
            break;
        }
        if slot.exit_if_idle && pool.is_empty() {
            debug!("session worker {} retiring (idle, no pooled connections)", worker_id);
            break;
        }
        if !deps.accepting.load(Ordering::Acquire) {
            break;
        }
        deps.sessions.update(worker_id, |s| {
            s.status = SessionStatus::WaitForConnect;
            s.pooled_connections = pool.len();
        });

        tokio::select! {
            accepted = deps.listeners.accept() => {
                match accepted {
                    Ok(accepted) => {
                        serve_client(&deps, worker_id, &kill, &mut pool, accepted).await;
                    }
                    Err(e) => {
                        warn!("accept failed in worker {}: {}", worker_id, e);
                    }
                }
            }
            _ = kill.notified() => {
                // Killed while parked on accept: nothing to wind down.
                break;
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    for (_, conn) in pool {
        conn.close().await;
    }
    deps.sessions.unregister(worker_id);
    debug!("session worker {} stopped", worker_id);
}

async fn serve_client(
    deps: &SessionWorkerDeps,
    worker_id: u64,
    kill: &Arc<Notify>,
    pool: &mut HashMap<PoolKey, ProbeConnection>,
    accepted: Accepted,
) {
    deps.sessions.update(worker_id, |s| {
        s.status = SessionStatus::Connecting;
        s.client_connection_count += 1;
    });

    let (mut stream, addr, is_local) = match accepted {
        Accepted::Tcp(tcp, addr) => (AnyStream::Tcp(tcp), Some(addr), false),
        Accepted::Unix(unix) => (AnyStream::Unix(unix), None, true),
    };

    // SSL negotiation comes before anything HBA sees.
    let startup = match negotiate_startup(deps, &mut stream).await {
        Ok(Some(startup)) => startup,
        Ok(None) => return,
        Err(e) => {
            debug!("startup negotiation failed: {}", e);
            return;
        }
    };
    let Some(user) = startup.user().map(str::to_string) else {
        let _ = send_error(&mut stream, "08P01", "no user name in startup packet", None).await;
        return;
    };
    let database = startup.database().unwrap_or(&user).to_string();

    let client = ClientInfo {
        is_local,
        addr: addr.map(|a| a.ip()),
        tls: matches!(stream, AnyStream::Tls(_)),
        database: database.clone(),
        user: user.clone(),
    };

    let load_balance_node = pick_load_balance_node(&deps.state);
    deps.sessions.update(worker_id, |s| {
        s.database = database.clone();
        s.user = user.clone();
        s.client_addr = addr.map(|a| a.to_string());
        s.load_balance_node = load_balance_node;
    });

    // Run the gate to completion before the session is admitted.
    let auth_ctx = deps.auth.read().clone();
    let auth_timeout = deps.config.read().auth.authentication_timeout;
    let common_name = stream.peer_common_name();
    let auth_result = tokio::time::timeout(
        auth_timeout,
        authenticate_client(&mut stream, &client, &auth_ctx, common_name.as_deref()),
    )
    .await;
    match auth_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if let PoolError::AuthFailed { detail } = &e {
                warn!("authentication failed: {}", detail);
            } else {
                warn!("authentication error: {}", e);
            }
            let _ = send_error(&mut stream, "28000", "client authentication failed", None).await;
            return;
        }
        Err(_) => {
            warn!(
                "authentication of user \"{}\" timed out after {:?}",
                user, auth_timeout
            );
            let _ = send_error(&mut stream, "28000", "client authentication failed", None).await;
            return;
        }
    }
    info!(
        "session admitted: user={} database={} worker={}",
        user, database, worker_id
    );

    // Attach a backend connection, preferring one pooled earlier.
    let main = deps.state.main_node_id();
    if main == NO_NODE {
        let _ = send_error(&mut stream, "57000", "no backend is available", None).await;
        return;
    }
    let pool_key = (user.clone(), database.clone(), main);
    let mut backend = match pool.remove(&pool_key) {
        Some(conn) => conn,
        None => {
            let creds = backend_credentials(&auth_ctx, &user, &database);
            let Some(desc) = deps.state.desc(main) else {
                let _ = send_error(&mut stream, "57000", "no backend is available", None).await;
                return;
            };
            match ProbeConnection::connect(desc, &creds).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("cannot attach backend {} for session: {}", main, e);
                    let _ = send_error(
                        &mut stream,
                        "08000",
                        "could not connect to backend",
                        Some(&e.to_string()),
                    )
                    .await;
                    return;
                }
            }
        }
    };

    if greet_client(&mut stream, worker_id).await.is_err() {
        pool.insert(pool_key, backend);
        return;
    }
    deps.sessions.update(worker_id, |s| s.status = SessionStatus::Idle);

    let keep = relay(deps, worker_id, kill, &mut stream, &mut backend).await;
    if keep {
        pool.insert(pool_key, backend);
    } else {
        backend.close().await;
    }
}

/// Handles SSLRequest/CancelRequest before the real startup packet.
async fn negotiate_startup(
    deps: &SessionWorkerDeps,
    stream: &mut AnyStream,
) -> Result<Option<StartupPacket>, PoolError> {
    loop {
        match message::read_startup(stream).await? {
            StartupRequest::SslRequest => {
                let can_tls =
                    deps.listeners.tls.is_some() && matches!(stream, AnyStream::Tcp(_));
                if can_tls {
                    stream.write_all(b"S").await?;
                    stream.flush().await?;
                    let acceptor = deps.listeners.tls.clone().expect("checked above");
                    // Move the TCP stream through the TLS handshake.
                    let placeholder = AnyStream::Unix(unconnected_unix());
                    let AnyStream::Tcp(tcp) = std::mem::replace(stream, placeholder) else {
                        unreachable!("checked above");
                    };
                    let tls = acceptor
                        .accept(tcp)
                        .await
                        .map_err(|e| PoolError::Transport(format!("TLS accept failed: {e}")))?;
                    *stream = AnyStream::Tls(Box::new(tls));
                } else {
                    stream.write_all(b"N").await?;
                    stream.flush().await?;
                }
            }
            StartupRequest::Cancel { process_id, .. } => {
                debug!("cancel request for worker {} ignored", process_id);
                return Ok(None);
            }
            StartupRequest::Startup(packet) => return Ok(Some(packet)),
        }
    }
}

/// A throwaway half of a socketpair, used only as a swap placeholder.
fn unconnected_unix() -> tokio::net::UnixStream {
    let (a, _b) = tokio::net::UnixStream::pair().expect("socketpair");
    a
}

/// Post-authentication greeting: AuthenticationOk, key data, the parameter
/// handful clients insist on, ReadyForQuery.
async fn greet_client(stream: &mut AnyStream, worker_id: u64) -> Result<(), PoolError> {
    message::write_message(stream, b'R', &message::auth_ok_body()).await?;
    let secret: i32 = rand::thread_rng().r#gen();
    message::write_message(
        stream,
        b'K',
        &message::backend_key_data_body(worker_id as i32, secret),
    )
    .await?;
    for (name, value) in [
        ("server_encoding", "UTF8"),
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO, MDY"),
    ] {
        message::write_message(stream, b'S', &message::parameter_status_body(name, value))
            .await?;
    }
    message::write_message(stream, b'Z', &message::ready_for_query_body(b'I')).await
}

/// The message relay. Returns whether the backend connection is still clean
/// enough to pool.
async fn relay(
    deps: &SessionWorkerDeps,
    worker_id: u64,
    kill: &Arc<Notify>,
    stream: &mut AnyStream,
    backend: &mut ProbeConnection,
) -> bool {
    loop {
        let msg = tokio::select! {
            msg = message::read_message(stream) => msg,
            _ = kill.notified() => {
                debug!("session on worker {} killed mid-session", worker_id);
                let _ = send_error(stream, "57P01", "terminating connection due to administrator command", None).await;
                return false;
            }
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(PoolError::UnexpectedEof) => return true,
            Err(e) => {
                debug!("client relay error on worker {}: {}", worker_id, e);
                return true;
            }
        };
        if msg.tag == b'X' {
            return true;
        }

        deps.sessions
            .update(worker_id, |s| s.status = SessionStatus::CommandExecute);
        if let Err(e) = backend.send_message(msg.tag, &msg.body).await {
            warn!("backend write failed on worker {}: {}", worker_id, e);
            let _ = send_error(stream, "08006", "backend connection failure", None).await;
            return false;
        }

        // Simple queries and Sync produce a response stream ending in
        // ReadyForQuery; other extended-protocol messages are buffered by
        // the backend until then.
        if msg.tag == b'Q' || msg.tag == b'S' {
            loop {
                let reply = match backend.recv_message().await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("backend read failed on worker {}: {}", worker_id, e);
                        let _ =
                            send_error(stream, "08006", "backend connection failure", None).await;
                        return false;
                    }
                };
                if message::write_message(stream, reply.tag, &reply.body)
                    .await
                    .is_err()
                {
                    return true;
                }
                if reply.tag == b'Z' {
                    let status = match reply.body.first() {
                        Some(b'T') | Some(b'E') => SessionStatus::IdleInTrans,
                        _ => SessionStatus::Idle,
                    };
                    deps.sessions.update(worker_id, |s| s.status = status);
                    break;
                }
            }
        }
    }
}

async fn send_error(
    stream: &mut AnyStream,
    sqlstate: &str,
    text: &str,
    detail: Option<&str>,
) -> Result<(), PoolError> {
    message::write_message(
        stream,
        b'E',
        &message::error_response_body("FATAL", sqlstate, text, detail),
    )
    .await
}

/// Weighted random choice among the usable backends.
fn pick_load_balance_node(state: &Arc<ClusterState>) -> NodeId {
    let candidates: Vec<(NodeId, f64)> = state
        .snapshot_all()
        .iter()
        .filter(|s| s.is_valid())
        .map(|s| (s.node_id, s.desc.weight.max(0.0)))
        .collect();
    let total: f64 = candidates.iter().map(|(_, w)| w).sum();
    if candidates.is_empty() || total <= 0.0 {
        return state.main_node_id();
    }
    let mut point = rand::thread_rng().gen_range(0.0..total);
    for (node, weight) in &candidates {
        point -= weight;
        if point <= 0.0 {
            return *node;
        }
    }
    candidates.last().map(|(node, _)| *node).unwrap_or(NO_NODE)
}

/// Resolves the credentials the relay presents to the backend, honoring the
/// optional backend-credential mapping in the password store.
fn backend_credentials(
    auth: &crate::core::auth::gate::AuthContext,
    user: &str,
    database: &str,
) -> ProbeCredentials {
    let entry = auth.passwd.lookup(user);
    let (backend_user, secret): (String, Option<StoredSecret>) = match entry {
        Some(entry) => match (&entry.backend_user, &entry.backend_secret) {
            (Some(bu), Some(bs)) => (bu.clone(), Some(bs.clone())),
            _ => (user.to_string(), Some(entry.secret.clone())),
        },
        None => (user.to_string(), None),
    };
    let password = secret
        .and_then(|s| s.cleartext(auth.key.as_deref()).ok())
        .flatten();
    ProbeCredentials {
        user: backend_user,
        password,
        database: database.to_string(),
    }
}
