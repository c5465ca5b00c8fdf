// src/core/pcp/server.rs

//! The control protocol server: one operator connection at a time, an MD5
//! challenge handshake, then per-ToS dispatch onto the shared state record
//! and the failover request queue.

use super::frame::{PcpCodec, PcpFrame, error_payload};
use super::report::{HealthStatsRow, NodeInfoRow, ProcInfoRow};
use super::users::PcpUsers;
use crate::config::SharedConfig;
use crate::connection::SessionRegistry;
use crate::core::errors::PoolError;
use crate::core::events::{Interrupt, InterruptBus, ShutdownMode};
use crate::core::failover::{CommandRunner, SubstitutionContext, expand};
use crate::core::probe::ProbeStream;
use crate::core::state::{ClusterState, FailoverRequest, NodeId, RequestFlags};
use crate::core::watchdog::{ClusterCommand, Watchdog};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{Notify, broadcast};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// How long a mutating request may wait for the engine to drain the queue.
const MUTATION_WAIT: Duration = Duration::from_secs(60);

type PcpFramed = Framed<ProbeStream, PcpCodec>;

#[derive(Clone, Copy)]
enum Phase {
    NeedSalt,
    NeedAuth { salt: [u8; 4] },
    Ready,
}

pub struct PcpServer {
    state: Arc<ClusterState>,
    config: SharedConfig,
    sessions: Arc<SessionRegistry>,
    watchdog: Arc<dyn Watchdog>,
    runner: Arc<dyn CommandRunner>,
    bus: Arc<InterruptBus>,
    /// Raised by the failover engine when the worker should drop its
    /// connection and start over.
    restart: Arc<Notify>,
}

impl PcpServer {
    pub fn new(
        state: Arc<ClusterState>,
        config: SharedConfig,
        sessions: Arc<SessionRegistry>,
        watchdog: Arc<dyn Watchdog>,
        runner: Arc<dyn CommandRunner>,
        bus: Arc<InterruptBus>,
        restart: Arc<Notify>,
    ) -> Self {
        Self {
            state,
            config,
            sessions,
            watchdog,
            runner,
            bus,
            restart,
        }
    }

    /// The accept loop. Operator connections are served strictly one at a
    /// time; operators are expected to serialise.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let (host, port, socket_dir) = {
            let config = self.config.read();
            (
                config.pcp.host.clone(),
                config.pcp.port,
                config.pcp.socket_dir.clone(),
            )
        };

        let listener = match TcpListener::bind((host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("cannot bind PCP listener on {}:{}: {}", host, port, e);
                return;
            }
        };
        let unix_listener = socket_dir.as_ref().and_then(|dir| {
            let path = format!("{dir}/.s.PGSQL.{port}");
            let _ = std::fs::remove_file(&path);
            match UnixListener::bind(&path) {
                Ok(l) => Some(l),
                Err(e) => {
                    warn!("cannot bind PCP unix socket {}: {}", path, e);
                    None
                }
            }
        });
        info!("PCP server listening on {}:{}", host, port);

        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("PCP connection from {}", addr);
                        ProbeStream::Tcp(stream)
                    }
                    Err(e) => {
                        warn!("PCP accept failed: {}", e);
                        continue;
                    }
                },
                accepted = accept_unix(&unix_listener) => match accepted {
                    Some(stream) => ProbeStream::Unix(stream),
                    None => continue,
                },
                _ = shutdown_rx.recv() => break,
            };

            if let Err(e) = self.handle_connection(stream, &mut shutdown_rx).await {
                debug!("PCP connection ended: {}", e);
            }
        }
        debug!("PCP server stopped");
    }

    async fn handle_connection(
        &self,
        stream: ProbeStream,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), PoolError> {
        let mut framed = Framed::new(stream, PcpCodec);
        let mut phase = Phase::NeedSalt;

        loop {
            let frame = tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        // Protocol errors terminate the connection, never
                        // the server.
                        self.send_error(&mut framed, &e.to_string(), None).await?;
                        return Err(e);
                    }
                    None => return Ok(()),
                },
                _ = self.restart.notified() => {
                    debug!("PCP worker recycled after topology change");
                    return Ok(());
                }
                _ = shutdown_rx.recv() => return Ok(()),
            };

            match phase {
                Phase::NeedSalt => {
                    if frame.tos != b'M' {
                        self.send_error(&mut framed, "authentication required", None)
                            .await?;
                        return Err(PoolError::Protocol(
                            "first request must ask for a salt".into(),
                        ));
                    }
                    let mut salt = [0u8; 4];
                    rand::thread_rng().fill_bytes(&mut salt);
                    framed.send(PcpFrame::new(b'm', salt.to_vec())).await?;
                    phase = Phase::NeedAuth { salt };
                }
                Phase::NeedAuth { salt } => {
                    if frame.tos != b'R' {
                        self.send_error(&mut framed, "authentication required", None)
                            .await?;
                        return Err(PoolError::Protocol(
                            "salt request must be followed by authentication".into(),
                        ));
                    }
                    let strings = frame.strings();
                    let (user, response) = match strings.as_slice() {
                        [user, response, ..] => (user.clone(), response.clone()),
                        _ => {
                            self.send_error(&mut framed, "malformed authentication", None)
                                .await?;
                            return Err(PoolError::Protocol(
                                "authentication payload must carry user and digest".into(),
                            ));
                        }
                    };
                    let user_file = self.config.read().pcp.user_file.clone();
                    let users = PcpUsers::load(Path::new(&user_file)).unwrap_or_default();
                    if users.verify(&user, &salt, &response) {
                        info!("PCP user \"{}\" authenticated", user);
                        framed
                            .send(PcpFrame::from_strings(b'r', &["CommandComplete"]))
                            .await?;
                        phase = Phase::Ready;
                    } else {
                        warn!("PCP authentication failed for user \"{}\"", user);
                        self.send_error(&mut framed, "authentication failed", None)
                            .await?;
                        return Ok(());
                    }
                }
                Phase::Ready => {
                    if frame.tos == b'X' {
                        return Ok(());
                    }
                    if let Err(e) = self.dispatch(&mut framed, &frame).await {
                        self.send_error(&mut framed, &e.to_string(), None).await?;
                        if matches!(e, PoolError::Protocol(_)) {
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, framed: &mut PcpFramed, frame: &PcpFrame) -> Result<(), PoolError> {
        match frame.tos {
            // --- Informational ---
            b'L' => {
                let count = self.state.node_count().to_string();
                self.send_array(framed, b'l', vec![vec![count]]).await
            }
            b'I' => {
                let node = self.parse_node_id(frame)?;
                let snapshot = self
                    .state
                    .snapshot(node)
                    .ok_or(PoolError::NodeIdOutOfRange(node))?;
                let row = NodeInfoRow::from_snapshot(&snapshot);
                self.send_array(framed, b'i', vec![row.to_payload()]).await
            }
            b'H' => {
                let node = self.parse_node_id(frame)?;
                let snapshot = self
                    .state
                    .snapshot(node)
                    .ok_or(PoolError::NodeIdOutOfRange(node))?;
                let stats = self
                    .state
                    .stats_snapshot(node)
                    .ok_or(PoolError::NodeIdOutOfRange(node))?;
                let row = HealthStatsRow::build(node, &snapshot, &stats);
                self.send_array(framed, b'h', vec![row.to_payload()]).await
            }
            b'N' => {
                let records = self
                    .sessions
                    .snapshot_all()
                    .iter()
                    .map(|s| vec![s.worker_id.to_string()])
                    .collect();
                self.send_array(framed, b'n', records).await
            }
            b'P' => {
                let wanted: u64 = frame
                    .first_string()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let records = self
                    .sessions
                    .snapshot_all()
                    .iter()
                    .filter(|s| wanted == 0 || s.worker_id == wanted)
                    .map(|s| ProcInfoRow::from_slot(s).to_payload())
                    .collect();
                self.send_array(framed, b'p', records).await
            }
            b'B' => {
                let records = self.pool_status_records();
                self.send_array(framed, b'b', records).await
            }
            b'W' => {
                let wd_id = frame.first_string().and_then(|s| s.parse().ok());
                let payload = self.watchdog.nodes_json(wd_id).to_string();
                self.send_array(framed, b'w', vec![vec![payload]]).await
            }

            // --- Mutating ---
            b'C' => {
                let node = self.parse_node_id(frame)?;
                self.run_mutation(
                    framed,
                    b'c',
                    FailoverRequest::node_up(node, RequestFlags::empty()),
                )
                .await
            }
            b'D' | b'd' => {
                let node = self.parse_node_id(frame)?;
                let flags = if frame.tos == b'd' {
                    RequestFlags::SWITCHOVER
                } else {
                    RequestFlags::empty()
                };
                self.run_mutation(framed, b'd', FailoverRequest::node_down(node, flags))
                    .await
            }
            b'J' | b'j' => {
                let (node, switchover) = self.parse_promote(frame)?;
                let mut flags = RequestFlags::PROMOTE;
                if switchover {
                    flags |= RequestFlags::SWITCHOVER;
                }
                self.run_mutation(framed, b'd', FailoverRequest::promote(node, flags))
                    .await
            }
            b'O' => {
                let node = self.parse_node_id(frame)?;
                self.run_recovery(framed, node).await
            }
            b'T' | b't' => {
                let mode = frame
                    .first_string()
                    .and_then(|s| s.bytes().next())
                    .and_then(ShutdownMode::from_pcp_code)
                    .ok_or_else(|| PoolError::Protocol("unknown shutdown mode".into()))?;
                if frame.tos == b'T' {
                    self.watchdog
                        .execute_cluster_command(ClusterCommand::Shutdown(mode))
                        .await?;
                }
                framed
                    .send(PcpFrame::from_strings(b't', &["CommandComplete"]))
                    .await?;
                self.bus.raise(Interrupt::Shutdown(mode));
                Ok(())
            }
            b'Z' => {
                let cluster = frame.first_string().as_deref() == Some("c");
                if cluster {
                    self.watchdog
                        .execute_cluster_command(ClusterCommand::ReloadConfig)
                        .await?;
                }
                self.bus.raise(Interrupt::Reload);
                framed
                    .send(PcpFrame::from_strings(b'z', &["CommandComplete"]))
                    .await?;
                Ok(())
            }
            b'A' => {
                let strings = frame.strings();
                let (name, value) = match strings.as_slice() {
                    [name, value, ..] => (name.clone(), value.clone()),
                    _ => {
                        return Err(PoolError::Protocol(
                            "set parameter needs a name and a value".into(),
                        ));
                    }
                };
                self.config
                    .write()
                    .set_runtime_parameter(&name, &value)
                    .map_err(|e| PoolError::InvalidState(e.to_string()))?;
                info!("runtime parameter \"{}\" set to \"{}\"", name, value);
                framed
                    .send(PcpFrame::from_strings(b'a', &["CommandComplete"]))
                    .await?;
                Ok(())
            }
            other => Err(PoolError::Protocol(format!(
                "unknown request type '{}'",
                other as char
            ))),
        }
    }

    /// Enqueues a request, waits for the engine to apply it, then confirms.
    /// Requests arriving while the queue is draining are refused with a
    /// descriptive error.
    async fn run_mutation(
        &self,
        framed: &mut PcpFramed,
        reply_tos: u8,
        request: FailoverRequest,
    ) -> Result<(), PoolError> {
        if self.state.is_switching() {
            return Err(PoolError::Switching);
        }
        self.state.enqueue_request(request)?;
        self.state.wait_until_drained(MUTATION_WAIT).await?;
        framed
            .send(PcpFrame::from_strings(reply_tos, &["CommandComplete"]))
            .await?;
        Ok(())
    }

    /// On-line recovery: the external script does the heavy lifting; the
    /// node is attached afterwards.
    async fn run_recovery(&self, framed: &mut PcpFramed, node: NodeId) -> Result<(), PoolError> {
        self.state.validate_node_id(node)?;
        if self.state.is_switching() {
            return Err(PoolError::Switching);
        }
        let command = self.config.read().failover.recovery_command.clone();
        if command.trim().is_empty() {
            return Err(PoolError::InvalidState(
                "no recovery command is configured".into(),
            ));
        }
        let mut ctx = SubstitutionContext {
            node_id: node,
            new_main_id: self.state.main_node_id(),
            old_main_id: self.state.main_node_id(),
            old_primary_id: self.state.primary_node_id(),
            ..Default::default()
        };
        if let Some(desc) = self.state.desc(node) {
            ctx.hostname = desc.hostname.clone();
            ctx.port = desc.port;
            ctx.data_directory = desc.data_directory.clone();
        }
        if let Some(desc) = self.state.desc(ctx.new_main_id) {
            ctx.new_main_host = desc.hostname.clone();
            ctx.new_main_port = desc.port;
            ctx.new_main_dir = desc.data_directory.clone();
        }
        self.runner.run(&expand(&command, &ctx)).await?;

        self.state
            .enqueue_request(FailoverRequest::node_up(node, RequestFlags::empty()))?;
        self.state.wait_until_drained(MUTATION_WAIT).await?;
        framed
            .send(PcpFrame::from_strings(b'c', &["CommandComplete"]))
            .await?;
        Ok(())
    }

    /// Streams `[ArraySize, record*, CommandComplete]` under one reply ToS.
    async fn send_array(
        &self,
        framed: &mut PcpFramed,
        tos: u8,
        records: Vec<Vec<String>>,
    ) -> Result<(), PoolError> {
        framed
            .send(PcpFrame::from_strings(
                tos,
                &["ArraySize", &records.len().to_string()],
            ))
            .await?;
        for record in records {
            let refs: Vec<&str> = record.iter().map(|s| s.as_str()).collect();
            framed.send(PcpFrame::from_strings(tos, &refs)).await?;
        }
        framed
            .send(PcpFrame::from_strings(tos, &["CommandComplete"]))
            .await?;
        Ok(())
    }

    async fn send_error(
        &self,
        framed: &mut PcpFramed,
        message: &str,
        detail: Option<&str>,
    ) -> Result<(), PoolError> {
        framed
            .send(PcpFrame::new(b'E', error_payload("ERROR", message, detail)))
            .await
    }

    fn parse_node_id(&self, frame: &PcpFrame) -> Result<NodeId, PoolError> {
        let node: NodeId = frame
            .first_string()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| PoolError::Protocol("request needs a node id".into()))?;
        self.state.validate_node_id(node)?;
        Ok(node)
    }

    fn parse_promote(&self, frame: &PcpFrame) -> Result<(NodeId, bool), PoolError> {
        let payload = frame
            .first_string()
            .ok_or_else(|| PoolError::Protocol("promote needs a node id".into()))?;
        let mut parts = payload.split_whitespace();
        let node: NodeId = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PoolError::Protocol("promote needs a node id".into()))?;
        self.state.validate_node_id(node)?;
        let switchover = parts.next() == Some("s");
        Ok((node, switchover))
    }

    /// The pool-status records: name, value and description per entry.
    fn pool_status_records(&self) -> Vec<Vec<String>> {
        let config = self.config.read();
        let entry = |name: &str, value: String, desc: &str| {
            vec![name.to_string(), value, desc.to_string()]
        };
        vec![
            entry(
                "listen_addresses",
                config.listen.host.clone(),
                "host name(s) or IP address(es) to listen on",
            ),
            entry(
                "port",
                config.listen.port.to_string(),
                "pgflock accepting port number",
            ),
            entry(
                "num_init_children",
                config.pool.num_init_children.to_string(),
                "number of session workers",
            ),
            entry(
                "min_spare_children",
                config.pool.min_spare_children.to_string(),
                "minimum number of idle session workers",
            ),
            entry(
                "max_spare_children",
                config.pool.max_spare_children.to_string(),
                "maximum number of idle session workers",
            ),
            entry(
                "streaming_replication",
                config.streaming_replication.to_string(),
                "backends form a streaming replication family",
            ),
            entry(
                "health_check_period",
                format!("{}", config.health_check.period.as_secs()),
                "health check period in seconds",
            ),
            entry(
                "health_check_timeout",
                format!("{}", config.health_check.timeout.as_secs()),
                "health check timeout in seconds",
            ),
            entry(
                "health_check_max_retries",
                config.health_check.max_retries.to_string(),
                "maximum number of retries before a node is judged down",
            ),
            entry(
                "sr_check_period",
                format!("{}", config.sr_check.period.as_secs()),
                "streaming replication check period in seconds",
            ),
            entry(
                "detach_false_primary",
                config.sr_check.detach_false_primary.to_string(),
                "detach backends wrongly claiming to be primary",
            ),
            entry(
                "failover_command",
                config.failover.failover_command.clone(),
                "command run when a node is detached",
            ),
            entry(
                "failback_command",
                config.failover.failback_command.clone(),
                "command run when a node is attached",
            ),
            entry(
                "follow_primary_command",
                config.failover.follow_primary_command.clone(),
                "command run for each standby after the primary changed",
            ),
            entry(
                "backend_count",
                config.backends.len().to_string(),
                "number of configured backends",
            ),
        ]
    }
}

async fn accept_unix(listener: &Option<UnixListener>) -> Option<tokio::net::UnixStream> {
    match listener {
        Some(listener) => match listener.accept().await {
            Ok((stream, _)) => Some(stream),
            Err(e) => {
                warn!("PCP unix accept failed: {}", e);
                None
            }
        },
        None => futures::future::pending().await,
    }
}
