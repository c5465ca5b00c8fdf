// src/core/pcp/client.rs

//! The control protocol client library: builds request frames, runs the MD5
//! challenge handshake and parses typed replies. Used by the admin CLI.

use super::frame::{PcpCodec, PcpFrame, parse_error_payload};
use super::report::{HealthStatsRow, NodeInfoRow, ProcInfoRow};
use super::users::client_response;
use crate::core::errors::PoolError;
use crate::core::events::ShutdownMode;
use crate::core::probe::ProbeStream;
use crate::core::state::NodeId;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::Framed;

pub struct PcpClient {
    framed: Framed<ProbeStream, PcpCodec>,
}

impl PcpClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self, PoolError> {
        let stream = if host.starts_with('/') {
            let path = format!("{host}/.s.PGSQL.{port}");
            ProbeStream::Unix(UnixStream::connect(&path).await.map_err(|e| {
                PoolError::Transport(format!("cannot connect to {path}: {e}"))
            })?)
        } else {
            ProbeStream::Tcp(TcpStream::connect((host, port)).await.map_err(|e| {
                PoolError::Transport(format!("cannot connect to {host}:{port}: {e}"))
            })?)
        };
        Ok(Self {
            framed: Framed::new(stream, PcpCodec),
        })
    }

    /// The M/R handshake: fetch a salt, answer the challenge.
    pub async fn authenticate(&mut self, user: &str, password: &str) -> Result<(), PoolError> {
        self.framed.send(PcpFrame::new(b'M', Vec::new())).await?;
        let salt_frame = self.expect(b'm').await?;
        let salt: [u8; 4] = salt_frame
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| PoolError::Protocol("salt reply must carry 4 bytes".into()))?;
        let response = client_response(user, password, &salt);
        self.framed
            .send(PcpFrame::from_strings(b'R', &[user, &response]))
            .await?;
        self.expect(b'r').await?;
        Ok(())
    }

    // --- Informational requests ---

    pub async fn node_count(&mut self) -> Result<usize, PoolError> {
        self.framed.send(PcpFrame::new(b'L', Vec::new())).await?;
        let records = self.read_array(b'l').await?;
        records
            .first()
            .and_then(|r| r.first())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PoolError::Protocol("malformed node count reply".into()))
    }

    pub async fn node_info(&mut self, node: NodeId) -> Result<NodeInfoRow, PoolError> {
        self.framed
            .send(PcpFrame::from_strings(b'I', &[&node.to_string()]))
            .await?;
        let records = self.read_array(b'i').await?;
        let record = records
            .first()
            .ok_or_else(|| PoolError::Protocol("empty node info reply".into()))?;
        NodeInfoRow::from_payload(record)
    }

    pub async fn health_check_stats(
        &mut self,
        node: NodeId,
    ) -> Result<HealthStatsRow, PoolError> {
        self.framed
            .send(PcpFrame::from_strings(b'H', &[&node.to_string()]))
            .await?;
        let records = self.read_array(b'h').await?;
        let record = records
            .first()
            .ok_or_else(|| PoolError::Protocol("empty health stats reply".into()))?;
        HealthStatsRow::from_payload(record)
    }

    pub async fn proc_count(&mut self) -> Result<Vec<u64>, PoolError> {
        self.framed.send(PcpFrame::new(b'N', Vec::new())).await?;
        let records = self.read_array(b'n').await?;
        Ok(records
            .iter()
            .filter_map(|r| r.first())
            .filter_map(|s| s.parse().ok())
            .collect())
    }

    pub async fn proc_info(&mut self, worker: Option<u64>) -> Result<Vec<ProcInfoRow>, PoolError> {
        let id = worker.unwrap_or(0).to_string();
        self.framed
            .send(PcpFrame::from_strings(b'P', &[&id]))
            .await?;
        let records = self.read_array(b'p').await?;
        records.iter().map(|r| ProcInfoRow::from_payload(r)).collect()
    }

    pub async fn pool_status(&mut self) -> Result<Vec<(String, String, String)>, PoolError> {
        self.framed.send(PcpFrame::new(b'B', Vec::new())).await?;
        let records = self.read_array(b'b').await?;
        records
            .into_iter()
            .map(|r| {
                let mut it = r.into_iter();
                match (it.next(), it.next(), it.next()) {
                    (Some(name), Some(value), Some(desc)) => Ok((name, value, desc)),
                    _ => Err(PoolError::Protocol("malformed pool status record".into())),
                }
            })
            .collect()
    }

    /// The watchdog reply payload is JSON carrying an array of node
    /// descriptors.
    pub async fn watchdog_info(
        &mut self,
        wd_id: Option<u32>,
    ) -> Result<serde_json::Value, PoolError> {
        let id = wd_id.map(|i| i.to_string()).unwrap_or_default();
        self.framed
            .send(PcpFrame::from_strings(b'W', &[&id]))
            .await?;
        let records = self.read_array(b'w').await?;
        let payload = records
            .first()
            .and_then(|r| r.first())
            .ok_or_else(|| PoolError::Protocol("empty watchdog info reply".into()))?;
        Ok(serde_json::from_str(payload)?)
    }

    // --- Mutating requests ---

    pub async fn attach_node(&mut self, node: NodeId) -> Result<(), PoolError> {
        self.framed
            .send(PcpFrame::from_strings(b'C', &[&node.to_string()]))
            .await?;
        self.expect(b'c').await.map(|_| ())
    }

    pub async fn detach_node(&mut self, node: NodeId, graceful: bool) -> Result<(), PoolError> {
        let tos = if graceful { b'd' } else { b'D' };
        self.framed
            .send(PcpFrame::from_strings(tos, &[&node.to_string()]))
            .await?;
        self.expect(b'd').await.map(|_| ())
    }

    pub async fn promote_node(
        &mut self,
        node: NodeId,
        graceful: bool,
        switchover: bool,
    ) -> Result<(), PoolError> {
        let tos = if graceful { b'j' } else { b'J' };
        let payload = format!("{node} {}", if switchover { "s" } else { "n" });
        self.framed
            .send(PcpFrame::from_strings(tos, &[&payload]))
            .await?;
        self.expect(b'd').await.map(|_| ())
    }

    pub async fn recovery_node(&mut self, node: NodeId) -> Result<(), PoolError> {
        self.framed
            .send(PcpFrame::from_strings(b'O', &[&node.to_string()]))
            .await?;
        self.expect(b'c').await.map(|_| ())
    }

    pub async fn shutdown(&mut self, mode: ShutdownMode, cluster: bool) -> Result<(), PoolError> {
        let tos = if cluster { b'T' } else { b't' };
        let mode = match mode {
            ShutdownMode::Smart => "s",
            ShutdownMode::Fast => "f",
            ShutdownMode::Immediate => "i",
        };
        self.framed.send(PcpFrame::from_strings(tos, &[mode])).await?;
        self.expect(b't').await.map(|_| ())
    }

    pub async fn reload_config(&mut self, cluster: bool) -> Result<(), PoolError> {
        let scope = if cluster { "c" } else { "l" };
        self.framed
            .send(PcpFrame::from_strings(b'Z', &[scope]))
            .await?;
        self.expect(b'z').await.map(|_| ())
    }

    pub async fn set_parameter(&mut self, name: &str, value: &str) -> Result<(), PoolError> {
        self.framed
            .send(PcpFrame::from_strings(b'A', &[name, value]))
            .await?;
        self.expect(b'a').await.map(|_| ())
    }

    /// Sends the close request and drops the connection.
    pub async fn close(mut self) {
        let _ = self.framed.send(PcpFrame::new(b'X', Vec::new())).await;
    }

    // --- Reply plumbing ---

    async fn read_frame(&mut self) -> Result<PcpFrame, PoolError> {
        loop {
            match self.framed.next().await {
                Some(Ok(frame)) => {
                    if frame.tos == b'N' {
                        // Server-initiated notice; informational only.
                        continue;
                    }
                    if frame.tos == b'E' {
                        let (severity, message, detail) =
                            parse_error_payload(&frame.payload);
                        let text = match detail {
                            Some(detail) => format!("{severity}: {message} ({detail})"),
                            None => format!("{severity}: {message}"),
                        };
                        return Err(PoolError::Backend(text));
                    }
                    return Ok(frame);
                }
                Some(Err(e)) => return Err(e),
                None => return Err(PoolError::UnexpectedEof),
            }
        }
    }

    /// Reads one frame and insists on the expected reply ToS.
    async fn expect(&mut self, tos: u8) -> Result<PcpFrame, PoolError> {
        let frame = self.read_frame().await?;
        if frame.tos != tos {
            return Err(PoolError::Protocol(format!(
                "expected reply '{}', got '{}'",
                tos as char, frame.tos as char
            )));
        }
        Ok(frame)
    }

    /// Reads `[ArraySize, record*, CommandComplete]` and returns the records.
    async fn read_array(&mut self, tos: u8) -> Result<Vec<Vec<String>>, PoolError> {
        let header = self.expect(tos).await?;
        let strings = header.strings();
        let count: usize = match strings.as_slice() {
            [tag, count, ..] if tag == "ArraySize" => count
                .parse()
                .map_err(|_| PoolError::Protocol("malformed ArraySize".into()))?,
            _ => {
                return Err(PoolError::Protocol(
                    "array reply must start with ArraySize".into(),
                ));
            }
        };
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let frame = self.expect(tos).await?;
            records.push(frame.strings());
        }
        let terminator = self.expect(tos).await?;
        if terminator.strings().first().map(|s| s.as_str()) != Some("CommandComplete") {
            return Err(PoolError::Protocol(
                "array reply must end with CommandComplete".into(),
            ));
        }
        Ok(records)
    }
}
