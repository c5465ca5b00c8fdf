// src/core/pcp/report.rs

//! Typed reply records shared by the control protocol server and client, so
//! both sides agree byte-for-byte on the payload layout.

use crate::connection::SessionSlot;
use crate::core::errors::PoolError;
use crate::core::state::{
    BackendRole, BackendSnapshot, BackendStatus, HealthCheckStats, NodeId,
};
use chrono::{DateTime, Utc};

/// The ctime-style rendering used for timestamps in reply payloads.
pub fn format_ctime(ts: DateTime<Utc>) -> String {
    ts.format("%a %b %e %H:%M:%S %Y").to_string()
}

fn format_opt_ctime(ts: Option<DateTime<Utc>>) -> String {
    ts.map(format_ctime).unwrap_or_default()
}

/// Numeric status code as carried on the wire.
pub fn status_code(status: BackendStatus) -> u8 {
    match status {
        BackendStatus::Unused => 0,
        BackendStatus::ConnectWait => 1,
        BackendStatus::Up => 2,
        BackendStatus::Down => 3,
    }
}

/// Operator-facing status names.
pub fn status_name(status: BackendStatus) -> &'static str {
    match status {
        BackendStatus::Unused => "Connection Unused",
        BackendStatus::ConnectWait => "Connection in Waiting",
        BackendStatus::Up => "Connection in use",
        BackendStatus::Down => "Disconnected",
    }
}

pub fn role_code(role: BackendRole) -> u8 {
    match role {
        BackendRole::Main => 0,
        BackendRole::Replica => 1,
        BackendRole::Primary => 2,
        BackendRole::Standby => 3,
    }
}

pub fn role_name(role: BackendRole) -> &'static str {
    match role {
        BackendRole::Main => "main",
        BackendRole::Replica => "replica",
        BackendRole::Primary => "primary",
        BackendRole::Standby => "standby",
    }
}

/// The node-info record: thirteen strings, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfoRow {
    pub hostname: String,
    pub port: String,
    pub status: String,
    pub quarantine: String,
    pub status_name: String,
    pub weight: String,
    pub role: String,
    pub role_name: String,
    pub standby_delay_by_time: String,
    pub standby_delay: String,
    pub replication_state: String,
    pub replication_sync_state: String,
    pub last_status_change: String,
}

impl NodeInfoRow {
    pub fn from_snapshot(snapshot: &BackendSnapshot) -> Self {
        let record = &snapshot.record;
        Self {
            hostname: snapshot.desc.hostname.clone(),
            port: snapshot.desc.port.to_string(),
            status: status_code(record.status).to_string(),
            quarantine: u8::from(record.quarantine).to_string(),
            status_name: status_name(record.status).to_string(),
            weight: format!("{:.6}", snapshot.desc.weight),
            role: role_code(record.role).to_string(),
            role_name: role_name(record.role).to_string(),
            standby_delay_by_time: u8::from(record.delay_by_time).to_string(),
            standby_delay: record.standby_delay.to_string(),
            replication_state: record.replication_state.clone(),
            replication_sync_state: record.replication_sync_state.clone(),
            last_status_change: format_ctime(record.status_changed_at),
        }
    }

    pub fn to_payload(&self) -> Vec<String> {
        vec![
            self.hostname.clone(),
            self.port.clone(),
            self.status.clone(),
            self.quarantine.clone(),
            self.status_name.clone(),
            self.weight.clone(),
            self.role.clone(),
            self.role_name.clone(),
            self.standby_delay_by_time.clone(),
            self.standby_delay.clone(),
            self.replication_state.clone(),
            self.replication_sync_state.clone(),
            self.last_status_change.clone(),
        ]
    }

    pub fn from_payload(strings: &[String]) -> Result<Self, PoolError> {
        if strings.len() != 13 {
            return Err(PoolError::Protocol(format!(
                "node info record has {} fields, expected 13",
                strings.len()
            )));
        }
        let mut it = strings.iter().cloned();
        Ok(Self {
            hostname: it.next().unwrap(),
            port: it.next().unwrap(),
            status: it.next().unwrap(),
            quarantine: it.next().unwrap(),
            status_name: it.next().unwrap(),
            weight: it.next().unwrap(),
            role: it.next().unwrap(),
            role_name: it.next().unwrap(),
            standby_delay_by_time: it.next().unwrap(),
            standby_delay: it.next().unwrap(),
            replication_state: it.next().unwrap(),
            replication_sync_state: it.next().unwrap(),
            last_status_change: it.next().unwrap(),
        })
    }
}

/// The process-info record for one session worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcInfoRow {
    pub worker_id: String,
    pub database: String,
    pub username: String,
    pub start_time: String,
    pub client_connection_count: String,
    pub status: String,
    pub pooled_connections: String,
    pub load_balance_node: String,
}

impl ProcInfoRow {
    pub fn from_slot(slot: &SessionSlot) -> Self {
        Self {
            worker_id: slot.worker_id.to_string(),
            database: slot.database.clone(),
            username: slot.user.clone(),
            start_time: format_ctime(slot.started_at),
            client_connection_count: slot.client_connection_count.to_string(),
            status: slot.status.to_string(),
            pooled_connections: slot.pooled_connections.to_string(),
            load_balance_node: slot.load_balance_node.to_string(),
        }
    }

    pub fn to_payload(&self) -> Vec<String> {
        vec![
            self.worker_id.clone(),
            self.database.clone(),
            self.username.clone(),
            self.start_time.clone(),
            self.client_connection_count.clone(),
            self.status.clone(),
            self.pooled_connections.clone(),
            self.load_balance_node.clone(),
        ]
    }

    pub fn from_payload(strings: &[String]) -> Result<Self, PoolError> {
        if strings.len() != 8 {
            return Err(PoolError::Protocol(format!(
                "process info record has {} fields, expected 8",
                strings.len()
            )));
        }
        let mut it = strings.iter().cloned();
        Ok(Self {
            worker_id: it.next().unwrap(),
            database: it.next().unwrap(),
            username: it.next().unwrap(),
            start_time: it.next().unwrap(),
            client_connection_count: it.next().unwrap(),
            status: it.next().unwrap(),
            pooled_connections: it.next().unwrap(),
            load_balance_node: it.next().unwrap(),
        })
    }
}

/// The health-check statistics record for one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatsRow {
    pub node_id: String,
    pub hostname: String,
    pub port: String,
    pub status: String,
    pub role: String,
    pub last_status_change: String,
    pub total_count: String,
    pub success_count: String,
    pub fail_count: String,
    pub skip_count: String,
    pub retry_count: String,
    pub average_retry_count: String,
    pub max_retry_count: String,
    pub max_duration: String,
    pub min_duration: String,
    pub average_duration: String,
    pub last_health_check: String,
    pub last_successful_health_check: String,
    pub last_skip_health_check: String,
    pub last_failed_health_check: String,
}

impl HealthStatsRow {
    pub fn build(
        node_id: NodeId,
        snapshot: &BackendSnapshot,
        stats: &HealthCheckStats,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            hostname: snapshot.desc.hostname.clone(),
            port: snapshot.desc.port.to_string(),
            status: status_name(snapshot.record.status).to_string(),
            role: role_name(snapshot.record.role).to_string(),
            last_status_change: format_ctime(snapshot.record.status_changed_at),
            total_count: stats.total_count.to_string(),
            success_count: stats.success_count.to_string(),
            fail_count: stats.fail_count.to_string(),
            skip_count: stats.skip_count.to_string(),
            retry_count: stats.retry_count.to_string(),
            average_retry_count: format!("{:.6}", stats.average_retry_count()),
            max_retry_count: stats.max_retry_count.to_string(),
            max_duration: stats.max_duration_ms.to_string(),
            min_duration: stats.min_duration_ms.to_string(),
            average_duration: format!("{:.3}", stats.average_duration_ms()),
            last_health_check: format_opt_ctime(stats.last_health_check),
            last_successful_health_check: format_opt_ctime(stats.last_successful_health_check),
            last_skip_health_check: format_opt_ctime(stats.last_skip_health_check),
            last_failed_health_check: format_opt_ctime(stats.last_failed_health_check),
        }
    }

    pub fn to_payload(&self) -> Vec<String> {
        vec![
            self.node_id.clone(),
            self.hostname.clone(),
            self.port.clone(),
            self.status.clone(),
            self.role.clone(),
            self.last_status_change.clone(),
            self.total_count.clone(),
            self.success_count.clone(),
            self.fail_count.clone(),
            self.skip_count.clone(),
            self.retry_count.clone(),
            self.average_retry_count.clone(),
            self.max_retry_count.clone(),
            self.max_duration.clone(),
            self.min_duration.clone(),
            self.average_duration.clone(),
            self.last_health_check.clone(),
            self.last_successful_health_check.clone(),
            self.last_skip_health_check.clone(),
            self.last_failed_health_check.clone(),
        ]
    }

    pub fn from_payload(strings: &[String]) -> Result<Self, PoolError> {
        if strings.len() != 20 {
            return Err(PoolError::Protocol(format!(
                "health stats record has {} fields, expected 20",
                strings.len()
            )));
        }
        let mut it = strings.iter().cloned();
        Ok(Self {
            node_id: it.next().unwrap(),
            hostname: it.next().unwrap(),
            port: it.next().unwrap(),
            status: it.next().unwrap(),
            role: it.next().unwrap(),
            last_status_change: it.next().unwrap(),
            total_count: it.next().unwrap(),
            success_count: it.next().unwrap(),
            fail_count: it.next().unwrap(),
            skip_count: it.next().unwrap(),
            retry_count: it.next().unwrap(),
            average_retry_count: it.next().unwrap(),
            max_retry_count: it.next().unwrap(),
            max_duration: it.next().unwrap(),
            min_duration: it.next().unwrap(),
            average_duration: it.next().unwrap(),
            last_health_check: it.next().unwrap(),
            last_successful_health_check: it.next().unwrap(),
            last_skip_health_check: it.next().unwrap(),
            last_failed_health_check: it.next().unwrap(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{BackendDesc, BackendRecord};

    fn snapshot() -> BackendSnapshot {
        BackendSnapshot {
            node_id: 0,
            desc: BackendDesc {
                hostname: "db0".into(),
                port: 5432,
                weight: 1.0,
                data_directory: "/data".into(),
                flags: vec![],
            },
            record: BackendRecord::new(BackendStatus::Up),
        }
    }

    #[test]
    fn node_info_row_round_trips() {
        let row = NodeInfoRow::from_snapshot(&snapshot());
        assert_eq!(row.status, "2");
        assert_eq!(row.status_name, "Connection in use");
        assert_eq!(row.weight, "1.000000");
        let decoded = NodeInfoRow::from_payload(&row.to_payload()).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn health_stats_row_round_trips() {
        let mut stats = HealthCheckStats::default();
        stats.record_start();
        stats.record_success(12);
        let row = HealthStatsRow::build(0, &snapshot(), &stats);
        assert_eq!(row.total_count, "1");
        assert_eq!(row.average_duration, "12.000");
        let decoded = HealthStatsRow::from_payload(&row.to_payload()).unwrap();
        assert_eq!(decoded, row);
    }
}
