// src/core/failover/command.rs

//! Expansion and execution of operator-supplied failover, failback and
//! follow-primary commands.

use crate::core::errors::PoolError;
use crate::core::state::{NO_NODE, NodeId};
use async_trait::async_trait;
use tracing::{info, warn};

/// Everything a command template may reference.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// The node the command is about.
    pub node_id: NodeId,
    pub hostname: String,
    pub port: u16,
    pub data_directory: String,
    pub new_main_id: NodeId,
    pub new_main_host: String,
    pub new_main_port: u16,
    pub new_main_dir: String,
    pub old_main_id: NodeId,
    pub old_primary_id: NodeId,
    pub old_primary_host: String,
    pub old_primary_port: u16,
}

fn id_str(id: NodeId) -> String {
    id.to_string()
}

fn port_str(id: NodeId, port: u16) -> String {
    // A port only makes sense when the node exists.
    if id == NO_NODE && port == 0 {
        String::new()
    } else {
        port.to_string()
    }
}

/// Expands the documented `%`-escape grammar. Unknown escapes expand to the
/// empty string; `%%` is a literal percent.
pub fn expand(template: &str, ctx: &SubstitutionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => out.push_str(&port_str(ctx.node_id, ctx.port)),
            Some('h') => out.push_str(&ctx.hostname),
            Some('d') => out.push_str(&id_str(ctx.node_id)),
            Some('D') => out.push_str(&ctx.data_directory),
            Some('m') => out.push_str(&id_str(ctx.new_main_id)),
            Some('H') => out.push_str(&ctx.new_main_host),
            Some('r') => out.push_str(&port_str(ctx.new_main_id, ctx.new_main_port)),
            Some('R') => out.push_str(&ctx.new_main_dir),
            Some('M') => out.push_str(&id_str(ctx.old_main_id)),
            Some('P') => out.push_str(&id_str(ctx.old_primary_id)),
            Some('N') => out.push_str(&ctx.old_primary_host),
            Some('S') => out.push_str(&port_str(ctx.old_primary_id, ctx.old_primary_port)),
            Some('%') => out.push('%'),
            // Unknown escapes contribute nothing to the command line.
            Some(_) => {}
            None => {}
        }
    }
    out
}

/// Runs expanded command lines. A trait seam so the engine can be driven in
/// tests without forking shells.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command_line: &str) -> Result<(), PoolError>;
}

/// The production runner: hand the line to the shell, wait, log the outcome.
#[derive(Debug, Default)]
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command_line: &str) -> Result<(), PoolError> {
        if command_line.trim().is_empty() {
            return Ok(());
        }
        info!("executing command: {}", command_line);
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .status()
            .await
            .map_err(|e| PoolError::Backend(format!("cannot spawn command: {e}")))?;
        if !status.success() {
            warn!(
                "command exited with status {:?}: {}",
                status.code(),
                command_line
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SubstitutionContext {
        SubstitutionContext {
            node_id: 1,
            hostname: "db1".into(),
            port: 5433,
            data_directory: "/data/1".into(),
            new_main_id: 2,
            new_main_host: "db2".into(),
            new_main_port: 5434,
            new_main_dir: "/data/2".into(),
            old_main_id: 0,
            old_primary_id: 0,
            old_primary_host: "db0".into(),
            old_primary_port: 5432,
        }
    }

    #[test]
    fn all_escapes_expand() {
        let out = expand("%d %h:%p %D | new %m %H:%r %R | old %M %P %N:%S | 100%%", &ctx());
        assert_eq!(
            out,
            "1 db1:5433 /data/1 | new 2 db2:5434 /data/2 | old 0 0 db0:5432 | 100%"
        );
    }

    #[test]
    fn unknown_escape_is_empty() {
        assert_eq!(expand("a%qb", &ctx()), "ab");
        assert_eq!(expand("trailing%", &ctx()), "trailing");
    }
}
