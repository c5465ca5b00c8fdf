// src/bin/pgflock_ctl.rs

//! The operator CLI: one subcommand per control-protocol operation, plus the
//! password tooling (`md5-hash`, `enc`) for maintaining the password store.

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser, Subcommand};
use pgflock::core::auth::{keyfile, md5, passwd};
use pgflock::core::events::ShutdownMode;
use pgflock::core::state::NodeId;
use pgflock::pcp::PcpClient;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "pgflock-ctl",
    version,
    about = "pgflock administration tool",
    disable_help_flag = true
)]
struct Cli {
    /// pgflock host (or unix socket directory) to connect to.
    #[arg(short = 'h', long = "host", default_value = "127.0.0.1", global = true)]
    host: String,

    /// PCP port number.
    #[arg(short = 'p', long = "port", default_value_t = 9898, global = true)]
    port: u16,

    /// PCP user name.
    #[arg(short = 'U', long = "username", default_value = "admin", global = true)]
    username: String,

    /// Never prompt for a password.
    #[arg(short = 'w', long = "no-password", global = true)]
    no_password: bool,

    /// Force a password prompt.
    #[arg(short = 'W', long = "password", global = true)]
    force_password: bool,

    /// Verbose output.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Debug output.
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    #[arg(long = "help", action = ArgAction::Help, global = true)]
    help: Option<bool>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the number of configured backends.
    #[command(disable_help_flag = true)]
    NodeCount,
    /// Show one backend's state.
    #[command(disable_help_flag = true)]
    NodeInfo {
        #[arg(short = 'n', long = "node-id")]
        node_id: NodeId,
    },
    /// Show one backend's health check statistics.
    #[command(disable_help_flag = true)]
    HealthCheckStats {
        #[arg(short = 'n', long = "node-id")]
        node_id: NodeId,
    },
    /// Show the number of session workers.
    #[command(disable_help_flag = true)]
    ProcCount,
    /// Show session worker details.
    #[command(disable_help_flag = true)]
    ProcInfo {
        /// Restrict to one worker; all workers when omitted.
        #[arg(short = 'P', long = "process-id")]
        process_id: Option<u64>,
        /// Show every worker.
        #[arg(short = 'a', long = "all")]
        all: bool,
    },
    /// Show pool configuration parameters.
    #[command(disable_help_flag = true)]
    PoolStatus,
    /// Show watchdog cluster information.
    #[command(disable_help_flag = true)]
    WatchdogInfo {
        /// Watchdog node id; the local view when omitted.
        wd_id: Option<u32>,
    },
    /// Attach (fail back) a backend.
    #[command(disable_help_flag = true)]
    AttachNode {
        #[arg(short = 'n', long = "node-id")]
        node_id: NodeId,
    },
    /// Detach a backend.
    #[command(disable_help_flag = true)]
    DetachNode {
        #[arg(short = 'n', long = "node-id")]
        node_id: NodeId,
        /// Graceful detach (planned switchover).
        #[arg(short = 'g', long = "gracefully")]
        graceful: bool,
    },
    /// Promote a standby to primary.
    #[command(disable_help_flag = true)]
    PromoteNode {
        #[arg(short = 'n', long = "node-id")]
        node_id: NodeId,
        #[arg(short = 'g', long = "gracefully")]
        graceful: bool,
        /// Detach the current primary as part of the promotion.
        #[arg(short = 's', long = "switchover")]
        switchover: bool,
    },
    /// Run on-line recovery for a backend.
    #[command(disable_help_flag = true)]
    RecoveryNode {
        #[arg(short = 'n', long = "node-id")]
        node_id: NodeId,
    },
    /// Stop the pool.
    #[command(disable_help_flag = true)]
    Stop {
        /// Shutdown mode: s(mart), f(ast) or i(mmediate).
        #[arg(short = 'm', long = "mode", default_value = "s")]
        mode: String,
        /// Scope: l(ocal) or c(luster).
        #[arg(short = 's', long = "scope", default_value = "l")]
        scope: String,
    },
    /// Reload the pool configuration.
    #[command(disable_help_flag = true)]
    ReloadConfig {
        /// Scope: l(ocal) or c(luster).
        #[arg(short = 's', long = "scope", default_value = "l")]
        scope: String,
    },
    /// Produce an MD5 password hash, optionally updating the password store.
    #[command(disable_help_flag = true)]
    Md5Hash {
        /// The password; prompted for when omitted.
        password: Option<String>,
        /// Hash in the user-salted form used by md5 authentication.
        #[arg(short = 'u', long = "username")]
        username: Option<String>,
        /// Update this password store file instead of printing.
        #[arg(short = 'f', long = "passwd-file")]
        passwd_file: Option<PathBuf>,
    },
    /// Produce an AES-wrapped password entry using the pool key file.
    #[command(disable_help_flag = true)]
    Enc {
        /// The password; prompted for when omitted.
        password: Option<String>,
        /// User to store the entry under.
        #[arg(short = 'u', long = "username")]
        username: Option<String>,
        /// Key file; the default search applies when omitted.
        #[arg(short = 'K', long = "key-file")]
        key_file: Option<String>,
        /// Update this password store file instead of printing.
        #[arg(short = 'f', long = "passwd-file")]
        passwd_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Md5Hash {
            password,
            username,
            passwd_file,
        } => return md5_hash(password.clone(), username.clone(), passwd_file.clone()),
        Command::Enc {
            password,
            username,
            key_file,
            passwd_file,
        } => {
            return enc(
                password.clone(),
                username.clone(),
                key_file.clone(),
                passwd_file.clone(),
            );
        }
        _ => {}
    }

    let password = resolve_password(&cli)?;
    if cli.debug {
        eprintln!("connecting to {}:{}", cli.host, cli.port);
    }
    let mut client = PcpClient::connect(&cli.host, cli.port).await?;
    client.authenticate(&cli.username, &password).await?;
    if cli.verbose {
        eprintln!("connected to {}:{} as {}", cli.host, cli.port, cli.username);
    }

    match cli.command {
        Command::NodeCount => {
            let count = client.node_count().await?;
            println!("{count}");
        }
        Command::NodeInfo { node_id } => {
            let info = client.node_info(node_id).await?;
            if cli.verbose {
                println!("Hostname               : {}", info.hostname);
                println!("Port                   : {}", info.port);
                println!("Status                 : {} ({})", info.status, info.status_name);
                println!("Quarantine             : {}", info.quarantine);
                println!("Weight                 : {}", info.weight);
                println!("Role                   : {}", info.role_name);
                println!("Replication Delay      : {}", info.standby_delay);
                println!("Replication State      : {}", info.replication_state);
                println!("Replication Sync State : {}", info.replication_sync_state);
                println!("Last Status Change     : {}", info.last_status_change);
            } else {
                println!(
                    "{} {} {} {} {} {} {} {} {} {}",
                    info.hostname,
                    info.port,
                    info.status,
                    info.weight,
                    info.status_name,
                    info.role_name,
                    info.standby_delay,
                    info.replication_state,
                    info.replication_sync_state,
                    info.last_status_change
                );
            }
        }
        Command::HealthCheckStats { node_id } => {
            let stats = client.health_check_stats(node_id).await?;
            println!("Node Id                      : {}", stats.node_id);
            println!("Host Name                    : {}", stats.hostname);
            println!("Port                         : {}", stats.port);
            println!("Status                       : {}", stats.status);
            println!("Role                         : {}", stats.role);
            println!("Last Status Change           : {}", stats.last_status_change);
            println!("Total Count                  : {}", stats.total_count);
            println!("Success Count                : {}", stats.success_count);
            println!("Fail Count                   : {}", stats.fail_count);
            println!("Skip Count                   : {}", stats.skip_count);
            println!("Retry Count                  : {}", stats.retry_count);
            println!("Average Retry Count          : {}", stats.average_retry_count);
            println!("Max Retry Count              : {}", stats.max_retry_count);
            println!("Max Duration (ms)            : {}", stats.max_duration);
            println!("Min Duration (ms)            : {}", stats.min_duration);
            println!("Average Duration (ms)        : {}", stats.average_duration);
            println!("Last Health Check            : {}", stats.last_health_check);
            println!("Last Successful Health Check : {}", stats.last_successful_health_check);
            println!("Last Skip Health Check       : {}", stats.last_skip_health_check);
            println!("Last Failed Health Check     : {}", stats.last_failed_health_check);
        }
        Command::ProcCount => {
            let workers = client.proc_count().await?;
            let ids: Vec<String> = workers.iter().map(|w| w.to_string()).collect();
            println!("{}", ids.join(" "));
        }
        Command::ProcInfo { process_id, all } => {
            let wanted = if all { None } else { process_id };
            for row in client.proc_info(wanted).await? {
                println!(
                    "{} {} {} {} {} {} {} {}",
                    row.worker_id,
                    row.database,
                    row.username,
                    row.start_time,
                    row.client_connection_count,
                    row.status,
                    row.pooled_connections,
                    row.load_balance_node
                );
            }
        }
        Command::PoolStatus => {
            for (name, value, description) in client.pool_status().await? {
                println!("name : {name}");
                println!("value: {value}");
                println!("desc : {description}");
                println!();
            }
        }
        Command::WatchdogInfo { wd_id } => {
            let info = client.watchdog_info(wd_id).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::AttachNode { node_id } => {
            client.attach_node(node_id).await?;
            println!("attach-node -- command successful");
        }
        Command::DetachNode { node_id, graceful } => {
            client.detach_node(node_id, graceful).await?;
            println!("detach-node -- command successful");
        }
        Command::PromoteNode {
            node_id,
            graceful,
            switchover,
        } => {
            client.promote_node(node_id, graceful, switchover).await?;
            println!("promote-node -- command successful");
        }
        Command::RecoveryNode { node_id } => {
            client.recovery_node(node_id).await?;
            println!("recovery-node -- command successful");
        }
        Command::Stop { mode, scope } => {
            let mode = parse_mode(&mode)?;
            client.shutdown(mode, scope == "c").await?;
            println!("stop -- command successful");
        }
        Command::ReloadConfig { scope } => {
            client.reload_config(scope == "c").await?;
            println!("reload-config -- command successful");
        }
        Command::Md5Hash { .. } | Command::Enc { .. } => unreachable!("handled above"),
    }

    client.close().await;
    Ok(())
}

fn parse_mode(mode: &str) -> Result<ShutdownMode> {
    match mode {
        "s" => Ok(ShutdownMode::Smart),
        "f" => Ok(ShutdownMode::Fast),
        "i" => Ok(ShutdownMode::Immediate),
        other => bail!("unknown shutdown mode \"{other}\" (expected s, f or i)"),
    }
}

/// Finds the PCP password: the password file first, then a prompt unless
/// prompting is disabled.
fn resolve_password(cli: &Cli) -> Result<String> {
    if !cli.force_password {
        if let Some(password) = passfile_lookup(&cli.host, cli.port, &cli.username) {
            return Ok(password);
        }
        if cli.no_password {
            return Ok(String::new());
        }
    }
    prompt(&format!("Password for {}: ", cli.username))
}

/// `~/.pcppass` format: `host:port:user:password`, `*` matching anything.
fn passfile_lookup(host: &str, port: u16, user: &str) -> Option<String> {
    let path = match std::env::var("PCPPASSFILE") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => Path::new(&std::env::var("HOME").ok()?).join(".pcppass"),
    };
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(4, ':').collect();
        if fields.len() != 4 {
            continue;
        }
        let matches = |pattern: &str, value: &str| pattern == "*" || pattern == value;
        if matches(fields[0], host) && matches(fields[1], &port.to_string()) && matches(fields[2], user)
        {
            return Some(fields[3].to_string());
        }
    }
    None
}

fn prompt(text: &str) -> Result<String> {
    eprint!("{text}");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("cannot read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn md5_hash(
    password: Option<String>,
    username: Option<String>,
    passwd_file: Option<PathBuf>,
) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => prompt("password: ")?,
    };
    let hash = match &username {
        Some(user) => md5::encrypt_password(&password, user),
        None => format!("md5{}", hex::encode(md5_digest(&password))),
    };
    match passwd_file {
        Some(path) => {
            let user = username.ok_or_else(|| anyhow!("-f requires -u <username>"))?;
            let mut store = passwd::PasswordStore::load(&path)?;
            store.upsert(passwd::PasswdEntry {
                user,
                secret: passwd::StoredSecret::parse(&hash),
                backend_user: None,
                backend_secret: None,
            })?;
            println!("password store updated");
        }
        None => println!("{hash}"),
    }
    Ok(())
}

fn md5_digest(password: &str) -> [u8; 16] {
    ::md5::compute(password.as_bytes()).0
}

fn enc(
    password: Option<String>,
    username: Option<String>,
    key_file: Option<String>,
    passwd_file: Option<PathBuf>,
) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => prompt("password: ")?,
    };
    let key_path = keyfile::locate(key_file.as_deref())
        .ok_or_else(|| anyhow!("no key file found; set PGFLOCKKEYFILE or pass -K"))?;
    let key = keyfile::read_key(&key_path)?;
    let entry = format!("{}{}", passwd::AES_PREFIX, keyfile::wrap(&password, &key));
    match passwd_file {
        Some(path) => {
            let user = username.ok_or_else(|| anyhow!("-f requires -u <username>"))?;
            let mut store = passwd::PasswordStore::load(&path)?;
            store.upsert(passwd::PasswdEntry {
                user,
                secret: passwd::StoredSecret::parse(&entry),
                backend_user: None,
                backend_secret: None,
            })?;
            println!("password store updated");
        }
        None => println!("{entry}"),
    }
    Ok(())
}
