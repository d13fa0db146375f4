use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use writeguard_core::{
    FileModeEnforcer, GuardConfig, HeartbeatSupervisor, LockReport, PermissionLedger,
    ProtectedScopeResolver, ProtectionGate,
};

const DEFAULT_CONFIG_PATH: &str = "writeguard.toml";

#[derive(Debug, Parser)]
#[command(name = "writeguard", version, about = "Time-boxed write-access guard")]
struct Cli {
    /// Path to the TOML configuration
    #[arg(long, global = true, env = "WRITEGUARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the guard, reading monitoring commands from stdin
    Run,
    /// Write-lock every file under the protected roots and exit
    Lock,
    /// Print audit events from the ledger as JSON lines
    Audit {
        /// Maximum number of recent events
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only events for this file
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::Lock => lock(&config),
        Commands::Audit { limit, path } => audit(&config, limit, path),
        Commands::ShowConfig => serde_json::to_string_pretty(&config)
            .map(|s| println!("{}", s))
            .map_err(|e| e.to_string()),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// An explicit path must load cleanly; the implicit default may fall back.
fn load_config(path: Option<&PathBuf>) -> writeguard_core::Result<GuardConfig> {
    match path {
        Some(path) => GuardConfig::load(path),
        None => Ok(GuardConfig::load_or_default(DEFAULT_CONFIG_PATH)),
    }
}

async fn run(config: GuardConfig) -> Result<(), String> {
    let gate = tokio::task::spawn_blocking(move || ProtectionGate::new(config))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
    let gate = Arc::new(gate);
    let supervisor = HeartbeatSupervisor::spawn(gate.clone());

    info!(
        "Guarding {} root(s); waiting for commands on stdin",
        gate.protected_roots().len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let gate = gate.clone();
                        let response = tokio::task::spawn_blocking(move || handle_command(&gate, &line))
                            .await
                            .unwrap_or_else(|e| json!({ "ok": false, "error": e.to_string() }));
                        println!("{}", response);
                    }
                    Ok(None) => {
                        info!("Input closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to read command: {}", e);
                        break;
                    }
                }
            }
        }
    }

    supervisor.shutdown().await.map_err(|e| e.to_string())
}

/// Execute one line of the monitoring protocol and describe the outcome.
fn handle_command(gate: &ProtectionGate, line: &str) -> Value {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let outcome: Result<Value, String> = match parts.as_slice() {
        ["heartbeat"] => Ok(json!({ "previous": gate.heartbeat() })),
        ["grant", path, task_id, agent] => gate
            .grant_permission(path, task_id, agent, None)
            .map(|granted| json!({ "granted": granted }))
            .map_err(|e| e.to_string()),
        ["grant", path, task_id, agent, ttl] => match ttl.parse::<u64>() {
            Ok(secs) => gate
                .grant_permission(path, task_id, agent, Some(Duration::from_secs(secs)))
                .map(|granted| json!({ "granted": granted }))
                .map_err(|e| e.to_string()),
            Err(_) => Err(format!("Invalid TTL: {}", ttl)),
        },
        ["revoke", path] => gate
            .revoke_permission(path, None)
            .map(|revoked| json!({ "revoked": revoked }))
            .map_err(|e| e.to_string()),
        ["revoke", path, task_id] => gate
            .revoke_permission(path, Some(task_id))
            .map(|revoked| json!({ "revoked": revoked }))
            .map_err(|e| e.to_string()),
        ["check", path] => serde_json::to_value(gate.check_permission(path)).map_err(|e| e.to_string()),
        ["cleanup"] => {
            let report = gate.cleanup_expired();
            let failures: Vec<Value> = report
                .failures
                .iter()
                .map(|(path, reason)| json!({ "path": path, "error": reason }))
                .collect();
            Ok(json!({ "expired": report.expired, "failures": failures }))
        }
        ["status"] => serde_json::to_value(gate.get_status()).map_err(|e| e.to_string()),
        ["lockdown"] => Ok(match gate.enter_lockdown() {
            Some(report) => json!({
                "locked_down": true,
                "grants_cleared": report.grants_cleared,
                "files_locked": report.files.locked,
                "failures": report.files.failures.len(),
            }),
            None => json!({ "locked_down": false }),
        }),
        _ => Err(format!("Unknown command: {}", line.trim())),
    };

    match outcome {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(e) => json!({ "ok": false, "error": e }),
    }
}

fn lock(config: &GuardConfig) -> Result<(), String> {
    let scope = ProtectedScopeResolver::new(&config.protected_roots);
    let enforcer = FileModeEnforcer::from_config(config);

    let mut report = LockReport::default();
    for root in scope.roots() {
        info!("Locking {:?}", root);
        report.merge(enforcer.lock_tree(root));
    }

    println!(
        "Locked {} file(s), skipped {}, {} failure(s)",
        report.locked,
        report.skipped,
        report.failures.len()
    );
    match report.failure_summary() {
        None => Ok(()),
        Some(summary) => Err(summary),
    }
}

fn audit(config: &GuardConfig, limit: usize, path: Option<PathBuf>) -> Result<(), String> {
    let ledger = PermissionLedger::open(&config.ledger_path).map_err(|e| e.to_string())?;
    let events = match path {
        Some(path) => {
            let canonical = ProtectedScopeResolver::new(&config.protected_roots).canonicalize(&path);
            ledger.events_for_path(&canonical)
        }
        None => ledger.recent_events(limit),
    }
    .map_err(|e| e.to_string())?;

    for event in events {
        println!("{}", serde_json::to_string(&event).map_err(|e| e.to_string())?);
    }
    Ok(())
}
