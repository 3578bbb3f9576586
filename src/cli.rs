use crate::db;
use crate::s4_sync::{SyncRequest, scan_history};
use crate::s5_config::{self, GmemConfig};
use crate::s5_project;
use crate::s5_service::{self, ServiceSpec};
use crate::s5_supervisor;
use crate::GmemError;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gmem", version, about = "Turn-level knowledge-graph indexing for Claude Code sessions")]
pub struct Cli {
    /// Config file path
    #[arg(long, env = "GMEM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the indexing daemon in the foreground
    Daemon,
    /// Keep the daemon in the state the enable flag asks for
    Supervise,
    /// Set daemon.enabled = true
    Enable,
    /// Set daemon.enabled = false
    Disable,
    /// Show daemon and supervisor state
    Status,
    /// Index historical sessions (dry run unless --execute)
    Sync(SyncArgs),
    /// List episodes parked after failed submission
    Failed(FailedArgs),
    /// Manage the boot-time service registration
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
    /// Show how a path resolves to a project namespace
    Resolve {
        path: String,
    },
}

#[derive(Parser)]
pub struct SyncArgs {
    /// Queue episodes instead of only counting them
    #[arg(long)]
    pub execute: bool,

    /// Maximum episodes to queue (hard cap 500)
    #[arg(long, default_value = "50")]
    pub max_items: usize,

    /// Only this project (any path form)
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(Parser)]
pub struct FailedArgs {
    /// Re-queue the parked episode with this id
    #[arg(long)]
    pub retry: Option<i64>,

    #[arg(long, default_value = "20")]
    pub limit: usize,
}

#[derive(Subcommand)]
pub enum ServiceAction {
    Install,
    Uninstall,
    Status,
}

pub fn config_file(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(s5_config::config_path)
}

fn print_json(v: &Value) -> Result<(), GmemError> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

// --- Daemon API client ---

enum Api {
    Ok(Value),
    /// The daemon answered with an error envelope.
    Rejected { kind: String, message: String },
    /// Nothing is listening.
    Down(String),
}

fn api(config: &GmemConfig, method: &str, path: &str, body: Option<&Value>) -> Result<Api, GmemError> {
    let agent = ureq::Agent::new_with_config(
        ureq::config::Config::builder()
            .timeout_global(Some(Duration::from_secs(config.daemon.submit_timeout_secs.max(5) * 2)))
            .http_status_as_error(false)
            .build(),
    );
    let url = format!("{}{path}", config.daemon.base_url());
    let sent = match (method, body) {
        ("POST", Some(b)) => agent.post(&url).send_json(b),
        ("POST", None) => agent.post(&url).send_empty(),
        _ => agent.get(&url).call(),
    };
    let mut resp = match sent {
        Ok(r) => r,
        Err(e) => return Ok(Api::Down(e.to_string())),
    };
    let v: Value = resp
        .body_mut()
        .read_json()
        .map_err(|e| GmemError::Config(format!("daemon response: {e}")))?;
    if v["status"] == "ok" {
        Ok(Api::Ok(v["data"].clone()))
    } else {
        Ok(Api::Rejected {
            kind: v["error"]["kind"].as_str().unwrap_or("unknown").to_string(),
            message: v["error"]["message"].as_str().unwrap_or_default().to_string(),
        })
    }
}

fn rejected(kind: String, message: String) -> GmemError {
    GmemError::Config(format!("daemon rejected request ({kind}): {message}"))
}

// --- Handlers ---

pub fn handle_toggle(path: &Path, enabled: bool) -> Result<(), GmemError> {
    s5_config::set_enabled(path, enabled)?;
    let config = s5_config::load_config_from(path)?;
    println!(
        "daemon {} in {} (takes effect within {}ms)",
        if enabled { "enabled" } else { "disabled" },
        path.display(),
        config.daemon.poll_interval_ms
    );
    Ok(())
}

pub fn handle_status(config: &GmemConfig) -> Result<(), GmemError> {
    let supervisor = s5_supervisor::read_status(&s5_supervisor::status_path())?;
    let daemon = match api(config, "GET", "/api/status", None)? {
        Api::Ok(v) => v,
        Api::Rejected { kind, message } => json!({"error": kind, "message": message}),
        Api::Down(reason) => json!({"running": false, "reason": reason}),
    };
    let failed = match db::open_db(&crate::default_db_path()) {
        Ok(conn) => db::count_failed(&conn).ok(),
        Err(e) => {
            log::debug!("opening db for status: {e}");
            None
        }
    };
    print_json(&json!({
        "enabled": config.daemon.enabled,
        "endpoint": config.daemon.base_url(),
        "daemon": daemon,
        "supervisor": supervisor,
        "failed_episodes": failed,
    }))
}

pub fn handle_sync(config: &GmemConfig, args: &SyncArgs) -> Result<(), GmemError> {
    let request = json!({
        "dry_run": !args.execute,
        "max_items": args.max_items,
        "project": args.project,
    });
    match api(config, "POST", "/api/sync", Some(&request))? {
        Api::Ok(report) => print_json(&report),
        Api::Rejected { kind, message } => Err(rejected(kind, message)),
        Api::Down(reason) if args.execute => Err(GmemError::Config(format!(
            "daemon not reachable at {} ({reason}); --execute needs a running daemon",
            config.daemon.base_url()
        ))),
        Api::Down(_) => {
            // Counting needs nothing but the logs and the offset table.
            let conn = db::open_db(&crate::default_db_path())?;
            let req = SyncRequest {
                dry_run: true,
                max_items: args.max_items,
                project: args.project.clone(),
            };
            let committed = |p: &Path| db::committed_offset(&conn, &p.display().to_string()).unwrap_or(0);
            let scan = scan_history(&config.sessions.log_root(), &req, &committed, &|_| false)?;
            print_json(&serde_json::to_value(&scan.report)?)
        }
    }
}

pub fn handle_failed(config: &GmemConfig, args: &FailedArgs) -> Result<(), GmemError> {
    if let Some(id) = args.retry {
        return match api(config, "POST", &format!("/api/failed/{id}/retry"), None)? {
            Api::Ok(v) => print_json(&v),
            Api::Rejected { kind, message } => Err(rejected(kind, message)),
            Api::Down(reason) => Err(GmemError::Config(format!("daemon not reachable: {reason}"))),
        };
    }
    let conn = db::open_db(&crate::default_db_path())?;
    let rows: Vec<Value> = db::list_failed(&conn, args.limit)?
        .into_iter()
        .map(|f| {
            json!({
                "id": f.id,
                "name": f.episode.name,
                "group_id": f.group_id,
                "error_kind": f.error_kind,
                "error": f.error,
                "attempts": f.attempts,
                "failed_at": f.failed_at,
            })
        })
        .collect();
    print_json(&Value::Array(rows))
}

pub fn handle_service(action: &ServiceAction) -> Result<(), GmemError> {
    let manager = s5_service::platform_manager();
    let spec = ServiceSpec::current()?;
    match action {
        ServiceAction::Install => {
            let path = s5_service::install(manager.as_ref(), &spec)?;
            println!("installed {} service ({})", manager.name(), path.display());
        }
        ServiceAction::Uninstall => {
            s5_service::uninstall(manager.as_ref(), &spec)?;
            println!("removed {} service", manager.name());
        }
        ServiceAction::Status => {
            let (installed, detail) = s5_service::query(manager.as_ref(), &spec);
            let supervisor = s5_supervisor::read_status(&s5_supervisor::status_path())?;
            print_json(&json!({
                "manager": manager.name(),
                "installed": installed,
                "detail": detail,
                "supervisor": supervisor,
            }))?;
        }
    }
    Ok(())
}

pub fn handle_resolve(config: &GmemConfig, path: &str) -> Result<(), GmemError> {
    let project = s5_project::resolve(path)?;
    print_json(&json!({
        "canonical": project.canonical,
        "native": project.native,
        "name": project.name,
        "id": project.id,
        "group_id": config.group_id(Some(&project)),
        "enabled": config.project_enabled(Some(&project)),
    }))
}
