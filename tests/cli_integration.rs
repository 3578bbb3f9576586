use assert_cmd::Command;
use serde_json::{Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Env {
    home: TempDir,
    logs: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            home: TempDir::new().unwrap(),
            logs: TempDir::new().unwrap(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.home.path().join("config.json")
    }

    fn write_config(&self, config: Value) {
        std::fs::write(self.config_path(), config.to_string()).unwrap();
    }

    /// Config pointing at the temp log root and a port nothing listens on.
    fn offline_config(&self) {
        self.write_config(json!({
            "daemon": {"port": 9, "submit_timeout_secs": 1},
            "sessions": {"log_root": self.logs.path()},
            "projects": {"/work/legacy": {"enabled": false, "group_id": "legacy"}},
        }));
    }

    #[allow(deprecated)]
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("gmem").unwrap();
        cmd.env("GMEM_HOME", self.home.path())
            .env("GMEM_CONFIG", self.config_path())
            .env("GMEM_LOG", "warn");
        cmd
    }
}

fn stdout_json(out: &[u8]) -> Value {
    serde_json::from_slice(out).unwrap()
}

fn write_session(dir: &Path, name: &str, cwd: &str, pairs: usize) {
    let mut f = std::fs::File::create(dir.join(name)).unwrap();
    for i in 0..pairs {
        for (kind, text) in [("user", format!("q{i}")), ("assistant", format!("a{i}"))] {
            writeln!(f, "{}", json!({"type": kind, "sessionId": name, "cwd": cwd, "message": {"content": text}})).unwrap();
        }
    }
}

#[test]
fn enable_and_disable_rewrite_only_the_flag() {
    let env = Env::new();
    env.write_config(json!({"daemon": {"port": 9001}, "custom": {"keep": true}}));

    env.cmd().arg("enable").assert().success();
    let doc: Value = serde_json::from_str(&std::fs::read_to_string(env.config_path()).unwrap()).unwrap();
    assert_eq!(doc["daemon"]["enabled"], true);
    assert_eq!(doc["daemon"]["port"], 9001);
    assert_eq!(doc["custom"]["keep"], true);

    env.cmd().arg("disable").assert().success();
    let doc: Value = serde_json::from_str(&std::fs::read_to_string(env.config_path()).unwrap()).unwrap();
    assert_eq!(doc["daemon"]["enabled"], false);
}

#[test]
fn enable_creates_missing_config() {
    let env = Env::new();
    env.cmd().arg("enable").assert().success();
    assert!(env.config_path().exists());
}

#[test]
fn resolve_reports_namespace_and_override() {
    let env = Env::new();
    env.offline_config();

    let out = env.cmd().args(["resolve", "/work/app/"]).assert().success();
    let v = stdout_json(&out.get_output().stdout);
    assert_eq!(v["name"], "app");
    assert_eq!(v["canonical"], "/work/app");
    assert!(v["group_id"].as_str().unwrap().starts_with("project_"));
    assert_eq!(v["enabled"], true);

    let out = env.cmd().args(["resolve", "/work/legacy"]).assert().success();
    let v = stdout_json(&out.get_output().stdout);
    assert_eq!(v["group_id"], "legacy");
    assert_eq!(v["enabled"], false);
}

#[test]
fn sync_dry_run_works_without_daemon() {
    let env = Env::new();
    env.offline_config();
    write_session(env.logs.path(), "a.jsonl", "/work/app", 3);
    write_session(env.logs.path(), "b.jsonl", "/work/lib", 2);

    let out = env.cmd().arg("sync").assert().success();
    let v = stdout_json(&out.get_output().stdout);
    assert_eq!(v["dry_run"], true);
    assert_eq!(v["turns_found"], 5);
    assert_eq!(v["queued"], 0);

    let out = env
        .cmd()
        .args(["sync", "--project", "/work/lib", "--max-items", "1"])
        .assert()
        .success();
    let v = stdout_json(&out.get_output().stdout);
    assert_eq!(v["turns_found"], 2);
    assert_eq!(v["capped"], true);
}

#[test]
fn sync_execute_requires_daemon() {
    let env = Env::new();
    env.offline_config();
    let out = env.cmd().args(["sync", "--execute"]).assert().failure().code(1);
    let stderr = String::from_utf8_lossy(&out.get_output().stderr).to_string();
    assert!(stderr.starts_with("gmem: "), "{stderr}");
    assert!(stderr.contains("--execute"));
}

#[test]
fn status_reports_daemon_down() {
    let env = Env::new();
    env.offline_config();
    let out = env.cmd().arg("status").assert().success();
    let v = stdout_json(&out.get_output().stdout);
    assert_eq!(v["enabled"], false);
    assert_eq!(v["daemon"]["running"], false);
    assert_eq!(v["failed_episodes"], 0);
    assert!(v["supervisor"].is_null());
}

#[test]
fn invalid_config_is_rejected() {
    let env = Env::new();
    env.write_config(json!({"daemon": {"host": "0.0.0.0"}}));
    let out = env.cmd().arg("status").assert().failure().code(1);
    let stderr = String::from_utf8_lossy(&out.get_output().stderr).to_string();
    assert!(stderr.contains("gmem: config:"), "{stderr}");
}

#[test]
fn failed_list_is_empty_on_fresh_home() {
    let env = Env::new();
    env.offline_config();
    let out = env.cmd().arg("failed").assert().success();
    assert_eq!(stdout_json(&out.get_output().stdout), json!([]));
}
