use crate::s2_reduce::{BUILTIN_TEMPLATE, FilterConfig, FilterMode};
use crate::s5_project::{self, ProjectRef};
use crate::GmemError;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct GmemConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub metrics: crate::metrics::MetricsConfig,
    /// Overrides keyed by project path (any platform form; compared canonically).
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// The single authoritative runtime toggle.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_backoff_base_ms")]
    pub restart_backoff_base_ms: u64,
    #[serde(default = "default_restart_backoff_max_ms")]
    pub restart_backoff_max_ms: u64,
    /// Uptime after which a child counts as healthy and the restart budget resets.
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            max_restarts: default_max_restarts(),
            restart_backoff_base_ms: default_restart_backoff_base_ms(),
            restart_backoff_max_ms: default_restart_backoff_max_ms(),
            stable_after_secs: default_stable_after_secs(),
            workers: default_workers(),
            submit_timeout_secs: default_submit_timeout_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8283
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_grace_period_ms() -> u64 {
    30_000
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_backoff_base_ms() -> u64 {
    1000
}

fn default_restart_backoff_max_ms() -> u64 {
    60_000
}

fn default_stable_after_secs() -> u64 {
    300
}

fn default_workers() -> usize {
    1
}

fn default_submit_timeout_secs() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    /// Root of the per-project session log directories.
    #[serde(default)]
    pub log_root: Option<PathBuf>,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Only logs modified within this window are picked up live.
    #[serde(default = "default_discover_window_secs")]
    pub discover_window_secs: u64,
    /// Quiet time before a reply at the end of the log counts as the end of
    /// its turn. A new user prompt ends the turn immediately.
    #[serde(default = "default_turn_settle_ms")]
    pub turn_settle_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            log_root: None,
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            scan_interval_ms: default_scan_interval_ms(),
            discover_window_secs: default_discover_window_secs(),
            turn_settle_ms: default_turn_settle_ms(),
        }
    }
}

impl SessionsConfig {
    pub fn log_root(&self) -> PathBuf {
        self.log_root.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_else(|_| "/tmp".into());
            Path::new(&home).join(".claude").join("projects")
        })
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(10))
    }

    pub fn turn_settle(&self) -> Duration {
        Duration::from_millis(self.turn_settle_ms)
    }
}

fn default_inactivity_timeout_secs() -> u64 {
    300
}

fn default_scan_interval_ms() -> u64 {
    2000
}

pub const DEFAULT_TURN_SETTLE_MS: u64 = 30_000;

fn default_turn_settle_ms() -> u64 {
    DEFAULT_TURN_SETTLE_MS
}

fn default_discover_window_secs() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterPreset {
    #[default]
    Default,
    Aggressive,
    None,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterKeyword {
    Full,
    Exclude,
    Describe,
    /// Reduce through the summarizer with the built-in template.
    Summarize,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum FilterModeSpec {
    Keyword(FilterKeyword),
    Template { template: PathBuf },
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterSection {
    #[serde(default)]
    pub preset: FilterPreset,
    #[serde(default)]
    pub user: Option<FilterModeSpec>,
    #[serde(default)]
    pub assistant: Option<FilterModeSpec>,
    #[serde(default)]
    pub thinking: Option<FilterModeSpec>,
    #[serde(default)]
    pub tool_call: Option<FilterModeSpec>,
    #[serde(default)]
    pub tool_result: Option<FilterModeSpec>,
    #[serde(default)]
    pub system: Option<FilterModeSpec>,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            preset: FilterPreset::Default,
            user: None,
            assistant: None,
            thinking: None,
            tool_call: None,
            tool_result: None,
            system: None,
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

fn default_summary_max_chars() -> usize {
    400
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SummarizerBackend {
    #[default]
    Openai,
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    #[serde(default)]
    pub backend: SummarizerBackend,
    #[serde(default = "default_summarizer_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub fallback_endpoint: Option<String>,
    #[serde(default = "default_summarizer_model")]
    pub model: String,
    #[serde(default = "default_summarizer_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            backend: SummarizerBackend::default(),
            endpoint: default_summarizer_endpoint(),
            fallback_endpoint: None,
            model: default_summarizer_model(),
            timeout_secs: default_summarizer_timeout(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_summarizer_endpoint() -> String {
    "http://localhost:1234/v1/chat/completions".into()
}

fn default_summarizer_model() -> String {
    "ibm/granite-4-h-tiny".into()
}

fn default_summarizer_timeout() -> u64 {
    30
}

fn default_cache_capacity() -> usize {
    512
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Http,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Ping interval while the store is believed healthy.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoint: default_store_endpoint(),
            api_key: None,
            timeout_secs: default_store_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            health_interval_ms: default_health_interval_ms(),
        }
    }
}

impl StoreConfig {
    /// Exponential backoff for the given retry attempt (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        exp_backoff(self.backoff_base_ms, self.backoff_max_ms, attempt)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(10))
    }
}

/// `base * 2^(attempt-1)`, capped at `max`.
pub fn exp_backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift).min(max_ms))
}

fn default_store_endpoint() -> String {
    "http://localhost:8000".into()
}

fn default_store_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_health_interval_ms() -> u64 {
    15_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct PreprocessingConfig {
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub instruction_file: Option<PathBuf>,
}

/// Empirical tuning constants; kept configurable.
#[derive(Debug, Deserialize, Clone)]
pub struct ActivityConfig {
    #[serde(default = "default_activity_threshold")]
    pub threshold: f64,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            threshold: default_activity_threshold(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

fn default_activity_threshold() -> f64 {
    0.3
}

fn default_chars_per_token() -> f64 {
    4.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_patterns: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ProjectConfig {
    /// Namespace override; defaults to `project_<id>`.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Set to false to stop indexing this project.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub preprocessing_instruction: Option<String>,
    #[serde(default)]
    pub filter: Option<FilterSection>,
}

impl GmemConfig {
    /// Per-project override for a resolved project, matched on canonical path.
    pub fn project_config(&self, project: &ProjectRef) -> Option<&ProjectConfig> {
        self.projects.iter().find_map(|(key, pc)| {
            match s5_project::canonicalize(key) {
                Ok(k) if k == project.canonical => Some(pc),
                _ => None,
            }
        })
    }

    pub fn project_enabled(&self, project: Option<&ProjectRef>) -> bool {
        project
            .and_then(|p| self.project_config(p))
            .and_then(|pc| pc.enabled)
            .unwrap_or(true)
    }

    /// Namespace for episodes of this project.
    pub fn group_id(&self, project: Option<&ProjectRef>) -> String {
        match project {
            Some(p) => self
                .project_config(p)
                .and_then(|pc| pc.group_id.clone())
                .unwrap_or_else(|| p.namespace()),
            None => "project_unknown".into(),
        }
    }
}

/// Load config from GMEM_CONFIG, `$GMEM_HOME/config.json`, or defaults.
pub fn load_config() -> Result<GmemConfig, GmemError> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<GmemConfig, GmemError> {
    if !path.exists() {
        return Ok(GmemConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, path)
}

/// Parse and validate a config document read from `origin`.
pub fn parse_config(content: &str, origin: &Path) -> Result<GmemConfig, GmemError> {
    let config: GmemConfig = serde_json::from_str(content)
        .map_err(|e| GmemError::Config(format!("{}: {e}", origin.display())))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("GMEM_CONFIG")
        && !p.is_empty()
    {
        return PathBuf::from(p);
    }
    crate::gmem_home().join("config.json")
}

fn validate_config(config: &GmemConfig) -> Result<(), GmemError> {
    let d = &config.daemon;
    let loopback = d.host == "localhost"
        || d.host.parse::<std::net::IpAddr>().is_ok_and(|ip| ip.is_loopback());
    if !loopback {
        return Err(GmemError::Config(format!(
            "daemon.host must be a loopback address, got {:?}",
            d.host
        )));
    }
    if d.port == 0 {
        return Err(GmemError::Config("daemon.port must be non-zero".into()));
    }
    if d.workers == 0 {
        return Err(GmemError::Config("daemon.workers must be at least 1".into()));
    }
    if !(0.0..=1.0).contains(&config.activity.threshold) {
        return Err(GmemError::Config("activity.threshold must be within 0..=1".into()));
    }
    if config.activity.chars_per_token <= 0.0 {
        return Err(GmemError::Config("activity.chars_per_token must be positive".into()));
    }
    for (i, pat) in config.redaction.extra_patterns.iter().enumerate() {
        Regex::new(pat).map_err(|e| {
            GmemError::Config(format!("redaction.extra_patterns[{i}] invalid regex: {e}"))
        })?;
    }
    for key in config.projects.keys() {
        s5_project::canonicalize(key)
            .map_err(|e| GmemError::Config(format!("projects[{key:?}]: {e}")))?;
    }
    resolve_filter_config(config, None)?;
    for pc in config.projects.values() {
        if let Some(section) = &pc.filter {
            filter_from_section(section)?;
        }
    }
    Ok(())
}

/// Build the immutable filter policy: project override, else the global section.
pub fn resolve_filter_config(
    config: &GmemConfig,
    project: Option<&ProjectRef>,
) -> Result<FilterConfig, GmemError> {
    let section = project
        .and_then(|p| config.project_config(p))
        .and_then(|pc| pc.filter.as_ref())
        .unwrap_or(&config.filter);
    filter_from_section(section)
}

pub fn filter_from_section(section: &FilterSection) -> Result<FilterConfig, GmemError> {
    let mut fc = FilterConfig::preset(section.preset);
    fc.summary_max_chars = section.summary_max_chars.max(16);

    let apply = |slot: &mut FilterMode, spec: &Option<FilterModeSpec>| -> Result<(), GmemError> {
        if let Some(spec) = spec {
            *slot = mode_from_spec(spec)?;
        }
        Ok(())
    };
    apply(&mut fc.user, &section.user)?;
    apply(&mut fc.assistant, &section.assistant)?;
    apply(&mut fc.thinking, &section.thinking)?;
    apply(&mut fc.tool_call, &section.tool_call)?;
    apply(&mut fc.tool_result, &section.tool_result)?;
    apply(&mut fc.system, &section.system)?;
    Ok(fc)
}

fn mode_from_spec(spec: &FilterModeSpec) -> Result<FilterMode, GmemError> {
    Ok(match spec {
        FilterModeSpec::Keyword(FilterKeyword::Full) => FilterMode::Full,
        FilterModeSpec::Keyword(FilterKeyword::Exclude) => FilterMode::Exclude,
        FilterModeSpec::Keyword(FilterKeyword::Describe) => FilterMode::Describe,
        FilterModeSpec::Keyword(FilterKeyword::Summarize) => FilterMode::Reduce {
            template: Arc::from(BUILTIN_TEMPLATE),
        },
        FilterModeSpec::Template { template } => {
            let text = std::fs::read_to_string(template).map_err(|e| {
                GmemError::Config(format!("filter template {}: {e}", template.display()))
            })?;
            if !text.contains("{content}") {
                return Err(GmemError::Config(format!(
                    "filter template {} has no {{content}} placeholder",
                    template.display()
                )));
            }
            FilterMode::Reduce {
                template: Arc::from(text.as_str()),
            }
        }
    })
}

/// Rewrite `daemon.enabled` in the config file, preserving every other field.
pub fn set_enabled(path: &Path, enabled: bool) -> Result<(), GmemError> {
    let mut doc: Value = if path.exists() {
        serde_json::from_str(&std::fs::read_to_string(path)?)?
    } else {
        Value::Object(serde_json::Map::new())
    };

    let root = doc
        .as_object_mut()
        .ok_or_else(|| GmemError::Config(format!("{}: top level is not an object", path.display())))?;
    let daemon = root
        .entry("daemon")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let daemon = daemon
        .as_object_mut()
        .ok_or_else(|| GmemError::Config("daemon section is not an object".into()))?;
    daemon.insert("enabled".into(), Value::Bool(enabled));

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s2_reduce::MessageClass;

    #[test]
    fn default_config_when_no_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("missing.json")).unwrap();
        assert!(!config.daemon.enabled);
        assert_eq!(config.daemon.poll_interval_ms, 5000);
        assert_eq!(config.daemon.host, "127.0.0.1");
        assert_eq!(config.store.max_retries, 3);
        assert_eq!(config.activity.threshold, 0.3);
        assert_eq!(config.sessions.turn_settle(), Duration::from_secs(30));
        assert_eq!(config.store.health_interval(), Duration::from_secs(15));
        assert!(config.projects.is_empty());
    }

    #[test]
    fn parse_config_reports_origin() {
        let err = parse_config("{not json", Path::new("/etc/gmem.json")).unwrap_err();
        assert!(err.to_string().contains("/etc/gmem.json"));
        let config = parse_config(r#"{"sessions": {"turn_settle_ms": 50}}"#, Path::new("x")).unwrap();
        assert_eq!(config.sessions.turn_settle(), Duration::from_millis(50));
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "daemon": {"enabled": true, "port": 9000, "workers": 2},
            "sessions": {"log_root": "/logs", "inactivity_timeout_secs": 60},
            "filter": {"preset": "aggressive", "tool_result": "describe", "summary_max_chars": 200},
            "summarizer": {"backend": "none"},
            "store": {"backend": "memory", "max_retries": 5},
            "projects": {"/work/secret": {"enabled": false, "group_id": "secret"}}
        }"#;
        let config: GmemConfig = serde_json::from_str(json).unwrap();
        validate_config(&config).unwrap();
        assert!(config.daemon.enabled);
        assert_eq!(config.daemon.port, 9000);
        assert_eq!(config.sessions.log_root(), PathBuf::from("/logs"));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.summarizer.backend, SummarizerBackend::None);

        let fc = resolve_filter_config(&config, None).unwrap();
        assert!(matches!(fc.mode(MessageClass::Assistant), FilterMode::Reduce { .. }));
        assert_eq!(*fc.mode(MessageClass::ToolResult), FilterMode::Describe);
        assert_eq!(fc.summary_max_chars, 200);

        let secret = s5_project::resolve("/work/secret/").unwrap();
        assert!(!config.project_enabled(Some(&secret)));
        assert_eq!(config.group_id(Some(&secret)), "secret");
        let other = s5_project::resolve("/work/other").unwrap();
        assert!(config.project_enabled(Some(&other)));
        assert_eq!(config.group_id(Some(&other)), other.namespace());
    }

    #[test]
    fn project_keys_match_across_path_forms() {
        let config: GmemConfig = serde_json::from_str(
            r#"{"projects": {"C:\\Users\\dev\\app": {"group_id": "app"}}}"#,
        )
        .unwrap();
        let p = s5_project::resolve("/mnt/c/Users/dev/app").unwrap();
        assert_eq!(config.group_id(Some(&p)), "app");
    }

    #[test]
    fn rejects_non_loopback_host() {
        let config: GmemConfig =
            serde_json::from_str(r#"{"daemon": {"host": "0.0.0.0"}}"#).unwrap();
        assert!(validate_config(&config).is_err());
        let config: GmemConfig =
            serde_json::from_str(r#"{"daemon": {"host": "::1"}}"#).unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn invalid_regex_and_missing_template_fail() {
        let config: GmemConfig =
            serde_json::from_str(r#"{"redaction": {"extra_patterns": ["[bad"]}}"#).unwrap();
        assert!(validate_config(&config).is_err());

        let config: GmemConfig = serde_json::from_str(
            r#"{"filter": {"assistant": {"template": "/nonexistent/template.txt"}}}"#,
        )
        .unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn template_is_read_at_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let tpl = dir.path().join("t.txt");
        std::fs::write(&tpl, "Shorten: {content}").unwrap();
        let section = FilterSection {
            assistant: Some(FilterModeSpec::Template { template: tpl.clone() }),
            ..Default::default()
        };
        let fc = filter_from_section(&section).unwrap();
        std::fs::remove_file(&tpl).unwrap();
        match fc.mode(MessageClass::Assistant) {
            FilterMode::Reduce { template } => assert_eq!(&**template, "Shorten: {content}"),
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn set_enabled_preserves_other_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"daemon": {"port": 9001}, "custom": {"x": 1}}"#).unwrap();

        set_enabled(&path, true).unwrap();
        let config = load_config_from(&path).unwrap();
        assert!(config.daemon.enabled);
        assert_eq!(config.daemon.port, 9001);
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["custom"]["x"], 1);

        set_enabled(&path, false).unwrap();
        assert!(!load_config_from(&path).unwrap().daemon.enabled);
    }

    #[test]
    fn set_enabled_creates_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        set_enabled(&path, true).unwrap();
        assert!(load_config_from(&path).unwrap().daemon.enabled);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(exp_backoff(100, 1000, 1), Duration::from_millis(100));
        assert_eq!(exp_backoff(100, 1000, 2), Duration::from_millis(200));
        assert_eq!(exp_backoff(100, 1000, 3), Duration::from_millis(400));
        assert_eq!(exp_backoff(100, 1000, 10), Duration::from_millis(1000));
        assert_eq!(exp_backoff(100, 1000, 0), Duration::from_millis(100));
    }
}
