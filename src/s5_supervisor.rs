use crate::metrics;
use crate::s3_daemon::acquire_lock;
use crate::s5_config::{self, DaemonConfig, GmemConfig, exp_backoff};
use crate::GmemError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Running,
    Backoff,
    /// Restart budget exhausted; stays here until the daemon is disabled.
    Unhealthy,
}

/// What the supervisor sees about the daemon on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    NotRunning,
    Running,
    Exited { success: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Nothing,
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub stable_after: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            backoff_base: Duration::from_millis(config.restart_backoff_base_ms),
            backoff_max: Duration::from_millis(config.restart_backoff_max_ms),
            stable_after: Duration::from_secs(config.stable_after_secs),
        }
    }

    fn delay(&self, restart: u32) -> Duration {
        exp_backoff(
            self.backoff_base.as_millis() as u64,
            self.backoff_max.as_millis() as u64,
            restart,
        )
    }
}

/// Pure restart logic. No I/O; the runtime feeds it observations and
/// carries out the returned action.
#[derive(Debug)]
pub struct Supervisor {
    policy: RestartPolicy,
    state: SupervisorState,
    restarts: u32,
    next_start: Option<Instant>,
    started_at: Option<Instant>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            state: SupervisorState::Stopped,
            restarts: 0,
            next_start: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn set_policy(&mut self, policy: RestartPolicy) {
        self.policy = policy;
    }

    fn reset(&mut self) {
        self.state = SupervisorState::Stopped;
        self.restarts = 0;
        self.next_start = None;
        self.started_at = None;
    }

    /// The daemon could not be started at all. Counts against the restart
    /// budget exactly like a crash.
    pub fn spawn_failed(&mut self, now: Instant) {
        if self.state != SupervisorState::Unhealthy {
            self.record_failure(now, "could not be started");
        }
    }

    fn record_failure(&mut self, now: Instant, what: &str) {
        self.started_at = None;
        self.restarts += 1;
        metrics::count_daemon_restart();
        if self.restarts > self.policy.max_restarts {
            self.state = SupervisorState::Unhealthy;
            self.next_start = None;
            log::warn!(
                "daemon {what}, {} failures in a row; giving up until it is disabled and re-enabled",
                self.restarts
            );
            return;
        }
        let delay = self.policy.delay(self.restarts);
        log::warn!(
            "daemon {what}; restart {}/{} in {}ms",
            self.restarts,
            self.policy.max_restarts,
            delay.as_millis()
        );
        self.state = SupervisorState::Backoff;
        self.next_start = Some(now + delay);
    }

    pub fn tick(&mut self, now: Instant, enabled: bool, child: ChildStatus) -> Action {
        if !enabled {
            let running = child == ChildStatus::Running;
            self.reset();
            return if running { Action::Stop } else { Action::Nothing };
        }

        match child {
            ChildStatus::Running => {
                self.state = SupervisorState::Running;
                let started = *self.started_at.get_or_insert(now);
                if self.restarts > 0 && now.duration_since(started) >= self.policy.stable_after {
                    log::info!("daemon stable, restart budget reset");
                    self.restarts = 0;
                }
                Action::Nothing
            }
            ChildStatus::Exited { success } => {
                if self.state != SupervisorState::Unhealthy {
                    self.record_failure(now, if success { "exited with status 0" } else { "exited with failure" });
                }
                Action::Nothing
            }
            ChildStatus::NotRunning => match self.state {
                SupervisorState::Unhealthy => Action::Nothing,
                SupervisorState::Backoff if self.next_start.is_some_and(|t| now < t) => Action::Nothing,
                _ => {
                    self.state = SupervisorState::Running;
                    self.next_start = None;
                    self.started_at = Some(now);
                    Action::Start
                }
            },
        }
    }
}

// --- Status file ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: u32,
    pub daemon_pid: Option<u32>,
    pub restarts: u32,
    pub enabled: bool,
    pub last_health: Option<HealthCheck>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub ok: bool,
    pub detail: String,
    pub at: String,
}

pub fn status_path() -> PathBuf {
    crate::gmem_home().join("supervisor.json")
}

/// What the supervisor runs and where it keeps its files.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub config_path: PathBuf,
    /// Lock files and the status file live here; passed on as `GMEM_HOME`.
    pub home: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SupervisorOptions {
    /// Supervise `gmem daemon` from this executable.
    pub fn for_current_exe(config_path: PathBuf) -> Result<Self, GmemError> {
        Ok(Self {
            config_path,
            home: crate::gmem_home(),
            program: std::env::current_exe()?,
            args: vec!["daemon".into()],
        })
    }

    pub fn status_file(&self) -> PathBuf {
        self.home.join("supervisor.json")
    }
}

pub fn write_status(path: &Path, status: &SupervisorStatus) -> Result<(), GmemError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(status)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_status(path: &Path) -> Result<Option<SupervisorStatus>, GmemError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// --- Process control ---

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Pid of a daemon currently holding the daemon lock, if any.
pub fn daemon_pid(lock_path: &Path) -> Option<u32> {
    let file = std::fs::File::open(lock_path).ok()?;
    if FileExt::try_lock_shared(&file).is_ok() {
        let _ = FileExt::unlock(&file);
        return None;
    }
    let pid = std::fs::read_to_string(lock_path).ok()?.trim().parse().ok()?;
    is_process_alive(pid).then_some(pid)
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// The daemon process the supervisor is responsible for.
enum Managed {
    Child(Child),
    /// Already running when the supervisor came up.
    Adopted(u32),
}

impl Managed {
    fn pid(&self) -> Option<u32> {
        match self {
            Managed::Child(c) => c.id(),
            Managed::Adopted(pid) => Some(*pid),
        }
    }

    fn status(&mut self) -> ChildStatus {
        match self {
            Managed::Child(c) => match c.try_wait() {
                Ok(None) => ChildStatus::Running,
                Ok(Some(status)) => ChildStatus::Exited { success: status.success() },
                Err(e) => {
                    log::warn!("polling daemon process: {e}");
                    ChildStatus::Exited { success: false }
                }
            },
            Managed::Adopted(pid) => {
                if is_process_alive(*pid) {
                    ChildStatus::Running
                } else {
                    ChildStatus::Exited { success: false }
                }
            }
        }
    }

    /// SIGTERM, wait out the grace period, then kill.
    async fn stop(&mut self, grace: Duration) {
        let deadline = grace;
        match self {
            Managed::Child(c) => {
                match c.id() {
                    Some(pid) if cfg!(unix) => terminate(pid),
                    _ => {
                        let _ = c.start_kill();
                    }
                }
                match tokio::time::timeout(deadline, c.wait()).await {
                    Ok(Ok(status)) => log::info!("daemon stopped ({status})"),
                    Ok(Err(e)) => log::warn!("waiting for daemon: {e}"),
                    Err(_) => {
                        log::warn!("daemon still running {}ms after SIGTERM, killing", deadline.as_millis());
                        let _ = c.kill().await;
                    }
                }
            }
            Managed::Adopted(pid) => {
                let pid = *pid;
                terminate(pid);
                let until = Instant::now() + deadline;
                while is_process_alive(pid) && Instant::now() < until {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                if is_process_alive(pid) {
                    log::warn!("daemon pid {pid} ignored SIGTERM");
                    #[cfg(unix)]
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }
        }
    }
}

fn spawn_daemon(opts: &SupervisorOptions) -> Result<Child, GmemError> {
    let child = Command::new(&opts.program)
        .args(&opts.args)
        .env("GMEM_CONFIG", &opts.config_path)
        .env("GMEM_HOME", &opts.home)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(false)
        .spawn()?;
    log::info!("started daemon pid {}", child.id().unwrap_or_default());
    Ok(child)
}

async fn check_health(config: &DaemonConfig) -> HealthCheck {
    let url = format!("{}/health", config.base_url());
    let result = tokio::task::spawn_blocking(move || {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_global(Some(Duration::from_secs(3)))
                .http_status_as_error(false)
                .build(),
        );
        agent.get(&url).call().map(|r| r.status().as_u16())
    })
    .await;
    let (ok, detail) = match result {
        Ok(Ok(200)) => (true, "ok".to_string()),
        Ok(Ok(503)) => (false, "degraded: knowledge store unreachable".to_string()),
        Ok(Ok(code)) => (false, format!("HTTP {code}")),
        Ok(Err(e)) => (false, e.to_string()),
        Err(e) => (false, e.to_string()),
    };
    HealthCheck {
        ok,
        detail,
        at: chrono::Utc::now().to_rfc3339(),
    }
}

/// Poll the enable flag and keep the daemon in the state it asks for,
/// until `shutdown` resolves.
pub async fn run_supervisor(opts: SupervisorOptions, shutdown: impl Future<Output = ()>) -> Result<(), GmemError> {
    let _lock = acquire_lock(&opts.home.join("supervisor.lock"))?;
    let daemon_lock = opts.home.join("daemon.lock");
    let status_file = opts.status_file();
    let config_path = &opts.config_path;

    let mut config = s5_config::load_config_from(config_path).unwrap_or_else(|e| {
        log::warn!("{e}; starting with defaults");
        GmemConfig::default()
    });
    let mut machine = Supervisor::new(RestartPolicy::from_config(&config.daemon));
    let mut managed = daemon_pid(&daemon_lock).map(|pid| {
        log::info!("adopting running daemon pid {pid}");
        Managed::Adopted(pid)
    });
    let mut last_health = None;
    let mut warned_unhealthy = false;

    log::info!("supervisor {} watching {}", std::process::id(), config_path.display());
    let mut tick = tokio::time::interval(config.daemon.poll_interval());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                log::info!("supervisor shutting down");
                if let Some(m) = managed.as_mut() {
                    m.stop(config.daemon.grace_period()).await;
                }
                break;
            }
        }

        // Re-read every tick so edits take effect within one interval.
        match s5_config::load_config_from(config_path) {
            Ok(c) => {
                if c.daemon.poll_interval() != config.daemon.poll_interval() {
                    tick = tokio::time::interval(c.daemon.poll_interval());
                }
                machine.set_policy(RestartPolicy::from_config(&c.daemon));
                config = c;
            }
            Err(e) => log::warn!("keeping previous config: {e}"),
        }

        let child = managed.as_mut().map_or(ChildStatus::NotRunning, Managed::status);
        if matches!(child, ChildStatus::Exited { .. }) {
            managed = None;
        }

        let now = Instant::now();
        match machine.tick(now, config.daemon.enabled, child) {
            Action::Start => match spawn_daemon(&opts) {
                Ok(c) => managed = Some(Managed::Child(c)),
                Err(e) => {
                    log::warn!("starting {}: {e}", opts.program.display());
                    machine.spawn_failed(now);
                }
            },
            Action::Stop => {
                log::info!("daemon disabled, stopping");
                if let Some(mut m) = managed.take() {
                    m.stop(config.daemon.grace_period()).await;
                }
            }
            Action::Nothing => {}
        }

        if machine.state() == SupervisorState::Unhealthy {
            if !warned_unhealthy {
                log::warn!("daemon persistently unhealthy");
                warned_unhealthy = true;
            }
        } else {
            warned_unhealthy = false;
        }

        if child == ChildStatus::Running {
            last_health = Some(check_health(&config.daemon).await);
        }

        let status = SupervisorStatus {
            state: machine.state(),
            pid: std::process::id(),
            daemon_pid: managed.as_ref().and_then(Managed::pid),
            restarts: machine.restarts(),
            enabled: config.daemon.enabled,
            last_health: last_health.clone(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = write_status(&status_file, &status) {
            log::warn!("writing {}: {e}", status_file.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            max_restarts: 2,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            stable_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn starts_when_enabled_and_stops_when_disabled() {
        let mut s = Supervisor::new(policy());
        let t = Instant::now();
        assert_eq!(s.tick(t, false, ChildStatus::NotRunning), Action::Nothing);
        assert_eq!(s.tick(t, true, ChildStatus::NotRunning), Action::Start);
        assert_eq!(s.tick(t, true, ChildStatus::Running), Action::Nothing);
        assert_eq!(s.state(), SupervisorState::Running);
        assert_eq!(s.tick(t, false, ChildStatus::Running), Action::Stop);
        assert_eq!(s.state(), SupervisorState::Stopped);
    }

    #[test]
    fn crash_restarts_after_backoff() {
        let mut s = Supervisor::new(policy());
        let t = Instant::now();
        s.tick(t, true, ChildStatus::NotRunning);
        s.tick(t, true, ChildStatus::Exited { success: false });
        assert_eq!(s.state(), SupervisorState::Backoff);
        assert_eq!(s.tick(t + Duration::from_millis(500), true, ChildStatus::NotRunning), Action::Nothing);
        assert_eq!(s.tick(t + Duration::from_secs(1), true, ChildStatus::NotRunning), Action::Start);

        // Second crash doubles the delay.
        let t2 = t + Duration::from_secs(2);
        s.tick(t2, true, ChildStatus::Exited { success: false });
        assert_eq!(s.tick(t2 + Duration::from_millis(1500), true, ChildStatus::NotRunning), Action::Nothing);
        assert_eq!(s.tick(t2 + Duration::from_secs(2), true, ChildStatus::NotRunning), Action::Start);
    }

    #[test]
    fn cap_reports_unhealthy_until_toggled() {
        let mut s = Supervisor::new(policy());
        let mut t = Instant::now();
        s.tick(t, true, ChildStatus::NotRunning);
        for _ in 0..3 {
            s.tick(t, true, ChildStatus::Exited { success: false });
            t += Duration::from_secs(30);
            s.tick(t, true, ChildStatus::NotRunning);
        }
        assert_eq!(s.state(), SupervisorState::Unhealthy);
        t += Duration::from_secs(600);
        assert_eq!(s.tick(t, true, ChildStatus::NotRunning), Action::Nothing);

        s.tick(t, false, ChildStatus::NotRunning);
        assert_eq!(s.restarts(), 0);
        assert_eq!(s.tick(t, true, ChildStatus::NotRunning), Action::Start);
    }

    #[test]
    fn spawn_failures_count_toward_the_cap() {
        let mut s = Supervisor::new(policy());
        let mut t = Instant::now();
        assert_eq!(s.tick(t, true, ChildStatus::NotRunning), Action::Start);
        s.spawn_failed(t);
        assert_eq!(s.state(), SupervisorState::Backoff);
        assert_eq!(s.restarts(), 1);
        assert_eq!(s.tick(t + Duration::from_millis(500), true, ChildStatus::NotRunning), Action::Nothing);

        for _ in 0..2 {
            t += Duration::from_secs(30);
            assert_eq!(s.tick(t, true, ChildStatus::NotRunning), Action::Start);
            s.spawn_failed(t);
        }
        assert_eq!(s.state(), SupervisorState::Unhealthy);
        assert_eq!(s.restarts(), 3);
        assert_eq!(s.tick(t + Duration::from_secs(600), true, ChildStatus::NotRunning), Action::Nothing);
        s.spawn_failed(t);
        assert_eq!(s.restarts(), 3);
    }

    #[test]
    fn stable_uptime_resets_budget() {
        let mut s = Supervisor::new(policy());
        let t = Instant::now();
        s.tick(t, true, ChildStatus::NotRunning);
        s.tick(t, true, ChildStatus::Exited { success: false });
        let t1 = t + Duration::from_secs(1);
        assert_eq!(s.tick(t1, true, ChildStatus::NotRunning), Action::Start);
        s.tick(t1 + Duration::from_secs(30), true, ChildStatus::Running);
        assert_eq!(s.restarts(), 1);
        s.tick(t1 + Duration::from_secs(61), true, ChildStatus::Running);
        assert_eq!(s.restarts(), 0);
    }

    #[test]
    fn status_file_round_trip_and_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("supervisor.json");
        assert!(read_status(&path).unwrap().is_none());
        let status = SupervisorStatus {
            state: SupervisorState::Backoff,
            pid: 7,
            daemon_pid: None,
            restarts: 2,
            enabled: true,
            last_health: None,
            updated_at: "2025-01-01T00:00:00Z".into(),
        };
        write_status(&path, &status).unwrap();
        let back = read_status(&path).unwrap().unwrap();
        assert_eq!(back.state, SupervisorState::Backoff);
        assert_eq!(back.restarts, 2);
    }

    #[test]
    fn unlocked_daemon_lock_means_no_daemon() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        assert_eq!(daemon_pid(&path), None);
        std::fs::write(&path, "12345\n").unwrap();
        assert_eq!(daemon_pid(&path), None);
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }
}
