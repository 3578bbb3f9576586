use crate::db::{self, FailedEpisode};
use crate::metrics;
use crate::s1_4_summarize::{Summarizer, build_summarizer};
use crate::s1_index::{Episode, OffsetLedger, build_episode, submit_with_retry};
use crate::s1_store::{KnowledgeStore, SearchQuery, build_store};
use crate::s2_reduce::ContentFilter;
use crate::s2_registry::{ClosedSession, SessionRegistry, discover_logs};
use crate::s2_turn::Turn;
use crate::s4_sync::{SyncReport, SyncRequest, scan_history};
use crate::s5_config::{self, GmemConfig};
use crate::s5_project::ProjectRef;
use crate::s5_redact::SecretRedactor;
use crate::{GmemError, StoreError, StoreErrorKind};
use fs2::FileExt;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Where a queued job came from; decides what success or parking commits.
#[derive(Debug, Clone)]
pub enum JobOrigin {
    Turn { log_path: PathBuf, start_offset: u64 },
    Api,
    Retry { idempotency_key: String },
}

#[derive(Debug, Clone)]
pub enum JobKind {
    Submit(Arc<Episode>),
    Delete(String),
}

pub struct Job {
    pub kind: JobKind,
    pub origin: JobOrigin,
    reply: Option<oneshot::Sender<Result<String, StoreError>>>,
}

impl Job {
    pub fn submit(episode: Episode, origin: JobOrigin) -> Self {
        Self {
            kind: JobKind::Submit(Arc::new(episode)),
            origin,
            reply: None,
        }
    }
}

/// Failure of a client request against the daemon.
#[derive(Debug)]
pub enum RequestError {
    BadRequest(String),
    NotFound(String),
    Store(StoreError),
    Timeout,
    Internal(String),
}

impl RequestError {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::BadRequest(_) => "bad_request",
            RequestError::NotFound(_) => "not_found",
            RequestError::Store(e) => e.kind.as_str(),
            RequestError::Timeout => "timeout",
            RequestError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::BadRequest(m) | RequestError::NotFound(m) | RequestError::Internal(m) => {
                write!(f, "{m}")
            }
            RequestError::Store(e) => write!(f, "{}", e.message),
            RequestError::Timeout => write!(f, "request timed out"),
        }
    }
}

impl From<GmemError> for RequestError {
    fn from(e: GmemError) -> Self {
        match e {
            GmemError::Store(s) => RequestError::Store(s),
            GmemError::Path(m) => RequestError::BadRequest(m),
            other => RequestError::Internal(other.to_string()),
        }
    }
}

/// Background tasks owned by a running daemon.
pub struct DaemonTasks {
    ingest: JoinHandle<()>,
    health: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Settings that follow the config file while the daemon runs.
struct Live {
    config: Arc<GmemConfig>,
    summarizer: Arc<dyn Summarizer>,
    redactor: Option<Arc<SecretRedactor>>,
    /// Text the current config was parsed from; unchanged files are skipped.
    source: Option<String>,
}

impl Live {
    fn build(config: GmemConfig, source: Option<String>) -> Result<Self, GmemError> {
        let redactor = if config.redaction.enabled {
            Some(Arc::new(SecretRedactor::new(&config.redaction.extra_patterns)?))
        } else {
            None
        };
        Ok(Self {
            summarizer: build_summarizer(&config.summarizer),
            redactor,
            config: Arc::new(config),
            source,
        })
    }
}

/// Outcome of the most recent store ping.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub ok: bool,
    pub at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Shared daemon state: one store connection, one bounded worker set,
/// one health flag.
pub struct DaemonState {
    live: Mutex<Live>,
    config_path: Option<PathBuf>,
    pub store: Arc<dyn KnowledgeStore>,
    pub registry: SessionRegistry,
    filters: Mutex<HashMap<String, Arc<ContentFilter>>>,
    queue: Mutex<VecDeque<Job>>,
    queue_notify: Notify,
    in_flight: AtomicUsize,
    healthy: watch::Sender<bool>,
    last_check: Mutex<Option<HealthCheck>>,
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
    stop_workers: watch::Sender<bool>,
    ledgers: Mutex<HashMap<PathBuf, OffsetLedger>>,
    db: Mutex<Connection>,
    started: Instant,
    submitted: AtomicU64,
    parked: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

fn ticker(period: Duration) -> Interval {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

type JobOutcome = Result<String, (StoreError, u32)>;

impl DaemonState {
    /// With `config_path`, the file is re-read on every ingest pass and
    /// changes apply without a restart.
    pub fn new(
        config: GmemConfig,
        store: Arc<dyn KnowledgeStore>,
        conn: Connection,
        config_path: Option<PathBuf>,
    ) -> Result<Arc<Self>, GmemError> {
        let source = config_path.as_ref().and_then(|p| std::fs::read_to_string(p).ok());
        let registry = SessionRegistry::new(config.sessions.inactivity_timeout(), config.sessions.turn_settle());
        Ok(Arc::new(Self {
            live: Mutex::new(Live::build(config, source)?),
            config_path,
            store,
            registry,
            filters: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            // Unverified until the first successful ping.
            healthy: watch::channel(false).0,
            last_check: Mutex::new(None),
            reconnect: Notify::new(),
            shutdown: watch::channel(false).0,
            stop_workers: watch::channel(false).0,
            ledgers: Mutex::new(HashMap::new()),
            db: Mutex::new(conn),
            started: Instant::now(),
            submitted: AtomicU64::new(0),
            parked: AtomicU64::new(0),
        }))
    }

    /// The configuration in force right now.
    pub fn config(&self) -> Arc<GmemConfig> {
        lock(&self.live).config.clone()
    }

    pub fn spawn(self: &Arc<Self>) -> DaemonTasks {
        let workers = (0..self.config().daemon.workers.max(1))
            .map(|id| tokio::spawn(self.clone().worker_loop(id)))
            .collect();
        let health = tokio::spawn(self.clone().health_loop());
        let ingest = tokio::spawn(self.clone().ingest_loop());
        self.reconnect.notify_one();
        DaemonTasks { ingest, health, workers }
    }

    pub fn is_healthy(&self) -> bool {
        *self.healthy.borrow()
    }

    pub fn last_health_check(&self) -> Option<HealthCheck> {
        lock(&self.last_check).clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn queue_depth(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    fn enqueue(&self, job: Job, front: bool) {
        {
            let mut q = lock(&self.queue);
            if front {
                q.push_front(job);
            } else {
                q.push_back(job);
            }
        }
        self.queue_notify.notify_one();
    }

    async fn next_job(&self) -> Job {
        loop {
            if let Some(job) = lock(&self.queue).pop_front() {
                return job;
            }
            self.queue_notify.notified().await;
        }
    }

    fn mark_unhealthy(&self, err: &StoreError) {
        if self.healthy.send_replace(false) {
            log::warn!("knowledge store connectivity lost ({err}); pausing submissions");
        }
        self.reconnect.notify_one();
    }

    fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.config().daemon.submit_timeout_secs.max(1))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Connection) -> Result<T, GmemError>) -> Result<T, GmemError> {
        f(&lock(&self.db))
    }

    // --- Configuration ---

    /// Pick up edits to the config file. A file that fails to parse or
    /// validate is reported once and the running configuration stays.
    /// Listener, worker count and store endpoint only change on restart.
    pub fn reload_config(&self) -> bool {
        let Some(path) = &self.config_path else {
            return false;
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("config {} not readable: {e}", path.display());
                return false;
            }
        };
        if lock(&self.live).source.as_deref() == Some(content.as_str()) {
            return false;
        }
        let live = match s5_config::parse_config(&content, path).and_then(|c| Live::build(c, Some(content.clone()))) {
            Ok(live) => live,
            Err(e) => {
                log::warn!("ignoring config change: {e}");
                lock(&self.live).source = Some(content);
                return false;
            }
        };
        let sessions = &live.config.sessions;
        self.registry.set_timing(sessions.inactivity_timeout(), sessions.turn_settle());
        *lock(&self.live) = live;
        lock(&self.filters).clear();
        log::info!("configuration reloaded from {}", path.display());
        true
    }

    // --- Workers ---

    async fn worker_loop(self: Arc<Self>, id: usize) {
        let mut health = self.healthy.subscribe();
        let mut stop = self.stop_workers.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            // Never run against a connection that has not been verified.
            tokio::select! {
                ok = async { health.wait_for(|h| *h).await.is_ok() } => if !ok { break },
                _ = stopped(&mut stop) => break,
            }
            let job = tokio::select! {
                job = self.next_job() => job,
                _ = stopped(&mut stop) => break,
            };
            // Health may have dropped while this worker waited on the queue.
            if !self.is_healthy() {
                self.enqueue(job, true);
                continue;
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let outcome = tokio::select! {
                outcome = self.execute(&job.kind) => Some(outcome),
                _ = stopped(&mut stop) => None,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match outcome {
                Some(outcome) => self.settle_job(job, outcome),
                None => {
                    log::debug!("worker {id} abandoned a job at shutdown");
                    self.enqueue(job, true);
                    break;
                }
            }
        }
        log::debug!("worker {id} stopped");
    }

    async fn execute(&self, kind: &JobKind) -> JobOutcome {
        match kind {
            JobKind::Submit(ep) => {
                let config = self.config();
                submit_with_retry(self.store.clone(), ep.clone(), &config.store, self.submit_timeout())
                    .await
                    .map_err(|f| (f.error, f.attempts))
            }
            JobKind::Delete(id) => {
                let store = self.store.clone();
                let owned = id.clone();
                match tokio::time::timeout(
                    self.submit_timeout(),
                    tokio::task::spawn_blocking(move || store.delete(&owned)),
                )
                .await
                {
                    Ok(Ok(r)) => r.map(|()| id.clone()).map_err(|e| (e, 1)),
                    Ok(Err(join)) => Err((StoreError::transient(format!("delete task: {join}")), 1)),
                    Err(_) => Err((StoreError::transient("delete timed out"), 1)),
                }
            }
        }
    }

    fn settle_job(&self, mut job: Job, outcome: JobOutcome) {
        match outcome {
            Ok(id) => {
                if let JobKind::Submit(ep) = &job.kind {
                    self.submitted.fetch_add(1, Ordering::SeqCst);
                    metrics::count_submitted(&ep.group_id);
                    log::info!("indexed {} -> {} ({id})", ep.name, ep.group_id);
                    match &job.origin {
                        JobOrigin::Turn { log_path, start_offset } => self.finish_turn(log_path, *start_offset),
                        JobOrigin::Retry { idempotency_key } => {
                            if let Err(e) = self.with_db(|c| db::remove_failed(c, idempotency_key)) {
                                log::warn!("clearing failed episode: {e}");
                            }
                        }
                        JobOrigin::Api => {}
                    }
                }
                if let Some(tx) = job.reply.take() {
                    let _ = tx.send(Ok(id));
                }
            }
            Err((err, _)) if err.kind == StoreErrorKind::Unavailable => {
                self.mark_unhealthy(&err);
                log::debug!("requeueing job after {err}");
                self.enqueue(job, true);
            }
            Err((err, attempts)) => {
                if let JobKind::Submit(ep) = &job.kind {
                    self.park(ep, &err, attempts, &job.origin);
                }
                if let Some(tx) = job.reply.take() {
                    let _ = tx.send(Err(err));
                }
            }
        }
    }

    /// Record an episode that will not be retried automatically.
    fn park(&self, ep: &Episode, err: &StoreError, attempts: u32, origin: &JobOrigin) {
        log::warn!("parking episode {} after {attempts} attempt(s): {err}", ep.name);
        match self.with_db(|c| db::park_failed(c, ep, err.kind.as_str(), &err.message, attempts)) {
            Ok(_) => {
                self.parked.fetch_add(1, Ordering::SeqCst);
                metrics::count_failed(err.kind.as_str());
                if let JobOrigin::Turn { log_path, start_offset } = origin {
                    self.finish_turn(log_path, *start_offset);
                }
            }
            // The offset stays put, so the turn is re-read after restart.
            Err(e) => log::error!("could not park episode {}: {e}", ep.name),
        }
    }

    // --- Health ---

    async fn ping(&self) -> Result<(), StoreError> {
        let store = self.store.clone();
        let result = match tokio::time::timeout(self.submit_timeout(), tokio::task::spawn_blocking(move || store.ping())).await {
            Ok(Ok(r)) => r,
            Ok(Err(join)) => Err(StoreError::transient(format!("ping task: {join}"))),
            Err(_) => Err(StoreError::transient("ping timed out")),
        };
        *lock(&self.last_check) = Some(HealthCheck {
            ok: result.is_ok(),
            at: chrono::Utc::now().to_rfc3339(),
            detail: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    /// Pings the store on a fixed interval while healthy, so an outage is
    /// noticed without traffic, and reconnects with backoff once it is not.
    async fn health_loop(self: Arc<Self>) {
        let mut stop = self.stop_workers.subscribe();
        let mut check = ticker(self.config().store.health_interval());
        loop {
            let scheduled = tokio::select! {
                _ = self.reconnect.notified() => false,
                _ = check.tick() => true,
                _ = stopped(&mut stop) => return,
            };
            if scheduled {
                let period = self.config().store.health_interval();
                if period != check.period() {
                    check = ticker(period);
                }
                if !self.is_healthy() {
                    continue;
                }
                match self.ping().await {
                    Ok(()) => continue,
                    Err(e) => self.mark_unhealthy(&e),
                }
            }
            let mut attempt = 0u32;
            while !self.is_healthy() {
                attempt += 1;
                match self.ping().await {
                    Ok(()) => {
                        self.healthy.send_replace(true);
                        log::info!("knowledge store ({}) reachable after {attempt} attempt(s)", self.store.name());
                    }
                    Err(e) => {
                        let delay = self.config().store.backoff(attempt);
                        log::debug!("store ping failed ({e}), next attempt in {}ms", delay.as_millis());
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = stopped(&mut stop) => return,
                        }
                    }
                }
            }
        }
    }

    // --- Ingestion ---

    async fn ingest_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut tick = ticker(self.config().sessions.scan_interval());
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            self.ingest_tick().await;
            let period = self.config().sessions.scan_interval();
            if period != tick.period() {
                tick = ticker(period);
            }
        }
    }

    fn committed_offset(&self, path: &Path) -> u64 {
        if let Some(l) = lock(&self.ledgers).get(path) {
            return l.resume_point();
        }
        self.with_db(|c| db::committed_offset(c, &path.display().to_string()))
            .unwrap_or_else(|e| {
                log::warn!("reading offset for {}: {e}", path.display());
                0
            })
    }

    /// Ledger for `path`, created from the stored offset. Returns where a
    /// reader should resume.
    fn ensure_ledger(&self, path: &Path) -> u64 {
        if let Some(l) = lock(&self.ledgers).get(path) {
            return l.resume_point();
        }
        let committed = self.committed_offset(path);
        lock(&self.ledgers)
            .entry(path.to_path_buf())
            .or_insert_with(|| OffsetLedger::new(committed))
            .resume_point()
    }

    fn discover(&self, config: &GmemConfig) {
        let root = config.sessions.log_root();
        let window = Duration::from_secs(config.sessions.discover_window_secs);
        for path in discover_logs(&root, Some(window)) {
            if self.registry.is_tracked(&path) {
                continue;
            }
            let offset = self.ensure_ledger(&path);
            // Closed sessions are rediscovered every pass; only new bytes wake them.
            let len = std::fs::metadata(&path).map_or(0, |m| m.len());
            if len <= offset {
                continue;
            }
            if self.registry.track(&path, offset) {
                log::info!("tracking session log {} from offset {offset}", path.display());
            }
        }
    }

    fn register_turns(&self, turns: &[Turn]) {
        let mut ledgers = lock(&self.ledgers);
        for t in turns {
            ledgers
                .entry(t.log_path.clone())
                .or_insert_with(|| OffsetLedger::new(t.start_offset))
                .register(t.start_offset, t.end_offset);
        }
    }

    fn commit(&self, path: &Path, offset: u64) {
        if let Err(e) = self.with_db(|c| db::commit_offset(c, &path.display().to_string(), offset)) {
            log::warn!("committing offset {offset} for {}: {e}", path.display());
        }
    }

    fn finish_turn(&self, path: &Path, start_offset: u64) {
        let advanced = lock(&self.ledgers)
            .get_mut(path)
            .and_then(|l| l.complete(start_offset));
        if let Some(offset) = advanced {
            self.commit(path, offset);
        }
    }

    fn mark_read(&self, path: &Path, offset: u64) {
        let advanced = lock(&self.ledgers)
            .get_mut(path)
            .and_then(|l| l.mark_read(offset));
        if let Some(offset) = advanced {
            self.commit(path, offset);
        }
    }

    /// Hand the last turns of closed sessions to the ledger. Their offset
    /// is kept so a reopened log resumes where the closed reader stopped.
    fn settle_closed(&self, closed: Vec<ClosedSession>) -> Vec<Vec<Turn>> {
        closed
            .into_iter()
            .filter_map(|c| {
                self.register_turns(&c.turns);
                self.mark_read(&c.path, c.offset);
                (!c.turns.is_empty()).then_some(c.turns)
            })
            .collect()
    }

    /// One pass: pick up config edits, discover logs, read every session
    /// concurrently, close idle sessions, then filter and queue the turns
    /// that completed.
    pub async fn ingest_tick(self: &Arc<Self>) -> usize {
        self.reload_config();
        let config = self.config();
        self.discover(&config);
        if self.queue_depth() >= config.daemon.queue_capacity {
            log::debug!("queue at capacity, deferring reads");
            return 0;
        }

        let now = Instant::now();
        let polls = self.registry.handles().into_iter().map(|h| {
            tokio::task::spawn_blocking(move || {
                let mut guard = lock(&h);
                let path = guard.path.clone();
                (path, guard.poll(now))
            })
        });

        let mut batches: Vec<Vec<Turn>> = Vec::new();
        for joined in futures::future::join_all(polls).await {
            match joined {
                Ok((path, Ok(outcome))) => {
                    self.register_turns(&outcome.turns);
                    if let Some(offset) = outcome.idle_offset {
                        self.mark_read(&path, offset);
                    }
                    if !outcome.turns.is_empty() {
                        batches.push(outcome.turns);
                    }
                }
                Ok((path, Err(e))) => log::warn!("reading {}: {e}", path.display()),
                Err(e) => log::warn!("session read task: {e}"),
            }
        }

        let closed = self.registry.expire(now);
        batches.extend(self.settle_closed(closed));

        let n = batches.iter().map(Vec::len).sum();
        // Sessions run concurrently; turns within a session stay in order.
        futures::future::join_all(batches.into_iter().map(|turns| async move {
            for t in turns {
                self.process_turn(t).await;
            }
        }))
        .await;
        n
    }

    fn filter_for(&self, project: Option<&ProjectRef>) -> Arc<ContentFilter> {
        let key = project.map_or_else(String::new, |p| p.canonical.clone());
        if let Some(f) = lock(&self.filters).get(&key) {
            return f.clone();
        }
        let (config, summarizer, redactor) = {
            let live = lock(&self.live);
            (live.config.clone(), live.summarizer.clone(), live.redactor.clone())
        };
        let fc = s5_config::resolve_filter_config(&config, project).unwrap_or_else(|e| {
            log::warn!("filter config for {key:?}: {e}; using defaults");
            Default::default()
        });
        let filter = Arc::new(ContentFilter::new(
            fc,
            summarizer,
            redactor,
            Duration::from_secs(config.summarizer.timeout_secs.max(1)),
        ));
        lock(&self.filters).insert(key, filter.clone());
        filter
    }

    /// Filter, build and queue one turn.
    pub async fn process_turn(self: &Arc<Self>, turn: Turn) {
        let config = self.config();
        let project = turn.project.as_ref();
        if !config.project_enabled(project) {
            log::debug!("skipping turn {} of {}: project disabled", turn.index, turn.session_id);
            self.finish_turn(&turn.log_path, turn.start_offset);
            return;
        }
        let filtered = self.filter_for(project).filter_turn(&turn).await;
        let episode = build_episode(&turn, &filtered, &config, None);
        metrics::count_turn(&episode.group_id, turn.partial);
        log::debug!(
            "turn {} of {}: {} -> {} chars",
            turn.index,
            turn.session_id,
            filtered.raw_chars,
            filtered.filtered_chars
        );
        self.enqueue(
            Job::submit(
                episode,
                JobOrigin::Turn {
                    log_path: turn.log_path.clone(),
                    start_offset: turn.start_offset,
                },
            ),
            false,
        );
    }

    // --- Client requests ---

    async fn await_reply(&self, rx: oneshot::Receiver<Result<String, StoreError>>) -> Result<String, RequestError> {
        let limit = self.submit_timeout() * (self.config().store.max_retries + 2);
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(Ok(id))) => Ok(id),
            Ok(Ok(Err(e))) => Err(RequestError::Store(e)),
            Ok(Err(_)) => Err(RequestError::Internal("request dropped by worker".into())),
            Err(_) => Err(RequestError::Timeout),
        }
    }

    fn accepting(&self) -> Result<(), RequestError> {
        if !self.is_healthy() {
            return Err(RequestError::Store(StoreError::unavailable(
                "knowledge store unreachable; not accepting submissions",
            )));
        }
        if self.queue_depth() >= self.config().daemon.queue_capacity {
            return Err(RequestError::Store(StoreError::transient("submission queue is full")));
        }
        Ok(())
    }

    /// Submit through the serialized worker set and wait for the outcome.
    pub async fn submit_episode(&self, episode: Episode) -> Result<String, RequestError> {
        self.accepting()?;
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            Job {
                kind: JobKind::Submit(Arc::new(episode)),
                origin: JobOrigin::Api,
                reply: Some(tx),
            },
            false,
        );
        self.await_reply(rx).await
    }

    pub async fn delete_episode(&self, id: String) -> Result<String, RequestError> {
        self.accepting()?;
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            Job {
                kind: JobKind::Delete(id),
                origin: JobOrigin::Api,
                reply: Some(tx),
            },
            false,
        );
        self.await_reply(rx).await
    }

    async fn read<T: Send + 'static>(
        &self,
        f: impl FnOnce(&dyn KnowledgeStore) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T, RequestError> {
        let store = self.store.clone();
        match tokio::time::timeout(self.submit_timeout(), tokio::task::spawn_blocking(move || f(store.as_ref()))).await {
            Ok(Ok(r)) => r.map_err(|e| {
                if e.kind == StoreErrorKind::Unavailable {
                    self.mark_unhealthy(&e);
                }
                RequestError::Store(e)
            }),
            Ok(Err(join)) => Err(RequestError::Internal(join.to_string())),
            Err(_) => Err(RequestError::Timeout),
        }
    }

    /// Read-only; runs concurrently with submissions.
    pub async fn search(&self, query: SearchQuery) -> Result<Value, RequestError> {
        self.read(move |s| s.search(&query)).await
    }

    pub async fn recent(&self, group_id: String, limit: usize) -> Result<Value, RequestError> {
        self.read(move |s| s.recent(&group_id, limit)).await
    }

    pub fn list_failed(&self, limit: usize) -> Result<Vec<FailedEpisode>, RequestError> {
        Ok(self.with_db(|c| db::list_failed(c, limit))?)
    }

    /// Put a parked episode back on the queue.
    pub fn retry_failed(&self, id: i64) -> Result<FailedEpisode, RequestError> {
        let failed = self
            .with_db(|c| db::get_failed(c, id))?
            .ok_or_else(|| RequestError::NotFound(format!("no failed episode {id}")))?;
        log::info!("re-queueing parked episode {} ({})", failed.id, failed.episode.name);
        self.enqueue(
            Job::submit(
                failed.episode.clone(),
                JobOrigin::Retry {
                    idempotency_key: failed.idempotency_key.clone(),
                },
            ),
            false,
        );
        Ok(failed)
    }

    /// Historical sync over logs the live tracker does not own.
    pub async fn sync(self: &Arc<Self>, request: SyncRequest) -> Result<SyncReport, RequestError> {
        self.reload_config();
        let root = self.config().sessions.log_root();
        let state = self.clone();
        let scan_req = request.clone();
        let scan = tokio::task::spawn_blocking(move || {
            scan_history(
                &root,
                &scan_req,
                &|p| state.committed_offset(p),
                &|p| state.registry.is_tracked(p),
            )
        })
        .await
        .map_err(|e| RequestError::Internal(e.to_string()))??;

        if !request.dry_run {
            for t in &scan.turns {
                self.ensure_ledger(&t.log_path);
            }
            self.register_turns(&scan.turns);
            for t in scan.turns {
                self.process_turn(t).await;
            }
            log::info!("sync queued {} turn(s)", scan.report.queued);
        }
        Ok(scan.report)
    }

    pub fn status(&self) -> Value {
        let failed = self.with_db(db::count_failed).unwrap_or_else(|e| {
            log::warn!("counting failed episodes: {e}");
            0
        });
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "pid": std::process::id(),
            "uptime_secs": self.started.elapsed().as_secs(),
            "store_backend": self.store.name(),
            "store_healthy": self.is_healthy(),
            "last_health_check": self.last_health_check(),
            "queue_depth": self.queue_depth(),
            "in_flight": self.in_flight.load(Ordering::SeqCst),
            "workers": self.config().daemon.workers.max(1),
            "submitted": self.submitted(),
            "parked": self.parked.load(Ordering::SeqCst),
            "failed": failed,
            "sessions": self.registry.counts(),
        })
    }

    // --- Shutdown ---

    /// Stop reading, flush every session and drain the queue, all inside
    /// the grace period. Turns still queued at the deadline keep their log
    /// offset uncommitted and are re-read on the next start.
    pub async fn shutdown(self: &Arc<Self>, tasks: DaemonTasks) {
        let grace = self.config().daemon.grace_period();
        let deadline = tokio::time::Instant::now() + grace.saturating_sub(SHUTDOWN_MARGIN);
        self.shutdown.send_replace(true);

        let mut ingest = tasks.ingest;
        if tokio::time::timeout_at(deadline, &mut ingest).await.is_err() {
            log::warn!("ingest pass still running at the deadline; abandoning it");
            ingest.abort();
        }

        let closed = self.registry.close_all();
        let flush = async {
            for turns in self.settle_closed(closed) {
                for t in turns {
                    self.process_turn(t).await;
                }
            }
        };
        if tokio::time::timeout_at(deadline, flush).await.is_err() {
            log::warn!("flushing sessions ran past the deadline");
        }

        while (self.queue_depth() > 0 || self.in_flight.load(Ordering::SeqCst) > 0)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.stop_workers.send_replace(true);
        for w in tasks.workers {
            let _ = w.await;
        }
        let _ = tasks.health.await;

        let leftovers: Vec<Job> = lock(&self.queue).drain(..).collect();
        let mut reread = 0;
        for mut job in leftovers {
            match &job.origin {
                JobOrigin::Turn { .. } => reread += 1,
                JobOrigin::Retry { idempotency_key } => {
                    log::debug!("parked episode {idempotency_key} stays parked");
                }
                JobOrigin::Api => {}
            }
            if let Some(tx) = job.reply.take() {
                let _ = tx.send(Err(StoreError::transient("daemon stopped before submission")));
            }
        }
        if reread > 0 {
            log::warn!("grace period over; {reread} turn(s) will be re-read on restart");
        }
        log::info!(
            "daemon stopped: {} submitted, {} parked",
            self.submitted(),
            self.parked.load(Ordering::SeqCst)
        );
    }
}

/// Time kept back from the grace period for stopping workers and exiting.
const SHUTDOWN_MARGIN: Duration = Duration::from_millis(250);

/// Exclusive advisory lock held for the life of the process; the file
/// carries the holder's pid.
pub fn acquire_lock(path: &Path) -> Result<File, GmemError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
        {
            let holder = std::fs::read_to_string(path).unwrap_or_default();
            return Err(GmemError::Lock(format!(
                "{} is held by pid {}",
                path.display(),
                holder.trim()
            )));
        }
        Err(e) => return Err(e.into()),
    }
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(file)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("installing SIGTERM handler: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Run the daemon in the foreground until SIGINT/SIGTERM.
pub async fn run_daemon(config: GmemConfig, config_path: Option<PathBuf>) -> Result<(), GmemError> {
    let home = crate::gmem_home();
    let _lock = acquire_lock(&home.join("daemon.lock"))?;
    let _meter = metrics::init_meter_provider(&config.metrics);

    let conn = db::open_db(&crate::default_db_path())?;
    let store = build_store(&config.store);
    let addr = format!("{}:{}", config.daemon.host, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!(
        "gmem daemon {} listening on {} (store: {} at {}, logs: {})",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?,
        store.name(),
        config.store.endpoint,
        config.sessions.log_root().display()
    );

    let state = DaemonState::new(config, store, conn, config_path)?;
    let tasks = state.spawn();

    let mut shutdown_rx = state.shutdown_signal();
    let app = crate::s1_serve::router(state.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stopped(&mut shutdown_rx).await })
            .await
    });

    wait_for_signal().await;
    log::info!("shutdown requested");
    state.shutdown(tasks).await;

    match server.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(GmemError::Io(std::io::Error::other(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s1_store::MemoryStore;

    fn test_config(root: &Path) -> GmemConfig {
        let mut config = GmemConfig::default();
        config.sessions.log_root = Some(root.to_path_buf());
        config.sessions.scan_interval_ms = 20;
        config.sessions.turn_settle_ms = 30;
        config.store.backoff_base_ms = 10;
        config.store.backoff_max_ms = 40;
        config.daemon.grace_period_ms = 2000;
        config.summarizer.backend = crate::s5_config::SummarizerBackend::None;
        config
    }

    fn state(root: &Path, store: Arc<MemoryStore>) -> Arc<DaemonState> {
        DaemonState::new(test_config(root), store, db::open_in_memory().unwrap(), None).unwrap()
    }

    async fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn api_submission_rejected_while_unhealthy() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let s = state(dir.path(), store);
        // Never pinged yet.
        let err = s.submit_episode(Episode::default()).await.unwrap_err();
        assert_eq!(err.kind(), "store_unavailable");
    }

    #[tokio::test]
    async fn submit_and_delete_through_workers() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let s = state(dir.path(), store.clone());
        let tasks = s.spawn();
        assert!(wait_until(|| s.is_healthy()).await);

        let ep = Episode { name: "manual".into(), body: "note".into(), group_id: "g".into(), idempotency_key: "k".into(), ..Default::default() };
        let id = s.submit_episode(ep).await.unwrap();
        assert_eq!(store.episodes().len(), 1);
        s.delete_episode(id.clone()).await.unwrap();
        assert!(store.episodes().is_empty());
        assert_eq!(s.delete_episode(id).await.unwrap_err().kind(), "store_rejected");

        s.shutdown(tasks).await;
    }

    #[tokio::test]
    async fn retry_failed_resubmits_and_clears() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let s = state(dir.path(), store.clone());
        let ep = Episode { name: "parked".into(), group_id: "g".into(), idempotency_key: "pk".into(), ..Default::default() };
        let id = s.with_db(|c| db::park_failed(c, &ep, "store_transient", "HTTP 503", 4)).unwrap();

        assert!(matches!(s.retry_failed(id + 100), Err(RequestError::NotFound(_))));
        let tasks = s.spawn();
        s.retry_failed(id).unwrap();
        assert!(wait_until(|| store.episodes().len() == 1).await);
        assert!(wait_until(|| s.list_failed(10).unwrap().is_empty()).await);
        s.shutdown(tasks).await;
    }

    #[tokio::test]
    async fn outage_without_traffic_is_noticed_by_the_health_check() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut config = test_config(dir.path());
        config.store.health_interval_ms = 30;
        let s = DaemonState::new(config, store.clone(), db::open_in_memory().unwrap(), None).unwrap();
        let tasks = s.spawn();
        assert!(wait_until(|| s.is_healthy()).await);
        assert_eq!(s.status()["last_health_check"]["ok"], true);

        store.set_available(false);
        assert!(wait_until(|| !s.is_healthy()).await);
        let status = s.status();
        assert_eq!(status["store_healthy"], false);
        assert_eq!(status["last_health_check"]["ok"], false);
        assert!(status["last_health_check"]["detail"].as_str().unwrap().contains("connection refused"));
        assert_eq!(store.add_calls(), 0);

        store.set_available(true);
        assert!(wait_until(|| s.is_healthy()).await);
        s.shutdown(tasks).await;
    }

    #[tokio::test]
    async fn dequeued_job_waits_when_health_dropped_meanwhile() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let s = state(dir.path(), store.clone());
        let tasks = s.spawn();
        assert!(wait_until(|| s.is_healthy()).await);
        // Workers are now parked on the empty queue.
        tokio::time::sleep(Duration::from_millis(20)).await;

        s.healthy.send_replace(false);
        let ep = Episode { name: "late".into(), group_id: "g".into(), idempotency_key: "late".into(), ..Default::default() };
        s.enqueue(Job::submit(ep, JobOrigin::Api), false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.add_calls(), 0);
        assert_eq!(s.queue_depth(), 1);

        s.reconnect.notify_one();
        assert!(wait_until(|| store.episodes().len() == 1).await);
        assert_eq!(store.add_calls(), 1);
        s.shutdown(tasks).await;
    }

    fn write_log_pair(path: &Path, n: usize) {
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path).unwrap();
        for (kind, text) in [("user", format!("q{n}")), ("assistant", format!("a{n}"))] {
            let rec = json!({"type": kind, "sessionId": "live", "cwd": "/work/app", "message": {"content": text}});
            writeln!(f, "{rec}").unwrap();
        }
    }

    async fn settled_tick(s: &Arc<DaemonState>) {
        s.ingest_tick().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        s.ingest_tick().await;
    }

    #[tokio::test]
    async fn config_edits_apply_without_restart() {
        let logs = tempfile::TempDir::new().unwrap();
        let home = tempfile::TempDir::new().unwrap();
        let cfg_path = home.path().join("config.json");
        let base = json!({
            "sessions": {"log_root": logs.path(), "scan_interval_ms": 20, "turn_settle_ms": 30},
            "summarizer": {"backend": "none"},
        });
        std::fs::write(&cfg_path, base.to_string()).unwrap();
        let config = s5_config::load_config_from(&cfg_path).unwrap();
        let s = DaemonState::new(config, Arc::new(MemoryStore::new()), db::open_in_memory().unwrap(), Some(cfg_path.clone()))
            .unwrap();
        assert!(!s.reload_config());

        let log = logs.path().join("live.jsonl");
        write_log_pair(&log, 0);
        settled_tick(&s).await;
        assert_eq!(s.queue_depth(), 1);

        let mut disabled = base.clone();
        disabled["projects"] = json!({"/work/app": {"enabled": false}});
        std::fs::write(&cfg_path, disabled.to_string()).unwrap();
        write_log_pair(&log, 1);
        settled_tick(&s).await;
        assert_eq!(s.queue_depth(), 1);
        let project = crate::s5_project::resolve("/work/app").unwrap();
        assert!(!s.config().project_enabled(Some(&project)));

        // A broken file leaves the running configuration in place.
        std::fs::write(&cfg_path, "{ not json").unwrap();
        assert!(!s.reload_config());
        assert!(!s.config().project_enabled(Some(&project)));

        std::fs::write(&cfg_path, base.to_string()).unwrap();
        assert!(s.reload_config());
        write_log_pair(&log, 2);
        settled_tick(&s).await;
        assert_eq!(s.queue_depth(), 2);
    }

    /// Accepts pings, but holds every submission until released.
    #[derive(Default)]
    struct StalledStore {
        release: std::sync::atomic::AtomicBool,
        inner: MemoryStore,
    }

    impl KnowledgeStore for StalledStore {
        fn name(&self) -> &'static str {
            "stalled"
        }
        fn add_episode(&self, episode: &Episode) -> Result<String, StoreError> {
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            self.inner.add_episode(episode)
        }
        fn search(&self, query: &SearchQuery) -> Result<Value, StoreError> {
            self.inner.search(query)
        }
        fn recent(&self, group_id: &str, limit: usize) -> Result<Value, StoreError> {
            self.inner.recent(group_id, limit)
        }
        fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id)
        }
        fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_bounded_by_the_grace_period() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(StalledStore::default());
        let mut config = test_config(dir.path());
        config.daemon.grace_period_ms = 600;
        config.daemon.submit_timeout_secs = 30;
        let s = DaemonState::new(config, store.clone(), db::open_in_memory().unwrap(), None).unwrap();
        let tasks = s.spawn();

        let log = dir.path().join("live.jsonl");
        write_log_pair(&log, 0);
        assert!(wait_until(|| s.in_flight.load(Ordering::SeqCst) == 1).await);

        let started = Instant::now();
        s.shutdown(tasks).await;
        assert!(started.elapsed() < Duration::from_millis(600), "{:?}", started.elapsed());

        // Neither parked nor committed: the turn is read again on restart.
        assert!(s.list_failed(10).unwrap().is_empty());
        let key = log.display().to_string();
        assert_eq!(s.with_db(|c| db::committed_offset(c, &key)).unwrap(), 0);
        store.release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("x.lock");
        let held = acquire_lock(&path).unwrap();
        assert!(matches!(acquire_lock(&path), Err(GmemError::Lock(_))));
        drop(held);
        assert!(acquire_lock(&path).is_ok());
    }
}
