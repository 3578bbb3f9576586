use crate::s1_store::KnowledgeStore;
use crate::s1_transcript::{Role, time_range, token_total, touched_files};
use crate::s2_activity::ActivityVector;
use crate::s2_reduce::FilteredTurn;
use crate::s2_turn::Turn;
use crate::s5_config::{GmemConfig, StoreConfig};
use crate::s5_project::ProjectRef;
use crate::{StoreError, StoreErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const BUILTIN_INSTRUCTION: &str = "This episode is one turn of a coding session between a developer and an AI assistant. \
Summarize what was asked and what was done, then extract entities (files, modules, tools, errors, libraries, decisions) \
and the relationships between them. Prefer durable facts over conversational detail.";

/// One submission to the knowledge store: a filtered turn plus everything
/// needed to summarize and extract it in a single external call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub name: String,
    pub body: String,
    pub source: String,
    pub group_id: String,
    pub timestamp: String,
    pub metadata: Value,
    pub preprocessing_instruction: String,
    pub idempotency_key: String,
}

impl Episode {
    /// Stable, UUID-shaped id derived from the idempotency key.
    pub fn episode_id(&self) -> String {
        let digest = Sha256::digest(self.idempotency_key.as_bytes());
        let h: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
        format!("{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
    }
}

pub fn idempotency_key(session_id: &str, start_offset: u64, end_offset: u64) -> String {
    let digest = Sha256::digest(format!("{session_id}:{start_offset}:{end_offset}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Priority chain: explicit override, per-project, global inline, global
/// file, built-in.
pub fn resolve_instruction(
    config: &GmemConfig,
    project: Option<&ProjectRef>,
    override_instruction: Option<&str>,
) -> String {
    let non_empty = |s: &str| !s.trim().is_empty();

    if let Some(s) = override_instruction.filter(|s| non_empty(s)) {
        return s.to_string();
    }
    if let Some(s) = project
        .and_then(|p| config.project_config(p))
        .and_then(|pc| pc.preprocessing_instruction.as_deref())
        .filter(|s| non_empty(s))
    {
        return s.to_string();
    }
    if let Some(s) = config.preprocessing.instruction.as_deref().filter(|s| non_empty(s)) {
        return s.to_string();
    }
    if let Some(path) = &config.preprocessing.instruction_file {
        match std::fs::read_to_string(path) {
            Ok(s) if non_empty(&s) => return s.trim().to_string(),
            Ok(_) => log::warn!("instruction file {} is empty", path.display()),
            Err(e) => log::warn!("instruction file {}: {e}", path.display()),
        }
    }
    BUILTIN_INSTRUCTION.to_string()
}

/// Render the filtered turn as a plain-text transcript.
pub fn format_body(filtered: &FilteredTurn) -> String {
    let mut out = String::new();
    for m in &filtered.messages {
        let stamp = m
            .timestamp
            .map(|t| format!("[{}] ", t.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_default();
        if !m.text.is_empty() && m.role != Role::Tool {
            out.push_str(&format!("{stamp}{}: {}\n", m.role.label(), m.text));
        }
        if let Some(t) = &m.thinking {
            out.push_str(&format!("  (thinking) {t}\n"));
        }
        for line in &m.tools {
            out.push_str(&format!("  -> {line}\n"));
        }
    }
    out
}

pub fn build_episode(
    turn: &Turn,
    filtered: &FilteredTurn,
    config: &GmemConfig,
    override_instruction: Option<&str>,
) -> Episode {
    let project = turn.project.as_ref();
    let group_id = config.group_id(project);
    let body = format_body(filtered);
    let activity = ActivityVector::from_messages(&turn.messages);
    let range = time_range(&turn.messages);
    let timestamp = range
        .map(|(start, _)| start)
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339();
    let estimated_tokens = (body.chars().count() as f64 / config.activity.chars_per_token).ceil() as u64;

    let project_name = project.map_or("unknown", |p| p.name.as_str());
    let short_session: String = turn.session_id.chars().take(8).collect();

    let mut metadata = json!({
        "session_id": turn.session_id,
        "turn_index": turn.index,
        "timestamp": timestamp,
        "touched_files": touched_files(&turn.messages),
        "activity": activity.summary(config.activity.threshold),
        "partial": turn.partial,
        "estimated_tokens": estimated_tokens,
        "token_usage": token_total(&turn.messages),
        "log_path": turn.log_path.display().to_string(),
        "start_offset": turn.start_offset,
        "end_offset": turn.end_offset,
        "raw_chars": filtered.raw_chars,
        "filtered_chars": filtered.filtered_chars,
    });
    metadata["project"] = match project {
        Some(p) => json!({
            "namespace": group_id,
            "id": p.id,
            "path": p.canonical,
            "name": p.name,
        }),
        None => json!({"namespace": group_id}),
    };
    if let Some((start, end)) = range {
        metadata["time_range"] = json!({"start": start.to_rfc3339(), "end": end.to_rfc3339()});
    }

    Episode {
        name: format!("{project_name} turn {} ({short_session})", turn.index),
        body,
        source: format!("gmem session {}", turn.session_id),
        group_id,
        timestamp,
        metadata,
        preprocessing_instruction: resolve_instruction(config, project, override_instruction),
        idempotency_key: idempotency_key(&turn.session_id, turn.start_offset, turn.end_offset),
    }
}

/// Submit once on the blocking pool with a hard deadline. A deadline
/// overrun is a transient failure, never a hang.
pub async fn submit_once(
    store: Arc<dyn KnowledgeStore>,
    episode: Arc<Episode>,
    timeout: Duration,
) -> Result<String, StoreError> {
    let task = tokio::task::spawn_blocking(move || store.add_episode(&episode));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(StoreError::transient(format!("submit task: {join}"))),
        Err(_) => Err(StoreError::transient(format!(
            "submission timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

#[derive(Debug)]
pub struct SubmitFailure {
    pub error: StoreError,
    pub attempts: u32,
}

/// Retry transient failures with bounded exponential backoff. Unavailable
/// and fatal errors return at once; the caller owns reconnect and parking.
pub async fn submit_with_retry(
    store: Arc<dyn KnowledgeStore>,
    episode: Arc<Episode>,
    policy: &StoreConfig,
    timeout: Duration,
) -> Result<String, SubmitFailure> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match submit_once(store.clone(), episode.clone(), timeout).await {
            Ok(id) => return Ok(id),
            Err(error) if error.kind == StoreErrorKind::Transient && attempts <= policy.max_retries => {
                let delay = policy.backoff(attempts);
                log::warn!(
                    "episode {}: {error}, retry {attempts}/{} in {}ms",
                    episode.name,
                    policy.max_retries,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(SubmitFailure { error, attempts }),
        }
    }
}

/// Tracks in-flight turns per log so the committed offset only advances
/// past a turn once it is submitted or parked, and only contiguously.
#[derive(Debug, Clone, Default)]
pub struct OffsetLedger {
    committed: u64,
    /// Everything before this was read and handed out as turns (or held none).
    read_through: u64,
    /// start offset -> (end offset, finished)
    pending: BTreeMap<u64, (u64, bool)>,
}

impl OffsetLedger {
    pub fn new(committed: u64) -> Self {
        Self {
            committed,
            read_through: committed,
            pending: BTreeMap::new(),
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Where a fresh reader of this log picks up: past everything already
    /// handed out, whether or not it is committed yet.
    pub fn resume_point(&self) -> u64 {
        self.committed.max(self.read_through)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn register(&mut self, start: u64, end: u64) {
        if end > self.committed {
            self.pending.entry(start).or_insert((end, false));
        }
    }

    /// Mark the turn starting at `start` finished. Returns the new committed
    /// offset if it advanced.
    pub fn complete(&mut self, start: u64) -> Option<u64> {
        if let Some(entry) = self.pending.get_mut(&start) {
            entry.1 = true;
        }
        let before = self.committed;
        while let Some((&s, &(end, done))) = self.pending.iter().next() {
            if !done {
                break;
            }
            self.pending.remove(&s);
            self.committed = self.committed.max(end);
        }
        self.catch_up();
        (self.committed > before).then_some(self.committed)
    }

    /// Record that every byte before `offset` has been handed out. Commits
    /// at once if nothing is in flight, otherwise when the last turn lands.
    pub fn mark_read(&mut self, offset: u64) -> Option<u64> {
        self.read_through = self.read_through.max(offset);
        let before = self.committed;
        self.catch_up();
        (self.committed > before).then_some(self.committed)
    }

    fn catch_up(&mut self) {
        if self.pending.is_empty() {
            self.committed = self.committed.max(self.read_through);
        }
    }
}
