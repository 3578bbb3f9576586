use crate::s1_transcript::{ConversationContext, Message, parse_log};
use crate::s2_turn::{Turn, is_turn_complete, split_turns};
use crate::s5_config::DEFAULT_TURN_SETTLE_MS;
use crate::GmemError;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Discovering,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Discovering => "discovering",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Default)]
pub struct PollOutcome {
    pub turns: Vec<Turn>,
    pub new_messages: usize,
    pub skipped: usize,
    /// Set when nothing is buffered: every byte up to here is accounted for.
    pub idle_offset: Option<u64>,
}

/// What is left of a session once it is closed and dropped from the registry.
#[derive(Debug)]
pub struct ClosedSession {
    pub path: PathBuf,
    /// Every byte before this was read and handed out in `turns` or earlier.
    pub offset: u64,
    pub turns: Vec<Turn>,
}

/// One tracked session log.
#[derive(Debug)]
pub struct SessionHandle {
    pub path: PathBuf,
    pub state: SessionState,
    pub context: ConversationContext,
    /// Parse position: every complete line before it has been read.
    pub offset: u64,
    /// Log offset where the oldest buffered message's line starts.
    context_start: u64,
    next_index: u64,
    pub turns_emitted: u64,
    pub last_activity: Instant,
    settle: Duration,
}

impl SessionHandle {
    pub fn new(path: PathBuf, committed_offset: u64) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            state: SessionState::Discovering,
            context: ConversationContext::new(stem),
            offset: committed_offset,
            context_start: committed_offset,
            next_index: 0,
            turns_emitted: 0,
            last_activity: Instant::now(),
            settle: Duration::from_millis(DEFAULT_TURN_SETTLE_MS),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Read appended bytes and hand out every turn that is now complete.
    pub fn poll(&mut self, now: Instant) -> Result<PollOutcome, GmemError> {
        let batch = parse_log(&self.path, self.offset)?;
        let mut out = PollOutcome {
            skipped: batch.skipped,
            ..Default::default()
        };

        if let Some(id) = &batch.session_id
            && self.context.session_id != *id
            && self.turns_emitted == 0
        {
            self.context.session_id = id.clone();
        }
        self.offset = batch.new_offset;
        out.new_messages = self.context.absorb(batch);

        if out.new_messages > 0 {
            self.last_activity = now;
        }
        self.state = SessionState::Active;

        let mut ranges = split_turns(&self.context.messages);
        // A reply at the very end may still be followed by tool work of the
        // same turn. Hold it until a new prompt arrives or the log settles.
        if is_turn_complete(&self.context.messages)
            && now.saturating_duration_since(self.last_activity) < self.settle
        {
            ranges.pop();
        }
        out.turns = self.take_turns(ranges);
        if self.context.is_empty() {
            self.context_start = self.offset;
            out.idle_offset = Some(self.offset);
        }
        Ok(out)
    }

    fn take_turns(&mut self, ranges: Vec<Range<usize>>) -> Vec<Turn> {
        let Some(last) = ranges.last() else {
            return Vec::new();
        };
        let mut taken = self.context.take_through(last.end - 1).into_iter();
        ranges
            .into_iter()
            .map(|r| {
                let msgs: Vec<Message> = taken.by_ref().take(r.len()).collect();
                self.make_turn(msgs, false)
            })
            .collect()
    }

    fn make_turn(&mut self, messages: Vec<Message>, partial: bool) -> Turn {
        let start = self.context_start;
        let end = messages.last().map_or(start, |m| m.end_offset);
        self.context_start = end;
        let index = self.next_index;
        self.next_index += 1;
        self.turns_emitted += 1;
        Turn {
            session_id: self.context.session_id.clone(),
            log_path: self.path.clone(),
            index,
            messages,
            start_offset: start,
            end_offset: end,
            partial,
            project: self.context.project.clone(),
        }
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.state == SessionState::Active && now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// Active -> Closing -> Closed. Completed turns still buffered go out
    /// whole; an unfinished tail is flushed as a partial turn, never dropped.
    pub fn close(&mut self) -> Vec<Turn> {
        self.state = SessionState::Closing;
        let mut turns = self.take_turns(split_turns(&self.context.messages));
        let rest = self.context.take_all();
        if !rest.is_empty() {
            turns.push(self.make_turn(rest, true));
        }
        self.context_start = self.offset;
        self.state = SessionState::Closed;
        turns
    }

    pub fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            path: self.path.display().to_string(),
            session_id: self.context.session_id.clone(),
            state: self.state,
            offset: self.offset,
            buffered_messages: self.context.len(),
            turns_emitted: self.turns_emitted,
            idle_secs: now.saturating_duration_since(self.last_activity).as_secs(),
            project: self.context.project.as_ref().map(|p| p.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub path: String,
    pub session_id: String,
    pub state: SessionState,
    pub offset: u64,
    pub buffered_messages: usize,
    pub turns_emitted: u64,
    pub idle_secs: u64,
    pub project: Option<String>,
}

/// All tracked sessions. Each session has its own lock so reads of
/// independent logs never wait on each other. Closed sessions leave the map.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<PathBuf, Arc<Mutex<SessionHandle>>>>,
    inactivity_ms: AtomicU64,
    settle_ms: AtomicU64,
}

impl SessionRegistry {
    pub fn new(inactivity: Duration, settle: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            inactivity_ms: AtomicU64::new(inactivity.as_millis() as u64),
            settle_ms: AtomicU64::new(settle.as_millis() as u64),
        }
    }

    /// Applies to the next expiry pass and to sessions tracked from now on.
    pub fn set_timing(&self, inactivity: Duration, settle: Duration) {
        self.inactivity_ms.store(inactivity.as_millis() as u64, Ordering::Relaxed);
        self.settle_ms.store(settle.as_millis() as u64, Ordering::Relaxed);
    }

    fn inactivity(&self) -> Duration {
        Duration::from_millis(self.inactivity_ms.load(Ordering::Relaxed))
    }

    /// Start tracking a log from `offset`. False if already tracked.
    pub fn track(&self, path: &Path, offset: u64) -> bool {
        let Ok(mut map) = self.sessions.lock() else {
            return false;
        };
        if map.contains_key(path) {
            return false;
        }
        log::debug!("tracking {} from offset {offset}", path.display());
        let settle = Duration::from_millis(self.settle_ms.load(Ordering::Relaxed));
        let handle = SessionHandle::new(path.to_path_buf(), offset).with_settle(settle);
        map.insert(path.to_path_buf(), Arc::new(Mutex::new(handle)));
        true
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.sessions.lock().is_ok_and(|m| m.contains_key(path))
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<Arc<Mutex<SessionHandle>>> {
        self.sessions
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Close and drop every session idle past the inactivity timeout.
    pub fn expire(&self, now: Instant) -> Vec<ClosedSession> {
        let timeout = self.inactivity();
        self.close_where(|h| {
            let idle = h.is_idle(now, timeout);
            if idle {
                log::info!("session {} idle for {}s, closing", h.context.session_id, timeout.as_secs());
            }
            idle
        })
    }

    /// Force-flush and drop every session.
    pub fn close_all(&self) -> Vec<ClosedSession> {
        self.close_where(|_| true)
    }

    fn close_where(&self, mut pick: impl FnMut(&SessionHandle) -> bool) -> Vec<ClosedSession> {
        let mut closed = Vec::new();
        for handle in self.handles() {
            let Ok(mut h) = handle.lock() else { continue };
            if pick(&*h) {
                let turns = h.close();
                closed.push(ClosedSession {
                    path: h.path.clone(),
                    offset: h.offset,
                    turns,
                });
            }
        }
        if let Ok(mut map) = self.sessions.lock() {
            for c in &closed {
                map.remove(&c.path);
            }
        }
        closed
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut list: Vec<SessionInfo> = self
            .handles()
            .iter()
            .filter_map(|h| h.lock().ok().map(|h| h.info(now)))
            .collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for h in self.handles() {
            if let Ok(h) = h.lock() {
                *counts.entry(h.state.as_str()).or_default() += 1;
            }
        }
        counts
    }
}

/// Session logs under `root`: `*.jsonl` in the root and one directory down.
/// With a window, only logs modified within it.
pub fn discover_logs(root: &Path, window: Option<Duration>) -> Vec<PathBuf> {
    let cutoff = window.and_then(|w| SystemTime::now().checked_sub(w));
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Ok(inner) = std::fs::read_dir(&path) {
                out.extend(inner.flatten().map(|e| e.path()).filter(|p| is_log(p, cutoff)));
            }
        } else if is_log(&path, cutoff) {
            out.push(path);
        }
    }
    out.sort();
    out
}

fn is_log(path: &Path, cutoff: Option<SystemTime>) -> bool {
    if path.extension().is_none_or(|e| e != "jsonl") || !path.is_file() {
        return false;
    }
    match cutoff {
        Some(c) => std::fs::metadata(path)
            .and_then(|m| m.modified())
            .is_ok_and(|t| t >= c),
        None => true,
    }
}
