use crate::s2_registry::{SessionHandle, discover_logs};
use crate::s2_turn::Turn;
use crate::s5_project;
use crate::GmemError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Upper bound on episodes one sync request may enqueue.
pub const MAX_ITEMS_CAP: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Restrict to one project (any path form).
    #[serde(default)]
    pub project: Option<String>,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            dry_run: default_dry_run(),
            max_items: default_max_items(),
            project: None,
        }
    }
}

fn default_dry_run() -> bool {
    true
}

fn default_max_items() -> usize {
    50
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub logs_scanned: usize,
    /// Logs left to the live session tracker.
    pub logs_skipped: usize,
    pub turns_found: usize,
    pub partial_turns: usize,
    pub queued: usize,
    pub max_items: usize,
    /// More turns were found than `max_items` allows.
    pub capped: bool,
    pub projects: BTreeMap<String, usize>,
}

pub struct SyncScan {
    pub report: SyncReport,
    /// Oldest first, at most `max_items`.
    pub turns: Vec<Turn>,
}

/// Walk every log under `root` and collect turns past each log's committed
/// offset. Nothing is submitted here.
pub fn scan_history(
    root: &Path,
    request: &SyncRequest,
    committed: &dyn Fn(&Path) -> u64,
    skip: &dyn Fn(&Path) -> bool,
) -> Result<SyncScan, GmemError> {
    let project_filter = match &request.project {
        Some(p) => Some(s5_project::resolve(p)?.canonical),
        None => None,
    };
    let max_items = request.max_items.min(MAX_ITEMS_CAP);

    let mut report = SyncReport {
        dry_run: request.dry_run,
        max_items,
        ..Default::default()
    };
    let mut turns: Vec<Turn> = Vec::new();

    for path in discover_logs(root, None) {
        if skip(&path) {
            report.logs_skipped += 1;
            continue;
        }
        report.logs_scanned += 1;
        for turn in session_turns(path, committed)? {
            if let Some(filter) = &project_filter
                && turn.project.as_ref().is_none_or(|p| &p.canonical != filter)
            {
                continue;
            }
            report.turns_found += 1;
            if turn.partial {
                report.partial_turns += 1;
            }
            let name = turn
                .project
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |p| p.name.clone());
            *report.projects.entry(name).or_default() += 1;
            if turns.len() < max_items {
                turns.push(turn);
            } else {
                report.capped = true;
            }
        }
    }

    if !request.dry_run {
        report.queued = turns.len();
    }
    Ok(SyncScan { report, turns })
}

fn session_turns(path: PathBuf, committed: &dyn Fn(&Path) -> u64) -> Result<Vec<Turn>, GmemError> {
    let start = committed(&path);
    let mut handle = SessionHandle::new(path, start);
    let mut turns = Vec::new();
    // Reads are bounded per poll; keep going until the log is exhausted.
    loop {
        let before = handle.offset;
        match handle.poll(Instant::now()) {
            Ok(outcome) => turns.extend(outcome.turns),
            Err(e) => {
                log::warn!("sync: {}: {e}", handle.path.display());
                return Ok(Vec::new());
            }
        }
        if handle.offset == before {
            break;
        }
    }
    turns.extend(handle.close());
    Ok(turns)
}
