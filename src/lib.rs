pub mod cli;
pub mod db;
pub mod metrics;
pub mod s1_4_summarize;
pub mod s1_extract;
pub mod s1_index;
pub mod s1_serve;
pub mod s1_store;
pub mod s1_transcript;
pub mod s2_activity;
pub mod s2_reduce;
pub mod s2_registry;
pub mod s2_turn;
pub mod s3_daemon;
pub mod s4_sync;
pub mod s5_config;
pub mod s5_project;
pub mod s5_redact;
pub mod s5_service;
pub mod s5_supervisor;
pub mod schema;

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Connection refused, DNS failure, reset: the store is not reachable.
    Unavailable,
    /// Timeout or server-side error; the same request may succeed later.
    Transient,
    /// Auth failure or permanent rejection of this request.
    Fatal,
}

impl StoreErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreErrorKind::Unavailable => "store_unavailable",
            StoreErrorKind::Transient => "store_transient",
            StoreErrorKind::Fatal => "store_rejected",
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, StoreErrorKind::Fatal)
    }
}

#[derive(Debug, Clone)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Unavailable, message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Transient, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Fatal, message: message.into() }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug)]
pub enum GmemError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(String),
    Path(String),
    Store(StoreError),
    Summarizer(String),
    Lock(String),
}

impl std::fmt::Display for GmemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GmemError::Database(e) => write!(f, "database: {e}"),
            GmemError::Io(e) => write!(f, "io: {e}"),
            GmemError::Json(e) => write!(f, "json: {e}"),
            GmemError::Config(msg) => write!(f, "config: {msg}"),
            GmemError::Path(msg) => write!(f, "path: {msg}"),
            GmemError::Store(e) => write!(f, "store: {e}"),
            GmemError::Summarizer(msg) => write!(f, "summarizer: {msg}"),
            GmemError::Lock(msg) => write!(f, "lock: {msg}"),
        }
    }
}

impl std::error::Error for GmemError {}

impl From<rusqlite::Error> for GmemError {
    fn from(e: rusqlite::Error) -> Self {
        GmemError::Database(e)
    }
}

impl From<std::io::Error> for GmemError {
    fn from(e: std::io::Error) -> Self {
        GmemError::Io(e)
    }
}

impl From<serde_json::Error> for GmemError {
    fn from(e: serde_json::Error) -> Self {
        GmemError::Json(e)
    }
}

impl From<StoreError> for GmemError {
    fn from(e: StoreError) -> Self {
        GmemError::Store(e)
    }
}

impl From<rusqlite_migration::Error> for GmemError {
    fn from(e: rusqlite_migration::Error) -> Self {
        match e {
            rusqlite_migration::Error::RusqliteError { query: _, err } => GmemError::Database(err),
            other => GmemError::Config(format!("migration: {other}")),
        }
    }
}

/// Runtime directory: `GMEM_HOME`, else `$HOME/.gmem`.
pub fn gmem_home() -> PathBuf {
    if let Ok(p) = std::env::var("GMEM_HOME")
        && !p.is_empty()
    {
        return PathBuf::from(p);
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".gmem")
}

pub fn default_db_path() -> PathBuf {
    gmem_home().join("gmem.db")
}
