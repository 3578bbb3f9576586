use crate::s1_index::Episode;
use crate::s5_config::{StoreBackend, StoreConfig};
use crate::StoreError;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_max_results() -> usize {
    10
}

/// Capability contract for the external knowledge store. Calls block; the
/// daemon runs them on the blocking pool.
pub trait KnowledgeStore: Send + Sync {
    fn name(&self) -> &'static str;
    /// Submit one episode. Returns the store-side episode id.
    fn add_episode(&self, episode: &Episode) -> Result<String, StoreError>;
    fn search(&self, query: &SearchQuery) -> Result<Value, StoreError>;
    fn recent(&self, group_id: &str, limit: usize) -> Result<Value, StoreError>;
    fn delete(&self, id: &str) -> Result<(), StoreError>;
    /// Verified round-trip; only a successful ping marks the store healthy.
    fn ping(&self) -> Result<(), StoreError>;
}

pub fn build_store(config: &StoreConfig) -> std::sync::Arc<dyn KnowledgeStore> {
    match config.backend {
        StoreBackend::Http => std::sync::Arc::new(HttpStore::new(config)),
        StoreBackend::Memory => std::sync::Arc::new(MemoryStore::new()),
    }
}

/// Graphiti-style REST backend.
pub struct HttpStore {
    base: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl HttpStore {
    pub fn new(config: &StoreConfig) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
                .build(),
        );
        Self {
            base: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn auth(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| format!("Bearer {k}"))
    }

    fn get(&self, path: &str) -> Result<Value, StoreError> {
        let mut req = self.agent.get(&self.url(path));
        if let Some(auth) = self.auth() {
            req = req.header("Authorization", &auth);
        }
        req.call()
            .map_err(classify)?
            .body_mut()
            .read_json()
            .map_err(|e| StoreError::transient(format!("response body: {e}")))
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let mut req = self.agent.post(&self.url(path));
        if let Some(auth) = self.auth() {
            req = req.header("Authorization", &auth);
        }
        let mut resp = req.send_json(body).map_err(classify)?;
        // 202 with an empty body is a valid acknowledgement.
        let text = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| StoreError::transient(format!("response body: {e}")))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| StoreError::transient(format!("response json: {e}")))
    }
}

impl KnowledgeStore for HttpStore {
    fn name(&self) -> &'static str {
        "http"
    }

    fn add_episode(&self, episode: &Episode) -> Result<String, StoreError> {
        let id = episode.episode_id();
        let body = json!({
            "group_id": episode.group_id,
            "messages": [{
                "uuid": id,
                "name": episode.name,
                "content": episode.body,
                "role_type": "system",
                "role": "gmem",
                "timestamp": episode.timestamp,
                "source_description": episode.source,
            }],
            "metadata": episode.metadata,
            "preprocessing_instruction": episode.preprocessing_instruction,
            "idempotency_key": episode.idempotency_key,
        });
        self.post("/messages", &body)?;
        Ok(id)
    }

    fn search(&self, query: &SearchQuery) -> Result<Value, StoreError> {
        self.post(
            "/search",
            &json!({
                "query": query.query,
                "group_ids": query.group_ids,
                "max_facts": query.max_results,
            }),
        )
    }

    fn recent(&self, group_id: &str, limit: usize) -> Result<Value, StoreError> {
        self.get(&format!("/episodes/{group_id}?last_n={limit}"))
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut req = self.agent.delete(&self.url(&format!("/episode/{id}")));
        if let Some(auth) = self.auth() {
            req = req.header("Authorization", &auth);
        }
        req.call().map_err(classify)?;
        Ok(())
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.get("/healthcheck").map(|_| ())
    }
}

/// Map a transport error onto the three failure kinds the daemon acts on.
fn classify(e: ureq::Error) -> StoreError {
    match e {
        ureq::Error::StatusCode(code) => match code {
            408 | 425 | 429 | 500..=599 => StoreError::transient(format!("HTTP {code}")),
            _ => StoreError::fatal(format!("HTTP {code}")),
        },
        ureq::Error::Timeout(t) => StoreError::transient(format!("timeout: {t}")),
        ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => {
            StoreError::unavailable(e.to_string())
        }
        ureq::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => StoreError::unavailable(io.to_string()),
            std::io::ErrorKind::TimedOut => StoreError::transient(io.to_string()),
            _ => StoreError::unavailable(io.to_string()),
        },
        other => StoreError::transient(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct StoredEpisode {
    pub id: String,
    pub episode: Episode,
}

/// In-process store. Dedupes by idempotency key; can be switched offline.
#[derive(Default)]
pub struct MemoryStore {
    episodes: Mutex<Vec<StoredEpisode>>,
    keys: Mutex<HashSet<String>>,
    offline: AtomicBool,
    add_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Every add attempt, including rejected and duplicate ones.
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn episodes(&self) -> Vec<StoredEpisode> {
        self.episodes.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

impl KnowledgeStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn add_episode(&self, episode: &Episode) -> Result<String, StoreError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let id = episode.episode_id();
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| StoreError::fatal("store lock poisoned"))?;
        if keys.insert(episode.idempotency_key.clone()) {
            let mut eps = self
                .episodes
                .lock()
                .map_err(|_| StoreError::fatal("store lock poisoned"))?;
            eps.push(StoredEpisode { id: id.clone(), episode: episode.clone() });
        }
        Ok(id)
    }

    fn search(&self, query: &SearchQuery) -> Result<Value, StoreError> {
        self.check()?;
        let needle = query.query.to_lowercase();
        let eps = self
            .episodes
            .lock()
            .map_err(|_| StoreError::fatal("store lock poisoned"))?;
        let hits: Vec<Value> = eps
            .iter()
            .filter(|s| query.group_ids.is_empty() || query.group_ids.contains(&s.episode.group_id))
            .filter(|s| s.episode.body.to_lowercase().contains(&needle))
            .take(query.max_results)
            .map(|s| json!({"uuid": s.id, "name": s.episode.name, "group_id": s.episode.group_id}))
            .collect();
        Ok(json!({"facts": hits}))
    }

    fn recent(&self, group_id: &str, limit: usize) -> Result<Value, StoreError> {
        self.check()?;
        let eps = self
            .episodes
            .lock()
            .map_err(|_| StoreError::fatal("store lock poisoned"))?;
        let list: Vec<Value> = eps
            .iter()
            .rev()
            .filter(|s| s.episode.group_id == group_id)
            .take(limit)
            .map(|s| {
                json!({
                    "uuid": s.id,
                    "name": s.episode.name,
                    "content": s.episode.body,
                    "created_at": s.episode.timestamp,
                })
            })
            .collect();
        Ok(Value::Array(list))
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut eps = self
            .episodes
            .lock()
            .map_err(|_| StoreError::fatal("store lock poisoned"))?;
        let before = eps.len();
        eps.retain(|s| s.id != id);
        if eps.len() == before {
            return Err(StoreError::fatal(format!("episode {id} not found")));
        }
        Ok(())
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}
