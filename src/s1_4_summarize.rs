use crate::s5_config::{SummarizerBackend, SummarizerConfig};
use crate::GmemError;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You shorten fragments of coding-assistant conversations for a knowledge graph. Keep decisions, file names, errors, and conclusions. Drop pleasantries and restatements. Return only the shortened text.";

/// `summarize(text, max_length)`: a short rendition of `text` or a failure.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, prompt: &str, max_length: usize) -> Result<String, GmemError>;
}

/// Chat-completions client for any OpenAI-compatible server.
pub struct OpenAiSummarizer {
    config: SummarizerConfig,
    agent: ureq::Agent,
}

impl OpenAiSummarizer {
    pub fn new(config: SummarizerConfig) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
                .build(),
        );
        Self { config, agent }
    }

    fn try_endpoint(&self, endpoint: &str, body: &serde_json::Value) -> Result<String, GmemError> {
        let resp: serde_json::Value = self
            .agent
            .post(endpoint)
            .send_json(body)
            .map_err(|e| GmemError::Summarizer(format!("request: {e}")))?
            .body_mut()
            .read_json()
            .map_err(|e| GmemError::Summarizer(format!("response: {e}")))?;

        let text = resp
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| GmemError::Summarizer("no content in chat completion response".into()))?;

        let cleaned = strip_fences(text);
        if cleaned.is_empty() {
            return Err(GmemError::Summarizer("empty completion".into()));
        }
        Ok(cleaned.to_string())
    }
}

impl Summarizer for OpenAiSummarizer {
    fn summarize(&self, prompt: &str, max_length: usize) -> Result<String, GmemError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": 0.0,
            // Rough ceiling; the char bound is enforced after the call.
            "max_tokens": (max_length / 3).max(32),
        });

        match self.try_endpoint(&self.config.endpoint, &body) {
            Ok(text) => Ok(text),
            Err(primary_err) => match &self.config.fallback_endpoint {
                Some(fallback) => {
                    log::warn!("summarizer endpoint failed ({primary_err}), trying fallback");
                    self.try_endpoint(fallback, &body)
                }
                None => Err(primary_err),
            },
        }
    }
}

/// Backend that always fails, so every reduce-mode message keeps full content.
pub struct NoSummarizer;

impl Summarizer for NoSummarizer {
    fn summarize(&self, _prompt: &str, _max_length: usize) -> Result<String, GmemError> {
        Err(GmemError::Summarizer("no summarizer backend configured".into()))
    }
}

/// Memoizes successful results by content hash. Failures are not cached.
pub struct CachingSummarizer {
    inner: Arc<dyn Summarizer>,
    cache: Mutex<LruCache<[u8; 32], String>>,
}

impl CachingSummarizer {
    pub fn new(inner: Arc<dyn Summarizer>, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    fn key(prompt: &str, max_length: usize) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(prompt.as_bytes());
        h.update(max_length.to_le_bytes());
        h.finalize().into()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map_or(0, |c| c.len())
    }
}

impl Summarizer for CachingSummarizer {
    fn summarize(&self, prompt: &str, max_length: usize) -> Result<String, GmemError> {
        let key = Self::key(prompt, max_length);
        if let Ok(mut cache) = self.cache.lock()
            && let Some(hit) = cache.get(&key)
        {
            crate::metrics::count_summarizer_cache_hit();
            return Ok(hit.clone());
        }

        let out = truncate_chars(&self.inner.summarize(prompt, max_length)?, max_length);
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, out.clone());
        }
        Ok(out)
    }
}

/// Build the configured backend behind the cache.
pub fn build_summarizer(config: &SummarizerConfig) -> Arc<dyn Summarizer> {
    let inner: Arc<dyn Summarizer> = match config.backend {
        SummarizerBackend::Openai => Arc::new(OpenAiSummarizer::new(config.clone())),
        SummarizerBackend::None => Arc::new(NoSummarizer),
    };
    Arc::new(CachingSummarizer::new(inner, config.cache_capacity))
}

/// Run a blocking summarizer off the async runtime with a hard deadline.
pub async fn summarize_with_timeout(
    summarizer: Arc<dyn Summarizer>,
    prompt: String,
    max_length: usize,
    timeout: Duration,
) -> Result<String, GmemError> {
    let task = tokio::task::spawn_blocking(move || summarizer.summarize(&prompt, max_length));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result.map(|s| truncate_chars(&s, max_length)),
        Ok(Err(join)) => Err(GmemError::Summarizer(format!("summarizer task: {join}"))),
        Err(_) => Err(GmemError::Summarizer(format!(
            "timed out after {}s",
            timeout.as_secs_f32()
        ))),
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Strip markdown code fences from LLM response.
fn strip_fences(text: &str) -> &str {
    let t = text.trim();
    if let Some(rest) = t.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c != '\n').trim_start_matches('\n');
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
        return rest.trim();
    }
    t
}
