use crate::s1_4_summarize::{Summarizer, summarize_with_timeout};
use crate::s1_extract::{describe_call, describe_result};
use crate::s1_transcript::{Message, Role, TokenUsage};
use crate::s2_turn::Turn;
use crate::s5_config::FilterPreset;
use crate::s5_redact::SecretRedactor;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Stand-in for excluded content. The field stays; only its payload goes.
pub const EXCLUDED: &str = "[excluded]";

pub const BUILTIN_TEMPLATE: &str = "Shorten the following conversation fragment to at most {max_chars} characters. Keep file names, commands, errors, and decisions.\n\n{content}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    User,
    Assistant,
    Thinking,
    ToolCall,
    ToolResult,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMode {
    Full,
    Exclude,
    /// Synthesized one-line description instead of the literal payload.
    Describe,
    /// Summarizer call with this prompt template (already loaded).
    Reduce { template: Arc<str> },
}

/// Per-class policy. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    pub user: FilterMode,
    pub assistant: FilterMode,
    pub thinking: FilterMode,
    pub tool_call: FilterMode,
    pub tool_result: FilterMode,
    pub system: FilterMode,
    pub summary_max_chars: usize,
}

impl FilterConfig {
    pub fn preset(preset: FilterPreset) -> Self {
        let reduce = || FilterMode::Reduce { template: Arc::from(BUILTIN_TEMPLATE) };
        match preset {
            FilterPreset::Default => Self {
                user: FilterMode::Full,
                assistant: FilterMode::Full,
                thinking: FilterMode::Exclude,
                tool_call: FilterMode::Describe,
                tool_result: FilterMode::Describe,
                system: FilterMode::Exclude,
                summary_max_chars: 400,
            },
            FilterPreset::Aggressive => Self {
                user: FilterMode::Full,
                assistant: reduce(),
                thinking: FilterMode::Exclude,
                tool_call: FilterMode::Describe,
                tool_result: FilterMode::Exclude,
                system: FilterMode::Exclude,
                summary_max_chars: 400,
            },
            FilterPreset::None => Self {
                user: FilterMode::Full,
                assistant: FilterMode::Full,
                thinking: FilterMode::Full,
                tool_call: FilterMode::Full,
                tool_result: FilterMode::Full,
                system: FilterMode::Full,
                summary_max_chars: 400,
            },
        }
    }

    pub fn mode(&self, class: MessageClass) -> &FilterMode {
        match class {
            MessageClass::User => &self.user,
            MessageClass::Assistant => &self.assistant,
            MessageClass::Thinking => &self.thinking,
            MessageClass::ToolCall => &self.tool_call,
            MessageClass::ToolResult => &self.tool_result,
            MessageClass::System => &self.system,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::preset(FilterPreset::Default)
    }
}

/// A message after filtering. Role, timestamp and usage always survive.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredMessage {
    pub role: Role,
    pub uuid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub tokens: Option<TokenUsage>,
    pub text: String,
    pub thinking: Option<String>,
    pub tools: Vec<String>,
}

impl FilteredMessage {
    pub fn content_len(&self) -> usize {
        self.text.chars().count()
            + self.thinking.as_deref().map_or(0, |t| t.chars().count())
            + self.tools.iter().map(|t| t.chars().count()).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilteredTurn {
    pub messages: Vec<FilteredMessage>,
    pub raw_chars: usize,
    pub filtered_chars: usize,
    /// Reduce-mode fields that went through the summarizer.
    pub reduced: usize,
    /// Reduce-mode fields that fell back to full content.
    pub fallbacks: usize,
}

impl FilteredTurn {
    pub fn ratio(&self) -> f64 {
        if self.raw_chars == 0 {
            1.0
        } else {
            self.filtered_chars as f64 / self.raw_chars as f64
        }
    }
}

pub struct ContentFilter {
    config: FilterConfig,
    summarizer: Arc<dyn Summarizer>,
    redactor: Option<Arc<SecretRedactor>>,
    timeout: Duration,
}

impl ContentFilter {
    pub fn new(
        config: FilterConfig,
        summarizer: Arc<dyn Summarizer>,
        redactor: Option<Arc<SecretRedactor>>,
        timeout: Duration,
    ) -> Self {
        Self { config, summarizer, redactor, timeout }
    }

    pub async fn filter_turn(&self, turn: &Turn) -> FilteredTurn {
        self.filter_messages(&turn.messages).await
    }

    pub async fn filter_messages(&self, messages: &[Message]) -> FilteredTurn {
        let mut out = FilteredTurn::default();
        for msg in messages {
            out.raw_chars += msg.content_len();
            let fm = self.filter_message(msg, &mut out).await;
            out.filtered_chars += fm.content_len();
            out.messages.push(fm);
        }
        out
    }

    async fn filter_message(&self, msg: &Message, stats: &mut FilteredTurn) -> FilteredMessage {
        let text_class = match msg.role {
            Role::System => MessageClass::System,
            Role::Assistant => MessageClass::Assistant,
            Role::User | Role::Tool => MessageClass::User,
        };

        let text = if msg.text.is_empty() {
            String::new()
        } else {
            self.apply(text_class, &msg.text, || text_description(&msg.text), stats)
                .await
        };

        let thinking = match &msg.thinking {
            Some(t) => Some(
                self.apply(MessageClass::Thinking, t, || text_description(t), stats)
                    .await,
            ),
            None => None,
        };

        let mut tools = Vec::with_capacity(msg.tool_invocations.len());
        for inv in &msg.tool_invocations {
            let line = match &inv.result {
                None => {
                    let literal = format!("{}({})", inv.name, inv.arguments);
                    self.apply(
                        MessageClass::ToolCall,
                        &literal,
                        || describe_call(&inv.name, &inv.arguments),
                        stats,
                    )
                    .await
                }
                Some(result) => {
                    let label = if inv.name.is_empty() { "tool" } else { inv.name.as_str() };
                    let literal = if inv.is_error {
                        format!("{label} error: {result}")
                    } else {
                        format!("{label} result: {result}")
                    };
                    self.apply(
                        MessageClass::ToolResult,
                        &literal,
                        || describe_result(&inv.name, result, inv.is_error),
                        stats,
                    )
                    .await
                }
            };
            tools.push(line);
        }

        FilteredMessage {
            role: msg.role,
            uuid: msg.uuid.clone(),
            timestamp: msg.timestamp,
            tokens: msg.tokens,
            text,
            thinking,
            tools,
        }
    }

    async fn apply(
        &self,
        class: MessageClass,
        content: &str,
        describe: impl FnOnce() -> String,
        stats: &mut FilteredTurn,
    ) -> String {
        let content = match &self.redactor {
            Some(r) => r.redact(content).into_owned(),
            None => content.to_string(),
        };

        match self.config.mode(class) {
            FilterMode::Full => content,
            FilterMode::Exclude => EXCLUDED.to_string(),
            FilterMode::Describe => {
                let line = describe();
                match &self.redactor {
                    Some(r) => r.redact(&line).into_owned(),
                    None => line,
                }
            }
            FilterMode::Reduce { template } => {
                let max = self.config.summary_max_chars;
                if content.chars().count() <= max {
                    return content;
                }
                let prompt = template
                    .replace("{max_chars}", &max.to_string())
                    .replace("{content}", &content);
                match summarize_with_timeout(self.summarizer.clone(), prompt, max, self.timeout).await {
                    Ok(short) if !short.trim().is_empty() => {
                        stats.reduced += 1;
                        short
                    }
                    Ok(_) => {
                        log::warn!("summarizer returned nothing for {class:?}, keeping full content");
                        stats.fallbacks += 1;
                        crate::metrics::count_summarizer_fallback();
                        content
                    }
                    Err(e) => {
                        log::warn!("summarizer failed for {class:?} ({e}), keeping full content");
                        stats.fallbacks += 1;
                        crate::metrics::count_summarizer_fallback();
                        content
                    }
                }
            }
        }
    }
}

fn text_description(text: &str) -> String {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let cut: String = first.chars().take(120).collect();
    let total = text.chars().count();
    if cut.chars().count() == total {
        cut
    } else {
        format!("{cut}… ({total} chars)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GmemError;
    use crate::s1_extract::ToolPriority;
    use crate::s1_transcript::ToolInvocation;
    use serde_json::json;

    struct Stub;
    impl Summarizer for Stub {
        fn summarize(&self, _prompt: &str, _max: usize) -> Result<String, GmemError> {
            Ok("Refactored token refresh in src/auth.rs; tests pass.".into())
        }
    }

    struct Broken;
    impl Summarizer for Broken {
        fn summarize(&self, _prompt: &str, _max: usize) -> Result<String, GmemError> {
            Err(GmemError::Summarizer("backend down".into()))
        }
    }

    fn base(role: Role, text: &str) -> Message {
        Message {
            uuid: None,
            role,
            text: text.into(),
            thinking: None,
            timestamp: None,
            tool_invocations: Vec::new(),
            tokens: None,
            end_offset: 0,
        }
    }

    fn inv(name: &str, args: serde_json::Value, result: Option<String>) -> ToolInvocation {
        ToolInvocation {
            id: Some("t1".into()),
            name: name.into(),
            arguments: args,
            result,
            is_error: false,
            priority: ToolPriority::Low,
        }
    }

    /// A turn shaped like typical agent work: short prompt, long reasoning,
    /// a large file read and an explanatory reply.
    fn corpus() -> Vec<Message> {
        let mut call = base(Role::Assistant, "");
        call.thinking = Some("I should look at the refresh path first. ".repeat(20));
        call.tool_invocations.push(inv("Read", json!({"file_path": "src/auth.rs"}), None));

        let mut result = base(Role::Tool, "");
        result.tool_invocations.push(inv(
            "Read",
            json!({"file_path": "src/auth.rs"}),
            Some("    let token = refresh(&client).await?;\n".repeat(80)),
        ));

        let reply = "The refresh path retried without backoff. I added exponential backoff and a cap, then updated the tests to cover expiry. "
            .repeat(6);

        vec![
            base(Role::User, "Fix the token refresh loop in auth.rs"),
            call,
            result,
            base(Role::Assistant, &reply),
        ]
    }

    fn filter(preset: FilterPreset, s: Arc<dyn Summarizer>) -> ContentFilter {
        ContentFilter::new(FilterConfig::preset(preset), s, None, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn default_policy_shrinks_representative_turn() {
        let out = filter(FilterPreset::Default, Arc::new(Stub)).filter_messages(&corpus()).await;
        assert!(out.ratio() <= 0.70, "ratio {}", out.ratio());
        assert_eq!(out.messages.len(), 4);
        assert_eq!(out.messages[1].thinking.as_deref(), Some(EXCLUDED));
        assert_eq!(out.messages[1].tools, vec!["Read src/auth.rs".to_string()]);
        assert_eq!(out.messages[2].tools, vec!["Read returned 80 lines".to_string()]);
    }

    #[tokio::test]
    async fn aggressive_policy_shrinks_further() {
        let out = filter(FilterPreset::Aggressive, Arc::new(Stub)).filter_messages(&corpus()).await;
        assert!(out.ratio() <= 0.35, "ratio {}", out.ratio());
        assert_eq!(out.reduced, 1);
        assert_eq!(out.fallbacks, 0);
    }

    #[tokio::test]
    async fn summarizer_failure_keeps_full_content() {
        let msgs = corpus();
        let out = filter(FilterPreset::Aggressive, Arc::new(Broken)).filter_messages(&msgs).await;
        assert_eq!(out.messages[3].text, msgs[3].text);
        assert_eq!(out.fallbacks, 1);
    }

    #[tokio::test]
    async fn exclusion_keeps_metadata() {
        let mut m = base(Role::System, "reminder text");
        m.uuid = Some("u1".into());
        m.tokens = Some(TokenUsage { input: 3, output: 4 });
        let out = filter(FilterPreset::Default, Arc::new(Stub)).filter_messages(&[m]).await;
        let fm = &out.messages[0];
        assert_eq!(fm.text, EXCLUDED);
        assert_eq!(fm.role, Role::System);
        assert_eq!(fm.uuid.as_deref(), Some("u1"));
        assert_eq!(fm.tokens.unwrap().total(), 7);
    }

    #[tokio::test]
    async fn short_content_skips_summarizer() {
        let m = base(Role::Assistant, "Done.");
        let out = filter(FilterPreset::Aggressive, Arc::new(Broken)).filter_messages(&[m]).await;
        assert_eq!(out.messages[0].text, "Done.");
        assert_eq!(out.fallbacks, 0);
    }

    #[tokio::test]
    async fn redaction_applies_before_policy() {
        let redactor = Arc::new(SecretRedactor::new(&[]).unwrap());
        let f = ContentFilter::new(FilterConfig::default(), Arc::new(Stub), Some(redactor), Duration::from_secs(1));
        let out = f.filter_messages(&[base(Role::User, "use password=hunter2 please")]).await;
        assert!(!out.messages[0].text.contains("hunter2"));
    }

    #[test]
    fn describe_text_is_one_line() {
        assert_eq!(text_description("short"), "short");
        let d = text_description("first line\nsecond line");
        assert!(d.starts_with("first line…"));
        assert!(d.ends_with("(22 chars)"));
    }
}
