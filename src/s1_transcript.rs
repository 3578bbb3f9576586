use crate::s1_extract::{ToolPriority, tool_priority, touched_file};
use crate::s5_project::{self, ProjectRef};
use crate::GmemError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// A user-side record that only carries tool results.
    Tool,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
            Role::Tool => "Tool",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
    pub result: Option<String>,
    pub is_error: bool,
    pub priority: ToolPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub uuid: Option<String>,
    pub role: Role,
    pub text: String,
    pub thinking: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub tool_invocations: Vec<ToolInvocation>,
    pub tokens: Option<TokenUsage>,
    /// Byte offset just past this message's line in the log.
    pub end_offset: u64,
}

impl Message {
    /// Intermediate step inside a turn: tool results, or assistant records
    /// that carry only tool calls / reasoning and no reply text.
    pub fn is_tool_step(&self) -> bool {
        match self.role {
            Role::Tool => true,
            Role::Assistant => self.text.trim().is_empty(),
            _ => false,
        }
    }

    /// An assistant record with reply text.
    pub fn is_assistant_reply(&self) -> bool {
        self.role == Role::Assistant && !self.is_tool_step()
    }

    /// Raw content size in chars: text, reasoning, tool arguments and results.
    pub fn content_len(&self) -> usize {
        let mut n = self.text.chars().count();
        n += self.thinking.as_deref().map_or(0, |t| t.chars().count());
        for inv in &self.tool_invocations {
            if !inv.arguments.is_null() {
                n += inv.arguments.to_string().chars().count();
            }
            n += inv.result.as_deref().map_or(0, |r| r.chars().count());
        }
        n
    }
}

/// Result of one incremental read.
#[derive(Debug, Clone, Default)]
pub struct ParseBatch {
    pub messages: Vec<Message>,
    pub start_offset: u64,
    pub new_offset: u64,
    /// Lines that were not valid JSON.
    pub skipped: usize,
    /// Valid records that are not conversation messages (summaries, snapshots).
    pub ignored: usize,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    /// The file is shorter than the requested offset.
    pub truncated: bool,
}

/// Most bytes one call consumes; a larger backlog is read over several calls.
pub const MAX_BATCH_BYTES: u64 = 8 * 1024 * 1024;

const READ_BUF: usize = 64 * 1024;

/// Read every complete line appended after `offset`, up to
/// [`MAX_BATCH_BYTES`].
///
/// A trailing line without its newline is left for the next call, so the
/// returned offset always sits on a line boundary and never moves backwards.
pub fn parse_log(path: &Path, offset: u64) -> Result<ParseBatch, GmemError> {
    parse_log_bounded(path, offset, MAX_BATCH_BYTES)
}

/// Like [`parse_log`], stopping at the first line boundary at or past
/// `max_bytes`. At least one complete line is consumed when available.
pub fn parse_log_bounded(path: &Path, offset: u64, max_bytes: u64) -> Result<ParseBatch, GmemError> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();

    let mut batch = ParseBatch {
        start_offset: offset,
        new_offset: offset,
        ..Default::default()
    };

    if len < offset {
        log::warn!(
            "{}: log is shorter ({len}) than saved offset ({offset}), holding position",
            path.display()
        );
        batch.truncated = true;
        return Ok(batch);
    }
    if len == offset {
        return Ok(batch);
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::with_capacity(READ_BUF, file.take(len - offset));
    let mut line = Vec::new();
    let mut pos = offset;

    while pos - offset < max_bytes {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        let line_start = pos;
        pos += n as u64;
        decode_line(path, &line[..n - 1], line_start, pos, &mut batch);
        batch.new_offset = pos;
    }

    if batch.skipped > 0 {
        crate::metrics::count_parse_skips(batch.skipped as u64);
    }

    Ok(batch)
}

fn decode_line(path: &Path, line: &[u8], line_start: u64, end_offset: u64, batch: &mut ParseBatch) {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }

    let entry: Value = match serde_json::from_slice(line) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("{}@{line_start}: skipping malformed log line: {e}", path.display());
            batch.skipped += 1;
            return;
        }
    };

    if batch.session_id.is_none() {
        batch.session_id = entry.get("sessionId").and_then(Value::as_str).map(Into::into);
    }
    if batch.cwd.is_none() {
        batch.cwd = entry
            .get("cwd")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(Into::into);
    }

    match decode_record(&entry, end_offset) {
        Some(msg) => batch.messages.push(msg),
        None => batch.ignored += 1,
    }
}

/// Decode one log record into a message. `None` for records that are not
/// part of the conversation.
pub fn decode_record(entry: &Value, end_offset: u64) -> Option<Message> {
    let side = match entry.get("type").and_then(Value::as_str)? {
        "user" | "input" | "human" => Role::User,
        "assistant" | "output" => Role::Assistant,
        "system" => Role::System,
        _ => return None,
    };

    let message = entry.get("message");
    let content = message
        .and_then(|m| m.get("content"))
        .or_else(|| entry.get("content"));

    let mut text_parts: Vec<String> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut invocations: Vec<ToolInvocation> = Vec::new();

    match content {
        Some(Value::String(s)) => text_parts.push(s.clone()),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(Value::as_str) {
                            text_parts.push(t.to_string());
                        }
                    }
                    Some("thinking") => {
                        if let Some(t) = block.get("thinking").and_then(Value::as_str) {
                            thinking_parts.push(t.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let name = block.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                        invocations.push(ToolInvocation {
                            id: block.get("id").and_then(Value::as_str).map(Into::into),
                            priority: tool_priority(&name),
                            name,
                            arguments: block.get("input").cloned().unwrap_or(Value::Null),
                            result: None,
                            is_error: false,
                        });
                    }
                    Some("tool_result") => invocations.push(ToolInvocation {
                        id: block.get("tool_use_id").and_then(Value::as_str).map(Into::into),
                        name: String::new(),
                        arguments: Value::Null,
                        result: Some(result_text(block.get("content"))),
                        is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                        priority: ToolPriority::Low,
                    }),
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let text = text_parts.join("\n");
    let thinking = if thinking_parts.is_empty() {
        None
    } else {
        Some(thinking_parts.join("\n"))
    };

    if text.trim().is_empty() && thinking.is_none() && invocations.is_empty() {
        return None;
    }

    let role = match side {
        Role::User if text.trim().is_empty() && invocations.iter().all(|i| i.result.is_some()) => Role::Tool,
        Role::User if entry.get("isMeta").and_then(Value::as_bool).unwrap_or(false) => Role::System,
        Role::User if text.trim_start().starts_with("<system-reminder>") => Role::System,
        other => other,
    };

    let tokens = message.and_then(|m| m.get("usage")).map(|u| {
        let field = |k: &str| u.get(k).and_then(Value::as_u64).unwrap_or(0);
        TokenUsage {
            input: field("input_tokens") + field("cache_creation_input_tokens"),
            output: field("output_tokens"),
        }
    });

    Some(Message {
        uuid: entry.get("uuid").and_then(Value::as_str).map(Into::into),
        role,
        text,
        thinking,
        timestamp: entry
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc)),
        tool_invocations: invocations,
        tokens,
        end_offset,
    })
}

fn result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|p| match p.get("type").and_then(Value::as_str) {
                Some("text") => p.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
                Some("image") => "[image]".to_string(),
                _ => p.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// In-memory accumulation of one session's parsed, not-yet-indexed messages.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub session_id: String,
    pub cwd: Option<String>,
    pub project: Option<ProjectRef>,
    pub messages: Vec<Message>,
}

impl ConversationContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Append a parsed batch. Returns how many messages were added.
    pub fn absorb(&mut self, batch: ParseBatch) -> usize {
        if self.cwd.is_none()
            && let Some(cwd) = batch.cwd
        {
            match s5_project::resolve(&cwd) {
                Ok(p) => self.project = Some(p),
                Err(e) => log::warn!("session {}: unresolvable cwd {cwd:?}: {e}", self.session_id),
            }
            self.cwd = Some(cwd);
        }
        let n = batch.messages.len();
        for msg in batch.messages {
            self.push(msg);
        }
        n
    }

    /// Append one message, linking tool results to the call that produced them.
    pub fn push(&mut self, mut msg: Message) {
        for inv in msg.tool_invocations.iter_mut().filter(|i| i.name.is_empty()) {
            let Some(id) = inv.id.as_deref() else { continue };
            let call = self
                .messages
                .iter()
                .rev()
                .flat_map(|m| m.tool_invocations.iter())
                .find(|c| !c.name.is_empty() && c.id.as_deref() == Some(id));
            if let Some(call) = call {
                inv.name = call.name.clone();
                inv.arguments = call.arguments.clone();
                inv.priority = call.priority;
            }
        }
        self.messages.push(msg);
    }

    /// Hand messages `0..=end` to the caller, removing them from the context.
    pub fn take_through(&mut self, end: usize) -> Vec<Message> {
        let end = end.min(self.messages.len().saturating_sub(1));
        if self.messages.is_empty() {
            return Vec::new();
        }
        self.messages.drain(..=end).collect()
    }

    pub fn take_all(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        time_range(&self.messages)
    }

    pub fn token_total(&self) -> u64 {
        token_total(&self.messages)
    }
}

pub fn time_range(messages: &[Message]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut stamps = messages.iter().filter_map(|m| m.timestamp);
    let first = stamps.next()?;
    let (lo, hi) = stamps.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
    Some((lo, hi))
}

pub fn token_total(messages: &[Message]) -> u64 {
    messages.iter().filter_map(|m| m.tokens).map(|t| t.total()).sum()
}

/// Files written or edited by tool calls, sorted and deduplicated.
pub fn touched_files(messages: &[Message]) -> Vec<String> {
    let set: BTreeSet<String> = messages
        .iter()
        .flat_map(|m| m.tool_invocations.iter())
        .filter(|i| i.result.is_none())
        .filter_map(|i| touched_file(&i.name, &i.arguments))
        .collect();
    set.into_iter().collect()
}
