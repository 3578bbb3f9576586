use crate::s1_extract::{ToolKind, classify_tool, is_test_command};
use crate::s1_transcript::Message;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Per-turn signal weights. Descriptive metadata only; nothing gates on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityVector {
    weights: BTreeMap<&'static str, f64>,
}

impl ActivityVector {
    /// Share of tool calls per signal. A turn without tool calls is pure
    /// conversation.
    pub fn from_messages(messages: &[Message]) -> Self {
        let mut counts: BTreeMap<&'static str, f64> = BTreeMap::new();
        let mut total = 0.0;

        for inv in messages
            .iter()
            .flat_map(|m| m.tool_invocations.iter())
            .filter(|i| i.result.is_none() && !i.name.is_empty())
        {
            let signal = match classify_tool(&inv.name) {
                ToolKind::FileEdit => "file_edit",
                ToolKind::FileWrite => "file_write",
                ToolKind::FileRead => "file_read",
                ToolKind::Search => "search",
                ToolKind::Command => {
                    let cmd = inv.arguments.get("command").and_then(Value::as_str).unwrap_or("");
                    if is_test_command(cmd) { "test_run" } else { "command" }
                }
                ToolKind::Task => "delegation",
                ToolKind::Web => "web",
                ToolKind::Mcp => "mcp",
                ToolKind::Other => "other_tool",
            };
            *counts.entry(signal).or_default() += 1.0;
            total += 1.0;
        }

        if total == 0.0 {
            return Self {
                weights: BTreeMap::from([("conversation", 1.0)]),
            };
        }

        for w in counts.values_mut() {
            *w /= total;
        }
        Self { weights: counts }
    }

    pub fn weight(&self, signal: &str) -> f64 {
        self.weights.get(signal).copied().unwrap_or(0.0)
    }

    /// Signals at or above `threshold`, strongest first.
    pub fn dominant(&self, threshold: f64) -> Vec<&'static str> {
        let mut hits: Vec<(&'static str, f64)> = self
            .weights
            .iter()
            .filter(|(_, w)| **w >= threshold)
            .map(|(k, w)| (*k, *w))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(b.0)));
        hits.into_iter().map(|(k, _)| k).collect()
    }

    pub fn summary(&self, threshold: f64) -> Value {
        let weights: serde_json::Map<String, Value> = self
            .weights
            .iter()
            .map(|(k, w)| ((*k).to_string(), json!((w * 100.0).round() / 100.0)))
            .collect();
        json!({
            "weights": weights,
            "dominant": self.dominant(threshold),
        })
    }
}
