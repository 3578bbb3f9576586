use crate::s1_transcript::{Message, Role};
use crate::s5_project::ProjectRef;
use std::ops::Range;
use std::path::PathBuf;

/// One completed user→assistant exchange, owned by whoever indexes it.
#[derive(Debug, Clone)]
pub struct Turn {
    pub session_id: String,
    pub log_path: PathBuf,
    /// Ordinal of this turn within the daemon's view of the session.
    pub index: u64,
    pub messages: Vec<Message>,
    /// Log offset where the turn's first line starts.
    pub start_offset: u64,
    /// Log offset just past the turn's last line.
    pub end_offset: u64,
    /// Force-flushed on close without a closing assistant reply.
    pub partial: bool,
    pub project: Option<ProjectRef>,
}

/// Ranges of every completed turn in `messages`, in order.
///
/// A turn ends at an assistant reply that follows an unclosed user message,
/// provided the next non-system message (if any) is a new user message.
/// Tool steps between the user message and the reply belong to the turn.
/// Anything before the first user message rides along with the first turn.
///
/// The last range may end at the tail of `messages`; whether more tool work
/// follows it is not yet known, so callers decide when to release it.
pub fn split_turns(messages: &[Message]) -> Vec<Range<usize>> {
    let mut turns = Vec::new();
    let mut start = 0;
    let mut open_user = false;

    for (i, m) in messages.iter().enumerate() {
        match m.role {
            Role::User => open_user = true,
            Role::Assistant if open_user && m.is_assistant_reply() => {
                let next = messages[i + 1..].iter().find(|n| n.role != Role::System);
                if next.is_none_or(|n| n.role == Role::User) {
                    turns.push(start..i + 1);
                    start = i + 1;
                    open_user = false;
                }
            }
            _ => {}
        }
    }

    turns
}

/// True iff the most recent message is an assistant reply that closes an
/// unclosed user message.
pub fn is_turn_complete(messages: &[Message]) -> bool {
    split_turns(messages)
        .last()
        .is_some_and(|r| r.end == messages.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s1_transcript::{ConversationContext, ToolInvocation};
    use crate::s1_extract::ToolPriority;

    fn msg(role: Role, text: &str) -> Message {
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

    fn tool_call() -> Message {
        let mut m = msg(Role::Assistant, "");
        m.tool_invocations.push(ToolInvocation {
            id: Some("t".into()),
            name: "Bash".into(),
            arguments: serde_json::json!({"command": "ls"}),
            result: None,
            is_error: false,
            priority: ToolPriority::High,
        });
        m
    }

    fn tool_result() -> Message {
        msg(Role::Tool, "")
    }

    use Role::{Assistant as A, System as S, User as U};

    #[test]
    fn simple_pair_is_complete() {
        let m = vec![msg(U, "q"), msg(A, "a")];
        assert!(is_turn_complete(&m));
        assert_eq!(split_turns(&m), vec![0..2]);
    }

    #[test]
    fn tool_steps_stay_inside_the_turn() {
        let m = vec![msg(U, "q"), tool_call(), tool_result(), msg(A, "done")];
        assert!(is_turn_complete(&m));
        assert_eq!(split_turns(&m), vec![0..4]);
    }

    #[test]
    fn incomplete_tails() {
        assert!(!is_turn_complete(&[]));
        assert!(!is_turn_complete(&[msg(U, "q")]));
        assert!(!is_turn_complete(&[msg(U, "q"), tool_call()]));
        assert!(!is_turn_complete(&[msg(U, "q"), tool_call(), tool_result()]));
        assert!(!is_turn_complete(&[msg(A, "no user before me")]));
        assert!(is_turn_complete(&[msg(U, "q"), msg(A, "a"), msg(A, "more")]));
    }

    #[test]
    fn reply_followed_by_more_work_is_not_a_boundary() {
        let m = vec![msg(U, "q"), msg(A, "let me look"), tool_call(), tool_result(), msg(A, "found it")];
        assert_eq!(split_turns(&m), vec![0..5]);
    }

    #[test]
    fn multiple_turns_in_one_batch() {
        let m = vec![
            msg(U, "1"),
            msg(A, "1"),
            msg(U, "2"),
            tool_call(),
            tool_result(),
            msg(A, "2"),
            msg(S, "note"),
            msg(U, "3"),
            msg(A, "3"),
        ];
        assert_eq!(split_turns(&m), vec![0..2, 2..6, 6..9]);
    }

    #[test]
    fn streaming_appends_emit_each_turn_once() {
        let script = vec![
            msg(U, "1"),
            msg(A, "1"),
            msg(U, "2"),
            tool_call(),
            tool_result(),
            msg(A, "2"),
            msg(U, "3"),
            msg(A, "3"),
        ];
        let mut ctx = ConversationContext::new("s");
        let mut emitted: Vec<Vec<Message>> = Vec::new();
        for m in script.clone() {
            ctx.push(m);
            if let Some(range) = split_turns(&ctx.messages).pop() {
                emitted.push(ctx.take_through(range.end - 1));
            }
        }
        assert_eq!(emitted.len(), 3);
        assert!(ctx.is_empty());
        let flat: Vec<Message> = emitted.into_iter().flatten().collect();
        assert_eq!(flat, script);
    }
}
