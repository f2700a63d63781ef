//! Helpers shared by the subprocess backends.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Child;
use tracing::warn;

use counterspell_core::error::{Error, Result};
use counterspell_core::types::Message;

use crate::normalize::SharedConversation;

/// How long a child gets to exit after the terminate request before we
/// stop waiting. `kill_on_drop` reaps anything that survives us.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Terminate a child process and wait briefly for it to exit.
pub async fn kill_with_grace(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("kill subprocess: {e}");
        return;
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!("subprocess did not exit within kill grace");
    }
}

/// Failure message carrying the stderr tail, preserved on the task row.
pub fn stderr_tail_message(name: &str, code: Option<i32>, tail: &VecDeque<String>) -> String {
    let mut msg = match code {
        Some(code) => format!("{name} exited with status {code}"),
        None => format!("{name} was terminated by a signal"),
    };
    if !tail.is_empty() {
        msg.push_str(": ");
        let joined: Vec<&str> = tail.iter().map(String::as_str).collect();
        msg.push_str(&joined.join(" | "));
    }
    msg
}

#[derive(Deserialize)]
struct StateBlob {
    messages: Vec<Message>,
    #[serde(default)]
    todos: Vec<counterspell_core::types::TodoItem>,
}

/// Conversation state persists as `{"messages": [...], "todos": [...]}`;
/// subprocess backends always carry an empty tasklist.
pub fn state_blob(shared: &SharedConversation) -> String {
    let conv = shared.lock().unwrap_or_else(|e| e.into_inner());
    serde_json::json!({ "messages": conv.messages, "todos": conv.todos }).to_string()
}

/// Restore replaces the in-memory message list (and tasklist).
pub fn restore_message_blob(shared: &SharedConversation, blob: &str) -> Result<()> {
    let parsed: StateBlob = serde_json::from_str(blob)
        .map_err(|e| Error::InvalidInput(format!("conversation state blob: {e}")))?;
    let mut conv = shared.lock().unwrap_or_else(|e| e.into_inner());
    conv.messages = parsed.messages;
    conv.todos = parsed.todos;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::shared_conversation;
    use counterspell_core::types::{Block, Role};

    #[test]
    fn state_round_trip_preserves_messages() {
        let shared = shared_conversation();
        {
            let mut conv = shared.lock().unwrap();
            conv.messages.push(Message::user("do the thing"));
            conv.messages.push(Message::assistant(vec![Block::Text {
                text: "done".into(),
            }]));
        }
        let blob = state_blob(&shared);

        let restored = shared_conversation();
        restore_message_blob(&restored, &blob).unwrap();
        let conv = restored.lock().unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[0].role, Role::User);
        assert_eq!(conv.messages[1].text(), "done");
    }

    #[test]
    fn bad_blob_is_invalid_input() {
        let shared = shared_conversation();
        let err = restore_message_blob(&shared, "not json").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn stderr_tail_joins_lines() {
        let mut tail = VecDeque::new();
        tail.push_back("first".to_string());
        tail.push_back("second".to_string());
        let msg = stderr_tail_message("codex", Some(1), &tail);
        assert!(msg.contains("status 1"));
        assert!(msg.contains("first | second"));
    }
}
