//! Conversation turns and the bounded per-session history.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use tracing::warn;

/// Maximum number of turns kept in a session's history.
pub const HISTORY_LIMIT: usize = 20;

/// A tool invocation requested by the dialogue engine.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Builds a request from the raw JSON argument string the engine returns.
    /// Arguments that are not a JSON object are replaced by an empty object so
    /// that validation at the dispatch boundary reports them.
    pub fn from_raw(id: impl Into<String>, name: impl Into<String>, raw_arguments: &str) -> Self {
        let name = name.into();
        let arguments = match serde_json::from_str::<Value>(raw_arguments) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                warn!(function = %name, arguments = %other, "Tool arguments are not an object");
                Map::new()
            }
            Err(e) => {
                warn!(function = %name, error = %e, "Tool arguments are not valid JSON");
                Map::new()
            }
        };
        Self {
            id: id.into(),
            name,
            arguments,
        }
    }

    /// The arguments re-encoded as the JSON string the engine expects back.
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }
}

/// The structured outcome of one tool call, keyed by the request id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub payload: Value,
}

/// One entry of the conversation. Turns are never mutated once appended.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ConversationTurn {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self::Assistant {
            content,
            tool_calls,
        }
    }

    pub fn tool_result(result: &ToolResult) -> Self {
        Self::Tool {
            tool_call_id: result.tool_call_id.clone(),
            content: result.payload.to_string(),
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant { .. })
    }
}

/// Ordered conversation history holding at most `limit` turns.
///
/// When a push overflows the limit the oldest turns are evicted. Tool results
/// left at the front without their assistant turn are evicted as well, so the
/// history handed to the dialogue engine never opens with an orphaned result.
///
/// The newest assistant turn is never evicted. A tool-call round larger than
/// the limit is kept whole, and the history exceeds the limit until a later
/// assistant turn replaces it.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    limit: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }
}

impl ConversationHistory {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(limit + 1),
            limit,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        let mut evictable = self
            .turns
            .iter()
            .rposition(ConversationTurn::is_assistant)
            .unwrap_or(self.turns.len());
        while self.turns.len() > self.limit && evictable > 0 {
            self.turns.pop_front();
            evictable -= 1;
        }
        while evictable > 0 && self.turns.front().is_some_and(ConversationTurn::is_tool_result) {
            self.turns.pop_front();
            evictable -= 1;
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    /// The full message list for one dialogue call: the system prompt followed
    /// by every retained turn.
    pub fn to_prompt(&self, system_prompt: &str) -> Vec<ConversationTurn> {
        std::iter::once(ConversationTurn::system(system_prompt))
            .chain(self.turns.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_evicts_oldest_turn() {
        let mut history = ConversationHistory::default();
        for i in 0..21 {
            history.push(ConversationTurn::user(format!("turn {i}")));
        }
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(
            history.iter().next(),
            Some(&ConversationTurn::user("turn 1"))
        );
        assert_eq!(history.last(), Some(&ConversationTurn::user("turn 20")));
    }

    #[test]
    fn test_eviction_drops_orphaned_tool_results() {
        let mut history = ConversationHistory::with_limit(3);
        let call = ToolCallRequest::new("call_1", "verify_member_id", Map::new());
        history.push(ConversationTurn::assistant_tool_calls(None, vec![call]));
        history.push(ConversationTurn::tool_result(&ToolResult {
            tool_call_id: "call_1".into(),
            payload: json!({"found": true}),
        }));
        history.push(ConversationTurn::assistant("Found you."));
        history.push(ConversationTurn::user("Thanks"));

        assert_eq!(history.len(), 2);
        assert!(!history.iter().any(ConversationTurn::is_tool_result));
    }

    fn tool_round(calls: usize) -> Vec<ConversationTurn> {
        let requests = (0..calls)
            .map(|i| ToolCallRequest::new(format!("call_{i}"), "get_order_timing", Map::new()))
            .collect();
        let mut round = vec![ConversationTurn::assistant_tool_calls(None, requests)];
        round.extend((0..calls).map(|i| {
            ConversationTurn::tool_result(&ToolResult {
                tool_call_id: format!("call_{i}"),
                payload: json!({"found": true}),
            })
        }));
        round
    }

    #[test]
    fn test_oversized_tool_round_is_kept_whole() {
        let mut history = ConversationHistory::default();
        history.push(ConversationTurn::user("where are my orders"));
        for turn in tool_round(20) {
            history.push(turn);
        }

        assert_eq!(history.len(), 21);
        assert!(history.iter().next().is_some_and(ConversationTurn::is_assistant));
        assert_eq!(history.iter().filter(|t| t.is_tool_result()).count(), 20);

        history.push(ConversationTurn::assistant("All four orders are ready."));
        assert_eq!(history.len(), 1);
        assert_eq!(
            history.last(),
            Some(&ConversationTurn::assistant("All four orders are ready."))
        );
    }

    #[test]
    fn test_round_at_the_limit_evicts_only_older_turns() {
        let mut history = ConversationHistory::default();
        history.push(ConversationTurn::user("hello"));
        history.push(ConversationTurn::assistant("Hi, what is your member ID?"));
        history.push(ConversationTurn::user("M1001"));
        for turn in tool_round(19) {
            history.push(turn);
        }

        assert_eq!(history.len(), HISTORY_LIMIT);
        assert!(history.iter().next().is_some_and(ConversationTurn::is_assistant));
        assert_eq!(history.iter().filter(|t| t.is_tool_result()).count(), 19);
    }

    #[test]
    fn test_prompt_starts_with_system_turn() {
        let mut history = ConversationHistory::default();
        history.push(ConversationTurn::user("hello"));
        let prompt = history.to_prompt("be brief");
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0], ConversationTurn::system("be brief"));
        assert_eq!(prompt[1], ConversationTurn::user("hello"));
    }

    #[test]
    fn test_from_raw_arguments() {
        let call = ToolCallRequest::from_raw("c1", "verify_member_id", r#"{"member_id":"M1001"}"#);
        assert_eq!(call.arguments.get("member_id"), Some(&json!("M1001")));
        assert_eq!(call.arguments_json(), r#"{"member_id":"M1001"}"#);

        let broken = ToolCallRequest::from_raw("c2", "verify_member_id", "not json");
        assert!(broken.arguments.is_empty());

        let array = ToolCallRequest::from_raw("c3", "verify_member_id", "[1, 2]");
        assert!(array.arguments.is_empty());
    }

    #[test]
    fn test_turn_serialization_uses_role_tag() {
        let turn = ConversationTurn::tool_result(&ToolResult {
            tool_call_id: "call_9".into(),
            payload: json!({"found": false}),
        });
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_9");
        assert_eq!(value["content"], r#"{"found":false}"#);
    }
}
