use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Where a message came from.
///
/// `Server` messages are authoritative. `Optimistic` messages are local echoes
/// of a prompt and get replaced by the next fetch. `Local` messages (synthesized
/// errors and notices) are never persisted server-side and survive replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    #[default]
    Server,
    Optimistic,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub origin: MessageOrigin,
}

impl Message {
    pub fn server(id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            parts: Vec::new(),
            timestamp: Utc::now(),
            origin: MessageOrigin::Server,
        }
    }

    pub fn optimistic_user(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: format!("optimistic-{}", Uuid::new_v4()),
            role: MessageRole::User,
            parts: vec![MessagePart::Text { text: text.clone() }],
            content: text,
            timestamp: Utc::now(),
            origin: MessageOrigin::Optimistic,
        }
    }

    /// Client-synthesized error shown inline in the conversation.
    pub fn local_error(id_prefix: &str, text: impl Into<String>) -> Self {
        Self::local(id_prefix, MessageRole::Assistant, text)
    }

    fn local(id_prefix: &str, role: MessageRole, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: format!("{}{}", id_prefix, Uuid::new_v4()),
            role,
            parts: vec![MessagePart::Text { text: text.clone() }],
            content: text,
            timestamp: Utc::now(),
            origin: MessageOrigin::Local,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == MessageOrigin::Local
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolState {
    #[default]
    #[serde(alias = "running")]
    Pending,
    #[serde(alias = "completed")]
    Success,
    #[serde(alias = "error")]
    Failure,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_use_id: Option<String>,
    #[serde(default)]
    pub state: ToolState,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_metadata: Option<DiffMetadata>,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_use_id: None,
            parent_task_use_id: None,
            state: ToolState::Pending,
            args: Value::Null,
            output: None,
            error: None,
            diff_metadata: None,
        }
    }

    pub fn with_use_id(mut self, id: impl Into<String>) -> Self {
        self.tool_use_id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent_task_use_id: impl Into<String>) -> Self {
        self.parent_task_use_id = Some(parent_task_use_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    #[serde(alias = "reasoning")]
    Thinking { text: String },
    Text { text: String },
    ToolInvocation(ToolInvocation),
    #[serde(rename_all = "camelCase")]
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        output: Value,
    },
    #[serde(rename_all = "camelCase")]
    File {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl MessagePart {
    pub fn as_tool_invocation(&self) -> Option<&ToolInvocation> {
        match self {
            MessagePart::ToolInvocation(invocation) => Some(invocation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_invocation_part_reads_camel_case_wire_fields() {
        let part: MessagePart = serde_json::from_value(json!({
            "type": "tool-invocation",
            "toolName": "Bash",
            "toolUseId": "tu_2",
            "parentTaskUseId": "tu_1",
            "state": "completed",
            "args": {"command": "ls"}
        }))
        .expect("part");
        let invocation = part.as_tool_invocation().expect("tool invocation");
        assert_eq!(invocation.tool_name, "Bash");
        assert_eq!(invocation.parent_task_use_id.as_deref(), Some("tu_1"));
        assert_eq!(invocation.state, ToolState::Success);
    }

    #[test]
    fn reasoning_alias_maps_to_thinking() {
        let part: MessagePart =
            serde_json::from_value(json!({"type": "reasoning", "text": "hmm"})).expect("part");
        assert!(matches!(part, MessagePart::Thinking { text } if text == "hmm"));
    }

    #[test]
    fn local_error_carries_prefix_and_local_origin() {
        let msg = Message::local_error("local-error-", "Prompt failed");
        assert!(msg.id.starts_with("local-error-"));
        assert!(msg.is_local());
        assert_eq!(msg.content, "Prompt failed");
    }

    #[test]
    fn server_messages_default_to_server_origin_when_tag_missing() {
        let msg: Message = serde_json::from_value(json!({
            "id": "msg_1",
            "role": "assistant",
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .expect("message");
        assert_eq!(msg.origin, MessageOrigin::Server);
        assert!(msg.parts.is_empty());
    }
}
