use serde::{Deserialize, Serialize};

use crate::{MessagePart, ToolInvocation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub part: ToolInvocation,
    #[serde(default)]
    pub children: Vec<MessagePart>,
}

/// One renderable row: either a plain part or a task with its nested tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayNode {
    Part { part: MessagePart },
    TaskGroup(TaskGroup),
}

impl DisplayNode {
    pub fn as_task_group(&self) -> Option<&TaskGroup> {
        match self {
            DisplayNode::TaskGroup(group) => Some(group),
            DisplayNode::Part { .. } => None,
        }
    }
}
