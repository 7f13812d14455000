//! Groups a message's flat part list into display rows, nesting tool calls
//! made by a sub-agent under the Task invocation that spawned them.

use std::collections::HashMap;

use bridge_types::{DisplayNode, MessagePart, TaskGroup};

use crate::config::SyncConfig;

const DEFAULT_TASK_TOOL: &str = "task";

/// Builds display rows treating `task` (any case) as the sub-agent tool.
pub fn build(parts: &[MessagePart]) -> Vec<DisplayNode> {
    build_with(parts, |name| name.trim().eq_ignore_ascii_case(DEFAULT_TASK_TOOL))
}

/// Builds display rows using the configured set of sub-agent tool names.
pub fn build_for(parts: &[MessagePart], config: &SyncConfig) -> Vec<DisplayNode> {
    build_with(parts, |name| config.is_task_tool(name))
}

/// A tool call nests under the task named by its `parent_task_use_id` when
/// that task appeared earlier in the list. Without one it falls back to the
/// most recent task not yet interrupted by conversational content. That
/// fallback is positional only: two tasks whose children interleave without
/// parent ids get their children attributed to whichever task came last.
///
/// Tool results are dropped; their output already lives on the invocation.
pub fn build_with(parts: &[MessagePart], is_task: impl Fn(&str) -> bool) -> Vec<DisplayNode> {
    let mut nodes: Vec<DisplayNode> = Vec::with_capacity(parts.len());
    let mut task_groups: HashMap<&str, usize> = HashMap::new();
    let mut current_task: Option<usize> = None;

    for part in parts {
        match part {
            MessagePart::ToolResult { .. } => {}
            MessagePart::ToolInvocation(invocation) if is_task(&invocation.tool_name) => {
                let index = nodes.len();
                if let Some(use_id) = invocation.tool_use_id.as_deref() {
                    task_groups.insert(use_id, index);
                }
                current_task = Some(index);
                nodes.push(DisplayNode::TaskGroup(TaskGroup {
                    part: invocation.clone(),
                    children: Vec::new(),
                }));
            }
            MessagePart::ToolInvocation(invocation) => {
                let parent = invocation
                    .parent_task_use_id
                    .as_deref()
                    .and_then(|id| task_groups.get(id).copied())
                    .or(current_task);
                match parent.and_then(|index| nodes.get_mut(index)) {
                    Some(DisplayNode::TaskGroup(group)) => group.children.push(part.clone()),
                    _ => nodes.push(DisplayNode::Part { part: part.clone() }),
                }
            }
            _ => {
                current_task = None;
                nodes.push(DisplayNode::Part { part: part.clone() });
            }
        }
    }
    nodes
}
