use bridge_types::{
    EnvironmentMetadata, PendingPlanApproval, PendingQuestion, PluginInfo, RawEvent,
};
use serde_json::Value;

/// Coarse class of an event, used to pick the reconciler effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ContentChanged,
    Terminal,
    SessionError,
    Initialized,
    QuestionLifecycle,
    PlanApprovalLifecycle,
    Ignored,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Answered,
    Rejected,
    Dismissed,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Answered => "answered",
            RequestOutcome::Rejected => "rejected",
            RequestOutcome::Dismissed => "dismissed",
        }
    }
}

/// A server event after one-time parsing at ingress.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    ContentChanged {
        event_type: String,
        session_id: Option<String>,
    },
    SessionIdle {
        session_id: Option<String>,
    },
    SessionError {
        session_id: Option<String>,
        error: String,
    },
    SessionInitialized {
        session_id: Option<String>,
        metadata: EnvironmentMetadata,
    },
    QuestionAsked(PendingQuestion),
    QuestionResolved {
        request_id: String,
        session_id: Option<String>,
        outcome: RequestOutcome,
    },
    PlanApprovalRequested(PendingPlanApproval),
    PlanApprovalResolved {
        request_id: String,
        session_id: Option<String>,
        outcome: RequestOutcome,
    },
    Ignored {
        event_type: String,
        session_id: Option<String>,
    },
    Unknown {
        event_type: String,
        session_id: Option<String>,
    },
}

impl BridgeEvent {
    pub fn parse(raw: &RawEvent) -> Self {
        let event_type = raw.event_type.trim();
        let props = &raw.properties;
        let session_id = resolve_session_id(raw);

        match event_type {
            "message.updated" | "message.part.updated" | "message.removed"
            | "message.part.removed" => BridgeEvent::ContentChanged {
                event_type: event_type.to_string(),
                session_id,
            },
            "session.idle" => BridgeEvent::SessionIdle { session_id },
            "session.status" if status_is_idle(props) => BridgeEvent::SessionIdle { session_id },
            "session.error" => {
                let error_value = props.get("error").unwrap_or(&Value::Null);
                let error = extract_error_message(error_value)
                    .unwrap_or_else(|| "The agent session reported an error".to_string());
                BridgeEvent::SessionError { session_id, error }
            }
            "session.initialized" | "system.init" => BridgeEvent::SessionInitialized {
                session_id,
                metadata: parse_metadata(props),
            },
            "question.asked" => match (request_id(props), session_id) {
                (Some(id), Some(session_id)) => BridgeEvent::QuestionAsked(PendingQuestion {
                    id,
                    session_id,
                    payload: props.clone(),
                }),
                (_, session_id) => BridgeEvent::Unknown {
                    event_type: event_type.to_string(),
                    session_id,
                },
            },
            "question.replied" | "question.answered" | "question.rejected"
            | "question.dismissed" => match request_id(props) {
                Some(request_id) => BridgeEvent::QuestionResolved {
                    request_id,
                    session_id,
                    outcome: outcome_for(event_type),
                },
                None => BridgeEvent::Unknown {
                    event_type: event_type.to_string(),
                    session_id,
                },
            },
            "plan.approval.requested" => match (request_id(props), session_id) {
                (Some(id), Some(session_id)) => {
                    BridgeEvent::PlanApprovalRequested(PendingPlanApproval {
                        id,
                        session_id,
                        payload: props.clone(),
                    })
                }
                (_, session_id) => BridgeEvent::Unknown {
                    event_type: event_type.to_string(),
                    session_id,
                },
            },
            "plan.approval.responded" | "plan.approval.rejected" | "plan.approval.dismissed" => {
                match request_id(props) {
                    Some(request_id) => BridgeEvent::PlanApprovalResolved {
                        request_id,
                        session_id,
                        outcome: outcome_for(event_type),
                    },
                    None => BridgeEvent::Unknown {
                        event_type: event_type.to_string(),
                        session_id,
                    },
                }
            }
            other if is_ignored_type(other) => BridgeEvent::Ignored {
                event_type: other.to_string(),
                session_id,
            },
            other => BridgeEvent::Unknown {
                event_type: other.to_string(),
                session_id,
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::ContentChanged { .. } => EventKind::ContentChanged,
            BridgeEvent::SessionIdle { .. } => EventKind::Terminal,
            BridgeEvent::SessionError { .. } => EventKind::SessionError,
            BridgeEvent::SessionInitialized { .. } => EventKind::Initialized,
            BridgeEvent::QuestionAsked(_) | BridgeEvent::QuestionResolved { .. } => {
                EventKind::QuestionLifecycle
            }
            BridgeEvent::PlanApprovalRequested(_) | BridgeEvent::PlanApprovalResolved { .. } => {
                EventKind::PlanApprovalLifecycle
            }
            BridgeEvent::Ignored { .. } => EventKind::Ignored,
            BridgeEvent::Unknown { .. } => EventKind::Unknown,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            BridgeEvent::ContentChanged { session_id, .. }
            | BridgeEvent::SessionIdle { session_id }
            | BridgeEvent::SessionError { session_id, .. }
            | BridgeEvent::SessionInitialized { session_id, .. }
            | BridgeEvent::QuestionResolved { session_id, .. }
            | BridgeEvent::PlanApprovalResolved { session_id, .. }
            | BridgeEvent::Ignored { session_id, .. }
            | BridgeEvent::Unknown { session_id, .. } => session_id.as_deref(),
            BridgeEvent::QuestionAsked(q) => Some(q.session_id.as_str()),
            BridgeEvent::PlanApprovalRequested(p) => Some(p.session_id.as_str()),
        }
    }

    /// Events handled without a matching local session: pending-request
    /// lifecycle (routed by request id) and environment initialization.
    pub fn is_session_independent(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::QuestionLifecycle
                | EventKind::PlanApprovalLifecycle
                | EventKind::Initialized
        )
    }

    pub fn event_type(&self) -> &str {
        match self {
            BridgeEvent::ContentChanged { event_type, .. }
            | BridgeEvent::Ignored { event_type, .. }
            | BridgeEvent::Unknown { event_type, .. } => event_type,
            BridgeEvent::SessionIdle { .. } => "session.idle",
            BridgeEvent::SessionError { .. } => "session.error",
            BridgeEvent::SessionInitialized { .. } => "session.initialized",
            BridgeEvent::QuestionAsked(_) => "question.asked",
            BridgeEvent::QuestionResolved { .. } => "question.resolved",
            BridgeEvent::PlanApprovalRequested(_) => "plan.approval.requested",
            BridgeEvent::PlanApprovalResolved { .. } => "plan.approval.resolved",
        }
    }
}

/// Keep-alives, init chatter and informational updates that never need a
/// local session to match.
pub fn is_ignored_type(event_type: &str) -> bool {
    const PREFIXES: [&str; 4] = ["server.", "permission.", "lsp.", "installation."];
    const EXACT: [&str; 6] = [
        "session.updated",
        "session.status",
        "session.diff",
        "session.compacted",
        "file.edited",
        "todo.updated",
    ];
    PREFIXES.iter().any(|p| event_type.starts_with(p)) || EXACT.contains(&event_type)
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Session id lives in different places depending on the event family.
pub fn resolve_session_id(raw: &RawEvent) -> Option<String> {
    const KEYS: [&str; 3] = ["sessionID", "sessionId", "session_id"];
    if let Some(id) = raw
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Some(id.to_string());
    }
    let props = &raw.properties;
    str_field(props, &KEYS)
        .or_else(|| props.get("info").and_then(|info| str_field(info, &KEYS)))
        .or_else(|| props.get("part").and_then(|part| str_field(part, &KEYS)))
        .or_else(|| props.get("session").and_then(|s| str_field(s, &["id"])))
        .map(str::to_string)
}

fn request_id(props: &Value) -> Option<String> {
    str_field(props, &["requestID", "requestId", "id"]).map(str::to_string)
}

fn outcome_for(event_type: &str) -> RequestOutcome {
    if event_type.ends_with(".rejected") {
        RequestOutcome::Rejected
    } else if event_type.ends_with(".dismissed") {
        RequestOutcome::Dismissed
    } else {
        RequestOutcome::Answered
    }
}

fn status_is_idle(props: &Value) -> bool {
    let status = props.get("status");
    let text = status
        .and_then(Value::as_str)
        .or_else(|| status.and_then(|s| s.get("type")).and_then(Value::as_str));
    matches!(text, Some(s) if s.eq_ignore_ascii_case("idle"))
}

fn parse_metadata(props: &Value) -> EnvironmentMetadata {
    let slash_commands = props
        .get("slashCommands")
        .or_else(|| props.get("slash_commands"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.as_str()
                        .or_else(|| item.get("name").and_then(Value::as_str))
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();

    let plugins = props
        .get("plugins")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(name) => Some(PluginInfo {
                        name: name.clone(),
                        path: None,
                    }),
                    Value::Object(_) => serde_json::from_value(item.clone()).ok(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    EnvironmentMetadata {
        slash_commands,
        plugins,
    }
}

fn extract_error_message(value: &Value) -> Option<String> {
    match value {
        Value::String(message) => Some(message.clone()),
        Value::Object(map) => {
            // Provider errors nest the useful text a couple of levels down.
            let nested = [
                map.get("data")
                    .and_then(|d| d.get("error"))
                    .and_then(|e| e.get("message")),
                map.get("error").and_then(|e| e.get("message")),
                map.get("data").and_then(|d| d.get("message")),
                map.get("message"),
            ];
            nested
                .into_iter()
                .flatten()
                .find_map(Value::as_str)
                .map(str::to_string)
                .or_else(|| map.get("name").and_then(Value::as_str).map(str::to_string))
                .or_else(|| Some(value.to_string()))
        }
        Value::Null => None,
        _ => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str, properties: Value) -> RawEvent {
        RawEvent::new(event_type, properties)
    }

    #[test]
    fn resolves_session_id_from_each_payload_shape() {
        let cases = [
            raw("session.idle", json!({"sessionID": "a"})),
            raw("message.updated", json!({"info": {"sessionID": "a"}})),
            raw("message.part.updated", json!({"part": {"sessionID": "a"}})),
            raw("session.updated", json!({"session": {"id": "a"}})),
            RawEvent {
                session_id: Some("a".to_string()),
                ..raw("session.idle", json!({}))
            },
        ];
        for event in cases {
            assert_eq!(resolve_session_id(&event).as_deref(), Some("a"), "{event:?}");
        }
        assert_eq!(resolve_session_id(&raw("session.idle", json!({"sessionID": " "}))), None);
    }

    #[test]
    fn classifies_content_and_terminal_events() {
        let part = BridgeEvent::parse(&raw(
            "message.part.updated",
            json!({"part": {"sessionID": "s1", "messageID": "m1"}}),
        ));
        assert_eq!(part.kind(), EventKind::ContentChanged);
        assert_eq!(part.session_id(), Some("s1"));

        let idle = BridgeEvent::parse(&raw(
            "session.status",
            json!({"sessionID": "s1", "status": {"type": "idle"}}),
        ));
        assert_eq!(idle.kind(), EventKind::Terminal);

        let busy = BridgeEvent::parse(&raw(
            "session.status",
            json!({"sessionID": "s1", "status": "busy"}),
        ));
        assert_eq!(busy.kind(), EventKind::Ignored);
    }

    #[test]
    fn session_error_prefers_nested_provider_message() {
        let event = BridgeEvent::parse(&raw(
            "session.error",
            json!({
                "sessionID": "s1",
                "error": {"name": "APIError", "data": {"message": "Rate limit exceeded"}}
            }),
        ));
        assert_eq!(
            event,
            BridgeEvent::SessionError {
                session_id: Some("s1".to_string()),
                error: "Rate limit exceeded".to_string(),
            }
        );
    }

    #[test]
    fn question_lifecycle_parses_by_request_id() {
        let asked = BridgeEvent::parse(&raw(
            "question.asked",
            json!({"id": "q1", "sessionID": "s1", "questions": []}),
        ));
        assert!(matches!(&asked, BridgeEvent::QuestionAsked(q) if q.id == "q1" && q.session_id == "s1"));

        let replied = BridgeEvent::parse(&raw("question.replied", json!({"requestID": "q1"})));
        assert_eq!(
            replied,
            BridgeEvent::QuestionResolved {
                request_id: "q1".to_string(),
                session_id: None,
                outcome: RequestOutcome::Answered,
            }
        );
        assert!(replied.is_session_independent());

        let rejected = BridgeEvent::parse(&raw(
            "plan.approval.rejected",
            json!({"requestID": "p1", "sessionID": "s1"}),
        ));
        assert!(matches!(
            rejected,
            BridgeEvent::PlanApprovalResolved { outcome: RequestOutcome::Rejected, .. }
        ));
    }

    #[test]
    fn question_without_session_is_not_a_pending_request() {
        let event = BridgeEvent::parse(&raw("question.asked", json!({"id": "q1"})));
        assert_eq!(event.kind(), EventKind::Unknown);
    }

    #[test]
    fn init_metadata_accepts_strings_and_objects() {
        let event = BridgeEvent::parse(&raw(
            "system.init",
            json!({
                "slashCommands": ["compact", {"name": "review"}],
                "plugins": ["fmt", {"name": "lint", "path": "/plugins/lint"}]
            }),
        ));
        let BridgeEvent::SessionInitialized { metadata, session_id } = event else {
            panic!("expected init event");
        };
        assert_eq!(session_id, None);
        assert_eq!(metadata.slash_commands, vec!["compact", "review"]);
        assert_eq!(metadata.plugins.len(), 2);
        assert_eq!(metadata.plugins[1].path.as_deref(), Some("/plugins/lint"));
    }

    #[test]
    fn keepalive_and_unknown_types() {
        assert_eq!(
            BridgeEvent::parse(&raw("server.heartbeat", json!({}))).kind(),
            EventKind::Ignored
        );
        assert_eq!(
            BridgeEvent::parse(&raw("agent.custom", json!({"sessionID": "s"}))).kind(),
            EventKind::Unknown
        );
    }
}
