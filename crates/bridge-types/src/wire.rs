use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event exactly as the bridge server sends it over SSE, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, alias = "data")]
    pub properties: Value,
    #[serde(
        default,
        rename = "sessionId",
        alias = "sessionID",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            session_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_data_as_properties_alias() {
        let raw: RawEvent = serde_json::from_value(json!({
            "type": "session.idle",
            "sessionId": "ses_1",
            "data": {"reason": "done"}
        }))
        .expect("raw event");
        assert_eq!(raw.session_id.as_deref(), Some("ses_1"));
        assert_eq!(raw.properties["reason"], "done");
    }
}
