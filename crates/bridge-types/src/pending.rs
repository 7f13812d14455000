use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A question the agent asked and is still waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// A plan the agent proposed and wants approved before acting on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPlanApproval {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Environment-scoped data announced when a backend session initializes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnvironmentMetadata {
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
}
