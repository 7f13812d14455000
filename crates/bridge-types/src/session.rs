use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Message;

/// Identifies one UI-visible conversation: a tab inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub environment_id: String,
    pub tab_id: String,
}

impl SessionKey {
    pub fn new(environment_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            tab_id: tab_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment_id, self.tab_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub is_loading: bool,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            is_loading: false,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}
