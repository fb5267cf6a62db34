use serde::{Deserialize, Serialize};

use crate::domain::RequestId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub intent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub final_text: String,
}

/// Body shared by the decline and rerun endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewNoteRequest {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentNote {
    pub agent: String,
    pub message: String,
}

/// One `data:` payload on the `/stream/{request_id}` channel.
///
/// `draft_text` is the full draft as of this update, never a diff. Older
/// backends only send the accumulated `notes` of a run, so `agent` and
/// `message` default to empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpdate {
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub message: String,
    pub draft_text: String,
    #[serde(default)]
    pub finalized: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<AgentNote>,
}

impl AgentUpdate {
    pub fn new(
        agent: impl Into<String>,
        message: impl Into<String>,
        draft_text: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            message: message.into(),
            draft_text: draft_text.into(),
            finalized: false,
            notes: Vec::new(),
        }
    }

    pub fn finalized(mut self) -> Self {
        self.finalized = true;
        self
    }
}
