use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(RequestId);

/// Lifecycle position of a generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Starting,
    Streaming,
    AwaitingReview,
    Revising,
    Approved,
    Declined,
}

impl SessionStatus {
    /// A live event stream is expected while the session is in one of these states.
    pub fn expects_stream(self) -> bool {
        matches!(self, Self::Streaming | Self::Revising)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::AwaitingReview => "awaiting_review",
            Self::Revising => "revising",
            Self::Approved => "approved",
            Self::Declined => "declined",
        };
        f.write_str(label)
    }
}

/// What the client knows about the event stream backing the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No run has been started, or the run finished.
    #[default]
    Ended,
    Live,
    /// Restored from durable storage; the backend may or may not still be producing.
    Unknown,
}

/// Archived draft, written once when a generation run finalizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub request_id: RequestId,
    #[serde(rename = "draft")]
    pub draft_text: String,
    pub timestamp: DateTime<Utc>,
}
