//! Client-side core for intent-driven draft generation: start a run, follow its
//! event stream, review the draft, and keep progress durable across restarts.

pub mod command_client;
pub mod config;
pub mod controller;
pub mod error;
pub mod stream;

pub use command_client::{CommandClient, HttpCommandClient};
pub use config::{load_settings, ClientSettings};
pub use controller::{Session, SessionController, SessionEvent, TerminalOutcome};
pub use error::SessionError;
pub use stream::{SseStreamConsumer, StreamConsumer, StreamHandle, UpdateSink};

pub use shared::{
    domain::{HistoryEntry, RequestId, SessionStatus, StreamState},
    protocol::{AgentNote, AgentUpdate},
};
pub use storage::{KeyValueStore, MemoryKeyValueStore, SessionStore, SqliteKeyValueStore};
