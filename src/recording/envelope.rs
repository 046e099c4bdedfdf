//! Wire format of the session log.
//!
//! Every line of a session file is one [`SessionRecordLine`]:
//!
//! ```text
//! {"v":1,"seq":1,"ts":"2026-01-04T10:00:00Z","type":"session_start","payload":{...}}
//! {"v":1,"seq":2,"ts":"2026-01-04T10:00:03Z","type":"content","payload":{"content":{...}}}
//! ```
//!
//! `v` is the only schema-version field. Payloads never carry their own version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Content;

/// Current schema version written to `v`.
pub const SCHEMA_VERSION: u32 = 1;

/// Discriminator written to the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    Content,
    Compressed,
    Rewind,
    ProviderSwitch,
    SessionEvent,
    DirectoriesChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::Content => "content",
            EventType::Compressed => "compressed",
            EventType::Rewind => "rewind",
            EventType::ProviderSwitch => "provider_switch",
            EventType::SessionEvent => "session_event",
            EventType::DirectoriesChanged => "directories_changed",
        }
    }

    /// Parse a wire discriminator. Unknown values return `None` so readers can
    /// skip events written by newer versions.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "session_start" => EventType::SessionStart,
            "content" => EventType::Content,
            "compressed" => EventType::Compressed,
            "rewind" => EventType::Rewind,
            "provider_switch" => EventType::ProviderSwitch,
            "session_event" => EventType::SessionEvent,
            "directories_changed" => EventType::DirectoriesChanged,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartPayload {
    pub session_id: String,
    pub project_hash: String,
    #[serde(default)]
    pub workspace_dirs: Vec<String>,
    pub provider: String,
    pub model: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPayload {
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedPayload {
    pub summary: Content,
    pub items_compressed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindPayload {
    pub items_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSwitchPayload {
    pub provider: String,
    pub model: String,
}

/// Severity of an audit-only session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEventPayload {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoriesChangedPayload {
    pub directories: Vec<String>,
}

// ============================================================================
// Typed events
// ============================================================================

/// A typed event before it is wrapped in an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    SessionStart(SessionStartPayload),
    Content(ContentPayload),
    Compressed(CompressedPayload),
    Rewind(RewindPayload),
    ProviderSwitch(ProviderSwitchPayload),
    SessionEvent(SessionEventPayload),
    DirectoriesChanged(DirectoriesChangedPayload),
}

impl RecordEvent {
    pub fn content(content: Content) -> Self {
        RecordEvent::Content(ContentPayload { content })
    }

    pub fn compressed(summary: Content, items_compressed: usize) -> Self {
        RecordEvent::Compressed(CompressedPayload {
            summary,
            items_compressed,
        })
    }

    pub fn rewind(items_removed: usize) -> Self {
        RecordEvent::Rewind(RewindPayload { items_removed })
    }

    pub fn provider_switch(provider: impl Into<String>, model: impl Into<String>) -> Self {
        RecordEvent::ProviderSwitch(ProviderSwitchPayload {
            provider: provider.into(),
            model: model.into(),
        })
    }

    pub fn session_event(severity: Severity, message: impl Into<String>) -> Self {
        RecordEvent::SessionEvent(SessionEventPayload {
            severity,
            message: message.into(),
        })
    }

    pub fn directories_changed(directories: Vec<String>) -> Self {
        RecordEvent::DirectoriesChanged(DirectoriesChangedPayload { directories })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            RecordEvent::SessionStart(_) => EventType::SessionStart,
            RecordEvent::Content(_) => EventType::Content,
            RecordEvent::Compressed(_) => EventType::Compressed,
            RecordEvent::Rewind(_) => EventType::Rewind,
            RecordEvent::ProviderSwitch(_) => EventType::ProviderSwitch,
            RecordEvent::SessionEvent(_) => EventType::SessionEvent,
            RecordEvent::DirectoriesChanged(_) => EventType::DirectoriesChanged,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            RecordEvent::SessionStart(p) => serde_json::to_value(p),
            RecordEvent::Content(p) => serde_json::to_value(p),
            RecordEvent::Compressed(p) => serde_json::to_value(p),
            RecordEvent::Rewind(p) => serde_json::to_value(p),
            RecordEvent::ProviderSwitch(p) => serde_json::to_value(p),
            RecordEvent::SessionEvent(p) => serde_json::to_value(p),
            RecordEvent::DirectoriesChanged(p) => serde_json::to_value(p),
        }
    }

    pub fn from_payload(
        event_type: EventType,
        payload: serde_json::Value,
    ) -> serde_json::Result<Self> {
        Ok(match event_type {
            EventType::SessionStart => RecordEvent::SessionStart(serde_json::from_value(payload)?),
            EventType::Content => RecordEvent::Content(serde_json::from_value(payload)?),
            EventType::Compressed => RecordEvent::Compressed(serde_json::from_value(payload)?),
            EventType::Rewind => RecordEvent::Rewind(serde_json::from_value(payload)?),
            EventType::ProviderSwitch => {
                RecordEvent::ProviderSwitch(serde_json::from_value(payload)?)
            }
            EventType::SessionEvent => RecordEvent::SessionEvent(serde_json::from_value(payload)?),
            EventType::DirectoriesChanged => {
                RecordEvent::DirectoriesChanged(serde_json::from_value(payload)?)
            }
        })
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// One line of a session file.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecordLine {
    pub v: u32,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub event: RecordEvent,
}

impl SessionRecordLine {
    pub fn new(seq: u64, event: RecordEvent) -> Self {
        Self {
            v: SCHEMA_VERSION,
            seq,
            ts: Utc::now(),
            event,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    /// Serialize to a single JSON line without the trailing newline.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let wire = WireLineRef {
            v: self.v,
            seq: self.seq,
            ts: self.ts,
            event_type: self.event_type(),
            payload: self.event.to_payload()?,
        };
        serde_json::to_string(&wire)
    }
}

#[derive(Serialize)]
struct WireLineRef {
    v: u32,
    seq: u64,
    ts: DateTime<Utc>,
    #[serde(rename = "type")]
    event_type: EventType,
    payload: serde_json::Value,
}

/// Loosely typed envelope used by readers.
///
/// `type` stays a string so lines from newer writers still parse and can be
/// skipped by discriminator instead of failing as corrupt.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecordLine {
    #[serde(default)]
    pub v: u32,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawRecordLine {
    pub fn parse(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn known_type(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }

    pub fn into_event(self) -> Option<serde_json::Result<RecordEvent>> {
        let event_type = self.known_type()?;
        Some(RecordEvent::from_payload(event_type, self.payload))
    }
}
