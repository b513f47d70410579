use crate::{deserialize_optional_flexible_id, Progress, Status};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const PROBE_TEXT: &str = "ping";
pub const PROBE_REPLY_TEXT: &str = "pong";

const TAG_FIELD: &str = "type";
const KNOWN_TAGS: &[&str] = &[
    "status",
    "summary",
    "timeline",
    "collection",
    "log",
    "progress",
    "finding",
    "execution_created",
    "initial",
    "completed",
    "error",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMsg {
    Status(StatusPatch),
    Summary(SummaryPatch),
    Timeline(TimelinePatch),
    Collection(CollectionPatch),
    Log(LogPatch),
    Progress(Progress),
    Finding(FindingPatch),
    ExecutionCreated(ExecutionCreatedPatch),
    Initial(InitialPatch),
    Completed(CompletedPatch),
    Error(ErrorPatch),
}

impl ChannelMsg {
    pub fn tag(&self) -> &'static str {
        match self {
            ChannelMsg::Status(_) => "status",
            ChannelMsg::Summary(_) => "summary",
            ChannelMsg::Timeline(_) => "timeline",
            ChannelMsg::Collection(_) => "collection",
            ChannelMsg::Log(_) => "log",
            ChannelMsg::Progress(_) => "progress",
            ChannelMsg::Finding(_) => "finding",
            ChannelMsg::ExecutionCreated(_) => "execution_created",
            ChannelMsg::Initial(_) => "initial",
            ChannelMsg::Completed(_) => "completed",
            ChannelMsg::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPatch {
    pub status: Status,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryPatch {
    #[serde(default)]
    pub summary: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelinePatch {
    #[serde(default)]
    pub timeline: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionPatch {
    pub name: String,
    #[serde(default)]
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogPatch {
    #[serde(alias = "message")]
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindingPatch {
    pub item: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionCreatedPatch {
    #[serde(default, deserialize_with = "deserialize_optional_flexible_id")]
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InitialPatch {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletedPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorPatch {
    #[serde(default, alias = "error", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl ErrorPatch {
    pub fn text(&self) -> &str {
        self.message
            .as_deref()
            .filter(|msg| !msg.trim().is_empty())
            .unwrap_or("unspecified backend error")
    }

    /// An error ends the entity only when the producer says so.
    pub fn is_fatal(&self) -> bool {
        self.fatal || self.status == Some(Status::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStyle {
    Text,
    Json,
}

impl ProbeStyle {
    pub fn reply(self) -> String {
        match self {
            ProbeStyle::Text => PROBE_REPLY_TEXT.to_string(),
            ProbeStyle::Json => json!({ TAG_FIELD: PROBE_REPLY_TEXT }).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Probe(ProbeStyle),
    ProbeReply,
    Patch(ChannelMsg),
    Unknown { tag: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame has no string `type` tag")]
    MissingTag,
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Classifies one text frame. Liveness probes are recognised before JSON
/// parsing; unrecognised tags are reported rather than rejected so newer
/// producers do not break older consumers.
pub fn decode_inbound(text: &str, max_frame_bytes: usize) -> Result<Inbound, FrameError> {
    let raw = text.trim();
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    match raw {
        PROBE_TEXT => return Ok(Inbound::Probe(ProbeStyle::Text)),
        PROBE_REPLY_TEXT => return Ok(Inbound::ProbeReply),
        _ => {}
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    let tag = value
        .get(TAG_FIELD)
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingTag)?
        .to_string();

    match tag.as_str() {
        PROBE_TEXT => Ok(Inbound::Probe(ProbeStyle::Json)),
        PROBE_REPLY_TEXT => Ok(Inbound::ProbeReply),
        known if KNOWN_TAGS.contains(&known) => serde_json::from_value::<ChannelMsg>(value)
            .map(Inbound::Patch)
            .map_err(|err| FrameError::Decode(format!("{tag}: {err}"))),
        _ => Ok(Inbound::Unknown { tag }),
    }
}
