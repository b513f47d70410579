use crate::error::SyncError;
use crate::SyncTuning;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use tw_core::patch_protocol::{decode_inbound, ChannelMsg, FrameError, Inbound, PROBE_TEXT};
use tw_core::{Credential, EntityId, EntityKind};
use url::Url;

pub const AUTH_REJECTED_CLOSE_CODE: u16 = 4001;
pub const POLICY_VIOLATION_CLOSE_CODE: u16 = 1008;
pub const NORMAL_CLOSE_CODE: u16 = 1000;

pub fn is_auth_close(code: u16) -> bool {
    code == AUTH_REJECTED_CLOSE_CODE || code == POLICY_VIOLATION_CLOSE_CODE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
    AuthRejected,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Idle => "idle",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Error => "error",
            LinkStatus::AuthRejected => "auth_rejected",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the I/O layer observed on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Frame(String),
    HeartbeatDue,
    Closed { code: Option<u16>, reason: String },
    Failed { reason: String, auth: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    Local,
    Peer { code: Option<u16>, reason: String },
    AuthRejected { reason: String },
    TransportFailed { reason: String },
}

/// What the I/O layer must do in response.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelAction {
    Send(String),
    ArmHeartbeat(Duration),
    DisarmHeartbeat,
    Disconnect,
    Deliver(ChannelMsg),
    /// An undecodable frame. The channel stays open.
    Rejected(FrameError),
    Released(CloseOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Started { handle: ChannelHandle, url: Url },
    AlreadyActive,
}

#[derive(Debug)]
struct ChannelSlot {
    entity: EntityId,
    phase: ChannelPhase,
    heartbeat_armed: bool,
}

/// Channel lifecycle as a pure state machine. One guard per entity id stays
/// set from `open` until that channel's teardown.
#[derive(Debug)]
pub struct ChannelTransport {
    ws_base: Url,
    heartbeat_every: Duration,
    max_frame_bytes: usize,
    guards: HashMap<EntityId, ChannelHandle>,
    channels: HashMap<ChannelHandle, ChannelSlot>,
    next_handle: u64,
}

impl ChannelTransport {
    pub fn new(ws_base: Url, tuning: &SyncTuning) -> Self {
        Self {
            ws_base,
            heartbeat_every: tuning.heartbeat_every,
            max_frame_bytes: tuning.max_frame_bytes,
            guards: HashMap::new(),
            channels: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn channel_url(
        &self,
        kind: EntityKind,
        entity: &EntityId,
        credential: &Credential,
    ) -> Result<Url, SyncError> {
        let mut url = self.ws_base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Transport(format!("invalid channel base {}", self.ws_base)))?
            .pop_if_empty()
            .extend(kind.channel_route())
            .push(entity.as_str());
        url.query_pairs_mut()
            .clear()
            .append_pair("token", credential.expose());
        Ok(url)
    }

    pub fn open(
        &mut self,
        kind: EntityKind,
        entity: &EntityId,
        credential: &Credential,
    ) -> Result<OpenOutcome, SyncError> {
        if !credential.is_usable() {
            warn!(event = "channel_open_rejected", entity = %entity, reason = "missing_credential");
            return Err(SyncError::Auth(
                "credential is missing or a placeholder".to_string(),
            ));
        }
        if let Some(existing) = self.guards.get(entity) {
            debug!(event = "channel_open_guarded", entity = %entity, handle = %existing);
            return Ok(OpenOutcome::AlreadyActive);
        }

        let url = self.channel_url(kind, entity, credential)?;
        let handle = ChannelHandle(self.next_handle);
        self.next_handle += 1;
        self.guards.insert(entity.clone(), handle);
        self.channels.insert(
            handle,
            ChannelSlot {
                entity: entity.clone(),
                phase: ChannelPhase::Connecting,
                heartbeat_armed: false,
            },
        );
        info!(event = "channel_open", entity = %entity, kind = %kind, handle = %handle);
        Ok(OpenOutcome::Started { handle, url })
    }

    #[cfg(test)]
    pub fn phase(&self, handle: ChannelHandle) -> Option<ChannelPhase> {
        self.channels.get(&handle).map(|slot| slot.phase)
    }

    #[cfg(test)]
    pub fn is_guarded(&self, entity: &EntityId) -> bool {
        self.guards.contains_key(entity)
    }

    /// Local close. Calling it again, or after the peer closed, does nothing.
    pub fn close(&mut self, handle: ChannelHandle) -> Vec<ChannelAction> {
        if !self.channels.contains_key(&handle) {
            return Vec::new();
        }
        let mut actions = self.teardown(handle, CloseOutcome::Local);
        actions.insert(actions.len().saturating_sub(1), ChannelAction::Disconnect);
        actions
    }

    pub fn step(&mut self, handle: ChannelHandle, event: ChannelEvent) -> Vec<ChannelAction> {
        let Some(slot) = self.channels.get_mut(&handle) else {
            debug!(event = "channel_event_after_close", handle = %handle);
            return Vec::new();
        };

        match event {
            ChannelEvent::Opened => {
                if slot.phase != ChannelPhase::Connecting {
                    return Vec::new();
                }
                slot.phase = ChannelPhase::Open;
                slot.heartbeat_armed = true;
                info!(event = "channel_connected", entity = %slot.entity, handle = %handle);
                vec![ChannelAction::ArmHeartbeat(self.heartbeat_every)]
            }
            ChannelEvent::HeartbeatDue => {
                if slot.phase == ChannelPhase::Open {
                    vec![ChannelAction::Send(PROBE_TEXT.to_string())]
                } else {
                    Vec::new()
                }
            }
            ChannelEvent::Frame(text) => {
                if slot.phase != ChannelPhase::Open {
                    return Vec::new();
                }
                match decode_inbound(&text, self.max_frame_bytes) {
                    Ok(Inbound::Probe(style)) => vec![ChannelAction::Send(style.reply())],
                    Ok(Inbound::ProbeReply) => Vec::new(),
                    Ok(Inbound::Patch(msg)) => vec![ChannelAction::Deliver(msg)],
                    Ok(Inbound::Unknown { tag }) => {
                        warn!(event = "channel_unknown_tag", entity = %slot.entity, tag = %tag);
                        Vec::new()
                    }
                    Err(err) => {
                        warn!(event = "channel_decode_error", entity = %slot.entity, error = %err);
                        vec![ChannelAction::Rejected(err)]
                    }
                }
            }
            ChannelEvent::Closed { code, reason } => {
                let outcome = match code {
                    Some(code) if is_auth_close(code) => CloseOutcome::AuthRejected {
                        reason: format!("closed with code {code}: {reason}"),
                    },
                    _ => CloseOutcome::Peer { code, reason },
                };
                self.teardown(handle, outcome)
            }
            ChannelEvent::Failed { reason, auth } => {
                let outcome = if auth {
                    CloseOutcome::AuthRejected { reason }
                } else {
                    CloseOutcome::TransportFailed { reason }
                };
                self.teardown(handle, outcome)
            }
        }
    }

    fn teardown(&mut self, handle: ChannelHandle, outcome: CloseOutcome) -> Vec<ChannelAction> {
        let Some(slot) = self.channels.remove(&handle) else {
            return Vec::new();
        };
        if self.guards.get(&slot.entity) == Some(&handle) {
            self.guards.remove(&slot.entity);
        }

        match &outcome {
            CloseOutcome::AuthRejected { reason } => {
                warn!(event = "channel_auth_rejected", entity = %slot.entity, handle = %handle, reason = %reason);
            }
            CloseOutcome::TransportFailed { reason } => {
                warn!(event = "channel_failed", entity = %slot.entity, handle = %handle, reason = %reason);
            }
            CloseOutcome::Peer { code, reason } => {
                info!(event = "channel_closed", entity = %slot.entity, handle = %handle, code = ?code, reason = %reason);
            }
            CloseOutcome::Local => {
                info!(event = "channel_closed", entity = %slot.entity, handle = %handle, origin = "local");
            }
        }

        let mut actions = Vec::with_capacity(2);
        if slot.heartbeat_armed {
            actions.push(ChannelAction::DisarmHeartbeat);
        }
        actions.push(ChannelAction::Released(outcome));
        actions
    }
}
