use crate::buffer::EventBuffer;
use crate::channel::{
    ChannelAction, ChannelEvent, ChannelHandle, ChannelTransport, CloseOutcome, LinkStatus,
    OpenOutcome, NORMAL_CLOSE_CODE,
};
use crate::error::SyncError;
use crate::merge::{merge_view, MergedView};
use crate::overlay::{FoldOutcome, Overlay};
use crate::SyncTuning;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use tw_core::patch_protocol::ChannelMsg;
use tw_core::{Credential, EntityId, EntityKind, Snapshot, Status};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadTicket(u64);

impl fmt::Display for LoadTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "load-{}", self.0)
    }
}

/// Work the reconciler asks its driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    FetchSnapshot {
        ticket: LoadTicket,
        kind: EntityKind,
        entity: EntityId,
    },
    Connect {
        handle: ChannelHandle,
        url: Url,
    },
    Send {
        handle: ChannelHandle,
        text: String,
    },
    ArmHeartbeat {
        handle: ChannelHandle,
        every: Duration,
    },
    DisarmHeartbeat {
        handle: ChannelHandle,
    },
    Disconnect {
        handle: ChannelHandle,
    },
    ScheduleResync {
        after: Duration,
    },
    ViewChanged,
    LinkChanged(LinkStatus),
    Surface(SyncError),
}

#[derive(Debug, Clone, Copy)]
struct PendingLoad {
    ticket: LoadTicket,
    folded_at_issue: u64,
}

#[derive(Debug)]
struct Session {
    entity: EntityId,
    snapshot: Option<Snapshot>,
    overlay: Overlay,
    buffer: EventBuffer<String>,
    channel: Option<ChannelHandle>,
    channel_spent: bool,
    link: LinkStatus,
    pending_load: Option<PendingLoad>,
    terminal_latched: bool,
    resync_scheduled: bool,
    resync_error: Option<SyncError>,
    auth_failed: bool,
    /// Last auth or transport failure that ended the channel.
    failure: Option<SyncError>,
}

impl Session {
    fn new(entity: EntityId, batch_size: usize) -> Self {
        Self {
            entity,
            snapshot: None,
            overlay: Overlay::default(),
            buffer: EventBuffer::new(batch_size),
            channel: None,
            channel_spent: false,
            link: LinkStatus::Idle,
            pending_load: None,
            terminal_latched: false,
            resync_scheduled: false,
            resync_error: None,
            auth_failed: false,
            failure: None,
        }
    }

    fn effective_status(&self) -> Status {
        self.overlay
            .status
            .or_else(|| self.snapshot.as_ref().map(|snap| snap.status))
            .unwrap_or_default()
    }

    fn wants_channel(&self) -> bool {
        self.snapshot.is_some()
            && !self.terminal_latched
            && !self.overlay.terminal
            && !self.effective_status().is_terminal()
            && !self.auth_failed
            && !self.channel_spent
    }
}

/// Owns one observation session: snapshot, overlay, event buffer and the
/// channel that feeds them. Inputs return the effects a driver must perform;
/// no I/O happens here.
#[derive(Debug)]
pub struct Reconciler {
    kind: EntityKind,
    credential: Credential,
    tuning: SyncTuning,
    transport: ChannelTransport,
    session: Option<Session>,
    next_ticket: u64,
}

impl Reconciler {
    pub fn new(kind: EntityKind, ws_base: Url, credential: Credential, tuning: SyncTuning) -> Self {
        let transport = ChannelTransport::new(ws_base, &tuning);
        Self {
            kind,
            credential,
            tuning,
            transport,
            session: None,
            next_ticket: 1,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn entity(&self) -> Option<&EntityId> {
        self.session.as_ref().map(|session| &session.entity)
    }

    pub fn view(&self) -> Option<MergedView> {
        let session = self.session.as_ref()?;
        let snapshot = session.snapshot.as_ref()?;
        Some(merge_view(snapshot, &session.overlay))
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.session.as_ref().map(|session| &session.overlay)
    }

    pub fn link_status(&self) -> LinkStatus {
        self.session
            .as_ref()
            .map(|session| session.link)
            .unwrap_or(LinkStatus::Idle)
    }

    pub fn resync_error(&self) -> Option<&SyncError> {
        self.session.as_ref()?.resync_error.as_ref()
    }

    pub fn pending_atoms(&self) -> usize {
        self.session
            .as_ref()
            .map(|session| session.buffer.len())
            .unwrap_or(0)
    }

    pub fn is_live_channel(&self, handle: ChannelHandle) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.channel == Some(handle))
    }

    /// True once the entity is terminal and nothing is left in flight.
    pub fn is_settled(&self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        let terminal = session.terminal_latched
            || session.overlay.terminal
            || session.effective_status().is_terminal();
        session.snapshot.is_some()
            && terminal
            && session.channel.is_none()
            && session.pending_load.is_none()
            && !session.resync_scheduled
    }

    /// The error that stopped a session which can no longer progress on its
    /// own: nothing is in flight and the entity is neither settled nor fed by
    /// a channel. `None` while anything is still pending.
    pub fn stalled(&self) -> Option<SyncError> {
        let session = self.session.as_ref()?;
        if session.pending_load.is_some() || session.channel.is_some() || session.resync_scheduled
        {
            return None;
        }
        if session.snapshot.is_none() {
            return Some(session.resync_error.clone().unwrap_or_else(|| {
                SyncError::Resync(format!("no snapshot loaded for {}", session.entity))
            }));
        }
        if self.is_settled() || session.wants_channel() {
            return None;
        }
        Some(session.failure.clone().unwrap_or_else(|| {
            SyncError::Transport("peer closed before completion".to_string())
        }))
    }

    pub fn observe(&mut self, entity: EntityId) -> Vec<Effect> {
        if self.entity() == Some(&entity) {
            return Vec::new();
        }
        let mut effects = self.dispose();
        info!(event = "watch_observe", kind = %self.kind, entity = %entity);
        self.session = Some(Session::new(entity, self.tuning.batch_size));
        self.issue_load(&mut effects);
        effects
    }

    /// Starts a fresh execution cycle for the current entity: the old session,
    /// including a latched terminal status, is dropped and reloaded.
    pub fn restart(&mut self) -> Vec<Effect> {
        let Some(entity) = self.entity().cloned() else {
            return Vec::new();
        };
        let mut effects = self.dispose();
        info!(event = "watch_restart", kind = %self.kind, entity = %entity);
        self.session = Some(Session::new(entity, self.tuning.batch_size));
        self.issue_load(&mut effects);
        effects
    }

    pub fn refresh(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.issue_load(&mut effects);
        effects
    }

    /// Caller-initiated reconnect after a transport failure or a fresh
    /// credential.
    pub fn reconnect(&mut self, credential: Option<Credential>) -> Vec<Effect> {
        if let Some(credential) = credential {
            self.credential = credential;
        }
        let mut effects = Vec::new();
        if let Some(session) = self.session.as_mut() {
            session.channel_spent = false;
            session.auth_failed = false;
            session.failure = None;
        }
        self.sync_channel(&mut effects);
        effects
    }

    pub fn resync_due(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return effects;
        };
        session.resync_scheduled = false;
        self.issue_load(&mut effects);
        effects
    }

    pub fn snapshot_loaded(
        &mut self,
        ticket: LoadTicket,
        result: Result<Snapshot, SyncError>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return effects;
        };
        let pending = match session.pending_load {
            Some(pending) if pending.ticket == ticket => pending,
            _ => {
                debug!(event = "snapshot_stale", ticket = %ticket, entity = %session.entity);
                return effects;
            }
        };
        session.pending_load = None;

        let snapshot = match result {
            Ok(snapshot) if snapshot.id == session.entity => snapshot,
            Ok(snapshot) => {
                warn!(event = "snapshot_id_mismatch", entity = %session.entity, got = %snapshot.id);
                let err = SyncError::Resync(format!(
                    "snapshot for {} returned id {}",
                    session.entity, snapshot.id
                ));
                session.resync_error = Some(err.clone());
                effects.push(Effect::Surface(err));
                return effects;
            }
            Err(err) => {
                warn!(event = "snapshot_failed", entity = %session.entity, error = %err);
                let reauth = err.needs_reauth();
                if reauth {
                    session.auth_failed = true;
                    session.failure = Some(err.clone());
                    session.link = LinkStatus::AuthRejected;
                    effects.push(Effect::LinkChanged(LinkStatus::AuthRejected));
                }
                session.resync_error = Some(err.clone());
                effects.push(Effect::Surface(err));
                effects.push(Effect::ViewChanged);
                if reauth {
                    self.sync_channel(&mut effects);
                }
                return effects;
            }
        };

        if snapshot.status.is_terminal() {
            session.overlay.force_status(snapshot.status);
            session.terminal_latched = true;
        } else if !session.overlay.terminal
            && session.overlay.folded() == pending.folded_at_issue
        {
            session.overlay.reset_keep_atoms();
        }
        debug!(
            event = "snapshot_loaded",
            entity = %session.entity,
            status = %snapshot.status,
            overlay_status = ?session.overlay.status
        );
        session.snapshot = Some(snapshot);
        session.resync_error = None;
        effects.push(Effect::ViewChanged);
        self.sync_channel(&mut effects);
        effects
    }

    pub fn channel_event(&mut self, handle: ChannelHandle, event: ChannelEvent) -> Vec<Effect> {
        let actions = self.transport.step(handle, event);
        let mut effects = Vec::new();
        self.apply_actions(handle, actions, &mut effects);
        effects
    }

    /// Ends the session: closes the channel and drops overlay and buffer.
    pub fn dispose(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(handle) = self.session.as_ref().and_then(|session| session.channel) else {
            self.session = None;
            return effects;
        };
        let actions = self.transport.close(handle);
        self.apply_actions(handle, actions, &mut effects);
        if let Some(session) = self.session.take() {
            info!(event = "watch_dispose", entity = %session.entity);
        }
        effects.retain(|effect| !matches!(effect, Effect::ViewChanged));
        effects
    }

    fn issue_load(&mut self, effects: &mut Vec<Effect>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let ticket = LoadTicket(self.next_ticket);
        self.next_ticket += 1;
        session.pending_load = Some(PendingLoad {
            ticket,
            folded_at_issue: session.overlay.folded(),
        });
        debug!(event = "snapshot_fetch", entity = %session.entity, ticket = %ticket);
        effects.push(Effect::FetchSnapshot {
            ticket,
            kind: self.kind,
            entity: session.entity.clone(),
        });
    }

    fn sync_channel(&mut self, effects: &mut Vec<Effect>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match (session.wants_channel(), session.channel) {
            (true, None) => {
                match self
                    .transport
                    .open(self.kind, &session.entity, &self.credential)
                {
                    Ok(OpenOutcome::Started { handle, url }) => {
                        session.channel = Some(handle);
                        session.link = LinkStatus::Connecting;
                        effects.push(Effect::Connect { handle, url });
                        effects.push(Effect::LinkChanged(LinkStatus::Connecting));
                    }
                    Ok(OpenOutcome::AlreadyActive) => {}
                    Err(err) => {
                        session.auth_failed = err.needs_reauth();
                        session.link = if session.auth_failed {
                            LinkStatus::AuthRejected
                        } else {
                            LinkStatus::Error
                        };
                        session.failure = Some(err.clone());
                        effects.push(Effect::LinkChanged(session.link));
                        effects.push(Effect::Surface(err));
                    }
                }
            }
            (false, Some(handle)) => {
                let actions = self.transport.close(handle);
                self.apply_actions(handle, actions, effects);
            }
            _ => {}
        }
    }

    fn apply_actions(
        &mut self,
        handle: ChannelHandle,
        actions: Vec<ChannelAction>,
        effects: &mut Vec<Effect>,
    ) {
        for action in actions {
            match action {
                ChannelAction::Send(text) => effects.push(Effect::Send { handle, text }),
                ChannelAction::ArmHeartbeat(every) => {
                    effects.push(Effect::ArmHeartbeat { handle, every });
                    if let Some(session) = self.live_session(handle) {
                        session.link = LinkStatus::Connected;
                        effects.push(Effect::LinkChanged(LinkStatus::Connected));
                    }
                }
                ChannelAction::DisarmHeartbeat => effects.push(Effect::DisarmHeartbeat { handle }),
                ChannelAction::Disconnect => effects.push(Effect::Disconnect { handle }),
                ChannelAction::Deliver(msg) => {
                    if self.live_session(handle).is_some() {
                        self.apply_patch(msg, effects);
                    }
                }
                ChannelAction::Rejected(err) => {
                    if self.live_session(handle).is_some() {
                        effects.push(Effect::Surface(SyncError::Protocol(err)));
                    }
                }
                ChannelAction::Released(outcome) => self.on_released(handle, outcome, effects),
            }
        }
    }

    fn live_session(&mut self, handle: ChannelHandle) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|session| session.channel == Some(handle))
    }

    fn apply_patch(&mut self, msg: ChannelMsg, effects: &mut Vec<Effect>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let tag = msg.tag();
        match session.overlay.fold(msg) {
            FoldOutcome::Applied => effects.push(Effect::ViewChanged),
            FoldOutcome::Atom(line) => {
                if let Some(batch) = session.buffer.push(line) {
                    debug!(event = "atoms_flushed", entity = %session.entity, count = batch.len());
                    session.overlay.append_atoms(batch);
                    effects.push(Effect::ViewChanged);
                }
            }
            FoldOutcome::Terminal => {
                effects.push(Effect::ViewChanged);
                self.on_terminal(effects);
            }
            FoldOutcome::Error { error, terminal } => {
                warn!(event = "domain_error", entity = %session.entity, fatal = terminal, error = %error);
                effects.push(Effect::Surface(SyncError::Domain(error)));
                effects.push(Effect::ViewChanged);
                if terminal {
                    self.on_terminal(effects);
                }
            }
            FoldOutcome::Ignored => {
                debug!(event = "patch_ignored", entity = %session.entity, tag = tag);
            }
        }
    }

    fn on_terminal(&mut self, effects: &mut Vec<Effect>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.terminal_latched = true;
        if !session.resync_scheduled {
            session.resync_scheduled = true;
            info!(
                event = "resync_scheduled",
                entity = %session.entity,
                delay_ms = self.tuning.resync_delay.as_millis() as u64
            );
            effects.push(Effect::ScheduleResync {
                after: self.tuning.resync_delay,
            });
        }
        self.sync_channel(effects);
    }

    fn on_released(
        &mut self,
        handle: ChannelHandle,
        outcome: CloseOutcome,
        effects: &mut Vec<Effect>,
    ) {
        let Some(session) = self.live_session(handle) else {
            return;
        };
        session.channel = None;
        session.channel_spent = true;

        let remainder = session.buffer.drain();
        if !remainder.is_empty() {
            debug!(event = "atoms_flushed", entity = %session.entity, count = remainder.len(), on_close = true);
            session.overlay.append_atoms(remainder);
            effects.push(Effect::ViewChanged);
        }

        let terminal = session.terminal_latched || session.overlay.terminal;
        let (link, surfaced) = match outcome {
            CloseOutcome::Local if session.auth_failed => (LinkStatus::AuthRejected, None),
            CloseOutcome::Local => (LinkStatus::Disconnected, None),
            CloseOutcome::AuthRejected { reason } => {
                session.auth_failed = true;
                (LinkStatus::AuthRejected, Some(SyncError::Auth(reason)))
            }
            CloseOutcome::TransportFailed { reason } => {
                (LinkStatus::Error, Some(SyncError::Transport(reason)))
            }
            CloseOutcome::Peer { code, reason } => {
                if terminal || code == Some(NORMAL_CLOSE_CODE) {
                    (LinkStatus::Disconnected, None)
                } else {
                    let detail = match code {
                        Some(code) => format!("peer closed with code {code}: {reason}"),
                        None => format!("peer closed: {reason}"),
                    };
                    (LinkStatus::Error, Some(SyncError::Transport(detail)))
                }
            }
        };
        session.link = link;
        effects.push(Effect::LinkChanged(link));
        if let Some(err) = surfaced {
            session.failure = Some(err.clone());
            effects.push(Effect::Surface(err));
        }
    }
}
