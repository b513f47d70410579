use crate::config::ClientConfig;
use crate::rest::SnapshotSource;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tw_core::{Credential, EntityId, EntityKind, Snapshot};
use tw_sync::{
    ChannelEvent, ChannelHandle, Effect, LinkStatus, LoadTicket, MergedView, Reconciler,
    SyncError,
};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Frame = Option<Result<Message, tungstenite::Error>>;

#[derive(Debug, Clone)]
pub enum WatchEvent {
    View(MergedView),
    Link(LinkStatus),
    Error(SyncError),
}

#[derive(Debug, Clone)]
pub enum WatchCommand {
    Observe(EntityId),
    Refresh,
    /// Drop the current session and reload the same entity, e.g. for a new
    /// hunt execution after a failed one.
    Restart,
    Reconnect(Option<Credential>),
    Dispose,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Return once the entity is terminal and its final resync has landed.
    pub exit_when_settled: bool,
}

enum IoEvent {
    Snapshot {
        ticket: LoadTicket,
        result: Result<Snapshot, SyncError>,
    },
    Connected {
        handle: ChannelHandle,
        socket: Socket,
    },
    ConnectFailed {
        handle: ChannelHandle,
        reason: String,
        auth: bool,
    },
}

struct Link {
    handle: ChannelHandle,
    socket: Socket,
}

/// Binds a [`Reconciler`] to tokio: fetches run as tasks, the socket and
/// timers are polled from one select loop, so patches fold strictly in
/// arrival order.
pub struct WatchDriver {
    reconciler: Reconciler,
    source: Arc<dyn SnapshotSource>,
    events: mpsc::Sender<WatchEvent>,
    io_tx: mpsc::Sender<IoEvent>,
    io_rx: mpsc::Receiver<IoEvent>,
    link: Option<Link>,
    heartbeat: Option<(ChannelHandle, Interval)>,
    resync_at: Option<Pin<Box<Sleep>>>,
}

impl WatchDriver {
    pub fn new(
        config: &ClientConfig,
        kind: EntityKind,
        source: Arc<dyn SnapshotSource>,
        events: mpsc::Sender<WatchEvent>,
    ) -> Self {
        let reconciler = Reconciler::new(
            kind,
            config.ws_base.clone(),
            config.credential.clone(),
            config.tuning.clone(),
        );
        let (io_tx, io_rx) = mpsc::channel(16);
        Self {
            reconciler,
            source,
            events,
            io_tx,
            io_rx,
            link: None,
            heartbeat: None,
            resync_at: None,
        }
    }

    /// Drives the session until it is disposed, the command channel closes,
    /// or (with `exit_when_settled`) the entity settles or stalls. Returns the
    /// last merged view, or the error that stalled the session.
    pub async fn run(
        mut self,
        entity: EntityId,
        options: WatchOptions,
        mut commands: mpsc::Receiver<WatchCommand>,
    ) -> Result<Option<MergedView>, SyncError> {
        let mut queue: VecDeque<Effect> = self.reconciler.observe(entity).into();
        loop {
            while let Some(effect) = queue.pop_front() {
                let follow = self.perform(effect).await;
                queue.extend(follow);
            }

            if options.exit_when_settled {
                if self.reconciler.is_settled() {
                    info!(event = "watch_settled", kind = %self.reconciler.kind());
                    return Ok(self.reconciler.view());
                }
                if let Some(err) = self.reconciler.stalled() {
                    warn!(
                        event = "watch_stalled",
                        kind = %self.reconciler.kind(),
                        link = %self.reconciler.link_status(),
                        error = %err
                    );
                    self.shutdown().await;
                    return Err(err);
                }
            }

            let follow = tokio::select! {
                Some(io) = self.io_rx.recv() => self.on_io(io).await,
                (handle, frame) = next_frame(&mut self.link) => self.on_frame(handle, frame),
                handle = next_tick(&mut self.heartbeat) => {
                    self.reconciler.channel_event(handle, ChannelEvent::HeartbeatDue)
                }
                _ = resync_timer(&mut self.resync_at) => {
                    self.resync_at = None;
                    self.reconciler.resync_due()
                }
                command = commands.recv() => match command {
                    Some(WatchCommand::Observe(next)) => {
                        self.resync_at = None;
                        self.reconciler.observe(next)
                    }
                    Some(WatchCommand::Refresh) => self.reconciler.refresh(),
                    Some(WatchCommand::Restart) => {
                        self.resync_at = None;
                        self.reconciler.restart()
                    }
                    Some(WatchCommand::Reconnect(credential)) => {
                        self.reconciler.reconnect(credential)
                    }
                    Some(WatchCommand::Dispose) | None => {
                        let view = self.reconciler.view();
                        self.shutdown().await;
                        return Ok(view);
                    }
                },
            };
            queue.extend(follow);
        }
    }

    async fn shutdown(&mut self) {
        let effects = self.reconciler.dispose();
        for effect in effects {
            // Teardown only produces socket and timer effects.
            let _ = self.perform(effect).await;
        }
        self.resync_at = None;
    }

    async fn perform(&mut self, effect: Effect) -> Vec<Effect> {
        match effect {
            Effect::FetchSnapshot {
                ticket,
                kind,
                entity,
            } => {
                let source = Arc::clone(&self.source);
                let tx = self.io_tx.clone();
                tokio::spawn(async move {
                    let result = source
                        .fetch_snapshot(kind, &entity)
                        .await
                        .map_err(SyncError::from);
                    let _ = tx.send(IoEvent::Snapshot { ticket, result }).await;
                });
            }
            Effect::Connect { handle, url } => self.spawn_connect(handle, url),
            Effect::Send { handle, text } => {
                let Some(link) = self.link.as_mut().filter(|link| link.handle == handle) else {
                    debug!(event = "channel_send_without_link", handle = %handle);
                    return Vec::new();
                };
                let sent = link.socket.send(Message::Text(text)).await;
                if let Err(err) = sent {
                    self.link = None;
                    return self.reconciler.channel_event(
                        handle,
                        ChannelEvent::Failed {
                            reason: err.to_string(),
                            auth: false,
                        },
                    );
                }
            }
            Effect::ArmHeartbeat { handle, every } => {
                let mut ticker = interval_at(Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some((handle, ticker));
            }
            Effect::DisarmHeartbeat { handle } => {
                if matches!(&self.heartbeat, Some((armed, _)) if *armed == handle) {
                    self.heartbeat = None;
                }
            }
            Effect::Disconnect { handle } => {
                if self.link.as_ref().is_some_and(|link| link.handle == handle) {
                    if let Some(mut link) = self.link.take() {
                        let _ = link.socket.close(None).await;
                    }
                }
            }
            Effect::ScheduleResync { after } => {
                self.resync_at = Some(Box::pin(sleep(after)));
            }
            Effect::ViewChanged => {
                if let Some(view) = self.reconciler.view() {
                    self.emit(WatchEvent::View(view)).await;
                }
            }
            Effect::LinkChanged(status) => self.emit(WatchEvent::Link(status)).await,
            Effect::Surface(err) => self.emit(WatchEvent::Error(err)).await,
        }
        Vec::new()
    }

    fn spawn_connect(&self, handle: ChannelHandle, url: Url) {
        let tx = self.io_tx.clone();
        tokio::spawn(async move {
            let event = match connect_async(url.as_str()).await {
                Ok((socket, _)) => IoEvent::Connected { handle, socket },
                Err(tungstenite::Error::Http(response)) => {
                    let status = response.status().as_u16();
                    IoEvent::ConnectFailed {
                        handle,
                        reason: format!("handshake rejected with HTTP {status}"),
                        auth: status == 401 || status == 403,
                    }
                }
                Err(err) => IoEvent::ConnectFailed {
                    handle,
                    reason: err.to_string(),
                    auth: false,
                },
            };
            let _ = tx.send(event).await;
        });
    }

    async fn on_io(&mut self, io: IoEvent) -> Vec<Effect> {
        match io {
            IoEvent::Snapshot { ticket, result } => self.reconciler.snapshot_loaded(ticket, result),
            IoEvent::Connected { handle, mut socket } => {
                if !self.reconciler.is_live_channel(handle) {
                    debug!(event = "channel_connected_after_close", handle = %handle);
                    let _ = socket.close(None).await;
                    return Vec::new();
                }
                self.link = Some(Link { handle, socket });
                self.reconciler.channel_event(handle, ChannelEvent::Opened)
            }
            IoEvent::ConnectFailed {
                handle,
                reason,
                auth,
            } => {
                warn!(event = "channel_connect_failed", handle = %handle, auth, reason = %reason);
                self.reconciler
                    .channel_event(handle, ChannelEvent::Failed { reason, auth })
            }
        }
    }

    fn on_frame(&mut self, handle: ChannelHandle, frame: Frame) -> Vec<Effect> {
        let event = match frame {
            Some(Ok(Message::Text(text))) => ChannelEvent::Frame(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => ChannelEvent::Frame(text),
                Err(_) => {
                    warn!(event = "channel_binary_frame_dropped", handle = %handle);
                    return Vec::new();
                }
            },
            Some(Ok(Message::Close(close))) => {
                self.link = None;
                let (code, reason) = match close {
                    Some(close) => (Some(u16::from(close.code)), close.reason.to_string()),
                    None => (None, String::new()),
                };
                ChannelEvent::Closed { code, reason }
            }
            Some(Ok(_)) => return Vec::new(),
            Some(Err(err)) => {
                self.link = None;
                ChannelEvent::Failed {
                    reason: err.to_string(),
                    auth: false,
                }
            }
            None => {
                self.link = None;
                ChannelEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                }
            }
        };
        self.reconciler.channel_event(handle, event)
    }

    async fn emit(&self, event: WatchEvent) {
        if self.events.send(event).await.is_err() {
            debug!(event = "watch_event_receiver_gone");
        }
    }
}

async fn next_frame(link: &mut Option<Link>) -> (ChannelHandle, Frame) {
    match link {
        Some(link) => (link.handle, link.socket.next().await),
        None => pending().await,
    }
}

async fn next_tick(heartbeat: &mut Option<(ChannelHandle, Interval)>) -> ChannelHandle {
    match heartbeat {
        Some((handle, ticker)) => {
            ticker.tick().await;
            *handle
        }
        None => pending().await,
    }
}

async fn resync_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

/// Convenience wrapper that builds a driver and runs it.
pub async fn run_watch(
    config: &ClientConfig,
    kind: EntityKind,
    entity: EntityId,
    source: Arc<dyn SnapshotSource>,
    options: WatchOptions,
    events: mpsc::Sender<WatchEvent>,
    commands: mpsc::Receiver<WatchCommand>,
) -> Result<Option<MergedView>, SyncError> {
    WatchDriver::new(config, kind, source, events)
        .run(entity, options, commands)
        .await
}
