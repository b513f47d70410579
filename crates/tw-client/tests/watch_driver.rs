use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, connect_async};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::UrlError;
use tw_client::{
    run_watch, ApiError, ClientConfig, SnapshotSource, WatchCommand, WatchEvent, WatchOptions,
};
use tw_core::{Credential, EntityId, EntityKind, Snapshot, Status};
use tw_sync::{LinkStatus, SyncError};
use url::Url;

struct ScriptedSource {
    responses: Mutex<VecDeque<Value>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    /// Serves `responses` in order, repeating the last one.
    fn new(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch_snapshot(&self, _kind: EntityKind, id: &EntityId) -> Result<Snapshot, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut responses = self.responses.lock().expect("responses");
            if responses.len() > 1 {
                responses.pop_front()
            } else {
                responses.front().cloned()
            }
        };
        let raw = next.ok_or_else(|| ApiError::Decode("no scripted snapshot".to_string()))?;
        Snapshot::from_value(raw, Some(id)).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

async fn bind() -> (TcpListener, ClientConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let api = Url::parse(&format!("http://127.0.0.1:{port}/api/v1")).expect("url");
    let mut config = ClientConfig::new(api, None, Credential::new("test-token"));
    config.tuning.resync_delay = Duration::from_millis(50);
    (listener, config)
}

fn drain(events: &mut mpsc::Receiver<WatchEvent>) -> Vec<WatchEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Probes the client, streams `frames`, then records everything the client
/// sends until it closes.
async fn serve_channel(listener: TcpListener, frames: Vec<String>) -> (String, Vec<String>) {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut path = String::new();
    let mut ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().to_string();
        Ok::<Response, ErrorResponse>(resp)
    })
    .await
    .expect("handshake");

    let mut received = Vec::new();
    ws.send(Message::Text("ping".to_string())).await.expect("probe");
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            let done = text == "pong";
            received.push(text);
            if done {
                break;
            }
        }
    }

    for frame in frames {
        ws.send(Message::Text(frame)).await.expect("frame");
    }
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Text(text) => received.push(text),
            Message::Close(_) => break,
            _ => {}
        }
    }
    (path, received)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_watch_folds_patches_and_settles_after_resync() {
    let (listener, config) = bind().await;

    let mut frames = vec![
        json!({"type": "status", "status": "running"}).to_string(),
        json!({"type": "progress", "processed": 5, "total": 20}).to_string(),
        json!({"type": "summary", "summary": {"threat_percentage": 10}}).to_string(),
        json!({"type": "telemetry", "cpu": 0.5}).to_string(),
        "{not json".to_string(),
    ];
    for idx in 0..12 {
        frames.push(json!({"type": "log", "line": format!("batch {idx}")}).to_string());
    }
    frames.push(
        json!({
            "type": "completed",
            "status": "completed",
            "summary": {"threat_percentage": 25},
            "timeline": [{"ts": "2026-01-01T00:00:00Z", "threats": 3}],
            "stats": {"total_logs": 12, "detected_threats": 3}
        })
        .to_string(),
    );
    let server = tokio::spawn(serve_channel(listener, frames));

    let source = ScriptedSource::new(vec![
        json!({"id": "job-1", "status": "queued", "total_logs": 0, "summary": {}}),
        json!({
            "id": "job-1",
            "status": "completed",
            "total_logs": 12,
            "summary": {"threat_percentage": 25, "model_name": "sentinel-small"}
        }),
    ]);
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let (_commands_tx, commands_rx) = mpsc::channel(4);

    let watch = run_watch(
        &config,
        EntityKind::Job,
        EntityId::new("job-1").expect("id"),
        source.clone(),
        WatchOptions {
            exit_when_settled: true,
        },
        events_tx,
        commands_rx,
    );
    let view = tokio::time::timeout(Duration::from_secs(10), watch)
        .await
        .expect("watch finished in time")
        .expect("watch succeeded")
        .expect("final view");

    assert_eq!(view.status, Status::Completed);
    assert!(view.terminal);
    assert_eq!(
        view.live_atoms,
        (0..12).map(|idx| format!("batch {idx}")).collect::<Vec<_>>()
    );
    assert_eq!(view.summary.get("threat_percentage"), Some(&json!(25)));
    assert_eq!(view.summary.get("model_name"), Some(&json!("sentinel-small")));
    assert_eq!(view.fields.get("total_logs"), Some(&json!(12)));
    assert_eq!(view.fields.get("detected_threats"), Some(&json!(3)));
    assert_eq!(view.progress.map(|p| p.percent()), Some(25));
    assert_eq!(view.timeline().len(), 1);
    assert_eq!(source.calls(), 2);

    let (path, received) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished")
        .expect("server task");
    assert_eq!(path, "/api/v1/ws/jobs/job-1?token=test-token");
    assert_eq!(received, vec!["pong".to_string()]);

    let events = drain(&mut events_rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, WatchEvent::Link(LinkStatus::Connected))));
    let errors: Vec<&SyncError> = events
        .iter()
        .filter_map(|event| match event {
            WatchEvent::Error(err) => Some(err),
            _ => None,
        })
        .collect();
    assert!(
        matches!(errors.as_slice(), [SyncError::Protocol(_)]),
        "only the malformed frame should be reported, got {errors:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_snapshot_settles_without_connecting() {
    let (listener, config) = bind().await;
    let source = ScriptedSource::new(vec![json!({
        "id": "job-2",
        "status": "completed",
        "summary": {"threat_percentage": 0}
    })]);
    let (events_tx, _events_rx) = mpsc::channel(16);
    let (_commands_tx, commands_rx) = mpsc::channel(4);

    let view = run_watch(
        &config,
        EntityKind::Job,
        EntityId::new("job-2").expect("id"),
        source.clone(),
        WatchOptions {
            exit_when_settled: true,
        },
        events_tx,
        commands_rx,
    )
    .await
    .expect("watch")
    .expect("view");

    assert_eq!(view.status, Status::Completed);
    assert!(view.live_atoms.is_empty());
    assert_eq!(source.calls(), 1);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err(),
        "no channel should be opened for a finished job"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_close_code_ends_the_watch_with_auth_error() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::from(4001),
                reason: Cow::Borrowed("Unauthorized"),
            }))
            .await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let source = ScriptedSource::new(vec![json!({"hunt_id": 5, "items": []})]);
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let (_commands_tx, commands_rx) = mpsc::channel(4);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        run_watch(
            &config,
            EntityKind::Hunt,
            EntityId::new("5").expect("id"),
            source,
            WatchOptions {
                exit_when_settled: true,
            },
            events_tx,
            commands_rx,
        ),
    )
    .await
    .expect("watch finished in time");

    assert!(matches!(result, Err(SyncError::Auth(_))), "got {result:?}");
    let events = drain(&mut events_rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, WatchEvent::Link(LinkStatus::AuthRejected))));
    let _ = server.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_rejection_is_reported_as_auth() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let rejected = accept_hdr_async(stream, |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
            let reply: ErrorResponse = http::Response::builder()
                .status(401)
                .body(Some("Unauthorized".to_string()))
                .expect("response");
            Err(reply)
        })
        .await;
        assert!(rejected.is_err());
    });

    let source = ScriptedSource::new(vec![json!({"id": "job-3", "status": "running"})]);
    let (events_tx, _events_rx) = mpsc::channel(64);
    let (_commands_tx, commands_rx) = mpsc::channel(4);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        run_watch(
            &config,
            EntityKind::Job,
            EntityId::new("job-3").expect("id"),
            source,
            WatchOptions {
                exit_when_settled: true,
            },
            events_tx,
            commands_rx,
        ),
    )
    .await
    .expect("watch finished in time");

    assert!(matches!(result, Err(SyncError::Auth(_))), "got {result:?}");
    server.await.expect("server task");
}

struct RejectingSource;

#[async_trait]
impl SnapshotSource for RejectingSource {
    async fn fetch_snapshot(&self, _kind: EntityKind, _id: &EntityId) -> Result<Snapshot, ApiError> {
        Err(ApiError::Unauthorized(401))
    }
}

type WatchTask = JoinHandle<Result<Option<tw_sync::MergedView>, SyncError>>;

fn spawn_watch(
    config: ClientConfig,
    entity: &str,
    source: Arc<dyn SnapshotSource>,
) -> (WatchTask, mpsc::Receiver<WatchEvent>, mpsc::Sender<WatchCommand>) {
    let (events_tx, events_rx) = mpsc::channel(256);
    let (commands_tx, commands_rx) = mpsc::channel(4);
    let entity = EntityId::new(entity).expect("id");
    let task = tokio::spawn(async move {
        run_watch(
            &config,
            EntityKind::Job,
            entity,
            source,
            WatchOptions::default(),
            events_tx,
            commands_rx,
        )
        .await
    });
    (task, events_rx, commands_tx)
}

/// Waits for the next event matching `wanted`, skipping everything else.
async fn wait_for(
    events: &mut mpsc::Receiver<WatchEvent>,
    wanted: impl Fn(&WatchEvent) -> bool,
) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("watch event");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

fn is_connected(event: &WatchEvent) -> bool {
    matches!(event, WatchEvent::Link(LinkStatus::Connected))
}

/// Accepts one channel, records its path and waits for the client to close.
async fn accept_until_closed(listener: &TcpListener) -> (String, bool) {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut path = String::new();
    let mut ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().to_string();
        Ok::<Response, ErrorResponse>(resp)
    })
    .await
    .expect("handshake");
    let mut saw_close = false;
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Close(_) = msg {
            saw_close = true;
            break;
        }
    }
    (path, saw_close)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_first_snapshot_ends_the_watch_with_auth_error() {
    let (_listener, config) = bind().await;
    let (events_tx, mut events_rx) = mpsc::channel(16);
    let (_commands_tx, commands_rx) = mpsc::channel(4);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        run_watch(
            &config,
            EntityKind::Job,
            EntityId::new("job-4").expect("id"),
            Arc::new(RejectingSource),
            WatchOptions {
                exit_when_settled: true,
            },
            events_tx,
            commands_rx,
        ),
    )
    .await
    .expect("watch finished in time");

    assert!(matches!(result, Err(SyncError::Auth(_))), "got {result:?}");
    let events = drain(&mut events_rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, WatchEvent::Link(LinkStatus::AuthRejected))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn normal_close_before_completion_ends_the_watch() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        ws.send(Message::Text(
            json!({"type": "status", "status": "running"}).to_string(),
        ))
        .await
        .expect("frame");
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed("bye"),
            }))
            .await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let source = ScriptedSource::new(vec![json!({"id": "job-5", "status": "queued"})]);
    let (events_tx, _events_rx) = mpsc::channel(64);
    let (_commands_tx, commands_rx) = mpsc::channel(4);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        run_watch(
            &config,
            EntityKind::Job,
            EntityId::new("job-5").expect("id"),
            source,
            WatchOptions {
                exit_when_settled: true,
            },
            events_tx,
            commands_rx,
        ),
    )
    .await
    .expect("watch finished in time");

    assert_eq!(
        result,
        Err(SyncError::Transport(
            "peer closed before completion".to_string()
        ))
    );
    let _ = server.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_command_reloads_the_snapshot_over_a_live_channel() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move { accept_until_closed(&listener).await });

    let source = ScriptedSource::new(vec![
        json!({"id": "job-6", "status": "running", "summary": {}}),
        json!({"id": "job-6", "status": "running", "summary": {"threat_percentage": 7}}),
    ]);
    let (task, mut events, commands) = spawn_watch(config, "job-6", source.clone());

    wait_for(&mut events, is_connected).await;
    commands.send(WatchCommand::Refresh).await.expect("refresh");
    wait_for(&mut events, |event| {
        matches!(event, WatchEvent::View(view)
            if view.summary.get("threat_percentage") == Some(&json!(7)))
    })
    .await;
    assert_eq!(source.calls(), 2);

    commands.send(WatchCommand::Dispose).await.expect("dispose");
    let view = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("watch finished in time")
        .expect("watch task")
        .expect("watch succeeded")
        .expect("view");
    assert_eq!(view.status, Status::Running);

    let (path, saw_close) = server.await.expect("server task");
    assert_eq!(path, "/api/v1/ws/jobs/job-6?token=test-token");
    assert!(saw_close, "dispose should close the channel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observing_another_job_closes_the_old_channel_first() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let first = accept_until_closed(&listener).await;
        let second = accept_until_closed(&listener).await;
        (first, second)
    });

    let source = ScriptedSource::new(vec![json!({"status": "running"})]);
    let (task, mut events, commands) = spawn_watch(config, "job-a", source.clone());

    wait_for(&mut events, is_connected).await;
    commands
        .send(WatchCommand::Observe(EntityId::new("job-b").expect("id")))
        .await
        .expect("observe");
    wait_for(&mut events, is_connected).await;
    assert_eq!(source.calls(), 2);

    commands.send(WatchCommand::Dispose).await.expect("dispose");
    let view = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("watch finished in time")
        .expect("watch task")
        .expect("watch succeeded")
        .expect("view");
    assert_eq!(view.id.as_str(), "job-b");

    let ((first_path, first_closed), (second_path, second_closed)) =
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server finished")
            .expect("server task");
    assert_eq!(first_path, "/api/v1/ws/jobs/job-a?token=test-token");
    assert!(first_closed, "switching entities should close the old channel");
    assert_eq!(second_path, "/api/v1/ws/jobs/job-b?token=test-token");
    assert!(second_closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secure_channel_addresses_attempt_a_tls_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        drop(stream);
    });

    let url = format!("wss://127.0.0.1:{port}/api/v1/ws/jobs/j?token=t");
    let result = tokio::time::timeout(Duration::from_secs(5), connect_async(url))
        .await
        .expect("connect finished in time");
    let Err(err) = result else {
        panic!("plain tcp peer cannot complete a tls handshake");
    };
    assert!(
        !matches!(
            err,
            tokio_tungstenite::tungstenite::Error::Url(UrlError::TlsFeatureNotEnabled)
        ),
        "tls support must be compiled in"
    );
    server.await.expect("server task");
}
