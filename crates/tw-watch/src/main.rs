use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    pin::pin,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use tw_client::{
    run_watch, ClientConfig, HuntApi, HuntRunner, JobApi, RestClient, SnapshotSource,
    WatchCommand, WatchEvent, WatchOptions, DEFAULT_API_BASE,
};
use tw_core::api_contracts::{
    AnalysisRequest, Conclusion, ConclusionConfidence, Environment, ExecutionMode, ExecutionRequest, HuntScope,
    Hypothesis, SearchDepth, Verdict,
};
use tw_core::{Credential, EntityId, EntityKind};
use tw_sync::{ExecutionPhase, MergedView, SyncError};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "tw-watch", about = "Watch analysis jobs and threat hunts live")]
struct Args {
    #[arg(long, default_value = "")]
    api_base: String,
    #[arg(long, default_value = "")]
    ws_base: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long)]
    heartbeat_secs: Option<u64>,
    #[arg(long)]
    log_batch: Option<usize>,
    #[arg(long)]
    resync_delay_ms: Option<u64>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch one analysis job until it finishes.
    Job {
        id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List recent analysis jobs.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Submit a new analysis job and optionally watch it.
    Analyze(AnalyzeArgs),
    /// Print the stored log lines of a job.
    Logs { id: String },
    /// Watch an existing hunt until its execution finishes.
    HuntWatch {
        id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Create, execute and optionally conclude a hunt.
    HuntRun(HuntRunArgs),
    /// List log datasets a hunt can be scoped to.
    Datasets,
}

#[derive(clap::Args, Debug)]
struct AnalyzeArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    model: String,
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    #[arg(long)]
    to: Option<DateTime<Utc>>,
    #[arg(long = "device")]
    devices: Vec<String>,
    #[arg(long)]
    file: Option<String>,
    #[arg(long, default_value_t = false)]
    watch: bool,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct HuntRunArgs {
    #[arg(long)]
    dataset: i64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    #[arg(long)]
    to: Option<DateTime<Utc>>,
    #[arg(long, default_value = "prod")]
    environment: Environment,
    #[arg(long)]
    hypothesis: String,
    #[arg(long = "technique")]
    techniques: Vec<String>,
    #[arg(long)]
    rationale: Option<String>,
    #[arg(long, default_value = "ai-assisted")]
    mode: ExecutionMode,
    #[arg(long, default_value = "standard")]
    depth: SearchDepth,
    #[arg(long)]
    strategy: Option<String>,
    #[arg(long)]
    verdict: Option<Verdict>,
    #[arg(long, default_value = "medium")]
    confidence: ConclusionConfidence,
    #[arg(long)]
    recommendations: Option<String>,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Clone, Debug)]
struct Config {
    client: ClientConfig,
    debug: bool,
    log_dir: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _log_guard = init_logging(&config);

    match args.command {
        Command::Job { id, json } => {
            let id = EntityId::new(id)?;
            watch_entity(&config, EntityKind::Job, id, json).await
        }
        Command::Jobs { limit } => list_jobs(&config, limit).await,
        Command::Analyze(analyze) => run_analysis(&config, analyze).await,
        Command::Logs { id } => print_job_logs(&config, EntityId::new(id)?).await,
        Command::HuntWatch { id, json } => {
            let id = EntityId::new(id)?;
            watch_entity(&config, EntityKind::Hunt, id, json).await
        }
        Command::HuntRun(run) => hunt_run(&config, run).await,
        Command::Datasets => list_datasets(&config).await,
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let api_base = resolve_setting(&args.api_base, "TW_API_BASE", DEFAULT_API_BASE);
    let api_base = Url::parse(&api_base).with_context(|| format!("invalid api base {api_base}"))?;
    let ws_base = resolve_setting(&args.ws_base, "TW_WS_BASE", "");
    let ws_base = if ws_base.is_empty() {
        None
    } else {
        Some(Url::parse(&ws_base).with_context(|| format!("invalid ws base {ws_base}"))?)
    };
    let token = resolve_setting(&args.token, "TW_AUTH_TOKEN", "");

    let mut client = ClientConfig::new(api_base, ws_base, Credential::new(token));
    client.tuning.heartbeat_every = Duration::from_secs(resolve_number(
        args.heartbeat_secs,
        "TW_HEARTBEAT_SECS",
        client.tuning.heartbeat_every.as_secs(),
    ));
    client.tuning.batch_size =
        resolve_number(args.log_batch, "TW_LOG_BATCH", client.tuning.batch_size).max(1);
    client.tuning.resync_delay = Duration::from_millis(resolve_number(
        args.resync_delay_ms,
        "TW_RESYNC_DELAY_MS",
        client.tuning.resync_delay.as_millis() as u64,
    ));

    Ok(Config {
        client,
        debug: args.debug || env_true("TW_DEBUG"),
        log_dir: resolve_setting(&args.log_dir, "TW_LOG_DIR", ""),
    })
}

fn resolve_setting(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    default.to_string()
}

fn resolve_number<T: FromStr>(flag: Option<T>, env_key: &str, default: T) -> T {
    if let Some(value) = flag {
        return value;
    }
    match std::env::var(env_key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(event = "config_invalid_number", key = env_key, value = %raw);
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_true(key: &str) -> bool {
    std::env::var(key)
        .map(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

struct Renderer {
    json: bool,
    atoms_printed: usize,
}

impl Renderer {
    fn new(json: bool) -> Self {
        Self {
            json,
            atoms_printed: 0,
        }
    }

    fn render(&mut self, event: &WatchEvent) {
        match event {
            WatchEvent::View(view) => self.render_view(view),
            WatchEvent::Link(status) => {
                if !self.json {
                    println!("link: {status}");
                }
            }
            WatchEvent::Error(err) => eprintln!("error[{}]: {err}", err.kind()),
        }
    }

    fn render_view(&mut self, view: &MergedView) {
        if self.json {
            match serde_json::to_string(view) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(event = "view_encode_failed", error = %err),
            }
            return;
        }
        for line in view.live_atoms.iter().skip(self.atoms_printed) {
            println!("  | {line}");
        }
        self.atoms_printed = self.atoms_printed.max(view.live_atoms.len());
        println!("{}", view_line(view));
    }
}

fn view_line(view: &MergedView) -> String {
    let mut line = format!("[{}] {}", view.status, view.id);
    if let Some(progress) = view.progress {
        line.push_str(&format!(
            " progress={}% ({}/{})",
            progress.percent(),
            progress.processed,
            progress.total
        ));
    }
    if let Some(execution_id) = &view.execution_id {
        line.push_str(&format!(" execution={execution_id}"));
    }
    if !view.findings.is_empty() {
        let counts = view.findings_summary();
        line.push_str(&format!(
            " findings={} (critical={} high={} medium={} low={})",
            counts.total, counts.critical, counts.high, counts.medium, counts.low
        ));
    }
    if !view.summary.is_empty() {
        let summary = serde_json::Value::Object(view.summary.clone());
        line.push_str(&format!(" summary={summary}"));
    }
    if let Some(err) = &view.last_error {
        line.push_str(&format!(" last_error={err:?}"));
    }
    line
}

type WatchTask = JoinHandle<std::result::Result<Option<MergedView>, SyncError>>;

fn spawn_watch(
    config: &Config,
    kind: EntityKind,
    id: EntityId,
    source: Arc<dyn SnapshotSource>,
) -> (WatchTask, mpsc::Receiver<WatchEvent>, mpsc::Sender<WatchCommand>) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let (commands_tx, commands_rx) = mpsc::channel(4);
    let client = config.client.clone();
    let task = tokio::spawn(async move {
        run_watch(
            &client,
            kind,
            id,
            source,
            WatchOptions {
                exit_when_settled: true,
            },
            events_tx,
            commands_rx,
        )
        .await
    });
    (task, events_rx, commands_tx)
}

async fn watch_entity(config: &Config, kind: EntityKind, id: EntityId, json: bool) -> Result<()> {
    let source: Arc<dyn SnapshotSource> = Arc::new(RestClient::new(&config.client)?);
    let (task, mut events, commands) = spawn_watch(config, kind, id, source);
    let mut renderer = Renderer::new(json);
    let mut ctrl_c = pin!(tokio::signal::ctrl_c());
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => renderer.render(&event),
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                info!(event = "watch_interrupted", kind = %kind);
                let _ = commands.send(WatchCommand::Dispose).await;
            }
        }
    }

    let view = task.await??;
    if let Some(view) = view.filter(|view| !json && view.terminal) {
        println!("final: {}", view_line(&view));
    }
    Ok(())
}

async fn list_jobs(config: &Config, limit: u32) -> Result<()> {
    let client = RestClient::new(&config.client)?;
    for job in client.list_jobs(limit).await? {
        let name = job
            .fields
            .get("job_name")
            .and_then(|value| value.as_str())
            .unwrap_or("-");
        println!("{:<38} {:<10} {name}", job.id, job.status);
    }
    Ok(())
}

async fn run_analysis(config: &Config, analyze: AnalyzeArgs) -> Result<()> {
    let client = RestClient::new(&config.client)?;
    let to = analyze.to.unwrap_or_else(Utc::now);
    let from = analyze.from.unwrap_or(to - ChronoDuration::hours(24));
    if from >= to {
        bail!("analysis range start must be before its end");
    }
    let accepted = client
        .run_analysis(&AnalysisRequest {
            job_name: analyze.name,
            model_name: analyze.model,
            time_range_from: from,
            time_range_to: to,
            device_ids: analyze.devices,
            file_path: analyze.file,
        })
        .await?;
    println!("job submitted: {} ({})", accepted.job_id, accepted.status);
    if !analyze.watch {
        return Ok(());
    }
    let id = EntityId::new(accepted.job_id)?;
    watch_entity(config, EntityKind::Job, id, analyze.json).await
}

async fn print_job_logs(config: &Config, id: EntityId) -> Result<()> {
    let client = RestClient::new(&config.client)?;
    for line in client.job_logs(&id).await? {
        match line.timestamp {
            Some(ts) => println!("{ts} {}", line.message),
            None => println!("{}", line.message),
        }
    }
    Ok(())
}

async fn list_datasets(config: &Config) -> Result<()> {
    let client = RestClient::new(&config.client)?;
    for dataset in client.log_datasets().await? {
        println!("{:<6} {}", dataset.id, dataset.name);
    }
    Ok(())
}

async fn hunt_run(config: &Config, run: HuntRunArgs) -> Result<()> {
    let rest = RestClient::new(&config.client)?;
    let mut runner = HuntRunner::new(rest.clone());

    let to = run.to.unwrap_or_else(Utc::now);
    let from = run.from.unwrap_or(to - ChronoDuration::hours(24));
    let scope = HuntScope {
        name: run.name.clone(),
        description: run.description.clone(),
        dataset_id: run.dataset,
        time_range_start: from,
        time_range_end: to,
        environment: run.environment,
    };
    let hunt_id = runner.create_scope(&scope).await?;
    println!("hunt created: {hunt_id}");

    let source: Arc<dyn SnapshotSource> = Arc::new(rest);
    let (task, mut events, commands) = spawn_watch(config, EntityKind::Hunt, hunt_id, source);
    runner.attach_watch(commands.clone());

    runner
        .save_hypothesis(Hypothesis {
            hypothesis: run.hypothesis.clone(),
            techniques: run.techniques.clone(),
            rational: run.rationale.clone(),
        })
        .await?;
    let ack = runner
        .execute(&ExecutionRequest {
            mode: run.mode,
            depth: run.depth,
            strategy: run.strategy.clone(),
        })
        .await?;
    println!("execution started: {}", ack.execution_id);

    let mut renderer = Renderer::new(run.json);
    let mut ctrl_c = pin!(tokio::signal::ctrl_c());
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let WatchEvent::View(view) = &event {
                        runner.observe(view);
                    }
                    renderer.render(&event);
                }
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if runner.workflow().phase() == ExecutionPhase::Running {
                    if let Err(err) = runner.stop().await {
                        warn!(event = "hunt_stop_failed", error = %err);
                    }
                }
                let _ = commands.send(WatchCommand::Dispose).await;
            }
        }
    }

    if let Some(view) = task.await?? {
        runner.observe(&view);
    }

    if let Some(verdict) = run.verdict {
        if runner.workflow().phase() != ExecutionPhase::Completed {
            bail!(
                "execution ended as {:?}; conclusion not saved",
                runner.workflow().phase()
            );
        }
        runner
            .conclude(Conclusion {
                verdict,
                confidence: run.confidence,
                recommendations: run.recommendations.clone(),
            })
            .await?;
        println!("conclusion saved: {verdict}");
    }

    for (stage, state) in runner.workflow().stages() {
        println!("{stage:<11} {state:?}");
    }
    Ok(())
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("TW_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Stderr plus the optional log file; stdout is reserved for view output.
struct MultiWriter {
    stderr: io::Stderr,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("tw-watch-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
