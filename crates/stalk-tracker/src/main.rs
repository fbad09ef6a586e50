use anyhow::{bail, Context};
use clap::Parser;
use stalk_client::CollectorClient;
use stalk_core::config::StalkConfig;
use stalk_core::prefs::PrefStore;
use stalk_storage::SqlitePrefStore;
use stalk_tracker::{
    control, parse_batch, ChannelSource, ControlConfig, ControlContext, PositionBatch,
    PositionSource, ReplaySource, StopReason, Tracker,
};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, watch},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const STDIN_BATCH_CAPACITY: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "stalk-tracker")]
struct Args {
    /// Config file; defaults to $STALK_CONFIG_PATH or the XDG location.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Replay track file, or `-` to read `lat,lon;lat,lon` batches from stdin.
    #[arg(long, default_value = "-")]
    source: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!(event = "tracker_exit_error", error = %format!("{err:#}"));
        eprintln!("stalk-tracker: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = StalkConfig::load(args.config.as_deref()).context("loading configuration")?;
    let _log_file = init_logging(&config.log_dir(), args.debug);

    let socket_path = config.control_socket_path();
    if let Some(status) = control::probe(&socket_path, PROBE_TIMEOUT).await {
        bail!(
            "a tracker is already {} for {:?} on {}",
            status.phase,
            status.identity,
            socket_path.display()
        );
    }

    let store: Arc<dyn PrefStore> = Arc::new(
        SqlitePrefStore::open(config.store_path())
            .with_context(|| format!("opening store {}", config.store_path().display()))?,
    );
    let collector = Arc::new(CollectorClient::from_config(&config).context("building client")?);
    let source = build_source(&args.source)?;

    info!(
        event = "tracker_daemon_start",
        server_url = %config.server_url,
        state_dir = %config.state_dir.display(),
        source = %args.source
    );

    let tracker = Tracker::new(store.clone(), collector);
    let mut handle = tracker
        .start(source.as_ref())
        .context("starting tracking session")?;

    let (stop_tx, mut stop_rx) = mpsc::channel(1);
    let context = Arc::new(ControlContext {
        phase: handle.phase_receiver(),
        interval: handle.interval(),
        store,
        stop: stop_tx,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(control::serve(
        ControlConfig::new(&socket_path),
        context,
        shutdown_rx,
    ));

    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(event = "tracker_daemon_signal");
            None
        }
        _ = stop_rx.recv() => {
            info!(event = "tracker_daemon_stop_requested");
            None
        }
        reason = handle.wait() => Some(reason),
    };
    let reason = match reason {
        Some(reason) => reason,
        None => handle.stop().await,
    };

    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(event = "tracker_control_error", error = %err),
        Err(err) => warn!(event = "tracker_control_join_error", error = %err),
    }

    info!(event = "tracker_daemon_exit", reason = ?reason);
    if reason == StopReason::Crashed {
        bail!("tracking loop crashed");
    }
    Ok(())
}

fn build_source(source: &str) -> anyhow::Result<Box<dyn PositionSource>> {
    if source.trim() == "-" {
        let (source, tx) = ChannelSource::new(STDIN_BATCH_CAPACITY);
        tokio::spawn(feed_stdin(tx));
        return Ok(Box::new(source));
    }
    let path = Path::new(source);
    if source.trim().is_empty() {
        bail!("--source must name a track file or `-`");
    }
    Ok(Box::new(ReplaySource::new(path)))
}

/// Forwards stdin lines as batches; EOF drops the sender, which ends the subscription.
async fn feed_stdin(tx: mpsc::Sender<PositionBatch>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(event = "tracker_stdin_error", error = %err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_batch(&line) {
            Ok(batch) => {
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(event = "tracker_stdin_parse_error", error = %err),
        }
    }
    info!(event = "tracker_stdin_closed");
}

type LogFile = Arc<Mutex<std::fs::File>>;

/// Installs the global subscriber; the returned handle keeps the log file open.
fn init_logging(log_dir: &Path, debug: bool) -> Option<LogFile> {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("STALK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = match open_log_file(log_dir) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let writer_file = file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        stdout: io::stdout(),
        file: writer_file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    file
}

/// Copies every log line to stdout and, when open, the daemon's log file.
struct TeeWriter {
    stdout: io::Stdout,
    file: Option<LogFile>,
}

impl TeeWriter {
    fn with_file(&self, op: impl FnOnce(&mut std::fs::File) -> io::Result<()>) {
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = op(&mut file);
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}

fn open_log_file(dir: &Path) -> io::Result<LogFile> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("stalk-tracker.log"))?;
    Ok(Arc::new(Mutex::new(file)))
}
