use anyhow::Context;
use clap::Parser;
use crossterm::{
    execute,
    event::EventStream,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use stalk_client::CollectorClient;
use stalk_control::{default_tracker_program, ui, Action, App, AppEvent, ExistenceSync, Launcher};
use stalk_core::config::StalkConfig;
use stalk_core::prefs::PrefStore;
use stalk_storage::SqlitePrefStore;
use std::{
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "stalk-control")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Track file handed to the tracker daemon as its position source.
    #[arg(long)]
    track: Option<PathBuf>,
    /// Tracker binary; defaults to the one installed next to this executable.
    #[arg(long)]
    tracker_bin: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = StalkConfig::load(args.config.as_deref()).context("loading configuration")?;
    init_logging(&config.log_dir(), args.debug);

    let store: Arc<dyn PrefStore> = Arc::new(
        SqlitePrefStore::open(config.store_path())
            .with_context(|| format!("opening store {}", config.store_path().display()))?,
    );
    let collector = Arc::new(CollectorClient::from_config(&config).context("building client")?);

    let track = args
        .track
        .clone()
        .unwrap_or_else(|| config.state_dir.join("track.txt"));
    let launcher = Launcher::new(
        args.tracker_bin
            .clone()
            .unwrap_or_else(default_tracker_program),
        config.control_socket_path(),
        store.clone(),
    )
    .with_config_path(args.config.clone())
    .with_source(track.display().to_string());

    let (sync, mut control_rx) = ExistenceSync::new(store.clone(), collector);
    let mut app = App::new(sync, store, launcher);
    app.load();
    info!(
        event = "control_start",
        identity = %app.identity(),
        interval = %app.interval,
        running = app.running
    );

    let (app_tx, mut app_rx) = mpsc::channel(8);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();
    let mut refresh_ticker = tokio::time::interval(REFRESH_INTERVAL);

    let result: anyhow::Result<()> = async {
        loop {
            terminal.draw(|frame| ui::render(frame, &app))?;
            tokio::select! {
                _ = refresh_ticker.tick() => app.refresh(),
                Some(event) = control_rx.recv() => app.apply_control_event(event),
                Some(event) = app_rx.recv() => app.apply_app_event(event),
                maybe_event = events.next() => {
                    let Some(Ok(event)) = maybe_event else { continue };
                    match app.handle_input(event) {
                        Some(Action::Quit) => break,
                        Some(action) => dispatch(action, app.launcher().clone(), app_tx.clone()),
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    info!(event = "control_exit");
    result
}

fn dispatch(action: Action, launcher: Launcher, tx: mpsc::Sender<AppEvent>) {
    tokio::spawn(async move {
        let event = match action {
            Action::StartTracking => {
                AppEvent::Started(launcher.start().await.map_err(|err| err.to_string()))
            }
            Action::StopTracking => {
                AppEvent::Stopped(launcher.stop().await.map_err(|err| err.to_string()))
            }
            Action::Quit => return,
        };
        let _ = tx.send(event).await;
    });
}

fn init_logging(log_dir: &Path, debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("STALK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout_enabled = matches!(
        std::env::var("STALK_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    }

    let file = std::fs::create_dir_all(log_dir).ok().and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("stalk-control.log"))
            .ok()
    });
    match file {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::sink)
                .try_init();
        }
    }
}
