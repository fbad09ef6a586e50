//! Position sources: lazy, non-restartable sequences of position batches.

use stalk_core::{Position, PowerPriority, SamplingInterval};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type PositionBatch = Vec<Position>;

const REPLAY_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRequest {
    pub priority: PowerPriority,
    pub interval: Duration,
}

impl LocationRequest {
    pub fn for_interval(interval: SamplingInterval) -> Self {
        Self {
            priority: interval.priority(),
            interval: interval.duration(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("position source unavailable: {0}")]
    Unavailable(String),
    #[error("position source was already subscribed")]
    AlreadySubscribed,
}

pub trait PositionSource: Send + Sync {
    /// Registers for updates. Batches flow until the returned subscription is dropped.
    fn subscribe(&self, request: &LocationRequest) -> Result<Subscription, SourceError>;
}

/// Live registration with a position source. Dropping it unregisters.
pub struct Subscription {
    batches: mpsc::Receiver<PositionBatch>,
    producer: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(batches: mpsc::Receiver<PositionBatch>) -> Self {
        Self {
            batches,
            producer: None,
        }
    }

    pub fn with_producer(batches: mpsc::Receiver<PositionBatch>, producer: JoinHandle<()>) -> Self {
        Self {
            batches,
            producer: Some(producer),
        }
    }

    /// `None` means the source went away and no further batches will arrive.
    pub async fn next_batch(&mut self) -> Option<PositionBatch> {
        self.batches.recv().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.batches.close();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Replays a fixed track from a file, one position per sampling tick, forever.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    path: PathBuf,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<Position>, SourceError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|err| {
            SourceError::Unavailable(format!("{}: {err}", self.path.display()))
        })?;
        let positions = parse_track(&contents).map_err(SourceError::Unavailable)?;
        if positions.is_empty() {
            return Err(SourceError::Unavailable(format!(
                "{}: no positions",
                self.path.display()
            )));
        }
        Ok(positions)
    }
}

impl PositionSource for ReplaySource {
    fn subscribe(&self, request: &LocationRequest) -> Result<Subscription, SourceError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        let positions = self.load()?;
        let (tx, rx) = mpsc::channel(REPLAY_QUEUE_CAPACITY);
        let interval = request.interval;
        let producer = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            for position in positions.iter().cycle() {
                ticker.tick().await;
                if tx.send(vec![*position]).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::with_producer(rx, producer))
    }
}

/// Batches pushed by an external feeder. Can be subscribed exactly once.
#[derive(Debug)]
pub struct ChannelSource {
    batches: Mutex<Option<mpsc::Receiver<PositionBatch>>>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<PositionBatch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                batches: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl PositionSource for ChannelSource {
    fn subscribe(&self, _request: &LocationRequest) -> Result<Subscription, SourceError> {
        let mut slot = self
            .batches
            .lock()
            .map_err(|_| SourceError::Unavailable("channel source lock poisoned".to_string()))?;
        slot.take()
            .map(Subscription::new)
            .ok_or(SourceError::AlreadySubscribed)
    }
}

/// Parses a replay track: one `lat,lon` per line, `#` comments and blank lines ignored.
pub fn parse_track(contents: &str) -> Result<Vec<Position>, String> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(idx, line)| {
            line.parse::<Position>()
                .map_err(|err| format!("line {}: {err}", idx + 1))
        })
        .collect()
}

/// Parses one feeder line into a batch: positions separated by `;`.
pub fn parse_batch(line: &str) -> Result<PositionBatch, String> {
    line.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse::<Position>)
        .collect()
}
