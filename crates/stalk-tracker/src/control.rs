//! Control socket for a running tracker daemon.
//!
//! One NDJSON request per line, one reply per request. The control surface lives in another
//! process, so `stop` travels here instead of through shared memory.

use stalk_core::prefs::PrefStore;
use stalk_core::tracker_ipc::{
    decode_frame, encode_frame, FrameError, TrackerReply, TrackerRequest, TrackerStatus,
    DEFAULT_MAX_FRAME_BYTES,
};
use stalk_core::{SamplingInterval, TrackerPhase};
use std::{io, path::PathBuf, sync::Arc, time::Duration};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt, path::Path};
use thiserror::Error;
#[cfg(unix)]
use tokio::net::{unix::OwnedReadHalf, UnixListener, UnixStream};
#[cfg(unix)]
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
#[cfg(unix)]
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct ControlConfig {
    pub socket_path: PathBuf,
    pub write_timeout: Duration,
}

impl ControlConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            write_timeout: Duration::from_secs(1),
        }
    }
}

/// What the socket needs to answer requests about the active session.
pub struct ControlContext {
    pub phase: watch::Receiver<TrackerPhase>,
    pub interval: SamplingInterval,
    pub store: Arc<dyn PrefStore>,
    pub stop: mpsc::Sender<()>,
}

impl ControlContext {
    fn status(&self) -> TrackerStatus {
        let identity = self.store.identity().unwrap_or_default();
        TrackerStatus {
            phase: *self.phase.borrow(),
            identity,
            interval: self.interval,
        }
    }

    fn answer(&self, request: TrackerRequest) -> TrackerReply {
        match request {
            TrackerRequest::Status => TrackerReply::Status(self.status()),
            TrackerRequest::Stop => match self.stop.try_send(()) {
                // A full channel means a stop is already queued.
                Ok(()) | Err(mpsc::error::TrySendError::Full(())) => TrackerReply::Stopping,
                Err(mpsc::error::TrySendError::Closed(())) => TrackerReply::Error {
                    message: "tracker is no longer accepting commands".to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket unavailable: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("tracker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("tracker closed the connection without replying")]
    Closed,
    #[error("control sockets are not supported on this platform")]
    Unsupported,
}

#[cfg(not(unix))]
pub async fn serve(
    _config: ControlConfig,
    _context: Arc<ControlContext>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

#[cfg(unix)]
pub async fn serve(
    config: ControlConfig,
    context: Arc<ControlContext>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    if config.socket_path.exists() {
        let _ = fs::remove_file(&config.socket_path);
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));

    info!(
        event = "tracker_control_start",
        socket = %config.socket_path.display()
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let context = context.clone();
                        let write_timeout = config.write_timeout;
                        tokio::spawn(async move {
                            handle_connection(stream, context, write_timeout).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "tracker_control_accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&config.socket_path);
    info!(event = "tracker_control_stop");
    Ok(())
}

#[cfg(unix)]
async fn handle_connection(stream: UnixStream, context: Arc<ControlContext>, write_timeout: Duration) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_next_request(&mut reader).await {
        debug!(event = "tracker_control_request", request = ?request);
        let reply = context.answer(request);
        let frame = match encode_frame(&reply, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "tracker_control_encode_error", error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "tracker_control_write_error", error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "tracker_control_write_timeout");
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn read_next_request(reader: &mut BufReader<OwnedReadHalf>) -> Option<TrackerRequest> {
    loop {
        let mut line = Vec::new();
        let n = match read_frame_line(reader, &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "tracker_control_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<TrackerRequest>(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(request) => return Some(request),
            Err(err) => {
                warn!(event = "tracker_control_decode_error", error = %err);
                continue;
            }
        }
    }
}

/// A full frame plus its `\r\n` terminator.
#[cfg(unix)]
const MAX_LINE_BYTES: u64 = DEFAULT_MAX_FRAME_BYTES as u64 + 2;

/// Reads one newline-terminated line without buffering more than a full frame. `Ok(0)` is EOF.
#[cfg(unix)]
async fn read_frame_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES)
        .read_until(b'\n', line)
        .await?;
    if n as u64 == MAX_LINE_BYTES && !line.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            FrameError::OversizedFrame {
                size: line.len(),
                max: DEFAULT_MAX_FRAME_BYTES,
            },
        ));
    }
    Ok(n)
}

/// Sends one request and waits for its reply.
#[cfg(unix)]
pub async fn send_request(
    socket_path: &Path,
    request: &TrackerRequest,
    timeout: Duration,
) -> Result<TrackerReply, ControlError> {
    let exchange = async {
        let stream = UnixStream::connect(socket_path).await?;
        let (reader, mut writer) = stream.into_split();
        let frame = encode_frame(request, DEFAULT_MAX_FRAME_BYTES)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        if read_frame_line(&mut reader, &mut line).await? == 0 {
            return Err(ControlError::Closed);
        }
        Ok(decode_frame::<TrackerReply>(&line, DEFAULT_MAX_FRAME_BYTES)?)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ControlError::Timeout(timeout))?
}

#[cfg(not(unix))]
pub async fn send_request(
    _socket_path: &std::path::Path,
    _request: &TrackerRequest,
    _timeout: Duration,
) -> Result<TrackerReply, ControlError> {
    Err(ControlError::Unsupported)
}

/// Status of the tracker listening on `socket_path`, or `None` when nothing answers.
pub async fn probe(socket_path: &std::path::Path, timeout: Duration) -> Option<TrackerStatus> {
    match send_request(socket_path, &TrackerRequest::Status, timeout).await {
        Ok(TrackerReply::Status(status)) => Some(status),
        _ => None,
    }
}
