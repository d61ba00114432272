//! Output capture for supervised processes.
//!
//! One [`StreamPump`] per stream drains lines into a [`LineSink`]. On stop the
//! pump makes exactly one more drain pass and then exits, so joining it
//! guarantees every buffered line reached the sink before the sink is torn
//! down.

use crate::error::{Result, SupervisorError};
use crate::output::{OutputLine, OutputStream};
use crate::process::Activity;
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Append-only destination for captured lines.
pub trait LineSink: Send + Sync {
    fn write_line(&self, line: &OutputLine);

    fn flush(&self) {}
}

/// Log rotation policy for per-tag log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Never,
    Hourly,
    #[default]
    Daily,
}

impl LogRotation {
    fn rotation(self) -> Rotation {
        match self {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
        }
    }
}

/// Writes one stream of one tag to `<log_dir>/<tag>.<out|err>.log`,
/// optionally echoing to the supervisor's own stdout or stderr.
pub struct LogFileSink {
    writer: Mutex<RollingFileAppender>,
    stream: OutputStream,
    echo: bool,
}

impl LogFileSink {
    pub fn open(
        log_dir: &Path,
        tag: &str,
        stream: OutputStream,
        rotation: LogRotation,
        echo: bool,
    ) -> Result<Self> {
        let sink_err = |source| SupervisorError::Sink {
            tag: tag.to_string(),
            source,
        };
        std::fs::create_dir_all(log_dir).map_err(sink_err)?;

        let file_name = format!("{}.{}.log", tag, stream.log_suffix());
        let writer = RollingFileAppender::builder()
            .rotation(rotation.rotation())
            .filename_prefix(file_name)
            .build(log_dir)
            .map_err(|e| sink_err(std::io::Error::other(e)))?;

        Ok(Self {
            writer: Mutex::new(writer),
            stream,
            echo,
        })
    }
}

impl LineSink for LogFileSink {
    fn write_line(&self, line: &OutputLine) {
        if let Err(e) = writeln!(self.writer.lock(), "{}", line.content) {
            warn!(stream = %self.stream, error = %e, "Failed to write log line");
        }
        if self.echo {
            match self.stream {
                OutputStream::Stdout => println!("{}", line.content),
                OutputStream::Stderr => eprintln!("{}", line.content),
            }
        }
    }

    fn flush(&self) {
        let _ = self.writer.lock().flush();
    }
}

/// Keeps lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<OutputLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<OutputLine> {
        self.lines.lock().clone()
    }

    pub fn contents(&self) -> Vec<String> {
        self.lines.lock().iter().map(|l| l.content.clone()).collect()
    }
}

impl LineSink for MemorySink {
    fn write_line(&self, line: &OutputLine) {
        self.lines.lock().push(line.clone());
    }
}

/// Background task draining one stream.
pub struct StreamPump {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<u32>,
}

impl StreamPump {
    /// Start draining `reader`. Every line refreshes `activity` when given.
    pub fn spawn<R>(
        reader: R,
        stream: OutputStream,
        sink: Arc<dyn LineSink>,
        activity: Option<Activity>,
        drain_window: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(pump(reader, stream, sink, activity, drain_window, stop_rx));
        Self { stop_tx, handle }
    }

    /// Request a stop without waiting.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop and wait until the task exited. Returns the number of lines
    /// written.
    pub async fn join(self) -> u32 {
        self.stop();
        match self.handle.await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "Output pump task failed");
                0
            }
        }
    }

    /// Wait for the reader to reach end of stream, without requesting a stop.
    pub async fn finish(self) -> u32 {
        let StreamPump { stop_tx, handle } = self;
        let count = handle.await.unwrap_or(0);
        drop(stop_tx);
        count
    }
}

async fn pump<R>(
    reader: R,
    stream: OutputStream,
    sink: Arc<dyn LineSink>,
    activity: Option<Activity>,
    drain_window: Duration,
    mut stop_rx: watch::Receiver<bool>,
) -> u32
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_number = 0u32;

    let mut emit = |content: String| {
        line_number += 1;
        if let Some(activity) = &activity {
            activity.touch();
        }
        sink.write_line(&OutputLine::new(stream, content, line_number));
    };

    loop {
        tokio::select! {
            next = lines.next_line() => match next {
                Ok(Some(content)) => emit(content),
                Ok(None) => break,
                Err(e) => {
                    error!(%stream, error = %e, "Output capture failed");
                    break;
                }
            },
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    // One final pass for whatever is already buffered, bounded
                    // by a single deadline even if the writer never goes quiet.
                    let deadline = Instant::now() + drain_window;
                    while let Ok(Ok(Some(content))) =
                        tokio::time::timeout_at(deadline, lines.next_line()).await
                    {
                        emit(content);
                    }
                    break;
                }
            }
        }
    }

    sink.flush();
    debug!(%stream, lines = line_number, "Output capture finished");
    line_number
}
