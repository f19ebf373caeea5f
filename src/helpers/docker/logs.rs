//! Live container log relay.
//!
//! Spawns `docker logs --follow` and forwards its output line by line over
//! a channel. The stream keeps delivering until the tail process exits or
//! the caller stops it; a consumer that needs to survive an engine restart
//! simply opens a new stream.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use super::DockerClient;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    /// Number of trailing lines replayed before following.
    pub tail: u32,
    pub timestamps: bool,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            tail: 100,
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A line of container output (stdout or stderr stream).
    Line(String),
    /// The relay itself failed, e.g. the tail process could not be read.
    Error(String),
}

/// Cancellation handle for a running log stream. Dropping it without
/// calling [`StopHandle::stop`] leaves the stream running until the tail
/// process exits.
pub struct StopHandle {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl StopHandle {
    /// Kill the underlying tail process. The stream's channel closes once
    /// the process is gone.
    pub fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running log relay: consume events with [`LogStream::recv`] or convert
/// into a `Stream` for server-sent-event relays. The channel closing means
/// the tail process exited or was stopped.
pub struct LogStream {
    receiver: mpsc::Receiver<LogEvent>,
    stop: Option<StopHandle>,
}

impl LogStream {
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.receiver.recv().await
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.stop.take() {
            handle.stop();
        }
    }

    /// Split into the event stream and its cancellation handle, for relays
    /// where the consumer and the canceller live in different tasks.
    pub fn into_parts(mut self) -> (ReceiverStream<LogEvent>, StopHandle) {
        let handle = self.stop.take().unwrap_or(StopHandle { stop_tx: None });
        (ReceiverStream::new(self.receiver), handle)
    }
}

impl DockerClient {
    pub fn stream_logs(
        &self,
        container_id: &str,
        options: LogStreamOptions,
    ) -> Result<LogStream, String> {
        let mut args: Vec<String> = vec![
            "logs".into(),
            "--follow".into(),
            "--tail".into(),
            options.tail.to_string(),
        ];
        if options.timestamps {
            args.push("--timestamps".into());
        }
        args.push(container_id.to_string());

        let mut child = tokio::process::Command::new(self.program())
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| format!("failed to spawn {} logs: {}", self.program(), err))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "log process has no stdout".to_string())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "log process has no stderr".to_string())?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        // the engine multiplexes container stdout/stderr onto ours; both
        // carry application output
        let stdout_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if stdout_tx.send(LogEvent::Line(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = stdout_tx.send(LogEvent::Error(err.to_string())).await;
                        break;
                    }
                }
            }
        });

        let stderr_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(LogEvent::Line(line)).await.is_err() {
                    break;
                }
            }
        });

        // supervisor owns the child: stop (or every consumer going away)
        // drops it, which kills the tail; natural exit falls through.
        // Dropping the last sender closes the channel either way.
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {}
                _ = tx.closed() => {}
                status = child.wait() => {
                    let _ = status;
                }
            }
            drop(child);
            drop(tx);
        });

        Ok(LogStream {
            receiver: rx,
            stop: Some(StopHandle {
                stop_tx: Some(stop_tx),
            }),
        })
    }
}
