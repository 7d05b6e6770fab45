//! Bridge client.
//!
//! Connects to a sandbox's local stream socket, waits for the `ready`
//! frame, and multiplexes commands to event streams. A single background
//! reader parses incoming lines and publishes them to the active listener;
//! `send_command` owns the listener slot for the duration of its command,
//! so at most one command streams at a time per client. `write_command` is
//! fire-and-forget and used for `interrupt`.

use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};

use ash_protocol::{BridgeCommand, BridgeEvent, codec};

/// Bridge client failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge not ready within {0:?}")]
    Unready(Duration),

    #[error("a command is already in flight")]
    Busy,

    #[error("bridge connection closed")]
    Closed,

    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge frame error: {0}")]
    Codec(#[from] codec::CodecError),
}

type ListenerSlot = Arc<StdMutex<Option<mpsc::Sender<BridgeEvent>>>>;

/// Connected client for one sandbox's bridge socket.
pub struct BridgeClient {
    socket_path: PathBuf,
    writer: Mutex<OwnedWriteHalf>,
    listener: ListenerSlot,
    command_lock: Arc<Mutex<()>>,
    alive: Arc<AtomicBool>,
}

impl BridgeClient {
    /// Connect and wait for the `ready` frame, bounded by `ready_timeout`.
    ///
    /// The socket may not exist yet while the bridge starts up, so
    /// connection refusals are retried with backoff inside the same budget.
    pub async fn connect(socket_path: &Path, ready_timeout: Duration) -> Result<Self, BridgeError> {
        let deadline = tokio::time::Instant::now() + ready_timeout;

        let stream = loop {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        debug!(
                            "Giving up connecting to bridge at {:?}: {:?}",
                            socket_path, e
                        );
                        return Err(BridgeError::Unready(ready_timeout));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        };

        let (read_half, write_half) = stream.into_split();
        let listener: ListenerSlot = Arc::new(StdMutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel();

        spawn_reader(read_half, listener.clone(), alive.clone(), ready_tx);

        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(())) => {}
            _ => return Err(BridgeError::Unready(ready_timeout)),
        }

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            writer: Mutex::new(write_half),
            listener,
            command_lock: Arc::new(Mutex::new(())),
            alive,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the socket connection is still open.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Fire-and-forget write, used for `interrupt` against an in-flight
    /// query.
    pub async fn write_command(&self, cmd: &BridgeCommand) -> Result<(), BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::Closed);
        }
        let line = codec::encode(cmd)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a command and stream its events until `done` or `error`.
    ///
    /// At most one command stream per client; a second caller gets `Busy`.
    pub async fn send_command(&self, cmd: &BridgeCommand) -> Result<CommandStream, BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::Closed);
        }

        let guard = self
            .command_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| BridgeError::Busy)?;

        let (tx, rx) = mpsc::channel(256);
        {
            let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(tx);
        }

        if let Err(e) = self.write_command(cmd).await {
            let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            *slot = None;
            return Err(e);
        }

        Ok(CommandStream {
            rx,
            finished: false,
            listener: self.listener.clone(),
            _guard: guard,
        })
    }
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("socket_path", &self.socket_path)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Lazy event sequence for one in-flight command.
///
/// Ends at the first terminal event; dropping it releases the client for
/// the next command.
pub struct CommandStream {
    rx: mpsc::Receiver<BridgeEvent>,
    finished: bool,
    listener: ListenerSlot,
    _guard: OwnedMutexGuard<()>,
}

impl CommandStream {
    /// Next event, or `None` after the terminal event or a lost connection.
    pub async fn next(&mut self) -> Option<BridgeEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

fn spawn_reader(
    read_half: tokio::net::unix::OwnedReadHalf,
    listener: ListenerSlot,
    alive: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<()>,
) {
    tokio::spawn(async move {
        let mut ready_tx = Some(ready_tx);
        let reader = BufReader::new(read_half);
        let mut lines = reader.lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let event: BridgeEvent = match codec::decode(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Unparseable bridge frame: {:?}", e);
                    continue;
                }
            };

            if matches!(event, BridgeEvent::Ready) {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
                continue;
            }

            let tx = {
                let slot = listener.lock().unwrap_or_else(|e| e.into_inner());
                slot.clone()
            };
            if let Some(tx) = tx {
                // Awaiting the send applies backpressure to the socket read
                // loop when the consumer is slow.
                if tx.send(event).await.is_err() {
                    let mut slot = listener.lock().unwrap_or_else(|e| e.into_inner());
                    *slot = None;
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        // Closing the listener sender (by dropping it here) ends any
        // in-flight stream with `None`.
        let mut slot = listener.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
        debug!("Bridge reader task ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    /// Minimal fake bridge: emits `ready` on accept, echoes each `exec`
    /// command as an `exec_result` followed by `done`.
    async fn fake_bridge(listener: UnixListener) {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let ready = codec::encode(&BridgeEvent::Ready).unwrap();
                write_half.write_all(ready.as_bytes()).await.unwrap();

                let reader = BufReader::new(read_half);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let cmd: BridgeCommand = codec::decode(&line).unwrap();
                    match cmd {
                        BridgeCommand::Exec { command, .. } => {
                            let result = codec::encode(&BridgeEvent::ExecResult {
                                exit_code: 0,
                                stdout: command,
                                stderr: String::new(),
                            })
                            .unwrap();
                            let done = codec::encode(&BridgeEvent::Done {
                                session_id: "ses".to_string(),
                            })
                            .unwrap();
                            write_half.write_all(result.as_bytes()).await.unwrap();
                            write_half.write_all(done.as_bytes()).await.unwrap();
                        }
                        BridgeCommand::Shutdown => return,
                        _ => {}
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_connect_and_stream() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(fake_bridge(listener));

        let client = BridgeClient::connect(&socket, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(client.is_alive());

        let mut stream = client
            .send_command(&BridgeCommand::Exec {
                command: "echo hi".to_string(),
                timeout_ms: None,
            })
            .await
            .unwrap();

        match stream.next().await.unwrap() {
            BridgeEvent::ExecResult { stdout, .. } => assert_eq!(stdout, "echo hi"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            stream.next().await.unwrap(),
            BridgeEvent::Done { .. }
        ));
        // Terminal event ends the stream.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_second_command_is_busy_while_streaming() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(fake_bridge(listener));

        let client = BridgeClient::connect(&socket, Duration::from_secs(5))
            .await
            .unwrap();

        let stream = client
            .send_command(&BridgeCommand::Exec {
                command: "sleep".to_string(),
                timeout_ms: None,
            })
            .await
            .unwrap();

        let second = client
            .send_command(&BridgeCommand::Exec {
                command: "again".to_string(),
                timeout_ms: None,
            })
            .await;
        assert!(matches!(second, Err(BridgeError::Busy)));

        drop(stream);
        // Released after the first stream is dropped.
        let third = client
            .send_command(&BridgeCommand::Exec {
                command: "ok".to_string(),
                timeout_ms: None,
            })
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_connect_timeout_without_bridge() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("missing.sock");

        let start = tokio::time::Instant::now();
        let result = BridgeClient::connect(&socket, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(BridgeError::Unready(_))));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_ready_required_before_use() {
        // A server that accepts but never sends `ready`.
        let dir = tempdir().unwrap();
        let socket = dir.path().join("mute.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result = BridgeClient::connect(&socket, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(BridgeError::Unready(_))));
    }
}
