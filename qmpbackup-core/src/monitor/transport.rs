//! Line-delimited JSON transport over the hypervisor's monitor socket.
//!
//! One `tokio::net::UnixStream` is split into a read half, driven by a
//! single demultiplexer task, and a write half serialized behind a
//! mutex so multiple logical callers can have commands in flight
//! concurrently, distinguished by `id`.

use crate::error::{CommandError, CoreError};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, trace, warn};

/// An asynchronous event delivered outside the request/response
/// channel (`JOB_STATUS_CHANGE`, `BLOCK_JOB_COMPLETED`, ...).
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub event: String,
    pub data: Value,
    pub timestamp: Value,
}

type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Value, CommandError>>>;

/// Client for one monitor connection. Cheaply `Clone`-able; clones
/// share the same connection, writer lock, and event channel.
#[derive(Clone)]
pub struct MonitorClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<MonitorEvent>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    id: u64,
}

impl MonitorClient {
    /// Connect to `socket_path`, read the greeting, negotiate
    /// capabilities, and start the demultiplexer task.
    pub async fn connect(socket_path: &Path) -> Result<Self, CoreError> {
        debug!(path = %socket_path.display(), "connecting to monitor socket");

        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| CoreError::Transport(format!("connect {}: {e}", socket_path.display())))?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut greeting = String::new();
        let n = reader
            .read_line(&mut greeting)
            .await
            .map_err(|e| CoreError::Transport(format!("reading greeting: {e}")))?;
        if n == 0 {
            return Err(CoreError::Transport(
                "monitor closed connection before sending a greeting".to_string(),
            ));
        }
        let greeting_json: Value = serde_json::from_str(&greeting)
            .map_err(|e| CoreError::Transport(format!("malformed greeting: {e}")))?;
        if greeting_json.get("QMP").is_none() {
            return Err(CoreError::Transport(
                "greeting missing expected capability banner".to_string(),
            ));
        }

        let (events_tx, _rx) = broadcast::channel(256);
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        {
            let pending = Arc::clone(&pending);
            let events_tx = events_tx.clone();
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                demultiplex(reader, pending, events_tx, closed).await;
            });
        }

        let client = MonitorClient {
            writer: Arc::new(Mutex::new(write_half)),
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
            events: events_tx,
            closed,
        };

        client.send_raw("qmp_capabilities", None).await?;
        Ok(client)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Send `execute` with `arguments` and await the matching `return`
    /// (or propagate the matching `error`).
    pub async fn send_raw(
        &self,
        execute: &str,
        arguments: Option<Value>,
    ) -> Result<Value, CoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Transport("monitor client closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = CommandRequest {
            execute,
            arguments,
            id,
        };
        let line = serde_json::to_string(&request)?;
        trace!(%line, "-> monitor");

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(CoreError::Transport(format!("write failed: {e}")));
            }
            if let Err(e) = writer.write_all(b"\n").await {
                self.pending.lock().await.remove(&id);
                return Err(CoreError::Transport(format!("write failed: {e}")));
            }
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cmd_err)) => Err(CoreError::Command(cmd_err)),
            Err(_) => Err(CoreError::Transport(
                "monitor connection closed while awaiting reply".to_string(),
            )),
        }
    }

    /// Cancel all outstanding waiters with a transport-closed failure
    /// and mark the client unusable.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(CommandError {
                class: "GenericError".to_string(),
                desc: "monitor client closed".to_string(),
            }));
        }
    }
}

async fn demultiplex(
    mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    pending: Arc<Mutex<PendingMap>>,
    events_tx: broadcast::Sender<MonitorEvent>,
    closed: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        let n = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "monitor read failed");
                break;
            }
        };
        if n == 0 {
            debug!("monitor closed connection");
            break;
        }
        trace!(%line, "<- monitor");

        let value: Value = match serde_json::from_str(line.trim_end()) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, raw = %line, "malformed monitor message, ignoring");
                continue;
            }
        };

        if let Some(event_name) = value.get("event").and_then(|v| v.as_str()) {
            let ev = MonitorEvent {
                event: event_name.to_string(),
                data: value.get("data").cloned().unwrap_or(Value::Null),
                timestamp: value.get("timestamp").cloned().unwrap_or(Value::Null),
            };
            let _ = events_tx.send(ev);
            continue;
        }

        if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
            let mut pending = pending.lock().await;
            if let Some(tx) = pending.remove(&id) {
                if let Some(err) = value.get("error") {
                    let class = err
                        .get("class")
                        .and_then(|v| v.as_str())
                        .unwrap_or("GenericError")
                        .to_string();
                    let desc = err
                        .get("desc")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error")
                        .to_string();
                    let _ = tx.send(Err(CommandError { class, desc }));
                } else {
                    let ret = value.get("return").cloned().unwrap_or(Value::Null);
                    let _ = tx.send(Ok(ret));
                }
            }
            continue;
        }

        debug!(%line, "monitor message matched neither event nor id, ignoring");
    }

    closed.store(true, Ordering::SeqCst);
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CommandError {
            class: "GenericError".to_string(),
            desc: "monitor transport closed".to_string(),
        }));
    }
}
