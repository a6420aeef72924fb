//! Guest-agent client. Best-effort freeze/thaw over a second local
//! stream socket; failures never abort the run.

use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::warn;

pub struct GuestAgentClient {
    socket_path: PathBuf,
}

impl GuestAgentClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    async fn execute(&self, command: &str) -> Result<(), String> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| format!("connect {}: {e}", self.socket_path.display()))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = json!({ "execute": command });
        let line = serde_json::to_string(&request).map_err(|e| e.to_string())?;
        write_half.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
        write_half.write_all(b"\n").await.map_err(|e| e.to_string())?;

        let mut response = String::new();
        reader.read_line(&mut response).await.map_err(|e| e.to_string())?;
        let value: serde_json::Value = serde_json::from_str(&response).map_err(|e| e.to_string())?;
        if let Some(err) = value.get("error") {
            return Err(err.to_string());
        }
        Ok(())
    }

    /// `guest-fsfreeze-freeze`. Failure is a warning, not an abort.
    pub async fn freeze(&self) -> bool {
        match self.execute("guest-fsfreeze-freeze").await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "guest filesystem freeze failed, continuing without it");
                false
            }
        }
    }

    /// `guest-fsfreeze-thaw`. Always attempted in teardown regardless
    /// of whether freeze succeeded; failure only warns.
    pub async fn thaw(&self) {
        if let Err(e) = self.execute("guest-fsfreeze-thaw").await {
            warn!(error = %e, "guest filesystem thaw failed");
        }
    }
}
