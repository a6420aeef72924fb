//! Cancellation token bridging OS signals to the orchestrator, without
//! process-global mutable state.
//!
//! A `watch` channel for waiters plus an `AtomicBool` for a cheap
//! synchronous check, scoped to one run instead of the whole process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    signalled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            signalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the token cancelled. Idempotent.
    pub fn cancel(&self) {
        if !self.signalled.swap(true, Ordering::SeqCst) {
            info!("cancellation requested");
            let _ = self.tx.send(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signalled.load(Ordering::SeqCst)
    }

    /// Resolve once `cancel()` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Install SIGINT/SIGTERM handlers that cancel this token. Spawns
    /// a background task; drop the returned handle to stop watching
    /// (the task exits on its own once the token is cancelled).
    #[cfg(unix)]
    pub fn spawn_signal_watcher(&self) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
                _ = token.cancelled() => return,
            }
            token.cancel();
        })
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_resolves_waiters() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
            })
        };
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
