// ============================
// crates/backend-lib/src/heartbeat.rs
// ============================
//! Per-session liveness timer.
//!
//! The session pings the client and arms the timer; each answering pong
//! re-arms it. One timer task exists at a time, so a re-arm can never
//! produce a stale expiry from an earlier window.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Heartbeat {
    timeout: Duration,
    expired_tx: mpsc::Sender<()>,
    timer: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Create an unarmed heartbeat and the channel its expiry fires on.
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<()>) {
        let (expired_tx, expired_rx) = mpsc::channel(1);
        (
            Self {
                timeout,
                expired_tx,
                timer: None,
            },
            expired_rx,
        )
    }

    /// Start (or restart) the expiry window.
    pub fn arm(&mut self) {
        self.cancel();
        let timeout = self.timeout;
        let expired_tx = self.expired_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // receiver gone means the session already ended
            let _ = expired_tx.send(()).await;
        }));
    }

    /// Stop the timer without firing.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel();
    }
}
