//! Process-wide cancellation
//!
//! One root signal per provider. Every long-running task holds a
//! [`ShutdownToken`] and selects on [`ShutdownToken::cancelled`] so that
//! cancelling the root makes the run loop, background samplers and blocked
//! callers return promptly instead of hanging.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ProvdError, Result};

/// Owner of the root cancellation signal
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Hand out a token observing this controller
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Cancel every token. Idempotent.
    pub fn cancel(&self) {
        if self.tx.send_replace(true) {
            warn!("Shutdown already requested, ignoring duplicate signal");
            return;
        }
        info!("Shutdown requested");
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable view of the root cancellation signal
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested (or the controller is gone).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An Err means the controller was dropped, which counts as cancellation
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `fut` unless cancellation wins the race.
    pub async fn run_until_cancelled<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ProvdError::Cancelled),
            out = fut => Ok(out),
        }
    }
}
