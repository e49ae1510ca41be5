//! Cancellation handles keyed by run
//!
//! Each ingestion run registers a [`CancellationToken`] under an opaque key.
//! Long-running steps poll the token at their checkpoints; cancelling never
//! interrupts an I/O call that is already in flight.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{IngestError, Result};

#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `key`, created on first use.
    ///
    /// A token that was already cancelled is replaced, so a new run under
    /// the same key starts uncancelled.
    pub fn register(&self, key: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock();
        match tokens.get(key) {
            Some(token) if !token.is_cancelled() => token.clone(),
            _ => {
                let token = CancellationToken::new();
                tokens.insert(key.to_string(), token.clone());
                token
            }
        }
    }

    /// Cancel the run registered under `key`. Returns false if none is.
    pub fn cancel(&self, key: &str) -> bool {
        match self.tokens.lock().get(key) {
            Some(token) => {
                debug!(key, "Cancelling ingestion run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, key: &str) -> bool {
        self.tokens
            .lock()
            .get(key)
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn release(&self, key: &str) {
        self.tokens.lock().remove(key);
    }

    /// Cancel and forget every registered token.
    pub fn cancel_all(&self) {
        for (_, token) in self.tokens.lock().drain() {
            token.cancel();
        }
    }
}

/// Checkpoint: fail with [`IngestError::Cancelled`] once `token` is cancelled.
pub fn checkpoint(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(IngestError::Cancelled)
    } else {
        Ok(())
    }
}
