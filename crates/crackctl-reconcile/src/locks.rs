use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crackctl_core::types::BatchSeq;
use tokio::sync::OwnedMutexGuard;

/// In-process serialization of mutating operations per batch. Different
/// batches proceed concurrently.
#[derive(Debug, Default)]
pub struct BatchLocks {
    inner: Mutex<HashMap<BatchSeq, Arc<tokio::sync::Mutex<()>>>>,
}

impl BatchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, seq: BatchSeq) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(seq).or_default().clone()
        };
        lock.lock_owned().await
    }
}
