use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;

use super::EngineError;

/// One transaction attempt. Every lock taken inside it shares one deadline,
/// so the whole attempt is bounded no matter how many rows it touches.
#[derive(Debug, Clone, Copy)]
pub struct TxScope {
    deadline: Instant,
}

impl TxScope {
    pub fn begin(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    /// Exclusive row lock, or `Timeout` once the deadline passes.
    pub async fn write<T>(
        &self,
        table: &'static str,
        row: Arc<RwLock<T>>,
    ) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
        let started = Instant::now();
        let result = tokio::time::timeout_at(self.deadline, row.write_owned()).await;
        record_wait(table, started);
        result.map_err(|_| {
            tracing::debug!(table, "write lock wait hit transaction deadline");
            EngineError::Timeout
        })
    }

    pub async fn read<T>(
        &self,
        table: &'static str,
        row: Arc<RwLock<T>>,
    ) -> Result<OwnedRwLockReadGuard<T>, EngineError> {
        let started = Instant::now();
        let result = tokio::time::timeout_at(self.deadline, row.read_owned()).await;
        record_wait(table, started);
        result.map_err(|_| EngineError::Timeout)
    }
}

fn record_wait(table: &'static str, started: Instant) {
    metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS, "table" => table)
        .record(started.elapsed().as_secs_f64());
}
