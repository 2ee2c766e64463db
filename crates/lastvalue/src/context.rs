//! Per-query execution context.

use crate::error::{LastQueryError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Execution context owned by the caller of a single query.
///
/// Cloning shares the abort flag, so a clone can be handed to whoever may
/// cancel the query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    query_id: u64,
    aborted: Arc<AtomicBool>,
}

impl QueryContext {
    /// Creates a context with a fresh query id.
    pub fn new() -> Self {
        Self {
            query_id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the query id.
    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    /// Signals that the query should stop.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Returns true once [`QueryContext::abort`] was called on any clone.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Returns [`LastQueryError::Cancelled`] if the query was aborted.
    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(LastQueryError::Cancelled);
        }
        Ok(())
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}
