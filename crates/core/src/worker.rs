//! Worker identity and per-worker state ownership

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;

/// Opaque identifier of one concurrent test slot.
///
/// Used as the isolation key for every piece of per-worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

impl WorkerId {
    /// Mint an id no other worker in this process has held
    pub(crate) fn next() -> Self {
        WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// State owned by one worker.
///
/// A `Worker` is driven by exactly one task at a time, so everything it owns
/// is isolated by construction: other workers cannot reach it.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    context: Option<ExecutionContext>,
}

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        Self { id, context: None }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The worker's context, if one has been created yet
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    /// Take the context out for the duration of a test, creating it on first use.
    pub(crate) fn take_context(&mut self) -> ExecutionContext {
        let id = self.id;
        self.context
            .take()
            .unwrap_or_else(|| ExecutionContext::new(id))
    }

    /// Hand a context back after a test. It is cleared before it is stored.
    pub(crate) fn restore_context(&mut self, mut context: ExecutionContext) {
        context.clear();
        self.context = Some(context);
    }
}
