//! The case recorder interface: an append-only sink for completed cases.
//! Implemented by an external store; the driver only appends to it.

use async_trait::async_trait;

use crate::case::Case;

/// Records completed cases. Append order is the only ordering the driver
/// guarantees; a recorder that needs global ordering across concurrent
/// workers must serialize internally.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn append(&self, case: &Case);
}

/// An in-memory recorder, useful for tests and for the local/sequential
/// example wiring in `main`.
#[derive(Default)]
pub struct MemoryRecorder {
    cases: tokio::sync::Mutex<Vec<Case>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn into_cases(self) -> Vec<Case> {
        self.cases.into_inner()
    }

    /// A clone of every case recorded so far, without consuming the recorder.
    pub async fn snapshot(&self) -> Vec<Case> {
        self.cases.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.cases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn append(&self, case: &Case) {
        self.cases.lock().await.push(case.clone());
    }
}
