//! The external resource allocator and worker handle interfaces. Both are
//! out-of-scope collaborators: the driver only calls through these traits,
//! it does not implement an allocator or a remote worker transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ModelException, ServerError};

/// What a case's worker needs from the machine it runs on. Opaque to the
/// driver beyond being passed through to the allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub requirements: Vec<(String, String)>,
}

impl ResourceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push((key.into(), value.into()));
        self
    }
}

/// An allocated server, as handed back by `allocate`. `id` is the allocator's
/// own handle, opaque to the driver; `info` is whatever bookkeeping data the
/// allocator wants echoed back on `release`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: String,
    pub info: Value,
}

/// A server allocation paired with a live handle to its model. The allocator
/// owns whatever remote transport backs the handle (Pyro-style proxy, RPC
/// client, or an in-process stub); the driver only ever calls through
/// `WorkerHandle`.
pub struct AllocatedServer {
    pub info: ServerInfo,
    pub handle: Arc<dyn WorkerHandle>,
}

/// Provisions and releases the workers a run executes against. Implemented
/// by an external resource manager; the driver only calls through this
/// trait.
#[async_trait]
pub trait ResourceAllocator: Send + Sync {
    /// Maximum number of servers that could support `resources`, or 0 if
    /// none can. Called once up front; zero here is fatal for the run
    /// (`DriverError::NoCapacityError`).
    async fn max_servers(&self, resources: &ResourceDescriptor) -> usize;

    /// Allocate one server meeting `resources`. `None` means this attempt
    /// failed (the caller marks that worker not-in-use and continues with
    /// the rest); it is not necessarily terminal for the run.
    async fn allocate(&self, resources: &ResourceDescriptor) -> Option<AllocatedServer>;

    /// Release a previously allocated server. Best-effort: the driver logs
    /// failures but does not fail the run over them.
    async fn release(&self, server: &ServerInfo);
}

/// Outcome of `WorkerHandle::run`: a dispatch-level fault (infrastructure,
/// retried) is distinct from a model-level fault (raised by the model
/// itself, never retried).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunFailure {
    #[error(transparent)]
    Dispatch(#[from] ServerError),
    #[error(transparent)]
    Model(#[from] ModelException),
}

/// A handle to a single worker's loaded model, whether local (in-process) or
/// remote (behind the allocator). Every call that can fail against
/// infrastructure returns `ServerError`; `run` additionally distinguishes a
/// model-level fault via `ModelException`.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Load the named artifact (e.g. an exported model package) onto this
    /// worker.
    async fn load_model(&self, artifact_path: &str) -> Result<(), ServerError>;

    /// Set a named value on the loaded model.
    async fn set(&self, name: &str, value: &Value) -> Result<(), ServerError>;

    /// Read a named value off the loaded model.
    async fn get(&self, name: &str) -> Result<Value, ServerError>;

    /// Execute the model. `Ok(())` means the model ran to completion;
    /// `Err(RunFailure::Model(_))` is a model-level fault (never retried);
    /// `Err(RunFailure::Dispatch(_))` means the model never got to run at
    /// all (retried, up to the case's `max_retries`).
    async fn run(&self) -> Result<(), RunFailure>;
}
