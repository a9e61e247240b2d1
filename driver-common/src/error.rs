use thiserror::Error;

/// Errors raised by infrastructure-side operations against a worker: allocation,
/// model loading, setting values, and dispatching execution. These are the only
/// errors that trigger a case retry (see `DriverError::ServerError` handling in
/// `case_driver::dispatcher`).
#[derive(Error, Debug, Clone)]
pub enum ServerError {
    #[error("failed to load model from artifact '{artifact_path}': {reason}")]
    LoadModelFailed {
        artifact_path: String,
        reason: String,
    },
    #[error("failed to set '{name}': {reason}")]
    SetFailed { name: String, reason: String },
    #[error("failed to dispatch execute: {reason}")]
    ExecuteDispatchFailed { reason: String },
}

/// A user-level exception raised by the model itself during `run()`. Surfaced
/// into `Case::msg` and never retried: this is a model fault, not an
/// infrastructure fault.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ModelException {
    pub message: String,
}

impl ModelException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure extracting a named output from a completed model. Attached to
/// `Case::msg` per-output; does not abort the run.
#[derive(Error, Debug, Clone)]
#[error("exception getting '{name}': {reason}")]
pub struct OutputReadError {
    pub name: String,
    pub reason: String,
}

/// Top-level error taxonomy for the case iterator driver (spec §7).
#[derive(Error, Debug)]
pub enum DriverError {
    /// The resource allocator returned nothing for a worker. The affected worker
    /// is marked not-in-use; other workers continue.
    #[error("allocation failed for worker '{worker}'")]
    AllocationFailure { worker: String },

    /// `max_servers` returned zero up front. Fatal for the run.
    #[error("no servers support the required resources: {resources:?}")]
    NoCapacityError { resources: String },

    /// Packaging the model into a transferable artifact failed before any
    /// worker could be started. Fatal for the run.
    #[error("failed to package model for transfer: {reason}")]
    ArtifactPackagingFailed { reason: String },

    /// Infrastructure-side failure on a worker.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// A user-level exception raised by the model during `run()`.
    #[error("model exception: {0}")]
    Model(#[from] ModelException),

    /// Failure extracting a named output from a completed model.
    #[error("output read error: {0}")]
    OutputRead(#[from] OutputReadError),

    /// Cooperative stop requested mid-run; surfaced from `execute()` after
    /// cleanup completes.
    #[error("run was stopped before completion")]
    StopRequested,
}

/// Errors raised by `Case` operations themselves (invariant violations, not
/// infrastructure faults).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaseError {
    #[error("invalid iotype argument: must be 'in', 'out', or absent")]
    InvalidIoType,
    #[error("'{0}' is not part of this case")]
    KeyNotFound(String),
}
