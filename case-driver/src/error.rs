use thiserror::Error;

/// Top-level error for the `case-driver` binary: configuration, the metrics
/// server, and the driver run itself.
#[derive(Error, Debug)]
pub enum DriverMainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Driver(#[from] driver_common::error::DriverError),

    #[error("failed to start metrics server")]
    Io(#[from] std::io::Error),
}
