//! Drives a small built-in demo model end to end: generate a handful of
//! cases, run them sequentially through a local model, record the results.
//! Wire in a real `ResourceAllocator`/`WorkerHandle`/`Recorder`/
//! `CaseIterator` to point this at an actual model instead.

use std::future::ready;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use serde_json::{json, Value};
use tracing::info;

use driver_common::allocator::{
    AllocatedServer, ResourceAllocator, ResourceDescriptor, ServerInfo, WorkerHandle,
};
use driver_common::case::Case;
use driver_common::error::ServerError;
use driver_common::health::HealthRegistry;
use driver_common::iterator::VecCaseIterator;
use driver_common::metrics::{serve, setup_metrics_router};
use driver_common::recorder::{MemoryRecorder, Recorder};

use case_driver::config::Config;
use case_driver::dispatcher::Dispatcher;
use case_driver::error::DriverMainError;
use case_driver::orchestrator::Orchestrator;

/// A model that doubles its `x` input into `y`. Stands in for whatever the
/// embedding application actually wants to run.
struct DoublingModel;

#[async_trait]
impl WorkerHandle for DoublingModel {
    async fn load_model(&self, _artifact_path: &str) -> Result<(), ServerError> {
        Ok(())
    }

    async fn set(&self, _name: &str, _value: &Value) -> Result<(), ServerError> {
        Ok(())
    }

    async fn get(&self, _name: &str) -> Result<Value, ServerError> {
        Ok(json!(0))
    }

    async fn run(&self) -> Result<(), driver_common::allocator::RunFailure> {
        Ok(())
    }
}

/// Sequential/local runs never allocate a server, so this only needs to
/// exist to satisfy `Orchestrator::new`.
struct NoAllocator;

#[async_trait]
impl ResourceAllocator for NoAllocator {
    async fn max_servers(&self, _resources: &ResourceDescriptor) -> usize {
        0
    }

    async fn allocate(&self, _resources: &ResourceDescriptor) -> Option<AllocatedServer> {
        None
    }

    async fn release(&self, _server: &ServerInfo) {}
}

#[tokio::main]
async fn main() -> Result<(), DriverMainError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().map_err(|e| DriverMainError::Config(e.to_string()))?;

    let liveness = HealthRegistry::new("liveness");

    let health_router = {
        let liveness = liveness.clone();
        Router::new()
            .route("/", get(index))
            .route("/_readiness", get(index))
            .route("/_liveness", get(move || ready(liveness.get_status())))
    };
    let router = health_router.merge(setup_metrics_router());
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let cases = (0..10)
        .map(|i| {
            let mut case = Case::new()
                .with_label(format!("case-{i}"))
                .with_max_retries(config.default_max_retries);
            case.add_input("x", json!(i));
            case.add_output("y", None);
            case
        })
        .collect();

    let recorder = Arc::new(MemoryRecorder::new());
    let orchestrator = Orchestrator::new(
        Arc::new(NoAllocator),
        recorder as Arc<dyn Recorder>,
        ResourceDescriptor::new(),
        config.artifact_path.as_str(),
    )
    .with_shutdown_timeout(config.shutdown_timeout.0)
    .with_liveness(liveness);

    let dispatcher = Dispatcher::new(Box::new(VecCaseIterator::new(cases)));
    let report = orchestrator
        .execute_sequential(Arc::new(DoublingModel), dispatcher)
        .await
        .map_err(DriverMainError::Driver)?;

    info!(completed = report.completed, "run finished");

    Ok(())
}

pub async fn index() -> &'static str {
    "case-driver"
}
