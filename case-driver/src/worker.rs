//! The per-worker loop: an async task that serializes every operation
//! against one worker's model by draining a request channel.

use std::sync::Arc;

use driver_common::allocator::{RunFailure, WorkerHandle};
use driver_common::case::{Case, StructuredError};
use driver_common::health::HealthHandle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatcher::CaseOutcome;
use crate::scope::WorkerScope;
use crate::state::Worker;
use driver_common::error::ServerError;

enum WorkerCommand {
    LoadModel {
        artifact_path: String,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    RunCase {
        case: Case,
        reply: oneshot::Sender<(Case, CaseOutcome)>,
    },
}

/// A channel-backed handle to a running worker loop. Every call serializes
/// behind the loop's single request queue: a worker never runs two
/// operations concurrently with itself.
pub struct WorkerLoopHandle {
    pub worker: Worker,
    sender: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerLoopHandle {
    pub fn spawn(
        worker: Worker,
        model: Arc<dyn WorkerHandle>,
        liveness: Option<HealthHandle>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run_loop(worker.clone(), model, rx, liveness));
        Self {
            worker,
            sender: tx,
            task,
        }
    }

    pub async fn load_model(&self, artifact_path: String) -> Result<(), ServerError> {
        let (reply, recv) = oneshot::channel();
        if self
            .sender
            .send(WorkerCommand::LoadModel {
                artifact_path,
                reply,
            })
            .await
            .is_err()
        {
            return Err(ServerError::ExecuteDispatchFailed {
                reason: "worker loop is not running".to_string(),
            });
        }
        recv.await.unwrap_or_else(|_| {
            Err(ServerError::ExecuteDispatchFailed {
                reason: "worker loop dropped the reply channel".to_string(),
            })
        })
    }

    pub async fn run_case(&self, case: Case) -> (Case, CaseOutcome) {
        let (reply, recv) = oneshot::channel();
        let fallback = case.clone();
        if self
            .sender
            .send(WorkerCommand::RunCase { case, reply })
            .await
            .is_err()
        {
            return (
                fallback,
                CaseOutcome::ServerFault("worker loop is not running".to_string()),
            );
        }
        match recv.await {
            Ok(result) => result,
            Err(_) => (
                fallback,
                CaseOutcome::ServerFault("worker loop dropped the reply channel".to_string()),
            ),
        }
    }

    /// Close the request channel and wait for the loop task to exit.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(err) = self.task.await {
            warn!(worker = ?self.worker, "worker loop task panicked: {err}");
        }
    }
}

async fn run_loop(
    worker: Worker,
    model: Arc<dyn WorkerHandle>,
    mut requests: mpsc::Receiver<WorkerCommand>,
    liveness: Option<HealthHandle>,
) {
    info!(?worker, "worker loop starting");
    while let Some(command) = requests.recv().await {
        if let Some(handle) = &liveness {
            handle.report_healthy().await;
        }
        match command {
            WorkerCommand::LoadModel {
                artifact_path,
                reply,
            } => {
                let result = model.load_model(&artifact_path).await;
                if let Err(err) = &result {
                    warn!(?worker, "load_model failed: {err}");
                }
                let _ = reply.send(result);
            }
            WorkerCommand::RunCase { case, reply } => {
                let (case, outcome) = run_case(&worker, &model, case).await;
                let _ = reply.send((case, outcome));
            }
        }
    }
    info!(?worker, "worker loop exiting");
}

async fn run_case(
    worker: &Worker,
    model: &Arc<dyn WorkerHandle>,
    mut case: Case,
) -> (Case, CaseOutcome) {
    let mut scope = WorkerScope::new(model.clone());
    if let Err((name, reason)) = case.apply_inputs(&mut scope).await {
        let err = ServerError::SetFailed { name, reason };
        warn!(?worker, "apply_inputs failed: {err}");
        return (case, CaseOutcome::ServerFault(err.to_string()));
    }

    let started = std::time::Instant::now();
    let result = model.run().await;
    let elapsed = started.elapsed().as_secs_f64();
    metrics::histogram!("case_driver_case_duration_seconds").record(elapsed);

    match result {
        Ok(()) => match case.update_outputs(&scope, None).await {
            Ok(()) => (case, CaseOutcome::Completed),
            Err(err) => {
                warn!(?worker, "update_outputs failed: {err}");
                (case, CaseOutcome::ServerFault(err.to_string()))
            }
        },
        Err(RunFailure::Model(model_exc)) => {
            case.exc = Some(StructuredError::new(model_exc.to_string()));
            let _ = case
                .update_outputs(&scope, Some(model_exc.to_string()))
                .await;
            (case, CaseOutcome::ModelFault(model_exc.to_string()))
        }
        Err(RunFailure::Dispatch(server_err)) => {
            warn!(?worker, "run dispatch failed: {server_err}");
            (case, CaseOutcome::ServerFault(server_err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use driver_common::error::ModelException;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct EchoModel {
        outputs: Mutex<std::collections::HashMap<String, Value>>,
        fail_run: bool,
    }

    #[async_trait]
    impl WorkerHandle for EchoModel {
        async fn load_model(&self, _artifact_path: &str) -> Result<(), ServerError> {
            Ok(())
        }

        async fn set(&self, name: &str, value: &Value) -> Result<(), ServerError> {
            self.outputs
                .lock()
                .unwrap()
                .insert(name.to_string(), value.clone());
            Ok(())
        }

        async fn get(&self, name: &str) -> Result<Value, ServerError> {
            self.outputs
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| ServerError::SetFailed {
                    name: name.to_string(),
                    reason: "not set".to_string(),
                })
        }

        async fn run(&self) -> Result<(), RunFailure> {
            if self.fail_run {
                Err(RunFailure::Model(ModelException::new("model blew up")))
            } else {
                let mut outputs = self.outputs.lock().unwrap();
                let x = outputs.get("x").cloned().unwrap_or(json!(0));
                outputs.insert("y".to_string(), x);
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn completes_a_case_end_to_end() {
        let model: Arc<dyn WorkerHandle> = Arc::new(EchoModel {
            outputs: Mutex::new(std::collections::HashMap::new()),
            fail_run: false,
        });
        let handle = WorkerLoopHandle::spawn(Worker::Local, model, None);

        let mut case = Case::new();
        case.add_input("x", json!(5));
        case.add_output("y", None);

        let (case, outcome) = handle.run_case(case).await;
        assert!(matches!(outcome, CaseOutcome::Completed));
        assert_eq!(case.get_outputs(false), vec![("y".to_string(), json!(5))]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn model_exception_surfaces_as_model_fault() {
        let model: Arc<dyn WorkerHandle> = Arc::new(EchoModel {
            outputs: Mutex::new(std::collections::HashMap::new()),
            fail_run: true,
        });
        let handle = WorkerLoopHandle::spawn(Worker::Local, model, None);

        let case = Case::new();
        let (case, outcome) = handle.run_case(case).await;
        match outcome {
            CaseOutcome::ModelFault(msg) => assert!(msg.contains("model blew up")),
            _ => panic!("expected a model fault"),
        }
        assert!(case.msg.as_deref().unwrap().contains("model blew up"));
        assert!(case.exc.unwrap().message.contains("model blew up"));

        handle.shutdown().await;
    }
}
