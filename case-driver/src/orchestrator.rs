//! Drives a case iterator to completion: sequential (single local model) or
//! concurrent (a pool of allocator-provisioned workers), with cooperative
//! shutdown and artifact cleanup.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use driver_common::allocator::{AllocatedServer, ResourceAllocator};
use driver_common::allocator::{ResourceDescriptor, ServerInfo, WorkerHandle};
use driver_common::error::DriverError;
use driver_common::health::HealthRegistry;
use driver_common::recorder::Recorder;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifact::{self, ArtifactRegistry};
use crate::dispatcher::{CaseDisposition, CaseOutcome, Dispatcher};
use crate::state::{Worker, WorkerRecord, WorkerState};
use crate::worker::WorkerLoopHandle;

/// Summary of one successful `execute` call. A cooperative stop surfaces as
/// `Err(DriverError::StopRequested)` instead, after whatever
/// cases had already finished are recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionReport {
    pub completed: usize,
}

/// Owns the resources (allocator, recorder, packaged artifacts) a single run
/// needs, and drives cases through them either sequentially or concurrently.
pub struct Orchestrator {
    allocator: Arc<dyn ResourceAllocator>,
    recorder: Arc<dyn Recorder>,
    resources: ResourceDescriptor,
    artifact_path: String,
    artifacts: ArtifactRegistry,
    shutdown_timeout: Duration,
    liveness: Option<HealthRegistry>,
    stop: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        allocator: Arc<dyn ResourceAllocator>,
        recorder: Arc<dyn Recorder>,
        resources: ResourceDescriptor,
        artifact_path: impl Into<String>,
    ) -> Self {
        Self {
            allocator,
            recorder,
            resources,
            artifact_path: artifact_path.into(),
            artifacts: ArtifactRegistry::new(),
            shutdown_timeout: Duration::from_secs(30),
            liveness: None,
            stop: CancellationToken::new(),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_liveness(mut self, liveness: HealthRegistry) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn artifacts(&self) -> &ArtifactRegistry {
        &self.artifacts
    }

    /// A token the caller can cancel to cooperatively stop a running
    /// `execute` call: workers finish whatever case they are on, no new
    /// cases are dispatched, and `execute` returns `Err(StopRequested)`.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run every case in `dispatcher` through a single, local, in-process
    /// model. No allocator calls are made.
    pub async fn execute_sequential(
        &self,
        model: Arc<dyn WorkerHandle>,
        mut dispatcher: Dispatcher,
    ) -> Result<ExecutionReport, DriverError> {
        let liveness = self.register_liveness("worker-local").await;
        let worker = WorkerLoopHandle::spawn(Worker::Local, model, liveness);
        worker
            .load_model(self.artifact_path.clone())
            .await
            .map_err(DriverError::Server)?;
        let mut record = WorkerRecord::new(Worker::Local);
        record.state = WorkerState::Ready;

        let mut completed = 0;
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let Some(case) = dispatcher.next_case().await else {
                break;
            };
            let (case, outcome) =
                run_on_worker(&worker, &mut record, &self.artifact_path, case).await;
            if let CaseDisposition::Finished(finished) = dispatcher.complete_case(case, outcome) {
                self.recorder.append(&finished).await;
                completed += 1;
            }
        }

        let stopped = self.stop.is_cancelled();
        worker.shutdown().await;
        self.artifacts.cleanup();
        if stopped {
            return Err(DriverError::StopRequested);
        }
        Ok(ExecutionReport { completed })
    }

    /// Run every case in `dispatcher` across up to `max_workers` allocated
    /// servers. Fails fast with `NoCapacityError` if the allocator reports no
    /// server can meet `resources` at all.
    pub async fn execute_concurrent(
        &self,
        dispatcher: Dispatcher,
        max_workers: usize,
    ) -> Result<ExecutionReport, DriverError> {
        let available = self.allocator.max_servers(&self.resources).await;
        if available == 0 {
            self.artifacts.cleanup();
            return Err(DriverError::NoCapacityError {
                resources: format!("{:?}", self.resources),
            });
        }
        let worker_count = max_workers.min(available).max(1);

        let transfer_path = match self.package_for_transfer() {
            Ok(path) => path,
            Err(err) => {
                self.artifacts.cleanup();
                return Err(err);
            }
        };

        let started = self.start_workers(worker_count, &transfer_path).await;
        if started.is_empty() {
            self.artifacts.cleanup();
            return Err(DriverError::AllocationFailure {
                worker: "*".to_string(),
            });
        }

        let shared = Arc::new(SharedDispatcher::with_worker_count(dispatcher, started.len()));
        let mut tasks = JoinSet::new();
        let mut server_infos = Vec::with_capacity(started.len());
        for (info, handle) in started {
            server_infos.push(info);
            let shared = shared.clone();
            let recorder = self.recorder.clone();
            let stop = self.stop.clone();
            let worker_artifact_path = transfer_path.clone();
            tasks.spawn(worker_run_loop(handle, shared, recorder, stop, worker_artifact_path));
        }

        let mut completed = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(n) => completed += n,
                Err(err) => warn!("worker task panicked: {err}"),
            }
        }

        let stopped = self.stop.is_cancelled();
        for info in &server_infos {
            self.allocator.release(info).await;
        }
        self.artifacts.cleanup();

        if stopped {
            return Err(DriverError::StopRequested);
        }
        Ok(ExecutionReport { completed })
    }

    /// Package the configured model once per run, into a copy every worker
    /// (and every later reload) loads from. Since the source never changes
    /// mid-run, a single packaged copy is transferred once; reloads point at
    /// that same path rather than re-packaging.
    fn package_for_transfer(&self) -> Result<String, DriverError> {
        let model_path = Path::new(&self.artifact_path);
        let artifact_dir = model_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("case-driver-artifacts");
        let packaged = artifact::package_model(model_path, &artifact_dir).map_err(|err| {
            DriverError::ArtifactPackagingFailed {
                reason: err.to_string(),
            }
        })?;
        self.artifacts.register(packaged.clone());
        Ok(packaged.to_string_lossy().into_owned())
    }

    /// Allocate and start `worker_count` workers. On platforms with
    /// file-locking hazards around concurrent model loads, workers start one
    /// at a time; elsewhere, allocation and model loading overlap across
    /// workers.
    async fn start_workers(
        &self,
        worker_count: usize,
        artifact_path: &str,
    ) -> Vec<(ServerInfo, WorkerLoopHandle)> {
        #[cfg(windows)]
        {
            let mut started = Vec::with_capacity(worker_count);
            for index in 0..worker_count {
                match self.start_worker(index, artifact_path).await {
                    Ok(pair) => started.push(pair),
                    Err(err) => warn!("worker {index} failed to start: {err}"),
                }
            }
            started
        }
        #[cfg(not(windows))]
        {
            let starts = (0..worker_count).map(|index| self.start_worker(index, artifact_path));
            futures::future::join_all(starts)
                .await
                .into_iter()
                .filter_map(|result| match result {
                    Ok(pair) => Some(pair),
                    Err(err) => {
                        warn!("worker failed to start: {err}");
                        None
                    }
                })
                .collect()
        }
    }

    async fn start_worker(
        &self,
        index: usize,
        artifact_path: &str,
    ) -> Result<(ServerInfo, WorkerLoopHandle), DriverError> {
        let AllocatedServer { info, handle } = self
            .allocator
            .allocate(&self.resources)
            .await
            .ok_or_else(|| DriverError::AllocationFailure {
                worker: index.to_string(),
            })?;
        let worker = Worker::Remote(info.id.clone());
        let liveness = self.register_liveness(&format!("worker-{}", info.id)).await;
        let loop_handle = WorkerLoopHandle::spawn(worker, handle, liveness);
        loop_handle
            .load_model(artifact_path.to_string())
            .await
            .map_err(DriverError::Server)?;
        info!(worker = %info.id, "worker started");
        Ok((info, loop_handle))
    }

    async fn register_liveness(
        &self,
        component: &str,
    ) -> Option<driver_common::health::HealthHandle> {
        match &self.liveness {
            Some(registry) => Some(
                registry
                    .register(component.to_string(), time::Duration::seconds(60))
                    .await,
            ),
            None => None,
        }
    }
}

/// A `Dispatcher` shared across concurrently running worker tasks, with the
/// bookkeeping needed for idle workers to notice new work (a retried case
/// landing in `rerun`) without busy-spinning.
struct SharedDispatcher {
    dispatcher: AsyncMutex<Dispatcher>,
    in_flight: AtomicUsize,
    worker_count: usize,
    notify: Notify,
}

impl SharedDispatcher {
    fn with_worker_count(dispatcher: Dispatcher, worker_count: usize) -> Self {
        Self {
            dispatcher: AsyncMutex::new(dispatcher),
            in_flight: AtomicUsize::new(0),
            worker_count: worker_count.max(1),
            notify: Notify::new(),
        }
    }

    fn report_saturation(&self) {
        let in_use = self.in_flight.load(Ordering::SeqCst) as f64;
        metrics::gauge!("case_driver_worker_saturation_percent")
            .set(in_use / self.worker_count as f64);
    }

    async fn acquire(&self, stop: &CancellationToken) -> Option<driver_common::case::Case> {
        loop {
            {
                let mut dispatcher = self.dispatcher.lock().await;
                if stop.is_cancelled() {
                    return None;
                }
                if let Some(case) = dispatcher.next_case().await {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    self.report_saturation();
                    return Some(case);
                }
                if dispatcher.is_drained() && self.in_flight.load(Ordering::SeqCst) == 0 {
                    return None;
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                _ = stop.cancelled() => return None,
            }
        }
    }

    /// Returns `true` if the case reached a terminal outcome and was
    /// recorded; `false` if it was requeued for retry.
    async fn complete(
        &self,
        case: driver_common::case::Case,
        outcome: CaseOutcome,
        recorder: &Arc<dyn Recorder>,
    ) -> bool {
        let disposition = {
            let mut dispatcher = self.dispatcher.lock().await;
            dispatcher.complete_case(case, outcome)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.report_saturation();
        self.notify.notify_waiters();
        match disposition {
            CaseDisposition::Finished(case) => {
                recorder.append(&case).await;
                true
            }
            CaseDisposition::Requeued => false,
        }
    }
}

/// Run one case on `handle`, reloading the model first if the worker is in
/// `WorkerState::Error` — a worker that just failed never resumes work on a
/// possibly-corrupted model state. After a successful run (or a model
/// exception, which always triggers a reload) the model is reloaded again
/// when `record.reload_model` is set, mirroring a fresh-model-per-case
/// policy; after an infrastructure fault the worker is left in `Error` for
/// the next case to attempt recovery on.
async fn run_on_worker(
    handle: &WorkerLoopHandle,
    record: &mut WorkerRecord,
    artifact_path: &str,
    case: driver_common::case::Case,
) -> (driver_common::case::Case, CaseOutcome) {
    if record.state == WorkerState::Error {
        match handle.load_model(artifact_path.to_string()).await {
            Ok(()) => record.state = WorkerState::Ready,
            Err(err) => {
                record.load_failures += 1;
                warn!(
                    worker = ?record.worker,
                    failures = record.load_failures,
                    "reload after server error failed: {err}"
                );
                return (case, CaseOutcome::ServerFault(err.to_string()));
            }
        }
    }

    record.assigned_case = Some(case.clone());
    let (case, outcome) = handle.run_case(case).await;
    record.assigned_case = None;

    match &outcome {
        CaseOutcome::ServerFault(_) => {
            record.state = WorkerState::Error;
        }
        CaseOutcome::Completed => {
            record.state = WorkerState::Complete;
            if record.reload_model {
                reload(handle, record, artifact_path).await;
            } else {
                record.state = WorkerState::Ready;
            }
        }
        CaseOutcome::ModelFault(_) => {
            record.state = WorkerState::Complete;
            reload(handle, record, artifact_path).await;
        }
    }
    (case, outcome)
}

async fn reload(handle: &WorkerLoopHandle, record: &mut WorkerRecord, artifact_path: &str) {
    match handle.load_model(artifact_path.to_string()).await {
        Ok(()) => record.state = WorkerState::Ready,
        Err(err) => {
            record.load_failures += 1;
            warn!(worker = ?record.worker, "post-run reload failed: {err}");
            record.state = WorkerState::Error;
        }
    }
}

async fn worker_run_loop(
    handle: WorkerLoopHandle,
    shared: Arc<SharedDispatcher>,
    recorder: Arc<dyn Recorder>,
    stop: CancellationToken,
    artifact_path: String,
) -> usize {
    let mut completed = 0;
    let mut record = WorkerRecord::new(handle.worker.clone());
    record.state = WorkerState::Ready;
    loop {
        let Some(case) = shared.acquire(&stop).await else {
            break;
        };
        let (case, outcome) = run_on_worker(&handle, &mut record, &artifact_path, case).await;
        if shared.complete(case, outcome, &recorder).await {
            completed += 1;
        }
    }
    handle.shutdown().await;
    completed
}
