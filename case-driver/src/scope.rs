//! Adapts a `WorkerHandle` (the allocator-provided, possibly remote, model
//! handle) to the `CaseScope` a `Case` applies its inputs to and reads its
//! outputs from.

use std::sync::Arc;

use async_trait::async_trait;
use driver_common::allocator::WorkerHandle;
use driver_common::case::CaseScope;
use serde_json::Value;
use uuid::Uuid;

pub struct WorkerScope {
    handle: Arc<dyn WorkerHandle>,
    case_id: Option<Uuid>,
}

impl WorkerScope {
    pub fn new(handle: Arc<dyn WorkerHandle>) -> Self {
        Self {
            handle,
            case_id: None,
        }
    }

    pub fn case_id(&self) -> Option<Uuid> {
        self.case_id
    }
}

#[async_trait]
impl CaseScope for WorkerScope {
    async fn set_case_id(&mut self, id: Uuid) {
        self.case_id = Some(id);
    }

    async fn set(&mut self, name: &str, value: &Value) -> Result<(), String> {
        self.handle.set(name, value).await.map_err(|e| e.to_string())
    }

    async fn get(&self, name: &str) -> Result<Value, String> {
        self.handle.get(name).await.map_err(|e| e.to_string())
    }
}
