//! Executor trait — every task kind registers one implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::MedlarConfig;
use crate::error::Result;
use crate::traits::store::TaskStore;
use crate::types::{ExecutionResult, Task, TaskKind};

/// Shared handles an executor may use. Executors insert follow-up tasks
/// through `store`; cancellation must be observed at I/O boundaries.
#[derive(Clone)]
pub struct ExecutionContext {
    pub store: Arc<dyn TaskStore>,
    pub config: Arc<MedlarConfig>,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(store: Arc<dyn TaskStore>, config: Arc<MedlarConfig>) -> Self {
        Self {
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }
}

/// One executor per task kind. Expected failures are returned as
/// `ExecutionResult { success: false, error }`; only infrastructure faults
/// (store unreachable, etc.) surface as `Err` and are converted by the
/// dispatcher.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult>;
}
