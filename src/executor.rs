//! The task executor collaborator consumed by the inbound command dispatcher
//! (component D). The executor owns its own concurrency; the core only ever
//! calls these two methods and expects results to arrive back through
//! [`NotificationService::notify`](crate::registry::NotificationService::notify),
//! carrying the original task context.

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::TaskContext;

/// One `run <task-id>` admission request built by the dispatcher.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: String,
    pub context: TaskContext,
}

/// Non-blocking admission interface the dispatcher calls into.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Admit a task for execution. Must not block on the task's completion;
    /// the executor reports results asynchronously through the registry.
    async fn submit(&self, request: TaskRequest) -> Result<(), ExecutorError>;

    /// Request cancellation of a running task instance.
    async fn cancel(&self, instance_id: &str) -> Result<(), ExecutorError>;
}
