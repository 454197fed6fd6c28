use thiserror::Error;

use crate::NotifierId;

/// Errors surfaced by a single [`Notifier`](crate::notifier::Notifier) or by
/// [`NotificationService`](crate::registry::NotificationService) on its
/// request-routing path.
///
/// This is the caller-visible taxonomy from the error handling design:
/// `InvalidInput`, `Unavailable` (split here into `QueueFull` / `Closed` /
/// `ContextCancelled` / `Stopped` so callers can match on the specific
/// reason), `Internal`, and `NotFound`.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("notifier queue is full")]
    QueueFull,
    #[error("notifier is closed")]
    Closed,
    #[error("send was cancelled by the caller")]
    ContextCancelled,
    #[error("notifier `{0}` not found")]
    NotFound(NotifierId),
    #[error("service is not running")]
    Stopped,
    #[error("internal error: {0}")]
    Internal(String),
}

impl NotifyError {
    /// `true` for errors the caller may reasonably retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotifyError::QueueFull | NotifyError::ContextCancelled | NotifyError::Stopped
        )
    }
}

/// Errors from [`NotificationService::start`](crate::registry::NotificationService::start):
/// the `System` category from the error taxonomy, surfaced before the
/// service reaches the running state.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("duplicate notifier id: {0}")]
    DuplicateId(NotifierId),
    #[error("default notifier id `{0}` not present among configured notifiers")]
    MissingDefault(NotifierId),
    #[error("notifier factory failed: {0}")]
    Factory(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors from the external [`TaskExecutor`](crate::executor::TaskExecutor)
/// collaborator. The core only ever logs these; it never inspects variants.
#[derive(Debug, Error)]
#[error("executor error: {0}")]
pub struct ExecutorError(pub String);
