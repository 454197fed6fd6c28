//! The caller-supplied handle that accompanies a notification request as it
//! travels through a [`Notifier`](crate::notifier::Notifier)'s pipeline.

use tokio_util::sync::CancellationToken;

/// Opaque handle the core consults to read a task's identifier, title, and
/// cancellation signal. The core never constructs the identifying fields
/// itself; it only propagates what the caller supplied.
///
/// When a caller has no task of its own to attach (e.g. a best-effort error
/// delivery), it uses [`TaskContext::empty`], whose cancellation token is
/// never cancelled: nobody holds the parent token that could cancel it.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: Option<String>,
    title: Option<String>,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Build a context around a concrete task.
    pub fn new(task_id: impl Into<String>, title: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            task_id: Some(task_id.into()),
            title: Some(title.into()),
            cancel,
        }
    }

    /// The placeholder substituted when the caller supplies no task context.
    /// Its cancellation signal never fires.
    pub fn empty() -> Self {
        Self {
            task_id: None,
            title: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Await the caller's cancellation signal. Resolves immediately if the
    /// token has already been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::empty()
    }
}
