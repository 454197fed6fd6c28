//! The Notifier factory collaborator, called exactly once by
//! [`NotificationService::start`](crate::registry::NotificationService::start).

use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::executor::TaskExecutor;
use crate::notifier::Notifier;

/// Builds the list of [`Notifier`] instances the registry will own, given the
/// validated configuration and a handle to the task executor. Implementing
/// this trait (rather than having the registry build Notifiers itself) keeps
/// backend wiring — which concrete `Backend` each Notifier is paired with —
/// out of the core's lifecycle logic.
pub trait NotifierFactory: Send + Sync {
    fn build(
        &self,
        config: &ServiceConfig,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Vec<Arc<Notifier>>, ServiceError>;
}
