//! Component E: the service registry and lifecycle. Owns every configured
//! [`Notifier`], spawns one sender loop and one inbound dispatcher per
//! Notifier, and is the sole entry point external callers use to route a
//! notification — mirroring the teacher's `server::run`, generalized from
//! "one listener, N connection handlers" to "one registry, N notifier
//! loops".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{Backend, ChatTarget};
use crate::config::{NotifierConfig, ServiceConfig};
use crate::dispatcher;
use crate::error::{NotifyError, ServiceError};
use crate::executor::TaskExecutor;
use crate::factory::NotifierFactory;
use crate::notifier::{sender, Message, Notifier};
use crate::task_context::TaskContext;
use crate::NotifierId;

/// Observability-only service lifecycle phase, queryable via [`NotificationService::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct RunningState {
    notifiers: Arc<HashMap<NotifierId, Arc<Notifier>>>,
    default_id: NotifierId,
    root: CancellationToken,
    supervisor: tokio::task::JoinHandle<()>,
    healthy: Arc<AtomicBool>,
}

struct Inner {
    phase: ServicePhase,
    running: Option<RunningState>,
}

/// The registry. Construct with [`NotificationService::new`], wire it up
/// with [`NotificationService::start`], and route every outbound
/// notification through `notify`/`notify_default`/`notify_default_with_error`.
pub struct NotificationService {
    inner: RwLock<Inner>,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationService {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner { phase: ServicePhase::Idle, running: None }),
        }
    }

    pub fn phase(&self) -> ServicePhase {
        self.inner.read().expect("registry lock poisoned").phase
    }

    /// Build every configured Notifier via `factory`, spawn one sender loop
    /// and one inbound dispatcher per Notifier, and transition to `Running`.
    ///
    /// `backend_for` constructs the concrete [`Backend`] for a given
    /// [`NotifierConfig`] — normally [`crate::backend::telegram::TelegramBackend::new`]
    /// wrapped in an `Arc`, but tests substitute an in-memory fake. One
    /// backend instance is built per Notifier; nothing here assumes they
    /// don't share an underlying connection if the caller's closure chooses
    /// to do so.
    pub async fn start(
        self: &Arc<Self>,
        config: ServiceConfig,
        factory: &dyn NotifierFactory,
        executor: Arc<dyn TaskExecutor>,
        backend_for: impl Fn(&NotifierConfig) -> Arc<dyn Backend> + Send,
    ) -> Result<(), ServiceError> {
        {
            let guard = self.inner.read().expect("registry lock poisoned");
            if guard.phase == ServicePhase::Running {
                return Ok(());
            }
        }

        let built = factory.build(&config, executor.clone())?;
        let mut by_id: HashMap<NotifierId, Arc<Notifier>> = HashMap::new();
        for notifier in built {
            if by_id.insert(notifier.id().clone(), notifier.clone()).is_some() {
                return Err(ServiceError::DuplicateId(notifier.id().clone()));
            }
        }
        if !by_id.contains_key(&config.default_notifier_id) {
            return Err(ServiceError::MissingDefault(config.default_notifier_id.clone()));
        }

        let root = CancellationToken::new();
        let mut join_set = JoinSet::new();

        for notifier_config in &config.notifiers {
            let notifier = by_id.get(&notifier_config.id).expect("validated above").clone();
            let queue_rx = notifier.consume().expect("queue consumed exactly once at start");
            let backend = backend_for(notifier_config);
            let target = ChatTarget(notifier_config.credentials.target_chat_id);

            join_set.spawn(sender::run_sender_loop(
                notifier.clone(),
                queue_rx,
                backend.clone(),
                target,
                root.child_token(),
                self.clone(),
            ));

            let service = self.clone();
            let notifier_id = notifier_config.id.clone();
            let updates = backend.updates();
            let executor = executor.clone();
            let max_concurrent = notifier_config.command.max_concurrent;
            let command_timeout = notifier_config.command.command_timeout;
            let dispatcher_cancel = root.child_token();
            // `run_dispatcher` has no cancellation signal of its own (it
            // stops only when its update stream ends, which a long-poll
            // backend never does on its own); race it against the root
            // token here so shutdown still unblocks the supervisor below.
            join_set.spawn(async move {
                tokio::select! {
                    _ = dispatcher_cancel.cancelled() => {}
                    _ = dispatcher::run_dispatcher(service, notifier_id, updates, executor, max_concurrent, command_timeout) => {}
                }
            });
        }

        let healthy = Arc::new(AtomicBool::new(true));
        let supervisor_healthy = healthy.clone();
        let supervisor = tokio::spawn(async move {
            while let Some(result) = join_set.join_next().await {
                if let Err(join_err) = result {
                    error!(panic = join_err.is_panic(), "a notifier task terminated unexpectedly");
                    supervisor_healthy.store(false, Ordering::SeqCst);
                }
            }
        });

        let mut guard = self.inner.write().expect("registry lock poisoned");
        guard.phase = ServicePhase::Running;
        guard.running = Some(RunningState {
            notifiers: Arc::new(by_id),
            default_id: config.default_notifier_id,
            root,
            supervisor,
            healthy,
        });
        info!(notifiers = guard.running.as_ref().unwrap().notifiers.len(), "notification service started");
        Ok(())
    }

    /// Cancels every Notifier's root token, which triggers each sender
    /// loop's bounded drain, then awaits the supervisor task so `shutdown`
    /// only returns once every loop has actually stopped.
    pub async fn shutdown(&self) {
        let (root, supervisor) = {
            let mut guard = self.inner.write().expect("registry lock poisoned");
            let Some(running) = guard.running.take() else { return };
            guard.phase = ServicePhase::Stopping;
            (running.root, running.supervisor)
        };
        root.cancel();
        if let Err(join_err) = supervisor.await {
            error!(panic = join_err.is_panic(), "supervisor task itself panicked during shutdown");
        }
        let mut guard = self.inner.write().expect("registry lock poisoned");
        guard.phase = ServicePhase::Stopped;
    }

    /// `Err(NotifyError::Internal(..))` once any notifier task has terminated
    /// unexpectedly; `Err(NotifyError::Stopped)` before `start` or after
    /// `shutdown`.
    pub fn health(&self) -> Result<(), NotifyError> {
        let guard = self.inner.read().expect("registry lock poisoned");
        let running = guard.running.as_ref().ok_or(NotifyError::Stopped)?;
        if !running.healthy.load(Ordering::SeqCst) {
            return Err(NotifyError::Internal("one or more notifier loops terminated unexpectedly".into()));
        }
        Ok(())
    }

    pub async fn notify(&self, id: &NotifierId, task: TaskContext, message: Message) -> Result<(), NotifyError> {
        match self.lookup(id) {
            Ok(notifier) => notifier.send(task, message).await,
            Err(err @ NotifyError::NotFound(_)) => {
                self.fallback_to_default(id, &message).await;
                Err(err)
            }
            Err(other) => Err(other),
        }
    }

    pub async fn notify_default(&self, task: TaskContext, message: Message) -> Result<(), NotifyError> {
        let notifier = self.lookup_default()?;
        notifier.send(task, message).await
    }

    pub async fn notify_default_with_error(
        &self,
        task: TaskContext,
        message: Message,
    ) -> Result<(), NotifyError> {
        let notifier = self.lookup_default()?;
        notifier.send_inner(task, message, true).await
    }

    /// `false` for an unknown id, per spec 4.E's literal contract
    /// ("lookup; unknown → false") rather than surfacing `NotFound`.
    pub fn supports_html(&self, id: &NotifierId) -> bool {
        self.lookup(id).map(|n| n.supports_html()).unwrap_or(false)
    }

    fn lookup(&self, id: &NotifierId) -> Result<Arc<Notifier>, NotifyError> {
        let guard = self.inner.read().expect("registry lock poisoned");
        let running = guard.running.as_ref().ok_or(NotifyError::Stopped)?;
        running.notifiers.get(id).cloned().ok_or_else(|| NotifyError::NotFound(id.clone()))
    }

    fn lookup_default(&self) -> Result<Arc<Notifier>, NotifyError> {
        let guard = self.inner.read().expect("registry lock poisoned");
        let running = guard.running.as_ref().ok_or(NotifyError::Stopped)?;
        running
            .notifiers
            .get(&running.default_id)
            .cloned()
            .ok_or_else(|| NotifyError::NotFound(running.default_id.clone()))
    }

    /// Best-effort fallback delivery to the default notifier when the
    /// requested recipient doesn't exist. The original `NotFound` is what
    /// callers see regardless of whether this succeeds; a failure here is
    /// logged and swallowed (see `DESIGN.md`'s Open Question decisions).
    ///
    /// The wrapped message names both the originally intended recipient id
    /// and the original body (spec 4.E: "a wrapped message that includes
    /// the original intended id and body").
    async fn fallback_to_default(&self, intended_id: &NotifierId, original: &Message) {
        let Ok(default_notifier) = self.lookup_default() else { return };
        let fallback = Message::new(format!(
            "notification to unknown recipient `{intended_id}` was dropped: {}",
            original.body
        ));
        if let Err(err) = default_notifier.send_inner(TaskContext::empty(), fallback, true).await {
            warn!(%err, "fallback delivery to default notifier also failed");
        }
    }
}
