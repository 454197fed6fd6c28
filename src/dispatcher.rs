//! Component D: the inbound command dispatcher. Consumes one
//! [`Backend::updates`] stream, parses a small space-separated command
//! grammar, and submits admitted commands to a [`TaskExecutor`] under a
//! semaphore admission gate — the same "bounded concurrent work, reply async"
//! shape the teacher applies to inbound connections in `server.rs`
//! (`Listener.limit_connections: Arc<Semaphore>`), here narrowed to one
//! permit per in-flight command instead of one per TCP connection.

pub mod command;

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::InboundUpdate;
use crate::executor::{TaskExecutor, TaskRequest};
use crate::notifier::Message;
use crate::registry::NotificationService;
use crate::task_context::TaskContext;
use crate::NotifierId;

use command::Command;

/// Runs until `updates` ends (the backend dropped its sender, typically
/// because the owning service is shutting down). Each inbound update is
/// handled on its own spawned task — admitted through `max_concurrent`
/// permits and bounded by `command_timeout` — so one slow or panicking
/// handler cannot block the rest of the inbound stream. Replies are sent back
/// through `service.notify(notifier_id, ..)`, the same path any other caller
/// uses.
///
/// Admission control is non-blocking: a command that finds no free permit is
/// dropped and answered with an "overloaded" reply immediately, rather than
/// waiting for one to free up (spec section 4.D, "If the semaphore is full,
/// drop the request and reply 'overloaded' to the sender; do not block the
/// update stream").
pub async fn run_dispatcher(
    service: Arc<NotificationService>,
    notifier_id: NotifierId,
    mut updates: BoxStream<'static, InboundUpdate>,
    executor: Arc<dyn TaskExecutor>,
    max_concurrent: usize,
    command_timeout: Duration,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    while let Some(update) = updates.next().await {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(notifier = %notifier_id, "command semaphore at capacity, dropping update");
                let service = service.clone();
                let notifier_id = notifier_id.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        service.notify(&notifier_id, TaskContext::empty(), Message::new("overloaded")).await
                    {
                        warn!(%err, "failed to send overloaded reply");
                    }
                });
                continue;
            }
        };

        let service = service.clone();
        let notifier_id = notifier_id.clone();
        let executor = executor.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let task =
                tokio::spawn(handle_update(service.clone(), notifier_id.clone(), executor, update, command_timeout));
            if let Err(join_err) = task.await {
                error!(panic = join_err.is_panic(), "command handler task failed");
                let _ = service
                    .notify(&notifier_id, TaskContext::empty(), Message::new("internal error handling command"))
                    .await;
            }
        });
    }

    info!(notifier = %notifier_id, "inbound update stream ended, dispatcher stopping");
}

async fn handle_update(
    service: Arc<NotificationService>,
    notifier_id: NotifierId,
    executor: Arc<dyn TaskExecutor>,
    update: InboundUpdate,
    command_timeout: Duration,
) {
    let command = command::parse(&update.text);
    let reply = match tokio::time::timeout(command_timeout, apply(command, &executor)).await {
        Ok(reply) => reply,
        Err(_) => "command timed out".to_string(),
    };

    if let Err(err) = service.notify(&notifier_id, TaskContext::empty(), Message::new(reply)).await {
        warn!(%err, "failed to send command reply");
    }
}

/// Applies one parsed command to the executor. Neither branch keeps any
/// dispatcher-owned bookkeeping beyond this single call: the pending
/// inbound command named in spec section 3 "lives only for the duration of
/// the dispatcher goroutine handling it", and the `cancel` contract in spec
/// section 4.D is exactly "call `executor.Cancel(instance-id)`" — nothing
/// more. A `run <task-id>` whose task completes on its own reports its
/// result back through `service.notify`, not through this dispatcher, so
/// there is no local state here that would need reaping.
async fn apply(command: Command, executor: &Arc<dyn TaskExecutor>) -> String {
    match command {
        Command::Help => command::HELP_TEXT.to_string(),
        Command::Run(task_id) => {
            let context = TaskContext::new(task_id.clone(), task_id.clone(), CancellationToken::new());
            let request = TaskRequest { task_id: task_id.clone(), context };
            match executor.submit(request).await {
                Ok(()) => format!("task `{task_id}` submitted"),
                Err(err) => format!("failed to submit task `{task_id}`: {err}"),
            }
        }
        Command::Cancel(instance_id) => match executor.cancel(&instance_id).await {
            Ok(()) => format!("cancellation requested for `{instance_id}`"),
            Err(err) => format!("failed to cancel `{instance_id}`: {err}"),
        },
    }
}
