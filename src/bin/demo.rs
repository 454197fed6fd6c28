//! A thin example wiring a [`NotificationService`] end-to-end against an
//! in-memory backend. Not a CLI front-end — it takes no arguments and
//! performs no configuration loading; it only exercises the library's
//! public API the way the teacher's own thin `src/bin/*` binaries sit over
//! `loja`'s library crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use notify_core::backend::{Backend, BackendError, ChatTarget, InboundUpdate, SendOutcome};
use notify_core::config::{BackendCredentials, CommandConfig, NotifierConfig, ServiceConfig};
use notify_core::error::{ExecutorError, ServiceError};
use notify_core::executor::{TaskExecutor, TaskRequest};
use notify_core::factory::NotifierFactory;
use notify_core::{Message, NotificationService, Notifier, NotifierId, TaskContext};
use tracing::info;

/// Prints every outbound message instead of calling a real chat API. Its
/// `updates()` stream never yields anything, since this demo has no inbound
/// transport to simulate.
struct StdoutBackend {
    label: String,
    delivered: AtomicUsize,
}

#[async_trait]
impl Backend for StdoutBackend {
    async fn send(&self, target: ChatTarget, body: &str, html: bool) -> SendOutcome {
        let n = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        println!("[{}:{}] -> chat {} (html={html}): {body}", self.label, n, target.0);
        SendOutcome::Success
    }

    fn updates(&self) -> BoxStream<'static, InboundUpdate> {
        Box::pin(futures_util::stream::empty())
    }
}

/// Builds one `Notifier` per configured entry with no backend wiring of its
/// own — the registry pairs each with a `Backend` via the closure passed to
/// `start`.
struct PlainFactory;

impl NotifierFactory for PlainFactory {
    fn build(
        &self,
        config: &ServiceConfig,
        _executor: Arc<dyn TaskExecutor>,
    ) -> Result<Vec<Arc<Notifier>>, ServiceError> {
        Ok(config
            .notifiers
            .iter()
            .map(|cfg| Arc::new(Notifier::new(cfg.id.clone(), true, cfg.clone())))
            .collect())
    }
}

/// An executor stub that immediately reports back through the service
/// instead of running anything — enough to exercise `run <task-id>` end to
/// end without a real task-execution subsystem.
struct LoggingExecutor;

#[async_trait]
impl TaskExecutor for LoggingExecutor {
    async fn submit(&self, request: TaskRequest) -> Result<(), ExecutorError> {
        info!(task_id = %request.task_id, "demo executor admitted task");
        Ok(())
    }

    async fn cancel(&self, instance_id: &str) -> Result<(), ExecutorError> {
        info!(instance_id, "demo executor cancel requested");
        Ok(())
    }
}

fn config() -> ServiceConfig {
    ServiceConfig {
        default_notifier_id: NotifierId::from("ops"),
        notifiers: vec![
            NotifierConfig {
                id: NotifierId::from("ops"),
                credentials: BackendCredentials { auth_token: "demo".into(), target_chat_id: 1 },
                rate_per_sec: 5.0,
                burst: 2,
                buffer_size: 32,
                enqueue_timeout: Duration::from_secs(2),
                send_timeout: Duration::from_secs(5),
                shutdown_drain_timeout: Duration::from_millis(500),
                max_retries: 3,
                retry_delay: Duration::from_millis(200),
                notify_on_failure: true,
                command: CommandConfig::default(),
            },
            NotifierConfig {
                id: NotifierId::from("alerts"),
                credentials: BackendCredentials { auth_token: "demo".into(), target_chat_id: 2 },
                rate_per_sec: 1.0,
                burst: 1,
                buffer_size: 32,
                enqueue_timeout: Duration::from_secs(2),
                send_timeout: Duration::from_secs(5),
                shutdown_drain_timeout: Duration::from_millis(500),
                max_retries: 3,
                retry_delay: Duration::from_millis(200),
                notify_on_failure: true,
                command: CommandConfig::default(),
            },
        ],
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let service = Arc::new(NotificationService::new());
    service
        .start(config(), &PlainFactory, Arc::new(LoggingExecutor), |cfg| {
            Arc::new(StdoutBackend { label: cfg.id.as_str().to_owned().leak(), delivered: AtomicUsize::new(0) })
        })
        .await
        .expect("demo configuration should always start cleanly");

    service
        .notify(&NotifierId::from("ops"), TaskContext::empty(), Message::new("deploy finished"))
        .await
        .expect("ops notifier exists");

    service
        .notify_default(TaskContext::empty(), Message::new("fallback heartbeat"))
        .await
        .expect("default notifier exists");

    let unknown = service
        .notify(&NotifierId::from("does-not-exist"), TaskContext::empty(), Message::new("lost message"))
        .await;
    println!("send to unknown recipient returned: {unknown:?}");

    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("health: {:?}", service.health());

    service.shutdown().await;
}
