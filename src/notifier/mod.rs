//! Component A: the Notifier base pipeline.
//!
//! A [`Notifier`] is a per-recipient-channel pipeline: a bounded queue with
//! timed backpressure on the producer side, and a broadcast "done" signal
//! guarded together with the closed flag behind one lock, following the
//! same shape as the teacher's `DbSharedState { state: RwLock<DbState>, .. }`
//! — a small state struct behind a single `std::sync::RwLock`, so readers on
//! the hot path hold the lock only long enough to copy out what they need.
//!
//! The queue itself is never closed by [`Notifier::close`]; only the
//! broadcast "done" signal fires and the `closed` flag flips. Closing the
//! `mpsc::Sender` side from here would race any producer still mid-`send`
//! on another clone of the same sender (multi-producer safety, spec section
//! 4.A / design note "Multi-producer queue closure"). The sender clones are
//! simply dropped one by one as producers finish; the channel becomes
//! garbage once the last clone (held by this `Notifier`'s own state plus any
//! producers that already copied it out) drops.

pub mod rate_limiter;
pub mod retry;
pub mod sender;

use std::sync::RwLock;
use std::time::Duration;

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

use crate::config::NotifierConfig;
use crate::error::NotifyError;
use crate::task_context::TaskContext;
use crate::NotifierId;

pub use rate_limiter::TokenBucket;
pub use retry::RetryPolicy;

/// The notification payload. Optionally contains markup tags understood by
/// the backend; whether a given Notifier will attempt to parse them is a
/// static capability ([`Notifier::supports_html`]), not a per-message flag.
#[derive(Debug, Clone)]
pub struct Message {
    pub body: String,
}

impl Message {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// One request in flight through a Notifier's pipeline. Consumed exactly
/// once by that Notifier's sender loop.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub task: TaskContext,
    pub message: Message,
    /// Set by [`crate::registry::NotificationService`] when this request is
    /// itself a best-effort error delivery (e.g. the unknown-recipient
    /// fallback), so the backend adapter / logs can tell it apart from an
    /// application-originated notification.
    pub error_delivery: bool,
}

/// Observability-only lifecycle phase for a single Notifier, queryable for
/// diagnostics. Does not change any operation's contract from the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierPhase {
    Running,
    Draining,
    Terminal,
}

/// The closed flag, queue sender, and done-signal sender behind one lock, per
/// the concurrency model's "one reader-writer lock" requirement.
struct NotifierState {
    closed: bool,
    /// Set once the sender loop has finished its bounded drain and returned.
    /// Distinguishes [`NotifierPhase::Draining`] from [`NotifierPhase::Terminal`].
    terminal: bool,
    queue_tx: mpsc::Sender<NotificationRequest>,
    done_tx: broadcast::Sender<()>,
}

/// A per-recipient-channel pipeline: bounded queue, sender loop, rate
/// limiter, retry policy — everything described in spec section 4.A.
#[derive(Debug)]
pub struct Notifier {
    id: NotifierId,
    state: RwLock<NotifierState>,
    /// Taken exactly once by [`Notifier::consume`]; `None` thereafter.
    queue_rx: std::sync::Mutex<Option<mpsc::Receiver<NotificationRequest>>>,
    supports_html: bool,
    config: NotifierConfig,
}

impl std::fmt::Debug for NotifierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierState")
            .field("closed", &self.closed)
            .field("terminal", &self.terminal)
            .finish()
    }
}

/// Cloneable handle a consumer awaits to learn that a Notifier is stopping.
/// Mirrors the teacher's `Shutdown` wrapper around a `broadcast::Receiver`:
/// caches whether the signal already fired so a second `recv()` after the
/// first is a no-op rather than blocking forever on a channel with no more
/// senders.
#[derive(Debug)]
pub struct NotifierShutdown {
    is_done: bool,
    notify: broadcast::Receiver<()>,
}

impl NotifierShutdown {
    fn new(notify: broadcast::Receiver<()>) -> Self {
        Self { is_done: false, notify }
    }

    pub fn is_done(&self) -> bool {
        self.is_done
    }

    /// Wait for the done signal, returning immediately if it already fired.
    pub async fn recv(&mut self) {
        if self.is_done {
            return;
        }
        // Only one value is ever sent (the `Notifier` stores the sender and
        // closes it exactly once in `close`), so a `Lagged` error cannot
        // occur here.
        let _ = self.notify.recv().await;
        self.is_done = true;
    }
}

impl Clone for NotifierShutdown {
    fn clone(&self) -> Self {
        Self {
            is_done: self.is_done,
            notify: self.notify.resubscribe(),
        }
    }
}

impl Notifier {
    /// Construct a new Notifier with the given id, static HTML capability,
    /// and tuning. Call [`Notifier::consume`] exactly once (the registry does
    /// this when it spawns the sender loop) to obtain the receive half of
    /// the queue.
    pub fn new(id: NotifierId, supports_html: bool, config: NotifierConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.buffer_size.max(1));
        let (done_tx, _) = broadcast::channel(1);
        Self {
            id,
            state: RwLock::new(NotifierState {
                closed: false,
                terminal: false,
                queue_tx,
                done_tx,
            }),
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
            supports_html,
            config,
        }
    }

    pub fn id(&self) -> &NotifierId {
        &self.id
    }

    pub fn supports_html(&self) -> bool {
        self.supports_html
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Subscribe to the done signal. Each subscriber gets its own
    /// [`NotifierShutdown`]; the sender loop typically calls this once at
    /// startup.
    pub fn subscribe_done(&self) -> NotifierShutdown {
        let guard = self.state.read().expect("notifier state lock poisoned");
        NotifierShutdown::new(guard.done_tx.subscribe())
    }

    /// Takes the receive half of the queue. Returns `None` if already taken
    /// — external code must not read this stream; it is consumed by exactly
    /// one sender loop.
    pub(crate) fn consume(&self) -> Option<mpsc::Receiver<NotificationRequest>> {
        self.queue_rx.lock().expect("queue_rx lock poisoned").take()
    }

    /// Idempotent. Marks the Notifier closed and fires the done signal.
    /// Does **not** close the request queue — see the module doc comment.
    pub fn close(&self) {
        let mut guard = self.state.write().expect("notifier state lock poisoned");
        if guard.closed {
            return;
        }
        guard.closed = true;
        // A send error here only means there are no receivers left (every
        // `NotifierShutdown` already dropped), which is harmless: nobody is
        // left to observe the signal.
        let _ = guard.done_tx.send(());
        debug!(notifier = %self.id, "notifier closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().expect("notifier state lock poisoned").closed
    }

    /// Current lifecycle phase, derived from the closed/terminal flags —
    /// read-only, for diagnostics and logging (mirrors
    /// [`crate::registry::NotificationService::phase`]).
    pub fn phase(&self) -> NotifierPhase {
        let guard = self.state.read().expect("notifier state lock poisoned");
        if !guard.closed {
            NotifierPhase::Running
        } else if !guard.terminal {
            NotifierPhase::Draining
        } else {
            NotifierPhase::Terminal
        }
    }

    /// Marks the Notifier terminal once its sender loop has returned.
    /// Idempotent; called exactly once by [`super::sender::run_sender_loop`]
    /// after its bounded drain completes.
    pub(crate) fn mark_terminal(&self) {
        let mut guard = self.state.write().expect("notifier state lock poisoned");
        guard.terminal = true;
    }

    /// Enqueue a request. Non-blocking fast path when the queue has space;
    /// otherwise waits on a four-way select: queue slot available, done
    /// signal, caller's cancellation, or the enqueue timeout elapsing.
    ///
    /// Success means only that the request is durably in the pipeline's
    /// queue — not that the backend received it. Send-time failures are
    /// reported asynchronously via logs/best-effort fallback, never back to
    /// this caller (error handling design, "Send-time errors").
    ///
    /// Panics inside this method are recovered and reported as
    /// [`NotifyError::Internal`] rather than unwinding into the caller
    /// (spec section 4.A, "A panic inside Send is recovered to return
    /// PanicRecovered"). The protected body spans `.await` points (the
    /// blocked-enqueue wait), which rules out a literal `tokio::spawn` +
    /// `JoinHandle::is_panic` here — unlike `notifier/sender.rs::attempt`,
    /// `self` is a plain `&Notifier`, not an owned `'static` handle a spawned
    /// task could hold. `futures_util::FutureExt::catch_unwind` is the
    /// `'static`-free equivalent: it polls the wrapped future in place and
    /// intercepts a panic at any `.await` point without detaching it onto
    /// another task.
    #[tracing::instrument(skip_all, fields(notifier = %self.id))]
    pub async fn send(&self, task: TaskContext, message: Message) -> Result<(), NotifyError> {
        self.send_inner(task, message, false).await
    }

    /// Internal entry point used by the registry to tag best-effort error
    /// deliveries without exposing the flag on the public `send` signature.
    /// Carries the same panic isolation as `send`, so every caller — the
    /// public `send` and the registry's direct `send_inner` calls alike —
    /// is protected.
    pub(crate) async fn send_inner(
        &self,
        task: TaskContext,
        message: Message,
        error_delivery: bool,
    ) -> Result<(), NotifyError> {
        match AssertUnwindSafe(self.send_impl(task, message, error_delivery)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let payload = panic_message(&panic);
                error!(notifier = %self.id, panic = %payload, "panic recovered in Notifier::send");
                Err(NotifyError::Internal(format!("panic recovered in send: {payload}")))
            }
        }
    }

    async fn send_impl(
        &self,
        task: TaskContext,
        message: Message,
        error_delivery: bool,
    ) -> Result<(), NotifyError> {
        let (queue_tx, closed, mut done_rx) = {
            let guard = self.state.read().expect("notifier state lock poisoned");
            (guard.queue_tx.clone(), guard.closed, guard.done_tx.subscribe())
        };
        if closed {
            return Err(NotifyError::Closed);
        }

        let request = NotificationRequest { task: task.clone(), message, error_delivery };

        match queue_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NotifyError::Closed),
            Err(mpsc::error::TrySendError::Full(request)) => {
                self.send_blocking(queue_tx, request, task, &mut done_rx).await
            }
        }
    }

    async fn send_blocking(
        &self,
        queue_tx: mpsc::Sender<NotificationRequest>,
        request: NotificationRequest,
        task: TaskContext,
        done_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), NotifyError> {
        let enqueue_timeout = self.config.enqueue_timeout;
        tokio::select! {
            res = queue_tx.send(request) => res.map_err(|_| NotifyError::Closed),
            _ = done_rx.recv() => Err(NotifyError::Closed),
            _ = task.cancelled() => Err(NotifyError::ContextCancelled),
            _ = tokio::time::sleep(enqueue_timeout) => Err(NotifyError::QueueFull),
        }
    }
}

/// Extracts a human-readable message from a `catch_unwind` payload, the same
/// best-effort downcast (`&str`, then `String`, then a fixed fallback) used
/// to surface a panic value for logging without assuming every panic in this
/// codebase carries a typed payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendCredentials, CommandConfig};
    use std::sync::Arc;
    use std::time::Instant;

    fn test_config(buffer_size: usize, enqueue_timeout: Duration) -> NotifierConfig {
        NotifierConfig {
            id: NotifierId::from("t1"),
            credentials: BackendCredentials { auth_token: "x".into(), target_chat_id: 1 },
            rate_per_sec: f64::INFINITY,
            burst: u32::MAX,
            buffer_size,
            enqueue_timeout,
            send_timeout: Duration::from_secs(1),
            shutdown_drain_timeout: Duration::from_millis(500),
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            notify_on_failure: true,
            command: CommandConfig::default(),
        }
    }

    // Scenario 1 (happy path, enqueue half): producers never see backpressure
    // when the queue is large enough, and every successful `send` lands
    // exactly once in the queue.
    #[tokio::test]
    async fn concurrent_producers_all_enqueue_successfully() {
        let notifier = Arc::new(Notifier::new(
            NotifierId::from("t1"),
            false,
            test_config(128, Duration::from_secs(1)),
        ));
        let mut rx = notifier.consume().expect("queue receiver");

        let mut handles = Vec::new();
        for producer in 0..10 {
            let notifier = notifier.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    notifier
                        .send(TaskContext::empty(), Message::new(format!("p{producer}-m{i}")))
                        .await
                        .expect("send should succeed");
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut received = 0;
        while received < 100 {
            rx.recv().await.expect("all 100 messages should be queued");
            received += 1;
        }
    }

    // Scenario 2: backpressure timeout.
    #[tokio::test]
    async fn send_times_out_when_queue_full_and_undrained() {
        let notifier = Notifier::new(
            NotifierId::from("t1"),
            false,
            test_config(0, Duration::from_millis(50)),
        );
        // Leave the receiver un-consumed so nothing ever drains the queue.
        let started = Instant::now();
        let result = notifier.send(TaskContext::empty(), Message::new("x")).await;
        let elapsed = started.elapsed();
        assert!(matches!(result, Err(NotifyError::QueueFull)));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(250));
    }

    // Scenario 3: close during a blocked send.
    #[tokio::test]
    async fn close_unblocks_pending_send_quickly() {
        let notifier = Arc::new(Notifier::new(
            NotifierId::from("t1"),
            false,
            test_config(1, Duration::from_secs(5)),
        ));
        // Fill the one slot.
        notifier.send(TaskContext::empty(), Message::new("a")).await.unwrap();

        let blocked = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.send(TaskContext::empty(), Message::new("b")).await })
        };
        // Give the blocked send a chance to register its waiters.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        notifier.close();
        assert!(started.elapsed() < Duration::from_millis(100));

        let result = tokio::time::timeout(Duration::from_millis(100), blocked)
            .await
            .expect("blocked send should resolve quickly after close")
            .unwrap();
        assert!(matches!(result, Err(NotifyError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let notifier = Notifier::new(NotifierId::from("t1"), false, test_config(4, Duration::from_secs(1)));
        notifier.close();
        notifier.close();
        notifier.close();
        assert!(notifier.is_closed());
        let result = notifier.send(TaskContext::empty(), Message::new("x")).await;
        assert!(matches!(result, Err(NotifyError::Closed)));
    }

    #[tokio::test]
    async fn send_after_close_returns_closed_without_touching_queue() {
        let notifier = Notifier::new(NotifierId::from("t1"), false, test_config(4, Duration::from_secs(1)));
        let mut rx = notifier.consume().unwrap();
        notifier.close();
        let result = notifier.send(TaskContext::empty(), Message::new("x")).await;
        assert!(matches!(result, Err(NotifyError::Closed)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn consume_can_only_be_taken_once() {
        let notifier = Notifier::new(NotifierId::from("t1"), false, test_config(4, Duration::from_secs(1)));
        assert!(notifier.consume().is_some());
        assert!(notifier.consume().is_none());
    }

    #[test]
    fn phase_transitions_running_draining_terminal() {
        let notifier = Notifier::new(NotifierId::from("t1"), false, test_config(4, Duration::from_secs(1)));
        assert_eq!(notifier.phase(), NotifierPhase::Running);
        notifier.close();
        assert_eq!(notifier.phase(), NotifierPhase::Draining);
        notifier.mark_terminal();
        assert_eq!(notifier.phase(), NotifierPhase::Terminal);
    }

    // A panic crossing an `.await` point inside `send_inner`'s protected body
    // is recovered rather than unwinding into the caller — the same
    // `catch_unwind` mechanism `send_inner` wraps around `send_impl`.
    #[tokio::test]
    async fn catch_unwind_recovers_a_panic_that_crosses_an_await_point() {
        let result = AssertUnwindSafe(async {
            tokio::task::yield_now().await;
            panic!("boom");
        })
        .catch_unwind()
        .await;
        let payload = result.expect_err("panicking future should be caught, not propagated");
        assert_eq!(panic_message(&payload), "boom");
    }

    #[test]
    fn panic_message_falls_back_for_non_string_payloads() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(42_i32);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
