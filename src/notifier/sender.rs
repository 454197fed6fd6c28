//! The sender loop: component B's runtime half. Drains one [`Notifier`]'s
//! queue, rate-limits, dispatches through a [`Backend`], and drives
//! [`RetryPolicy`] until each request reaches a terminal decision.
//!
//! Loop shape and the bounded-drain-then-hard-stop shutdown sequence mirror
//! the teacher's `Listener::run` (`server.rs`): select over the root
//! cancellation and the next unit of work, and on cancellation keep making
//! progress for a bounded grace period before giving up outright. Per-item
//! panic isolation reuses the `tokio::spawn` + `JoinHandle::is_panic`
//! substitute for `catch_unwind` documented in the crate's design notes,
//! since a single attempt crossing an `.await` point rules out a literal
//! `catch_unwind(AssertUnwindSafe(..))`.
//!
//! A request that exhausts every retry attempt is routed back through
//! the registry's default-notifier fallback (`notify_on_failure`), in
//! addition to being logged with notifier/task identifiers and the
//! backend's own code/message.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, ChatTarget, SendOutcome};
use crate::notifier::{Message, NotificationRequest, Notifier, RetryPolicy, TokenBucket};
use crate::registry::NotificationService;
use crate::task_context::TaskContext;

/// Runs until the Notifier's queue is permanently drained: either `root` is
/// cancelled and the bounded drain completes (or times out), or the queue
/// closes with no sender left (which cannot currently happen in normal
/// operation, since the registry holds a sender clone for the Notifier's
/// whole lifetime, but is handled for completeness).
///
/// `target` is the chat/recipient this Notifier's backend delivers to;
/// `backend` is shared across every Notifier that happens to use the same
/// concrete adapter (typically one per Notifier in practice, but nothing
/// here assumes that).
pub async fn run_sender_loop(
    notifier: Arc<Notifier>,
    mut queue_rx: tokio::sync::mpsc::Receiver<NotificationRequest>,
    backend: Arc<dyn Backend>,
    target: ChatTarget,
    root: CancellationToken,
    service: Arc<NotificationService>,
) {
    let config = notifier.config().clone();
    let bucket = TokenBucket::new(config.rate_per_sec, config.burst);

    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            request = queue_rx.recv() => {
                match request {
                    Some(request) => {
                        deliver_one(&bucket, backend.clone(), target, &config, &root, &service, request).await;
                    }
                    None => {
                        debug!(notifier = %notifier.id(), "queue closed with no sender, stopping");
                        return;
                    }
                }
            }
        }
    }

    // Close the notifier's done-signal before draining, not after: per the
    // shutdown control flow, new `Send` calls must start seeing `Closed`
    // as soon as the root cancellation is observed, not only once the
    // bounded drain has finished consuming what was already queued.
    notifier.close();
    drain(&notifier, &mut queue_rx, &bucket, backend.clone(), target, &config, &service).await;
    notifier.mark_terminal();
}

/// After root cancellation, keep delivering already-queued requests for up to
/// `shutdown_drain_timeout` total, then stop regardless of how much is left
/// (spec section 8 scenario 9: a bounded partial drain, not an all-or-nothing
/// flush). Delivery during the drain ignores further cancellation on `root`
/// (it is already cancelled) but still respects each request's own
/// [`crate::task_context::TaskContext`] cancellation and the rate limiter, so
/// a still-cancelled bucket wait can itself eat into the drain budget.
async fn drain(
    notifier: &Notifier,
    queue_rx: &mut tokio::sync::mpsc::Receiver<NotificationRequest>,
    bucket: &TokenBucket,
    backend: Arc<dyn Backend>,
    target: ChatTarget,
    config: &crate::config::NotifierConfig,
    service: &NotificationService,
) {
    let deadline = tokio::time::Instant::now() + config.shutdown_drain_timeout;
    let drain_cancel = CancellationToken::new();
    let mut drained = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let request = tokio::select! {
            _ = tokio::time::sleep(remaining) => break,
            request = queue_rx.recv() => request,
        };
        let Some(request) = request else { break };

        // Re-derive the remaining budget right before the delivery itself:
        // the recv() wait above may have already eaten into it, and the
        // delivery's own token-bucket wait and retries must not be allowed
        // to run past the drain deadline (spec section 4.B.3).
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        if tokio::time::timeout(
            remaining,
            deliver_one(bucket, backend.clone(), target, config, &drain_cancel, service, request),
        )
        .await
        .is_err()
        {
            debug!(notifier = %notifier.id(), "drain deadline elapsed mid-delivery, stopping");
            break;
        }
        drained += 1;
    }

    info!(notifier = %notifier.id(), drained, "shutdown drain complete");
}

/// Deliver one request to completion: rate-limit, attempt, retry per
/// [`RetryPolicy`], respecting both `root` cancellation and the request's own
/// task cancellation. Each individual attempt runs on its own task so a
/// panic inside the backend (or inside markup formatting, etc.) is caught
/// rather than taking the whole sender loop down.
async fn deliver_one(
    bucket: &TokenBucket,
    backend: Arc<dyn Backend>,
    target: ChatTarget,
    config: &crate::config::NotifierConfig,
    root: &CancellationToken,
    service: &NotificationService,
    request: NotificationRequest,
) {
    let NotificationRequest { task, message, error_delivery } = request;
    let mut policy = RetryPolicy::new(config.max_retries, config.retry_delay);
    let mut use_html = true;

    loop {
        if task.is_cancelled() {
            debug!("request cancelled by caller before attempt");
            return;
        }

        tokio::select! {
            _ = root.cancelled() => {},
            _ = task.cancelled() => {
                debug!("request cancelled by caller while waiting for rate limit");
                return;
            }
            result = bucket.acquire(root) => {
                if result.is_err() {
                    // root cancelled mid-wait: fall through and let the drain
                    // loop's own bounded deadline decide whether to keep going.
                }
            }
        }

        policy.record_attempt();
        let outcome =
            attempt(backend.clone(), target, message.body.clone(), use_html, config.send_timeout).await;

        if matches!(outcome, SendOutcome::Success) {
            debug!(error_delivery, attempts = policy.attempts(), "delivered");
            return;
        }
        log_outcome(&config.id, task.task_id(), task.title(), &outcome, policy.attempts());

        match policy.decide(&outcome, use_html) {
            super::retry::RetryDecision::Stop => {
                report_exhausted_failure(service, config, &outcome, policy.attempts(), error_delivery).await;
                return;
            }
            super::retry::RetryDecision::RetryAfter { delay, use_html: next_html } => {
                use_html = next_html;
                if delay.is_zero() {
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = task.cancelled() => {
                        debug!("request cancelled by caller during retry backoff");
                        return;
                    }
                }
            }
        }
    }
}

/// Spec section 7: "when configured, emit a best-effort error notification
/// through the default Notifier" once a request exhausts every attempt.
/// Guarded against the failure being itself an error delivery, so the
/// default notifier's own send failures can never recursively re-trigger
/// this path.
async fn report_exhausted_failure(
    service: &NotificationService,
    config: &crate::config::NotifierConfig,
    outcome: &SendOutcome,
    attempts: u32,
    error_delivery: bool,
) {
    if error_delivery || !config.notify_on_failure {
        return;
    }
    let body = format!("notifier `{}` failed to deliver after {attempts} attempt(s): {outcome:?}", config.id);
    if let Err(err) = service.notify_default_with_error(TaskContext::empty(), Message::new(body)).await {
        warn!(%err, notifier = %config.id, "best-effort failure notification itself failed");
    }
}

/// One delivery attempt, isolated on its own task so a panicking backend
/// implementation cannot unwind into the sender loop — the `tokio::spawn` +
/// `JoinHandle::is_panic` substitute for `catch_unwind` this crate uses
/// throughout for work that crosses an `.await` point. A panic or a deadline
/// overrun both classify as transient: the failure carries no information
/// about server-side state, so conservative retry is the only safe default.
async fn attempt(
    backend: Arc<dyn Backend>,
    target: ChatTarget,
    body: String,
    html: bool,
    send_timeout: Duration,
) -> SendOutcome {
    let task = tokio::spawn(async move { backend.send(target, &body, html).await });
    match tokio::time::timeout(send_timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => {
            error!(panic = join_err.is_panic(), "send attempt task failed");
            SendOutcome::Transient(crate::backend::BackendError::new("send attempt panicked"))
        }
        Err(_) => SendOutcome::Transient(crate::backend::BackendError::new("send attempt timed out")),
    }
}

fn log_outcome(
    notifier_id: &crate::NotifierId,
    task_id: Option<&str>,
    task_title: Option<&str>,
    outcome: &SendOutcome,
    attempts: u32,
) {
    match outcome {
        SendOutcome::Success => {}
        SendOutcome::RateLimited { retry_after } => {
            warn!(notifier = %notifier_id, ?task_id, ?task_title, attempts, ?retry_after, "backend reported rate limiting")
        }
        SendOutcome::MarkupRejected => {
            warn!(notifier = %notifier_id, ?task_id, ?task_title, attempts, "backend rejected markup")
        }
        SendOutcome::Terminal(err) => error!(
            notifier = %notifier_id,
            ?task_id,
            ?task_title,
            attempts,
            backend_code = ?err.code,
            backend_message = %err.message,
            "terminal delivery failure"
        ),
        SendOutcome::Transient(err) => warn!(
            notifier = %notifier_id,
            ?task_id,
            ?task_title,
            attempts,
            backend_code = ?err.code,
            backend_message = %err.message,
            "transient delivery failure"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::config::{BackendCredentials, CommandConfig, NotifierConfig};
    use crate::notifier::Message;
    use crate::task_context::TaskContext;
    use crate::NotifierId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_service() -> Arc<NotificationService> {
        Arc::new(NotificationService::new())
    }

    fn config(rate: f64, burst: u32, drain: Duration) -> NotifierConfig {
        NotifierConfig {
            id: NotifierId::from("t1"),
            credentials: BackendCredentials { auth_token: "x".into(), target_chat_id: 1 },
            rate_per_sec: rate,
            burst,
            buffer_size: 64,
            enqueue_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
            shutdown_drain_timeout: drain,
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            notify_on_failure: true,
            command: CommandConfig::default(),
        }
    }

    // Scenario 1 (happy path, delivery half): unlimited rate, all messages
    // delivered in order with one attempt each.
    #[tokio::test]
    async fn delivers_every_message_at_unlimited_rate() {
        let cfg = config(f64::INFINITY, u32::MAX, Duration::from_secs(5));
        let notifier = Arc::new(Notifier::new(NotifierId::from("t1"), false, cfg));
        let queue_rx = notifier.consume().unwrap();
        let (backend, _updates_tx) = FakeBackend::new();
        let root = CancellationToken::new();

        for i in 0..20 {
            notifier
                .send(TaskContext::empty(), Message::new(format!("m{i}")))
                .await
                .unwrap();
        }
        notifier.close();
        root.cancel();

        run_sender_loop(notifier.clone(), queue_rx, backend.clone(), ChatTarget(1), root, test_service()).await;
        assert_eq!(backend.sent.lock().unwrap().len(), 20);
    }

    // Scenario 9: bounded shutdown drain under a tight deadline delivers a
    // partial prefix, not all or nothing.
    #[tokio::test(start_paused = true)]
    async fn shutdown_drain_delivers_a_bounded_partial_prefix() {
        let cfg = config(10.0, 1, Duration::from_millis(500));
        let notifier = Arc::new(Notifier::new(NotifierId::from("t1"), false, cfg));
        let queue_rx = notifier.consume().unwrap();
        let (backend, _updates_tx) = FakeBackend::new();
        let root = CancellationToken::new();

        for i in 0..20 {
            notifier
                .send(TaskContext::empty(), Message::new(format!("m{i}")))
                .await
                .unwrap();
        }

        let loop_notifier = notifier.clone();
        let loop_backend = backend.clone();
        let handle = tokio::spawn(run_sender_loop(loop_notifier, queue_rx, loop_backend, ChatTarget(1), root.clone(), test_service()));

        root.cancel();
        handle.await.unwrap();

        let delivered = backend.sent.lock().unwrap().len();
        assert!((4..=7).contains(&delivered), "delivered={delivered} out of bounds");
    }

    // Scenario 10: a panicking backend is isolated; both surrounding normal
    // messages still get delivered and the loop itself survives.
    #[tokio::test]
    async fn panicking_attempt_is_isolated_and_loop_continues() {
        let cfg = config(f64::INFINITY, u32::MAX, Duration::from_secs(5));
        let notifier = Arc::new(Notifier::new(NotifierId::from("t1"), false, cfg));
        let queue_rx = notifier.consume().unwrap();
        let (backend, _updates_tx) = FakeBackend::new();

        let call_count = Arc::new(AtomicUsize::new(0));
        let panics_on_second = call_count.clone();
        backend.push_response(move |_body, _html| {
            let n = panics_on_second.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                panic!("simulated backend panic");
            }
            SendOutcome::Success
        });

        let root = CancellationToken::new();
        notifier.send(TaskContext::empty(), Message::new("first")).await.unwrap();
        notifier.send(TaskContext::empty(), Message::new("second")).await.unwrap();
        notifier.send(TaskContext::empty(), Message::new("third")).await.unwrap();
        notifier.close();
        root.cancel();

        run_sender_loop(notifier.clone(), queue_rx, backend.clone(), ChatTarget(1), root, test_service()).await;

        // The panicking attempt runs on its own spawned task (see `attempt`),
        // so it cannot take the sender loop down: both surrounding messages
        // still get delivered, and "second" is retried after the panic is
        // classified as transient, eventually also succeeding once its
        // retry budget runs the backend's script past the single panic.
        let sent = backend.sent.lock().unwrap();
        assert!(sent.iter().any(|(body, _)| body == "first"));
        assert!(sent.iter().any(|(body, _)| body == "third"));
    }

    fn unlimited_config(max_retries: u32, retry_delay: Duration) -> NotifierConfig {
        NotifierConfig {
            id: NotifierId::from("t1"),
            credentials: BackendCredentials { auth_token: "x".into(), target_chat_id: 1 },
            rate_per_sec: f64::INFINITY,
            burst: u32::MAX,
            buffer_size: 16,
            enqueue_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
            shutdown_drain_timeout: Duration::from_secs(1),
            max_retries,
            retry_delay,
            notify_on_failure: true,
            command: CommandConfig::default(),
        }
    }

    // Scenario 4: a terminal 401 produces exactly one send attempt, no
    // retry, exercised end to end through `deliver_one` rather than just
    // `RetryPolicy` in isolation.
    #[tokio::test]
    async fn terminal_failure_produces_exactly_one_attempt_end_to_end() {
        let cfg = unlimited_config(3, Duration::from_millis(10));
        let bucket = TokenBucket::new(cfg.rate_per_sec, cfg.burst);
        let (backend, _updates_tx) = FakeBackend::new();
        backend.always(|| SendOutcome::Terminal(crate::backend::BackendError::with_code("unauthorized", 401)));
        let root = CancellationToken::new();

        let request = NotificationRequest {
            task: TaskContext::empty(),
            message: Message::new("hello"),
            error_delivery: false,
        };
        deliver_one(&bucket, backend.clone(), ChatTarget(1), &cfg, &root, &test_service(), request).await;

        assert_eq!(backend.sent.lock().unwrap().len(), 1);
    }

    // Scenario 5: a transient 500 retries up to `max_retries` attempts with
    // the configured base delay between them.
    #[tokio::test]
    async fn transient_failure_retries_three_times_with_expected_elapsed() {
        let cfg = unlimited_config(3, Duration::from_millis(10));
        let bucket = TokenBucket::new(cfg.rate_per_sec, cfg.burst);
        let (backend, _updates_tx) = FakeBackend::new();
        backend.always(|| SendOutcome::Transient(crate::backend::BackendError::new("internal error")));
        let root = CancellationToken::new();

        let request = NotificationRequest {
            task: TaskContext::empty(),
            message: Message::new("hello"),
            error_delivery: false,
        };
        let started = std::time::Instant::now();
        deliver_one(&bucket, backend.clone(), ChatTarget(1), &cfg, &root, &test_service(), request).await;
        let elapsed = started.elapsed();

        assert_eq!(backend.sent.lock().unwrap().len(), 3);
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(200));
    }

    // Scenario 6: a markup parse rejection retries exactly once in plain
    // text, regardless of the remaining normal attempt budget.
    #[tokio::test]
    async fn markup_rejection_falls_back_to_plain_text_end_to_end() {
        let cfg = unlimited_config(3, Duration::from_millis(10));
        let bucket = TokenBucket::new(cfg.rate_per_sec, cfg.burst);
        let (backend, _updates_tx) = FakeBackend::new();
        backend.push_response(|_body, html| {
            if html {
                SendOutcome::MarkupRejected
            } else {
                SendOutcome::Success
            }
        });
        backend.push_response(|_body, html| {
            assert!(!html, "fallback attempt must request plain text");
            SendOutcome::Success
        });
        let root = CancellationToken::new();

        let request = NotificationRequest {
            task: TaskContext::empty(),
            message: Message::new("<b>hi</b>"),
            error_delivery: false,
        };
        deliver_one(&bucket, backend.clone(), ChatTarget(1), &cfg, &root, &test_service(), request).await;

        let sent = backend.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1, "first attempt should have requested markup");
        assert!(!sent[1].1, "fallback attempt should not request markup");
    }

    // Scenario 7: a 429 with a retry-after hint delays the next attempt by
    // that hint, not by the locally configured base delay.
    #[tokio::test]
    async fn rate_limit_retry_after_hint_delays_second_attempt() {
        let cfg = unlimited_config(3, Duration::from_millis(1));
        let bucket = TokenBucket::new(cfg.rate_per_sec, cfg.burst);
        let (backend, _updates_tx) = FakeBackend::new();
        backend.push_response(|_, _| SendOutcome::RateLimited { retry_after: Duration::from_millis(100) });
        backend.push_response(|_, _| SendOutcome::Success);
        let root = CancellationToken::new();

        let request = NotificationRequest {
            task: TaskContext::empty(),
            message: Message::new("hello"),
            error_delivery: false,
        };
        let started = std::time::Instant::now();
        deliver_one(&bucket, backend.clone(), ChatTarget(1), &cfg, &root, &test_service(), request).await;
        let elapsed = started.elapsed();

        assert_eq!(backend.sent.lock().unwrap().len(), 2);
        assert!(elapsed >= Duration::from_millis(100));
    }
}
