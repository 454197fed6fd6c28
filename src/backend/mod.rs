//! Component C: the backend adapter trait and outcome classification.
//!
//! `Backend` separates the generic delivery contract the sender loop and
//! dispatcher rely on from any one concrete chat-bot wire protocol. Grounded
//! on `jdertmann-AllrisBot/bot-utils/src/broadcasting.rs`'s `Backend` trait,
//! which has the same shape (a `send` method plus an update stream) for the
//! same reason: one broadcast/dispatch engine serving more than one
//! potential chat backend.

pub mod telegram;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub use telegram::TelegramBackend;

/// Where a message is sent: opaque to the sender loop, meaningful only to
/// the concrete backend (a Telegram chat id, for instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTarget(pub i64);

/// A backend-reported error, carrying enough detail for structured logging
/// without forcing every backend to share one error type.
#[derive(Debug, Clone)]
pub struct BackendError {
    pub message: String,
    pub code: Option<i64>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None }
    }

    pub fn with_code(message: impl Into<String>, code: i64) -> Self {
        Self { message: message.into(), code: Some(code) }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// The outcome of one delivery attempt — the contract the sender loop's
/// retry policy relies on (spec section 4.C).
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Success,
    RateLimited { retry_after: Duration },
    MarkupRejected,
    Terminal(BackendError),
    Transient(BackendError),
}

/// A parsed inbound update from the backend: sender identity, message id
/// (reply target), and textual body. Command parsing happens downstream in
/// [`crate::dispatcher`].
#[derive(Debug, Clone)]
pub struct InboundUpdate {
    pub chat: ChatTarget,
    pub message_id: i64,
    pub text: String,
}

/// The generic chat-bot backend contract consumed by the sender loop
/// (delivery) and the inbound dispatcher (updates).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Deliver one message. `html` requests the backend's markup parsing;
    /// callers must be prepared to retry with `html: false` on
    /// [`SendOutcome::MarkupRejected`].
    async fn send(&self, target: ChatTarget, body: &str, html: bool) -> SendOutcome;

    /// A receive-only stream of parsed inbound updates. The adapter owns one
    /// long-poll/subscription underneath and re-establishes it on transient
    /// transport failures; this stream never terminates on its own under
    /// normal operation (it ends only when the backend is dropped).
    fn updates(&self) -> BoxStream<'static, InboundUpdate>;
}
