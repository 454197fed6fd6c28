//! The concrete chat-bot backend: Telegram, via the `frankenstein` Bot API
//! client (`client-reqwest` feature). This is the only module in the crate
//! that speaks the wire protocol named in spec section 6 — `sendMessage`
//! with `parse_mode`/`reply_parameters`, and long-polling `getUpdates`.
//!
//! Error classification mirrors
//! `jdertmann-AllrisBot/bot-utils/src/broadcasting.rs::handle_response`: a
//! 401/404 is terminal (bad or revoked token), a `retry_after` hint means
//! rate-limited, `"can't parse entities"` means the markup was rejected, and
//! everything else observed from the API is transient.

use std::time::Duration;

use async_trait::async_trait;
use frankenstein::client_reqwest::Bot;
use frankenstein::methods::{GetUpdatesParams, SendMessageParams};
use frankenstein::response::{ErrorResponse, ResponseParameters};
use frankenstein::types::{AllowedUpdate, ChatId, ParseMode};
use frankenstein::updates::UpdateContent;
use frankenstein::{AsyncTelegramApi, Error as TgError};
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{Backend, BackendError, ChatTarget, InboundUpdate, SendOutcome};

/// Substrings Telegram uses in its `SimpleError` error responses to report a
/// rejected markup parse. Matched case-insensitively against the
/// description, same check `AllrisBot` performs against its own
/// `TELEGRAM_ERRORS` list.
const MARKUP_PARSE_ERROR_MARKERS: [&str; 2] = ["can't parse entities", "can't find end of"];

const LONG_POLL_TIMEOUT_SECS: u64 = 30;
const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A Telegram-backed [`Backend`]. Owns one `reqwest`-based Bot API client and
/// spawns its own long-poll task on the first call to [`Backend::updates`].
pub struct TelegramBackend {
    bot: Bot,
}

impl TelegramBackend {
    pub fn new(auth_token: &str) -> Self {
        Self { bot: Bot::new(auth_token) }
    }

    fn classify_error(err: TgError) -> SendOutcome {
        match err {
            TgError::Api(ErrorResponse { error_code, description, parameters, .. }) => {
                if let Some(ResponseParameters { retry_after: Some(secs), .. }) = parameters {
                    return SendOutcome::RateLimited { retry_after: Duration::from_secs(secs.max(0) as u64) };
                }
                let lower = description.to_lowercase();
                if MARKUP_PARSE_ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
                    return SendOutcome::MarkupRejected;
                }
                match error_code {
                    401 | 403 | 404 => {
                        SendOutcome::Terminal(BackendError::with_code(description, error_code))
                    }
                    code if (400..500).contains(&code) => {
                        SendOutcome::Terminal(BackendError::with_code(description, error_code))
                    }
                    code => SendOutcome::Transient(BackendError::with_code(description, code)),
                }
            }
            other => SendOutcome::Transient(BackendError::new(other.to_string())),
        }
    }
}

#[async_trait]
impl Backend for TelegramBackend {
    #[tracing::instrument(skip(self, body), fields(chat = target.0, html))]
    async fn send(&self, target: ChatTarget, body: &str, html: bool) -> SendOutcome {
        let mut params = SendMessageParams::builder()
            .chat_id(ChatId::Integer(target.0))
            .text(body.to_string())
            .build();
        if html {
            params.parse_mode = Some(ParseMode::Html);
        }

        match self.bot.send_message(&params).await {
            Ok(_) => SendOutcome::Success,
            Err(err) => {
                let outcome = Self::classify_error(err);
                debug!(?outcome, "send_message returned non-success outcome");
                outcome
            }
        }
    }

    fn updates(&self) -> BoxStream<'static, InboundUpdate> {
        let (tx, rx) = mpsc::channel(64);
        let bot = self.bot.clone();
        tokio::spawn(long_poll_loop(bot, tx));
        Box::pin(ReceiverStream::new(rx))
    }
}

/// Runs `getUpdates` long-polling forever, re-establishing on transient
/// transport failure with a capped exponential backoff — same
/// doubling-with-cap shape as the teacher's `Listener::accept` backoff
/// (`server.rs`), with bounds suited to a long-poll transport instead of a
/// TCP accept loop.
async fn long_poll_loop(bot: Bot, tx: mpsc::Sender<InboundUpdate>) {
    let mut offset: Option<i64> = None;
    let mut backoff = RECONNECT_BACKOFF_BASE;

    loop {
        let mut builder = GetUpdatesParams::builder()
            .timeout(LONG_POLL_TIMEOUT_SECS as u32)
            .allowed_updates(vec![AllowedUpdate::Message]);
        if let Some(offset) = offset {
            builder = builder.offset(offset);
        }
        let params = builder.build();

        match bot.get_updates(&params).await {
            Ok(response) => {
                backoff = RECONNECT_BACKOFF_BASE;
                for update in response.result {
                    offset = Some(update.update_id as i64 + 1);
                    if let UpdateContent::Message(message) = update.content {
                        let Some(text) = message.text else { continue };
                        let inbound = InboundUpdate {
                            chat: ChatTarget(message.chat.id),
                            message_id: message.message_id as i64,
                            text,
                        };
                        if tx.send(inbound).await.is_err() {
                            debug!("updates receiver dropped, stopping long poll");
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "getUpdates failed, retrying after backoff");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
            }
        }
    }
}

impl std::fmt::Debug for TelegramBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramBackend").finish_non_exhaustive()
    }
}
