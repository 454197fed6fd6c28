//! Configuration types the core consumes.
//!
//! Schema validation, cron-expression validation, and CORS/TLS checks are the
//! loading collaborator's responsibility (spec section 1, "out of scope").
//! These types only describe the shape the core assumes: referential
//! integrity (the default id exists, ids are unique) is assumed to already
//! hold by the time [`ServiceConfig`] reaches
//! [`NotificationService::start`](crate::registry::NotificationService::start).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::NotifierId;

/// Top-level configuration consumed by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Notifier that receives best-effort error deliveries and unknown-
    /// recipient fallbacks. Must match the `id` of one entry in `notifiers`.
    pub default_notifier_id: NotifierId,
    pub notifiers: Vec<NotifierConfig>,
}

/// Per-backend credentials and tuning, one entry per Notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub id: NotifierId,
    pub credentials: BackendCredentials,

    /// Token-bucket refill rate, tokens/second. `f64::INFINITY` disables
    /// rate limiting entirely (used by the happy-path test scenario).
    #[serde(default = "NotifierConfig::default_rate")]
    pub rate_per_sec: f64,
    /// Token-bucket burst capacity.
    #[serde(default = "NotifierConfig::default_burst")]
    pub burst: u32,
    /// Bounded queue capacity between `Send` and the sender loop.
    #[serde(default = "NotifierConfig::default_buffer_size")]
    pub buffer_size: usize,

    /// How long a blocked `Send` waits for queue space before returning
    /// `QueueFull`.
    #[serde(with = "duration_ms", default = "NotifierConfig::default_enqueue_timeout")]
    pub enqueue_timeout: Duration,
    /// Per-attempt deadline for a backend send.
    #[serde(with = "duration_ms", default = "NotifierConfig::default_send_timeout")]
    pub send_timeout: Duration,
    /// Bound on the shutdown drain.
    #[serde(with = "duration_ms", default = "NotifierConfig::default_shutdown_drain_timeout")]
    pub shutdown_drain_timeout: Duration,

    /// Max send attempts per request (not counting the optional
    /// markup-fallback retry).
    #[serde(default = "NotifierConfig::default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retry attempts, overridden by a backend-supplied
    /// retry-after hint when present.
    #[serde(with = "duration_ms", default = "NotifierConfig::default_retry_delay")]
    pub retry_delay: Duration,

    /// When a request exhausts every attempt (or is classified terminal
    /// outright), emit a best-effort error notification through the
    /// service's default Notifier in addition to logging the failure (spec
    /// section 7: "when configured, emit a best-effort error notification
    /// through the default Notifier"). Defaults to on, since surfacing
    /// delivery failures is the point of running a notification service in
    /// the first place.
    #[serde(default = "NotifierConfig::default_notify_on_failure")]
    pub notify_on_failure: bool,

    pub command: CommandConfig,
}

impl NotifierConfig {
    fn default_rate() -> f64 {
        30.0
    }
    fn default_burst() -> u32 {
        5
    }
    fn default_buffer_size() -> usize {
        256
    }
    fn default_enqueue_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_send_timeout() -> Duration {
        Duration::from_secs(10)
    }
    fn default_shutdown_drain_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_retry_delay() -> Duration {
        Duration::from_millis(500)
    }
    fn default_notify_on_failure() -> bool {
        true
    }
}

/// Credentials for one chat-bot backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCredentials {
    pub auth_token: String,
    pub target_chat_id: i64,
}

/// Inbound command dispatcher tuning (component D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Hard cap on in-flight inbound commands for this Notifier.
    #[serde(default = "CommandConfig::default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-command deadline, guarding against a misbehaving executor.
    #[serde(with = "duration_ms", default = "CommandConfig::default_command_timeout")]
    pub command_timeout: Duration,
}

impl CommandConfig {
    fn default_max_concurrent() -> usize {
        8
    }
    fn default_command_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_concurrent: Self::default_max_concurrent(),
            command_timeout: Self::default_command_timeout(),
        }
    }
}

/// Serializes `Duration` as whole milliseconds, since most config sources
/// (JSON/TOML/env) have no native duration type.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
