use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::RetryConfig;
use crate::services::composer::NotificationContent;
use crate::services::dispatcher::{Dispatcher, SendOptions};

/// Breaker key for the push provider. There is a single downstream today,
/// but breaker state is keyed so additional destinations slot in.
pub const PUSH_GATEWAY_DESTINATION: &str = "push_gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    None,
    Full,
    Equal,
    Decorrelated,
}

impl JitterStrategy {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "none" => JitterStrategy::None,
            "full" => JitterStrategy::Full,
            "equal" => JitterStrategy::Equal,
            "decorrelated" => JitterStrategy::Decorrelated,
            other => {
                tracing::warn!("Unknown jitter strategy {:?}, using full", other);
                JitterStrategy::Full
            }
        }
    }
}

/// Runtime-adjustable retry and breaker settings (PUT /api/retry).
#[derive(Debug, Clone, Serialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: JitterStrategy,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_seconds: u64,
}

impl From<&RetryConfig> for RetrySettings {
    fn from(config: &RetryConfig) -> Self {
        RetrySettings {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter: JitterStrategy::parse(&config.jitter),
            breaker_failure_threshold: config.breaker_failure_threshold,
            breaker_reset_seconds: config.breaker_reset_seconds,
        }
    }
}

/// Partial update applied over the current settings.
#[derive(Debug, Default, Deserialize)]
pub struct RetrySettingsUpdate {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter: Option<JitterStrategy>,
    pub breaker_failure_threshold: Option<u32>,
    pub breaker_reset_seconds: Option<u64>,
}

/// A delivery that failed and is waiting for its next attempt.
#[derive(Debug, Clone, Serialize)]
pub struct FailedNotification {
    pub id: String,
    pub user_ids: Vec<String>,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub options: SendOptions,
    pub last_error: Option<String>,
    /// Retry attempts already made (the original send is not counted).
    pub attempt: u32,
    /// Delay used for the current schedule; feeds decorrelated jitter.
    pub last_delay_ms: Option<u64>,
    pub next_retry_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub destination: String,
    pub consecutive_failures: u32,
    pub open: bool,
    pub open_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize)]
pub struct ProcessSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub short_circuited: usize,
    pub exhausted: usize,
}

/// Compute the backoff delay for a retry attempt (1-based), applying the
/// configured jitter strategy and the `max_delay_ms` bound.
pub fn backoff_delay_ms(
    settings: &RetrySettings,
    attempt: u32,
    previous_delay_ms: Option<u64>,
) -> u64 {
    let exponent = attempt.saturating_sub(1).min(31);
    let raw = settings
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(settings.max_delay_ms);

    let mut rng = rand::thread_rng();
    let jittered = match settings.jitter {
        JitterStrategy::None => raw,
        JitterStrategy::Full => rng.gen_range(0..=raw),
        JitterStrategy::Equal => raw / 2 + rng.gen_range(0..=raw / 2),
        JitterStrategy::Decorrelated => {
            let previous = previous_delay_ms.unwrap_or(settings.base_delay_ms);
            let upper = previous
                .saturating_mul(3)
                .max(settings.base_delay_ms + 1)
                .min(settings.max_delay_ms.max(settings.base_delay_ms + 1));
            rng.gen_range(settings.base_delay_ms..=upper)
        }
    };

    jittered.min(settings.max_delay_ms)
}

/// In-memory retry queue with exponential backoff and a per-destination
/// circuit breaker. Queue state is process-local: a restart drops pending
/// retries, which matches the at-most-best-effort delivery contract.
pub struct RetryManager {
    settings: RwLock<RetrySettings>,
    queue: Mutex<HashMap<String, FailedNotification>>,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl RetryManager {
    pub fn new(config: &RetryConfig) -> Self {
        RetryManager {
            settings: RwLock::new(RetrySettings::from(config)),
            queue: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn settings(&self) -> RetrySettings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, update: RetrySettingsUpdate) -> RetrySettings {
        let mut settings = self.settings.write().await;
        if let Some(v) = update.max_attempts {
            settings.max_attempts = v.max(1);
        }
        if let Some(v) = update.base_delay_ms {
            settings.base_delay_ms = v.max(1);
        }
        if let Some(v) = update.max_delay_ms {
            settings.max_delay_ms = v.max(settings.base_delay_ms);
        }
        if let Some(v) = update.jitter {
            settings.jitter = v;
        }
        if let Some(v) = update.breaker_failure_threshold {
            settings.breaker_failure_threshold = v.max(1);
        }
        if let Some(v) = update.breaker_reset_seconds {
            settings.breaker_reset_seconds = v;
        }
        settings.clone()
    }

    /// Queue a failed delivery for retry. The first retry is scheduled with
    /// attempt-1 backoff from now.
    pub async fn enqueue(
        &self,
        notification_id: &str,
        user_ids: Vec<String>,
        content: &NotificationContent,
        options: &SendOptions,
        error: Option<String>,
    ) {
        let settings = self.settings().await;
        let delay = backoff_delay_ms(&settings, 1, None);

        let failed = FailedNotification {
            id: notification_id.to_string(),
            user_ids,
            title: content.title.clone(),
            body: content.body.clone(),
            data: content.data.clone(),
            options: options.clone(),
            last_error: error,
            attempt: 0,
            last_delay_ms: Some(delay),
            next_retry_at: Utc::now() + chrono::Duration::milliseconds(delay as i64),
        };

        tracing::info!(
            "Queued notification {} for retry in {}ms ({} recipients)",
            failed.id,
            delay,
            failed.user_ids.len()
        );
        self.queue.lock().await.insert(failed.id.clone(), failed);
    }

    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn get(&self, notification_id: &str) -> Option<FailedNotification> {
        self.queue.lock().await.get(notification_id).cloned()
    }

    pub async fn list(&self) -> Vec<FailedNotification> {
        let mut items: Vec<FailedNotification> =
            self.queue.lock().await.values().cloned().collect();
        items.sort_by_key(|item| item.next_retry_at);
        items
    }

    /// Remove retries: one notification's, or all of them. Returns the
    /// number of entries removed.
    pub async fn clear(&self, notification_id: Option<&str>) -> usize {
        let mut queue = self.queue.lock().await;
        match notification_id {
            Some(id) => {
                if queue.remove(id).is_some() {
                    1
                } else {
                    0
                }
            }
            None => {
                let removed = queue.len();
                queue.clear();
                removed
            }
        }
    }

    /// Make a queued notification due immediately. Returns false when the
    /// id is not queued.
    pub async fn force_retry(&self, notification_id: &str) -> bool {
        let mut queue = self.queue.lock().await;
        match queue.get_mut(notification_id) {
            Some(item) => {
                item.next_retry_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn breaker_status(&self) -> Vec<BreakerStatus> {
        let now = Utc::now();
        self.breakers
            .lock()
            .await
            .iter()
            .map(|(destination, state)| BreakerStatus {
                destination: destination.clone(),
                consecutive_failures: state.consecutive_failures,
                open: state.open_until.map(|until| until > now).unwrap_or(false),
                open_until: state.open_until,
            })
            .collect()
    }

    pub async fn breaker_is_open(&self, destination: &str) -> bool {
        let now = Utc::now();
        self.breakers
            .lock()
            .await
            .get(destination)
            .and_then(|state| state.open_until)
            .map(|until| until > now)
            .unwrap_or(false)
    }

    pub async fn record_success(&self, destination: &str) {
        let mut breakers = self.breakers.lock().await;
        if let Some(state) = breakers.get_mut(destination) {
            state.consecutive_failures = 0;
            state.open_until = None;
        }
    }

    pub async fn record_failure(&self, destination: &str) {
        let settings = self.settings().await;
        let mut breakers = self.breakers.lock().await;
        let state = breakers.entry(destination.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= settings.breaker_failure_threshold {
            let until = Utc::now() + chrono::Duration::seconds(settings.breaker_reset_seconds as i64);
            if state.open_until.map(|prev| until > prev).unwrap_or(true) {
                state.open_until = Some(until);
            }
            tracing::warn!(
                "Circuit for {} opened after {} consecutive failures",
                destination,
                state.consecutive_failures
            );
        }
    }

    /// Attempt every due retry once. Called by the background worker and by
    /// the `process_queue` operator action.
    pub async fn process_due(&self, dispatcher: &Dispatcher) -> ProcessSummary {
        let now = Utc::now();
        let due: Vec<FailedNotification> = {
            let mut queue = self.queue.lock().await;
            let ids: Vec<String> = queue
                .values()
                .filter(|item| item.next_retry_at <= now)
                .map(|item| item.id.clone())
                .collect();
            ids.iter().filter_map(|id| queue.remove(id)).collect()
        };

        let mut summary = ProcessSummary {
            processed: due.len(),
            ..Default::default()
        };

        for mut item in due {
            item.attempt += 1;

            if self.breaker_is_open(PUSH_GATEWAY_DESTINATION).await {
                item.last_error = Some("circuit open: delivery short-circuited".to_string());
                summary.short_circuited += 1;
                self.reschedule_or_drop(item, &mut summary).await;
                continue;
            }

            let content = NotificationContent {
                title: item.title.clone(),
                body: item.body.clone(),
                data: item.data.clone(),
            };

            let outcome = dispatcher
                .send_to_users(&item.user_ids, &content, &item.options)
                .await;

            if outcome.success {
                self.record_success(PUSH_GATEWAY_DESTINATION).await;
                summary.succeeded += 1;
                tracing::info!(
                    "Retry attempt {} for notification {} succeeded ({} sent)",
                    item.attempt,
                    item.id,
                    outcome.messages_sent
                );
            } else {
                self.record_failure(PUSH_GATEWAY_DESTINATION).await;
                item.last_error = outcome.errors.into_iter().next();
                summary.failed += 1;
                self.reschedule_or_drop(item, &mut summary).await;
            }
        }

        summary
    }

    async fn reschedule_or_drop(&self, mut item: FailedNotification, summary: &mut ProcessSummary) {
        let settings = self.settings().await;

        if item.attempt >= settings.max_attempts {
            tracing::warn!(
                "Notification {} exhausted {} retry attempts, dropping (last error: {})",
                item.id,
                item.attempt,
                item.last_error.as_deref().unwrap_or("unknown")
            );
            summary.exhausted += 1;
            return;
        }

        let delay = backoff_delay_ms(&settings, item.attempt + 1, item.last_delay_ms);
        item.last_delay_ms = Some(delay);
        item.next_retry_at = Utc::now() + chrono::Duration::milliseconds(delay as i64);

        tracing::info!(
            "Notification {} rescheduled, attempt {} in {}ms",
            item.id,
            item.attempt + 1,
            delay
        );
        self.queue.lock().await.insert(item.id.clone(), item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: "none".to_string(),
            poll_interval_seconds: 5,
            breaker_failure_threshold: 3,
            breaker_reset_seconds: 60,
        }
    }

    fn settings_with(jitter: JitterStrategy) -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter,
            breaker_failure_threshold: 3,
            breaker_reset_seconds: 60,
        }
    }

    fn content() -> NotificationContent {
        NotificationContent {
            title: "Project Update".to_string(),
            body: "Ana completed Phase 1".to_string(),
            data: serde_json::json!({"category": "project"}),
        }
    }

    #[test]
    fn backoff_without_jitter_doubles_and_caps() {
        let settings = settings_with(JitterStrategy::None);
        assert_eq!(backoff_delay_ms(&settings, 1, None), 1000);
        assert_eq!(backoff_delay_ms(&settings, 2, None), 2000);
        assert_eq!(backoff_delay_ms(&settings, 3, None), 4000);
        // 1000 * 2^9 = 512000, capped.
        assert_eq!(backoff_delay_ms(&settings, 10, None), 60_000);
    }

    #[test]
    fn full_jitter_stays_within_bounds() {
        let settings = settings_with(JitterStrategy::Full);
        for _ in 0..50 {
            let delay = backoff_delay_ms(&settings, 3, None);
            assert!(delay <= 4000);
        }
    }

    #[test]
    fn equal_jitter_keeps_at_least_half() {
        let settings = settings_with(JitterStrategy::Equal);
        for _ in 0..50 {
            let delay = backoff_delay_ms(&settings, 3, None);
            assert!((2000..=4000).contains(&delay));
        }
    }

    #[test]
    fn decorrelated_jitter_bounded_by_max_delay() {
        let settings = settings_with(JitterStrategy::Decorrelated);
        let mut previous = None;
        for _ in 0..50 {
            let delay = backoff_delay_ms(&settings, 2, previous);
            assert!(delay >= settings.base_delay_ms);
            assert!(delay <= settings.max_delay_ms);
            previous = Some(delay);
        }
    }

    #[tokio::test]
    async fn enqueue_and_clear() {
        let manager = RetryManager::new(&config());
        manager
            .enqueue("n1", vec!["u1".to_string()], &content(), &SendOptions::default(), None)
            .await;
        manager
            .enqueue("n2", vec!["u2".to_string()], &content(), &SendOptions::default(), None)
            .await;
        assert_eq!(manager.queue_size().await, 2);

        assert_eq!(manager.clear(Some("n1")).await, 1);
        assert_eq!(manager.clear(Some("n1")).await, 0);
        assert_eq!(manager.clear(None).await, 1);
        assert_eq!(manager.queue_size().await, 0);
    }

    #[tokio::test]
    async fn force_retry_makes_item_due() {
        let manager = RetryManager::new(&config());
        manager
            .enqueue("n1", vec!["u1".to_string()], &content(), &SendOptions::default(), None)
            .await;

        let before = manager.get("n1").await.unwrap();
        assert!(before.next_retry_at > Utc::now());

        assert!(manager.force_retry("n1").await);
        let after = manager.get("n1").await.unwrap();
        assert!(after.next_retry_at <= Utc::now());

        assert!(!manager.force_retry("missing").await);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_success_resets() {
        let manager = RetryManager::new(&config());
        let dest = PUSH_GATEWAY_DESTINATION;

        manager.record_failure(dest).await;
        manager.record_failure(dest).await;
        assert!(!manager.breaker_is_open(dest).await);

        manager.record_failure(dest).await;
        assert!(manager.breaker_is_open(dest).await);

        manager.record_success(dest).await;
        assert!(!manager.breaker_is_open(dest).await);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_due_items() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        // No gateway call should happen, so a panicking gateway proves the
        // short-circuit.
        struct PanicGateway;
        #[async_trait::async_trait]
        impl crate::services::dispatcher::PushGateway for PanicGateway {
            async fn send_batch(
                &self,
                _messages: &[crate::services::dispatcher::PushMessage],
            ) -> crate::error::AppResult<Vec<crate::services::dispatcher::PushTicket>> {
                panic!("gateway must not be called while the circuit is open");
            }
        }

        let store = crate::services::token_store::TokenStore::new(
            pool,
            std::sync::Arc::new(crate::services::token_validator::TokenValidator::new()),
        );
        let dispatcher = Dispatcher::new(
            store,
            std::sync::Arc::new(PanicGateway),
            &crate::config::PushGatewayConfig {
                url: "http://localhost/send".to_string(),
                access_token: None,
                batch_size: 100,
                batch_delay_ms: 0,
                request_timeout_seconds: 10,
            },
        );

        let manager = RetryManager::new(&config());
        for _ in 0..3 {
            manager.record_failure(PUSH_GATEWAY_DESTINATION).await;
        }
        assert!(manager.breaker_is_open(PUSH_GATEWAY_DESTINATION).await);

        manager
            .enqueue("n1", vec!["u1".to_string()], &content(), &SendOptions::default(), None)
            .await;
        manager.force_retry("n1").await;

        let summary = manager.process_due(&dispatcher).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.short_circuited, 1);

        // Rescheduled, not dropped: only one attempt was consumed.
        let item = manager.get("n1").await.unwrap();
        assert_eq!(item.attempt, 1);
        assert!(item
            .last_error
            .as_deref()
            .unwrap()
            .contains("circuit open"));
    }

    #[tokio::test]
    async fn exhausted_items_are_dropped() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        struct FailingGateway;
        #[async_trait::async_trait]
        impl crate::services::dispatcher::PushGateway for FailingGateway {
            async fn send_batch(
                &self,
                _messages: &[crate::services::dispatcher::PushMessage],
            ) -> crate::error::AppResult<Vec<crate::services::dispatcher::PushTicket>> {
                Err(crate::error::AppError::DeliveryFailure(
                    "gateway down".to_string(),
                ))
            }
        }

        let store = crate::services::token_store::TokenStore::new(
            pool.clone(),
            std::sync::Arc::new(crate::services::token_validator::TokenValidator::new()),
        );
        let dispatcher = Dispatcher::new(
            store,
            std::sync::Arc::new(FailingGateway),
            &crate::config::PushGatewayConfig {
                url: "http://localhost/send".to_string(),
                access_token: None,
                batch_size: 100,
                batch_delay_ms: 0,
                request_timeout_seconds: 10,
            },
        );

        crate::db::PushTokenRepository::register(
            &pool,
            crate::db::models::RegisterPushToken {
                user_id: "u1".to_string(),
                user_type: "staff".to_string(),
                token: "ExpoPushToken[abc123def456]".to_string(),
                platform: "android".to_string(),
                device_id: None,
                device_name: None,
                app_version: None,
            },
        )
        .await
        .unwrap();

        // High breaker threshold so every attempt reaches the gateway.
        let mut cfg = config();
        cfg.breaker_failure_threshold = 100;
        let manager = RetryManager::new(&cfg);

        manager
            .enqueue("n1", vec!["u1".to_string()], &content(), &SendOptions::default(), None)
            .await;

        for _ in 0..3 {
            manager.force_retry("n1").await;
            manager.process_due(&dispatcher).await;
        }

        // max_attempts = 3: after three failed attempts the item is gone.
        assert!(manager.get("n1").await.is_none());
        assert_eq!(manager.queue_size().await, 0);
    }
}
