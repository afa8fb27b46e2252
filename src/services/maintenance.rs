use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::MaintenanceConfig;
use crate::db::PushTokenRepository;
use crate::error::{AppError, AppResult};
use crate::services::token_validator::TokenValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Full,
    Cleanup,
    Health,
    Analytics,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Full => "full",
            JobKind::Cleanup => "cleanup",
            JobKind::Health => "health",
            JobKind::Analytics => "analytics",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenAnalytics {
    pub total_active: usize,
    pub by_platform: HashMap<String, i64>,
    pub by_user_type: HashMap<String, i64>,
    pub age_buckets: HashMap<String, i64>,
    pub used_last_7_days: i64,
}

/// Periodic token maintenance: cleanup, health refresh, analytics.
///
/// Only one run may be in flight per process; the guard is an in-process
/// flag, so horizontally scaled deployments can still run duplicates (an
/// accepted limitation for a low-frequency job). Phase failures are isolated:
/// a failing phase is recorded and the next phase still runs.
pub struct MaintenanceService {
    pool: SqlitePool,
    validator: Arc<TokenValidator>,
    config: MaintenanceConfig,
    running: AtomicBool,
    history: Mutex<VecDeque<JobReport>>,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
}

impl MaintenanceService {
    pub fn new(pool: SqlitePool, validator: Arc<TokenValidator>, config: MaintenanceConfig) -> Self {
        MaintenanceService {
            pool,
            validator,
            config,
            running: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            last_run_at: Mutex::new(None),
        }
    }

    /// Run the requested job. Refuses to start while another run is in
    /// flight.
    pub async fn run(&self, job: JobKind) -> AppResult<JobReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::ServiceUnavailable(
                "maintenance job already running".to_string(),
            ));
        }

        let started_at = Utc::now();
        let mut phases = Vec::new();

        if matches!(job, JobKind::Full | JobKind::Cleanup) {
            phases.push(self.cleanup_phase().await);
        }
        if matches!(job, JobKind::Full | JobKind::Health) {
            phases.push(self.health_phase().await);
        }
        if matches!(job, JobKind::Full | JobKind::Analytics) {
            phases.push(self.analytics_phase().await);
        }

        let report = JobReport {
            job: job.as_str().to_string(),
            started_at,
            finished_at: Utc::now(),
            phases,
        };

        {
            let mut history = self.history.lock().await;
            history.push_back(report.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }
        *self.last_run_at.lock().await = Some(report.finished_at);

        self.running.store(false, Ordering::SeqCst);
        Ok(report)
    }

    /// Deactivate tokens unused beyond the max age, then hard-delete tokens
    /// that have already been inactive beyond the purge threshold.
    async fn cleanup_phase(&self) -> PhaseReport {
        let now = Utc::now().naive_utc();
        let stale_cutoff = now - Duration::days(self.config.max_token_age_days);
        let purge_cutoff = now - Duration::days(self.config.purge_inactive_after_days);

        let deactivated = match PushTokenRepository::deactivate_unused_since(
            &self.pool,
            stale_cutoff,
            "maintenance: unused beyond max age",
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Cleanup phase failed while deactivating: {:?}", e);
                return PhaseReport {
                    phase: "cleanup".to_string(),
                    success: false,
                    error: Some(e.to_string()),
                    detail: serde_json::json!({}),
                };
            }
        };

        let purged = match PushTokenRepository::delete_inactive_before(&self.pool, purge_cutoff)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Cleanup phase failed while purging: {:?}", e);
                return PhaseReport {
                    phase: "cleanup".to_string(),
                    success: false,
                    error: Some(e.to_string()),
                    detail: serde_json::json!({ "deactivated": deactivated }),
                };
            }
        };

        tracing::info!(
            "Token cleanup: {} deactivated, {} purged",
            deactivated,
            purged
        );
        PhaseReport {
            phase: "cleanup".to_string(),
            success: true,
            error: None,
            detail: serde_json::json!({
                "deactivated": deactivated,
                "purged": purged,
            }),
        }
    }

    /// Recompute validation health scores for all active tokens.
    async fn health_phase(&self) -> PhaseReport {
        let tokens = match PushTokenRepository::list_active(&self.pool).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("Health phase failed to list tokens: {:?}", e);
                return PhaseReport {
                    phase: "health".to_string(),
                    success: false,
                    error: Some(e.to_string()),
                    detail: serde_json::json!({}),
                };
            }
        };

        let mut refreshed = 0u64;
        let mut failures = 0u64;
        for token in &tokens {
            let score = self.validator.health_score(token);
            match PushTokenRepository::update_health_score(&self.pool, &token.id, score).await {
                Ok(()) => refreshed += 1,
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Failed to store health score for token {}: {:?}", token.id, e);
                }
            }
        }

        PhaseReport {
            phase: "health".to_string(),
            success: failures == 0,
            error: (failures > 0).then(|| format!("{} score updates failed", failures)),
            detail: serde_json::json!({
                "scanned": tokens.len(),
                "refreshed": refreshed,
            }),
        }
    }

    /// Aggregate token counts by platform, user type and age bucket plus the
    /// recent usage trend.
    async fn analytics_phase(&self) -> PhaseReport {
        let analytics = match self.collect_analytics().await {
            Ok(analytics) => analytics,
            Err(e) => {
                tracing::error!("Analytics phase failed: {:?}", e);
                return PhaseReport {
                    phase: "analytics".to_string(),
                    success: false,
                    error: Some(e.to_string()),
                    detail: serde_json::json!({}),
                };
            }
        };

        PhaseReport {
            phase: "analytics".to_string(),
            success: true,
            error: None,
            detail: serde_json::to_value(&analytics).unwrap_or_default(),
        }
    }

    async fn collect_analytics(&self) -> AppResult<TokenAnalytics> {
        let by_platform: HashMap<String, i64> =
            PushTokenRepository::count_active_by_platform(&self.pool)
                .await?
                .into_iter()
                .collect();
        let by_user_type: HashMap<String, i64> =
            PushTokenRepository::count_active_by_user_type(&self.pool)
                .await?
                .into_iter()
                .collect();

        let week_ago = Utc::now().naive_utc() - Duration::days(7);
        let used_last_7_days =
            PushTokenRepository::count_used_since(&self.pool, week_ago).await?;

        let tokens = PushTokenRepository::list_active(&self.pool).await?;
        let now = Utc::now().naive_utc();
        let mut age_buckets: HashMap<String, i64> = HashMap::new();
        for token in &tokens {
            let age_days = (now - token.created_at).num_days();
            let bucket = match age_days {
                d if d < 30 => "under_30d",
                d if d < 90 => "30d_to_90d",
                _ => "over_90d",
            };
            *age_buckets.entry(bucket.to_string()).or_insert(0) += 1;
        }

        Ok(TokenAnalytics {
            total_active: tokens.len(),
            by_platform,
            by_user_type,
            age_buckets,
            used_last_7_days,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> MaintenanceStatus {
        MaintenanceStatus {
            enabled: self.config.enabled,
            running: self.is_running(),
            interval_seconds: self.config.interval_seconds,
            last_run_at: *self.last_run_at.lock().await,
            history: self.history.lock().await.iter().cloned().collect(),
            validation_cache_size: self.validator.cache_size(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MaintenanceStatus {
    pub enabled: bool,
    pub running: bool,
    pub interval_seconds: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub history: Vec<JobReport>,
    pub validation_cache_size: usize,
}
