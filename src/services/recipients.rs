use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::config::ResolverConfig;
use crate::db::{MemberRepository, ProjectRepository};
use crate::error::{AppError, AppResult};

/// A resolved user eligible to receive a notification. Ephemeral: computed
/// per resolution request and cached, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recipient {
    pub user_id: String,
    pub user_type: String,
    pub client_id: String,
    pub full_name: String,
    pub email: String,
    pub role: Option<String>,
    pub is_active: bool,
}

/// Which stage produced the recipient set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionSource {
    Cache,
    Primary,
    Fallback,
    None,
}

/// Outcome of one resolution request. Stage failures are accumulated in
/// `errors` instead of raised so callers degrade to partial results.
#[derive(Debug)]
pub struct ResolutionOutcome {
    pub recipients: Vec<Recipient>,
    pub source: ResolutionSource,
    pub errors: Vec<String>,
    pub deduplication_count: usize,
}

struct CacheEntry {
    recipients: Vec<Recipient>,
    deduplication_count: usize,
    cached_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

fn cache_key(client_id: &str, project_id: Option<&str>) -> String {
    match project_id {
        Some(project_id) => format!("{}:{}", client_id, project_id),
        None => client_id.to_string(),
    }
}

/// Resolves which users should be notified for a client (and optionally a
/// project), with a cache -> primary -> fallback strategy.
///
/// The resolution cache is owned by this struct and injected through
/// `AppState`; entries are lazily evicted on lookup once their TTL elapses.
pub struct RecipientResolver {
    pool: SqlitePool,
    config: ResolverConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl RecipientResolver {
    pub fn new(pool: SqlitePool, config: ResolverConfig) -> Self {
        RecipientResolver {
            pool,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve recipients for `client_id`, optionally scoped to a project.
    ///
    /// Stages: cache check (unless bypassed), then the membership lookup,
    /// then the project-assignment fallback when the primary stage errors or
    /// comes back empty. Every stage failure lands in `errors`; the method
    /// itself never fails.
    pub async fn resolve(
        &self,
        client_id: &str,
        project_id: Option<&str>,
        skip_cache: bool,
    ) -> ResolutionOutcome {
        let key = cache_key(client_id, project_id);

        if !skip_cache {
            if let Some((recipients, dedup)) = self.cache_lookup(&key).await {
                return ResolutionOutcome {
                    recipients,
                    source: ResolutionSource::Cache,
                    errors: Vec::new(),
                    deduplication_count: dedup,
                };
            }
        }

        let mut errors: Vec<String> = Vec::new();

        match self.resolve_primary(client_id).await {
            Ok((recipients, dedup)) if !recipients.is_empty() => {
                self.cache_store(
                    &key,
                    recipients.clone(),
                    dedup,
                    Duration::from_secs(self.config.primary_cache_ttl_seconds),
                )
                .await;
                return ResolutionOutcome {
                    recipients,
                    source: ResolutionSource::Primary,
                    errors,
                    deduplication_count: dedup,
                };
            }
            Ok(_) => {
                tracing::debug!(
                    "Primary resolution for client {} returned no active recipients",
                    client_id
                );
            }
            Err(e) => {
                tracing::warn!("Primary resolution failed for client {}: {}", client_id, e);
                errors.push(format!("primary: {}", e));
            }
        }

        let Some(project_id) = project_id else {
            return ResolutionOutcome {
                recipients: Vec::new(),
                source: ResolutionSource::None,
                errors,
                deduplication_count: 0,
            };
        };

        match self.resolve_fallback(client_id, project_id).await {
            Ok(recipients) => {
                self.cache_store(
                    &key,
                    recipients.clone(),
                    0,
                    Duration::from_secs(self.config.fallback_cache_ttl_seconds),
                )
                .await;
                ResolutionOutcome {
                    recipients,
                    source: ResolutionSource::Fallback,
                    errors,
                    deduplication_count: 0,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Fallback resolution failed for project {}: {}",
                    project_id,
                    e
                );
                errors.push(format!("fallback: {}", e));
                ResolutionOutcome {
                    recipients: Vec::new(),
                    source: ResolutionSource::None,
                    errors,
                    deduplication_count: 0,
                }
            }
        }
    }

    /// Membership lookup: admins and staff of the client, queried
    /// independently and merged by user id. Admins are processed first, so a
    /// duplicate id collapses onto the admin entry; the number of collapsed
    /// entries is returned alongside the merged active list.
    async fn resolve_primary(&self, client_id: &str) -> AppResult<(Vec<Recipient>, usize)> {
        let deadline = Duration::from_secs(self.config.primary_timeout_seconds);

        let lookups = async {
            tokio::try_join!(
                MemberRepository::admins_for_client(&self.pool, client_id),
                MemberRepository::staff_for_client(&self.pool, client_id),
            )
        };

        let (admins, staff) = tokio::time::timeout(deadline, lookups)
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "primary recipient lookup exceeded {}s",
                    deadline.as_secs()
                ))
            })?
            .map_err(|e| AppError::RecipientResolution(e.to_string()))?;

        let total = admins.len() + staff.len();
        let mut merged: Vec<Recipient> = Vec::with_capacity(total);
        let mut seen: HashSet<String> = HashSet::with_capacity(total);

        for admin in admins {
            if seen.insert(admin.id.clone()) {
                merged.push(Recipient {
                    user_id: admin.id,
                    user_type: "admin".to_string(),
                    client_id: admin.client_id,
                    full_name: admin.full_name,
                    email: admin.email,
                    role: admin.role,
                    is_active: admin.is_active,
                });
            }
        }

        for member in staff {
            if seen.insert(member.id.clone()) {
                merged.push(Recipient {
                    user_id: member.id,
                    user_type: "staff".to_string(),
                    client_id: client_id.to_string(),
                    full_name: member.full_name,
                    email: member.email,
                    role: member.role,
                    is_active: member.is_active,
                });
            }
        }

        let deduplication_count = total - merged.len();
        let active: Vec<Recipient> = merged.into_iter().filter(|r| r.is_active).collect();

        Ok((active, deduplication_count))
    }

    /// Project-assignment fallback. The denormalized subrecords carry no
    /// email and no activity flag, so recipients come back with an empty
    /// email and `is_active` assumed true.
    async fn resolve_fallback(&self, client_id: &str, project_id: &str) -> AppResult<Vec<Recipient>> {
        let deadline = Duration::from_secs(self.config.fallback_timeout_seconds);

        let assigned = tokio::time::timeout(
            deadline,
            ProjectRepository::assigned_staff(&self.pool, project_id),
        )
        .await
        .map_err(|_| {
            AppError::Timeout(format!(
                "fallback recipient lookup exceeded {}s",
                deadline.as_secs()
            ))
        })?
        .map_err(|e| AppError::RecipientResolution(e.to_string()))?;

        let mut recipients: Vec<Recipient> = Vec::with_capacity(assigned.len());
        let mut seen: HashSet<String> = HashSet::new();

        for assignment in assigned {
            if !seen.insert(assignment.staff_id.clone()) {
                continue;
            }
            recipients.push(Recipient {
                user_id: assignment.staff_id,
                user_type: "staff".to_string(),
                client_id: client_id.to_string(),
                full_name: assignment.full_name,
                email: String::new(),
                role: assignment.role,
                is_active: true,
            });
        }

        Ok(recipients)
    }

    async fn cache_lookup(&self, key: &str) -> Option<(Vec<Recipient>, usize)> {
        {
            let cache = self.cache.read().await;
            match cache.get(key) {
                Some(entry) if !entry.is_expired() => {
                    return Some((entry.recipients.clone(), entry.deduplication_count));
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: evict lazily.
        self.cache.write().await.remove(key);
        None
    }

    async fn cache_store(
        &self,
        key: &str,
        recipients: Vec<Recipient>,
        deduplication_count: usize,
        ttl: Duration,
    ) {
        let entry = CacheEntry {
            recipients,
            deduplication_count,
            cached_at: Instant::now(),
            ttl,
        };
        self.cache.write().await.insert(key.to_string(), entry);
    }

    /// Drop cached resolutions: all of them, or only those for one client.
    /// Returns the number of entries removed.
    pub async fn clear_cache(&self, client_id: Option<&str>) -> usize {
        let mut cache = self.cache.write().await;
        match client_id {
            Some(client_id) => {
                let prefix = format!("{}:", client_id);
                let before = cache.len();
                cache.retain(|key, _| key != client_id && !key.starts_with(&prefix));
                before - cache.len()
            }
            None => {
                let removed = cache.len();
                cache.clear();
                removed
            }
        }
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");
        pool
    }

    fn resolver(pool: SqlitePool) -> RecipientResolver {
        RecipientResolver::new(
            pool,
            ResolverConfig {
                primary_timeout_seconds: 5,
                fallback_timeout_seconds: 3,
                primary_cache_ttl_seconds: 300,
                fallback_cache_ttl_seconds: 120,
            },
        )
    }

    async fn insert_admin(pool: &SqlitePool, id: &str, client_id: &str, active: bool) {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO admins (id, client_id, full_name, email, role, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(id)
        .bind(client_id)
        .bind(format!("Admin {}", id))
        .bind(format!("{}@example.com", id))
        .bind(active)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .expect("insert admin");
    }

    async fn insert_staff(pool: &SqlitePool, id: &str, client_id: &str, active: bool) {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO staff (id, full_name, email, role, is_active, created_at, updated_at)
             VALUES (?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(id)
        .bind(format!("Staff {}", id))
        .bind(format!("{}@example.com", id))
        .bind(active)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .expect("insert staff");

        sqlx::query(
            "INSERT INTO staff_clients (staff_id, client_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(client_id)
        .bind(now)
        .execute(pool)
        .await
        .expect("insert membership");
    }

    async fn insert_project_with_staff(
        pool: &SqlitePool,
        project_id: &str,
        client_id: &str,
        staff_id: &str,
    ) {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO projects (id, client_id, name, status, created_at, updated_at)
             VALUES (?, ?, ?, 'active', ?, ?)",
        )
        .bind(project_id)
        .bind(client_id)
        .bind(format!("Project {}", project_id))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .expect("insert project");

        sqlx::query(
            "INSERT INTO project_staff (id, project_id, staff_id, full_name, role, assigned_at)
             VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind(format!("ps-{}-{}", project_id, staff_id))
        .bind(project_id)
        .bind(staff_id)
        .bind(format!("Staff {}", staff_id))
        .bind(now)
        .execute(pool)
        .await
        .expect("insert assignment");
    }

    #[tokio::test]
    async fn primary_resolution_with_admin_and_staff() {
        let pool = test_pool().await;
        insert_admin(&pool, "a1", "c1", true).await;
        insert_staff(&pool, "s1", "c1", true).await;

        let resolver = resolver(pool);
        let outcome = resolver.resolve("c1", None, false).await;

        assert_eq!(outcome.source, ResolutionSource::Primary);
        assert_eq!(outcome.recipients.len(), 2);
        assert_eq!(outcome.deduplication_count, 0);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_collapses_onto_admin_entry() {
        let pool = test_pool().await;
        // Same id reachable via both the admin and the staff path.
        insert_admin(&pool, "dual", "c1", true).await;
        insert_staff(&pool, "dual", "c1", true).await;
        insert_staff(&pool, "s2", "c1", true).await;

        let resolver = resolver(pool);
        let outcome = resolver.resolve("c1", None, false).await;

        let dual: Vec<_> = outcome
            .recipients
            .iter()
            .filter(|r| r.user_id == "dual")
            .collect();
        assert_eq!(dual.len(), 1);
        assert_eq!(dual[0].user_type, "admin");
        // (1 admin + 2 staff) - 2 merged entries for "dual"/"s2"... total 3
        // fetched, 2 distinct ids kept.
        assert_eq!(outcome.deduplication_count, 1);
        assert_eq!(outcome.recipients.len(), 2);
    }

    #[tokio::test]
    async fn inactive_members_are_filtered() {
        let pool = test_pool().await;
        insert_admin(&pool, "a1", "c1", true).await;
        insert_staff(&pool, "s1", "c1", false).await;

        let resolver = resolver(pool);
        let outcome = resolver.resolve("c1", None, false).await;

        assert_eq!(outcome.recipients.len(), 1);
        assert_eq!(outcome.recipients[0].user_id, "a1");
    }

    #[tokio::test]
    async fn fallback_used_when_primary_is_empty() {
        let pool = test_pool().await;
        insert_staff(&pool, "s1", "other-client", true).await;
        insert_project_with_staff(&pool, "p1", "c1", "s1").await;

        let resolver = resolver(pool);
        let outcome = resolver.resolve("c1", Some("p1"), false).await;

        assert_eq!(outcome.source, ResolutionSource::Fallback);
        assert_eq!(outcome.recipients.len(), 1);
        assert_eq!(outcome.recipients[0].user_id, "s1");
        assert_eq!(outcome.recipients[0].email, "");
        assert!(outcome.recipients[0].is_active);
    }

    #[tokio::test]
    async fn empty_without_project_id_yields_none_source() {
        let pool = test_pool().await;

        let resolver = resolver(pool);
        let outcome = resolver.resolve("c1", None, false).await;

        assert_eq!(outcome.source, ResolutionSource::None);
        assert!(outcome.recipients.is_empty());
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let pool = test_pool().await;
        insert_admin(&pool, "a1", "c1", true).await;

        let resolver = resolver(pool);
        let first = resolver.resolve("c1", None, false).await;
        assert_eq!(first.source, ResolutionSource::Primary);

        let second = resolver.resolve("c1", None, false).await;
        assert_eq!(second.source, ResolutionSource::Cache);
        assert_eq!(second.recipients, first.recipients);
    }

    #[tokio::test]
    async fn skip_cache_never_returns_cache_source() {
        let pool = test_pool().await;
        insert_admin(&pool, "a1", "c1", true).await;

        let resolver = resolver(pool);
        let first = resolver.resolve("c1", None, false).await;
        assert_eq!(first.source, ResolutionSource::Primary);

        let second = resolver.resolve("c1", None, true).await;
        assert_ne!(second.source, ResolutionSource::Cache);
    }

    #[tokio::test]
    async fn expired_entries_are_lazily_evicted() {
        let pool = test_pool().await;
        insert_admin(&pool, "a1", "c1", true).await;

        let resolver = RecipientResolver::new(
            pool,
            ResolverConfig {
                primary_timeout_seconds: 5,
                fallback_timeout_seconds: 3,
                primary_cache_ttl_seconds: 0,
                fallback_cache_ttl_seconds: 0,
            },
        );

        let first = resolver.resolve("c1", None, false).await;
        assert_eq!(first.source, ResolutionSource::Primary);
        assert_eq!(resolver.cache_size().await, 1);

        // TTL of zero: the entry is expired by the time of the next lookup.
        let second = resolver.resolve("c1", None, false).await;
        assert_eq!(second.source, ResolutionSource::Primary);
    }

    #[tokio::test]
    async fn primary_failure_falls_back_to_project_assignment() {
        let pool = test_pool().await;
        insert_project_with_staff(&pool, "p1", "c1", "s1").await;

        // Break the primary stage outright.
        sqlx::query("DROP TABLE admins").execute(&pool).await.unwrap();

        let resolver = resolver(pool);
        let outcome = resolver.resolve("c1", Some("p1"), false).await;

        assert_eq!(outcome.source, ResolutionSource::Fallback);
        assert_eq!(outcome.recipients.len(), 1);
        assert_eq!(outcome.recipients[0].user_id, "s1");
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("primary:"));
    }

    #[tokio::test]
    async fn both_stages_failing_accumulates_both_errors() {
        let pool = test_pool().await;
        sqlx::query("DROP TABLE admins").execute(&pool).await.unwrap();
        sqlx::query("DROP TABLE project_staff")
            .execute(&pool)
            .await
            .unwrap();

        let resolver = resolver(pool);
        let outcome = resolver.resolve("c1", Some("p1"), false).await;

        assert_eq!(outcome.source, ResolutionSource::None);
        assert!(outcome.recipients.is_empty());
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors[1].starts_with("fallback:"));
    }

    #[tokio::test]
    async fn clear_cache_scoped_to_client() {
        let pool = test_pool().await;
        insert_admin(&pool, "a1", "c1", true).await;
        insert_admin(&pool, "a2", "c2", true).await;

        let resolver = resolver(pool);
        resolver.resolve("c1", None, false).await;
        resolver.resolve("c2", None, false).await;
        assert_eq!(resolver.cache_size().await, 2);

        let removed = resolver.clear_cache(Some("c1")).await;
        assert_eq!(removed, 1);
        assert_eq!(resolver.cache_size().await, 1);

        let removed_all = resolver.clear_cache(None).await;
        assert_eq!(removed_all, 1);
        assert_eq!(resolver.cache_size().await, 0);
    }
}
