use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
mod middleware;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::body::Body;
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod config;
mod db;
mod error;
mod routes;
mod services;

use config::Config;
use services::activity_log::ActivityLogSink;
use services::dispatcher::{Dispatcher, HttpPushGateway};
use services::init;
use services::maintenance::MaintenanceService;
use services::recipients::RecipientResolver;
use services::retry::RetryManager;
use services::token_store::TokenStore;
use services::token_validator::TokenValidator;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub validator: Arc<TokenValidator>,
    pub resolver: RecipientResolver,
    pub dispatcher: Dispatcher,
    pub retry: RetryManager,
    pub maintenance: MaintenanceService,
    pub activity_log: ActivityLogSink,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "site_notifications=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Site Notifications Service");

    // Initialize database
    let pool = init::init_db(&config).await?;

    // Initialize pipeline services
    let validator = Arc::new(TokenValidator::new());
    let token_store = TokenStore::new(pool.clone(), validator.clone());
    let gateway = Arc::new(HttpPushGateway::new(&config.push_gateway)?);
    let dispatcher = Dispatcher::new(token_store, gateway, &config.push_gateway);
    let resolver = RecipientResolver::new(pool.clone(), config.resolver.clone());
    let retry = RetryManager::new(&config.retry);
    let maintenance =
        MaintenanceService::new(pool.clone(), validator.clone(), config.maintenance.clone());
    let activity_log = ActivityLogSink::new(&config.activity_log);

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        validator,
        resolver,
        dispatcher,
        retry,
        maintenance,
        activity_log,
    });

    // Create shutdown notifier for background workers and std threads
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let thread_shutdown = Arc::new(AtomicBool::new(false));

    // Spawn background workers (returns JoinHandles so we can await shutdown)
    let bg_handles = init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());

    // Rate limiter for public push token registration, with a custom error
    // handler returning the same JSON error envelope as `AppError`.
    let mut push_token_builder = GovernorConfigBuilder::default();
    push_token_builder.per_second(config.rate_limit.push_token_per_second.into());
    push_token_builder.burst_size(config.rate_limit.push_token_burst);
    push_token_builder.key_extractor(SmartIpKeyExtractor);
    push_token_builder.error_handler(|error: GovernorError| -> http::Response<Body> {
        match error {
            GovernorError::TooManyRequests { wait_time, headers } => {
                // `wait_time` is provided as seconds
                let retry_after = wait_time;

                let body = serde_json::json!({
                    "error": {
                        "code": "RATE_LIMITED",
                        "message": "Rate limit exceeded",
                        "details": { "retry_after_seconds": retry_after }
                    }
                })
                .to_string();

                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;

                // Ensure clients see JSON
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );

                // Include any headers provided by the governor (e.g., X-RateLimit-* if enabled)
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }

                // Retry-After (seconds)
                resp.headers_mut().insert(
                    http::header::RETRY_AFTER,
                    http::HeaderValue::from_str(&retry_after.to_string()).unwrap(),
                );

                resp
            }
            GovernorError::UnableToExtractKey => {
                let body = serde_json::json!({
                    "error": {
                        "code": "INVALID_REQUEST",
                        "message": "Unable to determine client IP for rate limiting"
                    }
                })
                .to_string();

                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
                resp
            }
            GovernorError::Other { code, msg, headers } => {
                let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
                let mut resp = http::Response::new(Body::from(body));
                let status = StatusCode::from_u16(code.as_u16())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                *resp.status_mut() = status;
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp
            }
        }
    });

    let push_token_gov_conf = Arc::new(
        push_token_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build push token governor config"))?,
    );

    // Background cleanup for the limiter storage
    let limiter_cleaner = {
        let limiter = push_token_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        let flag = thread_shutdown.clone();
        std::thread::spawn(move || {
            // Use smaller sleep granularity to allow quick shutdown.
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..interval.as_secs() {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("push token rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let push_token_rate_layer = GovernorLayer {
        config: push_token_gov_conf.clone(),
    };

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))
        // Recipient resolution
        .nest("/api/recipients", routes::recipients::router())
        // Push token registration (rate limited per IP)
        .nest(
            "/api/push-token",
            routes::push_tokens::router().layer(push_token_rate_layer),
        )
        // Pipeline entry point for domain events
        .nest("/api/notifications", routes::notifications::router())
        // Retry queue operator controls
        .nest("/api/retry", routes::retry::router())
        // Cron-triggered maintenance
        .nest("/api/maintenance", routes::maintenance::router())
        // Add shared state
        .with_state(app_state.clone())
        // Security headers on every response
        .layer(axum::middleware::from_fn(
            middleware::security_headers::security_headers_middleware,
        ))
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(
                    config
                        .server
                        .frontend_url
                        .parse::<HeaderValue>()
                        .expect("Invalid FRONTEND_URL for CORS"),
                )
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::DELETE,
                    http::Method::HEAD,
                    http::Method::OPTIONS,
                ])
                .allow_headers([
                    http::header::CONTENT_TYPE,
                    http::header::AUTHORIZATION,
                    http::header::ACCEPT,
                ])
                .allow_credentials(true),
        );

    // Start server
    let host = config.server.host.clone();
    let port = config.server.port;
    let addr = format!("{}:{}", host, port);

    tracing::info!("Server listening on {}", addr);

    // Start server using axum `serve`. A signal listener is raced against the
    // server future; on shutdown the workers and threads are notified and the
    // server future is dropped to stop accepting new connections.
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let shutdown_tx_clone = shutdown_tx.clone();
    let thread_shutdown_clone = thread_shutdown.clone();

    let signal_fut = async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to bind SIGTERM");
            tokio::select! {
                _ = ctrl_c => {},
                _ = term.recv() => {},
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("Failed to bind Ctrl+C");
        }

        tracing::info!("Shutdown signal received, notifying background workers and threads");
        let _ = shutdown_tx_clone.send(());
        thread_shutdown_clone.store(true, Ordering::SeqCst);
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Signal handler completed; server future dropped to stop accepting new connections");
        }
    }

    // Give background workers some time to finish their work.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );

    // Wait for tokio background workers to finish with a timeout.
    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    let _ = tokio::time::timeout(shutdown_wait, bg_wait).await;

    // Join the cleanup thread; it checks `thread_shutdown` and exits quickly.
    if let Err(e) = limiter_cleaner.join() {
        tracing::warn!("Rate limiter cleanup thread join failed: {:?}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::{header, Request};
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.jwt.secret = "test-secret".to_string();
        config.maintenance.cron_secret = "cron-secret".to_string();

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");

        let validator = Arc::new(TokenValidator::new());
        let token_store = TokenStore::new(pool.clone(), validator.clone());
        let gateway = Arc::new(HttpPushGateway::new(&config.push_gateway).expect("gateway"));
        let dispatcher = Dispatcher::new(token_store, gateway, &config.push_gateway);
        let resolver = RecipientResolver::new(pool.clone(), config.resolver.clone());
        let retry = RetryManager::new(&config.retry);
        let maintenance =
            MaintenanceService::new(pool.clone(), validator.clone(), config.maintenance.clone());
        let activity_log = ActivityLogSink::new(&config.activity_log);

        Arc::new(AppState {
            db: pool,
            config,
            validator,
            resolver,
            dispatcher,
            retry,
            maintenance,
            activity_log,
        })
    }

    fn test_app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(routes::health::health_check))
            .nest("/api/recipients", routes::recipients::router())
            .nest("/api/push-token", routes::push_tokens::router())
            .nest("/api/notifications", routes::notifications::router())
            .nest("/api/retry", routes::retry::router())
            .nest("/api/maintenance", routes::maintenance::router())
            .with_state(state)
    }

    fn bearer_for(state: &Arc<AppState>, sub: &str, user_type: &str) -> String {
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = routes::auth::Claims {
            sub: sub.to_string(),
            user_type: user_type.to_string(),
            iat: now,
            exp: now + 3600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(state.config.jwt.secret.as_bytes()),
        )
        .expect("encode jwt");
        format!("Bearer {}", token)
    }

    async fn insert_admin(state: &Arc<AppState>, id: &str, client_id: &str) {
        let now = chrono::Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO admins (id, client_id, full_name, email, role, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, 1, ?, ?)",
        )
        .bind(id)
        .bind(client_id)
        .bind(format!("Admin {}", id))
        .bind(format!("{}@example.com", id))
        .bind(now)
        .bind(now)
        .execute(&state.db)
        .await
        .expect("insert admin");
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let state = test_state().await;
        let app = test_app(state);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "healthy");
    }

    #[tokio::test]
    async fn recipients_endpoint_requires_auth() {
        let state = test_state().await;
        let app = test_app(state);

        let response = app
            .oneshot(
                Request::get("/api/recipients?client_id=c1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn recipients_endpoint_resolves_for_admin() {
        let state = test_state().await;
        insert_admin(&state, "a1", "c1").await;
        let bearer = bearer_for(&state, "a1", "admin");
        let app = test_app(state);

        let response = app
            .oneshot(
                Request::get("/api/recipients?client_id=c1")
                    .header(header::AUTHORIZATION, bearer)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["source"], "PRIMARY");
        assert_eq!(parsed["recipient_count"], 1);
        assert_eq!(parsed["deduplication_count"], 0);
    }

    #[tokio::test]
    async fn recipients_endpoint_rejects_missing_client_id() {
        let state = test_state().await;
        insert_admin(&state, "a1", "c1").await;
        let bearer = bearer_for(&state, "a1", "admin");
        let app = test_app(state);

        let response = app
            .oneshot(
                Request::get("/api/recipients")
                    .header(header::AUTHORIZATION, bearer)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retry_endpoint_is_admin_only() {
        let state = test_state().await;
        insert_admin(&state, "a1", "c1").await;

        let now = chrono::Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO staff (id, full_name, email, role, is_active, created_at, updated_at)
             VALUES ('s1', 'Staff s1', 's1@example.com', NULL, 1, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&state.db)
        .await
        .unwrap();

        let staff_bearer = bearer_for(&state, "s1", "staff");
        let admin_bearer = bearer_for(&state, "a1", "admin");
        let app = test_app(state);

        let forbidden = app
            .clone()
            .oneshot(
                Request::get("/api/retry")
                    .header(header::AUTHORIZATION, staff_bearer)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let allowed = app
            .oneshot(
                Request::get("/api/retry")
                    .header(header::AUTHORIZATION, admin_bearer)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn maintenance_trigger_requires_cron_secret() {
        let state = test_state().await;
        let app = test_app(state);

        let rejected = app
            .clone()
            .oneshot(
                Request::post("/api/maintenance")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::from(r#"{"job":"analytics"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

        let accepted = app
            .oneshot(
                Request::post("/api/maintenance")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, "Bearer cron-secret")
                    .body(Body::from(r#"{"job":"analytics"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
        let body = accepted.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["report"]["job"], "analytics");
    }
}
