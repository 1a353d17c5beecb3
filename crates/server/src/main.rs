use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use ledger_core::ChannelKind;
use ledger_db::Db;
use ledger_engine::{
    Dispatcher, EngineConfig, EnvCredentialStore, HttpSender, HttpSenderConfig,
    NotificationRoute, Orchestrator, RateLimiter,
};
use providers::AdapterRegistry;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
struct ApiError {
    error: String,
}

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Db>>,
    orchestrator: Arc<Orchestrator>,
}

#[derive(Deserialize)]
struct AlertsQuery {
    include_acknowledged: Option<bool>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_duration_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Alert routing from the environment: each set variable adds one route
/// for the operator user.
fn routes_from_env() -> Vec<NotificationRoute> {
    const OPERATOR_USER_ID: i64 = 1;
    let sources = [
        ("ALERT_EMAIL", ChannelKind::Email, 1),
        ("ALERT_SLACK_WEBHOOK", ChannelKind::Slack, 2),
        ("ALERT_DISCORD_WEBHOOK", ChannelKind::Discord, 2),
        ("ALERT_TEAMS_WEBHOOK", ChannelKind::Teams, 2),
        ("ALERT_WEBHOOK_URL", ChannelKind::Webhook, 1),
    ];
    sources
        .into_iter()
        .filter_map(|(var, channel, priority)| {
            std::env::var(var).ok().map(|recipient| NotificationRoute {
                user_id: OPERATOR_USER_ID,
                channel,
                recipient,
                priority,
            })
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let db_path = PathBuf::from(env_or("LEDGER_DB", "ledger.sqlite"));
    let mut db = match Db::open(&db_path) {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(path = %db_path.display(), error = %err, "failed to open database");
            std::process::exit(1);
        }
    };
    if let Err(err) = db.migrate() {
        tracing::error!(error = %err, "failed to run migrations");
        std::process::exit(1);
    }
    let db = Arc::new(Mutex::new(db));

    let config = EngineConfig {
        sync_interval: env_duration_secs("SYNC_INTERVAL_SECS", 3600),
        routes: routes_from_env(),
        ..EngineConfig::default()
    };

    let sender = HttpSender::new(HttpSenderConfig {
        send_timeout: config.send_timeout,
        email_from: env_or("EMAIL_FROM", "alerts@localhost"),
        sendgrid_api_key: std::env::var("SENDGRID_API_KEY").ok(),
    });
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        RateLimiter::default(),
        Arc::new(sender),
        config.dispatch_batch,
        config.send_timeout,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        AdapterRegistry::with_builtin(),
        Arc::new(EnvCredentialStore),
        Arc::clone(&dispatcher),
        config,
    ));
    orchestrator.start();

    let cancel = CancellationToken::new();
    let dispatch_loop = tokio::spawn(Arc::clone(&dispatcher).run(
        env_duration_secs("DISPATCH_INTERVAL_SECS", 15),
        cancel.clone(),
    ));

    let state = AppState {
        db: Arc::clone(&db),
        orchestrator: Arc::clone(&orchestrator),
    };
    let app = build_app(state);

    let bind = env_or("LEDGER_BIND", "127.0.0.1:3030");
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .expect("bind server");
    tracing::info!(%bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("serve");

    orchestrator.stop().await;
    cancel.cancel();
    let _ = dispatch_loop.await;
    tracing::info!("shutdown complete");
}

fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sync/trigger", post(trigger_sync))
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/api/notifications/history", get(notification_history))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn trigger_sync(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.orchestrator.trigger_now();
    Json(serde_json::json!({ "status": "scheduled" }))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let db = state.db.lock().await;
    let alerts = db
        .list_alerts(query.include_acknowledged.unwrap_or(false))
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "alerts": alerts })))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let db = state.db.lock().await;
    let acknowledged = db.acknowledge_alert(id).map_err(internal_error)?;
    if !acknowledged {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: format!("no alert with id {id}"),
            }),
        ));
    }
    Ok(Json(serde_json::json!({ "acknowledged": true })))
}

async fn notification_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let db = state.db.lock().await;
    let history = db
        .list_delivery_history(query.limit.unwrap_or(100))
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "history": history })))
}

fn internal_error(err: ledger_db::DbError) -> (StatusCode, Json<ApiError>) {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request;
    use http_body_util::BodyExt;
    use ledger_core::AlertKind;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut db = Db::open(dir.path().join("test.sqlite")).expect("open");
        db.migrate().expect("migrate");
        let db = Arc::new(Mutex::new(db));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&db),
            RateLimiter::default(),
            Arc::new(HttpSender::new(HttpSenderConfig {
                send_timeout: Duration::from_secs(1),
                email_from: "alerts@localhost".to_string(),
                sendgrid_api_key: None,
            })),
            10,
            Duration::from_secs(1),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&db),
            AdapterRegistry::new(),
            Arc::new(EnvCredentialStore),
            dispatcher,
            EngineConfig::default(),
        ));
        (
            dir,
            AppState {
                db,
                orchestrator,
            },
        )
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (_dir, state) = test_state().await;
        let response = build_app(state)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn acknowledge_round_trip() {
        let (_dir, state) = test_state().await;
        let alert_id = {
            let db = state.db.lock().await;
            let account_id = db
                .insert_account("openai", "prod", Some(dec!(100)), Some("cred"))
                .unwrap();
            db.upsert_alert(
                account_id,
                AlertKind::ApproachingLimit,
                80,
                Some(dec!(82)),
                "approaching",
                "2026-02-10T12:00:00+00:00",
            )
            .unwrap()
        };

        let app = build_app(state);
        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/api/alerts/{alert_id}/acknowledge"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/alerts/9999/acknowledge")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::get("/api/alerts?include_acknowledged=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["alerts"][0]["acknowledged"], true);
    }

    #[tokio::test]
    async fn history_endpoint_lists_deliveries() {
        let (_dir, state) = test_state().await;
        {
            let db = state.db.lock().await;
            db.insert_delivery_record(
                None,
                1,
                ChannelKind::Slack,
                ledger_core::TaskStatus::Sent,
                Some(25),
                "2026-02-10T12:00:00+00:00",
            )
            .unwrap();
        }
        let response = build_app(state)
            .oneshot(
                Request::get("/api/notifications/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["history"][0]["channel"], "slack");
    }
}
