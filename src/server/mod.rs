//! Webhook server: receives alerts over HTTP and hands them to the strategy.
//!
//! The listener starts before the exchange engine is connected; until the
//! strategy is installed `/webhook` answers 503 and `/health` reports
//! "initializing".

pub mod parser;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::models::Direction;
use crate::trading::{flag, ConfigError, ExchangeKind, ExchangeManager, PositionStrategy};

/// Source addresses of the alerting service.
pub const DEFAULT_ALLOWED_IPS: [&str; 5] = [
    "52.89.214.238",
    "34.212.75.30",
    "54.218.53.128",
    "52.32.178.7",
    "5.145.227.179",
];

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Who may call `/webhook`.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub allowed_ips: HashSet<IpAddr>,

    /// Skip the allow-list check entirely
    pub dev_mode: bool,
}

impl AccessConfig {
    /// Read `ALLOWED_IPS` (comma separated) and `DEV_MODE`.
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup("ALLOWED_IPS").filter(|v| !v.trim().is_empty());
        let allowed_ips = match raw {
            Some(list) => parse_ip_list(&list)?,
            None => default_allowed_ips(),
        };

        Ok(Self {
            allowed_ips,
            dev_mode: flag(lookup, "DEV_MODE"),
        })
    }

    pub fn permits(&self, ip: Option<IpAddr>) -> bool {
        self.dev_mode || ip.is_some_and(|ip| self.allowed_ips.contains(&ip))
    }
}

fn default_allowed_ips() -> HashSet<IpAddr> {
    DEFAULT_ALLOWED_IPS
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

fn parse_ip_list(list: &str) -> Result<HashSet<IpAddr>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>().map_err(|e| ConfigError::InvalidVar {
                name: "ALLOWED_IPS".to_string(),
                reason: format!("'{}': {}", s, e),
            })
        })
        .collect()
}

/// Caller address: first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| peer.map(|p| p.ip()))
}

/// Liveness snapshot for an external supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Initializing,
    Ready {
        exchange: ExchangeKind,
        symbol: String,
        /// Direction of the last accepted signal
        last_signal: Option<Direction>,
    },
}

/// Shared router state.
#[derive(Clone)]
pub struct AppState {
    strategy: Arc<OnceCell<Arc<PositionStrategy>>>,
    access: Arc<AccessConfig>,
}

impl AppState {
    pub fn new(access: AccessConfig) -> Self {
        Self {
            strategy: Arc::new(OnceCell::new()),
            access: Arc::new(access),
        }
    }

    /// Install the strategy once the engine is connected. Returns `false` if
    /// one was already installed.
    pub fn install(&self, strategy: Arc<PositionStrategy>) -> bool {
        self.strategy.set(strategy).is_ok()
    }

    pub fn strategy(&self) -> Option<&Arc<PositionStrategy>> {
        self.strategy.get()
    }

    /// Waits for a signal that is being processed to finish.
    pub async fn health(&self) -> Health {
        match self.strategy() {
            Some(strategy) => Health::Ready {
                exchange: strategy.engine().kind(),
                symbol: strategy.engine().symbol().to_string(),
                last_signal: strategy.last_accepted().await,
            },
            None => Health::Initializing,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .with_state(state)
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

async fn webhook(State(state): State<AppState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);

    if !state.access.permits(ip) {
        warn!(ip = ?ip, "Webhook from address not on the allow-list");
        return reply(
            StatusCode::FORBIDDEN,
            json!({"status": "error", "message": "forbidden"}),
        );
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to read webhook body");
            return reply(
                StatusCode::BAD_REQUEST,
                json!({"status": "error", "message": "unreadable body"}),
            );
        }
    };

    let signal = match serde_json::from_slice::<Value>(&body)
        .map_err(|e| e.to_string())
        .and_then(|payload| parser::parse(&payload).map_err(|e| e.to_string()))
    {
        Ok(signal) => signal,
        Err(message) => {
            warn!(ip = ?ip, error = %message, "Rejected webhook payload");
            return reply(
                StatusCode::BAD_REQUEST,
                json!({"status": "error", "message": message}),
            );
        }
    };

    let Some(strategy) = state.strategy() else {
        warn!(signal = %signal, "Signal received before strategy was ready");
        return reply(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"status": "error", "message": "strategy not initialized"}),
        );
    };

    info!(ip = ?ip, signal = %signal, timeframe = ?signal.timeframe, "Signal received");
    let processed = strategy.process(&signal).await;

    reply(StatusCode::OK, json!({"status": "ok", "processed": processed}))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.health().await {
        Health::Ready {
            exchange,
            symbol,
            last_signal,
        } => reply(
            StatusCode::OK,
            json!({
                "status": "ok",
                "exchange": exchange.as_str(),
                "symbol": symbol,
                "last_signal": last_signal.map(|d| d.as_str()),
            }),
        ),
        Health::Initializing => reply(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"status": "initializing"}),
        ),
    }
}

/// Bind, start serving, and connect the engine concurrently. Returns when
/// Ctrl+C is received, or with an error if the engine cannot be built.
pub async fn serve(bind: SocketAddr, access: AccessConfig, manager: ExchangeManager) -> Result<()> {
    if access.dev_mode {
        warn!("Dev mode: webhook IP allow-list disabled");
    }

    let state = AppState::new(access);
    let app = router(state.clone());

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(%bind, exchange = %manager.active_exchange(), "Webhook server listening");

    let server = async {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Webhook server failed")
    };

    let init = async {
        let strategy = manager
            .build_strategy(None)
            .await
            .context("Failed to initialize exchange engine")?;
        info!(
            exchange = %strategy.engine().kind(),
            symbol = %strategy.engine().symbol(),
            "Strategy ready"
        );
        state.install(Arc::new(strategy));
        Ok::<(), anyhow::Error>(())
    };

    tokio::try_join!(server, init)?;
    info!("Webhook server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    info!("Received Ctrl+C, shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::testing::MockEngine;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn locked() -> AccessConfig {
        AccessConfig {
            allowed_ips: default_allowed_ips(),
            dev_mode: false,
        }
    }

    fn ready_state(access: AccessConfig) -> AppState {
        let state = AppState::new(access);
        let engine = Arc::new(MockEngine::new().with_positions(vec![None]));
        state.install(Arc::new(PositionStrategy::new(engine, Default::default())));
        state
    }

    fn post_webhook(body: &str, forwarded_for: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json");
        if let Some(ip) = forwarded_for {
            builder = builder.header("x-forwarded-for", ip);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(state: AppState, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "10.1.1.1:5000".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)), Some(peer.ip()));

        headers.insert("x-real-ip", "34.212.75.30".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer)), "34.212.75.30".parse().ok());

        headers.insert("x-forwarded-for", "52.89.214.238, 10.0.0.2".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer)), "52.89.214.238".parse().ok());
    }

    #[test]
    fn test_access_config_from_lookup() {
        let custom = |key: &str| match key {
            "ALLOWED_IPS" => Some("127.0.0.1, ::1".to_string()),
            "DEV_MODE" => Some("false".to_string()),
            _ => None,
        };
        let access = AccessConfig::from_lookup(&custom).unwrap();
        assert_eq!(access.allowed_ips.len(), 2);
        assert!(access.permits("::1".parse().ok()));
        assert!(!access.permits("52.89.214.238".parse().ok()));
        assert!(!access.permits(None));

        let defaults = AccessConfig::from_lookup(&|_: &str| None).unwrap();
        assert_eq!(defaults.allowed_ips.len(), DEFAULT_ALLOWED_IPS.len());

        let invalid = |key: &str| (key == "ALLOWED_IPS").then(|| "not-an-ip".to_string());
        assert!(AccessConfig::from_lookup(&invalid).is_err());
    }

    #[tokio::test]
    async fn test_health_accessor() {
        assert_eq!(AppState::new(locked()).health().await, Health::Initializing);
        assert_eq!(
            ready_state(locked()).health().await,
            Health::Ready {
                exchange: ExchangeKind::Bybit,
                symbol: "ETHUSDT".to_string(),
                last_signal: None,
            }
        );
    }

    #[tokio::test]
    async fn test_health_reports_initializing() {
        let (status, body) = send(
            AppState::new(locked()),
            HttpRequest::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "initializing");
    }

    #[tokio::test]
    async fn test_health_reports_exchange_when_ready() {
        let (status, body) = send(
            ready_state(locked()),
            HttpRequest::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["exchange"], "bybit");
        assert_eq!(body["symbol"], "ETHUSDT");
        assert_eq!(body["last_signal"], Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_ip_forbidden() {
        let request = post_webhook(r#"{"symbol":"ETHUSDT","signal":"long"}"#, Some("1.2.3.4"));
        let (status, _) = send(ready_state(locked()), request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_bad_payload_rejected() {
        let request = post_webhook(
            r#"{"symbol":"ETHUSDT","signal":"sideways"}"#,
            Some("52.89.214.238"),
        );
        let (status, body) = send(ready_state(locked()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("sideways"));

        let request = post_webhook("not json", Some("52.89.214.238"));
        let (status, _) = send(ready_state(locked()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_not_ready_is_unavailable() {
        let request = post_webhook(
            r#"{"symbol":"ETHUSDT","signal":"long"}"#,
            Some("52.89.214.238"),
        );
        let (status, _) = send(AppState::new(locked()), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_dev_mode_processes_signal() {
        let access = AccessConfig {
            dev_mode: true,
            ..locked()
        };
        let state = ready_state(access);

        let request = post_webhook(
            r#"{"symbol":"ethusdt","signal":"long","timeframe":"45m"}"#,
            None,
        );
        let (status, body) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "processed": true}));

        let strategy = state.strategy().unwrap();
        assert_eq!(strategy.last_accepted().await, Some(Direction::Long));

        let (status, body) = send(
            state,
            HttpRequest::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["last_signal"], "long");
    }
}
