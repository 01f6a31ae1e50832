//! Axum-based HTTP and WebSocket server.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::authorize_upgrade;
use crate::connection::{StreamParams, handle_stream_connection};
use crate::state::GatewayState;
use crate::webhook::{call_handler, connect_handler};

/// Build the router: health, observability, webhooks, and WebSocket paths.
pub fn router(state: Arc<GatewayState>) -> Router {
    let gateway = state.config.gateway();

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/voicebot/sessions", get(sessions_handler))
        .route("/voicebot/connect", get(connect_handler).post(connect_handler))
        .route(
            "/api/v1/exotel/voice/connect",
            get(connect_handler).post(connect_handler),
        )
        .route("/call", post(call_handler))
        .route(&gateway.stream_path, get(ws_handler));

    let mut seen = vec![gateway.stream_path.clone()];
    for path in &gateway.protected_paths {
        if seen.contains(path) {
            warn!(path, "Skipping duplicate WebSocket path");
            continue;
        }
        app = app.route(path, get(ws_handler));
        seen.push(path.clone());
    }

    #[cfg(feature = "metrics")]
    {
        match crate::metrics::install_prometheus_recorder() {
            Ok(handle) => {
                app = app.route("/metrics", get(move || async move { handle.render() }));
            }
            Err(e) => warn!(error = %e, "Prometheus recorder not installed"),
        }
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Start the gateway and serve until a shutdown signal arrives.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.gateway_bind();
    let stream_path = state.config.stream_path();
    let tls = state.config.gateway().tls;
    let app = router(state);

    let addr = format!("{bind_addr}:{port}");

    if let Some(tls) = tls {
        #[cfg(feature = "tls")]
        {
            return serve_tls(app, &addr, &tls, &stream_path).await;
        }

        #[cfg(not(feature = "tls"))]
        warn!(
            cert = %tls.cert_path,
            "TLS configured but this build lacks the `tls` feature; serving plain HTTP"
        );
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Gateway listening on http://{addr} (media stream at ws://{addr}{stream_path})");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(feature = "tls")]
async fn serve_tls(
    app: Router,
    addr: &str,
    tls: &voicebot_core::config::TlsConfig,
    stream_path: &str,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .context("loading TLS certificate")?;
    let socket_addr: std::net::SocketAddr = addr.parse().with_context(|| format!("parsing {addr}"))?;

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        }
    });

    info!("Gateway listening on https://{addr} (media stream at wss://{addr}{stream_path})");
    axum_server::bind_rustls(socket_addr, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let stream_path = state.config.stream_path();
    if let Err(e) = authorize_upgrade(uri.path(), &stream_path, state.ws_token.as_deref(), &headers)
    {
        warn!(path = uri.path(), error = %e, "Rejecting WebSocket upgrade");
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    let params = StreamParams::from_query(&query);
    ws.on_upgrade(move |socket| handle_stream_connection(state, socket, params))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let active_sessions = state.registry.len().await;

    Json(json!({
        "status": "ok",
        "version": version,
        "activeSessions": active_sessions,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn sessions_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let sessions = state.registry.list().await;
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use voicebot_core::config::{Config, GatewayConfig};
    use voicebot_core::error::Result;
    use voicebot_media::convert::PassthroughConverter;
    use voicebot_media::tts::TextToSpeech;

    struct SilentTts;

    #[async_trait]
    impl TextToSpeech for SilentTts {
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
            Ok(vec![0; 320])
        }
    }

    fn test_state(config: Config) -> Arc<GatewayState> {
        Arc::new(GatewayState::new(
            Arc::new(config),
            Arc::new(SilentTts),
            Arc::new(PassthroughConverter),
        ))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state(Config::default()));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeSessions"], 0);
    }

    #[tokio::test]
    async fn test_sessions_lists_registry() {
        let state = test_state(Config::default());
        state.registry.register("CA1").await;
        let response = router(state)
            .oneshot(Request::get("/voicebot/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["callId"], "CA1");
        assert_eq!(body["sessions"][0]["sequenceNumber"], 0);
    }

    #[tokio::test]
    async fn test_connect_webhook_get_prefers_custom_field() {
        let config = Config {
            gateway: Some(GatewayConfig {
                public_url: Some("https://bot.example.com".into()),
                ..GatewayConfig::default()
            }),
            ..Config::default()
        };
        let response = router(test_state(config))
            .oneshot(
                Request::get("/voicebot/connect?CallSid=CA9&CustomField=log-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["url"], "wss://bot.example.com/voicebot/ws?call_id=log-42");
    }

    #[tokio::test]
    async fn test_connect_webhook_post_form() {
        let response = router(test_state(Config::default()))
            .oneshot(
                Request::post("/api/v1/exotel/voice/connect")
                    .header("host", "gw.local:3000")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("CallSid=CA77&CallFrom=%2B9100000"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["url"], "ws://gw.local:3000/voicebot/ws?call_id=CA77");
    }

    #[tokio::test]
    async fn test_connect_webhook_without_ids_still_answers() {
        let response = router(test_state(Config::default()))
            .oneshot(
                Request::post("/voicebot/connect")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["url"].as_str().unwrap().contains("call_id=call_"));
    }

    #[tokio::test]
    async fn test_call_without_telephony_is_unavailable() {
        let response = router(test_state(Config::default()))
            .oneshot(
                Request::post("/call")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"to":"+919324606985"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_websocket_paths_are_routed() {
        // Routed paths refuse a plain GET as a bad upgrade, not as not-found
        for path in ["/voicebot/ws", "/voice-stream"] {
            let response = router(test_state(Config::default()))
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert!(response.status().is_client_error(), "{path}");
            assert_ne!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }

        let response = router(test_state(Config::default()))
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
