//! Provider-facing HTTP handlers: connect webhook and call placement.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequest, Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use voicebot_core::error::VoicebotError;

use crate::connection::generated_call_id;
use crate::state::GatewayState;

/// Webhook keys that carry the call id, in priority order. `CustomField`
/// holds the caller's own tracking id when the call was placed via `/call`.
const WEBHOOK_CALL_ID_KEYS: [&str; 4] = ["CustomField", "customField", "CallSid", "call_id"];

/// Collect webhook parameters from the query string and, for POST, the
/// form or JSON body. Body values win over query values.
async fn webhook_params(query: HashMap<String, String>, request: Request) -> HashMap<String, String> {
    let mut params = query;
    if request.method() != Method::POST {
        return params;
    }
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        match Json::<HashMap<String, Value>>::from_request(request, &()).await {
            Ok(Json(body)) => {
                for (key, value) in body {
                    let value = match value {
                        Value::String(s) => s,
                        Value::Null => continue,
                        other => other.to_string(),
                    };
                    params.insert(key, value);
                }
            }
            Err(e) => warn!(error = %e, "Unreadable JSON webhook body"),
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        match Form::<HashMap<String, String>>::from_request(request, &()).await {
            Ok(Form(body)) => params.extend(body),
            Err(e) => warn!(error = %e, "Unreadable form webhook body"),
        }
    }
    params
}

/// `ws`/`wss` base for the stream URL: configured public URL, else the
/// request's forwarding headers.
pub fn websocket_base(public_url: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(url) = public_url.filter(|u| !u.is_empty()) {
        let url = url.trim_end_matches('/');
        return if let Some(host) = url.strip_prefix("https://") {
            format!("wss://{host}")
        } else if let Some(host) = url.strip_prefix("http://") {
            format!("ws://{host}")
        } else {
            format!("wss://{url}")
        };
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let host = header("x-forwarded-host")
        .or_else(|| header(HOST.as_str()))
        .unwrap_or("localhost");
    let scheme = match header("x-forwarded-proto") {
        Some("https") => "wss",
        _ => "ws",
    };
    format!("{scheme}://{host}")
}

/// Full stream URL with the call id as an encoded query parameter.
pub fn stream_url(base: &str, stream_path: &str, call_id: &str) -> String {
    match reqwest::Url::parse(&format!("{base}{stream_path}")) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("call_id", call_id);
            url.to_string()
        }
        Err(e) => {
            warn!(base, error = %e, "Could not build stream URL");
            format!("{base}{stream_path}")
        }
    }
}

/// Answers the provider's "where do I stream this call" webhook. Always 200.
pub async fn connect_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let params = webhook_params(query, request).await;

    let call_id = WEBHOOK_CALL_ID_KEYS
        .iter()
        .filter_map(|k| params.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(generated_call_id);

    let gateway = state.config.gateway();
    let base = websocket_base(gateway.public_url.as_deref(), &headers);
    let url = stream_url(&base, &gateway.stream_path, &call_id);

    info!(
        %method,
        call_id = %call_id,
        from = params.get("CallFrom").map(String::as_str).unwrap_or_default(),
        to = params.get("CallTo").map(String::as_str).unwrap_or_default(),
        direction = params.get("Direction").map(String::as_str).unwrap_or("unknown"),
        url = %url,
        "Connect webhook answered"
    );

    (
        StatusCode::OK,
        [(CACHE_CONTROL, "no-cache")],
        Json(json!({ "url": url })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub to: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub call_log_id: Option<String>,
}

/// Place an outbound call that will later connect to the stream path.
pub async fn call_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CallRequest>,
) -> Response {
    let Some(caller) = state.caller.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": "Outbound calling is not configured" })),
        )
            .into_response();
    };

    match caller
        .place_call(&req.to, req.from.as_deref(), req.call_log_id.as_deref())
        .await
    {
        Ok(placed) => Json(json!({
            "success": true,
            "callSid": placed.call_sid,
            "data": placed.data,
        }))
        .into_response(),
        Err(e) => {
            let status = match &e {
                VoicebotError::InvalidNumber(_) => StatusCode::BAD_REQUEST,
                VoicebotError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            warn!(to = %req.to, error = %e, "Call placement failed");
            (status, Json(json!({ "success": false, "error": e.to_string() }))).into_response()
        }
    }
}
