//! Outbound call placement through the Exotel REST API.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use voicebot_core::config::TelephonyConfig;
use voicebot_core::error::{Result, VoicebotError};

/// A call accepted by the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedCall {
    pub call_sid: Option<String>,
    pub data: Value,
}

#[async_trait]
pub trait CallInitiator: Send + Sync {
    /// Dial `target`, showing `caller_id` (or the configured default), and
    /// attach `custom_field` so the connect webhook can return it as the
    /// call id.
    async fn place_call(
        &self,
        target: &str,
        caller_id: Option<&str>,
        custom_field: Option<&str>,
    ) -> Result<PlacedCall>;
}

fn digits(number: &str) -> String {
    number.chars().filter(char::is_ascii_digit).collect()
}

/// Check that `target` is a dialable E.164 number distinct from `caller_id`.
pub fn validate_target(target: &str, caller_id: &str) -> Result<()> {
    let target = target.trim();
    let count = digits(target).len();
    if !target.starts_with('+') || !(8..=15).contains(&count) {
        return Err(VoicebotError::InvalidNumber(format!(
            "{target} must be E.164, e.g. +919324606985"
        )));
    }
    if digits(target) == digits(caller_id) {
        return Err(VoicebotError::InvalidNumber(format!(
            "{target} cannot be the same as the caller id"
        )));
    }
    Ok(())
}

/// Expand the short subdomain aliases the provider documents.
pub fn normalize_subdomain(subdomain: &str) -> String {
    match subdomain.trim() {
        "api" => "api.exotel.com".into(),
        "api.in" => "api.in.exotel.com".into(),
        other => other.trim_end_matches('/').to_string(),
    }
}

pub struct ExotelCaller {
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    api_key: String,
    api_token: String,
    caller_id: Option<String>,
    app_id: String,
}

impl ExotelCaller {
    pub fn from_config(config: &TelephonyConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| VoicebotError::Config("telephony API key not configured".into()))?;
        let api_token = config
            .resolve_api_token()
            .ok_or_else(|| VoicebotError::Config("telephony API token not configured".into()))?;
        let host = normalize_subdomain(&config.subdomain);
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("https://{host}")
        };
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            account_sid: config.account_sid.clone(),
            api_key,
            api_token,
            caller_id: config.caller_id.clone(),
            app_id: config.app_id.clone(),
        })
    }

    fn connect_url(&self) -> String {
        format!(
            "{}/v1/Accounts/{}/Calls/connect",
            self.base_url, self.account_sid
        )
    }

    fn flow_url(&self) -> String {
        format!(
            "http://my.exotel.com/{}/exoml/start_voice/{}",
            self.account_sid, self.app_id
        )
    }
}

#[async_trait]
impl CallInitiator for ExotelCaller {
    async fn place_call(
        &self,
        target: &str,
        caller_id: Option<&str>,
        custom_field: Option<&str>,
    ) -> Result<PlacedCall> {
        let caller_id = caller_id
            .or(self.caller_id.as_deref())
            .ok_or_else(|| VoicebotError::Config("no caller id configured".into()))?;
        validate_target(target, caller_id)?;

        let flow_url = self.flow_url();
        let mut form = vec![
            ("From", target.trim()),
            ("CallerId", caller_id),
            ("Url", flow_url.as_str()),
        ];
        if let Some(field) = custom_field.filter(|f| !f.is_empty()) {
            form.push(("CustomField", field));
        }

        info!(to = target, caller_id, custom_field, "Placing outbound call");
        let resp = self
            .client
            .post(self.connect_url())
            .basic_auth(&self.api_key, Some(&self.api_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| VoicebotError::Telephony(format!("request failed: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(%status, body = %body, "Call placement rejected");
            return Err(VoicebotError::Telephony(format!(
                "Exotel API error {status}: {body}"
            )));
        }

        let data: Value = serde_json::from_str(&body).unwrap_or(Value::String(body));
        let call_sid = extract_call_sid(&data);
        info!(call_sid = call_sid.as_deref().unwrap_or("unknown"), "Call placed");
        Ok(PlacedCall { call_sid, data })
    }
}

fn extract_call_sid(data: &Value) -> Option<String> {
    data.pointer("/Call/Sid")
        .or_else(|| data.get("Sid"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> TelephonyConfig {
        TelephonyConfig {
            account_sid: "acme1".into(),
            api_key: Some("key".into()),
            api_key_env: None,
            api_token: Some("token".into()),
            api_token_env: None,
            subdomain: "api.in".into(),
            caller_id: Some("08047112233".into()),
            app_id: "12345".into(),
        }
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target("+919324606985", "08047112233").is_ok());
        assert!(validate_target("+91 93246-06985", "08047112233").is_ok());
        assert!(validate_target("919324606985", "08047112233").is_err());
        assert!(validate_target("+12", "08047112233").is_err());
        assert!(validate_target("+918047112233", "+91 80471 12233").is_err());
    }

    #[test]
    fn test_normalize_subdomain() {
        assert_eq!(normalize_subdomain("api"), "api.exotel.com");
        assert_eq!(normalize_subdomain("api.in"), "api.in.exotel.com");
        assert_eq!(normalize_subdomain("ccm-api.exotel.com"), "ccm-api.exotel.com");
    }

    #[test]
    fn test_urls() {
        let caller = ExotelCaller::from_config(&config()).unwrap();
        assert_eq!(
            caller.connect_url(),
            "https://api.in.exotel.com/v1/Accounts/acme1/Calls/connect"
        );
        assert_eq!(
            caller.flow_url(),
            "http://my.exotel.com/acme1/exoml/start_voice/12345"
        );
    }

    #[test]
    fn test_missing_credentials() {
        let mut cfg = config();
        cfg.api_token = None;
        cfg.api_token_env = Some("NONEXISTENT_VB_EXOTEL_TOKEN".into());
        assert!(matches!(
            ExotelCaller::from_config(&cfg),
            Err(VoicebotError::Config(_))
        ));
    }

    #[test]
    fn test_extract_call_sid() {
        assert_eq!(
            extract_call_sid(&json!({"Call": {"Sid": "abc"}})).as_deref(),
            Some("abc")
        );
        assert_eq!(extract_call_sid(&json!({"Sid": "def"})).as_deref(), Some("def"));
        assert!(extract_call_sid(&json!({})).is_none());
    }

    #[tokio::test]
    async fn test_place_call_rejects_invalid_target_without_network() {
        let caller = ExotelCaller::from_config(&config()).unwrap();
        let err = caller.place_call("12345", None, None).await.unwrap_err();
        assert!(matches!(err, VoicebotError::InvalidNumber(_)));
    }
}
