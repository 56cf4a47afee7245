//! Authenticated client for the Gemini-style backend.
//!
//! Wraps one request in the credential-rotation retry contract: an expired
//! access token is refreshed before the call (and once more after a 401),
//! a 429 puts the credential into per-model cooldown and rotates, a 5xx
//! rotates, and any other 4xx is surfaced immediately. When every attempt
//! fails the caller sees either the last backend status or `NoCredentials`.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::config::GatewaySettings;
use crate::credentials::CredentialPool;
use crate::models::GeminiPayload;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const USER_AGENT: &str = "google-api-nodejs-client/9.15.1";
const API_CLIENT: &str = "gl-node/22.17.0";
const CLIENT_METADATA: &str =
    "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI";

/// Rotation attempts before giving up on a request.
pub const MAX_RETRIES: usize = 3;

/// Expire access tokens this many seconds early.
const EXPIRY_SKEW_SECONDS: i64 = 30;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no credentials available")]
    NoCredentials,
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Client over the Code Assist API surface.
pub struct UpstreamClient {
    http: reqwest::Client,
    endpoint: String,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, endpoint: String) -> Self {
        Self { http, endpoint }
    }

    /// Unary call; returns the raw 2xx response body.
    pub async fn generate(
        &self,
        pool: &Arc<CredentialPool>,
        settings: &GatewaySettings,
        payload: &GeminiPayload,
        model_key: &str,
    ) -> Result<String, UpstreamError> {
        let timeout = std::time::Duration::from_secs(settings.request_timeout_seconds().await);
        let response = self
            .request(pool, settings, payload, model_key, false, Some(timeout))
            .await?;
        Ok(response.text().await?)
    }

    /// Streaming call; returns the SSE response for the caller to consume.
    pub async fn stream_generate(
        &self,
        pool: &Arc<CredentialPool>,
        settings: &GatewaySettings,
        payload: &GeminiPayload,
        model_key: &str,
    ) -> Result<reqwest::Response, UpstreamError> {
        // No timeout here: reqwest applies it to the full response body,
        // which would kill long generations mid-stream.
        self.request(pool, settings, payload, model_key, true, None)
            .await
    }

    async fn request(
        &self,
        pool: &Arc<CredentialPool>,
        settings: &GatewaySettings,
        payload: &GeminiPayload,
        model_key: &str,
        streaming: bool,
        timeout: Option<std::time::Duration>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let cooldown_seconds = settings.cooldown_429_seconds().await;
        let action = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!("{}/v1internal:{}", self.endpoint, action);

        let mut last_status: Option<(u16, String)> = None;

        for attempt in 0..MAX_RETRIES {
            let Some((filename, mut bundle)) =
                pool.get_valid_credential(Some(model_key)).await
            else {
                break;
            };

            if token_expired(&bundle) {
                if let Err(e) = self.refresh_access_token(&mut bundle).await {
                    tracing::warn!(credential = %filename, error = %e, "token refresh failed");
                    pool.record_error(&filename, 401, Some(model_key), cooldown_seconds)
                        .await;
                    continue;
                }
                pool.store_token_bundle(&filename, &bundle).await;
            }

            let mut refreshed_after_401 = false;
            loop {
                let access_token = bundle
                    .get("access_token")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let body = payload_with_project(payload, &bundle);

                let mut req = self
                    .http
                    .post(&url)
                    .header(reqwest::header::AUTHORIZATION, format!("Bearer {access_token}"))
                    .header(reqwest::header::USER_AGENT, USER_AGENT)
                    .header("X-Goog-Api-Client", API_CLIENT)
                    .header("Client-Metadata", CLIENT_METADATA)
                    .json(&body);
                if streaming {
                    req = req.header(reqwest::header::ACCEPT, "text/event-stream");
                }
                if let Some(t) = timeout {
                    req = req.timeout(t);
                }

                tracing::debug!(
                    credential = %filename,
                    model = %payload.model,
                    streaming,
                    attempt,
                    "sending backend request"
                );

                let resp = match req.send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(credential = %filename, error = %e, "backend request failed");
                        pool.record_error(&filename, 500, Some(model_key), cooldown_seconds)
                            .await;
                        break;
                    }
                };

                let status = resp.status();
                if status.is_success() {
                    pool.record_success(&filename).await;
                    return Ok(resp);
                }

                let code = status.as_u16();
                if code == 401 && !refreshed_after_401 {
                    // A 401 with an unexpired token means the expiry field
                    // lied; refresh once and retry the same credential.
                    refreshed_after_401 = true;
                    match self.refresh_access_token(&mut bundle).await {
                        Ok(()) => {
                            pool.store_token_bundle(&filename, &bundle).await;
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(credential = %filename, error = %e, "token refresh failed");
                        }
                    }
                }

                let body = resp.text().await.unwrap_or_default();
                pool.record_error(&filename, code, Some(model_key), cooldown_seconds)
                    .await;

                if code == 429 {
                    tracing::info!(credential = %filename, "backend rate limited, rotating");
                    last_status = Some((code, body));
                    break;
                }
                if status.is_server_error() {
                    tracing::warn!(credential = %filename, status = code, "backend server error, rotating");
                    last_status = Some((code, body));
                    break;
                }

                // Remaining 4xx are request-shaped problems another
                // credential will not fix.
                tracing::error!(credential = %filename, status = code, "backend rejected request");
                return Err(UpstreamError::Status { status: code, body });
            }
        }

        match last_status {
            Some((status, body)) => Err(UpstreamError::Status { status, body }),
            None => Err(UpstreamError::NoCredentials),
        }
    }

    /// Exchange the refresh token for a new access token and update the
    /// bundle's `access_token`/`expiry` in place.
    async fn refresh_access_token(&self, bundle: &mut Value) -> Result<(), UpstreamError> {
        let refresh_token = bundle
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        // The OAuth client comes from the credential bundle (Gemini CLI
        // writes it there), with an env override for custom clients.
        let client_id = bundle
            .get("client_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| std::env::var("GOOGLE_OAUTH_CLIENT_ID").ok())
            .unwrap_or_default();
        let client_secret = bundle
            .get("client_secret")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| std::env::var("GOOGLE_OAUTH_CLIENT_SECRET").ok())
            .unwrap_or_default();
        if refresh_token.is_empty() || client_id.is_empty() {
            return Err(UpstreamError::Status {
                status: 401,
                body: "credential bundle missing refresh_token or client_id".to_string(),
            });
        }

        let form = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let resp = self.http.post(TOKEN_URL).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let token_data: Value = resp.json().await?;
        let Some(access_token) = token_data.get("access_token").and_then(|v| v.as_str()) else {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: "no access token in refresh response".to_string(),
            });
        };
        let expires_in = token_data
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(3600);
        let expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in);

        bundle["access_token"] = Value::String(access_token.to_string());
        bundle["expiry"] = Value::String(expiry.to_rfc3339());
        tracing::info!("access token refreshed");
        Ok(())
    }
}

/// Inject the credential's project binding into the payload envelope.
fn payload_with_project(payload: &GeminiPayload, bundle: &Value) -> GeminiPayload {
    let mut out = payload.clone();
    out.project = bundle
        .get("project_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    out
}

/// Whether the bundle's access token is missing or (nearly) expired.
///
/// `expiry` is accepted as RFC 3339 or as epoch seconds; an unparsable
/// expiry is treated as expired so the refresh path decides.
fn token_expired(bundle: &Value) -> bool {
    if bundle
        .get("access_token")
        .and_then(|v| v.as_str())
        .map_or(true, |t| t.is_empty())
    {
        return true;
    }
    let Some(expiry) = bundle.get("expiry") else {
        return true;
    };

    let expiry_ts = match expiry {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp())
            .ok(),
        Value::Number(n) => n.as_f64().map(|f| f as i64),
        _ => None,
    };
    match expiry_ts {
        Some(ts) => ts <= chrono::Utc::now().timestamp() + EXPIRY_SKEW_SECONDS,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_or_blank_access_token_is_expired() {
        assert!(token_expired(&json!({})));
        assert!(token_expired(&json!({ "access_token": "" })));
        assert!(token_expired(&json!({ "access_token": "tok" })));
    }

    #[test]
    fn rfc3339_expiry_is_honored_with_skew() {
        let future = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        assert!(!token_expired(&json!({ "access_token": "tok", "expiry": future })));

        let soon = (chrono::Utc::now() + chrono::Duration::seconds(10)).to_rfc3339();
        assert!(token_expired(&json!({ "access_token": "tok", "expiry": soon })));

        let past = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        assert!(token_expired(&json!({ "access_token": "tok", "expiry": past })));
    }

    #[test]
    fn numeric_expiry_is_accepted() {
        let future = chrono::Utc::now().timestamp() + 3600;
        assert!(!token_expired(&json!({ "access_token": "tok", "expiry": future })));
        assert!(token_expired(&json!({ "access_token": "tok", "expiry": 0 })));
    }

    #[test]
    fn unparsable_expiry_counts_as_expired() {
        assert!(token_expired(
            &json!({ "access_token": "tok", "expiry": "not-a-date" })
        ));
    }

    #[test]
    fn project_is_injected_from_bundle() {
        let payload: GeminiPayload = serde_json::from_value(json!({
            "model": "gemini-2.5-pro",
            "request": {
                "contents": [],
                "generationConfig": {},
                "safetySettings": []
            }
        }))
        .unwrap();
        let with = payload_with_project(&payload, &json!({ "project_id": "proj-9" }));
        assert_eq!(with.project.as_deref(), Some("proj-9"));

        let without = payload_with_project(&payload, &json!({}));
        assert!(without.project.is_none());
    }
}
