//! The hub's authenticate coordinator: checks credentials against the
//! configured external endpoint, caches successes, and reports certificate
//! fingerprints out of band.

use crate::config::{AuthConfig, AuthMethod};
use crate::proto::mumble::reject::RejectType;
use crate::rpc::{AuthResult, ClientInfo};
use ring::digest;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Reject code the credential endpoint uses for a bad username/password.
const ENDPOINT_REJECT_WRONG_USER_PW: i64 = 2;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication service unavailable: {0}")]
    Unavailable(String),
}

struct CachedAuth {
    result: AuthResult,
    at: Instant,
}

pub struct Authenticator {
    config: AuthConfig,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, CachedAuth>>,
}

fn cache_key(username: &str, password: &str) -> String {
    let hashed = digest::digest(&digest::SHA256, password.as_bytes());

    format!("{}:{}", username, crate::blob::bytes_to_hex(hashed.as_ref()))
}

/// SuperUser status comes from endpoint group membership.
pub fn is_super_user(groups: &[String]) -> bool {
    groups.iter().any(|group| group == "admin" || group == "superuser")
}

fn rejected(kind: RejectType, reason: &str) -> AuthResult {
    AuthResult {
        success: false,
        reject_type: Some(kind as i32),
        reason: Some(reason.to_string()),
        ..Default::default()
    }
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("cannot build http client");

        Self {
            config,
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: Option<&str>,
        tokens: &[String],
        client_info: &ClientInfo,
    ) -> Result<AuthResult, AuthError> {
        let endpoint = match &self.config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                // no credential service configured: everyone is a guest
                return Ok(AuthResult {
                    success: true,
                    user_id: 0,
                    username: username.to_string(),
                    ..Default::default()
                });
            }
        };

        let password = password.unwrap_or_default();
        let key = cache_key(username, password);

        if let Some(cached) = self.cache_lookup(&key, Duration::from_secs(self.config.cache_ttl_secs)) {
            return Ok(cached);
        }

        let response = self.post_credentials(&endpoint, username, password, tokens, client_info).await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                if self.config.cache_fallback {
                    if let Some(stale) = self.cache_lookup(&key, Duration::from_secs(u64::MAX / 4)) {
                        tracing::warn!("credential endpoint unreachable, serving cached result: {}", e);

                        return Ok(stale);
                    }
                }

                return Err(AuthError::Unavailable(e.to_string()));
            }
        };

        let status = response.status();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Ok(rejected(RejectType::WrongUserPw, "wrong username or password"));
        }

        if !status.is_success() {
            return Err(AuthError::Unavailable(format!("credential endpoint returned {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(format!("credential endpoint body: {e}")))?;

        let result = parse_endpoint_reply(username, &body);

        if result.success {
            self.cache_store(key, &result);
            self.report_certificate(username, client_info.cert_hash.as_deref());
        }

        Ok(result)
    }

    async fn post_credentials(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
        tokens: &[String],
        client_info: &ClientInfo,
    ) -> Result<reqwest::Response, reqwest::Error> {
        match self.config.method {
            AuthMethod::Json => {
                let mut payload = json!({
                    "tokens": tokens,
                    "ip": client_info.ip,
                    "release": client_info.release,
                    "os": client_info.os,
                });
                payload[self.config.username_field.as_str()] = json!(username);
                payload[self.config.password_field.as_str()] = json!(password);

                self.http.post(endpoint).json(&payload).send().await
            }
            AuthMethod::Form => {
                let mut form: Vec<(String, String)> = vec![
                    (self.config.username_field.clone(), username.to_string()),
                    (self.config.password_field.clone(), password.to_string()),
                    ("ip".to_string(), client_info.ip.clone()),
                ];

                for token in tokens {
                    form.push(("tokens[]".to_string(), token.clone()));
                }

                self.http.post(endpoint).form(&form).send().await
            }
        }
    }

    fn cache_lookup(&self, key: &str, ttl: Duration) -> Option<AuthResult> {
        let cache = self.cache.lock().ok()?;
        let cached = cache.get(key)?;

        if cached.at.elapsed() > ttl {
            return None;
        }

        Some(cached.result.clone())
    }

    fn cache_store(&self, key: String, result: &AuthResult) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                key,
                CachedAuth {
                    result: result.clone(),
                    at: Instant::now(),
                },
            );
        }
    }

    /// Certificate fingerprints are interesting to the credential service
    /// but never gate the login; fire and forget.
    fn report_certificate(&self, username: &str, cert_hash: Option<&str>) {
        let (endpoint, hash) = match (&self.config.endpoint, cert_hash) {
            (Some(endpoint), Some(hash)) => (endpoint.clone(), hash.to_string()),
            _ => return,
        };

        let http = self.http.clone();
        let username = username.to_string();

        actix_rt::spawn(async move {
            let payload = json!({ "username": username, "certificate_hash": hash });

            if let Err(e) = http.post(&endpoint).json(&payload).send().await {
                tracing::debug!("certificate report failed: {}", e);
            }
        });
    }
}

/// Maps the endpoint's reply shape onto an AuthResult. Recognized fields:
/// `success`, `user_id`/`id`, `username`, `displayName`, `groups`,
/// `rejectType` (2 = wrong user/password, 0 = unspecified), `reason`.
fn parse_endpoint_reply(requested_username: &str, body: &Value) -> AuthResult {
    let success = body.get("success").and_then(Value::as_bool).unwrap_or(false);

    if !success {
        let reject_type = body.get("rejectType").and_then(Value::as_i64);
        let reason = body
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("authentication failed")
            .to_string();

        let kind = match reject_type {
            Some(ENDPOINT_REJECT_WRONG_USER_PW) => RejectType::WrongUserPw,
            _ => RejectType::None,
        };

        return rejected(kind, &reason);
    }

    let user_id = body
        .get("user_id")
        .or_else(|| body.get("id"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    let username = body
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or(requested_username)
        .to_string();

    let display_name = body.get("displayName").and_then(Value::as_str).map(str::to_string);

    let groups: Vec<String> = body
        .get("groups")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let super_user = is_super_user(&groups);

    AuthResult {
        success: true,
        user_id,
        username,
        display_name,
        groups,
        super_user,
        reject_type: None,
        reason: None,
        last_channel: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_auth_without_endpoint() {
        let authenticator = Authenticator::new(AuthConfig::default());
        let info = ClientInfo {
            ip: "127.0.0.1".to_string(),
            ip_version: 4,
            release: "1.4.0".to_string(),
            version: 0x10400,
            os: "linux".to_string(),
            os_version: "6.1".to_string(),
            cert_hash: None,
        };

        let result = actix_rt::System::new().block_on(async {
            authenticator.authenticate("alice", Some("pw"), &[], &info).await.unwrap()
        });

        assert!(result.success);
        assert_eq!(result.user_id, 0);
        assert_eq!(result.username, "alice");
    }

    #[test]
    fn super_user_from_groups() {
        assert!(is_super_user(&["admin".to_string()]));
        assert!(is_super_user(&["x".to_string(), "superuser".to_string()]));
        assert!(!is_super_user(&["users".to_string()]));
    }

    #[test]
    fn endpoint_reply_success_shape() {
        let body = serde_json::json!({
            "success": true,
            "user_id": 42,
            "username": "Alice",
            "displayName": "Alice A.",
            "groups": ["admin", "dev"],
        });

        let result = parse_endpoint_reply("alice", &body);
        assert!(result.success);
        assert_eq!(result.user_id, 42);
        assert_eq!(result.username, "Alice");
        assert!(result.super_user);
    }

    #[test]
    fn endpoint_reply_reject_shape() {
        let body = serde_json::json!({ "success": false, "rejectType": 2, "reason": "nope" });

        let result = parse_endpoint_reply("alice", &body);
        assert!(!result.success);
        assert_eq!(result.reject_type, Some(RejectType::WrongUserPw as i32));
        assert_eq!(result.reason.as_deref(), Some("nope"));
    }

    #[test]
    fn cache_key_is_password_sensitive() {
        assert_ne!(cache_key("alice", "one"), cache_key("alice", "two"));
        assert_ne!(cache_key("alice", "pw"), cache_key("bob", "pw"));
        assert_eq!(cache_key("alice", "pw"), cache_key("alice", "pw"));
    }
}
