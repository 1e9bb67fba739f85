//! Node configuration. Files are JSON; every field has a default so a bare
//! `{}` is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub listen_host: String,
    pub control_port: u16,
    pub cert: String,
    pub key: String,
    pub database_path: String,
    pub blob_root: String,
    pub backup_path: Option<String>,
    pub backup_interval_secs: u64,
    pub channel_nesting_limit: u32,
    pub channel_count_limit: u32,
    pub listeners_per_channel: u32,
    pub listeners_per_user: u32,
    /// Cluster-wide session cap, 0 = unlimited.
    pub max_users: u32,
    pub max_bandwidth: u32,
    pub message_length: u32,
    pub welcome_text: String,
    pub allow_html: bool,
    /// Client version recommended via SuggestConfig, e.g. 0x10400.
    pub suggest_client_version: Option<u32>,
    pub auth: AuthConfig,
    pub autoban: AutoBanConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            control_port: 11080,
            cert: "cert.pem".to_string(),
            key: "key.pem".to_string(),
            database_path: "murmux-hub.db".to_string(),
            blob_root: "blobs".to_string(),
            backup_path: None,
            backup_interval_secs: 3600,
            channel_nesting_limit: 10,
            channel_count_limit: 1000,
            listeners_per_channel: 0,
            listeners_per_user: 0,
            max_users: 0,
            max_bandwidth: 144000,
            message_length: 512,
            welcome_text: "murmux cluster".to_string(),
            allow_html: false,
            suggest_client_version: None,
            auth: AuthConfig::default(),
            autoban: AutoBanConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Json,
    Form,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Credential endpoint URL; unset means certificate/guest auth only.
    pub endpoint: Option<String>,
    pub method: AuthMethod,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
    /// Serve from the cache when the endpoint is unreachable.
    pub cache_fallback: bool,
    pub username_field: String,
    pub password_field: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            method: AuthMethod::Json,
            timeout_secs: 5,
            cache_ttl_secs: 300,
            cache_fallback: false,
            username_field: "username".to_string(),
            password_field: "password".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBanConfig {
    /// Failed attempts from one IP inside the window that trigger a ban;
    /// 0 disables the counter.
    pub attempts: u32,
    pub timeframe_secs: u64,
    pub duration_secs: u32,
    /// A successful authentication resets the counter for that IP.
    #[serde(default = "default_true")]
    pub reset_on_success: bool,
}

impl Default for AutoBanConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            timeframe_secs: 120,
            duration_secs: 300,
            reset_on_success: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Address the hub and peer edges reach this node at; defaults to `host`.
    pub public_host: Option<String>,
    pub hub_host: String,
    pub hub_port: u16,
    pub region: Option<String>,
    pub capacity: u32,
    pub cert: String,
    pub key: String,
    /// Verify the hub certificate. Clusters with self-signed certificates
    /// leave this off or point `hub_ca` at the hub's certificate.
    pub hub_tls_verify: bool,
    /// PEM bundle the hub certificate must chain to when verification is on.
    pub hub_ca: Option<String>,
    /// Shared secret enabling the AES-128-CBC envelope on inter-edge voice.
    pub cluster_secret: Option<String>,
    pub client_timeout_secs: u64,
    pub rejoin_delay_secs: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            name: "edge".to_string(),
            host: "0.0.0.0".to_string(),
            port: 64738,
            public_host: None,
            hub_host: "127.0.0.1".to_string(),
            hub_port: 11080,
            region: None,
            capacity: 500,
            cert: "cert.pem".to_string(),
            key: "key.pem".to_string(),
            hub_tls_verify: false,
            hub_ca: None,
            cluster_secret: None,
            client_timeout_secs: 30,
            rejoin_delay_secs: 5,
        }
    }
}

impl EdgeConfig {
    /// Inter-edge voice rides one port above the client port.
    pub fn voice_port(&self) -> u16 {
        self.port.wrapping_add(1)
    }

    pub fn public_host(&self) -> &str {
        self.public_host.as_deref().unwrap_or(&self.host)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.name.is_empty() {
            problems.push("name must not be empty".to_string());
        }

        if self.port == 0 {
            problems.push("port must not be 0".to_string());
        }

        if self.port == u16::MAX {
            problems.push("port 65535 leaves no room for the voice port".to_string());
        }

        if self.capacity == 0 {
            problems.push("capacity must be at least 1".to_string());
        }

        if self.hub_host.is_empty() {
            problems.push("hub_host must not be empty".to_string());
        }

        if let Some(secret) = &self.cluster_secret {
            if secret.len() < 8 {
                problems.push("cluster_secret must be at least 8 characters".to_string());
            }
        }

        problems
    }
}

pub fn load<T: serde::de::DeserializeOwned + Default>(path: Option<&Path>) -> Result<T, String> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&raw).map_err(|e| format!("cannot parse {}: {e}", path.display()))
        }
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EdgeConfig::default().validate().is_empty());
        assert_eq!(EdgeConfig::default().voice_port(), 64739);
    }

    #[test]
    fn bad_edge_config_is_reported() {
        let config = EdgeConfig {
            port: 0,
            capacity: 0,
            ..Default::default()
        };
        let problems = config.validate();
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EdgeConfig = serde_json::from_str(r#"{"port": 12345, "hub_host": "hub.internal"}"#).unwrap();
        assert_eq!(config.port, 12345);
        assert_eq!(config.hub_host, "hub.internal");
        assert_eq!(config.hub_port, 11080);

        let hub: HubConfig = serde_json::from_str(r#"{"auth": {"endpoint": "https://auth/check"}}"#).unwrap();
        assert_eq!(hub.auth.endpoint.as_deref(), Some("https://auth/check"));
        assert_eq!(hub.auth.timeout_secs, 5);
    }
}
