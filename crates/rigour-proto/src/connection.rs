//! Connection record for the system under test.
//!
//! The record is owned by configuration loading; the core only relies on its
//! shape and on [`Connection::environment`], which resolves the descriptor the
//! executor hands to the test runner.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Protocol family of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Http,
    Websocket,
    Graphql,
    Grpc,
    Ui,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    Bearer,
    Basic,
    ApiKey,
    Oauth,
}

/// Authentication settings. Credential keys: `token`, `username`, `password`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSpec {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

impl AuthSpec {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            auth_type: AuthType::Bearer,
            credentials: BTreeMap::from([("token".to_string(), token.into())]),
        }
    }

    fn credential(&self, key: &str) -> Option<&str> {
        self.credentials
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_cert: None,
            client_cert: None,
            client_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default)]
    pub no_proxy: Vec<String>,
}

/// How to reach the system under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub connection_type: ConnectionType,
    pub base_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// The resolved descriptor an executor passes to the test runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub base_url: String,
    pub timeout: Duration,
    pub headers: BTreeMap<String, String>,
}

impl Connection {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            connection_type: ConnectionType::Http,
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
            auth: None,
            tls: TlsConfig::default(),
            proxy: None,
        }
    }

    /// Builds a connection from `RIGOUR_*` environment variables.
    ///
    /// - `RIGOUR_BASE_URL` (default `http://localhost:8000`)
    /// - `RIGOUR_AUTH_TYPE` / `RIGOUR_AUTH_TOKEN`
    /// - `RIGOUR_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Connection::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut connection = Self::new(
            lookup("RIGOUR_BASE_URL").unwrap_or_else(|| "http://localhost:8000".to_string()),
        );

        if let Some(timeout) = lookup("RIGOUR_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            connection.timeout_ms = timeout;
        }

        let auth_type = lookup("RIGOUR_AUTH_TYPE").and_then(|t| {
            serde_json::from_value::<AuthType>(serde_json::Value::String(t.to_lowercase())).ok()
        });
        if let Some(auth_type) = auth_type {
            let mut credentials = BTreeMap::new();
            for (key, var) in [
                ("token", "RIGOUR_AUTH_TOKEN"),
                ("username", "RIGOUR_USERNAME"),
                ("password", "RIGOUR_PASSWORD"),
            ] {
                if let Some(value) = lookup(var) {
                    credentials.insert(key.to_string(), value);
                }
            }
            connection.auth = Some(AuthSpec {
                auth_type,
                credentials,
            });
        }

        connection
    }

    /// Replaces `$VAR` credential values using `lookup`.
    ///
    /// Returns the names of variables that could not be resolved; those
    /// credentials are left empty.
    pub fn resolve_env_refs(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut missing = Vec::new();
        let Some(auth) = self.auth.as_mut() else {
            return missing;
        };

        for value in auth.credentials.values_mut() {
            if let Some(var) = value.strip_prefix('$') {
                match lookup(var) {
                    Some(resolved) => *value = resolved,
                    None => {
                        missing.push(var.to_string());
                        value.clear();
                    }
                }
            }
        }
        missing
    }

    /// Checks the record before any scene starts. Failure here is fatal.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(ValidationError::EmptyField { field: "base_url" });
        }
        match url.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {}
            _ => {
                return Err(ValidationError::InvalidConnection(format!(
                    "base_url '{url}' has no scheme"
                )));
            }
        }
        if self.timeout_ms == 0 {
            return Err(ValidationError::InvalidConnection(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ValidationError::InvalidConnection(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(proxy) = &self.proxy
            && proxy.url.trim().is_empty()
        {
            return Err(ValidationError::EmptyField { field: "proxy.url" });
        }
        Ok(())
    }

    /// The authorization header implied by `auth`, if any.
    pub fn auth_header(&self) -> Option<(String, String)> {
        let auth = self.auth.as_ref()?;
        match auth.auth_type {
            AuthType::Bearer | AuthType::Oauth => auth
                .credential("token")
                .map(|t| ("Authorization".to_string(), format!("Bearer {t}"))),
            AuthType::ApiKey => auth
                .credential("token")
                .map(|t| ("X-API-Key".to_string(), t.to_string())),
            AuthType::Basic => {
                let username = auth.credential("username")?;
                let password = auth.credential("password").unwrap_or_default();
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                Some(("Authorization".to_string(), format!("Basic {encoded}")))
            }
            AuthType::None => None,
        }
    }

    /// Default headers plus the auth header.
    pub fn resolved_headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        if let Some((name, value)) = self.auth_header() {
            headers.insert(name, value);
        }
        headers
    }

    pub fn environment(&self) -> Environment {
        Environment {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(self.timeout_ms),
            headers: self.resolved_headers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let connection: Connection =
            serde_yaml::from_str("base_url: https://api.example.com\n").unwrap();
        assert_eq!(connection.name, "default");
        assert_eq!(connection.connection_type, ConnectionType::Http);
        assert_eq!(connection.timeout_ms, 30_000);
        assert_eq!(connection.retry.max_attempts, 3);
        assert!(connection.tls.verify);
        assert!(connection.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        assert!(Connection::new("").validate().is_err());
        assert!(Connection::new("localhost:8000").validate().is_err());

        let mut zero_timeout = Connection::new("http://localhost");
        zero_timeout.timeout_ms = 0;
        assert!(zero_timeout.validate().is_err());

        let mut no_attempts = Connection::new("http://localhost");
        no_attempts.retry.max_attempts = 0;
        assert!(no_attempts.validate().is_err());
    }

    #[test]
    fn test_auth_headers() {
        let mut connection = Connection::new("http://localhost");
        connection.auth = Some(AuthSpec::bearer("abc"));
        assert_eq!(
            connection.auth_header(),
            Some(("Authorization".to_string(), "Bearer abc".to_string()))
        );

        connection.auth = Some(AuthSpec {
            auth_type: AuthType::ApiKey,
            credentials: BTreeMap::from([("token".to_string(), "k".to_string())]),
        });
        assert_eq!(
            connection.auth_header(),
            Some(("X-API-Key".to_string(), "k".to_string()))
        );

        connection.auth = Some(AuthSpec {
            auth_type: AuthType::Basic,
            credentials: BTreeMap::from([
                ("username".to_string(), "user".to_string()),
                ("password".to_string(), "pass".to_string()),
            ]),
        });
        // base64("user:pass")
        assert_eq!(
            connection.auth_header().unwrap().1,
            "Basic dXNlcjpwYXNz".to_string()
        );
    }

    #[test]
    fn test_environment_merges_headers() {
        let mut connection = Connection::new("http://localhost:8000/");
        connection
            .headers
            .insert("User-Agent".to_string(), "Rigour".to_string());
        connection.auth = Some(AuthSpec::bearer("t"));

        let env = connection.environment();
        assert_eq!(env.base_url, "http://localhost:8000");
        assert_eq!(env.timeout, Duration::from_secs(30));
        assert_eq!(env.headers.len(), 2);
    }

    #[test]
    fn test_resolve_env_refs() {
        let mut connection = Connection::new("http://localhost");
        connection.auth = Some(AuthSpec {
            auth_type: AuthType::Bearer,
            credentials: BTreeMap::from([("token".to_string(), "$API_TOKEN".to_string())]),
        });

        let missing = connection.clone().resolve_env_refs(|_| None);
        assert_eq!(missing, vec!["API_TOKEN".to_string()]);

        let missing = connection.resolve_env_refs(|k| (k == "API_TOKEN").then(|| "s3".into()));
        assert!(missing.is_empty());
        assert_eq!(connection.auth_header().unwrap().1, "Bearer s3");
    }

    #[test]
    fn test_from_lookup() {
        let connection = Connection::from_lookup(|key| match key {
            "RIGOUR_BASE_URL" => Some("https://staging".to_string()),
            "RIGOUR_AUTH_TYPE" => Some("Bearer".to_string()),
            "RIGOUR_AUTH_TOKEN" => Some("tok".to_string()),
            "RIGOUR_TIMEOUT_MS" => Some("500".to_string()),
            _ => None,
        });
        assert_eq!(connection.base_url, "https://staging");
        assert_eq!(connection.timeout_ms, 500);
        assert_eq!(connection.auth_header().unwrap().1, "Bearer tok");
    }
}
