//! Vault HTTP client
//!
//! A thin client over Vault's `/v1/` API carrying the single shared token.
//! Transport faults are retried with a bounded budget here and nowhere else;
//! callers treat any error that escapes this client as real.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::retry::{retry_transient, RetryConfig};

/// Vault client errors
#[derive(Debug, Error)]
pub enum VaultError {
    /// The HTTP request could not be completed
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Vault answered with a non-success status
    #[error("vault returned status {status}: {}", .errors.join("; "))]
    Api {
        /// HTTP status code returned by Vault
        status: u16,
        /// Messages from the response's `errors` list
        errors: Vec<String>,
    },

    /// A field the caller depends on was absent or of the wrong type
    #[error("missing field {0:?} in vault response")]
    MissingField(&'static str),
}

impl VaultError {
    /// Whether repeating the request could plausibly succeed.
    ///
    /// Connection-level faults and server errors are retried; everything
    /// else (permission denied, bad request, missing fields) fails fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            VaultError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            VaultError::Api { status, .. } => *status >= 500,
            VaultError::MissingField(_) => false,
        }
    }
}

/// A secret returned by a Vault read or write
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secret {
    /// Operation-specific payload (`data` object; explicitly null on logins)
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: serde_json::Map<String, Value>,
    /// Authentication payload, present on login and token operations
    #[serde(default)]
    pub auth: Option<SecretAuth>,
}

fn null_as_default<'de, D>(deserializer: D) -> Result<serde_json::Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

/// Authentication payload of a [`Secret`]
#[derive(Debug, Clone, Deserialize)]
pub struct SecretAuth {
    /// The client token issued by the auth mount
    pub client_token: String,
}

impl Secret {
    /// Extract a required string field from the secret's data
    pub fn data_str(&self, field: &'static str) -> Result<&str, VaultError> {
        self.data
            .get(field)
            .and_then(Value::as_str)
            .ok_or(VaultError::MissingField(field))
    }
}

/// Error body Vault attaches to non-success responses
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Vault API surface consumed by the token lifecycle, the signer and the
/// bootstrap flow.
///
/// The trait exists so those components can be tested against a mock without
/// a live Vault; production code always talks to [`VaultClient`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// The currently installed client token, if any
    fn token(&self) -> Option<String>;

    /// Install a new client token for subsequent calls
    fn set_token(&self, token: String);

    /// Read from a Vault path (GET `/v1/{path}`)
    async fn read(&self, path: &str) -> Result<Secret, VaultError>;

    /// Write to a Vault path (POST `/v1/{path}`)
    async fn write(&self, path: &str, payload: Value) -> Result<Secret, VaultError>;
}

/// Configuration for [`VaultClient`]
#[derive(Clone, Debug)]
pub struct VaultConfig {
    /// Base address of the Vault server, e.g. `https://vault:8200`
    pub address: String,
    /// Bounded retry budget for transport faults
    pub max_retries: u32,
}

impl VaultConfig {
    /// Create a config for the given address with the default retry budget
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            max_retries: crate::DEFAULT_VAULT_MAX_RETRIES,
        }
    }
}

/// The shared Vault client.
///
/// Holds at most one active token. The token lifecycle loop is the only
/// writer; the signer reads it implicitly on every call. Concurrent reads
/// and a racing replacement are safe: the old token stays valid until the
/// renew/auth call that replaces it completes.
pub struct VaultClient {
    address: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    retry: RetryConfig,
}

impl VaultClient {
    /// Create a new client for the given config
    pub fn new(config: VaultConfig) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            address: config.address.trim_end_matches('/').to_string(),
            http,
            token: RwLock::new(None),
            retry: RetryConfig::with_max_attempts(config.max_retries),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Secret, VaultError> {
        retry_transient(&self.retry, path, VaultError::is_retryable, || async {
            let mut req = self.http.request(method.clone(), self.url(path));
            if let Some(token) = self.token() {
                req = req.header("X-Vault-Token", token);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req.send().await?;
            let status = resp.status();
            debug!(path = %path, status = %status, "vault request");

            if status.is_success() {
                if status == StatusCode::NO_CONTENT {
                    return Ok(Secret::default());
                }
                return Ok(resp.json::<Secret>().await?);
            }

            let errors = resp
                .json::<ErrorBody>()
                .await
                .map(|b| b.errors)
                .unwrap_or_default();
            Err(VaultError::Api {
                status: status.as_u16(),
                errors,
            })
        })
        .await
    }
}

#[async_trait]
impl VaultApi for VaultClient {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn set_token(&self, token: String) {
        *self.token.write() = Some(token);
    }

    async fn read(&self, path: &str) -> Result<Secret, VaultError> {
        self.request(Method::GET, path, None).await
    }

    async fn write(&self, path: &str, payload: Value) -> Result<Secret, VaultError> {
        self.request(Method::POST, path, Some(&payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secret_deserializes_auth_payload() {
        let secret: Secret = serde_json::from_value(json!({
            "request_id": "5428be17",
            "lease_id": "",
            "data": null,
            "auth": {
                "client_token": "s.wOrq9dO9kzOcuvB06CMV",
                "accessor": "B6oixijqmeR4bsLOJH88Ska9",
                "policies": ["default", "pki-signer"],
                "lease_duration": 3600,
                "renewable": true
            }
        }))
        .unwrap();

        assert_eq!(
            secret.auth.unwrap().client_token,
            "s.wOrq9dO9kzOcuvB06CMV"
        );
        assert!(secret.data.is_empty());
    }

    #[test]
    fn secret_deserializes_data_payload() {
        let secret: Secret = serde_json::from_value(json!({
            "data": {
                "certificate": "-----BEGIN CERTIFICATE-----",
                "ttl": 3600
            }
        }))
        .unwrap();

        assert_eq!(
            secret.data_str("certificate").unwrap(),
            "-----BEGIN CERTIFICATE-----"
        );
        assert!(secret.auth.is_none());
    }

    #[test]
    fn data_str_reports_missing_and_mistyped_fields() {
        let secret: Secret = serde_json::from_value(json!({
            "data": { "ttl": 3600 }
        }))
        .unwrap();

        // Absent entirely
        assert!(matches!(
            secret.data_str("certificate"),
            Err(VaultError::MissingField("certificate"))
        ));

        // Present but not a string
        assert!(matches!(
            secret.data_str("ttl"),
            Err(VaultError::MissingField("ttl"))
        ));
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let denied = VaultError::Api {
            status: 403,
            errors: vec!["permission denied".into()],
        };
        assert!(!denied.is_retryable());

        let unavailable = VaultError::Api {
            status: 503,
            errors: vec!["vault is sealed".into()],
        };
        assert!(unavailable.is_retryable());

        assert!(!VaultError::MissingField("certificate").is_retryable());
    }

    #[test]
    fn client_token_starts_empty_and_is_replaceable() {
        let client = VaultClient::new(VaultConfig::new("http://127.0.0.1:8200/")).unwrap();
        assert_eq!(client.token(), None);

        client.set_token("s.first".into());
        assert_eq!(client.token(), Some("s.first".into()));

        // Single-scalar replacement; the previous token is simply dropped
        client.set_token("s.second".into());
        assert_eq!(client.token(), Some("s.second".into()));
    }

    #[test]
    fn url_joins_address_and_path() {
        let client = VaultClient::new(VaultConfig::new("http://vault:8200/")).unwrap();
        assert_eq!(
            client.url("pki/sign-verbatim/nodes"),
            "http://vault:8200/v1/pki/sign-verbatim/nodes"
        );
    }
}
