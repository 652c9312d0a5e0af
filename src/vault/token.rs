//! Vault token lifecycle
//!
//! Keeps the shared client authenticated with minimal churn. A one-second
//! tick inspects the current token and either authenticates (no token, or
//! expired), renews (past half of its ttl), or does nothing.
//!
//! Any tick failure terminates the loop with that error. The loop does not
//! retry auth failures itself: the Vault client already retries transient
//! transport faults, and looping on a persistent auth failure would mask a
//! security-relevant misconfiguration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::vault::{AuthProvider, Secret, VaultApi};
use crate::{Error, Result, TOKEN_TICK_INTERVAL};

/// Status of the client's current token, computed fresh on every tick from
/// Vault's self-lookup. Never cached across ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenStatus {
    /// Whether the client has any token installed
    pub has_token: bool,
    /// Whether that token is past its expiry time
    pub expired: bool,
    /// Total lease duration reported by Vault
    pub ttl: Duration,
    /// Remaining lifetime of the token
    pub expires_in: Duration,
}

/// What a tick decided to do about the current token.
///
/// The decision is pure so the state machine can be tested without a client:
/// no token or an expired one re-authenticates, a token past half of its ttl
/// renews, anything else is left alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    /// Authenticate from scratch through the configured auth provider
    Authenticate,
    /// Extend the current token's lease without re-authenticating
    Renew,
    /// The token is healthy, do nothing
    Noop,
}

impl TickAction {
    /// Decide the action for a token status
    pub fn for_status(status: &TokenStatus) -> TickAction {
        if !status.has_token || status.expired {
            TickAction::Authenticate
        } else if status.expires_in <= status.ttl / 2 {
            // Integer duration truncation; no floating point drift
            TickAction::Renew
        } else {
            TickAction::Noop
        }
    }
}

/// Manages the shared client's Vault token for the lifetime of the process.
///
/// [`TokenManager::run_once`] performs a single tick, used to guarantee a
/// token exists before the signing controller starts. [`TokenManager::run`]
/// ticks once per second until cancelled or a tick fails.
pub struct TokenManager {
    client: Arc<dyn VaultApi>,
    auth_provider: Option<AuthProvider>,
}

impl TokenManager {
    /// Create a token manager over the shared client.
    ///
    /// Without an auth provider the manager can still renew a pre-installed
    /// token, but any tick that requires authentication fails with
    /// [`Error::NoAuthProvider`].
    pub fn new(client: Arc<dyn VaultApi>, auth_provider: Option<AuthProvider>) -> Self {
        Self {
            client,
            auth_provider,
        }
    }

    async fn current_status(&self) -> Result<TokenStatus> {
        if self.client.token().is_none() {
            return Ok(TokenStatus {
                has_token: false,
                ..TokenStatus::default()
            });
        }

        let secret = self
            .client
            .read("auth/token/lookup-self")
            .await
            .map_err(Error::TokenLookup)?;

        status_from_lookup(&secret, Utc::now())
    }

    async fn auth(&self) -> Result<()> {
        match &self.auth_provider {
            Some(provider) => provider.authenticate(self.client.as_ref()).await,
            None => Err(Error::NoAuthProvider),
        }
    }

    async fn renew(&self) -> Result<()> {
        // Increment 0 asks Vault to apply the token's default lease period
        self.client
            .write("auth/token/renew-self", json!({ "increment": 0 }))
            .await
            .map_err(Error::Renew)?;
        Ok(())
    }

    async fn tick(&self) -> Result<()> {
        let status = self.current_status().await?;

        match TickAction::for_status(&status) {
            TickAction::Authenticate => {
                if !status.has_token {
                    info!("no token - attempting auth");
                } else {
                    info!("token expired - attempting auth");
                }
                self.auth().await
            }
            TickAction::Renew => {
                info!(
                    expires_in_secs = status.expires_in.as_secs(),
                    ttl_secs = status.ttl.as_secs(),
                    "token halfway through ttl - attempting renewal"
                );
                self.renew().await
            }
            TickAction::Noop => Ok(()),
        }
    }

    /// Perform exactly one tick, returning the first error.
    ///
    /// Used as a synchronous "ensure I have a token" step before the signing
    /// controller starts.
    pub async fn run_once(&self) -> Result<()> {
        self.tick().await
    }

    /// Tick once per second until `cancel` fires (Ok) or a tick fails (Err).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = interval_at(
            Instant::now() + TOKEN_TICK_INTERVAL,
            TOKEN_TICK_INTERVAL,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("token lifecycle loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.tick().await?;
                }
            }
        }
    }
}

/// Derive a [`TokenStatus`] from a `lookup-self` response.
///
/// A malformed `expire_time` or `ttl` is a hard error: a status the manager
/// cannot interpret cannot be acted on safely, and treating it as "no token"
/// would silently re-authenticate forever.
fn status_from_lookup(secret: &Secret, now: DateTime<Utc>) -> Result<TokenStatus> {
    let expire_time = secret.data_str("expire_time").map_err(Error::TokenLookup)?;
    let expires = DateTime::parse_from_rfc3339(expire_time)
        .map_err(|e| Error::ParseExpireTime(format!("{expire_time:?}: {e}")))?
        .with_timezone(&Utc);

    let ttl = secret
        .data
        .get("ttl")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .ok_or_else(|| Error::ParseTtl("ttl missing or not an integer".into()))?;

    if now > expires {
        return Ok(TokenStatus {
            has_token: true,
            expired: true,
            ..TokenStatus::default()
        });
    }

    Ok(TokenStatus {
        has_token: true,
        expired: false,
        ttl: Duration::from_secs(ttl.max(0) as u64),
        expires_in: (expires - now).to_std().unwrap_or_default(),
    })
}
