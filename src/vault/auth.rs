//! Vault authentication providers
//!
//! The two machine-auth methods the operator supports. A provider is
//! immutable once constructed and has exactly one job: log in against its
//! auth mount and install the returned client token on the shared client.
//! Submitted secret material is not retained beyond the call.

use std::path::PathBuf;

use serde_json::json;
use tracing::debug;

use crate::vault::VaultApi;
use crate::{Error, Result};

/// Method used to authenticate against Vault and install the client token.
///
/// A closed set: components match on it exhaustively, and adding a method is
/// a deliberate API change rather than a new trait impl somewhere else.
#[derive(Clone)]
pub enum AuthProvider {
    /// Kubernetes service-account auth: exchange a locally mounted JWT for a
    /// client token
    Kubernetes {
        /// Name of the kubernetes auth mount in Vault
        mount: String,
        /// Vault role to authenticate as
        role: String,
        /// Path of the service account token file
        token_file: PathBuf,
    },
    /// AppRole auth: exchange a role id and secret id for a client token
    AppRole {
        /// Name of the approle auth mount in Vault
        mount: String,
        /// Role id to authenticate with
        role_id: String,
        /// Secret id to authenticate with
        secret_id: String,
    },
}

impl AuthProvider {
    /// Authenticate against Vault and install the returned token on `client`.
    ///
    /// Fails with [`Error::NoAuthInfo`] when the login succeeds at the HTTP
    /// level but carries no auth payload.
    pub async fn authenticate(&self, client: &dyn VaultApi) -> Result<()> {
        let secret = match self {
            AuthProvider::Kubernetes {
                mount,
                role,
                token_file,
            } => {
                debug!(mount = %mount, role = %role, "authenticating using kubernetes service account");

                let jwt = tokio::fs::read_to_string(token_file)
                    .await
                    .map_err(Error::TokenFile)?;

                client
                    .write(
                        &format!("auth/{mount}/login"),
                        json!({
                            "role": role,
                            "jwt": jwt.trim(),
                        }),
                    )
                    .await
                    .map_err(Error::Auth)?
            }
            AuthProvider::AppRole {
                mount,
                role_id,
                secret_id,
            } => {
                debug!(mount = %mount, role_id = %role_id, "authenticating using approle");

                client
                    .write(
                        &format!("auth/{mount}/login"),
                        json!({
                            "role_id": role_id,
                            "secret_id": secret_id,
                        }),
                    )
                    .await
                    .map_err(Error::Auth)?
            }
        };

        let auth = secret.auth.ok_or(Error::NoAuthInfo)?;
        client.set_token(auth.client_token);

        Ok(())
    }
}

impl std::fmt::Debug for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose secret ids in debug output
        match self {
            AuthProvider::Kubernetes {
                mount,
                role,
                token_file,
            } => f
                .debug_struct("Kubernetes")
                .field("mount", mount)
                .field("role", role)
                .field("token_file", token_file)
                .finish(),
            AuthProvider::AppRole { mount, role_id, .. } => f
                .debug_struct("AppRole")
                .field("mount", mount)
                .field("role_id", role_id)
                .finish_non_exhaustive(),
        }
    }
}
