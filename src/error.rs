//! Error types for the operator

use thiserror::Error;

use crate::vault::VaultError;

/// Main error type for signing and token lifecycle operations
///
/// Each variant names the operation stage it came from, so a failure can be
/// traced to its origin from the message alone. Lifecycle errors terminate
/// the process; signing errors are reported per request and retried by the
/// controller's error policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Auth was required but no auth method is configured
    #[error("no vault authentication method provided")]
    NoAuthProvider,

    /// Vault's login response carried no auth payload
    #[error("no auth info returned")]
    NoAuthInfo,

    /// The service account token file could not be read
    #[error("reading service token file: {0}")]
    TokenFile(#[source] std::io::Error),

    /// Login against the Vault auth mount failed
    #[error("authenticating with vault: {0}")]
    Auth(#[source] VaultError),

    /// Token self-lookup failed
    #[error("looking up own token: {0}")]
    TokenLookup(#[source] VaultError),

    /// The token expiry timestamp in the lookup response was malformed
    #[error("parsing token expire time: {0}")]
    ParseExpireTime(String),

    /// The token ttl in the lookup response was malformed
    #[error("parsing token ttl: {0}")]
    ParseTtl(String),

    /// Token renewal failed
    #[error("renewing token: {0}")]
    Renew(#[source] VaultError),

    /// The sign-verbatim call failed or returned an unusable response
    #[error("signing csr with vault: {0}")]
    Sign(#[source] VaultError),

    /// Writing the signed certificate back to the request failed
    #[error("updating certificate status for {name}: {source}")]
    UpdateStatus {
        /// Name of the CertificateSigningRequest being updated
        name: String,
        /// The underlying Kubernetes API error
        #[source]
        source: kube::Error,
    },

    /// The Vault call minting a bootstrap credential failed
    #[error("issuing bootstrap certificate: {0}")]
    BootstrapIssue(#[source] VaultError),

    /// Bootstrap key generation or CSR construction failed
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// Writing the generated kubeconfig failed
    #[error("writing kubeconfig to {path}: {source}")]
    WriteKubeconfig {
        /// Destination path of the kubeconfig
        path: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a bootstrap error with the given message
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Whether this error is a configuration problem that retrying cannot fix
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::NoAuthProvider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Failure Origin Is Readable From The Message
    // ==========================================================================
    //
    // Every Vault round-trip in this operator is wrapped with the stage it
    // belongs to. Operators debug from log lines, not backtraces, so each
    // stage must be distinguishable by message alone.

    /// Story: token lifecycle failures name their stage
    ///
    /// A lookup failure, a parse failure and a renewal failure all come from
    /// the same one-second tick, but must read differently in the fatal exit
    /// message.
    #[test]
    fn story_lifecycle_stages_are_distinguishable() {
        let lookup = Error::TokenLookup(VaultError::MissingField("data"));
        assert!(lookup.to_string().starts_with("looking up own token"));

        let parse = Error::ParseExpireTime("not a timestamp".into());
        assert!(parse.to_string().starts_with("parsing token expire time"));

        let ttl = Error::ParseTtl("ttl is not a number".into());
        assert!(ttl.to_string().starts_with("parsing token ttl"));

        let renew = Error::Renew(VaultError::MissingField("auth"));
        assert!(renew.to_string().starts_with("renewing token"));
    }

    /// Story: signing failures distinguish the Vault call from the write-back
    ///
    /// A request can fail against Vault or against the Kubernetes status
    /// update. The controller requeues both, but the operator reading logs
    /// needs to know which side rejected it.
    #[test]
    fn story_signing_stages_are_distinguishable() {
        let sign = Error::Sign(VaultError::MissingField("certificate"));
        assert!(sign.to_string().starts_with("signing csr with vault"));

        let update = Error::UpdateStatus {
            name: "node-csr-xkcd1".into(),
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "Operation cannot be fulfilled".into(),
                reason: "Conflict".into(),
                code: 409,
            }),
        };
        assert!(update
            .to_string()
            .starts_with("updating certificate status for node-csr-xkcd1"));
    }

    /// Story: a missing auth method is configuration, not a transient fault
    ///
    /// The lifecycle loop intentionally does not retry configuration errors.
    /// Looping on one would mask a security-relevant misconfiguration.
    #[test]
    fn story_no_auth_provider_is_configuration() {
        let err = Error::NoAuthProvider;
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "no vault authentication method provided");

        // Transient-looking failures are not configuration errors
        assert!(!Error::NoAuthInfo.is_configuration());
        assert!(!Error::Renew(VaultError::MissingField("auth")).is_configuration());
    }
}
