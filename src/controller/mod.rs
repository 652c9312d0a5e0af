//! Controller wiring for the signer
//!
//! The watch/queue machinery itself comes from the kube runtime: it delivers
//! one request at a time, never re-delivers the same request key
//! concurrently, and retries failed reconciles with its own backoff. This
//! module is the thin adapter handing those deliveries to the signer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::signer::VaultSigner;
use crate::{Error, Result};

/// The signing capability the reconcile loop consumes.
///
/// [`VaultSigner`] is the production implementation; tests substitute a mock
/// to observe delivery without Vault or an apiserver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    /// Process one delivered request
    async fn handle(&self, csr: &CertificateSigningRequest) -> Result<()>;
}

#[async_trait]
impl Signer for VaultSigner {
    async fn handle(&self, csr: &CertificateSigningRequest) -> Result<()> {
        VaultSigner::handle(self, csr).await
    }
}

/// Shared state for CSR reconciliation
pub struct Context {
    /// The signer handling delivered requests
    pub signer: Arc<dyn Signer>,
}

/// Reconcile one CertificateSigningRequest.
///
/// All decisions live in the signer; a signed (or skipped) request needs no
/// requeue, the next watch event re-delivers it if anything changes.
pub async fn reconcile(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<Context>,
) -> Result<Action> {
    ctx.signer.handle(&csr).await?;
    Ok(Action::await_change())
}

/// Decide what to do when reconciliation fails.
///
/// Signing failures are per-request: requeue with a short delay and let the
/// runtime's backoff spread repeated failures out.
pub fn error_policy(
    csr: Arc<CertificateSigningRequest>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(name = %csr.name_any(), error = %error, "csr reconciliation failed, requeueing");
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::VaultError;
    use kube::api::ObjectMeta;

    fn csr(name: &str) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reconcile_hands_the_request_to_the_signer() {
        let mut signer = MockSigner::new();
        signer
            .expect_handle()
            .withf(|csr| csr.metadata.name.as_deref() == Some("node-csr-1"))
            .times(1)
            .returning(|_| Ok(()));

        let ctx = Arc::new(Context {
            signer: Arc::new(signer),
        });

        let action = reconcile(Arc::new(csr("node-csr-1")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn reconcile_propagates_signing_failures() {
        let mut signer = MockSigner::new();
        signer
            .expect_handle()
            .times(1)
            .returning(|_| Err(Error::Sign(VaultError::MissingField("certificate"))));

        let ctx = Arc::new(Context {
            signer: Arc::new(signer),
        });

        let err = reconcile(Arc::new(csr("node-csr-1")), ctx).await.unwrap_err();
        assert!(matches!(err, Error::Sign(_)));
    }

    #[tokio::test]
    async fn failed_requests_are_requeued() {
        let signer = MockSigner::new();
        let ctx = Arc::new(Context {
            signer: Arc::new(signer),
        });

        let action = error_policy(
            Arc::new(csr("node-csr-1")),
            &Error::Sign(VaultError::MissingField("certificate")),
            ctx,
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }
}
