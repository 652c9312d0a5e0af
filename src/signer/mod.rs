//! CSR signing through Vault
//!
//! Turns one approved CertificateSigningRequest into a signed certificate via
//! Vault's `sign-verbatim` endpoint, and nothing else. Approval policy is not
//! decided here: an unapproved request is a successful no-op so the watch
//! machinery never treats it as an error.
//!
//! Requested usages are translated into Vault's vocabulary through two static
//! tables. A usage may appear in neither, one, or both tables ("signing" maps
//! only to a basic usage, "client auth" only to an extended one); unknown
//! usages are dropped silently.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::vault::VaultApi;
use crate::{Error, Result};

/// Translate a requested basic key usage into Vault's name for it
pub fn key_usage(usage: &str) -> Option<&'static str> {
    match usage {
        "signing" | "digital signature" => Some("DigitalSignature"),
        "content commitment" => Some("ContentCommitment"),
        "key encipherment" => Some("KeyEncipherment"),
        "key agreement" => Some("KeyAgreement"),
        "data encipherment" => Some("DataEncipherment"),
        "cert sign" => Some("CertSign"),
        "crl sign" => Some("CRLSign"),
        "encipher only" => Some("EncipherOnly"),
        "decipher only" => Some("DecipherOnly"),
        _ => None,
    }
}

/// Translate a requested extended key usage into Vault's name for it
pub fn ext_key_usage(usage: &str) -> Option<&'static str> {
    match usage {
        "any" => Some("Any"),
        "server auth" => Some("ServerAuth"),
        "client auth" => Some("ClientAuth"),
        "code signing" => Some("CodeSigning"),
        "email protection" | "s/mime" => Some("EmailProtection"),
        "ipsec end system" => Some("IPSECEndSystem"),
        "ipsec tunnel" => Some("IPSECTunnel"),
        "ipsec user" => Some("IPSECUser"),
        "timestamping" => Some("TimeStamping"),
        "ocsp signing" => Some("OCSPSigning"),
        "microsoft sgc" => Some("MicrosoftServerGatedCrypto"),
        "netscape sgc" => Some("NetscapeServerGatedCrypto"),
        _ => None,
    }
}

/// Map a request's usages through the basic usage table, dropping unknowns
pub fn key_usages(usages: &[String]) -> Vec<&'static str> {
    usages.iter().filter_map(|u| key_usage(u)).collect()
}

/// Map a request's usages through the extended usage table, dropping unknowns
pub fn ext_key_usages(usages: &[String]) -> Vec<&'static str> {
    usages.iter().filter_map(|u| ext_key_usage(u)).collect()
}

/// Whether a request has been approved and not denied.
///
/// Approval requires an `Approved` condition with status `"True"`; a `Denied`
/// condition with status `"True"` vetoes it regardless.
pub fn is_approved(csr: &CertificateSigningRequest) -> bool {
    let Some(conditions) = csr.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
        return false;
    };

    let mut approved = false;
    for condition in conditions {
        match condition.type_.as_str() {
            "Approved" if condition.status == "True" => approved = true,
            "Denied" if condition.status == "True" => return false,
            _ => {}
        }
    }
    approved
}

/// Write access to a request's status subresource.
///
/// The signer does not own the request's storage; the mutation is propagated
/// through this seam so tests can observe it without an apiserver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrStatusWriter: Send + Sync {
    /// Persist the request's updated status
    async fn update_status(
        &self,
        csr: &CertificateSigningRequest,
    ) -> std::result::Result<(), kube::Error>;
}

/// [`CsrStatusWriter`] backed by the Kubernetes API
pub struct KubeCsrStatusWriter {
    api: Api<CertificateSigningRequest>,
}

impl KubeCsrStatusWriter {
    /// Create a writer over the cluster-scoped CSR API
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CsrStatusWriter for KubeCsrStatusWriter {
    async fn update_status(
        &self,
        csr: &CertificateSigningRequest,
    ) -> std::result::Result<(), kube::Error> {
        let name = csr.name_any();
        let data = serde_json::to_vec(csr).map_err(kube::Error::SerdeError)?;
        self.api
            .replace_status(&name, &PostParams::default(), data)
            .await?;
        Ok(())
    }
}

/// Signs approved CertificateSigningRequests using Vault's sign-verbatim
/// endpoint on the configured PKI mount and role.
pub struct VaultSigner {
    vault: Arc<dyn VaultApi>,
    csrs: Arc<dyn CsrStatusWriter>,
    mount: String,
    role: String,
}

impl VaultSigner {
    /// Create a signer over the shared Vault client and a status writer
    pub fn new(
        vault: Arc<dyn VaultApi>,
        csrs: Arc<dyn CsrStatusWriter>,
        mount: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            vault,
            csrs,
            mount: mount.into(),
            role: role.into(),
        }
    }

    /// Process one request: sign it if approved and unsigned, no-op otherwise.
    ///
    /// Failures are returned to the caller; whether to requeue is the watch
    /// machinery's decision, the signer never retries on its own.
    pub async fn handle(&self, csr: &CertificateSigningRequest) -> Result<()> {
        let name = csr.name_any();

        if !is_approved(csr) {
            debug!(name = %name, "csr not approved, skipping");
            return Ok(());
        }

        if csr
            .status
            .as_ref()
            .and_then(|s| s.certificate.as_ref())
            .is_some()
        {
            debug!(name = %name, "csr already signed, skipping");
            return Ok(());
        }

        info!(name = %name, "signing csr using vault");

        let certificate = self.sign(csr).await?;

        let mut updated = csr.clone();
        updated
            .status
            .get_or_insert_with(Default::default)
            .certificate = Some(ByteString(certificate.into_bytes()));

        self.csrs
            .update_status(&updated)
            .await
            .map_err(|source| Error::UpdateStatus { name, source })
    }

    async fn sign(&self, csr: &CertificateSigningRequest) -> Result<String> {
        let request = String::from_utf8_lossy(&csr.spec.request.0);
        let usages = csr.spec.usages.clone().unwrap_or_default();

        // No ttl: the signing role's configured maximum lease governs duration
        let secret = self
            .vault
            .write(
                &format!("{}/sign-verbatim/{}", self.mount, self.role),
                json!({
                    "csr": request,
                    "key_usage": key_usages(&usages),
                    "ext_key_usage": ext_key_usages(&usages),
                }),
            )
            .await
            .map_err(Error::Sign)?;

        let mut certificate = secret.data_str("certificate").map_err(Error::Sign)?.to_string();
        if !certificate.ends_with('\n') {
            certificate.push('\n');
        }
        Ok(certificate)
    }
}
