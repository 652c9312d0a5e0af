//! vault-csr-signer - Kubernetes CSR signing backed by a Vault PKI mount
//!
//! This operator bridges the Kubernetes certificate-request workflow and a
//! Vault PKI secrets engine. Approved CertificateSigningRequests are signed
//! through Vault's `sign-verbatim` endpoint, and the process keeps its own
//! Vault token alive for as long as it runs.
//!
//! # Architecture
//!
//! Two loops share a single Vault client:
//! - A token lifecycle loop checks the client token every second and
//!   authenticates or renews it as needed. Its failure is fatal: nothing can
//!   be signed without a valid token, so the signing loop is shut down too.
//! - The kube runtime controller watches CertificateSigningRequests and
//!   feeds approved ones to the signer, one in-flight reconcile per request.
//!
//! A one-shot `bootstrap` mode mints an initial node credential (key,
//! certificate, CA chain) and writes it to disk as a kubeconfig, for nodes
//! that have nothing to authenticate with yet.
//!
//! # Modules
//!
//! - [`vault`] - Vault API client, auth providers, token lifecycle
//! - [`signer`] - CSR signing through Vault sign-verbatim
//! - [`bootstrap`] - One-shot node credential issuance + kubeconfig output
//! - [`controller`] - Kubernetes controller wiring for the signer
//! - [`retry`] - Bounded retry used by the Vault client
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod bootstrap;
pub mod controller;
pub mod error;
pub mod retry;
pub mod signer;
pub mod vault;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Defaults shared by the CLI, the controller wiring, and test fixtures.

/// Default number of concurrent signing workers
pub const DEFAULT_SIGNER_WORKERS: u16 = 4;

/// Default Vault PKI mount path
pub const DEFAULT_PKI_MOUNT: &str = "pki";

/// Default Vault kubernetes auth mount path
pub const DEFAULT_KUBERNETES_AUTH_MOUNT: &str = "kubernetes";

/// Default service account token path inside a pod
pub const DEFAULT_SERVICE_TOKEN_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Default group carried by bootstrap certificates
pub const DEFAULT_BOOTSTRAP_GROUP: &str = "system:bootstrappers";

/// How often the token lifecycle loop checks the current token
pub const TOKEN_TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Bounded retry budget for Vault HTTP calls
pub const DEFAULT_VAULT_MAX_RETRIES: u32 = 10;
