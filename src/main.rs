//! vault-csr-signer - sign Kubernetes CSRs with a Vault PKI mount

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::api::Api;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vault_csr_signer::bootstrap::{self, kubeconfig, BootstrapConfig};
use vault_csr_signer::controller::{error_policy, reconcile, Context};
use vault_csr_signer::signer::{KubeCsrStatusWriter, VaultSigner};
use vault_csr_signer::vault::{AuthProvider, TokenManager, VaultClient, VaultConfig};
use vault_csr_signer::{
    DEFAULT_BOOTSTRAP_GROUP, DEFAULT_KUBERNETES_AUTH_MOUNT, DEFAULT_PKI_MOUNT,
    DEFAULT_SERVICE_TOKEN_FILE, DEFAULT_SIGNER_WORKERS, DEFAULT_VAULT_MAX_RETRIES,
};

/// vault-csr-signer - Kubernetes CSR signing backed by a Vault PKI mount
#[derive(Parser, Debug)]
#[command(name = "vault-csr-signer", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the certificate signing controller
    ///
    /// Signs approved CertificateSigningRequests using Vault's sign-verbatim
    /// endpoint. The controller needs the RBAC ClusterRole
    /// "system:controller:certificate-controller" to watch and update CSRs,
    /// and sufficient Vault permissions to call sign-verbatim on the PKI
    /// mount.
    Controller(ControllerArgs),

    /// Create a bootstrap certificate using vault
    ///
    /// Mints a client credential for a new node and writes it to disk as a
    /// kubeconfig. By default the PKI role must be pre-configured with the
    /// bootstrap group as its organization; --sign-verbatim keeps control of
    /// the group locally but requires access to the far more powerful
    /// sign-verbatim endpoint.
    Bootstrap(BootstrapArgs),
}

/// Vault auth method selection
#[derive(Clone, Copy, Debug, ValueEnum)]
enum AuthMethod {
    /// Exchange a service account JWT for a Vault token
    Kubernetes,
    /// Exchange a role id and secret id for a Vault token
    Approle,
}

/// Flags shared by every subcommand that talks to Vault
#[derive(Args, Debug)]
struct VaultArgs {
    /// Vault server address
    #[arg(long = "vault-address", env = "VAULT_CSR_SIGNER_VAULT_ADDRESS")]
    vault_address: String,

    /// Method to use for vault auth
    #[arg(long = "vault-auth", env = "VAULT_CSR_SIGNER_VAULT_AUTH", value_enum)]
    vault_auth: Option<AuthMethod>,

    /// Name of the kubernetes auth mount in vault
    #[arg(
        long = "kubernetes-auth-mount",
        env = "VAULT_CSR_SIGNER_KUBERNETES_AUTH_MOUNT",
        default_value = DEFAULT_KUBERNETES_AUTH_MOUNT
    )]
    kubernetes_auth_mount: String,

    /// Role to use when authenticating with vault using the service token
    #[arg(
        long = "kubernetes-auth-role",
        env = "VAULT_CSR_SIGNER_KUBERNETES_AUTH_ROLE",
        default_value = ""
    )]
    kubernetes_auth_role: String,

    /// File to load the service token from
    #[arg(
        long = "kubernetes-auth-token-file",
        env = "VAULT_CSR_SIGNER_KUBERNETES_AUTH_TOKEN_FILE",
        default_value = DEFAULT_SERVICE_TOKEN_FILE
    )]
    kubernetes_auth_token_file: PathBuf,

    /// Name of the approle auth mount in vault
    #[arg(
        long = "approle-auth-mount",
        env = "VAULT_CSR_SIGNER_APPROLE_AUTH_MOUNT",
        default_value = ""
    )]
    approle_auth_mount: String,

    /// Vault role id to use when authenticating with an approle
    #[arg(
        long = "approle-auth-roleid",
        env = "VAULT_CSR_SIGNER_APPROLE_AUTH_ROLEID",
        default_value = ""
    )]
    approle_auth_roleid: String,

    /// Vault secret id to use when authenticating with an approle
    #[arg(
        long = "approle-auth-secretid",
        env = "VAULT_CSR_SIGNER_APPROLE_AUTH_SECRETID",
        default_value = "",
        hide_env_values = true
    )]
    approle_auth_secretid: String,

    /// Retry budget for vault requests
    #[arg(
        long = "vault-max-retries",
        env = "VAULT_CSR_SIGNER_VAULT_MAX_RETRIES",
        default_value_t = DEFAULT_VAULT_MAX_RETRIES
    )]
    vault_max_retries: u32,
}

impl VaultArgs {
    fn client(&self) -> anyhow::Result<Arc<VaultClient>> {
        let client = VaultClient::new(VaultConfig {
            address: self.vault_address.clone(),
            max_retries: self.vault_max_retries,
        })
        .map_err(|e| anyhow::anyhow!("create vault client: {e}"))?;
        Ok(Arc::new(client))
    }

    fn auth_provider(&self) -> Option<AuthProvider> {
        match self.vault_auth {
            Some(AuthMethod::Kubernetes) => Some(AuthProvider::Kubernetes {
                mount: self.kubernetes_auth_mount.clone(),
                role: self.kubernetes_auth_role.clone(),
                token_file: self.kubernetes_auth_token_file.clone(),
            }),
            Some(AuthMethod::Approle) => Some(AuthProvider::AppRole {
                mount: self.approle_auth_mount.clone(),
                role_id: self.approle_auth_roleid.clone(),
                secret_id: self.approle_auth_secretid.clone(),
            }),
            None => None,
        }
    }
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    #[command(flatten)]
    vault: VaultArgs,

    /// Number of signing workers to run
    #[arg(
        long = "signer-workers",
        env = "VAULT_CSR_SIGNER_SIGNER_WORKERS",
        default_value_t = DEFAULT_SIGNER_WORKERS
    )]
    signer_workers: u16,

    /// PKI mount to use to sign certificates
    #[arg(
        long = "vault-pki-mount",
        env = "VAULT_CSR_SIGNER_VAULT_PKI_MOUNT",
        default_value = DEFAULT_PKI_MOUNT
    )]
    vault_pki_mount: String,

    /// Role to use; only its ttl applies to sign-verbatim
    #[arg(long = "vault-pki-role", env = "VAULT_CSR_SIGNER_VAULT_PKI_ROLE")]
    vault_pki_role: String,
}

/// Bootstrap mode arguments
#[derive(Args, Debug)]
struct BootstrapArgs {
    #[command(flatten)]
    vault: VaultArgs,

    /// Node name to use in the bootstrap certificate
    #[arg(long = "node-name", env = "VAULT_CSR_SIGNER_NODE_NAME")]
    node_name: String,

    /// Group name to use in the bootstrap certificate
    #[arg(
        long = "group-name",
        env = "VAULT_CSR_SIGNER_GROUP_NAME",
        default_value = DEFAULT_BOOTSTRAP_GROUP
    )]
    group_name: String,

    /// Use sign-verbatim to create the bootstrap certificate
    #[arg(long = "sign-verbatim", env = "VAULT_CSR_SIGNER_SIGN_VERBATIM")]
    sign_verbatim: bool,

    /// PKI mount to use to generate certificates
    #[arg(
        long = "vault-pki-mount",
        env = "VAULT_CSR_SIGNER_VAULT_PKI_MOUNT",
        default_value = DEFAULT_PKI_MOUNT
    )]
    vault_pki_mount: String,

    /// Role to use when issuing the certificate
    #[arg(long = "vault-pki-role", env = "VAULT_CSR_SIGNER_VAULT_PKI_ROLE")]
    vault_pki_role: String,

    /// TTL of the bootstrap certificate
    #[arg(
        long = "vault-pki-ttl",
        env = "VAULT_CSR_SIGNER_VAULT_PKI_TTL",
        default_value = "1h"
    )]
    vault_pki_ttl: String,

    /// URL of the apiserver written into the kubeconfig
    #[arg(
        long = "output-kubeconfig-master-url",
        env = "VAULT_CSR_SIGNER_OUTPUT_KUBECONFIG_MASTER_URL"
    )]
    output_kubeconfig_master_url: String,

    /// Allow insecure certificates for the apiserver
    #[arg(
        long = "output-kubeconfig-insecure",
        env = "VAULT_CSR_SIGNER_OUTPUT_KUBECONFIG_INSECURE"
    )]
    output_kubeconfig_insecure: bool,

    /// Path to write the kubeconfig to
    #[arg(
        long = "output-kubeconfig-path",
        env = "VAULT_CSR_SIGNER_OUTPUT_KUBECONFIG_PATH"
    )]
    output_kubeconfig_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Bootstrap(args) => run_bootstrap(args).await,
    }
}

/// Run the signing controller alongside the token lifecycle loop.
///
/// The two loops live and die together: a lifecycle failure shuts the
/// controller down and becomes the process exit error, an operator signal
/// stops both gracefully.
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let vault = args.vault.client()?;
    let manager = TokenManager::new(vault.clone(), args.vault.auth_provider());

    // Nothing can be signed without a token; fail fast before watching CSRs
    manager
        .run_once()
        .await
        .map_err(|e| anyhow::anyhow!("renewing vault token: {e}"))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("create kubernetes client: {e}"))?;
    let csrs: Api<CertificateSigningRequest> = Api::all(client.clone());

    let signer = Arc::new(VaultSigner::new(
        vault.clone(),
        Arc::new(KubeCsrStatusWriter::new(client)),
        args.vault_pki_mount.clone(),
        args.vault_pki_role.clone(),
    ));
    let ctx = Arc::new(Context { signer });

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let token_loop = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = manager.run(cancel.clone()).await;
            if result.is_err() {
                // Nothing can be correctly signed with no valid token
                cancel.cancel();
            }
            result
        })
    };

    tracing::info!(
        workers = args.signer_workers,
        mount = %args.vault_pki_mount,
        role = %args.vault_pki_role,
        "starting csr signing controller"
    );

    Controller::new(csrs, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(args.signer_workers))
        .graceful_shutdown_on(cancel.clone().cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(name = %obj.name, ?action, "csr reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "csr reconciliation error");
                }
            }
        })
        .await;

    // The controller stream has drained; stop the token loop too and surface
    // the error that may have caused all this
    cancel.cancel();
    token_loop
        .await
        .map_err(|e| anyhow::anyhow!("token lifecycle task panicked: {e}"))?
        .map_err(|e| anyhow::anyhow!("token lifecycle failed: {e}"))?;

    tracing::info!("controller shutting down");
    Ok(())
}

/// Mint a bootstrap credential and write it to disk as a kubeconfig
async fn run_bootstrap(args: BootstrapArgs) -> anyhow::Result<()> {
    let vault = args.vault.client()?;
    let manager = TokenManager::new(vault.clone(), args.vault.auth_provider());

    manager
        .run_once()
        .await
        .map_err(|e| anyhow::anyhow!("renewing vault token: {e}"))?;

    let config = BootstrapConfig {
        mount: args.vault_pki_mount,
        role: args.vault_pki_role,
        ttl: args.vault_pki_ttl,
        node_name: args.node_name,
    };

    let credential = if args.sign_verbatim {
        bootstrap::sign_node_credential(vault.as_ref(), &config, &args.group_name).await
    } else {
        bootstrap::issue_node_credential(vault.as_ref(), &config).await
    }
    .map_err(|e| anyhow::anyhow!("generate bootstrap certificate: {e}"))?;

    let bundle = kubeconfig::bootstrap_kubeconfig(
        &args.output_kubeconfig_master_url,
        args.output_kubeconfig_insecure,
        &credential,
    );
    kubeconfig::write_kubeconfig(&args.output_kubeconfig_path, &bundle).await?;

    tracing::info!(path = %args.output_kubeconfig_path.display(), "bootstrap kubeconfig written");
    Ok(())
}

/// Cancel both loops on SIGINT or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            cancel.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, exiting gracefully...");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, exiting gracefully...");
        }
    }

    cancel.cancel();
}
