//! Vault integration
//!
//! Everything that talks to Vault lives here: the HTTP client shared by the
//! whole process, the authentication providers that can mint its token, and
//! the lifecycle loop that keeps that token valid.
//!
//! # Token ownership
//!
//! The client holds at most one active token. The [`token::TokenManager`] is
//! the sole writer (directly on renewal, through an [`auth::AuthProvider`] on
//! login); the signer and bootstrap flows only read it implicitly by issuing
//! calls through the shared client handle.

pub mod auth;
pub mod client;
pub mod token;

pub use auth::AuthProvider;
pub use client::{Secret, SecretAuth, VaultApi, VaultClient, VaultConfig, VaultError};
pub use token::{TickAction, TokenManager, TokenStatus};
