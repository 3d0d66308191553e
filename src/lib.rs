//! Zentinel SSO
//!
//! Federated login for Zentinel: SAML 2.0 POST binding and OAuth 2.0 / OIDC
//! authorization code with PKCE. IdP claims are mapped to a canonical
//! identity, resolved to a local account (optionally auto-provisioned),
//! turned into an 8 hour SSO session, and every callback is audited.

pub mod audit;
pub mod callback;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod oidc;
pub mod provider;
pub mod saml;
pub mod session;
pub mod storage;

pub use callback::{router, CallbackOutcome, CallbackStage, SsoController, SsoStores};
pub use config::{Args, SsoConfig};
pub use error::{ErrorCategory, SsoError, SsoResult};
