//! OAuth 2.0 / OIDC authorization-code flow with PKCE.
//!
//! Builds authorization URLs, redeems codes, fetches user info and checks
//! ID tokens against the provider's JWKS when one is published.

pub mod client;
pub mod id_token;
pub mod jwks;
pub mod state;

pub use client::{
    generate_authorization_url, merge_claims, AuthorizationRequest, OAuthClient, TokenResponse,
};
pub use id_token::{decode_id_token, IdTokenVerifier};
pub use jwks::{JwksCache, JwksRegistry};
pub use state::{
    take_valid, AuthStateStore, PendingAuthorization, RedbAuthStateStore, DEFAULT_STATE_TTL_SECS,
};
