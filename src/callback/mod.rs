//! Callback controllers and their HTTP routes.
//!
//! A callback moves `received -> provider_resolved -> identity_validated ->
//! attributes_mapped -> domain_checked -> account_resolved ->
//! session_created -> redirected`, or fails from any of them. Each callback
//! writes exactly one login-attempt record.

pub mod controller;
pub mod outcome;
pub mod routes;

pub use controller::{OAuthCallbackParams, SamlCallbackForm, SsoController, SsoStores};
pub use outcome::{CallbackOutcome, CallbackStage};
pub use routes::{router, SessionView};
