//! SAML 2.0 browser-POST binding.
//!
//! Response validation, SP-initiated AuthnRequest redirects and SP metadata.
//! XML signatures are checked by samael when built with the `xmlsec` feature.

pub mod authn;
pub mod validator;
pub mod verifier;

pub use authn::{create_authn_request, sp_metadata};
pub use validator::{SamlValidator, ValidatedAssertion};
pub use verifier::{default_verifier, SignatureVerifier, UnavailableVerifier};
