//! SSO provider configuration.

pub mod store;
pub mod types;

pub use store::{ProviderStore, RedbProviderStore};
pub use types::{
    email_domain, AttributeMapping, OAuthSettings, Protocol, ProtocolSettings, SamlSettings,
    SsoProvider,
};
