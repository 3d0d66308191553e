//! SSO provider configuration records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Federation protocol of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Saml,
    Oauth,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Saml => "saml",
            Protocol::Oauth => "oauth",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tenant's IdP binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SsoProvider {
    /// Provider identifier (also the SAML RelayState).
    pub id: String,

    /// Organization that owns accounts created through this provider.
    pub organization_id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allowed email domains. Empty means unrestricted.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Create accounts on first login.
    #[serde(default)]
    pub auto_provision: bool,

    /// Canonical field name -> provider claim/attribute name.
    #[serde(default)]
    pub attribute_mapping: AttributeMapping,

    /// Protocol-specific settings. Exactly one protocol per provider.
    pub protocol: ProtocolSettings,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolSettings {
    Oauth(OAuthSettings),
    Saml(SamlSettings),
}

/// OAuth 2.0 / OIDC client registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OAuthSettings {
    #[serde(default)]
    pub client_id: String,

    /// Omitted for public clients.
    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub authorization_endpoint: String,

    #[serde(default)]
    pub token_endpoint: String,

    #[serde(default)]
    pub user_info_endpoint: Option<String>,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// JWKS used to verify ID token signatures.
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Expected `iss` of ID tokens.
    #[serde(default)]
    pub issuer: Option<String>,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string(), "email".to_string(), "profile".to_string()]
}

impl OAuthSettings {
    pub fn requests_openid(&self) -> bool {
        self.scopes.iter().any(|s| s == "openid")
    }
}

/// SAML 2.0 IdP binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SamlSettings {
    /// Expected issuer of assertions.
    #[serde(default)]
    pub idp_entity_id: Option<String>,

    /// IdP SSO URL for SP-initiated login.
    #[serde(default)]
    pub idp_sso_url: Option<String>,

    /// IdP signing certificate (PEM, or bare base64 DER).
    #[serde(default)]
    pub idp_certificate: String,

    /// Overrides the SP entity id as the expected audience.
    #[serde(default)]
    pub audience: Option<String>,
}

/// Canonical field -> source claim name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMapping(BTreeMap<String, String>);

impl AttributeMapping {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, field: &str, source: &str) -> Self {
        self.0.insert(field.to_string(), source.to_string());
        self
    }

    pub fn source_for(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl SsoProvider {
    pub fn protocol(&self) -> Protocol {
        match self.protocol {
            ProtocolSettings::Oauth(_) => Protocol::Oauth,
            ProtocolSettings::Saml(_) => Protocol::Saml,
        }
    }

    pub fn oauth(&self) -> Option<&OAuthSettings> {
        match &self.protocol {
            ProtocolSettings::Oauth(settings) => Some(settings),
            ProtocolSettings::Saml(_) => None,
        }
    }

    pub fn saml(&self) -> Option<&SamlSettings> {
        match &self.protocol {
            ProtocolSettings::Saml(settings) => Some(settings),
            ProtocolSettings::Oauth(_) => None,
        }
    }

    /// Check the email's domain against the allow-list.
    pub fn allows_email(&self, email: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let Some(domain) = email_domain(email) else {
            return false;
        };
        self.allowed_domains
            .iter()
            .any(|allowed| allowed.trim().trim_start_matches('@').eq_ignore_ascii_case(domain))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("provider id is required".to_string());
        }
        if self.organization_id.trim().is_empty() {
            return Err(format!("provider {}: organization-id is required", self.id));
        }

        match &self.protocol {
            ProtocolSettings::Oauth(oauth) => {
                if oauth.client_id.is_empty() {
                    return Err(format!("provider {}: client-id is required", self.id));
                }
                require_http_url(&self.id, "authorization-endpoint", &oauth.authorization_endpoint)?;
                require_http_url(&self.id, "token-endpoint", &oauth.token_endpoint)?;
                if let Some(ref url) = oauth.user_info_endpoint {
                    require_http_url(&self.id, "user-info-endpoint", url)?;
                }
                if let Some(ref url) = oauth.jwks_uri {
                    require_http_url(&self.id, "jwks-uri", url)?;
                }
                if oauth.scopes.is_empty() {
                    return Err(format!("provider {}: at least one scope is required", self.id));
                }
            }
            ProtocolSettings::Saml(saml) => {
                if saml.idp_certificate.trim().is_empty() {
                    return Err(format!("provider {}: idp-certificate is required", self.id));
                }
                if let Some(ref url) = saml.idp_sso_url {
                    require_http_url(&self.id, "idp-sso-url", url)?;
                }
            }
        }

        Ok(())
    }
}

/// Domain part of an email address, if it has one.
pub fn email_domain(email: &str) -> Option<&str> {
    let (local, domain) = email.trim().rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(domain)
}

fn require_http_url(provider: &str, field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("provider {}: {} is required", provider, field));
    }
    if !value.starts_with("https://") && !value.starts_with("http://") {
        return Err(format!(
            "provider {}: {} must be a valid HTTP(S) URL",
            provider, field
        ));
    }
    Ok(())
}
