//! Service configuration.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::oidc::DEFAULT_STATE_TTL_SECS;
use crate::provider::SsoProvider;
use crate::session::SESSION_LIFETIME_HOURS;

pub const OAUTH_CALLBACK_PATH: &str = "/sso/oauth/callback";
pub const SAML_ACS_PATH: &str = "/sso/saml/acs";
pub const SAML_METADATA_PATH: &str = "/sso/saml/metadata";

/// True for a path on this origin: a leading `/`, not protocol-relative,
/// no backslashes or control characters.
pub fn is_local_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.starts_with("//")
        && !path.contains('\\')
        && !path.chars().any(char::is_control)
}

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "zentinel-sso")]
#[command(about = "Federated SSO service (SAML 2.0 and OAuth 2.0 / OIDC)")]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080", env = "SSO_LISTEN")]
    pub listen: SocketAddr,

    /// Path to the redb database file
    #[arg(long, default_value = "/var/lib/zentinel-sso/sso.redb", env = "SSO_DATABASE")]
    pub database: PathBuf,

    /// Public base URL of this service. Callback URLs are derived from it.
    #[arg(long, env = "SSO_BASE_URL")]
    pub base_url: String,

    /// Where the browser lands after a successful login
    #[arg(long, default_value = "/", env = "SSO_POST_LOGIN_REDIRECT")]
    pub post_login_redirect: String,

    /// SAML SP entity id (defaults to the metadata URL)
    #[arg(long, env = "SSO_SP_ENTITY_ID")]
    pub sp_entity_id: Option<String>,

    /// Lifetime of a pending OAuth authorization in seconds
    #[arg(long, default_value_t = DEFAULT_STATE_TTL_SECS, env = "SSO_STATE_TTL_SECS")]
    pub state_ttl_secs: u64,

    /// Clock skew tolerance for SAML and ID token validity checks
    #[arg(long, default_value_t = 300, env = "SSO_CLOCK_SKEW_SECS")]
    pub clock_skew_secs: u64,

    /// Timeout for calls to IdP endpoints
    #[arg(long, default_value_t = 10, env = "SSO_HTTP_TIMEOUT_SECS")]
    pub http_timeout_secs: u64,

    /// Session cookie name
    #[arg(long, default_value = "zentinel_sso_session", env = "SSO_COOKIE_NAME")]
    pub cookie_name: String,

    /// Session cookie domain
    #[arg(long, env = "SSO_COOKIE_DOMAIN")]
    pub cookie_domain: Option<String>,

    /// Send the session cookie over plain HTTP too
    #[arg(long, env = "SSO_COOKIE_INSECURE")]
    pub cookie_insecure: bool,

    /// JSON file with provider records, upserted at startup
    #[arg(long, env = "SSO_PROVIDERS_FILE")]
    pub providers_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "SSO_VERBOSE")]
    pub verbose: bool,
}

/// Session cookie attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
    pub same_site: String,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            name: "zentinel_sso_session".to_string(),
            domain: None,
            path: "/".to_string(),
            secure: true,
            same_site: "Lax".to_string(),
        }
    }
}

impl CookieSettings {
    /// Build the session cookie value.
    pub fn build_cookie(&self, session_id: &str, max_age_secs: u64) -> String {
        let mut cookie = format!("{}={}", self.name, session_id);

        if let Some(ref domain) = self.domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }

        cookie.push_str(&format!("; Path={}", self.path));

        if self.secure {
            cookie.push_str("; Secure");
        }

        cookie.push_str("; HttpOnly");
        cookie.push_str(&format!("; SameSite={}", self.same_site));
        cookie.push_str(&format!("; Max-Age={}", max_age_secs));

        cookie
    }

    /// Parse session ID from cookie header.
    pub fn parse_session_cookie(&self, cookie_header: &str) -> Option<String> {
        let prefix = format!("{}=", self.name);
        cookie_header
            .split(';')
            .filter_map(|part| part.trim().strip_prefix(prefix.as_str()))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(String::from)
    }
}

/// Resolved service configuration.
#[derive(Debug, Clone)]
pub struct SsoConfig {
    pub listen: SocketAddr,
    pub database_path: PathBuf,
    /// Fixed public base URL, no trailing slash.
    pub base_url: String,
    pub post_login_redirect: String,
    pub sp_entity_id: String,
    pub state_ttl_secs: u64,
    pub clock_skew_secs: u64,
    pub http_timeout_secs: u64,
    pub cookie: CookieSettings,
    pub providers_file: Option<PathBuf>,
}

impl SsoConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let base_url = args.base_url.trim().trim_end_matches('/').to_string();
        let sp_entity_id = args
            .sp_entity_id
            .clone()
            .unwrap_or_else(|| format!("{}{}", base_url, SAML_METADATA_PATH));

        let config = Self {
            listen: args.listen,
            database_path: args.database.clone(),
            base_url,
            post_login_redirect: args.post_login_redirect.clone(),
            sp_entity_id,
            state_ttl_secs: args.state_ttl_secs,
            clock_skew_secs: args.clock_skew_secs,
            http_timeout_secs: args.http_timeout_secs,
            cookie: CookieSettings {
                name: args.cookie_name.clone(),
                domain: args.cookie_domain.clone(),
                secure: !args.cookie_insecure,
                ..Default::default()
            },
            providers_file: args.providers_file.clone(),
        };

        config.validate().map_err(|e| anyhow!(e))?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| format!("base-url is not a valid URL: {}", e))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err("base-url must be an HTTP(S) URL".to_string());
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err("base-url must not carry a query or fragment".to_string());
        }

        if !is_local_path(&self.post_login_redirect) {
            return Err("post-login-redirect must be a path on this origin".to_string());
        }

        if self.sp_entity_id.trim().is_empty() {
            return Err("sp-entity-id must not be empty".to_string());
        }

        if self.state_ttl_secs == 0 {
            return Err("state-ttl-secs must be greater than 0".to_string());
        }

        if self.http_timeout_secs == 0 {
            return Err("http-timeout-secs must be greater than 0".to_string());
        }

        if self.cookie.name.is_empty() || self.cookie.name.contains(&[';', '=', ' '][..]) {
            return Err("cookie-name is not a valid cookie name".to_string());
        }

        Ok(())
    }

    /// OAuth `redirect_uri`.
    pub fn oauth_callback_url(&self) -> String {
        format!("{}{}", self.base_url, OAUTH_CALLBACK_PATH)
    }

    /// SAML assertion consumer service URL.
    pub fn acs_url(&self) -> String {
        format!("{}{}", self.base_url, SAML_ACS_PATH)
    }

    pub fn session_max_age_secs(&self) -> u64 {
        SESSION_LIFETIME_HOURS as u64 * 3600
    }
}

/// Read provider records from a JSON array file. Every record is validated.
pub fn load_providers_file(path: &Path) -> Result<Vec<SsoProvider>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read providers file: {:?}", path))?;
    let providers: Vec<SsoProvider> = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse providers file: {:?}", path))?;

    for provider in &providers {
        provider.validate().map_err(|e| anyhow!(e))?;
    }
    Ok(providers)
}
