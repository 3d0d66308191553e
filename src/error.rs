//! Error taxonomy for federated login.
//!
//! Every failure a callback can end in is one [`SsoError`] variant. Variants
//! are grouped into an [`ErrorCategory`], carry a stable machine code for the
//! audit log, and map to exactly one HTTP status.

use thiserror::Error;

/// Coarse grouping used for logging and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Request was missing required parameters.
    Input,
    /// Provider is misconfigured. Operator-facing.
    Configuration,
    /// The IdP interaction failed or was rejected.
    Protocol,
    /// Security policy intentionally blocked the login.
    Policy,
    /// CSRF/replay protection rejected the request.
    State,
    /// Data layer failure.
    Persistence,
}

/// Failure of an SSO operation.
#[derive(Debug, Error)]
pub enum SsoError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("provider misconfigured: {0}")]
    Configuration(String),

    #[error("unknown SSO provider: {0}")]
    ProviderNotFound(String),

    #[error("SSO provider {0} is disabled")]
    ProviderDisabled(String),

    #[error("SSO provider {provider} does not use the {expected} protocol")]
    ProtocolMismatch {
        provider: String,
        expected: &'static str,
    },

    #[error("identity provider denied authorization: {0}")]
    AuthorizationDenied(String),

    #[error("token exchange failed ({status}): {body}")]
    TokenExchange { status: u16, body: String },

    #[error("token refresh failed ({status}): {body}")]
    TokenRefresh { status: u16, body: String },

    /// `status` is 0 when the endpoint never rejected the request, and
    /// `body` is then a local reason.
    #[error("user info request failed ({status}): {body}")]
    UserInfo { status: u16, body: String },

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("SAML validation failed: {0}")]
    SamlValidation(String),

    #[error("identity provider did not supply an email address")]
    MissingEmail,

    #[error("email domain {0} is not allowed for this provider")]
    DomainNotAllowed(String),

    #[error("no account exists for {0} and auto-provisioning is disabled")]
    AccountNotProvisioned(String),

    #[error("unknown or already used login state")]
    InvalidState,

    #[error("login state has expired")]
    ExpiredState,

    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

impl SsoError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingParameter(_) => ErrorCategory::Input,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::ProviderNotFound(_)
            | Self::ProtocolMismatch { .. }
            | Self::AuthorizationDenied(_)
            | Self::TokenExchange { .. }
            | Self::TokenRefresh { .. }
            | Self::UserInfo { .. }
            | Self::MalformedToken(_)
            | Self::SamlValidation(_) => ErrorCategory::Protocol,
            Self::ProviderDisabled(_)
            | Self::MissingEmail
            | Self::DomainNotAllowed(_)
            | Self::AccountNotProvisioned(_) => ErrorCategory::Policy,
            Self::InvalidState | Self::ExpiredState => ErrorCategory::State,
            Self::Persistence(_) => ErrorCategory::Persistence,
        }
    }

    /// Stable code written to the audit log and returned as `error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingParameter(_) => "missing_parameter",
            Self::Configuration(_) => "configuration_error",
            Self::ProviderNotFound(_) => "provider_not_found",
            Self::ProviderDisabled(_) => "provider_disabled",
            Self::ProtocolMismatch { .. } => "protocol_mismatch",
            Self::AuthorizationDenied(_) => "authorization_denied",
            Self::TokenExchange { .. } => "token_exchange_error",
            Self::TokenRefresh { .. } => "token_refresh_error",
            Self::UserInfo { .. } => "user_info_error",
            Self::MalformedToken(_) => "malformed_token",
            Self::SamlValidation(_) => "saml_validation_error",
            Self::MissingEmail => "missing_email",
            Self::DomainNotAllowed(_) => "domain_not_allowed",
            Self::AccountNotProvisioned(_) => "account_not_provisioned",
            Self::InvalidState => "invalid_state",
            Self::ExpiredState => "expired_state",
            Self::Persistence(_) => "authentication_failed",
        }
    }

    /// HTTP status returned to the browser.
    pub fn status(&self) -> u16 {
        match self {
            Self::ProviderNotFound(_) => 404,
            Self::ExpiredState => 410,
            Self::Configuration(_) | Self::Persistence(_) => 500,
            Self::ProviderDisabled(_)
            | Self::MissingEmail
            | Self::DomainNotAllowed(_)
            | Self::AccountNotProvisioned(_) => 403,
            Self::MissingParameter(_)
            | Self::ProtocolMismatch { .. }
            | Self::AuthorizationDenied(_)
            | Self::TokenExchange { .. }
            | Self::TokenRefresh { .. }
            | Self::UserInfo { .. }
            | Self::MalformedToken(_)
            | Self::SamlValidation(_)
            | Self::InvalidState => 400,
        }
    }

    /// Message safe to show to the browser. Internal failures and the raw
    /// IdP error bodies stay server-side.
    pub fn public_details(&self) -> Option<String> {
        match self {
            Self::Configuration(_) | Self::Persistence(_) => None,
            Self::TokenExchange { status, .. } => {
                Some(format!("token endpoint rejected the authorization code ({status})"))
            }
            Self::TokenRefresh { status, .. } => {
                Some(format!("token endpoint rejected the refresh token ({status})"))
            }
            Self::UserInfo { status: 0, body } => Some(format!("user info request failed: {body}")),
            Self::UserInfo { status, .. } => {
                Some(format!("user-info endpoint rejected the access token ({status})"))
            }
            other => Some(other.to_string()),
        }
    }

    pub(crate) fn persistence(err: impl Into<anyhow::Error>) -> Self {
        Self::Persistence(err.into())
    }
}

pub type SsoResult<T> = std::result::Result<T, SsoError>;
