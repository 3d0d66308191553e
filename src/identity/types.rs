//! Application account records as seen by SSO.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role granted to an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Member,
    Admin,
}

/// An application account scoped to one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub organization_id: String,
    /// Normalized (trimmed, lower-cased).
    pub email: String,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    /// Provider that provisioned the account, if any.
    pub sso_provider_id: Option<String>,
    /// IdP subject at provisioning time.
    pub external_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for account creation.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub organization_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    pub sso_provider_id: Option<String>,
    pub external_user_id: Option<String>,
}

/// Case-insensitive email key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  New.User@ACME.com "), "new.user@acme.com");
    }

    #[test]
    fn test_default_role() {
        assert_eq!(Role::default(), Role::Member);
        assert_eq!(serde_json::to_string(&Role::Member).unwrap(), "\"member\"");
    }
}
