//! Identity resolution and auto-provisioning.

use tracing::{debug, info, warn};

use super::store::{AccountStore, AccountStoreError};
use super::types::{normalize_email, Account, NewAccount, Role};
use crate::error::{SsoError, SsoResult};
use crate::mapping::CanonicalIdentity;
use crate::provider::{email_domain, SsoProvider};

/// Account an identity resolved to.
#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub account: Account,
    /// True when this call created the account.
    pub created: bool,
}

/// Normalized email of `identity`, if the provider's domain policy admits it.
pub fn check_identity(provider: &SsoProvider, identity: &CanonicalIdentity) -> SsoResult<String> {
    let email = identity
        .email
        .as_deref()
        .map(normalize_email)
        .filter(|e| !e.is_empty())
        .ok_or(SsoError::MissingEmail)?;

    if !provider.allows_email(&email) {
        let domain = email_domain(&email).unwrap_or(email.as_str()).to_string();
        return Err(SsoError::DomainNotAllowed(domain));
    }

    Ok(email)
}

/// Find or create the account for an authenticated identity.
///
/// Order: email present, domain allowed, existing account, then
/// auto-provisioning. A creation that loses a race against a concurrent
/// callback is retried as a lookup.
pub fn resolve_account(
    store: &dyn AccountStore,
    provider: &SsoProvider,
    identity: &CanonicalIdentity,
) -> SsoResult<ResolvedAccount> {
    let email = check_identity(provider, identity)?;

    if let Some(account) = find(store, provider, &email)? {
        return Ok(ResolvedAccount {
            account: fill_missing_profile(store, account, identity),
            created: false,
        });
    }

    if !provider.auto_provision {
        return Err(SsoError::AccountNotProvisioned(email));
    }

    let new_account = NewAccount {
        organization_id: provider.organization_id.clone(),
        email: email.clone(),
        display_name: identity.derived_display_name(),
        first_name: identity.first_name.clone(),
        last_name: identity.last_name.clone(),
        role: Role::Member,
        sso_provider_id: Some(provider.id.clone()),
        external_user_id: Some(identity.external_user_id.clone()),
    };

    match store.create(new_account) {
        Ok(account) => {
            info!(
                account_id = %account.id,
                organization_id = %account.organization_id,
                provider_id = %provider.id,
                "Auto-provisioned account"
            );
            Ok(ResolvedAccount {
                account,
                created: true,
            })
        }
        Err(AccountStoreError::Duplicate { .. }) => {
            debug!(provider_id = %provider.id, "Concurrent provisioning detected, retrying as lookup");
            let account = find(store, provider, &email)?.ok_or_else(|| {
                SsoError::Persistence(anyhow::anyhow!(
                    "account for {} reported as duplicate but not found",
                    email
                ))
            })?;
            Ok(ResolvedAccount {
                account,
                created: false,
            })
        }
        Err(AccountStoreError::Backend(e)) => Err(SsoError::Persistence(e)),
    }
}

fn find(store: &dyn AccountStore, provider: &SsoProvider, email: &str) -> SsoResult<Option<Account>> {
    store
        .find_by_email(&provider.organization_id, email)
        .map_err(SsoError::persistence)
}

/// Fill a blank display name. Nothing already set is overwritten, and a
/// failed write does not fail the login.
fn fill_missing_profile(
    store: &dyn AccountStore,
    account: Account,
    identity: &CanonicalIdentity,
) -> Account {
    if account.display_name.is_some() {
        return account;
    }
    let Some(name) = identity.derived_display_name() else {
        return account;
    };

    match store.fill_display_name(&account.id, &name) {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            warn!(account_id = %account.id, "Account vanished while filling display name");
            account
        }
        Err(e) => {
            warn!(account_id = %account.id, error = %e, "Failed to fill account display name");
            account
        }
    }
}
