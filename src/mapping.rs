//! Translation of provider claims into the canonical identity shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::provider::AttributeMapping;

pub const FIELD_EMAIL: &str = "email";
pub const FIELD_DISPLAY_NAME: &str = "displayName";
pub const FIELD_FIRST_NAME: &str = "firstName";
pub const FIELD_LAST_NAME: &str = "lastName";
/// Never read from a mapping; always the protocol subject.
pub const FIELD_EXTERNAL_USER_ID: &str = "externalUserId";

/// Raw claims as delivered by the IdP. SAML multi-valued attributes are
/// arrays, single values are strings.
pub type ClaimBag = BTreeMap<String, Value>;

/// Protocol-agnostic result of a successful authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalIdentity {
    /// `sub` (OAuth) or `NameID` (SAML).
    pub external_user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Other mapped canonical fields.
    pub attributes: BTreeMap<String, String>,
    pub claims: ClaimBag,
}

impl CanonicalIdentity {
    /// Mapped display name, else "first last".
    pub fn derived_display_name(&self) -> Option<String> {
        if let Some(ref name) = self.display_name {
            return Some(name.clone());
        }
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Build a canonical identity from raw claims.
///
/// Only fields declared in `mapping` are copied, and only when the source
/// claim is present. `subject` is the protocol-level subject identifier.
pub fn map_attributes(
    subject: &str,
    raw_claims: &ClaimBag,
    mapping: &AttributeMapping,
) -> CanonicalIdentity {
    let mut identity = CanonicalIdentity {
        external_user_id: subject.to_string(),
        email: None,
        display_name: None,
        first_name: None,
        last_name: None,
        attributes: BTreeMap::new(),
        claims: raw_claims.clone(),
    };

    for (field, source) in mapping.iter() {
        let Some(value) = raw_claims.get(source).and_then(claim_string) else {
            continue;
        };

        match field {
            FIELD_EXTERNAL_USER_ID => {}
            FIELD_EMAIL => identity.email = Some(value),
            FIELD_DISPLAY_NAME => identity.display_name = Some(value),
            FIELD_FIRST_NAME => identity.first_name = Some(value),
            FIELD_LAST_NAME => identity.last_name = Some(value),
            other => {
                identity.attributes.insert(other.to_string(), value);
            }
        }
    }

    identity
}

/// First usable string of a claim value.
pub fn claim_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(values) => values.iter().find_map(claim_string),
        _ => None,
    }
}
