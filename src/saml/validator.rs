//! SAML Response validation.
//!
//! Checks run in a fixed order so every rejection carries its own reason:
//! encoding, XML, status, signature, issuer, audience, validity window,
//! subject.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::verifier::SignatureVerifier;
use crate::error::{SsoError, SsoResult};
use crate::mapping::ClaimBag;
use crate::provider::{SamlSettings, SsoProvider};

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// What a valid assertion yields.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedAssertion {
    pub name_id: String,
    pub session_index: Option<String>,
    /// Attribute name -> string (single value) or array (multi-valued).
    pub attributes: ClaimBag,
    /// Assertion `ID`, single-use.
    pub assertion_id: String,
    pub issuer: Option<String>,
    /// End of the validity window, if the assertion declares one.
    pub not_on_or_after: Option<DateTime<Utc>>,
}

/// Validates POSTed SAML responses for this service provider.
pub struct SamlValidator {
    verifier: Arc<dyn SignatureVerifier>,
    sp_entity_id: String,
    clock_skew: Duration,
}

fn rejected(reason: impl Into<String>) -> SsoError {
    SsoError::SamlValidation(reason.into())
}

impl SamlValidator {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        sp_entity_id: impl Into<String>,
        clock_skew_secs: u64,
    ) -> Self {
        Self {
            verifier,
            sp_entity_id: sp_entity_id.into(),
            clock_skew: Duration::seconds(clock_skew_secs as i64),
        }
    }

    pub fn sp_entity_id(&self) -> &str {
        &self.sp_entity_id
    }

    /// Validate a base64 `SAMLResponse` posted to `callback_url`.
    pub fn validate(
        &self,
        provider: &SsoProvider,
        callback_url: &str,
        base64_response: &str,
    ) -> SsoResult<ValidatedAssertion> {
        let settings = provider.saml().ok_or_else(|| SsoError::ProtocolMismatch {
            provider: provider.id.clone(),
            expected: "saml",
        })?;

        // IdPs may line-wrap the encoded form.
        let compact: String = base64_response.split_whitespace().collect();
        let decoded = BASE64
            .decode(compact.as_bytes())
            .map_err(|_| rejected("malformed response: invalid base64"))?;
        let xml = String::from_utf8(decoded)
            .map_err(|_| rejected("malformed response: not UTF-8"))?;

        let unverified: samael::schema::Response = xml
            .parse()
            .map_err(|e| rejected(format!("malformed XML: {}", e)))?;

        check_status(&unverified)?;

        debug!(provider_id = %provider.id, "Verifying SAML response signature");
        let response = self
            .verifier
            .verified_response(&xml, &settings.idp_certificate)
            .map_err(|e| rejected(format!("signature mismatch: {}", e)))?;

        let assertion = response
            .assertion
            .as_ref()
            .ok_or_else(|| rejected("no signed assertion in response"))?;

        let issuer = assertion.issuer.value.clone();
        check_issuer(settings, issuer.as_deref())?;
        self.check_audience(settings, callback_url, assertion)?;
        self.check_validity_window(assertion)?;

        let name_id = assertion
            .subject
            .as_ref()
            .and_then(|s| s.name_id.as_ref())
            .map(|n| n.value.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| rejected("missing subject"))?;

        let session_index = assertion
            .authn_statements
            .as_ref()
            .and_then(|stmts| stmts.first())
            .and_then(|s| s.session_index.clone());

        let attributes = collect_attributes(assertion);

        info!(
            provider_id = %provider.id,
            assertion_id = %assertion.id,
            attributes = attributes.len(),
            "SAML assertion validated"
        );

        Ok(ValidatedAssertion {
            name_id,
            session_index,
            attributes,
            assertion_id: assertion.id.clone(),
            issuer,
            not_on_or_after: assertion.conditions.as_ref().and_then(|c| c.not_on_or_after),
        })
    }

    fn check_audience(
        &self,
        settings: &SamlSettings,
        callback_url: &str,
        assertion: &samael::schema::Assertion,
    ) -> SsoResult<()> {
        let restrictions = assertion
            .conditions
            .as_ref()
            .and_then(|c| c.audience_restrictions.as_ref())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| rejected("wrong audience: no audience restriction"))?;

        let accepted = |audience: &str| {
            audience == self.sp_entity_id
                || audience == callback_url
                || settings.audience.as_deref() == Some(audience)
        };

        // Every restriction must name us.
        for restriction in restrictions {
            if !restriction.audience.iter().any(|a| accepted(a.trim())) {
                return Err(rejected(format!(
                    "wrong audience: {}",
                    restriction.audience.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn check_validity_window(&self, assertion: &samael::schema::Assertion) -> SsoResult<()> {
        let Some(ref conditions) = assertion.conditions else {
            return Ok(());
        };
        let now = Utc::now();

        if let Some(not_before) = conditions.not_before {
            if now < not_before - self.clock_skew {
                return Err(rejected(format!("assertion not yet valid (NotBefore {})", not_before)));
            }
        }
        if let Some(not_on_or_after) = conditions.not_on_or_after {
            if now >= not_on_or_after + self.clock_skew {
                return Err(rejected(format!(
                    "assertion expired (NotOnOrAfter {})",
                    not_on_or_after
                )));
            }
        }
        Ok(())
    }
}

fn check_status(response: &samael::schema::Response) -> SsoResult<()> {
    let Some(ref status) = response.status else {
        return Ok(());
    };
    let code = status.status_code.value.as_deref();
    if code == Some(STATUS_SUCCESS) {
        return Ok(());
    }

    let message = status
        .status_message
        .as_ref()
        .and_then(|m| m.value.clone())
        .unwrap_or_else(|| code.unwrap_or("unknown").to_string());
    Err(rejected(format!("IdP reported failure: {}", message)))
}

fn check_issuer(settings: &SamlSettings, issuer: Option<&str>) -> SsoResult<()> {
    let Some(ref expected) = settings.idp_entity_id else {
        return Ok(());
    };
    match issuer.map(str::trim) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(rejected(format!("unexpected issuer: {}", actual))),
        None => Err(rejected("missing issuer")),
    }
}

/// Flatten attribute statements into a claim bag. A multi-valued attribute
/// becomes an array.
fn collect_attributes(assertion: &samael::schema::Assertion) -> ClaimBag {
    let mut attributes = ClaimBag::new();

    let Some(ref statements) = assertion.attribute_statements else {
        return attributes;
    };

    for statement in statements {
        for attr in &statement.attributes {
            let Some(ref name) = attr.name else {
                continue;
            };
            let mut values: Vec<Value> = attr
                .values
                .iter()
                .filter_map(|v| v.value.clone())
                .map(Value::String)
                .collect();

            let value = match values.len() {
                0 => continue,
                1 => values.remove(0),
                _ => Value::Array(values),
            };
            attributes.insert(name.clone(), value);
        }
    }

    attributes
}
