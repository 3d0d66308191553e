//! SP-initiated login and service provider metadata.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use tracing::debug;

use crate::error::{SsoError, SsoResult};
use crate::provider::SsoProvider;

/// HTTP-Redirect URL carrying a deflated `AuthnRequest`.
///
/// `RelayState` is the provider id so the ACS can find the provider again.
pub fn create_authn_request(
    provider: &SsoProvider,
    sp_entity_id: &str,
    acs_url: &str,
) -> SsoResult<String> {
    let settings = provider.saml().ok_or_else(|| SsoError::ProtocolMismatch {
        provider: provider.id.clone(),
        expected: "saml",
    })?;
    let idp_sso_url = settings.idp_sso_url.as_deref().ok_or_else(|| {
        SsoError::Configuration(format!("provider {} has no idp-sso-url", provider.id))
    })?;

    let request_id = format!("_id{}", uuid::Uuid::new_v4());
    let issue_instant = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let authn_request = format!(
        r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" IssueInstant="{}" Destination="{}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" AssertionConsumerServiceURL="{}"><saml:Issuer>{}</saml:Issuer><samlp:NameIDPolicy Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress" AllowCreate="true"/></samlp:AuthnRequest>"#,
        request_id,
        issue_instant,
        xml_escape(idp_sso_url),
        xml_escape(acs_url),
        xml_escape(sp_entity_id)
    );

    let encoded = deflate_and_encode(&authn_request).map_err(SsoError::persistence)?;

    let separator = if idp_sso_url.contains('?') { '&' } else { '?' };
    let url = format!(
        "{}{}SAMLRequest={}&RelayState={}",
        idp_sso_url,
        separator,
        urlencoding::encode(&encoded),
        urlencoding::encode(&provider.id)
    );

    debug!(provider_id = %provider.id, request_id = %request_id, "Created SAML AuthnRequest redirect");
    Ok(url)
}

/// SP `EntityDescriptor` advertising the POST-binding ACS.
pub fn sp_metadata(sp_entity_id: &str, acs_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress</md:NameIDFormat>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{}" index="0" isDefault="true"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>
"#,
        xml_escape(sp_entity_id),
        xml_escape(acs_url)
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Deflate and base64 encode for SAML redirect binding.
fn deflate_and_encode(xml: &str) -> anyhow::Result<String> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}
