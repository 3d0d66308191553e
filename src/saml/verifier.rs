//! XML signature verification for SAML responses.

use samael::schema::Response;

/// Verifies a SAML document against the IdP signing certificate.
pub trait SignatureVerifier: Send + Sync {
    /// The response reduced to its signed content. Unsigned assertions must
    /// not survive this call.
    fn verified_response(&self, xml: &str, idp_certificate: &str) -> Result<Response, String>;
}

/// Certificate body without PEM armour or whitespace.
pub fn strip_pem_headers(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----BEGIN") && !line.starts_with("-----END"))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(feature = "xmlsec")]
mod xmlsec {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use openssl::x509::X509;

    /// libxmlsec1-backed verification through samael.
    pub struct XmlSecVerifier;

    fn parse_certificate(certificate: &str) -> Result<X509, String> {
        let der = STANDARD
            .decode(strip_pem_headers(certificate))
            .map_err(|e| format!("IdP certificate is not base64: {}", e))?;
        X509::from_der(&der).map_err(|e| format!("IdP certificate is invalid: {}", e))
    }

    impl SignatureVerifier for XmlSecVerifier {
        fn verified_response(&self, xml: &str, idp_certificate: &str) -> Result<Response, String> {
            let certificate = parse_certificate(idp_certificate)?;
            let signed = samael::crypto::reduce_xml_to_signed(xml, &[certificate])
                .map_err(|e| e.to_string())?;
            signed
                .parse::<Response>()
                .map_err(|e| format!("signed content is not a SAML response: {}", e))
        }
    }
}

#[cfg(feature = "xmlsec")]
pub use xmlsec::XmlSecVerifier;

/// Rejects every response. Used when the binary is built without XML
/// signature support.
pub struct UnavailableVerifier;

impl SignatureVerifier for UnavailableVerifier {
    fn verified_response(&self, _xml: &str, _idp_certificate: &str) -> Result<Response, String> {
        Err("XML signature verification is not available in this build".to_string())
    }
}

/// Verifier for this build.
pub fn default_verifier() -> std::sync::Arc<dyn SignatureVerifier> {
    #[cfg(feature = "xmlsec")]
    {
        std::sync::Arc::new(XmlSecVerifier)
    }
    #[cfg(not(feature = "xmlsec"))]
    {
        tracing::warn!("Built without xmlsec, all SAML responses will be rejected");
        std::sync::Arc::new(UnavailableVerifier)
    }
}
