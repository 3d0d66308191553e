//! ID token decoding and verification.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{decode, decode_header, Validation};
use serde_json::Value;
use tracing::{debug, warn};

use super::jwks::JwksRegistry;
use crate::error::{SsoError, SsoResult};
use crate::mapping::ClaimBag;
use crate::provider::OAuthSettings;

/// Decode an ID token's payload without checking its signature.
///
/// Fails unless the token has exactly three dot-separated segments and the
/// middle one is base64url-encoded JSON object.
pub fn decode_id_token(id_token: &str) -> SsoResult<ClaimBag> {
    let segments: Vec<&str> = id_token.split('.').collect();
    if segments.len() != 3 {
        return Err(SsoError::MalformedToken(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| SsoError::MalformedToken(format!("payload is not base64url: {}", e)))?;

    match serde_json::from_slice::<Value>(&payload) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => Err(SsoError::MalformedToken("payload is not a JSON object".to_string())),
        Err(e) => Err(SsoError::MalformedToken(format!("payload is not JSON: {}", e))),
    }
}

/// Verifies ID tokens against provider JWKS when one is configured.
pub struct IdTokenVerifier {
    jwks: JwksRegistry,
    http_client: reqwest::Client,
    leeway_secs: u64,
}

impl IdTokenVerifier {
    pub fn new(http_client: reqwest::Client, leeway_secs: u64) -> Self {
        Self {
            jwks: JwksRegistry::new(),
            http_client,
            leeway_secs,
        }
    }

    /// Claims of a token received from `settings`' token endpoint.
    ///
    /// With a `jwks_uri` the signature, audience (client id), issuer (if
    /// configured) and expiry are checked. Without one the payload is
    /// trusted on the strength of the back-channel exchange. The `nonce`
    /// claim must equal `expected_nonce` in both cases.
    pub async fn verify(
        &self,
        provider_id: &str,
        settings: &OAuthSettings,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> SsoResult<ClaimBag> {
        let claims = match settings.jwks_uri {
            Some(ref jwks_uri) => self.verify_signature(settings, jwks_uri, id_token).await?,
            None => {
                warn!(
                    provider_id = %provider_id,
                    "Provider has no jwks-uri, ID token signature not verified"
                );
                decode_id_token(id_token)?
            }
        };

        if let Some(expected) = expected_nonce {
            match claims.get("nonce").and_then(Value::as_str) {
                Some(nonce) if nonce == expected => {}
                Some(_) => return Err(SsoError::MalformedToken("nonce mismatch".to_string())),
                None => return Err(SsoError::MalformedToken("nonce missing".to_string())),
            }
        }

        Ok(claims)
    }

    async fn verify_signature(
        &self,
        settings: &OAuthSettings,
        jwks_uri: &str,
        id_token: &str,
    ) -> SsoResult<ClaimBag> {
        let header = decode_header(id_token)
            .map_err(|e| SsoError::MalformedToken(format!("invalid header: {}", e)))?;

        debug!(kid = ?header.kid, alg = ?header.alg, "Verifying ID token signature");

        let cache = self
            .jwks
            .cache_for(jwks_uri, &self.http_client)
            .map_err(SsoError::persistence)?;
        let key = match header.kid {
            Some(ref kid) => cache.get_key(kid).await,
            None => cache.get_default_key().await,
        }
        .map_err(|e| SsoError::MalformedToken(format!("no verification key: {:#}", e)))?;

        if let Some(alg) = key.alg {
            if alg != header.alg {
                return Err(SsoError::MalformedToken(format!(
                    "algorithm {:?} does not match key",
                    header.alg
                )));
            }
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        validation.set_audience(&[&settings.client_id]);
        if let Some(ref issuer) = settings.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);

        let data = decode::<ClaimBag>(id_token, &key.key, &validation)
            .map_err(|e| SsoError::MalformedToken(format!("verification failed: {}", e)))?;
        Ok(data.claims)
    }
}


#[cfg(test)]
mod tests {
    use super::test_tokens::unsigned;
    use super::*;
    use crate::provider::types::fixtures::oauth_provider;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &[u8] = b"secret-key-for-tests";

    #[test]
    fn test_decode_payload() {
        let token = unsigned(&json!({"sub": "00u1", "email": "jane@acme.com"}));
        let claims = decode_id_token(&token).unwrap();
        assert_eq!(claims["sub"], "00u1");
        assert_eq!(claims["email"], "jane@acme.com");
    }

    #[test]
    fn test_wrong_segment_count() {
        for token in ["a.b", "a", "a.b.c.d", ""] {
            assert!(
                matches!(decode_id_token(token), Err(SsoError::MalformedToken(_))),
                "{token}"
            );
        }
    }

    #[test]
    fn test_payload_not_json() {
        let token = format!("h.{}.s", URL_SAFE_NO_PAD.encode("not json"));
        assert!(matches!(decode_id_token(&token), Err(SsoError::MalformedToken(_))));

        let token = format!("h.{}.s", URL_SAFE_NO_PAD.encode("[1,2]"));
        assert!(matches!(decode_id_token(&token), Err(SsoError::MalformedToken(_))));

        assert!(matches!(decode_id_token("h.!!!.s"), Err(SsoError::MalformedToken(_))));
    }

    #[test]
    fn test_padded_payload_accepted() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"sub":"a"}"#);
        let claims = decode_id_token(&format!("h.{}.s", payload)).unwrap();
        assert_eq!(claims["sub"], "a");
    }

    #[tokio::test]
    async fn test_nonce_checked_without_jwks() {
        let provider = oauth_provider("okta", "https://idp.example.com");
        let settings = provider.oauth().unwrap();
        let verifier = IdTokenVerifier::new(reqwest::Client::new(), 60);
        let token = unsigned(&json!({"sub": "00u1", "nonce": "n-1"}));

        assert!(verifier.verify("okta", settings, &token, Some("n-1")).await.is_ok());
        assert!(matches!(
            verifier.verify("okta", settings, &token, Some("n-2")).await,
            Err(SsoError::MalformedToken(_))
        ));
        assert!(verifier.verify("okta", settings, &token, None).await.is_ok());
    }

    async fn jwks_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{"kty": "oct", "kid": "k1", "alg": "HS256", "k": URL_SAFE_NO_PAD.encode(SECRET)}]
            })))
            .mount(&server)
            .await;
        server
    }

    fn signed(claims: &Value, secret: &[u8]) -> String {
        let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
        header.kid = Some("k1".to_string());
        encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[tokio::test]
    async fn test_verified_with_jwks() {
        let server = jwks_server().await;
        let mut provider = oauth_provider("okta", &server.uri());
        if let crate::provider::ProtocolSettings::Oauth(ref mut oauth) = provider.protocol {
            oauth.jwks_uri = Some(format!("{}/jwks", server.uri()));
            oauth.issuer = Some("https://idp.example.com".to_string());
        }
        let settings = provider.oauth().unwrap();
        let verifier = IdTokenVerifier::new(reqwest::Client::new(), 60);
        let exp = chrono::Utc::now().timestamp() + 300;

        let good = signed(
            &json!({"sub": "00u1", "aud": "client-123", "iss": "https://idp.example.com", "exp": exp}),
            SECRET,
        );
        let claims = verifier.verify("okta", settings, &good, None).await.unwrap();
        assert_eq!(claims["sub"], "00u1");

        let forged = signed(
            &json!({"sub": "00u1", "aud": "client-123", "iss": "https://idp.example.com", "exp": exp}),
            b"some-other-secret",
        );
        assert!(matches!(
            verifier.verify("okta", settings, &forged, None).await,
            Err(SsoError::MalformedToken(_))
        ));

        let wrong_audience = signed(
            &json!({"sub": "00u1", "aud": "someone-else", "iss": "https://idp.example.com", "exp": exp}),
            SECRET,
        );
        assert!(verifier.verify("okta", settings, &wrong_audience, None).await.is_err());

        let expired = signed(
            &json!({"sub": "00u1", "aud": "client-123", "iss": "https://idp.example.com", "exp": exp - 3600}),
            SECRET,
        );
        assert!(verifier.verify("okta", settings, &expired, None).await.is_err());
    }
}
