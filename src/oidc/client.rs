//! OAuth 2.0 authorization-code client with PKCE.

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::crypto::{generate_nonce, generate_state, PkcePair};
use crate::error::{SsoError, SsoResult};
use crate::mapping::ClaimBag;
use crate::provider::{OAuthSettings, SsoProvider};

/// Redirect target for the browser plus the secrets to keep until the
/// callback arrives.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub code_verifier: String,
    pub state: String,
    /// Present when `openid` is among the requested scopes.
    pub nonce: Option<String>,
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    /// Lifetime of the access token in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn oauth_settings(provider: &SsoProvider) -> SsoResult<&OAuthSettings> {
    provider.oauth().ok_or_else(|| SsoError::ProtocolMismatch {
        provider: provider.id.clone(),
        expected: "oauth",
    })
}

/// Build the authorization URL for `provider`.
///
/// A fresh PKCE pair is generated every time; `state` is generated unless
/// the caller supplies one.
pub fn generate_authorization_url(
    provider: &SsoProvider,
    callback_url: &str,
    state: Option<String>,
) -> SsoResult<AuthorizationRequest> {
    let settings = oauth_settings(provider)?;
    if settings.authorization_endpoint.trim().is_empty() {
        return Err(SsoError::Configuration(format!(
            "provider {} has no authorization endpoint",
            provider.id
        )));
    }
    if settings.client_id.trim().is_empty() {
        return Err(SsoError::Configuration(format!(
            "provider {} has no client id",
            provider.id
        )));
    }

    let mut url = Url::parse(&settings.authorization_endpoint).map_err(|e| {
        SsoError::Configuration(format!(
            "provider {} authorization endpoint is not a URL: {}",
            provider.id, e
        ))
    })?;

    let pkce = PkcePair::generate();
    let state = state.unwrap_or_else(generate_state);
    let nonce = settings.requests_openid().then(generate_nonce);

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &settings.client_id)
            .append_pair("redirect_uri", callback_url)
            .append_pair("scope", &settings.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("code_challenge", &pkce.code_challenge)
            .append_pair("code_challenge_method", "S256");
        if let Some(ref nonce) = nonce {
            query.append_pair("nonce", nonce);
        }
    }

    Ok(AuthorizationRequest {
        url: url.into(),
        code_verifier: pkce.code_verifier,
        state,
        nonce,
    })
}

/// Back-channel calls to a provider's token and user-info endpoints.
#[derive(Clone)]
pub struct OAuthClient {
    http_client: reqwest::Client,
}

impl OAuthClient {
    pub fn new(timeout_secs: u64) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http_client })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Redeem an authorization code.
    pub async fn exchange_code_for_token(
        &self,
        provider: &SsoProvider,
        callback_url: &str,
        code: &str,
        code_verifier: &str,
    ) -> SsoResult<TokenResponse> {
        let settings = oauth_settings(provider)?;
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", callback_url),
            ("client_id", settings.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(ref secret) = settings.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        debug!(provider_id = %provider.id, "Exchanging authorization code");
        self.token_request(&settings.token_endpoint, &form)
            .await
            .map_err(|(status, body)| SsoError::TokenExchange { status, body })
    }

    /// Obtain a new access token from a refresh token.
    pub async fn refresh_access_token(
        &self,
        provider: &SsoProvider,
        refresh_token: &str,
    ) -> SsoResult<TokenResponse> {
        let settings = oauth_settings(provider)?;
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", settings.client_id.as_str()),
        ];
        if let Some(ref secret) = settings.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        debug!(provider_id = %provider.id, "Refreshing access token");
        self.token_request(&settings.token_endpoint, &form)
            .await
            .map_err(|(status, body)| SsoError::TokenRefresh { status, body })
    }

    /// Claims from the user-info endpoint.
    pub async fn fetch_user_info(
        &self,
        provider: &SsoProvider,
        access_token: &str,
    ) -> SsoResult<ClaimBag> {
        let settings = oauth_settings(provider)?;
        let endpoint = settings.user_info_endpoint.as_deref().ok_or_else(|| {
            SsoError::Configuration(format!("provider {} has no user-info endpoint", provider.id))
        })?;

        let response = self
            .http_client
            .get(endpoint)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| user_info_error(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SsoError::UserInfo {
                status: status.as_u16(),
                body,
            });
        }

        match response.json::<Value>().await {
            Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
            Ok(_) => Err(user_info_error("response is not a JSON object")),
            Err(_) => Err(user_info_error("response is not valid JSON")),
        }
    }

    /// POST a form to the token endpoint. Errors carry the HTTP status
    /// (0 for transport failures) and the raw response body.
    async fn token_request(
        &self,
        token_endpoint: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, (u16, String)> {
        let response = self
            .http_client
            .post(token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| (0, e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| (status, e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err((status, body));
        }

        serde_json::from_str(&body).map_err(|_| (status, body))
    }
}

fn user_info_error(reason: impl Into<String>) -> SsoError {
    SsoError::UserInfo {
        status: 0,
        body: reason.into(),
    }
}

/// Subject and claims of an OAuth login.
///
/// User-info claims overlay ID-token claims. Both sources must agree on
/// `sub` when both carry one.
pub fn merge_claims(
    id_token_claims: Option<ClaimBag>,
    user_info: Option<ClaimBag>,
) -> SsoResult<(String, ClaimBag)> {
    let id_sub = id_token_claims
        .as_ref()
        .and_then(|c| c.get("sub"))
        .and_then(subject_string);
    let info_sub = user_info
        .as_ref()
        .and_then(|c| c.get("sub"))
        .and_then(subject_string);

    if let (Some(a), Some(b)) = (&id_sub, &info_sub) {
        if a != b {
            return Err(user_info_error("user-info subject does not match ID token"));
        }
    }

    let subject = id_sub
        .or(info_sub)
        .ok_or_else(|| user_info_error("no subject claim"))?;

    let mut claims = id_token_claims.unwrap_or_default();
    claims.extend(user_info.unwrap_or_default());
    Ok((subject, claims))
}

fn subject_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
