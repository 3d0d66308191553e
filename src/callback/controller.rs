//! Login callbacks as an explicit state machine.
//!
//! Both callbacks run their stages against an [`Attempt`] and hand the result
//! to [`SsoController::finish`], the only place a [`CallbackOutcome`] is
//! built. `finish` writes the audit record, so every exit path is audited
//! exactly once.

use anyhow::Result;
use chrono::{Duration, Utc};
use redb::Database;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::outcome::{CallbackOutcome, CallbackStage};
use crate::audit::{AuditStore, LoginAttempt, RedbAuditStore};
use crate::config::{is_local_path, SsoConfig};
use crate::error::{ErrorCategory, SsoError, SsoResult};
use crate::identity::{check_identity, resolve_account, AccountStore, RedbAccountStore};
use crate::mapping::{map_attributes, CanonicalIdentity};
use crate::oidc::{
    generate_authorization_url, merge_claims, take_valid, AuthStateStore, IdTokenVerifier,
    OAuthClient, PendingAuthorization, RedbAuthStateStore,
};
use crate::provider::{Protocol, ProviderStore, RedbProviderStore, SsoProvider};
use crate::saml::{create_authn_request, sp_metadata, SamlValidator, SignatureVerifier};
use crate::session::{RedbSessionStore, SessionId, SessionStore, SsoSession};

/// Replay window for assertions that carry no `NotOnOrAfter`.
const DEFAULT_ASSERTION_RETENTION_MINS: i64 = 5;

/// Persistence collaborators of the controller.
#[derive(Clone)]
pub struct SsoStores {
    pub providers: Arc<dyn ProviderStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditStore>,
    pub auth_states: Arc<dyn AuthStateStore>,
}

impl SsoStores {
    /// redb-backed stores sharing one database.
    pub fn open(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            providers: Arc::new(RedbProviderStore::new(db.clone())?),
            accounts: Arc::new(RedbAccountStore::new(db.clone())?),
            sessions: Arc::new(RedbSessionStore::new(db.clone())?),
            audit: Arc::new(RedbAuditStore::new(db.clone())?),
            auth_states: Arc::new(RedbAuthStateStore::new(db)?),
        })
    }
}

/// Query parameters of the OAuth redirect back from the IdP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthCallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl OAuthCallbackParams {
    /// Parse a raw query string. Empty values count as absent.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }
}

/// Form fields of a SAML POST-binding response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamlCallbackForm {
    pub saml_response: Option<String>,
    pub relay_state: Option<String>,
}

impl SamlCallbackForm {
    /// Parse an `application/x-www-form-urlencoded` body. Empty values count
    /// as absent.
    pub fn from_body(body: &[u8]) -> Self {
        let mut form = Self::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            if value.is_empty() {
                continue;
            }
            let value = Some(value.into_owned());
            match key.as_ref() {
                "SAMLResponse" => form.saml_response = value,
                "RelayState" => form.relay_state = value,
                _ => {}
            }
        }
        form
    }
}

/// What is known about a callback so far.
struct Attempt {
    protocol: Protocol,
    stage: CallbackStage,
    provider_id: Option<String>,
    user_id: Option<String>,
    email: Option<String>,
}

impl Attempt {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            stage: CallbackStage::Received,
            provider_id: None,
            user_id: None,
            email: None,
        }
    }

    fn reached(&mut self, stage: CallbackStage) {
        debug!(protocol = %self.protocol, stage = %stage, "Callback advanced");
        self.stage = stage;
    }
}

struct Login {
    session: SsoSession,
    created_account: bool,
    return_to: Option<String>,
}

/// Drives SSO logins from initiation to session.
pub struct SsoController {
    config: SsoConfig,
    stores: SsoStores,
    oauth: OAuthClient,
    id_tokens: IdTokenVerifier,
    saml: SamlValidator,
}

impl SsoController {
    pub fn new(
        config: SsoConfig,
        stores: SsoStores,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self> {
        let oauth = OAuthClient::new(config.http_timeout_secs)?;
        let id_tokens = IdTokenVerifier::new(oauth.http_client().clone(), config.clock_skew_secs);
        let saml = SamlValidator::new(verifier, config.sp_entity_id.clone(), config.clock_skew_secs);

        Ok(Self {
            config,
            stores,
            oauth,
            id_tokens,
            saml,
        })
    }

    pub fn config(&self) -> &SsoConfig {
        &self.config
    }

    /// Authorization URL to send the browser to. The PKCE verifier, nonce
    /// and a relative `return_to` are persisted under the generated state.
    pub fn begin_oauth_login(&self, provider_id: &str, return_to: Option<&str>) -> SsoResult<String> {
        let provider = self.load_provider(provider_id, Protocol::Oauth)?;
        let callback_url = self.config.oauth_callback_url();
        let request = generate_authorization_url(&provider, &callback_url, None)?;

        let pending = PendingAuthorization::new(
            request.state,
            request.code_verifier,
            provider.id.clone(),
            request.nonce,
            callback_url,
            return_to.and_then(safe_return_to),
            Duration::seconds(self.config.state_ttl_secs as i64),
        );
        self.stores
            .auth_states
            .put(&pending)
            .map_err(SsoError::persistence)?;

        debug!(provider_id = %provider.id, "OAuth login initiated");
        Ok(request.url)
    }

    /// IdP redirect URL carrying an `AuthnRequest` for `provider_id`.
    pub fn begin_saml_login(&self, provider_id: &str) -> SsoResult<String> {
        let provider = self.load_provider(provider_id, Protocol::Saml)?;
        create_authn_request(&provider, &self.config.sp_entity_id, &self.config.acs_url())
    }

    pub fn sp_metadata(&self) -> String {
        sp_metadata(&self.config.sp_entity_id, &self.config.acs_url())
    }

    /// Live session named by the session cookie in `cookie_header`.
    pub fn current_session(&self, cookie_header: Option<&str>) -> SsoResult<Option<SsoSession>> {
        let Some(value) = cookie_header.and_then(|h| self.config.cookie.parse_session_cookie(h))
        else {
            return Ok(None);
        };
        let Some(id) = SessionId::from_hex(&value) else {
            return Ok(None);
        };
        self.stores
            .sessions
            .get_valid(id)
            .map_err(SsoError::persistence)
    }

    pub async fn handle_oauth_callback(&self, params: OAuthCallbackParams) -> CallbackOutcome {
        let mut attempt = Attempt::new(Protocol::Oauth);
        let result = self.run_oauth(&mut attempt, params).await;
        self.finish(attempt, result)
    }

    pub fn handle_saml_callback(&self, form: SamlCallbackForm) -> CallbackOutcome {
        let mut attempt = Attempt::new(Protocol::Saml);
        let result = self.run_saml(&mut attempt, form);
        self.finish(attempt, result)
    }

    async fn run_oauth(&self, attempt: &mut Attempt, params: OAuthCallbackParams) -> SsoResult<Login> {
        let state = params.state.ok_or(SsoError::MissingParameter("state"))?;
        let pending = take_valid(self.stores.auth_states.as_ref(), &state)?;

        let provider = self.resolve_provider(attempt, &pending.provider_id)?;
        let settings = provider
            .oauth()
            .ok_or_else(|| mismatch(&provider, Protocol::Oauth))?;

        if let Some(error) = params.error {
            let reason = match params.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            };
            return Err(SsoError::AuthorizationDenied(reason));
        }
        let code = params.code.ok_or(SsoError::MissingParameter("code"))?;

        let tokens = self
            .oauth
            .exchange_code_for_token(&provider, &pending.redirect_uri, &code, &pending.code_verifier)
            .await?;

        let id_claims = match tokens.id_token {
            Some(ref id_token) => Some(
                self.id_tokens
                    .verify(&provider.id, settings, id_token, pending.nonce.as_deref())
                    .await?,
            ),
            None if pending.nonce.is_some() => {
                return Err(SsoError::MalformedToken(
                    "token response has no id_token".to_string(),
                ))
            }
            None => None,
        };
        let user_info = match settings.user_info_endpoint {
            Some(_) => Some(
                self.oauth
                    .fetch_user_info(&provider, &tokens.access_token)
                    .await?,
            ),
            None => None,
        };
        let (subject, claims) = merge_claims(id_claims, user_info)?;
        attempt.reached(CallbackStage::IdentityValidated);

        let identity = map_attributes(&subject, &claims, &provider.attribute_mapping);
        self.establish(attempt, &provider, identity, None, pending.return_to)
    }

    fn run_saml(&self, attempt: &mut Attempt, form: SamlCallbackForm) -> SsoResult<Login> {
        let relay_state = form
            .relay_state
            .ok_or(SsoError::MissingParameter("RelayState"))?;
        let saml_response = form
            .saml_response
            .ok_or(SsoError::MissingParameter("SAMLResponse"))?;

        let provider = self.resolve_provider(attempt, relay_state.trim())?;
        let assertion = self
            .saml
            .validate(&provider, &self.config.acs_url(), &saml_response)?;

        let retain_until = assertion
            .not_on_or_after
            .unwrap_or_else(|| Utc::now() + Duration::minutes(DEFAULT_ASSERTION_RETENTION_MINS))
            + Duration::seconds(self.config.clock_skew_secs as i64);
        let fresh = self
            .stores
            .sessions
            .consume_assertion(&provider.id, &assertion.assertion_id, retain_until)
            .map_err(SsoError::persistence)?;
        if !fresh {
            return Err(SsoError::SamlValidation("replayed assertion".to_string()));
        }
        attempt.reached(CallbackStage::IdentityValidated);

        let identity = map_attributes(
            &assertion.name_id,
            &assertion.attributes,
            &provider.attribute_mapping,
        );
        self.establish(
            attempt,
            &provider,
            identity,
            assertion.session_index.as_deref(),
            None,
        )
    }

    /// Shared tail of both callbacks: policy, account, session.
    fn establish(
        &self,
        attempt: &mut Attempt,
        provider: &SsoProvider,
        identity: CanonicalIdentity,
        external_session_id: Option<&str>,
        return_to: Option<String>,
    ) -> SsoResult<Login> {
        attempt.email = identity.email.clone();
        attempt.reached(CallbackStage::AttributesMapped);

        let email = check_identity(provider, &identity)?;
        attempt.email = Some(email);
        attempt.reached(CallbackStage::DomainChecked);

        let resolved = resolve_account(self.stores.accounts.as_ref(), provider, &identity)?;
        attempt.user_id = Some(resolved.account.id.clone());
        attempt.reached(CallbackStage::AccountResolved);

        let session = self
            .stores
            .sessions
            .create(
                &provider.id,
                &resolved.account.id,
                external_session_id,
                &identity.external_user_id,
            )
            .map_err(SsoError::persistence)?;
        attempt.reached(CallbackStage::SessionCreated);

        Ok(Login {
            session,
            created_account: resolved.created,
            return_to,
        })
    }

    /// Record the attempt and turn the result into an outcome. Audit write
    /// failures are logged and never replace the login result.
    fn finish(&self, mut attempt: Attempt, result: SsoResult<Login>) -> CallbackOutcome {
        let record = LoginAttempt {
            id: Uuid::new_v4().to_string(),
            provider_id: attempt.provider_id.clone(),
            protocol: attempt.protocol,
            user_id: attempt.user_id.clone(),
            email: attempt.email.clone(),
            success: result.is_ok(),
            error_message: result.as_ref().err().map(ToString::to_string),
            error_code: result.as_ref().err().map(|e| e.code().to_string()),
            stage: attempt.stage.as_str().to_string(),
            created_at: Utc::now(),
        };

        match result {
            Ok(ref login) => info!(
                protocol = %attempt.protocol,
                provider_id = ?attempt.provider_id,
                user_id = ?attempt.user_id,
                session_id = %login.session.id,
                created_account = login.created_account,
                "SSO login succeeded"
            ),
            Err(ref e) if e.category() == ErrorCategory::Persistence => error!(
                protocol = %attempt.protocol,
                provider_id = ?attempt.provider_id,
                stage = %attempt.stage,
                error_code = e.code(),
                error = %e,
                "SSO login failed"
            ),
            Err(ref e) => warn!(
                protocol = %attempt.protocol,
                provider_id = ?attempt.provider_id,
                stage = %attempt.stage,
                error_code = e.code(),
                error = %e,
                "SSO login rejected"
            ),
        }

        if let Err(e) = self.stores.audit.record(&record) {
            error!(
                attempt_id = %record.id,
                provider_id = ?record.provider_id,
                error = %e,
                "Failed to record login attempt"
            );
        }

        match result {
            Ok(login) => {
                attempt.reached(CallbackStage::Redirected);
                CallbackOutcome::Redirect {
                    location: login
                        .return_to
                        .unwrap_or_else(|| self.config.post_login_redirect.clone()),
                    session: login.session,
                    created_account: login.created_account,
                }
            }
            Err(error) => CallbackOutcome::Failed {
                stage: attempt.stage,
                error,
            },
        }
    }

    /// Provider for a callback. The attempt learns the provider id as soon
    /// as the record exists, even if it is then refused.
    fn resolve_provider(&self, attempt: &mut Attempt, provider_id: &str) -> SsoResult<SsoProvider> {
        let provider = self.find_provider(provider_id)?;
        attempt.provider_id = Some(provider.id.clone());
        check_provider(&provider, attempt.protocol)?;
        attempt.reached(CallbackStage::ProviderResolved);
        Ok(provider)
    }

    fn load_provider(&self, provider_id: &str, protocol: Protocol) -> SsoResult<SsoProvider> {
        let provider = self.find_provider(provider_id)?;
        check_provider(&provider, protocol)?;
        Ok(provider)
    }

    fn find_provider(&self, provider_id: &str) -> SsoResult<SsoProvider> {
        self.stores
            .providers
            .get(provider_id)
            .map_err(SsoError::persistence)?
            .ok_or_else(|| SsoError::ProviderNotFound(provider_id.to_string()))
    }
}

fn check_provider(provider: &SsoProvider, protocol: Protocol) -> SsoResult<()> {
    if !provider.enabled {
        return Err(SsoError::ProviderDisabled(provider.id.clone()));
    }
    if provider.protocol() != protocol {
        return Err(mismatch(provider, protocol));
    }
    Ok(())
}

fn mismatch(provider: &SsoProvider, expected: Protocol) -> SsoError {
    SsoError::ProtocolMismatch {
        provider: provider.id.clone(),
        expected: expected.as_str(),
    }
}

/// Same-origin path, or nothing.
fn safe_return_to(path: &str) -> Option<String> {
    let path = path.trim();
    is_local_path(path).then(|| path.to_string())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::oidc::id_token::test_tokens::unsigned;
    use crate::provider::types::fixtures::{oauth_provider, saml_provider};
    use crate::provider::AttributeMapping;
    use crate::saml::validator::fixtures::ResponseFixture;
    use crate::saml::verifier::test_support::TrustingVerifier;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn saml_context() -> TestContext {
        let ctx = context(Arc::new(TrustingVerifier));
        ctx.providers.upsert(&saml_provider("acme-saml")).unwrap();
        ctx
    }

    fn saml_form(response: &str, relay_state: &str) -> SamlCallbackForm {
        SamlCallbackForm {
            saml_response: Some(response.to_string()),
            relay_state: Some(relay_state.to_string()),
        }
    }

    fn query_map(url: &str) -> HashMap<String, String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .into_owned()
            .collect()
    }

    async fn mount_token_endpoint(server: &MockServer, nonce: &str) {
        let id_token = unsigned(&json!({
            "sub": "user-1",
            "email": "New.User@acme.com",
            "name": "New User",
            "nonce": nonce,
        }));
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-1",
                "token_type": "Bearer",
                "id_token": id_token,
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sub": "user-1",
                "email": "new.user@acme.com",
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_params_from_query() {
        let params = OAuthCallbackParams::from_query("code=abc&state=xyz&extra=1&error=");
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert_eq!(params.error, None);
    }

    #[test]
    fn test_form_from_body() {
        let form = SamlCallbackForm::from_body(b"SAMLResponse=PHNhbWw%2B&RelayState=acme-saml");
        assert_eq!(form.saml_response.as_deref(), Some("PHNhbWw+"));
        assert_eq!(form.relay_state.as_deref(), Some("acme-saml"));
        assert_eq!(SamlCallbackForm::from_body(b"%%%"), SamlCallbackForm::default());
    }

    #[test]
    fn test_safe_return_to() {
        assert_eq!(safe_return_to("/dashboard?tab=1"), Some("/dashboard?tab=1".to_string()));
        assert_eq!(safe_return_to("//evil.com"), None);
        assert_eq!(safe_return_to("https://evil.com"), None);
        assert_eq!(safe_return_to("/\\evil.com"), None);
        assert_eq!(safe_return_to("/a\nb"), None);
    }

    #[tokio::test]
    async fn test_oauth_unknown_state_skips_token_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = context(Arc::new(TrustingVerifier));
        ctx.providers
            .upsert(&oauth_provider("okta", &server.uri()))
            .unwrap();

        let outcome = ctx
            .controller
            .handle_oauth_callback(OAuthCallbackParams {
                code: Some("abc".to_string()),
                state: Some("unknown-state-123".to_string()),
                ..Default::default()
            })
            .await;

        assert!(matches!(outcome.error(), Some(SsoError::InvalidState)));
        server.verify().await;

        let records = ctx.audit.list().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].error_code.as_deref(), Some("invalid_state"));
        assert_eq!(records[0].provider_id, None);
        assert_eq!(records[0].user_id, None);
        assert_eq!(records[0].stage, "received");
    }

    #[tokio::test]
    async fn test_oauth_first_time_login() {
        let server = MockServer::start().await;
        let ctx = context(Arc::new(TrustingVerifier));
        ctx.providers
            .upsert(&oauth_provider("okta", &server.uri()))
            .unwrap();

        let url = ctx
            .controller
            .begin_oauth_login("okta", Some("/dashboard"))
            .unwrap();
        let query = query_map(&url);
        assert_eq!(
            query["redirect_uri"],
            "https://app.example.com/sso/oauth/callback"
        );
        mount_token_endpoint(&server, &query["nonce"]).await;

        let outcome = ctx
            .controller
            .handle_oauth_callback(OAuthCallbackParams {
                code: Some("code-1".to_string()),
                state: Some(query["state"].clone()),
                ..Default::default()
            })
            .await;

        let CallbackOutcome::Redirect {
            location,
            session,
            created_account,
        } = outcome
        else {
            panic!("expected redirect");
        };
        assert_eq!(location, "/dashboard");
        assert!(created_account);
        assert_eq!(session.name_id, "user-1");
        assert_eq!(session.external_session_id, None);
        let lifetime = (session.expires_at - Utc::now()).num_seconds();
        assert!((8 * 3600 - 5..=8 * 3600).contains(&lifetime));

        assert_eq!(ctx.accounts.count().unwrap(), 1);
        let account = ctx
            .accounts
            .find_by_email("org-1", "new.user@acme.com")
            .unwrap()
            .unwrap();
        assert_eq!(account.id, session.user_id);
        assert_eq!(account.display_name.as_deref(), Some("New User"));

        let records = ctx.audit.list().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].user_id.as_deref(), Some(account.id.as_str()));
        assert_eq!(records[0].email.as_deref(), Some("new.user@acme.com"));
        assert_eq!(records[0].stage, "session_created");
        assert_eq!(ctx.auth_states.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oauth_idp_error_consumes_state() {
        let server = MockServer::start().await;
        let ctx = context(Arc::new(TrustingVerifier));
        ctx.providers
            .upsert(&oauth_provider("okta", &server.uri()))
            .unwrap();

        let url = ctx.controller.begin_oauth_login("okta", None).unwrap();
        let state = query_map(&url)["state"].clone();

        let outcome = ctx
            .controller
            .handle_oauth_callback(OAuthCallbackParams {
                state: Some(state.clone()),
                error: Some("access_denied".to_string()),
                error_description: Some("user cancelled".to_string()),
                ..Default::default()
            })
            .await;
        assert!(
            matches!(outcome.error(), Some(SsoError::AuthorizationDenied(r)) if r == "access_denied: user cancelled")
        );

        let retried = ctx
            .controller
            .handle_oauth_callback(OAuthCallbackParams {
                code: Some("code-1".to_string()),
                state: Some(state),
                ..Default::default()
            })
            .await;
        assert!(matches!(retried.error(), Some(SsoError::InvalidState)));

        let records = ctx.audit.list().unwrap();
        assert_eq!(records.len(), 2);
        let denied = records
            .iter()
            .find(|r| r.error_code.as_deref() == Some("authorization_denied"))
            .unwrap();
        assert_eq!(denied.provider_id.as_deref(), Some("okta"));
        assert_eq!(denied.stage, "provider_resolved");
    }

    #[tokio::test]
    async fn test_oauth_expired_state() {
        let ctx = context(Arc::new(TrustingVerifier));
        let mut pending = PendingAuthorization::new(
            "old-state".to_string(),
            "verifier".to_string(),
            "okta".to_string(),
            None,
            "https://app.example.com/sso/oauth/callback".to_string(),
            None,
            Duration::seconds(600),
        );
        pending.expires_at = Utc::now() - Duration::seconds(1);
        ctx.auth_states.put(&pending).unwrap();

        let outcome = ctx
            .controller
            .handle_oauth_callback(OAuthCallbackParams {
                code: Some("code-1".to_string()),
                state: Some("old-state".to_string()),
                ..Default::default()
            })
            .await;
        let error = outcome.error().unwrap();
        assert!(matches!(error, SsoError::ExpiredState));
        assert_eq!(error.status(), 410);
        assert_eq!(ctx.audit.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_oauth_missing_state() {
        let ctx = context(Arc::new(TrustingVerifier));
        let outcome = ctx
            .controller
            .handle_oauth_callback(OAuthCallbackParams::from_query("code=abc"))
            .await;
        assert!(matches!(
            outcome.error(),
            Some(SsoError::MissingParameter("state"))
        ));
        assert_eq!(ctx.audit.count().unwrap(), 1);
    }

    #[test]
    fn test_begin_oauth_login_rejections() {
        let ctx = saml_context();
        assert!(matches!(
            ctx.controller.begin_oauth_login("missing", None),
            Err(SsoError::ProviderNotFound(_))
        ));
        assert!(matches!(
            ctx.controller.begin_oauth_login("acme-saml", None),
            Err(SsoError::ProtocolMismatch { .. })
        ));
        // Initiation is not a callback.
        assert_eq!(ctx.audit.count().unwrap(), 0);
    }

    #[test]
    fn test_begin_oauth_login_drops_absolute_return_to() {
        let ctx = context(Arc::new(TrustingVerifier));
        ctx.providers
            .upsert(&oauth_provider("okta", "https://idp.example.com"))
            .unwrap();

        let url = ctx
            .controller
            .begin_oauth_login("okta", Some("https://evil.com/phish"))
            .unwrap();
        let state = query_map(&url)["state"].clone();
        let pending = take_valid(&ctx.auth_states, &state).unwrap();
        assert_eq!(pending.return_to, None);
        assert_eq!(pending.provider_id, "okta");
        assert!(pending.nonce.is_some());
    }

    #[test]
    fn test_begin_saml_login() {
        let ctx = saml_context();
        let url = ctx.controller.begin_saml_login("acme-saml").unwrap();
        assert!(url.starts_with("https://idp.acme.com/sso?SAMLRequest="));
        assert_eq!(query_map(&url)["RelayState"], "acme-saml");
    }

    #[test]
    fn test_saml_first_time_login() {
        let ctx = saml_context();
        let outcome = ctx
            .controller
            .handle_saml_callback(saml_form(&ResponseFixture::default().encoded(), "acme-saml"));

        let CallbackOutcome::Redirect {
            location,
            session,
            created_account,
        } = outcome
        else {
            panic!("expected redirect");
        };
        assert_eq!(location, "/");
        assert!(created_account);
        assert_eq!(session.provider_id, "acme-saml");
        assert_eq!(session.name_id, "new.user@acme.com");
        assert_eq!(session.external_session_id.as_deref(), Some("_session-1"));

        let account = ctx
            .accounts
            .find_by_email("org-1", "new.user@acme.com")
            .unwrap()
            .unwrap();
        assert_eq!(account.display_name.as_deref(), Some("New User"));
        assert_eq!(account.sso_provider_id.as_deref(), Some("acme-saml"));

        let records = ctx.audit.list().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].provider_id.as_deref(), Some("acme-saml"));
    }

    #[test]
    fn test_saml_expired_assertion() {
        let ctx = saml_context();
        let now = Utc::now();
        let fixture = ResponseFixture {
            not_before: now - Duration::hours(2),
            not_on_or_after: now - Duration::hours(1),
            ..Default::default()
        };

        let outcome = ctx
            .controller
            .handle_saml_callback(saml_form(&fixture.encoded(), "acme-saml"));
        assert!(
            matches!(outcome.error(), Some(SsoError::SamlValidation(r)) if r.contains("expired"))
        );

        assert_eq!(ctx.accounts.count().unwrap(), 0);
        let records = ctx.audit.list().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].error_message.as_deref().unwrap().contains("expired"));
        assert_eq!(records[0].stage, "provider_resolved");
    }

    #[test]
    fn test_saml_replay_rejected() {
        let ctx = saml_context();
        let encoded = ResponseFixture::default().encoded();

        let first = ctx
            .controller
            .handle_saml_callback(saml_form(&encoded, "acme-saml"));
        assert!(first.is_success());
        assert_eq!(first.stage(), CallbackStage::Redirected);

        let second = ctx
            .controller
            .handle_saml_callback(saml_form(&encoded, "acme-saml"));
        assert!(
            matches!(second.error(), Some(SsoError::SamlValidation(r)) if r == "replayed assertion")
        );

        assert_eq!(ctx.accounts.count().unwrap(), 1);
        assert_eq!(ctx.sessions.session_count().unwrap(), 1);
        assert_eq!(ctx.audit.count().unwrap(), 2);
    }

    #[test]
    fn test_saml_unmapped_email_left_absent() {
        let ctx = saml_context();
        let mut provider = saml_provider("acme-saml");
        provider.attribute_mapping = AttributeMapping::new();
        ctx.providers.upsert(&provider).unwrap();

        let outcome = ctx
            .controller
            .handle_saml_callback(saml_form(&ResponseFixture::default().encoded(), "acme-saml"));
        assert!(matches!(outcome.error(), Some(SsoError::MissingEmail)));
        assert_eq!(outcome.stage(), CallbackStage::AttributesMapped);
        assert_eq!(ctx.accounts.count().unwrap(), 0);
    }

    #[test]
    fn test_saml_assertion_ids_scoped_per_provider() {
        let ctx = saml_context();
        ctx.providers.upsert(&saml_provider("other-saml")).unwrap();
        let encoded = ResponseFixture::default().encoded();

        let first = ctx
            .controller
            .handle_saml_callback(saml_form(&encoded, "acme-saml"));
        let second = ctx
            .controller
            .handle_saml_callback(saml_form(&encoded, "other-saml"));
        assert!(first.is_success());
        assert!(second.is_success());
        assert_eq!(ctx.sessions.session_count().unwrap(), 2);
    }

    #[test]
    fn test_saml_disabled_provider() {
        let ctx = saml_context();
        let mut provider = saml_provider("acme-saml");
        provider.enabled = false;
        ctx.providers.upsert(&provider).unwrap();

        let outcome = ctx
            .controller
            .handle_saml_callback(saml_form(&ResponseFixture::default().encoded(), "acme-saml"));
        let error = outcome.error().unwrap();
        assert!(matches!(error, SsoError::ProviderDisabled(_)));
        assert_eq!(error.status(), 403);

        let records = ctx.audit.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_id.as_deref(), Some("acme-saml"));
        assert_eq!(records[0].stage, "received");
    }

    #[test]
    fn test_saml_domain_not_allowed() {
        let ctx = saml_context();
        let mut provider = saml_provider("acme-saml");
        provider.allowed_domains = vec!["other.com".to_string()];
        ctx.providers.upsert(&provider).unwrap();

        let outcome = ctx
            .controller
            .handle_saml_callback(saml_form(&ResponseFixture::default().encoded(), "acme-saml"));
        assert!(
            matches!(outcome.error(), Some(SsoError::DomainNotAllowed(d)) if d == "acme.com")
        );
        assert!(matches!(
            outcome,
            CallbackOutcome::Failed {
                stage: CallbackStage::AttributesMapped,
                ..
            }
        ));

        assert_eq!(ctx.accounts.count().unwrap(), 0);
        let records = ctx.audit.list().unwrap();
        assert_eq!(records[0].email.as_deref(), Some("new.user@acme.com"));
        assert_eq!(records[0].error_code.as_deref(), Some("domain_not_allowed"));
    }

    #[test]
    fn test_saml_unknown_provider() {
        let ctx = saml_context();
        let outcome = ctx
            .controller
            .handle_saml_callback(saml_form(&ResponseFixture::default().encoded(), "nope"));
        let error = outcome.error().unwrap();
        assert!(matches!(error, SsoError::ProviderNotFound(_)));
        assert_eq!(error.status(), 404);
        assert_eq!(ctx.audit.list().unwrap()[0].provider_id, None);
    }

    #[tokio::test]
    async fn test_every_callback_audited_once() {
        let ctx = saml_context();
        let mut restricted = saml_provider("restricted");
        restricted.allowed_domains = vec!["other.com".to_string()];
        ctx.providers.upsert(&restricted).unwrap();

        let replayable = ResponseFixture::default().encoded();
        let now = Utc::now();
        let expired = ResponseFixture {
            not_before: now - Duration::hours(2),
            not_on_or_after: now - Duration::hours(1),
            ..Default::default()
        }
        .encoded();

        let mut outcomes = vec![
            ctx.controller
                .handle_saml_callback(saml_form(&replayable, "acme-saml")),
            ctx.controller.handle_saml_callback(saml_form(
                &ResponseFixture::default().encoded(),
                "acme-saml",
            )),
            ctx.controller.handle_saml_callback(saml_form(
                &ResponseFixture::default().encoded(),
                "acme-saml",
            )),
            ctx.controller
                .handle_saml_callback(saml_form(&expired, "acme-saml")),
            ctx.controller
                .handle_saml_callback(saml_form(&replayable, "acme-saml")),
            ctx.controller.handle_saml_callback(SamlCallbackForm {
                saml_response: None,
                relay_state: Some("acme-saml".to_string()),
            }),
            ctx.controller.handle_saml_callback(saml_form(
                &ResponseFixture::default().encoded(),
                "nope",
            )),
            ctx.controller.handle_saml_callback(saml_form(
                &ResponseFixture::default().encoded(),
                "restricted",
            )),
        ];
        outcomes.push(
            ctx.controller
                .handle_oauth_callback(OAuthCallbackParams::from_query(
                    "code=abc&state=unknown-state-123",
                ))
                .await,
        );
        outcomes.push(
            ctx.controller
                .handle_oauth_callback(OAuthCallbackParams::default())
                .await,
        );

        assert_eq!(outcomes.len(), 10);
        let successes = outcomes.iter().filter(|o| o.is_success()).count();
        assert_eq!(successes, 3);

        let records = ctx.audit.list().unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records.iter().filter(|r| r.success).count(), 3);
        assert_eq!(ctx.accounts.count().unwrap(), 1);
    }

    struct FailingAudit;

    impl AuditStore for FailingAudit {
        fn record(&self, _attempt: &LoginAttempt) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("audit table unavailable"))
        }
    }

    #[test]
    fn test_audit_failure_does_not_mask_result() {
        let ctx = context_with(Arc::new(TrustingVerifier), |stores| {
            stores.audit = Arc::new(FailingAudit);
        });
        ctx.providers.upsert(&saml_provider("acme-saml")).unwrap();

        let failed = ctx
            .controller
            .handle_saml_callback(SamlCallbackForm::default());
        assert!(matches!(
            failed.error(),
            Some(SsoError::MissingParameter("RelayState"))
        ));

        let succeeded = ctx
            .controller
            .handle_saml_callback(saml_form(&ResponseFixture::default().encoded(), "acme-saml"));
        assert!(succeeded.is_success());
    }

    struct BrokenSessions;

    impl SessionStore for BrokenSessions {
        fn create(
            &self,
            _provider_id: &str,
            _user_id: &str,
            _external_session_id: Option<&str>,
            _name_id: &str,
        ) -> anyhow::Result<SsoSession> {
            Err(anyhow::anyhow!("sessions table is corrupt"))
        }

        fn get_valid(&self, _id: SessionId) -> anyhow::Result<Option<SsoSession>> {
            Ok(None)
        }

        fn consume_assertion(
            &self,
            _provider_id: &str,
            _assertion_id: &str,
            _expires_at: chrono::DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_persistence_failure_is_generic() {
        let ctx = context_with(Arc::new(TrustingVerifier), |stores| {
            stores.sessions = Arc::new(BrokenSessions);
        });
        ctx.providers.upsert(&saml_provider("acme-saml")).unwrap();

        let outcome = ctx
            .controller
            .handle_saml_callback(saml_form(&ResponseFixture::default().encoded(), "acme-saml"));
        let error = outcome.error().unwrap();
        assert_eq!(error.status(), 500);
        assert_eq!(error.code(), "authentication_failed");
        assert_eq!(error.public_details(), None);

        let records = ctx.audit.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "account_resolved");
        assert!(records[0].user_id.is_some());
    }

    #[test]
    fn test_current_session() {
        let ctx = saml_context();
        let CallbackOutcome::Redirect { session, .. } = ctx
            .controller
            .handle_saml_callback(saml_form(&ResponseFixture::default().encoded(), "acme-saml"))
        else {
            panic!("expected redirect");
        };

        let header = format!("theme=dark; zentinel_sso_session={}", session.id.to_hex());
        let found = ctx.controller.current_session(Some(&header)).unwrap();
        assert_eq!(found, Some(session));

        assert_eq!(ctx.controller.current_session(None).unwrap(), None);
        assert_eq!(
            ctx.controller
                .current_session(Some("zentinel_sso_session=not-hex"))
                .unwrap(),
            None
        );
    }
}
