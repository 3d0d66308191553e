//! HTTP surface of the SSO service.

use axum::{
    body::Bytes,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::controller::{OAuthCallbackParams, SamlCallbackForm, SsoController};
use super::outcome::CallbackOutcome;
use crate::config::{OAUTH_CALLBACK_PATH, SAML_ACS_PATH, SAML_METADATA_PATH};
use crate::error::SsoError;
use crate::session::SsoSession;

/// JSON error body: `{ "error": code, "details": ... }`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for SsoError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.code(),
            details: self.public_details(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    return_to: Option<String>,
}

/// Public view of the caller's SSO session.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub provider_id: String,
    pub user_id: String,
    pub name_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<SsoSession> for SessionView {
    fn from(session: SsoSession) -> Self {
        Self {
            provider_id: session.provider_id,
            user_id: session.user_id,
            name_id: session.name_id,
            issued_at: session.issued_at,
            expires_at: session.expires_at,
        }
    }
}

/// Routes for login initiation, both callbacks, SP metadata and session
/// lookup.
pub fn router(controller: Arc<SsoController>) -> Router {
    Router::new()
        .route("/sso/oauth/:provider_id/login", get(oauth_login))
        .route(OAUTH_CALLBACK_PATH, get(oauth_callback))
        .route("/sso/saml/:provider_id/login", get(saml_login))
        .route(SAML_ACS_PATH, post(saml_acs))
        .route(SAML_METADATA_PATH, get(saml_metadata))
        .route("/sso/session", get(current_session))
        .with_state(controller)
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn outcome_response(controller: &SsoController, outcome: CallbackOutcome) -> Response {
    debug!(stage = %outcome.stage(), "Callback finished");
    match outcome {
        CallbackOutcome::Redirect {
            location, session, ..
        } => {
            let cookie = controller
                .config()
                .cookie
                .build_cookie(&session.id.to_hex(), session.remaining_secs());
            (
                StatusCode::FOUND,
                [(header::LOCATION, location), (header::SET_COOKIE, cookie)],
            )
                .into_response()
        }
        CallbackOutcome::Failed { error, .. } => error.into_response(),
    }
}

async fn oauth_login(
    State(controller): State<Arc<SsoController>>,
    Path(provider_id): Path<String>,
    Query(query): Query<LoginQuery>,
) -> Result<Response, SsoError> {
    let url = controller
        .begin_oauth_login(&provider_id, query.return_to.as_deref())
        .inspect_err(|e| warn!(provider_id = %provider_id, error = %e, "Failed to start OAuth login"))?;
    Ok(found(url))
}

async fn oauth_callback(
    State(controller): State<Arc<SsoController>>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = OAuthCallbackParams::from_query(query.as_deref().unwrap_or_default());
    let outcome = controller.handle_oauth_callback(params).await;
    outcome_response(&controller, outcome)
}

async fn saml_login(
    State(controller): State<Arc<SsoController>>,
    Path(provider_id): Path<String>,
) -> Result<Response, SsoError> {
    let url = controller
        .begin_saml_login(&provider_id)
        .inspect_err(|e| warn!(provider_id = %provider_id, error = %e, "Failed to start SAML login"))?;
    Ok(found(url))
}

async fn saml_acs(State(controller): State<Arc<SsoController>>, body: Bytes) -> Response {
    let form = SamlCallbackForm::from_body(&body);
    let outcome = controller.handle_saml_callback(form);
    outcome_response(&controller, outcome)
}

async fn saml_metadata(State(controller): State<Arc<SsoController>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        controller.sp_metadata(),
    )
        .into_response()
}

async fn current_session(
    State(controller): State<Arc<SsoController>>,
    headers: HeaderMap,
) -> Result<Response, SsoError> {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok());

    match controller.current_session(cookie)? {
        Some(session) => Ok(Json(SessionView::from(session)).into_response()),
        None => Ok((
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthenticated",
                details: None,
            }),
        )
            .into_response()),
    }
}
