//! SSO session types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Fixed lifetime of an SSO session from issuance.
pub const SESSION_LIFETIME_HOURS: i64 = 8;

/// Unique session identifier (16-byte random value, hex-encoded for storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Convert to hex string for storage/cookies.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A completed federated login.
///
/// Expiry is lazy: nothing removes a session when it lapses, readers check
/// [`SsoSession::is_expired`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsoSession {
    pub id: SessionId,

    pub provider_id: String,

    /// Application account id.
    pub user_id: String,

    /// SAML `SessionIndex`, used for single-logout correlation.
    pub external_session_id: Option<String>,

    /// SAML `NameID` or OAuth `sub`.
    pub name_id: String,

    pub issued_at: DateTime<Utc>,

    /// Always `issued_at + 8h`.
    pub expires_at: DateTime<Utc>,
}

impl SsoSession {
    pub fn new(
        provider_id: impl Into<String>,
        user_id: impl Into<String>,
        external_session_id: Option<String>,
        name_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            provider_id: provider_id.into(),
            user_id: user_id.into(),
            external_session_id,
            name_id: name_id.into(),
            issued_at: now,
            expires_at: now + Duration::hours(SESSION_LIFETIME_HOURS),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Seconds until expiry, zero once lapsed.
    pub fn remaining_secs(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u64
    }
}
