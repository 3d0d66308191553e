//! Login attempt audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::Protocol;

/// One terminal outcome of a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub id: String,

    /// Absent when the provider could not be determined.
    pub provider_id: Option<String>,

    pub protocol: Protocol,

    /// Absent when identity resolution never completed.
    pub user_id: Option<String>,

    pub email: Option<String>,

    pub success: bool,

    pub error_message: Option<String>,

    /// Stable machine code, e.g. `domain_not_allowed`.
    pub error_code: Option<String>,

    /// Last callback stage reached.
    pub stage: String,

    pub created_at: DateTime<Utc>,
}
