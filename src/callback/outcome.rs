//! Callback states and terminal outcomes.

use std::fmt;

use crate::error::SsoError;
use crate::session::SsoSession;

/// Progress of a callback through the login state machine.
///
/// Stages are strictly ordered; a callback only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallbackStage {
    Received,
    ProviderResolved,
    IdentityValidated,
    AttributesMapped,
    DomainChecked,
    AccountResolved,
    SessionCreated,
    Redirected,
}

impl CallbackStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStage::Received => "received",
            CallbackStage::ProviderResolved => "provider_resolved",
            CallbackStage::IdentityValidated => "identity_validated",
            CallbackStage::AttributesMapped => "attributes_mapped",
            CallbackStage::DomainChecked => "domain_checked",
            CallbackStage::AccountResolved => "account_resolved",
            CallbackStage::SessionCreated => "session_created",
            CallbackStage::Redirected => "redirected",
        }
    }
}

impl fmt::Display for CallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one callback. Every variant has been audited.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Session issued; send the browser to `location`.
    Redirect {
        location: String,
        session: SsoSession,
        created_account: bool,
    },
    /// `stage` is the last state reached before `error`.
    Failed { stage: CallbackStage, error: SsoError },
}

impl CallbackOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallbackOutcome::Redirect { .. })
    }

    /// Terminal stage: `Redirected` on success, otherwise the last stage
    /// reached before the failure.
    pub fn stage(&self) -> CallbackStage {
        match self {
            CallbackOutcome::Redirect { .. } => CallbackStage::Redirected,
            CallbackOutcome::Failed { stage, .. } => *stage,
        }
    }

    pub fn error(&self) -> Option<&SsoError> {
        match self {
            CallbackOutcome::Failed { error, .. } => Some(error),
            CallbackOutcome::Redirect { .. } => None,
        }
    }
}
