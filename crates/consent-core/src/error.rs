//! Error taxonomy for consent and access decisions.
//!
//! A denied access is NOT an error: it is a normal [`crate::Decision::Denied`]
//! result and is always written to the access log. Errors are reserved for
//! caller-correctable validation failures, state-machine violations,
//! exhausted capabilities and infrastructure failures.

use crate::emergency::Stage;
use crate::store::StoreError;
use crate::types::{ActorId, DoctorId, GrantId, PatientId, Role, SessionId, TokenId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsentError {
    // Validation
    #[error("scope set must name at least one data category")]
    InvalidScope,

    #[error("validity window is inverted: starts {valid_from}, ends {valid_until}")]
    InvalidValidityWindow {
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    },

    #[error("invalid token policy: {0}")]
    InvalidTokenPolicy(String),

    #[error("doctor {0} is not verified")]
    UnverifiedDoctor(DoctorId),

    #[error("acting party does not own {0}")]
    NotOwner(String),

    #[error("consent grant {0} has been revoked")]
    GrantRevoked(GrantId),

    #[error("emergency access requires a justification")]
    MissingJustification,

    #[error("action requires role {expected}, session has role {actual}")]
    RoleMismatch { expected: Role, actual: Role },

    #[error("actor {actor} has no {role} profile")]
    MissingProfile { actor: ActorId, role: Role },

    #[error("unknown actor {0}")]
    UnknownActor(ActorId),

    #[error("unknown patient {0}")]
    UnknownPatient(PatientId),

    #[error("unknown doctor {0}")]
    UnknownDoctor(DoctorId),

    #[error("unknown consent grant {0}")]
    UnknownGrant(GrantId),

    #[error("unknown access token {0}")]
    UnknownToken(TokenId),

    #[error("unknown emergency session {0}")]
    UnknownSession(SessionId),

    #[error("record already exists: {0}")]
    DuplicateRecord(String),

    // Emergency state machine
    #[error("emergency session cannot move from {from:?} to {attempted:?}")]
    InvalidStageTransition { from: Stage, attempted: Stage },

    #[error("emergency access code is invalid or expired")]
    InvalidEmergencyCode,

    #[error("biometric verification failed: {0}")]
    BiometricFailed(String),

    #[error("emergency session {0} is not active")]
    EmergencySessionInactive(SessionId),

    // Token exhaustion
    #[error("access token {0} has expired")]
    TokenExpired(TokenId),

    #[error("access token {0} has no redemptions left")]
    TokenExhausted(TokenId),

    // Infrastructure
    /// The audit sink could not record the decision. Access is refused.
    #[error("access log unavailable: {0}")]
    LogUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConsentError {
    /// Errors the caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsentError::LogUnavailable(_) | ConsentError::Store(StoreError::Unavailable(_))
        )
    }
}

pub type ConsentResult<T> = Result<T, ConsentError>;
