//! Consent Guard Core
//!
//! Consent and access-control model for a patient health record platform:
//! - Consent ledger (scoped, time-boxed grants from patients to doctors)
//! - Access log (append-only audit trail, anchored in an integrity ledger)
//! - QR access tokens (expiring capabilities with bounded redemptions)
//! - Emergency break-glass protocol (stepwise verified override)
//! - Role dispatch over explicit actor sessions
//!
//! Every decision, allowed or denied, is logged before it is returned. If the
//! log cannot be written the caller receives [`ConsentError::LogUnavailable`]
//! and no data.
//!
//! # Example
//!
//! ```no_run
//! use consent_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), ConsentError> {
//! let control = AccessControl::new(
//!     Collaborators {
//!         store: Arc::new(MemoryStore::new()),
//!         ledger: Arc::new(MemoryLedger::new()),
//!         codes: Arc::new(EmergencyCodeBook::random()),
//!         biometrics: Arc::new(StaticBiometricVerifier::accepting()),
//!     },
//!     ConsentConfig::default(),
//! )?;
//!
//! let now = chrono::Utc::now();
//! let session = control.directory().authenticate(&ActorId::new("dr-1"), now).await?;
//! let outcome = control
//!     .dispatch(
//!         &session,
//!         RoleAction::Doctor(DoctorAction::ReadRecords {
//!             patient_id: PatientId::new("p-1"),
//!             categories: scopes([DataCategory::Vitals]),
//!         }),
//!         now,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod consent;
pub mod emergency;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod locks;
pub mod service;
pub mod store;
pub mod token;
pub mod types;

pub use audit::{
    AccessBasis, AccessDecision, AccessEvent, AccessLog, AccessLogFilter, AccessSummary,
    DateRange, EventCursor, EventQuery, PendingEvent,
};
pub use config::ConsentConfig;
pub use consent::{ConsentGrant, ConsentLedger, GrantRequest, GrantStatus, Purpose};
pub use emergency::{
    BiometricVerifier, EmergencyCodeBook, EmergencyCodeVerifier, EmergencyLimits,
    EmergencyProtocol, EmergencySession, EndReason, Stage, StageTransition,
    StaticBiometricVerifier,
};
pub use error::{ConsentError, ConsentResult};
pub use identity::{ActorSession, Directory, DoctorProfile};
pub use ledger::{
    CollaboratorError, IntegrityHash, IntegrityLedger, LedgerEntry, LedgerRecord, MemoryLedger,
};
pub use service::{
    AccessControl, ActionOutcome, AdminAction, Collaborators, DoctorAction, PatientAction,
    RoleAction,
};
pub use store::{MemoryStore, Store, StoreError};
pub use token::{AccessToken, TokenIssuer, TokenKind, TokenPolicy};
pub use types::{
    scopes, Actor, ActorId, Channel, DataCategory, Decision, Doctor, DoctorId, EventId, GrantId,
    Patient, PatientId, Role, Scopes, SessionId, TokenId,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::audit::{AccessDecision, AccessEvent, AccessLogFilter, AccessSummary};
    pub use crate::config::ConsentConfig;
    pub use crate::consent::{ConsentGrant, GrantRequest, Purpose};
    pub use crate::emergency::{
        EmergencyCodeBook, EmergencySession, Stage, StaticBiometricVerifier,
    };
    pub use crate::error::{ConsentError, ConsentResult};
    pub use crate::identity::{ActorSession, DoctorProfile};
    pub use crate::ledger::MemoryLedger;
    pub use crate::service::{
        AccessControl, ActionOutcome, AdminAction, Collaborators, DoctorAction, PatientAction,
        RoleAction,
    };
    pub use crate::store::MemoryStore;
    pub use crate::token::{AccessToken, TokenKind, TokenPolicy};
    pub use crate::types::*;
}
