//! Role dispatch - the single entry point for authenticated actors.
//!
//! [`AccessControl`] wires the components around injected collaborators.
//! Callers hand it an [`ActorSession`] and a [`RoleAction`]; the action's
//! role must match the session's role, and patient or doctor actions always
//! act on the session's own profile.

use crate::audit::{AccessDecision, AccessEvent, AccessLog, AccessLogFilter, AccessSummary};
use crate::config::ConsentConfig;
use crate::consent::{ConsentGrant, ConsentLedger, GrantRequest, Purpose};
use crate::emergency::{
    BiometricVerifier, EmergencyCodeVerifier, EmergencyLimits, EmergencyProtocol,
    EmergencySession,
};
use crate::error::{ConsentError, ConsentResult};
use crate::identity::{ActorSession, Directory};
use crate::ledger::IntegrityLedger;
use crate::store::Store;
use crate::token::{AccessToken, TokenIssuer, TokenKind, TokenPolicy};
use crate::types::{
    Doctor, DoctorId, GrantId, Patient, PatientId, Role, Scopes, SessionId, TokenId,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

/// External systems the core depends on
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub ledger: Arc<dyn IntegrityLedger>,
    pub codes: Arc<dyn EmergencyCodeVerifier>,
    pub biometrics: Arc<dyn BiometricVerifier>,
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleAction {
    Patient(PatientAction),
    Doctor(DoctorAction),
    Admin(AdminAction),
}

impl RoleAction {
    pub fn role(&self) -> Role {
        match self {
            RoleAction::Patient(_) => Role::Patient,
            RoleAction::Doctor(_) => Role::Doctor,
            RoleAction::Admin(_) => Role::Admin,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RoleAction::Patient(action) => match action {
                PatientAction::GrantConsent { .. } => "grant_consent",
                PatientAction::RevokeConsent { .. } => "revoke_consent",
                PatientAction::SetConsentActive { .. } => "set_consent_active",
                PatientAction::ListConsents => "list_consents",
                PatientAction::IssueToken { .. } => "issue_token",
                PatientAction::IssueTokenForGrant { .. } => "issue_token_for_grant",
                PatientAction::RevokeToken { .. } => "revoke_token",
                PatientAction::AccessHistory { .. } => "access_history",
                PatientAction::FindDoctors { .. } => "find_doctors",
            },
            RoleAction::Doctor(action) => match action {
                DoctorAction::ReadRecords { .. } => "read_records",
                DoctorAction::RedeemToken { .. } => "redeem_token",
                DoctorAction::OpenEmergency { .. } => "open_emergency",
                DoctorAction::SubmitEmergencyCode { .. } => "submit_emergency_code",
                DoctorAction::VerifyBiometric { .. } => "verify_biometric",
                DoctorAction::EmergencyRead { .. } => "emergency_read",
                DoctorAction::EndEmergency { .. } => "end_emergency",
            },
            RoleAction::Admin(action) => match action {
                AdminAction::SetDoctorVerified { .. } => "set_doctor_verified",
                AdminAction::AuditTrail { .. } => "audit_trail",
                AdminAction::Summarize { .. } => "summarize",
                AdminAction::PurgeAbandonedSessions => "purge_abandoned_sessions",
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PatientAction {
    GrantConsent {
        doctor_id: DoctorId,
        scopes: Scopes,
        /// Defaults to the time of the request
        #[serde(default)]
        valid_from: Option<DateTime<Utc>>,
        valid_until: DateTime<Utc>,
        #[serde(default)]
        emergency_eligible: bool,
        #[serde(default)]
        purpose: Purpose,
    },
    RevokeConsent {
        grant_id: GrantId,
    },
    SetConsentActive {
        grant_id: GrantId,
        active: bool,
    },
    ListConsents,
    IssueToken {
        kind: TokenKind,
        scopes: Scopes,
        #[serde(default)]
        ttl_hours: Option<u32>,
        #[serde(default)]
        max_redemptions: Option<u32>,
    },
    IssueTokenForGrant {
        grant_id: GrantId,
        kind: TokenKind,
        #[serde(default)]
        ttl_hours: Option<u32>,
        #[serde(default)]
        max_redemptions: Option<u32>,
    },
    RevokeToken {
        token_id: TokenId,
    },
    /// Events on the patient's own record
    AccessHistory {
        #[serde(default)]
        filter: AccessLogFilter,
    },
    FindDoctors {
        specialization: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DoctorAction {
    ReadRecords {
        patient_id: PatientId,
        categories: Scopes,
    },
    RedeemToken {
        token_id: TokenId,
    },
    OpenEmergency {
        justification: String,
    },
    SubmitEmergencyCode {
        session_id: SessionId,
        code: String,
    },
    VerifyBiometric {
        session_id: SessionId,
    },
    EmergencyRead {
        session_id: SessionId,
        patient_id: PatientId,
        categories: Scopes,
    },
    EndEmergency {
        session_id: SessionId,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminAction {
    SetDoctorVerified {
        doctor_id: DoctorId,
        verified: bool,
    },
    AuditTrail {
        #[serde(default)]
        filter: AccessLogFilter,
    },
    Summarize {
        #[serde(default)]
        filter: AccessLogFilter,
    },
    PurgeAbandonedSessions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ActionOutcome {
    Grant(ConsentGrant),
    Grants(Vec<ConsentGrant>),
    Token(AccessToken),
    Decision(AccessDecision),
    Session(EmergencySession),
    Events(Vec<AccessEvent>),
    Summary(AccessSummary),
    Doctor(Doctor),
    Doctors(Vec<Doctor>),
    Purged { count: usize },
}

// ============================================================================
// Facade
// ============================================================================

pub struct AccessControl {
    config: ConsentConfig,
    directory: Directory,
    log: AccessLog,
    consents: ConsentLedger,
    tokens: TokenIssuer,
    emergency: EmergencyProtocol,
}

impl AccessControl {
    pub fn new(collaborators: Collaborators, config: ConsentConfig) -> ConsentResult<Self> {
        config.validate()?;
        let Collaborators {
            store,
            ledger,
            codes,
            biometrics,
        } = collaborators;

        let log = AccessLog::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            config.ledger_timeout(),
            config.query_page_size,
        );
        let consents = ConsentLedger::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            log.clone(),
            config.ledger_timeout(),
        );
        let tokens = TokenIssuer::new(Arc::clone(&store), log.clone(), config.max_token_ttl());
        let emergency = EmergencyProtocol::new(
            Arc::clone(&store),
            log.clone(),
            codes,
            biometrics,
            EmergencyLimits {
                biometric_timeout: config.biometric_timeout(),
                session_max: config.emergency_session_max(),
                abandoned_after: config.abandoned_session_ceiling(),
            },
        );

        Ok(Self {
            config,
            directory: Directory::new(store),
            log,
            consents,
            tokens,
            emergency,
        })
    }

    pub fn config(&self) -> &ConsentConfig {
        &self.config
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn access_log(&self) -> &AccessLog {
        &self.log
    }

    pub fn consents(&self) -> &ConsentLedger {
        &self.consents
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn emergency(&self) -> &EmergencyProtocol {
        &self.emergency
    }

    /// Run `action` on behalf of `session`
    #[instrument(
        skip(self, session, action),
        fields(actor = %session.actor_id(), action = action.name())
    )]
    pub async fn dispatch(
        &self,
        session: &ActorSession,
        action: RoleAction,
        now: DateTime<Utc>,
    ) -> ConsentResult<ActionOutcome> {
        let expected = action.role();
        if session.role() != expected {
            return Err(ConsentError::RoleMismatch {
                expected,
                actual: session.role(),
            });
        }

        match action {
            RoleAction::Patient(action) => {
                let patient = self.directory.patient_for(session.actor_id()).await?;
                self.patient_action(&patient, action, now).await
            }
            RoleAction::Doctor(action) => {
                let doctor = self.directory.doctor_for(session.actor_id()).await?;
                self.doctor_action(session, &doctor, action, now).await
            }
            RoleAction::Admin(action) => self.admin_action(session, action, now).await,
        }
    }

    fn token_policy(
        &self,
        kind: TokenKind,
        ttl_hours: Option<u32>,
        max_redemptions: Option<u32>,
    ) -> TokenPolicy {
        let ttl = ttl_hours
            .map(|h| Duration::hours(h as i64))
            .unwrap_or_else(|| self.config.default_token_ttl());
        TokenPolicy::new(kind, ttl, max_redemptions.unwrap_or(1))
    }

    async fn patient_action(
        &self,
        patient: &Patient,
        action: PatientAction,
        now: DateTime<Utc>,
    ) -> ConsentResult<ActionOutcome> {
        let own = &patient.patient_id;
        match action {
            PatientAction::GrantConsent {
                doctor_id,
                scopes,
                valid_from,
                valid_until,
                emergency_eligible,
                purpose,
            } => {
                let request = GrantRequest::new(
                    own.clone(),
                    doctor_id,
                    scopes,
                    valid_from.unwrap_or(now),
                    valid_until,
                )
                .emergency_eligible(emergency_eligible)
                .purpose(purpose);
                Ok(ActionOutcome::Grant(self.consents.grant(request, now).await?))
            }
            PatientAction::RevokeConsent { grant_id } => Ok(ActionOutcome::Grant(
                self.consents.revoke(&grant_id, own, now).await?,
            )),
            PatientAction::SetConsentActive { grant_id, active } => Ok(ActionOutcome::Grant(
                self.consents.set_active(&grant_id, own, active, now).await?,
            )),
            PatientAction::ListConsents => Ok(ActionOutcome::Grants(
                self.consents.grants_for_patient(own).await?,
            )),
            PatientAction::IssueToken {
                kind,
                scopes,
                ttl_hours,
                max_redemptions,
            } => {
                let policy = self.token_policy(kind, ttl_hours, max_redemptions);
                Ok(ActionOutcome::Token(
                    self.tokens.issue(own, scopes, policy, now).await?,
                ))
            }
            PatientAction::IssueTokenForGrant {
                grant_id,
                kind,
                ttl_hours,
                max_redemptions,
            } => {
                let policy = self.token_policy(kind, ttl_hours, max_redemptions);
                Ok(ActionOutcome::Token(
                    self.tokens
                        .issue_for_grant(&grant_id, own, policy, now)
                        .await?,
                ))
            }
            PatientAction::RevokeToken { token_id } => Ok(ActionOutcome::Token(
                self.tokens.revoke_token(&token_id, own, now).await?,
            )),
            PatientAction::AccessHistory { mut filter } => {
                filter.patient_id = Some(own.clone());
                Ok(ActionOutcome::Events(
                    self.log.query(filter).collect_all().await?,
                ))
            }
            PatientAction::FindDoctors { specialization } => Ok(ActionOutcome::Doctors(
                self.directory
                    .doctors_by_specialization(&specialization)
                    .await?,
            )),
        }
    }

    async fn doctor_action(
        &self,
        session: &ActorSession,
        doctor: &Doctor,
        action: DoctorAction,
        now: DateTime<Utc>,
    ) -> ConsentResult<ActionOutcome> {
        let actor = session.actor_id();
        match action {
            DoctorAction::ReadRecords {
                patient_id,
                categories,
            } => Ok(ActionOutcome::Decision(
                self.consents
                    .check_access(&patient_id, &doctor.doctor_id, &categories, now)
                    .await?,
            )),
            DoctorAction::RedeemToken { token_id } => Ok(ActionOutcome::Decision(
                self.tokens.redeem(&token_id, &doctor.doctor_id, now).await?,
            )),
            DoctorAction::OpenEmergency { justification } => Ok(ActionOutcome::Session(
                self.emergency.open(actor, &justification, now).await?,
            )),
            DoctorAction::SubmitEmergencyCode { session_id, code } => Ok(ActionOutcome::Session(
                self.emergency
                    .verify_code(&session_id, actor, &code, now)
                    .await?,
            )),
            DoctorAction::VerifyBiometric { session_id } => Ok(ActionOutcome::Session(
                self.emergency
                    .verify_biometric(&session_id, actor, now)
                    .await?,
            )),
            DoctorAction::EmergencyRead {
                session_id,
                patient_id,
                categories,
            } => Ok(ActionOutcome::Decision(
                self.emergency
                    .read(&session_id, actor, &patient_id, categories, now)
                    .await?,
            )),
            DoctorAction::EndEmergency { session_id } => Ok(ActionOutcome::Session(
                self.emergency.end(&session_id, actor, now).await?,
            )),
        }
    }

    async fn admin_action(
        &self,
        session: &ActorSession,
        action: AdminAction,
        now: DateTime<Utc>,
    ) -> ConsentResult<ActionOutcome> {
        match action {
            AdminAction::SetDoctorVerified {
                doctor_id,
                verified,
            } => Ok(ActionOutcome::Doctor(
                self.directory
                    .set_doctor_verified(session, &doctor_id, verified)
                    .await?,
            )),
            AdminAction::AuditTrail { filter } => Ok(ActionOutcome::Events(
                self.log.query(filter).collect_all().await?,
            )),
            AdminAction::Summarize { filter } => {
                Ok(ActionOutcome::Summary(self.log.summarize(filter).await?))
            }
            AdminAction::PurgeAbandonedSessions => Ok(ActionOutcome::Purged {
                count: self.emergency.purge_abandoned(now).await?,
            }),
        }
    }
}
