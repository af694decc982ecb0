//! Emergency break-glass protocol.
//!
//! A doctor opens a session with a written justification, proves possession
//! of an emergency access code, then passes biometric verification. Only
//! then does the session become `Active` and allow reads that bypass the
//! consent ledger. Every read, allowed or not, is logged on the emergency
//! channel.
//!
//! ```text
//! Justification -> CodeVerified -> BiometricVerified -> Active -> Ended
//! ```

use crate::audit::{AccessBasis, AccessDecision, AccessLog, PendingEvent};
use crate::error::{ConsentError, ConsentResult};
use crate::ledger::CollaboratorError;
use crate::locks::{KeyGuard, KeyedLocks};
use crate::store::Store;
use crate::types::{ActorId, Channel, Decision, DoctorId, PatientId, Role, Scopes, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// Length of codes produced by [`EmergencyCodeBook::generate`]
pub const GENERATED_CODE_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Justification,
    CodeVerified,
    BiometricVerified,
    Active,
    Ended,
}

impl Stage {
    /// The only stage reachable from this one
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Justification => Some(Stage::CodeVerified),
            Stage::CodeVerified => Some(Stage::BiometricVerified),
            Stage::BiometricVerified => Some(Stage::Active),
            Stage::Active => Some(Stage::Ended),
            Stage::Ended => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Explicit,
    TimedOut,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencySession {
    pub id: SessionId,
    pub requesting_actor: ActorId,
    pub doctor_id: DoctorId,
    pub justification: String,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub last_activity: DateTime<Utc>,
    /// Rejected codes and biometric checks
    pub failed_attempts: u32,
    /// Every stage change, oldest first
    pub transitions: Vec<StageTransition>,
}

impl EmergencySession {
    /// Move to `to`, which must be the stage directly after the current one
    pub fn advance(&mut self, to: Stage, now: DateTime<Utc>) -> ConsentResult<()> {
        if self.stage.next() != Some(to) {
            return Err(ConsentError::InvalidStageTransition {
                from: self.stage,
                attempted: to,
            });
        }
        self.transitions.push(StageTransition {
            from: self.stage,
            to,
            at: now,
        });
        self.stage = to;
        self.last_activity = now;
        match to {
            Stage::Active => self.activated_at = Some(now),
            Stage::Ended => self.ended_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    fn require_stage(&self, expected: Stage, attempted: Stage) -> ConsentResult<()> {
        if self.stage != expected {
            return Err(ConsentError::InvalidStageTransition {
                from: self.stage,
                attempted,
            });
        }
        Ok(())
    }

    /// True once an active session has outlived `max`
    pub fn is_timed_out(&self, max: Duration, now: DateTime<Utc>) -> bool {
        match (self.stage, self.activated_at) {
            (Stage::Active, Some(activated)) => now >= activated + max,
            _ => false,
        }
    }
}

// ==================== Collaborators ====================

/// Checks emergency access codes issued out of band
#[async_trait]
pub trait EmergencyCodeVerifier: Send + Sync {
    async fn verify(
        &self,
        actor: &ActorId,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CollaboratorError>;
}

/// Confirms the physical presence of the requesting actor
#[async_trait]
pub trait BiometricVerifier: Send + Sync {
    async fn verify(&self, actor: &ActorId) -> Result<bool, CollaboratorError>;
}

struct IssuedCode {
    digest: Vec<u8>,
    expires_at: DateTime<Utc>,
    issued_to: Option<ActorId>,
}

/// Emergency codes kept as HMAC-SHA256 digests, never in clear text
pub struct EmergencyCodeBook {
    key: Vec<u8>,
    codes: Mutex<Vec<IssuedCode>>,
}

impl EmergencyCodeBook {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            codes: Mutex::new(Vec::new()),
        }
    }

    /// Code book with a fresh random 32-byte key
    pub fn random() -> Self {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    fn mac(&self, code: &str) -> Result<HmacSha256, CollaboratorError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| CollaboratorError::Rejected(format!("bad code book key: {}", e)))?;
        mac.update(code.trim().as_bytes());
        Ok(mac)
    }

    /// Register `code`. With `issued_to` set, only that actor may use it.
    pub fn issue(
        &self,
        code: &str,
        issued_to: Option<ActorId>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        let digest = self.mac(code)?.finalize().into_bytes().to_vec();
        let mut codes = self
            .codes
            .lock()
            .map_err(|_| CollaboratorError::Unreachable("code book poisoned".to_string()))?;
        codes.push(IssuedCode {
            digest,
            expires_at,
            issued_to,
        });
        Ok(())
    }

    /// Generate, register and return a random alphanumeric code
    pub fn generate(
        &self,
        issued_to: Option<ActorId>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, CollaboratorError> {
        let code: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_CODE_LEN)
            .map(char::from)
            .collect::<String>()
            .to_uppercase();
        self.issue(&code, issued_to, expires_at)?;
        Ok(code)
    }
}

#[async_trait]
impl EmergencyCodeVerifier for EmergencyCodeBook {
    async fn verify(
        &self,
        actor: &ActorId,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CollaboratorError> {
        let mac = self.mac(code)?;
        let codes = self
            .codes
            .lock()
            .map_err(|_| CollaboratorError::Unreachable("code book poisoned".to_string()))?;
        Ok(codes.iter().any(|issued| {
            now < issued.expires_at
                && issued.issued_to.as_ref().map_or(true, |to| to == actor)
                && mac.clone().verify_slice(&issued.digest).is_ok()
        }))
    }
}

/// Biometric verifier with a fixed answer
pub struct StaticBiometricVerifier {
    accept: bool,
    latency: Option<std::time::Duration>,
}

impl StaticBiometricVerifier {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            latency: None,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            accept: false,
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl BiometricVerifier for StaticBiometricVerifier {
    async fn verify(&self, _actor: &ActorId) -> Result<bool, CollaboratorError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.accept)
    }
}

// ==================== Protocol ====================

/// Timing limits for emergency sessions
#[derive(Clone, Copy, Debug)]
pub struct EmergencyLimits {
    pub biometric_timeout: std::time::Duration,
    /// Lifetime of a session once active
    pub session_max: Duration,
    /// Idle time before an unfinished verification may be purged
    pub abandoned_after: Duration,
}

pub struct EmergencyProtocol {
    store: Arc<dyn Store>,
    log: AccessLog,
    codes: Arc<dyn EmergencyCodeVerifier>,
    biometrics: Arc<dyn BiometricVerifier>,
    locks: KeyedLocks<SessionId>,
    limits: EmergencyLimits,
}

impl EmergencyProtocol {
    pub fn new(
        store: Arc<dyn Store>,
        log: AccessLog,
        codes: Arc<dyn EmergencyCodeVerifier>,
        biometrics: Arc<dyn BiometricVerifier>,
        limits: EmergencyLimits,
    ) -> Self {
        Self {
            store,
            log,
            codes,
            biometrics,
            locks: KeyedLocks::new(),
            limits,
        }
    }

    /// Open a session in the `Justification` stage
    #[instrument(skip(self, justification))]
    pub async fn open(
        &self,
        actor: &ActorId,
        justification: &str,
        now: DateTime<Utc>,
    ) -> ConsentResult<EmergencySession> {
        let justification = justification.trim();
        if justification.is_empty() {
            return Err(ConsentError::MissingJustification);
        }
        let doctor = self
            .store
            .doctor_for_actor(actor)
            .await?
            .ok_or_else(|| ConsentError::MissingProfile {
                actor: actor.clone(),
                role: Role::Doctor,
            })?;

        let session = EmergencySession {
            id: SessionId::generate(),
            requesting_actor: actor.clone(),
            doctor_id: doctor.doctor_id,
            justification: justification.to_string(),
            stage: Stage::Justification,
            started_at: now,
            activated_at: None,
            ended_at: None,
            end_reason: None,
            last_activity: now,
            failed_attempts: 0,
            transitions: Vec::new(),
        };
        self.store.put_session(&session).await?;
        warn!(session_id = %session.id, doctor = %session.doctor_id, "emergency session opened");
        Ok(session)
    }

    #[instrument(skip(self, code))]
    pub async fn verify_code(
        &self,
        session_id: &SessionId,
        actor: &ActorId,
        code: &str,
        now: DateTime<Utc>,
    ) -> ConsentResult<EmergencySession> {
        let (mut session, _guard) = self.lock_owned(session_id, actor).await?;
        session.require_stage(Stage::Justification, Stage::CodeVerified)?;

        let valid = match self.codes.verify(actor, code, now).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "emergency code verifier failed");
                false
            }
        };
        if !valid {
            session.failed_attempts += 1;
            session.last_activity = now;
            self.store.put_session(&session).await?;
            warn!(
                session_id = %session_id,
                failed_attempts = session.failed_attempts,
                "emergency code rejected"
            );
            return Err(ConsentError::InvalidEmergencyCode);
        }

        session.advance(Stage::CodeVerified, now)?;
        self.store.put_session(&session).await?;
        info!(session_id = %session_id, "emergency code verified");
        Ok(session)
    }

    /// Biometric check; on success the session goes straight to `Active`
    #[instrument(skip(self))]
    pub async fn verify_biometric(
        &self,
        session_id: &SessionId,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> ConsentResult<EmergencySession> {
        let (mut session, _guard) = self.lock_owned(session_id, actor).await?;
        session.require_stage(Stage::CodeVerified, Stage::BiometricVerified)?;

        let outcome = tokio::time::timeout(
            self.limits.biometric_timeout,
            self.biometrics.verify(actor),
        )
        .await;
        let failure = match outcome {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some("biometric did not match".to_string()),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "no answer within {} ms",
                self.limits.biometric_timeout.as_millis()
            )),
        };
        if let Some(reason) = failure {
            session.failed_attempts += 1;
            session.last_activity = now;
            self.store.put_session(&session).await?;
            warn!(session_id = %session_id, reason = %reason, "biometric verification failed");
            return Err(ConsentError::BiometricFailed(reason));
        }

        session.advance(Stage::BiometricVerified, now)?;
        session.advance(Stage::Active, now)?;
        self.store.put_session(&session).await?;
        warn!(session_id = %session_id, doctor = %session.doctor_id, "emergency access active");
        Ok(session)
    }

    /// Read patient data through an active session, bypassing consent
    #[instrument(skip(self, categories))]
    pub async fn read(
        &self,
        session_id: &SessionId,
        actor: &ActorId,
        patient_id: &PatientId,
        categories: Scopes,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessDecision> {
        if categories.is_empty() {
            return Err(ConsentError::InvalidScope);
        }
        let (mut session, _guard) = self.lock_owned(session_id, actor).await?;
        if self.store.patient(patient_id).await?.is_none() {
            return Err(ConsentError::UnknownPatient(patient_id.clone()));
        }

        if session.is_timed_out(self.limits.session_max, now) {
            session.advance(Stage::Ended, now)?;
            session.end_reason = Some(EndReason::TimedOut);
            self.store.put_session(&session).await?;
            info!(session_id = %session_id, "emergency session timed out");
        }

        let pending = PendingEvent::new(
            Channel::Emergency,
            patient_id.clone(),
            session.doctor_id.clone(),
            categories.clone(),
            now,
        )
        .with_basis(AccessBasis::Emergency(session.id.clone()));

        if session.stage != Stage::Active {
            self.log
                .append(pending.deny(format!("emergency session is {:?}", session.stage)))
                .await?;
            return Err(ConsentError::EmergencySessionInactive(session.id));
        }

        let event = self
            .log
            .append(pending.allow(
                Decision::EmergencyAllowed,
                &categories,
                AccessBasis::Emergency(session.id.clone()),
                format!("break-glass: {}", session.justification),
            ))
            .await?;
        session.last_activity = now;
        self.store.put_session(&session).await?;
        Ok(AccessDecision::from(&event))
    }

    #[instrument(skip(self))]
    pub async fn end(
        &self,
        session_id: &SessionId,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> ConsentResult<EmergencySession> {
        let (mut session, _guard) = self.lock_owned(session_id, actor).await?;
        let reason = if session.is_timed_out(self.limits.session_max, now) {
            EndReason::TimedOut
        } else {
            EndReason::Explicit
        };
        session.advance(Stage::Ended, now)?;
        session.end_reason = Some(reason);
        self.store.put_session(&session).await?;
        info!(session_id = %session_id, reason = ?reason, "emergency session ended");
        Ok(session)
    }

    pub async fn session(&self, session_id: &SessionId) -> ConsentResult<EmergencySession> {
        self.store
            .session(session_id)
            .await?
            .ok_or_else(|| ConsentError::UnknownSession(session_id.clone()))
    }

    /// Remove sessions that never activated and have sat idle past the ceiling
    #[instrument(skip(self))]
    pub async fn purge_abandoned(&self, now: DateTime<Utc>) -> ConsentResult<usize> {
        let mut purged = 0;
        for candidate in self.store.sessions().await? {
            if !self.is_abandoned(&candidate, now) {
                continue;
            }
            let _guard = self.locks.acquire(&candidate.id).await;
            // Recheck under the lock
            let still_abandoned = self
                .store
                .session(&candidate.id)
                .await?
                .map_or(false, |s| self.is_abandoned(&s, now));
            if still_abandoned && self.store.remove_session(&candidate.id).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "abandoned emergency sessions purged");
        }
        Ok(purged)
    }

    fn is_abandoned(&self, session: &EmergencySession, now: DateTime<Utc>) -> bool {
        session.stage < Stage::Active && now - session.last_activity > self.limits.abandoned_after
    }

    async fn lock_owned(
        &self,
        session_id: &SessionId,
        actor: &ActorId,
    ) -> ConsentResult<(EmergencySession, KeyGuard<'_, SessionId>)> {
        let guard = self.locks.acquire(session_id).await;
        let session = self.session(session_id).await?;
        if &session.requesting_actor != actor {
            return Err(ConsentError::NotOwner(format!("emergency session {}", session_id)));
        }
        Ok((session, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::store::MemoryStore;
    use crate::types::{scopes, DataCategory, Doctor, Patient};
    use chrono::TimeZone;

    const CODE: &str = "EMERGENCY123";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap()
    }

    fn limits() -> EmergencyLimits {
        EmergencyLimits {
            biometric_timeout: std::time::Duration::from_millis(200),
            session_max: Duration::minutes(240),
            abandoned_after: Duration::minutes(30),
        }
    }

    async fn protocol_with(
        biometrics: StaticBiometricVerifier,
    ) -> (Arc<MemoryStore>, EmergencyProtocol) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_patient(&Patient {
                patient_id: PatientId::new("p1"),
                owner: ActorId::new("alice"),
            })
            .await
            .unwrap();
        store
            .insert_doctor(&Doctor {
                doctor_id: DoctorId::new("d1"),
                actor_id: ActorId::new("dr-smith"),
                specialization: "Emergency Medicine".into(),
                hospital: "General".into(),
                license_number: "LIC-1".into(),
                verified: true,
            })
            .await
            .unwrap();
        let codes = EmergencyCodeBook::new(b"test-key".to_vec());
        codes.issue(CODE, None, t0() + Duration::days(1)).unwrap();
        let log = AccessLog::new(
            store.clone(),
            Arc::new(MemoryLedger::new()),
            std::time::Duration::from_secs(1),
            50,
        );
        let protocol = EmergencyProtocol::new(
            store.clone(),
            log,
            Arc::new(codes),
            Arc::new(biometrics),
            limits(),
        );
        (store, protocol)
    }

    async fn active_session(protocol: &EmergencyProtocol) -> EmergencySession {
        let actor = ActorId::new("dr-smith");
        let session = protocol
            .open(&actor, "unconscious patient in ER", t0())
            .await
            .unwrap();
        protocol.verify_code(&session.id, &actor, CODE, t0()).await.unwrap();
        protocol.verify_biometric(&session.id, &actor, t0()).await.unwrap()
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Justification.next(), Some(Stage::CodeVerified));
        assert_eq!(Stage::Active.next(), Some(Stage::Ended));
        assert_eq!(Stage::Ended.next(), None);
        assert!(Stage::BiometricVerified < Stage::Active);
    }

    #[tokio::test]
    async fn test_code_book_respects_expiry_and_recipient() {
        let book = EmergencyCodeBook::new(b"k".to_vec());
        let alice = ActorId::new("alice");
        let bob = ActorId::new("bob");
        book.issue("ABC", Some(alice.clone()), t0() + Duration::hours(1)).unwrap();

        assert!(book.verify(&alice, "ABC", t0()).await.unwrap());
        assert!(!book.verify(&bob, "ABC", t0()).await.unwrap());
        assert!(!book.verify(&alice, "ABD", t0()).await.unwrap());
        assert!(!book.verify(&alice, "ABC", t0() + Duration::hours(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_generated_code_verifies() {
        let book = EmergencyCodeBook::random();
        let actor = ActorId::new("dr");
        let code = book.generate(None, t0() + Duration::hours(1)).unwrap();
        assert_eq!(code.len(), GENERATED_CODE_LEN);
        assert!(book.verify(&actor, &code, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_requires_justification_and_doctor() {
        let (_store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let err = protocol
            .open(&ActorId::new("dr-smith"), "   ", t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::MissingJustification));

        let err = protocol
            .open(&ActorId::new("alice"), "fall", t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::MissingProfile { role: Role::Doctor, .. }));
    }

    #[tokio::test]
    async fn test_wrong_then_right_code() {
        let (_store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let actor = ActorId::new("dr-smith");
        let session = protocol.open(&actor, "cardiac arrest", t0()).await.unwrap();

        let err = protocol
            .verify_code(&session.id, &actor, "WRONG", t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::InvalidEmergencyCode));
        let after_wrong = protocol.session(&session.id).await.unwrap();
        assert_eq!(after_wrong.stage, Stage::Justification);
        assert_eq!(after_wrong.failed_attempts, 1);

        let verified = protocol
            .verify_code(&session.id, &actor, CODE, t0())
            .await
            .unwrap();
        assert_eq!(verified.stage, Stage::CodeVerified);
    }

    #[tokio::test]
    async fn test_biometric_before_code_is_rejected() {
        let (_store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let actor = ActorId::new("dr-smith");
        let session = protocol.open(&actor, "stroke", t0()).await.unwrap();
        let err = protocol
            .verify_biometric(&session.id, &actor, t0())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConsentError::InvalidStageTransition {
                from: Stage::Justification,
                attempted: Stage::BiometricVerified
            }
        ));
    }

    #[tokio::test]
    async fn test_biometric_failure_keeps_stage() {
        let (_store, protocol) = protocol_with(StaticBiometricVerifier::rejecting()).await;
        let actor = ActorId::new("dr-smith");
        let session = protocol.open(&actor, "stroke", t0()).await.unwrap();
        protocol.verify_code(&session.id, &actor, CODE, t0()).await.unwrap();
        let err = protocol
            .verify_biometric(&session.id, &actor, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::BiometricFailed(_)));
        assert_eq!(
            protocol.session(&session.id).await.unwrap().stage,
            Stage::CodeVerified
        );
    }

    #[tokio::test]
    async fn test_biometric_timeout_fails_closed() {
        let slow = StaticBiometricVerifier::accepting()
            .with_latency(std::time::Duration::from_secs(5));
        let (_store, protocol) = protocol_with(slow).await;
        let actor = ActorId::new("dr-smith");
        let session = protocol.open(&actor, "stroke", t0()).await.unwrap();
        protocol.verify_code(&session.id, &actor, CODE, t0()).await.unwrap();
        let err = protocol
            .verify_biometric(&session.id, &actor, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::BiometricFailed(msg) if msg.contains("200 ms")));
    }

    #[tokio::test]
    async fn test_active_session_reads_are_logged() {
        let (store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let session = active_session(&protocol).await;
        assert_eq!(session.stage, Stage::Active);
        let stages: Vec<Stage> = session.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            stages,
            vec![Stage::CodeVerified, Stage::BiometricVerified, Stage::Active]
        );

        let decision = protocol
            .read(
                &session.id,
                &ActorId::new("dr-smith"),
                &PatientId::new("p1"),
                scopes([DataCategory::Allergies, DataCategory::Medications]),
                t0() + Duration::minutes(5),
            )
            .await
            .unwrap();
        assert_eq!(decision.decision, Decision::EmergencyAllowed);
        assert_eq!(decision.channel, Channel::Emergency);
        assert_eq!(decision.granted.len(), 2);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_read_before_active_is_logged_denial() {
        let (store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let actor = ActorId::new("dr-smith");
        let session = protocol.open(&actor, "stroke", t0()).await.unwrap();
        let err = protocol
            .read(
                &session.id,
                &actor,
                &PatientId::new("p1"),
                scopes([DataCategory::Vitals]),
                t0(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::EmergencySessionInactive(_)));
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_session_times_out_lazily() {
        let (_store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let session = active_session(&protocol).await;
        let err = protocol
            .read(
                &session.id,
                &ActorId::new("dr-smith"),
                &PatientId::new("p1"),
                scopes([DataCategory::Vitals]),
                t0() + Duration::minutes(241),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::EmergencySessionInactive(_)));
        let ended = protocol.session(&session.id).await.unwrap();
        assert_eq!(ended.stage, Stage::Ended);
        assert_eq!(ended.end_reason, Some(EndReason::TimedOut));
    }

    #[tokio::test]
    async fn test_other_actor_cannot_drive_session() {
        let (_store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let session = protocol
            .open(&ActorId::new("dr-smith"), "stroke", t0())
            .await
            .unwrap();
        let err = protocol
            .verify_code(&session.id, &ActorId::new("dr-jones"), CODE, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::NotOwner(_)));
    }

    #[tokio::test]
    async fn test_end_twice_is_invalid() {
        let (_store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let session = active_session(&protocol).await;
        let actor = ActorId::new("dr-smith");
        let ended = protocol.end(&session.id, &actor, t0()).await.unwrap();
        assert_eq!(ended.end_reason, Some(EndReason::Explicit));
        let err = protocol.end(&session.id, &actor, t0()).await.unwrap_err();
        assert!(matches!(err, ConsentError::InvalidStageTransition { .. }));
    }

    #[tokio::test]
    async fn test_purge_abandoned_sessions() {
        let (_store, protocol) = protocol_with(StaticBiometricVerifier::accepting()).await;
        let actor = ActorId::new("dr-smith");
        let stale = protocol.open(&actor, "stroke", t0()).await.unwrap();
        let active = active_session(&protocol).await;

        assert_eq!(protocol.purge_abandoned(t0() + Duration::minutes(10)).await.unwrap(), 0);
        assert_eq!(protocol.purge_abandoned(t0() + Duration::minutes(31)).await.unwrap(), 1);
        assert!(matches!(
            protocol.session(&stale.id).await,
            Err(ConsentError::UnknownSession(_))
        ));
        assert!(protocol.session(&active.id).await.is_ok());
    }
}
