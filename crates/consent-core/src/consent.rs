//! Consent ledger - patient-authorized, scoped, time-boxed grants.
//!
//! At most one grant per (patient, doctor) pair is active at a time: creating
//! or reactivating a grant deactivates every other active grant for the pair
//! in the same store transaction, under the pair's lock.

use crate::audit::{AccessBasis, AccessDecision, AccessLog, PendingEvent};
use crate::error::{ConsentError, ConsentResult};
use crate::ledger::{anchor, IntegrityHash, IntegrityLedger, LedgerRecord};
use crate::locks::{KeyGuard, KeyedLocks};
use crate::store::Store;
use crate::types::{Channel, Decision, DoctorId, GrantId, PatientId, Scopes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Why the patient is sharing data
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    #[default]
    Treatment,
    Consultation,
    SecondOpinion,
    Research,
    Other(String),
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purpose::Treatment => write!(f, "treatment"),
            Purpose::Consultation => write!(f, "consultation"),
            Purpose::SecondOpinion => write!(f, "second opinion"),
            Purpose::Research => write!(f, "research"),
            Purpose::Other(other) => write!(f, "{}", other),
        }
    }
}

/// Status derived from a grant's flags and the current time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    /// Window has not opened yet
    Pending,
    Expired,
    /// Switched off by the patient
    Inactive,
    /// Replaced by a newer grant for the same doctor
    Superseded,
    Revoked,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentGrant {
    pub id: GrantId,
    pub patient_id: PatientId,
    pub doctor_id: DoctorId,
    /// Never empty
    pub scopes: Scopes,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Recorded for the emergency team's information; break-glass never consults it
    pub emergency_eligible: bool,
    pub active: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub purpose: Purpose,
    pub superseded_by: Option<GrantId>,
    /// Ledger anchor of the grant's creation
    pub integrity_hash: IntegrityHash,
}

impl ConsentGrant {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Active, not revoked and `now` inside the validity window
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_revoked() && self.valid_from <= now && now <= self.valid_until
    }

    pub fn status(&self, now: DateTime<Utc>) -> GrantStatus {
        if self.is_revoked() {
            GrantStatus::Revoked
        } else if !self.active && self.superseded_by.is_some() {
            GrantStatus::Superseded
        } else if !self.active {
            GrantStatus::Inactive
        } else if now < self.valid_from {
            GrantStatus::Pending
        } else if now > self.valid_until {
            GrantStatus::Expired
        } else {
            GrantStatus::Active
        }
    }

    /// Whole days left until `valid_until`, rounded up. Zero once expired.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        let left = (self.valid_until - now).num_milliseconds();
        if left <= 0 {
            return 0;
        }
        (left + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY
    }
}

/// Parameters for a new consent grant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    pub patient_id: PatientId,
    pub doctor_id: DoctorId,
    pub scopes: Scopes,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub emergency_eligible: bool,
    #[serde(default)]
    pub purpose: Purpose,
}

impl GrantRequest {
    pub fn new(
        patient_id: PatientId,
        doctor_id: DoctorId,
        scopes: Scopes,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Self {
            patient_id,
            doctor_id,
            scopes,
            valid_from,
            valid_until,
            emergency_eligible: false,
            purpose: Purpose::default(),
        }
    }

    pub fn emergency_eligible(mut self, eligible: bool) -> Self {
        self.emergency_eligible = eligible;
        self
    }

    pub fn purpose(mut self, purpose: Purpose) -> Self {
        self.purpose = purpose;
        self
    }

    fn validate(&self) -> ConsentResult<()> {
        if self.scopes.is_empty() {
            return Err(ConsentError::InvalidScope);
        }
        if self.valid_from > self.valid_until {
            return Err(ConsentError::InvalidValidityWindow {
                valid_from: self.valid_from,
                valid_until: self.valid_until,
            });
        }
        Ok(())
    }
}

pub struct ConsentLedger {
    store: Arc<dyn Store>,
    ledger: Arc<dyn IntegrityLedger>,
    log: AccessLog,
    locks: KeyedLocks<(PatientId, DoctorId)>,
    ledger_timeout: Duration,
}

impl ConsentLedger {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<dyn IntegrityLedger>,
        log: AccessLog,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            log,
            locks: KeyedLocks::new(),
            ledger_timeout,
        }
    }

    /// Create a grant, superseding any active grant for the same pair
    #[instrument(skip(self, request), fields(patient = %request.patient_id, doctor = %request.doctor_id))]
    pub async fn grant(
        &self,
        request: GrantRequest,
        now: DateTime<Utc>,
    ) -> ConsentResult<ConsentGrant> {
        request.validate()?;

        if self.store.patient(&request.patient_id).await?.is_none() {
            return Err(ConsentError::UnknownPatient(request.patient_id));
        }
        let doctor = self
            .store
            .doctor(&request.doctor_id)
            .await?
            .ok_or_else(|| ConsentError::UnknownDoctor(request.doctor_id.clone()))?;
        if !doctor.verified {
            return Err(ConsentError::UnverifiedDoctor(doctor.doctor_id));
        }

        let pair = (request.patient_id.clone(), request.doctor_id.clone());
        let _guard = self.locks.acquire(&pair).await;

        let id = GrantId::generate();
        let record = LedgerRecord::ConsentGranted {
            grant_id: id.clone(),
            patient_id: request.patient_id.clone(),
            doctor_id: request.doctor_id.clone(),
            scopes: request.scopes.iter().copied().collect(),
            valid_from: request.valid_from,
            valid_until: request.valid_until,
            created_at: now,
        };
        let integrity_hash = anchor(self.ledger.as_ref(), &record, self.ledger_timeout).await?;

        let grant = ConsentGrant {
            id,
            patient_id: request.patient_id,
            doctor_id: request.doctor_id,
            scopes: request.scopes,
            valid_from: request.valid_from,
            valid_until: request.valid_until,
            emergency_eligible: request.emergency_eligible,
            active: true,
            revoked_at: None,
            created_at: now,
            purpose: request.purpose,
            superseded_by: None,
            integrity_hash,
        };

        let superseded = self.superseded_by(&grant).await?;
        self.store.put_grant_superseding(&grant, &superseded).await?;

        info!(
            grant_id = %grant.id,
            scopes = grant.scopes.len(),
            superseded = superseded.len(),
            "consent granted"
        );
        Ok(grant)
    }

    /// Revoke a grant. Revoking twice is a no-op.
    #[instrument(skip(self))]
    pub async fn revoke(
        &self,
        grant_id: &GrantId,
        acting_patient: &PatientId,
        now: DateTime<Utc>,
    ) -> ConsentResult<ConsentGrant> {
        let (mut grant, _guard) = self.lock_owned_grant(grant_id, acting_patient).await?;
        if grant.is_revoked() {
            return Ok(grant);
        }

        grant.revoked_at = Some(now);
        grant.active = false;
        self.store.put_grant_superseding(&grant, &[]).await?;

        // The revocation already holds locally; the anchor is best-effort
        let record = LedgerRecord::ConsentRevoked {
            grant_id: grant.id.clone(),
            revoked_at: now,
        };
        if let Err(e) = anchor(self.ledger.as_ref(), &record, self.ledger_timeout).await {
            warn!(grant_id = %grant.id, error = %e, "revocation not anchored in integrity ledger");
        }

        info!(grant_id = %grant.id, "consent revoked");
        Ok(grant)
    }

    /// Switch a grant on or off. Switching on supersedes the pair's other grants.
    #[instrument(skip(self))]
    pub async fn set_active(
        &self,
        grant_id: &GrantId,
        acting_patient: &PatientId,
        active: bool,
        now: DateTime<Utc>,
    ) -> ConsentResult<ConsentGrant> {
        let (mut grant, _guard) = self.lock_owned_grant(grant_id, acting_patient).await?;

        if grant.is_revoked() {
            if active {
                return Err(ConsentError::GrantRevoked(grant.id));
            }
            return Ok(grant);
        }
        if grant.active == active {
            return Ok(grant);
        }

        grant.active = active;
        let superseded = if active {
            grant.superseded_by = None;
            self.superseded_by(&grant).await?
        } else {
            Vec::new()
        };
        self.store.put_grant_superseding(&grant, &superseded).await?;

        info!(grant_id = %grant.id, active, at = %now, "consent toggled");
        Ok(grant)
    }

    /// Decide whether `doctor` may read `requested` from `patient`'s record.
    ///
    /// Absence of authorization is a normal `Denied` decision. Exactly one
    /// scheduled-channel event is logged before the decision is returned.
    #[instrument(skip(self, requested), fields(requested = requested.len()))]
    pub async fn check_access(
        &self,
        patient_id: &PatientId,
        doctor_id: &DoctorId,
        requested: &Scopes,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessDecision> {
        let pending = PendingEvent::new(
            Channel::Scheduled,
            patient_id.clone(),
            doctor_id.clone(),
            requested.clone(),
            now,
        );
        let pending = self.evaluate(pending, patient_id, doctor_id, now).await?;
        let event = self.log.append(pending).await?;
        Ok(AccessDecision::from(&event))
    }

    pub async fn grant_by_id(&self, grant_id: &GrantId) -> ConsentResult<ConsentGrant> {
        self.store
            .grant(grant_id)
            .await?
            .ok_or_else(|| ConsentError::UnknownGrant(grant_id.clone()))
    }

    /// All grants a patient has issued, newest first
    pub async fn grants_for_patient(
        &self,
        patient_id: &PatientId,
    ) -> ConsentResult<Vec<ConsentGrant>> {
        Ok(self.store.grants_for_patient(patient_id).await?)
    }

    /// The grant that currently authorizes the pair, if any
    pub async fn effective_grant(
        &self,
        patient_id: &PatientId,
        doctor_id: &DoctorId,
        now: DateTime<Utc>,
    ) -> ConsentResult<Option<ConsentGrant>> {
        let mut effective: Vec<ConsentGrant> = self
            .store
            .grants_for_pair(patient_id, doctor_id)
            .await?
            .into_iter()
            .filter(|g| g.is_effective(now))
            .collect();
        if effective.len() > 1 {
            warn!(
                patient = %patient_id,
                doctor = %doctor_id,
                count = effective.len(),
                "more than one effective grant for pair; using the newest"
            );
        }
        effective.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(effective.into_iter().next())
    }

    async fn evaluate(
        &self,
        pending: PendingEvent,
        patient_id: &PatientId,
        doctor_id: &DoctorId,
        now: DateTime<Utc>,
    ) -> ConsentResult<PendingEvent> {
        if pending.requested().is_empty() {
            return Ok(pending.deny("no data categories requested"));
        }
        if self.store.patient(patient_id).await?.is_none() {
            return Ok(pending.deny("unknown patient"));
        }
        match self.store.doctor(doctor_id).await? {
            None => return Ok(pending.deny("unknown doctor")),
            Some(doctor) if !doctor.verified => {
                return Ok(pending.deny("doctor is not verified"));
            }
            Some(_) => {}
        }

        let grant = match self.effective_grant(patient_id, doctor_id, now).await? {
            Some(grant) => grant,
            None => return Ok(pending.deny("no effective consent grant")),
        };
        Ok(pending.allow(
            Decision::Allowed,
            &grant.scopes,
            AccessBasis::Grant(grant.id.clone()),
            format!("consent grant {} ({})", grant.id, grant.purpose),
        ))
    }

    /// Other active grants for the pair, marked as superseded by `grant`
    async fn superseded_by(&self, grant: &ConsentGrant) -> ConsentResult<Vec<ConsentGrant>> {
        Ok(self
            .store
            .grants_for_pair(&grant.patient_id, &grant.doctor_id)
            .await?
            .into_iter()
            .filter(|g| g.id != grant.id && g.active)
            .map(|mut g| {
                g.active = false;
                g.superseded_by = Some(grant.id.clone());
                g
            })
            .collect())
    }

    /// Load a grant, check ownership, then lock its pair and reload
    async fn lock_owned_grant(
        &self,
        grant_id: &GrantId,
        acting_patient: &PatientId,
    ) -> ConsentResult<(ConsentGrant, KeyGuard<'_, (PatientId, DoctorId)>)> {
        let grant = self.grant_by_id(grant_id).await?;
        if &grant.patient_id != acting_patient {
            return Err(ConsentError::NotOwner(format!("grant {}", grant_id)));
        }
        let guard = self
            .locks
            .acquire(&(grant.patient_id.clone(), grant.doctor_id.clone()))
            .await;
        let grant = self.grant_by_id(grant_id).await?;
        Ok((grant, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::store::MemoryStore;
    use crate::types::{scopes, ActorId, DataCategory, Doctor, Patient};
    use chrono::{Duration as ChronoDuration, TimeZone};

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        consents: ConsentLedger,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        store
            .insert_patient(&Patient {
                patient_id: PatientId::new("p1"),
                owner: ActorId::new("alice"),
            })
            .await
            .unwrap();
        for (id, verified) in [("d1", true), ("d2", false)] {
            store
                .insert_doctor(&Doctor {
                    doctor_id: DoctorId::new(id),
                    actor_id: ActorId::new(format!("actor-{}", id)),
                    specialization: "Cardiology".into(),
                    hospital: "St. Mary".into(),
                    license_number: format!("LIC-{}", id),
                    verified,
                })
                .await
                .unwrap();
        }
        let log = AccessLog::new(
            store.clone(),
            ledger.clone(),
            Duration::from_secs(1),
            50,
        );
        let consents = ConsentLedger::new(store.clone(), ledger.clone(), log, Duration::from_secs(1));
        Fixture {
            store,
            ledger,
            consents,
        }
    }

    fn request(categories: &[DataCategory], days: i64) -> GrantRequest {
        GrantRequest::new(
            PatientId::new("p1"),
            DoctorId::new("d1"),
            categories.iter().copied().collect(),
            t0(),
            t0() + ChronoDuration::days(days),
        )
    }

    #[tokio::test]
    async fn test_grant_returns_intersection() {
        let fx = fixture().await;
        fx.consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();

        let decision = fx
            .consents
            .check_access(
                &PatientId::new("p1"),
                &DoctorId::new("d1"),
                &scopes([DataCategory::Vitals, DataCategory::Imaging]),
                t0() + ChronoDuration::hours(1),
            )
            .await
            .unwrap();
        assert!(decision.allowed());
        assert_eq!(decision.granted, scopes([DataCategory::Vitals]));
        assert_eq!(fx.store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_scope_rejected() {
        let fx = fixture().await;
        let err = fx.consents.grant(request(&[], 30), t0()).await.unwrap_err();
        assert!(matches!(err, ConsentError::InvalidScope));
    }

    #[tokio::test]
    async fn test_inverted_window_rejected() {
        let fx = fixture().await;
        let err = fx
            .consents
            .grant(request(&[DataCategory::Vitals], -1), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::InvalidValidityWindow { .. }));
    }

    #[tokio::test]
    async fn test_unverified_doctor_rejected() {
        let fx = fixture().await;
        let mut req = request(&[DataCategory::Vitals], 30);
        req.doctor_id = DoctorId::new("d2");
        let err = fx.consents.grant(req, t0()).await.unwrap_err();
        assert!(matches!(err, ConsentError::UnverifiedDoctor(_)));
    }

    #[tokio::test]
    async fn test_grant_fails_closed_when_ledger_offline() {
        let fx = fixture().await;
        fx.ledger.set_offline(true);
        let err = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::LogUnavailable(_)));
        assert!(fx
            .consents
            .grants_for_patient(&PatientId::new("p1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_new_grant_supersedes_previous() {
        let fx = fixture().await;
        let first = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();
        let second = fx
            .consents
            .grant(
                request(&[DataCategory::Imaging], 30),
                t0() + ChronoDuration::minutes(1),
            )
            .await
            .unwrap();

        let first = fx.consents.grant_by_id(&first.id).await.unwrap();
        assert!(!first.active);
        assert_eq!(first.superseded_by, Some(second.id.clone()));
        assert_eq!(first.status(t0()), GrantStatus::Superseded);

        let decision = fx
            .consents
            .check_access(
                &PatientId::new("p1"),
                &DoctorId::new("d1"),
                &scopes([DataCategory::Vitals, DataCategory::Imaging]),
                t0() + ChronoDuration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(decision.granted, scopes([DataCategory::Imaging]));
    }

    #[tokio::test]
    async fn test_revoke_then_deny() {
        let fx = fixture().await;
        let grant = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();
        fx.consents
            .revoke(&grant.id, &PatientId::new("p1"), t0() + ChronoDuration::hours(1))
            .await
            .unwrap();

        let decision = fx
            .consents
            .check_access(
                &PatientId::new("p1"),
                &DoctorId::new("d1"),
                &scopes([DataCategory::Vitals]),
                t0() + ChronoDuration::hours(2),
            )
            .await
            .unwrap();
        assert_eq!(decision.decision, Decision::Denied);
        assert!(decision.granted.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let fx = fixture().await;
        let grant = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();
        let first = fx
            .consents
            .revoke(&grant.id, &PatientId::new("p1"), t0() + ChronoDuration::hours(1))
            .await
            .unwrap();
        let second = fx
            .consents
            .revoke(&grant.id, &PatientId::new("p1"), t0() + ChronoDuration::hours(5))
            .await
            .unwrap();
        assert_eq!(first.revoked_at, second.revoked_at);
    }

    #[tokio::test]
    async fn test_pair_locks_released_after_mutation() {
        let fx = fixture().await;
        let grant = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();
        assert!(fx.consents.locks.is_empty());

        fx.consents
            .revoke(&grant.id, &PatientId::new("p1"), t0() + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(fx.consents.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_revoke_by_other_patient_is_not_owner() {
        let fx = fixture().await;
        let grant = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();
        let err = fx
            .consents
            .revoke(&grant.id, &PatientId::new("p9"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::NotOwner(_)));
    }

    #[tokio::test]
    async fn test_revoke_survives_ledger_outage() {
        let fx = fixture().await;
        let grant = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();
        fx.ledger.set_offline(true);
        let revoked = fx
            .consents
            .revoke(&grant.id, &PatientId::new("p1"), t0())
            .await
            .unwrap();
        assert!(revoked.is_revoked());
    }

    #[tokio::test]
    async fn test_toggle_and_reactivate() {
        let fx = fixture().await;
        let patient = PatientId::new("p1");
        let grant = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();
        let off = fx
            .consents
            .set_active(&grant.id, &patient, false, t0())
            .await
            .unwrap();
        assert_eq!(off.status(t0()), GrantStatus::Inactive);

        let other = fx
            .consents
            .grant(request(&[DataCategory::Imaging], 30), t0() + ChronoDuration::minutes(1))
            .await
            .unwrap();
        let on = fx
            .consents
            .set_active(&grant.id, &patient, true, t0() + ChronoDuration::minutes(2))
            .await
            .unwrap();
        assert!(on.active);

        let other = fx.consents.grant_by_id(&other.id).await.unwrap();
        assert!(!other.active);
        assert_eq!(other.superseded_by, Some(grant.id.clone()));
    }

    #[tokio::test]
    async fn test_reactivating_revoked_grant_fails() {
        let fx = fixture().await;
        let patient = PatientId::new("p1");
        let grant = fx
            .consents
            .grant(request(&[DataCategory::Vitals], 30), t0())
            .await
            .unwrap();
        fx.consents.revoke(&grant.id, &patient, t0()).await.unwrap();
        let err = fx
            .consents
            .set_active(&grant.id, &patient, true, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::GrantRevoked(_)));
    }

    #[tokio::test]
    async fn test_access_outside_window_denied() {
        let fx = fixture().await;
        fx.consents
            .grant(request(&[DataCategory::Vitals], 1), t0())
            .await
            .unwrap();
        let decision = fx
            .consents
            .check_access(
                &PatientId::new("p1"),
                &DoctorId::new("d1"),
                &scopes([DataCategory::Vitals]),
                t0() + ChronoDuration::days(2),
            )
            .await
            .unwrap();
        assert_eq!(decision.decision, Decision::Denied);
    }

    #[tokio::test]
    async fn test_unknown_parties_are_logged_denials() {
        let fx = fixture().await;
        let decision = fx
            .consents
            .check_access(
                &PatientId::new("nobody"),
                &DoctorId::new("d1"),
                &scopes([DataCategory::Vitals]),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(decision.decision, Decision::Denied);
        assert_eq!(decision.reason, "unknown patient");
        assert_eq!(fx.store.event_count(), 1);
    }

    #[test]
    fn test_days_remaining_rounds_up() {
        let grant = ConsentGrant {
            id: GrantId::new("g"),
            patient_id: PatientId::new("p1"),
            doctor_id: DoctorId::new("d1"),
            scopes: scopes([DataCategory::Vitals]),
            valid_from: t0(),
            valid_until: t0() + ChronoDuration::days(3),
            emergency_eligible: false,
            active: true,
            revoked_at: None,
            created_at: t0(),
            purpose: Purpose::Treatment,
            superseded_by: None,
            integrity_hash: IntegrityHash::new("0x00"),
        };
        assert_eq!(grant.days_remaining(t0()), 3);
        assert_eq!(grant.days_remaining(t0() + ChronoDuration::hours(1)), 3);
        assert_eq!(grant.days_remaining(t0() + ChronoDuration::days(3)), 0);
        assert_eq!(grant.status(t0() - ChronoDuration::hours(1)), GrantStatus::Pending);
        assert_eq!(grant.status(t0() + ChronoDuration::days(4)), GrantStatus::Expired);
    }
}
