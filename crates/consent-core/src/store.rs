//! Persistent store interface and the in-memory implementation.
//!
//! Components receive an `Arc<dyn Store>`; nothing in the crate reaches for a
//! global client. Two writes are transactional: a grant together with the
//! grants it supersedes, and a token redemption together with its access
//! event.

use crate::audit::{AccessEvent, AccessLogFilter, EventCursor};
use crate::consent::ConsentGrant;
use crate::emergency::EmergencySession;
use crate::token::AccessToken;
use crate::types::{
    Actor, ActorId, Doctor, DoctorId, GrantId, Patient, PatientId, SessionId, TokenId,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("missing record: {0}")]
    Missing(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // Identity
    async fn insert_actor(&self, actor: &Actor) -> StoreResult<()>;
    async fn actor(&self, id: &ActorId) -> StoreResult<Option<Actor>>;
    async fn insert_patient(&self, patient: &Patient) -> StoreResult<()>;
    async fn patient(&self, id: &PatientId) -> StoreResult<Option<Patient>>;
    async fn patient_for_actor(&self, actor: &ActorId) -> StoreResult<Option<Patient>>;
    async fn insert_doctor(&self, doctor: &Doctor) -> StoreResult<()>;
    async fn update_doctor(&self, doctor: &Doctor) -> StoreResult<()>;
    async fn doctor(&self, id: &DoctorId) -> StoreResult<Option<Doctor>>;
    async fn doctor_for_actor(&self, actor: &ActorId) -> StoreResult<Option<Doctor>>;
    async fn doctors(&self) -> StoreResult<Vec<Doctor>>;

    // Consent grants
    async fn grant(&self, id: &GrantId) -> StoreResult<Option<ConsentGrant>>;
    async fn grants_for_pair(
        &self,
        patient: &PatientId,
        doctor: &DoctorId,
    ) -> StoreResult<Vec<ConsentGrant>>;
    async fn grants_for_patient(&self, patient: &PatientId) -> StoreResult<Vec<ConsentGrant>>;
    /// Write `grant` and the grants it supersedes in one transaction
    async fn put_grant_superseding(
        &self,
        grant: &ConsentGrant,
        superseded: &[ConsentGrant],
    ) -> StoreResult<()>;

    // Access events
    async fn append_event(&self, event: &AccessEvent) -> StoreResult<()>;
    /// Events matching `filter`, newest first, strictly after `after`
    async fn events_page(
        &self,
        filter: &AccessLogFilter,
        after: Option<&EventCursor>,
        limit: usize,
    ) -> StoreResult<Vec<AccessEvent>>;

    // Access tokens
    async fn insert_token(&self, token: &AccessToken) -> StoreResult<()>;
    async fn token(&self, id: &TokenId) -> StoreResult<Option<AccessToken>>;
    async fn update_token(&self, token: &AccessToken) -> StoreResult<()>;
    /// Persist the incremented token and its access event in one transaction
    async fn commit_redemption(&self, token: &AccessToken, event: &AccessEvent)
        -> StoreResult<()>;

    // Emergency sessions
    async fn put_session(&self, session: &EmergencySession) -> StoreResult<()>;
    async fn session(&self, id: &SessionId) -> StoreResult<Option<EmergencySession>>;
    async fn sessions(&self) -> StoreResult<Vec<EmergencySession>>;
    async fn remove_session(&self, id: &SessionId) -> StoreResult<bool>;
}

// ==================== In-memory store ====================

/// Store held entirely in memory.
///
/// Grants and events sit behind `RwLock`s because their writes span several
/// rows; everything else is keyed in a `DashMap`.
#[derive(Default)]
pub struct MemoryStore {
    actors: DashMap<ActorId, Actor>,
    patients: DashMap<PatientId, Patient>,
    doctors: DashMap<DoctorId, Doctor>,
    grants: RwLock<HashMap<GrantId, ConsentGrant>>,
    events: RwLock<Vec<AccessEvent>>,
    tokens: DashMap<TokenId, AccessToken>,
    sessions: DashMap<SessionId, EmergencySession>,
    append_outage: AtomicBool,
}

fn poisoned(table: &str) -> StoreError {
    StoreError::Unavailable(format!("{} table lock poisoned", table))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an audit sink outage: event appends and redemption commits fail
    pub fn set_append_outage(&self, outage: bool) {
        self.append_outage.store(outage, Ordering::SeqCst);
    }

    /// Number of stored access events
    pub fn event_count(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    fn check_append(&self) -> StoreResult<()> {
        if self.append_outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("access log sink offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_actor(&self, actor: &Actor) -> StoreResult<()> {
        if self.actors.contains_key(&actor.id) {
            return Err(StoreError::Duplicate(format!("actor {}", actor.id)));
        }
        self.actors.insert(actor.id.clone(), actor.clone());
        Ok(())
    }

    async fn actor(&self, id: &ActorId) -> StoreResult<Option<Actor>> {
        Ok(self.actors.get(id).map(|a| a.clone()))
    }

    async fn insert_patient(&self, patient: &Patient) -> StoreResult<()> {
        if self.patients.contains_key(&patient.patient_id) {
            return Err(StoreError::Duplicate(format!("patient {}", patient.patient_id)));
        }
        if self.patients.iter().any(|p| p.owner == patient.owner) {
            return Err(StoreError::Duplicate(format!(
                "actor {} already has a patient record",
                patient.owner
            )));
        }
        self.patients
            .insert(patient.patient_id.clone(), patient.clone());
        Ok(())
    }

    async fn patient(&self, id: &PatientId) -> StoreResult<Option<Patient>> {
        Ok(self.patients.get(id).map(|p| p.clone()))
    }

    async fn patient_for_actor(&self, actor: &ActorId) -> StoreResult<Option<Patient>> {
        Ok(self
            .patients
            .iter()
            .find(|p| &p.owner == actor)
            .map(|p| p.clone()))
    }

    async fn insert_doctor(&self, doctor: &Doctor) -> StoreResult<()> {
        if self.doctors.contains_key(&doctor.doctor_id) {
            return Err(StoreError::Duplicate(format!("doctor {}", doctor.doctor_id)));
        }
        if self.doctors.iter().any(|d| d.actor_id == doctor.actor_id) {
            return Err(StoreError::Duplicate(format!(
                "actor {} already has a doctor record",
                doctor.actor_id
            )));
        }
        self.doctors.insert(doctor.doctor_id.clone(), doctor.clone());
        Ok(())
    }

    async fn update_doctor(&self, doctor: &Doctor) -> StoreResult<()> {
        match self.doctors.get_mut(&doctor.doctor_id) {
            Some(mut existing) => {
                *existing = doctor.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("doctor {}", doctor.doctor_id))),
        }
    }

    async fn doctor(&self, id: &DoctorId) -> StoreResult<Option<Doctor>> {
        Ok(self.doctors.get(id).map(|d| d.clone()))
    }

    async fn doctor_for_actor(&self, actor: &ActorId) -> StoreResult<Option<Doctor>> {
        Ok(self
            .doctors
            .iter()
            .find(|d| &d.actor_id == actor)
            .map(|d| d.clone()))
    }

    async fn doctors(&self) -> StoreResult<Vec<Doctor>> {
        let mut doctors: Vec<Doctor> = self.doctors.iter().map(|d| d.clone()).collect();
        doctors.sort_by(|a, b| a.doctor_id.cmp(&b.doctor_id));
        Ok(doctors)
    }

    async fn grant(&self, id: &GrantId) -> StoreResult<Option<ConsentGrant>> {
        let grants = self.grants.read().map_err(|_| poisoned("grants"))?;
        Ok(grants.get(id).cloned())
    }

    async fn grants_for_pair(
        &self,
        patient: &PatientId,
        doctor: &DoctorId,
    ) -> StoreResult<Vec<ConsentGrant>> {
        let grants = self.grants.read().map_err(|_| poisoned("grants"))?;
        let mut found: Vec<ConsentGrant> = grants
            .values()
            .filter(|g| &g.patient_id == patient && &g.doctor_id == doctor)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(found)
    }

    async fn grants_for_patient(&self, patient: &PatientId) -> StoreResult<Vec<ConsentGrant>> {
        let grants = self.grants.read().map_err(|_| poisoned("grants"))?;
        let mut found: Vec<ConsentGrant> = grants
            .values()
            .filter(|g| &g.patient_id == patient)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(found)
    }

    async fn put_grant_superseding(
        &self,
        grant: &ConsentGrant,
        superseded: &[ConsentGrant],
    ) -> StoreResult<()> {
        let mut grants = self.grants.write().map_err(|_| poisoned("grants"))?;
        for old in superseded {
            if old.patient_id != grant.patient_id || old.doctor_id != grant.doctor_id {
                return Err(StoreError::Conflict(format!(
                    "grant {} does not belong to the same patient and doctor as {}",
                    old.id, grant.id
                )));
            }
            if !grants.contains_key(&old.id) {
                return Err(StoreError::Missing(format!("grant {}", old.id)));
            }
        }
        for old in superseded {
            grants.insert(old.id.clone(), old.clone());
        }
        grants.insert(grant.id.clone(), grant.clone());
        Ok(())
    }

    async fn append_event(&self, event: &AccessEvent) -> StoreResult<()> {
        self.check_append()?;
        let mut events = self.events.write().map_err(|_| poisoned("events"))?;
        events.push(event.clone());
        Ok(())
    }

    async fn events_page(
        &self,
        filter: &AccessLogFilter,
        after: Option<&EventCursor>,
        limit: usize,
    ) -> StoreResult<Vec<AccessEvent>> {
        let events = self.events.read().map_err(|_| poisoned("events"))?;
        let mut page: Vec<AccessEvent> = events
            .iter()
            .filter(|e| filter.matches(e))
            .filter(|e| after.map_or(true, |cursor| cursor.precedes(e)))
            .cloned()
            .collect();
        page.sort_by(|a, b| EventCursor::of(b).cmp(&EventCursor::of(a)));
        page.truncate(limit);
        Ok(page)
    }

    async fn insert_token(&self, token: &AccessToken) -> StoreResult<()> {
        if self.tokens.contains_key(&token.id) {
            return Err(StoreError::Duplicate(format!("token {}", token.id)));
        }
        self.tokens.insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn token(&self, id: &TokenId) -> StoreResult<Option<AccessToken>> {
        Ok(self.tokens.get(id).map(|t| t.clone()))
    }

    async fn update_token(&self, token: &AccessToken) -> StoreResult<()> {
        match self.tokens.get_mut(&token.id) {
            Some(mut existing) => {
                *existing = token.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("token {}", token.id))),
        }
    }

    async fn commit_redemption(
        &self,
        token: &AccessToken,
        event: &AccessEvent,
    ) -> StoreResult<()> {
        self.check_append()?;
        // Event table lock held across both writes
        let mut events = self.events.write().map_err(|_| poisoned("events"))?;
        let mut existing = self
            .tokens
            .get_mut(&token.id)
            .ok_or_else(|| StoreError::Missing(format!("token {}", token.id)))?;
        if existing.redemption_count + 1 != token.redemption_count {
            return Err(StoreError::Conflict(format!(
                "token {} redemption count moved from {} to {}",
                token.id, existing.redemption_count, token.redemption_count
            )));
        }
        *existing = token.clone();
        events.push(event.clone());
        Ok(())
    }

    async fn put_session(&self, session: &EmergencySession) -> StoreResult<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn session(&self, id: &SessionId) -> StoreResult<Option<EmergencySession>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn sessions(&self) -> StoreResult<Vec<EmergencySession>> {
        Ok(self.sessions.iter().map(|s| s.clone()).collect())
    }

    async fn remove_session(&self, id: &SessionId) -> StoreResult<bool> {
        Ok(self.sessions.remove(id).is_some())
    }
}
