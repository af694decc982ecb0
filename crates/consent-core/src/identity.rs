//! Identity and role store.
//!
//! The identity provider authenticates actors and claims their role; this
//! module trusts that claim for registered actors and links each actor to at
//! most one patient or doctor profile.

use crate::error::{ConsentError, ConsentResult};
use crate::store::{Store, StoreError};
use crate::types::{Actor, ActorId, Doctor, DoctorId, Patient, PatientId, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Professional details supplied when a doctor registers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorProfile {
    pub specialization: String,
    pub hospital: String,
    pub license_number: String,
}

/// Proof that an actor was authenticated. Every role action is dispatched
/// against one of these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActorSession {
    actor: Actor,
    authenticated_at: DateTime<Utc>,
}

impl ActorSession {
    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor.id
    }

    pub fn role(&self) -> Role {
        self.actor.role
    }

    pub fn authenticated_at(&self) -> DateTime<Utc> {
        self.authenticated_at
    }
}

fn duplicate(e: StoreError) -> ConsentError {
    match e {
        StoreError::Duplicate(what) => ConsentError::DuplicateRecord(what),
        other => ConsentError::Store(other),
    }
}

pub struct Directory {
    store: Arc<dyn Store>,
}

impl Directory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn register_actor(&self, actor: Actor) -> ConsentResult<Actor> {
        self.store.insert_actor(&actor).await.map_err(duplicate)?;
        info!(actor = %actor.id, role = %actor.role, "actor registered");
        Ok(actor)
    }

    /// Attach a patient record to a patient-role actor
    pub async fn register_patient(
        &self,
        actor_id: &ActorId,
        patient_id: PatientId,
    ) -> ConsentResult<Patient> {
        self.require_role(actor_id, Role::Patient).await?;
        let patient = Patient {
            patient_id,
            owner: actor_id.clone(),
        };
        self.store.insert_patient(&patient).await.map_err(duplicate)?;
        info!(actor = %actor_id, patient = %patient.patient_id, "patient registered");
        Ok(patient)
    }

    /// Attach a doctor record to a doctor-role actor. Starts unverified.
    pub async fn register_doctor(
        &self,
        actor_id: &ActorId,
        doctor_id: DoctorId,
        profile: DoctorProfile,
    ) -> ConsentResult<Doctor> {
        self.require_role(actor_id, Role::Doctor).await?;
        let doctor = Doctor {
            doctor_id,
            actor_id: actor_id.clone(),
            specialization: profile.specialization,
            hospital: profile.hospital,
            license_number: profile.license_number,
            verified: false,
        };
        self.store.insert_doctor(&doctor).await.map_err(duplicate)?;
        info!(actor = %actor_id, doctor = %doctor.doctor_id, "doctor registered");
        Ok(doctor)
    }

    /// Admin-only change of a doctor's verification flag
    pub async fn set_doctor_verified(
        &self,
        admin: &ActorSession,
        doctor_id: &DoctorId,
        verified: bool,
    ) -> ConsentResult<Doctor> {
        if admin.role() != Role::Admin {
            return Err(ConsentError::RoleMismatch {
                expected: Role::Admin,
                actual: admin.role(),
            });
        }
        let mut doctor = self.doctor(doctor_id).await?;
        doctor.verified = verified;
        self.store.update_doctor(&doctor).await?;
        info!(admin = %admin.actor_id(), doctor = %doctor_id, verified, "doctor verification changed");
        Ok(doctor)
    }

    /// Produce a session handle for a registered actor
    pub async fn authenticate(
        &self,
        actor_id: &ActorId,
        now: DateTime<Utc>,
    ) -> ConsentResult<ActorSession> {
        let actor = self.actor(actor_id).await?;
        Ok(ActorSession {
            actor,
            authenticated_at: now,
        })
    }

    pub async fn actor(&self, actor_id: &ActorId) -> ConsentResult<Actor> {
        self.store
            .actor(actor_id)
            .await?
            .ok_or_else(|| ConsentError::UnknownActor(actor_id.clone()))
    }

    pub async fn patient(&self, patient_id: &PatientId) -> ConsentResult<Patient> {
        self.store
            .patient(patient_id)
            .await?
            .ok_or_else(|| ConsentError::UnknownPatient(patient_id.clone()))
    }

    pub async fn doctor(&self, doctor_id: &DoctorId) -> ConsentResult<Doctor> {
        self.store
            .doctor(doctor_id)
            .await?
            .ok_or_else(|| ConsentError::UnknownDoctor(doctor_id.clone()))
    }

    pub async fn patient_for(&self, actor_id: &ActorId) -> ConsentResult<Patient> {
        self.store
            .patient_for_actor(actor_id)
            .await?
            .ok_or_else(|| ConsentError::MissingProfile {
                actor: actor_id.clone(),
                role: Role::Patient,
            })
    }

    pub async fn doctor_for(&self, actor_id: &ActorId) -> ConsentResult<Doctor> {
        self.store
            .doctor_for_actor(actor_id)
            .await?
            .ok_or_else(|| ConsentError::MissingProfile {
                actor: actor_id.clone(),
                role: Role::Doctor,
            })
    }

    /// Doctors whose specialization matches, ignoring case
    pub async fn doctors_by_specialization(
        &self,
        specialization: &str,
    ) -> ConsentResult<Vec<Doctor>> {
        let wanted = specialization.trim().to_lowercase();
        Ok(self
            .store
            .doctors()
            .await?
            .into_iter()
            .filter(|d| d.specialization.to_lowercase() == wanted)
            .collect())
    }

    async fn require_role(&self, actor_id: &ActorId, expected: Role) -> ConsentResult<()> {
        let actor = self.actor(actor_id).await?;
        if actor.role != expected {
            return Err(ConsentError::RoleMismatch {
                expected,
                actual: actor.role,
            });
        }
        Ok(())
    }
}
