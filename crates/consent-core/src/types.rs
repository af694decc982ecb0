//! Identifiers, actors and data categories shared by every component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random (UUID v4) identifier
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Authenticated principal, as issued by the identity provider
    ActorId
);
id_type!(
    /// Stable patient record identifier
    PatientId
);
id_type!(
    /// Registered doctor identifier
    DoctorId
);
id_type!(GrantId);
id_type!(EventId);
id_type!(
    /// QR access token identifier (the value encoded in the QR code)
    TokenId
);
id_type!(SessionId);

/// Role claimed by the identity provider. Immutable for an actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Patient => write!(f, "patient"),
            Role::Doctor => write!(f, "doctor"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
    pub display_name: String,
}

impl Actor {
    pub fn new(id: impl Into<ActorId>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: display_name.into(),
        }
    }
}

/// Patient record, one-to-one with a patient-role actor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: PatientId,
    pub owner: ActorId,
}

/// Doctor record, one-to-one with a doctor-role actor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub doctor_id: DoctorId,
    pub actor_id: ActorId,
    pub specialization: String,
    pub hospital: String,
    pub license_number: String,
    /// Only verified doctors may receive grants or redeem tokens
    pub verified: bool,
}

/// Named subset of a patient's record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataCategory {
    MedicalHistory,
    Medications,
    Allergies,
    Vitals,
    LabResults,
    Imaging,
    Prescriptions,
    EmergencyContacts,
    MentalHealth,
    GeneticData,
}

impl DataCategory {
    pub const ALL: [DataCategory; 10] = [
        DataCategory::MedicalHistory,
        DataCategory::Medications,
        DataCategory::Allergies,
        DataCategory::Vitals,
        DataCategory::LabResults,
        DataCategory::Imaging,
        DataCategory::Prescriptions,
        DataCategory::EmergencyContacts,
        DataCategory::MentalHealth,
        DataCategory::GeneticData,
    ];
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataCategory::MedicalHistory => write!(f, "medical-history"),
            DataCategory::Medications => write!(f, "medications"),
            DataCategory::Allergies => write!(f, "allergies"),
            DataCategory::Vitals => write!(f, "vitals"),
            DataCategory::LabResults => write!(f, "lab-results"),
            DataCategory::Imaging => write!(f, "imaging"),
            DataCategory::Prescriptions => write!(f, "prescriptions"),
            DataCategory::EmergencyContacts => write!(f, "emergency-contacts"),
            DataCategory::MentalHealth => write!(f, "mental-health"),
            DataCategory::GeneticData => write!(f, "genetic-data"),
        }
    }
}

/// Set of data categories
pub type Scopes = BTreeSet<DataCategory>;

/// Build a scope set from a list of categories
pub fn scopes<I: IntoIterator<Item = DataCategory>>(categories: I) -> Scopes {
    categories.into_iter().collect()
}

/// Outcome of an access decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied,
    EmergencyAllowed,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allowed | Decision::EmergencyAllowed)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allowed => write!(f, "allowed"),
            Decision::Denied => write!(f, "denied"),
            Decision::EmergencyAllowed => write!(f, "emergency-allowed"),
        }
    }
}

/// Path through which access was requested
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Standing consent grant
    Scheduled,
    /// QR access token redemption
    Qr,
    /// Break-glass emergency session
    Emergency,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Scheduled => write!(f, "scheduled"),
            Channel::Qr => write!(f, "qr"),
            Channel::Emergency => write!(f, "emergency"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_serializes_kebab_case() {
        let json = serde_json::to_string(&DataCategory::LabResults).unwrap();
        assert_eq!(json, "\"lab-results\"");
        let back: DataCategory = serde_json::from_str("\"emergency-contacts\"").unwrap();
        assert_eq!(back, DataCategory::EmergencyContacts);
    }

    #[test]
    fn test_category_display_matches_serde_name() {
        for category in DataCategory::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category));
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = GrantId::generate();
        let b = GrantId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_emergency_allowed_counts_as_allowed() {
        assert!(Decision::Allowed.is_allowed());
        assert!(Decision::EmergencyAllowed.is_allowed());
        assert!(!Decision::Denied.is_allowed());
    }
}
