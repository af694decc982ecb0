//! Integrity ledger collaborator.
//!
//! Consent grants, revocations and access events are anchored in an external
//! tamper-evident registry that returns an integrity hash for each record.
//! The registry is reached through [`IntegrityLedger`]; [`MemoryLedger`] is a
//! hash-chained in-process implementation for tests and local deployments.

use crate::error::{ConsentError, ConsentResult};
use crate::types::{Channel, DataCategory, Decision, DoctorId, EventId, GrantId, PatientId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Hash returned by the ledger for an anchored record (`0x`-prefixed hex)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrityHash(String);

impl IntegrityHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn from_digest(digest: &[u8]) -> Self {
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(format!("0x{}", hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntegrityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record submitted to the integrity ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerRecord {
    ConsentGranted {
        grant_id: GrantId,
        patient_id: PatientId,
        doctor_id: DoctorId,
        scopes: Vec<DataCategory>,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
        created_at: DateTime<Utc>,
    },
    ConsentRevoked {
        grant_id: GrantId,
        revoked_at: DateTime<Utc>,
    },
    Access {
        event_id: EventId,
        patient_id: PatientId,
        doctor_id: DoctorId,
        decision: Decision,
        channel: Channel,
        categories_granted: Vec<DataCategory>,
        timestamp: DateTime<Utc>,
    },
}

impl LedgerRecord {
    pub fn label(&self) -> &'static str {
        match self {
            LedgerRecord::ConsentGranted { .. } => "consent_granted",
            LedgerRecord::ConsentRevoked { .. } => "consent_revoked",
            LedgerRecord::Access { .. } => "access",
        }
    }
}

/// Failure reported by an external collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("collaborator unreachable: {0}")]
    Unreachable(String),
    #[error("collaborator rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait IntegrityLedger: Send + Sync {
    async fn submit(&self, record: &LedgerRecord) -> Result<IntegrityHash, CollaboratorError>;
}

/// Submit `record`, bounded by `limit`. Errors and timeouts both fail closed
/// as [`ConsentError::LogUnavailable`].
pub(crate) async fn anchor(
    ledger: &dyn IntegrityLedger,
    record: &LedgerRecord,
    limit: Duration,
) -> ConsentResult<IntegrityHash> {
    match tokio::time::timeout(limit, ledger.submit(record)).await {
        Ok(Ok(hash)) => Ok(hash),
        Ok(Err(e)) => {
            warn!(record = record.label(), error = %e, "integrity ledger submission failed");
            Err(ConsentError::LogUnavailable(e.to_string()))
        }
        Err(_) => {
            warn!(record = record.label(), timeout_ms = limit.as_millis() as u64, "integrity ledger timed out");
            Err(ConsentError::LogUnavailable(format!(
                "integrity ledger did not answer within {} ms",
                limit.as_millis()
            )))
        }
    }
}

// ==================== In-memory ledger ====================

/// One anchored record in a [`MemoryLedger`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub hash: IntegrityHash,
    pub previous: Option<IntegrityHash>,
    pub record: LedgerRecord,
}

/// Hash-chained ledger held in memory.
///
/// Each entry's hash is `sha256(previous_hash || json(record))`, so editing
/// any anchored record breaks [`MemoryLedger::verify_chain`].
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
    offline: AtomicBool,
    latency: Option<Duration>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every submission, e.g. to exercise timeouts
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Simulate an outage: while offline every submission is refused
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute every link of the chain
    pub fn verify_chain(&self) -> bool {
        let entries = self.entries();
        let mut previous: Option<IntegrityHash> = None;
        for entry in &entries {
            if entry.previous != previous {
                return false;
            }
            match chain_hash(previous.as_ref(), &entry.record) {
                Ok(hash) if hash == entry.hash => {}
                _ => return false,
            }
            previous = Some(entry.hash.clone());
        }
        true
    }
}

fn chain_hash(
    previous: Option<&IntegrityHash>,
    record: &LedgerRecord,
) -> Result<IntegrityHash, serde_json::Error> {
    let body = serde_json::to_vec(record)?;
    let mut hasher = Sha256::new();
    if let Some(prev) = previous {
        hasher.update(prev.as_str().as_bytes());
    }
    hasher.update(&body);
    Ok(IntegrityHash::from_digest(&hasher.finalize()))
}

#[async_trait]
impl IntegrityLedger for MemoryLedger {
    async fn submit(&self, record: &LedgerRecord) -> Result<IntegrityHash, CollaboratorError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unreachable("ledger offline".to_string()));
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CollaboratorError::Unreachable("ledger state poisoned".to_string()))?;
        let previous = entries.last().map(|e| e.hash.clone());
        let hash = chain_hash(previous.as_ref(), record)
            .map_err(|e| CollaboratorError::Rejected(e.to_string()))?;
        entries.push(LedgerEntry {
            hash: hash.clone(),
            previous,
            record: record.clone(),
        });
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revoked(id: &str) -> LedgerRecord {
        LedgerRecord::ConsentRevoked {
            grant_id: GrantId::new(id),
            revoked_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_submissions_form_a_chain() {
        let ledger = MemoryLedger::new();
        let first = ledger.submit(&revoked("g1")).await.unwrap();
        let second = ledger.submit(&revoked("g2")).await.unwrap();

        assert_ne!(first, second);
        assert!(first.as_str().starts_with("0x"));
        assert_eq!(first.as_str().len(), 66);

        let entries = ledger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].previous.as_ref(), Some(&first));
        assert!(ledger.verify_chain());
    }

    #[tokio::test]
    async fn test_tampering_breaks_chain() {
        let ledger = MemoryLedger::new();
        ledger.submit(&revoked("g1")).await.unwrap();
        ledger.submit(&revoked("g2")).await.unwrap();

        ledger.entries.lock().unwrap()[0].record = revoked("forged");
        assert!(!ledger.verify_chain());
    }

    #[tokio::test]
    async fn test_offline_ledger_fails_closed() {
        let ledger = MemoryLedger::new();
        ledger.set_offline(true);
        let err = anchor(&ledger, &revoked("g1"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::LogUnavailable(_)));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_slow_ledger_times_out() {
        let ledger = MemoryLedger::with_latency(Duration::from_millis(200));
        let err = anchor(&ledger, &revoked("g1"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::LogUnavailable(msg) if msg.contains("10 ms")));
    }

    #[test]
    fn test_record_serializes_with_kind_tag() {
        let json = serde_json::to_value(revoked("g1")).unwrap();
        assert_eq!(json["kind"], "consent_revoked");
        assert_eq!(json["grant_id"], "g1");
    }
}
