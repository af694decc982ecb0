//! Access log - append-only audit trail of every read or attempted read.
//!
//! Every decision is anchored in the integrity ledger and appended to the
//! store before it is handed back to the caller. If either write fails the
//! caller gets [`ConsentError::LogUnavailable`], never an allow.

use crate::error::{ConsentError, ConsentResult};
use crate::ledger::{anchor, IntegrityHash, IntegrityLedger, LedgerRecord};
use crate::store::Store;
use crate::types::{
    Channel, DataCategory, Decision, DoctorId, EventId, GrantId, PatientId, Scopes, SessionId,
    TokenId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What an access decision was based on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AccessBasis {
    Grant(GrantId),
    Token(TokenId),
    Emergency(SessionId),
    None,
}

/// One immutable entry in the access log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub patient_id: PatientId,
    /// Requesting doctor (or the doctor driving an emergency session)
    pub doctor_id: DoctorId,
    pub categories_requested: Scopes,
    /// Always a subset of `categories_requested`
    pub categories_granted: Scopes,
    pub decision: Decision,
    pub channel: Channel,
    pub basis: AccessBasis,
    pub reason: String,
    /// Hash returned by the integrity ledger when the event was anchored
    pub integrity_hash: IntegrityHash,
}

impl AccessEvent {
    fn ledger_record(&self) -> LedgerRecord {
        LedgerRecord::Access {
            event_id: self.id.clone(),
            patient_id: self.patient_id.clone(),
            doctor_id: self.doctor_id.clone(),
            decision: self.decision,
            channel: self.channel,
            categories_granted: self.categories_granted.iter().copied().collect(),
            timestamp: self.timestamp,
        }
    }
}

/// An access decision that has not been logged yet.
///
/// Granted categories can only be set through [`PendingEvent::allow`], which
/// intersects them with the request, so a logged event never discloses more
/// than was asked for.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    timestamp: DateTime<Utc>,
    patient_id: PatientId,
    doctor_id: DoctorId,
    requested: Scopes,
    granted: Scopes,
    decision: Decision,
    channel: Channel,
    basis: AccessBasis,
    reason: String,
}

impl PendingEvent {
    /// Starts out denied with no basis
    pub fn new(
        channel: Channel,
        patient_id: PatientId,
        doctor_id: DoctorId,
        requested: Scopes,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: now,
            patient_id,
            doctor_id,
            requested,
            granted: BTreeSet::new(),
            decision: Decision::Denied,
            channel,
            basis: AccessBasis::None,
            reason: "no basis for access".to_string(),
        }
    }

    /// Grant the requested categories that also appear in `offered`.
    /// Downgrades to `Denied` when the intersection is empty.
    pub fn allow(
        mut self,
        decision: Decision,
        offered: &Scopes,
        basis: AccessBasis,
        reason: impl Into<String>,
    ) -> Self {
        let granted: Scopes = self.requested.intersection(offered).copied().collect();
        self.basis = basis;
        if granted.is_empty() || decision == Decision::Denied {
            self.decision = Decision::Denied;
            self.granted.clear();
            self.reason = "no requested category is within the authorized scope".to_string();
        } else {
            self.decision = decision;
            self.granted = granted;
            self.reason = reason.into();
        }
        self
    }

    pub fn deny(mut self, reason: impl Into<String>) -> Self {
        self.decision = Decision::Denied;
        self.granted.clear();
        self.reason = reason.into();
        self
    }

    pub fn with_basis(mut self, basis: AccessBasis) -> Self {
        self.basis = basis;
        self
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn requested(&self) -> &Scopes {
        &self.requested
    }

    fn into_event(self, id: EventId, integrity_hash: IntegrityHash) -> AccessEvent {
        AccessEvent {
            id,
            timestamp: self.timestamp,
            patient_id: self.patient_id,
            doctor_id: self.doctor_id,
            categories_requested: self.requested,
            categories_granted: self.granted,
            decision: self.decision,
            channel: self.channel,
            basis: self.basis,
            reason: self.reason,
            integrity_hash,
        }
    }
}

/// Decision handed back to the caller, only after its event is logged
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub event_id: EventId,
    pub decision: Decision,
    pub channel: Channel,
    /// Categories the caller may read (empty when denied)
    pub granted: Scopes,
    pub reason: String,
}

impl AccessDecision {
    pub fn allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

impl From<&AccessEvent> for AccessDecision {
    fn from(event: &AccessEvent) -> Self {
        Self {
            event_id: event.id.clone(),
            decision: event.decision,
            channel: event.channel,
            granted: event.categories_granted.clone(),
            reason: event.reason.clone(),
        }
    }
}

// ==================== Filtering and pagination ====================

/// Inclusive time range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogFilter {
    pub patient_id: Option<PatientId>,
    pub doctor_id: Option<DoctorId>,
    pub date_range: Option<DateRange>,
    pub decision: Option<Decision>,
    pub channel: Option<Channel>,
}

impl AccessLogFilter {
    pub fn for_patient(patient_id: PatientId) -> Self {
        Self {
            patient_id: Some(patient_id),
            ..Self::default()
        }
    }

    pub fn by_doctor(mut self, doctor_id: DoctorId) -> Self {
        self.doctor_id = Some(doctor_id);
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.date_range = Some(DateRange { start, end });
        self
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn on_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn matches(&self, event: &AccessEvent) -> bool {
        self.patient_id.as_ref().map_or(true, |p| p == &event.patient_id)
            && self.doctor_id.as_ref().map_or(true, |d| d == &event.doctor_id)
            && self.date_range.map_or(true, |r| r.contains(event.timestamp))
            && self.decision.map_or(true, |d| d == event.decision)
            && self.channel.map_or(true, |c| c == event.channel)
    }
}

/// Keyset position in the log; events are ordered by (timestamp, id) descending
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventCursor {
    pub timestamp: DateTime<Utc>,
    pub id: EventId,
}

impl EventCursor {
    pub fn of(event: &AccessEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            id: event.id.clone(),
        }
    }

    /// True if `event` comes after this cursor in newest-first order
    pub fn precedes(&self, event: &AccessEvent) -> bool {
        (event.timestamp, &event.id) < (self.timestamp, &self.id)
    }
}

/// Lazy, restartable walk over the events matching a filter.
///
/// Each [`EventQuery::next_page`] fetches one page from the store. The walk is
/// finite: it ends once a short or empty page comes back.
pub struct EventQuery {
    store: Arc<dyn Store>,
    filter: AccessLogFilter,
    page_size: usize,
    cursor: Option<EventCursor>,
    exhausted: bool,
}

impl EventQuery {
    pub async fn next_page(&mut self) -> ConsentResult<Option<Vec<AccessEvent>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .store
            .events_page(&self.filter, self.cursor.as_ref(), self.page_size)
            .await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.cursor = Some(EventCursor::of(last));
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    /// Start again from the newest event
    pub fn rewind(&mut self) {
        self.cursor = None;
        self.exhausted = false;
    }

    pub async fn collect_all(mut self) -> ConsentResult<Vec<AccessEvent>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    pub fn filter(&self) -> &AccessLogFilter {
        &self.filter
    }
}

/// Aggregate view of the access log, as shown on a patient's history screen
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSummary {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub emergency: usize,
    pub by_channel: BTreeMap<Channel, usize>,
    pub distinct_doctors: usize,
    /// How often each category was actually disclosed
    pub categories_disclosed: BTreeMap<DataCategory, usize>,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

impl AccessSummary {
    fn add(&mut self, event: &AccessEvent, doctors: &mut BTreeSet<DoctorId>) {
        self.total += 1;
        match event.decision {
            Decision::Allowed => self.allowed += 1,
            Decision::Denied => self.denied += 1,
            Decision::EmergencyAllowed => self.emergency += 1,
        }
        *self.by_channel.entry(event.channel).or_insert(0) += 1;
        for category in &event.categories_granted {
            *self.categories_disclosed.entry(*category).or_insert(0) += 1;
        }
        doctors.insert(event.doctor_id.clone());
        self.distinct_doctors = doctors.len();
        self.first_event = Some(self.first_event.map_or(event.timestamp, |t| t.min(event.timestamp)));
        self.last_event = Some(self.last_event.map_or(event.timestamp, |t| t.max(event.timestamp)));
    }
}

// ==================== Access log ====================

#[derive(Clone)]
pub struct AccessLog {
    store: Arc<dyn Store>,
    ledger: Arc<dyn IntegrityLedger>,
    ledger_timeout: Duration,
    page_size: usize,
}

impl AccessLog {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<dyn IntegrityLedger>,
        ledger_timeout: Duration,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            ledger_timeout,
            page_size: page_size.max(1),
        }
    }

    /// Anchor the event in the integrity ledger without storing it.
    /// Used when the store write is part of a larger transaction.
    pub async fn seal(&self, pending: PendingEvent) -> ConsentResult<AccessEvent> {
        let id = EventId::generate();
        let unanchored = pending.into_event(id, IntegrityHash::new(""));
        let hash = anchor(
            self.ledger.as_ref(),
            &unanchored.ledger_record(),
            self.ledger_timeout,
        )
        .await?;
        Ok(AccessEvent {
            integrity_hash: hash,
            ..unanchored
        })
    }

    /// Anchor and store one event. Fails closed with `LogUnavailable`.
    pub async fn append(&self, pending: PendingEvent) -> ConsentResult<AccessEvent> {
        let event = self.seal(pending).await?;
        self.store.append_event(&event).await.map_err(|e| {
            warn!(event_id = %event.id, error = %e, "access log append failed");
            ConsentError::LogUnavailable(e.to_string())
        })?;
        trace_event(&event);
        Ok(event)
    }

    pub async fn record(&self, pending: PendingEvent) -> ConsentResult<EventId> {
        Ok(self.append(pending).await?.id)
    }

    pub fn query(&self, filter: AccessLogFilter) -> EventQuery {
        EventQuery {
            store: Arc::clone(&self.store),
            filter,
            page_size: self.page_size,
            cursor: None,
            exhausted: false,
        }
    }

    pub async fn summarize(&self, filter: AccessLogFilter) -> ConsentResult<AccessSummary> {
        let mut query = self.query(filter);
        let mut summary = AccessSummary::default();
        let mut doctors = BTreeSet::new();
        while let Some(page) = query.next_page().await? {
            for event in &page {
                summary.add(event, &mut doctors);
            }
        }
        Ok(summary)
    }
}

/// Emit the tracing line for a logged decision
pub(crate) fn trace_event(event: &AccessEvent) {
    match event.decision {
        Decision::Allowed => debug!(
            event_id = %event.id,
            patient = %event.patient_id,
            doctor = %event.doctor_id,
            channel = %event.channel,
            granted = event.categories_granted.len(),
            "access allowed"
        ),
        Decision::Denied => info!(
            event_id = %event.id,
            patient = %event.patient_id,
            doctor = %event.doctor_id,
            channel = %event.channel,
            reason = %event.reason,
            "access denied"
        ),
        Decision::EmergencyAllowed => warn!(
            event_id = %event.id,
            patient = %event.patient_id,
            doctor = %event.doctor_id,
            granted = event.categories_granted.len(),
            "emergency access to patient data"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::store::MemoryStore;
    use crate::types::scopes;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0).unwrap()
    }

    fn setup(page_size: usize) -> (Arc<MemoryStore>, Arc<MemoryLedger>, AccessLog) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let log = AccessLog::new(
            store.clone(),
            ledger.clone(),
            Duration::from_secs(1),
            page_size,
        );
        (store, ledger, log)
    }

    fn pending(patient: &str, doctor: &str, now: DateTime<Utc>) -> PendingEvent {
        PendingEvent::new(
            Channel::Scheduled,
            PatientId::new(patient),
            DoctorId::new(doctor),
            scopes([DataCategory::Allergies, DataCategory::Vitals]),
            now,
        )
    }

    #[test]
    fn test_allow_intersects_with_request() {
        let offered = scopes([DataCategory::Vitals, DataCategory::Imaging]);
        let event = pending("p1", "d1", at(0))
            .allow(Decision::Allowed, &offered, AccessBasis::None, "grant")
            .into_event(EventId::new("e"), IntegrityHash::new("0x"));
        assert_eq!(event.decision, Decision::Allowed);
        assert_eq!(event.categories_granted, scopes([DataCategory::Vitals]));
    }

    #[test]
    fn test_allow_with_disjoint_scope_is_denied() {
        let offered = scopes([DataCategory::Imaging]);
        let pending = pending("p1", "d1", at(0)).allow(
            Decision::Allowed,
            &offered,
            AccessBasis::None,
            "grant",
        );
        assert_eq!(pending.decision(), Decision::Denied);
    }

    #[tokio::test]
    async fn test_append_anchors_and_stores() {
        let (store, ledger, log) = setup(10);
        let event = log.append(pending("p1", "d1", at(0))).await.unwrap();
        assert_eq!(store.event_count(), 1);
        assert_eq!(ledger.len(), 1);
        assert!(event.integrity_hash.as_str().starts_with("0x"));
    }

    #[tokio::test]
    async fn test_sink_outage_is_log_unavailable() {
        let (store, _ledger, log) = setup(10);
        store.set_append_outage(true);
        let err = log.append(pending("p1", "d1", at(0))).await.unwrap_err();
        assert!(matches!(err, ConsentError::LogUnavailable(_)));
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_ledger_outage_stores_nothing() {
        let (store, ledger, log) = setup(10);
        ledger.set_offline(true);
        assert!(log.append(pending("p1", "d1", at(0))).await.is_err());
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_query_pages_newest_first() {
        let (_store, _ledger, log) = setup(2);
        for minute in 0..5 {
            log.append(pending("p1", "d1", at(minute))).await.unwrap();
        }
        log.append(pending("p2", "d1", at(30))).await.unwrap();

        let mut query = log.query(AccessLogFilter::for_patient(PatientId::new("p1")));
        let first = query.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].timestamp, at(4));
        assert_eq!(first[1].timestamp, at(3));

        let second = query.next_page().await.unwrap().unwrap();
        assert_eq!(second[0].timestamp, at(2));
        let third = query.next_page().await.unwrap().unwrap();
        assert_eq!(third.len(), 1);
        assert!(query.next_page().await.unwrap().is_none());

        query.rewind();
        let again = query.collect_all().await.unwrap();
        assert_eq!(again.len(), 5);
    }

    #[tokio::test]
    async fn test_query_handles_identical_timestamps() {
        let (_store, _ledger, log) = setup(1);
        for _ in 0..3 {
            log.append(pending("p1", "d1", at(0))).await.unwrap();
        }
        let all = log.query(AccessLogFilter::default()).collect_all().await.unwrap();
        assert_eq!(all.len(), 3);
        let ids: BTreeSet<_> = all.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_filter_by_decision_and_range() {
        let (_store, _ledger, log) = setup(10);
        let offered = scopes([DataCategory::Vitals]);
        log.append(pending("p1", "d1", at(0)).allow(
            Decision::Allowed,
            &offered,
            AccessBasis::None,
            "grant",
        ))
        .await
        .unwrap();
        log.append(pending("p1", "d2", at(10))).await.unwrap();

        let denied = log
            .query(AccessLogFilter::default().with_decision(Decision::Denied))
            .collect_all()
            .await
            .unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].doctor_id, DoctorId::new("d2"));

        let early = log
            .query(AccessLogFilter::default().between(at(0), at(5)))
            .collect_all()
            .await
            .unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].doctor_id, DoctorId::new("d1"));
    }

    #[tokio::test]
    async fn test_summarize_counts() {
        let (_store, _ledger, log) = setup(2);
        let offered = scopes([DataCategory::Vitals]);
        for minute in 0..3 {
            log.append(pending("p1", "d1", at(minute)).allow(
                Decision::Allowed,
                &offered,
                AccessBasis::None,
                "grant",
            ))
            .await
            .unwrap();
        }
        log.append(pending("p1", "d2", at(9))).await.unwrap();

        let summary = log
            .summarize(AccessLogFilter::for_patient(PatientId::new("p1")))
            .await
            .unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.allowed, 3);
        assert_eq!(summary.denied, 1);
        assert_eq!(summary.distinct_doctors, 2);
        assert_eq!(summary.categories_disclosed.get(&DataCategory::Vitals), Some(&3));
        assert_eq!(summary.by_channel.get(&Channel::Scheduled), Some(&4));
        assert_eq!(summary.first_event, Some(at(0)));
        assert_eq!(summary.last_event, Some(at(9)));
    }
}
