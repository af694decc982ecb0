//! QR access tokens - expiring, scope-limited capabilities.
//!
//! A patient mints a token (standalone, or derived from one of their consent
//! grants) and shows it as a QR code. A doctor redeems it; every redemption
//! attempt on a known token writes one QR-channel access event.

use crate::audit::{AccessBasis, AccessDecision, AccessLog, PendingEvent};
use crate::error::{ConsentError, ConsentResult};
use crate::locks::KeyedLocks;
use crate::store::Store;
use crate::types::{Channel, Decision, DoctorId, GrantId, PatientId, Scopes, TokenId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Emergency,
    Appointment,
    Specialist,
    Temporary,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Emergency => write!(f, "emergency"),
            TokenKind::Appointment => write!(f, "appointment"),
            TokenKind::Specialist => write!(f, "specialist"),
            TokenKind::Temporary => write!(f, "temporary"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: TokenId,
    pub issuing_patient_id: PatientId,
    pub kind: TokenKind,
    pub scopes: Scopes,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub max_redemptions: u32,
    pub redemption_count: u32,
    /// Grant this token was derived from; the token dies with it
    pub source_grant: Option<GrantId>,
    /// Only this doctor may redeem, when set
    pub bound_doctor: Option<DoctorId>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// What the QR code carries
#[derive(Serialize)]
struct QrPayload<'a> {
    token: &'a TokenId,
    kind: TokenKind,
    scopes: &'a Scopes,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.redemption_count >= self.max_redemptions
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_exhausted() && !self.is_revoked()
    }

    pub fn remaining_redemptions(&self) -> u32 {
        self.max_redemptions.saturating_sub(self.redemption_count)
    }

    /// JSON rendered into the QR code
    pub fn qr_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(&QrPayload {
            token: &self.id,
            kind: self.kind,
            scopes: &self.scopes,
            expires_at: self.expires_at,
        })
    }
}

/// Lifetime and redemption limit for a new token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenPolicy {
    pub kind: TokenKind,
    pub ttl: Duration,
    pub max_redemptions: u32,
}

impl TokenPolicy {
    pub fn new(kind: TokenKind, ttl: Duration, max_redemptions: u32) -> Self {
        Self {
            kind,
            ttl,
            max_redemptions,
        }
    }

    pub fn single_use(kind: TokenKind, ttl: Duration) -> Self {
        Self::new(kind, ttl, 1)
    }
}

pub struct TokenIssuer {
    store: Arc<dyn Store>,
    log: AccessLog,
    locks: KeyedLocks<TokenId>,
    max_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(store: Arc<dyn Store>, log: AccessLog, max_ttl: Duration) -> Self {
        Self {
            store,
            log,
            locks: KeyedLocks::new(),
            max_ttl,
        }
    }

    fn check_policy(&self, scopes: &Scopes, policy: &TokenPolicy) -> ConsentResult<()> {
        if scopes.is_empty() {
            return Err(ConsentError::InvalidScope);
        }
        if policy.ttl <= Duration::zero() {
            return Err(ConsentError::InvalidTokenPolicy(
                "ttl must be positive".to_string(),
            ));
        }
        if policy.ttl > self.max_ttl {
            return Err(ConsentError::InvalidTokenPolicy(format!(
                "ttl of {} hours exceeds the {} hour ceiling",
                policy.ttl.num_hours(),
                self.max_ttl.num_hours()
            )));
        }
        if policy.max_redemptions == 0 {
            return Err(ConsentError::InvalidTokenPolicy(
                "max_redemptions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Mint a standalone token for `patient_id`
    #[instrument(skip(self, scopes))]
    pub async fn issue(
        &self,
        patient_id: &PatientId,
        scopes: Scopes,
        policy: TokenPolicy,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessToken> {
        self.check_policy(&scopes, &policy)?;
        if self.store.patient(patient_id).await?.is_none() {
            return Err(ConsentError::UnknownPatient(patient_id.clone()));
        }
        self.mint(patient_id.clone(), scopes, policy, None, None, now)
            .await
    }

    /// Mint a token from a grant the patient owns. The token carries the
    /// grant's scopes, is bound to the grant's doctor and stops working as
    /// soon as the grant does.
    #[instrument(skip(self))]
    pub async fn issue_for_grant(
        &self,
        grant_id: &GrantId,
        acting_patient: &PatientId,
        policy: TokenPolicy,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessToken> {
        let grant = self
            .store
            .grant(grant_id)
            .await?
            .ok_or_else(|| ConsentError::UnknownGrant(grant_id.clone()))?;
        if &grant.patient_id != acting_patient {
            return Err(ConsentError::NotOwner(format!("grant {}", grant_id)));
        }
        if grant.is_revoked() {
            return Err(ConsentError::GrantRevoked(grant.id));
        }
        self.check_policy(&grant.scopes, &policy)?;
        self.mint(
            grant.patient_id,
            grant.scopes,
            policy,
            Some(grant.id),
            Some(grant.doctor_id),
            now,
        )
        .await
    }

    async fn mint(
        &self,
        patient_id: PatientId,
        scopes: Scopes,
        policy: TokenPolicy,
        source_grant: Option<GrantId>,
        bound_doctor: Option<DoctorId>,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessToken> {
        let token = AccessToken {
            id: TokenId::generate(),
            issuing_patient_id: patient_id,
            kind: policy.kind,
            scopes,
            issued_at: now,
            expires_at: now + policy.ttl,
            max_redemptions: policy.max_redemptions,
            redemption_count: 0,
            source_grant,
            bound_doctor,
            revoked_at: None,
        };
        self.store.insert_token(&token).await?;
        info!(
            token_id = %token.id,
            kind = %token.kind,
            expires_at = %token.expires_at,
            max_redemptions = token.max_redemptions,
            "access token issued"
        );
        Ok(token)
    }

    /// Cancel a token before it expires
    #[instrument(skip(self))]
    pub async fn revoke_token(
        &self,
        token_id: &TokenId,
        acting_patient: &PatientId,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessToken> {
        let _guard = self.locks.acquire(token_id).await;
        let mut token = self.token(token_id).await?;
        if &token.issuing_patient_id != acting_patient {
            return Err(ConsentError::NotOwner(format!("token {}", token_id)));
        }
        if token.is_revoked() {
            return Ok(token);
        }
        token.revoked_at = Some(now);
        self.store.update_token(&token).await?;
        info!(token_id = %token.id, "access token revoked");
        Ok(token)
    }

    pub async fn token(&self, token_id: &TokenId) -> ConsentResult<AccessToken> {
        self.store
            .token(token_id)
            .await?
            .ok_or_else(|| ConsentError::UnknownToken(token_id.clone()))
    }

    /// Redeem a token on behalf of `doctor_id`.
    ///
    /// Serialized per token, so concurrent redeemers of a single-use token see
    /// exactly one success. An expired or exhausted token is logged as denied
    /// and then reported as an error; other refusals are ordinary denials.
    #[instrument(skip(self))]
    pub async fn redeem(
        &self,
        token_id: &TokenId,
        doctor_id: &DoctorId,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessDecision> {
        let _guard = self.locks.acquire(token_id).await;
        let mut token = self.token(token_id).await?;

        let pending = PendingEvent::new(
            Channel::Qr,
            token.issuing_patient_id.clone(),
            doctor_id.clone(),
            token.scopes.clone(),
            now,
        )
        .with_basis(AccessBasis::Token(token.id.clone()));

        if token.is_expired(now) {
            self.log.append(pending.deny("access token expired")).await?;
            return Err(ConsentError::TokenExpired(token.id));
        }
        if token.is_exhausted() {
            self.log
                .append(pending.deny("access token has no redemptions left"))
                .await?;
            return Err(ConsentError::TokenExhausted(token.id));
        }
        if let Some(reason) = self.refusal(&token, doctor_id, now).await? {
            let event = self.log.append(pending.deny(reason)).await?;
            return Ok(AccessDecision::from(&event));
        }

        token.redemption_count += 1;
        let pending = pending.allow(
            Decision::Allowed,
            &token.scopes,
            AccessBasis::Token(token.id.clone()),
            format!("{} access token", token.kind),
        );
        let event = self.log.seal(pending).await?;
        self.store
            .commit_redemption(&token, &event)
            .await
            .map_err(|e| {
                warn!(token_id = %token.id, error = %e, "redemption commit failed");
                ConsentError::LogUnavailable(e.to_string())
            })?;
        crate::audit::trace_event(&event);
        Ok(AccessDecision::from(&event))
    }

    /// Reason to refuse a live token, if any
    async fn refusal(
        &self,
        token: &AccessToken,
        doctor_id: &DoctorId,
        now: DateTime<Utc>,
    ) -> ConsentResult<Option<String>> {
        if token.is_revoked() {
            return Ok(Some("access token revoked".to_string()));
        }
        match self.store.doctor(doctor_id).await? {
            None => return Ok(Some("unknown doctor".to_string())),
            Some(doctor) if !doctor.verified => {
                return Ok(Some("doctor is not verified".to_string()));
            }
            Some(_) => {}
        }
        if let Some(bound) = &token.bound_doctor {
            if bound != doctor_id {
                return Ok(Some("access token is bound to another doctor".to_string()));
            }
        }
        if let Some(grant_id) = &token.source_grant {
            let effective = self
                .store
                .grant(grant_id)
                .await?
                .map_or(false, |g| g.is_effective(now));
            if !effective {
                return Ok(Some("source consent grant is no longer effective".to_string()));
            }
        }
        Ok(None)
    }
}
