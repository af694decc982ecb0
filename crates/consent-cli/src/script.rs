//! Scripted replays against an in-memory deployment.
//!
//! A script seeds actors, profiles and emergency codes, then runs a list of
//! role actions in order. A step may save the id its outcome produced
//! (`"save_as": "grant"`) and later steps refer to it as `"$grant"`.

use chrono::{DateTime, Duration, Utc};
use consent_core::prelude::*;
use consent_core::{AccessSummary, LedgerEntry, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to parse script: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("step {step}: unknown variable ${name}")]
    UnknownVariable { step: usize, name: String },
    #[error("step {step}: invalid action: {source}")]
    InvalidAction {
        step: usize,
        source: serde_json::Error,
    },
    #[error("step {step}: {reason}")]
    InvalidStep { step: usize, reason: String },
    #[error("seeding failed: {0}")]
    Seed(#[from] ConsentError),
}

#[derive(Debug, Deserialize)]
pub struct PatientSeed {
    pub actor_id: ActorId,
    pub patient_id: PatientId,
}

#[derive(Debug, Deserialize)]
pub struct DoctorSeed {
    pub actor_id: ActorId,
    pub doctor_id: DoctorId,
    #[serde(flatten)]
    pub profile: DoctorProfile,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
pub struct CodeSeed {
    pub code: String,
    #[serde(default)]
    pub issued_to: Option<ActorId>,
    /// Hours from the script start until the code expires
    #[serde(default = "default_code_hours")]
    pub valid_hours: i64,
}

fn default_code_hours() -> i64 {
    24
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct Step {
    pub actor: ActorId,
    /// Minutes to move the clock forward before this step
    #[serde(default)]
    pub advance_minutes: i64,
    #[serde(default)]
    pub save_as: Option<String>,
    /// A `RoleAction` in JSON, possibly containing `$variables`
    pub action: Value,
}

#[derive(Debug, Deserialize)]
pub struct Script {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub actors: Vec<Actor>,
    #[serde(default)]
    pub patients: Vec<PatientSeed>,
    #[serde(default)]
    pub doctors: Vec<DoctorSeed>,
    #[serde(default)]
    pub emergency_codes: Vec<CodeSeed>,
    #[serde(default = "default_true")]
    pub biometrics_pass: bool,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_json_str(json: &str) -> Result<Self, ScriptError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub at: DateTime<Utc>,
    pub actor: ActorId,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ActionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub steps: Vec<StepReport>,
    pub audit_trail: Vec<AccessEvent>,
    pub summary: AccessSummary,
    pub ledger_entries: Vec<LedgerEntry>,
    pub ledger_chain_valid: bool,
}

/// Replace every `"$name"` string in `value` with the saved variable
fn substitute(
    value: &mut Value,
    vars: &HashMap<String, String>,
    step: usize,
) -> Result<(), ScriptError> {
    match value {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix('$') {
                let resolved = vars.get(name).ok_or_else(|| ScriptError::UnknownVariable {
                    step,
                    name: name.to_string(),
                })?;
                *s = resolved.clone();
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, vars, step)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute(item, vars, step)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Move the replay clock forward; it never runs backwards
fn advance(now: DateTime<Utc>, minutes: i64, step: usize) -> Result<DateTime<Utc>, ScriptError> {
    if minutes < 0 {
        return Err(ScriptError::InvalidStep {
            step,
            reason: format!("advance_minutes must not be negative, got {}", minutes),
        });
    }
    Duration::try_minutes(minutes)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| ScriptError::InvalidStep {
            step,
            reason: format!("advance_minutes {} overflows the clock", minutes),
        })
}

/// Id a later step may refer to
fn outcome_id(outcome: &ActionOutcome) -> Option<String> {
    match outcome {
        ActionOutcome::Grant(grant) => Some(grant.id.to_string()),
        ActionOutcome::Token(token) => Some(token.id.to_string()),
        ActionOutcome::Session(session) => Some(session.id.to_string()),
        ActionOutcome::Decision(decision) => Some(decision.event_id.to_string()),
        ActionOutcome::Doctor(doctor) => Some(doctor.doctor_id.to_string()),
        _ => None,
    }
}

async fn seed(
    script: &Script,
    control: &AccessControl,
    store: &MemoryStore,
) -> Result<(), ScriptError> {
    let dir = control.directory();
    for actor in &script.actors {
        dir.register_actor(actor.clone()).await?;
    }
    for patient in &script.patients {
        dir.register_patient(&patient.actor_id, patient.patient_id.clone())
            .await?;
    }
    for doctor in &script.doctors {
        let mut registered = dir
            .register_doctor(&doctor.actor_id, doctor.doctor_id.clone(), doctor.profile.clone())
            .await?;
        if doctor.verified {
            registered.verified = true;
            store
                .update_doctor(&registered)
                .await
                .map_err(ConsentError::from)?;
        }
    }
    Ok(())
}

/// Run `script` from a fresh in-memory deployment
pub async fn replay(script: Script, config: ConsentConfig) -> Result<ReplayReport, ScriptError> {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    let codes = EmergencyCodeBook::random();
    for code in &script.emergency_codes {
        let expires_at = Duration::try_hours(code.valid_hours)
            .and_then(|valid| script.start.checked_add_signed(valid))
            .ok_or_else(|| {
                ConsentError::InvalidConfig(format!(
                    "emergency code: valid_hours {} out of range",
                    code.valid_hours
                ))
            })?;
        codes
            .issue(&code.code, code.issued_to.clone(), expires_at)
            .map_err(|e| ConsentError::InvalidConfig(format!("emergency code: {}", e)))?;
    }
    let biometrics = if script.biometrics_pass {
        StaticBiometricVerifier::accepting()
    } else {
        StaticBiometricVerifier::rejecting()
    };

    let control = AccessControl::new(
        Collaborators {
            store: store.clone(),
            ledger: ledger.clone(),
            codes: Arc::new(codes),
            biometrics: Arc::new(biometrics),
        },
        config,
    )?;
    seed(&script, &control, &store).await?;

    let mut now = script.start;
    let mut vars: HashMap<String, String> = HashMap::new();
    let mut reports = Vec::with_capacity(script.steps.len());

    for (index, step) in script.steps.into_iter().enumerate() {
        let number = index + 1;
        now = advance(now, step.advance_minutes, number)?;

        let mut raw = step.action;
        substitute(&mut raw, &vars, number)?;
        let action: RoleAction = serde_json::from_value(raw)
            .map_err(|source| ScriptError::InvalidAction { step: number, source })?;
        let name = action.name();

        let result = match control.directory().authenticate(&step.actor, now).await {
            Ok(session) => control.dispatch(&session, action, now).await,
            Err(e) => Err(e),
        };

        let report = match result {
            Ok(outcome) => {
                if let (Some(var), Some(id)) = (&step.save_as, outcome_id(&outcome)) {
                    debug!(step = number, var = %var, id = %id, "saved step result");
                    vars.insert(var.clone(), id);
                }
                StepReport {
                    step: number,
                    at: now,
                    actor: step.actor,
                    action: name,
                    outcome: Some(outcome),
                    error: None,
                }
            }
            Err(e) => StepReport {
                step: number,
                at: now,
                actor: step.actor,
                action: name,
                outcome: None,
                error: Some(e.to_string()),
            },
        };
        reports.push(report);
    }

    let log = control.access_log();
    let audit_trail = log.query(AccessLogFilter::default()).collect_all().await?;
    let summary = log.summarize(AccessLogFilter::default()).await?;
    info!(
        steps = reports.len(),
        events = audit_trail.len(),
        "replay finished"
    );

    Ok(ReplayReport {
        steps: reports,
        audit_trail,
        summary,
        ledger_entries: ledger.entries(),
        ledger_chain_valid: ledger.verify_chain(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALKTHROUGH: &str = include_str!("../scripts/walkthrough.json");

    #[test]
    fn test_substitute_nested_variables() {
        let mut vars = HashMap::new();
        vars.insert("grant".to_string(), "g-123".to_string());
        let mut value = serde_json::json!({
            "patient": {"action": "revoke_consent", "grant_id": "$grant"},
            "list": ["$grant", "plain"]
        });
        substitute(&mut value, &vars, 1).unwrap();
        assert_eq!(value["patient"]["grant_id"], "g-123");
        assert_eq!(value["list"][0], "g-123");
        assert_eq!(value["list"][1], "plain");
    }

    #[test]
    fn test_unknown_variable_is_reported() {
        let mut value = serde_json::json!({"grant_id": "$missing"});
        let err = substitute(&mut value, &HashMap::new(), 4).unwrap_err();
        assert_eq!(err.to_string(), "step 4: unknown variable $missing");
    }

    #[test]
    fn test_advance_rejects_backwards_clock() {
        let start = Utc::now();
        let err = advance(start, -5, 3).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidStep { step: 3, .. }));
        assert_eq!(advance(start, 0, 1).unwrap(), start);
        assert_eq!(advance(start, 90, 1).unwrap(), start + Duration::minutes(90));
    }

    #[test]
    fn test_advance_overflow_is_an_error() {
        let err = advance(Utc::now(), i64::MAX, 2).unwrap_err();
        assert!(err.to_string().starts_with("step 2: advance_minutes"));
    }

    #[tokio::test]
    async fn test_negative_advance_stops_replay() {
        let script = Script::from_json_str(
            r#"{
                "start": "2025-03-01T09:00:00Z",
                "actors": [{ "id": "registrar", "role": "admin", "display_name": "Records" }],
                "steps": [
                    { "actor": "registrar", "action": { "admin": { "action": "summarize" } } },
                    {
                        "actor": "registrar",
                        "advance_minutes": -60,
                        "action": { "admin": { "action": "summarize" } }
                    }
                ]
            }"#,
        )
        .unwrap();
        let err = replay(script, ConsentConfig::default()).await.unwrap_err();
        assert!(matches!(err, ScriptError::InvalidStep { step: 2, .. }));
    }

    #[tokio::test]
    async fn test_code_expiry_overflow_is_a_seed_error() {
        let script = Script::from_json_str(
            r#"{
                "start": "2025-03-01T09:00:00Z",
                "emergency_codes": [{ "code": "EMERGENCY123", "valid_hours": 9223372036854775807 }],
                "steps": []
            }"#,
        )
        .unwrap();
        let err = replay(script, ConsentConfig::default()).await.unwrap_err();
        assert!(matches!(err, ScriptError::Seed(ConsentError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_walkthrough_replays() {
        let script = Script::from_json_str(WALKTHROUGH).unwrap();
        let step_count = script.steps.len();
        let report = replay(script, ConsentConfig::default()).await.unwrap();

        assert_eq!(report.steps.len(), step_count);
        assert!(report.ledger_chain_valid);
        assert!(!report.audit_trail.is_empty());

        // Denied reads come back as outcomes; only these two steps error
        let errors: Vec<&str> = report
            .steps
            .iter()
            .filter_map(|s| s.error.as_deref())
            .collect();
        assert_eq!(errors.len(), 2, "unexpected errors: {:?}", errors);
        assert!(errors.iter().any(|e| e.contains("emergency access code")));
        assert!(errors.iter().any(|e| e.contains("no redemptions left")));
        assert_eq!(report.summary.emergency, 1);
    }
}
