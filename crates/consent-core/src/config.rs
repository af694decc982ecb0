//! Runtime configuration: collaborator timeouts and lifetime ceilings.
//!
//! Loaded from JSON. Every field has a default, so an empty object `{}` is a
//! valid configuration.

use crate::error::{ConsentError, ConsentResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest page an [`crate::audit::EventQuery`] will fetch at once
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentConfig {
    /// Upper bound on one integrity ledger submission
    pub ledger_timeout_ms: u64,
    /// Upper bound on one biometric verification call
    pub biometric_timeout_ms: u64,
    /// How long an emergency session stays usable after activation
    pub emergency_session_max_minutes: u32,
    /// Idle time after which a session that never activated may be purged
    pub abandoned_session_minutes: u32,
    pub default_token_ttl_hours: u32,
    /// Longest lifetime a QR token may be issued with
    pub max_token_ttl_hours: u32,
    pub query_page_size: usize,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            ledger_timeout_ms: 2_000,
            biometric_timeout_ms: 10_000,
            emergency_session_max_minutes: 240,
            abandoned_session_minutes: 30,
            default_token_ttl_hours: 24,
            max_token_ttl_hours: 168,
            query_page_size: 50,
        }
    }
}

impl ConsentConfig {
    pub fn from_json_str(json: &str) -> ConsentResult<Self> {
        let config: ConsentConfig = serde_json::from_str(json)
            .map_err(|e| ConsentError::InvalidConfig(format!("failed to parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> ConsentResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConsentError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject zero durations and oversize pages
    pub fn validate(&self) -> ConsentResult<()> {
        let zero_checks: [(&str, u64); 6] = [
            ("ledger_timeout_ms", self.ledger_timeout_ms),
            ("biometric_timeout_ms", self.biometric_timeout_ms),
            (
                "emergency_session_max_minutes",
                self.emergency_session_max_minutes as u64,
            ),
            ("abandoned_session_minutes", self.abandoned_session_minutes as u64),
            ("default_token_ttl_hours", self.default_token_ttl_hours as u64),
            ("max_token_ttl_hours", self.max_token_ttl_hours as u64),
        ];
        for (name, value) in zero_checks {
            if value == 0 {
                return Err(ConsentError::InvalidConfig(format!("{} must be positive", name)));
            }
        }

        if self.default_token_ttl_hours > self.max_token_ttl_hours {
            return Err(ConsentError::InvalidConfig(format!(
                "default_token_ttl_hours ({}) exceeds max_token_ttl_hours ({})",
                self.default_token_ttl_hours, self.max_token_ttl_hours
            )));
        }

        if self.query_page_size == 0 || self.query_page_size > MAX_PAGE_SIZE {
            return Err(ConsentError::InvalidConfig(format!(
                "query_page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        Ok(())
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn biometric_timeout(&self) -> Duration {
        Duration::from_millis(self.biometric_timeout_ms)
    }

    pub fn emergency_session_max(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.emergency_session_max_minutes as i64)
    }

    pub fn abandoned_session_ceiling(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.abandoned_session_minutes as i64)
    }

    pub fn default_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.default_token_ttl_hours as i64)
    }

    pub fn max_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_token_ttl_hours as i64)
    }
}
