//! Fixture helpers shared by unit and integration tests.

use chrono::{DateTime, TimeZone, Utc};

use crate::types::SessionKey;

/// Fixed instant used as "now" so freshness checks are reproducible.
#[must_use]
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
        .single()
        .expect("valid fixture timestamp")
}

/// Session key used across fixtures.
#[must_use]
pub fn test_key() -> SessionKey {
    SessionKey::new("a1b2c3d4e5f60718", "run-001").expect("valid fixture key")
}

/// Session key with a caller-chosen run id.
#[must_use]
pub fn key_for_run(run_id: &str) -> SessionKey {
    SessionKey::new("a1b2c3d4e5f60718", run_id).expect("valid fixture key")
}

/// Number of proptest cases, overridable through `PROPTEST_CASES`.
#[must_use]
pub fn proptest_cases(default: u32) -> u32 {
    std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
