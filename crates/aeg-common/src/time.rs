//! Timestamp alias used throughout the observation and health pipelines.

use chrono::{DateTime, Utc};

/// Wall-clock instant, always UTC.
pub type Timestamp = DateTime<Utc>;

/// Current wall-clock time. Centralized so tests can be written against
/// a fixed clock later without touching call sites.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}
