use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{SampleStore, StoreError};

// ─── Defaults and ranges ─────────────────────────────────────────

const DEFAULT_ENABLED: bool = true;
const DEFAULT_RETENTION_DAYS: i64 = 14;
const DEFAULT_SAMPLE_RATE_PERCENT: i64 = 25;
const DEFAULT_SLOW_QUERY_MS_THRESHOLD: i64 = 250;
const DEFAULT_LOG_SLOW_QUERIES: bool = true;
const DEFAULT_IGNORE_AJAX: bool = true;
const DEFAULT_IGNORE_HEARTBEAT: bool = true;

pub const RETENTION_DAYS_RANGE: (i64, i64) = (1, 90);
pub const SAMPLE_RATE_PERCENT_RANGE: (i64, i64) = (1, 100);
pub const SLOW_QUERY_MS_THRESHOLD_RANGE: (i64, i64) = (10, 5_000);

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1_000;

// ─── Settings ────────────────────────────────────────────────────

/// The singleton configuration record. One typed field per knob; every
/// numeric field lives inside a documented clamp range. Out-of-range
/// input is silently normalized, never rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Master switch; when false, admission never captures.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How many trailing days of samples to keep (1–90).
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Percentage of eligible requests admitted for capture (1–100).
    #[serde(default = "default_sample_rate_percent")]
    pub sample_rate_percent: i64,

    /// Queries at or above this duration are captured (10–5000 ms).
    #[serde(default = "default_slow_query_ms_threshold")]
    pub slow_query_ms_threshold: i64,

    /// Capture slow queries when the host's query-timing log exists.
    #[serde(default = "default_log_slow_queries")]
    pub log_slow_queries_if_available: bool,

    /// Skip AJAX-style async update requests.
    #[serde(default = "default_ignore_ajax")]
    pub ignore_ajax: bool,

    /// Skip recurring keep-alive heartbeat requests.
    #[serde(default = "default_ignore_heartbeat")]
    pub ignore_heartbeat: bool,
}

fn default_enabled() -> bool {
    DEFAULT_ENABLED
}
fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}
fn default_sample_rate_percent() -> i64 {
    DEFAULT_SAMPLE_RATE_PERCENT
}
fn default_slow_query_ms_threshold() -> i64 {
    DEFAULT_SLOW_QUERY_MS_THRESHOLD
}
fn default_log_slow_queries() -> bool {
    DEFAULT_LOG_SLOW_QUERIES
}
fn default_ignore_ajax() -> bool {
    DEFAULT_IGNORE_AJAX
}
fn default_ignore_heartbeat() -> bool {
    DEFAULT_IGNORE_HEARTBEAT
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_ENABLED,
            retention_days: DEFAULT_RETENTION_DAYS,
            sample_rate_percent: DEFAULT_SAMPLE_RATE_PERCENT,
            slow_query_ms_threshold: DEFAULT_SLOW_QUERY_MS_THRESHOLD,
            log_slow_queries_if_available: DEFAULT_LOG_SLOW_QUERIES,
            ignore_ajax: DEFAULT_IGNORE_AJAX,
            ignore_heartbeat: DEFAULT_IGNORE_HEARTBEAT,
        }
    }
}

impl Settings {
    /// Normalize every numeric field into its documented range.
    /// Idempotent: clamping a clamped value is a no-op.
    pub fn clamped(mut self) -> Self {
        self.retention_days = self
            .retention_days
            .clamp(RETENTION_DAYS_RANGE.0, RETENTION_DAYS_RANGE.1);
        self.sample_rate_percent = self
            .sample_rate_percent
            .clamp(SAMPLE_RATE_PERCENT_RANGE.0, SAMPLE_RATE_PERCENT_RANGE.1);
        self.slow_query_ms_threshold = self.slow_query_ms_threshold.clamp(
            SLOW_QUERY_MS_THRESHOLD_RANGE.0,
            SLOW_QUERY_MS_THRESHOLD_RANGE.1,
        );
        self
    }

    /// Start of the retention window: everything recorded before this
    /// instant is eligible for sweeping; everything at or after it is kept.
    pub fn retention_cutoff_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.retention_days * MS_PER_DAY
    }
}

// ─── Updates ─────────────────────────────────────────────────────

/// A candidate settings save. Every field is optional; a field left
/// `None` resolves to the hard default, NOT to the previously stored
/// value. Each save recomputes the whole record fresh.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    pub retention_days: Option<i64>,
    pub sample_rate_percent: Option<i64>,
    pub slow_query_ms_threshold: Option<i64>,
    pub log_slow_queries_if_available: Option<bool>,
    pub ignore_ajax: Option<bool>,
    pub ignore_heartbeat: Option<bool>,
}

impl SettingsUpdate {
    /// Resolve the candidate against hard defaults and clamp.
    pub fn resolve(self) -> Settings {
        Settings {
            enabled: self.enabled.unwrap_or(DEFAULT_ENABLED),
            retention_days: self.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
            sample_rate_percent: self
                .sample_rate_percent
                .unwrap_or(DEFAULT_SAMPLE_RATE_PERCENT),
            slow_query_ms_threshold: self
                .slow_query_ms_threshold
                .unwrap_or(DEFAULT_SLOW_QUERY_MS_THRESHOLD),
            log_slow_queries_if_available: self
                .log_slow_queries_if_available
                .unwrap_or(DEFAULT_LOG_SLOW_QUERIES),
            ignore_ajax: self.ignore_ajax.unwrap_or(DEFAULT_IGNORE_AJAX),
            ignore_heartbeat: self.ignore_heartbeat.unwrap_or(DEFAULT_IGNORE_HEARTBEAT),
        }
        .clamped()
    }
}

// ─── Store ───────────────────────────────────────────────────────

/// Loads and saves the persisted settings record.
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<SampleStore>,
}

impl SettingsStore {
    pub fn new(store: Arc<SampleStore>) -> Self {
        Self { store }
    }

    /// Stored settings merged over defaults, clamped. A missing or
    /// unreadable record yields pure defaults; unknown fields in the
    /// stored document are ignored.
    pub fn load(&self) -> Result<Settings, StoreError> {
        let settings = match self.store.load_settings_json()? {
            Some(json) => match serde_json::from_str::<Settings>(&json) {
                Ok(settings) => settings,
                Err(err) => {
                    debug!(error = %err, "stored settings unreadable, using defaults");
                    Settings::default()
                }
            },
            None => Settings::default(),
        };
        Ok(settings.clamped())
    }

    /// Validate, clamp, and persist a candidate. Fields absent from the
    /// candidate fall back to defaults; there is no partial merge with
    /// the previously stored record.
    pub fn save(&self, update: SettingsUpdate) -> Result<Settings, StoreError> {
        let settings = update.resolve();
        let json = serde_json::to_string(&settings)?;
        self.store.save_settings_json(&json)?;
        Ok(settings)
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SettingsStore {
        SettingsStore::new(Arc::new(SampleStore::open_in_memory().unwrap()))
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert!(s.enabled);
        assert_eq!(s.retention_days, 14);
        assert_eq!(s.sample_rate_percent, 25);
        assert_eq!(s.slow_query_ms_threshold, 250);
        assert!(s.log_slow_queries_if_available);
        assert!(s.ignore_ajax);
        assert!(s.ignore_heartbeat);
    }

    #[test]
    fn clamping_normalizes_and_is_idempotent() {
        let wild = Settings {
            retention_days: 5_000,
            sample_rate_percent: 0,
            slow_query_ms_threshold: -30,
            ..Settings::default()
        };
        let once = wild.clamped();
        assert_eq!(once.retention_days, 90);
        assert_eq!(once.sample_rate_percent, 1);
        assert_eq!(once.slow_query_ms_threshold, 10);
        assert_eq!(once.clone().clamped(), once);
    }

    #[test]
    fn save_resolves_missing_fields_to_defaults_not_prior_values() {
        let store = store();
        store
            .save(SettingsUpdate {
                sample_rate_percent: Some(80),
                retention_days: Some(30),
                ..SettingsUpdate::default()
            })
            .unwrap();

        // A later save that omits retention_days resets it to 14.
        let saved = store
            .save(SettingsUpdate {
                sample_rate_percent: Some(90),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert_eq!(saved.retention_days, 14);
        assert_eq!(saved.sample_rate_percent, 90);
        assert_eq!(store.load().unwrap(), saved);
    }

    #[test]
    fn save_clamps_out_of_range_input_silently() {
        let store = store();
        let saved = store
            .save(SettingsUpdate {
                retention_days: Some(0),
                sample_rate_percent: Some(400),
                slow_query_ms_threshold: Some(9_999),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert_eq!(saved.retention_days, 1);
        assert_eq!(saved.sample_rate_percent, 100);
        assert_eq!(saved.slow_query_ms_threshold, 5_000);
    }

    #[test]
    fn save_is_idempotent_under_reapplication() {
        let store = store();
        let update = SettingsUpdate {
            retention_days: Some(120),
            sample_rate_percent: Some(-5),
            ..SettingsUpdate::default()
        };
        let first = store.save(update.clone()).unwrap();
        // Feeding the saved output back through save changes nothing.
        let second = store
            .save(SettingsUpdate {
                enabled: Some(first.enabled),
                retention_days: Some(first.retention_days),
                sample_rate_percent: Some(first.sample_rate_percent),
                slow_query_ms_threshold: Some(first.slow_query_ms_threshold),
                log_slow_queries_if_available: Some(first.log_slow_queries_if_available),
                ignore_ajax: Some(first.ignore_ajax),
                ignore_heartbeat: Some(first.ignore_heartbeat),
            })
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn load_survives_missing_and_garbage_records() {
        let store = store();
        assert_eq!(store.load().unwrap(), Settings::default());

        store.store.save_settings_json("not json at all").unwrap();
        assert_eq!(store.load().unwrap(), Settings::default());

        // Unknown fields are ignored, missing fields defaulted.
        store
            .store
            .save_settings_json(r#"{"sample_rate_percent": 60, "mystery": true}"#)
            .unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.sample_rate_percent, 60);
        assert_eq!(loaded.retention_days, 14);
    }

    #[test]
    fn load_clamps_stored_out_of_range_values() {
        let store = store();
        store
            .store
            .save_settings_json(r#"{"retention_days": 400}"#)
            .unwrap();
        assert_eq!(store.load().unwrap().retention_days, 90);
    }
}
