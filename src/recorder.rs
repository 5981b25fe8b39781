use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::settings::Settings;
use crate::store::{NewSample, NewSlowQuery, SampleStore};

// ─── Configuration ───────────────────────────────────────────────

/// Captured query text is cut at this many characters.
pub const MAX_QUERY_TEXT_CHARS: usize = 2_000;

/// Appended to query text that was cut.
const TRUNCATION_MARKER: char = '…';

// ─── Host-supplied request data ──────────────────────────────────

/// Static request context the host hands to `begin`. Everything here is
/// known at the start of the request; the screen identifiers are not and
/// arrive later (if at all) via `InFlightSample::resolve_screen`.
#[derive(Debug, Clone)]
pub struct RequestStart {
    /// Request path; a query string, if present, is stripped before storage.
    pub url_path: String,
    pub http_method: String,
    pub user_id: i64,
    /// The acting user's role names, order preserved.
    pub user_roles: Vec<String>,
    /// Currently active extensions, hashed (order-independently) into
    /// `plugins_hash` so regressions can be correlated with deployments.
    pub active_plugins: Vec<String>,
    pub theme_slug: String,
    pub is_ajax: bool,
    pub is_heartbeat: bool,
}

/// End-of-request measurements read from the host environment. A `None`
/// query log means the host's per-query timing facility is unavailable,
/// which silently disables slow-query capture.
#[derive(Debug, Clone, Default)]
pub struct RequestEnd {
    /// Cumulative queries executed during the request.
    pub query_count: i64,
    /// Peak memory reading at request end, in bytes.
    pub peak_memory_bytes: i64,
    /// Ordered per-request query timings, when the host records them.
    pub query_log: Option<Vec<QueryTiming>>,
}

/// One entry from the host's per-request query log.
#[derive(Debug, Clone)]
pub struct QueryTiming {
    pub sql: String,
    pub duration_ms: f64,
}

// ─── In-flight capture ───────────────────────────────────────────

/// The capture context for one admitted request. Owned by that request's
/// execution context and passed explicitly from `begin` to `finish`;
/// never shared between concurrent requests.
#[derive(Debug)]
pub struct InFlightSample {
    started: Instant,
    url_path: String,
    http_method: String,
    user_id: i64,
    user_roles: Vec<String>,
    plugins_hash: String,
    theme_slug: String,
    is_ajax: bool,
    is_heartbeat: bool,
    screen_id: String,
    hook_suffix: String,
}

impl InFlightSample {
    /// Record the logical screen once the host resolves it mid-request.
    /// Only the first call takes effect; if the host never calls this,
    /// both identifiers stay empty.
    pub fn resolve_screen(&mut self, screen_id: &str, hook_suffix: &str) {
        if self.screen_id.is_empty() && self.hook_suffix.is_empty() {
            self.screen_id = screen_id.to_owned();
            self.hook_suffix = hook_suffix.to_owned();
        }
    }
}

// ─── Recorder ────────────────────────────────────────────────────

/// Decides per-request whether to capture, measures, and persists.
/// Both phases are fire-and-forget from the host's perspective: nothing
/// here may abort or delay the request being measured.
pub struct SampleRecorder {
    store: Arc<SampleStore>,
}

impl SampleRecorder {
    pub fn new(store: Arc<SampleStore>) -> Self {
        Self { store }
    }

    /// Admission: invoked once, early in an admin request. Returns the
    /// capture context when the request is admitted, `None` otherwise.
    pub fn begin(&self, settings: &Settings, request: RequestStart) -> Option<InFlightSample> {
        self.begin_with(settings, request, &mut rand::thread_rng())
    }

    fn begin_with(
        &self,
        settings: &Settings,
        request: RequestStart,
        rng: &mut impl Rng,
    ) -> Option<InFlightSample> {
        if !settings.enabled {
            return None;
        }
        if request.is_ajax && settings.ignore_ajax {
            return None;
        }
        if request.is_heartbeat && settings.ignore_heartbeat {
            return None;
        }

        // Uniform draw in [1, 100]; admit iff within the sampling rate.
        // Independent across requests, no memory of prior draws.
        let draw: i64 = rng.gen_range(1..=100);
        if draw > settings.sample_rate_percent {
            return None;
        }

        Some(InFlightSample {
            started: Instant::now(),
            url_path: strip_query(&request.url_path).to_owned(),
            http_method: request.http_method,
            user_id: request.user_id,
            user_roles: request.user_roles,
            plugins_hash: plugins_hash(&request.active_plugins),
            theme_slug: request.theme_slug,
            is_ajax: request.is_ajax,
            is_heartbeat: request.is_heartbeat,
            screen_id: String::new(),
            hook_suffix: String::new(),
        })
    }

    /// Completion: invoked once at request teardown, whether the request
    /// succeeded or errored. Persists one sample row plus any qualifying
    /// slow queries. Persistence failures are logged and swallowed.
    pub fn finish(&self, settings: &Settings, sample: InFlightSample, end: RequestEnd) {
        let load_ms = (sample.started.elapsed().as_secs_f64() * 1_000.0).round() as i64;
        let recorded_at = Utc::now().timestamp_millis();

        let row = NewSample {
            recorded_at,
            url_path: sample.url_path,
            screen_id: sample.screen_id,
            hook_suffix: sample.hook_suffix,
            http_method: sample.http_method,
            user_id: sample.user_id,
            user_roles: sample.user_roles,
            load_ms: load_ms.max(0),
            query_count: end.query_count.max(0),
            peak_memory_bytes: end.peak_memory_bytes.max(0),
            plugins_hash: sample.plugins_hash,
            theme_slug: sample.theme_slug,
            is_ajax: sample.is_ajax,
            is_heartbeat: sample.is_heartbeat,
        };

        let sample_id = match self.store.insert_sample(&row) {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "sample insert failed, measurement dropped");
                return;
            }
        };

        if !settings.log_slow_queries_if_available {
            return;
        }
        let Some(query_log) = end.query_log else {
            return;
        };

        let threshold = settings.slow_query_ms_threshold as f64;
        let slow: Vec<NewSlowQuery> = query_log
            .into_iter()
            .filter(|q| q.duration_ms >= threshold)
            .map(|q| NewSlowQuery {
                recorded_at,
                query_ms: q.duration_ms,
                query_text: normalize_query_text(&q.sql),
            })
            .collect();
        if slow.is_empty() {
            return;
        }

        if let Err(err) = self.store.insert_slow_queries(sample_id, &slow) {
            warn!(error = %err, sample_id, "slow-query insert failed");
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

/// Path with any query string removed.
fn strip_query(path: &str) -> &str {
    match path.split_once('?') {
        Some((path, _)) => path,
        None => path,
    }
}

/// Hex SHA-256 over the sorted plugin list. Deterministic for the same
/// active set regardless of input order; entries are NUL-delimited so
/// adjacent names cannot run together.
pub fn plugins_hash(active_plugins: &[String]) -> String {
    let mut sorted: Vec<&str> = active_plugins.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for plugin in sorted {
        hasher.update(plugin.as_bytes());
        hasher.update([0u8]);
    }
    hex_encode(&hasher.finalize())
}

/// Lowercase hex encoding of digest bytes.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

/// Collapse whitespace runs to single spaces, trim, and cut at
/// `MAX_QUERY_TEXT_CHARS` with a trailing marker.
fn normalize_query_text(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut text: String = collapsed.chars().take(MAX_QUERY_TEXT_CHARS).collect();
    if collapsed.chars().count() > MAX_QUERY_TEXT_CHARS {
        text.push(TRUNCATION_MARKER);
    }
    text
}

// ─── Tests ───────────────────────────────────────────────────────
