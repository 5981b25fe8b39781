use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::settings::{Settings, SettingsStore};
use crate::store::{SampleStore, StoreError};

// ─── Configuration ───────────────────────────────────────────────

/// One sweep deletes at most this many samples; a bigger backlog waits
/// for the next scheduled run so a single sweep cannot stall.
pub const SWEEP_BATCH_LIMIT: usize = 5_000;

/// The fixed sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// ─── Sweeping ────────────────────────────────────────────────────

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub deleted_samples: usize,
    pub deleted_slow_queries: usize,
}

/// Delete samples (and their slow-query children) that have aged out of
/// the retention window. Idempotent: with no qualifying rows this is a
/// no-op. A batch/background operation; never call it from a
/// request-serving path.
pub fn sweep(store: &SampleStore, settings: &Settings) -> Result<SweepOutcome, StoreError> {
    let cutoff = settings.retention_cutoff_ms(Utc::now().timestamp_millis());
    sweep_before(store, cutoff)
}

/// Sweep against an explicit cutoff. Rows recorded at or after the
/// cutoff are retained; only strictly older rows are deleted.
pub fn sweep_before(store: &SampleStore, cutoff_ms: i64) -> Result<SweepOutcome, StoreError> {
    let ids = store.stale_sample_ids(cutoff_ms, SWEEP_BATCH_LIMIT)?;
    if ids.is_empty() {
        return Ok(SweepOutcome::default());
    }
    let (deleted_slow_queries, deleted_samples) = store.delete_samples_with_children(&ids)?;
    Ok(SweepOutcome {
        deleted_samples,
        deleted_slow_queries,
    })
}

/// Background loop: sweeps once per day (first tick immediately) until
/// the `running` flag clears. Settings are reloaded on every tick so a
/// retention change takes effect without a restart.
pub async fn run(
    store: Arc<SampleStore>,
    settings_store: SettingsStore,
    running: Arc<AtomicBool>,
) {
    let mut ticks = IntervalStream::new(tokio::time::interval(SWEEP_INTERVAL));

    while ticks.next().await.is_some() {
        if !running.load(Ordering::Relaxed) {
            break;
        }

        let settings = match settings_store.load() {
            Ok(settings) => settings,
            Err(err) => {
                warn!(error = %err, "sweep skipped, settings unavailable");
                continue;
            }
        };

        // Deletes run on the blocking pool; the daily batch must not sit
        // on an async worker thread.
        let store = store.clone();
        let result =
            tokio::task::spawn_blocking(move || sweep(&store, &settings)).await;

        match result {
            Ok(Ok(outcome)) if outcome.deleted_samples > 0 => {
                info!(
                    deleted_samples = outcome.deleted_samples,
                    deleted_slow_queries = outcome.deleted_slow_queries,
                    "retention sweep pruned stale samples"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "retention sweep failed"),
            Err(err) => warn!(error = %err, "retention sweep task failed"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────
