//! Performance sampling and reporting for a host application's admin
//! surface.
//!
//! A configurable fraction of admin requests is admitted at request
//! start; each admitted request is measured (wall time, query count,
//! peak memory) and persisted at request end, together with any
//! over-threshold queries when the host records per-query timings.
//! Samples live in a bounded rolling window pruned by a daily sweep,
//! and reports aggregate whatever the window currently holds.
//!
//! The host wires the pieces together around one shared [`SampleStore`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use admin_pulse::{
//!     report, Detail, RequestEnd, RequestStart, SampleRecorder, SampleStore,
//!     SettingsStore,
//! };
//!
//! # fn main() -> Result<(), admin_pulse::StoreError> {
//! let store = Arc::new(SampleStore::open("admin-pulse.db")?);
//! let settings = SettingsStore::new(store.clone()).load()?;
//! let recorder = SampleRecorder::new(store.clone());
//!
//! // Early in an admin request:
//! let in_flight = recorder.begin(&settings, RequestStart {
//!     url_path: "/admin/orders?page=2".into(),
//!     http_method: "GET".into(),
//!     user_id: 7,
//!     user_roles: vec!["manager".into()],
//!     active_plugins: vec!["inventory".into(), "billing".into()],
//!     theme_slug: "storefront".into(),
//!     is_ajax: false,
//!     is_heartbeat: false,
//! });
//!
//! // ... the request runs; at teardown:
//! if let Some(sample) = in_flight {
//!     recorder.finish(&settings, sample, RequestEnd {
//!         query_count: 42,
//!         peak_memory_bytes: 48 << 20,
//!         query_log: None,
//!     });
//! }
//!
//! // On demand, from the report view:
//! let since = settings.retention_cutoff_ms(chrono::Utc::now().timestamp_millis());
//! let stats = report::compute(&store, &settings, since, Detail::Summary)?;
//! println!("p95 ≈ {} ms", stats.p95_load_ms_estimate);
//! # Ok(())
//! # }
//! ```

pub mod export;
pub mod recorder;
pub mod report;
pub mod settings;
pub mod store;
pub mod sweeper;

pub use export::{export, ExportDocument};
pub use recorder::{
    plugins_hash, InFlightSample, QueryTiming, RequestEnd, RequestStart, SampleRecorder,
};
pub use report::{Detail, Report};
pub use settings::{Settings, SettingsStore, SettingsUpdate};
pub use store::{
    NewSample, NewSlowQuery, PageGroupRow, SampleRow, SampleStore, SlowQueryHit, StoreError,
};
pub use sweeper::{sweep, SweepOutcome};
