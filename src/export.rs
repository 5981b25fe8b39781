use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::report::{self, Detail, Report};
use crate::settings::Settings;
use crate::store::{SampleStore, StoreError};

// ─── Export document ─────────────────────────────────────────────

/// The portable on-demand download: current settings plus the expanded
/// report, stamped with when and where it was generated. Nothing here
/// is computed independently; it is a serialization of the aggregator's
/// output and the settings record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    /// Generation time, UTC, ISO-8601.
    pub generated_at: String,
    pub site_url: String,
    pub settings: Settings,
    /// Full report over the retention window, recent samples included.
    pub stats: Report,
}

impl ExportDocument {
    /// Encode as pretty-printed JSON, the document's wire form.
    pub fn to_pretty_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Assemble the export document over the full retention window.
pub fn export(
    store: &SampleStore,
    settings: &Settings,
    site_url: &str,
) -> Result<ExportDocument, StoreError> {
    let now = Utc::now();
    let since = settings.retention_cutoff_ms(now.timestamp_millis());
    let stats = report::compute(store, settings, since, Detail::Expanded)?;

    Ok(ExportDocument {
        generated_at: now.to_rfc3339(),
        site_url: site_url.to_owned(),
        settings: settings.clone(),
        stats,
    })
}

// ─── Tests ───────────────────────────────────────────────────────
