//! JSON export sink.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use catlyst_ingest::{EnrichmentReport, IncidentId, RunOutput, RunSummary, flatten_record};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct ExportDocument<'a> {
    pub metadata: Metadata<'a>,
    pub threats: Vec<Value>,
    pub enrichment: Vec<EnrichmentEntry<'a>>,
}

#[derive(Debug, Serialize)]
pub struct Metadata<'a> {
    pub generated_at: DateTime<Utc>,
    pub num_threats: usize,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub verdicts: &'a [String],
    pub summary: &'a RunSummary,
}

#[derive(Debug, Serialize)]
pub struct EnrichmentEntry<'a> {
    pub incident_id: &'a IncidentId,
    #[serde(flatten)]
    pub report: &'a EnrichmentReport,
}

impl<'a> ExportDocument<'a> {
    #[must_use]
    pub fn from_run(output: &'a RunOutput, generated_at: DateTime<Utc>, flatten: bool) -> Self {
        let threats = output
            .records
            .iter()
            .map(|r| {
                if flatten {
                    Value::Object(flatten_record(&r.record))
                } else {
                    r.record.clone()
                }
            })
            .collect();
        let enrichment = output
            .records
            .iter()
            .map(|r| EnrichmentEntry {
                incident_id: &r.incident_id,
                report: &r.enrichment,
            })
            .collect();

        Self {
            metadata: Metadata {
                generated_at,
                num_threats: output.records.len(),
                since: output.window.since(),
                until: output.window.until(),
                verdicts: output.window.verdicts(),
                summary: &output.summary,
            },
            threats,
            enrichment,
        }
    }
}

/// Write the run to `path` as pretty JSON, creating parent directories.
///
/// # Errors
/// Fails if the directory cannot be created or the file written.
pub fn write_export(path: &Path, output: &RunOutput, flatten: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }
    let document = ExportDocument::from_run(output, Utc::now(), flatten);
    let json = serde_json::to_vec_pretty(&document).context("serializing export")?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
