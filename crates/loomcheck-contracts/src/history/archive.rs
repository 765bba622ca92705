use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::report::{InspectionReport, LotStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedReport {
    pub report: InspectionReport,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub image_paths: Vec<String>,
    #[serde(default)]
    pub saved_at: String,
}

/// JSON file of saved reports keyed by `po_number@report_timestamp`.
///
/// Writes merge only the keys this instance touched into whatever is on disk,
/// so two processes saving different reports do not clobber each other.
#[derive(Debug, Clone)]
pub struct ReportArchive {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl ReportArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> anyhow::Result<Option<ArchivedReport>> {
        let payload = self.ensure_loaded()?;
        payload
            .get(key)
            .cloned()
            .map(|value| {
                serde_json::from_value::<ArchivedReport>(value)
                    .with_context(|| format!("archived report '{key}' is malformed"))
            })
            .transpose()
    }

    pub fn upsert(&mut self, mut record: ArchivedReport) -> anyhow::Result<String> {
        let key = record.report.report_key();
        if record.saved_at.is_empty() {
            record.saved_at = now_utc_iso();
        }
        let value = serde_json::to_value(&record)?;
        let payload = self.ensure_loaded()?;
        payload.insert(key.clone(), value);
        if !self.dirty_keys.contains(&key) {
            self.dirty_keys.push(key.clone());
        }
        self.flush()?;
        Ok(key)
    }

    /// Records, newest report timestamp first. Malformed rows are skipped.
    pub fn list(&mut self) -> anyhow::Result<Vec<ArchivedReport>> {
        let payload = self.ensure_loaded()?;
        let mut rows: Vec<ArchivedReport> = payload
            .values()
            .filter_map(|value| serde_json::from_value::<ArchivedReport>(value.clone()).ok())
            .collect();
        rows.sort_by(|left, right| {
            right
                .report
                .inspection_header
                .report_timestamp
                .cmp(&left.report.inspection_header.report_timestamp)
        });
        Ok(rows)
    }

    pub fn reports(&mut self) -> anyhow::Result<Vec<InspectionReport>> {
        Ok(self.list()?.into_iter().map(|row| row.report).collect())
    }

    pub fn update_lot_status(
        &mut self,
        key: &str,
        status: LotStatus,
        reviewer: &str,
    ) -> anyhow::Result<ArchivedReport> {
        let mut record = self
            .get(key)?
            .ok_or_else(|| anyhow!("no archived report with key '{key}'"))?;
        record
            .report
            .apply_review(status, reviewer, &now_utc_iso());
        self.upsert(record.clone())?;
        Ok(record)
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }
        let Some(payload) = &self.payload else {
            return Ok(());
        };

        let mut on_disk = read_json_object(&self.path)?.unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> anyhow::Result<&mut Map<String, Value>> {
        let mut fresh = read_json_object(&self.path)?.unwrap_or_default();
        if let Some(local) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = local.get(key) {
                    fresh.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(self.payload.insert(fresh))
    }
}

fn read_json_object(path: &Path) -> anyhow::Result<Option<Map<String, Value>>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()))
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("report archive {} is not valid JSON", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(anyhow!(
            "report archive {} must contain a JSON object",
            path.display()
        )),
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )
    .with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
