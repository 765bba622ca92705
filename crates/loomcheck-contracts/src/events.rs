use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::report::LotStatus;

/// One line of the inspection audit log. Serialized with its snake-case
/// variant name under `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InspectionEvent {
    InspectionStarted {
        po_number: String,
        supplier_name: String,
        image_count: usize,
        model: String,
        provider: String,
    },
    ImagesNormalized {
        inspection_images: usize,
        reference_images: usize,
        max_dimension: u32,
    },
    ModelRetry {
        attempt: u32,
        max_retries: u32,
    },
    InspectionCompleted {
        report_key: String,
        lot_status: LotStatus,
        total_defects: u32,
        image_results: usize,
        warnings: usize,
    },
    InspectionFailed {
        po_number: String,
        error: String,
        status_code: Option<u16>,
        transient: bool,
    },
    LotStatusUpdated {
        report_key: String,
        lot_status: LotStatus,
        previous_status: Option<LotStatus>,
        reviewer: String,
    },
}

impl InspectionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InspectionStarted { .. } => "inspection_started",
            Self::ImagesNormalized { .. } => "images_normalized",
            Self::ModelRetry { .. } => "model_retry",
            Self::InspectionCompleted { .. } => "inspection_completed",
            Self::InspectionFailed { .. } => "inspection_failed",
            Self::LotStatusUpdated { .. } => "lot_status_updated",
        }
    }

    /// Report key of the lot the event concerns, once one exists.
    pub fn report_key(&self) -> Option<&str> {
        match self {
            Self::InspectionCompleted { report_key, .. }
            | Self::LotStatusUpdated { report_key, .. } => Some(report_key),
            _ => None,
        }
    }
}

/// Append-only JSONL audit log. Every line is an `InspectionEvent` stamped
/// with the writer's `session_id` and a UTC `ts`. Clones share one lock, so
/// concurrent inspections never interleave lines.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<SharedLog>,
}

#[derive(Debug)]
struct SharedLog {
    path: PathBuf,
    session_id: String,
    append_lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(SharedLog {
                path: path.into(),
                session_id: session_id.into(),
                append_lock: Mutex::new(()),
            }),
        }
    }

    /// Append `event` and return the line as written.
    pub fn emit(&self, event: &InspectionEvent) -> anyhow::Result<Value> {
        let record = self.stamp(event)?;
        let line = serde_json::to_string(&record)?;
        self.append_line(&line)
            .with_context(|| format!("failed appending to {}", self.shared.path.display()))?;
        Ok(record)
    }

    fn stamp(&self, event: &InspectionEvent) -> anyhow::Result<Value> {
        let Value::Object(mut record) = serde_json::to_value(event)? else {
            bail!("{} did not serialize to an object", event.event_type());
        };
        record.insert(
            "session_id".to_string(),
            Value::String(self.shared.session_id.clone()),
        );
        record.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        Ok(Value::Object(record))
    }

    fn append_line(&self, line: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.shared.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self
            .shared
            .append_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shared.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn read_lines(path: &std::path::Path) -> anyhow::Result<Vec<Value>> {
        fs::read_to_string(path)?
            .lines()
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }

    #[test]
    fn completed_inspection_is_logged_with_its_report_key() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-7");

        let event = InspectionEvent::InspectionCompleted {
            report_key: "PO-1@2026-03-01T10:00:00.000Z".to_string(),
            lot_status: LotStatus::AcceptWithRemarks,
            total_defects: 3,
            image_results: 2,
            warnings: 0,
        };
        assert_eq!(event.report_key(), Some("PO-1@2026-03-01T10:00:00.000Z"));
        let written = writer.emit(&event)?;

        let lines = read_lines(&path)?;
        assert_eq!(lines, vec![written]);
        let line = &lines[0];
        assert_eq!(line["type"], "inspection_completed");
        assert_eq!(line["session_id"], "session-7");
        assert_eq!(line["report_key"], "PO-1@2026-03-01T10:00:00.000Z");
        assert_eq!(line["lot_status"], "accept_with_remarks");
        assert_eq!(line["total_defects"], 3);
        DateTime::parse_from_rfc3339(line["ts"].as_str().unwrap_or_default())?;
        Ok(())
    }

    #[test]
    fn serialized_type_matches_event_type() -> anyhow::Result<()> {
        let events = [
            InspectionEvent::ModelRetry {
                attempt: 1,
                max_retries: 3,
            },
            InspectionEvent::InspectionFailed {
                po_number: "PO-9".to_string(),
                error: "Model usage limit reached".to_string(),
                status_code: Some(429),
                transient: true,
            },
            InspectionEvent::LotStatusUpdated {
                report_key: "PO-9@t".to_string(),
                lot_status: LotStatus::Accept,
                previous_status: None,
                reviewer: "qa lead".to_string(),
            },
        ];
        for event in &events {
            let value = serde_json::to_value(event)?;
            assert_eq!(value["type"], event.event_type());
        }
        let failed = serde_json::to_value(&events[1])?;
        assert_eq!(failed["status_code"], 429);
        assert_eq!(events[0].report_key(), None);
        Ok(())
    }

    #[test]
    fn unwritable_log_path_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "not a directory")?;
        let writer = EventWriter::new(blocker.join("events.jsonl"), "session-7");

        let result = writer.emit(&InspectionEvent::ModelRetry {
            attempt: 1,
            max_retries: 3,
        });
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn clones_append_to_the_same_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-7");

        let handles: Vec<_> = (0..2u32)
            .map(|worker| {
                let writer = writer.clone();
                std::thread::spawn(move || -> anyhow::Result<()> {
                    for attempt in 0..10 {
                        writer.emit(&InspectionEvent::ModelRetry {
                            attempt: worker * 10 + attempt,
                            max_retries: 20,
                        })?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
        }

        let lines = read_lines(&path)?;
        assert_eq!(lines.len(), 20);
        assert!(lines.iter().all(|line| line["session_id"] == "session-7"));
        Ok(())
    }
}
