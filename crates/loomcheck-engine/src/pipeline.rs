use std::collections::HashSet;

use chrono::{SecondsFormat, Utc};
use loomcheck_contracts::events::{EventWriter, InspectionEvent};
use loomcheck_contracts::extraction::parse_inspection_output;
use loomcheck_contracts::history::HistoricalContext;
use loomcheck_contracts::report::{InspectionHeader, InspectionMeta, InspectionReport};
use serde::Serialize;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::InspectError;
use crate::images::{normalize_all, ImageSource, NormalizedImage};
use crate::provider::{GeminiClient, ModelTransport};
use crate::request::{assemble_request, normalize_references, ReferenceStandards};
use crate::retry::retry_with_backoff;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectionOutcome {
    pub report: InspectionReport,
    pub summary: String,
    /// Non-fatal notes: retries, corrected fields, skipped references.
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    /// SHA-256 of each image that was sent, in request order.
    pub image_fingerprints: Vec<String>,
}

/// Runs one inspection end to end. Holds no per-request state, so a single
/// pipeline may serve concurrent calls.
pub struct InspectionPipeline {
    config: Config,
    transport: Box<dyn ModelTransport>,
    events: Option<EventWriter>,
}

impl InspectionPipeline {
    pub fn new(config: Config, transport: Box<dyn ModelTransport>) -> Self {
        Self {
            config,
            transport,
            events: None,
        }
    }

    /// Pipeline backed by the Gemini client described by `config`.
    pub fn from_config(config: Config) -> Self {
        let client = GeminiClient::new(
            &config.api_base,
            config.api_key.clone().unwrap_or_default(),
            config.request_timeout,
        );
        Self::new(config, Box::new(client))
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn analyze(
        &self,
        images: &[ImageSource],
        meta: &InspectionMeta,
        history: &[InspectionReport],
        standards: Option<&ReferenceStandards>,
        cancel: &CancelToken,
    ) -> Result<InspectionOutcome, InspectError> {
        let report_timestamp = now_utc_iso();
        self.run(images, meta, &report_timestamp, history, standards, cancel)
    }

    /// Re-inspect a lot with additional images. `images` is the full set
    /// (previous plus new); duplicates are sent once. The result keeps the
    /// identity of `existing`.
    pub fn append(
        &self,
        existing: &InspectionReport,
        images: &[ImageSource],
        history: &[InspectionReport],
        standards: Option<&ReferenceStandards>,
        cancel: &CancelToken,
    ) -> Result<InspectionOutcome, InspectError> {
        let header = &existing.inspection_header;
        let meta = meta_from_header(header);
        let existing_key = header.report_key();
        let history: Vec<InspectionReport> = history
            .iter()
            .filter(|report| report.report_key() != existing_key)
            .cloned()
            .collect();
        let mut outcome = self.run(
            images,
            &meta,
            &header.report_timestamp,
            &history,
            standards,
            cancel,
        )?;
        outcome.report.adopt_identity(header);
        Ok(outcome)
    }

    fn run(
        &self,
        images: &[ImageSource],
        meta: &InspectionMeta,
        report_timestamp: &str,
        history: &[InspectionReport],
        standards: Option<&ReferenceStandards>,
        cancel: &CancelToken,
    ) -> Result<InspectionOutcome, InspectError> {
        if !self.config.has_api_key() {
            return Err(InspectError::MissingApiKey);
        }
        if images.is_empty() {
            return Err(InspectError::NoImages);
        }
        let missing = meta.missing_fields();
        if !missing.is_empty() {
            return Err(InspectError::InvalidRequest(format!(
                "missing {}",
                missing.join(", ")
            )));
        }

        let mut warnings = Vec::new();
        self.emit(
            InspectionEvent::InspectionStarted {
                po_number: meta.po_number.clone(),
                supplier_name: meta.supplier_name.clone(),
                image_count: images.len(),
                model: self.config.model.clone(),
                provider: self.transport.name().to_string(),
            },
            &mut warnings,
        );

        match self.inspect(images, meta, report_timestamp, history, standards, cancel, &mut warnings) {
            Ok(outcome) => {
                let report = &outcome.report;
                let mut event_warnings = Vec::new();
                self.emit(
                    InspectionEvent::InspectionCompleted {
                        report_key: report.report_key(),
                        lot_status: report.lot_assessment.lot_status,
                        total_defects: report.total_defects(),
                        image_results: report.images.len(),
                        warnings: outcome.warnings.len(),
                    },
                    &mut event_warnings,
                );
                let mut outcome = outcome;
                outcome.warnings.extend(event_warnings);
                Ok(outcome)
            }
            Err(err) => {
                // No outcome carries warnings past this point.
                let mut event_warnings = Vec::new();
                self.emit(
                    InspectionEvent::InspectionFailed {
                        po_number: meta.po_number.clone(),
                        error: err.to_string(),
                        status_code: err.status_code(),
                        transient: err.is_transient(),
                    },
                    &mut event_warnings,
                );
                for warning in &event_warnings {
                    eprintln!("loomcheck warning: {warning}");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn inspect(
        &self,
        images: &[ImageSource],
        meta: &InspectionMeta,
        report_timestamp: &str,
        history: &[InspectionReport],
        standards: Option<&ReferenceStandards>,
        cancel: &CancelToken,
        warnings: &mut Vec<String>,
    ) -> Result<InspectionOutcome, InspectError> {
        let limits = self.config.image_limits;
        let normalized = normalize_all(images, limits)
            .map_err(|(index, source)| InspectError::Image { index, source })?;
        let normalized = dedupe_by_fingerprint(normalized, warnings);
        cancel.check()?;

        let references = standards
            .map(|standards| normalize_references(standards, limits, warnings))
            .unwrap_or_default();
        self.emit(
            InspectionEvent::ImagesNormalized {
                inspection_images: normalized.len(),
                reference_images: references.len(),
                max_dimension: limits.max_dimension,
            },
            warnings,
        );
        cancel.check()?;

        let context =
            HistoricalContext::from_history(history, &meta.supplier_name, &meta.inspector_name);
        let request = assemble_request(
            &self.config,
            meta,
            report_timestamp,
            &context,
            &normalized,
            &references,
            standards.and_then(|standards| standards.item_name.as_deref()),
        );

        let mut retry_warnings = Vec::new();
        let mut event_warnings = Vec::new();
        let response = retry_with_backoff(
            &self.config.retry,
            cancel,
            InspectError::is_transient,
            &mut retry_warnings,
            |attempt| {
                if attempt > 0 {
                    self.emit(
                        InspectionEvent::ModelRetry {
                            attempt,
                            max_retries: self.config.retry.max_retries,
                        },
                        &mut event_warnings,
                    );
                }
                self.transport.generate(&request, cancel)
            },
        );
        warnings.extend(retry_warnings);
        warnings.extend(event_warnings);
        let response = response?;

        let parsed = parse_inspection_output(&response.text)?;
        let mut report = parsed.report;
        apply_request_identity(&mut report.inspection_header, meta, report_timestamp);
        if report.images.len() != normalized.len() {
            warnings.push(format!(
                "model returned {} image result(s) for {} inspection image(s).",
                report.images.len(),
                normalized.len()
            ));
        }
        warnings.extend(report.reconcile());

        Ok(InspectionOutcome {
            report,
            summary: parsed.summary,
            warnings: std::mem::take(warnings),
            usage: response.usage,
            image_fingerprints: normalized.into_iter().map(|image| image.sha256).collect(),
        })
    }

    /// Event log failures never fail an inspection; they surface as warnings.
    fn emit(&self, event: InspectionEvent, warnings: &mut Vec<String>) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(&event) {
            warnings.push(format!(
                "event log write failed ({}): {err:#}",
                event.event_type()
            ));
        }
    }
}

/// The caller's identifying metadata is authoritative over whatever the model
/// echoed back.
fn apply_request_identity(header: &mut InspectionHeader, meta: &InspectionMeta, report_timestamp: &str) {
    header.supplier_name = meta.supplier_name.trim().to_string();
    header.po_number = meta.po_number.trim().to_string();
    header.inspector_name = meta.inspector_name.trim().to_string();
    if meta.batch_number.is_some() {
        header.batch_number = meta.batch_number.clone();
    }
    if meta.lot_number.is_some() {
        header.lot_number = meta.lot_number.clone();
    }
    if meta.item_name.is_some() {
        header.item_name = meta.item_name.clone();
    }
    if meta.work_station.is_some() {
        header.work_station = meta.work_station.clone();
    }
    if let Some(date) = meta
        .inspection_date
        .as_deref()
        .map(str::trim)
        .filter(|date| !date.is_empty())
    {
        header.inspection_date = date.to_string();
    } else if header.inspection_date.trim().is_empty() {
        header.inspection_date = Utc::now().format("%Y-%m-%d").to_string();
    }
    header.report_timestamp = report_timestamp.to_string();
}

fn meta_from_header(header: &InspectionHeader) -> InspectionMeta {
    InspectionMeta {
        supplier_name: header.supplier_name.clone(),
        po_number: header.po_number.clone(),
        batch_number: header.batch_number.clone(),
        lot_number: header.lot_number.clone(),
        inspector_name: header.inspector_name.clone(),
        item_name: header.item_name.clone(),
        work_station: header.work_station.clone(),
        inspection_date: Some(header.inspection_date.clone()).filter(|date| !date.is_empty()),
        notes: None,
    }
}

fn dedupe_by_fingerprint(
    images: Vec<NormalizedImage>,
    warnings: &mut Vec<String>,
) -> Vec<NormalizedImage> {
    let mut seen = HashSet::new();
    let before = images.len();
    let unique: Vec<NormalizedImage> = images
        .into_iter()
        .filter(|image| seen.insert(image.sha256.clone()))
        .collect();
    if unique.len() < before {
        warnings.push(format!(
            "{} duplicate image(s) were sent once.",
            before - unique.len()
        ));
    }
    unique
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
