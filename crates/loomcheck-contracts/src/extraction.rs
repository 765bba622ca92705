use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::report::InspectionReport;

const CODE_FENCE_TAGGED: &str = "```json";
const CODE_FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("no JSON object found in model response")]
    NoJsonFound,
    #[error("failed to parse inspection report from model response: {message}")]
    ReportParseFailure { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutput {
    pub payload: Map<String, Value>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInspection {
    pub report: InspectionReport,
    pub summary: String,
}

pub fn strip_code_fences(raw: &str) -> String {
    raw.replace(CODE_FENCE_TAGGED, "").replace(CODE_FENCE, "")
}

/// Byte index of the brace closing the object opened at `start`.
pub fn find_balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth: i64 = 0;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Pull the JSON object and trailing prose summary out of raw model text.
/// The balanced scan counts raw braces without tracking string literals, so
/// an unmatched brace inside a string value ends it early; the greedy
/// first-`{`-to-last-`}` fallback recovers those payloads.
pub fn extract_structured_output(raw: &str) -> Result<StructuredOutput, ExtractError> {
    let cleaned = strip_code_fences(raw);
    let Some(start) = cleaned.find('{') else {
        return Err(ExtractError::NoJsonFound);
    };

    let primary_error = match find_balanced_object_end(&cleaned, start) {
        Some(end) => {
            let block = &cleaned[start..=end];
            match parse_lenient_object(block) {
                Ok(payload) => {
                    return Ok(StructuredOutput {
                        payload,
                        summary: cleaned[end + 1..].trim().to_string(),
                    })
                }
                Err(err) => err,
            }
        }
        None => "unbalanced braces in model response".to_string(),
    };

    let Some(found) = greedy_object_pattern().find(&cleaned) else {
        return Err(ExtractError::ReportParseFailure {
            message: primary_error,
        });
    };
    match parse_lenient_object(found.as_str()) {
        Ok(payload) => {
            let mut summary = String::with_capacity(cleaned.len() - found.len());
            summary.push_str(&cleaned[..found.start()]);
            summary.push_str(&cleaned[found.end()..]);
            Ok(StructuredOutput {
                payload,
                summary: summary.trim().to_string(),
            })
        }
        Err(fallback_error) => Err(ExtractError::ReportParseFailure {
            message: if fallback_error == primary_error {
                fallback_error
            } else {
                format!("{fallback_error} (balanced scan: {primary_error})")
            },
        }),
    }
}

pub fn parse_inspection_output(raw: &str) -> Result<ParsedInspection, ExtractError> {
    let StructuredOutput { payload, summary } = extract_structured_output(raw)?;
    let report = serde_json::from_value::<InspectionReport>(Value::Object(payload)).map_err(
        |err| ExtractError::ReportParseFailure {
            message: format!("report does not match schema: {err}"),
        },
    )?;
    Ok(ParsedInspection { report, summary })
}

fn parse_lenient_object(block: &str) -> Result<Map<String, Value>, String> {
    match json5::from_str::<Value>(block) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, found {}", kind_of(&other))),
        Err(err) => Err(err.to_string()),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn greedy_object_pattern() -> &'static Regex {
    static GREEDY_OBJECT: OnceLock<Regex> = OnceLock::new();
    GREEDY_OBJECT.get_or_init(|| Regex::new(r"\{[\s\S]*\}").expect("greedy object regex compiles"))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::report::{
        BoundingBox, Defect, ImageResult, ImageStatus, InspectionHeader, InspectionReport,
        LotAssessment, LotStatus, OcrResult, Overlay, PartyStats, PerformanceInsights, Severity,
    };

    use super::*;

    fn sample_report() -> InspectionReport {
        let mut fields = Map::new();
        fields.insert("style_no".to_string(), json!("ST-4410"));
        InspectionReport {
            inspection_header: InspectionHeader {
                supplier_name: "Acme Mills".to_string(),
                po_number: "PO-2231".to_string(),
                batch_number: Some("B-7".to_string()),
                lot_number: None,
                inspector_name: "R. Okafor".to_string(),
                item_name: Some("Denim jacket".to_string()),
                work_station: Some("Line 3".to_string()),
                inspection_date: "2026-04-02".to_string(),
                report_timestamp: "2026-04-02T08:15:00Z".to_string(),
            },
            images: vec![ImageResult {
                image_index: 0,
                ocr: OcrResult {
                    raw_text: "ST-4410 100% cotton".to_string(),
                    fields,
                },
                detected_items: vec!["jacket".to_string(), "care label".to_string()],
                defects: vec![Defect {
                    class: "stain".to_string(),
                    category: "appearance".to_string(),
                    severity: Severity::Major,
                    description: "oil stain on left sleeve".to_string(),
                    count: 2,
                    locations: vec![BoundingBox([0.12, 0.4, 0.1, 0.08])],
                }],
                status: ImageStatus::Accepted,
                overlays: vec![Overlay {
                    label: "stain".to_string(),
                    severity: Some(Severity::Major),
                    bbox: BoundingBox([0.12, 0.4, 0.1, 0.08]),
                }],
            }],
            lot_assessment: LotAssessment {
                lot_status: LotStatus::AcceptWithRemarks,
                critical_defects_present: false,
                total_defects: Some(2),
                ..LotAssessment::default()
            },
            performance_insights: Some(PerformanceInsights {
                supplier: Some(PartyStats {
                    name: "Acme Mills".to_string(),
                    lots_inspected: 12,
                    rejected_lots: 1,
                    historical_avg_defect_rate: 8.5,
                }),
                inspector: None,
                commentary: Some("Stable supplier.".to_string()),
            }),
            extra: Map::new(),
        }
    }

    #[test]
    fn report_and_summary_survive_extraction() -> anyhow::Result<()> {
        let report = sample_report();
        let summary = "  The lot shows one major stain. Acceptable with remarks.\n";
        let raw = format!("{}\n\n{}", serde_json::to_string(&report)?, summary);

        let parsed = parse_inspection_output(&raw)?;
        assert_eq!(parsed.report, report);
        assert_eq!(parsed.summary, summary.trim());
        Ok(())
    }

    #[test]
    fn code_fences_do_not_change_the_result() -> anyhow::Result<()> {
        let report = sample_report();
        let body = format!("{}\n\nLooks acceptable.", serde_json::to_string_pretty(&report)?);
        let plain = parse_inspection_output(&body)?;

        for wrapped in [
            format!("```json\n{body}\n```"),
            format!("```\n{body}\n```"),
            format!("```json\n{}\n```\n\nLooks acceptable.", serde_json::to_string_pretty(&report)?),
        ] {
            let fenced = parse_inspection_output(&wrapped)?;
            assert_eq!(fenced, plain);
        }
        Ok(())
    }

    #[test]
    fn balanced_braces_inside_strings_are_tolerated() -> anyhow::Result<()> {
        let mut report = sample_report();
        report.images[0].defects[0].description = "print reads {LOT-7} and {size}".to_string();
        let raw = format!(
            "{}\nSummary mentions nothing odd.",
            serde_json::to_string(&report)?
        );
        let parsed = parse_inspection_output(&raw)?;
        assert_eq!(
            parsed.report.images[0].defects[0].description,
            "print reads {LOT-7} and {size}"
        );
        assert_eq!(parsed.summary, "Summary mentions nothing odd.");
        Ok(())
    }

    #[test]
    fn unmatched_brace_in_string_recovers_through_fallback() -> anyhow::Result<()> {
        let output = extract_structured_output(
            "{\"a\":1,\"b\":\"contains } brace\"}\n\nLooks good.",
        )?;
        assert_eq!(output.payload["a"].as_f64(), Some(1.0));
        assert_eq!(output.payload["b"], json!("contains } brace"));
        assert_eq!(output.summary, "Looks good.");
        Ok(())
    }

    #[test]
    fn decorative_braces_in_summary_do_not_leak_into_json() -> anyhow::Result<()> {
        let output = extract_structured_output(
            "Here you go: {\"lot\": \"ok\"}\nThe seams look fine }} overall :-}",
        )?;
        assert_eq!(output.payload["lot"], json!("ok"));
        assert_eq!(output.summary, "The seams look fine }} overall :-}");
        Ok(())
    }

    #[test]
    fn lenient_json_is_accepted() -> anyhow::Result<()> {
        let output = extract_structured_output(
            "{lot_status: 'reject', defects: [1, 2, 3,], }\nRejected for holes.",
        )?;
        assert_eq!(output.payload["lot_status"], json!("reject"));
        assert_eq!(
            output.payload["defects"].as_array().map(Vec::len),
            Some(3)
        );
        assert_eq!(output.summary, "Rejected for holes.");
        Ok(())
    }

    #[test]
    fn missing_object_is_no_json_found() {
        assert_eq!(
            extract_structured_output("The model declined to answer."),
            Err(ExtractError::NoJsonFound)
        );
        assert_eq!(
            parse_inspection_output("```json\n```").map(|parsed| parsed.summary),
            Err(ExtractError::NoJsonFound)
        );
    }

    #[test]
    fn garbage_object_is_a_parse_failure_not_a_default() {
        let err = extract_structured_output("{ this is : not [ json }").err();
        match err {
            Some(ExtractError::ReportParseFailure { message }) => assert!(!message.is_empty()),
            other => panic!("expected ReportParseFailure, got {other:?}"),
        }

        let unbalanced = extract_structured_output("{\"a\": {\"b\": 1}");
        assert!(matches!(
            unbalanced,
            Err(ExtractError::ReportParseFailure { .. })
        ));
    }

    #[test]
    fn schema_mismatch_is_a_parse_failure() {
        let raw = json!({
            "images": [{"defects": [{"class": "hole", "severity": "cosmetic"}]}]
        });
        let err = parse_inspection_output(&raw.to_string()).err();
        match err {
            Some(ExtractError::ReportParseFailure { message }) => {
                assert!(message.contains("report does not match schema"));
            }
            other => panic!("expected ReportParseFailure, got {other:?}"),
        }
    }

    #[test]
    fn loosely_typed_optional_fields_do_not_abort_parsing() -> anyhow::Result<()> {
        let parsed = parse_inspection_output(
            r#"{"inspection_header":{"po_number":2231,"lot_number":118},"images":[]}"#,
        )?;
        assert_eq!(parsed.report.inspection_header.lot_number.as_deref(), Some("118"));

        let parsed = parse_inspection_output(
            r#"{"images":[],"lot_assessment":{"lot_status":"accept","critical_defects_present":"false"}}"#,
        )?;
        assert!(!parsed.report.lot_assessment.critical_defects_present);

        let parsed = parse_inspection_output(
            r#"{"images":[{"overlays":[{"label":"slub","bbox":[0.2,0.2,0.1,0.1]}]}]}"#,
        )?;
        assert_eq!(parsed.report.images[0].overlays[0].bbox.x(), 0.2);
        Ok(())
    }

    #[test]
    fn balanced_scan_locates_outer_brace() {
        let text = "xx {\"a\": {\"b\": \"{}\"}} tail }";
        let start = text.find('{').unwrap_or_default();
        let end = find_balanced_object_end(text, start);
        assert_eq!(end.map(|idx| &text[start..=idx]), Some("{\"a\": {\"b\": \"{}\"}}"));
        assert_eq!(find_balanced_object_end("{ open", 0), None);
    }

    #[test]
    fn payload_keeps_nested_structure() -> anyhow::Result<()> {
        let output = extract_structured_output("{\"x\": {\"y\": [true, null]}}")?;
        assert_eq!(output.payload["x"]["y"], Value::Array(vec![json!(true), Value::Null]));
        assert_eq!(output.summary, "");
        Ok(())
    }
}
