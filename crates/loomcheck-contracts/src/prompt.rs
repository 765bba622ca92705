use serde_json::{json, Value};

use crate::history::HistoricalContext;
use crate::report::InspectionMeta;

/// System instruction sent with every inspection request.
pub const SYSTEM_PROMPT: &str = include_str!("../resources/system_prompt.md");

pub const CONTEXT_PACKET_HEADER: &str = "INSPECTION_CONTEXT_JSON:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardKind {
    Accepted,
    Rejected,
}

impl StandardKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED STANDARD",
            Self::Rejected => "REJECTED STANDARD",
        }
    }
}

/// Text part placed immediately before a reference standard image.
pub fn reference_label(kind: StandardKind, index: usize, item_name: Option<&str>) -> String {
    let item = item_name
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("this item");
    format!(
        "{} reference image {} for {}. This is not an inspection image.",
        kind.label(),
        index + 1,
        item
    )
}

/// Final text part: the JSON context packet followed by the task instructions.
pub fn render_request_context(
    meta: &InspectionMeta,
    report_timestamp: &str,
    history: &HistoricalContext,
    image_count: usize,
    reference_count: usize,
) -> String {
    let packet = json!({
        "inspection_metadata": {
            "supplier_name": meta.supplier_name,
            "po_number": meta.po_number,
            "batch_number": meta.batch_number,
            "lot_number": meta.lot_number,
            "inspector_name": meta.inspector_name,
            "item_name": meta.item_name,
            "work_station": meta.work_station,
            "inspection_date": meta.inspection_date,
            "report_timestamp": report_timestamp,
            "notes": meta.notes,
        },
        "historical_context": serde_json::to_value(history).unwrap_or(Value::Null),
        "inspection_image_count": image_count,
        "reference_image_count": reference_count,
    });

    let mut instructions = format!(
        "Inspect the {image_count} inspection image(s) provided above, in order, and produce the \
         JSON report followed by the summary exactly as specified in your instructions."
    );
    if reference_count > 0 {
        instructions.push_str(
            " Reference standard images were supplied before the inspection images; compare the \
             inspection images against them explicitly in the summary.",
        );
    }
    if history.supplier.is_none() {
        instructions.push_str(" No inspection history is available for this supplier.");
    }

    format!("{CONTEXT_PACKET_HEADER}\n{packet}\n\n{instructions}")
}
