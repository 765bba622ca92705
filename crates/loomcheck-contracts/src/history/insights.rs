use serde::{Deserialize, Serialize};

use crate::report::{InspectionReport, LotStatus, PartyStats};

const RECENT_LOT_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentLot {
    pub po_number: String,
    pub inspection_date: String,
    pub lot_status: LotStatus,
    pub defect_rate: f64,
}

/// Rolling aggregates injected into the request so the model's commentary is
/// grounded in the caller's own history.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricalContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<PartyStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspector: Option<PartyStats>,
    #[serde(default)]
    pub recent_supplier_lots: Vec<RecentLot>,
}

impl HistoricalContext {
    pub fn from_history(history: &[InspectionReport], supplier: &str, inspector: &str) -> Self {
        let supplier_reports: Vec<&InspectionReport> = history
            .iter()
            .filter(|report| same_party(&report.inspection_header.supplier_name, supplier))
            .collect();
        let inspector_reports: Vec<&InspectionReport> = history
            .iter()
            .filter(|report| same_party(&report.inspection_header.inspector_name, inspector))
            .collect();

        let mut recent: Vec<&InspectionReport> = supplier_reports.clone();
        recent.sort_by(|left, right| {
            right
                .inspection_header
                .report_timestamp
                .cmp(&left.inspection_header.report_timestamp)
        });
        let recent_supplier_lots = recent
            .into_iter()
            .take(RECENT_LOT_LIMIT)
            .map(|report| RecentLot {
                po_number: report.inspection_header.po_number.clone(),
                inspection_date: report.inspection_header.inspection_date.clone(),
                lot_status: report.lot_assessment.lot_status,
                defect_rate: round2(report.defect_rate_percent()),
            })
            .collect();

        Self {
            supplier: party_stats(supplier, &supplier_reports),
            inspector: party_stats(inspector, &inspector_reports),
            recent_supplier_lots,
        }
    }
}

fn party_stats(name: &str, reports: &[&InspectionReport]) -> Option<PartyStats> {
    if reports.is_empty() {
        return None;
    }
    let rejected = reports.iter().filter(|report| report.is_rejected()).count();
    let rate_sum: f64 = reports
        .iter()
        .map(|report| report.defect_rate_percent())
        .sum();
    Some(PartyStats {
        name: name.trim().to_string(),
        lots_inspected: reports.len() as u32,
        rejected_lots: rejected as u32,
        historical_avg_defect_rate: round2(rate_sum / reports.len() as f64),
    })
}

fn same_party(left: &str, right: &str) -> bool {
    let right = right.trim();
    !right.is_empty() && left.trim().eq_ignore_ascii_case(right)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
