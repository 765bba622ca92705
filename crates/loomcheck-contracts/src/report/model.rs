use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::lenient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match normalize_token(&raw).as_str() {
            "minor" | "low" => Ok(Self::Minor),
            "major" | "medium" | "moderate" => Ok(Self::Major),
            "critical" | "high" | "severe" => Ok(Self::Critical),
            _ => Err(format!("unknown defect severity '{raw}'")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum ImageStatus {
    #[default]
    Accepted,
    AcceptedWithMinorDefects,
    Rejected,
}

impl ImageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::AcceptedWithMinorDefects => "accepted_with_minor_defects",
            Self::Rejected => "rejected",
        }
    }
}

impl TryFrom<String> for ImageStatus {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match normalize_token(&raw).as_str() {
            "accepted" | "accept" | "pass" => Ok(Self::Accepted),
            "accepted_with_minor_defects" | "accepted_with_defects" | "minor_defects" => {
                Ok(Self::AcceptedWithMinorDefects)
            }
            "rejected" | "reject" | "fail" => Ok(Self::Rejected),
            _ => Err(format!("unknown image status '{raw}'")),
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum LotStatus {
    #[default]
    Accept,
    AcceptWithRemarks,
    Reject,
}

impl LotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::AcceptWithRemarks => "accept_with_remarks",
            Self::Reject => "reject",
        }
    }
}

impl TryFrom<String> for LotStatus {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match normalize_token(&raw).as_str() {
            "accept" | "accepted" | "pass" => Ok(Self::Accept),
            "accept_with_remarks" | "accepted_with_remarks" | "conditional_accept" => {
                Ok(Self::AcceptWithRemarks)
            }
            "reject" | "rejected" | "fail" => Ok(Self::Reject),
            _ => Err(format!("unknown lot status '{raw}'")),
        }
    }
}

impl std::str::FromStr for LotStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::try_from(raw.to_string())
    }
}

impl fmt::Display for LotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize_token(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_")
}

/// Normalized `[x, y, w, h]` box, each component in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox(pub [f64; 4]);

impl BoundingBox {
    pub fn x(&self) -> f64 {
        self.0[0]
    }

    pub fn y(&self) -> f64 {
        self.0[1]
    }

    pub fn width(&self) -> f64 {
        self.0[2]
    }

    pub fn height(&self) -> f64 {
        self.0[3]
    }

    pub fn is_normalized(&self) -> bool {
        self.0.iter().all(|value| (0.0..=1.0).contains(value))
            && self.x() + self.width() <= 1.0 + f64::EPSILON
            && self.y() + self.height() <= 1.0 + f64::EPSILON
    }

    pub fn clamped(&self) -> Self {
        let x = self.x().clamp(0.0, 1.0);
        let y = self.y().clamp(0.0, 1.0);
        let width = self.width().clamp(0.0, 1.0 - x);
        let height = self.height().clamp(0.0, 1.0 - y);
        Self([x, y, width, height])
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InspectionHeader {
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub supplier_name: String,
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub po_number: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::string_opt_from_any"
    )]
    pub batch_number: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::string_opt_from_any"
    )]
    pub lot_number: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub inspector_name: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::string_opt_from_any"
    )]
    pub item_name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::string_opt_from_any"
    )]
    pub work_station: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub inspection_date: String,
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub report_timestamp: String,
}

impl InspectionHeader {
    /// Natural composite key: PO number plus report timestamp.
    pub fn report_key(&self) -> String {
        format!("{}@{}", self.po_number.trim(), self.report_timestamp.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OcrResult {
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub raw_text: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub class: String,
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub category: String,
    pub severity: Severity,
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub description: String,
    #[serde(default = "default_count", deserialize_with = "lenient::u32_from_any")]
    pub count: u32,
    #[serde(default)]
    pub locations: Vec<BoundingBox>,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(rename = "box", alias = "bbox", default)]
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageResult {
    #[serde(default, deserialize_with = "lenient::u32_from_any")]
    pub image_index: u32,
    #[serde(default)]
    pub ocr: OcrResult,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub detected_items: Vec<String>,
    #[serde(default)]
    pub defects: Vec<Defect>,
    #[serde(default)]
    pub status: ImageStatus,
    #[serde(default)]
    pub overlays: Vec<Overlay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectSummaryEntry {
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub class: String,
    #[serde(default, deserialize_with = "lenient::u32_from_any")]
    pub count: u32,
    #[serde(default, deserialize_with = "lenient::f64_from_any")]
    pub percentage: f64,
}

/// Record of a human reviewer overriding the model's lot verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotReview {
    pub reviewer: String,
    pub previous_status: LotStatus,
    pub reviewed_at: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LotAssessment {
    #[serde(default)]
    pub lot_status: LotStatus,
    #[serde(default)]
    pub defect_summary: Vec<DefectSummaryEntry>,
    #[serde(default, deserialize_with = "lenient::bool_from_any")]
    pub critical_defects_present: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::u32_opt_from_any"
    )]
    pub total_defects: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::string_opt_from_any"
    )]
    pub remarks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<LotReview>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartyStats {
    #[serde(default, deserialize_with = "lenient::string_from_any")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::u32_from_any")]
    pub lots_inspected: u32,
    #[serde(default, deserialize_with = "lenient::u32_from_any")]
    pub rejected_lots: u32,
    #[serde(default, deserialize_with = "lenient::f64_from_any")]
    pub historical_avg_defect_rate: f64,
}

/// Model-echoed rolling statistics. Advisory: the numbers come from the
/// model's own arithmetic over the supplied history.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceInsights {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<PartyStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspector: Option<PartyStats>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::string_opt_from_any"
    )]
    pub commentary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InspectionReport {
    #[serde(default)]
    pub inspection_header: InspectionHeader,
    #[serde(default)]
    pub images: Vec<ImageResult>,
    #[serde(default)]
    pub lot_assessment: LotAssessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_insights: Option<PerformanceInsights>,
    /// Fields the model emitted beyond the schema; kept so nothing is lost.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Caller-supplied identifying metadata for one inspection request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InspectionMeta {
    pub supplier_name: String,
    pub po_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lot_number: Option<String>,
    pub inspector_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_station: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspection_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl InspectionMeta {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.supplier_name.trim().is_empty() {
            missing.push("supplier_name");
        }
        if self.po_number.trim().is_empty() {
            missing.push("po_number");
        }
        if self.inspector_name.trim().is_empty() {
            missing.push("inspector_name");
        }
        missing
    }
}
