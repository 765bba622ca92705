pub mod lenient;
mod model;
mod status;

pub use model::{
    BoundingBox, Defect, DefectSummaryEntry, ImageResult, ImageStatus, InspectionHeader,
    InspectionMeta, InspectionReport, LotAssessment, LotReview, LotStatus, OcrResult, Overlay,
    PartyStats, PerformanceInsights, Severity,
};
