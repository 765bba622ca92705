mod archive;
mod insights;

pub use archive::{ArchivedReport, ReportArchive};
pub use insights::{HistoricalContext, RecentLot};
