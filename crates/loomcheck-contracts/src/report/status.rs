use indexmap::IndexMap;

use super::model::{
    Defect, DefectSummaryEntry, ImageResult, ImageStatus, InspectionHeader, InspectionReport,
    LotReview, LotStatus, Severity,
};

impl ImageStatus {
    /// `rejected` iff any defect is critical, `accepted_with_minor_defects`
    /// iff every defect is minor, otherwise `accepted`.
    pub fn derive(defects: &[Defect]) -> Self {
        if defects
            .iter()
            .any(|defect| defect.severity == Severity::Critical)
        {
            return Self::Rejected;
        }
        if !defects.is_empty()
            && defects
                .iter()
                .all(|defect| defect.severity == Severity::Minor)
        {
            return Self::AcceptedWithMinorDefects;
        }
        Self::Accepted
    }
}

impl LotStatus {
    /// `reject` iff a critical defect is present or any image is rejected;
    /// `accept_with_remarks` when defects exist without forcing rejection.
    pub fn derive(images: &[ImageResult], critical_defects_present: bool) -> Self {
        if critical_defects_present
            || images
                .iter()
                .any(|image| image.status == ImageStatus::Rejected)
        {
            return Self::Reject;
        }
        if images.iter().any(|image| !image.defects.is_empty()) {
            return Self::AcceptWithRemarks;
        }
        Self::Accept
    }
}

impl ImageResult {
    pub fn has_critical_defect(&self) -> bool {
        self.defects
            .iter()
            .any(|defect| defect.severity == Severity::Critical)
    }

    pub fn defect_count(&self) -> u32 {
        self.defects.iter().map(|defect| defect.count.max(1)).sum()
    }
}

impl InspectionReport {
    pub fn report_key(&self) -> String {
        self.inspection_header.report_key()
    }

    pub fn total_defects(&self) -> u32 {
        self.images.iter().map(ImageResult::defect_count).sum()
    }

    /// Share of analyzed images carrying at least one defect, in percent.
    pub fn defect_rate_percent(&self) -> f64 {
        if self.images.is_empty() {
            return 0.0;
        }
        let defective = self
            .images
            .iter()
            .filter(|image| !image.defects.is_empty())
            .count();
        defective as f64 * 100.0 / self.images.len() as f64
    }

    pub fn is_rejected(&self) -> bool {
        self.lot_assessment.lot_status == LotStatus::Reject
    }

    /// One summary row per distinct defect class, first-seen order, with the
    /// share of all counted defects.
    pub fn summarize_defects(&self) -> Vec<DefectSummaryEntry> {
        let mut counts: IndexMap<String, u32> = IndexMap::new();
        for defect in self.images.iter().flat_map(|image| image.defects.iter()) {
            let class = defect.class.trim();
            let key = if class.is_empty() {
                "unclassified".to_string()
            } else {
                class.to_ascii_lowercase()
            };
            *counts.entry(key).or_insert(0) += defect.count.max(1);
        }
        let total: u32 = counts.values().sum();
        counts
            .into_iter()
            .map(|(class, count)| DefectSummaryEntry {
                class,
                count,
                percentage: if total == 0 {
                    0.0
                } else {
                    (f64::from(count) * 10_000.0 / f64::from(total)).round() / 100.0
                },
            })
            .collect()
    }

    /// Enforce the status invariants over model output. Returns one warning
    /// per field that had to be corrected.
    pub fn reconcile(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        for image in &mut self.images {
            for defect in &mut image.defects {
                for location in &mut defect.locations {
                    if !location.is_normalized() {
                        *location = location.clamped();
                        warnings.push(format!(
                            "image {}: defect '{}' location clamped into [0,1].",
                            image.image_index, defect.class
                        ));
                    }
                }
            }
            for overlay in &mut image.overlays {
                if !overlay.bbox.is_normalized() {
                    overlay.bbox = overlay.bbox.clamped();
                    warnings.push(format!(
                        "image {}: overlay '{}' clamped into [0,1].",
                        image.image_index, overlay.label
                    ));
                }
            }

            let derived = ImageStatus::derive(&image.defects);
            if image.status != derived {
                warnings.push(format!(
                    "image {}: status '{}' corrected to '{}'.",
                    image.image_index, image.status, derived
                ));
                image.status = derived;
            }
        }

        let critical = self.images.iter().any(ImageResult::has_critical_defect);
        let assessment = &mut self.lot_assessment;
        if assessment.critical_defects_present != critical {
            warnings.push(format!(
                "critical_defects_present corrected to {critical}."
            ));
            assessment.critical_defects_present = critical;
        }

        let must_reject = LotStatus::derive(&self.images, critical) == LotStatus::Reject;
        let corrected = match (must_reject, assessment.lot_status) {
            (true, LotStatus::Reject) | (false, LotStatus::Accept) => None,
            (false, LotStatus::AcceptWithRemarks) => None,
            (true, _) => Some(LotStatus::Reject),
            (false, LotStatus::Reject) => Some(LotStatus::derive(&self.images, false)),
        };
        if let Some(status) = corrected {
            warnings.push(format!(
                "lot_status '{}' corrected to '{}'.",
                assessment.lot_status, status
            ));
            assessment.lot_status = status;
        }

        if assessment.defect_summary.is_empty() && self.images.iter().any(|i| !i.defects.is_empty())
        {
            self.lot_assessment.defect_summary = self.summarize_defects();
            warnings.push("defect_summary was missing; derived from image defects.".to_string());
        }
        if self.lot_assessment.total_defects.is_none() {
            self.lot_assessment.total_defects = Some(self.total_defects());
        }

        warnings
    }

    /// Human override of the lot verdict; the only in-place mutation allowed
    /// after a report is created.
    pub fn apply_review(&mut self, status: LotStatus, reviewer: &str, reviewed_at: &str) {
        let previous_status = self
            .lot_assessment
            .review
            .as_ref()
            .map(|review| review.previous_status)
            .unwrap_or(self.lot_assessment.lot_status);
        self.lot_assessment.lot_status = status;
        self.lot_assessment.review = Some(LotReview {
            reviewer: reviewer.to_string(),
            previous_status,
            reviewed_at: reviewed_at.to_string(),
        });
    }

    /// Keep the identity of the report being appended to.
    pub fn adopt_identity(&mut self, original: &InspectionHeader) {
        let header = &mut self.inspection_header;
        header.po_number = original.po_number.clone();
        header.report_timestamp = original.report_timestamp.clone();
        header.supplier_name = original.supplier_name.clone();
        header.inspector_name = original.inspector_name.clone();
        if original.batch_number.is_some() {
            header.batch_number = original.batch_number.clone();
        }
        if original.lot_number.is_some() {
            header.lot_number = original.lot_number.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::report::model::{BoundingBox, LotAssessment};

    use super::*;

    fn defect(class: &str, severity: Severity) -> Defect {
        Defect {
            class: class.to_string(),
            category: "fabric".to_string(),
            severity,
            description: format!("{class} observed"),
            count: 1,
            locations: vec![BoundingBox([0.1, 0.1, 0.2, 0.2])],
        }
    }

    fn image(index: u32, defects: Vec<Defect>, status: ImageStatus) -> ImageResult {
        ImageResult {
            image_index: index,
            defects,
            status,
            ..ImageResult::default()
        }
    }

    #[test]
    fn image_status_follows_literal_severity_rule() {
        assert_eq!(
            ImageStatus::derive(&[defect("hole", Severity::Critical)]),
            ImageStatus::Rejected
        );
        assert_eq!(
            ImageStatus::derive(&[defect("stain", Severity::Major)]),
            ImageStatus::Accepted
        );
        assert_eq!(
            ImageStatus::derive(&[defect("loose thread", Severity::Minor)]),
            ImageStatus::AcceptedWithMinorDefects
        );
        assert_eq!(ImageStatus::derive(&[]), ImageStatus::Accepted);
        assert_eq!(
            ImageStatus::derive(&[
                defect("loose thread", Severity::Minor),
                defect("stain", Severity::Major)
            ]),
            ImageStatus::Accepted
        );
    }

    #[test]
    fn lot_status_rejects_on_critical_or_rejected_image() {
        let clean = vec![image(0, vec![], ImageStatus::Accepted)];
        assert_eq!(LotStatus::derive(&clean, false), LotStatus::Accept);
        assert_eq!(LotStatus::derive(&clean, true), LotStatus::Reject);

        let minor = vec![image(
            0,
            vec![defect("slub", Severity::Minor)],
            ImageStatus::AcceptedWithMinorDefects,
        )];
        assert_eq!(LotStatus::derive(&minor, false), LotStatus::AcceptWithRemarks);

        let rejected = vec![image(0, vec![], ImageStatus::Rejected)];
        assert_eq!(LotStatus::derive(&rejected, false), LotStatus::Reject);
    }

    #[test]
    fn reconcile_corrects_inconsistent_model_output() {
        let mut report = InspectionReport {
            images: vec![
                image(0, vec![defect("hole", Severity::Critical)], ImageStatus::Accepted),
                image(1, vec![defect("slub", Severity::Minor)], ImageStatus::Accepted),
            ],
            lot_assessment: LotAssessment {
                lot_status: LotStatus::Accept,
                ..LotAssessment::default()
            },
            ..InspectionReport::default()
        };
        let warnings = report.reconcile();

        assert_eq!(report.images[0].status, ImageStatus::Rejected);
        assert_eq!(report.images[1].status, ImageStatus::AcceptedWithMinorDefects);
        assert!(report.lot_assessment.critical_defects_present);
        assert_eq!(report.lot_assessment.lot_status, LotStatus::Reject);
        assert_eq!(report.lot_assessment.defect_summary.len(), 2);
        assert_eq!(report.lot_assessment.total_defects, Some(2));
        assert!(warnings.iter().any(|w| w.contains("lot_status 'accept'")));
    }

    #[test]
    fn reconcile_downgrades_unfounded_rejection() {
        let mut report = InspectionReport {
            images: vec![image(
                0,
                vec![defect("stain", Severity::Major)],
                ImageStatus::Accepted,
            )],
            lot_assessment: LotAssessment {
                lot_status: LotStatus::Reject,
                critical_defects_present: false,
                defect_summary: vec![DefectSummaryEntry {
                    class: "stain".to_string(),
                    count: 1,
                    percentage: 100.0,
                }],
                ..LotAssessment::default()
            },
            ..InspectionReport::default()
        };
        let warnings = report.reconcile();
        assert_eq!(report.lot_assessment.lot_status, LotStatus::AcceptWithRemarks);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn consistent_report_reconciles_without_warnings() {
        let mut report = InspectionReport {
            images: vec![image(0, vec![], ImageStatus::Accepted)],
            ..InspectionReport::default()
        };
        assert!(report.reconcile().is_empty());
        assert_eq!(report.lot_assessment.total_defects, Some(0));
    }

    #[test]
    fn defect_summary_aggregates_by_class() {
        let mut heavy = defect("Stain", Severity::Major);
        heavy.count = 3;
        let report = InspectionReport {
            images: vec![
                image(0, vec![heavy], ImageStatus::Accepted),
                image(1, vec![defect("stain", Severity::Minor)], ImageStatus::Accepted),
                image(2, vec![defect("hole", Severity::Critical)], ImageStatus::Rejected),
            ],
            ..InspectionReport::default()
        };
        let summary = report.summarize_defects();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].class, "stain");
        assert_eq!(summary[0].count, 4);
        assert_eq!(summary[0].percentage, 80.0);
        assert_eq!(summary[1].percentage, 20.0);
        assert!((report.defect_rate_percent() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn review_keeps_first_model_verdict() {
        let mut report = InspectionReport::default();
        report.lot_assessment.lot_status = LotStatus::Reject;
        report.apply_review(LotStatus::AcceptWithRemarks, "qa-lead", "2026-03-02T09:00:00Z");
        report.apply_review(LotStatus::Accept, "qa-manager", "2026-03-03T09:00:00Z");

        let review = report.lot_assessment.review.as_ref().map(|r| r.previous_status);
        assert_eq!(report.lot_assessment.lot_status, LotStatus::Accept);
        assert_eq!(review, Some(LotStatus::Reject));
    }

    #[test]
    fn adopt_identity_keeps_po_and_timestamp() {
        let original = InspectionHeader {
            po_number: "PO-1".to_string(),
            report_timestamp: "2026-01-01T00:00:00Z".to_string(),
            supplier_name: "Acme".to_string(),
            ..InspectionHeader::default()
        };
        let mut report = InspectionReport::default();
        report.inspection_header.po_number = "PO-X".to_string();
        report.inspection_header.report_timestamp = "later".to_string();
        report.adopt_identity(&original);
        assert_eq!(report.report_key(), "PO-1@2026-01-01T00:00:00Z");
    }
}
