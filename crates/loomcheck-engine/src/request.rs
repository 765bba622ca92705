use loomcheck_contracts::history::HistoricalContext;
use loomcheck_contracts::prompt::{
    reference_label, render_request_context, StandardKind, SYSTEM_PROMPT,
};
use loomcheck_contracts::report::InspectionMeta;

use crate::config::Config;
use crate::images::{normalize_all, ImageLimits, ImageSource, NormalizedImage};
use crate::provider::{ContentPart, GenerateRequest};

/// Known-good and known-bad examples of the item under inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceStandards {
    pub item_name: Option<String>,
    pub accepted: Vec<ImageSource>,
    pub rejected: Vec<ImageSource>,
}

impl ReferenceStandards {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedReference {
    pub kind: StandardKind,
    pub index: usize,
    pub image: NormalizedImage,
}

/// Normalize reference standards. A reference that cannot be decoded is
/// dropped with a warning; the inspection still proceeds without it.
pub fn normalize_references(
    standards: &ReferenceStandards,
    limits: ImageLimits,
    warnings: &mut Vec<String>,
) -> Vec<NormalizedReference> {
    let mut out = Vec::new();
    for (kind, sources) in [
        (StandardKind::Accepted, &standards.accepted),
        (StandardKind::Rejected, &standards.rejected),
    ] {
        for (index, source) in sources.iter().enumerate() {
            match normalize_all(std::slice::from_ref(source), limits) {
                Ok(mut images) => {
                    if let Some(image) = images.pop() {
                        out.push(NormalizedReference { kind, index, image });
                    }
                }
                Err((_, err)) => warnings.push(format!(
                    "{} {} ({}) skipped: {err}",
                    kind.label().to_ascii_lowercase(),
                    index + 1,
                    source.label()
                )),
            }
        }
    }
    out
}

/// Ordered parts: each reference label then its image, the inspection
/// images, then the context packet.
pub fn assemble_request(
    config: &Config,
    meta: &InspectionMeta,
    report_timestamp: &str,
    history: &HistoricalContext,
    images: &[NormalizedImage],
    references: &[NormalizedReference],
    item_name: Option<&str>,
) -> GenerateRequest {
    let mut parts = Vec::with_capacity(references.len() * 2 + images.len() + 1);
    let item_name = item_name.or(meta.item_name.as_deref());
    for reference in references {
        parts.push(ContentPart::text(reference_label(
            reference.kind,
            reference.index,
            item_name,
        )));
        parts.push(inline_part(&reference.image));
    }
    parts.extend(images.iter().map(inline_part));
    parts.push(ContentPart::Text(render_request_context(
        meta,
        report_timestamp,
        history,
        images.len(),
        references.len(),
    )));

    GenerateRequest {
        model: config.model.clone(),
        system_instruction: SYSTEM_PROMPT.to_string(),
        parts,
        temperature: config.temperature,
    }
}

fn inline_part(image: &NormalizedImage) -> ContentPart {
    ContentPart::InlineImage {
        mime_type: image.mime_type.clone(),
        data: image.base64_data.clone(),
    }
}
