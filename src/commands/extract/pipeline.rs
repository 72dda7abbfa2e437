use anyhow::{Result, bail};
use tracing::{debug, info};

use super::acquisition::DocumentPage;
use super::additional_therapy::AdditionalTherapyParser;
use super::assemble::{AssemblyInput, assemble};
use super::blood_tests::BloodTestParser;
use super::classify::RegimenClassifier;
use super::cycle_info::CycleInfoParser;
use super::drug_table::DrugTableParser;
use super::metadata::MetadataParser;
use super::normalize::{LineStream, NormalizationStats};
use super::oral_dose::OralDoseParser;
use super::segment::Segmenter;
use super::vocabulary::Vocabulary;
use crate::model::{ExtractedRecord, UNKNOWN_MARKER};

pub struct PipelineOutput {
    pub record: ExtractedRecord,
    pub line_count: usize,
    pub section_count: usize,
    pub stats: NormalizationStats,
}

/// Compiled stages for one vocabulary. Holds no per-document state, so the
/// same pipeline can run any number of documents.
pub struct ExtractionPipeline {
    segmenter: Segmenter,
    classifier: RegimenClassifier,
    drug_table: DrugTableParser,
    oral_dose: OralDoseParser,
    blood_tests: BloodTestParser,
    additional_therapy: AdditionalTherapyParser,
    cycle_info: CycleInfoParser,
    metadata: MetadataParser,
}

impl ExtractionPipeline {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self> {
        Ok(Self {
            segmenter: Segmenter::new(vocabulary)?,
            classifier: RegimenClassifier::new(vocabulary)?,
            drug_table: DrugTableParser::new(vocabulary)?,
            oral_dose: OralDoseParser::new(vocabulary)?,
            blood_tests: BloodTestParser::new()?,
            additional_therapy: AdditionalTherapyParser::new(vocabulary)?,
            cycle_info: CycleInfoParser::new()?,
            metadata: MetadataParser::new(vocabulary)?,
        })
    }

    pub fn run(&self, pages: &[DocumentPage]) -> Result<PipelineOutput> {
        let stream = LineStream::from_pages(pages);
        if stream.is_empty() {
            bail!("no readable text on any of {} page(s)", pages.len());
        }

        let sections = self.segmenter.segment(&stream);
        for section in sections.iter() {
            debug!(
                kind = section.kind.as_str(),
                start = section.start,
                end = section.end,
                "section"
            );
        }
        info!(
            lines = stream.len(),
            chars = stream.joined().chars().count(),
            sections = sections.len(),
            "document segmented"
        );

        let metadata = self.metadata.parse(&stream);
        let administration = self.classifier.classify_administration(&stream, &sections);
        let regimen = self.classifier.resolve_regimen_name(&stream);
        let drug_rows = self.drug_table.parse(&stream, &sections);

        let oral_drug = metadata
            .drug_name
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| UNKNOWN_MARKER.to_string());
        let oral = self.oral_dose.parse(&stream, &sections, &oral_drug);
        let support = self.additional_therapy.parse(&stream, &sections);
        let blood = self.blood_tests.parse(&stream, &sections);
        let cycle = self
            .cycle_info
            .parse(&stream, &sections, regimen.suffix_days);

        info!(
            administration = administration.kind.as_str(),
            regimen = regimen.name.as_deref().unwrap_or(UNKNOWN_MARKER),
            drug_rows = drug_rows.len(),
            oral_templates = oral.templates.len(),
            support_rows = support.rows.len(),
            blood_tests = blood.thresholds.len(),
            cycle_days = cycle.length_days,
            "fields parsed"
        );

        let record = assemble(AssemblyInput {
            stream: &stream,
            sections: &sections,
            pages,
            metadata,
            regimen,
            administration,
            drug_rows,
            oral,
            support,
            blood,
            cycle,
        });

        Ok(PipelineOutput {
            record,
            line_count: stream.len(),
            section_count: sections.len(),
            stats: stream.stats(),
        })
    }
}
