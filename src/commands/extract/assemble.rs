use tracing::debug;

use super::acquisition::DocumentPage;
use super::additional_therapy::AdditionalTherapy;
use super::blood_tests::{BloodTestFindings, DEFAULT_VALIDITY_DAYS};
use super::classify::{AdministrationDecision, RegimenResolution};
use super::drug_table::DrugRow;
use super::metadata::DocumentMetadata;
use super::normalize::LineStream;
use super::oral_dose::OralDosing;
use super::segment::{SectionKind, Sections};
use crate::model::{
    AdministrationType, CycleInfo, CycleSource, Dose, DrugTemplateRecord, ExtractedRecord,
    NEEDS_HUMAN_INPUT, ReviewFlag, UNKNOWN_MARKER,
};

pub const DEFAULT_CYCLES: u32 = 12;

const MIN_PARAGRAPH_CHARS: usize = 20;
const PARAGRAPH_SECTIONS: &[SectionKind] = &[
    SectionKind::RotaInformation,
    SectionKind::BloodTests,
    SectionKind::Narrative,
];

/// Everything the parsers produced for one run.
pub struct AssemblyInput<'a> {
    pub stream: &'a LineStream,
    pub sections: &'a Sections,
    pub pages: &'a [DocumentPage],
    pub metadata: DocumentMetadata,
    pub regimen: RegimenResolution,
    pub administration: AdministrationDecision,
    pub drug_rows: Vec<DrugRow>,
    pub oral: OralDosing,
    pub support: AdditionalTherapy,
    pub blood: BloodTestFindings,
    pub cycle: CycleInfo,
}

pub fn assemble(input: AssemblyInput<'_>) -> ExtractedRecord {
    let mut flags = Vec::<ReviewFlag>::new();
    let administration = input.administration.kind;

    for page in input.pages.iter().filter(|page| page.low_confidence) {
        flags.push(ReviewFlag::new(
            format!("pages[{}]", page.index),
            format!(
                "page {} has little or no readable text ({}); values from it may be missing",
                page.index + 1,
                page.reason
            ),
        ));
    }

    let document_code = input.metadata.document_code.clone().unwrap_or_else(|| {
        flags.push(ReviewFlag::new("document_code", "no document code found"));
        UNKNOWN_MARKER.to_string()
    });

    let regimen_name = match &input.regimen.name {
        Some(name) => name.clone(),
        None => {
            flags.push(ReviewFlag::new(
                "regimen_name",
                "no regimen abbreviation or patient label found",
            ));
            UNKNOWN_MARKER.to_string()
        }
    };
    if input.regimen.tie_broken() {
        flags.push(ReviewFlag::new(
            "regimen_name",
            format!(
                "regimen candidates {} tied on count; chose '{}' by title-area priority",
                input.regimen.tied_labels.join(", "),
                regimen_name
            ),
        ));
    }

    let (drug_full_name, indication) = match administration {
        AdministrationType::OralOnly => {
            let drug = input.metadata.drug_name.clone().unwrap_or_else(|| {
                flags.push(ReviewFlag::new(
                    "drug_full_name",
                    "no '<drug> for <indication>' title found",
                ));
                UNKNOWN_MARKER.to_string()
            });
            let indication = input
                .metadata
                .indication
                .clone()
                .unwrap_or_else(|| UNKNOWN_MARKER.to_string());
            (drug, indication)
        }
        AdministrationType::InfusionOnly | AdministrationType::Mixed => {
            (regimen_name.clone(), NEEDS_HUMAN_INPUT.to_string())
        }
    };

    if administration == AdministrationType::OralOnly && !input.drug_rows.is_empty() {
        flags.push(ReviewFlag::new(
            "administration",
            format!(
                "{} infusion rows found on a sheet classified oral_only",
                input.drug_rows.len()
            ),
        ));
    }

    let templates = number_templates(&input.drug_rows, &input.oral, &input.support);
    flags.extend(template_flags(&templates, input.stream));
    flags.extend(input.oral.flags.iter().cloned());
    flags.extend(input.support.flags.iter().cloned());

    let mut blood_tests = input.blood.thresholds.clone();
    blood_tests.sort_by_key(|threshold| threshold.test_code);
    flags.extend(input.blood.flags.iter().cloned());
    if blood_tests.is_empty() {
        flags.push(ReviewFlag::new("blood_tests", "no blood-test thresholds found"));
    }

    if input.cycle.source == CycleSource::Default {
        flags.push(ReviewFlag::new(
            "cycle",
            format!(
                "no cycle length found; defaulted to {}",
                input.cycle.delay_label()
            ),
        ));
    }

    let blood_test_validity_days = input.blood.validity_days.unwrap_or(DEFAULT_VALIDITY_DAYS);
    let reference = if drug_full_name == UNKNOWN_MARKER {
        NEEDS_HUMAN_INPUT.to_string()
    } else {
        format!("SmPC for {drug_full_name}")
    };

    debug!(
        templates = templates.len(),
        blood_tests = blood_tests.len(),
        flags = flags.len(),
        "record assembled"
    );

    ExtractedRecord {
        directorate: directorate_for(&document_code).to_string(),
        document_code,
        regimen_name,
        drug_full_name,
        indication,
        reference,
        administration,
        drug_prefix: NEEDS_HUMAN_INPUT.to_string(),
        ticket_number: NEEDS_HUMAN_INPUT.to_string(),
        specialty_class: NEEDS_HUMAN_INPUT.to_string(),
        inpatient_or_outpatient: match administration {
            AdministrationType::OralOnly => "O".to_string(),
            AdministrationType::InfusionOnly | AdministrationType::Mixed => "I".to_string(),
        },
        default_cycles: DEFAULT_CYCLES,
        cycle: input.cycle,
        templates,
        blood_test_validity_days,
        blood_tests,
        rota_info_paragraphs: rota_info_paragraphs(input.stream, input.sections),
        warnings_paragraphs: warnings_paragraphs(
            input.stream,
            input.sections,
            blood_test_validity_days,
        ),
        review_flags: flags,
    }
}

/// Infusion rows `1A..nA`, then the oral block as one group, then each
/// support medication in its own group.
pub fn number_templates(
    drug_rows: &[DrugRow],
    oral: &OralDosing,
    support: &AdditionalTherapy,
) -> Vec<DrugTemplateRecord> {
    let mut templates = Vec::<DrugTemplateRecord>::new();
    let mut group = 0u32;

    for row in drug_rows {
        group += 1;
        templates.push(row.to_template(format!("{group}A")));
    }

    if !oral.templates.is_empty() {
        group += 1;
        for template in &oral.templates {
            let mut template = template.clone();
            template.group = if template.is_primary() {
                format!("{group}A")
            } else {
                group.to_string()
            };
            templates.push(template);
        }
    }

    for row in &support.rows {
        group += 1;
        templates.push(row.to_template(format!("{group}A")));
    }

    templates
}

fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == UNKNOWN_MARKER || trimmed == NEEDS_HUMAN_INPUT
}

fn template_flags(templates: &[DrugTemplateRecord], stream: &LineStream) -> Vec<ReviewFlag> {
    let mut flags = Vec::<ReviewFlag>::new();

    if templates.is_empty() {
        flags.push(ReviewFlag::new("templates", "no drug templates found"));
    }

    for (index, template) in templates.iter().enumerate() {
        match &template.dose {
            Dose::Unknown => {
                let location = match stream.page_of(template.source_line) {
                    Some(page) => format!("line {} (page {})", template.source_line + 1, page + 1),
                    None => format!("line {}", template.source_line + 1),
                };
                flags.push(ReviewFlag::new(
                    format!("templates[{index}].dose"),
                    format!(
                        "dose for {} could not be read from {location}; check original rota",
                        template.drug_name
                    ),
                ));
            }
            Dose::Known {
                per_square_metre: true,
                ..
            } => flags.push(ReviewFlag::new(
                format!("templates[{index}].dose"),
                format!(
                    "dose for {} is per m2; confirm BSA calculation",
                    template.drug_name
                ),
            )),
            Dose::Known { .. } => {}
        }

        if template.dose.is_unknown() {
            continue;
        }
        for (field, value) in [("route", &template.route), ("form", &template.form)] {
            if is_placeholder(value) {
                flags.push(ReviewFlag::new(
                    format!("templates[{index}].{field}"),
                    format!("{} has no {field}", template.drug_name),
                ));
            }
        }
    }

    flags
}

fn directorate_for(document_code: &str) -> &'static str {
    let compact = document_code.replace('-', "").to_ascii_uppercase();
    if compact.starts_with("HROTA") {
        "HAE"
    } else {
        "ONC"
    }
}

fn rota_info_paragraphs(stream: &LineStream, sections: &Sections) -> Vec<String> {
    sections
        .lines_in(PARAGRAPH_SECTIONS)
        .into_iter()
        .map(|index| stream.line(index).trim())
        .filter(|line| line.chars().count() > MIN_PARAGRAPH_CHARS)
        .map(str::to_string)
        .collect()
}

fn warnings_paragraphs(
    stream: &LineStream,
    sections: &Sections,
    validity_days: u32,
) -> Vec<String> {
    let mut paragraphs = sections
        .lines_in(&[SectionKind::Warnings])
        .into_iter()
        .filter(|index| {
            !sections.is_header_line(*index)
                || stream.line(*index).chars().count() > MIN_PARAGRAPH_CHARS
        })
        .map(|index| stream.line(index).trim().to_string())
        .collect::<Vec<String>>();

    paragraphs.push(format!("Validity of FBC {validity_days} days"));
    paragraphs.push(format!("Validity of U&E, LFTs, {validity_days} days"));
    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::extract::additional_therapy::SupportRow;
    use crate::commands::extract::classify::RegimenNameSource;
    use crate::commands::extract::drug_table::DayRange;
    use crate::model::{
        BloodTestThreshold, Comparison, FinalDoseDay, PrescriptionMode, TestCode,
    };

    fn drug_row(name: &str, dose: Dose) -> DrugRow {
        DrugRow {
            line_index: 3,
            drug_name: name.to_string(),
            dose,
            route: "IV".to_string(),
            fluid_type: String::new(),
            volume_ml: String::new(),
            infusion_duration: String::new(),
            timing_after: None,
            days: DayRange {
                first: 1,
                last: FinalDoseDay::Day(1),
            },
        }
    }

    fn threshold(code: TestCode) -> BloodTestThreshold {
        BloodTestThreshold {
            test_code: code,
            threshold_value: 1.0,
            threshold_function: code.comparison(),
            message_text_line1: code.as_str().to_string(),
            message_text_line3: "Contact prescriber.".to_string(),
            source_line: 0,
        }
    }

    fn milligrams(value: f64) -> Dose {
        Dose::Known {
            value,
            units: "mg".to_string(),
            per_square_metre: false,
        }
    }

    fn assemble_with(
        administration: AdministrationType,
        drug_rows: Vec<DrugRow>,
        oral: OralDosing,
        support: AdditionalTherapy,
        thresholds: Vec<BloodTestThreshold>,
    ) -> ExtractedRecord {
        let stream = LineStream::from_text("Document Code: H-ROTA 12\nR-CHOP 21");
        let sections = Sections::default();
        assemble(AssemblyInput {
            stream: &stream,
            sections: &sections,
            pages: &[],
            metadata: DocumentMetadata {
                document_code: Some("H-ROTA12".to_string()),
                drug_name: None,
                indication: None,
            },
            regimen: RegimenResolution {
                name: Some("R-CHOP 21".to_string()),
                suffix_days: Some(21),
                source: RegimenNameSource::Abbreviation,
                tied_labels: vec!["R-CHOP".to_string()],
                scores: Vec::new(),
            },
            administration: AdministrationDecision {
                kind: administration,
                iv_signals: Vec::new(),
                oral_signals: Vec::new(),
            },
            drug_rows,
            oral,
            support,
            blood: BloodTestFindings {
                thresholds,
                validity_days: None,
                flags: Vec::new(),
            },
            cycle: CycleInfo::from_days(21, CycleSource::RegimenSuffix),
        })
    }

    #[test]
    fn blood_tests_are_reordered_canonically() {
        let record = assemble_with(
            AdministrationType::InfusionOnly,
            vec![drug_row("ETOPOSIDE", milligrams(100.0))],
            OralDosing::default(),
            AdditionalTherapy::default(),
            vec![
                threshold(TestCode::Alt),
                threshold(TestCode::Neutrophils),
                threshold(TestCode::Bilirubin),
                threshold(TestCode::Platelets),
            ],
        );

        let codes = record
            .blood_tests
            .iter()
            .map(|threshold| threshold.test_code)
            .collect::<Vec<_>>();
        assert_eq!(
            codes,
            vec![
                TestCode::Platelets,
                TestCode::Neutrophils,
                TestCode::Bilirubin,
                TestCode::Alt,
            ]
        );
        assert_eq!(record.blood_tests[0].threshold_function, Comparison::LessThan);
        assert_eq!(record.directorate, "HAE");
        assert_eq!(record.inpatient_or_outpatient, "I");
        assert_eq!(record.indication, NEEDS_HUMAN_INPUT);
        assert_eq!(record.reference, "SmPC for R-CHOP 21");
        assert_eq!(
            record.warnings_paragraphs,
            vec![
                "Validity of FBC 7 days".to_string(),
                "Validity of U&E, LFTs, 7 days".to_string(),
            ]
        );
    }

    #[test]
    fn groups_number_infusion_then_oral_then_support() {
        let oral_template = |group: &str, mode: PrescriptionMode| DrugTemplateRecord {
            drug_name: "PREDNISOLONE".to_string(),
            dose: milligrams(100.0),
            mode,
            frequency: "OD".to_string(),
            route: "ORAL".to_string(),
            form: "TAB".to_string(),
            timing_constraints: String::new(),
            first_dose_day: 1,
            final_dose_day: FinalDoseDay::UntilStopped,
            group: group.to_string(),
            fluid_type: String::new(),
            volume_ml: String::new(),
            infusion_duration: String::new(),
            source_line: 9,
        };
        let oral = OralDosing {
            templates: vec![
                oral_template("1A", PrescriptionMode::Tto),
                oral_template("1", PrescriptionMode::Reg),
            ],
            flags: Vec::new(),
        };
        let support = AdditionalTherapy {
            rows: vec![SupportRow {
                line_index: 12,
                drug_name: "ALLOPURINOL".to_string(),
                dose: milligrams(300.0),
                frequency: "OD".to_string(),
                first_dose_day: 1,
                final_dose_day: FinalDoseDay::Day(7),
            }],
            flags: Vec::new(),
        };

        let record = assemble_with(
            AdministrationType::Mixed,
            vec![
                drug_row("RITUXIMAB", milligrams(375.0)),
                drug_row("VINCRISTINE", milligrams(2.0)),
            ],
            oral,
            support,
            vec![threshold(TestCode::Platelets)],
        );

        let groups = record
            .templates
            .iter()
            .map(|template| template.group.as_str())
            .collect::<Vec<_>>();
        assert_eq!(groups, vec!["1A", "2A", "3A", "3", "4A"]);
    }

    #[test]
    fn unknown_doses_are_flagged_and_never_dropped() {
        let record = assemble_with(
            AdministrationType::InfusionOnly,
            vec![drug_row("BLEOMYCIN", Dose::Unknown)],
            OralDosing::default(),
            AdditionalTherapy::default(),
            vec![threshold(TestCode::Platelets)],
        );

        assert_eq!(record.templates.len(), 1);
        assert!(record.templates[0].dose.is_unknown());
        assert!(
            record
                .review_flags
                .iter()
                .any(|flag| flag.field == "templates[0].dose"
                    && flag.message.contains("BLEOMYCIN"))
        );
    }

    #[test]
    fn placeholder_route_is_flagged_for_known_doses() {
        let mut row = drug_row("ETOPOSIDE", milligrams(100.0));
        row.route = String::new();
        let record = assemble_with(
            AdministrationType::InfusionOnly,
            vec![row],
            OralDosing::default(),
            AdditionalTherapy::default(),
            Vec::new(),
        );

        let fields = record
            .review_flags
            .iter()
            .map(|flag| flag.field.as_str())
            .collect::<Vec<_>>();
        assert!(fields.contains(&"templates[0].route"));
        assert!(fields.contains(&"blood_tests"));
        assert!(!fields.contains(&"cycle"));
    }
}
