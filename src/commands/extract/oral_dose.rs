use anyhow::{Context, Result};
use regex::Regex;

use super::normalize::LineStream;
use super::segment::{SectionKind, Sections};
use super::vocabulary::{FrequencyCode, Vocabulary, lookup_frequency};
use crate::model::{
    Dose, DrugTemplateRecord, FinalDoseDay, PrescriptionMode, ReviewFlag, UNKNOWN_MARKER,
};

const ORAL_SECTIONS: &[SectionKind] = &[
    SectionKind::OralDosing,
    SectionKind::DrugTable,
    SectionKind::RotaInformation,
    SectionKind::Narrative,
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OralDosing {
    pub templates: Vec<DrugTemplateRecord>,
    pub flags: Vec<ReviewFlag>,
}

pub struct OralDoseParser {
    frequency_codes: Vec<FrequencyCode>,
    starting_dose_line: Regex,
    starting_dose: Regex,
    reduced_dose: Regex,
    tablets: Regex,
    capsules: Regex,
    with_food: Regex,
}

impl OralDoseParser {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self> {
        Ok(Self {
            frequency_codes: vocabulary.frequency_codes.clone(),
            starting_dose_line: Regex::new(r"(?i)\bstarting\s+dose\b")
                .context("failed to compile starting dose line regex")?,
            starting_dose: Regex::new(
                r"(?i)\bstarting\s+dose\s*(?:is\s+)?(?:usually\s+)?(?:of\s+)?(\d+(?:\.\d+)?)\s*mg\b\s*(.*)$",
            )
            .context("failed to compile starting dose regex")?,
            reduced_dose: Regex::new(r"(?i)\bdose\s+reduced?\s+to\s+(\d+(?:\.\d+)?)\s*mg\b")
                .context("failed to compile dose reduction regex")?,
            tablets: Regex::new(r"(?i)\btablets?\b").context("failed to compile tablet regex")?,
            capsules: Regex::new(r"(?i)\bcapsules?\b")
                .context("failed to compile capsule regex")?,
            with_food: Regex::new(r"(?i)\btaken?\s+(?:continuously\s+)?with\s+food\b")
                .context("failed to compile food timing regex")?,
        })
    }

    /// Primary TTO, optional dose-reduction TTO, and inpatient REG templates
    /// built from the `Starting dose` line. Nothing is emitted without one.
    pub fn parse(&self, stream: &LineStream, sections: &Sections, drug_name: &str) -> OralDosing {
        let lines = sections.lines_in(ORAL_SECTIONS);
        let mut dosing = OralDosing::default();

        let Some(start_line) = lines
            .iter()
            .copied()
            .find(|index| self.starting_dose_line.is_match(stream.line(*index)))
        else {
            return dosing;
        };

        let (dose, frequency) = match self.starting_dose.captures(stream.line(start_line)) {
            Some(captures) => {
                let dose = captures
                    .get(1)
                    .and_then(|value| value.as_str().parse::<f64>().ok())
                    .filter(|value| *value > 0.0)
                    .map(milligrams)
                    .unwrap_or(Dose::Unknown);
                let frequency = captures
                    .get(2)
                    .and_then(|rest| self.leading_frequency(rest.as_str()));
                (dose, frequency)
            }
            None => (Dose::Unknown, None),
        };

        if dose.is_unknown() {
            dosing.flags.push(ReviewFlag::new(
                "templates.dose",
                format!(
                    "starting dose on line {} could not be read; check original rota",
                    start_line + 1
                ),
            ));
        }
        let frequency = match frequency {
            Some(code) => code,
            None => {
                dosing.flags.push(ReviewFlag::new(
                    "templates.frequency",
                    format!(
                        "no recognised frequency after the starting dose on line {}",
                        start_line + 1
                    ),
                ));
                UNKNOWN_MARKER.to_string()
            }
        };

        let form = if lines
            .iter()
            .any(|index| self.tablets.is_match(stream.line(*index)))
        {
            "TAB"
        } else if lines
            .iter()
            .any(|index| self.capsules.is_match(stream.line(*index)))
        {
            "CAP"
        } else {
            "TAB"
        };

        let food_timing = if lines
            .iter()
            .any(|index| self.with_food.is_match(stream.line(*index)))
        {
            "Take with food"
        } else {
            ""
        };

        let template = |dose: Dose, mode: PrescriptionMode, label: &str, group: &str| {
            DrugTemplateRecord {
                drug_name: drug_name.to_string(),
                dose,
                mode,
                frequency: frequency.clone(),
                route: "ORAL".to_string(),
                form: form.to_string(),
                timing_constraints: join_timing(label, food_timing),
                first_dose_day: 1,
                final_dose_day: FinalDoseDay::UntilStopped,
                group: group.to_string(),
                fluid_type: String::new(),
                volume_ml: String::new(),
                infusion_duration: String::new(),
                source_line: start_line,
            }
        };

        dosing
            .templates
            .push(template(dose.clone(), PrescriptionMode::Tto, "", "1A"));

        let reduction = lines.iter().find_map(|index| {
            let value = self
                .reduced_dose
                .captures(stream.line(*index))?
                .get(1)?
                .as_str()
                .parse::<f64>()
                .ok()?;
            (value > 0.0).then_some((*index, value))
        });
        if let Some((line_index, value)) = reduction {
            let mut reduced = template(
                milligrams(value),
                PrescriptionMode::Tto,
                "Dose reduction",
                "1",
            );
            reduced.source_line = line_index;
            dosing.templates.push(reduced);
        }

        dosing.templates.push(template(
            dose,
            PrescriptionMode::Reg,
            "Inpatient prescribing",
            "1",
        ));

        dosing
    }

    /// Longest whitelisted phrase at the start of `rest`, up to four words.
    fn leading_frequency(&self, rest: &str) -> Option<String> {
        let words = rest
            .split(|character: char| {
                character.is_whitespace() || character == ',' || character == '.'
            })
            .filter(|word| !word.is_empty())
            .take(4)
            .collect::<Vec<&str>>();

        (1..=words.len()).rev().find_map(|count| {
            lookup_frequency(&self.frequency_codes, &words[..count].join(" "))
                .map(|code| code.to_string())
        })
    }
}

fn milligrams(value: f64) -> Dose {
    Dose::Known {
        value,
        units: "mg".to_string(),
        per_square_metre: false,
    }
}

fn join_timing(label: &str, food_timing: &str) -> String {
    match (label.is_empty(), food_timing.is_empty()) {
        (true, _) => food_timing.to_string(),
        (false, true) => label.to_string(),
        (false, false) => format!("{label} {food_timing}"),
    }
}
