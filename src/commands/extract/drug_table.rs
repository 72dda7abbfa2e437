use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use super::normalize::LineStream;
use super::segment::{SectionKind, Sections};
use super::vocabulary::{Vocabulary, canonical_entry, drug_name_regex, phrase_regex};
use crate::model::{Dose, DrugTemplateRecord, FinalDoseDay, PrescriptionMode};

pub const DOSE_UNKNOWN_NOTE: &str = "DOSE UNKNOWN - OCR could not read dose, check original rota";
pub const BSA_NOTE: &str = "dose per m2 - confirm BSA calculation";

#[derive(Debug, Clone, PartialEq)]
pub struct DayRange {
    pub first: u32,
    pub last: FinalDoseDay,
}

/// Values read from one drug-table line and nothing else.
#[derive(Debug, Clone, PartialEq)]
pub struct DrugRow {
    pub line_index: usize,
    pub drug_name: String,
    pub dose: Dose,
    pub route: String,
    pub fluid_type: String,
    pub volume_ml: String,
    pub infusion_duration: String,
    pub timing_after: Option<String>,
    pub days: DayRange,
}

impl DrugRow {
    pub fn is_bsa_based(&self) -> bool {
        matches!(
            self.dose,
            Dose::Known {
                per_square_metre: true,
                ..
            }
        )
    }

    pub fn timing_constraints(&self) -> String {
        let mut parts = Vec::<String>::new();
        if self.dose.is_unknown() {
            parts.push(DOSE_UNKNOWN_NOTE.to_string());
        }
        if !self.infusion_duration.is_empty() {
            parts.push(format!("{} infusion", self.infusion_duration));
        }
        if let Some(timing) = &self.timing_after {
            parts.push(timing.clone());
        }
        if self.is_bsa_based() {
            parts.push(BSA_NOTE.to_string());
        }
        parts.join(", ")
    }

    pub fn to_template(&self, group: String) -> DrugTemplateRecord {
        DrugTemplateRecord {
            drug_name: self.drug_name.clone(),
            dose: self.dose.clone(),
            mode: PrescriptionMode::Reg,
            frequency: "OD".to_string(),
            route: self.route.clone(),
            form: "INJ".to_string(),
            timing_constraints: self.timing_constraints(),
            first_dose_day: self.days.first,
            final_dose_day: self.days.last,
            group,
            fluid_type: self.fluid_type.clone(),
            volume_ml: self.volume_ml.clone(),
            infusion_duration: self.infusion_duration.clone(),
            source_line: self.line_index,
        }
    }
}

pub struct DrugTableParser {
    infusion_drugs: Vec<String>,
    drug_name: Regex,
    narrative: Regex,
    dose: Regex,
    subcutaneous: Regex,
    fluid: Regex,
    saline: Regex,
    volume: Regex,
    duration_hours: Regex,
    duration_minutes: Regex,
    day_range: Regex,
    continuation: Regex,
    timing_after: Regex,
}

impl DrugTableParser {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self> {
        Ok(Self {
            infusion_drugs: vocabulary.infusion_drugs.clone(),
            drug_name: drug_name_regex(&vocabulary.infusion_drugs)?,
            narrative: phrase_regex(&vocabulary.narrative_phrases, "narrative phrase")?,
            dose: Regex::new(
                r#"(?i)(\d+(?:\.\d+)?)\s*(micrograms?|mcg|mg|g)\b(\s*/\s*m(?:\s*(?:sq|[²2?"'])|\b))?"#,
            )
            .context("failed to compile dose regex")?,
            subcutaneous: phrase_regex(&vocabulary.subcutaneous_markers, "subcutaneous marker")?,
            fluid: Regex::new(
                r"(?i)(N/Saline|0\.9%\s*(?:NaCl|Sodium\s*Chloride)|Dextrose\s*5%|D5W|Glucose\s*5%|Hartmann'?s?)",
            )
            .context("failed to compile fluid regex")?,
            saline: Regex::new(r"(?i)\bsaline\b").context("failed to compile saline regex")?,
            volume: Regex::new(r"(?i)\b(\d{2,4})\s*ml\b").context("failed to compile volume regex")?,
            duration_hours: Regex::new(r"(?i)\b\d+(?:\.\d+)?\s*(?:hours?|hrs?)\b")
                .context("failed to compile hour duration regex")?,
            duration_minutes: Regex::new(r"(?i)\b\d+\s*(?:minutes?|mins?)\b")
                .context("failed to compile minute duration regex")?,
            day_range: Regex::new(
                r"(?i)\b(?:days?\s*|d)(\d{1,2})(?:\s*(?:-|–|to)\s*(?:days?\s*|d)?(\d{1,2}))?\b",
            )
            .context("failed to compile day range regex")?,
            continuation: Regex::new(
                r"(?i)\b(?:onwards|until\s+progression|until\s+stopped|continuous(?:ly)?|ongoing)\b",
            )
            .context("failed to compile continuation regex")?,
            timing_after: Regex::new(
                r"(?i)\d+(?:\.\d+)?\s*(?:hours?|hrs?)\s+after\s+(?:start\s+of\s+)?\w+",
            )
            .context("failed to compile relative timing regex")?,
        })
    }

    /// Drug rows from every drug-table line, first occurrence of each drug
    /// kept.
    pub fn parse(&self, stream: &LineStream, sections: &Sections) -> Vec<DrugRow> {
        let mut rows = Vec::<DrugRow>::new();

        for line_index in sections.lines_in(&[SectionKind::DrugTable]) {
            let Some(row) = self.parse_line(stream.line(line_index), line_index) else {
                continue;
            };
            if rows.iter().any(|existing| existing.drug_name == row.drug_name) {
                debug!(line = line_index, drug = %row.drug_name, "duplicate drug row ignored");
                continue;
            }
            rows.push(row);
        }

        rows
    }

    /// Reads a single line. Prose lines are never rows, whatever they mention.
    pub fn parse_line(&self, line: &str, line_index: usize) -> Option<DrugRow> {
        let matched = self.drug_name.captures(line)?.get(1)?.as_str();
        if self.narrative.is_match(line) {
            debug!(line = line_index, drug = matched, "narrative line skipped");
            return None;
        }

        let drug_name = canonical_entry(&self.infusion_drugs, matched)
            .map(|entry| entry.to_uppercase())
            .unwrap_or_else(|| matched.to_uppercase());

        let route = self.extract_route(line);
        let is_iv = route == "IV";

        Some(DrugRow {
            line_index,
            drug_name,
            dose: self.extract_dose(line),
            fluid_type: if is_iv {
                self.extract_fluid(line)
            } else {
                String::new()
            },
            volume_ml: if is_iv {
                self.extract_volume(line)
            } else {
                String::new()
            },
            route,
            infusion_duration: self.extract_duration(line),
            timing_after: self
                .timing_after
                .find(line)
                .map(|found| found.as_str().trim().to_string()),
            days: self.extract_day_range(line),
        })
    }

    pub fn extract_dose(&self, line: &str) -> Dose {
        let Some(captures) = self.dose.captures(line) else {
            return Dose::Unknown;
        };
        let Some(raw) = captures
            .get(1)
            .and_then(|value| value.as_str().parse::<f64>().ok())
        else {
            return Dose::Unknown;
        };
        let unit = captures
            .get(2)
            .map(|value| value.as_str().to_ascii_lowercase())
            .unwrap_or_default();

        let (value, units) = match unit.as_str() {
            "g" => (raw * 1000.0, "mg".to_string()),
            "mcg" | "microgram" | "micrograms" => (raw, "mcg".to_string()),
            _ => (raw, "mg".to_string()),
        };
        if value <= 0.0 {
            return Dose::Unknown;
        }

        Dose::Known {
            value,
            units,
            per_square_metre: captures.get(3).is_some(),
        }
    }

    /// `SC` only for an explicit subcutaneous marker; a bare `SC` token is
    /// usually signature-column noise.
    pub fn extract_route(&self, line: &str) -> String {
        if self.subcutaneous.is_match(line) {
            "SC".to_string()
        } else {
            "IV".to_string()
        }
    }

    pub fn extract_fluid(&self, line: &str) -> String {
        if let Some(found) = self.fluid.find(line) {
            return found.as_str().to_string();
        }
        if self.saline.is_match(line) {
            return "N/Saline".to_string();
        }
        String::new()
    }

    pub fn extract_volume(&self, line: &str) -> String {
        self.volume
            .captures(line)
            .and_then(|captures| captures.get(1))
            .map(|value| value.as_str().to_string())
            .unwrap_or_default()
    }

    /// First hour or minute figure that is not an offset such as `4 hours
    /// after start of IFOSFAMIDE`.
    pub fn extract_duration(&self, line: &str) -> String {
        [&self.duration_hours, &self.duration_minutes]
            .into_iter()
            .find_map(|regex| {
                regex
                    .find_iter(line)
                    .find(|found| !starts_with_after(&line[found.end()..]))
            })
            .map(|found| found.as_str().trim().to_string())
            .unwrap_or_default()
    }

    /// Explicit range gives its last day, a continuation phrase gives `U`,
    /// otherwise the row is a single-day administration.
    pub fn extract_day_range(&self, line: &str) -> DayRange {
        let captures = self.day_range.captures(line);
        let first = captures
            .as_ref()
            .and_then(|captures| captures.get(1))
            .and_then(|value| value.as_str().parse::<u32>().ok())
            .unwrap_or(1);
        let range_end = captures
            .as_ref()
            .and_then(|captures| captures.get(2))
            .and_then(|value| value.as_str().parse::<u32>().ok());

        let last = if self.continuation.is_match(line) {
            FinalDoseDay::UntilStopped
        } else {
            FinalDoseDay::Day(range_end.unwrap_or(first))
        };

        DayRange { first, last }
    }
}

fn starts_with_after(rest: &str) -> bool {
    rest.trim_start()
        .get(..5)
        .is_some_and(|word| word.eq_ignore_ascii_case("after"))
}
