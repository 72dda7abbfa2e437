use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use super::normalize::LineStream;
use super::segment::{SectionKind, Sections};
use super::vocabulary::{
    FrequencyCode, Vocabulary, longest_first, lookup_frequency, phrase_pattern,
};
use crate::model::{Dose, DrugTemplateRecord, FinalDoseDay, PrescriptionMode, ReviewFlag};

const MIN_ROW_CHARS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct SupportRow {
    pub line_index: usize,
    pub drug_name: String,
    pub dose: Dose,
    pub frequency: String,
    pub first_dose_day: u32,
    pub final_dose_day: FinalDoseDay,
}

impl SupportRow {
    pub fn to_template(&self, group: String) -> DrugTemplateRecord {
        DrugTemplateRecord {
            drug_name: self.drug_name.clone(),
            dose: self.dose.clone(),
            mode: PrescriptionMode::Tto,
            frequency: self.frequency.clone(),
            route: "ORAL".to_string(),
            form: "TAB".to_string(),
            timing_constraints: String::new(),
            first_dose_day: self.first_dose_day,
            final_dose_day: self.final_dose_day,
            group,
            fluid_type: String::new(),
            volume_ml: String::new(),
            infusion_duration: String::new(),
            source_line: self.line_index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdditionalTherapy {
    pub rows: Vec<SupportRow>,
    pub flags: Vec<ReviewFlag>,
}

pub struct AdditionalTherapyParser {
    frequency_codes: Vec<FrequencyCode>,
    row: Regex,
    dose_like: Regex,
}

impl AdditionalTherapyParser {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self> {
        let phrases = vocabulary
            .frequency_codes
            .iter()
            .map(|entry| entry.phrase.clone())
            .collect::<Vec<String>>();
        let frequencies = alternation(&phrases);
        let oral_markers = alternation(&vocabulary.oral_markers);

        // drug [po]* dose units FREQUENCY [for 3/7 [then prn]] [, days n[-m]]
        let pattern = format!(
            r"(?i)^([A-Za-z][\w\-]+)\s+(?:(?:{oral_markers})\s+)*(\d+(?:\.\d+)?)\s*(mg|g|mcg)\s+({frequencies})\b\s*(?:for\s+[\d/]+\w*\s*(?:then\s+\w+)?\s*)?,?\s*(?:days?\s*(\d+)(?:\s*(?:-|–|to)\s*(\d+))?)?"
        );

        Ok(Self {
            frequency_codes: vocabulary.frequency_codes.clone(),
            row: Regex::new(&pattern).context("failed to compile additional therapy regex")?,
            dose_like: Regex::new(r"(?i)\d+(?:\.\d+)?\s*(?:mg|g|mcg)\b")
                .context("failed to compile additional therapy dose regex")?,
        })
    }

    pub fn parse(&self, stream: &LineStream, sections: &Sections) -> AdditionalTherapy {
        let mut therapy = AdditionalTherapy::default();

        for line_index in sections.lines_in(&[SectionKind::AdditionalTherapy]) {
            if sections.is_header_line(line_index) {
                continue;
            }
            let line = stream.line(line_index).trim().trim_start_matches('/').trim();
            if line.chars().count() < MIN_ROW_CHARS {
                continue;
            }

            match self.parse_line(line, line_index) {
                Some(row) => therapy.rows.push(row),
                None if self.dose_like.is_match(line) => {
                    debug!(line = line_index, "additional therapy line not parsed");
                    therapy.flags.push(ReviewFlag::new(
                        "templates",
                        format!(
                            "additional therapy line {} has a dose but no recognised frequency: '{}'",
                            line_index + 1,
                            line
                        ),
                    ));
                }
                None => {}
            }
        }

        therapy
    }

    pub fn parse_line(&self, line: &str, line_index: usize) -> Option<SupportRow> {
        let captures = self.row.captures(line)?;
        let drug_name = captures.get(1)?.as_str().to_uppercase();
        let raw = captures.get(2)?.as_str().parse::<f64>().ok()?;
        let unit = captures.get(3)?.as_str().to_ascii_lowercase();
        let frequency_phrase = captures.get(4)?.as_str();

        let frequency = lookup_frequency(&self.frequency_codes, frequency_phrase)?.to_string();

        let (value, units) = if unit == "g" {
            (raw * 1000.0, "mg".to_string())
        } else {
            (raw, unit)
        };
        let dose = if value > 0.0 {
            Dose::Known {
                value,
                units,
                per_square_metre: false,
            }
        } else {
            Dose::Unknown
        };

        let first_dose_day = captures
            .get(5)
            .and_then(|value| value.as_str().parse::<u32>().ok())
            .unwrap_or(1);
        let final_dose_day = captures
            .get(6)
            .and_then(|value| value.as_str().parse::<u32>().ok())
            .map(FinalDoseDay::Day)
            .unwrap_or(FinalDoseDay::Day(first_dose_day));

        Some(SupportRow {
            line_index,
            drug_name,
            dose,
            frequency,
            first_dose_day,
            final_dose_day,
        })
    }
}

fn alternation(phrases: &[String]) -> String {
    longest_first(phrases)
        .iter()
        .map(|phrase| phrase_pattern(phrase))
        .collect::<Vec<String>>()
        .join("|")
}
