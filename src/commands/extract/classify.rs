use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use super::normalize::LineStream;
use super::segment::{RowShape, SectionKind, Sections};
use super::vocabulary::{Vocabulary, drug_name_regex, longest_first, phrase_pattern, phrase_regex};
use crate::model::AdministrationType;

/// Cycle lengths accepted as a regimen-name suffix, in days.
pub const CYCLE_SUFFIX_DAYS: std::ops::RangeInclusive<u32> = 7..=56;

const TRIAL_LOOKAHEAD_CHARS: usize = 40;
const TABLE_SIGNALS: &[&str] = &["infusion_drug_in_table", "intravenous_table_row"];
const MAX_PATIENT_LABEL_CHARS: usize = 30;

/// One abbreviation occurrence. Offsets are byte offsets into the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMatch {
    pub line_index: usize,
    pub start: usize,
    pub end: usize,
    pub label: String,
    pub suffix: Option<u32>,
    pub in_title_area: bool,
}

impl CandidateMatch {
    fn contains(&self, other: &CandidateMatch) -> bool {
        self.line_index == other.line_index
            && self.start <= other.start
            && self.end >= other.end
            && (self.end - self.start) > (other.end - other.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateScore {
    pub label: String,
    pub count: usize,
    pub title_count: usize,
    pub first_line: usize,
    pub first_start: usize,
    pub suffix: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegimenNameSource {
    Abbreviation,
    PatientLabel,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegimenResolution {
    pub name: Option<String>,
    pub suffix_days: Option<u32>,
    pub source: RegimenNameSource,
    pub tied_labels: Vec<String>,
    pub scores: Vec<CandidateScore>,
}

impl RegimenResolution {
    pub fn tie_broken(&self) -> bool {
        self.tied_labels.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdministrationDecision {
    pub kind: AdministrationType,
    pub iv_signals: Vec<&'static str>,
    pub oral_signals: Vec<&'static str>,
}

struct AbbreviationPattern {
    label: String,
    regex: Regex,
}

pub struct RegimenClassifier {
    abbreviations: Vec<AbbreviationPattern>,
    context_lines: Regex,
    narrative_lines: Regex,
    trial_reference: Regex,
    patient_label: Regex,
    infusion_drug: Regex,
    iv_fluid: Regex,
    iv_volume: Regex,
    iv_timed_infusion: Regex,
    iv_equipment: Regex,
    iv_route: Regex,
    row_shape: RowShape,
    subcutaneous: Regex,
    oral_supply: Regex,
    oral_form: Regex,
    oral_directions: Regex,
    title_area_chars: usize,
}

impl RegimenClassifier {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self> {
        let abbreviations = longest_first(&vocabulary.regimen_abbreviations)
            .into_iter()
            .map(|label| {
                let leading = if label
                    .chars()
                    .next()
                    .map(|character| character.is_alphanumeric())
                    .unwrap_or(false)
                {
                    r"\b"
                } else {
                    ""
                };
                let pattern = format!(
                    r"(?i){leading}({})(?:\s+(\d{{1,3}}))?\b",
                    phrase_pattern(&label)
                );
                let regex = Regex::new(&pattern)
                    .with_context(|| format!("failed to compile abbreviation regex for {label}"))?;
                Ok(AbbreviationPattern { label, regex })
            })
            .collect::<Result<Vec<AbbreviationPattern>>>()?;

        Ok(Self {
            abbreviations,
            context_lines: phrase_regex(&vocabulary.regimen_context_phrases, "regimen context")?,
            narrative_lines: phrase_regex(&vocabulary.narrative_phrases, "narrative phrase")?,
            trial_reference: phrase_regex(&vocabulary.trial_reference_words, "trial reference")?,
            patient_label: Regex::new(r"[Pp]atient\s+label\s*[:\-]\s*([A-Z][A-Za-z0-9\- ]+)")
                .context("failed to compile patient label regex")?,
            infusion_drug: drug_name_regex(&vocabulary.infusion_drugs)?,
            iv_fluid: Regex::new(r"(?i)n/saline|0\.9%\s*nacl|dextrose|glucose\s*5%")
                .context("failed to compile iv fluid regex")?,
            iv_volume: Regex::new(r"(?i)\b\d+\s*ml\b").context("failed to compile volume regex")?,
            iv_timed_infusion: Regex::new(r"(?i)\d+\s*(?:hour|hr|min)s?\s+infusion")
                .context("failed to compile timed infusion regex")?,
            iv_equipment: Regex::new(
                r"(?i)flow\s*rate|iv\s*fluid|drug.*electrolyte|electrolyte.*drug",
            )
            .context("failed to compile iv equipment regex")?,
            iv_route: Regex::new(r"(?i)\b(?:iv|intravenous(?:ly)?)\b")
                .context("failed to compile iv route regex")?,
            row_shape: RowShape::new(vocabulary)?,
            subcutaneous: phrase_regex(&vocabulary.subcutaneous_markers, "subcutaneous marker")?,
            oral_supply: Regex::new(r"(?i)starting\s+dose|please\s+supply")
                .context("failed to compile oral supply regex")?,
            oral_form: Regex::new(r"(?i)\btablets?\b|\bcapsules?\b")
                .context("failed to compile oral form regex")?,
            oral_directions: Regex::new(r"(?i)take\s+with\s+food|orally\s+days")
                .context("failed to compile oral directions regex")?,
            title_area_chars: vocabulary.title_area_chars,
        })
    }

    pub fn classify_administration(
        &self,
        stream: &LineStream,
        sections: &Sections,
    ) -> AdministrationDecision {
        let mut iv_signals = Vec::<&'static str>::new();
        let mut oral_signals = Vec::<&'static str>::new();

        let any_line = |regex: &Regex| stream.iter().any(|(_, line)| regex.is_match(line));

        if any_line(&self.iv_fluid) {
            iv_signals.push("iv_fluid");
        }
        if any_line(&self.iv_volume) {
            iv_signals.push("volume_ml");
        }
        if any_line(&self.iv_timed_infusion) {
            iv_signals.push("timed_infusion");
        }
        if any_line(&self.iv_equipment) {
            iv_signals.push("flow_rate_or_iv_fluid");
        }
        if stream
            .iter()
            .any(|(index, line)| self.is_table_drug_mention(index, line, sections))
        {
            iv_signals.push("infusion_drug_in_table");
        }
        if stream
            .iter()
            .any(|(index, line)| self.is_intravenous_row(index, line, sections))
        {
            iv_signals.push("intravenous_table_row");
        }
        if any_line(&self.subcutaneous) {
            iv_signals.push("subcutaneous_route");
        }

        if any_line(&self.oral_supply) {
            oral_signals.push("starting_dose_or_supply");
        }
        if any_line(&self.oral_form) {
            oral_signals.push("tablets_or_capsules");
        }
        if any_line(&self.oral_directions) {
            oral_signals.push("oral_directions");
        }

        let table_signal = iv_signals
            .iter()
            .any(|signal| TABLE_SIGNALS.contains(signal));
        let kind = if iv_signals.len() >= 2 && oral_signals.is_empty() {
            AdministrationType::InfusionOnly
        } else if iv_signals.len() >= 2 {
            AdministrationType::Mixed
        } else if table_signal && oral_signals.is_empty() {
            AdministrationType::InfusionOnly
        } else {
            AdministrationType::OralOnly
        };

        debug!(
            administration = kind.as_str(),
            iv = ?iv_signals,
            oral = ?oral_signals,
            "administration classified"
        );

        AdministrationDecision {
            kind,
            iv_signals,
            oral_signals,
        }
    }

    /// An infusion drug counts only on a line carrying a table separator,
    /// never in prose or warnings.
    fn is_table_drug_mention(&self, index: usize, line: &str, sections: &Sections) -> bool {
        if matches!(
            sections.kind_of(index),
            SectionKind::Warnings | SectionKind::Narrative
        ) {
            return false;
        }
        line.contains('|')
            && !self.narrative_lines.is_match(line)
            && self.infusion_drug.is_match(line)
    }

    fn is_intravenous_row(&self, index: usize, line: &str, sections: &Sections) -> bool {
        sections.kind_of(index) == SectionKind::DrugTable
            && self.iv_route.is_match(line)
            && self.row_shape.matches(line)
    }

    /// Every abbreviation match outside regimen-context lines and trial
    /// references, before nested-match elimination.
    pub fn collect_candidates(&self, stream: &LineStream) -> Vec<CandidateMatch> {
        let mut candidates = Vec::<CandidateMatch>::new();

        for (line_index, line) in stream.iter() {
            if self.context_lines.is_match(line) {
                debug!(line = line_index, "regimen context line ignored");
                continue;
            }

            for pattern in &self.abbreviations {
                for captures in pattern.regex.captures_iter(line) {
                    let Some(whole) = captures.get(0) else {
                        continue;
                    };
                    let trailing = line[whole.end()..]
                        .chars()
                        .take(TRIAL_LOOKAHEAD_CHARS)
                        .collect::<String>();
                    if self.trial_reference.is_match(&trailing) {
                        continue;
                    }

                    let suffix = captures
                        .get(2)
                        .and_then(|value| value.as_str().parse::<u32>().ok())
                        .filter(|days| CYCLE_SUFFIX_DAYS.contains(days));
                    let column = line[..whole.start()].chars().count();

                    candidates.push(CandidateMatch {
                        line_index,
                        start: whole.start(),
                        end: whole.end(),
                        label: pattern.label.clone(),
                        suffix,
                        in_title_area: stream.in_title_area(
                            line_index,
                            column,
                            self.title_area_chars,
                        ),
                    });
                }
            }
        }

        candidates.sort_by_key(|candidate| (candidate.line_index, candidate.start, candidate.end));
        candidates
    }

    pub fn resolve_regimen_name(&self, stream: &LineStream) -> RegimenResolution {
        let candidates = discard_nested(self.collect_candidates(stream));
        let scores = score_candidates(&candidates);

        if let Some((winner, tied_labels)) = select_candidate(&scores) {
            let name = match winner.suffix {
                Some(days) => format!("{} {}", winner.label, days),
                None => winner.label.clone(),
            };
            debug!(
                regimen = %name,
                count = winner.count,
                title_count = winner.title_count,
                tied = tied_labels.len(),
                "regimen name resolved"
            );
            return RegimenResolution {
                name: Some(name),
                suffix_days: winner.suffix,
                source: RegimenNameSource::Abbreviation,
                tied_labels,
                scores,
            };
        }

        if let Some(label) = self.patient_label_name(stream) {
            return RegimenResolution {
                name: Some(label),
                suffix_days: None,
                source: RegimenNameSource::PatientLabel,
                tied_labels: Vec::new(),
                scores,
            };
        }

        RegimenResolution {
            name: None,
            suffix_days: None,
            source: RegimenNameSource::Unresolved,
            tied_labels: Vec::new(),
            scores,
        }
    }

    fn patient_label_name(&self, stream: &LineStream) -> Option<String> {
        stream
            .iter()
            .filter(|(index, _)| stream.in_title_area(*index, 0, self.title_area_chars))
            .find_map(|(_, line)| {
                let name = self.patient_label.captures(line)?.get(1)?.as_str().trim();
                (name.chars().count() <= MAX_PATIENT_LABEL_CHARS).then(|| name.to_string())
            })
    }
}

/// Drops every match fully contained in a strictly longer match on the same
/// line.
pub fn discard_nested(candidates: Vec<CandidateMatch>) -> Vec<CandidateMatch> {
    candidates
        .iter()
        .filter(|candidate| {
            let nested = candidates.iter().any(|other| other.contains(candidate));
            if nested {
                debug!(
                    line = candidate.line_index,
                    label = %candidate.label,
                    "nested abbreviation match discarded"
                );
            }
            !nested
        })
        .cloned()
        .collect()
}

/// Per-label totals, in order of first occurrence.
pub fn score_candidates(candidates: &[CandidateMatch]) -> Vec<CandidateScore> {
    let mut scores = Vec::<CandidateScore>::new();

    for candidate in candidates {
        let position = scores
            .iter()
            .position(|score| score.label == candidate.label);
        let score = match position {
            Some(position) => &mut scores[position],
            None => {
                scores.push(CandidateScore {
                    label: candidate.label.clone(),
                    count: 0,
                    title_count: 0,
                    first_line: candidate.line_index,
                    first_start: candidate.start,
                    suffix: None,
                });
                let last = scores.len() - 1;
                &mut scores[last]
            }
        };

        score.count += 1;
        if candidate.in_title_area {
            score.title_count += 1;
        }
        if score.suffix.is_none() {
            score.suffix = candidate.suffix;
        }
    }

    scores
}

/// Highest count wins; ties go to the higher title-area count, then to the
/// earliest occurrence. Returns the winner and every label that shared the
/// top count.
pub fn select_candidate(scores: &[CandidateScore]) -> Option<(&CandidateScore, Vec<String>)> {
    let top_count = scores.iter().map(|score| score.count).max()?;
    let tied = scores
        .iter()
        .filter(|score| score.count == top_count)
        .collect::<Vec<&CandidateScore>>();

    let winner = tied.iter().copied().min_by(|a, b| {
        b.title_count
            .cmp(&a.title_count)
            .then(a.first_line.cmp(&b.first_line))
            .then(a.first_start.cmp(&b.first_start))
    })?;

    Some((
        winner,
        tied.iter().map(|score| score.label.clone()).collect(),
    ))
}
