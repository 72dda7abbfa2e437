use anyhow::{Context, Result};
use regex::Regex;

use super::classify::CYCLE_SUFFIX_DAYS;
use super::normalize::LineStream;
use super::segment::{SectionKind, Sections};
use crate::model::{CycleInfo, CycleSource};

pub const DEFAULT_CYCLE_DAYS: u32 = 28;

const PHRASE_SECTIONS: &[SectionKind] = &[
    SectionKind::DrugTable,
    SectionKind::OralDosing,
    SectionKind::RotaInformation,
    SectionKind::Narrative,
];

pub struct CycleInfoParser {
    phrase: Regex,
}

impl CycleInfoParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            phrase: Regex::new(
                r"(?i)\b(\d{1,2})\s*-?\s*days?\s+cycles?\b|\bevery\s+(\d{1,2})\s*days?\b|\bcycles?\s+(?:every|of)\s+(\d{1,2})\s*days?\b",
            )
            .context("failed to compile cycle phrase regex")?,
        })
    }

    /// Regimen-name suffix first, then an explicit phrase, then 28 days.
    pub fn parse(
        &self,
        stream: &LineStream,
        sections: &Sections,
        regimen_suffix: Option<u32>,
    ) -> CycleInfo {
        if let Some(days) = regimen_suffix.filter(|days| CYCLE_SUFFIX_DAYS.contains(days)) {
            return CycleInfo::from_days(days, CycleSource::RegimenSuffix);
        }

        sections
            .lines_in(PHRASE_SECTIONS)
            .into_iter()
            .find_map(|index| self.phrase_days(stream.line(index)))
            .map(|days| CycleInfo::from_days(days, CycleSource::ExplicitPhrase))
            .unwrap_or_else(|| CycleInfo::from_days(DEFAULT_CYCLE_DAYS, CycleSource::Default))
    }

    pub fn phrase_days(&self, line: &str) -> Option<u32> {
        self.phrase.captures_iter(line).find_map(|captures| {
            (1..=3)
                .find_map(|group| captures.get(group))
                .and_then(|value| value.as_str().parse::<u32>().ok())
                .filter(|days| CYCLE_SUFFIX_DAYS.contains(days))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::extract::segment::Segmenter;
    use crate::commands::extract::vocabulary::Vocabulary;

    fn parse(text: &str, suffix: Option<u32>) -> CycleInfo {
        let stream = LineStream::from_text(text);
        let sections = Segmenter::new(&Vocabulary::default())
            .expect("segmenter")
            .segment(&stream);
        CycleInfoParser::new()
            .expect("parser")
            .parse(&stream, &sections, suffix)
    }

    #[test]
    fn regimen_suffix_wins_over_phrase() {
        let cycle = parse("Notes\nRepeat every 14 days", Some(21));
        assert_eq!(cycle.length_days, 21);
        assert_eq!(cycle.delay_weeks, 3);
        assert_eq!(cycle.source, CycleSource::RegimenSuffix);
    }

    #[test]
    fn explicit_phrases_in_scoped_sections() {
        assert_eq!(parse("Notes\nRepeat every 14 days", None).delay_weeks, 2);
        assert_eq!(
            parse("Notes\nGiven as a 21-day cycle", None).source,
            CycleSource::ExplicitPhrase
        );
        assert_eq!(parse("Notes\ncycles of 35 days", None).length_days, 35);
    }

    #[test]
    fn defaults_to_four_weeks() {
        let cycle = parse("Repeat every 14 days\nNotes\nevery 2 days", None);
        assert_eq!(cycle.length_days, DEFAULT_CYCLE_DAYS);
        assert_eq!(cycle.delay_label(), "4w");
        assert_eq!(cycle.source, CycleSource::Default);
    }
}
