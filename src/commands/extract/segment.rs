use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use super::normalize::LineStream;
use super::vocabulary::{Vocabulary, drug_name_regex, phrase_regex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    DrugTable,
    OralDosing,
    BloodTests,
    AdditionalTherapy,
    Narrative,
    RotaInformation,
    Warnings,
    Unclassified,
}

impl SectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DrugTable => "drug_table",
            Self::OralDosing => "oral_dosing",
            Self::BloodTests => "blood_tests",
            Self::AdditionalTherapy => "additional_therapy",
            Self::Narrative => "narrative",
            Self::RotaInformation => "rota_information",
            Self::Warnings => "warnings",
            Self::Unclassified => "unclassified",
        }
    }
}

/// Half-open line range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub start: usize,
    pub end: usize,
    pub opened_by_header: bool,
}

/// Non-overlapping partition of a line stream.
#[derive(Debug, Clone, Default)]
pub struct Sections {
    sections: Vec<Section>,
    kind_by_line: Vec<SectionKind>,
}

impl Sections {
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> + '_ {
        self.sections.iter()
    }

    pub fn kind_of(&self, index: usize) -> SectionKind {
        self.kind_by_line
            .get(index)
            .copied()
            .unwrap_or(SectionKind::Unclassified)
    }

    pub fn is_header_line(&self, index: usize) -> bool {
        self.sections
            .iter()
            .any(|section| section.opened_by_header && section.start == index)
    }

    /// Line indices, in order, whose section kind is one of `kinds`.
    pub fn lines_in(&self, kinds: &[SectionKind]) -> Vec<usize> {
        self.kind_by_line
            .iter()
            .enumerate()
            .filter_map(|(index, kind)| kinds.contains(kind).then_some(index))
            .collect()
    }
}

const KEYWORD_HEADERS: &[(SectionKind, &[&str])] = &[
    (
        SectionKind::BloodTests,
        &[
            "blood tests",
            "blood test",
            "blood results",
            "haematology parameters",
            "biochemistry parameters",
            "tests required",
        ],
    ),
    (
        SectionKind::AdditionalTherapy,
        &[
            "additional therapy",
            "additional therapies",
            "supportive medication",
            "supportive medications",
            "take home medication",
            "take home medications",
        ],
    ),
    (
        SectionKind::RotaInformation,
        &["further information", "rota information", "please supply"],
    ),
    (
        SectionKind::Warnings,
        &[
            "warnings",
            "warning",
            "special precautions",
            "drug interactions",
            "cautions",
            "caution",
        ],
    ),
    (
        SectionKind::Narrative,
        &["notes", "comments", "background", "treatment summary"],
    ),
];

const COLUMN_WORDS: &[&str] = &[
    "drug",
    "dose",
    "route",
    "day",
    "fluid",
    "volume",
    "duration",
    "rate",
    "administration",
];

const MAX_HEADER_LINE_CHARS: usize = 80;
const MAX_COLUMN_HEADER_CHARS: usize = 100;

/// Single-line test for a dosing row written without a table header: an
/// infusion drug, a dose with a mass unit and a route token on one line,
/// outside narrative prose.
pub struct RowShape {
    drug: Regex,
    dose: Regex,
    route: Regex,
    narrative: Regex,
}

impl RowShape {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self> {
        Ok(Self {
            drug: drug_name_regex(&vocabulary.infusion_drugs)?,
            dose: Regex::new(r"(?i)\b\d+(?:\.\d+)?\s*(?:micrograms?|mcg|mg|g)\b")
                .context("failed to compile row dose regex")?,
            route: Regex::new(r"(?i)\b(?:iv|intravenous(?:ly)?|sc|s/c|subcut\w*)\b")
                .context("failed to compile row route regex")?,
            narrative: phrase_regex(&vocabulary.narrative_phrases, "narrative phrase")?,
        })
    }

    pub fn matches(&self, line: &str) -> bool {
        self.drug.is_match(line)
            && self.dose.is_match(line)
            && self.route.is_match(line)
            && !self.narrative.is_match(line)
    }
}

pub struct Segmenter {
    keyword_headers: Vec<(SectionKind, Regex)>,
    column_words: Vec<Regex>,
    starting_dose: Regex,
    row_shape: RowShape,
}

impl Segmenter {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self> {
        let mut keyword_headers = Vec::<(SectionKind, Regex)>::new();
        for (kind, phrases) in KEYWORD_HEADERS {
            let mut sorted = phrases.to_vec();
            sorted.sort_by(|a, b| b.len().cmp(&a.len()));
            let alternation = sorted
                .iter()
                .map(|phrase| noisy_phrase_pattern(phrase))
                .collect::<Vec<String>>()
                .join("|");
            let regex = Regex::new(&format!(
                r"(?i)^[\s\-=*#]*(?:{alternation})(?:$|[^A-Za-z])"
            ))
            .with_context(|| format!("failed to compile {} header regex", kind.as_str()))?;
            keyword_headers.push((*kind, regex));
        }

        let column_words = COLUMN_WORDS
            .iter()
            .map(|word| {
                Regex::new(&format!(r"(?i)\b{word}s?\b"))
                    .with_context(|| format!("failed to compile column word regex for {word}"))
            })
            .collect::<Result<Vec<Regex>>>()?;

        Ok(Self {
            keyword_headers,
            column_words,
            starting_dose: Regex::new(r"(?i)\bstarting\s+dose\b")
                .context("failed to compile starting dose regex")?,
            row_shape: RowShape::new(vocabulary)?,
        })
    }

    pub fn segment(&self, stream: &LineStream) -> Sections {
        let mut sections = Vec::<Section>::new();
        let mut current = Section {
            kind: SectionKind::Unclassified,
            start: 0,
            end: 0,
            opened_by_header: false,
        };

        for (index, line) in stream.iter() {
            let Some(kind) = self.header_kind(line, current.kind) else {
                continue;
            };
            if index > current.start {
                current.end = index;
                sections.push(current);
            }
            debug!(line = index, kind = kind.as_str(), "section boundary");
            current = Section {
                kind,
                start: index,
                end: index,
                opened_by_header: true,
            };
        }

        if stream.len() > current.start {
            current.end = stream.len();
            sections.push(current);
        }

        let mut kind_by_line = vec![SectionKind::Unclassified; stream.len()];
        for section in &sections {
            for slot in &mut kind_by_line[section.start..section.end] {
                *slot = section.kind;
            }
        }

        Sections {
            sections,
            kind_by_line,
        }
    }

    /// Section kind opened by `line`, given the kind currently open.
    pub fn header_kind(&self, line: &str, current: SectionKind) -> Option<SectionKind> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        if trimmed.chars().count() <= MAX_HEADER_LINE_CHARS {
            for (kind, regex) in &self.keyword_headers {
                if regex.is_match(trimmed) {
                    return Some(*kind);
                }
            }
        }

        if self.starting_dose.is_match(trimmed) {
            return (current != SectionKind::OralDosing).then_some(SectionKind::OralDosing);
        }
        if current == SectionKind::DrugTable {
            return None;
        }
        if self.is_column_header(trimmed) {
            return Some(SectionKind::DrugTable);
        }

        let opens_from_prose = matches!(
            current,
            SectionKind::Unclassified | SectionKind::Narrative | SectionKind::OralDosing
        );
        if opens_from_prose
            && (trimmed.matches('|').count() >= 2 || self.row_shape.matches(trimmed))
        {
            return Some(SectionKind::DrugTable);
        }

        None
    }

    fn is_column_header(&self, line: &str) -> bool {
        if line.chars().count() > MAX_COLUMN_HEADER_CHARS
            || line.chars().any(|character| character.is_ascii_digit())
        {
            return false;
        }

        self.column_words
            .iter()
            .filter(|regex| regex.is_match(line))
            .count()
            >= 2
    }
}

/// Letters may be split by single spaces and words run together; common OCR
/// digit-for-letter swaps are accepted.
fn noisy_phrase_pattern(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|word| {
            word.chars()
                .map(noisy_letter)
                .collect::<Vec<String>>()
                .join(r"\s?")
        })
        .collect::<Vec<String>>()
        .join(r"\s*")
}

fn noisy_letter(character: char) -> String {
    match character.to_ascii_lowercase() {
        'o' => "[o0]".to_string(),
        'l' => "[l1|]".to_string(),
        'i' => "[i1l|]".to_string(),
        's' => "[s5]".to_string(),
        other => regex::escape(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(text: &str) -> (LineStream, Sections) {
        let stream = LineStream::from_text(text);
        let sections = Segmenter::new(&Vocabulary::default())
            .expect("segmenter")
            .segment(&stream);
        (stream, sections)
    }

    #[test]
    fn partitions_every_line_exactly_once() {
        let (stream, sections) = segment(
            "R-CHOP 21\nDrug Dose Route Day\nRITUXIMAB 375mg/m2 IV day 1\nBLOOD TESTS\nPlts < 100\nWarnings\nAvoid grapefruit",
        );

        let covered = sections
            .iter()
            .map(|section| section.end - section.start)
            .sum::<usize>();
        assert_eq!(covered, stream.len());

        let kinds = sections.iter().map(|section| section.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                SectionKind::Unclassified,
                SectionKind::DrugTable,
                SectionKind::BloodTests,
                SectionKind::Warnings,
            ]
        );
        assert_eq!(sections.kind_of(0), SectionKind::Unclassified);
        assert_eq!(sections.kind_of(3), SectionKind::BloodTests);
        assert!(sections.is_header_line(3));
        assert!(!sections.is_header_line(4));
    }

    #[test]
    fn tolerates_spaced_ocr_headers() {
        let (_, sections) = segment("intro\nB L O O D  T E S T S\nNeuts < 1.0");
        assert_eq!(sections.kind_of(1), SectionKind::BloodTests);
        assert_eq!(sections.kind_of(2), SectionKind::BloodTests);

        let (_, sections) = segment("intro\nFURTHER INF0RMATI0N:\ntext");
        assert_eq!(sections.kind_of(1), SectionKind::RotaInformation);
    }

    #[test]
    fn long_prose_starting_with_keyword_is_not_a_header() {
        let (_, sections) = segment(
            "intro\nNotes on the management of tumour lysis are given in the local guideline for all haematology patients",
        );
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn pipe_rows_open_a_table_only_from_prose() {
        let (_, sections) = segment("Regimen\n| ETOPOSIDE | 100mg | IV |\nWarnings\n| a | b | c |");
        assert_eq!(sections.kind_of(1), SectionKind::DrugTable);
        assert_eq!(sections.kind_of(3), SectionKind::Warnings);
    }

    #[test]
    fn headerless_dosing_row_opens_a_drug_table() {
        let (_, sections) = segment(
            "R-CHOP 21\nRITUXIMAB 375mg/m2 IV day 1\nCYCLOPHOSPHAMIDE 750mg/m2 IV day 1\nBLOOD TESTS\nPlts < 100",
        );
        assert_eq!(sections.kind_of(0), SectionKind::Unclassified);
        assert_eq!(sections.kind_of(1), SectionKind::DrugTable);
        assert_eq!(sections.kind_of(2), SectionKind::DrugTable);
        assert_eq!(sections.kind_of(3), SectionKind::BloodTests);
    }

    #[test]
    fn starting_dose_keeps_following_prose_out_of_the_drug_table() {
        let (_, sections) = segment(
            "Imatinib for chronic myeloid leukaemia\nStarting dose 400 mg OD\nDo not take at the same time as METHOTREXATE\nDrink 2000 ml of fluid every day",
        );
        assert_eq!(sections.kind_of(1), SectionKind::OralDosing);
        assert_eq!(sections.kind_of(2), SectionKind::OralDosing);
        assert_eq!(sections.kind_of(3), SectionKind::OralDosing);
        assert!(sections.lines_in(&[SectionKind::DrugTable]).is_empty());
    }

    #[test]
    fn column_header_with_digits_is_a_data_row() {
        let segmenter = Segmenter::new(&Vocabulary::default()).expect("segmenter");
        assert_eq!(
            segmenter.header_kind("Drug Dose Route", SectionKind::Unclassified),
            Some(SectionKind::DrugTable)
        );
        assert_eq!(
            segmenter.header_kind("ETOPOSIDE dose 100mg day 1", SectionKind::Unclassified),
            None
        );
    }
}
