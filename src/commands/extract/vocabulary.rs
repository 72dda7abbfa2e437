use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::util::read_json;

pub const DEFAULT_TITLE_AREA_CHARS: usize = 800;

/// Fixed matching vocabularies for one extraction run.
///
/// Loaded once, then only borrowed. A JSON file may replace any subset of the
/// lists; missing keys keep their built-in values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    pub infusion_drugs: Vec<String>,
    pub regimen_abbreviations: Vec<String>,
    pub narrative_phrases: Vec<String>,
    pub regimen_context_phrases: Vec<String>,
    pub trial_reference_words: Vec<String>,
    pub subcutaneous_markers: Vec<String>,
    pub oral_markers: Vec<String>,
    pub frequency_codes: Vec<FrequencyCode>,
    pub generic_title_words: Vec<String>,
    pub title_area_chars: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FrequencyCode {
    pub phrase: String,
    pub code: String,
}

impl FrequencyCode {
    fn new(phrase: &str, code: &str) -> Self {
        Self {
            phrase: phrase.to_string(),
            code: code.to_string(),
        }
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            infusion_drugs: to_strings(&[
                "FLUDARABINE",
                "CYTARABINE",
                "GEMCITABINE",
                "OXALIPLATIN",
                "BENDAMUSTINE",
                "RITUXIMAB",
                "CYCLOPHOSPHAMIDE",
                "IFOSFAMIDE",
                "DOXORUBICIN",
                "EPIRUBICIN",
                "BLEOMYCIN",
                "VINCRISTINE",
                "VINBLASTINE",
                "ETOPOSIDE",
                "CARBOPLATIN",
                "CISPLATIN",
                "PACLITAXEL",
                "DOCETAXEL",
                "IDARUBICIN",
                "DAUNORUBICIN",
                "MITOXANTRONE",
                "CARFILZOMIB",
                "BORTEZOMIB",
                "METHOTREXATE",
                "MESNA",
                "OFATUMUMAB",
                "OBINUTUZUMAB",
                "ARSENIC TRIOXIDE",
                "ARSENIC",
                "INOTUZUMAB",
                "AMSACRINE",
                "CLOFARABINE",
                "NELARABINE",
                "ATG",
                "ANTITHYMOCYTE",
                "METHYLPREDNISOLONE",
                "HYDROCORTISONE",
                "DARATUMUMAB",
                "ISATUXIMAB",
                "VENETOCLAX",
                "IBRUTINIB",
            ]),
            regimen_abbreviations: to_strings(&[
                "FLAG",
                "BEACOPP",
                "BEACOP",
                "R-CHOP",
                "RCHOP",
                "R-CHOEP",
                "CHOEP",
                "R-CODOX-M",
                "R-CODOX",
                "CODOX-M",
                "CODOX",
                "R-IVAC",
                "IVAC",
                "ABVD",
                "GemOx",
                "GEMOX",
                "D-VTD",
                "VTD",
                "CarLenDex",
                "CARLENDEX",
                "DHAP",
                "FLAMSA",
                "BuCy",
                "BEAM",
                "ESHAP",
            ]),
            narrative_phrases: to_strings(&[
                "alternating",
                "followed by",
                "further dose of",
                "further doses of",
                "prior to",
                "instead of",
                "pre-medication",
                "pre medication",
                "pre-treatment",
                "pre treatment",
                "two cycles",
                "subsequent dose",
                "subsequent doses",
                "is given on",
                "is given as",
                "is given with",
                "are given on",
                "are given as",
                "are given with",
                "given with",
            ]),
            regimen_context_phrases: to_strings(&[
                "alternating with",
                "alternating",
                "followed by",
                "instead of",
                "prior to",
                "switch to",
                "switched to",
                "after completion of",
            ]),
            trial_reference_words: to_strings(&["vs", "versus", "v", "trial", "study", "ve"]),
            subcutaneous_markers: to_strings(&[
                "subcutaneous",
                "subcutaneously",
                "s/c",
                "sc inj",
                "sc injection",
            ]),
            oral_markers: to_strings(&["po", "p.o.", "oral", "orally"]),
            frequency_codes: vec![
                FrequencyCode::new("once daily", "OD"),
                FrequencyCode::new("twice daily", "BD"),
                FrequencyCode::new("three times daily", "TDS"),
                FrequencyCode::new("four times daily", "QDS"),
                FrequencyCode::new("daily", "OD"),
                FrequencyCode::new("od", "OD"),
                FrequencyCode::new("bd", "BD"),
                FrequencyCode::new("tds", "TDS"),
                FrequencyCode::new("qds", "QDS"),
            ],
            generic_title_words: to_strings(&[
                "maintenance",
                "treatment",
                "therapy",
                "regimen",
                "protocol",
                "induction",
                "consolidation",
                "information",
                "further",
                "patient",
                "please",
                "refer",
                "supply",
                "cycle",
                "stage",
                "course",
                "this",
            ]),
            title_area_chars: DEFAULT_TITLE_AREA_CHARS,
        }
    }
}

impl Vocabulary {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let vocabulary: Vocabulary = read_json(path)
            .with_context(|| format!("failed to load vocabulary overrides: {}", path.display()))?;
        info!(
            path = %path.display(),
            infusion_drugs = vocabulary.infusion_drugs.len(),
            regimen_abbreviations = vocabulary.regimen_abbreviations.len(),
            "loaded vocabulary overrides"
        );
        Ok(vocabulary)
    }
}

/// Frequency whitelist looked up by captured phrase, whitespace-insensitive.
pub fn lookup_frequency<'a>(codes: &'a [FrequencyCode], phrase: &str) -> Option<&'a str> {
    let normalized = collapse_whitespace(phrase).to_ascii_lowercase();
    codes
        .iter()
        .find(|entry| collapse_whitespace(&entry.phrase).to_ascii_lowercase() == normalized)
        .map(|entry| entry.code.as_str())
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Entries sorted longest-first; equal lengths keep their listed order and
/// case-insensitive duplicates keep the first spelling.
pub fn longest_first(values: &[String]) -> Vec<String> {
    let mut sorted = Vec::<String>::new();
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty()
            || sorted
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(trimmed))
        {
            continue;
        }
        sorted.push(trimmed.to_string());
    }
    sorted.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
    sorted
}

/// Escaped phrase whose internal spaces match any whitespace run.
pub fn phrase_pattern(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<String>>()
        .join(r"\s+")
}

/// Case-insensitive whole-word alternation over phrases, longest first.
pub fn phrase_regex(phrases: &[String], what: &str) -> Result<Regex> {
    let alternation = longest_first(phrases)
        .iter()
        .map(|phrase| phrase_pattern(phrase))
        .collect::<Vec<String>>()
        .join("|");
    let pattern = if alternation.is_empty() {
        // never matches
        r"\b\B".to_string()
    } else {
        format!(r"(?i)(?:^|[^A-Za-z0-9])(?:{alternation})(?:$|[^A-Za-z0-9])")
    };

    Regex::new(&pattern).with_context(|| format!("failed to compile {what} regex"))
}

/// Drug names not preceded by a letter or hyphen (so `pre-rituximab` is not
/// RITUXIMAB) nor followed by a letter. Group 1 holds the matched name.
pub fn drug_name_regex(drugs: &[String]) -> Result<Regex> {
    let alternation = longest_first(drugs)
        .iter()
        .map(|drug| phrase_pattern(drug))
        .collect::<Vec<String>>()
        .join("|");
    let pattern = if alternation.is_empty() {
        r"\b\B".to_string()
    } else {
        format!(r"(?i)(?:^|[^A-Za-z\-])({alternation})(?:$|[^A-Za-z])")
    };

    Regex::new(&pattern).context("failed to compile infusion drug regex")
}

/// Canonical vocabulary spelling for a case-insensitive match.
pub fn canonical_entry<'a>(entries: &'a [String], matched: &str) -> Option<&'a str> {
    let wanted = collapse_whitespace(matched);
    entries
        .iter()
        .map(|entry| entry.trim())
        .find(|entry| collapse_whitespace(entry).eq_ignore_ascii_case(&wanted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_first_checks_compound_codes_before_substrings() {
        let sorted = longest_first(&to_strings(&["IVAC", "R-IVAC", "R-CODOX-M", "CODOX"]));
        assert_eq!(sorted, vec!["R-CODOX-M", "R-IVAC", "CODOX", "IVAC"]);
    }

    #[test]
    fn longest_first_drops_case_variants() {
        let sorted = longest_first(&to_strings(&["GemOx", "VTD", "GEMOX"]));
        assert_eq!(sorted, vec!["GemOx", "VTD"]);
    }

    #[test]
    fn phrase_regex_tolerates_whitespace_runs_and_case() {
        let regex = phrase_regex(&to_strings(&["followed by"]), "test").expect("compiles");
        assert!(regex.is_match("R-CHOP  FOLLOWED\tBY radiotherapy"));
        assert!(!regex.is_match("followedby"));
    }

    #[test]
    fn phrase_regex_respects_word_edges_for_short_markers() {
        let regex = phrase_regex(&to_strings(&["po"]), "test").expect("compiles");
        assert!(regex.is_match("100mg po daily"));
        assert!(!regex.is_match("hypokalaemia"));
    }

    #[test]
    fn drug_names_ignore_prefixed_mentions() {
        let vocabulary = Vocabulary::default();
        let regex = drug_name_regex(&vocabulary.infusion_drugs).expect("compiles");

        let captured = regex
            .captures("1 | Rituximab 375mg/m2 | IV")
            .and_then(|captures| captures.get(1))
            .map(|found| found.as_str());
        assert_eq!(captured, Some("Rituximab"));
        assert_eq!(
            canonical_entry(&vocabulary.infusion_drugs, "Rituximab"),
            Some("RITUXIMAB")
        );

        assert!(!regex.is_match("give pre-rituximab paracetamol"));
        assert!(!regex.is_match("ATGAM"));
    }

    #[test]
    fn frequency_whitelist_rejects_generic_words() {
        let codes = Vocabulary::default().frequency_codes;
        assert_eq!(lookup_frequency(&codes, "Twice  Daily"), Some("BD"));
        assert_eq!(lookup_frequency(&codes, "tds"), Some("TDS"));
        assert_eq!(lookup_frequency(&codes, "days"), None);
    }

    #[test]
    fn partial_override_keeps_builtin_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vocabulary.json");
        std::fs::write(&path, r#"{"regimen_abbreviations": ["POMP"]}"#).expect("write");

        let vocabulary = Vocabulary::load(Some(&path)).expect("loads");
        assert_eq!(vocabulary.regimen_abbreviations, vec!["POMP".to_string()]);
        assert!(vocabulary.infusion_drugs.contains(&"ETOPOSIDE".to_string()));
        assert_eq!(vocabulary.title_area_chars, DEFAULT_TITLE_AREA_CHARS);
    }
}
