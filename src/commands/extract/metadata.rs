use anyhow::{Context, Result};
use regex::Regex;

use super::normalize::LineStream;
use super::vocabulary::Vocabulary;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub document_code: Option<String>,
    pub drug_name: Option<String>,
    pub indication: Option<String>,
}

pub struct MetadataParser {
    labelled_code: Regex,
    bare_code: Regex,
    drug_for: Regex,
    generic_words: Vec<String>,
    title_area_chars: usize,
}

impl MetadataParser {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self> {
        Ok(Self {
            labelled_code: Regex::new(
                r"(?i)document\s*code\s*[:\-]\s*((?:[a-z]-?)?rota\s*\d+[a-z]?|[a-z][a-z0-9\-]+)",
            )
            .context("failed to compile document code label regex")?,
            bare_code: Regex::new(r"(?i)\b((?:h-?|[a-z])rota\s*\d+[a-z]?)\b")
                .context("failed to compile document code regex")?,
            drug_for: Regex::new(r"\b([A-Z][a-z]{4,}|[A-Z]{5,})\s+for\s+([^()]+)")
                .context("failed to compile drug indication regex")?,
            generic_words: vocabulary
                .generic_title_words
                .iter()
                .map(|word| word.to_ascii_lowercase())
                .collect(),
            title_area_chars: vocabulary.title_area_chars,
        })
    }

    pub fn parse(&self, stream: &LineStream) -> DocumentMetadata {
        let (drug_name, indication) = self
            .drug_and_indication(stream)
            .map(|(drug, indication)| (Some(drug), Some(indication)))
            .unwrap_or((None, None));

        DocumentMetadata {
            document_code: self.document_code(stream),
            drug_name,
            indication,
        }
    }

    /// A `Document Code:` label anywhere wins over a bare rota code.
    pub fn document_code(&self, stream: &LineStream) -> Option<String> {
        let labelled = stream.iter().find_map(|(_, line)| {
            let code = self.labelled_code.captures(line)?.get(1)?.as_str();
            Some(code.replace(' ', "").trim_end_matches('_').to_string())
        });
        if labelled.is_some() {
            return labelled;
        }

        stream.iter().find_map(|(_, line)| {
            let code = self.bare_code.captures(line)?.get(1)?.as_str();
            Some(code.replace(' ', ""))
        })
    }

    /// `<Drug> for <indication>` within the title area.
    pub fn drug_and_indication(&self, stream: &LineStream) -> Option<(String, String)> {
        stream
            .iter()
            .take_while(|(index, _)| stream.in_title_area(*index, 0, self.title_area_chars))
            .find_map(|(_, line)| {
                let captures = self.drug_for.captures(line)?;
                let drug = captures.get(1)?.as_str().trim();
                if self.generic_words.contains(&drug.to_ascii_lowercase()) {
                    return None;
                }
                let indication = captures
                    .get(2)?
                    .as_str()
                    .split_whitespace()
                    .collect::<Vec<&str>>()
                    .join(" ");
                let indication = indication.trim_end_matches(['.', ',', ':', '-']).trim();
                if indication.is_empty() {
                    return None;
                }
                Some((drug.to_string(), indication.to_string()))
            })
    }
}
