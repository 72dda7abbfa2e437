use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use super::normalize::LineStream;
use super::segment::{SectionKind, Sections};
use crate::model::{BloodTestThreshold, Comparison, ReviewFlag, TestCode};

pub const DEFAULT_VALIDITY_DAYS: u32 = 7;
pub const DEFAULT_ACTION: &str = "Contact prescriber.";

const VALIDITY_SECTIONS: &[SectionKind] = &[
    SectionKind::BloodTests,
    SectionKind::RotaInformation,
    SectionKind::Warnings,
];

struct TestPattern {
    code: TestCode,
    threshold: Regex,
    mention: Regex,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BloodTestFindings {
    /// Discovery order; the assembler applies canonical ordering.
    pub thresholds: Vec<BloodTestThreshold>,
    pub validity_days: Option<u32>,
    pub flags: Vec<ReviewFlag>,
}

pub struct BloodTestParser {
    patterns: Vec<TestPattern>,
    comparison: Regex,
    action: Regex,
    times_uln: Regex,
    validity: Regex,
}

impl BloodTestParser {
    pub fn new() -> Result<Self> {
        let less = r"(?:<|less\s+than|below|under)";
        let greater = r"(?:>|greater\s+than|more\s+than|above|over)";
        let number = r"(\d+(?:\.\d+)?)";

        let specs: [(TestCode, String, &str); 5] = [
            (
                TestCode::Platelets,
                format!(r"(?i)\b(?:p[li1]a?ts?|platelets?)(?:\s+count)?\s*{less}\s*{number}"),
                r"(?i)\b(?:p[li1]a?ts|platelets?)\b",
            ),
            (
                TestCode::Neutrophils,
                format!(r"(?i)\b(?:neuts?|neutrophils?|anc)(?:\s+count)?\s*{less}\s*{number}"),
                r"(?i)\b(?:neuts?|neutrophils?)\b",
            ),
            (
                TestCode::Renal,
                format!(
                    r"(?i)\b(?:e?gfr|crcl|creatinine\s+clearance|renal(?:\s+function)?)\s*:?\s*{less}?\s*\.?\s*(\d+)\s*m[lL]\s*/\s*min"
                ),
                r"(?i)\b(?:e?gfr|crcl|creatinine\s+clearance|renal\s+function)\b",
            ),
            (
                TestCode::Bilirubin,
                format!(r"(?i)\bbili(?:rubin)?\s*{greater}\s*{number}"),
                r"(?i)\bbilirubin\b",
            ),
            (
                TestCode::Alt,
                format!(
                    r"(?:\bALT|(?i:\balanine\s+(?:amino)?transaminase))\s*(?i:{greater})\s*{number}"
                ),
                r"\bALT\b|(?i:\balanine\s+(?:amino)?transaminase)",
            ),
        ];

        let mut patterns = Vec::<TestPattern>::new();
        for (code, threshold, mention) in specs {
            patterns.push(TestPattern {
                code,
                threshold: Regex::new(&threshold).with_context(|| {
                    format!("failed to compile {} threshold regex", code.as_str())
                })?,
                mention: Regex::new(mention).with_context(|| {
                    format!("failed to compile {} mention regex", code.as_str())
                })?,
            });
        }

        Ok(Self {
            patterns,
            comparison: Regex::new(r"[<>]\s*\d").context("failed to compile comparison regex")?,
            action: Regex::new(
                r"(?i)\b(?:contact|discuss|delay|defer|withhold|omit|reduce|refer|inform|check|do\s+not)\b.*$",
            )
            .context("failed to compile action regex")?,
            times_uln: Regex::new(r"(?i)^\s*(?:x|times)\s*uln\b")
                .context("failed to compile ULN regex")?,
            validity: Regex::new(r"(?i)\bvalidity\b\D*?(\d+)\s*days?\b")
                .context("failed to compile validity regex")?,
        })
    }

    pub fn parse(&self, stream: &LineStream, sections: &Sections) -> BloodTestFindings {
        let mut findings = BloodTestFindings::default();
        let lines = sections.lines_in(&[SectionKind::BloodTests]);

        for &line_index in &lines {
            let line = stream.line(line_index);
            let mut matched_any = false;

            for pattern in &self.patterns {
                let Some(threshold) = self.parse_threshold(pattern, line, line_index) else {
                    continue;
                };
                matched_any = true;
                if findings
                    .thresholds
                    .iter()
                    .any(|existing| existing.test_code == threshold.test_code)
                {
                    debug!(
                        line = line_index,
                        test = threshold.test_code.as_str(),
                        "repeated threshold ignored"
                    );
                    continue;
                }
                findings.thresholds.push(threshold);
            }

            if !matched_any && self.comparison.is_match(line) {
                findings.flags.push(ReviewFlag::new(
                    "blood_tests",
                    format!(
                        "unrecognised threshold on line {}: '{}'",
                        line_index + 1,
                        line
                    ),
                ));
            }
        }

        for pattern in &self.patterns {
            let mentioned = lines
                .iter()
                .any(|index| pattern.mention.is_match(stream.line(*index)));
            let extracted = findings
                .thresholds
                .iter()
                .any(|threshold| threshold.test_code == pattern.code);
            if mentioned && !extracted {
                findings.flags.push(ReviewFlag::new(
                    "blood_tests",
                    format!(
                        "{} is mentioned but no threshold was recognised",
                        pattern.code.as_str()
                    ),
                ));
            }
        }

        findings.validity_days = sections
            .lines_in(VALIDITY_SECTIONS)
            .into_iter()
            .find_map(|index| self.validity_days(stream.line(index)));

        findings
    }

    fn parse_threshold(
        &self,
        pattern: &TestPattern,
        line: &str,
        line_index: usize,
    ) -> Option<BloodTestThreshold> {
        let captures = pattern.threshold.captures(line)?;
        let whole = captures.get(0)?;
        let raw = captures.get(1)?.as_str().trim_end_matches('.');
        let value = raw.parse::<f64>().ok()?;

        let tail = &line[whole.end()..];
        let per_uln = self.times_uln.is_match(tail);
        let message_text_line1 = threshold_message(pattern.code, raw, per_uln);

        Some(BloodTestThreshold {
            test_code: pattern.code,
            threshold_value: value,
            threshold_function: pattern.code.comparison(),
            message_text_line1,
            message_text_line3: self.action_sentence(tail),
            source_line: line_index,
        })
    }

    /// Clinical action following the threshold on the same line.
    pub fn action_sentence(&self, tail: &str) -> String {
        let Some(found) = self.action.find(tail) else {
            return DEFAULT_ACTION.to_string();
        };

        let sentence = found
            .as_str()
            .split_inclusive('.')
            .next()
            .unwrap_or(found.as_str())
            .trim();
        let mut characters = sentence.chars();
        let Some(first) = characters.next() else {
            return DEFAULT_ACTION.to_string();
        };

        let mut text = first.to_uppercase().collect::<String>();
        text.push_str(characters.as_str());
        if !text.ends_with('.') {
            text.push('.');
        }
        text
    }

    pub fn validity_days(&self, line: &str) -> Option<u32> {
        self.validity
            .captures(line)?
            .get(1)?
            .as_str()
            .parse::<u32>()
            .ok()
            .filter(|days| *days > 0)
    }
}

fn threshold_message(code: TestCode, raw: &str, per_uln: bool) -> String {
    if per_uln {
        let name = match code {
            TestCode::Bilirubin => "Bilirubin",
            TestCode::Alt => "ALT",
            TestCode::Platelets => "Plts",
            TestCode::Neutrophils => "Neuts",
            TestCode::Renal => "GFR",
        };
        let symbol = match code.comparison() {
            Comparison::LessThan => "<",
            Comparison::GreaterThan => ">",
        };
        return format!("{name} {symbol} {raw} x ULN");
    }

    match code {
        TestCode::Platelets => format!("Plts < {raw} x 10^9/L"),
        TestCode::Neutrophils => format!("Neuts < {raw} x 10^9/L"),
        TestCode::Renal => format!("GFR < {raw}mL/min"),
        TestCode::Bilirubin => format!("Bilirubin > {raw} umol/L"),
        TestCode::Alt => format!("ALT > {raw} U/L"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::extract::segment::Segmenter;
    use crate::commands::extract::vocabulary::Vocabulary;

    fn parse(text: &str) -> BloodTestFindings {
        let stream = LineStream::from_text(text);
        let sections = Segmenter::new(&Vocabulary::default())
            .expect("segmenter")
            .segment(&stream);
        BloodTestParser::new().expect("parser").parse(&stream, &sections)
    }

    #[test]
    fn extracts_thresholds_with_directions_and_actions() {
        let findings = parse(
            "BLOOD TESTS\nALT > 5 x ULN discuss with consultant\nPlts < 100 delay treatment one week. Recheck\nNeuts < 1.0\nGFR < 30 mL/min\nBilirubin > 50 contact prescriber",
        );

        let codes = findings
            .thresholds
            .iter()
            .map(|threshold| threshold.test_code)
            .collect::<Vec<_>>();
        assert_eq!(
            codes,
            vec![
                TestCode::Alt,
                TestCode::Platelets,
                TestCode::Neutrophils,
                TestCode::Renal,
                TestCode::Bilirubin,
            ]
        );

        let alt = &findings.thresholds[0];
        assert_eq!(alt.threshold_function, Comparison::GreaterThan);
        assert_eq!(alt.message_text_line1, "ALT > 5 x ULN");
        assert_eq!(alt.message_text_line3, "Discuss with consultant.");

        let plts = &findings.thresholds[1];
        assert_eq!(plts.threshold_value, 100.0);
        assert_eq!(plts.threshold_function, Comparison::LessThan);
        assert_eq!(plts.message_text_line1, "Plts < 100 x 10^9/L");
        assert_eq!(plts.message_text_line3, "Delay treatment one week.");

        assert_eq!(findings.thresholds[2].message_text_line3, DEFAULT_ACTION);
        assert_eq!(findings.thresholds[3].message_text_line1, "GFR < 30mL/min");
        assert!(findings.flags.is_empty());
    }

    #[test]
    fn thresholds_outside_blood_test_sections_are_ignored() {
        let findings = parse("Plts < 100\nWarnings\nNeuts < 1.0");
        assert!(findings.thresholds.is_empty());
    }

    #[test]
    fn unrecognised_lines_and_bare_mentions_are_flagged() {
        let findings = parse("BLOOD TESTS\nPlatelets and neutrophils weekly\nHb < 80\nPlts > 400");
        let messages = findings
            .flags
            .iter()
            .map(|flag| flag.message.clone())
            .collect::<Vec<_>>();
        assert_eq!(messages.len(), 4);
        assert!(messages[0].contains("line 3"));
        assert!(messages[1].contains("line 4"));
        assert!(messages[2].starts_with("PLATS"));
        assert!(messages[3].starts_with("NEUTS"));
    }

    #[test]
    fn validity_days_come_from_blood_and_information_sections() {
        let findings = parse("BLOOD TESTS\nValidity of results: 14 days\nPlts < 75");
        assert_eq!(findings.validity_days, Some(14));
        assert_eq!(parse("BLOOD TESTS\nPlts < 75").validity_days, None);
    }
}
