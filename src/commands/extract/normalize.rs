use std::collections::{BTreeMap, HashSet};

use super::acquisition::DocumentPage;

const MIN_EDGE_REPEATS: usize = 3;
const MAX_EDGE_LINE_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub page_index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizationStats {
    pub header_lines_removed: usize,
    pub footer_lines_removed: usize,
    pub dehyphenation_merges: usize,
}

/// Index-stable line sequence shared read-only by every later stage.
///
/// `line(i)` returns the same text for the lifetime of the stream. Character
/// offsets refer to `joined()`, where lines are separated by a single `\n`.
#[derive(Debug, Clone, Default)]
pub struct LineStream {
    lines: Vec<Line>,
    joined: String,
    char_offsets: Vec<usize>,
    stats: NormalizationStats,
}

impl LineStream {
    /// A header or footer repeated on three or more pages keeps its first
    /// copy; later copies are dropped.
    pub fn from_pages(pages: &[DocumentPage]) -> Self {
        let cleaned = pages
            .iter()
            .map(|page| clean_page(&page.text))
            .collect::<Vec<Vec<String>>>();
        let repeated_headers = repeated_edge_keys(&cleaned, Edge::Header);
        let repeated_footers = repeated_edge_keys(&cleaned, Edge::Footer);

        let mut kept_headers = HashSet::<String>::new();
        let mut kept_footers = HashSet::<String>::new();
        let mut stats = NormalizationStats::default();
        let mut lines = Vec::<Line>::new();

        for (page, mut page_lines) in pages.iter().zip(cleaned) {
            if drop_repeated_edge(
                &mut page_lines,
                Edge::Header,
                &repeated_headers,
                &mut kept_headers,
            ) {
                stats.header_lines_removed += 1;
            }
            if drop_repeated_edge(
                &mut page_lines,
                Edge::Footer,
                &repeated_footers,
                &mut kept_footers,
            ) {
                stats.footer_lines_removed += 1;
            }

            let (merged, merges) = merge_hyphenated_lines(page_lines);
            stats.dehyphenation_merges += merges;
            lines.extend(merged.into_iter().map(|text| Line {
                text,
                page_index: page.index,
            }));
        }

        Self::from_lines(lines, stats)
    }

    /// Single-page stream, mostly for parser tests.
    pub fn from_text(text: &str) -> Self {
        Self::from_pages(&[DocumentPage::from_text(0, text)])
    }

    fn from_lines(lines: Vec<Line>, stats: NormalizationStats) -> Self {
        let mut joined = String::new();
        let mut char_offsets = Vec::<usize>::with_capacity(lines.len());
        let mut cursor = 0usize;

        for (index, line) in lines.iter().enumerate() {
            if index > 0 {
                joined.push('\n');
                cursor += 1;
            }
            char_offsets.push(cursor);
            joined.push_str(&line.text);
            cursor += line.text.chars().count();
        }

        Self {
            lines,
            joined,
            char_offsets,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn line(&self, index: usize) -> &str {
        self.lines
            .get(index)
            .map(|line| line.text.as_str())
            .unwrap_or("")
    }

    pub fn page_of(&self, index: usize) -> Option<usize> {
        self.lines.get(index).map(|line| line.page_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.lines
            .iter()
            .enumerate()
            .map(|(index, line)| (index, line.text.as_str()))
    }

    pub fn joined(&self) -> &str {
        &self.joined
    }

    pub fn char_offset(&self, index: usize) -> usize {
        self.char_offsets
            .get(index)
            .copied()
            .unwrap_or_else(|| self.joined.chars().count())
    }

    /// True when character `column` of line `index` sits inside the first
    /// `title_chars` characters of the document.
    pub fn in_title_area(&self, index: usize, column: usize, title_chars: usize) -> bool {
        self.char_offset(index) + column < title_chars
    }

    pub fn stats(&self) -> NormalizationStats {
        self.stats
    }
}

fn clean_line(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn clean_page(text: &str) -> Vec<String> {
    text.replace('\u{0000}', "")
        .lines()
        .map(clean_line)
        .filter(|line| !line.is_empty())
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Edge {
    Header,
    Footer,
}

impl Edge {
    fn line(self, lines: &[String]) -> Option<&String> {
        match self {
            Self::Header => lines.first(),
            Self::Footer => lines.last(),
        }
    }
}

/// Cleaned lines are already whitespace-collapsed; only case is folded.
fn edge_key(line: &str) -> String {
    line.to_lowercase()
}

fn repeated_edge_keys(pages: &[Vec<String>], edge: Edge) -> HashSet<String> {
    if pages.len() < MIN_EDGE_REPEATS {
        return HashSet::new();
    }

    let mut counts = BTreeMap::<String, usize>::new();
    for key in pages
        .iter()
        .filter_map(|lines| edge.line(lines))
        .map(|line| edge_key(line))
        .filter(|key| key.chars().count() <= MAX_EDGE_LINE_CHARS)
    {
        *counts.entry(key).or_default() += 1;
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count >= MIN_EDGE_REPEATS)
        .map(|(key, _)| key)
        .collect()
}

/// Returns true when the page's edge line was dropped as a later copy.
fn drop_repeated_edge(
    lines: &mut Vec<String>,
    edge: Edge,
    repeated: &HashSet<String>,
    kept: &mut HashSet<String>,
) -> bool {
    let Some(key) = edge.line(lines).map(|line| edge_key(line)) else {
        return false;
    };
    if !repeated.contains(&key) || kept.insert(key) {
        return false;
    }

    match edge {
        Edge::Header => {
            lines.remove(0);
        }
        Edge::Footer => {
            lines.pop();
        }
    }
    true
}

fn merge_hyphenated_lines(lines: Vec<String>) -> (Vec<String>, usize) {
    let mut merged = Vec::<String>::new();
    let mut merges = 0usize;
    let mut pending: Option<String> = None;

    for line in lines {
        match pending.take() {
            Some(current) if is_broken_word(&current, &line) => {
                pending = Some(format!("{}{}", current.trim_end_matches('-'), line));
                merges += 1;
            }
            Some(current) => {
                merged.push(current);
                pending = Some(line);
            }
            None => pending = Some(line),
        }
    }

    if let Some(current) = pending {
        merged.push(current);
    }

    (merged, merges)
}

/// `cyclophos-` followed by `phamide`: a letter before the hyphen and a
/// lowercase letter opening the next line.
fn is_broken_word(current: &str, next: &str) -> bool {
    let Some(stem) = current.strip_suffix('-') else {
        return false;
    };
    stem.chars()
        .last()
        .is_some_and(|character| character.is_ascii_alphabetic())
        && next
            .chars()
            .next()
            .is_some_and(|character| character.is_ascii_lowercase())
}
