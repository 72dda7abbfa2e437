use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cli::OcrMode;
use crate::model::{PageProvenance, ToolVersions};

pub const OCR_ROTATIONS: [u16; 4] = [0, 90, 180, 270];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMethod {
    TextLayer,
    Ocr,
    Empty,
}

impl AcquisitionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextLayer => "text_layer",
            Self::Ocr => "ocr",
            Self::Empty => "none",
        }
    }
}

/// One rendered page. Built once during acquisition and never mutated.
#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub index: usize,
    pub text: String,
    pub method: AcquisitionMethod,
    pub rotation: u16,
    pub reason: String,
    pub text_char_count: usize,
    pub ocr_char_count: Option<usize>,
    pub low_confidence: bool,
}

impl DocumentPage {
    pub fn from_text(index: usize, text: &str) -> Self {
        let chars = non_whitespace_char_count(text);
        Self {
            index,
            text: text.to_string(),
            method: if chars == 0 {
                AcquisitionMethod::Empty
            } else {
                AcquisitionMethod::TextLayer
            },
            rotation: 0,
            reason: if chars == 0 {
                "text_layer_empty".to_string()
            } else {
                "text_layer_default".to_string()
            },
            text_char_count: chars,
            ocr_char_count: None,
            low_confidence: chars == 0,
        }
    }

    pub fn provenance(&self) -> PageProvenance {
        PageProvenance {
            page_index: self.index,
            method: self.method.as_str().to_string(),
            rotation: self.rotation,
            reason: self.reason.clone(),
            text_char_count: self.text_char_count,
            ocr_char_count: self.ocr_char_count,
            low_confidence: self.low_confidence,
        }
    }
}

/// Supplier of a digital text layer and, optionally, per-page OCR.
pub trait PageSource {
    fn describe(&self) -> String;

    fn text_layer_pages(&self) -> Result<Vec<String>>;

    fn ocr_available(&self) -> bool;

    fn supported_rotations(&self) -> Vec<u16>;

    /// Recognised text for each requested rotation that could be read.
    fn ocr_page(&self, page_number: usize, rotations: &[u16]) -> Result<Vec<(u16, String)>>;
}

#[derive(Debug, Clone, Copy)]
pub struct AcquisitionSettings {
    pub ocr_mode: OcrMode,
    pub min_text_chars: usize,
}

#[derive(Debug, Default)]
pub struct AcquiredDocument {
    pub pages: Vec<DocumentPage>,
    pub warnings: Vec<String>,
}

impl AcquiredDocument {
    pub fn ocr_page_count(&self) -> usize {
        self.pages
            .iter()
            .filter(|page| page.method == AcquisitionMethod::Ocr)
            .count()
    }

    pub fn low_confidence_page_count(&self) -> usize {
        self.pages.iter().filter(|page| page.low_confidence).count()
    }
}

pub fn acquire_pages(
    source: &dyn PageSource,
    settings: AcquisitionSettings,
) -> Result<AcquiredDocument> {
    let raw_pages = source
        .text_layer_pages()
        .with_context(|| format!("failed to read text layer of {}", source.describe()))?;

    let mut acquired = AcquiredDocument {
        pages: raw_pages
            .iter()
            .enumerate()
            .map(|(index, text)| DocumentPage::from_text(index, text))
            .collect(),
        ..AcquiredDocument::default()
    };

    let candidate_pages =
        collect_ocr_candidates(&raw_pages, settings.ocr_mode, settings.min_text_chars);
    if candidate_pages.is_empty() {
        return Ok(acquired);
    }

    if !source.ocr_available() {
        let message = format!(
            "OCR mode '{}' requested for {} pages of {} but no OCR engine is available",
            settings.ocr_mode.as_str(),
            candidate_pages.len(),
            source.describe()
        );
        if matches!(settings.ocr_mode, OcrMode::Force) {
            bail!(message);
        }

        for page_index in &candidate_pages {
            if let Some(page) = acquired.pages.get_mut(*page_index) {
                page.reason = "ocr_unavailable_text_layer_fallback".to_string();
                page.low_confidence = true;
            }
        }
        warn!(pages = candidate_pages.len(), "OCR unavailable; keeping text layer");
        acquired.warnings.push(message);
        return Ok(acquired);
    }

    let rotations = source.supported_rotations();
    if rotations.len() < OCR_ROTATIONS.len() {
        acquired.warnings.push(format!(
            "page rotation search limited to {:?} degrees for {}",
            rotations,
            source.describe()
        ));
    }

    for page_index in candidate_pages {
        let page_number = page_index + 1;
        let attempts = match source.ocr_page(page_number, &rotations) {
            Ok(attempts) => attempts,
            Err(error) => {
                if matches!(settings.ocr_mode, OcrMode::Force) {
                    return Err(error).with_context(|| {
                        format!(
                            "failed OCR extraction for {} page {}",
                            source.describe(),
                            page_number
                        )
                    });
                }

                warn!(page = page_number, error = %error, "OCR fallback failed");
                acquired.warnings.push(format!(
                    "OCR fallback failed for {} page {}: {}",
                    source.describe(),
                    page_number,
                    error
                ));
                if let Some(page) = acquired.pages.get_mut(page_index) {
                    page.reason = "ocr_failed_text_layer_fallback".to_string();
                    page.low_confidence = true;
                }
                continue;
            }
        };

        let Some(page) = acquired.pages.get_mut(page_index) else {
            continue;
        };
        apply_ocr_attempts(page, &attempts, settings.ocr_mode);
        debug!(
            page = page_number,
            method = page.method.as_str(),
            rotation = page.rotation,
            chars = page.text_char_count,
            "page acquired"
        );
    }

    info!(
        pages = acquired.pages.len(),
        ocr_pages = acquired.ocr_page_count(),
        low_confidence_pages = acquired.low_confidence_page_count(),
        "page acquisition complete"
    );

    Ok(acquired)
}

fn apply_ocr_attempts(page: &mut DocumentPage, attempts: &[(u16, String)], ocr_mode: OcrMode) {
    let Some((rotation, ocr_text)) = pick_best_rotation(attempts) else {
        page.reason = "ocr_empty_text_layer_fallback".to_string();
        page.ocr_char_count = Some(0);
        page.low_confidence = true;
        return;
    };

    let ocr_chars = non_whitespace_char_count(ocr_text);
    page.ocr_char_count = Some(ocr_chars);

    let replaces_text_layer = ocr_chars > 0
        && (matches!(ocr_mode, OcrMode::Force) || ocr_chars > page.text_char_count);
    if !replaces_text_layer {
        page.reason = if ocr_chars == 0 {
            "ocr_empty_text_layer_fallback".to_string()
        } else {
            "ocr_not_better_than_text_layer".to_string()
        };
        page.low_confidence = true;
        return;
    }

    page.text = ocr_text.to_string();
    page.method = AcquisitionMethod::Ocr;
    page.rotation = rotation;
    page.text_char_count = ocr_chars;
    page.reason = if matches!(ocr_mode, OcrMode::Force) {
        "ocr_force_mode".to_string()
    } else {
        "ocr_auto_low_text".to_string()
    };
    page.low_confidence = false;
}

/// Rotation that recognised the most characters; the earlier angle wins ties.
pub fn pick_best_rotation(attempts: &[(u16, String)]) -> Option<(u16, &str)> {
    let mut best: Option<(u16, &str, usize)> = None;

    for (rotation, text) in attempts {
        let chars = non_whitespace_char_count(text);
        if chars == 0 {
            continue;
        }
        let better = best
            .map(|(_, _, best_chars)| chars > best_chars)
            .unwrap_or(true);
        if better {
            best = Some((*rotation, text.as_str(), chars));
        }
    }

    best.map(|(rotation, text, _)| (rotation, text))
}

pub fn collect_ocr_candidates(
    pages: &[String],
    ocr_mode: OcrMode,
    min_text_chars: usize,
) -> Vec<usize> {
    match ocr_mode {
        OcrMode::Off => Vec::new(),
        OcrMode::Force => (0..pages.len()).collect(),
        OcrMode::Auto => (0..pages.len())
            .filter(|index| non_whitespace_char_count(&pages[*index]) < min_text_chars)
            .collect(),
    }
}

pub fn non_whitespace_char_count(text: &str) -> usize {
    text.chars()
        .filter(|character| !character.is_whitespace())
        .count()
}

fn split_form_feed_pages(raw: &str) -> Vec<String> {
    let mut pages = raw
        .split('\u{000C}')
        .map(|chunk| chunk.replace('\u{0000}', ""))
        .collect::<Vec<String>>();
    while pages.len() > 1 && pages.last().is_some_and(|page| page.trim().is_empty()) {
        pages.pop();
    }
    pages
}

/// Poppler text layer with tesseract OCR; rotation through ImageMagick.
pub struct PdfPageSource {
    path: PathBuf,
    ocr_lang: String,
    ocr_dpi: u32,
    ocr_ready: bool,
    rotate_ready: bool,
}

impl PdfPageSource {
    pub fn new(path: &Path, ocr_lang: &str, ocr_dpi: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            ocr_lang: ocr_lang.to_string(),
            ocr_dpi,
            ocr_ready: command_available("pdftoppm") && command_available("tesseract"),
            rotate_ready: command_available("convert"),
        }
    }

    fn render_page(&self, page_number: usize) -> Result<PathBuf> {
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let output_root = std::env::temp_dir().join(format!(
            "rota_ocr_{}_{page_number}_{stamp}",
            std::process::id()
        ));
        let png_path = output_root.with_extension("png");

        run_tool(
            Command::new("pdftoppm")
                .arg("-r")
                .arg(self.ocr_dpi.to_string())
                .arg("-f")
                .arg(page_number.to_string())
                .arg("-l")
                .arg(page_number.to_string())
                .args(["-singlefile", "-png"])
                .arg(&self.path)
                .arg(&output_root),
            &format!("pdftoppm on {} page {page_number}", self.path.display()),
        )?;

        if !png_path.exists() {
            bail!(
                "pdftoppm did not produce expected image for {} page {}",
                self.path.display(),
                page_number
            );
        }
        Ok(png_path)
    }

    fn rotate_image(&self, png_path: &Path, rotation: u16) -> Result<PathBuf> {
        let rotated_path = png_path.with_extension(format!("r{rotation}.png"));
        run_tool(
            Command::new("convert")
                .arg(png_path)
                .arg("-rotate")
                .arg(rotation.to_string())
                .arg(&rotated_path),
            &format!("convert rotating {} by {rotation}", png_path.display()),
        )?;
        Ok(rotated_path)
    }

    fn recognise(&self, image_path: &Path) -> Result<String> {
        let stdout = run_tool(
            Command::new("tesseract")
                .arg(image_path)
                .arg("stdout")
                .arg("-l")
                .arg(&self.ocr_lang)
                .args(["--psm", "6"]),
            &format!("tesseract on {}", image_path.display()),
        )?;
        Ok(stdout.replace('\u{0000}', "").trim().to_string())
    }
}

/// Runs an external tool and returns its stdout; a non-zero exit carries the
/// tool's stderr.
fn run_tool(command: &mut Command, what: &str) -> Result<String> {
    let output = command
        .output()
        .with_context(|| format!("failed to execute {what}"))?;
    if !output.status.success() {
        bail!(
            "{what} returned non-zero exit status: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl PageSource for PdfPageSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn text_layer_pages(&self) -> Result<Vec<String>> {
        let stdout = run_tool(
            Command::new("pdftotext")
                .args(["-enc", "UTF-8", "-layout"])
                .arg(&self.path)
                .arg("-"),
            &format!("pdftotext on {}", self.path.display()),
        )?;
        Ok(split_form_feed_pages(&stdout))
    }

    fn ocr_available(&self) -> bool {
        self.ocr_ready
    }

    fn supported_rotations(&self) -> Vec<u16> {
        if self.rotate_ready {
            OCR_ROTATIONS.to_vec()
        } else {
            vec![0]
        }
    }

    fn ocr_page(&self, page_number: usize, rotations: &[u16]) -> Result<Vec<(u16, String)>> {
        let png_path = self.render_page(page_number)?;
        let mut attempts = Vec::<(u16, String)>::new();

        for rotation in rotations {
            let image_path = if *rotation == 0 {
                png_path.clone()
            } else {
                match self.rotate_image(&png_path, *rotation) {
                    Ok(path) => path,
                    Err(error) => {
                        warn!(page = page_number, rotation, error = %error, "rotation failed");
                        continue;
                    }
                }
            };

            let recognised = self.recognise(&image_path);
            if image_path != png_path {
                let _ = fs::remove_file(&image_path);
            }
            match recognised {
                Ok(text) => attempts.push((*rotation, text)),
                Err(error) => {
                    warn!(page = page_number, rotation, error = %error, "OCR attempt failed");
                }
            }
        }

        let _ = fs::remove_file(&png_path);

        if attempts.is_empty() {
            bail!(
                "no OCR attempt succeeded for {} page {}",
                self.path.display(),
                page_number
            );
        }

        Ok(attempts)
    }
}

/// Plain-text rendering; pages separated by form feeds. No OCR.
pub struct TextFilePageSource {
    path: PathBuf,
}

impl TextFilePageSource {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl PageSource for TextFilePageSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn text_layer_pages(&self) -> Result<Vec<String>> {
        let raw = fs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(split_form_feed_pages(&String::from_utf8_lossy(&raw)))
    }

    fn ocr_available(&self) -> bool {
        false
    }

    fn supported_rotations(&self) -> Vec<u16> {
        vec![0]
    }

    fn ocr_page(&self, page_number: usize, _rotations: &[u16]) -> Result<Vec<(u16, String)>> {
        bail!(
            "{} is a text rendering; page {} cannot be OCRed",
            self.path.display(),
            page_number
        )
    }
}

pub fn command_available(program: &str) -> bool {
    Command::new(program).arg("--version").output().is_ok()
}

fn command_version_optional(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let source = if stdout.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };

    source
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
}

pub fn collect_tool_versions() -> ToolVersions {
    ToolVersions {
        pdftotext: command_version_optional("pdftotext", &["-v"]),
        pdftoppm: command_version_optional("pdftoppm", &["-v"]),
        tesseract: command_version_optional("tesseract", &["--version"]),
        convert: command_version_optional("convert", &["-version"]),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct FakeSource {
        pages: Vec<String>,
        ocr: Option<Vec<(u16, String)>>,
        calls: RefCell<Vec<usize>>,
    }

    impl PageSource for FakeSource {
        fn describe(&self) -> String {
            "fake.pdf".to_string()
        }

        fn text_layer_pages(&self) -> Result<Vec<String>> {
            Ok(self.pages.clone())
        }

        fn ocr_available(&self) -> bool {
            self.ocr.is_some()
        }

        fn supported_rotations(&self) -> Vec<u16> {
            OCR_ROTATIONS.to_vec()
        }

        fn ocr_page(&self, page_number: usize, _rotations: &[u16]) -> Result<Vec<(u16, String)>> {
            self.calls.borrow_mut().push(page_number);
            match &self.ocr {
                Some(attempts) => Ok(attempts.clone()),
                None => bail!("no engine"),
            }
        }
    }

    fn settings(ocr_mode: OcrMode) -> AcquisitionSettings {
        AcquisitionSettings {
            ocr_mode,
            min_text_chars: 20,
        }
    }

    #[test]
    fn pick_best_rotation_prefers_most_characters_then_earliest_angle() {
        let attempts = vec![
            (0, "ab".to_string()),
            (90, "VINCRISTINE 2mg".to_string()),
            (180, "   ".to_string()),
            (270, "ETOPOSIDE 100m".to_string()),
        ];
        assert_eq!(pick_best_rotation(&attempts).map(|(r, _)| r), Some(90));

        let tied = vec![(90, "abcd".to_string()), (270, "wxyz".to_string())];
        assert_eq!(pick_best_rotation(&tied).map(|(r, _)| r), Some(90));

        assert!(pick_best_rotation(&[(0, String::new())]).is_none());
    }

    #[test]
    fn auto_mode_only_ocrs_sparse_pages() {
        let source = FakeSource {
            pages: vec![
                "BLOOD TESTS Plts < 100 contact prescriber".to_string(),
                "x".to_string(),
            ],
            ocr: Some(vec![(180, "ETOPOSIDE 100mg/m2 IV day 1".to_string())]),
            calls: RefCell::new(Vec::new()),
        };

        let acquired = acquire_pages(&source, settings(OcrMode::Auto)).expect("acquires");
        assert_eq!(*source.calls.borrow(), vec![2]);
        assert_eq!(acquired.pages[0].method, AcquisitionMethod::TextLayer);
        assert_eq!(acquired.pages[1].method, AcquisitionMethod::Ocr);
        assert_eq!(acquired.pages[1].rotation, 180);
        assert!(acquired.pages[1].text.contains("ETOPOSIDE"));
        assert_eq!(acquired.ocr_page_count(), 1);
    }

    #[test]
    fn failed_ocr_degrades_to_low_confidence_page() {
        let source = FakeSource {
            pages: vec![String::new()],
            ocr: Some(vec![(0, "   ".to_string())]),
            calls: RefCell::new(Vec::new()),
        };

        let acquired = acquire_pages(&source, settings(OcrMode::Auto)).expect("not fatal");
        assert_eq!(acquired.pages.len(), 1);
        assert!(acquired.pages[0].low_confidence);
        assert!(acquired.pages[0].text.is_empty());
        assert_eq!(acquired.pages[0].reason, "ocr_empty_text_layer_fallback");
    }

    #[test]
    fn missing_engine_is_fatal_only_in_force_mode() {
        let source = FakeSource {
            pages: vec![String::new()],
            ocr: None,
            calls: RefCell::new(Vec::new()),
        };

        let acquired = acquire_pages(&source, settings(OcrMode::Auto)).expect("auto degrades");
        assert_eq!(acquired.warnings.len(), 1);
        assert_eq!(acquired.low_confidence_page_count(), 1);

        assert!(acquire_pages(&source, settings(OcrMode::Force)).is_err());
    }

    #[test]
    fn text_file_source_splits_on_form_feed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rota.txt");
        fs::write(&path, "page one\u{000C}page two\u{000C}\n").expect("write");

        let pages = TextFilePageSource::new(&path)
            .text_layer_pages()
            .expect("reads");
        assert_eq!(pages, vec!["page one".to_string(), "page two".to_string()]);
    }
}
