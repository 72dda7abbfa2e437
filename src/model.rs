use std::fmt;

use serde::{Deserialize, Serialize};

pub const UNKNOWN_MARKER: &str = "UNKNOWN";
pub const NEEDS_HUMAN_INPUT: &str = "CHANGE_ME";
pub const UNTIL_STOPPED: &str = "U";

/// Root aggregate handed to the import-format and tabular renderers.
///
/// Every field is always present. Values that could not be extracted carry
/// [`UNKNOWN_MARKER`] or [`NEEDS_HUMAN_INPUT`] and a matching entry in
/// `review_flags`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub document_code: String,
    pub regimen_name: String,
    pub drug_full_name: String,
    pub indication: String,
    pub reference: String,
    pub administration: AdministrationType,
    pub drug_prefix: String,
    pub ticket_number: String,
    pub specialty_class: String,
    pub directorate: String,
    pub inpatient_or_outpatient: String,
    pub default_cycles: u32,
    pub cycle: CycleInfo,
    pub templates: Vec<DrugTemplateRecord>,
    pub blood_test_validity_days: u32,
    pub blood_tests: Vec<BloodTestThreshold>,
    pub rota_info_paragraphs: Vec<String>,
    pub warnings_paragraphs: Vec<String>,
    pub review_flags: Vec<ReviewFlag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdministrationType {
    OralOnly,
    InfusionOnly,
    Mixed,
}

impl AdministrationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OralOnly => "oral_only",
            Self::InfusionOnly => "infusion_only",
            Self::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleInfo {
    pub length_days: u32,
    pub delay_weeks: u32,
    pub source: CycleSource,
}

impl CycleInfo {
    pub fn from_days(length_days: u32, source: CycleSource) -> Self {
        Self {
            length_days,
            delay_weeks: length_days / 7,
            source,
        }
    }

    pub fn delay_label(&self) -> String {
        format!("{}w", self.delay_weeks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleSource {
    RegimenSuffix,
    ExplicitPhrase,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrugTemplateRecord {
    pub drug_name: String,
    pub dose: Dose,
    pub mode: PrescriptionMode,
    pub frequency: String,
    pub route: String,
    pub form: String,
    pub timing_constraints: String,
    pub first_dose_day: u32,
    pub final_dose_day: FinalDoseDay,
    pub group: String,
    pub fluid_type: String,
    pub volume_ml: String,
    pub infusion_duration: String,
    pub source_line: usize,
}

impl DrugTemplateRecord {
    pub fn is_primary(&self) -> bool {
        self.group
            .chars()
            .last()
            .map(|character| character.is_ascii_alphabetic())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Dose {
    Known {
        value: f64,
        units: String,
        per_square_metre: bool,
    },
    Unknown,
}

impl Dose {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrescriptionMode {
    #[serde(rename = "TTO")]
    Tto,
    #[serde(rename = "REG")]
    Reg,
}

/// Last administration day: a day number or the until-stopped marker `U`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FinalDoseDay {
    Day(u32),
    UntilStopped,
}

impl fmt::Display for FinalDoseDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day(day) => write!(f, "{day}"),
            Self::UntilStopped => f.write_str(UNTIL_STOPPED),
        }
    }
}

impl From<FinalDoseDay> for String {
    fn from(value: FinalDoseDay) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for FinalDoseDay {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case(UNTIL_STOPPED) {
            return Ok(Self::UntilStopped);
        }

        trimmed
            .parse::<u32>()
            .map(Self::Day)
            .map_err(|_| format!("final dose day must be a day number or '{UNTIL_STOPPED}', got '{value}'"))
    }
}

/// Blood-test codes in canonical output order (haematology, renal, hepatic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TestCode {
    #[serde(rename = "PLATS")]
    Platelets,
    #[serde(rename = "NEUTS")]
    Neutrophils,
    #[serde(rename = "GFR")]
    Renal,
    #[serde(rename = "BILI")]
    Bilirubin,
    #[serde(rename = "ALT")]
    Alt,
}

impl TestCode {
    pub const CANONICAL_ORDER: [TestCode; 5] = [
        TestCode::Platelets,
        TestCode::Neutrophils,
        TestCode::Renal,
        TestCode::Bilirubin,
        TestCode::Alt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Platelets => "PLATS",
            Self::Neutrophils => "NEUTS",
            Self::Renal => "GFR",
            Self::Bilirubin => "BILI",
            Self::Alt => "ALT",
        }
    }

    pub fn comparison(self) -> Comparison {
        match self {
            Self::Platelets | Self::Neutrophils | Self::Renal => Comparison::LessThan,
            Self::Bilirubin | Self::Alt => Comparison::GreaterThan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "LT")]
    LessThan,
    #[serde(rename = "GT")]
    GreaterThan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodTestThreshold {
    pub test_code: TestCode,
    pub threshold_value: f64,
    pub threshold_function: Comparison,
    pub message_text_line1: String,
    pub message_text_line3: String,
    pub source_line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFlag {
    pub field: String,
    pub message: String,
}

impl ReviewFlag {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolVersions {
    pub pdftotext: Option<String>,
    pub pdftoppm: Option<String>,
    pub tesseract: Option<String>,
    pub convert: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageProvenance {
    pub page_index: usize,
    pub method: String,
    pub rotation: u16,
    pub reason: String,
    pub text_char_count: usize,
    pub ocr_char_count: Option<usize>,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractInput {
    pub path: String,
    pub sha256: String,
    pub byte_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractCounts {
    pub page_count: usize,
    pub ocr_page_count: usize,
    pub low_confidence_page_count: usize,
    pub line_count: usize,
    pub section_count: usize,
    pub header_lines_removed: usize,
    pub footer_lines_removed: usize,
    pub dehyphenation_merges: usize,
    pub template_count: usize,
    pub blood_test_count: usize,
    pub review_flag_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub ocr_mode: String,
    pub tool_versions: ToolVersions,
    pub input: ExtractInput,
    pub record_path: String,
    pub record_sha256: String,
    pub administration: String,
    pub counts: ExtractCounts,
    pub pages: Vec<PageProvenance>,
    pub warnings: Vec<String>,
}
