use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::ValidateArgs;
use crate::model::{ExtractedRecord, NEEDS_HUMAN_INPUT, UNKNOWN_MARKER};
use crate::util::{now_utc_string, read_json, write_json_pretty};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub blocking: bool,
}

impl ValidationIssue {
    fn blocking(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            blocking: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct ValidationReport {
    report_version: u32,
    generated_at: String,
    record_path: String,
    strict: bool,
    status: String,
    blocking_count: usize,
    issues: Vec<ValidationIssue>,
}

pub fn run(args: ValidateArgs) -> Result<()> {
    let record: ExtractedRecord = read_json(&args.record_path)
        .with_context(|| format!("failed to load record {}", args.record_path.display()))?;

    let issues = collect_issues(&record, args.strict);
    let blocking_count = issues.iter().filter(|issue| issue.blocking).count();
    for issue in &issues {
        if issue.blocking {
            warn!(field = %issue.field, "{}", issue.message);
        } else {
            info!(field = %issue.field, "{}", issue.message);
        }
    }

    if let Some(report_path) = &args.report_path {
        let report = ValidationReport {
            report_version: 1,
            generated_at: now_utc_string(),
            record_path: args.record_path.display().to_string(),
            strict: args.strict,
            status: if blocking_count == 0 { "pass" } else { "failed" }.to_string(),
            blocking_count,
            issues: issues.clone(),
        };
        write_json_pretty(report_path, &report)?;
        info!(path = %report_path.display(), "wrote validation report");
    }

    if blocking_count > 0 {
        bail!(
            "{} blocking issue(s) remain in {}",
            blocking_count,
            args.record_path.display()
        );
    }

    info!(
        record = %args.record_path.display(),
        advisory = issues.len(),
        "record ready for rendering"
    );
    Ok(())
}

/// Placeholders and unknown markers always block; outstanding review flags
/// block only in strict mode.
pub fn collect_issues(record: &ExtractedRecord, strict: bool) -> Vec<ValidationIssue> {
    let mut issues = Vec::<ValidationIssue>::new();

    let scalars = [
        ("document_code", &record.document_code),
        ("regimen_name", &record.regimen_name),
        ("drug_full_name", &record.drug_full_name),
        ("indication", &record.indication),
        ("reference", &record.reference),
        ("drug_prefix", &record.drug_prefix),
        ("ticket_number", &record.ticket_number),
        ("specialty_class", &record.specialty_class),
        ("directorate", &record.directorate),
        ("inpatient_or_outpatient", &record.inpatient_or_outpatient),
    ];
    for (field, value) in scalars {
        if let Some(message) = placeholder_message(value) {
            issues.push(ValidationIssue::blocking(field, message));
        }
    }

    if record.templates.is_empty() {
        issues.push(ValidationIssue::blocking("templates", "no drug templates"));
    }
    for (index, template) in record.templates.iter().enumerate() {
        if template.dose.is_unknown() {
            issues.push(ValidationIssue::blocking(
                format!("templates[{index}].dose"),
                format!("dose for {} is still unknown", template.drug_name),
            ));
        }
        let fields = [
            ("drug_name", &template.drug_name),
            ("frequency", &template.frequency),
            ("route", &template.route),
            ("form", &template.form),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                issues.push(ValidationIssue::blocking(
                    format!("templates[{index}].{field}"),
                    "value is empty",
                ));
            } else if let Some(message) = placeholder_message(value) {
                issues.push(ValidationIssue::blocking(
                    format!("templates[{index}].{field}"),
                    message,
                ));
            }
        }
    }

    if record.blood_tests.is_empty() {
        issues.push(ValidationIssue::blocking(
            "blood_tests",
            "no blood-test thresholds",
        ));
    }

    for flag in &record.review_flags {
        issues.push(ValidationIssue {
            field: flag.field.clone(),
            message: format!("review flag: {}", flag.message),
            blocking: strict,
        });
    }

    issues
}

fn placeholder_message(value: &str) -> Option<&'static str> {
    match value.trim() {
        NEEDS_HUMAN_INPUT => Some("needs human input"),
        UNKNOWN_MARKER => Some("could not be extracted; fill in from the original rota"),
        _ => None,
    }
}
