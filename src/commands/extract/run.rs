use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use super::acquisition::{
    AcquisitionSettings, PageSource, PdfPageSource, TextFilePageSource, acquire_pages,
    collect_tool_versions,
};
use super::pipeline::ExtractionPipeline;
use super::vocabulary::Vocabulary;
use crate::cli::{ExtractArgs, OcrMode};
use crate::model::{ExtractCounts, ExtractInput, ExtractRunManifest};
use crate::util::{
    now_utc_string, sha256_bytes, sha256_file, to_json_pretty, utc_compact_string, write_bytes,
    write_json_pretty,
};

pub fn run(args: ExtractArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    if !args.input.is_file() {
        bail!("input document not found: {}", args.input.display());
    }

    let (record_path, manifest_path) = output_paths(&args);
    info!(input = %args.input.display(), run_id = %run_id, "starting extraction");

    let vocabulary = Vocabulary::load(args.vocabulary_path.as_deref())?;
    let pipeline = ExtractionPipeline::new(&vocabulary)?;

    let source = page_source(&args);
    let acquired = acquire_pages(
        source.as_ref(),
        AcquisitionSettings {
            ocr_mode: args.ocr_mode,
            min_text_chars: args.ocr_min_text_chars,
        },
    )?;
    for page in acquired.pages.iter().filter(|page| page.low_confidence) {
        warn!(
            page = page.index + 1,
            reason = %page.reason,
            "page text is low confidence"
        );
    }

    let output = pipeline.run(&acquired.pages)?;
    let record_bytes = to_json_pretty(&output.record)?;
    write_bytes(&record_path, &record_bytes)?;
    info!(
        path = %record_path.display(),
        templates = output.record.templates.len(),
        review_flags = output.record.review_flags.len(),
        "wrote extracted record"
    );

    let (input_sha256, input_bytes) = sha256_file(&args.input)?;
    let manifest = ExtractRunManifest {
        manifest_version: 1,
        run_id,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_extract_command(&args),
        ocr_mode: args.ocr_mode.as_str().to_string(),
        tool_versions: collect_tool_versions(),
        input: ExtractInput {
            path: args.input.display().to_string(),
            sha256: input_sha256,
            byte_count: input_bytes,
        },
        record_path: record_path.display().to_string(),
        record_sha256: sha256_bytes(&record_bytes),
        administration: output.record.administration.as_str().to_string(),
        counts: ExtractCounts {
            page_count: acquired.pages.len(),
            ocr_page_count: acquired.ocr_page_count(),
            low_confidence_page_count: acquired.low_confidence_page_count(),
            line_count: output.line_count,
            section_count: output.section_count,
            header_lines_removed: output.stats.header_lines_removed,
            footer_lines_removed: output.stats.footer_lines_removed,
            dehyphenation_merges: output.stats.dehyphenation_merges,
            template_count: output.record.templates.len(),
            blood_test_count: output.record.blood_tests.len(),
            review_flag_count: output.record.review_flags.len(),
        },
        pages: acquired
            .pages
            .iter()
            .map(|page| page.provenance())
            .collect(),
        warnings: acquired.warnings,
    };

    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote extract run manifest");
    info!(
        regimen = %output.record.regimen_name,
        administration = output.record.administration.as_str(),
        "extraction completed"
    );

    Ok(())
}

fn page_source(args: &ExtractArgs) -> Box<dyn PageSource> {
    if is_text_rendering(&args.input) {
        Box::new(TextFilePageSource::new(&args.input))
    } else {
        Box::new(PdfPageSource::new(
            &args.input,
            &args.ocr_lang,
            args.ocr_dpi,
        ))
    }
}

fn is_text_rendering(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.eq_ignore_ascii_case("txt"))
        .unwrap_or(false)
}

fn output_paths(args: &ExtractArgs) -> (PathBuf, PathBuf) {
    let stem = args
        .input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("document");

    let record_path = args
        .record_path
        .clone()
        .unwrap_or_else(|| args.output_dir.join(format!("{stem}_record.json")));
    let manifest_path = args
        .manifest_path
        .clone()
        .unwrap_or_else(|| args.output_dir.join(format!("{stem}_extract_run.json")));

    (record_path, manifest_path)
}

fn render_extract_command(args: &ExtractArgs) -> String {
    let mut command = vec![
        "rota-extract".to_string(),
        "extract".to_string(),
        "--input".to_string(),
        args.input.display().to_string(),
        "--output-dir".to_string(),
        args.output_dir.display().to_string(),
    ];

    if let Some(path) = &args.record_path {
        command.push("--record-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.manifest_path {
        command.push("--manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.vocabulary_path {
        command.push("--vocabulary-path".to_string());
        command.push(path.display().to_string());
    }

    command.push("--ocr-mode".to_string());
    command.push(args.ocr_mode.as_str().to_string());
    if args.ocr_mode != OcrMode::Off {
        command.push("--ocr-lang".to_string());
        command.push(args.ocr_lang.clone());
        command.push("--ocr-min-text-chars".to_string());
        command.push(args.ocr_min_text_chars.to_string());
        command.push("--ocr-dpi".to_string());
        command.push(args.ocr_dpi.to_string());
    }

    command.join(" ")
}
