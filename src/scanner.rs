//! Scan orchestration.
//!
//! Files are the unit of parallelism: a fixed worker pool runs the full
//! parse → compile → project → score pipeline per file and appends results
//! to a mutex-guarded collector, the only shared mutable state. The
//! category tables and the classifier handle are immutable and shared.

use crate::compiler::{compile_source, Warning, WarningKind};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::languages::Language;
use crate::mappings::CategoryMapper;
use crate::model::{version_string, ClassifierDriver};
use crate::object::{assemble_objects, ScanObject};
use crate::report::{aggregate, dedup_objects, FileWarning, ScanReport};
use crate::tokens::TokenProjector;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Scan a file or directory and produce a report. The classifier is
/// optional; without it the verdict is inconclusive.
pub fn scan_path(
    input: &Path,
    config: &ScanConfig,
    mapper: &CategoryMapper,
    driver: Option<&ClassifierDriver>,
) -> Result<ScanReport> {
    config.validate()?;

    if !input.exists() {
        return Err(ScanError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("path does not exist: {}", input.display()),
        )));
    }

    let started = Instant::now();
    let start_stamp = chrono::Utc::now().to_rfc3339();

    let (accepted, skipped) = collect_files(input, config);
    let mut all_files: Vec<PathBuf> = accepted.iter().chain(skipped.iter()).cloned().collect();
    all_files.sort();

    info!(
        input = %input.display(),
        accepted = accepted.len(),
        skipped = skipped.len(),
        "starting scan"
    );

    let collector: Mutex<Vec<ScanObject>> = Mutex::new(Vec::new());
    let warnings: Mutex<Vec<FileWarning>> = Mutex::new(Vec::new());
    let fatal: Mutex<Option<ScanError>> = Mutex::new(None);
    let projector = TokenProjector::new(mapper, config.short_string_threshold);

    let run = || {
        accepted.par_iter().for_each(|file| {
            if fatal.lock().unwrap().is_some() {
                return;
            }
            if let Some(deadline) = config.deadline {
                if started.elapsed() >= deadline {
                    warnings.lock().unwrap().push(FileWarning {
                        path: file.clone(),
                        kind: "compile_truncation".into(),
                        message: "scan deadline reached before this file was processed".into(),
                    });
                    return;
                }
            }
            match process_file(file, config, mapper, driver, &projector) {
                Ok(objects) => collector.lock().unwrap().extend(objects),
                // A single unreadable or damaged file never interrupts
                // the scan; it surfaces as a per-file warning.
                Err(error) if error.is_recoverable() || matches!(error, ScanError::Io(_)) => {
                    debug!(file = %file.display(), %error, "recoverable failure");
                    warnings.lock().unwrap().push(FileWarning {
                        path: file.clone(),
                        kind: warning_kind(&error).into(),
                        message: error.to_string(),
                    });
                }
                Err(error) => {
                    warn!(file = %file.display(), %error, "fatal scan error");
                    fatal.lock().unwrap().get_or_insert(error);
                }
            }
        });
    };

    match config.worker_threads {
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| ScanError::config_invalid(format!("worker pool: {e}")))?;
            pool.install(run);
        }
        None => run(),
    }

    if let Some(error) = fatal.into_inner().unwrap() {
        return Err(error);
    }

    let objects = dedup_objects(collector.into_inner().unwrap());
    let file_warnings = warnings.into_inner().unwrap();
    let processed_files = accepted.len();
    let scored = driver.is_some();
    let version = version_string(driver, mapper.version());

    let report = aggregate(
        input.display().to_string(),
        start_stamp,
        started.elapsed().as_secs_f64(),
        all_files,
        skipped,
        processed_files,
        objects,
        file_warnings,
        config.threshold,
        scored,
        version,
        mapper,
        &projector,
    );

    info!(
        objects = report.objects.len(),
        malicious = report.malicious.len(),
        verdict = %report.verdict,
        seconds = report.duration_seconds,
        "scan finished"
    );
    Ok(report)
}

/// Discover files under the input, split into accepted and skipped by
/// extension. A single-file input still goes through the same split.
fn collect_files(input: &Path, config: &ScanConfig) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut accepted = Vec::new();
    let mut skipped = Vec::new();

    let candidates: Vec<PathBuf> = if input.is_file() {
        vec![input.to_path_buf()]
    } else {
        WalkDir::new(input)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !name.starts_with(".git")
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().to_path_buf())
            .collect()
    };

    for path in candidates {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if config.extensions.iter().any(|accept| accept == &extension) {
            accepted.push(path);
        } else {
            skipped.push(path);
        }
    }
    (accepted, skipped)
}

/// Full single-file pipeline. Cooperative timeout checks run between
/// stages; an overrun discards the file's partial objects.
fn process_file(
    file: &Path,
    config: &ScanConfig,
    mapper: &CategoryMapper,
    driver: Option<&ClassifierDriver>,
    projector: &TokenProjector,
) -> Result<Vec<ScanObject>> {
    let file_started = Instant::now();

    let metadata = std::fs::metadata(file)?;
    if metadata.len() > config.max_file_size {
        return Err(ScanError::truncation(
            file,
            format!("{} bytes exceeds the {} byte limit", metadata.len(), config.max_file_size),
        ));
    }

    let bytes = std::fs::read(file)?;
    let lossy = std::str::from_utf8(&bytes).is_err();
    let source = String::from_utf8_lossy(&bytes).into_owned();

    let language = Language::from_path(file)
        .ok_or_else(|| ScanError::unsupported_extension(file))?;

    let mut module = compile_source(file, &source, language, config, mapper)?;
    if lossy {
        module.warnings.push(Warning::new(
            WarningKind::ReadIssue,
            "invalid UTF-8 replaced during decoding",
        ));
    }
    if file_started.elapsed() >= config.file_timeout {
        return Err(ScanError::truncation(file, "per-file timeout during compilation"));
    }

    let mut objects = assemble_objects(module, source.into());
    if let Some(driver) = driver {
        for object in objects.iter_mut() {
            let scored = {
                let tokens = object.tokens(projector);
                driver.score(tokens)
            };
            let score = scored
                .map_err(|e| ScanError::classifier_unavailable(format!("scoring failed: {e:#}")))?;
            object.score = Some(score);
            if file_started.elapsed() >= config.file_timeout {
                return Err(ScanError::truncation(file, "per-file timeout during scoring"));
            }
        }
    }

    debug!(
        file = %file.display(),
        objects = objects.len(),
        millis = file_started.elapsed().as_millis() as u64,
        "file processed"
    );
    Ok(objects)
}

fn warning_kind(error: &ScanError) -> &'static str {
    match error {
        ScanError::Parse { .. } => "parse_error",
        ScanError::CompileTruncation { .. } => "compile_truncation",
        ScanError::UnsupportedExtension { .. } => "unsupported_extension",
        _ => "io_error",
    }
}
