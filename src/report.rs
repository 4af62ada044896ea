//! Report aggregation.
//!
//! Collects scored scan objects into a stable report: objects are sorted by
//! (file path, start line), deduplicated by instruction hash keeping the
//! highest score, flagged against the threshold, and summarized into an
//! activity set and an overall verdict with confidence.

use crate::mappings::CategoryMapper;
use crate::object::ScanObject;
use crate::tokens::TokenProjector;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Malicious,
    Clean,
    Inconclusive,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Malicious => "malicious",
            Self::Clean => "clean",
            Self::Inconclusive => "inconclusive",
        };
        f.write_str(text)
    }
}

/// A file-level problem that did not stop the scan.
#[derive(Debug, Clone, Serialize)]
pub struct FileWarning {
    pub path: PathBuf,
    pub kind: String,
    pub message: String,
}

pub struct ScanReport {
    pub input: String,
    /// ISO-8601 timestamp of scan start.
    pub start: String,
    pub duration_seconds: f64,
    pub all_files: Vec<PathBuf>,
    pub skipped_files: Vec<PathBuf>,
    pub processed_files: usize,
    pub objects: Vec<ScanObject>,
    /// Indices into `objects` whose score met the threshold.
    pub malicious: Vec<usize>,
    /// Union of activity tokens observed in malicious objects, sorted.
    pub activities: Vec<String>,
    pub verdict: Verdict,
    pub confidence: f32,
    pub threshold: f32,
    pub version: String,
    pub file_warnings: Vec<FileWarning>,
}

impl ScanReport {
    pub fn malicious_objects(&self) -> impl Iterator<Item = &ScanObject> {
        self.malicious.iter().map(|&index| &self.objects[index])
    }

    pub fn is_malicious(&self) -> bool {
        self.verdict == Verdict::Malicious
    }

    /// Object warnings plus file warnings, for the summary line.
    pub fn warning_count(&self) -> usize {
        self.file_warnings.len()
            + self.objects.iter().map(|o| o.warnings().len()).sum::<usize>()
    }
}

/// Sort objects into report order, then drop duplicates by instruction
/// hash, keeping the occurrence with the highest score. Running this twice
/// changes nothing.
pub fn dedup_objects(mut objects: Vec<ScanObject>) -> Vec<ScanObject> {
    objects.sort_by(|a, b| {
        let key_a = (a.file_path().to_path_buf(), a.location().map(|l| l.0).unwrap_or(0));
        let key_b = (b.file_path().to_path_buf(), b.location().map(|l| l.0).unwrap_or(0));
        key_a.cmp(&key_b)
    });

    let mut index_by_hash: rustc_hash::FxHashMap<String, usize> = Default::default();
    let mut kept: Vec<ScanObject> = Vec::with_capacity(objects.len());
    for object in objects {
        let hash = object.instruction_hash().to_string();
        match index_by_hash.get(&hash) {
            None => {
                index_by_hash.insert(hash, kept.len());
                kept.push(object);
            }
            Some(&at) => {
                let existing = &mut kept[at];
                if object.score.unwrap_or(0.0) > existing.score.unwrap_or(0.0) {
                    existing.score = object.score;
                }
            }
        }
    }
    kept
}

/// Build the final report from deduplicated, scored objects.
#[allow(clippy::too_many_arguments)]
pub fn aggregate(
    input: String,
    start: String,
    duration_seconds: f64,
    all_files: Vec<PathBuf>,
    skipped_files: Vec<PathBuf>,
    processed_files: usize,
    objects: Vec<ScanObject>,
    file_warnings: Vec<FileWarning>,
    threshold: f32,
    scored: bool,
    version: String,
    mapper: &CategoryMapper,
    projector: &TokenProjector,
) -> ScanReport {
    let malicious: Vec<usize> = objects
        .iter()
        .enumerate()
        .filter(|(_, object)| object.score.is_some_and(|s| s >= threshold))
        .map(|(index, _)| index)
        .collect();

    let mut activities: Vec<String> = Vec::new();
    for &index in &malicious {
        for token in objects[index].tokens(projector) {
            if mapper.is_activity(token) && !activities.contains(token) {
                activities.push(token.clone());
            }
        }
    }
    activities.sort();

    let verdict = if !scored {
        Verdict::Inconclusive
    } else if malicious.is_empty() {
        Verdict::Clean
    } else {
        Verdict::Malicious
    };

    let confidence = if !malicious.is_empty() {
        malicious
            .iter()
            .filter_map(|&index| objects[index].score)
            .fold(0.0f32, f32::max)
    } else {
        let min_benign = objects
            .iter()
            .filter_map(|object| object.score)
            .fold(f32::NAN, f32::min);
        if min_benign.is_nan() {
            0.0
        } else {
            1.0 - min_benign
        }
    };

    ScanReport {
        input,
        start,
        duration_seconds,
        all_files,
        skipped_files,
        processed_files,
        objects,
        malicious,
        activities,
        verdict,
        confidence,
        threshold,
        version,
        file_warnings,
    }
}
