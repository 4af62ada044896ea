//! Classifier driver: windows token sequences and reduces window scores.
//!
//! The model itself is an opaque scoring oracle behind a trait. The bundled
//! artifact format is a calibrated linear decision layer (token weights +
//! bias through a sigmoid), resolved from a local model cache directory;
//! fetching artifacts from the network belongs to an external collaborator.
//! Scoring calls serialize through a gate so the oracle sees one batch at a
//! time no matter how many scan workers are running.

use crate::error::{Result, ScanError};
use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Environment variable pointing at a local model cache directory.
pub const MODEL_PATH_ENV: &str = "VERDICT_MODEL_PATH";

/// Maximum subword window fed to the classifier per call.
pub const SCORE_WINDOW: usize = 512;
/// Stride between consecutive windows of a long sequence.
pub const WINDOW_STRIDE: usize = 384;

/// Opaque scoring oracle over token sequences. Returns the maliciousness
/// probability of one window, in [0, 1].
pub trait ScoringOracle: Send + Sync {
    fn score_window(&self, tokens: &[String]) -> anyhow::Result<f32>;
}

pub struct ClassifierDriver {
    oracle: Box<dyn ScoringOracle>,
    revision: String,
    gate: Mutex<()>,
}

impl std::fmt::Debug for ClassifierDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierDriver")
            .field("revision", &self.revision)
            .finish()
    }
}

impl ClassifierDriver {
    pub fn new(oracle: Box<dyn ScoringOracle>, revision: impl Into<String>) -> Self {
        Self { oracle, revision: revision.into(), gate: Mutex::new(()) }
    }

    /// Resolve the driver from the local model cache. Absence of a cache
    /// is `ClassifierUnavailable`; the scan then reports inconclusive.
    pub fn from_env() -> Result<Self> {
        let Some(path) = std::env::var_os(MODEL_PATH_ENV) else {
            return Err(ScanError::classifier_unavailable(format!(
                "{MODEL_PATH_ENV} is not set and artifact download is not available here"
            )));
        };
        Self::from_cache_dir(Path::new(&path))
    }

    pub fn from_cache_dir(dir: &Path) -> Result<Self> {
        let (oracle, revision) = LinearOracle::load(dir).map_err(|e| {
            ScanError::classifier_unavailable(format!(
                "model cache at {} is unusable: {e:#}",
                dir.display()
            ))
        })?;
        debug!(revision = %revision, "loaded decision layer from model cache");
        Ok(Self::new(Box::new(oracle), revision))
    }

    /// Short revision hash embedded in report version strings.
    pub fn revision_short(&self) -> &str {
        let end = self.revision.len().min(8);
        &self.revision[..end]
    }

    /// Score a whole object: long sequences are cut into overlapping
    /// windows and the highest window probability wins.
    pub fn score(&self, tokens: &[String]) -> anyhow::Result<f32> {
        let _serialized = self.gate.lock().unwrap_or_else(|poison| poison.into_inner());

        if tokens.len() <= SCORE_WINDOW {
            return self.oracle.score_window(tokens);
        }

        let mut best: f32 = 0.0;
        let mut start = 0;
        while start < tokens.len() {
            let end = (start + SCORE_WINDOW).min(tokens.len());
            let score = self.oracle.score_window(&tokens[start..end])?;
            best = best.max(score);
            if end == tokens.len() {
                break;
            }
            start += WINDOW_STRIDE;
        }
        Ok(best)
    }
}

/// On-disk artifact: `decision_layer.yaml` next to a `REVISION` file
/// holding the pinned model revision hash.
#[derive(Debug, Deserialize)]
struct DecisionLayerFile {
    bias: f32,
    weights: FxHashMap<String, f32>,
}

pub struct LinearOracle {
    bias: f32,
    weights: FxHashMap<String, f32>,
}

impl LinearOracle {
    pub fn load(dir: &Path) -> anyhow::Result<(Self, String)> {
        let layer_path = dir.join("decision_layer.yaml");
        let content = std::fs::read_to_string(&layer_path)
            .with_context(|| format!("reading {}", layer_path.display()))?;
        let layer: DecisionLayerFile =
            serde_yaml::from_str(&content).context("parsing decision layer weights")?;

        let revision_path = dir.join("REVISION");
        let revision = std::fs::read_to_string(&revision_path)
            .with_context(|| format!("reading {}", revision_path.display()))?
            .trim()
            .to_string();
        if revision.is_empty() {
            anyhow::bail!("REVISION file is empty");
        }

        Ok((Self { bias: layer.bias, weights: layer.weights }, revision))
    }

    pub fn from_weights(bias: f32, weights: FxHashMap<String, f32>) -> Self {
        Self { bias, weights }
    }
}

impl ScoringOracle for LinearOracle {
    fn score_window(&self, tokens: &[String]) -> anyhow::Result<f32> {
        let mut activation = self.bias;
        for token in tokens {
            if let Some(weight) = self.weights.get(token) {
                activation += weight;
            }
        }
        Ok(1.0 / (1.0 + (-activation).exp()))
    }
}

/// Version string embedded in reports:
/// `<software-version>+<model-revision-short>.<mapping-tables-digest>`.
pub fn version_string(driver: Option<&ClassifierDriver>, tables_version: &str) -> String {
    let revision = driver.map(ClassifierDriver::revision_short).unwrap_or("unavailable");
    format!("{}+{}.{}", env!("CARGO_PKG_VERSION"), revision, tables_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle(bias: f32, weights: &[(&str, f32)]) -> LinearOracle {
        let map = weights.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        LinearOracle::from_weights(bias, map)
    }

    fn tokens(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn linear_oracle_is_a_sigmoid_over_token_weights() {
        let oracle = oracle(-2.0, &[("process_management", 4.0)]);
        let benign = oracle.score_window(&tokens(&["load_const", "store_name"])).unwrap();
        let hot = oracle
            .score_window(&tokens(&["load_global", "process_management"]))
            .unwrap();
        assert!(benign < 0.2);
        assert!(hot > 0.8);
    }

    #[test]
    fn short_sequences_use_a_single_window() {
        let driver = ClassifierDriver::new(Box::new(oracle(0.0, &[])), "deadbeefcafe");
        let score = driver.score(&tokens(&["load_const"])).unwrap();
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn long_sequences_reduce_to_the_worst_window() {
        // Hot token sits beyond the first window; max-reduction must see it.
        let mut sequence = vec!["nop".to_string(); SCORE_WINDOW + 100];
        sequence[SCORE_WINDOW + 50] = "dynamic_code_execution".to_string();
        let driver = ClassifierDriver::new(
            Box::new(oracle(-1.0, &[("dynamic_code_execution", 6.0)])),
            "deadbeefcafe",
        );
        let score = driver.score(&sequence).unwrap();
        assert!(score > 0.9);
    }

    #[test]
    fn revision_short_truncates_to_eight() {
        let driver = ClassifierDriver::new(Box::new(oracle(0.0, &[])), "0123456789abcdef");
        assert_eq!(driver.revision_short(), "01234567");
    }

    #[test]
    fn version_string_marks_missing_models() {
        let version = version_string(None, "aabbccdd");
        assert!(version.contains("+unavailable.aabbccdd"));
    }

    #[test]
    fn cache_loading_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("decision_layer.yaml"),
            "bias: -1.5\nweights:\n  process_management: 3.0\n  load_const: 0.1\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("REVISION"), "fedcba9876543210\n").unwrap();

        let driver = ClassifierDriver::from_cache_dir(dir.path()).unwrap();
        assert_eq!(driver.revision_short(), "fedcba98");
        let score = driver.score(&tokens(&["process_management"])).unwrap();
        assert!(score > 0.5);
    }

    #[test]
    fn missing_cache_is_classifier_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClassifierDriver::from_cache_dir(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ScanError::ClassifierUnavailable { .. }));
    }
}
