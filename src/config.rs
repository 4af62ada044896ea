use crate::error::{Result, ScanError};
use std::time::Duration;

/// Maliciousness score at or above which an object is flagged.
pub const DEFAULT_THRESHOLD: f32 = 0.7;

/// String literals shorter than this are kept verbatim in the instruction
/// stream; longer ones are replaced by a category token.
pub const DEFAULT_SHORT_STRING_THRESHOLD: usize = 15;

/// Recursion bound for the compiler; exceeding it truncates the subtree.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 500;

/// Files at or above this size get a LARGE_FILE warning on the module object.
pub const LARGE_FILE_THRESHOLD: u64 = 500 * 1024;

/// Hard cap on scanned file size.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

pub const DEFAULT_FILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a scan. Passed by value into the scan entry point;
/// no global state.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Score threshold for the malicious/benign decision.
    pub threshold: f32,
    /// Accepted file extensions (without dots). Files outside this set are
    /// listed as skipped.
    pub extensions: Vec<String>,
    /// Verbatim-emission cutoff for string literals.
    pub short_string_threshold: usize,
    /// Compiler recursion bound.
    pub max_recursion_depth: usize,
    /// Maximum file size to read.
    pub max_file_size: u64,
    /// Per-file processing timeout.
    pub file_timeout: Duration,
    /// Overall scan deadline; `None` means unbounded.
    pub deadline: Option<Duration>,
    /// Worker threads for the file pool; `None` uses rayon's default.
    pub worker_threads: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            extensions: crate::languages::SUPPORTED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            short_string_threshold: DEFAULT_SHORT_STRING_THRESHOLD,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            max_file_size: MAX_FILE_SIZE,
            file_timeout: DEFAULT_FILE_TIMEOUT,
            deadline: None,
            worker_threads: None,
        }
    }
}

impl ScanConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration before a scan starts.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ScanError::config_invalid(format!(
                "threshold must be within [0.0, 1.0], got {}",
                self.threshold
            )));
        }
        if self.extensions.is_empty() {
            return Err(ScanError::config_invalid("extension list must not be empty"));
        }
        if self.short_string_threshold == 0 {
            return Err(ScanError::config_invalid(
                "short_string_threshold must be greater than 0",
            ));
        }
        if self.max_recursion_depth == 0 {
            return Err(ScanError::config_invalid(
                "max_recursion_depth must be greater than 0",
            ));
        }
        if self.max_file_size == 0 {
            return Err(ScanError::config_invalid("max_file_size must be greater than 0"));
        }
        if self.file_timeout.is_zero() {
            return Err(ScanError::config_invalid("file_timeout must be greater than 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ScanConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let config = ScanConfig { threshold: 1.5, ..ScanConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_extension_list() {
        let config = ScanConfig { extensions: vec![], ..ScanConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = ScanConfig { file_timeout: Duration::ZERO, ..ScanConfig::default() };
        assert!(config.validate().is_err());
    }
}
