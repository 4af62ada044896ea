use std::path::PathBuf;
use thiserror::Error;

/// Closed set of error kinds produced by a scan.
///
/// Recoverable kinds are downgraded to per-file or per-object warnings and
/// never interrupt the overall scan; fatal kinds terminate the scan with
/// exit code 2.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported extension: {path}")]
    UnsupportedExtension { path: PathBuf },

    #[error("parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("compilation truncated for {path}: {reason}")]
    CompileTruncation { path: PathBuf, reason: String },

    #[error("classifier unavailable: {message}")]
    ClassifierUnavailable { message: String },

    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    pub fn parse<P: Into<PathBuf>, S: Into<String>>(path: P, message: S) -> Self {
        Self::Parse { path: path.into(), message: message.into() }
    }

    pub fn truncation<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::CompileTruncation { path: path.into(), reason: reason.into() }
    }

    pub fn classifier_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ClassifierUnavailable { message: message.into() }
    }

    pub fn config_invalid<S: Into<String>>(message: S) -> Self {
        Self::ConfigInvalid { message: message.into() }
    }

    pub fn unsupported_extension<P: Into<PathBuf>>(path: P) -> Self {
        Self::UnsupportedExtension { path: path.into() }
    }

    /// Recoverable errors become warnings; the scan continues.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedExtension { .. }
                | Self::Parse { .. }
                | Self::CompileTruncation { .. }
        )
    }

    /// Fatal errors abort the scan with a structured error (exit code 2).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ClassifierUnavailable { .. } | Self::ConfigInvalid { .. }
        )
    }
}
