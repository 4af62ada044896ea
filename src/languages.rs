use std::path::Path;

/// Extensions accepted by default, without dots.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["py", "js", "mjs", "cjs"];

/// The closed set of supported source language families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
}

impl Language {
    /// Select a grammar by file extension. Returns `None` for anything
    /// outside the closed set; such files are skipped, never guessed.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Self::from_extension(&ext)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "py" => Some(Self::Python),
            "js" | "mjs" | "cjs" => Some(Self::JavaScript),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
        }
    }

    pub fn grammar(&self) -> tree_sitter::Language {
        match self {
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn detects_by_extension() {
        assert_eq!(Language::from_path(&PathBuf::from("setup.py")), Some(Language::Python));
        assert_eq!(
            Language::from_path(&PathBuf::from("index.mjs")),
            Some(Language::JavaScript)
        );
        assert_eq!(
            Language::from_path(&PathBuf::from("lib/util.cjs")),
            Some(Language::JavaScript)
        );
    }

    #[test]
    fn unknown_extensions_are_not_guessed() {
        assert_eq!(Language::from_path(&PathBuf::from("main.rs")), None);
        assert_eq!(Language::from_path(&PathBuf::from("README")), None);
        assert_eq!(Language::from_path(&PathBuf::from("data.json")), None);
    }

    #[test]
    fn extension_case_is_ignored() {
        assert_eq!(Language::from_path(&PathBuf::from("SETUP.PY")), Some(Language::Python));
    }
}
