//! Category mappings shipped as embedded data.
//!
//! The function-name, import-name, and sensitive-path tables are data, not
//! code; they are parsed once at startup and frozen. The digest of the
//! embedded content is exposed so reports can be interpreted against the
//! exact tables that produced them.

use crate::languages::Language;
use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use sha2::{Digest, Sha256};

const FUNCTION_CATEGORIES_YAML: &str = include_str!("mappings/function_categories.yaml");
const IMPORT_CATEGORIES_YAML: &str = include_str!("mappings/import_categories.yaml");
const SENSITIVE_PATHS_YAML: &str = include_str!("mappings/sensitive_paths.yaml");

#[derive(Debug, Deserialize)]
struct SymbolMapping {
    symbol: String,
    category: String,
}

#[derive(Debug, Deserialize)]
struct SymbolTable {
    #[serde(default)]
    python: Vec<SymbolMapping>,
    #[serde(default)]
    javascript: Vec<SymbolMapping>,
}

#[derive(Debug, Deserialize)]
struct SensitivePathsFile {
    paths: Vec<String>,
}

/// Frozen lookup tables mapping symbols to behavior categories.
///
/// Immutable after construction and freely shared across scan workers.
pub struct CategoryMapper {
    functions: FxHashMap<(Language, String), String>,
    imports: FxHashMap<(Language, String), String>,
    sensitive_paths: FxHashSet<String>,
    activities: FxHashSet<String>,
    version: String,
}

impl CategoryMapper {
    /// Load the embedded tables. Fails only if the shipped YAML is
    /// malformed, which is a build defect rather than a runtime condition.
    pub fn load() -> Result<Self> {
        let functions_table: SymbolTable = serde_yaml::from_str(FUNCTION_CATEGORIES_YAML)
            .context("embedded function category table is malformed")?;
        let imports_table: SymbolTable = serde_yaml::from_str(IMPORT_CATEGORIES_YAML)
            .context("embedded import category table is malformed")?;
        let sensitive: SensitivePathsFile = serde_yaml::from_str(SENSITIVE_PATHS_YAML)
            .context("embedded sensitive path table is malformed")?;

        let mut functions = FxHashMap::default();
        let mut activities = FxHashSet::default();
        for (language, rows) in [
            (Language::Python, functions_table.python),
            (Language::JavaScript, functions_table.javascript),
        ] {
            for row in rows {
                activities.insert(row.category.clone());
                functions.insert((language, row.symbol.to_lowercase()), row.category);
            }
        }

        let mut imports = FxHashMap::default();
        for (language, rows) in [
            (Language::Python, imports_table.python),
            (Language::JavaScript, imports_table.javascript),
        ] {
            for row in rows {
                activities.insert(row.category.clone());
                imports.insert((language, row.symbol.to_lowercase()), row.category);
            }
        }

        let sensitive_paths = sensitive.paths.into_iter().collect();

        let mut hasher = Sha256::new();
        hasher.update(FUNCTION_CATEGORIES_YAML.as_bytes());
        hasher.update(IMPORT_CATEGORIES_YAML.as_bytes());
        hasher.update(SENSITIVE_PATHS_YAML.as_bytes());
        let version = format!("{:x}", hasher.finalize())[..8].to_string();

        Ok(Self { functions, imports, sensitive_paths, activities, version })
    }

    /// Category for a function-like symbol, if any. Lookup is
    /// case-insensitive; leading underscores are stripped the way mangled
    /// or "private" names carry them.
    pub fn lookup_function(&self, language: Language, symbol: &str) -> Option<&str> {
        let clean = symbol.trim_start_matches('_').to_lowercase();
        self.functions.get(&(language, clean)).map(String::as_str)
    }

    /// Category for an imported module name, if any.
    pub fn lookup_import(&self, language: Language, module: &str) -> Option<&str> {
        let clean = module.to_lowercase();
        self.imports.get(&(language, clean)).map(String::as_str)
    }

    pub fn is_sensitive_path(&self, value: &str) -> bool {
        self.sensitive_paths.contains(value)
    }

    pub fn sensitive_paths(&self) -> &FxHashSet<String> {
        &self.sensitive_paths
    }

    /// The curated activity vocabulary: every category a token can map to.
    pub fn is_activity(&self, token: &str) -> bool {
        self.activities.contains(token)
    }

    /// Short digest of the embedded table content.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn mapping_count(&self) -> usize {
        self.functions.len() + self.imports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_tables_load() {
        let mapper = CategoryMapper::load().unwrap();
        assert!(mapper.mapping_count() > 100);
        assert_eq!(mapper.version().len(), 8);
    }

    #[test]
    fn function_lookup_is_per_language() {
        let mapper = CategoryMapper::load().unwrap();
        assert_eq!(
            mapper.lookup_function(Language::Python, "subprocess"),
            Some("process_management")
        );
        assert_eq!(
            mapper.lookup_function(Language::Python, "os"),
            Some("process_management")
        );
        assert_eq!(
            mapper.lookup_function(Language::JavaScript, "child_process"),
            Some("process_management")
        );
        assert_eq!(mapper.lookup_function(Language::JavaScript, "subprocess"), None);
    }

    #[test]
    fn leading_underscores_are_stripped() {
        let mapper = CategoryMapper::load().unwrap();
        assert_eq!(
            mapper.lookup_function(Language::Python, "__import__"),
            Some("dynamic_code_execution")
        );
        assert_eq!(
            mapper.lookup_function(Language::Python, "_eval"),
            Some("dynamic_code_execution")
        );
    }

    #[test]
    fn import_lookup_leaves_stdlib_visible() {
        let mapper = CategoryMapper::load().unwrap();
        assert_eq!(
            mapper.lookup_import(Language::Python, "requests"),
            Some("network_http_request")
        );
        // "os" stays verbatim in import position.
        assert_eq!(mapper.lookup_import(Language::Python, "os"), None);
    }

    #[test]
    fn activity_vocabulary_covers_mapped_categories() {
        let mapper = CategoryMapper::load().unwrap();
        for token in ["process_management", "filesystem_access", "dynamic_code_execution"] {
            assert!(mapper.is_activity(token));
        }
        assert!(!mapper.is_activity("load_const"));
    }

    #[test]
    fn sensitive_paths_are_exact_match() {
        let mapper = CategoryMapper::load().unwrap();
        assert!(mapper.is_sensitive_path("/etc/passwd"));
        assert!(!mapper.is_sensitive_path("/etc/passwd.bak"));
    }
}
