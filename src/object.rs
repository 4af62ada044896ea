//! Scan objects: code objects packaged for downstream consumption.
//!
//! A scan object wraps one code object with file-level metadata and lazily
//! memoized derived data (token sequence, instruction hash, subword count,
//! file digest). Derived data never changes once computed; the score is
//! attached exactly once by the classifier driver.

use crate::compiler::CodeObject;
use crate::languages::Language;
use crate::tokens::{subword_count, TokenProjector};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, OnceLock};

pub struct ScanObject {
    code: CodeObject,
    /// Full file source, shared between all objects of the file.
    source: Arc<str>,
    pub score: Option<f32>,
    tokens: OnceLock<Vec<String>>,
    token_string: OnceLock<String>,
    hash: OnceLock<String>,
    subwords: OnceLock<usize>,
    file_digest: OnceLock<String>,
}

impl ScanObject {
    pub fn new(code: CodeObject, source: Arc<str>) -> Self {
        Self {
            code,
            source,
            score: None,
            tokens: OnceLock::new(),
            token_string: OnceLock::new(),
            hash: OnceLock::new(),
            subwords: OnceLock::new(),
            file_digest: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.code.name
    }

    pub fn language(&self) -> Language {
        self.code.language
    }

    pub fn file_path(&self) -> &Path {
        &self.code.file_path
    }

    pub fn location(&self) -> Option<(usize, usize)> {
        self.code.location
    }

    pub fn code(&self) -> &CodeObject {
        &self.code
    }

    pub fn warnings(&self) -> &[crate::compiler::Warning] {
        &self.code.warnings
    }

    /// Projected token sequence, computed once.
    pub fn tokens(&self, projector: &TokenProjector) -> &[String] {
        self.tokens.get_or_init(|| projector.project_object(&self.code))
    }

    /// Space-joined token sequence as fed to the classifier.
    pub fn token_string(&self, projector: &TokenProjector) -> &str {
        self.token_string.get_or_init(|| self.tokens(projector).join(" "))
    }

    /// SHA-256 fingerprint of the instruction stream, used for
    /// deduplication. Stable across runs on the same input.
    pub fn instruction_hash(&self) -> &str {
        self.hash.get_or_init(|| self.code.instruction_hash())
    }

    /// Approximate classifier subword count for this object's tokens.
    pub fn subword_count(&self, projector: &TokenProjector) -> usize {
        *self.subwords.get_or_init(|| subword_count(self.tokens(projector)))
    }

    /// SHA-256 of the originating file's content.
    pub fn file_sha256(&self) -> &str {
        self.file_digest
            .get_or_init(|| format!("{:x}", Sha256::digest(self.source.as_bytes())))
    }

    /// The object's source lines `[start, end]`, when a location is known.
    pub fn source_excerpt(&self) -> Option<String> {
        let (start, end) = self.code.location?;
        let lines: Vec<&str> = self
            .source
            .lines()
            .skip(start.saturating_sub(1))
            .take(end.saturating_sub(start) + 1)
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

/// Flatten a compiled module into scan objects: the module itself plus one
/// object per top-level child, sharing the file's source buffer.
pub fn assemble_objects(module: CodeObject, source: Arc<str>) -> Vec<ScanObject> {
    // The module keeps its children for reference-hash resolution; each
    // child additionally becomes its own unit of classification.
    let children = module.children.clone();
    let mut objects = Vec::with_capacity(1 + children.len());
    objects.push(ScanObject::new(module, Arc::clone(&source)));
    for child in children {
        objects.push(ScanObject::new(child, Arc::clone(&source)));
    }
    objects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::config::ScanConfig;
    use crate::mappings::CategoryMapper;

    fn objects_for(source: &str) -> (Vec<ScanObject>, CategoryMapper) {
        let config = ScanConfig::default();
        let mapper = CategoryMapper::load().unwrap();
        let module = compile_source(
            Path::new("sample.py"),
            source,
            Language::Python,
            &config,
            &mapper,
        )
        .unwrap();
        (assemble_objects(module, Arc::from(source)), mapper)
    }

    #[test]
    fn module_and_functions_become_separate_objects() {
        let (objects, _) = objects_for("def a():\n    return 1\n\ndef b():\n    return 2\n");
        let names: Vec<&str> = objects.iter().map(|o| o.name()).collect();
        assert_eq!(names, vec!["<module>", "a", "b"]);
    }

    #[test]
    fn hashes_memoize_and_stay_stable() {
        let (objects, _) = objects_for("x = 1\n");
        let first = objects[0].instruction_hash().to_string();
        assert_eq!(objects[0].instruction_hash(), first);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn token_string_joins_with_spaces() {
        let (objects, mapper) = objects_for("x = 1\n");
        let projector = TokenProjector::new(&mapper, 15);
        assert_eq!(
            objects[0].token_string(&projector),
            "targeted_file load_const integer store_name x return_const none"
        );
    }

    #[test]
    fn source_excerpt_covers_the_object_lines() {
        let (objects, _) = objects_for("x = 1\n\ndef f():\n    return 2\n");
        let function = objects.iter().find(|o| o.name() == "f").unwrap();
        let excerpt = function.source_excerpt().unwrap();
        assert!(excerpt.contains("def f():"));
        assert!(excerpt.contains("return 2"));
        assert!(!excerpt.contains("x = 1"));
    }

    #[test]
    fn shared_source_is_not_duplicated_per_object() {
        let big = format!("data = \"{}\"\n\ndef f():\n    return data\n", "A".repeat(100_000));
        let (objects, _) = objects_for(&big);
        assert_eq!(objects.len(), 2);
        // Both objects point at the same buffer.
        let first = objects[0].source.as_ptr();
        let second = objects[1].source.as_ptr();
        assert_eq!(first, second);
    }
}
