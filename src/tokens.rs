//! Projection of instructions into ML token sequences.
//!
//! Every instruction projects to at least one token (its lowercased opcode
//! name). Arguments follow: identifiers map through the function/import
//! category tables where known, stay verbatim when short, and collapse to a
//! size-bucket token when long; category tokens pass through canonically;
//! keyword-name lists expand one token per name in order.

use crate::classify::{self, Category};
use crate::compiler::{Arg, CodeObject, Instruction, OpCode};
use crate::mappings::CategoryMapper;
use crate::languages::Language;

pub struct TokenProjector<'a> {
    mapper: &'a CategoryMapper,
    short_threshold: usize,
}

impl<'a> TokenProjector<'a> {
    pub fn new(mapper: &'a CategoryMapper, short_threshold: usize) -> Self {
        Self { mapper, short_threshold }
    }

    /// Token sequence for a whole code object: warning tokens first, then
    /// each instruction in stream order.
    pub fn project_object(&self, object: &CodeObject) -> Vec<String> {
        let mut tokens = Vec::with_capacity(object.instructions.len() * 2);
        for warning in &object.warnings {
            tokens.push(warning.token().to_string());
        }
        for instruction in &object.instructions {
            self.project_instruction(instruction, object, &mut tokens);
        }
        tokens
    }

    pub fn project_instruction(
        &self,
        instruction: &Instruction,
        object: &CodeObject,
        out: &mut Vec<String>,
    ) {
        out.push(instruction.opcode.name().to_lowercase());

        match &instruction.arg {
            None => {}
            Some(Arg::Int(value)) => match instruction.opcode {
                // Constants render as numeric buckets; counts stay literal.
                OpCode::LoadConst => out.push(classify::classify_int(*value).token().to_string()),
                _ => out.push(value.to_string()),
            },
            Some(Arg::Float(_)) => out.push(Category::Float.token().to_string()),
            Some(Arg::Bool(_)) => out.push(Category::Boolean.token().to_string()),
            Some(Arg::Str(text)) => {
                if !text.is_empty() {
                    out.push(text.clone());
                }
            }
            Some(Arg::Symbol(symbol)) => {
                out.push(self.project_symbol(instruction.opcode, object.language, symbol));
            }
            Some(Arg::Category(category)) => out.push(category.token().to_string()),
            Some(Arg::ObjectRef(index)) => {
                // Only the referenced child's name; never its stream.
                let name = object
                    .children
                    .get(*index)
                    .map(|child| child.name.as_str())
                    .unwrap_or("<unresolved>");
                out.push(name.to_lowercase());
            }
            Some(Arg::KwNames(names)) => {
                for name in names {
                    out.push(name.to_lowercase());
                }
            }
        }
    }

    fn project_symbol(&self, opcode: OpCode, language: Language, symbol: &str) -> String {
        match opcode {
            // Name reads go through the function table; stores and the
            // attribute position stay verbatim so the bound name and the
            // accessed member remain visible next to a mapped receiver.
            OpCode::LoadName | OpCode::LoadGlobal => {
                if let Some(category) = self.mapper.lookup_function(language, symbol) {
                    return category.to_string();
                }
            }
            OpCode::ImportName | OpCode::ImportFrom => {
                if let Some(category) = self.mapper.lookup_import(language, symbol) {
                    return category.to_string();
                }
            }
            _ => {}
        }

        let lowered = symbol.to_lowercase();
        if lowered.chars().count() < self.short_threshold {
            lowered
        } else {
            classify::size_bucket(lowered.chars().count()).token().to_string()
        }
    }
}

/// Approximate count of classifier subword tokens for a projected
/// sequence. The sequence classifier splits mixed tokens further; this
/// mirrors that expansion closely enough to drive windowing decisions.
pub fn subword_count(tokens: &[String]) -> usize {
    tokens
        .iter()
        .map(|token| {
            token
                .split(|c: char| !c.is_ascii_alphanumeric())
                .filter(|piece| !piece.is_empty())
                .map(|piece| 1 + piece.len() / 8)
                .sum::<usize>()
                .max(1)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::config::ScanConfig;
    use std::path::Path;

    fn project(language: Language, source: &str) -> Vec<String> {
        let config = ScanConfig::default();
        let mapper = CategoryMapper::load().unwrap();
        let module =
            compile_source(Path::new("test.src"), source, language, &config, &mapper).unwrap();
        TokenProjector::new(&mapper, config.short_string_threshold).project_object(&module)
    }

    fn project_child(language: Language, source: &str, name: &str) -> Vec<String> {
        let config = ScanConfig::default();
        let mapper = CategoryMapper::load().unwrap();
        let module =
            compile_source(Path::new("test.src"), source, language, &config, &mapper).unwrap();
        let child = module
            .children
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("no child object named {name}"));
        TokenProjector::new(&mapper, config.short_string_threshold).project_object(child)
    }

    #[test]
    fn every_instruction_projects_at_least_one_token() {
        let sources = [
            "x = 5\n",
            "import os\nos.system('rm -rf /')\n",
            "for i in range(10):\n    print(i)\n",
        ];
        for source in sources {
            let config = ScanConfig::default();
            let mapper = CategoryMapper::load().unwrap();
            let module = compile_source(
                Path::new("t.py"),
                source,
                Language::Python,
                &config,
                &mapper,
            )
            .unwrap();
            let projector = TokenProjector::new(&mapper, config.short_string_threshold);
            for instruction in &module.instructions {
                let mut out = Vec::new();
                projector.project_instruction(instruction, &module, &mut out);
                assert!(!out.is_empty(), "no tokens for {instruction:?}");
            }
        }
    }

    #[test]
    fn simple_assignment_token_stream() {
        let tokens = project(Language::Python, "x = 5\n");
        assert_eq!(
            tokens,
            vec!["targeted_file", "load_const", "integer", "store_name", "x", "return_const", "none"]
        );
    }

    #[test]
    fn process_call_maps_the_receiver_and_orders_keywords() {
        let tokens =
            project_child(Language::Python, "def f():\n    subprocess.run(\"ls\", shell=True)\n", "f");
        let joined = tokens.join(" ");
        // Receiver maps to its category, the attribute stays verbatim, the
        // keyword list sits between its values and the call arity.
        let expected = "load_global process_management load_attr run load_const ls \
                        load_const boolean kw_names shell call 1";
        assert!(joined.contains(expected), "unexpected stream: {joined}");
        assert!(joined.ends_with("return_value"));
    }

    #[test]
    fn shell_literal_collapses_to_its_category() {
        let tokens = project(Language::Python, "import os\nos.system(\"rm -rf /\")\n");
        let joined = tokens.join(" ");
        assert!(joined.contains("import_name os store_name os"));
        assert!(joined.contains("load_global process_management load_attr system"));
        assert!(joined.contains("load_const STRING_BASH call 1"));
    }

    #[test]
    fn long_strings_never_appear_verbatim() {
        let secret = "x".repeat(300);
        let tokens = project(Language::Python, &format!("data = \"{secret}\"\n"));
        assert!(tokens.iter().all(|t| !t.contains(&secret)));
        assert!(tokens.contains(&"STRING_L".to_string()));
    }

    #[test]
    fn short_strings_stay_verbatim_lowercased() {
        let tokens = project(Language::Python, "name = \"Alice\"\n");
        assert!(tokens.contains(&"alice".to_string()));
    }

    #[test]
    fn make_function_projects_only_the_child_name() {
        let tokens = project(Language::Python, "def handler():\n    return 1\n");
        let joined = tokens.join(" ");
        assert!(joined.contains("make_function handler store_name handler"));
        // The body's instructions must not leak into the module stream.
        assert!(!joined.contains("return_value"));
    }

    #[test]
    fn long_identifiers_bucket_instead_of_leaking() {
        let name = "a".repeat(40);
        let tokens = project(Language::Python, &format!("{name} = 1\n"));
        assert!(tokens.contains(&"STRING_M".to_string()));
        assert!(tokens.iter().all(|t| t != &name));
    }

    #[test]
    fn javascript_require_maps_like_an_import() {
        let tokens =
            project(Language::JavaScript, "const cp = require(\"child_process\");\n");
        let joined = tokens.join(" ");
        assert!(joined.contains("import_name process_management store_name cp"));
    }

    #[test]
    fn subword_count_grows_with_sequence_length() {
        let short = vec!["load_const".to_string()];
        let long: Vec<String> = (0..200).map(|_| "load_global".to_string()).collect();
        assert!(subword_count(&short) >= 2);
        assert!(subword_count(&long) > subword_count(&short));
    }

    #[test]
    fn projection_is_deterministic() {
        let source = "import os\n\ndef f(x):\n    return os.path.join(x)\n";
        assert_eq!(project(Language::Python, source), project(Language::Python, source));
    }
}
