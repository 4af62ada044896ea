//! AST-to-Instruction compilation.
//!
//! Walks a parsed source tree and emits a linear instruction stream grouped
//! into code objects: one `<module>` object per file, with top-level
//! functions, classes, and synthetic lambda/comprehension bodies as child
//! objects. Nested definitions are inlined into their enclosing stream.
//! Emission order follows source order everywhere; no map or set is
//! iterated during emission.

pub mod opcode;
pub mod scope;

mod javascript;
mod python;

pub use opcode::{stream_hash, Arg, Instruction, OpCode};

use crate::classify::{self, Category, StrClass};
use crate::config::ScanConfig;
use crate::error::Result;
use crate::languages::Language;
use crate::mappings::CategoryMapper;
use crate::parser::{self, SourceParser};
use scope::{FunctionScope, ScopeTracker};
use std::path::{Path, PathBuf};
use tracing::debug;
use tree_sitter::Node;

/// Compilation warning attached to the code object it occurred in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Localized parse damage; the offending subtree was skipped.
    ParseDamage,
    /// Recursion or timeout bound hit; a subtree was collapsed to NOP.
    Truncation,
    /// Unusually large input file.
    LargeFile,
    /// Content could not be read cleanly (lossy decoding applied).
    ReadIssue,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Stable token prefixed to the owning object's token stream.
    pub fn token(&self) -> &'static str {
        match self.kind {
            WarningKind::ParseDamage => "MALFORMED_SYNTAX",
            WarningKind::Truncation => "TRUNCATED",
            WarningKind::LargeFile => "LARGE_FILE",
            WarningKind::ReadIssue => "FILE_READING_ISSUES",
        }
    }
}

/// An immutable, named, linear instruction sequence produced from one
/// syntactic scope. Forms a tree rooted at the `<module>` object.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub children: Vec<CodeObject>,
    /// One-based (start, end) line span.
    pub location: Option<(usize, usize)>,
    /// 0 = top level of a file.
    pub depth: usize,
    pub file_path: PathBuf,
    pub language: Language,
    pub warnings: Vec<Warning>,
}

impl CodeObject {
    /// Merkle-like SHA-256 fingerprint: child references hash to the
    /// child's own fingerprint, line numbers are excluded.
    pub fn instruction_hash(&self) -> String {
        let child_hashes: Vec<String> =
            self.children.iter().map(CodeObject::instruction_hash).collect();
        stream_hash(&self.instructions, &child_hashes)
    }

    /// Every jump target must be a valid index in the same stream and
    /// every object reference must resolve.
    pub fn is_well_formed(&self) -> bool {
        let in_range = self.instructions.iter().all(|i| match i.jump {
            Some(target) => target < self.instructions.len(),
            None => true,
        });
        let refs_resolve = self.instructions.iter().all(|i| match &i.arg {
            Some(Arg::ObjectRef(idx)) => *idx < self.children.len(),
            _ => true,
        });
        in_range && refs_resolve && self.children.iter().all(CodeObject::is_well_formed)
    }
}

/// Instruction buffer for one code object under construction, with the
/// loop bookkeeping needed to patch break/continue jumps.
pub(crate) struct Stream {
    pub instructions: Vec<Instruction>,
    pub loops: Vec<LoopFrame>,
}

pub(crate) struct LoopFrame {
    pub start: usize,
    pub breaks: Vec<usize>,
}

impl Stream {
    pub(crate) fn new() -> Self {
        Self { instructions: Vec::new(), loops: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }
}

pub(crate) struct Compiler<'a> {
    pub language: Language,
    pub source: &'a [u8],
    pub config: &'a ScanConfig,
    pub mapper: &'a CategoryMapper,
    pub scopes: ScopeTracker,
    /// Definition nesting: 0 while emitting the module stream.
    pub nesting: usize,
    /// Children of the module object, in creation order.
    children: Vec<CodeObject>,
    warnings: Vec<Warning>,
    file_path: &'a Path,
    depth: usize,
    truncation_reported: bool,
}

impl<'a> Compiler<'a> {
    fn new(
        language: Language,
        source: &'a [u8],
        file_path: &'a Path,
        config: &'a ScanConfig,
        mapper: &'a CategoryMapper,
        scopes: ScopeTracker,
    ) -> Self {
        Self {
            language,
            source,
            config,
            mapper,
            scopes,
            nesting: 0,
            children: Vec::new(),
            warnings: Vec::new(),
            file_path,
            depth: 0,
            truncation_reported: false,
        }
    }

    pub fn text(&self, node: Node) -> &'a str {
        parser::node_text(node, self.source)
    }

    pub fn line(&self, node: Node) -> usize {
        node.start_position().row + 1
    }

    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        self.warnings.push(Warning::new(kind, message));
    }

    pub fn emit(&mut self, stream: &mut Stream, opcode: OpCode, arg: Option<Arg>, line: usize) {
        stream.instructions.push(Instruction::new(opcode, arg, line));
    }

    /// Emit a jump whose target is patched later; returns its index.
    pub fn emit_jump(&mut self, stream: &mut Stream, opcode: OpCode, line: usize) -> usize {
        stream.instructions.push(Instruction::new(opcode, None, line));
        stream.instructions.len() - 1
    }

    pub fn patch_jump(&mut self, stream: &mut Stream, at: usize, target: usize) {
        stream.instructions[at].jump = Some(target);
    }

    /// Patch a pending jump to the next emitted instruction.
    pub fn patch_to_here(&mut self, stream: &mut Stream, at: usize) {
        let target = stream.instructions.len();
        stream.instructions[at].jump = Some(target);
    }

    /// Central dispatch. Error subtrees are skipped with a warning; depth
    /// overruns collapse the subtree into a NOP carrying a category token.
    pub fn emit_node(&mut self, stream: &mut Stream, node: Node) {
        if node.is_error() || node.is_missing() {
            let line = self.line(node);
            self.warn(
                WarningKind::ParseDamage,
                format!("skipped malformed subtree at line {line}"),
            );
            return;
        }

        if self.depth >= self.config.max_recursion_depth {
            if !self.truncation_reported {
                self.truncation_reported = true;
                self.warn(
                    WarningKind::Truncation,
                    format!("nesting deeper than {} was truncated", self.config.max_recursion_depth),
                );
            }
            let line = self.line(node);
            self.emit(stream, OpCode::Nop, Some(Arg::Category(Category::Truncated)), line);
            return;
        }

        self.depth += 1;
        match self.language {
            Language::Python => python::emit_node(self, stream, node),
            Language::JavaScript => javascript::emit_node(self, stream, node),
        }
        self.depth -= 1;
    }

    /// Canonical linearization fallback: emit every named child in source
    /// order. Comments never produce instructions.
    pub fn emit_child_nodes(&mut self, stream: &mut Stream, node: Node) {
        for child in parser::named_children(node) {
            if child.kind() != "comment" {
                self.emit_node(stream, child);
            }
        }
    }

    pub fn emit_load_name(&mut self, stream: &mut Stream, name: &str, line: usize) {
        let opcode = self.scopes.load_op(name);
        self.emit(stream, opcode, Some(Arg::Symbol(name.to_string())), line);
    }

    pub fn emit_store_name(&mut self, stream: &mut Stream, name: &str, line: usize) {
        let opcode = self.scopes.store_op(name);
        self.emit(stream, opcode, Some(Arg::Symbol(name.to_string())), line);
        self.scopes.bind_module_name(name);
    }

    /// Classify and emit a string literal whose quotes have been removed.
    pub fn emit_string_literal(&mut self, stream: &mut Stream, value: &str, line: usize) {
        let arg = match classify::classify_str(
            value,
            self.mapper.sensitive_paths(),
            self.config.short_string_threshold,
        ) {
            StrClass::Verbatim(text) => Arg::Str(text),
            StrClass::Category(category) => Arg::Category(category),
        };
        self.emit(stream, OpCode::LoadConst, Some(arg), line);
    }

    /// Numeric literals carry their typed value; the projector renders
    /// them as bucketed category tokens.
    pub fn emit_number_literal(&mut self, stream: &mut Stream, text: &str, line: usize) {
        let arg = parse_number_arg(text);
        self.emit(stream, OpCode::LoadConst, Some(arg), line);
    }

    pub fn add_child(&mut self, child: CodeObject) -> usize {
        self.children.push(child);
        self.children.len() - 1
    }

    /// Compile a function-like body into its own instruction stream:
    /// RESUME prologue, body, RETURN_VALUE epilogue unless the body
    /// already returned.
    pub fn compile_body_stream(
        &mut self,
        body: Node,
        function_scope: FunctionScope,
        line: usize,
    ) -> Vec<Instruction> {
        self.scopes.push_function(function_scope);
        self.nesting += 1;

        let mut stream = Stream::new();
        self.emit(&mut stream, OpCode::Resume, Some(Arg::Int(0)), line);
        self.emit_node(&mut stream, body);
        // Jumps out of a trailing branch may target the slot right after
        // the body; those need the epilogue even when the body returned.
        let end_index = stream.instructions.len();
        let dangling = stream.instructions.iter().any(|i| i.jump == Some(end_index));
        let returns = matches!(
            stream.instructions.last().map(|i| i.opcode),
            Some(OpCode::ReturnValue) | Some(OpCode::ReturnConst)
        );
        if !returns || dangling {
            let end = body.end_position().row + 1;
            self.emit(&mut stream, OpCode::ReturnValue, None, end);
        }

        self.nesting -= 1;
        self.scopes.pop_function();
        stream.instructions
    }

    /// Wrap a compiled stream into a child object owned by the module.
    pub fn make_child_object(
        &mut self,
        name: &str,
        instructions: Vec<Instruction>,
        location: (usize, usize),
    ) -> usize {
        let child = CodeObject {
            name: name.to_string(),
            instructions,
            children: Vec::new(),
            location: Some(location),
            depth: 1,
            file_path: self.file_path.to_path_buf(),
            language: self.language,
            warnings: Vec::new(),
        };
        self.add_child(child)
    }
}

/// Call arguments in source order.
pub(crate) enum CallArg<'tree> {
    Positional(Node<'tree>),
    Keyword(String, Node<'tree>),
}

impl<'a> Compiler<'a> {
    /// Emit a call: positional values first, then keyword values in
    /// declaration order, then KW_NAMES listing those names, then CALL
    /// with the positional count. The ordering is load-bearing for both
    /// hashing and tokens.
    pub fn emit_call_args(&mut self, stream: &mut Stream, args: Vec<CallArg>, line: usize) {
        let mut keyword_names = Vec::new();
        let mut positional_count: i64 = 0;

        for arg in &args {
            if let CallArg::Positional(node) = arg {
                positional_count += 1;
                self.emit_node(stream, *node);
            }
        }
        for arg in &args {
            if let CallArg::Keyword(name, node) = arg {
                keyword_names.push(name.clone());
                self.emit_node(stream, *node);
            }
        }
        if !keyword_names.is_empty() {
            self.emit(stream, OpCode::KwNames, Some(Arg::KwNames(keyword_names)), line);
        }
        self.emit(stream, OpCode::Call, Some(Arg::Int(positional_count)), line);
    }
}

/// Numeric literal parsing across both grammars: handles radix prefixes,
/// digit separators, Python imaginary suffixes, and BigInt `n`. Literals
/// too large for a machine integer collapse straight into the
/// INTEGER_LARGE bucket.
fn parse_number_arg(raw: &str) -> Arg {
    let text = raw.replace('_', "");
    let lowered = text.to_ascii_lowercase();

    if let Some(body) = lowered.strip_suffix('j') {
        let value = if body.is_empty() { 1.0 } else { body.parse::<f64>().unwrap_or(0.0) };
        return Arg::Float(value);
    }
    if let Some(body) = lowered.strip_suffix('n') {
        return match body.parse::<i64>() {
            Ok(value) => Arg::Int(value),
            Err(_) => Arg::Category(Category::IntegerLarge),
        };
    }
    for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if let Some(body) = lowered.strip_prefix(prefix) {
            return match i64::from_str_radix(body, radix) {
                Ok(value) => Arg::Int(value),
                Err(_) => Arg::Category(Category::IntegerLarge),
            };
        }
    }
    if lowered.contains('.') || lowered.contains('e') {
        if let Ok(value) = lowered.parse::<f64>() {
            return Arg::Float(value);
        }
    }
    match lowered.parse::<i64>() {
        Ok(value) => Arg::Int(value),
        Err(_) => Arg::Category(Category::IntegerLarge),
    }
}

/// Compile one file into its module code object and children.
pub fn compile_source(
    path: &Path,
    source: &str,
    language: Language,
    config: &ScanConfig,
    mapper: &CategoryMapper,
) -> Result<CodeObject> {
    let parsed = SourceParser::new(language).parse(path, source)?;
    let root = parsed.tree.root_node();
    let source_bytes = source.as_bytes();

    let global_declared = match language {
        Language::Python => python::collect_global_declarations(root, source_bytes),
        Language::JavaScript => Default::default(),
    };

    let mut compiler = Compiler::new(
        language,
        source_bytes,
        path,
        config,
        mapper,
        ScopeTracker::new(global_declared),
    );

    if parsed.errors.has_errors() {
        compiler.warn(
            WarningKind::ParseDamage,
            format!(
                "{} of {} nodes failed to parse",
                parsed.errors.error_nodes, parsed.errors.total_nodes
            ),
        );
    }
    if source.len() as u64 >= crate::config::LARGE_FILE_THRESHOLD {
        compiler.warn(WarningKind::LargeFile, format!("{} byte source file", source.len()));
    }

    let mut stream = Stream::new();
    compiler.emit(&mut stream, OpCode::TargetedFile, None, 1);
    compiler.emit_child_nodes(&mut stream, root);
    let end_line = root.end_position().row + 1;
    compiler.emit(
        &mut stream,
        OpCode::ReturnConst,
        Some(Arg::Category(Category::NoneValue)),
        end_line,
    );

    debug!(
        file = %path.display(),
        instructions = stream.instructions.len(),
        children = compiler.children.len(),
        "compiled module"
    );

    Ok(CodeObject {
        name: "<module>".to_string(),
        instructions: stream.instructions,
        children: compiler.children,
        location: Some((1, end_line.max(1))),
        depth: 0,
        file_path: path.to_path_buf(),
        language,
        warnings: compiler.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::CategoryMapper;

    fn compile(language: Language, source: &str) -> CodeObject {
        let config = ScanConfig::default();
        let mapper = CategoryMapper::load().unwrap();
        compile_source(Path::new("test.src"), source, language, &config, &mapper).unwrap()
    }

    fn opcodes(object: &CodeObject) -> Vec<OpCode> {
        object.instructions.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn module_starts_with_targeted_file_and_ends_with_return_const() {
        let module = compile(Language::Python, "x = 5\n");
        assert_eq!(module.name, "<module>");
        assert_eq!(module.instructions.first().unwrap().opcode, OpCode::TargetedFile);
        assert_eq!(module.instructions.last().unwrap().opcode, OpCode::ReturnConst);
    }

    #[test]
    fn comment_only_file_compiles_to_the_two_instruction_stream() {
        let module = compile(Language::Python, "# nothing here\n\n# still nothing\n");
        assert_eq!(opcodes(&module), vec![OpCode::TargetedFile, OpCode::ReturnConst]);
    }

    #[test]
    fn empty_file_compiles_to_the_two_instruction_stream() {
        let module = compile(Language::JavaScript, "\n");
        assert_eq!(opcodes(&module), vec![OpCode::TargetedFile, OpCode::ReturnConst]);
    }

    #[test]
    fn simple_assignment_emits_const_then_store() {
        let module = compile(Language::Python, "x = 5\n");
        assert_eq!(
            opcodes(&module),
            vec![
                OpCode::TargetedFile,
                OpCode::LoadConst,
                OpCode::StoreName,
                OpCode::ReturnConst,
            ]
        );
        assert_eq!(module.instructions[1].arg, Some(Arg::Int(5)));
        assert_eq!(module.instructions[2].arg, Some(Arg::Symbol("x".into())));
    }

    #[test]
    fn compilation_is_deterministic_across_runs() {
        let source = "import os\n\ndef f(a):\n    return os.path.join(a, 'x')\n";
        let first = compile(Language::Python, source);
        let second = compile(Language::Python, source);
        assert_eq!(first.instruction_hash(), second.instruction_hash());
    }

    #[test]
    fn whitespace_and_comments_do_not_change_the_hash() {
        let plain = compile(Language::Python, "def f(x):\n    return x + 1\n");
        let commented =
            compile(Language::Python, "# helper\ndef f(x):\n    # add one\n    return x + 1\n");
        assert_eq!(plain.instruction_hash(), commented.instruction_hash());
    }

    #[test]
    fn top_level_function_becomes_a_child_object() {
        let module = compile(Language::Python, "def f():\n    return 1\n");
        assert_eq!(module.children.len(), 1);
        assert_eq!(module.children[0].name, "f");
        assert_eq!(module.children[0].depth, 1);
        assert!(module
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::MakeFunction && i.arg == Some(Arg::ObjectRef(0))));
        assert!(module.instructions.iter().any(|i| i.opcode == OpCode::StoreName));
    }

    #[test]
    fn nested_functions_are_inlined_not_materialized() {
        let source = "def outer():\n    def inner():\n        return 2\n    return inner\n";
        let module = compile(Language::Python, source);
        assert_eq!(module.children.len(), 1);
        let outer = &module.children[0];
        assert!(outer.children.is_empty());
        assert!(outer.instructions.iter().any(|i| i.opcode == OpCode::MakeFunction
            && i.arg == Some(Arg::Symbol("inner".into()))));
    }

    #[test]
    fn class_bodies_inline_their_methods() {
        let source = "class C:\n    def m(self):\n        return 1\n    def n(self):\n        return 2\n";
        let module = compile(Language::Python, source);
        assert_eq!(module.children.len(), 1);
        let class_object = &module.children[0];
        assert_eq!(class_object.name, "C");
        // Both method bodies are inlined in body order; no grandchildren.
        assert!(class_object.children.is_empty());
        let make_functions = class_object
            .instructions
            .iter()
            .filter(|i| i.opcode == OpCode::MakeFunction)
            .count();
        assert_eq!(make_functions, 2);
    }

    #[test]
    fn jumps_are_always_well_formed() {
        let sources = [
            "for i in range(3):\n    if i:\n        continue\n    break\n",
            "while x:\n    x = x - 1\nelse:\n    pass\n",
            "try:\n    risky()\nexcept ValueError:\n    pass\nfinally:\n    done()\n",
            "y = [i * 2 for i in data if i]\n",
        ];
        for source in sources {
            let module = compile(Language::Python, source);
            assert!(module.is_well_formed(), "bad jumps for: {source}");
        }
    }

    #[test]
    fn deep_nesting_truncates_with_a_warning_instead_of_failing() {
        let mut source = String::new();
        for _ in 0..600 {
            source.push('(');
        }
        source.push('1');
        for _ in 0..600 {
            source.push(')');
        }
        let config = ScanConfig { max_recursion_depth: 50, ..ScanConfig::default() };
        let mapper = CategoryMapper::load().unwrap();
        let module = compile_source(
            Path::new("deep.py"),
            &format!("x = {source}\n"),
            Language::Python,
            &config,
            &mapper,
        )
        .unwrap();
        assert!(module.warnings.iter().any(|w| w.kind == WarningKind::Truncation));
        assert!(module
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::Nop
                && i.arg == Some(Arg::Category(Category::Truncated))));
    }

    #[test]
    fn number_parsing() {
        assert_eq!(parse_number_arg("5"), Arg::Int(5));
        assert_eq!(parse_number_arg("3.14"), Arg::Float(3.14));
        assert_eq!(parse_number_arg("1e10"), Arg::Float(1e10));
        assert_eq!(parse_number_arg("0xff"), Arg::Int(255));
        assert_eq!(parse_number_arg("1_000_000"), Arg::Int(1_000_000));
        assert_eq!(
            parse_number_arg("99999999999999999999999"),
            Arg::Category(Category::IntegerLarge)
        );
        assert_eq!(parse_number_arg("123n"), Arg::Int(123));
        assert_eq!(parse_number_arg("2j"), Arg::Float(2.0));
    }
}
