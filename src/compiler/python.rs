//! Lowering for the Python grammar.
//!
//! One total match over the node-kind vocabulary; kinds without dedicated
//! handling fall through to the canonical child linearization.

use crate::classify::Category;
use crate::compiler::opcode::{Arg, OpCode};
use crate::compiler::scope::FunctionScope;
use crate::compiler::{CallArg, Compiler, Stream};
use crate::parser::{self, line_span, named_children};
use rustc_hash::FxHashSet;
use tree_sitter::Node;

pub(crate) fn emit_node(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    match node.kind() {
        "comment" | "pass_statement" | "global_statement" | "nonlocal_statement"
        | "line_continuation" => {}

        "module" | "block" => c.emit_child_nodes(stream, node),

        "expression_statement" => {
            for child in named_children(node) {
                match child.kind() {
                    "assignment" | "augmented_assignment" => c.emit_node(stream, child),
                    "comment" => {}
                    _ => {
                        c.emit_node(stream, child);
                        c.emit(stream, OpCode::PopTop, None, c.line(child));
                    }
                }
            }
        }

        "assignment" => emit_assignment(c, stream, node),
        "augmented_assignment" => emit_augmented_assignment(c, stream, node),
        "named_expression" => {
            if let (Some(name), Some(value)) =
                (node.child_by_field_name("name"), node.child_by_field_name("value"))
            {
                c.emit_node(stream, value);
                let target = c.text(name).to_string();
                c.emit_store_name(stream, &target, line);
            }
        }

        "identifier" => {
            let name = c.text(node).to_string();
            c.emit_load_name(stream, &name, line);
        }
        "attribute" => {
            if let (Some(object), Some(attribute)) =
                (node.child_by_field_name("object"), node.child_by_field_name("attribute"))
            {
                c.emit_node(stream, object);
                let attr = c.text(attribute).to_string();
                c.emit(stream, OpCode::LoadAttr, Some(Arg::Symbol(attr)), line);
            }
        }
        "subscript" => {
            if let (Some(value), Some(index)) =
                (node.child_by_field_name("value"), node.child_by_field_name("subscript"))
            {
                c.emit_node(stream, value);
                c.emit_node(stream, index);
                c.emit(stream, OpCode::BinarySubscr, None, line);
            }
        }
        "slice" => emit_slice(c, stream, node),

        "call" => emit_call(c, stream, node),

        "string" | "concatenated_string" => emit_string(c, stream, node),
        "integer" | "float" => {
            let text = c.text(node).to_string();
            c.emit_number_literal(stream, &text, line);
        }
        "true" => c.emit(stream, OpCode::LoadConst, Some(Arg::Bool(true)), line),
        "false" => c.emit(stream, OpCode::LoadConst, Some(Arg::Bool(false)), line),
        "none" => {
            c.emit(stream, OpCode::LoadConst, Some(Arg::Category(Category::NoneValue)), line)
        }
        "ellipsis" => c.emit(stream, OpCode::LoadConst, Some(Arg::Str("...".into())), line),

        "binary_operator" => emit_binary(c, stream, node),
        "boolean_operator" => emit_boolean(c, stream, node),
        "comparison_operator" => emit_comparison(c, stream, node),
        "not_operator" => {
            if let Some(argument) = node.child_by_field_name("argument") {
                c.emit_node(stream, argument);
                c.emit(stream, OpCode::UnaryNot, None, line);
            }
        }
        "unary_operator" => emit_unary(c, stream, node),
        "conditional_expression" => emit_conditional(c, stream, node),
        "parenthesized_expression" | "interpolation" => {
            c.emit_child_nodes(stream, node);
        }

        "list" | "tuple" | "set" | "pattern_list" => {
            let elements = named_children(node);
            let count = elements.len() as i64;
            for element in elements {
                c.emit_node(stream, element);
            }
            let build = match node.kind() {
                "list" => OpCode::BuildList,
                "set" => OpCode::BuildSet,
                _ => OpCode::BuildTuple,
            };
            c.emit(stream, build, Some(Arg::Int(count)), line);
        }
        "dictionary" => {
            let mut count = 0i64;
            for child in named_children(node) {
                if child.kind() == "pair" {
                    if let (Some(key), Some(value)) =
                        (child.child_by_field_name("key"), child.child_by_field_name("value"))
                    {
                        c.emit_node(stream, key);
                        c.emit_node(stream, value);
                        count += 1;
                    }
                } else if child.kind() == "dictionary_splat" {
                    c.emit_child_nodes(stream, child);
                }
            }
            c.emit(stream, OpCode::BuildMap, Some(Arg::Int(count)), line);
        }

        "function_definition" => emit_function_definition(c, stream, node),
        "decorated_definition" => {
            for child in named_children(node) {
                if child.kind() == "decorator" {
                    c.emit_child_nodes(stream, child);
                    c.emit(stream, OpCode::PopTop, None, c.line(child));
                } else {
                    c.emit_node(stream, child);
                }
            }
        }
        "class_definition" => emit_class_definition(c, stream, node),
        "lambda" => emit_lambda(c, stream, node),

        "list_comprehension" => emit_comprehension(c, stream, node, Comprehension::List),
        "set_comprehension" => emit_comprehension(c, stream, node, Comprehension::Set),
        "dictionary_comprehension" => emit_comprehension(c, stream, node, Comprehension::Dict),
        "generator_expression" => emit_comprehension(c, stream, node, Comprehension::Generator),

        "return_statement" => {
            if let Some(value) = named_children(node).first() {
                c.emit_node(stream, *value);
                c.emit(stream, OpCode::ReturnValue, None, line);
            } else {
                c.emit(
                    stream,
                    OpCode::ReturnConst,
                    Some(Arg::Category(Category::NoneValue)),
                    line,
                );
            }
        }
        "yield" => {
            let values = named_children(node);
            if values.is_empty() {
                c.emit(
                    stream,
                    OpCode::LoadConst,
                    Some(Arg::Category(Category::NoneValue)),
                    line,
                );
            } else {
                for value in values {
                    c.emit_node(stream, value);
                }
            }
            c.emit(stream, OpCode::YieldValue, None, line);
        }
        "await" => {
            c.emit_child_nodes(stream, node);
            c.emit(stream, OpCode::Await, None, line);
        }

        "if_statement" => emit_if(c, stream, node),
        "for_statement" => emit_for(c, stream, node),
        "while_statement" => emit_while(c, stream, node),
        "try_statement" => emit_try(c, stream, node),
        "with_statement" => emit_with(c, stream, node),
        "break_statement" => {
            let jump = c.emit_jump(stream, OpCode::JumpForward, line);
            if let Some(frame) = stream.loops.last_mut() {
                frame.breaks.push(jump);
            } else {
                c.patch_to_here(stream, jump);
            }
        }
        "continue_statement" => {
            let target = stream.loops.last().map(|f| f.start);
            let jump = c.emit_jump(stream, OpCode::JumpBackward, line);
            match target {
                Some(start) => c.patch_jump(stream, jump, start),
                None => c.patch_to_here(stream, jump),
            }
        }
        "raise_statement" => {
            c.emit_child_nodes(stream, node);
            c.emit(stream, OpCode::Raise, None, line);
        }
        "assert_statement" => emit_assert(c, stream, node),
        "delete_statement" => emit_delete(c, stream, node),

        "import_statement" => emit_import(c, stream, node),
        "import_from_statement" => emit_import_from(c, stream, node),

        _ => c.emit_child_nodes(stream, node),
    }
}

fn emit_assignment(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let Some(left) = node.child_by_field_name("left") else {
        return;
    };
    // Annotation-only statements (`x: int`) bind nothing.
    let Some(right) = node.child_by_field_name("right") else {
        return;
    };
    c.emit_node(stream, right);
    emit_store_target(c, stream, left);
}

fn emit_augmented_assignment(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(left), Some(right)) =
        (node.child_by_field_name("left"), node.child_by_field_name("right"))
    else {
        return;
    };
    c.emit_node(stream, left);
    c.emit_node(stream, right);
    let operator = node
        .child_by_field_name("operator")
        .map(|op| c.text(op).to_string())
        .unwrap_or_default();
    let opcode = binary_opcode(operator.trim_end_matches('='));
    c.emit(stream, opcode, None, line);
    emit_store_target(c, stream, left);
}

/// Store into an assignment target: plain names, tuple unpacking,
/// attributes, and subscripts.
pub(crate) fn emit_store_target(c: &mut Compiler, stream: &mut Stream, target: Node) {
    let line = c.line(target);
    match target.kind() {
        "identifier" => {
            let name = c.text(target).to_string();
            c.emit_store_name(stream, &name, line);
        }
        "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list" => {
            for element in named_children(target) {
                emit_store_target(c, stream, element);
            }
        }
        "attribute" => {
            if let (Some(object), Some(attribute)) = (
                target.child_by_field_name("object"),
                target.child_by_field_name("attribute"),
            ) {
                c.emit_node(stream, object);
                let attr = c.text(attribute).to_string();
                c.emit(stream, OpCode::StoreAttr, Some(Arg::Symbol(attr)), line);
            }
        }
        "subscript" => {
            if let (Some(value), Some(index)) = (
                target.child_by_field_name("value"),
                target.child_by_field_name("subscript"),
            ) {
                c.emit_node(stream, value);
                c.emit_node(stream, index);
                c.emit(stream, OpCode::StoreSubscr, None, line);
            }
        }
        "list_splat_pattern" => {
            for element in named_children(target) {
                emit_store_target(c, stream, element);
            }
        }
        _ => c.emit_child_nodes(stream, target),
    }
}

fn emit_slice(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let bounds = named_children(node);
    for bound in &bounds {
        c.emit_node(stream, *bound);
    }
    c.emit(stream, OpCode::BuildSlice, Some(Arg::Int(bounds.len() as i64)), line);
}

fn emit_call(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(function), Some(arguments)) =
        (node.child_by_field_name("function"), node.child_by_field_name("arguments"))
    else {
        c.emit_child_nodes(stream, node);
        return;
    };

    emit_callee(c, stream, function);

    // `arguments` may be a generator expression without parentheses of its
    // own (e.g. `any(x for x in xs)`); treat it as a single positional.
    let mut call_args = Vec::new();
    if arguments.kind() == "argument_list" {
        for argument in named_children(arguments) {
            match argument.kind() {
                "keyword_argument" => {
                    if let (Some(name), Some(value)) = (
                        argument.child_by_field_name("name"),
                        argument.child_by_field_name("value"),
                    ) {
                        call_args.push(CallArg::Keyword(c.text(name).to_string(), value));
                    }
                }
                "comment" => {}
                _ => call_args.push(CallArg::Positional(argument)),
            }
        }
    } else {
        call_args.push(CallArg::Positional(arguments));
    }
    c.emit_call_args(stream, call_args, line);
}

/// Method references on the receiver itself load as LOAD_METHOD; every
/// other attribute access stays LOAD_ATTR.
fn emit_callee(c: &mut Compiler, stream: &mut Stream, function: Node) {
    if function.kind() == "attribute" {
        if let (Some(object), Some(attribute)) = (
            function.child_by_field_name("object"),
            function.child_by_field_name("attribute"),
        ) {
            if object.kind() == "identifier" && c.text(object) == "self" {
                let line = c.line(function);
                c.emit_node(stream, object);
                let attr = c.text(attribute).to_string();
                c.emit(stream, OpCode::LoadMethod, Some(Arg::Symbol(attr)), line);
                return;
            }
        }
    }
    c.emit_node(stream, function);
}

fn emit_string(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let pieces = string_pieces(node);
    let has_interpolation = pieces.iter().any(|p| p.kind() == "interpolation");

    if !has_interpolation {
        let combined: String =
            pieces.iter().map(|p| c.text(*p)).collect::<Vec<_>>().concat();
        c.emit_string_literal(stream, &combined, line);
        return;
    }

    // f-strings build from their pieces in source order.
    let mut emitted = 0i64;
    for piece in pieces {
        match piece.kind() {
            "string_content" | "escape_sequence" => {
                let text = c.text(piece).to_string();
                c.emit_string_literal(stream, &text, c.line(piece));
                emitted += 1;
            }
            "interpolation" => {
                c.emit_child_nodes(stream, piece);
                emitted += 1;
            }
            _ => {}
        }
    }
    c.emit(stream, OpCode::BuildString, Some(Arg::Int(emitted)), line);
}

/// Content pieces of a (possibly concatenated) string literal, flattened
/// in source order. Quote delimiters are not content and are dropped.
fn string_pieces<'tree>(node: Node<'tree>) -> Vec<Node<'tree>> {
    let mut pieces = Vec::new();
    for child in named_children(node) {
        match child.kind() {
            "string" => pieces.extend(string_pieces(child)),
            "string_content" | "escape_sequence" | "interpolation" => pieces.push(child),
            _ => {}
        }
    }
    pieces
}

fn emit_binary(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(left), Some(right)) =
        (node.child_by_field_name("left"), node.child_by_field_name("right"))
    else {
        c.emit_child_nodes(stream, node);
        return;
    };
    c.emit_node(stream, left);
    c.emit_node(stream, right);
    let operator = node
        .child_by_field_name("operator")
        .map(|op| c.text(op).to_string())
        .unwrap_or_default();
    c.emit(stream, binary_opcode(&operator), None, line);
}

pub(crate) fn binary_opcode(operator: &str) -> OpCode {
    match operator {
        "+" => OpCode::BinaryAdd,
        "-" => OpCode::BinarySub,
        "*" | "@" => OpCode::BinaryMul,
        "/" | "//" => OpCode::BinaryDiv,
        "%" => OpCode::BinaryMod,
        "**" => OpCode::BinaryPow,
        "&" => OpCode::BinaryAnd,
        "|" => OpCode::BinaryOr,
        "^" => OpCode::BinaryXor,
        "<<" => OpCode::BinaryLshift,
        ">>" | ">>>" => OpCode::BinaryRshift,
        _ => OpCode::Nop,
    }
}

/// Short-circuit boolean operators linearize into conditional jumps.
fn emit_boolean(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(left), Some(right)) =
        (node.child_by_field_name("left"), node.child_by_field_name("right"))
    else {
        c.emit_child_nodes(stream, node);
        return;
    };
    let operator = node
        .child_by_field_name("operator")
        .map(|op| c.text(op).to_string())
        .unwrap_or_default();
    c.emit_node(stream, left);
    let skip = match operator.as_str() {
        "or" => c.emit_jump(stream, OpCode::PopJumpIfTrue, line),
        _ => c.emit_jump(stream, OpCode::PopJumpIfFalse, line),
    };
    c.emit_node(stream, right);
    c.patch_to_here(stream, skip);
}

fn emit_comparison(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let operands = named_children(node);
    let operators = comparison_operators(c, node);
    if operands.is_empty() {
        return;
    }
    c.emit_node(stream, operands[0]);
    for (index, operand) in operands.iter().enumerate().skip(1) {
        c.emit_node(stream, *operand);
        let operator = operators
            .get(index - 1)
            .cloned()
            .unwrap_or_else(|| "==".to_string());
        c.emit(stream, OpCode::CompareOp, Some(Arg::Symbol(operator)), line);
    }
}

/// Collect comparison operator tokens, folding the two-word forms.
fn comparison_operators(c: &Compiler, node: Node) -> Vec<String> {
    let mut operators = Vec::new();
    for child in parser::all_children(node) {
        if child.is_named() {
            continue;
        }
        let token = c.text(child);
        match token {
            "not" => {
                if operators.last().map(String::as_str) == Some("is") {
                    *operators.last_mut().unwrap() = "is not".to_string();
                } else {
                    operators.push("not".to_string());
                }
            }
            "in" => {
                if operators.last().map(String::as_str) == Some("not") {
                    *operators.last_mut().unwrap() = "not in".to_string();
                } else {
                    operators.push("in".to_string());
                }
            }
            "<" | ">" | "==" | "!=" | "<=" | ">=" | "is" | "<>" => {
                operators.push(token.to_string())
            }
            _ => {}
        }
    }
    operators
}

fn emit_unary(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(argument) = node.child_by_field_name("argument") else {
        c.emit_child_nodes(stream, node);
        return;
    };
    c.emit_node(stream, argument);
    let operator = node
        .child_by_field_name("operator")
        .map(|op| c.text(op).to_string())
        .unwrap_or_default();
    match operator.as_str() {
        "-" => c.emit(stream, OpCode::UnaryNeg, None, line),
        "~" => c.emit(stream, OpCode::UnaryInv, None, line),
        // Unary plus adds nothing to the stream.
        _ => {}
    }
}

fn emit_conditional(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let children = named_children(node);
    if children.len() != 3 {
        c.emit_child_nodes(stream, node);
        return;
    }
    let line = c.line(node);
    let (body, condition, orelse) = (children[0], children[1], children[2]);
    c.emit_node(stream, condition);
    let to_else = c.emit_jump(stream, OpCode::PopJumpIfFalse, line);
    c.emit_node(stream, body);
    let to_end = c.emit_jump(stream, OpCode::JumpForward, line);
    c.patch_to_here(stream, to_else);
    c.emit_node(stream, orelse);
    c.patch_to_here(stream, to_end);
}

fn emit_if(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(condition), Some(consequence)) =
        (node.child_by_field_name("condition"), node.child_by_field_name("consequence"))
    else {
        return;
    };
    c.emit_node(stream, condition);
    let to_next = c.emit_jump(stream, OpCode::PopJumpIfFalse, line);
    c.emit_node(stream, consequence);

    let alternatives: Vec<Node> = named_children(node)
        .into_iter()
        .filter(|n| matches!(n.kind(), "elif_clause" | "else_clause"))
        .collect();

    if alternatives.is_empty() {
        c.patch_to_here(stream, to_next);
        return;
    }

    let mut exits = vec![c.emit_jump(stream, OpCode::JumpForward, line)];
    c.patch_to_here(stream, to_next);

    for (index, alternative) in alternatives.iter().enumerate() {
        let is_last = index == alternatives.len() - 1;
        match alternative.kind() {
            "elif_clause" => {
                let (Some(elif_condition), Some(elif_body)) = (
                    alternative.child_by_field_name("condition"),
                    alternative.child_by_field_name("consequence"),
                ) else {
                    continue;
                };
                c.emit_node(stream, elif_condition);
                let to_after = c.emit_jump(stream, OpCode::PopJumpIfFalse, c.line(*alternative));
                c.emit_node(stream, elif_body);
                if !is_last {
                    exits.push(c.emit_jump(stream, OpCode::JumpForward, c.line(*alternative)));
                }
                c.patch_to_here(stream, to_after);
            }
            "else_clause" => {
                if let Some(body) = alternative.child_by_field_name("body") {
                    c.emit_node(stream, body);
                }
            }
            _ => {}
        }
    }
    for exit in exits {
        c.patch_to_here(stream, exit);
    }
}

fn emit_for(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(left), Some(right), Some(body)) = (
        node.child_by_field_name("left"),
        node.child_by_field_name("right"),
        node.child_by_field_name("body"),
    ) else {
        return;
    };
    let is_async = parser::all_children(node)
        .iter()
        .any(|child| !child.is_named() && c.text(*child) == "async");

    c.emit_node(stream, right);
    c.emit(stream, OpCode::GetIter, None, line);
    let loop_start = stream.len();
    let iter_opcode = if is_async { OpCode::AsyncFor } else { OpCode::ForIter };
    let for_iter = c.emit_jump(stream, iter_opcode, line);
    emit_store_target(c, stream, left);

    stream.loops.push(crate::compiler::LoopFrame { start: loop_start, breaks: Vec::new() });
    c.emit_node(stream, body);
    let frame = stream.loops.pop().expect("loop frame pushed above");

    let back = c.emit_jump(stream, OpCode::JumpBackward, line);
    c.patch_jump(stream, back, loop_start);
    c.patch_to_here(stream, for_iter);
    for break_jump in frame.breaks {
        c.patch_to_here(stream, break_jump);
    }

    // A for/else body runs after normal exhaustion; linearized after the loop.
    if let Some(alternative) = node.child_by_field_name("alternative") {
        if let Some(else_body) = alternative.child_by_field_name("body") {
            c.emit_node(stream, else_body);
        }
    }
}

fn emit_while(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(condition), Some(body)) =
        (node.child_by_field_name("condition"), node.child_by_field_name("body"))
    else {
        return;
    };
    let loop_start = stream.len();
    c.emit_node(stream, condition);
    let exit = c.emit_jump(stream, OpCode::PopJumpIfFalse, line);

    stream.loops.push(crate::compiler::LoopFrame { start: loop_start, breaks: Vec::new() });
    c.emit_node(stream, body);
    let frame = stream.loops.pop().expect("loop frame pushed above");

    let back = c.emit_jump(stream, OpCode::JumpBackward, line);
    c.patch_jump(stream, back, loop_start);
    c.patch_to_here(stream, exit);
    for break_jump in frame.breaks {
        c.patch_to_here(stream, break_jump);
    }

    if let Some(alternative) = node.child_by_field_name("alternative") {
        if let Some(else_body) = alternative.child_by_field_name("body") {
            c.emit_node(stream, else_body);
        }
    }
}

fn emit_try(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(body) = node.child_by_field_name("body") else {
        return;
    };

    let setup = c.emit_jump(stream, OpCode::SetupFinally, line);
    c.emit_node(stream, body);

    // else-clause content runs when the body completed without raising.
    for child in named_children(node) {
        if child.kind() == "else_clause" {
            if let Some(else_body) = child.child_by_field_name("body") {
                c.emit_node(stream, else_body);
            }
        }
    }

    let mut exits = vec![c.emit_jump(stream, OpCode::JumpForward, line)];
    c.patch_to_here(stream, setup);

    for child in named_children(node) {
        match child.kind() {
            "except_clause" | "except_group_clause" => {
                let clause_line = c.line(child);
                for except_child in named_children(child) {
                    match except_child.kind() {
                        "block" => c.emit_node(stream, except_child),
                        "as_pattern" => {
                            // `except Type as name`: the expression is the
                            // first named child, the binding is the alias.
                            if let Some(value) = named_children(except_child).first() {
                                c.emit_node(stream, *value);
                                c.emit(stream, OpCode::PopTop, None, clause_line);
                            }
                            if let Some(alias) = except_child.child_by_field_name("alias") {
                                let name = c.text(alias).to_string();
                                c.emit_store_name(stream, &name, clause_line);
                            }
                        }
                        "comment" => {}
                        // Exception type expression.
                        _ => {
                            c.emit_node(stream, except_child);
                            c.emit(stream, OpCode::PopTop, None, clause_line);
                        }
                    }
                }
                c.emit(stream, OpCode::PopExcept, None, clause_line);
                exits.push(c.emit_jump(stream, OpCode::JumpForward, clause_line));
            }
            _ => {}
        }
    }

    for exit in exits {
        c.patch_to_here(stream, exit);
    }
    for child in named_children(node) {
        if child.kind() == "finally_clause" {
            for finally_child in named_children(child) {
                if finally_child.kind() == "block" {
                    c.emit_node(stream, finally_child);
                }
            }
        }
    }
}

fn emit_with(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(body) = node.child_by_field_name("body") else {
        return;
    };
    let mut item_count = 0usize;
    for child in named_children(node) {
        if child.kind() == "with_clause" {
            for item in named_children(child) {
                if item.kind() != "with_item" {
                    continue;
                }
                let Some(value) = item.child_by_field_name("value") else {
                    continue;
                };
                item_count += 1;
                let item_line = c.line(item);
                if value.kind() == "as_pattern" {
                    if let Some(context) = named_children(value).first() {
                        c.emit_node(stream, *context);
                    }
                    c.emit(stream, OpCode::BeforeWith, None, item_line);
                    if let Some(alias) = value.child_by_field_name("alias") {
                        emit_store_target(c, stream, first_named_or_self(alias));
                    }
                } else {
                    c.emit_node(stream, value);
                    c.emit(stream, OpCode::BeforeWith, None, item_line);
                    c.emit(stream, OpCode::PopTop, None, item_line);
                }
            }
        }
    }
    c.emit_node(stream, body);
    for _ in 0..item_count.max(1) {
        c.emit(stream, OpCode::WithExit, None, line);
    }
}

fn first_named_or_self(node: Node) -> Node {
    named_children(node).first().copied().unwrap_or(node)
}

fn emit_assert(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let children = named_children(node);
    let Some(condition) = children.first() else {
        return;
    };
    c.emit_node(stream, *condition);
    let skip = c.emit_jump(stream, OpCode::PopJumpIfTrue, line);
    if let Some(message) = children.get(1) {
        c.emit_node(stream, *message);
    }
    c.emit(stream, OpCode::Raise, None, line);
    c.patch_to_here(stream, skip);
}

fn emit_delete(c: &mut Compiler, stream: &mut Stream, node: Node) {
    for target in named_children(node) {
        let line = c.line(target);
        match target.kind() {
            "identifier" => {
                let name = c.text(target).to_string();
                let opcode = c.scopes.delete_op(&name);
                c.emit(stream, opcode, Some(Arg::Symbol(name)), line);
            }
            "subscript" => {
                if let (Some(value), Some(index)) = (
                    target.child_by_field_name("value"),
                    target.child_by_field_name("subscript"),
                ) {
                    c.emit_node(stream, value);
                    c.emit_node(stream, index);
                    c.emit(stream, OpCode::DeleteSubscr, None, line);
                }
            }
            "expression_list" => {
                for inner in named_children(target) {
                    emit_delete_single(c, stream, inner);
                }
            }
            _ => emit_delete_single(c, stream, target),
        }
    }
}

fn emit_delete_single(c: &mut Compiler, stream: &mut Stream, target: Node) {
    let line = c.line(target);
    match target.kind() {
        "identifier" => {
            let name = c.text(target).to_string();
            let opcode = c.scopes.delete_op(&name);
            c.emit(stream, opcode, Some(Arg::Symbol(name)), line);
        }
        "subscript" => {
            if let (Some(value), Some(index)) = (
                target.child_by_field_name("value"),
                target.child_by_field_name("subscript"),
            ) {
                c.emit_node(stream, value);
                c.emit_node(stream, index);
                c.emit(stream, OpCode::DeleteSubscr, None, line);
            }
        }
        _ => {}
    }
}

fn emit_import(c: &mut Compiler, stream: &mut Stream, node: Node) {
    for name_node in named_children(node) {
        let line = c.line(name_node);
        match name_node.kind() {
            "dotted_name" => {
                let module = c.text(name_node).to_string();
                c.emit(stream, OpCode::ImportName, Some(Arg::Symbol(module.clone())), line);
                let binding = module.split('.').next().unwrap_or(&module).to_string();
                c.emit_store_name(stream, &binding, line);
            }
            "aliased_import" => {
                if let (Some(name), Some(alias)) = (
                    name_node.child_by_field_name("name"),
                    name_node.child_by_field_name("alias"),
                ) {
                    let module = c.text(name).to_string();
                    c.emit(stream, OpCode::ImportName, Some(Arg::Symbol(module)), line);
                    let binding = c.text(alias).to_string();
                    c.emit_store_name(stream, &binding, line);
                }
            }
            _ => {}
        }
    }
}

fn emit_import_from(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(module_node) = node.child_by_field_name("module_name") else {
        return;
    };
    let module = c.text(module_node).to_string();
    c.emit(stream, OpCode::ImportName, Some(Arg::Symbol(module)), line);

    let mut imported_any = false;
    for child in named_children(node) {
        if child.id() == module_node.id() {
            continue;
        }
        match child.kind() {
            "wildcard_import" => {
                c.emit(stream, OpCode::ImportStar, None, c.line(child));
                return;
            }
            "dotted_name" | "identifier" => {
                let name = c.text(child).to_string();
                c.emit(stream, OpCode::ImportFrom, Some(Arg::Symbol(name.clone())), c.line(child));
                c.emit_store_name(stream, &name, c.line(child));
                imported_any = true;
            }
            "aliased_import" => {
                if let (Some(name), Some(alias)) =
                    (child.child_by_field_name("name"), child.child_by_field_name("alias"))
                {
                    let imported = c.text(name).to_string();
                    c.emit(
                        stream,
                        OpCode::ImportFrom,
                        Some(Arg::Symbol(imported)),
                        c.line(child),
                    );
                    let binding = c.text(alias).to_string();
                    c.emit_store_name(stream, &binding, c.line(child));
                    imported_any = true;
                }
            }
            _ => {}
        }
    }
    if imported_any {
        c.emit(stream, OpCode::PopTop, None, line);
    }
}

fn emit_function_definition(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(name_node), Some(body)) =
        (node.child_by_field_name("name"), node.child_by_field_name("body"))
    else {
        return;
    };
    let name = c.text(name_node).to_string();

    let scope = FunctionScope {
        params: extract_parameters(c, node),
        locals: collect_assigned_names(c, body),
        nonlocals: collect_nonlocals(c, body),
    };
    let body_instructions = c.compile_body_stream(body, scope, line);

    if c.nesting == 0 {
        let index = c.make_child_object(&name, body_instructions, line_span(node));
        c.emit(stream, OpCode::MakeFunction, Some(Arg::ObjectRef(index)), line);
        c.emit_store_name(stream, &name, line);
    } else {
        // Nested definitions inline their body into the enclosing stream.
        c.emit(stream, OpCode::MakeFunction, Some(Arg::Symbol(name.clone())), line);
        inline_stream(stream, body_instructions);
        c.emit_store_name(stream, &name, line);
    }
}

fn emit_class_definition(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(name_node), Some(body)) =
        (node.child_by_field_name("name"), node.child_by_field_name("body"))
    else {
        return;
    };
    let name = c.text(name_node).to_string();

    // Base classes load in the enclosing stream before the class is made.
    if let Some(superclasses) = node.child_by_field_name("superclasses") {
        for superclass in named_children(superclasses) {
            if superclass.kind() != "keyword_argument" {
                c.emit_node(stream, superclass);
            }
        }
    }

    c.nesting += 1;
    let mut class_stream = Stream::new();
    c.emit(&mut class_stream, OpCode::Resume, Some(Arg::Int(0)), line);
    c.emit_node(&mut class_stream, body);
    let end_line = node.end_position().row + 1;
    c.emit(
        &mut class_stream,
        OpCode::ReturnConst,
        Some(Arg::Category(Category::NoneValue)),
        end_line,
    );
    c.nesting -= 1;

    if c.nesting == 0 {
        let index = c.make_child_object(&name, class_stream.instructions, line_span(node));
        c.emit(stream, OpCode::MakeClass, Some(Arg::ObjectRef(index)), line);
        c.emit_store_name(stream, &name, line);
    } else {
        c.emit(stream, OpCode::MakeClass, Some(Arg::Symbol(name.clone())), line);
        inline_stream(stream, class_stream.instructions);
        c.emit_store_name(stream, &name, line);
    }
}

fn emit_lambda(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(body) = node.child_by_field_name("body") else {
        return;
    };
    let scope = FunctionScope {
        params: extract_parameters(c, node),
        locals: FxHashSet::default(),
        nonlocals: FxHashSet::default(),
    };
    let body_instructions = c.compile_body_stream(body, scope, line);

    if c.nesting == 0 {
        let index = c.make_child_object("<lambda>", body_instructions, line_span(node));
        c.emit(stream, OpCode::MakeFunction, Some(Arg::ObjectRef(index)), line);
    } else {
        c.emit(stream, OpCode::MakeFunction, Some(Arg::Symbol("<lambda>".into())), line);
        inline_stream(stream, body_instructions);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Comprehension {
    List,
    Set,
    Dict,
    Generator,
}

impl Comprehension {
    fn object_name(self) -> &'static str {
        match self {
            Self::List => "<listcomp>",
            Self::Set => "<setcomp>",
            Self::Dict => "<dictcomp>",
            Self::Generator => "<genexpr>",
        }
    }
}

fn emit_comprehension(c: &mut Compiler, stream: &mut Stream, node: Node, kind: Comprehension) {
    let line = c.line(node);

    let mut for_clauses = Vec::new();
    let mut if_clauses = Vec::new();
    let mut element = None;
    for child in named_children(node) {
        match child.kind() {
            "for_in_clause" => for_clauses.push(child),
            "if_clause" => if_clauses.push(child),
            "comment" => {}
            _ => element = Some(child),
        }
    }
    let Some(element) = element else {
        return;
    };
    if for_clauses.is_empty() {
        c.emit_node(stream, element);
        return;
    }

    // Loop variables resolve fast inside the synthetic body.
    for clause in &for_clauses {
        if let Some(left) = clause.child_by_field_name("left") {
            register_comprehension_vars(c, left);
        }
    }

    // Anything defined inside the synthetic body inlines there.
    c.nesting += 1;
    let mut body = Stream::new();
    c.emit(&mut body, OpCode::Resume, Some(Arg::Int(0)), line);
    match kind {
        Comprehension::List => c.emit(&mut body, OpCode::BuildList, Some(Arg::Int(0)), line),
        Comprehension::Set => c.emit(&mut body, OpCode::BuildSet, Some(Arg::Int(0)), line),
        Comprehension::Dict => c.emit(&mut body, OpCode::BuildMap, Some(Arg::Int(0)), line),
        Comprehension::Generator => {}
    }
    emit_comprehension_loops(c, &mut body, &for_clauses, &if_clauses, element, kind);
    match kind {
        Comprehension::Generator => c.emit(
            &mut body,
            OpCode::ReturnConst,
            Some(Arg::Category(Category::NoneValue)),
            line,
        ),
        _ => c.emit(&mut body, OpCode::ReturnValue, None, line),
    }
    c.nesting -= 1;

    c.scopes.clear_comprehension_vars();

    if c.nesting == 0 {
        let index = c.make_child_object(kind.object_name(), body.instructions, line_span(node));
        c.emit(stream, OpCode::MakeFunction, Some(Arg::ObjectRef(index)), line);
        c.emit(stream, OpCode::Call, Some(Arg::Int(0)), line);
    } else {
        c.emit(
            stream,
            OpCode::MakeFunction,
            Some(Arg::Symbol(kind.object_name().to_string())),
            line,
        );
        inline_stream(stream, body.instructions);
        c.emit(stream, OpCode::Call, Some(Arg::Int(0)), line);
    }
}

fn emit_comprehension_loops(
    c: &mut Compiler,
    stream: &mut Stream,
    for_clauses: &[Node],
    if_clauses: &[Node],
    element: Node,
    kind: Comprehension,
) {
    let Some((clause, rest)) = for_clauses.split_first() else {
        return;
    };
    let line = c.line(*clause);
    let (Some(left), Some(right)) =
        (clause.child_by_field_name("left"), clause.child_by_field_name("right"))
    else {
        return;
    };

    c.emit_node(stream, right);
    c.emit(stream, OpCode::GetIter, None, line);
    let loop_start = stream.len();
    let for_iter = c.emit_jump(stream, OpCode::ForIter, line);
    emit_store_target(c, stream, left);

    if rest.is_empty() {
        let mut condition_skips = Vec::new();
        for condition in if_clauses {
            if let Some(test) = named_children(*condition).first() {
                c.emit_node(stream, *test);
                condition_skips.push(c.emit_jump(stream, OpCode::PopJumpIfFalse, line));
            }
        }

        let element_line = c.line(element);
        match kind {
            Comprehension::Dict => {
                if let (Some(key), Some(value)) =
                    (element.child_by_field_name("key"), element.child_by_field_name("value"))
                {
                    c.emit_node(stream, key);
                    c.emit_node(stream, value);
                }
                c.emit(stream, OpCode::MapAdd, None, element_line);
            }
            Comprehension::List => {
                c.emit_node(stream, element);
                c.emit(stream, OpCode::ListAppend, None, element_line);
            }
            Comprehension::Set => {
                c.emit_node(stream, element);
                c.emit(stream, OpCode::SetAdd, None, element_line);
            }
            Comprehension::Generator => {
                c.emit_node(stream, element);
                c.emit(stream, OpCode::YieldValue, None, element_line);
                c.emit(stream, OpCode::PopTop, None, element_line);
            }
        }

        let back = c.emit_jump(stream, OpCode::JumpBackward, line);
        c.patch_jump(stream, back, loop_start);
        // A failed filter skips straight to the next iteration.
        for skip in condition_skips {
            c.patch_jump(stream, skip, back);
        }
    } else {
        emit_comprehension_loops(c, stream, rest, if_clauses, element, kind);
        let back = c.emit_jump(stream, OpCode::JumpBackward, line);
        c.patch_jump(stream, back, loop_start);
    }
    c.patch_to_here(stream, for_iter);
}

fn register_comprehension_vars(c: &mut Compiler, target: Node) {
    match target.kind() {
        "identifier" => {
            let name = c.text(target).to_string();
            c.scopes.add_comprehension_var(&name);
        }
        _ => {
            for child in named_children(target) {
                register_comprehension_vars(c, child);
            }
        }
    }
}

/// Append an already-compiled stream, rebasing its jump targets.
pub(crate) fn inline_stream(
    stream: &mut Stream,
    instructions: Vec<crate::compiler::Instruction>,
) {
    let offset = stream.len();
    for mut instruction in instructions {
        if let Some(target) = instruction.jump {
            instruction.jump = Some(target + offset);
        }
        stream.instructions.push(instruction);
    }
}

/// First pass over the whole file: names declared `global` anywhere.
pub(crate) fn collect_global_declarations(
    root: Node,
    source: &[u8],
) -> FxHashSet<String> {
    let mut declared = FxHashSet::default();
    collect_kind_names(root, source, "global_statement", &mut declared);
    declared
}

fn collect_nonlocals(c: &Compiler, body: Node) -> FxHashSet<String> {
    let mut names = FxHashSet::default();
    collect_kind_names(body, c.source, "nonlocal_statement", &mut names);
    names
}

fn collect_kind_names(node: Node, source: &[u8], kind: &str, out: &mut FxHashSet<String>) {
    if node.kind() == kind {
        for child in named_children(node) {
            if child.kind() == "identifier" {
                out.insert(parser::node_text(child, source).to_string());
            }
        }
    }
    for child in named_children(node) {
        collect_kind_names(child, source, kind, out);
    }
}

/// Pre-scan a function body for assigned names. Nested definition bodies
/// are their own scopes and are not descended into.
fn collect_assigned_names(c: &Compiler, body: Node) -> FxHashSet<String> {
    let mut names = FxHashSet::default();
    collect_assigned_into(c, body, &mut names);
    names
}

fn collect_assigned_into(c: &Compiler, node: Node, out: &mut FxHashSet<String>) {
    match node.kind() {
        // A nested definition binds its name here, but its body is its
        // own scope.
        "function_definition" | "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                out.insert(c.text(name).to_string());
            }
            return;
        }
        "lambda" => return,
        "assignment" | "augmented_assignment" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_target_names(c, left, out);
            }
        }
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                out.insert(c.text(name).to_string());
            }
        }
        "for_statement" | "for_in_clause" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_target_names(c, left, out);
            }
        }
        "as_pattern" => {
            if let Some(alias) = node.child_by_field_name("alias") {
                collect_target_names(c, alias, out);
            }
        }
        "import_statement" | "import_from_statement" => {
            for child in named_children(node) {
                match child.kind() {
                    "dotted_name" => {
                        let module = c.text(child);
                        if let Some(root_name) = module.split('.').next() {
                            out.insert(root_name.to_string());
                        }
                    }
                    "aliased_import" => {
                        if let Some(alias) = child.child_by_field_name("alias") {
                            out.insert(c.text(alias).to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    for child in named_children(node) {
        collect_assigned_into(c, child, out);
    }
}

fn collect_target_names(c: &Compiler, target: Node, out: &mut FxHashSet<String>) {
    match target.kind() {
        "identifier" | "as_pattern_target" => {
            out.insert(c.text(target).to_string());
        }
        "attribute" | "subscript" => {}
        _ => {
            for child in named_children(target) {
                collect_target_names(c, child, out);
            }
        }
    }
}

/// Parameter names from a function or lambda definition.
fn extract_parameters(c: &Compiler, node: Node) -> FxHashSet<String> {
    let mut params = FxHashSet::default();
    let Some(parameters) = node.child_by_field_name("parameters") else {
        return params;
    };
    for parameter in named_children(parameters) {
        match parameter.kind() {
            "identifier" => {
                params.insert(c.text(parameter).to_string());
            }
            "typed_parameter" | "default_parameter" | "typed_default_parameter" => {
                if let Some(name) = parameter.child_by_field_name("name") {
                    params.insert(c.text(name).to_string());
                } else if let Some(first) = named_children(parameter).first() {
                    if first.kind() == "identifier" {
                        params.insert(c.text(*first).to_string());
                    }
                }
            }
            "list_splat_pattern" | "dictionary_splat_pattern" => {
                if let Some(first) = named_children(parameter).first() {
                    if first.kind() == "identifier" {
                        params.insert(c.text(*first).to_string());
                    }
                }
            }
            _ => {}
        }
    }
    params
}
