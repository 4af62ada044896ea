//! Lowering for the JavaScript grammar (.js/.mjs/.cjs).
//!
//! Mirrors the Python lowering where the grammars align; ES module forms
//! and `require()` map onto the same import instructions, preserving the
//! imported name and local alias as operands.

use crate::classify::Category;
use crate::compiler::opcode::{Arg, OpCode};
use crate::compiler::python::{binary_opcode, inline_stream};
use crate::compiler::scope::FunctionScope;
use crate::compiler::{CallArg, Compiler, LoopFrame, Stream};
use crate::parser::{self, line_span, named_children};
use rustc_hash::FxHashSet;
use tree_sitter::Node;

pub(crate) fn emit_node(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    match node.kind() {
        "comment" | "empty_statement" | "hash_bang_line" => {}

        "program" | "statement_block" => c.emit_child_nodes(stream, node),

        "expression_statement" => {
            for child in named_children(node) {
                match child.kind() {
                    "assignment_expression" | "augmented_assignment_expression" => {
                        c.emit_node(stream, child)
                    }
                    "comment" => {}
                    _ => {
                        c.emit_node(stream, child);
                        c.emit(stream, OpCode::PopTop, None, c.line(child));
                    }
                }
            }
        }

        "lexical_declaration" | "variable_declaration" => {
            for declarator in named_children(node) {
                if declarator.kind() == "variable_declarator" {
                    emit_declarator(c, stream, declarator);
                }
            }
        }
        "assignment_expression" => {
            if let (Some(left), Some(right)) =
                (node.child_by_field_name("left"), node.child_by_field_name("right"))
            {
                c.emit_node(stream, right);
                emit_store_target(c, stream, left);
            }
        }
        "augmented_assignment_expression" => {
            if let (Some(left), Some(right)) =
                (node.child_by_field_name("left"), node.child_by_field_name("right"))
            {
                c.emit_node(stream, left);
                c.emit_node(stream, right);
                let operator = node
                    .child_by_field_name("operator")
                    .map(|op| c.text(op).to_string())
                    .unwrap_or_default();
                c.emit(stream, binary_opcode(operator.trim_end_matches('=')), None, line);
                emit_store_target(c, stream, left);
            }
        }
        "update_expression" => {
            if let Some(argument) = node.child_by_field_name("argument") {
                c.emit_node(stream, argument);
                c.emit(stream, OpCode::LoadConst, Some(Arg::Int(1)), line);
                let operator = node
                    .child_by_field_name("operator")
                    .map(|op| c.text(op).to_string())
                    .unwrap_or_default();
                let opcode =
                    if operator == "--" { OpCode::BinarySub } else { OpCode::BinaryAdd };
                c.emit(stream, opcode, None, line);
                emit_store_target(c, stream, argument);
            }
        }

        "identifier" => {
            let name = c.text(node).to_string();
            c.emit_load_name(stream, &name, line);
        }
        "this" | "super" => {
            let name = c.text(node).to_string();
            c.emit(stream, OpCode::LoadName, Some(Arg::Symbol(name)), line);
        }
        "member_expression" => {
            if let (Some(object), Some(property)) =
                (node.child_by_field_name("object"), node.child_by_field_name("property"))
            {
                c.emit_node(stream, object);
                let attr = c.text(property).to_string();
                c.emit(stream, OpCode::LoadAttr, Some(Arg::Symbol(attr)), line);
            }
        }
        "subscript_expression" => {
            if let (Some(object), Some(index)) =
                (node.child_by_field_name("object"), node.child_by_field_name("index"))
            {
                c.emit_node(stream, object);
                c.emit_node(stream, index);
                c.emit(stream, OpCode::BinarySubscr, None, line);
            }
        }

        "call_expression" => emit_call(c, stream, node),
        "new_expression" => emit_new(c, stream, node),

        "string" => {
            let content: String = named_children(node)
                .iter()
                .filter(|n| matches!(n.kind(), "string_fragment" | "escape_sequence"))
                .map(|n| c.text(*n))
                .collect::<Vec<_>>()
                .concat();
            c.emit_string_literal(stream, &content, line);
        }
        "template_string" => emit_template_string(c, stream, node),
        "regex" => {
            let pattern = c.text(node).to_string();
            c.emit_string_literal(stream, &pattern, line);
        }
        "number" => {
            let text = c.text(node).to_string();
            c.emit_number_literal(stream, &text, line);
        }
        "true" => c.emit(stream, OpCode::LoadConst, Some(Arg::Bool(true)), line),
        "false" => c.emit(stream, OpCode::LoadConst, Some(Arg::Bool(false)), line),
        "null" | "undefined" => {
            c.emit(stream, OpCode::LoadConst, Some(Arg::Category(Category::NoneValue)), line)
        }

        "binary_expression" => emit_binary(c, stream, node),
        "unary_expression" => emit_unary(c, stream, node),
        "ternary_expression" => emit_ternary(c, stream, node),
        "await_expression" => {
            c.emit_child_nodes(stream, node);
            c.emit(stream, OpCode::Await, None, line);
        }
        "parenthesized_expression" | "sequence_expression" | "spread_element" => {
            c.emit_child_nodes(stream, node);
        }
        "yield_expression" => {
            if named_children(node).is_empty() {
                c.emit(
                    stream,
                    OpCode::LoadConst,
                    Some(Arg::Category(Category::NoneValue)),
                    line,
                );
            } else {
                c.emit_child_nodes(stream, node);
            }
            c.emit(stream, OpCode::YieldValue, None, line);
        }

        "array" => {
            let elements = named_children(node);
            let count = elements.len() as i64;
            for element in elements {
                c.emit_node(stream, element);
            }
            c.emit(stream, OpCode::BuildList, Some(Arg::Int(count)), line);
        }
        "object" => emit_object(c, stream, node),

        "function_declaration" | "generator_function_declaration" => {
            emit_function_declaration(c, stream, node)
        }
        "function_expression" | "function" | "arrow_function" | "generator_function" => {
            emit_function_value(c, stream, node)
        }
        "class_declaration" => emit_class_declaration(c, stream, node),
        "method_definition" => emit_method_definition(c, stream, node),
        "field_definition" => {
            if let (Some(property), Some(value)) =
                (node.child_by_field_name("property"), node.child_by_field_name("value"))
            {
                c.emit_node(stream, value);
                let name = c.text(property).to_string();
                c.emit_store_name(stream, &name, line);
            }
        }

        "return_statement" => {
            if named_children(node).is_empty() {
                c.emit(
                    stream,
                    OpCode::ReturnConst,
                    Some(Arg::Category(Category::NoneValue)),
                    line,
                );
            } else {
                c.emit_child_nodes(stream, node);
                c.emit(stream, OpCode::ReturnValue, None, line);
            }
        }
        "throw_statement" => {
            c.emit_child_nodes(stream, node);
            c.emit(stream, OpCode::Raise, None, line);
        }

        "if_statement" => emit_if(c, stream, node),
        "for_statement" => emit_for(c, stream, node),
        "for_in_statement" => emit_for_in(c, stream, node),
        "while_statement" => emit_while(c, stream, node),
        "do_statement" => emit_do_while(c, stream, node),
        "try_statement" => emit_try(c, stream, node),
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
        "labeled_statement" => {
            if let Some(body) = node.child_by_field_name("body") {
                c.emit_node(stream, body);
            }
        }

        "import_statement" => emit_import(c, stream, node),
        "export_statement" => emit_export(c, stream, node),

        _ => c.emit_child_nodes(stream, node),
    }
}

fn emit_declarator(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let Some(name) = node.child_by_field_name("name") else {
        return;
    };
    if let Some(value) = node.child_by_field_name("value") {
        c.emit_node(stream, value);
        emit_store_target(c, stream, name);
    } else {
        // `let x;` declares without binding a value.
        let line = c.line(node);
        c.emit(stream, OpCode::LoadConst, Some(Arg::Category(Category::NoneValue)), line);
        emit_store_target(c, stream, name);
    }
}

fn emit_store_target(c: &mut Compiler, stream: &mut Stream, target: Node) {
    let line = c.line(target);
    match target.kind() {
        "identifier" | "shorthand_property_identifier_pattern" => {
            let name = c.text(target).to_string();
            c.emit_store_name(stream, &name, line);
        }
        "member_expression" => {
            if let (Some(object), Some(property)) =
                (target.child_by_field_name("object"), target.child_by_field_name("property"))
            {
                c.emit_node(stream, object);
                let attr = c.text(property).to_string();
                c.emit(stream, OpCode::StoreAttr, Some(Arg::Symbol(attr)), line);
            }
        }
        "subscript_expression" => {
            if let (Some(object), Some(index)) =
                (target.child_by_field_name("object"), target.child_by_field_name("index"))
            {
                c.emit_node(stream, object);
                c.emit_node(stream, index);
                c.emit(stream, OpCode::StoreSubscr, None, line);
            }
        }
        "object_pattern" | "array_pattern" => {
            for element in named_children(target) {
                match element.kind() {
                    "pair_pattern" => {
                        if let Some(value) = element.child_by_field_name("value") {
                            emit_store_target(c, stream, value);
                        }
                    }
                    "rest_pattern" => {
                        for inner in named_children(element) {
                            emit_store_target(c, stream, inner);
                        }
                    }
                    _ => emit_store_target(c, stream, element),
                }
            }
        }
        "assignment_pattern" => {
            if let Some(left) = target.child_by_field_name("left") {
                emit_store_target(c, stream, left);
            }
        }
        _ => {}
    }
}

fn emit_call(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(function), Some(arguments)) =
        (node.child_by_field_name("function"), node.child_by_field_name("arguments"))
    else {
        c.emit_child_nodes(stream, node);
        return;
    };

    // `require("module")` is an import in call clothing.
    if function.kind() == "identifier" && c.text(function) == "require" {
        let args = named_children(arguments);
        if let Some(first) = args.first() {
            if first.kind() == "string" {
                let module: String = named_children(*first)
                    .iter()
                    .filter(|n| matches!(n.kind(), "string_fragment" | "escape_sequence"))
                    .map(|n| c.text(*n))
                    .collect::<Vec<_>>()
                    .concat();
                c.emit(stream, OpCode::ImportName, Some(Arg::Symbol(module)), line);
                return;
            }
        }
    }

    emit_callee(c, stream, function);

    let mut call_args = Vec::new();
    if arguments.kind() == "arguments" {
        for argument in named_children(arguments) {
            if argument.kind() != "comment" {
                call_args.push(CallArg::Positional(argument));
            }
        }
    } else {
        // Tagged template call form.
        call_args.push(CallArg::Positional(arguments));
    }
    c.emit_call_args(stream, call_args, line);
}

/// Method references on the receiver itself load as LOAD_METHOD.
fn emit_callee(c: &mut Compiler, stream: &mut Stream, function: Node) {
    if function.kind() == "member_expression" {
        if let (Some(object), Some(property)) = (
            function.child_by_field_name("object"),
            function.child_by_field_name("property"),
        ) {
            if object.kind() == "this" {
                let line = c.line(function);
                c.emit_node(stream, object);
                let attr = c.text(property).to_string();
                c.emit(stream, OpCode::LoadMethod, Some(Arg::Symbol(attr)), line);
                return;
            }
        }
    }
    c.emit_node(stream, function);
}

fn emit_new(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(constructor) = node.child_by_field_name("constructor") else {
        c.emit_child_nodes(stream, node);
        return;
    };
    c.emit_node(stream, constructor);
    let mut call_args = Vec::new();
    if let Some(arguments) = node.child_by_field_name("arguments") {
        for argument in named_children(arguments) {
            if argument.kind() != "comment" {
                call_args.push(CallArg::Positional(argument));
            }
        }
    }
    c.emit_call_args(stream, call_args, line);
}

fn emit_template_string(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let mut emitted = 0i64;
    for piece in named_children(node) {
        match piece.kind() {
            "string_fragment" | "escape_sequence" => {
                let text = c.text(piece).to_string();
                c.emit_string_literal(stream, &text, c.line(piece));
                emitted += 1;
            }
            "template_substitution" => {
                c.emit_child_nodes(stream, piece);
                emitted += 1;
            }
            _ => {}
        }
    }
    c.emit(stream, OpCode::BuildString, Some(Arg::Int(emitted)), line);
}

fn emit_object(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let mut count = 0i64;
    for member in named_children(node) {
        match member.kind() {
            "pair" => {
                if let (Some(key), Some(value)) =
                    (member.child_by_field_name("key"), member.child_by_field_name("value"))
                {
                    if key.kind() == "property_identifier" {
                        let name = c.text(key).to_string();
                        c.emit_string_literal(stream, &name, c.line(key));
                    } else {
                        c.emit_node(stream, key);
                    }
                    c.emit_node(stream, value);
                    count += 1;
                }
            }
            "shorthand_property_identifier" => {
                let name = c.text(member).to_string();
                c.emit_string_literal(stream, &name, c.line(member));
                c.emit_load_name(stream, &name, c.line(member));
                count += 1;
            }
            "spread_element" | "method_definition" => {
                c.emit_node(stream, member);
            }
            _ => {}
        }
    }
    c.emit(stream, OpCode::BuildMap, Some(Arg::Int(count)), line);
}

const COMPARISON_OPERATORS: &[&str] =
    &["==", "===", "!=", "!==", "<", ">", "<=", ">=", "instanceof", "in"];

fn emit_binary(c: &mut Compiler, stream: &mut Stream, node: Node) {
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

    // Short-circuit forms linearize into conditional jumps.
    match operator.as_str() {
        "&&" => {
            c.emit_node(stream, left);
            let skip = c.emit_jump(stream, OpCode::PopJumpIfFalse, line);
            c.emit_node(stream, right);
            c.patch_to_here(stream, skip);
            return;
        }
        "||" | "??" => {
            c.emit_node(stream, left);
            let skip = c.emit_jump(stream, OpCode::PopJumpIfTrue, line);
            c.emit_node(stream, right);
            c.patch_to_here(stream, skip);
            return;
        }
        _ => {}
    }

    c.emit_node(stream, left);
    c.emit_node(stream, right);
    if COMPARISON_OPERATORS.contains(&operator.as_str()) {
        // Strict forms compare the same way for token purposes.
        let normalized = match operator.as_str() {
            "===" => "==",
            "!==" => "!=",
            other => other,
        };
        c.emit(stream, OpCode::CompareOp, Some(Arg::Symbol(normalized.to_string())), line);
    } else {
        c.emit(stream, binary_opcode(&operator), None, line);
    }
}

fn emit_unary(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(argument) = node.child_by_field_name("argument") else {
        c.emit_child_nodes(stream, node);
        return;
    };
    let operator = node
        .child_by_field_name("operator")
        .map(|op| c.text(op).to_string())
        .unwrap_or_default();
    if operator == "delete" {
        emit_delete(c, stream, argument);
        return;
    }
    c.emit_node(stream, argument);
    match operator.as_str() {
        "!" => c.emit(stream, OpCode::UnaryNot, None, line),
        "-" => c.emit(stream, OpCode::UnaryNeg, None, line),
        "~" => c.emit(stream, OpCode::UnaryInv, None, line),
        // typeof/void/+ contribute only their operand to the stream.
        _ => {}
    }
}

fn emit_delete(c: &mut Compiler, stream: &mut Stream, target: Node) {
    let line = c.line(target);
    match target.kind() {
        "identifier" => {
            let name = c.text(target).to_string();
            c.emit(stream, OpCode::DeleteName, Some(Arg::Symbol(name)), line);
        }
        "member_expression" => {
            if let (Some(object), Some(property)) =
                (target.child_by_field_name("object"), target.child_by_field_name("property"))
            {
                c.emit_node(stream, object);
                let name = c.text(property).to_string();
                c.emit_string_literal(stream, &name, line);
                c.emit(stream, OpCode::DeleteSubscr, None, line);
            }
        }
        "subscript_expression" => {
            if let (Some(object), Some(index)) =
                (target.child_by_field_name("object"), target.child_by_field_name("index"))
            {
                c.emit_node(stream, object);
                c.emit_node(stream, index);
                c.emit(stream, OpCode::DeleteSubscr, None, line);
            }
        }
        _ => c.emit_child_nodes(stream, target),
    }
}

fn emit_ternary(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(condition), Some(consequence), Some(alternative)) = (
        node.child_by_field_name("condition"),
        node.child_by_field_name("consequence"),
        node.child_by_field_name("alternative"),
    ) else {
        c.emit_child_nodes(stream, node);
        return;
    };
    c.emit_node(stream, condition);
    let to_else = c.emit_jump(stream, OpCode::PopJumpIfFalse, line);
    c.emit_node(stream, consequence);
    let to_end = c.emit_jump(stream, OpCode::JumpForward, line);
    c.patch_to_here(stream, to_else);
    c.emit_node(stream, alternative);
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
    let to_else = c.emit_jump(stream, OpCode::PopJumpIfFalse, line);
    c.emit_node(stream, consequence);

    if let Some(alternative) = node.child_by_field_name("alternative") {
        let to_end = c.emit_jump(stream, OpCode::JumpForward, line);
        c.patch_to_here(stream, to_else);
        // else_clause wraps either a block or a chained if_statement.
        c.emit_child_nodes(stream, alternative);
        c.patch_to_here(stream, to_end);
    } else {
        c.patch_to_here(stream, to_else);
    }
}

fn emit_for(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    if let Some(initializer) = node.child_by_field_name("initializer") {
        c.emit_node(stream, initializer);
    }
    let loop_start = stream.len();
    let exit = match node.child_by_field_name("condition") {
        Some(condition) if condition.kind() != "empty_statement" => {
            c.emit_node(stream, condition);
            Some(c.emit_jump(stream, OpCode::PopJumpIfFalse, line))
        }
        _ => None,
    };

    stream.loops.push(LoopFrame { start: loop_start, breaks: Vec::new() });
    if let Some(body) = node.child_by_field_name("body") {
        c.emit_node(stream, body);
    }
    if let Some(increment) = node.child_by_field_name("increment") {
        c.emit_node(stream, increment);
    }
    let frame = stream.loops.pop().expect("loop frame pushed above");

    let back = c.emit_jump(stream, OpCode::JumpBackward, line);
    c.patch_jump(stream, back, loop_start);
    if let Some(exit) = exit {
        c.patch_to_here(stream, exit);
    }
    for break_jump in frame.breaks {
        c.patch_to_here(stream, break_jump);
    }
}

fn emit_for_in(c: &mut Compiler, stream: &mut Stream, node: Node) {
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
        .any(|child| !child.is_named() && c.text(*child) == "await");

    c.emit_node(stream, right);
    c.emit(stream, OpCode::GetIter, None, line);
    let loop_start = stream.len();
    let iter_opcode = if is_async { OpCode::AsyncFor } else { OpCode::ForIter };
    let for_iter = c.emit_jump(stream, iter_opcode, line);
    emit_store_target(c, stream, left);

    stream.loops.push(LoopFrame { start: loop_start, breaks: Vec::new() });
    c.emit_node(stream, body);
    let frame = stream.loops.pop().expect("loop frame pushed above");

    let back = c.emit_jump(stream, OpCode::JumpBackward, line);
    c.patch_jump(stream, back, loop_start);
    c.patch_to_here(stream, for_iter);
    for break_jump in frame.breaks {
        c.patch_to_here(stream, break_jump);
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

    stream.loops.push(LoopFrame { start: loop_start, breaks: Vec::new() });
    c.emit_node(stream, body);
    let frame = stream.loops.pop().expect("loop frame pushed above");

    let back = c.emit_jump(stream, OpCode::JumpBackward, line);
    c.patch_jump(stream, back, loop_start);
    c.patch_to_here(stream, exit);
    for break_jump in frame.breaks {
        c.patch_to_here(stream, break_jump);
    }
}

fn emit_do_while(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(body), Some(condition)) =
        (node.child_by_field_name("body"), node.child_by_field_name("condition"))
    else {
        return;
    };
    let loop_start = stream.len();
    stream.loops.push(LoopFrame { start: loop_start, breaks: Vec::new() });
    c.emit_node(stream, body);
    let frame = stream.loops.pop().expect("loop frame pushed above");
    c.emit_node(stream, condition);
    let back = c.emit_jump(stream, OpCode::PopJumpIfTrue, line);
    c.patch_jump(stream, back, loop_start);
    for break_jump in frame.breaks {
        c.patch_to_here(stream, break_jump);
    }
}

fn emit_try(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(body) = node.child_by_field_name("body") else {
        return;
    };
    let setup = c.emit_jump(stream, OpCode::SetupFinally, line);
    c.emit_node(stream, body);
    let to_end = c.emit_jump(stream, OpCode::JumpForward, line);
    c.patch_to_here(stream, setup);

    let mut exits = vec![to_end];
    if let Some(handler) = node.child_by_field_name("handler") {
        let handler_line = c.line(handler);
        if let Some(parameter) = handler.child_by_field_name("parameter") {
            emit_store_target(c, stream, parameter);
        }
        if let Some(handler_body) = handler.child_by_field_name("body") {
            c.emit_node(stream, handler_body);
        }
        c.emit(stream, OpCode::PopExcept, None, handler_line);
        exits.push(c.emit_jump(stream, OpCode::JumpForward, handler_line));
    }
    for exit in exits {
        c.patch_to_here(stream, exit);
    }
    if let Some(finalizer) = node.child_by_field_name("finalizer") {
        c.emit_child_nodes(stream, finalizer);
    }
}

fn emit_function_declaration(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(name_node), Some(body)) =
        (node.child_by_field_name("name"), node.child_by_field_name("body"))
    else {
        return;
    };
    let name = c.text(name_node).to_string();
    let scope = function_scope(c, node, body);
    let body_instructions = c.compile_body_stream(body, scope, line);

    if c.nesting == 0 {
        let index = c.make_child_object(&name, body_instructions, line_span(node));
        c.emit(stream, OpCode::MakeFunction, Some(Arg::ObjectRef(index)), line);
        c.emit_store_name(stream, &name, line);
    } else {
        c.emit(stream, OpCode::MakeFunction, Some(Arg::Symbol(name.clone())), line);
        inline_stream(stream, body_instructions);
        c.emit_store_name(stream, &name, line);
    }
}

/// Anonymous function values: function expressions and arrow functions.
fn emit_function_value(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(body) = node.child_by_field_name("body") else {
        return;
    };
    let name = node
        .child_by_field_name("name")
        .map(|n| c.text(n).to_string())
        .unwrap_or_else(|| "<lambda>".to_string());
    let scope = function_scope(c, node, body);
    let body_instructions = c.compile_body_stream(body, scope, line);

    if c.nesting == 0 {
        let index = c.make_child_object(&name, body_instructions, line_span(node));
        c.emit(stream, OpCode::MakeFunction, Some(Arg::ObjectRef(index)), line);
    } else {
        c.emit(stream, OpCode::MakeFunction, Some(Arg::Symbol(name)), line);
        inline_stream(stream, body_instructions);
    }
}

fn emit_class_declaration(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(name_node), Some(body)) =
        (node.child_by_field_name("name"), node.child_by_field_name("body"))
    else {
        return;
    };
    let name = c.text(name_node).to_string();

    // Heritage clause loads in the enclosing stream.
    for child in named_children(node) {
        if child.kind() == "class_heritage" {
            c.emit_child_nodes(stream, child);
        }
    }

    c.nesting += 1;
    let mut class_stream = Stream::new();
    c.emit(&mut class_stream, OpCode::Resume, Some(Arg::Int(0)), line);
    c.emit_child_nodes(&mut class_stream, body);
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

/// Method bodies inline into the class stream in body order.
fn emit_method_definition(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let (Some(name_node), Some(body)) =
        (node.child_by_field_name("name"), node.child_by_field_name("body"))
    else {
        return;
    };
    let name = c.text(name_node).to_string();
    let scope = function_scope(c, node, body);
    let body_instructions = c.compile_body_stream(body, scope, line);
    c.emit(stream, OpCode::MakeFunction, Some(Arg::Symbol(name.clone())), line);
    inline_stream(stream, body_instructions);
    c.emit_store_name(stream, &name, line);
}

fn emit_import(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    let Some(source) = node.child_by_field_name("source") else {
        return;
    };
    let module: String = named_children(source)
        .iter()
        .filter(|n| matches!(n.kind(), "string_fragment" | "escape_sequence"))
        .map(|n| c.text(*n))
        .collect::<Vec<_>>()
        .concat();
    c.emit(stream, OpCode::ImportName, Some(Arg::Symbol(module)), line);

    let mut bound_any = false;
    for child in named_children(node) {
        if child.kind() != "import_clause" {
            continue;
        }
        for import in named_children(child) {
            match import.kind() {
                // Default import binds the module's default export.
                "identifier" => {
                    let binding = c.text(import).to_string();
                    c.emit(
                        stream,
                        OpCode::ImportFrom,
                        Some(Arg::Symbol("default".into())),
                        c.line(import),
                    );
                    c.emit_store_name(stream, &binding, c.line(import));
                    bound_any = true;
                }
                "namespace_import" => {
                    c.emit(stream, OpCode::ImportStar, None, c.line(import));
                    if let Some(alias) = named_children(import).first() {
                        let binding = c.text(*alias).to_string();
                        c.emit_store_name(stream, &binding, c.line(import));
                    }
                    bound_any = true;
                }
                "named_imports" => {
                    for specifier in named_children(import) {
                        if specifier.kind() != "import_specifier" {
                            continue;
                        }
                        let Some(name) = specifier.child_by_field_name("name") else {
                            continue;
                        };
                        let imported = c.text(name).to_string();
                        c.emit(
                            stream,
                            OpCode::ImportFrom,
                            Some(Arg::Symbol(imported.clone())),
                            c.line(specifier),
                        );
                        let binding = specifier
                            .child_by_field_name("alias")
                            .map(|a| c.text(a).to_string())
                            .unwrap_or(imported);
                        c.emit_store_name(stream, &binding, c.line(specifier));
                        bound_any = true;
                    }
                }
                _ => {}
            }
        }
    }
    if bound_any {
        c.emit(stream, OpCode::PopTop, None, line);
    }
}

fn emit_export(c: &mut Compiler, stream: &mut Stream, node: Node) {
    let line = c.line(node);
    if let Some(declaration) = node.child_by_field_name("declaration") {
        c.emit_node(stream, declaration);
        return;
    }
    if let Some(value) = node.child_by_field_name("value") {
        // `export default <expr>`
        c.emit_node(stream, value);
        c.emit(stream, OpCode::PopTop, None, line);
        return;
    }
    c.emit_child_nodes(stream, node);
}

fn function_scope(c: &Compiler, node: Node, body: Node) -> FunctionScope {
    FunctionScope {
        params: extract_parameters(c, node),
        locals: collect_declared_names(c, body),
        nonlocals: FxHashSet::default(),
    }
}

fn extract_parameters(c: &Compiler, node: Node) -> FxHashSet<String> {
    let mut params = FxHashSet::default();
    // Arrow functions with a single bare parameter use the `parameter`
    // field; everything else carries `formal_parameters`.
    if let Some(parameter) = node.child_by_field_name("parameter") {
        if parameter.kind() == "identifier" {
            params.insert(c.text(parameter).to_string());
        }
        return params;
    }
    let Some(parameters) = node.child_by_field_name("parameters") else {
        return params;
    };
    for parameter in named_children(parameters) {
        collect_param_names(c, parameter, &mut params);
    }
    params
}

fn collect_param_names(c: &Compiler, node: Node, out: &mut FxHashSet<String>) {
    match node.kind() {
        "identifier" | "shorthand_property_identifier_pattern" => {
            out.insert(c.text(node).to_string());
        }
        "assignment_pattern" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_param_names(c, left, out);
            }
        }
        "rest_pattern" | "object_pattern" | "array_pattern" | "pair_pattern" => {
            for child in named_children(node) {
                collect_param_names(c, child, out);
            }
        }
        _ => {}
    }
}

/// Pre-scan for declared names. Nested function bodies are their own
/// scope; only the declaration's name leaks into this one.
fn collect_declared_names(c: &Compiler, body: Node) -> FxHashSet<String> {
    let mut names = FxHashSet::default();
    collect_declared_into(c, body, &mut names);
    names
}

fn collect_declared_into(c: &Compiler, node: Node, out: &mut FxHashSet<String>) {
    match node.kind() {
        "function_declaration" | "generator_function_declaration" | "class_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                out.insert(c.text(name).to_string());
            }
            return;
        }
        "function_expression" | "arrow_function" | "method_definition" => return,
        "variable_declarator" => {
            if let Some(name) = node.child_by_field_name("name") {
                collect_param_names(c, name, out);
            }
        }
        "for_in_statement" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_param_names(c, left, out);
            }
        }
        "catch_clause" => {
            if let Some(parameter) = node.child_by_field_name("parameter") {
                collect_param_names(c, parameter, out);
            }
        }
        _ => {}
    }
    for child in named_children(node) {
        collect_declared_into(c, child, out);
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::{compile_source, Arg, CodeObject, OpCode};
    use crate::config::ScanConfig;
    use crate::languages::Language;
    use crate::mappings::CategoryMapper;
    use std::path::Path;

    fn compile(source: &str) -> CodeObject {
        let config = ScanConfig::default();
        let mapper = CategoryMapper::load().unwrap();
        compile_source(Path::new("test.js"), source, Language::JavaScript, &config, &mapper)
            .unwrap()
    }

    fn has(module: &CodeObject, opcode: OpCode) -> bool {
        module.instructions.iter().any(|i| i.opcode == opcode)
    }

    #[test]
    fn const_declaration_stores_the_name() {
        let module = compile("const x = 1;\n");
        assert!(has(&module, OpCode::LoadConst));
        assert!(module
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::StoreName && i.arg == Some(Arg::Symbol("x".into()))));
    }

    #[test]
    fn named_imports_preserve_names_and_aliases() {
        let module = compile("import { readFile as rf, join } from \"fs\";\n");
        let import_froms: Vec<_> = module
            .instructions
            .iter()
            .filter(|i| i.opcode == OpCode::ImportFrom)
            .collect();
        assert_eq!(import_froms.len(), 2);
        assert_eq!(import_froms[0].arg, Some(Arg::Symbol("readFile".into())));
        assert!(module
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::StoreName && i.arg == Some(Arg::Symbol("rf".into()))));
    }

    #[test]
    fn namespace_import_uses_import_star() {
        let module = compile("import * as fs from \"fs\";\n");
        assert!(has(&module, OpCode::ImportStar));
        assert!(module
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::StoreName && i.arg == Some(Arg::Symbol("fs".into()))));
    }

    #[test]
    fn side_effect_import_binds_nothing() {
        let module = compile("import \"./setup.js\";\n");
        assert!(has(&module, OpCode::ImportName));
        assert!(!has(&module, OpCode::ImportFrom));
        assert!(!has(&module, OpCode::StoreName));
    }

    #[test]
    fn require_call_maps_to_import_name() {
        let module = compile("const cp = require(\"child_process\");\n");
        assert!(module
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::ImportName
                && i.arg == Some(Arg::Symbol("child_process".into()))));
        assert!(!has(&module, OpCode::Call));
    }

    #[test]
    fn top_level_function_declarations_become_children() {
        let module = compile("function handler(req) { return req; }\n");
        assert_eq!(module.children.len(), 1);
        assert_eq!(module.children[0].name, "handler");
        assert!(has(&module, OpCode::MakeFunction));
    }

    #[test]
    fn arrow_functions_get_a_synthetic_name() {
        let module = compile("const double = (x) => x * 2;\n");
        assert_eq!(module.children.len(), 1);
        assert_eq!(module.children[0].name, "<lambda>");
        let body = &module.children[0];
        assert!(body.instructions.iter().any(|i| i.opcode == OpCode::BinaryMul));
        assert_eq!(body.instructions.last().unwrap().opcode, OpCode::ReturnValue);
    }

    #[test]
    fn class_methods_inline_into_the_class_object() {
        let module = compile(
            "class Loader {\n  fetch(url) { return url; }\n  parse(raw) { return raw; }\n}\n",
        );
        assert_eq!(module.children.len(), 1);
        let class_object = &module.children[0];
        assert_eq!(class_object.name, "Loader");
        assert!(class_object.children.is_empty());
        let makes = class_object
            .instructions
            .iter()
            .filter(|i| i.opcode == OpCode::MakeFunction)
            .count();
        assert_eq!(makes, 2);
    }

    #[test]
    fn control_flow_stays_well_formed() {
        let sources = [
            "for (let i = 0; i < 3; i++) { if (i) continue; break; }\n",
            "for (const k in obj) { use(k); }\n",
            "while (x) { x -= 1; }\n",
            "do { tick(); } while (ready);\n",
            "try { risky(); } catch (e) { log(e); } finally { done(); }\n",
            "const v = a && b || c;\n",
        ];
        for source in sources {
            let module = compile(source);
            assert!(module.is_well_formed(), "bad jumps for: {source}");
        }
    }

    #[test]
    fn strict_equality_normalizes_to_compare_op() {
        let module = compile("const same = a === b;\n");
        assert!(module
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::CompareOp && i.arg == Some(Arg::Symbol("==".into()))));
    }

    #[test]
    fn template_strings_build_from_their_pieces() {
        let module = compile("const msg = `hello ${name} bye`;\n");
        assert!(module
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::BuildString && i.arg == Some(Arg::Int(3))));
    }

    #[test]
    fn async_iteration_lowers_to_async_for() {
        let module = compile(
            "async function pull(stream) {\n  for await (const chunk of stream) { use(chunk); }\n}\n",
        );
        let body = &module.children[0];
        assert!(body.instructions.iter().any(|i| i.opcode == OpCode::AsyncFor));
    }
}
