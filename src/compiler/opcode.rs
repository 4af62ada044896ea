//! The closed instruction set and its canonical serialization.
//!
//! Instructions are value types; ordering within a code object is
//! significant. The stream hash excludes source line numbers and
//! substitutes child-object references with the child's own hash, making
//! the fingerprint Merkle-like.

use crate::classify::Category;
use sha2::{Digest, Sha256};

/// Stack-machine flavored operation codes, not tied to any real VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // Control
    Resume,
    ReturnValue,
    ReturnConst,
    PopTop,
    Nop,
    // Constants / loads
    LoadConst,
    LoadName,
    LoadGlobal,
    LoadFast,
    LoadParam,
    LoadAttr,
    LoadMethod,
    LoadClosure,
    // Stores / deletes
    StoreName,
    StoreGlobal,
    StoreFast,
    StoreAttr,
    StoreSubscr,
    DeleteName,
    DeleteSubscr,
    // Calls
    Call,
    KwNames,
    MakeFunction,
    MakeClass,
    // Binary / unary
    BinaryAdd,
    BinarySub,
    BinaryMul,
    BinaryDiv,
    BinaryMod,
    BinaryPow,
    BinaryAnd,
    BinaryOr,
    BinaryXor,
    BinaryLshift,
    BinaryRshift,
    BinarySubscr,
    CompareOp,
    UnaryNeg,
    UnaryNot,
    UnaryInv,
    // Containers
    BuildList,
    BuildTuple,
    BuildSet,
    BuildMap,
    BuildString,
    BuildSlice,
    // Iteration
    GetIter,
    ForIter,
    ListAppend,
    SetAdd,
    MapAdd,
    // Branching
    PopJumpIfTrue,
    PopJumpIfFalse,
    JumpForward,
    JumpBackward,
    // Exceptions / context
    SetupFinally,
    PopExcept,
    Raise,
    BeforeWith,
    WithExit,
    // Imports
    ImportName,
    ImportFrom,
    ImportStar,
    // Async / generator
    YieldValue,
    Await,
    AsyncFor,
    // Special
    TargetedFile,
}

impl OpCode {
    /// Canonical identifier used for hashing; lowercased for tokens.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resume => "RESUME",
            Self::ReturnValue => "RETURN_VALUE",
            Self::ReturnConst => "RETURN_CONST",
            Self::PopTop => "POP_TOP",
            Self::Nop => "NOP",
            Self::LoadConst => "LOAD_CONST",
            Self::LoadName => "LOAD_NAME",
            Self::LoadGlobal => "LOAD_GLOBAL",
            Self::LoadFast => "LOAD_FAST",
            Self::LoadParam => "LOAD_PARAM",
            Self::LoadAttr => "LOAD_ATTR",
            Self::LoadMethod => "LOAD_METHOD",
            Self::LoadClosure => "LOAD_CLOSURE",
            Self::StoreName => "STORE_NAME",
            Self::StoreGlobal => "STORE_GLOBAL",
            Self::StoreFast => "STORE_FAST",
            Self::StoreAttr => "STORE_ATTR",
            Self::StoreSubscr => "STORE_SUBSCR",
            Self::DeleteName => "DELETE_NAME",
            Self::DeleteSubscr => "DELETE_SUBSCR",
            Self::Call => "CALL",
            Self::KwNames => "KW_NAMES",
            Self::MakeFunction => "MAKE_FUNCTION",
            Self::MakeClass => "MAKE_CLASS",
            Self::BinaryAdd => "BINARY_ADD",
            Self::BinarySub => "BINARY_SUB",
            Self::BinaryMul => "BINARY_MUL",
            Self::BinaryDiv => "BINARY_DIV",
            Self::BinaryMod => "BINARY_MOD",
            Self::BinaryPow => "BINARY_POW",
            Self::BinaryAnd => "BINARY_AND",
            Self::BinaryOr => "BINARY_OR",
            Self::BinaryXor => "BINARY_XOR",
            Self::BinaryLshift => "BINARY_LSHIFT",
            Self::BinaryRshift => "BINARY_RSHIFT",
            Self::BinarySubscr => "BINARY_SUBSCR",
            Self::CompareOp => "COMPARE_OP",
            Self::UnaryNeg => "UNARY_NEG",
            Self::UnaryNot => "UNARY_NOT",
            Self::UnaryInv => "UNARY_INV",
            Self::BuildList => "BUILD_LIST",
            Self::BuildTuple => "BUILD_TUPLE",
            Self::BuildSet => "BUILD_SET",
            Self::BuildMap => "BUILD_MAP",
            Self::BuildString => "BUILD_STRING",
            Self::BuildSlice => "BUILD_SLICE",
            Self::GetIter => "GET_ITER",
            Self::ForIter => "FOR_ITER",
            Self::ListAppend => "LIST_APPEND",
            Self::SetAdd => "SET_ADD",
            Self::MapAdd => "MAP_ADD",
            Self::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Self::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Self::JumpForward => "JUMP_FORWARD",
            Self::JumpBackward => "JUMP_BACKWARD",
            Self::SetupFinally => "SETUP_FINALLY",
            Self::PopExcept => "POP_EXCEPT",
            Self::Raise => "RAISE",
            Self::BeforeWith => "BEFORE_WITH",
            Self::WithExit => "WITH_EXIT",
            Self::ImportName => "IMPORT_NAME",
            Self::ImportFrom => "IMPORT_FROM",
            Self::ImportStar => "IMPORT_STAR",
            Self::YieldValue => "YIELD_VALUE",
            Self::Await => "AWAIT",
            Self::AsyncFor => "ASYNC_FOR",
            Self::TargetedFile => "TARGETED_FILE",
        }
    }
}

/// Typed instruction argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Short string literal, stored verbatim (already lowercased).
    Str(String),
    /// Identifier, attribute, operator, or other symbol from the source.
    Symbol(String),
    Category(Category),
    /// Index into the owning object's child list.
    ObjectRef(usize),
    /// Ordered keyword names for the next CALL.
    KwNames(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub arg: Option<Arg>,
    /// One-based source line.
    pub line: usize,
    /// Resolved jump target: an instruction index within the same stream.
    pub jump: Option<usize>,
}

impl Instruction {
    pub fn new(opcode: OpCode, arg: Option<Arg>, line: usize) -> Self {
        Self { opcode, arg, line, jump: None }
    }
}

/// Typed argument encoding for hashing. Tag bytes keep distinct types with
/// equal display text from colliding (e.g. the string "1" and integer 1).
fn encode_arg(arg: &Option<Arg>, child_hashes: &[String], out: &mut Vec<u8>) {
    match arg {
        None => out.push(b'-'),
        Some(Arg::Int(v)) => {
            out.push(b'i');
            out.extend_from_slice(v.to_string().as_bytes());
        }
        Some(Arg::Float(v)) => {
            out.push(b'f');
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Some(Arg::Bool(v)) => {
            out.push(b'b');
            out.push(if *v { b'1' } else { b'0' });
        }
        Some(Arg::Str(v)) => {
            out.push(b's');
            out.extend_from_slice(v.as_bytes());
        }
        Some(Arg::Symbol(v)) => {
            out.push(b'y');
            out.extend_from_slice(v.as_bytes());
        }
        Some(Arg::Category(c)) => {
            out.push(b'c');
            out.extend_from_slice(c.token().as_bytes());
        }
        Some(Arg::ObjectRef(idx)) => {
            out.push(b'r');
            let resolved = child_hashes.get(*idx).map(String::as_str).unwrap_or("?");
            out.extend_from_slice(resolved.as_bytes());
        }
        Some(Arg::KwNames(names)) => {
            out.push(b'k');
            for name in names {
                out.extend_from_slice(name.as_bytes());
                out.push(0x1f);
            }
        }
    }
}

/// SHA-256 over the canonical serialization of an instruction stream.
/// `child_hashes` are the already-computed hashes of referenced children.
pub fn stream_hash(instructions: &[Instruction], child_hashes: &[String]) -> String {
    let mut hasher = Sha256::new();
    let mut buf = Vec::with_capacity(64);
    for instruction in instructions {
        buf.clear();
        buf.extend_from_slice(instruction.opcode.name().as_bytes());
        buf.push(0);
        encode_arg(&instruction.arg, child_hashes, &mut buf);
        buf.push(0);
        match instruction.jump {
            Some(target) => buf.extend_from_slice(target.to_string().as_bytes()),
            None => buf.push(b'-'),
        }
        buf.push(0);
        hasher.update(&buf);
    }
    format!("{:x}", hasher.finalize())
}
