//! Abstract Syntax Tree (AST) node types for the Buzz language.
//!
//! The AST is the output of the parser/type-checker and the input to the code
//! generator. Every expression node carries a resolved [`TypeId`] and a
//! [`Span`]; by the time a [`Program`] reaches codegen, no node holds a
//! placeholder type.
//!
//! # Design Principles
//!
//! - **Typed**: `Expr` is a `{ kind, ty, span }` triple so the "every node has
//!   a type" invariant is structural, not a convention.
//! - **Resolved**: variable references carry their runtime [`Slot`] (local,
//!   upvalue, or global index), and scope-exit points carry the list of local
//!   slots to discard, so the code generator never re-resolves names.
//! - **No lifetimes**: all strings are owned so the AST can be freely moved
//!   and stored without tying it to the source text.

use std::rc::Rc;

use crate::modules::CompiledModule;
use crate::token::Span;
use crate::types::{EnumTypeId, FnKind, ObjTypeId, TypeId};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level program
// ─────────────────────────────────────────────────────────────────────────────

/// A fully parsed and type-checked compilation unit.
#[derive(Debug, Clone)]
pub struct Program {
    /// The module body, represented as a function of kind `Script` /
    /// `ScriptEntryPoint`.
    pub script: FnDecl,
    /// Canonical module name (source path, or `"<main>"`).
    pub name: String,
    /// Number of global slots this module defines (including imports).
    pub globals_count: u32,
    /// Exported symbols in export order.
    pub exports: Vec<ExportSym>,
    /// Global slots of top-level `test "..."` functions, in declaration order,
    /// paired with their display names.
    pub tests: Vec<(u32, String)>,
    /// Global slot of a top-level `main` function, if declared.
    pub main_slot: Option<u32>,
}

/// One exported symbol of a module.
#[derive(Debug, Clone)]
pub struct ExportSym {
    pub name: String,
    pub ty: TypeId,
    /// Global slot inside the exporting module.
    pub slot: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Variable slots
// ─────────────────────────────────────────────────────────────────────────────

/// Where a resolved name lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Stack slot relative to the enclosing call frame.
    Local(u8),
    /// Index into the enclosing closure's upvalue array.
    UpValue(u8),
    /// Index into the module-wide globals array.
    Global(u32),
}

/// A captured-variable descriptor emitted after `CLOSURE`: capture a local of
/// the enclosing frame, or re-capture one of the enclosing closure's upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueRef {
    pub is_local: bool,
    pub index: u8,
}

// ─────────────────────────────────────────────────────────────────────────────
// Functions
// ─────────────────────────────────────────────────────────────────────────────

/// A function declaration (named, anonymous, method, catch clause, test body,
/// or the module script itself).
#[derive(Debug, Clone)]
pub struct FnDecl {
    pub name: String,
    pub kind: FnKind,
    pub params: Vec<Param>,
    /// Declared return type (`void` when omitted).
    pub ret: TypeId,
    /// Declared error types (`!> t1, t2`); informational.
    pub error_types: Vec<TypeId>,
    pub body: Vec<Stmt>,
    /// Captured-variable descriptors, resolved by the parser.
    pub upvalues: Vec<UpvalueRef>,
    /// Local slots of this function that are captured by inner closures.
    /// Scope exits use this to choose `CLOSE_UPVALUE` over `POP`.
    pub captured: Vec<u8>,
    /// The interned function type.
    pub fn_type: TypeId,
    pub span: Span,
}

/// A single parameter in a function signature.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeId,
    /// Registry fragment index of the default-value expression, if declared.
    pub default: Option<u32>,
    pub span: Span,
}

// ─────────────────────────────────────────────────────────────────────────────
// Statements
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `int x = 5;` / `const y = 2;`
    VarDeclaration {
        name: String,
        ty: TypeId,
        slot: Slot,
        value: Option<Expr>,
        constant: bool,
    },
    /// `fun name(...) > ret { ... }` bound to `slot`.
    FunDeclaration { decl: Box<FnDecl>, slot: Slot },
    /// `object Name < Parent { ... }`
    ObjectDeclaration {
        object: ObjTypeId,
        slot: Slot,
        /// Global slot of the parent object's runtime value, when inheriting.
        parent_slot: Option<Slot>,
        methods: Vec<FnDecl>,
        /// Static field initializers in declaration order.
        static_inits: Vec<(String, Expr)>,
    },
    /// `enum(str) Name { a, b }`
    EnumDeclaration { def: EnumTypeId, slot: Slot },
    Expression(Expr),
    /// `{ ... }` — `scope_slots` lists the local slots (highest first) that
    /// die when the block exits.
    Block {
        body: Vec<Stmt>,
        scope_slots: Vec<u8>,
    },
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        then_slots: Vec<u8>,
        else_branch: Option<Vec<Stmt>>,
        else_slots: Vec<u8>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
        scope_slots: Vec<u8>,
    },
    DoUntil {
        body: Vec<Stmt>,
        scope_slots: Vec<u8>,
        condition: Expr,
    },
    For {
        init: Vec<Stmt>,
        condition: Expr,
        increment: Vec<Expr>,
        body: Vec<Stmt>,
        body_slots: Vec<u8>,
        /// Slots of the `for` header locals, discarded after the loop.
        init_slots: Vec<u8>,
    },
    ForEach {
        /// Hidden or named key local (index / map key / case counter).
        key_slot: u8,
        key_ty: TypeId,
        /// Value local.
        value_slot: u8,
        value_ty: TypeId,
        iterable: Expr,
        body: Vec<Stmt>,
        body_slots: Vec<u8>,
    },
    Return { value: Option<Expr> },
    /// `break;` — `scope_slots` are the locals to discard before jumping.
    Break { scope_slots: Vec<u8> },
    Continue { scope_slots: Vec<u8> },
    Throw { value: Expr },
    /// `import "path" as prefix;` — the module was compiled at parse time.
    Import {
        path: String,
        module: Rc<CompiledModule>,
        /// First destination global slot in the importing module.
        dest_slot: u32,
        count: u32,
    },
    /// `export <decl>` / `export name;` — the export list lives on
    /// [`Program::exports`]; the wrapped declaration (if any) still executes.
    Export { decl: Option<Box<Stmt>> },
}

// ─────────────────────────────────────────────────────────────────────────────
// Expressions
// ─────────────────────────────────────────────────────────────────────────────

/// A typed expression node.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    /// The resolved static type. Never a placeholder after parsing succeeds.
    pub ty: TypeId,
    pub span: Span,
}

/// One segment of an interpolated string.
#[derive(Debug, Clone)]
pub enum StringSegment {
    Lit(String),
    Expr(Expr),
}

/// How a `.member` access resolves, decided by the type checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotKind {
    /// Instance field read.
    Field,
    /// Instance method (bound when read, fast-pathed when called).
    Method,
    /// Built-in container method (`list.append`, `rg.toList`, ...); only
    /// valid as the callee of a call.
    Builtin,
    /// `EnumName.case` — produces the case instance.
    EnumCase(u16),
    /// `caseInstance.value` — the underlying value of an enum case.
    EnumValue,
    /// Static field on an object.
    StaticField,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Null,
    Boolean(bool),
    Integer(i32),
    Float(f64),
    StringLit(String),
    /// An interpolated string; evaluates segments left-to-right, coercing
    /// non-string values with `TO_STRING` and concatenating.
    String(Vec<StringSegment>),
    List {
        items: Vec<Expr>,
    },
    Map {
        entries: Vec<(Expr, Expr)>,
    },
    Range {
        low: Box<Expr>,
        high: Box<Expr>,
    },
    /// A resolved name reference.
    NamedVariable {
        name: String,
        slot: Slot,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `value is Target` — `target` is a reified type constant.
    Is {
        value: Box<Expr>,
        target: TypeId,
    },
    /// Graceful unwrap `x?` — on `null`, short-circuits the enclosing
    /// expression to `null`.
    Unwrap {
        operand: Box<Expr>,
    },
    /// Force unwrap `x!` — throws on `null`.
    ForceUnwrap {
        operand: Box<Expr>,
    },
    /// `lhs ?? rhs`
    NullOr {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Subscript {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Dot {
        target: Box<Expr>,
        member: String,
        kind: DotKind,
    },
    /// `super.method` — only valid as a call callee inside a method.
    Super {
        method: String,
        /// Global slot of the parent object's runtime value.
        parent_slot: Slot,
    },
    /// `Name{ field = expr, ... }` — fields include parser-inlined defaults
    /// for omitted fields, in declaration order.
    ObjectInit {
        object: ObjTypeId,
        /// Slot holding the runtime object value (usually a global).
        object_slot: Slot,
        fields: Vec<(String, Expr)>,
    },
    /// A call with positional/named arguments already reordered to the
    /// callee's declaration order and defaults inlined.
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        /// Catch clauses attached to this call site.
        catches: Vec<Expr>,
    },
    /// An anonymous function / closure literal (also catch clauses).
    Function(Box<FnDecl>),
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Negate,
    /// `!x`
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    ShiftLeft,
    ShiftRight,
    BitAnd,
    BitXor,
    BitOr,
}

impl BinaryOp {
    /// `true` for the bitwise/shift family (int × int → int).
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::ShiftLeft
                | BinaryOp::ShiftRight
                | BinaryOp::BitAnd
                | BinaryOp::BitXor
                | BinaryOp::BitOr
        )
    }

    /// `true` for `== != < <= > >=`.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_op_families() {
        assert!(BinaryOp::ShiftLeft.is_bitwise());
        assert!(!BinaryOp::Add.is_bitwise());
        assert!(BinaryOp::Less.is_comparison());
        assert!(!BinaryOp::And.is_comparison());
    }
}
