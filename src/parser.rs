//! Parser and type checker for the Buzz language.
//!
//! Statements are parsed by recursive descent; expressions by a Pratt parser
//! with the precedence ladder (low → high): assignment, `or`, `and`, `??`,
//! equality, comparison / `is`, bitwise, shift, range (`..`), term, factor,
//! unary, call/postfix, primary.
//!
//! The parser performs type checking as it goes: every [`Expr`] leaves the
//! parser with a resolved [`TypeId`], and name references leave with their
//! runtime [`Slot`]. Scoping follows the Lua 5.x closure model: a frame per
//! function tracks up to 255 locals and 255 upvalues; a name that resolves in
//! neither is a module-wide global.
//!
//! # Forward references
//!
//! An unknown name in type position becomes a [`Placeholder`] type that the
//! later declaration resolves in place. An unknown name in value position
//! becomes a *pending global* with a placeholder type. Member accesses and
//! calls through placeholder types are recorded as deferred checks and
//! verified once all declarations have been seen. Anything still unresolved
//! at the end of the unit is an "Unknown type" / "Unknown symbol" error.
//!
//! # Errors
//!
//! Errors are accumulated with source spans; the parser keeps going after an
//! error so a single run reports as much as possible. If any error was
//! recorded, no [`Program`] is produced and nothing executes.
//!
//! [`Placeholder`]: crate::types::TypeKind::Placeholder

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::ast::*;
use crate::modules::{self, ModuleRegistry};
use crate::natives;
use crate::token::{Span, StringPart, Token, TokenKind};
use crate::types::{
    EnumTypeId, FnKind, FunctionType, ObjTypeId, ObjectField, TypeId, TypeKind, TypeRegistry,
};

// ─────────────────────────────────────────────────────────────────────────────
// Diagnostics
// ─────────────────────────────────────────────────────────────────────────────

/// Which stage of analysis produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    /// Malformed syntax.
    Syntax,
    /// A well-formed construct with incompatible types.
    Type,
    /// A name that never resolved (unknown type / unknown symbol).
    Resolution,
}

/// A parse/type/resolution error with its source location.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
    pub kind: DiagKind,
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoping state
// ─────────────────────────────────────────────────────────────────────────────

const MAX_LOCALS: usize = 255;
const MAX_UPVALUES: usize = 255;

#[derive(Debug)]
struct LocalVar {
    name: String,
    depth: u32,
    ty: TypeId,
    constant: bool,
    captured: bool,
}

/// One function being parsed: its locals, upvalues, and typing context.
struct Frame {
    locals: Vec<LocalVar>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: u32,
    kind: FnKind,
    ret: TypeId,
    /// Enclosing object, for `this` / `super` / self-referential deferral.
    object: Option<ObjTypeId>,
    /// Local slots captured by inner closures (final at frame end).
    captured: Vec<u8>,
}

impl Frame {
    fn new(kind: FnKind, ret: TypeId, object: Option<ObjTypeId>) -> Self {
        Frame {
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            kind,
            ret,
            object,
            captured: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct GlobalVar {
    name: String,
    ty: TypeId,
    constant: bool,
    /// `false` while the global is only known from a forward reference.
    declared: bool,
    span: Span,
}

/// Loop bookkeeping for computing the locals `break` / `continue` discard.
struct LoopInfo {
    /// Scope depth just before the loop statement.
    break_depth: u32,
    /// Scope depth of the loop body (locals above persist across iterations).
    continue_depth: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Deferred checks (forward references)
// ─────────────────────────────────────────────────────────────────────────────

enum Deferred {
    /// `target.member` where `target`'s type was not yet resolved.
    Dot {
        target: TypeId,
        member: String,
        /// Placeholder name created for the access result.
        result: String,
        span: Span,
    },
    /// A call whose callee type was not yet resolved.
    Call {
        callee: TypeId,
        args: Vec<TypeId>,
        result: String,
        span: Span,
    },
    /// `Name{...}` inside the declaration of `Name` itself — the
    /// field-coverage check runs once the object is complete.
    Init {
        object: ObjTypeId,
        provided: Vec<String>,
        span: Span,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Precedence
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Prec {
    Assignment,
    Or,
    And,
    NullOr,
    Equality,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Range,
    Term,
    Factor,
    Unary,
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Parse and type-check one compilation unit.
///
/// `entry` marks the unit as the top-level script (eligible for `main` / test
/// synthesis). Returns the program (only when no errors were recorded) and
/// the full diagnostic list.
pub fn parse(
    tokens: Vec<Token>,
    types: &mut TypeRegistry,
    modules: &mut ModuleRegistry,
    name: &str,
    dir: Option<&Path>,
    entry: bool,
) -> (Option<Program>, Vec<ParseError>) {
    let mut parser = Parser::new(tokens, types, modules, name, dir, entry);
    let program = parser.run();
    let errors = parser.errors;
    if errors.is_empty() {
        (Some(program), errors)
    } else {
        (None, errors)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    types: &'a mut TypeRegistry,
    modules: &'a mut ModuleRegistry,

    frames: Vec<Frame>,
    globals: Vec<GlobalVar>,
    namespaces: HashSet<String>,
    object_names: HashMap<String, ObjTypeId>,
    enum_names: HashMap<String, EnumTypeId>,
    /// Object currently being declared (its members may be incomplete).
    declaring_object: Option<ObjTypeId>,

    deferred: Vec<Deferred>,
    defer_counter: u32,
    loops: Vec<LoopInfo>,
    errors: Vec<ParseError>,
    panicking: bool,

    module_name: String,
    module_dir: Option<PathBuf>,
    entry: bool,
    exports: Vec<ExportSym>,
    tests: Vec<(u32, String)>,
    test_counter: u32,
    /// Expected type of the expression being parsed (threads the declared
    /// type into empty `[]` / `{}` literals).
    type_hint: Option<TypeId>,
}

impl<'a> Parser<'a> {
    fn new(
        tokens: Vec<Token>,
        types: &'a mut TypeRegistry,
        modules: &'a mut ModuleRegistry,
        name: &str,
        dir: Option<&Path>,
        entry: bool,
    ) -> Self {
        let mut parser = Parser {
            tokens,
            pos: 0,
            types,
            modules,
            frames: Vec::new(),
            globals: Vec::new(),
            namespaces: HashSet::new(),
            object_names: HashMap::new(),
            enum_names: HashMap::new(),
            declaring_object: None,
            deferred: Vec::new(),
            defer_counter: 0,
            loops: Vec::new(),
            errors: Vec::new(),
            panicking: false,
            module_name: name.to_string(),
            module_dir: dir.map(Path::to_path_buf),
            entry,
            exports: Vec::new(),
            tests: Vec::new(),
            test_counter: 0,
            type_hint: None,
        };

        // Natives occupy the first global slots of every module; the VM
        // materialises the same list in the same order.
        for decl in natives::all() {
            let ty = (decl.signature)(parser.types);
            parser.globals.push(GlobalVar {
                name: decl.name.to_string(),
                ty,
                constant: true,
                declared: true,
                span: Span::dummy(),
            });
        }

        parser
    }

    fn run(&mut self) -> Program {
        self.begin_frame(FnKind::Script, self.types.t_void, None);

        let mut body = Vec::new();
        while !self.check(&TokenKind::Eof) {
            if let Some(stmt) = self.declaration() {
                body.push(stmt);
            }
            if self.panicking {
                self.synchronize();
            }
        }

        self.resolve_deferred();

        // Unknown types and symbols left over from forward references.
        // Internal `#dot`/`#call` placeholders are skipped: they only remain
        // when their target never resolved, which gets its own diagnostic.
        for name in self.types.unresolved_placeholders() {
            if name.starts_with('#') {
                continue;
            }
            let span = self
                .globals
                .iter()
                .find(|g| g.name == name && !g.declared)
                .map(|g| g.span)
                .unwrap_or_else(Span::dummy);
            self.error_at(span, DiagKind::Resolution, format!("Unknown type `{name}`"));
        }
        let pending: Vec<(String, Span)> = self
            .globals
            .iter()
            .filter(|g| !g.declared)
            .map(|g| (g.name.clone(), g.span))
            .collect();
        for (name, span) in pending {
            // Placeholder diagnostics above already cover names used in type
            // position; this catches pure value references.
            if !self
                .errors
                .iter()
                .any(|e| e.kind == DiagKind::Resolution && e.message.contains(&format!("`{name}`")))
            {
                self.error_at(
                    span,
                    DiagKind::Resolution,
                    format!("Unknown symbol `{name}`"),
                );
            }
        }

        let main_slot = self.globals.iter().position(|g| {
            g.name == "main"
                && g.declared
                && matches!(self.types.get(g.ty).kind, TypeKind::Function(_))
        });
        let script_kind = if self.entry && main_slot.is_some() {
            FnKind::ScriptEntryPoint
        } else {
            FnKind::Script
        };

        let (upvalues, captured) = self.end_frame();
        let fn_type = self.types.function_of(FunctionType {
            params: Vec::new(),
            defaults: Vec::new(),
            ret: self.types.t_void,
            kind: script_kind,
        });

        let script = FnDecl {
            name: self.module_name.clone(),
            kind: script_kind,
            params: Vec::new(),
            ret: self.types.t_void,
            error_types: Vec::new(),
            body,
            upvalues,
            captured,
            fn_type,
            span: Span::dummy(),
        };

        Program {
            script,
            name: self.module_name.clone(),
            globals_count: self.globals.len() as u32,
            exports: self.exports.clone(),
            tests: self.tests.clone(),
            main_slot: main_slot.map(|s| s as u32),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Token plumbing
    // ─────────────────────────────────────────────────────────────────────────

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn current_span(&self) -> Span {
        self.current().span
    }

    fn peek_kind(&self, ahead: usize) -> &TokenKind {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Span {
        if self.check(kind) {
            self.advance().span
        } else {
            let span = self.current_span();
            self.syntax_error(span, format!("expected {what}, found {}", self.current().kind));
            span
        }
    }

    fn expect_identifier(&mut self, what: &str) -> (String, Span) {
        if let TokenKind::Identifier(name) = &self.current().kind {
            let name = name.clone();
            let span = self.advance().span;
            (name, span)
        } else {
            let span = self.current_span();
            self.syntax_error(span, format!("expected {what}, found {}", self.current().kind));
            (String::new(), span)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Error helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn error_at(&mut self, span: Span, kind: DiagKind, message: impl Into<String>) {
        self.errors.push(ParseError {
            message: message.into(),
            span,
            kind,
        });
    }

    fn syntax_error(&mut self, span: Span, message: impl Into<String>) {
        if !self.panicking {
            self.error_at(span, DiagKind::Syntax, message);
        }
        self.panicking = true;
    }

    fn type_error(&mut self, span: Span, message: impl Into<String>) {
        self.error_at(span, DiagKind::Type, message);
    }

    /// Skip to the next likely statement boundary after a syntax error.
    fn synchronize(&mut self) {
        self.panicking = false;
        while !self.check(&TokenKind::Eof) {
            if self.eat(&TokenKind::Semicolon) {
                return;
            }
            match self.current().kind {
                TokenKind::Fun
                | TokenKind::Object
                | TokenKind::Enum
                | TokenKind::Test
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::ForEach
                | TokenKind::Do
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::Export
                | TokenKind::RightBrace => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// A poisoned expression used to keep parsing after a type error.
    fn error_expr(&mut self, span: Span) -> Expr {
        Expr {
            kind: ExprKind::Null,
            ty: self.types.t_any,
            span,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scope helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn begin_frame(&mut self, kind: FnKind, ret: TypeId, object: Option<ObjTypeId>) {
        let mut frame = Frame::new(kind, ret, object);
        // Slot 0 holds the callee (or the receiver inside methods).
        let (name, ty) = if kind == FnKind::Method {
            let obj = object.expect("method frame without object");
            ("this".to_string(), self.types.object(obj).instance_type)
        } else {
            (String::new(), self.types.t_void)
        };
        frame.locals.push(LocalVar {
            name,
            depth: 0,
            ty,
            constant: true,
            captured: false,
        });
        self.frames.push(frame);
    }

    /// Finish the current frame, producing its upvalue refs and captured set.
    fn end_frame(&mut self) -> (Vec<UpvalueRef>, Vec<u8>) {
        let frame = self.frames.pop().expect("no frame to end");
        let mut captured = frame.captured;
        for (slot, local) in frame.locals.iter().enumerate() {
            if local.captured {
                captured.push(slot as u8);
            }
        }
        (frame.upvalues, captured)
    }

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    /// Close the innermost scope, returning the slots of its locals
    /// (highest first) for the code generator to discard.
    fn end_scope(&mut self) -> Vec<u8> {
        let depth = self.frame().scope_depth;
        self.frame_mut().scope_depth -= 1;

        let mut slots = Vec::new();
        loop {
            let frame = self.frame_mut();
            match frame.locals.last() {
                Some(local) if local.depth >= depth => {
                    let slot = (frame.locals.len() - 1) as u8;
                    if local.captured {
                        frame.captured.push(slot);
                    }
                    frame.locals.pop();
                    slots.push(slot);
                }
                _ => break,
            }
        }
        slots
    }

    /// Slots of locals deeper than `depth`, highest first. Used for the
    /// cleanup `break` / `continue` perform before jumping.
    fn slots_above_depth(&self, depth: u32) -> Vec<u8> {
        self.frame()
            .locals
            .iter()
            .enumerate()
            .filter(|(_, l)| l.depth > depth)
            .map(|(i, _)| i as u8)
            .rev()
            .collect()
    }

    fn declare_local(&mut self, name: &str, ty: TypeId, constant: bool, span: Span) -> u8 {
        let depth = self.frame().scope_depth;
        if self
            .frame()
            .locals
            .iter()
            .any(|l| l.depth == depth && l.name == name && !name.is_empty())
        {
            self.type_error(span, format!("`{name}` is already declared in this scope"));
        }
        if self.frame().locals.len() >= MAX_LOCALS {
            self.type_error(span, "too many local variables in function");
            return 0;
        }
        let slot = self.frame().locals.len() as u8;
        self.frame_mut().locals.push(LocalVar {
            name: name.to_string(),
            depth,
            ty,
            constant,
            captured: false,
        });
        slot
    }

    fn resolve_local(&self, frame_idx: usize, name: &str) -> Option<u8> {
        let locals = &self.frames[frame_idx].locals;
        locals
            .iter()
            .rposition(|l| l.name == name)
            .map(|i| i as u8)
    }

    fn add_upvalue(&mut self, frame_idx: usize, desc: UpvalueRef, span: Span) -> u8 {
        let uvs = &mut self.frames[frame_idx].upvalues;
        if let Some(i) = uvs.iter().position(|u| *u == desc) {
            return i as u8;
        }
        if uvs.len() >= MAX_UPVALUES {
            self.type_error(span, "too many captured variables in function");
            return 0;
        }
        let idx = uvs.len() as u8;
        uvs.push(desc);
        idx
    }

    /// The Lua 5.x closure walk: find `name` as a local of an enclosing
    /// frame, inserting an upvalue record in every intermediate frame.
    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str, span: Span) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        if let Some(slot) = self.resolve_local(frame_idx - 1, name) {
            self.frames[frame_idx - 1].locals[slot as usize].captured = true;
            return Some(self.add_upvalue(
                frame_idx,
                UpvalueRef {
                    is_local: true,
                    index: slot,
                },
                span,
            ));
        }
        if let Some(upvalue) = self.resolve_upvalue(frame_idx - 1, name, span) {
            return Some(self.add_upvalue(
                frame_idx,
                UpvalueRef {
                    is_local: false,
                    index: upvalue,
                },
                span,
            ));
        }
        None
    }

    /// Find or create the global slot for `name`. Unknown names become
    /// *pending* globals with a placeholder type, declared-checked at the end
    /// of the unit.
    fn resolve_global(&mut self, name: &str, span: Span) -> u32 {
        if let Some(idx) = self.globals.iter().rposition(|g| g.name == name) {
            return idx as u32;
        }
        let ty = self.types.placeholder(name);
        self.globals.push(GlobalVar {
            name: name.to_string(),
            ty,
            constant: false,
            declared: false,
            span,
        });
        (self.globals.len() - 1) as u32
    }

    /// Declare (or complete a pending) global. `resolve_refs` controls
    /// whether forward value references to the name adopt `ty` — object and
    /// enum declarations skip it because their *type* meaning is resolved
    /// through the registry instead.
    fn declare_global(
        &mut self,
        name: &str,
        ty: TypeId,
        constant: bool,
        resolve_refs: bool,
        span: Span,
    ) -> u32 {
        if resolve_refs {
            self.types.resolve_placeholder_to(name, ty);
        }
        if let Some(idx) = self.globals.iter().rposition(|g| g.name == name) {
            if self.globals[idx].declared {
                self.type_error(span, format!("`{name}` is already declared"));
            }
            let global = &mut self.globals[idx];
            global.ty = ty;
            global.constant = constant;
            global.declared = true;
            global.span = span;
            return idx as u32;
        }
        self.globals.push(GlobalVar {
            name: name.to_string(),
            ty,
            constant,
            declared: true,
            span,
        });
        (self.globals.len() - 1) as u32
    }

    /// Resolve a name to an expression node with its runtime slot.
    fn named_variable(&mut self, name: &str, span: Span) -> Expr {
        let frame_idx = self.frames.len() - 1;
        if let Some(slot) = self.resolve_local(frame_idx, name) {
            let ty = self.frames[frame_idx].locals[slot as usize].ty;
            return Expr {
                kind: ExprKind::NamedVariable {
                    name: name.to_string(),
                    slot: Slot::Local(slot),
                },
                ty,
                span,
            };
        }
        if let Some(upvalue) = self.resolve_upvalue(frame_idx, name, span) {
            let ty = self.upvalue_type(frame_idx, upvalue);
            return Expr {
                kind: ExprKind::NamedVariable {
                    name: name.to_string(),
                    slot: Slot::UpValue(upvalue),
                },
                ty,
                span,
            };
        }
        let slot = self.resolve_global(name, span);
        let ty = self.globals[slot as usize].ty;
        Expr {
            kind: ExprKind::NamedVariable {
                name: name.to_string(),
                slot: Slot::Global(slot),
            },
            ty,
            span,
        }
    }

    /// Walk an upvalue chain back to the originating local to find its type.
    fn upvalue_type(&self, frame_idx: usize, index: u8) -> TypeId {
        let mut frame_idx = frame_idx;
        let mut index = index;
        loop {
            let desc = self.frames[frame_idx].upvalues[index as usize];
            if desc.is_local {
                return self.frames[frame_idx - 1].locals[desc.index as usize].ty;
            }
            frame_idx -= 1;
            index = desc.index;
        }
    }

    /// Whether assignment to the resolved name is rejected (`const`).
    fn is_constant_slot(&self, name: &str, slot: &Slot) -> bool {
        match slot {
            Slot::Local(i) => self.frame().locals[*i as usize].constant,
            Slot::Global(i) => self.globals[*i as usize].constant,
            Slot::UpValue(_) => {
                // Trace back through frames by name.
                for frame in self.frames.iter().rev().skip(1) {
                    if let Some(l) = frame.locals.iter().rev().find(|l| l.name == name) {
                        return l.constant;
                    }
                }
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Types
    // ─────────────────────────────────────────────────────────────────────────

    /// Parse a type expression: primitive names, `[item]`, `{key, value}`,
    /// `fun(params) > ret`, a declared object/enum name, or a placeholder
    /// for a forward reference. A trailing `?` marks the type optional.
    fn parse_type(&mut self) -> TypeId {
        let base = match self.current().kind.clone() {
            TokenKind::BoolType => {
                self.advance();
                self.types.t_bool
            }
            TokenKind::IntType => {
                self.advance();
                self.types.t_int
            }
            TokenKind::FloatType => {
                self.advance();
                self.types.t_float
            }
            TokenKind::StrType => {
                self.advance();
                self.types.t_str
            }
            TokenKind::VoidType => {
                self.advance();
                self.types.t_void
            }
            TokenKind::AnyType => {
                self.advance();
                self.types.t_any
            }
            TokenKind::LeftBracket => {
                self.advance();
                let item = self.parse_type();
                self.expect(&TokenKind::RightBracket, "`]` after list item type");
                self.types.list_of(item)
            }
            TokenKind::LeftBrace => {
                self.advance();
                let key = self.parse_type();
                self.expect(&TokenKind::Comma, "`,` between map key and value types");
                let value = self.parse_type();
                self.expect(&TokenKind::RightBrace, "`}` after map value type");
                self.check_map_key_type(key);
                self.types.map_of(key, value)
            }
            TokenKind::Fun => {
                self.advance();
                self.expect(&TokenKind::LeftParen, "`(` after `fun` in type position");
                let mut params = Vec::new();
                if !self.check(&TokenKind::RightParen) {
                    loop {
                        let ty = self.parse_type();
                        // An optional parameter name for documentation.
                        let name = if let TokenKind::Identifier(n) = &self.current().kind {
                            let n = n.clone();
                            self.advance();
                            n
                        } else {
                            format!("arg{}", params.len())
                        };
                        params.push((name, ty));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RightParen, "`)` after function type parameters");
                let ret = if self.eat(&TokenKind::Greater) {
                    self.parse_type()
                } else {
                    self.types.t_void
                };
                let defaults = vec![None; params.len()];
                self.types.function_of(FunctionType {
                    params,
                    defaults,
                    ret,
                    kind: FnKind::Anonymous,
                })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if let Some(&obj) = self.object_names.get(&name) {
                    self.types.object(obj).instance_type
                } else if let Some(&def) = self.enum_names.get(&name) {
                    self.types.enum_def(def).instance_type
                } else {
                    self.types.placeholder(&name)
                }
            }
            other => {
                let span = self.current_span();
                self.syntax_error(span, format!("expected a type, found {other}"));
                self.types.t_any
            }
        };

        if self.eat(&TokenKind::Question) {
            self.types.optional_of(base)
        } else {
            base
        }
    }

    fn check_map_key_type(&mut self, key: TypeId) {
        let ok = matches!(
            self.types.get(key).kind,
            TypeKind::Bool
                | TypeKind::Integer
                | TypeKind::Float
                | TypeKind::String
                | TypeKind::EnumInstance { .. }
                | TypeKind::Placeholder { .. }
        );
        if !ok {
            let span = self.current_span();
            let name = self.types.name_of(key);
            self.type_error(span, format!("`{name}` cannot be used as a map key type"));
        }
    }

    /// Lookahead-only check: does a type expression followed by an
    /// identifier start here? Distinguishes declarations from expression
    /// statements without committing to any side effects.
    fn looks_like_declaration(&self) -> bool {
        let mut i = self.pos;
        if !self.scan_type(&mut i) {
            return false;
        }
        matches!(self.tokens[i.min(self.tokens.len() - 1)].kind, TokenKind::Identifier(_))
    }

    fn scan_type(&self, i: &mut usize) -> bool {
        let kind = |i: usize| &self.tokens[i.min(self.tokens.len() - 1)].kind;
        match kind(*i) {
            TokenKind::BoolType
            | TokenKind::IntType
            | TokenKind::FloatType
            | TokenKind::StrType
            | TokenKind::VoidType
            | TokenKind::AnyType
            | TokenKind::Identifier(_) => {
                *i += 1;
            }
            TokenKind::LeftBracket => {
                *i += 1;
                if !self.scan_type(i) {
                    return false;
                }
                if kind(*i) != &TokenKind::RightBracket {
                    return false;
                }
                *i += 1;
            }
            TokenKind::LeftBrace => {
                *i += 1;
                if !self.scan_type(i) {
                    return false;
                }
                if kind(*i) != &TokenKind::Comma {
                    return false;
                }
                *i += 1;
                if !self.scan_type(i) {
                    return false;
                }
                if kind(*i) != &TokenKind::RightBrace {
                    return false;
                }
                *i += 1;
            }
            TokenKind::Fun => {
                *i += 1;
                if kind(*i) != &TokenKind::LeftParen {
                    return false;
                }
                // Skip the parenthesised parameter list.
                let mut depth = 0usize;
                loop {
                    match kind(*i) {
                        TokenKind::LeftParen => depth += 1,
                        TokenKind::RightParen => {
                            depth -= 1;
                            if depth == 0 {
                                *i += 1;
                                break;
                            }
                        }
                        TokenKind::Eof => return false,
                        _ => {}
                    }
                    *i += 1;
                }
                if kind(*i) == &TokenKind::Greater {
                    *i += 1;
                    if !self.scan_type(i) {
                        return false;
                    }
                }
            }
            _ => return false,
        }
        if kind(*i) == &TokenKind::Question {
            *i += 1;
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Declarations
    // ─────────────────────────────────────────────────────────────────────────

    fn declaration(&mut self) -> Option<Stmt> {
        match self.current().kind {
            TokenKind::Import => self.import_declaration(),
            TokenKind::Export => self.export_declaration(),
            // `fun name(...)` declares; `fun (...)` is a function *type*
            // opening a variable declaration.
            TokenKind::Fun if matches!(self.peek_kind(1), TokenKind::Identifier(_)) => {
                self.fun_declaration()
            }
            TokenKind::Object => self.object_declaration(),
            TokenKind::Enum => self.enum_declaration(),
            TokenKind::Test => self.test_declaration(),
            TokenKind::Const => self.var_declaration(true),
            _ if self.looks_like_declaration() => self.var_declaration(false),
            _ => self.statement(),
        }
    }

    fn at_top_level(&self) -> bool {
        self.frames.len() == 1 && self.frame().scope_depth == 0
    }

    // ── Variables ────────────────────────────────────────────────────────────

    fn var_declaration(&mut self, constant: bool) -> Option<Stmt> {
        let start = self.current_span();
        let ty = if constant {
            self.advance(); // `const`
            None
        } else {
            Some(self.parse_type())
        };
        let (name, name_span) = self.expect_identifier("variable name");

        let value = if self.eat(&TokenKind::Equal) {
            let hint = ty;
            let prev_hint = self.type_hint.take();
            self.type_hint = hint;
            let value = self.expression();
            self.type_hint = prev_hint;
            Some(value)
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "`;` after variable declaration");

        // Infer or check.
        let var_ty = match (ty, &value) {
            (Some(declared), Some(v)) => {
                if !self.types.is_assignable(v.ty, declared) {
                    let found = self.types.name_of(v.ty);
                    let wanted = self.types.name_of(declared);
                    self.type_error(
                        v.span,
                        format!("cannot assign `{found}` to `{wanted}`"),
                    );
                }
                declared
            }
            (Some(declared), None) => {
                if !self.types.get(declared).optional {
                    let wanted = self.types.name_of(declared);
                    self.type_error(
                        name_span,
                        format!("`{name}` of type `{wanted}` needs a value"),
                    );
                }
                declared
            }
            (None, Some(v)) => v.ty,
            (None, None) => {
                self.type_error(name_span, format!("`{name}` needs a value"));
                self.types.t_any
            }
        };
        if self.types.get(var_ty).kind == TypeKind::Void && !self.types.get(var_ty).optional {
            self.type_error(name_span, "cannot declare a variable of type `void`");
        }

        let slot = if self.at_top_level() {
            Slot::Global(self.declare_global(&name, var_ty, constant, true, name_span))
        } else {
            Slot::Local(self.declare_local(&name, var_ty, constant, name_span))
        };

        Some(Stmt {
            kind: StmtKind::VarDeclaration {
                name,
                ty: var_ty,
                slot,
                value,
                constant,
            },
            span: start,
        })
    }

    // ── Functions ────────────────────────────────────────────────────────────

    /// Parse a named `fun` declaration (top-level or local).
    fn fun_declaration(&mut self) -> Option<Stmt> {
        let start = self.expect(&TokenKind::Fun, "`fun`");
        let (name, name_span) = self.expect_identifier("function name");

        let kind = if name == "main" && self.at_top_level() {
            FnKind::EntryPoint
        } else {
            FnKind::Function
        };

        // Signature first, so the name can be bound before the body parses
        // (recursion).
        let (params, ret, error_types) = self.fun_signature();
        let fn_type = self.fn_type_of(&params, ret, kind);
        if kind == FnKind::EntryPoint && !params.is_empty() {
            self.type_error(name_span, "`main` takes no parameters; use `args()`");
        }

        let slot = if self.at_top_level() {
            Slot::Global(self.declare_global(&name, fn_type, true, true, name_span))
        } else {
            Slot::Local(self.declare_local(&name, fn_type, true, name_span))
        };

        let decl = self.fun_body(name.clone(), kind, params, ret, error_types, fn_type, start);

        Some(Stmt {
            kind: StmtKind::FunDeclaration {
                decl: Box::new(decl),
                slot,
            },
            span: start,
        })
    }

    /// Parse `(params) (> ret)? (!> err (, err)*)?`.
    fn fun_signature(&mut self) -> (Vec<Param>, TypeId, Vec<TypeId>) {
        self.expect(&TokenKind::LeftParen, "`(` after function name");
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let param_span = self.current_span();
                let ty = self.parse_type();
                let (pname, _) = self.expect_identifier("parameter name");
                let default = if self.eat(&TokenKind::Equal) {
                    let prev_hint = self.type_hint.replace(ty);
                    let expr = self.default_value_expression();
                    self.type_hint = prev_hint;
                    if !self.types.is_assignable(expr.ty, ty) {
                        let found = self.types.name_of(expr.ty);
                        let wanted = self.types.name_of(ty);
                        self.type_error(
                            expr.span,
                            format!("default value of type `{found}` does not fit `{wanted}`"),
                        );
                    }
                    Some(self.types.add_fragment(expr))
                } else {
                    None
                };
                if params.len() >= 255 {
                    self.type_error(param_span, "too many parameters");
                }
                params.push(Param {
                    name: pname,
                    ty,
                    default,
                    span: param_span,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen, "`)` after parameters");

        let ret = if self.eat(&TokenKind::Greater) {
            self.parse_type()
        } else {
            self.types.t_void
        };

        let mut error_types = Vec::new();
        if self.eat(&TokenKind::BangGreater) {
            loop {
                error_types.push(self.parse_type());
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        (params, ret, error_types)
    }

    /// Default values are compiled at every call site, so they may not
    /// capture call-frame state: only literals and globals are allowed.
    fn default_value_expression(&mut self) -> Expr {
        let expr = self.parse_precedence(Prec::Unary);
        let mut ok = true;
        check_fragment(&expr, &mut ok);
        if !ok {
            self.type_error(
                expr.span,
                "default values may only use literals and globals",
            );
        }
        return expr;

        fn check_fragment(expr: &Expr, ok: &mut bool) {
            match &expr.kind {
                ExprKind::NamedVariable { slot, .. } => {
                    if !matches!(slot, Slot::Global(_)) {
                        *ok = false;
                    }
                }
                ExprKind::Function(_) => *ok = false,
                _ => {}
            }
            walk_children(expr, &mut |child| check_fragment(child, ok));
        }
    }

    fn fn_type_of(&mut self, params: &[Param], ret: TypeId, kind: FnKind) -> TypeId {
        let sig_params: Vec<(String, TypeId)> =
            params.iter().map(|p| (p.name.clone(), p.ty)).collect();
        let defaults: Vec<Option<u32>> = params.iter().map(|p| p.default).collect();
        self.types.function_of(FunctionType {
            params: sig_params,
            defaults,
            ret,
            kind,
        })
    }

    /// Parse the body of a function whose signature is already known.
    fn fun_body(
        &mut self,
        name: String,
        kind: FnKind,
        params: Vec<Param>,
        ret: TypeId,
        error_types: Vec<TypeId>,
        fn_type: TypeId,
        span: Span,
    ) -> FnDecl {
        let object = self.frame().object.or(self.declaring_object);
        let object = if kind == FnKind::Method { object } else { None };
        self.begin_frame(kind, ret, object);
        for param in &params {
            self.declare_local(&param.name, param.ty, false, param.span);
        }

        self.expect(&TokenKind::LeftBrace, "`{` before function body");
        let mut body = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if let Some(stmt) = self.declaration() {
                body.push(stmt);
            }
            if self.panicking {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RightBrace, "`}` after function body");

        let (upvalues, captured) = self.end_frame();
        FnDecl {
            name,
            kind,
            params,
            ret,
            error_types,
            body,
            upvalues,
            captured,
            fn_type,
            span,
        }
    }

    /// An anonymous `fun (...) > t { ... }` expression.
    fn function_expression(&mut self) -> Expr {
        let start = self.expect(&TokenKind::Fun, "`fun`");
        let (params, ret, error_types) = self.fun_signature();
        let fn_type = self.fn_type_of(&params, ret, FnKind::Anonymous);
        let decl = self.fun_body(
            "<anonymous>".to_string(),
            FnKind::Anonymous,
            params,
            ret,
            error_types,
            fn_type,
            start,
        );
        Expr {
            kind: ExprKind::Function(Box::new(decl)),
            ty: fn_type,
            span: start,
        }
    }

    // ── Objects ──────────────────────────────────────────────────────────────

    fn object_declaration(&mut self) -> Option<Stmt> {
        let start = self.expect(&TokenKind::Object, "`object`");
        let (name, name_span) = self.expect_identifier("object name");
        if !self.at_top_level() {
            self.type_error(name_span, "objects can only be declared at the top level");
        }

        let parent = if self.eat(&TokenKind::Less) {
            let (parent_name, parent_span) = self.expect_identifier("parent object name");
            match self.object_names.get(&parent_name) {
                Some(&p) => Some(p),
                None => {
                    self.type_error(
                        parent_span,
                        format!("unknown parent object `{parent_name}`"),
                    );
                    None
                }
            }
        } else {
            None
        };

        let object = self.types.add_object(&name, parent);
        self.object_names.insert(name.clone(), object);
        let object_type = self.types.object(object).object_type;
        let slot = self.declare_global(&name, object_type, true, false, name_span);
        let parent_slot = parent.map(|p| {
            let parent_name = self.types.object(p).name.clone();
            Slot::Global(self.resolve_global(&parent_name, name_span))
        });
        let prev_declaring = self.declaring_object.replace(object);

        self.expect(&TokenKind::LeftBrace, "`{` after object name");

        let mut methods: Vec<FnDecl> = Vec::new();
        let mut static_inits: Vec<(String, Expr)> = Vec::new();

        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if self.check(&TokenKind::Fun) {
                // Method: register the signature, then parse the body.
                let m_start = self.advance().span;
                let (m_name, m_span) = self.expect_identifier("method name");
                let (params, ret, error_types) = self.fun_signature();
                let fn_type = self.fn_type_of(&params, ret, FnKind::Method);
                if self.types.lookup_method(object, &m_name).is_some()
                    && self
                        .types
                        .object(object)
                        .methods
                        .iter()
                        .any(|(n, _)| n == &m_name)
                {
                    self.type_error(m_span, format!("duplicate method `{m_name}`"));
                }
                self.types
                    .object_mut(object)
                    .methods
                    .push((m_name.clone(), fn_type));
                let decl = self.fun_body(
                    m_name,
                    FnKind::Method,
                    params,
                    ret,
                    error_types,
                    fn_type,
                    m_start,
                );
                methods.push(decl);
            } else if self.check(&TokenKind::Static) {
                self.advance();
                let f_ty = self.parse_type();
                let (f_name, f_span) = self.expect_identifier("static field name");
                self.expect(&TokenKind::Equal, "`=` after static field name");
                let prev_hint = self.type_hint.replace(f_ty);
                let value = self.expression();
                self.type_hint = prev_hint;
                if !self.types.is_assignable(value.ty, f_ty) {
                    let found = self.types.name_of(value.ty);
                    let wanted = self.types.name_of(f_ty);
                    self.type_error(
                        value.span,
                        format!("cannot assign `{found}` to static `{wanted}`"),
                    );
                }
                self.types
                    .object_mut(object)
                    .statics
                    .push((f_name.clone(), f_ty));
                static_inits.push((f_name, value));
                self.eat(&TokenKind::Comma);
                let _ = f_span;
            } else {
                // Instance field: `type name (= default)?`
                let f_ty = self.parse_type();
                let (f_name, f_span) = self.expect_identifier("field name");
                if self.types.lookup_field(object, &f_name).is_some() {
                    self.type_error(f_span, format!("duplicate field `{f_name}`"));
                }
                let default = if self.eat(&TokenKind::Equal) {
                    let prev_hint = self.type_hint.replace(f_ty);
                    let expr = self.default_value_expression();
                    self.type_hint = prev_hint;
                    if !self.types.is_assignable(expr.ty, f_ty) {
                        let found = self.types.name_of(expr.ty);
                        let wanted = self.types.name_of(f_ty);
                        self.type_error(
                            expr.span,
                            format!("default value of type `{found}` does not fit `{wanted}`"),
                        );
                    }
                    Some(self.types.add_fragment(expr))
                } else {
                    None
                };
                self.types.object_mut(object).fields.push(ObjectField {
                    name: f_name,
                    ty: f_ty,
                    default,
                });
                self.eat(&TokenKind::Comma);
            }
            if self.panicking {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RightBrace, "`}` after object body");

        self.declaring_object = prev_declaring;

        Some(Stmt {
            kind: StmtKind::ObjectDeclaration {
                object,
                slot: Slot::Global(slot),
                parent_slot,
                methods,
                static_inits,
            },
            span: start,
        })
    }

    // ── Enums ────────────────────────────────────────────────────────────────

    fn enum_declaration(&mut self) -> Option<Stmt> {
        let start = self.expect(&TokenKind::Enum, "`enum`");

        let underlying = if self.eat(&TokenKind::LeftParen) {
            let ty = self.parse_type();
            self.expect(&TokenKind::RightParen, "`)` after enum value type");
            if ty != self.types.t_int && ty != self.types.t_str {
                let span = self.current_span();
                self.type_error(span, "enum value type must be `int` or `str`");
                self.types.t_int
            } else {
                ty
            }
        } else {
            self.types.t_int
        };

        let (name, name_span) = self.expect_identifier("enum name");
        if !self.at_top_level() {
            self.type_error(name_span, "enums can only be declared at the top level");
        }

        self.expect(&TokenKind::LeftBrace, "`{` after enum name");
        let mut cases = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let (case, case_span) = self.expect_identifier("enum case name");
            if cases.contains(&case) {
                self.type_error(case_span, format!("duplicate enum case `{case}`"));
            }
            cases.push(case);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightBrace, "`}` after enum cases");

        if cases.is_empty() {
            self.type_error(name_span, format!("enum `{name}` has no cases"));
        }

        let def = self.types.add_enum(&name, underlying, cases);
        self.enum_names.insert(name.clone(), def);
        let enum_type = self.types.enum_def(def).enum_type;
        let slot = self.declare_global(&name, enum_type, true, false, name_span);

        Some(Stmt {
            kind: StmtKind::EnumDeclaration {
                def,
                slot: Slot::Global(slot),
            },
            span: start,
        })
    }

    // ── Tests ────────────────────────────────────────────────────────────────

    /// `test "name" { ... }` desugars to a hidden zero-argument function
    /// whose global name starts with `$test`.
    fn test_declaration(&mut self) -> Option<Stmt> {
        let start = self.expect(&TokenKind::Test, "`test`");
        if !self.at_top_level() {
            self.type_error(start, "tests can only be declared at the top level");
        }

        let display = match self.current().kind.clone() {
            TokenKind::Str(parts) => {
                self.advance();
                let mut text = String::new();
                for part in &parts {
                    match part {
                        StringPart::Lit(s) => text.push_str(s),
                        StringPart::Interp(_) => {
                            self.type_error(start, "test names cannot be interpolated");
                        }
                    }
                }
                text
            }
            _ => {
                let span = self.current_span();
                self.syntax_error(span, "expected a string after `test`");
                String::new()
            }
        };

        let index = self.test_counter;
        self.test_counter += 1;
        let fn_name = format!("$test#{index}");

        let fn_type = self.fn_type_of(&[], self.types.t_void, FnKind::Test);
        let slot = self.declare_global(&fn_name, fn_type, true, false, start);
        self.tests.push((slot, display));

        let decl = self.fun_body(
            fn_name,
            FnKind::Test,
            Vec::new(),
            self.types.t_void,
            Vec::new(),
            fn_type,
            start,
        );

        Some(Stmt {
            kind: StmtKind::FunDeclaration {
                decl: Box::new(decl),
                slot: Slot::Global(slot),
            },
            span: start,
        })
    }

    // ── Imports / exports ────────────────────────────────────────────────────

    fn import_declaration(&mut self) -> Option<Stmt> {
        let start = self.expect(&TokenKind::Import, "`import`");
        if !self.at_top_level() {
            self.type_error(start, "imports can only appear at the top level");
        }

        let path = match self.current().kind.clone() {
            TokenKind::Str(parts) => {
                self.advance();
                let mut text = String::new();
                for part in &parts {
                    match part {
                        StringPart::Lit(s) => text.push_str(s),
                        StringPart::Interp(_) => {
                            self.type_error(start, "import paths cannot be interpolated");
                        }
                    }
                }
                text
            }
            _ => {
                let span = self.current_span();
                self.syntax_error(span, "expected a path string after `import`");
                return None;
            }
        };

        let prefix = if self.eat(&TokenKind::As) {
            let (ns, _) = self.expect_identifier("namespace name");
            Some(ns)
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "`;` after import");

        let dir = self.module_dir.clone();
        let module = match modules::load_module(self.types, self.modules, &path, dir.as_deref()) {
            Ok(module) => module,
            Err(message) => {
                self.error_at(start, DiagKind::Resolution, message);
                return None;
            }
        };

        // Splice the module's exports into this unit's global table. The VM
        // writes the exported values contiguously from `dest_slot`, so each
        // name must land in a fresh slot: a pending forward reference would
        // adopt an earlier one and read `null` at runtime.
        let dest_slot = self.globals.len() as u32;
        let count = module.exports.len() as u32;
        for sym in &module.exports {
            let local_name = match &prefix {
                Some(p) => format!("{p}.{}", sym.name),
                None => sym.name.clone(),
            };
            if self.globals.iter().any(|g| g.name == local_name && !g.declared) {
                self.type_error(
                    start,
                    format!("`{local_name}` is used before this import declares it"),
                );
            }
            self.declare_global(&local_name, sym.ty, true, true, start);
        }
        if let Some(p) = prefix {
            self.namespaces.insert(p);
        }

        Some(Stmt {
            kind: StmtKind::Import {
                path,
                module,
                dest_slot,
                count,
            },
            span: start,
        })
    }

    fn export_declaration(&mut self) -> Option<Stmt> {
        let start = self.expect(&TokenKind::Export, "`export`");
        if !self.at_top_level() {
            self.type_error(start, "exports can only appear at the top level");
        }

        // `export name;` re-exports an existing global.
        if let TokenKind::Identifier(name) = self.current().kind.clone() {
            if self.peek_kind(1) == &TokenKind::Semicolon {
                let (name, name_span) = self.expect_identifier("exported name");
                self.expect(&TokenKind::Semicolon, "`;` after export");
                match self.globals.iter().rposition(|g| g.name == name && g.declared) {
                    Some(idx) => {
                        let ty = self.globals[idx].ty;
                        self.exports.push(ExportSym {
                            name,
                            ty,
                            slot: idx as u32,
                        });
                    }
                    None => {
                        self.error_at(
                            name_span,
                            DiagKind::Resolution,
                            format!("cannot export unknown symbol `{name}`"),
                        );
                    }
                }
                return Some(Stmt {
                    kind: StmtKind::Export { decl: None },
                    span: start,
                });
            }
            let _ = name;
        }

        // `export <declaration>` declares and exports in one step.
        let before = self.globals.len();
        let inner = self.declaration()?;
        // Whatever new top-level declared global appeared is the export.
        let exported: Vec<ExportSym> = self
            .globals
            .iter()
            .enumerate()
            .skip(before)
            .filter(|(_, g)| g.declared)
            .map(|(i, g)| ExportSym {
                name: g.name.clone(),
                ty: g.ty,
                slot: i as u32,
            })
            .collect();
        if exported.is_empty() {
            self.type_error(start, "`export` must precede a top-level declaration");
        }
        self.exports.extend(exported);

        Some(Stmt {
            kind: StmtKind::Export {
                decl: Some(Box::new(inner)),
            },
            span: start,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    fn statement(&mut self) -> Option<Stmt> {
        match self.current().kind {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Do => self.do_until_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::ForEach => self.foreach_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Throw => self.throw_statement(),
            TokenKind::LeftBrace => self.block_statement(),
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> Option<Stmt> {
        let expr = self.expression();
        let span = expr.span;
        self.expect(&TokenKind::Semicolon, "`;` after expression");
        Some(Stmt {
            kind: StmtKind::Expression(expr),
            span,
        })
    }

    fn condition(&mut self, what: &str) -> Expr {
        self.expect(&TokenKind::LeftParen, &format!("`(` after `{what}`"));
        let cond = self.expression();
        self.expect(&TokenKind::RightParen, "`)` after condition");
        if cond.ty != self.types.t_bool {
            let found = self.types.name_of(cond.ty);
            self.type_error(
                cond.span,
                format!("`{what}` condition must be `bool`, found `{found}`"),
            );
        }
        cond
    }

    /// Parse `{ stmt* }` in a fresh scope; returns the body and the slots
    /// its locals occupied.
    fn scoped_block(&mut self) -> (Vec<Stmt>, Vec<u8>) {
        self.expect(&TokenKind::LeftBrace, "`{`");
        self.begin_scope();
        let mut body = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if let Some(stmt) = self.declaration() {
                body.push(stmt);
            }
            if self.panicking {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RightBrace, "`}` after block");
        let slots = self.end_scope();
        (body, slots)
    }

    fn block_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        let (body, scope_slots) = self.scoped_block();
        Some(Stmt {
            kind: StmtKind::Block { body, scope_slots },
            span,
        })
    }

    fn if_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::If, "`if`");
        let condition = self.condition("if");
        let (then_branch, then_slots) = self.scoped_block();
        let (else_branch, else_slots) = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                let nested = self.if_statement()?;
                (Some(vec![nested]), Vec::new())
            } else {
                let (body, slots) = self.scoped_block();
                (Some(body), slots)
            }
        } else {
            (None, Vec::new())
        };
        Some(Stmt {
            kind: StmtKind::If {
                condition,
                then_branch,
                then_slots,
                else_branch,
                else_slots,
            },
            span,
        })
    }

    fn while_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::While, "`while`");
        let condition = self.condition("while");
        let depth = self.frame().scope_depth;
        self.loops.push(LoopInfo {
            break_depth: depth,
            continue_depth: depth,
        });
        let (body, scope_slots) = self.scoped_block();
        self.loops.pop();
        Some(Stmt {
            kind: StmtKind::While {
                condition,
                body,
                scope_slots,
            },
            span,
        })
    }

    fn do_until_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::Do, "`do`");
        let depth = self.frame().scope_depth;
        self.loops.push(LoopInfo {
            break_depth: depth,
            continue_depth: depth,
        });
        let (body, scope_slots) = self.scoped_block();
        self.loops.pop();
        self.expect(&TokenKind::Until, "`until` after `do` body");
        let condition = self.condition("until");
        self.expect(&TokenKind::Semicolon, "`;` after `until` condition");
        Some(Stmt {
            kind: StmtKind::DoUntil {
                body,
                scope_slots,
                condition,
            },
            span,
        })
    }

    fn for_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::For, "`for`");
        self.expect(&TokenKind::LeftParen, "`(` after `for`");

        // Header locals live in their own scope that wraps the body.
        self.begin_scope();
        let break_depth = self.frame().scope_depth - 1;

        let mut init = Vec::new();
        if !self.check(&TokenKind::Semicolon) {
            if self.looks_like_declaration() {
                // var_declaration consumes the `;`.
                if let Some(stmt) = self.var_declaration(false) {
                    init.push(stmt);
                }
            } else {
                let expr = self.expression();
                let span = expr.span;
                init.push(Stmt {
                    kind: StmtKind::Expression(expr),
                    span,
                });
                self.expect(&TokenKind::Semicolon, "`;` after `for` initializer");
            }
        } else {
            self.advance();
        }

        let condition = if self.check(&TokenKind::Semicolon) {
            Expr {
                kind: ExprKind::Boolean(true),
                ty: self.types.t_bool,
                span,
            }
        } else {
            let cond = self.expression();
            if cond.ty != self.types.t_bool {
                let found = self.types.name_of(cond.ty);
                self.type_error(
                    cond.span,
                    format!("`for` condition must be `bool`, found `{found}`"),
                );
            }
            cond
        };
        self.expect(&TokenKind::Semicolon, "`;` after `for` condition");

        let mut increment = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                increment.push(self.expression());
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen, "`)` after `for` clauses");

        self.loops.push(LoopInfo {
            break_depth,
            continue_depth: self.frame().scope_depth,
        });
        let (body, body_slots) = self.scoped_block();
        self.loops.pop();

        let init_slots = self.end_scope();

        Some(Stmt {
            kind: StmtKind::For {
                init,
                condition,
                increment,
                body,
                body_slots,
                init_slots,
            },
            span,
        })
    }

    fn foreach_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::ForEach, "`foreach`");
        self.expect(&TokenKind::LeftParen, "`(` after `foreach`");

        self.begin_scope();
        let break_depth = self.frame().scope_depth - 1;

        // One binding (value) or two (key, value).
        let first_ty = self.parse_type();
        let (first_name, first_span) = self.expect_identifier("loop variable");
        let second = if self.eat(&TokenKind::Comma) {
            let ty = self.parse_type();
            let (name, span) = self.expect_identifier("loop value variable");
            Some((ty, name, span))
        } else {
            None
        };

        self.expect(&TokenKind::In, "`in` before the iterated value");

        let iterable = self.expression();
        self.expect(&TokenKind::RightParen, "`)` after `foreach` header");

        // Infer key/value types from the iterable.
        let (key_inferred, value_inferred) = match self.types.get(iterable.ty).kind.clone() {
            TypeKind::List { item } => (self.types.t_int, item),
            TypeKind::Map { key, value } => (key, value),
            TypeKind::String => (self.types.t_int, self.types.t_str),
            TypeKind::Range => (self.types.t_int, self.types.t_int),
            TypeKind::Enum { def } => {
                let instance = self.types.enum_def(def).instance_type;
                (self.types.t_int, instance)
            }
            other => {
                if !matches!(other, TypeKind::Placeholder { .. }) {
                    let found = self.types.name_of(iterable.ty);
                    self.type_error(
                        iterable.span,
                        format!("`{found}` is not iterable"),
                    );
                }
                (self.types.t_int, self.types.t_any)
            }
        };

        let (key_ty, key_name, key_span, value_ty, value_name, value_span) = match second {
            Some((v_ty, v_name, v_span)) => {
                (first_ty, first_name, first_span, v_ty, v_name, v_span)
            }
            None => (
                key_inferred,
                String::new(),
                first_span,
                first_ty,
                first_name,
                first_span,
            ),
        };

        // The end-of-iteration `null` write to the key slot happens after the
        // body's last run, so the key stays non-optional inside the body.
        if !self.types.is_assignable(key_inferred, key_ty) && !key_name.is_empty() {
            let found = self.types.name_of(key_inferred);
            let wanted = self.types.name_of(key_ty);
            self.type_error(
                key_span,
                format!("foreach key is `{found}`, not `{wanted}`"),
            );
        }
        if !self.types.is_assignable(value_inferred, value_ty) {
            let found = self.types.name_of(value_inferred);
            let wanted = self.types.name_of(value_ty);
            self.type_error(
                value_span,
                format!("foreach value is `{found}`, not `{wanted}`"),
            );
        }

        let key_slot = self.declare_local(&key_name, key_ty, false, key_span);
        let value_slot = self.declare_local(&value_name, value_ty, false, value_span);
        // Hidden slot for the iterable itself (it stays on the stack for the
        // duration of the loop).
        self.declare_local("", iterable.ty, true, span);

        self.loops.push(LoopInfo {
            break_depth,
            continue_depth: self.frame().scope_depth,
        });
        let (body, body_slots) = self.scoped_block();
        self.loops.pop();

        // Discard key/value/iterable slots.
        self.end_scope();

        Some(Stmt {
            kind: StmtKind::ForEach {
                key_slot,
                key_ty,
                value_slot,
                value_ty,
                iterable,
                body,
                body_slots,
            },
            span,
        })
    }

    fn return_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::Return, "`return`");
        if matches!(
            self.frame().kind,
            FnKind::Script | FnKind::ScriptEntryPoint
        ) {
            self.type_error(span, "cannot `return` at the top level");
        }

        let value = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression())
        };
        self.expect(&TokenKind::Semicolon, "`;` after return");

        let ret = self.frame().ret;
        match &value {
            Some(v) => {
                if !self.types.is_assignable(v.ty, ret) {
                    let found = self.types.name_of(v.ty);
                    let wanted = self.types.name_of(ret);
                    self.type_error(
                        v.span,
                        format!("cannot return `{found}` from a function returning `{wanted}`"),
                    );
                }
            }
            None => {
                let def = self.types.get(ret);
                if def.kind != TypeKind::Void && !def.optional {
                    let wanted = self.types.name_of(ret);
                    self.type_error(span, format!("expected a `{wanted}` return value"));
                }
            }
        }

        Some(Stmt {
            kind: StmtKind::Return { value },
            span,
        })
    }

    fn break_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::Break, "`break`");
        self.expect(&TokenKind::Semicolon, "`;` after `break`");
        match self.loops.last() {
            Some(info) => {
                let scope_slots = self.slots_above_depth(info.break_depth);
                Some(Stmt {
                    kind: StmtKind::Break { scope_slots },
                    span,
                })
            }
            None => {
                self.type_error(span, "`break` outside of a loop");
                None
            }
        }
    }

    fn continue_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::Continue, "`continue`");
        self.expect(&TokenKind::Semicolon, "`;` after `continue`");
        match self.loops.last() {
            Some(info) => {
                let scope_slots = self.slots_above_depth(info.continue_depth);
                Some(Stmt {
                    kind: StmtKind::Continue { scope_slots },
                    span,
                })
            }
            None => {
                self.type_error(span, "`continue` outside of a loop");
                None
            }
        }
    }

    fn throw_statement(&mut self) -> Option<Stmt> {
        let span = self.expect(&TokenKind::Throw, "`throw`");
        let value = self.expression();
        self.expect(&TokenKind::Semicolon, "`;` after `throw`");
        Some(Stmt {
            kind: StmtKind::Throw { value },
            span,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expressions (Pratt)
    // ─────────────────────────────────────────────────────────────────────────

    fn expression(&mut self) -> Expr {
        self.parse_precedence(Prec::Assignment)
    }

    fn infix_precedence(kind: &TokenKind) -> Option<(Prec, BinaryOp)> {
        use BinaryOp::*;
        let entry = match kind {
            TokenKind::Or => (Prec::Or, Or),
            TokenKind::And => (Prec::And, And),
            TokenKind::EqualEqual => (Prec::Equality, Equal),
            TokenKind::BangEqual => (Prec::Equality, NotEqual),
            TokenKind::Less => (Prec::Comparison, Less),
            TokenKind::LessEqual => (Prec::Comparison, LessEqual),
            TokenKind::Greater => (Prec::Comparison, Greater),
            TokenKind::GreaterEqual => (Prec::Comparison, GreaterEqual),
            TokenKind::Pipe => (Prec::BitOr, BitOr),
            TokenKind::Caret => (Prec::BitXor, BitXor),
            TokenKind::Ampersand => (Prec::BitAnd, BitAnd),
            TokenKind::ShiftLeft => (Prec::Shift, ShiftLeft),
            TokenKind::ShiftRight => (Prec::Shift, ShiftRight),
            TokenKind::Plus => (Prec::Term, Add),
            TokenKind::Minus => (Prec::Term, Subtract),
            TokenKind::Star => (Prec::Factor, Multiply),
            TokenKind::Slash => (Prec::Factor, Divide),
            TokenKind::Percent => (Prec::Factor, Modulo),
            _ => return None,
        };
        Some(entry)
    }

    fn parse_precedence(&mut self, min: Prec) -> Expr {
        let mut lhs = self.unary();

        loop {
            // Assignment (right-associative, lowest).
            if self.check(&TokenKind::Equal) && min <= Prec::Assignment {
                let eq_span = self.advance().span;
                let value = self.expression();
                lhs = self.finish_assignment(lhs, value, eq_span);
                continue;
            }

            // `??`
            if self.check(&TokenKind::QuestionQuestion) && min <= Prec::NullOr {
                let op_span = self.advance().span;
                let rhs = self.parse_precedence(Prec::Equality);
                lhs = self.finish_null_or(lhs, rhs, op_span);
                continue;
            }

            // `is`
            if self.check(&TokenKind::Is) && min <= Prec::Comparison {
                let op_span = self.advance().span;
                let target = self.parse_type();
                let span = lhs.span.merge(op_span);
                lhs = Expr {
                    kind: ExprKind::Is {
                        value: Box::new(lhs),
                        target,
                    },
                    ty: self.types.t_bool,
                    span,
                };
                continue;
            }

            // `..`
            if self.check(&TokenKind::DotDot) && min <= Prec::Range {
                let op_span = self.advance().span;
                let rhs = self.parse_precedence(Prec::Term);
                lhs = self.finish_range(lhs, rhs, op_span);
                continue;
            }

            let Some((prec, op)) = Self::infix_precedence(&self.current().kind) else {
                break;
            };
            if prec < min {
                break;
            }
            let op_span = self.advance().span;
            // Left-associative: the RHS binds one level tighter.
            let next = match prec {
                Prec::Or => Prec::And,
                Prec::And => Prec::NullOr,
                Prec::Equality => Prec::Comparison,
                Prec::Comparison => Prec::BitOr,
                Prec::BitOr => Prec::BitXor,
                Prec::BitXor => Prec::BitAnd,
                Prec::BitAnd => Prec::Shift,
                Prec::Shift => Prec::Range,
                Prec::Term => Prec::Factor,
                Prec::Factor => Prec::Unary,
                _ => Prec::Unary,
            };
            let rhs = self.parse_precedence(next);
            lhs = self.finish_binary(lhs, op, rhs, op_span);
        }

        lhs
    }

    fn unary(&mut self) -> Expr {
        match self.current().kind {
            TokenKind::Minus => {
                let span = self.advance().span;
                let operand = self.parse_precedence(Prec::Unary);
                let ty = operand.ty;
                if ty != self.types.t_int && ty != self.types.t_float {
                    let found = self.types.name_of(ty);
                    self.type_error(span, format!("cannot negate `{found}`"));
                }
                Expr {
                    kind: ExprKind::Unary {
                        op: UnaryOp::Negate,
                        operand: Box::new(operand),
                    },
                    ty,
                    span,
                }
            }
            TokenKind::Bang => {
                let span = self.advance().span;
                let operand = self.parse_precedence(Prec::Unary);
                if operand.ty != self.types.t_bool {
                    let found = self.types.name_of(operand.ty);
                    self.type_error(span, format!("`!` expects `bool`, found `{found}`"));
                }
                let ty = self.types.t_bool;
                Expr {
                    kind: ExprKind::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(operand),
                    },
                    ty,
                    span,
                }
            }
            _ => self.postfix(),
        }
    }

    // ── Postfix chain: calls, members, subscripts, unwraps ───────────────────

    /// Parse a maximal postfix chain. A graceful unwrap (`x?`) anywhere in
    /// the chain short-circuits the *rest of the chain* to `null`, so a chain
    /// containing one produces an optional type; the code generator patches
    /// the unwrap jumps to the chain's end, where the chain occupies exactly
    /// one stack slot.
    fn postfix(&mut self) -> Expr {
        let mut expr = self.primary();
        let mut unwrapped = false;

        loop {
            match self.current().kind {
                TokenKind::LeftParen => {
                    expr = self.finish_call(expr);
                }
                TokenKind::Dot => {
                    self.advance();
                    let (member, m_span) = self.expect_identifier("member name");
                    expr = self.finish_dot(expr, member, m_span);
                    // Built-in container methods have no standalone value.
                    if matches!(
                        expr.kind,
                        ExprKind::Dot {
                            kind: DotKind::Builtin,
                            ..
                        }
                    ) && !self.check(&TokenKind::LeftParen)
                    {
                        self.type_error(m_span, "built-in methods must be called");
                    }
                }
                TokenKind::LeftBracket => {
                    let b_span = self.advance().span;
                    let index = self.expression();
                    self.expect(&TokenKind::RightBracket, "`]` after subscript");
                    expr = self.finish_subscript(expr, index, b_span);
                }
                TokenKind::Question => {
                    let span = self.advance().span;
                    let def = self.types.get(expr.ty);
                    if !def.optional {
                        let found = self.types.name_of(expr.ty);
                        self.type_error(span, format!("`{found}` is not optional"));
                    }
                    unwrapped = true;
                    let ty = self.types.non_optional_of(expr.ty);
                    expr = Expr {
                        kind: ExprKind::Unwrap {
                            operand: Box::new(expr),
                        },
                        ty,
                        span,
                    };
                }
                TokenKind::Bang => {
                    // Only treat `!` as force-unwrap when it reads as a
                    // postfix (no operand can follow on this token).
                    let span = self.current_span();
                    let def = self.types.get(expr.ty);
                    if !def.optional {
                        break;
                    }
                    self.advance();
                    let ty = self.types.non_optional_of(expr.ty);
                    expr = Expr {
                        kind: ExprKind::ForceUnwrap {
                            operand: Box::new(expr),
                        },
                        ty,
                        span,
                    };
                }
                _ => break,
            }
        }

        if unwrapped {
            expr.ty = self.types.optional_of(expr.ty);
        }
        expr
    }

    fn finish_assignment(&mut self, target: Expr, value: Expr, span: Span) -> Expr {
        // Validate the assignment target.
        let target_ty = match &target.kind {
            ExprKind::NamedVariable { name, slot } => {
                if self.is_constant_slot(name, slot) {
                    self.type_error(span, format!("cannot assign to constant `{name}`"));
                }
                target.ty
            }
            ExprKind::Subscript { target: base, .. } => {
                match self.types.get(base.ty).kind.clone() {
                    TypeKind::List { item } => item,
                    TypeKind::Map { value, .. } => value,
                    TypeKind::String => {
                        self.type_error(span, "strings are immutable");
                        self.types.t_any
                    }
                    _ => target.ty,
                }
            }
            ExprKind::Dot { kind, .. }
                if matches!(kind, DotKind::Field | DotKind::StaticField) =>
            {
                target.ty
            }
            _ => {
                self.type_error(span, "invalid assignment target");
                target.ty
            }
        };

        if !self.types.is_assignable(value.ty, target_ty) {
            let found = self.types.name_of(value.ty);
            let wanted = self.types.name_of(target_ty);
            self.type_error(value.span, format!("cannot assign `{found}` to `{wanted}`"));
        }

        let span = target.span.merge(value.span);
        Expr {
            kind: ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            ty: target_ty,
            span,
        }
    }

    fn finish_null_or(&mut self, lhs: Expr, rhs: Expr, span: Span) -> Expr {
        if !self.types.get(lhs.ty).optional {
            let found = self.types.name_of(lhs.ty);
            self.type_error(span, format!("`??` expects an optional, found `{found}`"));
        }
        let peer = self.types.non_optional_of(lhs.ty);
        if !self.types.is_assignable(rhs.ty, peer) {
            let found = self.types.name_of(rhs.ty);
            let wanted = self.types.name_of(peer);
            self.type_error(
                rhs.span,
                format!("`??` fallback of type `{found}` does not fit `{wanted}`"),
            );
        }
        let span = lhs.span.merge(rhs.span);
        Expr {
            kind: ExprKind::NullOr {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty: peer,
            span,
        }
    }

    fn finish_range(&mut self, low: Expr, high: Expr, span: Span) -> Expr {
        for part in [&low, &high] {
            if part.ty != self.types.t_int {
                let found = self.types.name_of(part.ty);
                self.type_error(part.span, format!("range bounds must be `int`, found `{found}`"));
            }
        }
        let span = low.span.merge(high.span).merge(span);
        Expr {
            kind: ExprKind::Range {
                low: Box::new(low),
                high: Box::new(high),
            },
            ty: self.types.t_range,
            span,
        }
    }

    fn finish_binary(&mut self, lhs: Expr, op: BinaryOp, rhs: Expr, op_span: Span) -> Expr {
        use BinaryOp::*;
        let t_int = self.types.t_int;
        let t_float = self.types.t_float;
        let t_bool = self.types.t_bool;
        let t_str = self.types.t_str;

        let lk = self.types.get(lhs.ty).kind.clone();
        let same = lhs.ty == rhs.ty;

        let ty = match op {
            And | Or => {
                if lhs.ty != t_bool || rhs.ty != t_bool {
                    self.type_error(op_span, "logical operators expect `bool` operands");
                }
                t_bool
            }
            Equal | NotEqual => {
                let comparable = same
                    || self.types.is_assignable(lhs.ty, rhs.ty)
                    || self.types.is_assignable(rhs.ty, lhs.ty);
                if !comparable {
                    let l = self.types.name_of(lhs.ty);
                    let r = self.types.name_of(rhs.ty);
                    self.type_error(op_span, format!("cannot compare `{l}` with `{r}`"));
                }
                t_bool
            }
            Less | LessEqual | Greater | GreaterEqual => {
                let numeric = (lhs.ty == t_int || lhs.ty == t_float) && same;
                if !numeric {
                    let l = self.types.name_of(lhs.ty);
                    let r = self.types.name_of(rhs.ty);
                    self.type_error(op_span, format!("cannot order `{l}` and `{r}`"));
                }
                t_bool
            }
            ShiftLeft | ShiftRight | BitAnd | BitXor | BitOr => {
                if lhs.ty != t_int || rhs.ty != t_int {
                    self.type_error(op_span, "bitwise operators expect `int` operands");
                }
                t_int
            }
            Add => {
                let ok = same
                    && (lhs.ty == t_int
                        || lhs.ty == t_float
                        || lhs.ty == t_str
                        || matches!(lk, TypeKind::List { .. } | TypeKind::Map { .. }));
                if !ok {
                    let l = self.types.name_of(lhs.ty);
                    let r = self.types.name_of(rhs.ty);
                    self.type_error(op_span, format!("cannot add `{l}` and `{r}`"));
                }
                lhs.ty
            }
            Subtract | Multiply | Divide | Modulo => {
                let ok = same && (lhs.ty == t_int || lhs.ty == t_float);
                if !ok {
                    let l = self.types.name_of(lhs.ty);
                    let r = self.types.name_of(rhs.ty);
                    self.type_error(op_span, format!("arithmetic needs matching numeric operands, found `{l}` and `{r}`"));
                }
                lhs.ty
            }
        };

        let span = lhs.span.merge(rhs.span);
        Expr {
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            span,
        }
    }

    fn finish_subscript(&mut self, target: Expr, index: Expr, span: Span) -> Expr {
        let t_int = self.types.t_int;
        let (result, index_wanted) = match self.types.get(target.ty).kind.clone() {
            TypeKind::List { item } => (self.types.optional_of(item), Some(t_int)),
            TypeKind::Map { key, value } => (self.types.optional_of(value), Some(key)),
            TypeKind::String => (self.types.optional_of(self.types.t_str), Some(t_int)),
            TypeKind::Placeholder { .. } => (self.types.t_any, None),
            _ => {
                let found = self.types.name_of(target.ty);
                self.type_error(span, format!("`{found}` cannot be subscripted"));
                (self.types.t_any, None)
            }
        };
        if let Some(wanted) = index_wanted {
            if !self.types.is_assignable(index.ty, wanted) {
                let found = self.types.name_of(index.ty);
                let want = self.types.name_of(wanted);
                self.type_error(
                    index.span,
                    format!("subscript index must be `{want}`, found `{found}`"),
                );
            }
        }
        let span = target.span.merge(span);
        Expr {
            kind: ExprKind::Subscript {
                target: Box::new(target),
                index: Box::new(index),
            },
            ty: result,
            span,
        }
    }

    // ── Member access ────────────────────────────────────────────────────────

    fn finish_dot(&mut self, target: Expr, member: String, span: Span) -> Expr {
        let target_def = self.types.get(target.ty).clone();
        if target_def.optional {
            let found = self.types.name_of(target.ty);
            self.type_error(
                span,
                format!("`{found}` must be unwrapped before accessing `{member}`"),
            );
        }

        let (kind, ty) = match target_def.kind {
            TypeKind::Instance { object } => {
                if let Some(field) = self.types.lookup_field(object, &member) {
                    (DotKind::Field, field.ty)
                } else if let Some(m) = self.types.lookup_method(object, &member) {
                    (DotKind::Method, m)
                } else if Some(object) == self.declaring_object {
                    // The object is mid-declaration; re-check once complete.
                    let result = self.defer_dot(target.ty, &member, span);
                    (DotKind::Field, result)
                } else {
                    let name = self.types.object(object).name.clone();
                    self.type_error(
                        span,
                        format!("`{member}` does not exist on `{name}`"),
                    );
                    (DotKind::Field, self.types.t_any)
                }
            }
            TypeKind::Object { object } => {
                let def = self.types.object(object);
                if let Some((_, ty)) = def.statics.iter().find(|(n, _)| n == &member) {
                    (DotKind::StaticField, *ty)
                } else {
                    let name = def.name.clone();
                    self.type_error(
                        span,
                        format!("`{name}` has no static field `{member}`"),
                    );
                    (DotKind::StaticField, self.types.t_any)
                }
            }
            TypeKind::Enum { def } => {
                let edef = self.types.enum_def(def);
                if let Some(idx) = edef.cases.iter().position(|c| c == &member) {
                    (DotKind::EnumCase(idx as u16), edef.instance_type)
                } else {
                    let name = edef.name.clone();
                    self.type_error(span, format!("`{name}` has no case `{member}`"));
                    (DotKind::EnumCase(0), self.types.t_any)
                }
            }
            TypeKind::EnumInstance { def } => {
                if member == "value" {
                    (DotKind::EnumValue, self.types.enum_def(def).underlying)
                } else {
                    self.type_error(
                        span,
                        format!("enum cases only expose `value`, not `{member}`"),
                    );
                    (DotKind::EnumValue, self.types.t_any)
                }
            }
            TypeKind::List { .. }
            | TypeKind::Map { .. }
            | TypeKind::String
            | TypeKind::Range => match self.builtin_method_type(target.ty, &member) {
                Some(m) => (DotKind::Builtin, m),
                None => {
                    let found = self.types.name_of(target.ty);
                    self.type_error(span, format!("`{found}` has no method `{member}`"));
                    (DotKind::Builtin, self.types.t_any)
                }
            },
            TypeKind::Placeholder { .. } => {
                let result = self.defer_dot(target.ty, &member, span);
                (DotKind::Field, result)
            }
            _ => {
                let found = self.types.name_of(target.ty);
                self.type_error(span, format!("`{found}` has no members"));
                (DotKind::Field, self.types.t_any)
            }
        };

        let span = target.span.merge(span);
        Expr {
            kind: ExprKind::Dot {
                target: Box::new(target),
                member,
                kind,
            },
            ty,
            span,
        }
    }

    fn defer_dot(&mut self, target: TypeId, member: &str, span: Span) -> TypeId {
        let name = format!("#dot{}", self.defer_counter);
        self.defer_counter += 1;
        let result = self.types.placeholder(&name);
        self.deferred.push(Deferred::Dot {
            target,
            member: member.to_string(),
            result: name,
            span,
        });
        result
    }

    /// The built-in method surface of container values, typed on demand.
    fn builtin_method_type(&mut self, recv: TypeId, name: &str) -> Option<TypeId> {
        let t_int = self.types.t_int;
        let t_void = self.types.t_void;
        let make = |parser: &mut Self, params: Vec<(String, TypeId)>, ret: TypeId| {
            let defaults = vec![None; params.len()];
            Some(parser.types.function_of(FunctionType {
                params,
                defaults,
                ret,
                kind: FnKind::Extern,
            }))
        };

        match self.types.get(recv).kind.clone() {
            TypeKind::List { item } => match name {
                "append" => make(self, vec![("value".into(), item)], t_void),
                "len" => make(self, vec![], t_int),
                "pop" => {
                    let ret = self.types.optional_of(item);
                    make(self, vec![], ret)
                }
                "remove" => {
                    let ret = self.types.optional_of(item);
                    make(self, vec![("at".into(), t_int)], ret)
                }
                _ => None,
            },
            TypeKind::Map { key, value } => match name {
                "size" => make(self, vec![], t_int),
                "remove" => {
                    let ret = self.types.optional_of(value);
                    make(self, vec![("at".into(), key)], ret)
                }
                "keys" => {
                    let ret = self.types.list_of(key);
                    make(self, vec![], ret)
                }
                "values" => {
                    let ret = self.types.list_of(value);
                    make(self, vec![], ret)
                }
                _ => None,
            },
            TypeKind::String => match name {
                "len" => make(self, vec![], t_int),
                _ => None,
            },
            TypeKind::Range => match name {
                "toList" => {
                    let ret = self.types.list_of(t_int);
                    make(self, vec![], ret)
                }
                "len" => make(self, vec![], t_int),
                "low" => make(self, vec![], t_int),
                "high" => make(self, vec![], t_int),
                _ => None,
            },
            _ => None,
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    fn finish_call(&mut self, callee: Expr) -> Expr {
        let paren = self.expect(&TokenKind::LeftParen, "`(`");

        // Raw arguments: positional or named (`name: expr`, `$: expr`).
        let mut raw: Vec<(Option<String>, Expr)> = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let name = match (&self.current().kind, self.peek_kind(1)) {
                    (TokenKind::Identifier(n), TokenKind::Colon) => {
                        let n = n.clone();
                        self.advance();
                        self.advance();
                        Some(n)
                    }
                    (TokenKind::Dollar, TokenKind::Colon) => {
                        self.advance();
                        self.advance();
                        Some("$".to_string())
                    }
                    _ => None,
                };
                let value = self.expression();
                raw.push((name, value));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen, "`)` after arguments");

        // Catch clauses attach at the call site.
        let mut catches = Vec::new();
        while self.check(&TokenKind::Catch) {
            self.advance();
            let mut handler = self.parse_precedence(Prec::Unary);
            if let ExprKind::Function(decl) = &mut handler.kind {
                decl.kind = FnKind::Catch;
            }
            catches.push(handler);
        }

        // `super.method(...)` dispatches through the parent chain.
        if matches!(callee.kind, ExprKind::Super { .. }) {
            return self.finish_super_call(callee, raw, catches, paren);
        }

        let callee_def = self.types.get(callee.ty).clone();
        let (args, result) = match callee_def.kind {
            TypeKind::Function(ft) => {
                let args = self.bind_arguments(&ft, raw, paren);
                (args, ft.ret)
            }
            TypeKind::Placeholder { .. } => {
                // Forward reference: positional-only, checked at the end.
                let mut args = Vec::new();
                for (name, value) in raw {
                    if name.is_some() {
                        self.type_error(
                            paren,
                            "named arguments need the callee declared first",
                        );
                    }
                    args.push(value);
                }
                let result_name = format!("#call{}", self.defer_counter);
                self.defer_counter += 1;
                let result = self.types.placeholder(&result_name);
                self.deferred.push(Deferred::Call {
                    callee: callee.ty,
                    args: args.iter().map(|a| a.ty).collect(),
                    result: result_name,
                    span: paren,
                });
                (args, result)
            }
            _ => {
                let found = self.types.name_of(callee.ty);
                self.type_error(paren, format!("`{found}` is not callable"));
                (raw.into_iter().map(|(_, v)| v).collect(), self.types.t_any)
            }
        };

        self.check_catches(&catches, result, paren);

        let span = callee.span.merge(paren);
        Expr {
            kind: ExprKind::Call {
                callee: Box::new(callee),
                args,
                catches,
            },
            ty: result,
            span,
        }
    }

    /// Bind raw arguments to the declared parameter order: positionals bind
    /// in declaration order, named arguments fill any remaining parameter
    /// (`$` names the first), and defaults are inlined for the rest.
    fn bind_arguments(
        &mut self,
        ft: &FunctionType,
        raw: Vec<(Option<String>, Expr)>,
        span: Span,
    ) -> Vec<Expr> {
        let mut bound: Vec<Option<Expr>> = (0..ft.params.len()).map(|_| None).collect();
        let mut positional = 0usize;
        let mut seen_named = false;

        for (name, value) in raw {
            match name {
                None => {
                    if seen_named {
                        self.type_error(
                            value.span,
                            "positional arguments cannot follow named arguments",
                        );
                    }
                    if positional >= ft.params.len() {
                        self.type_error(value.span, "too many arguments");
                        continue;
                    }
                    bound[positional] = Some(value);
                    positional += 1;
                }
                Some(arg_name) => {
                    seen_named = true;
                    let idx = if arg_name == "$" {
                        Some(0)
                    } else {
                        ft.params.iter().position(|(n, _)| n == &arg_name)
                    };
                    match idx {
                        Some(i) => {
                            if bound[i].is_some() {
                                self.type_error(
                                    value.span,
                                    format!("argument `{arg_name}` bound twice"),
                                );
                            }
                            bound[i] = Some(value);
                        }
                        None => {
                            self.type_error(
                                value.span,
                                format!("no parameter named `{arg_name}`"),
                            );
                        }
                    }
                }
            }
        }

        // Fill defaults; report what is still missing.
        let mut args = Vec::with_capacity(ft.params.len());
        for (i, slot) in bound.into_iter().enumerate() {
            let (pname, pty) = &ft.params[i];
            match slot {
                Some(value) => {
                    if !self.types.is_assignable(value.ty, *pty) {
                        let found = self.types.name_of(value.ty);
                        let wanted = self.types.name_of(*pty);
                        self.type_error(
                            value.span,
                            format!("argument `{pname}` expects `{wanted}`, found `{found}`"),
                        );
                    }
                    args.push(value);
                }
                None => match ft.defaults.get(i).copied().flatten() {
                    Some(fragment) => {
                        // Freshly evaluated at every call: the fragment is
                        // compiled inline at this call site.
                        args.push(self.types.fragment(fragment).clone());
                    }
                    None => {
                        self.type_error(span, format!("missing argument `{pname}`"));
                        let err = self.error_expr(span);
                        args.push(err);
                    }
                },
            }
        }
        args
    }

    fn check_catches(&mut self, catches: &[Expr], result: TypeId, span: Span) {
        for catch in catches {
            match self.types.get(catch.ty).kind.clone() {
                TypeKind::Function(ft) => {
                    if ft.params.len() != 1 {
                        self.type_error(
                            catch.span,
                            "catch clauses take exactly one parameter (the thrown value)",
                        );
                    }
                    if !matches!(self.types.get(result).kind, TypeKind::Placeholder { .. })
                        && !self.types.is_assignable(ft.ret, result)
                    {
                        let found = self.types.name_of(ft.ret);
                        let wanted = self.types.name_of(result);
                        self.type_error(
                            catch.span,
                            format!("catch result `{found}` does not fit call result `{wanted}`"),
                        );
                    }
                }
                _ => {
                    self.type_error(catch.span, "catch clause must be a function");
                    let _ = span;
                }
            }
        }
    }

    fn finish_super_call(
        &mut self,
        callee: Expr,
        raw: Vec<(Option<String>, Expr)>,
        catches: Vec<Expr>,
        span: Span,
    ) -> Expr {
        let method = match &callee.kind {
            ExprKind::Super { method, .. } => method.clone(),
            _ => unreachable!("finish_super_call on a non-super callee"),
        };
        let parent = self
            .frame()
            .object
            .and_then(|obj| self.types.object(obj).parent);
        let (args, result) = match parent.and_then(|p| self.types.lookup_method(p, &method)) {
            Some(m_ty) => match self.types.get(m_ty).kind.clone() {
                TypeKind::Function(ft) => {
                    let args = self.bind_arguments(&ft, raw, span);
                    (args, ft.ret)
                }
                _ => (Vec::new(), self.types.t_any),
            },
            None => {
                self.type_error(
                    callee.span,
                    format!("no method `{method}` on the parent object"),
                );
                (raw.into_iter().map(|(_, v)| v).collect(), self.types.t_any)
            }
        };

        self.check_catches(&catches, result, span);

        let super_span = callee.span;
        Expr {
            kind: ExprKind::Call {
                callee: Box::new(callee),
                args,
                catches,
            },
            ty: result,
            span: super_span.merge(span),
        }
    }

    // ── Primary ──────────────────────────────────────────────────────────────

    fn primary(&mut self) -> Expr {
        let span = self.current_span();
        match self.current().kind.clone() {
            TokenKind::Int(n) => {
                self.advance();
                Expr {
                    kind: ExprKind::Integer(n),
                    ty: self.types.t_int,
                    span,
                }
            }
            TokenKind::Float(f) => {
                self.advance();
                Expr {
                    kind: ExprKind::Float(f),
                    ty: self.types.t_float,
                    span,
                }
            }
            TokenKind::True => {
                self.advance();
                Expr {
                    kind: ExprKind::Boolean(true),
                    ty: self.types.t_bool,
                    span,
                }
            }
            TokenKind::False => {
                self.advance();
                Expr {
                    kind: ExprKind::Boolean(false),
                    ty: self.types.t_bool,
                    span,
                }
            }
            TokenKind::Null => {
                self.advance();
                Expr {
                    kind: ExprKind::Null,
                    ty: self.types.t_null,
                    span,
                }
            }
            TokenKind::Str(parts) => {
                self.advance();
                self.string_expression(parts, span)
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.expression();
                self.expect(&TokenKind::RightParen, "`)` after expression");
                inner
            }
            TokenKind::LeftBracket => self.list_literal(span),
            TokenKind::LeftBrace => self.map_literal(span),
            TokenKind::Fun => self.function_expression(),
            TokenKind::Identifier(name) => {
                self.advance();
                self.identifier_expression(name, span)
            }
            other => {
                self.syntax_error(span, format!("expected an expression, found {other}"));
                self.error_expr(span)
            }
        }
    }

    fn identifier_expression(&mut self, name: String, span: Span) -> Expr {
        // `super.method` — only meaningful inside a method with a parent.
        if name == "super" && self.check(&TokenKind::Dot) {
            let parent = self
                .frame()
                .object
                .and_then(|obj| self.types.object(obj).parent);
            if self.frame().object.is_none() {
                self.type_error(span, "`super` outside of a method");
            } else if parent.is_none() {
                self.type_error(span, "`super` in an object without a parent");
            }
            let parent_slot = match parent {
                Some(p) => {
                    let parent_name = self.types.object(p).name.clone();
                    Slot::Global(self.resolve_global(&parent_name, span))
                }
                None => Slot::Global(0),
            };
            self.advance();
            let (method, _) = self.expect_identifier("method name after `super.`");
            if !self.check(&TokenKind::LeftParen) {
                self.type_error(span, "`super` calls must be invoked directly");
            }
            return Expr {
                kind: ExprKind::Super {
                    method,
                    parent_slot,
                },
                ty: self.types.t_any,
                span,
            };
        }

        // Imported namespace: `ns.symbol` resolves to a prefixed global.
        if self.namespaces.contains(&name) && self.check(&TokenKind::Dot) {
            self.advance();
            let (sym, sym_span) = self.expect_identifier("imported symbol name");
            let full = format!("{name}.{sym}");
            return self.named_variable(&full, span.merge(sym_span));
        }

        // `Name{ ... }` instantiates a declared object.
        if self.check(&TokenKind::LeftBrace) {
            if let Some(&object) = self.object_names.get(&name) {
                return self.object_init(object, span);
            }
        }

        self.named_variable(&name, span)
    }

    fn object_init(&mut self, object: ObjTypeId, span: Span) -> Expr {
        self.expect(&TokenKind::LeftBrace, "`{`");
        let mut fields: Vec<(String, Expr)> = Vec::new();

        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let (f_name, f_span) = self.expect_identifier("field name");
            self.expect(&TokenKind::Equal, "`=` after field name");

            let field = self.types.lookup_field(object, &f_name);
            let prev_hint = self.type_hint.take();
            self.type_hint = field.as_ref().map(|f| f.ty);
            let value = self.expression();
            self.type_hint = prev_hint;

            match field {
                Some(f) => {
                    if !self.types.is_assignable(value.ty, f.ty) {
                        let found = self.types.name_of(value.ty);
                        let wanted = self.types.name_of(f.ty);
                        self.type_error(
                            value.span,
                            format!("field `{f_name}` expects `{wanted}`, found `{found}`"),
                        );
                    }
                }
                None if Some(object) == self.declaring_object => {
                    // Checked by the deferred init pass.
                }
                None => {
                    let obj_name = self.types.object(object).name.clone();
                    self.type_error(
                        f_span,
                        format!("`{obj_name}` has no field `{f_name}`"),
                    );
                }
            }
            if fields.iter().any(|(n, _)| n == &f_name) {
                self.type_error(f_span, format!("field `{f_name}` initialized twice"));
            }
            fields.push((f_name, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightBrace, "`}` after object fields");

        // Every field without a default must be provided.
        let provided: Vec<String> = fields.iter().map(|(n, _)| n.clone()).collect();
        if Some(object) == self.declaring_object {
            self.deferred.push(Deferred::Init {
                object,
                provided,
                span,
            });
        } else {
            self.check_init_coverage(object, &provided, span);
        }

        // The object value itself lives in a global slot.
        let obj_name = self.types.object(object).name.clone();
        let object_slot = Slot::Global(self.resolve_global(&obj_name, span));

        Expr {
            kind: ExprKind::ObjectInit {
                object,
                object_slot,
                fields,
            },
            ty: self.types.object(object).instance_type,
            span,
        }
    }

    fn check_init_coverage(&mut self, object: ObjTypeId, provided: &[String], span: Span) {
        // Walk the whole parent chain: inherited fields need values too.
        let mut missing = Vec::new();
        let mut cur = Some(object);
        while let Some(obj) = cur {
            let def = self.types.object(obj);
            for field in &def.fields {
                if field.default.is_none() && !provided.contains(&field.name) {
                    missing.push(field.name.clone());
                }
            }
            cur = def.parent;
        }
        for name in missing {
            self.type_error(span, format!("property `{name}` is not initialized"));
        }
    }

    // ── Literals ─────────────────────────────────────────────────────────────

    fn list_literal(&mut self, span: Span) -> Expr {
        self.expect(&TokenKind::LeftBracket, "`[`");
        let hint_item = self.type_hint.and_then(|h| match self.types.get(h).kind {
            TypeKind::List { item } => Some(item),
            _ => None,
        });

        let mut items = Vec::new();
        if !self.check(&TokenKind::RightBracket) {
            loop {
                let prev_hint = self.type_hint.take();
                self.type_hint = hint_item;
                let item = self.expression();
                self.type_hint = prev_hint;
                items.push(item);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightBracket, "`]` after list items");

        let item_ty = match items.first() {
            Some(first) => first.ty,
            None => hint_item.unwrap_or_else(|| {
                self.type_error(span, "cannot infer the item type of an empty list");
                self.types.t_any
            }),
        };
        for item in &items {
            if !self.types.is_assignable(item.ty, item_ty) {
                let found = self.types.name_of(item.ty);
                let wanted = self.types.name_of(item_ty);
                self.type_error(
                    item.span,
                    format!("list item of type `{found}` does not fit `[{wanted}]`"),
                );
            }
        }

        let ty = self.types.list_of(item_ty);
        Expr {
            kind: ExprKind::List { items },
            ty,
            span,
        }
    }

    fn map_literal(&mut self, span: Span) -> Expr {
        self.expect(&TokenKind::LeftBrace, "`{`");
        let hint = self.type_hint.and_then(|h| match self.types.get(h).kind {
            TypeKind::Map { key, value } => Some((key, value)),
            _ => None,
        });

        let mut entries = Vec::new();
        if !self.check(&TokenKind::RightBrace) {
            loop {
                let prev_hint = self.type_hint.take();
                self.type_hint = hint.map(|(k, _)| k);
                let key = self.expression();
                self.expect(&TokenKind::Colon, "`:` between map key and value");
                self.type_hint = hint.map(|(_, v)| v);
                let value = self.expression();
                self.type_hint = prev_hint;
                entries.push((key, value));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightBrace, "`}` after map entries");

        let (key_ty, value_ty) = match entries.first() {
            Some((k, v)) => (k.ty, v.ty),
            None => hint.unwrap_or_else(|| {
                self.type_error(span, "cannot infer the types of an empty map");
                (self.types.t_any, self.types.t_any)
            }),
        };
        self.check_map_key_type(key_ty);
        for (k, v) in &entries {
            if !self.types.is_assignable(k.ty, key_ty) {
                let found = self.types.name_of(k.ty);
                let wanted = self.types.name_of(key_ty);
                self.type_error(k.span, format!("map key `{found}` does not fit `{wanted}`"));
            }
            if !self.types.is_assignable(v.ty, value_ty) {
                let found = self.types.name_of(v.ty);
                let wanted = self.types.name_of(value_ty);
                self.type_error(
                    v.span,
                    format!("map value `{found}` does not fit `{wanted}`"),
                );
            }
        }

        let ty = self.types.map_of(key_ty, value_ty);
        Expr {
            kind: ExprKind::Map { entries },
            ty,
            span,
        }
    }

    /// Build a string expression from lexer parts; interpolation token
    /// streams are re-parsed in place by temporarily swapping the token
    /// stream, so interpolated expressions see the enclosing scope.
    fn string_expression(&mut self, parts: Vec<StringPart>, span: Span) -> Expr {
        let plain = parts
            .iter()
            .all(|p| matches!(p, StringPart::Lit(_)));
        if plain {
            let mut text = String::new();
            for part in parts {
                if let StringPart::Lit(s) = part {
                    text.push_str(&s);
                }
            }
            return Expr {
                kind: ExprKind::StringLit(text),
                ty: self.types.t_str,
                span,
            };
        }

        let mut segments = Vec::new();
        for part in parts {
            match part {
                StringPart::Lit(s) => segments.push(StringSegment::Lit(s)),
                StringPart::Interp(tokens) => {
                    let expr = self.parse_embedded(tokens, span);
                    segments.push(StringSegment::Expr(expr));
                }
            }
        }

        Expr {
            kind: ExprKind::String(segments),
            ty: self.types.t_str,
            span,
        }
    }

    /// Parse a nested token stream (an interpolation site) with the full
    /// parser state — locals and upvalues resolve as at the string's
    /// position.
    fn parse_embedded(&mut self, tokens: Vec<Token>, span: Span) -> Expr {
        if tokens.iter().all(|t| t.is_eof()) {
            self.syntax_error(span, "empty interpolation `{}` in string");
            return self.error_expr(span);
        }
        let saved_tokens = std::mem::replace(&mut self.tokens, tokens);
        let saved_pos = std::mem::replace(&mut self.pos, 0);
        let expr = self.expression();
        if !self.check(&TokenKind::Eof) {
            let at = self.current_span();
            self.syntax_error(span.merge(at), "unexpected tokens after interpolated expression");
        }
        self.tokens = saved_tokens;
        self.pos = saved_pos;
        expr
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deferred resolution
    // ─────────────────────────────────────────────────────────────────────────

    /// Re-check accesses recorded through then-unresolved types. Runs to a
    /// fixpoint because one resolution can unblock another (a call on the
    /// result of a deferred member access).
    fn resolve_deferred(&mut self) {
        let mut pending = std::mem::take(&mut self.deferred);
        let mut passes = pending.len() + 1;

        while passes > 0 && !pending.is_empty() {
            passes -= 1;
            let mut next = Vec::new();
            let mut progressed = false;

            for item in pending {
                match &item {
                    Deferred::Dot {
                        target,
                        member,
                        result,
                        span,
                    } => {
                        let kind = self.types.get(*target).kind.clone();
                        if matches!(kind, TypeKind::Placeholder { .. }) {
                            next.push(item);
                            continue;
                        }
                        progressed = true;
                        let resolved = self.member_type_of(&kind, member);
                        match resolved {
                            Some(ty) => {
                                self.types.resolve_placeholder_to(result, ty);
                            }
                            None => {
                                let found = self.types.name_of(*target);
                                self.type_error(
                                    *span,
                                    format!("`{member}` does not exist on `{found}`"),
                                );
                                let any = self.types.t_any;
                                self.types.resolve_placeholder_to(result, any);
                            }
                        }
                    }
                    Deferred::Call {
                        callee,
                        args,
                        result,
                        span,
                    } => {
                        let kind = self.types.get(*callee).kind.clone();
                        if matches!(kind, TypeKind::Placeholder { .. }) {
                            next.push(item);
                            continue;
                        }
                        progressed = true;
                        match kind {
                            TypeKind::Function(ft) => {
                                if args.len() != ft.params.len() {
                                    self.type_error(
                                        *span,
                                        format!(
                                            "expected {} arguments, found {}",
                                            ft.params.len(),
                                            args.len()
                                        ),
                                    );
                                }
                                for (arg, (pname, pty)) in args.iter().zip(ft.params.iter()) {
                                    if !self.types.is_assignable(*arg, *pty) {
                                        let found = self.types.name_of(*arg);
                                        let wanted = self.types.name_of(*pty);
                                        self.type_error(
                                            *span,
                                            format!(
                                                "argument `{pname}` expects `{wanted}`, found `{found}`"
                                            ),
                                        );
                                    }
                                }
                                self.types.resolve_placeholder_to(result, ft.ret);
                            }
                            _ => {
                                let found = self.types.name_of(*callee);
                                self.type_error(*span, format!("`{found}` is not callable"));
                                let any = self.types.t_any;
                                self.types.resolve_placeholder_to(result, any);
                            }
                        }
                    }
                    Deferred::Init {
                        object,
                        provided,
                        span,
                    } => {
                        progressed = true;
                        self.check_init_coverage(*object, provided, *span);
                    }
                }
            }

            pending = next;
            if !progressed {
                break;
            }
        }

        // Whatever is left points at types that never resolved; the generic
        // unknown-type diagnostics cover them.
    }

    fn member_type_of(&mut self, kind: &TypeKind, member: &str) -> Option<TypeId> {
        match kind {
            TypeKind::Instance { object } => self
                .types
                .lookup_field(*object, member)
                .map(|f| f.ty)
                .or_else(|| self.types.lookup_method(*object, member)),
            TypeKind::Object { object } => self
                .types
                .object(*object)
                .statics
                .iter()
                .find(|(n, _)| n == member)
                .map(|(_, t)| *t),
            TypeKind::Enum { def } => {
                let edef = self.types.enum_def(*def);
                edef.cases
                    .iter()
                    .any(|c| c == member)
                    .then_some(edef.instance_type)
            }
            TypeKind::EnumInstance { def } => {
                (member == "value").then(|| self.types.enum_def(*def).underlying)
            }
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AST walking helper (for fragment validation)
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn walk_children(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    match &expr.kind {
        ExprKind::Null
        | ExprKind::Boolean(_)
        | ExprKind::Integer(_)
        | ExprKind::Float(_)
        | ExprKind::StringLit(_)
        | ExprKind::NamedVariable { .. }
        | ExprKind::Super { .. }
        | ExprKind::Function(_) => {}
        ExprKind::String(segments) => {
            for seg in segments {
                if let StringSegment::Expr(e) = seg {
                    f(e);
                }
            }
        }
        ExprKind::List { items } => items.iter().for_each(f),
        ExprKind::Map { entries } => {
            for (k, v) in entries {
                f(k);
                f(v);
            }
        }
        ExprKind::Range { low, high } => {
            f(low);
            f(high);
        }
        ExprKind::Unary { operand, .. }
        | ExprKind::Unwrap { operand }
        | ExprKind::ForceUnwrap { operand } => f(operand),
        ExprKind::Binary { lhs, rhs, .. } | ExprKind::NullOr { lhs, rhs } => {
            f(lhs);
            f(rhs);
        }
        ExprKind::Is { value, .. } => f(value),
        ExprKind::Subscript { target, index } => {
            f(target);
            f(index);
        }
        ExprKind::Dot { target, .. } => f(target),
        ExprKind::ObjectInit { fields, .. } => {
            for (_, v) in fields {
                f(v);
            }
        }
        ExprKind::Call {
            callee,
            args,
            catches,
        } => {
            f(callee);
            args.iter().for_each(&mut *f);
            catches.iter().for_each(f);
        }
        ExprKind::Assign { target, value } => {
            f(target);
            f(value);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn try_parse(src: &str) -> (Option<Program>, Vec<ParseError>, TypeRegistry) {
        let mut types = TypeRegistry::new();
        let mut modules = ModuleRegistry::new();
        let (tokens, lex_errors) = crate::lexer::lex(src);
        assert!(lex_errors.is_empty(), "lex errors: {lex_errors:?}");
        let (program, errors) = parse(tokens, &mut types, &mut modules, "<test>", None, true);
        (program, errors, types)
    }

    fn parse_ok(src: &str) -> (Program, TypeRegistry) {
        let (program, errors, types) = try_parse(src);
        let program = program.unwrap_or_else(|| panic!("unexpected errors: {errors:?}"));
        (program, types)
    }

    fn first_error(src: &str) -> ParseError {
        let (program, errors, _) = try_parse(src);
        assert!(program.is_none(), "expected errors for: {src}");
        errors.into_iter().next().expect("at least one error")
    }

    /// Walk every expression of a program, asserting the typed-AST invariant:
    /// no node keeps a placeholder type after a successful parse.
    fn assert_fully_typed(program: &Program, types: &TypeRegistry) {
        fn walk_stmts(stmts: &[Stmt], f: &mut impl FnMut(&Expr)) {
            for stmt in stmts {
                match &stmt.kind {
                    StmtKind::VarDeclaration { value, .. } => {
                        if let Some(v) = value {
                            visit(v, f);
                        }
                    }
                    StmtKind::FunDeclaration { decl, .. } => walk_stmts(&decl.body, f),
                    StmtKind::ObjectDeclaration {
                        methods,
                        static_inits,
                        ..
                    } => {
                        for m in methods {
                            walk_stmts(&m.body, f);
                        }
                        for (_, v) in static_inits {
                            visit(v, f);
                        }
                    }
                    StmtKind::EnumDeclaration { .. } => {}
                    StmtKind::Expression(e) | StmtKind::Throw { value: e } => visit(e, f),
                    StmtKind::Block { body, .. } => walk_stmts(body, f),
                    StmtKind::If {
                        condition,
                        then_branch,
                        else_branch,
                        ..
                    } => {
                        visit(condition, f);
                        walk_stmts(then_branch, f);
                        if let Some(e) = else_branch {
                            walk_stmts(e, f);
                        }
                    }
                    StmtKind::While {
                        condition, body, ..
                    }
                    | StmtKind::DoUntil {
                        condition, body, ..
                    } => {
                        visit(condition, f);
                        walk_stmts(body, f);
                    }
                    StmtKind::For {
                        init,
                        condition,
                        increment,
                        body,
                        ..
                    } => {
                        walk_stmts(init, f);
                        visit(condition, f);
                        for inc in increment {
                            visit(inc, f);
                        }
                        walk_stmts(body, f);
                    }
                    StmtKind::ForEach {
                        iterable, body, ..
                    } => {
                        visit(iterable, f);
                        walk_stmts(body, f);
                    }
                    StmtKind::Return { value } => {
                        if let Some(v) = value {
                            visit(v, f);
                        }
                    }
                    StmtKind::Break { .. } | StmtKind::Continue { .. } => {}
                    StmtKind::Import { .. } => {}
                    StmtKind::Export { decl } => {
                        if let Some(inner) = decl {
                            walk_stmts(std::slice::from_ref(&**inner), f);
                        }
                    }
                }
            }
        }

        fn visit(expr: &Expr, f: &mut impl FnMut(&Expr)) {
            f(expr);
            if let ExprKind::Function(decl) = &expr.kind {
                walk_stmts(&decl.body, f);
            }
            walk_children(expr, &mut |child| visit(child, f));
        }

        walk_stmts(&program.script.body, &mut |expr| {
            assert!(
                !matches!(types.get(expr.ty).kind, TypeKind::Placeholder { .. }),
                "expression at {} kept a placeholder type",
                expr.span
            );
        });
    }

    #[test]
    fn test_literals_are_typed() {
        let (program, types) = parse_ok(r#"int a = 1; float b = 1.5; str c = "x"; bool d = true;"#);
        assert_fully_typed(&program, &types);
        assert_eq!(program.globals_count as usize, natives::all().len() + 4);
    }

    #[test]
    fn test_condition_must_be_bool() {
        let err = first_error("if (1) { }");
        assert_eq!(err.kind, DiagKind::Type);
        assert!(err.message.contains("must be `bool`"));
    }

    #[test]
    fn test_assignment_type_mismatch() {
        let err = first_error(r#"int x = "nope";"#);
        assert_eq!(err.kind, DiagKind::Type);
    }

    #[test]
    fn test_const_cannot_be_reassigned() {
        let err = first_error("const x = 1; x = 2;");
        assert!(err.message.contains("constant"));
    }

    #[test]
    fn test_unknown_type_reported_at_end() {
        let err = first_error("Ghost g = null;");
        assert_eq!(err.kind, DiagKind::Resolution);
        assert!(err.message.contains("Unknown type `Ghost`"));
    }

    #[test]
    fn test_unknown_symbol_reported_at_end() {
        let err = first_error("int x = mystery;");
        assert_eq!(err.kind, DiagKind::Resolution);
        assert!(err.message.contains("mystery"));
    }

    #[test]
    fn test_forward_function_reference_resolves() {
        let (program, types) = parse_ok(
            r#"
            fun a(int n) > int { if (n == 0) { return 0; } return b(n - 1); }
            fun b(int n) > int { if (n == 0) { return 1; } return a(n - 1); }
            "#,
        );
        assert_fully_typed(&program, &types);
    }

    #[test]
    fn test_forward_object_type_resolves_in_place() {
        let (program, types) = parse_ok(
            r#"
            object Tree {
                Tree? left = null
                Tree? right = null
                int value = 0
            }
            Tree t = Tree{};
            "#,
        );
        assert_fully_typed(&program, &types);
    }

    #[test]
    fn test_missing_field_initializer_is_an_error() {
        let err = first_error("object P { int x } P p = P{};");
        assert!(err.message.contains("not initialized"));
    }

    #[test]
    fn test_named_arguments_reorder_to_declaration_order() {
        let (program, types) = parse_ok(
            r#"
            fun pair(int first, int second) > int { return first - second; }
            int r = pair(second: 2, first: 10);
            "#,
        );
        assert_fully_typed(&program, &types);
    }

    #[test]
    fn test_unknown_named_argument_is_an_error() {
        let err = first_error(
            r#"
            fun f(int a) > int { return a; }
            int r = f(b: 1);
            "#,
        );
        assert!(err.message.contains("no parameter named"));
    }

    #[test]
    fn test_missing_argument_without_default_is_an_error() {
        let err = first_error(
            r#"
            fun f(int a, int b) > int { return a + b; }
            int r = f(1);
            "#,
        );
        assert!(err.message.contains("missing argument"));
    }

    #[test]
    fn test_default_values_may_not_capture_locals() {
        let err = first_error(
            r#"
            fun outer() > void {
                int captured = 1;
                fun inner(int x = captured) > int { return x; }
            }
            "#,
        );
        assert!(err.message.contains("literals and globals"));
    }

    #[test]
    fn test_unwrapped_chain_is_optional_at_the_boundary() {
        let (program, types) = parse_ok(
            r#"
            int? maybe = 3;
            int? through = maybe?;
            "#,
        );
        assert_fully_typed(&program, &types);
        let err = first_error(
            r#"
            int? maybe = 3;
            int direct = maybe?;
            "#,
        );
        assert!(err.message.contains("cannot assign"));
    }

    #[test]
    fn test_null_coalescing_requires_an_optional() {
        let err = first_error("int x = 1 ?? 2;");
        assert!(err.message.contains("expects an optional"));
    }

    #[test]
    fn test_closures_resolve_upvalues() {
        let (program, _) = parse_ok(
            r#"
            fun counter() > fun() > int {
                int n = 0;
                fun bump() > int { n = n + 1; return n; }
                return bump;
            }
            "#,
        );
        // Find `counter` and its nested `bump` declaration.
        let counter = program
            .script
            .body
            .iter()
            .find_map(|s| match &s.kind {
                StmtKind::FunDeclaration { decl, .. } if decl.name == "counter" => Some(decl),
                _ => None,
            })
            .expect("counter decl");
        let bump = counter
            .body
            .iter()
            .find_map(|s| match &s.kind {
                StmtKind::FunDeclaration { decl, .. } if decl.name == "bump" => Some(decl),
                _ => None,
            })
            .expect("bump decl");
        assert_eq!(bump.upvalues.len(), 1);
        assert!(bump.upvalues[0].is_local);
        assert!(counter.captured.contains(&bump.upvalues[0].index));
    }

    #[test]
    fn test_break_outside_loop_is_an_error() {
        let err = first_error("break;");
        assert!(err.message.contains("outside of a loop"));
    }

    #[test]
    fn test_test_blocks_register_in_order() {
        let (program, _) = parse_ok(
            r#"
            test "first" { assert(true); }
            test "second" { assert(true); }
            "#,
        );
        let names: Vec<&str> = program.tests.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_main_is_detected() {
        let (program, _) = parse_ok("fun main() > void { }");
        assert!(program.main_slot.is_some());
        assert_eq!(program.script.kind, FnKind::ScriptEntryPoint);
    }

    #[test]
    fn test_enum_cases_and_value_access() {
        let (program, types) = parse_ok(
            r#"
            enum(str) Color { red, green, blue }
            Color c = Color.green;
            str v = c.value;
            "#,
        );
        assert_fully_typed(&program, &types);
    }
}
