//! AST-to-bytecode code generator for the Buzz language.
//!
//! The generator performs a single-pass walk of a typed [`Program`] and emits
//! instruction words into per-function [`Chunk`]s. Name resolution already
//! happened in the parser — every variable reference carries its [`Slot`] and
//! every function its upvalue descriptors — so lowering is mostly mechanical:
//! jump patching, loop bookkeeping, default-fragment inlining, and the
//! optional-chaining coda.
//!
//! # Jumps
//!
//! Forward jumps are emitted with a placeholder target, recorded, and patched
//! when the target offset is known. `break` and `continue` collect in a
//! per-loop list and are patched at loop end. Graceful unwraps (`x?`) emit a
//! test-null-and-skip jump whose target is the nearest expression boundary —
//! the operand or statement-level expression containing the chain, where the
//! chain occupies exactly one stack slot. The generator keeps a stack of
//! pending unwrap-jump lists and patches each when its boundary completes.
//!
//! # Entry points
//!
//! For the top-level script the generator appends the entry sequence: in run
//! mode a call to `main` (when declared); in test mode one call per
//! `$test`-prefixed function followed by a check-marked report line. Module
//! scripts append their `EXPORT` sequence instead.

use std::rc::Rc;

use crate::ast::*;
use crate::bytecode::{Chunk, Constant, FnProto, OpCode};
use crate::token::Span;
use crate::types::TypeRegistry;

// ─────────────────────────────────────────────────────────────────────────────
// Errors and modes
// ─────────────────────────────────────────────────────────────────────────────

/// An emitter-stage error (limits exceeded, malformed lowering input).
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
}

/// How the top-level script's entry sequence is synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Call `main` after the script body, when declared.
    Run,
    /// Call every top-level `$test` function and report each.
    Test,
}

/// Lower a program in [`RunMode::Run`].
pub fn generate(
    program: &Program,
    types: &TypeRegistry,
) -> Result<Rc<FnProto>, Vec<CompileError>> {
    generate_with_mode(program, types, RunMode::Run)
}

/// Lower a program with an explicit entry mode.
pub fn generate_with_mode(
    program: &Program,
    types: &TypeRegistry,
    mode: RunMode,
) -> Result<Rc<FnProto>, Vec<CompileError>> {
    let mut generator = Generator {
        types,
        mode,
        errors: Vec::new(),
    };
    let proto = generator.compile_fn(&program.script, Some(program));
    if generator.errors.is_empty() {
        Ok(Rc::new(proto))
    } else {
        Err(generator.errors)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generator
// ─────────────────────────────────────────────────────────────────────────────

/// Loop bookkeeping: where `continue` goes and which forward jumps are
/// waiting for the loop to end.
struct LoopFrame {
    /// `continue` target when it is a back-jump (`while`, `foreach`);
    /// `for` / `do-until` patch forward instead.
    continue_target: Option<usize>,
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
}

/// Per-function emission state.
struct FnCtx<'d> {
    decl: &'d FnDecl,
    chunk: Chunk,
    loops: Vec<LoopFrame>,
    /// Stack of pending `Unwrap` jumps, one list per open expression root.
    opt_jumps: Vec<Vec<usize>>,
}

struct Generator<'t> {
    types: &'t TypeRegistry,
    mode: RunMode,
    errors: Vec<CompileError>,
}

impl<'t> Generator<'t> {
    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.errors.push(CompileError {
            message: message.into(),
            span,
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Functions
    // ─────────────────────────────────────────────────────────────────────────

    /// Compile one function declaration to a prototype. `script` is present
    /// only for the module body and drives the entry/export epilogue.
    fn compile_fn(&mut self, decl: &FnDecl, script: Option<&Program>) -> FnProto {
        let mut ctx = FnCtx {
            decl,
            chunk: Chunk::new(),
            loops: Vec::new(),
            opt_jumps: Vec::new(),
        };

        for stmt in &decl.body {
            self.stmt(&mut ctx, stmt);
        }

        let line = ctx.chunk.lines.last().copied().unwrap_or(0);
        if let Some(program) = script {
            self.script_epilogue(&mut ctx, program, line);
        }

        // Implicit void return; unreachable after an explicit `return`.
        ctx.chunk.emit(OpCode::Void, 0, line);
        ctx.chunk.emit(OpCode::Return, 0, line);

        FnProto {
            name: decl.name.clone(),
            kind: decl.kind,
            arity: decl.params.len() as u8,
            upvalue_count: decl.upvalues.len() as u8,
            globals_count: script.map(|p| p.globals_count).unwrap_or(0),
            fn_type: decl.fn_type,
            chunk: ctx.chunk,
        }
    }

    fn script_epilogue(&mut self, ctx: &mut FnCtx, program: &Program, line: u32) {
        match self.mode {
            RunMode::Run => {
                if let Some(main) = program.main_slot {
                    ctx.chunk.emit(OpCode::GetGlobal, main, line);
                    ctx.chunk.emit(OpCode::Call, 0, line);
                    ctx.chunk.emit_word(0, line);
                    ctx.chunk.emit(OpCode::Pop, 0, line);
                }
            }
            RunMode::Test => {
                // `print` is native slot 0 by construction.
                for (slot, name) in &program.tests {
                    ctx.chunk.emit(OpCode::GetGlobal, *slot, line);
                    ctx.chunk.emit(OpCode::Call, 0, line);
                    ctx.chunk.emit_word(0, line);
                    ctx.chunk.emit(OpCode::Pop, 0, line);

                    ctx.chunk.emit(OpCode::GetGlobal, 0, line);
                    let text = ctx.chunk.add_str(format!("\u{2713} {name}"));
                    ctx.chunk.emit(OpCode::Constant, text, line);
                    ctx.chunk.emit(OpCode::Call, 1, line);
                    ctx.chunk.emit_word(0, line);
                    ctx.chunk.emit(OpCode::Pop, 0, line);
                }
            }
        }

        if !program.exports.is_empty() {
            for sym in &program.exports {
                ctx.chunk.emit(OpCode::GetGlobal, sym.slot, line);
            }
            ctx.chunk
                .emit(OpCode::Export, program.exports.len() as u32, line);
        }
    }

    /// Compile a nested function and emit the `Closure` sequence for it.
    fn emit_closure(&mut self, ctx: &mut FnCtx, decl: &FnDecl, line: u32) {
        let proto = self.compile_fn(decl, None);
        let idx = ctx
            .chunk
            .add_constant(Constant::Function(Rc::new(proto)));
        ctx.chunk.emit(OpCode::Closure, idx, line);
        for upvalue in &decl.upvalues {
            let word = ((upvalue.is_local as u32) << 8) | upvalue.index as u32;
            ctx.chunk.emit_word(word, line);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    fn stmt(&mut self, ctx: &mut FnCtx, stmt: &Stmt) {
        let line = stmt.span.line;
        match &stmt.kind {
            StmtKind::VarDeclaration {
                slot, value, ty, ..
            } => {
                match value {
                    Some(v) => self.expr_root(ctx, v),
                    None => {
                        // Only optionals may omit the initializer.
                        let _ = ty;
                        ctx.chunk.emit(OpCode::Null, 0, line);
                    }
                }
                match slot {
                    Slot::Global(i) => ctx.chunk.emit(OpCode::DefineGlobal, *i, line),
                    // Locals live where their initializer landed.
                    Slot::Local(_) => {}
                    Slot::UpValue(_) => {
                        self.error(stmt.span, "declaration resolved to an upvalue");
                    }
                }
            }

            StmtKind::FunDeclaration { decl, slot } => {
                self.emit_closure(ctx, decl, line);
                match slot {
                    Slot::Global(i) => ctx.chunk.emit(OpCode::DefineGlobal, *i, line),
                    Slot::Local(_) => {}
                    Slot::UpValue(_) => {
                        self.error(stmt.span, "function resolved to an upvalue");
                    }
                }
            }

            StmtKind::ObjectDeclaration {
                object,
                slot,
                parent_slot,
                methods,
                static_inits,
            } => {
                let def = self.types.object(*object);
                let name_idx = ctx.chunk.add_str(def.name.clone());
                let type_idx = ctx
                    .chunk
                    .add_constant(Constant::Type(def.instance_type));
                ctx.chunk.emit(OpCode::Object, name_idx, line);
                ctx.chunk.emit_word(type_idx, line);

                if let Some(Slot::Global(parent)) = parent_slot {
                    ctx.chunk.emit(OpCode::GetGlobal, *parent, line);
                    ctx.chunk.emit(OpCode::Inherit, 0, line);
                }

                for method in methods {
                    self.emit_closure(ctx, method, method.span.line);
                    let m_idx = ctx.chunk.add_str(method.name.clone());
                    ctx.chunk.emit(OpCode::Method, m_idx, method.span.line);
                }

                for (name, value) in static_inits {
                    self.expr_root(ctx, value);
                    let s_idx = ctx.chunk.add_str(name.clone());
                    ctx.chunk.emit(OpCode::Property, s_idx, value.span.line);
                }

                match slot {
                    Slot::Global(i) => ctx.chunk.emit(OpCode::DefineGlobal, *i, line),
                    _ => self.error(stmt.span, "object declaration must bind a global"),
                }
            }

            StmtKind::EnumDeclaration { def, slot } => {
                let edef = self.types.enum_def(*def);
                let name_idx = ctx.chunk.add_str(edef.name.clone());
                let type_idx = ctx
                    .chunk
                    .add_constant(Constant::Type(edef.instance_type));
                let is_str = edef.underlying == self.types.t_str;
                let cases = edef.cases.clone();
                ctx.chunk.emit(OpCode::Enum, name_idx, line);
                ctx.chunk.emit_word(type_idx, line);

                for (i, case) in cases.iter().enumerate() {
                    let value = if is_str {
                        Constant::Str(case.clone())
                    } else {
                        Constant::Int(i as i32)
                    };
                    ctx.chunk.emit_constant(value, line);
                    let c_idx = ctx.chunk.add_str(case.clone());
                    ctx.chunk.emit(OpCode::EnumCase, c_idx, line);
                }

                match slot {
                    Slot::Global(i) => ctx.chunk.emit(OpCode::DefineGlobal, *i, line),
                    _ => self.error(stmt.span, "enum declaration must bind a global"),
                }
            }

            StmtKind::Expression(expr) => {
                self.expr_root(ctx, expr);
                ctx.chunk.emit(OpCode::Pop, 0, line);
            }

            StmtKind::Block { body, scope_slots } => {
                for inner in body {
                    self.stmt(ctx, inner);
                }
                self.discard_slots(ctx, scope_slots, line);
            }

            StmtKind::If {
                condition,
                then_branch,
                then_slots,
                else_branch,
                else_slots,
            } => {
                self.expr_root(ctx, condition);
                let to_else = ctx.chunk.emit_jump(OpCode::JumpIfFalse, line);
                ctx.chunk.emit(OpCode::Pop, 0, line);
                for inner in then_branch {
                    self.stmt(ctx, inner);
                }
                self.discard_slots(ctx, then_slots, line);
                let to_end = ctx.chunk.emit_jump(OpCode::Jump, line);
                ctx.chunk.patch_jump(to_else);
                ctx.chunk.emit(OpCode::Pop, 0, line);
                if let Some(else_branch) = else_branch {
                    for inner in else_branch {
                        self.stmt(ctx, inner);
                    }
                    self.discard_slots(ctx, else_slots, line);
                }
                ctx.chunk.patch_jump(to_end);
            }

            StmtKind::While {
                condition,
                body,
                scope_slots,
            } => {
                let start = ctx.chunk.current_offset();
                ctx.loops.push(LoopFrame {
                    continue_target: Some(start),
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                });

                self.expr_root(ctx, condition);
                let exit = ctx.chunk.emit_jump(OpCode::JumpIfFalse, line);
                ctx.chunk.emit(OpCode::Pop, 0, line);
                for inner in body {
                    self.stmt(ctx, inner);
                }
                self.discard_slots(ctx, scope_slots, line);
                ctx.chunk.emit_loop(start, line);
                ctx.chunk.patch_jump(exit);
                ctx.chunk.emit(OpCode::Pop, 0, line);

                self.finish_loop(ctx);
            }

            StmtKind::DoUntil {
                body,
                scope_slots,
                condition,
            } => {
                let start = ctx.chunk.current_offset();
                ctx.loops.push(LoopFrame {
                    continue_target: None,
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                });

                for inner in body {
                    self.stmt(ctx, inner);
                }
                self.discard_slots(ctx, scope_slots, line);

                // `continue` lands on the condition re-evaluation.
                let cont = ctx.chunk.current_offset();
                let continues = std::mem::take(&mut ctx.loops.last_mut().unwrap().continue_patches);
                for patch in continues {
                    ctx.chunk.patch_jump_to(patch, cont);
                }

                self.expr_root(ctx, condition);
                ctx.chunk.emit(OpCode::Not, 0, line);
                let exit = ctx.chunk.emit_jump(OpCode::JumpIfFalse, line);
                ctx.chunk.emit(OpCode::Pop, 0, line);
                ctx.chunk.emit_loop(start, line);
                ctx.chunk.patch_jump(exit);
                ctx.chunk.emit(OpCode::Pop, 0, line);

                self.finish_loop(ctx);
            }

            StmtKind::For {
                init,
                condition,
                increment,
                body,
                body_slots,
                init_slots,
            } => {
                for inner in init {
                    self.stmt(ctx, inner);
                }
                let start = ctx.chunk.current_offset();
                ctx.loops.push(LoopFrame {
                    continue_target: None,
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                });

                self.expr_root(ctx, condition);
                let exit = ctx.chunk.emit_jump(OpCode::JumpIfFalse, line);
                ctx.chunk.emit(OpCode::Pop, 0, line);
                for inner in body {
                    self.stmt(ctx, inner);
                }
                self.discard_slots(ctx, body_slots, line);

                // `continue` lands on the increment clauses.
                let cont = ctx.chunk.current_offset();
                let continues = std::mem::take(&mut ctx.loops.last_mut().unwrap().continue_patches);
                for patch in continues {
                    ctx.chunk.patch_jump_to(patch, cont);
                }
                for inc in increment {
                    self.expr_root(ctx, inc);
                    ctx.chunk.emit(OpCode::Pop, 0, inc.span.line);
                }
                ctx.chunk.emit_loop(start, line);
                ctx.chunk.patch_jump(exit);
                ctx.chunk.emit(OpCode::Pop, 0, line);

                // Header locals die before the break target: `break` discards
                // its own copy of them and jumps past this cleanup.
                self.discard_slots(ctx, init_slots, line);
                self.finish_loop(ctx);
            }

            StmtKind::ForEach {
                key_slot,
                value_slot,
                iterable,
                body,
                body_slots,
                ..
            } => {
                // Key and value locals, then the iterable on top.
                ctx.chunk.emit(OpCode::Null, 0, line);
                ctx.chunk.emit(OpCode::Null, 0, line);
                self.expr_root(ctx, iterable);

                let start = ctx.chunk.current_offset();
                ctx.loops.push(LoopFrame {
                    continue_target: Some(start),
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                });

                ctx.chunk.emit(OpCode::Foreach, *key_slot as u32, line);
                ctx.chunk.emit_word(*value_slot as u32, line);

                // Exhaustion sets the key slot to null; test and exit.
                ctx.chunk.emit(OpCode::GetLocal, *key_slot as u32, line);
                ctx.chunk.emit(OpCode::Null, 0, line);
                ctx.chunk.emit(OpCode::Equal, 0, line);
                ctx.chunk.emit(OpCode::Not, 0, line);
                let exit = ctx.chunk.emit_jump(OpCode::JumpIfFalse, line);
                ctx.chunk.emit(OpCode::Pop, 0, line);

                for inner in body {
                    self.stmt(ctx, inner);
                }
                self.discard_slots(ctx, body_slots, line);
                ctx.chunk.emit_loop(start, line);
                ctx.chunk.patch_jump(exit);
                ctx.chunk.emit(OpCode::Pop, 0, line);

                // Iterable, value, key leave scope here.
                ctx.chunk.emit(OpCode::Pop, 0, line);
                self.discard_one(ctx, *value_slot, line);
                self.discard_one(ctx, *key_slot, line);

                self.finish_loop(ctx);
            }

            StmtKind::Return { value } => {
                match value {
                    Some(v) => self.expr_root(ctx, v),
                    None => ctx.chunk.emit(OpCode::Void, 0, line),
                }
                ctx.chunk.emit(OpCode::Return, 0, line);
            }

            StmtKind::Break { scope_slots } => {
                self.discard_slots(ctx, scope_slots, line);
                let patch = ctx.chunk.emit_jump(OpCode::Jump, line);
                match ctx.loops.last_mut() {
                    Some(frame) => frame.break_patches.push(patch),
                    None => self.error(stmt.span, "`break` outside of a loop"),
                }
            }

            StmtKind::Continue { scope_slots } => {
                self.discard_slots(ctx, scope_slots, line);
                match ctx.loops.last_mut() {
                    Some(frame) => match frame.continue_target {
                        Some(target) => ctx.chunk.emit_loop(target, line),
                        None => {
                            let patch = ctx.chunk.emit_jump(OpCode::Jump, line);
                            ctx.loops
                                .last_mut()
                                .expect("loop frame")
                                .continue_patches
                                .push(patch);
                        }
                    },
                    None => self.error(stmt.span, "`continue` outside of a loop"),
                }
            }

            StmtKind::Throw { value } => {
                self.expr_root(ctx, value);
                ctx.chunk.emit(OpCode::Throw, 0, line);
            }

            StmtKind::Import {
                path,
                module,
                dest_slot,
                count,
            } => {
                if *dest_slot > 0x0fff || *count > 0x0fff {
                    self.error(stmt.span, "too many globals for an import");
                    return;
                }
                let path_idx = ctx.chunk.add_str(path.clone());
                let fn_idx = ctx
                    .chunk
                    .add_constant(Constant::Function(Rc::clone(&module.proto)));
                ctx.chunk.emit(OpCode::Import, path_idx, line);
                ctx.chunk.emit_word(fn_idx, line);
                ctx.chunk.emit_word((dest_slot << 12) | count, line);
            }

            StmtKind::Export { decl } => {
                // The export list is emitted by the script epilogue; the
                // wrapped declaration still executes here.
                if let Some(inner) = decl {
                    self.stmt(ctx, inner);
                }
            }
        }
    }

    /// Emit the scope-exit sequence for a list of local slots (highest
    /// first): captured slots close their upvalue, plain slots pop.
    fn discard_slots(&mut self, ctx: &mut FnCtx, slots: &[u8], line: u32) {
        for slot in slots {
            self.discard_one(ctx, *slot, line);
        }
    }

    fn discard_one(&mut self, ctx: &mut FnCtx, slot: u8, line: u32) {
        if ctx.decl.captured.contains(&slot) {
            ctx.chunk.emit(OpCode::CloseUpvalue, slot as u32, line);
        } else {
            ctx.chunk.emit(OpCode::Pop, 0, line);
        }
    }

    fn finish_loop(&mut self, ctx: &mut FnCtx) {
        let frame = ctx.loops.pop().expect("loop frame");
        for patch in frame.break_patches {
            ctx.chunk.patch_jump(patch);
        }
        debug_assert!(frame.continue_patches.is_empty());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expressions
    // ─────────────────────────────────────────────────────────────────────────

    /// Compile a full expression. Any `Unwrap` inside jumps here (with `null`
    /// on the stack) when its operand is null.
    fn expr_root(&mut self, ctx: &mut FnCtx, expr: &Expr) {
        ctx.opt_jumps.push(Vec::new());
        self.expr(ctx, expr);
        let jumps = ctx.opt_jumps.pop().expect("open expression root");
        for patch in jumps {
            ctx.chunk.patch_jump(patch);
        }
    }

    fn expr(&mut self, ctx: &mut FnCtx, expr: &Expr) {
        let line = expr.span.line;
        match &expr.kind {
            ExprKind::Null => ctx.chunk.emit(OpCode::Null, 0, line),
            ExprKind::Boolean(true) => ctx.chunk.emit(OpCode::True, 0, line),
            ExprKind::Boolean(false) => ctx.chunk.emit(OpCode::False, 0, line),
            ExprKind::Integer(n) => {
                ctx.chunk.emit_constant(Constant::Int(*n), line);
            }
            ExprKind::Float(f) => {
                ctx.chunk.emit_constant(Constant::Float(*f), line);
            }
            ExprKind::StringLit(s) => {
                ctx.chunk.emit_constant(Constant::Str(s.clone()), line);
            }

            ExprKind::String(segments) => self.string_expr(ctx, segments, line),

            ExprKind::List { items } => {
                let type_idx = ctx.chunk.add_constant(Constant::Type(expr.ty));
                ctx.chunk.emit(OpCode::List, type_idx, line);
                for item in items {
                    self.expr_root(ctx, item);
                    ctx.chunk.emit(OpCode::AppendList, 0, item.span.line);
                }
            }

            ExprKind::Map { entries } => {
                let type_idx = ctx.chunk.add_constant(Constant::Type(expr.ty));
                ctx.chunk.emit(OpCode::Map, type_idx, line);
                for (key, value) in entries {
                    self.expr_root(ctx, key);
                    self.expr_root(ctx, value);
                    ctx.chunk.emit(OpCode::SetMap, 0, key.span.line);
                }
            }

            ExprKind::Range { low, high } => {
                self.expr_root(ctx, low);
                self.expr_root(ctx, high);
                ctx.chunk.emit(OpCode::Range, 0, line);
            }

            ExprKind::NamedVariable { slot, .. } => match slot {
                Slot::Local(i) => ctx.chunk.emit(OpCode::GetLocal, *i as u32, line),
                Slot::UpValue(i) => ctx.chunk.emit(OpCode::GetUpvalue, *i as u32, line),
                Slot::Global(i) => ctx.chunk.emit(OpCode::GetGlobal, *i, line),
            },

            ExprKind::Unary { op, operand } => {
                self.expr_root(ctx, operand);
                match op {
                    UnaryOp::Negate => ctx.chunk.emit(OpCode::Negate, 0, line),
                    UnaryOp::Not => ctx.chunk.emit(OpCode::Not, 0, line),
                }
            }

            ExprKind::Binary { op, lhs, rhs } => self.binary_expr(ctx, *op, lhs, rhs, line),

            ExprKind::Is { value, target } => {
                self.expr_root(ctx, value);
                let idx = ctx.chunk.add_constant(Constant::Type(*target));
                ctx.chunk.emit(OpCode::Constant, idx, line);
                ctx.chunk.emit(OpCode::Is, 0, line);
            }

            ExprKind::Unwrap { operand } => {
                self.expr(ctx, operand);
                let patch = ctx.chunk.emit_jump(OpCode::Unwrap, line);
                ctx.opt_jumps
                    .last_mut()
                    .expect("unwrap outside an expression root")
                    .push(patch);
            }

            ExprKind::ForceUnwrap { operand } => {
                self.expr(ctx, operand);
                ctx.chunk.emit(OpCode::ForceUnwrap, 0, line);
            }

            ExprKind::NullOr { lhs, rhs } => {
                // The LHS is its own unwrap boundary: `a?.b ?? c` falls into
                // the fallback when the chain short-circuits to null.
                self.expr_root(ctx, lhs);
                let skip = ctx.chunk.emit_jump(OpCode::NullOr, line);
                ctx.chunk.emit(OpCode::Pop, 0, line);
                self.expr_root(ctx, rhs);
                ctx.chunk.patch_jump(skip);
            }

            ExprKind::Subscript { target, index } => {
                self.expr(ctx, target);
                self.expr_root(ctx, index);
                ctx.chunk.emit(OpCode::GetSubscript, 0, line);
            }

            ExprKind::Dot {
                target,
                member,
                kind,
            } => {
                self.expr(ctx, target);
                match kind {
                    DotKind::EnumCase(case) => {
                        ctx.chunk.emit(OpCode::GetEnumCase, *case as u32, line);
                    }
                    DotKind::EnumValue => {
                        ctx.chunk.emit(OpCode::GetEnumCaseValue, 0, line);
                    }
                    _ => {
                        let idx = ctx.chunk.add_str(member.clone());
                        ctx.chunk.emit(OpCode::GetProperty, idx, line);
                    }
                }
            }

            ExprKind::Super { .. } => {
                // Only reachable as a call callee; handled in `call_expr`.
                self.error(expr.span, "`super` can only be called");
            }

            ExprKind::ObjectInit {
                object,
                object_slot,
                fields,
            } => self.object_init_expr(ctx, *object, object_slot, fields, line),

            ExprKind::Call {
                callee,
                args,
                catches,
            } => self.call_expr(ctx, callee, args, catches, line),

            ExprKind::Function(decl) => {
                self.emit_closure(ctx, decl, line);
            }

            ExprKind::Assign { target, value } => self.assign_expr(ctx, target, value, line),
        }
    }

    fn binary_expr(&mut self, ctx: &mut FnCtx, op: BinaryOp, lhs: &Expr, rhs: &Expr, line: u32) {
        use BinaryOp::*;
        match op {
            And => {
                self.expr_root(ctx, lhs);
                let skip = ctx.chunk.emit_jump(OpCode::JumpIfFalse, line);
                ctx.chunk.emit(OpCode::Pop, 0, line);
                self.expr_root(ctx, rhs);
                ctx.chunk.patch_jump(skip);
            }
            Or => {
                self.expr_root(ctx, lhs);
                let to_rhs = ctx.chunk.emit_jump(OpCode::JumpIfFalse, line);
                let skip = ctx.chunk.emit_jump(OpCode::Jump, line);
                ctx.chunk.patch_jump(to_rhs);
                ctx.chunk.emit(OpCode::Pop, 0, line);
                self.expr_root(ctx, rhs);
                ctx.chunk.patch_jump(skip);
            }
            _ => {
                self.expr_root(ctx, lhs);
                self.expr_root(ctx, rhs);
                match op {
                    Add => ctx.chunk.emit(OpCode::Add, 0, line),
                    Subtract => ctx.chunk.emit(OpCode::Subtract, 0, line),
                    Multiply => ctx.chunk.emit(OpCode::Multiply, 0, line),
                    Divide => ctx.chunk.emit(OpCode::Divide, 0, line),
                    Modulo => ctx.chunk.emit(OpCode::Mod, 0, line),
                    Equal => ctx.chunk.emit(OpCode::Equal, 0, line),
                    NotEqual => {
                        ctx.chunk.emit(OpCode::Equal, 0, line);
                        ctx.chunk.emit(OpCode::Not, 0, line);
                    }
                    Less => ctx.chunk.emit(OpCode::Less, 0, line),
                    Greater => ctx.chunk.emit(OpCode::Greater, 0, line),
                    LessEqual => {
                        ctx.chunk.emit(OpCode::Greater, 0, line);
                        ctx.chunk.emit(OpCode::Not, 0, line);
                    }
                    GreaterEqual => {
                        ctx.chunk.emit(OpCode::Less, 0, line);
                        ctx.chunk.emit(OpCode::Not, 0, line);
                    }
                    ShiftLeft => ctx.chunk.emit(OpCode::ShiftLeft, 0, line),
                    ShiftRight => ctx.chunk.emit(OpCode::ShiftRight, 0, line),
                    BitAnd => ctx.chunk.emit(OpCode::BitAnd, 0, line),
                    BitXor => ctx.chunk.emit(OpCode::BitXor, 0, line),
                    BitOr => ctx.chunk.emit(OpCode::BitOr, 0, line),
                    And | Or => unreachable!("short-circuit ops handled above"),
                }
            }
        }
    }

    /// Interpolation: emit each segment, coercing non-string values with
    /// `TO_STRING`, concatenating left-to-right with `ADD`.
    fn string_expr(&mut self, ctx: &mut FnCtx, segments: &[StringSegment], line: u32) {
        for (i, segment) in segments.iter().enumerate() {
            match segment {
                StringSegment::Lit(s) => {
                    ctx.chunk.emit_constant(Constant::Str(s.clone()), line);
                }
                StringSegment::Expr(e) => {
                    self.expr_root(ctx, e);
                    if e.ty != self.types.t_str {
                        ctx.chunk.emit(OpCode::ToString, 0, e.span.line);
                    }
                }
            }
            if i > 0 {
                ctx.chunk.emit(OpCode::Add, 0, line);
            }
        }
        if segments.is_empty() {
            // Interpolated nodes always carry at least one segment; keep the
            // stack shape sane regardless.
            ctx.chunk.emit(OpCode::Constant, 0, line);
        }
    }

    fn object_init_expr(
        &mut self,
        ctx: &mut FnCtx,
        object: crate::types::ObjTypeId,
        object_slot: &Slot,
        fields: &[(String, Expr)],
        line: u32,
    ) {
        match object_slot {
            Slot::Global(i) => ctx.chunk.emit(OpCode::GetGlobal, *i, line),
            Slot::Local(i) => ctx.chunk.emit(OpCode::GetLocal, *i as u32, line),
            Slot::UpValue(i) => ctx.chunk.emit(OpCode::GetUpvalue, *i as u32, line),
        }
        ctx.chunk.emit(OpCode::Instance, 0, line);

        // Provided fields first, in written order.
        for (name, value) in fields {
            self.expr_root(ctx, value);
            let idx = ctx.chunk.add_str(name.clone());
            ctx.chunk.emit(OpCode::Property, idx, value.span.line);
        }

        // Then every omitted field with a default — the fragment is compiled
        // inline here, so each instantiation evaluates it freshly.
        let mut chain = Vec::new();
        let mut cur = Some(object);
        while let Some(obj) = cur {
            chain.push(obj);
            cur = self.types.object(obj).parent;
        }
        chain.reverse();

        for obj in chain {
            let defaults: Vec<(String, u32)> = self
                .types
                .object(obj)
                .fields
                .iter()
                .filter(|f| f.default.is_some())
                .filter(|f| !fields.iter().any(|(n, _)| n == &f.name))
                .map(|f| (f.name.clone(), f.default.unwrap()))
                .collect();
            for (name, fragment) in defaults {
                let fragment = self.types.fragment(fragment).clone();
                self.expr_root(ctx, &fragment);
                let idx = ctx.chunk.add_str(name);
                ctx.chunk.emit(OpCode::Property, idx, line);
            }
        }
    }

    fn call_expr(
        &mut self,
        ctx: &mut FnCtx,
        callee: &Expr,
        args: &[Expr],
        catches: &[Expr],
        line: u32,
    ) {
        let argc = args.len() as u32;
        let catchc = catches.len() as u32;

        match &callee.kind {
            // Fast path: receiver.method(...) / builtin container methods.
            ExprKind::Dot {
                target,
                member,
                kind,
            } if matches!(
                kind,
                DotKind::Field | DotKind::Method | DotKind::Builtin | DotKind::StaticField
            ) =>
            {
                self.expr(ctx, target);
                for arg in args {
                    self.expr_root(ctx, arg);
                }
                for catch in catches {
                    self.expr_root(ctx, catch);
                }
                let idx = ctx.chunk.add_str(member.clone());
                ctx.chunk.emit(OpCode::Invoke, idx, line);
                ctx.chunk.emit_word((argc << 8) | catchc, line);
            }

            ExprKind::Super {
                method,
                parent_slot,
            } => {
                // `this` is always slot 0 of a method frame.
                ctx.chunk.emit(OpCode::GetLocal, 0, line);
                for arg in args {
                    self.expr_root(ctx, arg);
                }
                for catch in catches {
                    self.expr_root(ctx, catch);
                }
                match parent_slot {
                    Slot::Global(i) => ctx.chunk.emit(OpCode::GetGlobal, *i, line),
                    _ => self.error(callee.span, "parent object must be a global"),
                }
                let idx = ctx.chunk.add_str(method.clone());
                ctx.chunk.emit(OpCode::SuperInvoke, idx, line);
                ctx.chunk.emit_word((argc << 8) | catchc, line);
            }

            _ => {
                self.expr(ctx, callee);
                for arg in args {
                    self.expr_root(ctx, arg);
                }
                for catch in catches {
                    self.expr_root(ctx, catch);
                }
                ctx.chunk.emit(OpCode::Call, argc, line);
                ctx.chunk.emit_word(catchc, line);
            }
        }
    }

    fn assign_expr(&mut self, ctx: &mut FnCtx, target: &Expr, value: &Expr, line: u32) {
        match &target.kind {
            ExprKind::NamedVariable { slot, .. } => {
                self.expr_root(ctx, value);
                match slot {
                    Slot::Local(i) => ctx.chunk.emit(OpCode::SetLocal, *i as u32, line),
                    Slot::UpValue(i) => ctx.chunk.emit(OpCode::SetUpvalue, *i as u32, line),
                    Slot::Global(i) => ctx.chunk.emit(OpCode::SetGlobal, *i, line),
                }
            }
            ExprKind::Subscript {
                target: base,
                index,
            } => {
                self.expr(ctx, base);
                self.expr_root(ctx, index);
                self.expr_root(ctx, value);
                ctx.chunk.emit(OpCode::SetSubscript, 0, line);
            }
            ExprKind::Dot {
                target: base,
                member,
                ..
            } => {
                self.expr(ctx, base);
                self.expr_root(ctx, value);
                let idx = ctx.chunk.add_str(member.clone());
                ctx.chunk.emit(OpCode::SetProperty, idx, line);
            }
            _ => {
                self.error(target.span, "invalid assignment target");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode;
    use crate::modules::ModuleRegistry;

    fn compile(src: &str) -> Rc<FnProto> {
        let mut types = TypeRegistry::new();
        let mut modules = ModuleRegistry::new();
        let (tokens, lex_errors) = crate::lexer::lex(src);
        assert!(lex_errors.is_empty(), "lex errors: {lex_errors:?}");
        let (program, errors) =
            crate::parser::parse(tokens, &mut types, &mut modules, "<test>", None, true);
        let program = program.unwrap_or_else(|| panic!("parse errors: {errors:?}"));
        generate(&program, &types).expect("codegen errors")
    }

    /// Walk a chunk and verify every jump target lies within it.
    fn assert_jumps_in_bounds(proto: &FnProto) {
        let mut i = 0;
        let code = &proto.chunk.code;
        while i < code.len() {
            let (op_byte, arg) = decode(code[i]);
            let op = OpCode::try_from(op_byte);
            if let Ok(
                OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::Loop
                | OpCode::Unwrap
                | OpCode::NullOr,
            ) = op
            {
                assert!(
                    (arg as usize) <= code.len(),
                    "jump target {arg} outside chunk of {} words",
                    code.len()
                );
            }
            // Step over multi-word instructions.
            i += match op {
                Ok(OpCode::Call) | Ok(OpCode::Invoke) | Ok(OpCode::SuperInvoke)
                | Ok(OpCode::Foreach) => 2,
                Ok(OpCode::Import) => 3,
                Ok(OpCode::Object) | Ok(OpCode::Enum) => 2,
                Ok(OpCode::Closure) => {
                    let idx = arg as usize;
                    match &proto.chunk.constants[idx] {
                        Constant::Function(f) => 1 + f.upvalue_count as usize,
                        _ => 1,
                    }
                }
                _ => 1,
            };
        }
        for c in &proto.chunk.constants {
            if let Constant::Function(f) = c {
                assert_jumps_in_bounds(f);
            }
        }
    }

    #[test]
    fn test_empty_script_compiles_to_void_return() {
        let proto = compile("");
        let (op_a, _) = decode(proto.chunk.code[0]);
        let (op_b, _) = decode(proto.chunk.code[1]);
        assert_eq!(op_a, OpCode::Void as u8);
        assert_eq!(op_b, OpCode::Return as u8);
    }

    #[test]
    fn test_constant_slot_zero_is_empty_string() {
        let proto = compile(r#"print("hi");"#);
        assert_eq!(proto.chunk.constants[0], Constant::Str(String::new()));
    }

    #[test]
    fn test_if_and_loops_patch_within_chunk() {
        let proto = compile(
            r#"
            int s = 0;
            for (int i = 0; i < 10; i = i + 1) {
                if (i % 2 == 0) {
                    s = s + i;
                } else {
                    continue;
                }
                if (s > 100) { break; }
            }
            while (s > 0) { s = s - 1; }
            do { s = s + 1; } until (s == 3);
            "#,
        );
        assert_jumps_in_bounds(&proto);
    }

    #[test]
    fn test_foreach_emits_foreach_op() {
        let proto = compile("int s = 0; foreach (int n in 0..10) { s = s + n; }");
        let has_foreach = proto
            .chunk
            .code
            .iter()
            .any(|w| decode(*w).0 == OpCode::Foreach as u8);
        assert!(has_foreach);
        assert_jumps_in_bounds(&proto);
    }

    #[test]
    fn test_closure_upvalue_words_follow() {
        let proto = compile(
            r#"
            fun counter() > fun() > int {
                int n = 0;
                fun bump() > int {
                    n = n + 1;
                    return n;
                }
                return bump;
            }
            "#,
        );
        // The outer closure constant holds `counter`, whose chunk holds the
        // `bump` closure with one upvalue word.
        let counter = proto
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) if f.name == "counter" => Some(Rc::clone(f)),
                _ => None,
            })
            .expect("counter proto");
        let bump = counter
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) if f.name == "bump" => Some(Rc::clone(f)),
                _ => None,
            })
            .expect("bump proto");
        assert_eq!(bump.upvalue_count, 1);
        assert_jumps_in_bounds(&proto);
    }

    #[test]
    fn test_test_mode_invokes_test_functions() {
        let mut types = TypeRegistry::new();
        let mut modules = ModuleRegistry::new();
        let (tokens, _) = crate::lexer::lex(r#"test "adds" { assert(1 + 2 == 3); }"#);
        let (program, errors) =
            crate::parser::parse(tokens, &mut types, &mut modules, "<test>", None, true);
        let program = program.unwrap_or_else(|| panic!("parse errors: {errors:?}"));
        assert_eq!(program.tests.len(), 1);
        let proto = generate_with_mode(&program, &types, RunMode::Test).unwrap();
        // The check-mark report string is in the constant pool.
        let has_report = proto.chunk.constants.iter().any(|c| match c {
            Constant::Str(s) => s.contains("adds") && s.contains('\u{2713}'),
            _ => false,
        });
        assert!(has_report);
    }
}
