//! The Buzz virtual machine.
//!
//! A **stack-based interpreter** that executes [`Chunk`] bytecode inside a
//! stack of [`CallFrame`]s. Execution is single-threaded and cooperative: the
//! GC runs synchronously between instruction dispatches, never inside one.
//!
//! # Execution model
//!
//! - The value stack is one heap-allocated `Vec<Value>` shared across all
//!   frames (preallocated: it must not live on the host thread's stack).
//! - Each [`CallFrame`] stores its instruction pointer, the executing
//!   closure, its `slot_base` (the stack index of slot 0 — the callee, or the
//!   receiver inside methods), and the catch closures attached to its call
//!   site.
//! - Globals live in one `Vec<Value>`; each module owns a contiguous region
//!   starting at its `globals_base`, with the native functions materialised
//!   in the first slots (mirroring the parser's layout).
//!
//! # Exceptions
//!
//! `THROW` pops a value and unwinds call frames. The innermost frame whose
//! call site attached a catch clause accepting the thrown value's type wins:
//! its frame is discarded and the catch closure is invoked with the value;
//! the catch's result replaces the original call's result. An unhandled
//! throw terminates execution with a stack trace.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::{decode, Constant, FnProto, OpCode};
use crate::gc::{GcHeap, GcPtr, GcTrace};
use crate::natives::{self, NativeCtx};
use crate::types::{TypeId, TypeKind, TypeRegistry};
use crate::value::{
    MapKey, ObjBound, ObjClosure, ObjEnum, ObjEnumInstance, ObjInstance, ObjList, ObjMap,
    ObjNative, ObjObject, ObjRange, ObjString, ObjUpvalue, Value,
};

/// Maximum number of simultaneously active call frames.
const FRAMES_MAX: usize = 64;
/// Capacity of the preallocated value stack.
const STACK_MAX: usize = FRAMES_MAX * 256;

// ─────────────────────────────────────────────────────────────────────────────
// Runtime error
// ─────────────────────────────────────────────────────────────────────────────

/// A fatal runtime error (including unhandled throws).
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    /// `function:line` frames, innermost first.
    pub stack_trace: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.stack_trace {
            write!(f, "\n  at {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

type VmResult<T> = Result<T, RuntimeError>;

// ─────────────────────────────────────────────────────────────────────────────
// CallFrame
// ─────────────────────────────────────────────────────────────────────────────

/// One active call on the call stack.
struct CallFrame {
    closure: GcPtr<ObjClosure>,
    /// Index of the next instruction word.
    ip: usize,
    /// Absolute stack index of this frame's slot 0 (callee / receiver).
    slot_base: usize,
    /// Catch closures attached at the call site, innermost-priority first.
    catches: Vec<GcPtr<ObjClosure>>,
    /// Where the defining module's globals start.
    globals_base: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Vm
// ─────────────────────────────────────────────────────────────────────────────

/// Where program output goes; tests capture it in memory.
enum OutputSink {
    Stdout,
    Capture(Rc<RefCell<String>>),
}

/// The Buzz virtual machine.
pub struct Vm<'a> {
    heap: &'a mut GcHeap,
    types: &'a TypeRegistry,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Vec<Value>,
    /// String intern table — a weak GC table: entries whose string dies are
    /// dropped during collection.
    strings: HashMap<String, GcPtr<ObjString>>,
    /// Open upvalues, sorted by ascending stack slot.
    open_upvalues: Vec<GcPtr<ObjUpvalue>>,
    /// Values exported by the module currently finishing its script.
    pending_exports: Vec<Value>,
    /// Canonical path → exported values; imports run once per process.
    module_exports: HashMap<String, Vec<Value>>,
    script_args: Vec<String>,
    output: OutputSink,
    /// Optional embedder-set dispatch budget.
    cycle_limit: Option<u64>,
    cycles: u64,
}

impl<'a> Vm<'a> {
    pub fn new(heap: &'a mut GcHeap, types: &'a TypeRegistry) -> Self {
        Vm {
            heap,
            types,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Vec::new(),
            strings: HashMap::new(),
            open_upvalues: Vec::new(),
            pending_exports: Vec::new(),
            module_exports: HashMap::new(),
            script_args: Vec::new(),
            output: OutputSink::Stdout,
            cycle_limit: None,
            cycles: 0,
        }
    }

    /// Arguments exposed to the script through `args()`.
    pub fn set_args(&mut self, args: Vec<String>) {
        self.script_args = args;
    }

    /// Cap the number of dispatched instructions; exceeding it terminates
    /// execution with a runtime error.
    pub fn set_cycle_limit(&mut self, limit: u64) {
        self.cycle_limit = Some(limit);
    }

    /// Redirect program output into a buffer (for tests) and return it.
    pub fn capture_output(&mut self) -> Rc<RefCell<String>> {
        let buffer = Rc::new(RefCell::new(String::new()));
        self.output = OutputSink::Capture(Rc::clone(&buffer));
        buffer
    }

    /// Execute a compiled script prototype.
    pub fn interpret(&mut self, proto: Rc<FnProto>) -> VmResult<()> {
        let globals_base = self.reserve_module_globals(proto.globals_count);
        let closure = self.heap.alloc(ObjClosure {
            proto,
            upvalues: Vec::new(),
            globals_base,
        });
        self.stack.push(Value::Closure(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base: 0,
            catches: Vec::new(),
            globals_base,
        });
        let result = self.dispatch(0);
        self.stack.clear();
        result
    }

    /// Reserve a module's globals region: natives in the first slots (the
    /// parser laid them out identically), `null` elsewhere.
    fn reserve_module_globals(&mut self, count: u32) -> usize {
        let base = self.globals.len();
        for decl in natives::all() {
            let native = self.heap.alloc(ObjNative {
                name: decl.name.to_string(),
                arity: decl.arity,
                function: decl.function,
            });
            self.globals.push(Value::Native(native));
        }
        while self.globals.len() < base + count as usize {
            self.globals.push(Value::Null);
        }
        base
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Output / helpers used by natives
    // ─────────────────────────────────────────────────────────────────────────

    pub fn write_out(&mut self, text: &str) {
        match &self.output {
            OutputSink::Stdout => {
                let mut out = std::io::stdout();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            OutputSink::Capture(buffer) => buffer.borrow_mut().push_str(text),
        }
    }

    /// Intern a string: equal content always yields the identical object.
    pub fn intern_string(&mut self, s: String) -> Value {
        if let Some(ptr) = self.strings.get(&s) {
            return Value::Str(*ptr);
        }
        let ptr = self.heap.alloc(ObjString { value: s.clone() });
        self.strings.insert(s, ptr);
        Value::Str(ptr)
    }

    /// The `args()` native: the script arguments as a `[str]`.
    pub fn script_args_list(&mut self) -> Value {
        let type_id = self
            .types
            .lookup(
                TypeKind::List {
                    item: self.types.t_str,
                },
                false,
            )
            .unwrap_or(self.types.t_any);
        let items: Vec<Value> = self
            .script_args
            .clone()
            .into_iter()
            .map(|a| self.intern_string(a))
            .collect();
        Value::List(self.heap.alloc(ObjList {
            type_id,
            items: RefCell::new(items),
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stack helpers
    // ─────────────────────────────────────────────────────────────────────────

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    #[inline]
    pub fn peek(&self, distance: usize) -> &Value {
        let idx = self.stack.len() - 1 - distance;
        &self.stack[idx]
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame / chunk helpers
    // ─────────────────────────────────────────────────────────────────────────

    #[inline]
    fn read_word(&mut self) -> u32 {
        let frame = self.frames.last_mut().expect("no active frame");
        let closure = frame.closure;
        // SAFETY: the executing closure is rooted by its frame.
        let word = unsafe { closure.as_ref() }.proto.chunk.code[frame.ip];
        frame.ip += 1;
        word
    }

    fn constant(&self, idx: usize) -> Constant {
        let frame = self.frames.last().expect("no active frame");
        // SAFETY: the executing closure is rooted by its frame.
        unsafe { frame.closure.as_ref() }.proto.chunk.constants[idx].clone()
    }

    fn constant_str(&self, idx: usize) -> VmResult<String> {
        match self.constant(idx) {
            Constant::Str(s) => Ok(s),
            other => Err(self.runtime_error(format!(
                "expected a string constant at slot {idx}, found {other}"
            ))),
        }
    }

    fn stack_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                // SAFETY: rooted by the frame.
                let proto = &unsafe { frame.closure.as_ref() }.proto;
                let ip = frame.ip.saturating_sub(1);
                let line = proto.chunk.lines.get(ip).copied().unwrap_or(0);
                format!("{}:{}", proto.name, line)
            })
            .collect()
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
            stack_trace: self.stack_trace(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // GC integration
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a collection at a safe suspension point (between dispatches).
    fn collect_garbage(&mut self) {
        let heap = &mut *self.heap;
        for value in &self.stack {
            value.trace(heap);
        }
        for value in &self.globals {
            value.trace(heap);
        }
        for frame in &self.frames {
            heap.mark(frame.closure);
            for catch in &frame.catches {
                heap.mark(*catch);
            }
        }
        for upvalue in &self.open_upvalues {
            heap.mark(*upvalue);
        }
        for value in &self.pending_exports {
            value.trace(heap);
        }
        for values in self.module_exports.values() {
            for value in values {
                value.trace(heap);
            }
        }
        heap.trace_references();
        // Weak intern table: entries whose string did not survive are dropped.
        let heap_ref = &*heap;
        self.strings.retain(|_, ptr| heap_ref.is_marked(*ptr));
        heap.sweep();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upvalue management
    // ─────────────────────────────────────────────────────────────────────────

    /// Find or create the open upvalue for an absolute stack slot. The open
    /// list stays sorted by slot so closing at return is linear.
    fn capture_upvalue(&mut self, slot: usize) -> GcPtr<ObjUpvalue> {
        for upvalue in &self.open_upvalues {
            // SAFETY: open upvalues are GC roots.
            if unsafe { upvalue.as_ref() }.open_slot() == Some(slot) {
                return *upvalue;
            }
        }
        let upvalue = self.heap.alloc(ObjUpvalue::open(slot));
        let at = self
            .open_upvalues
            .iter()
            .position(|uv| {
                // SAFETY: as above.
                unsafe { uv.as_ref() }.open_slot().map(|s| s > slot).unwrap_or(false)
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(at, upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from` (a frame is departing or
    /// a scope ended).
    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|upvalue| {
            // SAFETY: open upvalues are GC roots.
            let uv = unsafe { upvalue.as_ref() };
            match uv.open_slot() {
                Some(slot) if slot >= from => {
                    uv.close(stack);
                    false
                }
                _ => true,
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dynamic typing support
    // ─────────────────────────────────────────────────────────────────────────

    /// The reified runtime type of a value, for `is` and catch matching.
    fn runtime_type_of(&self, value: &Value) -> TypeId {
        match value {
            Value::Null => self.types.t_null,
            Value::Bool(_) => self.types.t_bool,
            Value::Integer(_) => self.types.t_int,
            Value::Float(_) => self.types.t_float,
            Value::Str(_) => self.types.t_str,
            Value::Range(_) => self.types.t_range,
            Value::Type(_) => self.types.t_type,
            // SAFETY below: the inspected values are rooted by the caller.
            Value::List(l) => unsafe { l.as_ref() }.type_id,
            Value::Map(m) => unsafe { m.as_ref() }.type_id,
            Value::Closure(c) => unsafe { c.as_ref() }.proto.fn_type,
            Value::Bound(b) => {
                let b = unsafe { b.as_ref() };
                unsafe { b.method.as_ref() }.proto.fn_type
            }
            Value::Instance(i) => {
                let i = unsafe { i.as_ref() };
                unsafe { i.object.as_ref() }.instance_type
            }
            Value::EnumInstance(e) => {
                let e = unsafe { e.as_ref() };
                unsafe { e.owner.as_ref() }.instance_type
            }
            Value::Object(_) | Value::Enum(_) | Value::Native(_) => self.types.t_any,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Exception unwinding
    // ─────────────────────────────────────────────────────────────────────────

    fn throw_str(&mut self, message: &str) -> VmResult<()> {
        let value = self.intern_string(message.to_string());
        self.throw_value(value)
    }

    /// Unwind to the innermost frame whose call site attached a catch clause
    /// accepting the thrown value's type; invoke it with the value. With no
    /// matching clause, execution terminates.
    fn throw_value(&mut self, value: Value) -> VmResult<()> {
        let thrown_type = self.runtime_type_of(&value);

        for frame_idx in (0..self.frames.len()).rev() {
            let catches = self.frames[frame_idx].catches.clone();
            if let Some(catch) = self.find_matching_catch(&catches, thrown_type) {
                // Discard the throwing frames and the call's stack region,
                // then run the catch where the call's result would land.
                let slot_base = self.frames[frame_idx].slot_base;
                self.close_upvalues(slot_base);
                self.frames.truncate(frame_idx);
                self.stack.truncate(slot_base);
                self.stack.push(Value::Closure(catch));
                self.stack.push(value);
                return self.call_closure(catch, 1, Vec::new());
            }
        }

        let rendered = format!("{value}");
        Err(self.runtime_error(format!("unhandled error: {rendered}")))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────────

    fn call_closure(
        &mut self,
        closure: GcPtr<ObjClosure>,
        arg_count: usize,
        catches: Vec<GcPtr<ObjClosure>>,
    ) -> VmResult<()> {
        // SAFETY: the closure is rooted (on the stack at its callee slot).
        let proto = &unsafe { closure.as_ref() }.proto;
        if proto.arity as usize != arg_count {
            let message = format!(
                "function `{}` expects {} arguments, got {}",
                proto.name, proto.arity, arg_count
            );
            return Err(self.runtime_error(message));
        }
        if self.frames.len() >= FRAMES_MAX || self.stack.len() + 256 > STACK_MAX {
            return Err(self.runtime_error("stack overflow"));
        }
        let globals_base = unsafe { closure.as_ref() }.globals_base;
        let slot_base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base,
            catches,
            globals_base,
        });
        Ok(())
    }

    fn call_value(&mut self, arg_count: usize, catches: Vec<GcPtr<ObjClosure>>) -> VmResult<()> {
        let callee_idx = self.stack.len() - arg_count - 1;
        let callee = self.stack[callee_idx].clone();

        match callee {
            Value::Closure(closure) => self.call_closure(closure, arg_count, catches),
            Value::Bound(bound) => {
                // SAFETY: the bound method is rooted at the callee slot.
                let bound_ref = unsafe { bound.as_ref() };
                let method = bound_ref.method;
                // The receiver takes slot 0 (`this`).
                self.stack[callee_idx] = bound_ref.receiver.clone();
                self.call_closure(method, arg_count, catches)
            }
            Value::Native(native) => self.call_native(native, arg_count, catches),
            Value::Null => Err(self.runtime_error("cannot call `null`")),
            other => {
                Err(self.runtime_error(format!("cannot call a value of type {}", other.type_name())))
            }
        }
    }

    fn call_native(
        &mut self,
        native: GcPtr<ObjNative>,
        arg_count: usize,
        catches: Vec<GcPtr<ObjClosure>>,
    ) -> VmResult<()> {
        // SAFETY: the native is rooted at the callee slot.
        let (name, arity, function) = {
            let n = unsafe { native.as_ref() };
            (n.name.clone(), n.arity as usize, n.function)
        };
        if arity != arg_count {
            return Err(self.runtime_error(format!(
                "native `{name}` expects {arity} arguments, got {arg_count}"
            )));
        }
        let callee_idx = self.stack.len() - arg_count - 1;
        let result = function(NativeCtx { vm: self });
        match result {
            Ok(pushed) => {
                let value = if pushed > 0 { self.pop() } else { Value::Null };
                self.stack.truncate(callee_idx);
                self.stack.push(value);
                Ok(())
            }
            Err(err) => {
                self.stack.truncate(callee_idx);
                // Natives have no frame; their call site's catches apply here.
                let value = self.intern_string(err.message);
                let thrown_type = self.runtime_type_of(&value);
                if let Some(catch) = self.find_matching_catch(&catches, thrown_type) {
                    self.stack.push(Value::Closure(catch));
                    self.stack.push(value);
                    self.call_closure(catch, 1, Vec::new())
                } else {
                    self.throw_value(value)
                }
            }
        }
    }

    /// The first catch clause whose parameter type accepts the thrown type.
    fn find_matching_catch(
        &self,
        catches: &[GcPtr<ObjClosure>],
        thrown_type: TypeId,
    ) -> Option<GcPtr<ObjClosure>> {
        catches.iter().copied().find(|catch| {
            // SAFETY: catch closures are rooted by the caller.
            let proto = &unsafe { catch.as_ref() }.proto;
            match &self.types.get(proto.fn_type).kind {
                TypeKind::Function(ft) => match ft.params.first() {
                    Some((_, param)) => self.types.is_assignable(thrown_type, *param),
                    None => false,
                },
                _ => false,
            }
        })
    }

    /// Pop `count` catch closures off the stack (they sit above the
    /// arguments), preserving source order.
    fn pop_catches(&mut self, count: usize) -> VmResult<Vec<GcPtr<ObjClosure>>> {
        let mut catches = Vec::with_capacity(count);
        for _ in 0..count {
            match self.pop() {
                Value::Closure(c) => catches.push(c),
                other => {
                    return Err(self.runtime_error(format!(
                        "catch clause must be a function, found {}",
                        other.type_name()
                    )))
                }
            }
        }
        catches.reverse();
        Ok(catches)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Main dispatch loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch-decode-dispatch until the frame stack drops to `frame_floor`.
    fn dispatch(&mut self, frame_floor: usize) -> VmResult<()> {
        while self.frames.len() > frame_floor {
            // Safe suspension point: collection never interleaves with one
            // instruction.
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            self.cycles += 1;
            if let Some(limit) = self.cycle_limit {
                if self.cycles > limit {
                    return Err(self.runtime_error("cycle limit exceeded"));
                }
            }

            let word = self.read_word();
            let (op_byte, arg) = decode(word);
            let op = OpCode::try_from(op_byte)
                .map_err(|b| self.runtime_error(format!("unknown opcode {b:#04x}")))?;

            match op {
                // ── Constants / literals ────────────────────────────────────
                OpCode::Constant => {
                    let value = match self.constant(arg as usize) {
                        Constant::Int(n) => Value::Integer(n),
                        Constant::Float(f) => Value::Float(f),
                        Constant::Bool(b) => Value::Bool(b),
                        Constant::Null => Value::Null,
                        Constant::Type(t) => Value::Type(t),
                        Constant::Str(s) => self.intern_string(s),
                        Constant::Function(_) => {
                            return Err(self.runtime_error(
                                "function constants load through CLOSURE",
                            ))
                        }
                    };
                    self.push(value);
                }
                OpCode::Null | OpCode::Void => self.push(Value::Null),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),

                // ── Stack ───────────────────────────────────────────────────
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Copy => {
                    let top = self.peek(0).clone();
                    self.push(top);
                }

                // ── Locals ──────────────────────────────────────────────────
                OpCode::GetLocal => {
                    let base = self.frames.last().expect("frame").slot_base;
                    let value = self.stack[base + arg as usize].clone();
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let base = self.frames.last().expect("frame").slot_base;
                    self.stack[base + arg as usize] = self.peek(0).clone();
                }

                // ── Upvalues ────────────────────────────────────────────────
                OpCode::GetUpvalue => {
                    let frame = self.frames.last().expect("frame");
                    // SAFETY: rooted by the frame.
                    let upvalue = unsafe { frame.closure.as_ref() }.upvalues[arg as usize];
                    let value = unsafe { upvalue.as_ref() }.get(&self.stack);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let frame = self.frames.last().expect("frame");
                    // SAFETY: rooted by the frame.
                    let upvalue = unsafe { frame.closure.as_ref() }.upvalues[arg as usize];
                    let value = self.peek(0).clone();
                    unsafe { upvalue.as_ref() }.set(&mut self.stack, value);
                }
                OpCode::CloseUpvalue => {
                    let base = self.frames.last().expect("frame").slot_base;
                    self.close_upvalues(base + arg as usize);
                    self.pop();
                }

                // ── Globals ─────────────────────────────────────────────────
                OpCode::GetGlobal => {
                    let base = self.frames.last().expect("frame").globals_base;
                    let value = self
                        .globals
                        .get(base + arg as usize)
                        .cloned()
                        .unwrap_or(Value::Null);
                    self.push(value);
                }
                OpCode::SetGlobal => {
                    let base = self.frames.last().expect("frame").globals_base;
                    self.globals[base + arg as usize] = self.peek(0).clone();
                }
                OpCode::DefineGlobal => {
                    let base = self.frames.last().expect("frame").globals_base;
                    let value = self.pop();
                    let idx = base + arg as usize;
                    if self.globals.len() <= idx {
                        self.globals.resize(idx + 1, Value::Null);
                    }
                    self.globals[idx] = value;
                }

                // ── Properties ──────────────────────────────────────────────
                OpCode::GetProperty => {
                    let name = self.constant_str(arg as usize)?;
                    let target = self.pop();
                    let value = self.get_property(&target, &name)?;
                    self.push(value);
                }
                OpCode::SetProperty => {
                    let name = self.constant_str(arg as usize)?;
                    let value = self.pop();
                    let target = self.pop();
                    self.set_property(&target, &name, value.clone())?;
                    self.push(value);
                }
                OpCode::Property => {
                    let name = self.constant_str(arg as usize)?;
                    let value = self.pop();
                    let target = self.peek(0).clone();
                    self.set_property(&target, &name, value)?;
                }

                // ── Subscript ───────────────────────────────────────────────
                OpCode::GetSubscript => {
                    let index = self.pop();
                    let target = self.pop();
                    let value = self.get_subscript(&target, &index)?;
                    self.push(value);
                }
                OpCode::SetSubscript => {
                    let value = self.pop();
                    let index = self.pop();
                    let target = self.pop();
                    if self.set_subscript(&target, &index, value.clone())? {
                        self.push(value);
                    }
                }

                // ── Containers ──────────────────────────────────────────────
                OpCode::List => {
                    let type_id = match self.constant(arg as usize) {
                        Constant::Type(t) => t,
                        _ => self.types.t_any,
                    };
                    let list = self.heap.alloc(ObjList {
                        type_id,
                        items: RefCell::new(Vec::new()),
                    });
                    self.push(Value::List(list));
                }
                OpCode::AppendList => {
                    let item = self.pop();
                    match self.peek(0) {
                        Value::List(list) => {
                            // SAFETY: the list is rooted on the stack.
                            unsafe { list.as_ref() }.items.borrow_mut().push(item);
                        }
                        other => {
                            let message =
                                format!("cannot append to a {}", other.type_name());
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::Map => {
                    let type_id = match self.constant(arg as usize) {
                        Constant::Type(t) => t,
                        _ => self.types.t_any,
                    };
                    let map = self.heap.alloc(ObjMap {
                        type_id,
                        entries: RefCell::new(IndexMap::new()),
                    });
                    self.push(Value::Map(map));
                }
                OpCode::SetMap => {
                    let value = self.pop();
                    let key = self.pop();
                    match self.peek(0) {
                        Value::Map(map) => match MapKey::from_value(&key) {
                            Some(key) => {
                                // SAFETY: the map is rooted on the stack.
                                unsafe { map.as_ref() }.entries.borrow_mut().insert(key, value);
                            }
                            None => {
                                let message =
                                    format!("{} cannot be a map key", key.type_name());
                                return Err(self.runtime_error(message));
                            }
                        },
                        other => {
                            let message =
                                format!("cannot set an entry on a {}", other.type_name());
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::Range => {
                    let high = self.pop();
                    let low = self.pop();
                    match (low, high) {
                        (Value::Integer(low), Value::Integer(high)) => {
                            let range = self.heap.alloc(ObjRange { low, high });
                            self.push(Value::Range(range));
                        }
                        _ => return Err(self.runtime_error("range bounds must be integers")),
                    }
                }

                // ── Arithmetic / logic ──────────────────────────────────────
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.op_arith(
                    |a, b| a.checked_sub(b),
                    |a, b| a - b,
                    "UnderflowError",
                )?,
                OpCode::Multiply => self.op_arith(
                    |a, b| a.checked_mul(b),
                    |a, b| a * b,
                    "OverflowError",
                )?,
                OpCode::Divide => {
                    if matches!(self.peek(0), Value::Integer(0)) {
                        self.pop();
                        self.pop();
                        self.throw_str("DivisionByZeroError")?;
                    } else {
                        self.op_arith(|a, b| a.checked_div(b), |a, b| a / b, "OverflowError")?;
                    }
                }
                OpCode::Mod => {
                    if matches!(self.peek(0), Value::Integer(0)) {
                        self.pop();
                        self.pop();
                        self.throw_str("DivisionByZeroError")?;
                    } else {
                        self.op_arith(|a, b| a.checked_rem(b), |a, b| a % b, "OverflowError")?;
                    }
                }
                OpCode::Negate => {
                    let value = self.pop();
                    match value {
                        Value::Integer(n) => match n.checked_neg() {
                            Some(n) => self.push(Value::Integer(n)),
                            None => self.throw_str("OverflowError")?,
                        },
                        Value::Float(f) => self.push(Value::Float(-f)),
                        other => {
                            let message = format!("cannot negate a {}", other.type_name());
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }
                OpCode::ShiftLeft => self.op_bitwise(|a, b| a.wrapping_shl(b as u32))?,
                OpCode::ShiftRight => self.op_bitwise(|a, b| a.wrapping_shr(b as u32))?,
                OpCode::BitAnd => self.op_bitwise(|a, b| a & b)?,
                OpCode::BitXor => self.op_bitwise(|a, b| a ^ b)?,
                OpCode::BitOr => self.op_bitwise(|a, b| a | b)?,

                // ── Comparison ──────────────────────────────────────────────
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.op_compare(|a, b| a > b, |a, b| a > b)?,
                OpCode::Less => self.op_compare(|a, b| a < b, |a, b| a < b)?,
                OpCode::Is => {
                    let target = self.pop();
                    let value = self.pop();
                    match target {
                        Value::Type(target) => {
                            let actual = self.runtime_type_of(&value);
                            self.push(Value::Bool(self.types.is_assignable(actual, target)));
                        }
                        other => {
                            let message =
                                format!("`is` needs a type, found {}", other.type_name());
                            return Err(self.runtime_error(message));
                        }
                    }
                }

                // ── Control flow ────────────────────────────────────────────
                OpCode::Jump | OpCode::Loop => {
                    self.frames.last_mut().expect("frame").ip = arg as usize;
                }
                OpCode::JumpIfFalse => {
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().expect("frame").ip = arg as usize;
                    }
                }
                OpCode::Unwrap => {
                    if self.peek(0).is_null() {
                        self.frames.last_mut().expect("frame").ip = arg as usize;
                    }
                }
                OpCode::NullOr => {
                    if !self.peek(0).is_null() {
                        self.frames.last_mut().expect("frame").ip = arg as usize;
                    }
                }
                OpCode::ForceUnwrap => {
                    if self.peek(0).is_null() {
                        self.pop();
                        self.throw_str("ForceUnwrapError")?;
                    }
                }

                // ── Calls ───────────────────────────────────────────────────
                OpCode::Call => {
                    let catch_count = self.read_word() as usize;
                    let catches = self.pop_catches(catch_count)?;
                    self.call_value(arg as usize, catches)?;
                }
                OpCode::Invoke => {
                    let packed = self.read_word();
                    let arg_count = (packed >> 8) as usize;
                    let catch_count = (packed & 0xff) as usize;
                    let name = self.constant_str(arg as usize)?;
                    let catches = self.pop_catches(catch_count)?;
                    self.invoke(&name, arg_count, catches)?;
                }
                OpCode::SuperInvoke => {
                    let packed = self.read_word();
                    let arg_count = (packed >> 8) as usize;
                    let catch_count = (packed & 0xff) as usize;
                    let name = self.constant_str(arg as usize)?;
                    let parent = self.pop();
                    let catches = self.pop_catches(catch_count)?;
                    match parent {
                        Value::Object(parent) => {
                            // SAFETY: the parent object is a global (rooted).
                            let method = unsafe { parent.as_ref() }.find_method(&name);
                            match method {
                                Some(method) => {
                                    self.call_closure(method, arg_count, catches)?
                                }
                                None => {
                                    let message = format!("undefined parent method `{name}`");
                                    return Err(self.runtime_error(message));
                                }
                            }
                        }
                        other => {
                            let message =
                                format!("`super` needs an object, found {}", other.type_name());
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::Closure => {
                    let proto = match self.constant(arg as usize) {
                        Constant::Function(proto) => proto,
                        other => {
                            let message = format!("CLOSURE needs a function constant, found {other}");
                            return Err(self.runtime_error(message));
                        }
                    };
                    let upvalue_count = proto.upvalue_count as usize;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let word = self.read_word();
                        let is_local = (word >> 8) & 1 == 1;
                        let index = (word & 0xff) as usize;
                        let frame = self.frames.last().expect("frame");
                        if is_local {
                            let slot = frame.slot_base + index;
                            let upvalue = self.capture_upvalue(slot);
                            upvalues.push(upvalue);
                        } else {
                            // SAFETY: rooted by the frame.
                            let upvalue =
                                unsafe { frame.closure.as_ref() }.upvalues[index];
                            upvalues.push(upvalue);
                        }
                    }
                    let globals_base = self.frames.last().expect("frame").globals_base;
                    let closure = self.heap.alloc(ObjClosure {
                        proto,
                        upvalues,
                        globals_base,
                    });
                    self.push(Value::Closure(closure));
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame");
                    self.close_upvalues(frame.slot_base);
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }

                // ── Objects ─────────────────────────────────────────────────
                OpCode::Object => {
                    let name = self.constant_str(arg as usize)?;
                    let type_word = self.read_word();
                    let instance_type = match self.constant(type_word as usize) {
                        Constant::Type(t) => t,
                        _ => self.types.t_any,
                    };
                    let object = self.heap.alloc(ObjObject {
                        name,
                        instance_type,
                        parent: std::cell::Cell::new(None),
                        methods: RefCell::new(HashMap::new()),
                        statics: RefCell::new(HashMap::new()),
                    });
                    self.push(Value::Object(object));
                }
                OpCode::Inherit => {
                    let parent = self.pop();
                    match (self.peek(0), parent) {
                        (Value::Object(object), Value::Object(parent)) => {
                            // SAFETY: both objects are rooted.
                            unsafe { object.as_ref() }.parent.set(Some(parent));
                        }
                        _ => return Err(self.runtime_error("can only inherit from an object")),
                    }
                }
                OpCode::Method => {
                    let name = self.constant_str(arg as usize)?;
                    let method = self.pop();
                    match (self.peek(0), method) {
                        (Value::Object(object), Value::Closure(method)) => {
                            // SAFETY: the object is rooted on the stack.
                            unsafe { object.as_ref() }
                                .methods
                                .borrow_mut()
                                .insert(name, method);
                        }
                        _ => return Err(self.runtime_error("METHOD needs an object and a closure")),
                    }
                }
                OpCode::Instance => {
                    let object = self.pop();
                    match object {
                        Value::Object(object) => {
                            let instance = self.heap.alloc(ObjInstance {
                                object,
                                fields: RefCell::new(IndexMap::new()),
                            });
                            self.push(Value::Instance(instance));
                        }
                        other => {
                            let message = format!(
                                "can only instantiate objects, found {}",
                                other.type_name()
                            );
                            return Err(self.runtime_error(message));
                        }
                    }
                }

                // ── Enums ───────────────────────────────────────────────────
                OpCode::Enum => {
                    let name = self.constant_str(arg as usize)?;
                    let type_word = self.read_word();
                    let instance_type = match self.constant(type_word as usize) {
                        Constant::Type(t) => t,
                        _ => self.types.t_any,
                    };
                    let enumeration = self.heap.alloc(ObjEnum {
                        name,
                        instance_type,
                        cases: Vec::new(),
                        instances: RefCell::new(Vec::new()),
                    });
                    self.push(Value::Enum(enumeration));
                }
                OpCode::EnumCase => {
                    let name = self.constant_str(arg as usize)?;
                    let value = self.pop();
                    match self.peek(0) {
                        Value::Enum(enumeration) => {
                            // SAFETY: the enum is rooted on the stack.
                            let e = unsafe { enumeration.as_mut() };
                            e.cases.push((name, value));
                            e.instances.borrow_mut().push(None);
                        }
                        _ => return Err(self.runtime_error("ENUM_CASE needs an enum")),
                    }
                }
                OpCode::GetEnumCase => {
                    let value = self.pop();
                    match value {
                        Value::Enum(enumeration) => {
                            let instance = self.enum_case_instance(enumeration, arg as u16)?;
                            self.push(Value::EnumInstance(instance));
                        }
                        other => {
                            let message =
                                format!("expected an enum, found {}", other.type_name());
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::GetEnumCaseValue => {
                    let value = self.pop();
                    match value {
                        Value::EnumInstance(instance) => {
                            // SAFETY: just popped, still rooted via owner.
                            let instance = unsafe { instance.as_ref() };
                            let owner = unsafe { instance.owner.as_ref() };
                            let underlying = owner
                                .cases
                                .get(instance.case as usize)
                                .map(|(_, v)| v.clone())
                                .unwrap_or(Value::Null);
                            self.push(underlying);
                        }
                        other => {
                            let message =
                                format!("expected an enum case, found {}", other.type_name());
                            return Err(self.runtime_error(message));
                        }
                    }
                }

                // ── Strings ─────────────────────────────────────────────────
                OpCode::ToString => {
                    let value = self.pop();
                    let value = match value {
                        Value::Str(_) => value,
                        other => self.intern_string(format!("{other}")),
                    };
                    self.push(value);
                }

                // ── Iteration ───────────────────────────────────────────────
                OpCode::Foreach => {
                    let value_slot = self.read_word() as usize;
                    self.op_foreach(arg as usize, value_slot)?;
                }

                // ── Modules ─────────────────────────────────────────────────
                OpCode::Import => {
                    let fn_word = self.read_word();
                    let packed = self.read_word();
                    let dest_slot = (packed >> 12) as usize;
                    let count = (packed & 0x0fff) as usize;
                    let path = self.constant_str(arg as usize)?;
                    self.op_import(&path, fn_word as usize, dest_slot, count)?;
                }
                OpCode::Export => {
                    let count = arg as usize;
                    let at = self.stack.len() - count;
                    self.pending_exports = self.stack.split_off(at);
                }

                // ── Exceptions ──────────────────────────────────────────────
                OpCode::Throw => {
                    let value = self.pop();
                    self.throw_value(value)?;
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operator helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// `ADD` is polymorphic: numbers, string concatenation, element-wise list
    /// concatenation (fresh list), and right-biased map merge (fresh map).
    fn op_add(&mut self) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => match x.checked_add(*y) {
                Some(n) => self.push(Value::Integer(n)),
                None => self.throw_str("OverflowError")?,
            },
            (Value::Float(x), Value::Float(y)) => self.push(Value::Float(x + y)),
            (Value::Str(x), Value::Str(y)) => {
                // SAFETY: both operands were just on the stack.
                let joined = format!(
                    "{}{}",
                    unsafe { x.as_ref() }.value,
                    unsafe { y.as_ref() }.value
                );
                let value = self.intern_string(joined);
                self.push(value);
            }
            (Value::List(x), Value::List(y)) => {
                // SAFETY: as above.
                let (x, y) = unsafe { (x.as_ref(), y.as_ref()) };
                let mut items = x.items.borrow().clone();
                items.extend(y.items.borrow().iter().cloned());
                let list = self.heap.alloc(ObjList {
                    type_id: x.type_id,
                    items: RefCell::new(items),
                });
                self.push(Value::List(list));
            }
            (Value::Map(x), Value::Map(y)) => {
                // Right-biased merge: duplicate keys take the RHS value.
                // SAFETY: as above.
                let (x, y) = unsafe { (x.as_ref(), y.as_ref()) };
                let mut entries = x.entries.borrow().clone();
                for (k, v) in y.entries.borrow().iter() {
                    entries.insert(*k, v.clone());
                }
                let map = self.heap.alloc(ObjMap {
                    type_id: x.type_id,
                    entries: RefCell::new(entries),
                });
                self.push(Value::Map(map));
            }
            _ => {
                let message =
                    format!("cannot add {} and {}", a.type_name(), b.type_name());
                return Err(self.runtime_error(message));
            }
        }
        Ok(())
    }

    fn op_arith(
        &mut self,
        int_op: impl Fn(i32, i32) -> Option<i32>,
        float_op: impl Fn(f64, f64) -> f64,
        overflow: &str,
    ) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => match int_op(*x, *y) {
                Some(n) => self.push(Value::Integer(n)),
                None => self.throw_str(overflow)?,
            },
            (Value::Float(x), Value::Float(y)) => self.push(Value::Float(float_op(*x, *y))),
            _ => {
                let message = format!(
                    "arithmetic needs matching numeric operands, found {} and {}",
                    a.type_name(),
                    b.type_name()
                );
                return Err(self.runtime_error(message));
            }
        }
        Ok(())
    }

    fn op_bitwise(&mut self, op: impl Fn(i32, i32) -> i32) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => {
                self.push(Value::Integer(op(x, y)));
                Ok(())
            }
            (a, b) => Err(self.runtime_error(format!(
                "bitwise operators need integers, found {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn op_compare(
        &mut self,
        int_cmp: impl Fn(i32, i32) -> bool,
        float_cmp: impl Fn(f64, f64) -> bool,
    ) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => {
                self.push(Value::Bool(int_cmp(*x, *y)));
                Ok(())
            }
            (Value::Float(x), Value::Float(y)) => {
                self.push(Value::Bool(float_cmp(*x, *y)));
                Ok(())
            }
            _ => Err(self.runtime_error(format!(
                "cannot order {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Properties
    // ─────────────────────────────────────────────────────────────────────────

    fn get_property(&mut self, target: &Value, name: &str) -> VmResult<Value> {
        match target {
            Value::Instance(instance) => {
                // SAFETY: the instance was just popped off the stack and is
                // still reachable from the caller.
                let instance_ref = unsafe { instance.as_ref() };
                if let Some(value) = instance_ref.fields.borrow().get(name) {
                    return Ok(value.clone());
                }
                let object = unsafe { instance_ref.object.as_ref() };
                if let Some(method) = object.find_method(name) {
                    let bound = self.heap.alloc(ObjBound {
                        receiver: target.clone(),
                        method,
                    });
                    return Ok(Value::Bound(bound));
                }
                Err(self.runtime_error(format!(
                    "undefined property `{name}` on {}",
                    object.name
                )))
            }
            Value::Object(object) => {
                // SAFETY: as above.
                let object = unsafe { object.as_ref() };
                object
                    .statics
                    .borrow()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| {
                        self.runtime_error(format!(
                            "undefined static `{name}` on {}",
                            object.name
                        ))
                    })
            }
            Value::Enum(enumeration) => {
                // SAFETY: as above.
                let e = unsafe { enumeration.as_ref() };
                match e.cases.iter().position(|(n, _)| n == name) {
                    Some(case) => {
                        let instance = self.enum_case_instance(*enumeration, case as u16)?;
                        Ok(Value::EnumInstance(instance))
                    }
                    None => Err(self.runtime_error(format!(
                        "enum {} has no case `{name}`",
                        e.name
                    ))),
                }
            }
            Value::EnumInstance(instance) if name == "value" => {
                // SAFETY: as above.
                let instance = unsafe { instance.as_ref() };
                let owner = unsafe { instance.owner.as_ref() };
                Ok(owner
                    .cases
                    .get(instance.case as usize)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null))
            }
            other => Err(self.runtime_error(format!(
                "{} has no property `{name}`",
                other.type_name()
            ))),
        }
    }

    fn set_property(&mut self, target: &Value, name: &str, value: Value) -> VmResult<()> {
        match target {
            Value::Instance(instance) => {
                // SAFETY: the instance is rooted by the caller.
                unsafe { instance.as_ref() }
                    .fields
                    .borrow_mut()
                    .insert(name.to_string(), value);
                Ok(())
            }
            Value::Object(object) => {
                // SAFETY: as above.
                unsafe { object.as_ref() }
                    .statics
                    .borrow_mut()
                    .insert(name.to_string(), value);
                Ok(())
            }
            other => Err(self.runtime_error(format!(
                "cannot set property `{name}` on a {}",
                other.type_name()
            ))),
        }
    }

    fn enum_case_instance(
        &mut self,
        enumeration: GcPtr<ObjEnum>,
        case: u16,
    ) -> VmResult<GcPtr<ObjEnumInstance>> {
        // SAFETY: the enum is rooted by the caller.
        let e = unsafe { enumeration.as_ref() };
        if case as usize >= e.cases.len() {
            return Err(self.runtime_error(format!("enum case {case} out of range")));
        }
        if let Some(instance) = e.case_instance(case) {
            return Ok(instance);
        }
        let instance = self.heap.alloc(ObjEnumInstance {
            owner: enumeration,
            case,
        });
        unsafe { enumeration.as_ref() }.instances.borrow_mut()[case as usize] = Some(instance);
        Ok(instance)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscripts
    // ─────────────────────────────────────────────────────────────────────────

    fn get_subscript(&mut self, target: &Value, index: &Value) -> VmResult<Value> {
        match (target, index) {
            (Value::List(list), Value::Integer(i)) => {
                // SAFETY: the list is rooted by the caller.
                let items = unsafe { list.as_ref() }.items.borrow();
                if *i < 0 {
                    return Ok(Value::Null);
                }
                Ok(items.get(*i as usize).cloned().unwrap_or(Value::Null))
            }
            (Value::Map(map), key) => match MapKey::from_value(key) {
                // SAFETY: as above.
                Some(key) => Ok(unsafe { map.as_ref() }
                    .entries
                    .borrow()
                    .get(&key)
                    .cloned()
                    .unwrap_or(Value::Null)),
                None => Err(self.runtime_error(format!(
                    "{} cannot be a map key",
                    key.type_name()
                ))),
            },
            (Value::Str(s), Value::Integer(i)) => {
                if *i < 0 {
                    return Ok(Value::Null);
                }
                // SAFETY: as above.
                let ch = unsafe { s.as_ref() }.value.chars().nth(*i as usize);
                Ok(match ch {
                    Some(c) => self.intern_string(c.to_string()),
                    None => Value::Null,
                })
            }
            (target, index) => Err(self.runtime_error(format!(
                "cannot index {} with {}",
                target.type_name(),
                index.type_name()
            ))),
        }
    }

    /// Returns `false` when the assignment threw (the result push must be
    /// skipped — the throw machinery owns the stack now).
    fn set_subscript(&mut self, target: &Value, index: &Value, value: Value) -> VmResult<bool> {
        match (target, index) {
            (Value::List(list), Value::Integer(i)) => {
                let in_bounds = {
                    // SAFETY: the list is rooted by the caller.
                    let mut items = unsafe { list.as_ref() }.items.borrow_mut();
                    if *i >= 0 && (*i as usize) < items.len() {
                        items[*i as usize] = value;
                        true
                    } else {
                        false
                    }
                };
                if !in_bounds {
                    self.throw_str("OutOfBoundError")?;
                    return Ok(false);
                }
                Ok(true)
            }
            (Value::Map(map), key) => match MapKey::from_value(key) {
                Some(key) => {
                    // SAFETY: as above.
                    unsafe { map.as_ref() }.entries.borrow_mut().insert(key, value);
                    Ok(true)
                }
                None => Err(self.runtime_error(format!(
                    "{} cannot be a map key",
                    key.type_name()
                ))),
            },
            (target, _) => Err(self.runtime_error(format!(
                "cannot assign into a {} subscript",
                target.type_name()
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invoke (property lookup + call fast path)
    // ─────────────────────────────────────────────────────────────────────────

    fn invoke(
        &mut self,
        name: &str,
        arg_count: usize,
        catches: Vec<GcPtr<ObjClosure>>,
    ) -> VmResult<()> {
        let receiver_idx = self.stack.len() - arg_count - 1;
        let receiver = self.stack[receiver_idx].clone();

        match &receiver {
            Value::Instance(instance) => {
                // SAFETY: the receiver is rooted on the stack.
                let instance_ref = unsafe { instance.as_ref() };
                // A function-valued field shadows a method of the same name.
                let field = instance_ref.fields.borrow().get(name).cloned();
                if let Some(field) = field {
                    if matches!(
                        field,
                        Value::Closure(_) | Value::Bound(_) | Value::Native(_)
                    ) {
                        self.stack[receiver_idx] = field;
                        return self.call_value(arg_count, catches);
                    }
                }
                let object = unsafe { instance_ref.object.as_ref() };
                match object.find_method(name) {
                    // The receiver stays at slot 0 (`this`).
                    Some(method) => self.call_closure(method, arg_count, catches),
                    None => Err(self.runtime_error(format!(
                        "undefined method `{name}` on {}",
                        object.name
                    ))),
                }
            }
            Value::Object(object) => {
                // SAFETY: as above.
                let object = unsafe { object.as_ref() };
                match object.statics.borrow().get(name).cloned() {
                    Some(callee) => {
                        self.stack[receiver_idx] = callee;
                        self.call_value(arg_count, catches)
                    }
                    None => Err(self.runtime_error(format!(
                        "undefined static `{name}` on {}",
                        object.name
                    ))),
                }
            }
            Value::List(_) | Value::Map(_) | Value::Str(_) | Value::Range(_) => {
                self.invoke_builtin(&receiver, name, arg_count)
            }
            other => Err(self.runtime_error(format!(
                "{} has no method `{name}`",
                other.type_name()
            ))),
        }
    }

    /// Built-in methods on container values. Arguments and the receiver are
    /// replaced by the result.
    fn invoke_builtin(&mut self, receiver: &Value, name: &str, arg_count: usize) -> VmResult<()> {
        let receiver_idx = self.stack.len() - arg_count - 1;
        let args: Vec<Value> = self.stack[receiver_idx + 1..].to_vec();

        let result = match (receiver, name) {
            (Value::List(list), "append") => {
                // SAFETY: the receiver is rooted on the stack.
                unsafe { list.as_ref() }
                    .items
                    .borrow_mut()
                    .push(args[0].clone());
                Value::Null
            }
            (Value::List(list), "len") => {
                // SAFETY: as above.
                Value::Integer(unsafe { list.as_ref() }.items.borrow().len() as i32)
            }
            (Value::List(list), "pop") => {
                // SAFETY: as above.
                unsafe { list.as_ref() }
                    .items
                    .borrow_mut()
                    .pop()
                    .unwrap_or(Value::Null)
            }
            (Value::List(list), "remove") => match &args[0] {
                Value::Integer(i) => {
                    // SAFETY: as above.
                    let mut items = unsafe { list.as_ref() }.items.borrow_mut();
                    if *i >= 0 && (*i as usize) < items.len() {
                        items.remove(*i as usize)
                    } else {
                        Value::Null
                    }
                }
                _ => Value::Null,
            },
            (Value::Map(map), "size") => {
                // SAFETY: as above.
                Value::Integer(unsafe { map.as_ref() }.entries.borrow().len() as i32)
            }
            (Value::Map(map), "remove") => match MapKey::from_value(&args[0]) {
                Some(key) => {
                    // SAFETY: as above.
                    unsafe { map.as_ref() }
                        .entries
                        .borrow_mut()
                        .shift_remove(&key)
                        .unwrap_or(Value::Null)
                }
                None => Value::Null,
            },
            (Value::Map(map), "keys") => {
                // SAFETY: as above.
                let map_ref = unsafe { map.as_ref() };
                let keys: Vec<Value> =
                    map_ref.entries.borrow().keys().map(|k| k.to_value()).collect();
                let type_id = self.map_side_list_type(map_ref.type_id, true);
                Value::List(self.heap.alloc(ObjList {
                    type_id,
                    items: RefCell::new(keys),
                }))
            }
            (Value::Map(map), "values") => {
                // SAFETY: as above.
                let map_ref = unsafe { map.as_ref() };
                let values: Vec<Value> =
                    map_ref.entries.borrow().values().cloned().collect();
                let type_id = self.map_side_list_type(map_ref.type_id, false);
                Value::List(self.heap.alloc(ObjList {
                    type_id,
                    items: RefCell::new(values),
                }))
            }
            (Value::Str(s), "len") => {
                // SAFETY: as above.
                Value::Integer(unsafe { s.as_ref() }.value.chars().count() as i32)
            }
            (Value::Range(range), "toList") => {
                // SAFETY: as above.
                let r = unsafe { range.as_ref() };
                let step: i32 = if r.high >= r.low { 1 } else { -1 };
                let mut items = Vec::with_capacity(r.len() as usize);
                let mut current = r.low;
                while current != r.high {
                    items.push(Value::Integer(current));
                    current += step;
                }
                let type_id = self
                    .types
                    .lookup(
                        TypeKind::List {
                            item: self.types.t_int,
                        },
                        false,
                    )
                    .unwrap_or(self.types.t_any);
                Value::List(self.heap.alloc(ObjList {
                    type_id,
                    items: RefCell::new(items),
                }))
            }
            (Value::Range(range), "len") => {
                // SAFETY: as above.
                Value::Integer(unsafe { range.as_ref() }.len() as i32)
            }
            (Value::Range(range), "low") => {
                // SAFETY: as above.
                Value::Integer(unsafe { range.as_ref() }.low)
            }
            (Value::Range(range), "high") => {
                // SAFETY: as above.
                Value::Integer(unsafe { range.as_ref() }.high)
            }
            (receiver, name) => {
                return Err(self.runtime_error(format!(
                    "{} has no method `{name}`",
                    receiver.type_name()
                )))
            }
        };

        self.stack.truncate(receiver_idx);
        self.push(result);
        Ok(())
    }

    /// The `[key]` / `[value]` list type for a map's `keys()` / `values()`.
    fn map_side_list_type(&self, map_type: TypeId, keys: bool) -> TypeId {
        match self.types.get(map_type).kind {
            TypeKind::Map { key, value } => {
                let item = if keys { key } else { value };
                self.types
                    .lookup(TypeKind::List { item }, false)
                    .unwrap_or(self.types.t_any)
            }
            _ => self.types.t_any,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Foreach
    // ─────────────────────────────────────────────────────────────────────────

    /// Advance one iteration: the iterable sits on the stack top, the key and
    /// value locals receive the next pair. Exhaustion writes `null` into the
    /// key slot.
    fn op_foreach(&mut self, key_slot: usize, value_slot: usize) -> VmResult<()> {
        let base = self.frames.last().expect("frame").slot_base;
        let key_abs = base + key_slot;
        let value_abs = base + value_slot;
        let iterable = self.peek(0).clone();
        let previous_key = self.stack[key_abs].clone();

        let next: Option<(Value, Value)> = match &iterable {
            Value::List(list) => {
                let index = match previous_key {
                    Value::Null => 0usize,
                    Value::Integer(i) => i as usize + 1,
                    _ => 0,
                };
                // SAFETY: the iterable is rooted on the stack.
                let items = unsafe { list.as_ref() }.items.borrow();
                items
                    .get(index)
                    .map(|item| (Value::Integer(index as i32), item.clone()))
            }
            Value::Range(range) => {
                // SAFETY: as above.
                let r = unsafe { range.as_ref() };
                let index = match previous_key {
                    Value::Null => 0i64,
                    Value::Integer(i) => i as i64 + 1,
                    _ => 0,
                };
                if index < r.len() {
                    let step: i64 = if r.high >= r.low { 1 } else { -1 };
                    let item = r.low as i64 + index * step;
                    Some((Value::Integer(index as i32), Value::Integer(item as i32)))
                } else {
                    None
                }
            }
            Value::Str(s) => {
                let index = match previous_key {
                    Value::Null => 0usize,
                    Value::Integer(i) => i as usize + 1,
                    _ => 0,
                };
                // SAFETY: as above.
                let ch = unsafe { s.as_ref() }.value.chars().nth(index);
                ch.map(|c| (Value::Integer(index as i32), c.to_string()))
                    .map(|(k, s)| {
                        let v = self.intern_string(s);
                        (k, v)
                    })
            }
            Value::Map(map) => {
                // SAFETY: as above.
                let entries = unsafe { map.as_ref() }.entries.borrow();
                let index = match MapKey::from_value(&previous_key) {
                    _ if previous_key.is_null() => 0usize,
                    Some(key) => match entries.get_index_of(&key) {
                        Some(i) => i + 1,
                        None => entries.len(),
                    },
                    None => entries.len(),
                };
                entries
                    .get_index(index)
                    .map(|(k, v)| (k.to_value(), v.clone()))
            }
            Value::Enum(enumeration) => {
                let index = match previous_key {
                    Value::Null => 0usize,
                    Value::Integer(i) => i as usize + 1,
                    _ => 0,
                };
                // SAFETY: as above.
                let case_count = unsafe { enumeration.as_ref() }.cases.len();
                if index < case_count {
                    let instance = self.enum_case_instance(*enumeration, index as u16)?;
                    Some((Value::Integer(index as i32), Value::EnumInstance(instance)))
                } else {
                    None
                }
            }
            other => {
                return Err(self.runtime_error(format!(
                    "{} is not iterable",
                    other.type_name()
                )))
            }
        };

        match next {
            Some((key, value)) => {
                self.stack[key_abs] = key;
                self.stack[value_abs] = value;
            }
            None => {
                self.stack[key_abs] = Value::Null;
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Imports
    // ─────────────────────────────────────────────────────────────────────────

    /// Run an imported module (once per process) and splice its exports into
    /// this module's globals region.
    fn op_import(
        &mut self,
        path: &str,
        fn_const: usize,
        dest_slot: usize,
        count: usize,
    ) -> VmResult<()> {
        let globals_base = self.frames.last().expect("frame").globals_base;

        if !self.module_exports.contains_key(path) {
            let proto = match self.constant(fn_const) {
                Constant::Function(proto) => proto,
                other => {
                    let message = format!("IMPORT needs a module function, found {other}");
                    return Err(self.runtime_error(message));
                }
            };
            log::debug!("running module `{path}`");
            let module_base = self.reserve_module_globals(proto.globals_count);
            let closure = self.heap.alloc(ObjClosure {
                proto,
                upvalues: Vec::new(),
                globals_base: module_base,
            });
            self.stack.push(Value::Closure(closure));
            let floor = self.frames.len();
            self.frames.push(CallFrame {
                closure,
                ip: 0,
                slot_base: self.stack.len() - 1,
                catches: Vec::new(),
                globals_base: module_base,
            });
            self.dispatch(floor)?;
            // The module's script frame returned; drop its result.
            self.pop();
            let exports = std::mem::take(&mut self.pending_exports);
            self.module_exports.insert(path.to_string(), exports);
        }

        let exports = self.module_exports.get(path).cloned().unwrap_or_default();
        if exports.len() != count {
            return Err(self.runtime_error(format!(
                "module `{path}` exported {} symbols, expected {count}",
                exports.len()
            )));
        }
        for (i, value) in exports.into_iter().enumerate() {
            let idx = globals_base + dest_slot + i;
            if self.globals.len() <= idx {
                self.globals.resize(idx + 1, Value::Null);
            }
            self.globals[idx] = value;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{generate_with_mode, RunMode};
    use crate::modules::ModuleRegistry;

    /// Compile and run a source snippet, returning its captured output.
    fn run(src: &str) -> Result<String, String> {
        run_mode(src, RunMode::Run)
    }

    fn run_mode(src: &str, mode: RunMode) -> Result<String, String> {
        let mut types = TypeRegistry::new();
        let mut modules = ModuleRegistry::new();
        let (tokens, lex_errors) = crate::lexer::lex(src);
        if !lex_errors.is_empty() {
            return Err(format!("lex: {lex_errors:?}"));
        }
        let (program, errors) =
            crate::parser::parse(tokens, &mut types, &mut modules, "<test>", None, true);
        let program = program.ok_or_else(|| format!("parse: {errors:?}"))?;
        let proto =
            generate_with_mode(&program, &types, mode).map_err(|e| format!("codegen: {e:?}"))?;

        let mut heap = GcHeap::new();
        let mut vm = Vm::new(&mut heap, &types);
        let output = vm.capture_output();
        vm.interpret(proto).map_err(|e| e.to_string())?;
        let text = output.borrow().clone();
        Ok(text)
    }

    #[test]
    fn test_hello_world() {
        assert_eq!(run(r#"print("hello");"#).unwrap(), "hello\n");
    }

    #[test]
    fn test_empty_script_produces_no_output() {
        assert_eq!(run("").unwrap(), "");
    }

    #[test]
    fn test_arithmetic_and_interpolation() {
        assert_eq!(run(r#"print("{1 + 2 * 3}");"#).unwrap(), "7\n");
        assert_eq!(run(r#"print("{10 % 3} {7 / 2}");"#).unwrap(), "1 3\n");
    }

    #[test]
    fn test_foreach_over_ascending_range() {
        let src = r#"int s = 0; foreach (int n in 0..10) { s = s + n; } print("{s}");"#;
        assert_eq!(run(src).unwrap(), "45\n");
    }

    #[test]
    fn test_foreach_over_descending_range() {
        let src = r#"int s = 0; foreach (int n in 10..0) { s = s + n; } print("{s}");"#;
        assert_eq!(run(src).unwrap(), "55\n");
    }

    #[test]
    fn test_foreach_over_list_and_map() {
        let src = r#"
            int total = 0;
            foreach (int i, int v in [10, 20, 30]) { total = total + i + v; }
            {str, int} m = {"a": 1, "b": 2};
            foreach (str k, int v in m) { total = total + v; }
            print("{total}");
        "#;
        assert_eq!(run(src).unwrap(), "66\n");
    }

    #[test]
    fn test_foreach_over_string_yields_codepoints() {
        let src = r#"
            str acc = "";
            foreach (str c in "abc") { acc = acc + c + "."; }
            print(acc);
        "#;
        assert_eq!(run(src).unwrap(), "a.b.c.\n");
    }

    #[test]
    fn test_while_and_do_until() {
        let src = r#"
            int n = 0;
            while (n < 5) { n = n + 1; }
            do { n = n + 1; } until (n == 10);
            print("{n}");
        "#;
        assert_eq!(run(src).unwrap(), "10\n");
    }

    #[test]
    fn test_for_loop_with_break_and_continue() {
        let src = r#"
            int s = 0;
            for (int i = 0; i < 100; i = i + 1) {
                if (i % 2 == 1) { continue; }
                if (i >= 10) { break; }
                s = s + i;
            }
            print("{s}");
        "#;
        assert_eq!(run(src).unwrap(), "20\n");
    }

    #[test]
    fn test_functions_named_args_and_defaults() {
        let src = r#"
            fun greet(str who, str greeting = "hello") > str {
                return "{greeting} {who}";
            }
            print(greet("world"));
            print(greet(greeting: "hi", who: "buzz"));
            print(greet($: "again"));
        "#;
        assert_eq!(run(src).unwrap(), "hello world\nhi buzz\nhello again\n");
    }

    #[test]
    fn test_mutable_defaults_do_not_share_state() {
        let src = r#"
            fun bump([int] xs = []) > int {
                xs.append(1);
                return xs.len();
            }
            print("{bump()} {bump()}");
        "#;
        assert_eq!(run(src).unwrap(), "1 1\n");
    }

    #[test]
    fn test_closures_share_upvalues() {
        let src = r#"
            fun counter() > fun() > int {
                int n = 0;
                fun bump() > int {
                    n = n + 1;
                    return n;
                }
                return bump;
            }
            fun() > int c = counter();
            c();
            c();
            print("{c()}");
        "#;
        assert_eq!(run(src).unwrap(), "3\n");
    }

    #[test]
    fn test_object_defaults_are_fresh_per_instance() {
        let src = r#"
            object A { [int] xs = [1, 2, 3] }
            A a = A{};
            A b = A{};
            a.xs.append(4);
            print("{a.xs.len()} {b.xs.len()}");
        "#;
        assert_eq!(run(src).unwrap(), "4 3\n");
    }

    #[test]
    fn test_object_methods_and_inheritance() {
        let src = r#"
            object Animal {
                str name = "animal"
                fun speak() > str { return "..."; }
                fun describe() > str { return "{this.name} says {this.speak()}"; }
            }
            object Dog < Animal {
                fun speak() > str { return "woof"; }
                fun loud() > str { return super.speak() + "!"; }
            }
            Dog d = Dog{ name = "rex" };
            print(d.describe());
            print(d.loud());
        "#;
        assert_eq!(run(src).unwrap(), "rex says woof\n...!\n");
    }

    #[test]
    fn test_enum_cases_and_values() {
        let src = r#"
            enum(str) Color { red, green, blue }
            print("{Color.green.value}");
            int n = 0;
            foreach (Color c in Color) { n = n + 1; }
            print("{n}");
        "#;
        assert_eq!(run(src).unwrap(), "green\n3\n");
    }

    #[test]
    fn test_optionals_null_coalescing_and_unwrap() {
        let src = r#"
            int? missing = null;
            print("{missing ?? 42}");
            int? present = 7;
            print("{present ?? 0}");
        "#;
        assert_eq!(run(src).unwrap(), "42\n7\n");
    }

    #[test]
    fn test_throw_and_catch_clause() {
        let src = r#"
            fun risky(bool explode) > int {
                if (explode) { throw "boom"; }
                return 1;
            }
            int ok = risky(false) catch fun (str e) > int { return -1; };
            int caught = risky(true) catch fun (str e) > int { return -1; };
            print("{ok} {caught}");
        "#;
        assert_eq!(run(src).unwrap(), "1 -1\n");
    }

    #[test]
    fn test_unhandled_throw_reports_error() {
        let err = run(r#"throw "kaboom";"#).unwrap_err();
        assert!(err.contains("kaboom"), "unexpected error: {err}");
    }

    #[test]
    fn test_integer_overflow_throws_catchable_value() {
        let src = r#"
            fun add(int a, int b) > int { return a + b; }
            int r = add(2147483647, 1) catch fun (str e) > int { return -1; };
            print("{r}");
        "#;
        assert_eq!(run(src).unwrap(), "-1\n");
    }

    #[test]
    fn test_integer_overflow_uncaught_is_runtime_error() {
        let err = run("int big = 2147483647; int r = big + 1;").unwrap_err();
        assert!(err.contains("OverflowError"), "unexpected error: {err}");
    }

    #[test]
    fn test_float_ops_do_not_throw() {
        let src = r#"print("{1.5 + 2.25}");"#;
        assert_eq!(run(src).unwrap(), "3.75\n");
    }

    #[test]
    fn test_range_to_list_length_law() {
        let src = r#"
            assert((3..9).toList().len() == 6);
            assert((9..3).toList().len() == 6);
            assert((0..0).toList().len() == 0);
            print("ok");
        "#;
        assert_eq!(run(src).unwrap(), "ok\n");
    }

    #[test]
    fn test_parse_int_to_string_roundtrip() {
        let src = r#"
            foreach (int n in [0, 1, -1, 42, 2147483647, -2147483647 - 1]) {
                assert(parseInt(toString(n))! == n, message: "roundtrip failed");
            }
            print("ok");
        "#;
        assert_eq!(run(src).unwrap(), "ok\n");
    }

    #[test]
    fn test_list_and_map_add_are_fresh_containers() {
        let src = r#"
            [int] a = [1, 2];
            [int] b = [3];
            [int] c = a + b;
            c.append(4);
            print("{a.len()} {b.len()} {c.len()}");
            {str, int} m = {"x": 1} + {"x": 2, "y": 3};
            print("{m["x"]!} {m.size()}");
        "#;
        assert_eq!(run(src).unwrap(), "2 1 4\n2 2\n");
    }

    #[test]
    fn test_is_operator() {
        let src = r#"
            object Base { int x = 0 }
            object Child < Base { }
            Base c = Child{};
            print("{c is Base} {c is Child} {1 is float}");
        "#;
        assert_eq!(run(src).unwrap(), "true true false\n");
    }

    #[test]
    fn test_string_interning_gives_identical_objects() {
        // Content-equal strings built at runtime compare equal (pointer
        // equality under the hood).
        let src = r#"
            str a = "he" + "llo";
            str b = "hel" + "lo";
            print("{a == b}");
        "#;
        assert_eq!(run(src).unwrap(), "true\n");
    }

    #[test]
    fn test_test_mode_reports_checkmarks() {
        let out = run_mode(
            r#"test "add" { assert(1 + 2 == 3, message: "ok"); }"#,
            RunMode::Test,
        )
        .unwrap();
        assert_eq!(out, "\u{2713} add\n");
    }

    #[test]
    fn test_failing_test_surfaces_assert_message() {
        let err = run_mode(
            r#"test "bad" { assert(1 == 2, message: "expected equality"); }"#,
            RunMode::Test,
        )
        .unwrap_err();
        assert!(err.contains("expected equality"), "unexpected: {err}");
    }

    #[test]
    fn test_cycle_limit_terminates_runaway_loop() {
        let mut types = TypeRegistry::new();
        let mut modules = ModuleRegistry::new();
        let (tokens, _) = crate::lexer::lex("while (true) { }");
        let (program, _) =
            crate::parser::parse(tokens, &mut types, &mut modules, "<test>", None, true);
        let proto = crate::codegen::generate(&program.unwrap(), &types).unwrap();
        let mut heap = GcHeap::new();
        let mut vm = Vm::new(&mut heap, &types);
        vm.set_cycle_limit(10_000);
        let err = vm.interpret(proto).unwrap_err();
        assert!(err.message.contains("cycle limit"));
    }

    #[test]
    fn test_gc_survives_allocation_churn() {
        let src = r#"
            str acc = "";
            for (int i = 0; i < 200; i = i + 1) {
                [int] scratch = [i, i + 1, i + 2];
                acc = "{scratch.len()}";
            }
            print(acc);
        "#;
        assert_eq!(run(src).unwrap(), "3\n");
    }
}
