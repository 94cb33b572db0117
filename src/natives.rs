//! Native (Rust) functions exposed to Buzz programs, and the ABI they follow.
//!
//! # Calling convention
//!
//! A native receives a [`NativeCtx`] wrapping the VM. It reads its arguments
//! from the VM stack with [`NativeCtx::peek`] (distance 0 is the last
//! argument), optionally pushes a single return value with
//! [`NativeCtx::push`], and returns how many values it pushed (0 or 1).
//! Failures surface by returning a [`NativeError`], which the VM throws as a
//! first-class string value — catchable like any other throw.
//!
//! Natives must not retain `Value`s across the call without rooting them; the
//! GC may run as soon as the native returns.
//!
//! # Registration
//!
//! [`all`] lists every native in slot order. The parser seeds its global
//! scope from this list (so natives type-check like ordinary globals) and the
//! VM materialises the same list into the first global slots of every module,
//! so the two sides agree by construction.

use crate::ast::{Expr, ExprKind};
use crate::token::Span;
use crate::types::{FnKind, FunctionType, TypeId, TypeRegistry};
use crate::value::Value;
use crate::vm::Vm;

// ─────────────────────────────────────────────────────────────────────────────
// ABI types
// ─────────────────────────────────────────────────────────────────────────────

/// The context handed to a native function.
pub struct NativeCtx<'c, 'a> {
    pub vm: &'c mut Vm<'a>,
}

impl NativeCtx<'_, '_> {
    /// Peek at the stack: distance 0 is the top (the last argument).
    #[inline]
    pub fn peek(&self, distance: usize) -> &Value {
        self.vm.peek(distance)
    }

    /// Push a return value.
    #[inline]
    pub fn push(&mut self, value: Value) {
        self.vm.push(value);
    }
}

/// A failure raised by a native function; thrown by the VM.
#[derive(Debug, Clone)]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        NativeError {
            message: message.into(),
        }
    }
}

/// The signature every native function implements.
pub type NativeFn = fn(NativeCtx) -> Result<usize, NativeError>;

// ─────────────────────────────────────────────────────────────────────────────
// Registration table
// ─────────────────────────────────────────────────────────────────────────────

/// A registered native: its name, arity, implementation, and a builder for
/// its Buzz-visible function type.
pub struct NativeDecl {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
    pub signature: fn(&mut TypeRegistry) -> TypeId,
}

/// Every native, in global-slot order.
pub fn all() -> &'static [NativeDecl] {
    &[
        NativeDecl {
            name: "print",
            arity: 1,
            function: native_print,
            signature: sig_print,
        },
        NativeDecl {
            name: "toString",
            arity: 1,
            function: native_to_string,
            signature: sig_to_string,
        },
        NativeDecl {
            name: "parseInt",
            arity: 1,
            function: native_parse_int,
            signature: sig_parse_int,
        },
        NativeDecl {
            name: "parseFloat",
            arity: 1,
            function: native_parse_float,
            signature: sig_parse_float,
        },
        NativeDecl {
            name: "assert",
            arity: 2,
            function: native_assert,
            signature: sig_assert,
        },
        NativeDecl {
            name: "args",
            arity: 0,
            function: native_args,
            signature: sig_args,
        },
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Signatures
// ─────────────────────────────────────────────────────────────────────────────

fn sig_print(reg: &mut TypeRegistry) -> TypeId {
    let params = vec![("value".to_string(), reg.t_str)];
    reg.function_of(FunctionType {
        params,
        defaults: vec![None],
        ret: reg.t_void,
        kind: FnKind::Extern,
    })
}

fn sig_to_string(reg: &mut TypeRegistry) -> TypeId {
    let params = vec![("value".to_string(), reg.t_any)];
    reg.function_of(FunctionType {
        params,
        defaults: vec![None],
        ret: reg.t_str,
        kind: FnKind::Extern,
    })
}

fn sig_parse_int(reg: &mut TypeRegistry) -> TypeId {
    let ret = reg.optional_of(reg.t_int);
    let params = vec![("value".to_string(), reg.t_str)];
    reg.function_of(FunctionType {
        params,
        defaults: vec![None],
        ret,
        kind: FnKind::Extern,
    })
}

fn sig_parse_float(reg: &mut TypeRegistry) -> TypeId {
    let ret = reg.optional_of(reg.t_float);
    let params = vec![("value".to_string(), reg.t_str)];
    reg.function_of(FunctionType {
        params,
        defaults: vec![None],
        ret,
        kind: FnKind::Extern,
    })
}

fn sig_assert(reg: &mut TypeRegistry) -> TypeId {
    let params = vec![
        ("condition".to_string(), reg.t_bool),
        ("message".to_string(), reg.t_str),
    ];
    let default_message = reg.add_fragment(Expr {
        kind: ExprKind::StringLit("assertion failed".to_string()),
        ty: reg.t_str,
        span: Span::dummy(),
    });
    reg.function_of(FunctionType {
        params,
        defaults: vec![None, Some(default_message)],
        ret: reg.t_void,
        kind: FnKind::Extern,
    })
}

fn sig_args(reg: &mut TypeRegistry) -> TypeId {
    let ret = reg.list_of(reg.t_str);
    reg.function_of(FunctionType {
        params: Vec::new(),
        defaults: Vec::new(),
        ret,
        kind: FnKind::Extern,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Implementations
// ─────────────────────────────────────────────────────────────────────────────

/// `print(str value) > void` — writes the value and a newline.
fn native_print(ctx: NativeCtx) -> Result<usize, NativeError> {
    let text = format!("{}", ctx.peek(0));
    ctx.vm.write_out(&text);
    ctx.vm.write_out("\n");
    Ok(0)
}

/// `toString(any value) > str`
fn native_to_string(mut ctx: NativeCtx) -> Result<usize, NativeError> {
    let rendered = format!("{}", ctx.peek(0));
    let value = ctx.vm.intern_string(rendered);
    ctx.push(value);
    Ok(1)
}

/// `parseInt(str value) > int?`
fn native_parse_int(mut ctx: NativeCtx) -> Result<usize, NativeError> {
    let parsed = match ctx.peek(0) {
        // SAFETY: the argument is rooted on the VM stack.
        Value::Str(s) => unsafe { s.as_ref() }.value.trim().parse::<i32>().ok(),
        _ => None,
    };
    ctx.push(parsed.map(Value::Integer).unwrap_or(Value::Null));
    Ok(1)
}

/// `parseFloat(str value) > float?`
fn native_parse_float(mut ctx: NativeCtx) -> Result<usize, NativeError> {
    let parsed = match ctx.peek(0) {
        // SAFETY: the argument is rooted on the VM stack.
        Value::Str(s) => unsafe { s.as_ref() }.value.trim().parse::<f64>().ok(),
        _ => None,
    };
    ctx.push(parsed.map(Value::Float).unwrap_or(Value::Null));
    Ok(1)
}

/// `assert(bool condition, str message = "assertion failed") > void`
fn native_assert(ctx: NativeCtx) -> Result<usize, NativeError> {
    let condition = ctx.peek(1).is_truthy();
    if condition {
        Ok(0)
    } else {
        let message = format!("{}", ctx.peek(0));
        Err(NativeError::new(message))
    }
}

/// `args() > [str]` — the script arguments passed on the command line.
fn native_args(mut ctx: NativeCtx) -> Result<usize, NativeError> {
    let value = ctx.vm.script_args_list();
    ctx.push(value);
    Ok(1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_names_are_unique() {
        let mut names: Vec<&str> = all().iter().map(|n| n.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), all().len());
    }

    #[test]
    fn test_signatures_build() {
        let mut reg = TypeRegistry::new();
        for decl in all() {
            let ty = (decl.signature)(&mut reg);
            match &reg.get(ty).kind {
                crate::types::TypeKind::Function(ft) => {
                    assert_eq!(ft.params.len(), decl.arity as usize, "{}", decl.name);
                }
                other => panic!("native {} has non-function type {other:?}", decl.name),
            }
        }
    }
}
