//! Runtime values for the Buzz VM.
//!
//! The [`Value`] enum is the central representation of all data at runtime.
//! Scalar values (`Integer`, `Float`, `Bool`, `Null`, reified types) are
//! stored inline and are freely copyable. Heap-allocated objects are accessed
//! through a [`GcPtr`] so the garbage collector can track them.
//!
//! # Object variants
//!
//! | Variant | Heap type | Notes |
//! |---------|-----------|-------|
//! | `Value::Str` | [`ObjString`] | Immutable UTF-8, interned by content |
//! | `Value::List` | [`ObjList`] | Typed growable `Vec<Value>` |
//! | `Value::Map` | [`ObjMap`] | Typed insertion-ordered mapping |
//! | `Value::Range` | [`ObjRange`] | `low..high`, low inclusive, high exclusive |
//! | `Value::Closure` | [`ObjClosure`] | Function prototype + captured upvalues |
//! | `Value::Bound` | [`ObjBound`] | A method bound to its receiver |
//! | `Value::Object` | [`ObjObject`] | A class-like object declaration |
//! | `Value::Instance` | [`ObjInstance`] | An instance of an object |
//! | `Value::Enum` | [`ObjEnum`] | An enum declaration |
//! | `Value::EnumInstance` | [`ObjEnumInstance`] | One case of an enum |
//! | `Value::Native` | [`ObjNative`] | Rust native function |
//!
//! Function prototypes themselves ([`FnProto`]) are immutable compile-time
//! artifacts shared via `Rc`; every callable function value at runtime is a
//! closure wrapping one.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::FnProto;
use crate::gc::{GcHeap, GcPtr, GcTrace};
use crate::natives::NativeFn;
use crate::types::TypeId;

// ─────────────────────────────────────────────────────────────────────────────
// Value
// ─────────────────────────────────────────────────────────────────────────────

/// A runtime value in the Buzz VM.
#[derive(Clone, Debug)]
pub enum Value {
    /// The null value.
    Null,
    Bool(bool),
    /// 32-bit signed integer.
    Integer(i32),
    /// 64-bit IEEE-754 float.
    Float(f64),
    /// A reified type descriptor. Type descriptors live in the process-wide
    /// registry, so this is a plain handle, not a heap reference.
    Type(TypeId),
    Str(GcPtr<ObjString>),
    List(GcPtr<ObjList>),
    Map(GcPtr<ObjMap>),
    Range(GcPtr<ObjRange>),
    Closure(GcPtr<ObjClosure>),
    Bound(GcPtr<ObjBound>),
    Object(GcPtr<ObjObject>),
    Instance(GcPtr<ObjInstance>),
    Enum(GcPtr<ObjEnum>),
    EnumInstance(GcPtr<ObjEnumInstance>),
    Native(GcPtr<ObjNative>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            // Strings are interned, so pointer equality is content equality.
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => {
                // SAFETY: both operands are live (they are being compared).
                let (a, b) = unsafe { (a.as_ref(), b.as_ref()) };
                a.low == b.low && a.high == b.high
            }
            (Value::Closure(a), Value::Closure(b)) => a == b,
            (Value::Bound(a), Value::Bound(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Instance(a), Value::Instance(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::EnumInstance(a), Value::EnumInstance(b)) => {
                // SAFETY: both operands are live.
                let (a, b) = unsafe { (a.as_ref(), b.as_ref()) };
                a.owner == b.owner && a.case == b.case
            }
            (Value::Native(a), Value::Native(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// `true` for every value except `null` and `false`.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// A human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::Type(_) => "type",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Range(_) => "range",
            Value::Closure(_) | Value::Bound(_) | Value::Native(_) => "function",
            Value::Object(_) => "object",
            Value::Instance(_) => "instance",
            Value::Enum(_) => "enum",
            Value::EnumInstance(_) => "enum case",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{n:.1}")
                } else {
                    write!(f, "{n}")
                }
            }
            Value::Type(t) => write!(f, "<type #{t}>"),
            Value::Str(s) => {
                // SAFETY: displayed values are live (reachable from a root).
                write!(f, "{}", unsafe { s.as_ref() }.value)
            }
            Value::List(l) => {
                let l = unsafe { l.as_ref() };
                write!(f, "[")?;
                for (i, v) in l.items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                let m = unsafe { m.as_ref() };
                write!(f, "{{")?;
                for (i, (k, v)) in m.entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {v}", k.to_value())?;
                }
                write!(f, "}}")
            }
            Value::Range(r) => {
                let r = unsafe { r.as_ref() };
                write!(f, "{}..{}", r.low, r.high)
            }
            Value::Closure(c) => {
                let c = unsafe { c.as_ref() };
                write!(f, "<fn {}>", c.proto.name)
            }
            Value::Bound(b) => {
                let b = unsafe { b.as_ref() };
                let m = unsafe { b.method.as_ref() };
                write!(f, "<fn {}>", m.proto.name)
            }
            Value::Object(o) => {
                let o = unsafe { o.as_ref() };
                write!(f, "<object {}>", o.name)
            }
            Value::Instance(i) => {
                let i = unsafe { i.as_ref() };
                let o = unsafe { i.object.as_ref() };
                write!(f, "<{} instance>", o.name)
            }
            Value::Enum(e) => {
                let e = unsafe { e.as_ref() };
                write!(f, "<enum {}>", e.name)
            }
            Value::EnumInstance(e) => {
                let e = unsafe { e.as_ref() };
                let owner = unsafe { e.owner.as_ref() };
                let case = owner
                    .cases
                    .get(e.case as usize)
                    .map(|(n, _)| n.as_str())
                    .unwrap_or("?");
                write!(f, "{}.{}", owner.name, case)
            }
            Value::Native(n) => {
                let n = unsafe { n.as_ref() };
                write!(f, "<native {}>", n.name)
            }
        }
    }
}

// GcTrace for Value routes into the heap for all pointer variants.
impl GcTrace for Value {
    fn trace(&self, heap: &mut GcHeap) {
        match self {
            Value::Str(p) => heap.mark(*p),
            Value::List(p) => heap.mark(*p),
            Value::Map(p) => heap.mark(*p),
            Value::Range(p) => heap.mark(*p),
            Value::Closure(p) => heap.mark(*p),
            Value::Bound(p) => heap.mark(*p),
            Value::Object(p) => heap.mark(*p),
            Value::Instance(p) => heap.mark(*p),
            Value::Enum(p) => heap.mark(*p),
            Value::EnumInstance(p) => heap.mark(*p),
            Value::Native(p) => heap.mark(*p),
            Value::Null | Value::Bool(_) | Value::Integer(_) | Value::Float(_) | Value::Type(_) => {
            }
        }
    }

    fn heap_size(&self) -> usize {
        0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ObjString
// ─────────────────────────────────────────────────────────────────────────────

/// A heap-allocated immutable UTF-8 string, interned by content: equal
/// content implies an identical `ObjString`.
#[derive(Debug)]
pub struct ObjString {
    pub value: String,
}

impl GcTrace for ObjString {
    fn trace(&self, _heap: &mut GcHeap) {}
    fn heap_size(&self) -> usize {
        self.value.capacity()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ObjList
// ─────────────────────────────────────────────────────────────────────────────

/// A heap-allocated growable list. `type_id` is the list's full reified type
/// (`[item]`), used by `is` checks.
#[derive(Debug)]
pub struct ObjList {
    pub type_id: TypeId,
    pub items: RefCell<Vec<Value>>,
}

impl GcTrace for ObjList {
    fn trace(&self, heap: &mut GcHeap) {
        for v in self.items.borrow().iter() {
            v.trace(heap);
        }
    }
    fn heap_size(&self) -> usize {
        self.items.borrow().capacity() * std::mem::size_of::<Value>()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ObjMap
// ─────────────────────────────────────────────────────────────────────────────

/// A hashable projection of a key [`Value`].
///
/// The type checker restricts map keys to scalar-like types, so every legal
/// key has a stable hash: floats hash by bit pattern, strings by their
/// interned pointer, enum cases by `(owner, case)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKey {
    Null,
    Bool(bool),
    Integer(i32),
    Float(u64),
    Str(GcPtr<ObjString>),
    EnumCase(GcPtr<ObjEnum>, u16),
}

impl MapKey {
    /// Project a value into a key. Returns `None` for unhashable values
    /// (lists, maps, instances, functions).
    pub fn from_value(v: &Value) -> Option<MapKey> {
        match v {
            Value::Null => Some(MapKey::Null),
            Value::Bool(b) => Some(MapKey::Bool(*b)),
            Value::Integer(n) => Some(MapKey::Integer(*n)),
            Value::Float(f) => Some(MapKey::Float(f.to_bits())),
            Value::Str(s) => Some(MapKey::Str(*s)),
            Value::EnumInstance(e) => {
                // SAFETY: the key value is live.
                let e = unsafe { e.as_ref() };
                Some(MapKey::EnumCase(e.owner, e.case))
            }
            _ => None,
        }
    }

    /// Reconstruct the key as a value (for iteration and display).
    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Null => Value::Null,
            MapKey::Bool(b) => Value::Bool(*b),
            MapKey::Integer(n) => Value::Integer(*n),
            MapKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
            MapKey::Str(s) => Value::Str(*s),
            MapKey::EnumCase(owner, case) => {
                // SAFETY: the key is live while its map is live.
                let owner_ref = unsafe { owner.as_ref() };
                owner_ref
                    .case_instance(*case)
                    .map(Value::EnumInstance)
                    .unwrap_or(Value::Null)
            }
        }
    }
}

/// A heap-allocated insertion-ordered mapping. `type_id` is the map's full
/// reified type (`{key, value}`).
#[derive(Debug)]
pub struct ObjMap {
    pub type_id: TypeId,
    pub entries: RefCell<IndexMap<MapKey, Value>>,
}

impl GcTrace for ObjMap {
    fn trace(&self, heap: &mut GcHeap) {
        for (k, v) in self.entries.borrow().iter() {
            match k {
                MapKey::Str(s) => heap.mark(*s),
                MapKey::EnumCase(e, _) => heap.mark(*e),
                _ => {}
            }
            v.trace(heap);
        }
    }
    fn heap_size(&self) -> usize {
        self.entries.borrow().capacity()
            * (std::mem::size_of::<MapKey>() + std::mem::size_of::<Value>())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ObjRange
// ─────────────────────────────────────────────────────────────────────────────

/// `low..high` — inclusive of `low`, exclusive of `high`. Iteration direction
/// is inferred from the sign of `high - low`.
#[derive(Debug)]
pub struct ObjRange {
    pub low: i32,
    pub high: i32,
}

impl ObjRange {
    /// Number of values the range produces.
    pub fn len(&self) -> i64 {
        (self.high as i64 - self.low as i64).abs()
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }
}

impl GcTrace for ObjRange {
    fn trace(&self, _heap: &mut GcHeap) {}
    fn heap_size(&self) -> usize {
        0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ObjClosure / ObjUpvalue / ObjBound
// ─────────────────────────────────────────────────────────────────────────────

/// A function prototype paired with its captured upvalues.
///
/// `globals_base` records where the defining module's globals begin in the
/// VM's globals array, so closures that escape a module still resolve their
/// globals correctly.
#[derive(Debug)]
pub struct ObjClosure {
    pub proto: Rc<FnProto>,
    pub upvalues: Vec<GcPtr<ObjUpvalue>>,
    pub globals_base: usize,
}

impl GcTrace for ObjClosure {
    fn trace(&self, heap: &mut GcHeap) {
        for uv in &self.upvalues {
            heap.mark(*uv);
        }
    }
    fn heap_size(&self) -> usize {
        self.upvalues.capacity() * std::mem::size_of::<GcPtr<ObjUpvalue>>()
    }
}

/// A captured variable.
///
/// An upvalue starts **open**: it holds the absolute stack index of the live
/// local. When the enclosing frame exits (or the local's scope ends), the
/// value is copied into the upvalue, which becomes **closed**. An upvalue is
/// closed exactly when no VM stack slot backs it anymore.
#[derive(Debug)]
pub struct ObjUpvalue {
    pub state: RefCell<UpvalueState>,
}

#[derive(Debug)]
pub enum UpvalueState {
    /// Absolute index into the VM value stack.
    Open(usize),
    /// The value has been moved off the stack into the upvalue.
    Closed(Value),
}

impl ObjUpvalue {
    pub fn open(slot: usize) -> Self {
        ObjUpvalue {
            state: RefCell::new(UpvalueState::Open(slot)),
        }
    }

    /// The stack slot this upvalue points at, if still open.
    pub fn open_slot(&self) -> Option<usize> {
        match *self.state.borrow() {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Read through the upvalue.
    pub fn get(&self, stack: &[Value]) -> Value {
        match &*self.state.borrow() {
            UpvalueState::Open(slot) => stack[*slot].clone(),
            UpvalueState::Closed(v) => v.clone(),
        }
    }

    /// Write through the upvalue.
    pub fn set(&self, stack: &mut [Value], value: Value) {
        match &mut *self.state.borrow_mut() {
            UpvalueState::Open(slot) => stack[*slot] = value,
            UpvalueState::Closed(v) => *v = value,
        }
    }

    /// Close: copy the current stack value into the upvalue.
    pub fn close(&self, stack: &[Value]) {
        let closed = match &*self.state.borrow() {
            UpvalueState::Open(slot) => UpvalueState::Closed(stack[*slot].clone()),
            UpvalueState::Closed(_) => return,
        };
        *self.state.borrow_mut() = closed;
    }
}

impl GcTrace for ObjUpvalue {
    fn trace(&self, heap: &mut GcHeap) {
        if let UpvalueState::Closed(v) = &*self.state.borrow() {
            v.trace(heap);
        }
    }
    fn heap_size(&self) -> usize {
        std::mem::size_of::<Value>()
    }
}

/// A method bound to its receiver (`instance.method` read as a value).
#[derive(Debug)]
pub struct ObjBound {
    pub receiver: Value,
    pub method: GcPtr<ObjClosure>,
}

impl GcTrace for ObjBound {
    fn trace(&self, heap: &mut GcHeap) {
        self.receiver.trace(heap);
        heap.mark(self.method);
    }
    fn heap_size(&self) -> usize {
        0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ObjObject / ObjInstance
// ─────────────────────────────────────────────────────────────────────────────

/// A class-like object declaration at runtime: its methods, optional parent,
/// and static fields. Field *types* and default fragments are compile-time
/// data; instantiation code is emitted inline at each init site.
#[derive(Debug)]
pub struct ObjObject {
    pub name: String,
    /// The interned `Instance` type of this object, for `is` checks.
    pub instance_type: TypeId,
    pub parent: Cell<Option<GcPtr<ObjObject>>>,
    pub methods: RefCell<HashMap<String, GcPtr<ObjClosure>>>,
    pub statics: RefCell<HashMap<String, Value>>,
}

impl ObjObject {
    /// Find a method, walking the parent chain.
    pub fn find_method(&self, name: &str) -> Option<GcPtr<ObjClosure>> {
        if let Some(m) = self.methods.borrow().get(name) {
            return Some(*m);
        }
        let mut parent = self.parent.get();
        while let Some(p) = parent {
            // SAFETY: the parent chain is reachable from this live object.
            let p = unsafe { p.as_ref() };
            if let Some(m) = p.methods.borrow().get(name) {
                return Some(*m);
            }
            parent = p.parent.get();
        }
        None
    }
}

impl GcTrace for ObjObject {
    fn trace(&self, heap: &mut GcHeap) {
        if let Some(p) = self.parent.get() {
            heap.mark(p);
        }
        for m in self.methods.borrow().values() {
            heap.mark(*m);
        }
        for v in self.statics.borrow().values() {
            v.trace(heap);
        }
    }
    fn heap_size(&self) -> usize {
        self.name.capacity()
    }
}

/// An instance of an object: its defining object and field values in
/// declaration order.
#[derive(Debug)]
pub struct ObjInstance {
    pub object: GcPtr<ObjObject>,
    pub fields: RefCell<IndexMap<String, Value>>,
}

impl GcTrace for ObjInstance {
    fn trace(&self, heap: &mut GcHeap) {
        heap.mark(self.object);
        for v in self.fields.borrow().values() {
            v.trace(heap);
        }
    }
    fn heap_size(&self) -> usize {
        self.fields.borrow().capacity()
            * (std::mem::size_of::<String>() + std::mem::size_of::<Value>())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ObjEnum / ObjEnumInstance
// ─────────────────────────────────────────────────────────────────────────────

/// An enum declaration at runtime: ordered cases with their underlying
/// values, plus a lazily filled cache of case instances so repeated accesses
/// of `Color.red` yield the identical object.
#[derive(Debug)]
pub struct ObjEnum {
    pub name: String,
    /// The interned `EnumInstance` type, for `is` checks.
    pub instance_type: TypeId,
    pub cases: Vec<(String, Value)>,
    pub instances: RefCell<Vec<Option<GcPtr<ObjEnumInstance>>>>,
}

impl ObjEnum {
    pub fn case_instance(&self, case: u16) -> Option<GcPtr<ObjEnumInstance>> {
        self.instances
            .borrow()
            .get(case as usize)
            .copied()
            .flatten()
    }
}

impl GcTrace for ObjEnum {
    fn trace(&self, heap: &mut GcHeap) {
        for (_, v) in &self.cases {
            v.trace(heap);
        }
        for inst in self.instances.borrow().iter().flatten() {
            heap.mark(*inst);
        }
    }
    fn heap_size(&self) -> usize {
        self.cases.capacity() * (std::mem::size_of::<String>() + std::mem::size_of::<Value>())
    }
}

/// One case of an enum.
#[derive(Debug)]
pub struct ObjEnumInstance {
    pub owner: GcPtr<ObjEnum>,
    pub case: u16,
}

impl GcTrace for ObjEnumInstance {
    fn trace(&self, heap: &mut GcHeap) {
        heap.mark(self.owner);
    }
    fn heap_size(&self) -> usize {
        0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ObjNative
// ─────────────────────────────────────────────────────────────────────────────

/// A native (Rust) function callable from Buzz. See [`crate::natives`] for
/// the calling convention.
pub struct ObjNative {
    pub name: String,
    pub arity: u8,
    pub function: NativeFn,
}

impl fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

impl GcTrace for ObjNative {
    fn trace(&self, _heap: &mut GcHeap) {}
    fn heap_size(&self) -> usize {
        self.name.capacity()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_display() {
        assert_eq!(format!("{}", Value::Integer(42)), "42");
        assert_eq!(format!("{}", Value::Float(3.14)), "3.14");
        assert_eq!(format!("{}", Value::Float(2.0)), "2.0");
        assert_eq!(format!("{}", Value::Bool(true)), "true");
        assert_eq!(format!("{}", Value::Null), "null");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        // Unlike dynamically typed cousins, zero is truthy; conditions are
        // statically bool anyway.
        assert!(Value::Integer(0).is_truthy());
    }

    #[test]
    fn test_scalar_equality() {
        assert_eq!(Value::Integer(1), Value::Integer(1));
        assert_ne!(Value::Integer(1), Value::Integer(2));
        // No implicit numeric coercion across types.
        assert_ne!(Value::Integer(3), Value::Float(3.0));
    }

    #[test]
    fn test_range_len_and_equality() {
        let mut heap = GcHeap::new();
        let a = heap.alloc(ObjRange { low: 0, high: 10 });
        let b = heap.alloc(ObjRange { low: 0, high: 10 });
        let c = heap.alloc(ObjRange { low: 10, high: 0 });
        assert_eq!(unsafe { a.as_ref() }.len(), 10);
        assert_eq!(unsafe { c.as_ref() }.len(), 10);
        assert_eq!(Value::Range(a), Value::Range(b));
        assert_ne!(Value::Range(a), Value::Range(c));
    }

    #[test]
    fn test_map_key_projection() {
        let mut heap = GcHeap::new();
        assert_eq!(
            MapKey::from_value(&Value::Integer(3)),
            Some(MapKey::Integer(3))
        );
        assert_eq!(
            MapKey::from_value(&Value::Float(1.5)),
            Some(MapKey::Float(1.5f64.to_bits()))
        );
        let l = heap.alloc(ObjList {
            type_id: 0,
            items: RefCell::new(Vec::new()),
        });
        assert_eq!(MapKey::from_value(&Value::List(l)), None);
    }

    #[test]
    fn test_upvalue_open_close() {
        let mut stack = vec![Value::Integer(7), Value::Integer(9)];
        let uv = ObjUpvalue::open(1);
        assert_eq!(uv.get(&stack), Value::Integer(9));
        uv.set(&mut stack, Value::Integer(11));
        assert_eq!(stack[1], Value::Integer(11));

        uv.close(&stack);
        assert!(uv.open_slot().is_none());
        stack.clear();
        assert_eq!(uv.get(&stack), Value::Integer(11));
    }
}
