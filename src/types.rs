//! Type descriptors and the interning registry for the Buzz type system.
//!
//! Every type that appears in a Buzz program is represented by a [`TypeId`] —
//! a stable index into the process-wide [`TypeRegistry`]. Descriptors are
//! interned by structural identity, so two `TypeId`s are equal if and only if
//! they describe the same type. This is what lets the parser, code generator
//! and VM compare types with a plain integer comparison.
//!
//! # Placeholders
//!
//! A name used in type position before its declaration (a forward reference)
//! is registered as a [`TypeKind::Placeholder`]. When the declaration is later
//! seen, [`TypeRegistry::resolve_placeholder`] swaps the concrete definition
//! into the *same* arena slot, so every `TypeId` handed out for the forward
//! reference stays valid and identity is preserved. Placeholders still
//! unresolved at the end of compilation are reported as "Unknown type".
//!
//! # Lifecycle
//!
//! TypeDefs live for the whole process: the registry is append-only and never
//! frees a definition.

use std::collections::HashMap;

use crate::ast::Expr;

/// Stable handle to an interned [`TypeDef`].
pub type TypeId = u32;

/// Handle to a nominal object definition in the registry.
pub type ObjTypeId = u32;

/// Handle to a nominal enum definition in the registry.
pub type EnumTypeId = u32;

// ─────────────────────────────────────────────────────────────────────────────
// TypeDef
// ─────────────────────────────────────────────────────────────────────────────

/// A structural type descriptor. Interned: see [`TypeRegistry::intern`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDef {
    pub kind: TypeKind,
    /// `true` for `T?` — the type admits `null` in addition to `T`'s values.
    pub optional: bool,
}

/// The structural variants of a Buzz type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Bool,
    Integer,
    Float,
    String,
    Range,
    /// Top type: every value is assignable to `any`. Used by native
    /// signatures that genuinely accept anything (`toString`, `type`).
    Any,
    /// The type of a reified type value (the RHS of `is`).
    Type,
    List {
        item: TypeId,
    },
    Map {
        key: TypeId,
        value: TypeId,
    },
    /// The object (class) itself, as a first-class value.
    Object {
        object: ObjTypeId,
    },
    /// An instance of an object.
    Instance {
        object: ObjTypeId,
    },
    /// The enum itself, as a first-class value.
    Enum {
        def: EnumTypeId,
    },
    /// One case of an enum.
    EnumInstance {
        def: EnumTypeId,
    },
    Function(FunctionType),
    /// A provisional descriptor standing in for an as-yet-unresolved name.
    Placeholder {
        name: String,
    },
}

/// The structural part of a function type.
///
/// Parameter names participate in identity because Buzz calls can bind
/// arguments by name; two signatures that differ only in parameter names are
/// still mutually assignable (see [`TypeRegistry::is_assignable`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    /// Parameters in declaration order.
    pub params: Vec<(String, TypeId)>,
    /// For each parameter, the index of its default-value expression in the
    /// registry's fragment arena, if one was declared.
    pub defaults: Vec<Option<u32>>,
    /// Declared return type.
    pub ret: TypeId,
    /// What kind of function this is (affects codegen and the VM, not calls).
    pub kind: FnKind,
}

/// The kinds of compiled functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FnKind {
    /// A module body.
    Script,
    /// A top-level main-bearing script body.
    ScriptEntryPoint,
    /// An ordinary named function.
    Function,
    /// A method on an object.
    Method,
    /// The `main` function.
    EntryPoint,
    /// Declared but externally implemented (native).
    Extern,
    /// An anonymous function expression.
    Anonymous,
    /// A catch clause attached to a call.
    Catch,
    /// A `test "..."` block.
    Test,
}

// ─────────────────────────────────────────────────────────────────────────────
// Object / enum definitions
// ─────────────────────────────────────────────────────────────────────────────

/// One declared field of an object.
#[derive(Debug, Clone)]
pub struct ObjectField {
    pub name: String,
    pub ty: TypeId,
    /// Index of the default-value expression fragment, if declared.
    pub default: Option<u32>,
}

/// The nominal definition of an `object` declaration.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    pub name: String,
    pub parent: Option<ObjTypeId>,
    /// Instance fields in declaration order.
    pub fields: Vec<ObjectField>,
    /// Methods: name → interned function type.
    pub methods: Vec<(String, TypeId)>,
    /// Static field names declared on the object itself.
    pub statics: Vec<(String, TypeId)>,
    /// Interned `Instance { object }` type.
    pub instance_type: TypeId,
    /// Interned `Object { object }` type.
    pub object_type: TypeId,
}

/// The nominal definition of an `enum` declaration.
#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    /// Underlying value type of the cases (`int` or `str`).
    pub underlying: TypeId,
    /// Case names in declaration order.
    pub cases: Vec<String>,
    /// Interned `Enum { def }` type.
    pub enum_type: TypeId,
    /// Interned `EnumInstance { def }` type.
    pub instance_type: TypeId,
}

// ─────────────────────────────────────────────────────────────────────────────
// TypeRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// The process-wide arena of interned type descriptors.
pub struct TypeRegistry {
    /// The arena. `TypeId` indexes into this vector; entries are never removed.
    defs: Vec<TypeDef>,
    /// Structural intern table.
    interned: HashMap<TypeDef, TypeId>,
    /// name → all arena slots currently holding a placeholder for that name
    /// (both the optional and non-optional variants).
    placeholders: HashMap<String, Vec<TypeId>>,
    /// Nominal object definitions.
    objects: Vec<ObjectDef>,
    /// Nominal enum definitions.
    enums: Vec<EnumDef>,
    /// Default-value AST fragments for parameters and object fields. These are
    /// compiled at each call / instantiation site so mutable defaults evaluate
    /// freshly per call.
    fragments: Vec<Expr>,

    // Pre-interned primitives.
    pub t_void: TypeId,
    pub t_bool: TypeId,
    pub t_int: TypeId,
    pub t_float: TypeId,
    pub t_str: TypeId,
    pub t_range: TypeId,
    pub t_any: TypeId,
    pub t_type: TypeId,
    /// The type of the `null` literal: optional `void`.
    pub t_null: TypeId,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut reg = TypeRegistry {
            defs: Vec::new(),
            interned: HashMap::new(),
            placeholders: HashMap::new(),
            objects: Vec::new(),
            enums: Vec::new(),
            fragments: Vec::new(),
            t_void: 0,
            t_bool: 0,
            t_int: 0,
            t_float: 0,
            t_str: 0,
            t_range: 0,
            t_any: 0,
            t_type: 0,
            t_null: 0,
        };
        reg.t_void = reg.intern(TypeKind::Void, false);
        reg.t_bool = reg.intern(TypeKind::Bool, false);
        reg.t_int = reg.intern(TypeKind::Integer, false);
        reg.t_float = reg.intern(TypeKind::Float, false);
        reg.t_str = reg.intern(TypeKind::String, false);
        reg.t_range = reg.intern(TypeKind::Range, false);
        reg.t_any = reg.intern(TypeKind::Any, false);
        reg.t_type = reg.intern(TypeKind::Type, false);
        reg.t_null = reg.intern(TypeKind::Void, true);
        reg
    }

    // ── Interning ────────────────────────────────────────────────────────────

    /// Intern a descriptor, returning the canonical `TypeId` for its structure.
    pub fn intern(&mut self, kind: TypeKind, optional: bool) -> TypeId {
        let def = TypeDef { kind, optional };
        if let Some(&id) = self.interned.get(&def) {
            return id;
        }
        let id = self.defs.len() as TypeId;
        if let TypeKind::Placeholder { name } = &def.kind {
            self.placeholders.entry(name.clone()).or_default().push(id);
        }
        self.interned.insert(def.clone(), id);
        self.defs.push(def);
        id
    }

    /// Look up a descriptor by id.
    #[inline]
    pub fn get(&self, id: TypeId) -> &TypeDef {
        &self.defs[id as usize]
    }

    /// Read-only intern lookup: the id of an already-interned structure, if
    /// any. Used at runtime where the registry is immutable.
    pub fn lookup(&self, kind: TypeKind, optional: bool) -> Option<TypeId> {
        self.interned.get(&TypeDef { kind, optional }).copied()
    }

    /// Intern the optional (`T?`) variant of `id`.
    pub fn optional_of(&mut self, id: TypeId) -> TypeId {
        let def = self.get(id).clone();
        if def.optional {
            return id;
        }
        self.intern(def.kind, true)
    }

    /// Intern the non-optional peer of `id` (identity if already non-optional).
    pub fn non_optional_of(&mut self, id: TypeId) -> TypeId {
        let def = self.get(id).clone();
        if !def.optional {
            return id;
        }
        self.intern(def.kind, false)
    }

    pub fn list_of(&mut self, item: TypeId) -> TypeId {
        self.intern(TypeKind::List { item }, false)
    }

    pub fn map_of(&mut self, key: TypeId, value: TypeId) -> TypeId {
        self.intern(TypeKind::Map { key, value }, false)
    }

    pub fn function_of(&mut self, ty: FunctionType) -> TypeId {
        self.intern(TypeKind::Function(ty), false)
    }

    // ── Placeholders ─────────────────────────────────────────────────────────

    /// Intern (or reuse) a placeholder for the given unresolved name.
    pub fn placeholder(&mut self, name: &str) -> TypeId {
        self.intern(
            TypeKind::Placeholder {
                name: name.to_string(),
            },
            false,
        )
    }

    /// Resolve every placeholder registered under `name` to `kind`, swapping
    /// the concrete definition into the existing arena slots so that all
    /// previously handed out `TypeId`s remain valid.
    ///
    /// Returns `true` if any placeholder was resolved.
    pub fn resolve_placeholder(&mut self, name: &str, kind: TypeKind) -> bool {
        let Some(ids) = self.placeholders.remove(name) else {
            return false;
        };
        for id in ids {
            let old = self.defs[id as usize].clone();
            self.interned.remove(&old);
            let new = TypeDef {
                kind: kind.clone(),
                optional: old.optional,
            };
            // The slot keeps its id; the canonical intern entry for the
            // concrete structure is whichever slot got there first.
            self.interned.entry(new.clone()).or_insert(id);
            self.defs[id as usize] = new;
        }
        true
    }

    /// Resolve every placeholder registered under `name` to alias the full
    /// definition of `target` (kind *and* optional flag). Used for value
    /// references (forward-referenced globals, deferred member accesses)
    /// where the placeholder stands for a complete type, not a base name.
    pub fn resolve_placeholder_to(&mut self, name: &str, target: TypeId) -> bool {
        let Some(ids) = self.placeholders.remove(name) else {
            return false;
        };
        let def = self.get(target).clone();
        for id in ids {
            let old = self.defs[id as usize].clone();
            self.interned.remove(&old);
            self.interned.entry(def.clone()).or_insert(id);
            self.defs[id as usize] = def.clone();
        }
        true
    }

    /// Names of all placeholders still unresolved.
    pub fn unresolved_placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = self.placeholders.keys().cloned().collect();
        names.sort();
        names
    }

    // ── Objects / enums ──────────────────────────────────────────────────────

    /// Register a new object definition and intern its instance/object types.
    ///
    /// If a placeholder exists for the object's name it is resolved first, so
    /// the forward-reference slot becomes the canonical instance `TypeId` and
    /// identity is preserved for every reference handed out before the
    /// declaration was seen.
    pub fn add_object(&mut self, name: &str, parent: Option<ObjTypeId>) -> ObjTypeId {
        let object = self.objects.len() as ObjTypeId;
        self.resolve_placeholder(name, TypeKind::Instance { object });
        let instance_type = self.intern(TypeKind::Instance { object }, false);
        let object_type = self.intern(TypeKind::Object { object }, false);
        self.objects.push(ObjectDef {
            name: name.to_string(),
            parent,
            fields: Vec::new(),
            methods: Vec::new(),
            statics: Vec::new(),
            instance_type,
            object_type,
        });
        object
    }

    #[inline]
    pub fn object(&self, id: ObjTypeId) -> &ObjectDef {
        &self.objects[id as usize]
    }

    #[inline]
    pub fn object_mut(&mut self, id: ObjTypeId) -> &mut ObjectDef {
        &mut self.objects[id as usize]
    }

    /// Look up a field on an object, walking the parent chain.
    pub fn lookup_field(&self, mut obj: ObjTypeId, name: &str) -> Option<ObjectField> {
        loop {
            let def = self.object(obj);
            if let Some(f) = def.fields.iter().find(|f| f.name == name) {
                return Some(f.clone());
            }
            match def.parent {
                Some(p) => obj = p,
                None => return None,
            }
        }
    }

    /// Look up a method's type on an object, walking the parent chain.
    pub fn lookup_method(&self, mut obj: ObjTypeId, name: &str) -> Option<TypeId> {
        loop {
            let def = self.object(obj);
            if let Some((_, ty)) = def.methods.iter().find(|(n, _)| n == name) {
                return Some(*ty);
            }
            match def.parent {
                Some(p) => obj = p,
                None => return None,
            }
        }
    }

    /// Register a new enum definition and intern its types. Placeholders for
    /// the name are resolved first (same identity rule as [`Self::add_object`]).
    pub fn add_enum(&mut self, name: &str, underlying: TypeId, cases: Vec<String>) -> EnumTypeId {
        let def = self.enums.len() as EnumTypeId;
        self.resolve_placeholder(name, TypeKind::EnumInstance { def });
        let enum_type = self.intern(TypeKind::Enum { def }, false);
        let instance_type = self.intern(TypeKind::EnumInstance { def }, false);
        self.enums.push(EnumDef {
            name: name.to_string(),
            underlying,
            cases,
            enum_type,
            instance_type,
        });
        def
    }

    #[inline]
    pub fn enum_def(&self, id: EnumTypeId) -> &EnumDef {
        &self.enums[id as usize]
    }

    // ── Default-value fragments ──────────────────────────────────────────────

    /// Store a default-value AST fragment, returning its arena index.
    pub fn add_fragment(&mut self, expr: Expr) -> u32 {
        let idx = self.fragments.len() as u32;
        self.fragments.push(expr);
        idx
    }

    #[inline]
    pub fn fragment(&self, idx: u32) -> &Expr {
        &self.fragments[idx as usize]
    }

    // ── Assignability ────────────────────────────────────────────────────────

    /// Widening-only assignability: can a value of type `from` be stored into
    /// a slot of type `to`?
    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        if from == to {
            return true;
        }
        let f = self.get(from);
        let t = self.get(to);

        // Unresolved placeholders are optimistic: the unknown-type diagnostic
        // at the end of the unit is the authoritative error, and flagging
        // every use would drown it in noise.
        if matches!(f.kind, TypeKind::Placeholder { .. })
            || matches!(t.kind, TypeKind::Placeholder { .. })
        {
            return true;
        }
        // `null` (optional void) fits every optional slot.
        if f.kind == TypeKind::Void && f.optional {
            return t.optional;
        }
        // `any` accepts everything.
        if t.kind == TypeKind::Any {
            return true;
        }
        // An optional value does not fit a non-optional slot.
        if f.optional && !t.optional {
            return false;
        }

        match (&f.kind, &t.kind) {
            // Instances widen along the parent chain.
            (TypeKind::Instance { object: a }, TypeKind::Instance { object: b }) => {
                let mut cur = *a;
                loop {
                    if cur == *b {
                        return true;
                    }
                    match self.object(cur).parent {
                        Some(p) => cur = p,
                        None => return false,
                    }
                }
            }
            // Containers are invariant in their element types.
            (TypeKind::List { item: a }, TypeKind::List { item: b }) => a == b,
            (
                TypeKind::Map { key: ka, value: va },
                TypeKind::Map { key: kb, value: vb },
            ) => ka == kb && va == vb,
            // Functions compare structurally, ignoring names, defaults, kind.
            (TypeKind::Function(a), TypeKind::Function(b)) => {
                a.ret == b.ret
                    && a.params.len() == b.params.len()
                    && a.params
                        .iter()
                        .zip(b.params.iter())
                        .all(|((_, pa), (_, pb))| pa == pb)
            }
            // Same base kind with compatible optionality.
            (a, b) => a == b,
        }
    }

    /// Human-readable name for error messages.
    pub fn name_of(&self, id: TypeId) -> String {
        let def = self.get(id);
        let base = match &def.kind {
            TypeKind::Void => "void".to_string(),
            TypeKind::Bool => "bool".to_string(),
            TypeKind::Integer => "int".to_string(),
            TypeKind::Float => "float".to_string(),
            TypeKind::String => "str".to_string(),
            TypeKind::Range => "rg".to_string(),
            TypeKind::Any => "any".to_string(),
            TypeKind::Type => "type".to_string(),
            TypeKind::List { item } => format!("[{}]", self.name_of(*item)),
            TypeKind::Map { key, value } => {
                format!("{{{}, {}}}", self.name_of(*key), self.name_of(*value))
            }
            TypeKind::Object { object } => self.object(*object).name.clone(),
            TypeKind::Instance { object } => self.object(*object).name.clone(),
            TypeKind::Enum { def } => self.enum_def(*def).name.clone(),
            TypeKind::EnumInstance { def } => self.enum_def(*def).name.clone(),
            TypeKind::Function(ft) => {
                let params: Vec<String> =
                    ft.params.iter().map(|(_, t)| self.name_of(*t)).collect();
                format!("fun({}) > {}", params.join(", "), self.name_of(ft.ret))
            }
            TypeKind::Placeholder { name } => name.clone(),
        };
        if def.optional && def.kind != TypeKind::Void {
            format!("{base}?")
        } else if def.optional {
            "null".to_string()
        } else {
            base
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_are_interned_once() {
        let mut reg = TypeRegistry::new();
        assert_eq!(reg.intern(TypeKind::Integer, false), reg.t_int);
        assert_eq!(reg.intern(TypeKind::Bool, false), reg.t_bool);
        assert_ne!(reg.t_int, reg.t_float);
    }

    #[test]
    fn test_structural_interning_of_lists() {
        let mut reg = TypeRegistry::new();
        let a = reg.list_of(reg.t_int);
        let b = reg.list_of(reg.t_int);
        let c = reg.list_of(reg.t_str);
        assert_eq!(a, b, "identical structure must intern to the same id");
        assert_ne!(a, c);
    }

    #[test]
    fn test_optional_peers() {
        let mut reg = TypeRegistry::new();
        let opt = reg.optional_of(reg.t_int);
        assert_ne!(opt, reg.t_int);
        assert_eq!(reg.non_optional_of(opt), reg.t_int);
        assert_eq!(reg.optional_of(opt), opt);
    }

    #[test]
    fn test_placeholder_resolution_preserves_identity() {
        let mut reg = TypeRegistry::new();
        let fwd = reg.placeholder("Tree");
        let fwd_opt = reg.optional_of(fwd);
        assert!(matches!(
            reg.get(fwd).kind,
            TypeKind::Placeholder { .. }
        ));

        let obj = reg.add_object("Tree", None);

        // Same ids, now concrete.
        assert_eq!(reg.get(fwd).kind, TypeKind::Instance { object: obj });
        assert!(reg.get(fwd_opt).optional);
        assert_eq!(reg.get(fwd_opt).kind, TypeKind::Instance { object: obj });
        assert!(reg.unresolved_placeholders().is_empty());

        // The forward-reference slot IS the canonical instance type, so
        // identity comparison of TypeIds agrees with structural equality.
        assert_eq!(reg.object(obj).instance_type, fwd);
        let again = reg.intern(TypeKind::Instance { object: obj }, false);
        assert_eq!(again, fwd);
    }

    #[test]
    fn test_unresolved_placeholder_is_reported() {
        let mut reg = TypeRegistry::new();
        reg.placeholder("Ghost");
        assert_eq!(reg.unresolved_placeholders(), vec!["Ghost".to_string()]);
    }

    #[test]
    fn test_null_assignable_only_to_optionals() {
        let mut reg = TypeRegistry::new();
        let opt_int = reg.optional_of(reg.t_int);
        assert!(reg.is_assignable(reg.t_null, opt_int));
        assert!(!reg.is_assignable(reg.t_null, reg.t_int));
    }

    #[test]
    fn test_non_optional_widens_to_optional() {
        let mut reg = TypeRegistry::new();
        let opt_int = reg.optional_of(reg.t_int);
        assert!(reg.is_assignable(reg.t_int, opt_int));
        assert!(!reg.is_assignable(opt_int, reg.t_int));
    }

    #[test]
    fn test_instance_widens_along_parent_chain() {
        let mut reg = TypeRegistry::new();
        let base = reg.add_object("Base", None);
        let derived = reg.add_object("Derived", Some(base));
        let base_t = reg.object(base).instance_type;
        let derived_t = reg.object(derived).instance_type;
        assert!(reg.is_assignable(derived_t, base_t));
        assert!(!reg.is_assignable(base_t, derived_t));
    }

    #[test]
    fn test_type_names() {
        let mut reg = TypeRegistry::new();
        let l = reg.list_of(reg.t_int);
        assert_eq!(reg.name_of(l), "[int]");
        let m = reg.map_of(reg.t_str, reg.t_int);
        assert_eq!(reg.name_of(m), "{str, int}");
        let o = reg.optional_of(reg.t_str);
        assert_eq!(reg.name_of(o), "str?");
        assert_eq!(reg.name_of(reg.t_null), "null");
    }
}
