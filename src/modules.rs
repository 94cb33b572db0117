//! Import path resolution and the shared module registry.
//!
//! An `import "x"` tries, in order:
//!
//! 1. the path as given, when absolute;
//! 2. relative to the importing file's directory;
//! 3. each `-L` search directory (CLI, repeatable);
//! 4. each `BUZZ_PATH` entry (colon-separated);
//! 5. the built-in library directory.
//!
//! The first file that exists wins. The `.buzz` extension is appended when the
//! spec does not already carry it.
//!
//! Modules are compiled **once per process**: the registry caches the compiled
//! module by canonical path, and an in-progress marker turns import cycles
//! into a compile error instead of infinite recursion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::ast::ExportSym;
use crate::bytecode::FnProto;
use crate::types::TypeRegistry;

/// Default system-wide library directory, searched last.
const LIB_DIR: &str = "/usr/local/lib/buzz";

/// Environment variable holding extra import search prefixes.
const PATH_VAR: &str = "BUZZ_PATH";

// ─────────────────────────────────────────────────────────────────────────────
// CompiledModule
// ─────────────────────────────────────────────────────────────────────────────

/// A fully compiled module: its script prototype and exported symbols.
#[derive(Debug)]
pub struct CompiledModule {
    /// Canonical path of the module source.
    pub path: PathBuf,
    /// The compiled module body (kind `Script`).
    pub proto: Rc<FnProto>,
    /// Exported symbols in export order — the order the module's `EXPORT`
    /// instruction pushes them.
    pub exports: Vec<ExportSym>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleRegistry
// ─────────────────────────────────────────────────────────────────────────────

enum ModuleState {
    /// Compilation in progress (used for cycle detection).
    Loading,
    Loaded(Rc<CompiledModule>),
}

/// The per-process registry of compiled modules and search paths.
#[derive(Default)]
pub struct ModuleRegistry {
    cache: HashMap<PathBuf, ModuleState>,
    /// Extra search directories from `-L`.
    pub search_paths: Vec<PathBuf>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an import spec to an existing file, per the search order
    /// documented at module level.
    pub fn resolve(&self, spec: &str, importer_dir: Option<&Path>) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();

        let as_path = Path::new(spec);
        if as_path.is_absolute() {
            candidates.push(as_path.to_path_buf());
        } else {
            if let Some(dir) = importer_dir {
                candidates.push(dir.join(spec));
            }
            for dir in &self.search_paths {
                candidates.push(dir.join(spec));
            }
            if let Ok(var) = std::env::var(PATH_VAR) {
                for entry in var.split(':').filter(|e| !e.is_empty()) {
                    candidates.push(Path::new(entry).join(spec));
                }
            }
            candidates.push(Path::new(LIB_DIR).join(spec));
        }

        for candidate in candidates {
            for with_ext in [candidate.clone(), candidate.with_extension("buzz")] {
                if with_ext.is_file() {
                    log::debug!("import `{spec}` resolved to {}", with_ext.display());
                    return Some(with_ext);
                }
            }
        }
        None
    }

    fn canonical(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Compile (or fetch from cache) the module named by `spec`.
///
/// Shares the caller's [`TypeRegistry`] so `TypeId`s remain valid across
/// module boundaries. Returns an error string suitable for a parser
/// diagnostic on resolution failure, compile failure, or an import cycle.
pub fn load_module(
    types: &mut TypeRegistry,
    registry: &mut ModuleRegistry,
    spec: &str,
    importer_dir: Option<&Path>,
) -> Result<Rc<CompiledModule>, String> {
    let Some(path) = registry.resolve(spec, importer_dir) else {
        return Err(format!("module `{spec}` not found"));
    };
    let key = ModuleRegistry::canonical(&path);

    match registry.cache.get(&key) {
        Some(ModuleState::Loaded(module)) => return Ok(Rc::clone(module)),
        Some(ModuleState::Loading) => {
            return Err(format!("circular import of `{spec}`"));
        }
        None => {}
    }
    registry.cache.insert(key.clone(), ModuleState::Loading);

    let result = compile_module(types, registry, &key);
    match result {
        Ok(module) => {
            registry
                .cache
                .insert(key, ModuleState::Loaded(Rc::clone(&module)));
            Ok(module)
        }
        Err(message) => {
            registry.cache.remove(&key);
            Err(message)
        }
    }
}

fn compile_module(
    types: &mut TypeRegistry,
    registry: &mut ModuleRegistry,
    path: &Path,
) -> Result<Rc<CompiledModule>, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read module {}: {e}", path.display()))?;

    let (tokens, lex_errors) = crate::lexer::lex(&source);
    if !lex_errors.is_empty() {
        return Err(format!(
            "in module {}: {}",
            path.display(),
            lex_errors
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ")
        ));
    }

    let name = path.display().to_string();
    let dir = path.parent().map(Path::to_path_buf);
    let (program, errors) =
        crate::parser::parse(tokens, types, registry, &name, dir.as_deref(), false);
    let Some(program) = program else {
        return Err(format!(
            "in module {}: {}",
            path.display(),
            errors
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ")
        ));
    };

    let proto = crate::codegen::generate(&program, types).map_err(|errs| {
        format!(
            "in module {}: {}",
            path.display(),
            errs.iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ")
        )
    })?;

    Ok(Rc::new(CompiledModule {
        path: path.to_path_buf(),
        proto,
        exports: program.exports.clone(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_missing_module() {
        let registry = ModuleRegistry::new();
        assert!(registry.resolve("definitely_missing_module", None).is_none());
    }

    #[test]
    fn test_resolve_relative_to_importer() {
        let dir = std::env::temp_dir().join("buzz_modules_test");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("util.buzz");
        std::fs::write(&file, "export const answer = 42;\n").unwrap();

        let registry = ModuleRegistry::new();
        let found = registry.resolve("util", Some(&dir)).unwrap();
        assert_eq!(found, file);
        // Explicit extension also resolves.
        assert_eq!(registry.resolve("util.buzz", Some(&dir)).unwrap(), file);

        std::fs::remove_file(&file).ok();
    }

    #[test]
    fn test_search_path_order() {
        let base = std::env::temp_dir().join("buzz_modules_order");
        let first = base.join("a");
        let second = base.join("b");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(first.join("m.buzz"), "").unwrap();
        std::fs::write(second.join("m.buzz"), "").unwrap();

        let mut registry = ModuleRegistry::new();
        registry.search_paths = vec![first.clone(), second.clone()];
        let found = registry.resolve("m", None).unwrap();
        assert_eq!(found, first.join("m.buzz"));

        std::fs::remove_dir_all(&base).ok();
    }
}
