//! The Buzz language compiler and runtime library.
//!
//! This crate provides the complete Buzz pipeline:
//!
//! 1. **Lexer** (`lexer`) — tokenises source text into a flat `Vec<Token>`,
//!    with re-entrant sub-lexing for string interpolation.
//! 2. **Parser / type checker** (`parser`) — recursive-descent statements and
//!    Pratt expressions producing a fully typed [`ast::Program`].
//! 3. **Types** (`types`) — the interning registry of structural type
//!    descriptors and placeholder resolution for forward references.
//! 4. **Code generator** (`codegen`) — lowers the typed AST into 32-bit
//!    instruction words with jump patching and constant pooling.
//! 5. **Bytecode** (`bytecode`) — `OpCode` definitions, `Chunk`, `FnProto`.
//! 6. **Values** (`value`) — the runtime `Value` enum and heap object types.
//! 7. **GC** (`gc`) — tri-color mark-and-sweep with a gray worklist.
//! 8. **VM** (`vm`) — the call-frame interpreter: closures, upvalues, catch
//!    clauses, iteration, imports.
//! 9. **Natives** (`natives`) — the ABI for externally implemented functions.
//!
//! # Entry point
//!
//! The simplest way to run a Buzz program from Rust is:
//!
//! ```rust,ignore
//! use buzz::{run_source, RunConfig};
//! run_source(source_code, "script.buzz", &RunConfig::default()).unwrap();
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod gc;
pub mod lexer;
pub mod modules;
pub mod natives;
pub mod parser;
pub mod token;
pub mod types;
pub mod value;
pub mod vm;

use std::path::{Path, PathBuf};

use crate::codegen::{CompileError, RunMode};
use crate::lexer::LexError;
use crate::parser::{DiagKind, ParseError};
use crate::vm::RuntimeError;

// ─────────────────────────────────────────────────────────────────────────────
// Unified error type
// ─────────────────────────────────────────────────────────────────────────────

/// The unified error type for all Buzz pipeline stages.
///
/// Each variant wraps errors from the corresponding stage so that callers can
/// handle them uniformly or match on the specific stage. Compile-time stages
/// accumulate: a variant carries every diagnostic the stage reported.
#[derive(Debug, thiserror::Error)]
pub enum BuzzError {
    /// One or more lexical errors.
    #[error("Lex error at {}: {}", .0.first().map(|e| e.span.to_string()).unwrap_or_default(), .0.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; "))]
    Lex(Vec<LexError>),

    /// One or more syntax errors.
    #[error("Parse error at {}: {}", .0.first().map(|e| e.span.to_string()).unwrap_or_default(), .0.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; "))]
    Parse(Vec<ParseError>),

    /// One or more static type errors.
    #[error("Type error at {}: {}", .0.first().map(|e| e.span.to_string()).unwrap_or_default(), .0.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; "))]
    Type(Vec<ParseError>),

    /// Unresolved forward references (unknown types / symbols).
    #[error("Resolution error: {}", .0.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; "))]
    Resolution(Vec<ParseError>),

    /// An emitter-stage error.
    #[error("Compile error: {}", .0.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; "))]
    Compile(Vec<CompileError>),

    /// A runtime error raised by the VM (including unhandled throws).
    #[error("Runtime error: {0}")]
    Runtime(RuntimeError),

    /// An I/O error (file reading, module loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuzzError {
    /// Sort accumulated parser diagnostics into the dominant stage variant:
    /// syntax errors first (they cascade), then type errors, then unresolved
    /// names.
    fn from_diagnostics(errors: Vec<ParseError>) -> Self {
        let pick = |kind: DiagKind, errors: &[ParseError]| -> Vec<ParseError> {
            errors.iter().filter(|e| e.kind == kind).cloned().collect()
        };
        let syntax = pick(DiagKind::Syntax, &errors);
        if !syntax.is_empty() {
            return BuzzError::Parse(syntax);
        }
        let type_errors = pick(DiagKind::Type, &errors);
        if !type_errors.is_empty() {
            return BuzzError::Type(type_errors);
        }
        BuzzError::Resolution(pick(DiagKind::Resolution, &errors))
    }
}

/// Shorthand result type for all Buzz operations.
pub type BuzzResult<T> = Result<T, BuzzError>;

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Options shared by [`run_source`] and [`check_source`].
#[derive(Debug, Default, Clone)]
pub struct RunConfig {
    /// Run `test "..."` blocks instead of `main`.
    pub test: bool,
    /// Extra library search directories (`-L`).
    pub search_paths: Vec<PathBuf>,
    /// Arguments exposed to the script through `args()`.
    pub args: Vec<String>,
    /// Optional dispatch budget; exceeding it terminates the run.
    pub cycle_limit: Option<u64>,
}

/// Lex, parse and type-check one source string, returning the typed program
/// and the registries it was built against.
pub fn compile_source(
    src: &str,
    path: &str,
    config: &RunConfig,
) -> BuzzResult<(ast::Program, types::TypeRegistry)> {
    let (tokens, lex_errors) = lexer::lex(src);
    if !lex_errors.is_empty() {
        return Err(BuzzError::Lex(lex_errors));
    }

    let mut registry = types::TypeRegistry::new();
    let mut module_registry = modules::ModuleRegistry::new();
    module_registry.search_paths = config.search_paths.clone();

    let dir = Path::new(path).parent().map(Path::to_path_buf);
    let (program, errors) = parser::parse(
        tokens,
        &mut registry,
        &mut module_registry,
        path,
        dir.as_deref(),
        true,
    );
    match program {
        Some(program) => Ok((program, registry)),
        None => Err(BuzzError::from_diagnostics(errors)),
    }
}

/// Full pipeline without execution: lex → parse → typecheck → codegen.
pub fn check_source(src: &str, path: &str, config: &RunConfig) -> BuzzResult<()> {
    let (program, registry) = compile_source(src, path, config)?;
    codegen::generate(&program, &registry).map_err(BuzzError::Compile)?;
    Ok(())
}

/// Full pipeline: lex → parse → typecheck → compile → run.
///
/// `path` is used for error messages and module resolution.
pub fn run_source(src: &str, path: &str, config: &RunConfig) -> BuzzResult<()> {
    let (program, registry) = compile_source(src, path, config)?;
    let mode = if config.test { RunMode::Test } else { RunMode::Run };
    let proto =
        codegen::generate_with_mode(&program, &registry, mode).map_err(BuzzError::Compile)?;

    let mut heap = gc::GcHeap::new();
    let mut machine = vm::Vm::new(&mut heap, &registry);
    machine.set_args(config.args.clone());
    if let Some(limit) = config.cycle_limit {
        machine.set_cycle_limit(limit);
    }
    machine.interpret(proto).map_err(BuzzError::Runtime)
}

/// Like [`run_source`], but program output is captured and returned instead
/// of written to stdout. Used by embedders and the integration suite.
pub fn run_source_captured(src: &str, path: &str, config: &RunConfig) -> BuzzResult<String> {
    let (program, registry) = compile_source(src, path, config)?;
    let mode = if config.test { RunMode::Test } else { RunMode::Run };
    let proto =
        codegen::generate_with_mode(&program, &registry, mode).map_err(BuzzError::Compile)?;

    let mut heap = gc::GcHeap::new();
    let mut machine = vm::Vm::new(&mut heap, &registry);
    machine.set_args(config.args.clone());
    if let Some(limit) = config.cycle_limit {
        machine.set_cycle_limit(limit);
    }
    let output = machine.capture_output();
    machine.interpret(proto).map_err(BuzzError::Runtime)?;
    let text = output.borrow().clone();
    Ok(text)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_script_runs_clean() {
        run_source("", "<test>", &RunConfig::default()).unwrap();
    }

    #[test]
    fn test_lex_errors_surface_first() {
        let err = run_source("int x = #;", "<test>", &RunConfig::default()).unwrap_err();
        assert!(matches!(err, BuzzError::Lex(_)));
    }

    #[test]
    fn test_type_errors_block_execution() {
        let err = run_source(r#"int x = "nope";"#, "<test>", &RunConfig::default()).unwrap_err();
        assert!(matches!(err, BuzzError::Type(_)));
    }

    #[test]
    fn test_unknown_type_is_a_resolution_error() {
        let err = run_source("Ghost g = null;", "<test>", &RunConfig::default()).unwrap_err();
        assert!(matches!(err, BuzzError::Resolution(_)));
    }

    #[test]
    fn test_missing_field_init_is_reported() {
        let err = run_source(
            "object P { int x } P p = P{};",
            "<test>",
            &RunConfig::default(),
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("not initialized"), "unexpected: {text}");
    }

    #[test]
    fn test_check_source_does_not_execute() {
        // A throwing script checks cleanly; only running it would fail.
        check_source(r#"throw "never";"#, "<test>", &RunConfig::default()).unwrap();
    }
}
