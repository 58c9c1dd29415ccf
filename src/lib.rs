//! Lume Language Compiler Core
//!
//! The semantic-analysis and code-generation half of the Lume compiler:
//! the external lexer/parser hands over an AST ([`frontend::ast`]), the
//! type checker validates it and assigns every binding a storage slot
//! ([`middle::type_check`]), and the lowering pass emits a textual LIR
//! module for an optimizing backend ([`middle::lir`]).
//!
//! Compilation is strictly two-phase: checking runs to completion over
//! the whole program first (decorating the AST in place), and only then
//! does lowering walk the same AST. Every semantic violation is fatal to
//! the run; the first error wins and is reported through a single
//! top-level handler ([`middle::error::CompileError::report`]).

pub mod frontend;
pub mod index;
pub mod middle;

use frontend::ast::Program;
use middle::error::CompileError;

/// Runs both compiler phases over a parsed program and returns the
/// verified LIR module.
pub fn compile_program(program: &mut Program) -> Result<middle::lir::Module, CompileError> {
    let results = middle::type_check::check_program(program)?;
    middle::lir::ast_lowering::lower_program(program, &results)
}

/// Like [`compile_program`], but renders the module to the plain textual
/// form consumed by the backend.
pub fn emit_program(program: &mut Program) -> Result<String, CompileError> {
    let module = compile_program(program)?;
    Ok(middle::lir::pretty_print::render_plain(&module))
}
