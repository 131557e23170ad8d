//! Full Python grammar check.
//!
//! tree-sitter recovers from errors and accepts programs CPython refuses to
//! compile (`def f(a=1, b):`, `del 1`, `(a, b) += 1`). Compiling to bytecode
//! catches those. The bytecode is discarded; nothing runs.

use rustpython_compiler::{compile, CompileOpts, Mode};

use crate::types::Finding;

use super::walker::CODE_SYNTAX_ERROR;

const SOURCE_PATH: &str = "<codegate>";

/// The compiler's rejection of `source`, as a single `Critical` finding
pub(crate) fn compile_error(source: &str) -> Option<Finding> {
    compile(
        source,
        Mode::Exec,
        SOURCE_PATH.to_string(),
        CompileOpts::default(),
    )
    .err()
    .map(|e| Finding::critical(format!("syntax error: {e}")).with_code(CODE_SYNTAX_ERROR))
}
