//! Selune Compiler: source text to bytecode prototypes
//!
//! A single-pass compiler. The lexer feeds a recursive-descent parser
//! that emits register-based bytecode as it goes; there is no AST. The
//! output is a `ProtoDesc` tree (from `selune-core`) that the runtime
//! instantiates or the chunk serializer writes out.
//!
//! # Modules
//!
//! - `lexer`: byte-oriented tokenizer with one-token lookahead
//! - `codegen`: registers, constants, patch lists, expression
//!   descriptors
//! - `parser`: the grammar productions driving the emitter

pub mod codegen;
pub mod lexer;
pub mod parser;

use selune_core::proto::ProtoDesc;

/// A compile-time failure with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    /// Chunk name in display form.
    pub chunk: String,
    pub line: u32,
    pub message: String,
}

impl SyntaxError {
    pub fn new(chunk: String, line: u32, message: String) -> SyntaxError {
        SyntaxError { chunk, line, message }
    }
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.chunk, self.line, self.message)
    }
}

impl std::error::Error for SyntaxError {}

/// Compile `source` into the main function prototype of a chunk.
///
/// `chunk_name` names the chunk for error messages and debug
/// information: `@path` for files, `=name` for fixed names, anything
/// else is shown as a source snippet.
pub fn compile(source: &[u8], chunk_name: &[u8]) -> Result<ProtoDesc, SyntaxError> {
    parser::parse(source, chunk_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_has_position() {
        let err = compile(b"local = 3", b"=chunk").unwrap_err();
        assert_eq!(err.chunk, "chunk");
        assert!(err.to_string().starts_with("chunk:1: "));
    }

    #[test]
    fn compile_produces_main_proto() {
        let p = compile(b"return 1 + 1", b"@file.sel").expect("compiles");
        assert_eq!(p.source, b"@file.sel");
        assert!(p.is_vararg);
    }
}
