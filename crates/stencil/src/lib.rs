//! A logic-less, Mustache-style template engine.
//!
//! Template source compiles into a flat program of typed chunks, which an
//! interpreter renders against a caller-supplied record. Compilation
//! validates every identifier against a [`Schema`], so rendering cannot
//! fail: unknown names, unbalanced blocks, and type mismatches are all
//! compile errors.

pub use error::{CompileError, CompileResult};
pub use schema::{CustomField, Field, FieldDef, FieldKind, Items, Record, Schema};
pub use template::{compile_file, compile_string, compile_string_full, CompileFlags, Template};

mod chunk;
mod error;
mod escape;
mod lexer;
mod parser;
mod render;
mod schema;
mod scope;
mod template;
