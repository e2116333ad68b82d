use std::io;

use thiserror::Error;

/// Errors produced while compiling a template. Rendering has no error path:
/// every failure is caught before a [`crate::Template`] is handed out.
#[derive(Debug, Error)]
pub enum CompileError {
    // Lexical errors
    #[error("unexpected action close sequence")]
    StrayActionClose,
    #[error("actions cannot span multiple lines")]
    ActionOnMultipleLines,
    #[error("unexpected end of input inside an action")]
    UnexpectedEof,
    #[error("comment is not terminated before end of input")]
    UnterminatedComment,
    #[error("unexpected character `{0}` inside an action")]
    UnexpectedCharacter(char),
    #[error("identifier exceeds 64 bytes")]
    IdentifierTooLong,
    #[error("expected an identifier inside the action")]
    ExpectedIdentifier,

    // Syntactic errors
    #[error("unexpected {0} inside an action")]
    UnexpectedLexeme(&'static str),
    #[error("expecting identifier `{expected}` but found `{found}`")]
    MismatchedCloseTag { expected: String, found: String },
    #[error("close tag `{0}` has no matching open tag")]
    UnmatchedCloseTag(String),
    #[error("unmatched open tags at end of input: {0}")]
    UnclosedTags(String),
    #[error("unexpected `{{` inside an already quoted action")]
    DoubleQuote,

    // Semantic errors
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),
    #[error("variable `{0}` is not iterable")]
    NotIterable(String),
    #[error("variable `{0}` cannot be tested for emptiness")]
    NotTestable(String),
    #[error("variable `{0}` cannot be appended to the output")]
    NotAppendable(String),
    #[error("Variable must be string to be escaped")]
    EscapeRequiresString,

    // I/O errors
    #[error("failed to load template `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("in partial `{name}`: {source}")]
    Partial {
        name: String,
        #[source]
        source: Box<CompileError>,
    },
    #[error("template inclusion cycle through `{0}`")]
    IncludeCycle(String),
}

pub type CompileResult<T> = Result<T, CompileError>;
