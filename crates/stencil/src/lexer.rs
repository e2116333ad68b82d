use std::collections::VecDeque;

use memchr::memchr2;

use crate::error::{CompileError, CompileResult};

/// Identifiers longer than this are rejected during lexing.
pub(crate) const MAX_IDENTIFIER_LEN: usize = 64;

/// The number of lexemes a single state step may leave queued for the
/// consumer before yielding.
const READY_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LexemeKind {
    Eof,
    Identifier,
    LeftMeta,
    Hash,
    RightMeta,
    Text,
    Slash,
    QuestionMark,
    Hat,
    GreaterThan,
    OpenCurlyBrace,
    CloseCurlyBrace,
}

impl LexemeKind {
    /// Human-readable name used in error messages.
    pub fn description(self) -> &'static str {
        match self {
            LexemeKind::Eof => "end of input",
            LexemeKind::Identifier => "identifier",
            LexemeKind::LeftMeta => "`{{`",
            LexemeKind::Hash => "`#`",
            LexemeKind::RightMeta => "`}}`",
            LexemeKind::Text => "text",
            LexemeKind::Slash => "`/`",
            LexemeKind::QuestionMark => "`?`",
            LexemeKind::Hat => "`^`",
            LexemeKind::GreaterThan => "`>`",
            LexemeKind::OpenCurlyBrace => "`{`",
            LexemeKind::CloseCurlyBrace => "`}`",
        }
    }
}

/// One classified token. The text borrows the template source, so lexemes
/// only live as long as the compilation that consumes them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lexeme<'src> {
    pub kind: LexemeKind,
    pub text: &'src str,
}

/// The lexer's current state function. Each step consumes some input,
/// queues zero or more lexemes, and names the state to run next; `None`
/// is terminal.
#[derive(Debug, Clone, Copy)]
enum State {
    Text,
    LeftMeta,
    Comment,
    InsideAction,
    Identifier,
    QuotedIdentifier,
    Partial,
    RightMeta,
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'/')
}

/// A streaming tokenizer for template source. Lexemes are produced lazily:
/// each `next_lexeme` call runs state functions until one is available.
/// A lexical error ends the stream; every call after end-of-input or an
/// error yields EOF.
pub(crate) struct Lexer<'src> {
    source: &'src str,
    pos: usize,
    state: Option<State>,
    ready: VecDeque<Lexeme<'src>>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            pos: 0,
            state: Some(State::Text),
            ready: VecDeque::with_capacity(READY_CAPACITY),
        }
    }

    pub fn next_lexeme(&mut self) -> CompileResult<Lexeme<'src>> {
        loop {
            if let Some(lexeme) = self.ready.pop_front() {
                return Ok(lexeme);
            }
            let Some(state) = self.state else {
                return Ok(Lexeme {
                    kind: LexemeKind::Eof,
                    text: "",
                });
            };
            match self.step(state) {
                Ok(next) => self.state = next,
                Err(error) => {
                    self.state = None;
                    return Err(error);
                }
            }
        }
    }

    fn step(&mut self, state: State) -> CompileResult<Option<State>> {
        match state {
            State::Text => self.text(),
            State::LeftMeta => self.left_meta(),
            State::Comment => self.comment(),
            State::InsideAction => self.inside_action(),
            State::Identifier => self.identifier(),
            State::QuotedIdentifier => self.quoted_identifier(),
            State::Partial => self.partial(),
            State::RightMeta => self.right_meta(),
        }
    }

    //#region State functions

    /// Scan literal text until an action opens or the input ends. A stray
    /// `}}` outside of an action is an error.
    fn text(&mut self) -> CompileResult<Option<State>> {
        let start = self.pos;
        let mut cursor = self.pos;
        loop {
            let rest = &self.source.as_bytes()[cursor..];
            let Some(offset) = memchr2(b'{', b'}', rest) else {
                self.pos = self.source.len();
                self.emit_text(start, self.pos);
                self.emit(LexemeKind::Eof, "");
                return Ok(None);
            };

            let at = cursor + offset;
            let byte = self.source.as_bytes()[at];
            let paired = self.source.as_bytes().get(at + 1) == Some(&byte);
            if byte == b'{' && paired {
                self.emit_text(start, at);
                self.pos = at + 2;
                return Ok(Some(State::LeftMeta));
            }
            if byte == b'}' && paired {
                return Err(CompileError::StrayActionClose);
            }
            cursor = at + 1;
        }
    }

    /// The `{{` introducer was just consumed. A `!` turns the action into a
    /// comment; anything else belongs to the action proper.
    fn left_meta(&mut self) -> CompileResult<Option<State>> {
        if self.peek() == Some(b'!') {
            self.pos += 1;
            return Ok(Some(State::Comment));
        }
        self.emit(LexemeKind::LeftMeta, &self.source[self.pos - 2..self.pos]);
        Ok(Some(State::InsideAction))
    }

    /// Consume a `{{! … }}` comment, tracking brace depth so balanced
    /// braces may appear inside. The content is dropped.
    fn comment(&mut self) -> CompileResult<Option<State>> {
        // The `{{` of the introducer is still open at this point.
        let mut depth = 2usize;
        while let Some(byte) = self.peek() {
            self.pos += 1;
            match byte {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(Some(State::Text));
                    }
                }
                _ => {}
            }
        }
        Err(CompileError::UnterminatedComment)
    }

    /// Dispatch on the next significant character of an action. Whitespace
    /// is skipped, but a newline ends the line before the action closed.
    fn inside_action(&mut self) -> CompileResult<Option<State>> {
        loop {
            let Some(byte) = self.peek() else {
                return Err(CompileError::UnexpectedEof);
            };
            return match byte {
                b' ' | b'\t' => {
                    self.pos += 1;
                    continue;
                }
                b'\n' | b'\r' => Err(CompileError::ActionOnMultipleLines),
                b'#' => self.single(LexemeKind::Hash),
                b'?' => self.single(LexemeKind::QuestionMark),
                b'^' => self.single(LexemeKind::Hat),
                b'/' => self.single(LexemeKind::Slash),
                b'>' => {
                    self.single(LexemeKind::GreaterThan)?;
                    Ok(Some(State::Partial))
                }
                b'{' => Ok(Some(State::QuotedIdentifier)),
                b'}' => {
                    if self.peek_at(1) == Some(b'}') {
                        Ok(Some(State::RightMeta))
                    } else {
                        Err(CompileError::UnexpectedCharacter('}'))
                    }
                }
                _ if is_identifier_byte(byte) => Ok(Some(State::Identifier)),
                _ => Err(CompileError::UnexpectedCharacter(self.current_char())),
            };
        }
    }

    fn identifier(&mut self) -> CompileResult<Option<State>> {
        self.lex_identifier()?;
        Ok(Some(State::InsideAction))
    }

    /// `{var}` inside an action: the opening brace marks the variable for
    /// escaped substitution, and the closing brace must follow the
    /// identifier immediately.
    fn quoted_identifier(&mut self) -> CompileResult<Option<State>> {
        self.emit(
            LexemeKind::OpenCurlyBrace,
            &self.source[self.pos..self.pos + 1],
        );
        self.pos += 1;
        self.lex_identifier()?;
        match self.peek() {
            Some(b'}') => {
                self.emit(
                    LexemeKind::CloseCurlyBrace,
                    &self.source[self.pos..self.pos + 1],
                );
                self.pos += 1;
                Ok(Some(State::InsideAction))
            }
            Some(_) => Err(CompileError::UnexpectedCharacter(self.current_char())),
            None => Err(CompileError::UnexpectedEof),
        }
    }

    /// The name following `{{>`. Lexed as its own state because partial
    /// names are the one place an identifier is mandatory on its own.
    fn partial(&mut self) -> CompileResult<Option<State>> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') => self.pos += 1,
                Some(b'\n') | Some(b'\r') => return Err(CompileError::ActionOnMultipleLines),
                Some(_) => break,
                None => return Err(CompileError::UnexpectedEof),
            }
        }
        self.lex_identifier()?;
        Ok(Some(State::InsideAction))
    }

    fn right_meta(&mut self) -> CompileResult<Option<State>> {
        self.emit(LexemeKind::RightMeta, &self.source[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(Some(State::Text))
    }

    //#endregion

    /// Consume a maximal run of identifier characters and queue it.
    fn lex_identifier(&mut self) -> CompileResult<()> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if !is_identifier_byte(byte) {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(CompileError::ExpectedIdentifier);
        }
        if self.pos - start > MAX_IDENTIFIER_LEN {
            return Err(CompileError::IdentifierTooLong);
        }
        self.emit(LexemeKind::Identifier, &self.source[start..self.pos]);
        Ok(())
    }

    fn single(&mut self, kind: LexemeKind) -> CompileResult<Option<State>> {
        self.emit(kind, &self.source[self.pos..self.pos + 1]);
        self.pos += 1;
        Ok(Some(State::InsideAction))
    }

    fn emit(&mut self, kind: LexemeKind, text: &'src str) {
        debug_assert!(self.ready.len() < READY_CAPACITY);
        self.ready.push_back(Lexeme { kind, text });
    }

    fn emit_text(&mut self, start: usize, end: usize) {
        if end > start {
            self.emit(LexemeKind::Text, &self.source[start..end]);
        }
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.as_bytes().get(self.pos + offset).copied()
    }

    fn current_char(&self) -> char {
        self.source[self.pos..].chars().next().unwrap_or('\u{FFFD}')
    }
}
