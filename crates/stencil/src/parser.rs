use bitflags::bitflags;

use crate::chunk::{Chunk, Literal, Program, TextSpan};
use crate::error::{CompileError, CompileResult};
use crate::lexer::{Lexeme, LexemeKind, Lexer};
use crate::schema::{FieldKind, Schema, ValueKind};
use crate::scope::{Resolved, SymbolTable};
use crate::template::PartialLoader;

bitflags! {
    /// Modifiers accumulated while parsing one action.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ActionFlags: u8 {
        /// Set by `^`: invert the block being opened.
        const NEGATE = 1 << 0;
        /// Set by `{`: substitute with HTML escaping.
        const QUOTE = 1 << 1;
    }
}

/// What kind of block an open tag started, and therefore what its close
/// tag has to look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Iter,
    Cond { question: bool },
}

/// An entry of the open-block stack. Close tags must match the identifier
/// byte-for-byte and the block form.
struct OpenBlock<'src> {
    kind: BlockKind,
    ident: &'src str,
    chunk: usize,
}

impl OpenBlock<'_> {
    fn display_name(&self) -> String {
        match self.kind {
            BlockKind::Cond { question: true } => format!("{}?", self.ident),
            _ => self.ident.to_string(),
        }
    }
}

fn close_display_name(ident: &str, question: bool) -> String {
    if question {
        format!("{ident}?")
    } else {
        ident.to_string()
    }
}

/// The parser's state function, mirroring the lexer's machine one level
/// up: each state consumes one lexeme and names its successor.
enum State<'src> {
    Text,
    Meta,
    Identifier(Lexeme<'src>),
    Negate,
    Iter,
    Slash,
    Partial,
    Done,
}

/// Consume the lexeme stream for `source`, validating nesting and name
/// resolution against `schema`, and emit an unlinked chunk program.
pub(crate) fn parse<'src>(
    source: &'src str,
    schema: &Schema,
    loader: &mut PartialLoader,
) -> CompileResult<Program> {
    Parser {
        source,
        lexer: Lexer::new(source),
        peeked: None,
        chunks: Vec::new(),
        symbols: SymbolTable::new(schema),
        blocks: Vec::new(),
        flags: ActionFlags::empty(),
        minimum_size: 0,
        schema,
        loader,
    }
    .run()
}

struct Parser<'src, 's, 'l> {
    source: &'src str,
    lexer: Lexer<'src>,
    peeked: Option<Lexeme<'src>>,
    chunks: Vec<Chunk>,
    symbols: SymbolTable<'s>,
    blocks: Vec<OpenBlock<'src>>,
    flags: ActionFlags,
    minimum_size: usize,
    schema: &'s Schema,
    loader: &'l mut PartialLoader,
}

impl<'src, 's, 'l> Parser<'src, 's, 'l> {
    fn run(mut self) -> CompileResult<Program> {
        let mut state = State::Text;
        loop {
            state = match state {
                State::Text => self.text()?,
                State::Meta => self.meta()?,
                State::Identifier(ident) => self.identifier(ident)?,
                State::Negate => self.negate()?,
                State::Iter => self.iter()?,
                State::Slash => self.slash()?,
                State::Partial => self.partial()?,
                State::Done => break,
            };
        }
        self.finish()
    }

    //#region State functions

    fn text(&mut self) -> CompileResult<State<'src>> {
        let lexeme = self.next()?;
        match lexeme.kind {
            LexemeKind::LeftMeta => {
                // Modifiers never carry over from one action to the next.
                self.flags = ActionFlags::empty();
                Ok(State::Meta)
            }
            LexemeKind::Text => {
                self.minimum_size += lexeme.text.len();
                let chunk = if lexeme.text.len() == 1 {
                    Chunk::AppendChar(lexeme.text.as_bytes()[0])
                } else {
                    Chunk::Append(self.literal(lexeme.text))
                };
                self.chunks.push(chunk);
                Ok(State::Text)
            }
            LexemeKind::Eof => {
                self.chunks.push(Chunk::Last);
                Ok(State::Done)
            }
            other => Err(CompileError::UnexpectedLexeme(other.description())),
        }
    }

    fn meta(&mut self) -> CompileResult<State<'src>> {
        let lexeme = self.next()?;
        match lexeme.kind {
            LexemeKind::OpenCurlyBrace => {
                if self.flags.contains(ActionFlags::QUOTE) {
                    return Err(CompileError::DoubleQuote);
                }
                self.flags.insert(ActionFlags::QUOTE);
                Ok(State::Meta)
            }
            LexemeKind::Identifier => Ok(State::Identifier(lexeme)),
            LexemeKind::GreaterThan => Ok(State::Partial),
            LexemeKind::Hash => Ok(State::Iter),
            LexemeKind::Hat => Ok(State::Negate),
            LexemeKind::Slash => Ok(State::Slash),
            other => Err(CompileError::UnexpectedLexeme(other.description())),
        }
    }

    fn identifier(&mut self, ident: Lexeme<'src>) -> CompileResult<State<'src>> {
        if self.flags.contains(ActionFlags::QUOTE) {
            self.expect(LexemeKind::CloseCurlyBrace)?;
        }
        let resolved = self.resolve(ident.text)?;
        match self.peek()? {
            LexemeKind::RightMeta => {
                self.next()?;
                if self.flags.contains(ActionFlags::NEGATE) {
                    return self.open_negated_block(ident, resolved);
                }
                if resolved.value_kind() == ValueKind::List {
                    return Err(CompileError::NotAppendable(ident.text.into()));
                }
                self.chunks.push(Chunk::RawVariable {
                    field: resolved.id,
                    kind: resolved.value_kind(),
                    escape: self.flags.contains(ActionFlags::QUOTE),
                });
                self.minimum_size += ident.text.len() + 1;
                self.flags.remove(ActionFlags::QUOTE);
                Ok(State::Text)
            }
            LexemeKind::QuestionMark => {
                self.next()?;
                if resolved.value_kind() == ValueKind::List {
                    return Err(CompileError::NotTestable(ident.text.into()));
                }
                let chunk = self.chunks.len();
                self.chunks.push(Chunk::CondOpen {
                    field: resolved.id,
                    negate: self.flags.contains(ActionFlags::NEGATE),
                    end: 0,
                });
                self.blocks.push(OpenBlock {
                    kind: BlockKind::Cond { question: true },
                    ident: ident.text,
                    chunk,
                });
                self.flags.remove(ActionFlags::NEGATE);
                self.expect(LexemeKind::RightMeta)?;
                Ok(State::Text)
            }
            other => Err(CompileError::UnexpectedLexeme(other.description())),
        }
    }

    /// `{{^var}}` opens a block: a negated iteration when the variable is a
    /// list, an inverted conditional otherwise. Both close with `{{/var}}`.
    fn open_negated_block(
        &mut self,
        ident: Lexeme<'src>,
        resolved: Resolved<'s>,
    ) -> CompileResult<State<'src>> {
        let chunk = self.chunks.len();
        match resolved.kind {
            FieldKind::List(items) => {
                self.chunks.push(Chunk::IterOpen {
                    field: resolved.id,
                    negate: true,
                    after: 0,
                });
                self.symbols.push_scope(items);
                self.blocks.push(OpenBlock {
                    kind: BlockKind::Iter,
                    ident: ident.text,
                    chunk,
                });
            }
            _ => {
                self.chunks.push(Chunk::CondOpen {
                    field: resolved.id,
                    negate: true,
                    end: 0,
                });
                self.blocks.push(OpenBlock {
                    kind: BlockKind::Cond { question: false },
                    ident: ident.text,
                    chunk,
                });
            }
        }
        self.flags.remove(ActionFlags::NEGATE);
        Ok(State::Text)
    }

    fn negate(&mut self) -> CompileResult<State<'src>> {
        self.flags.toggle(ActionFlags::NEGATE);
        let lexeme = self.next()?;
        match lexeme.kind {
            LexemeKind::Hash => Ok(State::Iter),
            LexemeKind::Identifier => Ok(State::Identifier(lexeme)),
            other => Err(CompileError::UnexpectedLexeme(other.description())),
        }
    }

    fn iter(&mut self) -> CompileResult<State<'src>> {
        let ident = self.expect(LexemeKind::Identifier)?;
        let resolved = self.resolve(ident.text)?;
        let FieldKind::List(items) = resolved.kind else {
            return Err(CompileError::NotIterable(ident.text.into()));
        };
        let chunk = self.chunks.len();
        self.chunks.push(Chunk::IterOpen {
            field: resolved.id,
            negate: self.flags.contains(ActionFlags::NEGATE),
            after: 0,
        });
        self.symbols.push_scope(items);
        self.blocks.push(OpenBlock {
            kind: BlockKind::Iter,
            ident: ident.text,
            chunk,
        });
        self.flags.remove(ActionFlags::NEGATE);
        self.expect(LexemeKind::RightMeta)?;
        Ok(State::Text)
    }

    fn slash(&mut self) -> CompileResult<State<'src>> {
        let ident = self.expect(LexemeKind::Identifier)?;
        let next = self.next()?;
        match next.kind {
            LexemeKind::RightMeta => {
                self.close_block(ident.text, false)?;
                Ok(State::Text)
            }
            LexemeKind::QuestionMark => {
                self.close_block(ident.text, true)?;
                self.expect(LexemeKind::RightMeta)?;
                Ok(State::Text)
            }
            other => Err(CompileError::UnexpectedLexeme(other.description())),
        }
    }

    fn partial(&mut self) -> CompileResult<State<'src>> {
        let ident = self.expect(LexemeKind::Identifier)?;
        let template = self.loader.load(ident.text, self.schema)?;
        self.minimum_size += template.minimum_size();
        self.chunks.push(Chunk::ApplyTemplate(Box::new(template)));
        self.expect(LexemeKind::RightMeta)?;
        Ok(State::Text)
    }

    //#endregion

    fn close_block(&mut self, ident: &str, question: bool) -> CompileResult<()> {
        let Some(block) = self.blocks.pop() else {
            return Err(CompileError::UnmatchedCloseTag(close_display_name(
                ident, question,
            )));
        };
        let question_expected = matches!(block.kind, BlockKind::Cond { question: true });
        if block.ident != ident || question_expected != question {
            return Err(CompileError::MismatchedCloseTag {
                expected: block.display_name(),
                found: close_display_name(ident, question),
            });
        }
        match block.kind {
            BlockKind::Iter => {
                self.chunks.push(Chunk::IterClose {
                    open: block.chunk as u32,
                });
                self.symbols.pop_scope();
            }
            BlockKind::Cond { .. } => self.chunks.push(Chunk::CondClose),
        }
        Ok(())
    }

    fn finish(self) -> CompileResult<Program> {
        if !self.blocks.is_empty() {
            let pending = self
                .blocks
                .iter()
                .rev()
                .map(|block| format!("`{}`", block.display_name()))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(CompileError::UnclosedTags(pending));
        }
        debug_assert_eq!(self.symbols.depth(), 0, "scopes left open after parsing");
        Ok(Program {
            chunks: self.chunks,
            minimum_size: self.minimum_size,
        })
    }

    fn literal(&self, text: &'src str) -> Literal {
        if self.loader.shares_source() {
            let start = text.as_ptr() as usize - self.source.as_ptr() as usize;
            Literal::Shared(TextSpan {
                start: start as u32,
                end: (start + text.len()) as u32,
            })
        } else {
            Literal::Owned(text.into())
        }
    }

    fn resolve(&self, name: &str) -> CompileResult<Resolved<'s>> {
        self.symbols
            .resolve(name)
            .ok_or_else(|| CompileError::UnknownVariable(name.into()))
    }

    fn next(&mut self) -> CompileResult<Lexeme<'src>> {
        match self.peeked.take() {
            Some(lexeme) => Ok(lexeme),
            None => self.lexer.next_lexeme(),
        }
    }

    fn peek(&mut self) -> CompileResult<LexemeKind> {
        match &self.peeked {
            Some(lexeme) => Ok(lexeme.kind),
            None => {
                let lexeme = self.lexer.next_lexeme()?;
                let kind = lexeme.kind;
                self.peeked = Some(lexeme);
                Ok(kind)
            }
        }
    }

    fn expect(&mut self, kind: LexemeKind) -> CompileResult<Lexeme<'src>> {
        let lexeme = self.next()?;
        if lexeme.kind != kind {
            return Err(CompileError::UnexpectedLexeme(lexeme.kind.description()));
        }
        Ok(lexeme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::link;
    use crate::template::CompileFlags;

    fn schema() -> Schema {
        Schema::new()
            .str("name")
            .int("count")
            .list("items", Schema::new().str("name").int("v"))
    }

    fn parse_chunks(source: &str) -> Program {
        let schema = schema();
        let mut loader = PartialLoader::in_memory(CompileFlags::empty());
        let mut program = parse(source, &schema, &mut loader).expect("parse must succeed");
        link(&mut program.chunks).expect("link must succeed");
        program
    }

    fn parse_error(source: &str) -> CompileError {
        let schema = schema();
        let mut loader = PartialLoader::in_memory(CompileFlags::empty());
        match parse(source, &schema, &mut loader) {
            Ok(mut program) => match link(&mut program.chunks) {
                Ok(()) => panic!("expected a compile error for {source:?}"),
                Err(error) => error,
            },
            Err(error) => error,
        }
    }

    #[test]
    fn literal_text_becomes_append_chunks() {
        let program = parse_chunks("hello {{name}}");
        assert!(matches!(&program.chunks[0], Chunk::Append(Literal::Owned(text)) if &**text == "hello "));
        assert!(matches!(program.chunks[1], Chunk::VariableStr { .. }));
        assert!(matches!(program.chunks[2], Chunk::Last));
    }

    #[test]
    fn single_byte_text_becomes_append_char() {
        let program = parse_chunks("{{name}}!");
        assert!(matches!(program.chunks[1], Chunk::AppendChar(b'!')));
    }

    #[test]
    fn minimum_size_counts_literals_and_variables() {
        // "hello " is six bytes, and the variable reserves `len + 1`.
        let program = parse_chunks("hello {{name}}");
        assert_eq!(program.minimum_size, 6 + "name".len() + 1);
    }

    #[test]
    fn iteration_links_forward_and_backward() {
        let program = parse_chunks("{{#items}}{{v}}{{/items}}");
        assert!(matches!(
            program.chunks[0],
            Chunk::IterOpen {
                negate: false,
                after: 3,
                ..
            }
        ));
        assert!(matches!(program.chunks[1], Chunk::Variable { .. }));
        assert!(matches!(program.chunks[2], Chunk::IterClose { open: 0 }));
        assert!(matches!(program.chunks[3], Chunk::Last));
    }

    #[test]
    fn conditional_links_to_its_close() {
        let program = parse_chunks("{{name?}}X{{/name?}}Y");
        assert!(matches!(
            program.chunks[0],
            Chunk::CondOpen {
                negate: false,
                end: 2,
                ..
            }
        ));
        assert!(matches!(program.chunks[1], Chunk::AppendChar(b'X')));
        assert!(matches!(program.chunks[2], Chunk::CondClose));
        assert!(matches!(program.chunks[3], Chunk::AppendChar(b'Y')));
    }

    #[test]
    fn negated_identifier_opens_a_block() {
        let program = parse_chunks("{{^items}}none{{/items}}");
        assert!(matches!(
            program.chunks[0],
            Chunk::IterOpen { negate: true, .. }
        ));

        let program = parse_chunks("{{^name}}anon{{/name}}");
        assert!(matches!(
            program.chunks[0],
            Chunk::CondOpen { negate: true, .. }
        ));
    }

    #[test]
    fn negated_hash_iteration_is_equivalent() {
        let program = parse_chunks("{{^#items}}none{{/items}}");
        assert!(matches!(
            program.chunks[0],
            Chunk::IterOpen { negate: true, .. }
        ));
    }

    #[test]
    fn loop_scope_addresses_outer_fields_by_depth() {
        let program = parse_chunks("{{#items}}{{count}}{{/items}}");
        let Chunk::Variable { field } = program.chunks[1] else {
            panic!("expected a generic variable chunk");
        };
        assert_eq!((field.depth, field.index), (1, 1));
    }

    #[test]
    fn triple_braces_specialize_to_escaped_strings() {
        let program = parse_chunks("{{{name}}}");
        assert!(matches!(program.chunks[0], Chunk::VariableStrEscape { .. }));
    }

    #[test]
    fn unknown_variables_fail_to_resolve() {
        assert_eq!(
            parse_error("{{unknown}}").to_string(),
            "Unknown variable: unknown"
        );
    }

    #[test]
    fn loop_names_are_invisible_outside_the_loop() {
        assert_eq!(
            parse_error("{{#items}}{{/items}}{{v}}").to_string(),
            "Unknown variable: v"
        );
    }

    #[test]
    fn mismatched_close_tags_name_both_sides() {
        assert_eq!(
            parse_error("{{#items}}{{/name}}").to_string(),
            "expecting identifier `items` but found `name`"
        );
        assert_eq!(
            parse_error("{{name?}}{{/name}}").to_string(),
            "expecting identifier `name?` but found `name`"
        );
    }

    #[test]
    fn close_without_open_is_an_error() {
        assert!(matches!(
            parse_error("{{/items}}"),
            CompileError::UnmatchedCloseTag(name) if name == "items"
        ));
    }

    #[test]
    fn unclosed_blocks_are_reported_at_end_of_input() {
        assert!(matches!(
            parse_error("{{#items}}{{name?}}"),
            CompileError::UnclosedTags(pending) if pending == "`name?`, `items`"
        ));
    }

    #[test]
    fn iterating_a_scalar_is_an_error() {
        assert!(matches!(
            parse_error("{{#name}}{{/name}}"),
            CompileError::NotIterable(name) if name == "name"
        ));
    }

    #[test]
    fn testing_a_list_for_emptiness_is_an_error() {
        assert!(matches!(
            parse_error("{{items?}}x{{/items?}}"),
            CompileError::NotTestable(name) if name == "items"
        ));
    }

    #[test]
    fn appending_a_list_is_an_error() {
        assert!(matches!(
            parse_error("{{items}}"),
            CompileError::NotAppendable(name) if name == "items"
        ));
    }

    #[test]
    fn quote_does_not_leak_into_later_actions() {
        // A quoted identifier turned into a conditional leaves the action
        // with the quote modifier still set; the following actions must
        // start clean.
        let program = parse_chunks("{{{name}?}}x{{/name?}}{{count}}");
        assert!(matches!(program.chunks[0], Chunk::CondOpen { .. }));
        assert!(matches!(program.chunks[1], Chunk::AppendChar(b'x')));
        assert!(matches!(program.chunks[2], Chunk::CondClose));
        assert!(matches!(program.chunks[3], Chunk::Variable { .. }));
        assert!(matches!(program.chunks[4], Chunk::Last));
    }

    #[test]
    fn quoted_conditional_at_end_of_input_compiles() {
        let program = parse_chunks("{{{name}?}}x{{/name?}}");
        assert!(matches!(program.chunks[0], Chunk::CondOpen { .. }));
        assert!(matches!(program.chunks[3], Chunk::Last));
    }

    #[test]
    fn dangling_negation_or_quote_fails_inside_the_action() {
        // The action never closes, so the lexer reports the unfinished
        // action before the parser could see the dangling modifier.
        assert!(matches!(parse_error("{{^"), CompileError::UnexpectedEof));
        assert!(matches!(parse_error("{{{"), CompileError::ExpectedIdentifier));
        assert!(matches!(parse_error("{{{name}"), CompileError::UnexpectedEof));
    }

    #[test]
    fn escaping_a_non_string_is_an_error() {
        assert_eq!(
            parse_error("{{{count}}}").to_string(),
            "Variable must be string to be escaped"
        );
    }

    #[test]
    fn shared_literals_span_the_source() {
        let schema = schema();
        let mut loader = PartialLoader::in_memory(CompileFlags::CONST_TEMPLATE);
        let program = parse("hello {{name}}", &schema, &mut loader).unwrap();
        assert!(matches!(
            &program.chunks[0],
            Chunk::Append(Literal::Shared(span)) if span.range() == (0..6)
        ));
    }
}
