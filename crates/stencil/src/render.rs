use crate::chunk::{Chunk, FieldId, Literal};
use crate::escape::push_escaped;
use crate::schema::{Field, Record, EMPTY_RECORD};

/// One level of the record chain a render walks: the innermost record plus
/// a link to the frame it was entered from. Variable chunks address fields
/// as a scope distance and index, which maps directly onto this chain.
pub(crate) struct Frame<'a> {
    record: &'a dyn Record,
    parent: Option<&'a Frame<'a>>,
}

impl<'a> Frame<'a> {
    pub fn root(record: &'a dyn Record) -> Self {
        Self {
            record,
            parent: None,
        }
    }

    fn lookup(&self, id: FieldId) -> Field<'a> {
        let mut frame = self;
        for _ in 0..id.depth {
            match frame.parent {
                Some(parent) => frame = parent,
                None => break,
            }
        }
        frame.record.field(id.index as usize)
    }

    /// The record the render started from, used by embedded partials.
    fn bottom(&self) -> &'a dyn Record {
        let mut frame = self;
        while let Some(parent) = frame.parent {
            frame = parent;
        }
        frame.record
    }
}

/// Walks a linked chunk program and appends the rendered output. Bodies of
/// conditionals and iterations execute as recursive sub-ranges bounded by
/// the indices the linker filled in, so dispatch never lands on a close
/// chunk.
pub(crate) struct Interpreter<'t> {
    chunks: &'t [Chunk],
    source: Option<&'t str>,
}

impl<'t> Interpreter<'t> {
    pub fn new(chunks: &'t [Chunk], source: Option<&'t str>) -> Self {
        Self { chunks, source }
    }

    pub fn render(&self, record: &dyn Record, out: &mut String) {
        self.run_range(0, self.chunks.len(), &Frame::root(record), out);
    }

    fn run_range(&self, mut pc: usize, end: usize, frame: &Frame<'_>, out: &mut String) {
        while pc < end {
            match &self.chunks[pc] {
                Chunk::Append(literal) => out.push_str(self.literal_text(literal)),
                Chunk::AppendChar(byte) => out.push(*byte as char),
                Chunk::Variable { field } => frame.lookup(*field).append_to(out),
                Chunk::VariableStr { field } => {
                    if let Field::Str(Some(text)) = frame.lookup(*field) {
                        out.push_str(text);
                    }
                }
                Chunk::VariableStrEscape { field } => {
                    if let Field::Str(Some(text)) = frame.lookup(*field) {
                        push_escaped(out, text);
                    }
                }
                Chunk::CondOpen { field, negate, end } => {
                    let close = *end as usize;
                    if frame.lookup(*field).is_empty_value() == *negate {
                        self.run_range(pc + 1, close, frame, out);
                    }
                    pc = close + 1;
                    continue;
                }
                Chunk::IterOpen {
                    field,
                    negate,
                    after,
                } => {
                    let after = *after as usize;
                    if let Field::List(mut items) = frame.lookup(*field) {
                        let close = after - 1;
                        if !*negate {
                            while let Some(item) = items.next() {
                                let inner = Frame {
                                    record: item,
                                    parent: Some(frame),
                                };
                                self.run_range(pc + 1, close, &inner, out);
                            }
                        } else if items.next().is_none() {
                            // The body of a negated iteration runs once with
                            // no item in scope.
                            let inner = Frame {
                                record: &EMPTY_RECORD,
                                parent: Some(frame),
                            };
                            self.run_range(pc + 1, close, &inner, out);
                        }
                    }
                    pc = after;
                    continue;
                }
                Chunk::CondClose | Chunk::IterClose { .. } => {
                    // Range bounds only; see `run_range` docs.
                }
                Chunk::ApplyTemplate(template) => {
                    template.render_into(frame.bottom(), out);
                }
                Chunk::RawVariable { .. } => {
                    debug_assert!(false, "unlinked chunk survived compilation");
                }
                Chunk::Last => return,
            }
            pc += 1;
        }
    }

    fn literal_text(&self, literal: &'t Literal) -> &'t str {
        match literal {
            Literal::Owned(text) => text,
            Literal::Shared(span) => {
                debug_assert!(self.source.is_some(), "shared literal without a source");
                self.source.map_or("", |source| &source[span.range()])
            }
        }
    }
}
