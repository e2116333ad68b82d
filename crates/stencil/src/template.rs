use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::chunk::{link, Chunk};
use crate::error::{CompileError, CompileResult};
use crate::parser;
use crate::render::Interpreter;
use crate::schema::{Record, Schema};

bitflags! {
    /// Options accepted by [`compile_string_full`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompileFlags: u8 {
        /// Literal text chunks reference the template's retained source
        /// buffer instead of owning copies. Compilation keeps the whole
        /// source alive for the life of the template; without the flag the
        /// source is released once compiled.
        const CONST_TEMPLATE = 1 << 0;
    }
}

/// A compiled template: a flat, linked chunk program plus a size hint for
/// pre-growing output buffers. Rendering is reentrant and takes `&self`,
/// so one template may serve concurrent callers on disjoint buffers.
#[derive(Debug)]
pub struct Template {
    chunks: Box<[Chunk]>,
    source: Option<Arc<str>>,
    minimum_size: usize,
}

impl Template {
    /// Render into a fresh buffer pre-sized to the template's estimate.
    pub fn apply(&self, record: &dyn Record) -> String {
        let mut out = String::with_capacity(self.minimum_size);
        self.render_into(record, &mut out);
        out
    }

    /// Reset the caller's buffer, grow it to the template's estimate, and
    /// render into it.
    pub fn apply_with_buffer(&self, record: &dyn Record, out: &mut String) {
        out.clear();
        out.reserve(self.minimum_size);
        self.render_into(record, out);
    }

    /// The pre-sizing hint: every literal byte plus a small reservation per
    /// variable, including those of embedded partials.
    pub fn minimum_size(&self) -> usize {
        self.minimum_size
    }

    pub(crate) fn render_into(&self, record: &dyn Record, out: &mut String) {
        Interpreter::new(&self.chunks, self.source.as_deref()).render(record, out);
    }
}

/// Compile an in-memory template source against a schema.
pub fn compile_string(source: &str, schema: &Schema) -> CompileResult<Template> {
    compile_string_full(source, schema, CompileFlags::empty())
}

/// Compile an in-memory template source with explicit flags. Partial
/// references resolve relative to the current directory.
pub fn compile_string_full(
    source: &str,
    schema: &Schema,
    flags: CompileFlags,
) -> CompileResult<Template> {
    let mut loader = PartialLoader::in_memory(flags);
    compile_with(source, schema, &mut loader)
}

/// Load a template file and compile it. Partial references resolve
/// relative to the file's directory.
pub fn compile_file(path: impl AsRef<Path>, schema: &Schema) -> CompileResult<Template> {
    let path = path.as_ref();
    let canonical = fs::canonicalize(path).map_err(|error| io_error(path, error))?;
    let source = fs::read_to_string(&canonical).map_err(|error| io_error(path, error))?;
    debug!(path = %path.display(), bytes = source.len(), "compiling template file");

    let mut loader = PartialLoader {
        flags: CompileFlags::empty(),
        base_dir: parent_dir(&canonical),
        active: vec![canonical],
    };
    compile_with(&source, schema, &mut loader)
}

fn compile_with(
    source: &str,
    schema: &Schema,
    loader: &mut PartialLoader,
) -> CompileResult<Template> {
    let program = parser::parse(source, schema, loader)?;
    let mut chunks = program.chunks;
    link(&mut chunks)?;
    debug!(
        chunks = chunks.len(),
        minimum_size = program.minimum_size,
        "compiled template"
    );

    let source = loader
        .shares_source()
        .then(|| Arc::<str>::from(source));
    Ok(Template {
        chunks: chunks.into_boxed_slice(),
        source,
        minimum_size: program.minimum_size,
    })
}

fn io_error(path: &Path, error: io::Error) -> CompileError {
    CompileError::Io {
        path: path.display().to_string(),
        source: error,
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Resolves `{{> name}}` references while a template compiles: paths are
/// joined onto the including file's directory, and the canonicalized chain
/// of files being compiled guards against inclusion cycles.
pub(crate) struct PartialLoader {
    flags: CompileFlags,
    base_dir: PathBuf,
    active: Vec<PathBuf>,
}

impl PartialLoader {
    pub fn in_memory(flags: CompileFlags) -> Self {
        Self {
            flags,
            base_dir: PathBuf::from("."),
            active: Vec::new(),
        }
    }

    /// Whether literal chunks of the compilation in progress should span
    /// the retained source rather than own copies.
    pub fn shares_source(&self) -> bool {
        self.flags.contains(CompileFlags::CONST_TEMPLATE)
    }

    /// Compile the named template file against the schema of the enclosing
    /// compilation.
    pub fn load(&mut self, name: &str, schema: &Schema) -> CompileResult<Template> {
        trace!(name, "compiling partial");
        self.load_inner(name, schema)
            .map_err(|error| CompileError::Partial {
                name: name.to_string(),
                source: Box::new(error),
            })
    }

    fn load_inner(&mut self, name: &str, schema: &Schema) -> CompileResult<Template> {
        let path = self.base_dir.join(name);
        let canonical = fs::canonicalize(&path).map_err(|error| io_error(&path, error))?;
        if self.active.contains(&canonical) {
            return Err(CompileError::IncludeCycle(path.display().to_string()));
        }
        let source = fs::read_to_string(&canonical).map_err(|error| io_error(&path, error))?;

        // Nested templates always own their literals, so a partial never
        // pins its includer's source buffer.
        let outer_flags = std::mem::replace(&mut self.flags, CompileFlags::empty());
        let outer_base = std::mem::replace(&mut self.base_dir, parent_dir(&canonical));
        self.active.push(canonical);

        let result = compile_with(&source, schema, self);

        self.active.pop();
        self.base_dir = outer_base;
        self.flags = outer_flags;
        result
    }
}
