use rustc_hash::FxHashMap;

use crate::chunk::FieldId;
use crate::schema::{FieldKind, Schema, ValueKind};

/// One level of the symbol table: the fields of a schema, keyed by name.
/// The first definition of a name wins within a scope.
struct Scope<'s> {
    by_name: FxHashMap<&'s str, (u32, &'s FieldKind)>,
}

impl<'s> Scope<'s> {
    fn from_schema(schema: &'s Schema) -> Self {
        let mut by_name =
            FxHashMap::with_capacity_and_hasher(schema.len(), Default::default());
        for (index, field) in schema.fields().iter().enumerate() {
            by_name.entry(field.name()).or_insert((index as u32, field.kind()));
        }
        Self { by_name }
    }
}

/// A successfully resolved identifier: where the field lives relative to
/// the innermost scope, and what shape it has.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Resolved<'s> {
    pub id: FieldId,
    pub kind: &'s FieldKind,
}

impl Resolved<'_> {
    pub fn value_kind(&self) -> ValueKind {
        self.kind.value_kind()
    }
}

/// A stack of name scopes. The root schema sits at the bottom; entering an
/// iteration pushes the item schema, and the matching close pops it.
/// Lookup walks from the innermost scope outward.
pub(crate) struct SymbolTable<'s> {
    scopes: Vec<Scope<'s>>,
}

impl<'s> SymbolTable<'s> {
    pub fn new(root: &'s Schema) -> Self {
        Self {
            scopes: vec![Scope::from_schema(root)],
        }
    }

    pub fn push_scope(&mut self, schema: &'s Schema) {
        self.scopes.push(Scope::from_schema(schema));
    }

    pub fn pop_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "cannot pop the root scope");
        self.scopes.pop();
    }

    /// Number of scopes above the root.
    pub fn depth(&self) -> usize {
        self.scopes.len() - 1
    }

    pub fn resolve(&self, name: &str) -> Option<Resolved<'s>> {
        for (depth, scope) in self.scopes.iter().rev().enumerate() {
            if let Some(&(index, kind)) = scope.by_name.get(name) {
                return Some(Resolved {
                    id: FieldId {
                        depth: depth as u32,
                        index,
                    },
                    kind,
                });
            }
        }
        None
    }
}
