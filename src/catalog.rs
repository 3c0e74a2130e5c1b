//! The `Catalog` callback contract (spec §6.3) and a reference
//! implementation, `InterningCatalog` — this IS the "Identifier table"
//! component from spec §2/§3: interning of column names into dense
//! indices assigned in first-seen order. A real embedding would instead
//! implement `Catalog` against its own schema/metadata store; the
//! interning table is what a CLI or test harness uses when there is no
//! external schema to consult.

use std::collections::HashMap;

/// Two pure, total functions over a fixed universe of columns, supplied
/// to the `AggCompiler` at construction (spec §6.3). `col_index` returns
/// `None` for a name the catalog doesn't recognise (surfaced by the
/// loader as `LoadError::UnknownColumn`).
pub trait Catalog {
    fn col_index(&self, name: &str) -> Option<u32>;
    fn col_name(&self, idx: u32) -> &str;
    fn num_columns(&self) -> u32;

    /// Optional hook for catalogs that assign indices to previously
    /// unseen names (e.g. `InterningCatalog`) rather than rejecting them.
    /// A schema-backed `Catalog` has a fixed column set and should leave
    /// this at its default, which always declines.
    fn intern(&mut self, _name: &str) -> Option<u32> {
        None
    }
}

/// A `Catalog` that assigns dense indices to column names in the order
/// they're first looked up, rather than from a pre-declared schema.
/// Used by the CLI and by tests where the "table" is just whatever
/// columns the query happens to mention.
#[derive(Default)]
pub struct InterningCatalog {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl InterningCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog with a fixed, pre-declared column order (e.g.
    /// from a known table schema), rather than interning on first use.
    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cat = Self::new();
        for name in columns {
            cat.intern(&name.into());
        }
        cat
    }

    /// Returns the dense index for `name`, assigning a new one in
    /// first-seen order if this is the first time it's been looked up.
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }
}

impl Catalog for InterningCatalog {
    fn col_index(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    fn col_name(&self, idx: u32) -> &str {
        &self.names[idx as usize]
    }

    fn num_columns(&self) -> u32 {
        self.names.len() as u32
    }

    fn intern(&mut self, name: &str) -> Option<u32> {
        Some(InterningCatalog::intern(self, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_order_assigns_dense_indices() {
        let mut cat = InterningCatalog::new();
        assert_eq!(cat.intern("b"), 0);
        assert_eq!(cat.intern("a"), 1);
        assert_eq!(cat.intern("b"), 0, "repeat lookups are idempotent");
        assert_eq!(cat.col_name(0), "b");
        assert_eq!(cat.col_name(1), "a");
        assert_eq!(cat.col_index("a"), Some(1));
        assert_eq!(cat.col_index("missing"), None);
    }

    #[test]
    fn from_columns_preserves_declared_order() {
        let cat = InterningCatalog::from_columns(["a", "b", "c"]);
        assert_eq!(cat.col_index("c"), Some(2));
        assert_eq!(cat.num_columns(), 3);
    }
}
