//! Row representation: a thin struct-of-arrays pairing each `RowDescription`
//! field with a codec reference, and a row holding the raw column bytes
//! plus a shared handle to that layout. Named lookup and positional lookup
//! both go through the same decode path; duplicate column names resolve
//! last-wins.

use std::collections::HashMap;
use std::sync::Arc;

use pglue_sql::{CodecRegistry, TypeError, Value};

use crate::message::FieldDescription;

/// One column's name and the codec used to decode it, built once per
/// `RowDescription` and shared (via `Arc`) by every row in that result set.
pub struct RowLayout {
    names: Vec<String>,
    oids: Vec<u32>,
    /// Name -> index, last occurrence wins.
    by_name: HashMap<String, usize>,
    codecs: Arc<CodecRegistry>,
}

impl RowLayout {
    pub fn new(fields: &[FieldDescription], codecs: Arc<CodecRegistry>) -> Self {
        let mut by_name = HashMap::with_capacity(fields.len());
        let mut names = Vec::with_capacity(fields.len());
        let mut oids = Vec::with_capacity(fields.len());
        for (i, f) in fields.iter().enumerate() {
            names.push(f.name.clone());
            oids.push(f.type_oid);
            by_name.insert(f.name.clone(), i);
        }
        RowLayout { names, oids, by_name, codecs }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

/// One server row: raw column bytes plus the layout needed to decode them.
/// Decoding is lazy — values are parsed on access, not eagerly at
/// construction.
#[derive(Clone)]
pub struct Row {
    layout: Arc<RowLayout>,
    columns: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub fn new(layout: Arc<RowLayout>, columns: Vec<Option<Vec<u8>>>) -> Self {
        Row { layout, columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        self.layout.column_names()
    }

    /// Decode the column at `idx`. `Value::Null` for a SQL NULL, never an
    /// error — only a malformed non-null payload is a [`TypeError`].
    pub fn value(&self, idx: usize) -> Result<Value, TypeError> {
        match self.columns.get(idx) {
            None | Some(None) => Ok(Value::Null),
            Some(Some(bytes)) => {
                let oid = self.layout.oids.get(idx).copied().unwrap_or(pglue_sql::codec::oid::UNKNOWN);
                let text = std::str::from_utf8(bytes).map_err(|e| TypeError::InvalidText { type_name: "text", detail: e.to_string() })?;
                self.layout.codecs.parse(oid, text)
            }
        }
    }

    /// Decode the column named `name`, last-wins on duplicate names.
    pub fn value_by_name(&self, name: &str) -> Result<Value, TypeError> {
        match self.layout.index_of(name) {
            Some(idx) => self.value(idx),
            None => Err(TypeError::InvalidText { type_name: "column", detail: format!("no such column: {name}") }),
        }
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.columns.get(idx), None | Some(None))
    }

    pub fn raw(&self, idx: usize) -> Option<&[u8]> {
        self.columns.get(idx).and_then(|c| c.as_deref())
    }

    /// Every column, decoded in declared order.
    pub fn values(&self) -> Result<Vec<Value>, TypeError> {
        (0..self.columns.len()).map(|i| self.value(i)).collect()
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Row");
        for (i, name) in self.layout.column_names().iter().enumerate() {
            match self.value(i) {
                Ok(v) => {
                    s.field(name, &v);
                }
                Err(_) => {
                    s.field(name, &"<decode error>");
                }
            }
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pglue_sql::codec::oid;

    fn field(name: &str, type_oid: u32) -> FieldDescription {
        FieldDescription { name: name.into(), table_oid: 0, column_id: 0, type_oid, type_size: -1, type_modifier: -1, format: 0 }
    }

    #[test]
    fn decodes_columns_by_position_and_name() {
        let layout = Arc::new(RowLayout::new(&[field("id", oid::INT4), field("name", oid::TEXT)], Arc::new(CodecRegistry::with_builtins())));
        let row = Row::new(layout, vec![Some(b"42".to_vec()), Some(b"bob".to_vec())]);
        assert_eq!(row.value(0).unwrap(), Value::Int4(42));
        assert_eq!(row.value_by_name("name").unwrap(), Value::Text("bob".to_string()));
    }

    #[test]
    fn null_column_decodes_to_null_value() {
        let layout = Arc::new(RowLayout::new(&[field("id", oid::INT4)], Arc::new(CodecRegistry::with_builtins())));
        let row = Row::new(layout, vec![None]);
        assert!(row.is_null(0));
        assert_eq!(row.value(0).unwrap(), Value::Null);
    }

    #[test]
    fn duplicate_column_names_resolve_last_wins() {
        let layout = Arc::new(RowLayout::new(&[field("a", oid::INT4), field("a", oid::TEXT)], Arc::new(CodecRegistry::with_builtins())));
        let row = Row::new(layout, vec![Some(b"1".to_vec()), Some(b"second".to_vec())]);
        assert_eq!(row.value_by_name("a").unwrap(), Value::Text("second".to_string()));
    }

    #[test]
    fn unknown_column_name_is_a_type_error() {
        let layout = Arc::new(RowLayout::new(&[field("id", oid::INT4)], Arc::new(CodecRegistry::with_builtins())));
        let row = Row::new(layout, vec![Some(b"1".to_vec())]);
        assert!(row.value_by_name("missing").is_err());
    }
}
