//! SQL fragment composition: a tree that formats to `(query text with $N
//! placeholders, params[])`, injection-safe by construction because user
//! values never touch the text — they flow out as a separate params list.

use crate::codec::Value;

/// A composition tree. Build one with [`Fragment::raw`], [`Fragment::param`],
/// [`Fragment::ident`], [`sql`], or the [`crate::fragment!`] macro, then
/// call [`Fragment::format`] to produce `(text, params)`.
#[derive(Debug, Clone)]
pub enum Fragment {
    /// Verbatim SQL text, never escaped or parameterized.
    Raw(String),
    /// A host value that becomes a `$N` placeholder.
    Param(Value),
    /// A double-quote-escaped identifier.
    Ident(String),
    /// Sub-fragments joined by a literal separator.
    Join { sep: String, parts: Vec<Fragment> },
    /// Renders as `ARRAY[p1,p2,...]` around formatted sub-fragments.
    Array(Vec<Fragment>),
    /// Renders as `(p1,p2,...)` around formatted sub-fragments.
    Row(Vec<Fragment>),
}

impl Fragment {
    pub fn raw(text: impl Into<String>) -> Self {
        Fragment::Raw(text.into())
    }

    pub fn param(value: impl Into<Value>) -> Self {
        Fragment::Param(value.into())
    }

    /// Double-quote-escaped identifier: embedded `"` is doubled per
    /// PostgreSQL's quoted-identifier rule.
    pub fn ident(name: impl AsRef<str>) -> Self {
        Fragment::Ident(name.as_ref().to_string())
    }

    pub fn join(sep: impl Into<String>, parts: Vec<Fragment>) -> Self {
        Fragment::Join { sep: sep.into(), parts }
    }

    pub fn array(parts: Vec<Fragment>) -> Self {
        Fragment::Array(parts)
    }

    pub fn row(parts: Vec<Fragment>) -> Self {
        Fragment::Row(parts)
    }

    /// Format the tree into `(text, params)` with sequential `$1, $2, ...`
    /// placeholders assigned to `Param` nodes in depth-first order.
    pub fn format(&self) -> (String, Vec<Value>) {
        let mut text = String::new();
        let mut params = Vec::new();
        self.write(&mut text, &mut params);
        (text, params)
    }

    fn write(&self, out: &mut String, params: &mut Vec<Value>) {
        match self {
            Fragment::Raw(s) => out.push_str(s),
            Fragment::Param(v) => {
                params.push(v.clone());
                out.push('$');
                out.push_str(&params.len().to_string());
            }
            Fragment::Ident(name) => {
                out.push('"');
                out.push_str(&name.replace('"', "\"\""));
                out.push('"');
            }
            Fragment::Join { sep, parts } => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push_str(sep);
                    }
                    part.write(out, params);
                }
            }
            Fragment::Array(parts) => {
                out.push_str("ARRAY[");
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    part.write(out, params);
                }
                out.push(']');
            }
            Fragment::Row(parts) => {
                out.push('(');
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    part.write(out, params);
                }
                out.push(')');
            }
        }
    }
}

/// Template-string equivalent for targets without tagged templates: `parts`
/// are the literal segments around each interpolation, `values` the
/// corresponding host values. `parts.len()` must equal `values.len() + 1`.
pub fn sql(parts: &[&str], values: Vec<Value>) -> Fragment {
    assert_eq!(
        parts.len(),
        values.len() + 1,
        "sql(): expected one more literal segment than interpolated value"
    );
    let mut pieces = Vec::with_capacity(parts.len() + values.len());
    let mut values = values.into_iter();
    for (i, part) in parts.iter().enumerate() {
        if !part.is_empty() {
            pieces.push(Fragment::Raw((*part).to_string()));
        }
        if let Some(v) = values.next() {
            pieces.push(Fragment::Param(v));
        }
    }
    Fragment::Join { sep: String::new(), parts: pieces }
}

/// Builds a [`Fragment`] from a tagged sequence of raw-text and value
/// pieces, the builder-DSL equivalent of a tagged template:
/// `fragment!(raw "SELECT * FROM users WHERE id = ", param id, raw " AND active = ", param active)`.
#[macro_export]
macro_rules! fragment {
    ($($kind:ident $val:expr),+ $(,)?) => {{
        let parts: Vec<$crate::Fragment> = vec![$($crate::fragment!(@piece $kind $val)),+];
        $crate::Fragment::join("", parts)
    }};
    (@piece raw $val:expr) => { $crate::Fragment::raw($val) };
    (@piece param $val:expr) => { $crate::Fragment::param($val) };
    (@piece ident $val:expr) => { $crate::Fragment::ident($val) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_and_param_interleave_with_sequential_placeholders() {
        let f = Fragment::join(
            "",
            vec![
                Fragment::raw("SELECT * FROM users WHERE id = "),
                Fragment::param(42i32),
                Fragment::raw(" AND name = "),
                Fragment::param("bob"),
            ],
        );
        let (text, params) = f.format();
        assert_eq!(text, "SELECT * FROM users WHERE id = $1 AND name = $2");
        assert_eq!(params, vec![Value::Int4(42), Value::Text("bob".to_string())]);
    }

    #[test]
    fn ident_doubles_embedded_quotes() {
        let f = Fragment::ident("weird\"name");
        let (text, params) = f.format();
        assert_eq!(text, "\"weird\"\"name\"");
        assert!(params.is_empty());
    }

    #[test]
    fn injection_attempt_stays_a_parameter_not_text() {
        let input = "injection'); drop table users; --";
        let f = Fragment::join(
            "",
            vec![Fragment::raw("INSERT INTO users(name) VALUES ("), Fragment::param(input), Fragment::raw(")")],
        );
        let (text, params) = f.format();
        assert_eq!(text, "INSERT INTO users(name) VALUES ($1)");
        assert_eq!(params, vec![Value::Text(input.to_string())]);
    }

    #[test]
    fn sql_helper_interleaves_parts_and_values() {
        let f = sql(&["SELECT ", "::int2, ", "::int4"], vec![Value::Text("0x100".into()), Value::Int4(777)]);
        let (text, _params) = f.format();
        assert_eq!(text, "SELECT $1::int2, $2::int4");
    }

    #[test]
    fn fragment_macro_builds_tagged_pieces() {
        let id = 42i32;
        let f = fragment!(raw "SELECT * FROM users WHERE id = ", param id);
        assert_eq!(f.format().0, "SELECT * FROM users WHERE id = $1");
    }

    #[test]
    fn array_and_row_render_their_brackets() {
        let arr = Fragment::array(vec![Fragment::param(1i32), Fragment::param(2i32)]);
        assert_eq!(arr.format().0, "ARRAY[$1,$2]");
        let row = Fragment::row(vec![Fragment::param(1i32), Fragment::param(2i32)]);
        assert_eq!(row.format().0, "($1,$2)");
    }
}
