//! Type-OID-indexed codec registry: PostgreSQL text-format strings <-> host values.
//!
//! Mirrors the OID table and text/binary duality of a hand-rolled wire driver,
//! but drops every binary-format branch: this registry only ever sees and
//! produces PostgreSQL's text format.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Well-known PostgreSQL type OIDs used by the built-in codecs.
#[allow(dead_code)]
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const CHAR: u32 = 18;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const VARCHAR: u32 = 1043;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
    /// Used for untyped parameters; the registry's fallback codec lives here.
    pub const UNKNOWN: u32 = 0;
}

/// Error raised when a codec refuses a value on `format` or rejects
/// malformed wire text on `parse`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TypeError {
    #[error("expected {expected} type, got OID {got}")]
    UnexpectedOid { expected: &'static str, got: u32 },
    #[error("value out of range for {type_name}: {detail}")]
    OutOfRange { type_name: &'static str, detail: String },
    #[error("invalid {type_name} text: {detail}")]
    InvalidText { type_name: &'static str, detail: String },
}

/// A dynamically-typed column/parameter value. Row construction and
/// parameter binding both flow through this representation; `null` is
/// distinct from every variant so it can be tracked independent of OID.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Json(String),
    Timestamptz(DateTime<Utc>),
    Numeric(Decimal),
    Uuid(Uuid),
    TextArray(Vec<String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int2(v) => write!(f, "{v}"),
            Value::Int4(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Float4(v) => write!(f, "{v}"),
            Value::Float8(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bytea(v) => write!(f, "\\x{}", hex_encode(v)),
            Value::Json(v) => write!(f, "{v}"),
            Value::Timestamptz(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Numeric(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::TextArray(items) => write!(f, "{}", encode_text_array(items)),
        }
    }
}

macro_rules! value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        }
    };
}

value_from!(bool, Bool);
value_from!(i16, Int2);
value_from!(i32, Int4);
value_from!(i64, Int8);
value_from!(f32, Float4);
value_from!(f64, Float8);
value_from!(String, Text);
value_from!(Vec<u8>, Bytea);
value_from!(DateTime<Utc>, Timestamptz);
value_from!(Decimal, Numeric);
value_from!(Uuid, Uuid);
value_from!(Vec<String>, TextArray);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytea(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// One entry in the codec registry: parses incoming text into a `Value`,
/// formats an outgoing `Value` into the text PostgreSQL expects for this OID.
#[derive(Clone, Copy)]
pub struct Codec {
    pub oid: u32,
    pub name: &'static str,
    pub parse: fn(&str) -> Result<Value, TypeError>,
    pub format: fn(&Value) -> Result<Option<String>, TypeError>,
}

/// OID -> codec map with built-ins for the scalar types a text-format wire
/// protocol actually needs. Unknown OIDs fall back to the identity text
/// codec rather than failing lookup.
pub struct CodecRegistry {
    by_oid: HashMap<u32, Codec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self { by_oid: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for codec in BUILTIN_CODECS {
            reg.register(*codec);
        }
        reg
    }

    pub fn register(&mut self, codec: Codec) {
        self.by_oid.insert(codec.oid, codec);
    }

    /// Look up the codec for `oid`, falling back to the text-identity codec
    /// for anything unrecognized. Never fails: lookup is infallible by design.
    pub fn get(&self, oid: u32) -> &Codec {
        self.by_oid.get(&oid).unwrap_or(&TEXT_FALLBACK)
    }

    pub fn parse(&self, oid: u32, text: &str) -> Result<Value, TypeError> {
        (self.get(oid).parse)(text)
    }

    pub fn format(&self, oid: u32, value: &Value) -> Result<Option<String>, TypeError> {
        (self.get(oid).format)(value)
    }
}

fn parse_bool(s: &str) -> Result<Value, TypeError> {
    match s {
        "t" | "true" | "TRUE" | "1" => Ok(Value::Bool(true)),
        "f" | "false" | "FALSE" | "0" => Ok(Value::Bool(false)),
        other => Err(TypeError::InvalidText { type_name: "bool", detail: other.to_string() }),
    }
}

fn format_bool(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(if *b { "t".into() } else { "f".into() })),
        other => Err(type_mismatch("bool", other)),
    }
}

fn parse_int2(s: &str) -> Result<Value, TypeError> {
    s.parse::<i16>()
        .map(Value::Int2)
        .map_err(|e| TypeError::InvalidText { type_name: "int2", detail: e.to_string() })
}

/// Coerces a parameter's text form to `i64`, JS-`Number()`-style: `0x`/`0X`
/// hex, `0o`/`0O` octal, `0b`/`0B` binary, else plain decimal.
fn coerce_text_to_i64(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        return i64::from_str_radix(oct, 8).ok();
    }
    if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        return i64::from_str_radix(bin, 2).ok();
    }
    s.parse::<i64>().ok()
}

fn format_int2(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Int2(n) => Ok(Some(n.to_string())),
        Value::Int4(n) => i16::try_from(*n)
            .map(|n| Some(n.to_string()))
            .map_err(|_| TypeError::OutOfRange { type_name: "int2", detail: n.to_string() }),
        Value::Int8(n) => i16::try_from(*n)
            .map(|n| Some(n.to_string()))
            .map_err(|_| TypeError::OutOfRange { type_name: "int2", detail: n.to_string() }),
        Value::Text(s) => {
            let n = coerce_text_to_i64(s).ok_or_else(|| TypeError::InvalidText { type_name: "int2", detail: s.clone() })?;
            i16::try_from(n)
                .map(|n| Some(n.to_string()))
                .map_err(|_| TypeError::OutOfRange { type_name: "int2", detail: n.to_string() })
        }
        other => Err(type_mismatch("int2", other)),
    }
}

fn parse_int4(s: &str) -> Result<Value, TypeError> {
    s.parse::<i32>()
        .map(Value::Int4)
        .map_err(|e| TypeError::InvalidText { type_name: "int4", detail: e.to_string() })
}

fn format_int4(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Int2(n) => Ok(Some(n.to_string())),
        Value::Int4(n) => Ok(Some(n.to_string())),
        Value::Int8(n) => i32::try_from(*n)
            .map(|n| Some(n.to_string()))
            .map_err(|_| TypeError::OutOfRange { type_name: "int4", detail: n.to_string() }),
        Value::Text(s) => {
            let n = coerce_text_to_i64(s).ok_or_else(|| TypeError::InvalidText { type_name: "int4", detail: s.clone() })?;
            i32::try_from(n)
                .map(|n| Some(n.to_string()))
                .map_err(|_| TypeError::OutOfRange { type_name: "int4", detail: n.to_string() })
        }
        other => Err(type_mismatch("int4", other)),
    }
}

fn parse_int8(s: &str) -> Result<Value, TypeError> {
    s.parse::<i64>()
        .map(Value::Int8)
        .map_err(|e| TypeError::InvalidText { type_name: "int8", detail: e.to_string() })
}

fn format_int8(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Int2(n) => Ok(Some(n.to_string())),
        Value::Int4(n) => Ok(Some(n.to_string())),
        Value::Int8(n) => Ok(Some(n.to_string())),
        Value::Text(s) => {
            let n = coerce_text_to_i64(s).ok_or_else(|| TypeError::InvalidText { type_name: "int8", detail: s.clone() })?;
            Ok(Some(n.to_string()))
        }
        other => Err(type_mismatch("int8", other)),
    }
}

fn parse_float4(s: &str) -> Result<Value, TypeError> {
    s.parse::<f32>()
        .map(Value::Float4)
        .map_err(|e| TypeError::InvalidText { type_name: "float4", detail: e.to_string() })
}

fn format_float4(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Float4(n) => Ok(Some(n.to_string())),
        Value::Float8(n) => Ok(Some((*n as f32).to_string())),
        other => Err(type_mismatch("float4", other)),
    }
}

fn parse_float8(s: &str) -> Result<Value, TypeError> {
    s.parse::<f64>()
        .map(Value::Float8)
        .map_err(|e| TypeError::InvalidText { type_name: "float8", detail: e.to_string() })
}

fn format_float8(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Float4(n) => Ok(Some((*n as f64).to_string())),
        Value::Float8(n) => Ok(Some(n.to_string())),
        other => Err(type_mismatch("float8", other)),
    }
}

fn parse_text(s: &str) -> Result<Value, TypeError> {
    Ok(Value::Text(s.to_string()))
}

fn format_text(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s.clone())),
        other => Ok(Some(other.to_string())),
    }
}

fn parse_bytea(s: &str) -> Result<Value, TypeError> {
    let hex = s
        .strip_prefix("\\x")
        .ok_or_else(|| TypeError::InvalidText { type_name: "bytea", detail: "missing \\x prefix".into() })?;
    hex_decode(hex)
        .map(Value::Bytea)
        .map_err(|detail| TypeError::InvalidText { type_name: "bytea", detail })
}

fn format_bytea(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Bytea(b) => Ok(Some(format!("\\x{}", hex_encode(b)))),
        other => Err(type_mismatch("bytea", other)),
    }
}

fn parse_json(s: &str) -> Result<Value, TypeError> {
    Ok(Value::Json(s.to_string()))
}

fn format_json(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Json(s) => Ok(Some(s.clone())),
        Value::Text(s) => Ok(Some(s.clone())),
        other => Err(type_mismatch("json", other)),
    }
}

fn parse_timestamptz(s: &str) -> Result<Value, TypeError> {
    // PostgreSQL's default ISO output, e.g. "2026-07-28 10:30:00.123456+00"
    let normalized = s.replacen(' ', "T", 1);
    DateTime::parse_from_rfc3339(&normalized)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .map(|dt| Value::Timestamptz(dt.with_timezone(&Utc)))
        .map_err(|e| TypeError::InvalidText { type_name: "timestamptz", detail: e.to_string() })
}

fn format_timestamptz(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Timestamptz(dt) => Ok(Some(dt.to_rfc3339())),
        other => Err(type_mismatch("timestamptz", other)),
    }
}

fn parse_numeric(s: &str) -> Result<Value, TypeError> {
    s.parse::<Decimal>()
        .map(Value::Numeric)
        .map_err(|e| TypeError::InvalidText { type_name: "numeric", detail: e.to_string() })
}

fn format_numeric(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Numeric(d) => Ok(Some(d.to_string())),
        other => Err(type_mismatch("numeric", other)),
    }
}

fn parse_uuid(s: &str) -> Result<Value, TypeError> {
    Uuid::parse_str(s)
        .map(Value::Uuid)
        .map_err(|e| TypeError::InvalidText { type_name: "uuid", detail: e.to_string() })
}

fn format_uuid(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::Uuid(u) => Ok(Some(u.to_string())),
        other => Err(type_mismatch("uuid", other)),
    }
}

fn parse_text_array(s: &str) -> Result<Value, TypeError> {
    Ok(Value::TextArray(decode_text_array(s)))
}

fn format_text_array(v: &Value) -> Result<Option<String>, TypeError> {
    match v {
        Value::Null => Ok(None),
        Value::TextArray(items) => Ok(Some(encode_text_array(items))),
        other => Err(type_mismatch("text[]", other)),
    }
}

fn type_mismatch(expected: &'static str, got: &Value) -> TypeError {
    TypeError::InvalidText { type_name: expected, detail: format!("cannot format {got:?} as {expected}") }
}

static BUILTIN_CODECS: &[Codec] = &[
    Codec { oid: oid::BOOL, name: "bool", parse: parse_bool, format: format_bool },
    Codec { oid: oid::INT2, name: "int2", parse: parse_int2, format: format_int2 },
    Codec { oid: oid::INT4, name: "int4", parse: parse_int4, format: format_int4 },
    Codec { oid: oid::INT8, name: "int8", parse: parse_int8, format: format_int8 },
    Codec { oid: oid::FLOAT4, name: "float4", parse: parse_float4, format: format_float4 },
    Codec { oid: oid::FLOAT8, name: "float8", parse: parse_float8, format: format_float8 },
    Codec { oid: oid::TEXT, name: "text", parse: parse_text, format: format_text },
    Codec { oid: oid::VARCHAR, name: "varchar", parse: parse_text, format: format_text },
    Codec { oid: oid::BYTEA, name: "bytea", parse: parse_bytea, format: format_bytea },
    Codec { oid: oid::JSON, name: "json", parse: parse_json, format: format_json },
    Codec { oid: oid::JSONB, name: "jsonb", parse: parse_json, format: format_json },
    Codec { oid: oid::TIMESTAMPTZ, name: "timestamptz", parse: parse_timestamptz, format: format_timestamptz },
    Codec { oid: oid::NUMERIC, name: "numeric", parse: parse_numeric, format: format_numeric },
    Codec { oid: oid::UUID, name: "uuid", parse: parse_uuid, format: format_uuid },
];

/// Identity text codec used for OID 0 and any OID the registry hasn't seen.
static TEXT_FALLBACK: Codec = Codec { oid: oid::UNKNOWN, name: "unknown", parse: parse_text, format: format_text };

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

/// Decode a PostgreSQL text-format array literal `{a,b,c}` into its elements.
pub fn decode_text_array(s: &str) -> Vec<String> {
    let inner = s.trim_start_matches('{').trim_end_matches('}');
    if inner.is_empty() {
        return Vec::new();
    }
    let mut result = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escape_next = false;
    for c in inner.chars() {
        if escape_next {
            current.push(c);
            escape_next = false;
            continue;
        }
        match c {
            '\\' => escape_next = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                result.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !result.is_empty() {
        result.push(current);
    }
    result
}

/// Encode elements into a PostgreSQL text-format array literal `{a,b,c}`.
pub fn encode_text_array(items: &[String]) -> String {
    let escaped: Vec<String> = items
        .iter()
        .map(|s| {
            if s.is_empty() || s.contains([',', '"', '\\', '{', '}', ' ']) {
                format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                s.clone()
            }
        })
        .collect();
    format!("{{{}}}", escaped.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_round_trips() {
        let reg = CodecRegistry::with_builtins();
        let parsed = reg.parse(oid::BOOL, "t").unwrap();
        assert_eq!(parsed, Value::Bool(true));
        assert_eq!(reg.format(oid::BOOL, &parsed).unwrap(), Some("t".to_string()));
    }

    #[test]
    fn int2_rejects_out_of_range() {
        let reg = CodecRegistry::with_builtins();
        let err = reg.format(oid::INT2, &Value::Int4(100_000));
        assert!(err.is_err());
    }

    #[test]
    fn unknown_oid_falls_back_to_text() {
        let reg = CodecRegistry::with_builtins();
        let parsed = reg.parse(999_999, "hello").unwrap();
        assert_eq!(parsed, Value::Text("hello".to_string()));
    }

    #[test]
    fn text_array_round_trips_with_embedded_comma() {
        let items = vec!["hello, world".to_string(), "foo".to_string()];
        let encoded = encode_text_array(&items);
        assert_eq!(decode_text_array(&encoded), items);
    }

    #[test]
    fn bytea_round_trips() {
        let reg = CodecRegistry::with_builtins();
        let original = Value::Bytea(vec![1, 2, 3, 4, 5]);
        let text = reg.format(oid::BYTEA, &original).unwrap().unwrap();
        assert_eq!(reg.parse(oid::BYTEA, &text).unwrap(), original);
    }
}
