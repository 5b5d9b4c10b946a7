//! Error taxonomy: wire errors (connection, protocol, resource misuse),
//! Postgres errors (a parsed `ErrorResponse`), and type errors (a codec
//! refusal). Postgres errors derive from wire errors; type errors are kept
//! distinct.

use std::collections::HashMap;
use std::fmt;

use pglue_sql::TypeError;

pub type PgResult<T> = Result<T, PgError>;

/// The parsed fields of an `ErrorResponse`/`NoticeResponse`, keyed by the
/// wire's single-letter field tags (S,V,C,M,D,H,P,W,s,t,c,d,n,F,L,R).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub severity_nonlocalized: Option<String>,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<i32>,
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Build from the raw letter-tagged fields the wire decoded, applying
    /// the protocol's defaults (`XX000`/`ERROR`) when the server omits them.
    pub fn from_raw(raw: HashMap<u8, String>) -> Self {
        let mut fields = ErrorFields { severity: "ERROR".to_string(), code: "XX000".to_string(), ..Default::default() };
        for (tag, value) in raw {
            match tag {
                b'S' => fields.severity = value,
                b'V' => fields.severity_nonlocalized = Some(value),
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = Some(value),
                b'p' => fields.internal_position = Some(value),
                b'q' => fields.internal_query = Some(value),
                b'W' => fields.where_ = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.data_type = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = value.parse().ok(),
                b'R' => fields.routine = Some(value),
                _ => {}
            }
        }
        fields
    }
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorFields {}

/// Top-level error type returned by every fallible `pglue` operation.
#[derive(Debug, thiserror::Error)]
pub enum PgError {
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error(transparent)]
    Postgres(Box<ErrorFields>),
    #[error(transparent)]
    Type(#[from] TypeError),
    /// Resource misuse, e.g. "transaction not open", "channel
    /// not listening", re-entering a cooperative lock, etc.
    #[error("misuse: {0}")]
    Misuse(String),
}

impl From<ErrorFields> for PgError {
    fn from(fields: ErrorFields) -> Self {
        PgError::Postgres(Box::new(fields))
    }
}

impl PgError {
    /// The `ErrorFields` behind this error, if it originated from a server
    /// `ErrorResponse`.
    pub fn postgres_fields(&self) -> Option<&ErrorFields> {
        match self {
            PgError::Postgres(fields) => Some(fields),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_severity_and_code_default_per_protocol() {
        let fields = ErrorFields::from_raw(HashMap::from([(b'M', "oops".to_string())]));
        assert_eq!(fields.severity, "ERROR");
        assert_eq!(fields.code, "XX000");
        assert_eq!(fields.message, "oops");
    }

    #[test]
    fn postgres_error_carries_its_fields() {
        let fields = ErrorFields { message: "division by zero".into(), code: "22012".into(), ..Default::default() };
        let err: PgError = fields.clone().into();
        assert_eq!(err.postgres_fields(), Some(&fields));
    }
}
