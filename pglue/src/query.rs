//! The `Query` object: a reusable description of one SQL operation plus its
//! execution mode (simple or extended, chunked or not). Cloning a `Query`
//! is cheap and yields an independent, re-runnable handle over the same
//! text and parameters.

use std::sync::Arc;

use pglue_sql::Value;

use crate::copy::{CopyInSource, CopySink};
use crate::error::{PgError, PgResult};
use crate::row::Row;
use crate::wire::Wire;

/// Every row a run produced, plus one command tag per result set — more
/// than one only under `.simple(true)` with multiple statements.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub tags: Vec<String>,
}

impl QueryResult {
    pub fn tag(&self) -> &str {
        self.tags.last().map(|s| s.as_str()).unwrap_or("")
    }
}

#[derive(Clone)]
pub struct Query {
    wire: Wire,
    text: Arc<str>,
    params: Vec<Value>,
    simple: bool,
    chunk_size: usize,
    stdin_bytes: Option<Vec<u8>>,
}

impl Query {
    pub(crate) fn new(wire: Wire, text: String, params: Vec<Value>) -> Self {
        Self { wire, text: Arc::from(text), params, simple: false, chunk_size: 0, stdin_bytes: None }
    }

    /// Run via the simple-query protocol (`Query` message, no `Bind`). Only
    /// valid with no parameters; multi-statement text yields one result set
    /// (and tag) per statement.
    pub fn simple(mut self, simple: bool) -> Self {
        self.simple = simple;
        self
    }

    /// Request that the extended-query path read `n` rows per `Execute`
    /// instead of closing the portal after a single unbounded fetch.
    pub fn chunked(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }

    /// Feed `data` as `COPY IN` input if the query text is a `COPY ... FROM
    /// STDIN`.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_bytes = Some(data.into());
        self
    }

    fn copy_in_source(&self) -> CopyInSource {
        match &self.stdin_bytes {
            Some(bytes) => CopyInSource::Bytes(bytes.clone()),
            None => CopyInSource::None,
        }
    }

    /// Run once, discarding any `COPY OUT`/`COPY BOTH` bytes.
    pub async fn run(&self) -> PgResult<QueryResult> {
        let mut sink = CopySink::None;
        self.run_with_sink(&mut sink).await
    }

    /// Run once, streaming `COPY OUT`/`COPY BOTH` bytes into `sink`.
    pub async fn run_with_stdout(&self, sink: &mut CopySink) -> PgResult<QueryResult> {
        self.run_with_sink(sink).await
    }

    async fn run_with_sink(&self, stdout: &mut CopySink) -> PgResult<QueryResult> {
        let stdin = self.copy_in_source();

        if self.simple {
            if !self.params.is_empty() {
                return Err(PgError::Misuse("simple queries do not accept bound parameters".into()));
            }
            let results = self.wire.simple_query(&self.text, stdin, stdout).await?;
            let mut rows = Vec::new();
            let mut tags = Vec::with_capacity(results.len());
            for (chunk, tag) in results {
                rows.extend(chunk);
                tags.push(tag);
            }
            return Ok(QueryResult { rows, tags });
        }

        let stmt = self.wire.prepare(&self.text).await?;
        let (chunks, tag) = self.wire.run_extended(&stmt, &self.params, self.chunk_size, stdin, stdout).await?;
        let rows = chunks.into_iter().flatten().collect();
        Ok(QueryResult { rows, tags: vec![tag] })
    }

    /// Run an extended query and return its chunks exactly as the server
    /// produced them, without flattening — what `.chunked(n)` callers
    /// iterate over.
    pub async fn run_chunks(&self) -> PgResult<(Vec<Vec<Row>>, String)> {
        if self.simple {
            return Err(PgError::Misuse("chunked reads are only meaningful for extended queries".into()));
        }
        let stdin = self.copy_in_source();
        let mut stdout = CopySink::None;
        let stmt = self.wire.prepare(&self.text).await?;
        self.wire.run_extended(&stmt, &self.params, self.chunk_size.max(1), stdin, &mut stdout).await
    }

    pub async fn execute(&self) -> PgResult<String> {
        Ok(self.run().await?.tag().to_string())
    }

    pub async fn collect(&self) -> PgResult<Vec<Row>> {
        Ok(self.run().await?.rows)
    }

    /// Like [`Query::collect`], but truncates to the first `count` rows.
    pub async fn collect_up_to(&self, count: usize) -> PgResult<Vec<Row>> {
        let mut rows = self.run().await?.rows;
        rows.truncate(count);
        Ok(rows)
    }

    pub async fn count(&self) -> PgResult<usize> {
        Ok(self.run().await?.rows.len())
    }

    pub async fn first(&self) -> PgResult<Row> {
        self.first_opt().await?.ok_or_else(|| PgError::Misuse("expected one row, got none".into()))
    }

    pub async fn first_opt(&self) -> PgResult<Option<Row>> {
        Ok(self.run().await?.rows.into_iter().next())
    }

    pub async fn first_or(&self, default: Row) -> PgResult<Row> {
        Ok(self.first_opt().await?.unwrap_or(default))
    }

    /// Decode every row with `f`, eagerly. `f` typically calls
    /// [`Row::value`]/[`Row::value_by_name`] and maps the result into a
    /// caller-defined type.
    pub async fn map<T>(&self, f: impl Fn(&Row) -> Result<T, pglue_sql::TypeError>) -> PgResult<Vec<T>> {
        self.run().await?.rows.iter().map(|r| f(r).map_err(PgError::from)).collect()
    }

    pub async fn filter(&self, pred: impl Fn(&Row) -> bool) -> PgResult<Vec<Row>> {
        Ok(self.run().await?.rows.into_iter().filter(pred).collect())
    }

    /// Decode every row against `schema`, eagerly, failing the whole call on
    /// the first row that doesn't fit. `schema` is typically a
    /// `Row::value`/`Row::value_by_name` chain building a caller-defined
    /// struct, the same shape as [`Query::map`] but named for the common
    /// case of validating a row against a fixed column layout.
    pub async fn parse<T>(&self, schema: impl Fn(&Row) -> Result<T, pglue_sql::TypeError>) -> PgResult<Vec<T>> {
        self.map(schema).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_result_tag_defaults_to_empty_string() {
        let result = QueryResult::default();
        assert_eq!(result.tag(), "");
    }

    #[test]
    fn query_result_tag_is_the_last_result_sets_tag() {
        let result = QueryResult { rows: Vec::new(), tags: vec!["CREATE TABLE".into(), "SELECT 3".into()] };
        assert_eq!(result.tag(), "SELECT 3");
    }
}
