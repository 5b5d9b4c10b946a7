//! Integration tests for pglue.
//!
//! Requires PostgreSQL running on localhost:5432 with SCRAM-SHA-256 auth.
//! Run: `podman run -d --name pglue-test-pg -e POSTGRES_USER=pglue -e POSTGRES_PASSWORD=pglue -e POSTGRES_DB=pglue_test -p 5432:5432 postgres:17`
//! Then: `cargo test --test integration -- --ignored --nocapture`

use pglue::{ConnectConfig, PgResult, Wire};
use pglue_sql::Value;

fn config() -> ConnectConfig {
    ConnectConfig::new("127.0.0.1", 5432, "pglue", "pglue_test").password("pglue")
}

async fn connected_wire() -> PgResult<Wire> {
    let wire = Wire::new(config());
    wire.connect().await?;
    Ok(wire)
}

#[tokio::test]
#[ignore]
async fn int2_range_and_type_errors() -> PgResult<()> {
    let wire = connected_wire().await?;

    let row = wire
        .query("SELECT $1::int2, $2::int4, $3::int8", vec![Value::Text("0x100".into()), Value::Int4(777), Value::Text("1234".into())])
        .first()
        .await?;
    assert_eq!(row.value(0).unwrap(), Value::Int2(256));
    assert_eq!(row.value(1).unwrap(), Value::Int4(777));
    assert_eq!(row.value(2).unwrap(), Value::Int8(1234));

    let out_of_range = wire.query("SELECT $1::int2", vec![Value::Int4(100_000)]).first().await;
    assert!(out_of_range.is_err());

    let pg_error = wire.query("SELECT $1::text::int2", vec![Value::Text("100000".into())]).first().await;
    assert!(pg_error.is_err());

    Ok(())
}

#[tokio::test]
#[ignore]
async fn boolean_round_trip() -> PgResult<()> {
    let wire = connected_wire().await?;
    let row = wire
        .query("SELECT $1::bool, $2::bool, $3::bool", vec![Value::Bool(true), Value::Text("n".into()), Value::Null])
        .first()
        .await?;
    assert_eq!(row.value(0).unwrap(), Value::Bool(true));
    assert_eq!(row.value(1).unwrap(), Value::Bool(false));
    assert_eq!(row.value(2).unwrap(), Value::Null);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn bytea_round_trip() -> PgResult<()> {
    let wire = connected_wire().await?;
    let row = wire
        .query(
            "SELECT $1::bytea, $2::bytea",
            vec![Value::Text("hello, world".into()), Value::Bytea(vec![1, 2, 3, 4, 5])],
        )
        .first()
        .await?;
    assert_eq!(row.value(0).unwrap(), Value::Bytea(b"hello, world".to_vec()));
    assert_eq!(row.value(1).unwrap(), Value::Bytea(vec![1, 2, 3, 4, 5]));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn copy_round_trip() -> PgResult<()> {
    let wire = connected_wire().await?;
    wire.query("DROP TABLE IF EXISTS my_table", vec![]).execute().await?;
    wire.query("CREATE TABLE my_table(a text not null, b text not null, c text not null)", vec![]).execute().await?;

    let tag = wire.query("COPY my_table FROM STDIN", vec![]).stdin(b"field a\tfield b\tfield c\n".to_vec()).simple(true).execute().await?;
    assert_eq!(tag, "COPY 1");

    let rows = wire.query("SELECT * FROM my_table", vec![]).collect().await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].column_names(), &["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(rows[0].value(0).unwrap(), Value::Text("field a".into()));
    assert_eq!(rows[0].value(1).unwrap(), Value::Text("field b".into()));
    assert_eq!(rows[0].value(2).unwrap(), Value::Text("field c".into()));

    let mut sink = pglue::CopySink::Buffer(Vec::new());
    wire.query("COPY my_table TO STDOUT", vec![]).simple(true).run_with_stdout(&mut sink).await?;
    let dumped = match sink {
        pglue::CopySink::Buffer(buf) => buf,
        _ => unreachable!(),
    };
    assert_eq!(dumped, b"field a\tfield b\tfield c\n");

    wire.query("DROP TABLE my_table", vec![]).execute().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn copy_in_over_extended_protocol_does_not_abort() -> PgResult<()> {
    let wire = connected_wire().await?;
    wire.query("DROP TABLE IF EXISTS extended_copy", vec![]).execute().await?;
    wire.query("CREATE TABLE extended_copy(a text not null)", vec![]).execute().await?;

    // No `.simple(true)`: this goes through Bind/Execute/Close, exercising the
    // copy data landing between Execute and Close rather than after Sync.
    let tag = wire.query("COPY extended_copy FROM STDIN", vec![]).stdin(b"row one\nrow two\n".to_vec()).execute().await?;
    assert_eq!(tag, "COPY 2");

    let rows = wire.query("SELECT a FROM extended_copy ORDER BY a", vec![]).collect().await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].value(0).unwrap(), Value::Text("row one".into()));
    assert_eq!(rows[1].value(0).unwrap(), Value::Text("row two".into()));

    wire.query("DROP TABLE extended_copy", vec![]).execute().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn injection_attempt_stays_a_bound_parameter() -> PgResult<()> {
    let wire = connected_wire().await?;
    wire.query("DROP TABLE IF EXISTS users", vec![]).execute().await?;
    wire.query("CREATE TABLE users(name text not null)", vec![]).execute().await?;

    let input = "injection'); drop table users; --";
    let tag = wire.query("INSERT INTO users(name) VALUES ($1)", vec![Value::Text(input.into())]).execute().await?;
    assert_eq!(tag, "INSERT 0 1");

    let row = wire.query("SELECT name FROM users", vec![]).first().await?;
    assert_eq!(row.value(0).unwrap(), Value::Text(input.into()));

    let count = wire.query("SELECT count(*) FROM users", vec![]).first().await?;
    assert_eq!(count.value(0).unwrap(), Value::Int8(1));

    wire.query("DROP TABLE users", vec![]).execute().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn nested_transactions_inner_rollback_keeps_outer_usable() -> PgResult<()> {
    let wire = connected_wire().await?;

    let outer = wire.begin().await?;
    let inner = wire.begin().await?;
    wire.query("CREATE TABLE t(x int)", vec![]).execute().await?;
    inner.rollback().await?;

    let err = wire.query("SELECT * FROM t", vec![]).collect().await;
    assert!(err.is_err());

    outer.rollback().await?;

    let missing = wire.query("SELECT * FROM t", vec![]).collect().await;
    assert!(missing.is_err());

    Ok(())
}

#[tokio::test]
#[ignore]
async fn four_deep_nesting_commit_innermost_then_rollback_next() -> PgResult<()> {
    let wire = connected_wire().await?;
    wire.query("DROP TABLE IF EXISTS t4", vec![]).execute().await?;

    let tx1 = wire.begin().await?;
    let tx2 = wire.begin().await?;
    let tx3 = wire.begin().await?;
    let tx4 = wire.begin().await?;
    wire.query("CREATE TABLE t4(x int)", vec![]).execute().await?;
    tx4.commit().await?;

    let count = wire.query("SELECT count(*) FROM t4", vec![]).first().await?;
    assert_eq!(count.value(0).unwrap(), Value::Int8(0));

    tx3.rollback().await?;

    let missing = wire.query("SELECT * FROM t4", vec![]).collect().await;
    assert!(missing.is_err());

    tx2.rollback().await?;
    tx1.rollback().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn chunked_streaming_yields_fixed_size_chunks_in_order() -> PgResult<()> {
    let wire = connected_wire().await?;
    wire.query("DROP TABLE IF EXISTS chunked_rows", vec![]).execute().await?;
    wire.query("CREATE TABLE chunked_rows(n int)", vec![]).execute().await?;
    for n in 0..20i32 {
        wire.query("INSERT INTO chunked_rows(n) VALUES ($1)", vec![Value::Int4(n)]).execute().await?;
    }

    let (chunks, _tag) = wire.query("SELECT n FROM chunked_rows ORDER BY n", vec![]).chunked(5).run_chunks().await?;
    assert_eq!(chunks.len(), 4);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.len(), 5);
        for (j, row) in chunk.iter().enumerate() {
            assert_eq!(row.value(0).unwrap(), Value::Int4((i * 5 + j) as i32));
        }
    }

    wire.query("DROP TABLE chunked_rows", vec![]).execute().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn simple_multi_statement_returns_rows_in_emission_order() -> PgResult<()> {
    let wire = connected_wire().await?;
    let sql = "
        DROP TABLE IF EXISTS simple_rows;
        CREATE TABLE simple_rows(n int);
        INSERT INTO simple_rows VALUES (1), (2), (3);
        SELECT n FROM simple_rows ORDER BY n;
        SELECT 1 AS one;
    ";
    let result = wire.query(sql, vec![]).simple(true).run().await?;
    assert_eq!(result.rows.len(), 4);
    assert_eq!(result.rows[0].value(0).unwrap(), Value::Int4(1));
    assert_eq!(result.rows[1].value(0).unwrap(), Value::Int4(2));
    assert_eq!(result.rows[2].value(0).unwrap(), Value::Int4(3));
    assert_eq!(result.rows[3].value(0).unwrap(), Value::Int4(1));

    wire.query("DROP TABLE simple_rows", vec![]).execute().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn listen_notify_delivers_payloads_in_fifo_order() -> PgResult<()> {
    let wire = connected_wire().await?;
    let mut receiver = wire.listen("pglue_test_channel").await?;

    for i in 0..5 {
        wire.notify("pglue_test_channel", &i.to_string()).await?;
    }

    for expected in 0..5 {
        let notification = receiver.recv().await.expect("channel closed early");
        assert_eq!(notification.payload, expected.to_string());
    }

    wire.unlisten("pglue_test_channel").await?;
    Ok(())
}
