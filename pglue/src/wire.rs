//! The wire engine: one TCP/UDS link multiplexing a synchronous stream of
//! asynchronous server messages, an ordered sequence of command/response
//! pipelines, and backpressure-aware `COPY` byte streams. A reader task and
//! a writer task own the socket halves; every call site that wants a
//! write/read pair goes through [`Wire::write_pipeline`] and
//! [`Wire::read_pipeline`], which serialize pipelined calls through
//! [`PipelineLock`] and resynchronize at `ReadyForQuery` no matter how the
//! call fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

use pglue_sql::codec::oid;
use pglue_sql::{CodecRegistry, Fragment, Value};

use crate::auth::{self, ScramClient};
use crate::channel::{ChannelRegistry, Notification, SharedChannelRegistry};
use crate::config::ConnectConfig;
use crate::copy::{write_copy_in, CopyInSource, CopySink};
use crate::error::{ErrorFields, PgError, PgResult};
use crate::locks::PipelineLock;
use crate::message::{AuthRequest, BackendMessage, FieldDescription, FrontendMessage, Header, TransactionStatus};
use crate::query::Query;
use crate::row::{Row, RowLayout};
use crate::stream::PgStream;
use crate::transaction::{Transaction, TxEntry, TxStack};

/// Events a [`Wire`] publishes for observability: connection lifecycle, the
/// three asynchronous message types, and the final close reason.
#[derive(Debug, Clone)]
pub enum WireEvent {
    Connect,
    Close(String),
    Notice(ErrorFields),
    Notify(Notification),
    Parameter { name: String, value: String, prev: Option<String> },
}

/// A cached prepared statement: the server-side name, the OIDs the server
/// inferred for its parameters, and the row shape (empty `fields` means
/// `NoData` — a non-SELECT statement). `portal_counter` backs the
/// per-statement monotonic portal-name suffix.
pub(crate) struct Statement {
    pub name: String,
    pub param_types: Vec<u32>,
    pub fields: Vec<FieldDescription>,
    portal_counter: AtomicU64,
}

impl Statement {
    fn next_portal(&self) -> u64 {
        self.portal_counter.fetch_add(1, Ordering::SeqCst)
    }
}

struct ConnHandles {
    outbound: mpsc::UnboundedSender<BytesMut>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<BackendMessage>>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

struct WireState {
    conn: Option<Arc<ConnHandles>>,
    tx_status: TransactionStatus,
    tx_stack: TxStack,
    stmt_cache: HashMap<String, Arc<Statement>>,
    stmt_counter: u64,
    server_params: HashMap<String, String>,
    /// Set once a connect attempt has ever succeeded, so a first-connect
    /// failure never triggers the reconnect loop.
    was_connected: bool,
    /// Set by [`Wire::close`] so an ensuing socket teardown doesn't
    /// schedule a reconnect.
    closed_explicitly: bool,
}

struct WireInner {
    config: ConnectConfig,
    codecs: Arc<CodecRegistry>,
    events: broadcast::Sender<WireEvent>,
    channels: SharedChannelRegistry,
    rlock: PipelineLock,
    wlock: PipelineLock,
    state: AsyncMutex<WireState>,
}

/// A single PostgreSQL connection speaking the v3 wire protocol. Cheap to
/// clone — every clone shares the same socket, locks, and caches.
#[derive(Clone)]
pub struct Wire {
    inner: Arc<WireInner>,
}

impl Wire {
    pub fn new(config: ConnectConfig) -> Self {
        Self::with_codecs(config, Arc::new(CodecRegistry::with_builtins()))
    }

    pub fn with_codecs(config: ConnectConfig, codecs: Arc<CodecRegistry>) -> Self {
        let (events, _) = broadcast::channel(256);
        Wire {
            inner: Arc::new(WireInner {
                config,
                codecs,
                events,
                channels: Arc::new(AsyncMutex::new(ChannelRegistry::new())),
                rlock: PipelineLock::new(),
                wlock: PipelineLock::new(),
                state: AsyncMutex::new(WireState {
                    conn: None,
                    tx_status: TransactionStatus::Idle,
                    tx_stack: TxStack::new(),
                    stmt_cache: HashMap::new(),
                    stmt_counter: 0,
                    server_params: HashMap::new(),
                    was_connected: false,
                    closed_explicitly: false,
                }),
            }),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WireEvent> {
        self.inner.events.subscribe()
    }

    pub async fn params(&self) -> HashMap<String, String> {
        self.inner.state.lock().await.server_params.clone()
    }

    pub async fn transaction_status(&self) -> TransactionStatus {
        self.inner.state.lock().await.tx_status
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.conn.is_some()
    }

    /// Build a re-runnable [`Query`] from already-formatted SQL text and
    /// parameters. Callers normally get `(text, params)` from a
    /// [`Fragment`] via [`Wire::query_fragment`].
    pub fn query(&self, text: impl Into<String>, params: Vec<Value>) -> Query {
        Query::new(self.clone(), text.into(), params)
    }

    pub fn query_fragment(&self, fragment: &Fragment) -> Query {
        let (text, params) = fragment.format();
        self.query(text, params)
    }

    /// Connect if not already connected; idempotent.
    pub async fn ensure_connected(&self) -> PgResult<()> {
        if self.is_connected().await {
            return Ok(());
        }
        self.connect().await
    }

    /// Open the socket, authenticate, and spawn the reader/writer tasks.
    /// A no-op if already connected.
    pub async fn connect(&self) -> PgResult<()> {
        // rlock/wlock are held only for the connect-and-authenticate phase;
        // they must be released before any call that itself takes them
        // (e.g. the LISTEN replay below, via `simple_query`), since
        // `PipelineLock` is not reentrant.
        {
            let _wg = self.inner.wlock.acquire().await;
            let _rg = self.inner.rlock.acquire().await;
            if self.inner.state.lock().await.conn.is_some() {
                return Ok(());
            }

            let stream = PgStream::connect(&self.inner.config).await?;
            let (mut read_half, mut write_half) = split(stream);

            write_half
                .write_all(&FrontendMessage::Startup { params: self.inner.config.startup_params() }.encode())
                .await?;
            let server_params = run_auth(&self.inner.config, &mut read_half, &mut write_half).await?;

            let (out_tx, out_rx) = mpsc::unbounded_channel::<BytesMut>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<BackendMessage>();

            let reader_inner = self.inner.clone();
            let reader_task = tokio::spawn(reader_loop(read_half, in_tx, reader_inner));
            let writer_inner = self.inner.clone();
            let writer_task = tokio::spawn(writer_loop(write_half, out_rx, writer_inner));

            let conn = Arc::new(ConnHandles {
                outbound: out_tx,
                inbound: AsyncMutex::new(in_rx),
                reader_task,
                writer_task,
            });

            let mut st = self.inner.state.lock().await;
            st.conn = Some(conn);
            st.server_params = server_params;
            st.was_connected = true;
            st.closed_explicitly = false;
        }

        let _ = self.inner.events.send(WireEvent::Connect);
        log::info!("pglue: connected to {}:{}", self.inner.config.host, self.inner.config.port);

        let names = self.inner.channels.lock().await.registered_names();
        for name in names {
            if let Err(e) = self.send_listen_sql(&name).await {
                log::warn!("pglue: failed to replay LISTEN \"{name}\" after reconnect: {e}");
            }
        }
        Ok(())
    }

    /// Terminate the connection and suppress automatic reconnect.
    pub async fn close(&self) {
        let mut st = self.inner.state.lock().await;
        st.closed_explicitly = true;
        if let Some(conn) = st.conn.take() {
            conn.reader_task.abort();
            conn.writer_task.abort();
        }
        st.server_params.clear();
        st.tx_status = TransactionStatus::Idle;
        st.tx_stack = TxStack::new();
        st.stmt_cache.clear();
        drop(st);
        let _ = self.inner.events.send(WireEvent::Close("closed by caller".to_string()));
    }

    async fn conn_handles(&self) -> PgResult<Arc<ConnHandles>> {
        self.inner.state.lock().await.conn.clone().ok_or(PgError::Closed)
    }

    /// Enqueue `messages` then `Sync`, holding `wlock` for the whole
    /// enqueue so no other pipeline's bytes can interleave between them.
    async fn write_pipeline(&self, conn: &ConnHandles, messages: Vec<BytesMut>) -> PgResult<()> {
        self.write_pipeline_with_copy_in(conn, messages, &mut CopyInSource::None, Vec::new()).await
    }

    /// Like [`Wire::write_pipeline`], but enqueues `stdin`'s `CopyData`/
    /// `CopyDone` frames between `pre` and `post` instead of after the whole
    /// pipeline: once the server processes an `Execute` of `COPY ... FROM
    /// STDIN` it's in copy-in mode and a `Close` arriving before the copy
    /// data ends the copy with a protocol error. `post` (typically a
    /// `Close`) and `Sync` always come after the copy data.
    async fn write_pipeline_with_copy_in(&self, conn: &ConnHandles, pre: Vec<BytesMut>, stdin: &mut CopyInSource, post: Vec<BytesMut>) -> PgResult<()> {
        let _guard = self.inner.wlock.acquire().await;
        for m in pre {
            conn.outbound.send(m).map_err(|_| PgError::Closed)?;
        }
        write_copy_in(&conn.outbound, stdin).await?;
        for m in post {
            conn.outbound.send(m).map_err(|_| PgError::Closed)?;
        }
        conn.outbound.send(FrontendMessage::Sync.encode()).map_err(|_| PgError::Closed)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Prepared statements
    // ------------------------------------------------------------------

    pub(crate) async fn prepare(&self, text: &str) -> PgResult<Arc<Statement>> {
        self.ensure_connected().await?;
        if let Some(s) = self.inner.state.lock().await.stmt_cache.get(text).cloned() {
            return Ok(s);
        }

        let conn = self.conn_handles().await?;
        let name = {
            let mut st = self.inner.state.lock().await;
            st.stmt_counter += 1;
            format!("__st{}", st.stmt_counter)
        };

        let parse = FrontendMessage::Parse { statement: name.clone(), query: text.to_string(), param_types: vec![] }.encode();
        let describe = FrontendMessage::Describe { which: b'S', name: name.clone() }.encode();
        self.write_pipeline(&conn, vec![parse, describe]).await?;

        let _rguard = self.inner.rlock.acquire().await;
        let mut reader = PipelineReader { wire: self, conn: conn.clone(), done: false };
        let result: PgResult<(Vec<u32>, Vec<FieldDescription>)> = async {
            let mut param_types = Vec::new();
            loop {
                match reader.recv().await? {
                    BackendMessage::ParseComplete => {}
                    BackendMessage::ParameterDescription { param_types: p } => param_types = p,
                    BackendMessage::NoData => return Ok((param_types, Vec::new())),
                    BackendMessage::RowDescription { fields } => return Ok((param_types, fields)),
                    BackendMessage::ErrorResponse(e) => return Err(e.into()),
                    other => return Err(PgError::Protocol(format!("unexpected message while preparing: {other:?}"))),
                }
            }
        }
        .await;
        reader.drain_to_ready().await;

        let (param_types, fields) = result?;
        let stmt = Arc::new(Statement { name, param_types, fields, portal_counter: AtomicU64::new(0) });
        self.inner.state.lock().await.stmt_cache.insert(text.to_string(), stmt.clone());
        Ok(stmt)
    }

    fn format_params(&self, stmt: &Statement, values: &[Value]) -> PgResult<Vec<Option<Vec<u8>>>> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let param_oid = stmt.param_types.get(i).copied().unwrap_or(oid::UNKNOWN);
                let text = self.inner.codecs.format(param_oid, v)?;
                Ok(text.map(|s| s.into_bytes()))
            })
            .collect()
    }

    /// Extended-query execution: Bind/Execute
    /// against a cached prepared statement, chunked (`chunk_size > 0`) or
    /// fast (`chunk_size == 0`, closing the portal in the same pipeline).
    pub(crate) async fn run_extended(
        &self,
        stmt: &Arc<Statement>,
        params: &[Value],
        chunk_size: usize,
        mut stdin: CopyInSource,
        stdout: &mut CopySink,
    ) -> PgResult<(Vec<Vec<Row>>, String)> {
        self.ensure_connected().await?;
        let conn = self.conn_handles().await?;
        let portal = format!("{}_{}", stmt.name, stmt.next_portal());
        let param_values = self.format_params(stmt, params)?;
        let mut layout = Arc::new(RowLayout::new(&stmt.fields, self.inner.codecs.clone()));

        let row_limit = if chunk_size == 0 { 0 } else { chunk_size as i32 };
        let bind = FrontendMessage::Bind { portal: portal.clone(), statement: stmt.name.clone(), params: param_values }.encode();
        let execute = FrontendMessage::Execute { portal: portal.clone(), row_limit }.encode();
        let post = if chunk_size == 0 { vec![FrontendMessage::Close { which: b'P', name: portal.clone() }.encode()] } else { Vec::new() };
        // `stdin`'s COPY data must reach the server between `Execute` and
        // `Close`/`Sync`: once `Execute` puts the server in copy-in mode, a
        // `Close` arriving before `CopyDone` aborts the copy.
        self.write_pipeline_with_copy_in(&conn, vec![bind, execute], &mut stdin, post).await?;

        let first_result = {
            let _rguard = self.inner.rlock.acquire().await;
            let mut reader = PipelineReader { wire: self, conn: conn.clone(), done: false };
            let result: PgResult<ReadRowsOutcome> = async {
                match reader.recv().await? {
                    BackendMessage::BindComplete => {}
                    BackendMessage::ErrorResponse(e) => return Err(e.into()),
                    other => return Err(PgError::Protocol(format!("expected BindComplete, got {other:?}"))),
                }
                read_rows(&mut reader, &mut layout, &self.inner.codecs, stdout).await
            }
            .await;
            reader.drain_to_ready().await;
            result
        };
        let mut outcome = first_result?;

        if chunk_size == 0 {
            return Ok((vec![std::mem::take(&mut outcome.rows)], outcome.tag));
        }

        let mut chunks = Vec::new();
        if !(outcome.done && outcome.rows.is_empty()) {
            chunks.push(std::mem::take(&mut outcome.rows));
        }
        while !outcome.done {
            let execute = FrontendMessage::Execute { portal: portal.clone(), row_limit }.encode();
            self.write_pipeline(&conn, vec![execute]).await?;
            let next = {
                let _rguard = self.inner.rlock.acquire().await;
                let mut reader = PipelineReader { wire: self, conn: conn.clone(), done: false };
                let result = read_rows(&mut reader, &mut layout, &self.inner.codecs, stdout).await;
                reader.drain_to_ready().await;
                result
            }?;
            outcome = next;
            if !(outcome.done && outcome.rows.is_empty()) {
                chunks.push(std::mem::take(&mut outcome.rows));
            }
        }

        let close = FrontendMessage::Close { which: b'P', name: portal.clone() }.encode();
        self.write_pipeline(&conn, vec![close]).await?;
        {
            let _rguard = self.inner.rlock.acquire().await;
            let mut reader = PipelineReader { wire: self, conn: conn.clone(), done: false };
            let _ = reader.recv().await;
            reader.drain_to_ready().await;
        }

        Ok((chunks, outcome.tag))
    }

    /// The simple-query path: one `Query` message, a read loop
    /// that yields one chunk per result set and latches any error until
    /// the server's single terminating `ReadyForQuery`.
    pub(crate) async fn simple_query(&self, sql: &str, mut stdin: CopyInSource, stdout: &mut CopySink) -> PgResult<Vec<(Vec<Row>, String)>> {
        self.ensure_connected().await?;
        let conn = self.conn_handles().await?;
        {
            let _guard = self.inner.wlock.acquire().await;
            conn.outbound.send(FrontendMessage::Query { query: sql.to_string() }.encode()).map_err(|_| PgError::Closed)?;
            // Copy data must reach the server before anything else does:
            // once it processes this `Query`'s `COPY ... FROM STDIN`, it's in
            // copy-in mode and any other pipeline's bytes landing first would
            // abort the copy.
            write_copy_in(&conn.outbound, &mut stdin).await?;
        }

        let _rguard = self.inner.rlock.acquire().await;
        let mut results = Vec::new();
        let mut current_rows: Vec<Row> = Vec::new();
        let mut layout = Arc::new(RowLayout::new(&[], self.inner.codecs.clone()));
        let mut pending_error: Option<ErrorFields> = None;

        loop {
            let msg = {
                let mut rx = conn.inbound.lock().await;
                rx.recv().await.ok_or(PgError::Closed)?
            };
            match msg {
                BackendMessage::RowDescription { fields } => {
                    layout = Arc::new(RowLayout::new(&fields, self.inner.codecs.clone()));
                    current_rows = Vec::new();
                }
                BackendMessage::DataRow { columns } => current_rows.push(Row::new(layout.clone(), columns)),
                BackendMessage::CommandComplete { tag } => results.push((std::mem::take(&mut current_rows), tag)),
                BackendMessage::EmptyQueryResponse => results.push((std::mem::take(&mut current_rows), String::new())),
                BackendMessage::CopyInResponse => {}
                BackendMessage::CopyOutResponse | BackendMessage::CopyBothResponse => loop {
                    let inner_msg = {
                        let mut rx = conn.inbound.lock().await;
                        rx.recv().await.ok_or(PgError::Closed)?
                    };
                    match inner_msg {
                        BackendMessage::CopyData { data } => stdout.write(&data).await?,
                        BackendMessage::CopyDone => break,
                        BackendMessage::CommandComplete { tag } => {
                            results.push((Vec::new(), tag));
                            break;
                        }
                        BackendMessage::ErrorResponse(e) => {
                            pending_error = Some(e);
                            break;
                        }
                        _ => {}
                    }
                },
                BackendMessage::ErrorResponse(e) => pending_error = Some(e),
                BackendMessage::ReadyForQuery { status } => {
                    self.inner.state.lock().await.tx_status = status;
                    break;
                }
                _ => {}
            }
        }

        if let Some(e) = pending_error {
            return Err(e.into());
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub async fn begin(&self) -> PgResult<Transaction> {
        self.ensure_connected().await?;
        let sql = self.inner.state.lock().await.tx_stack.begin_sql();
        self.simple_query(sql, CopyInSource::None, &mut CopySink::None).await?;
        let entry = self.inner.state.lock().await.tx_stack.push();
        Ok(Transaction::new(self.clone(), entry))
    }

    pub(crate) async fn commit_entry(&self, entry: TxEntry) -> PgResult<()> {
        let sql = {
            let mut st = self.inner.state.lock().await;
            st.tx_stack.commit_sql(entry).ok_or_else(|| PgError::Misuse("transaction not open".into()))?
        };
        self.simple_query(sql, CopyInSource::None, &mut CopySink::None).await?;
        Ok(())
    }

    pub(crate) async fn rollback_entry(&self, entry: TxEntry) -> PgResult<()> {
        let statements = {
            let mut st = self.inner.state.lock().await;
            st.tx_stack.rollback_sql(entry).ok_or_else(|| PgError::Misuse("transaction not open".into()))?
        };
        for sql in statements {
            self.simple_query(sql, CopyInSource::None, &mut CopySink::None).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // LISTEN/NOTIFY
    // ------------------------------------------------------------------

    pub async fn listen(&self, name: &str) -> PgResult<broadcast::Receiver<Notification>> {
        self.ensure_connected().await?;
        let (needs_listen, rx) = self.inner.channels.lock().await.subscribe(name);
        if needs_listen {
            if self.inner.state.lock().await.tx_status != TransactionStatus::Idle {
                log::warn!("pglue: LISTEN \"{name}\" issued inside a transaction; semantics are transaction-scoped");
            }
            self.send_listen_sql(name).await?;
        }
        Ok(rx)
    }

    async fn send_listen_sql(&self, name: &str) -> PgResult<()> {
        let sql = format!("LISTEN \"{}\"", name.replace('"', "\"\""));
        self.simple_query(&sql, CopyInSource::None, &mut CopySink::None).await?;
        Ok(())
    }

    pub async fn unlisten(&self, name: &str) -> PgResult<()> {
        self.ensure_connected().await?;
        let existed = self.inner.channels.lock().await.unsubscribe(name);
        if existed {
            let sql = format!("UNLISTEN \"{}\"", name.replace('"', "\"\""));
            self.simple_query(&sql, CopyInSource::None, &mut CopySink::None).await?;
        }
        Ok(())
    }

    pub async fn notify(&self, channel: &str, payload: &str) -> PgResult<()> {
        self.ensure_connected().await?;
        let stmt = self.prepare("SELECT pg_notify($1, $2)").await?;
        self.run_extended(&stmt, &[Value::Text(channel.to_string()), Value::Text(payload.to_string())], 0, CopyInSource::None, &mut CopySink::None)
            .await?;
        Ok(())
    }
}

/// A live read-phase of one pipeline: yields messages already past the
/// reader task's async-message filter, and tracks whether `ReadyForQuery`
/// has been seen yet. `rlock` is held by the caller for the duration.
struct PipelineReader<'a> {
    wire: &'a Wire,
    conn: Arc<ConnHandles>,
    done: bool,
}

impl PipelineReader<'_> {
    async fn recv(&mut self) -> PgResult<BackendMessage> {
        if self.done {
            return Err(PgError::Misuse("pipeline already resynchronized at ReadyForQuery".into()));
        }
        let msg = {
            let mut rx = self.conn.inbound.lock().await;
            rx.recv().await.ok_or(PgError::Closed)?
        };
        if let BackendMessage::ReadyForQuery { status } = &msg {
            self.done = true;
            self.wire.inner.state.lock().await.tx_status = *status;
        }
        Ok(msg)
    }

    /// The `finally` arm of a pipeline read: whatever the read
    /// body did, always drain to (and including) `ReadyForQuery`.
    async fn drain_to_ready(&mut self) {
        while !self.done {
            if self.recv().await.is_err() {
                self.done = true;
            }
        }
    }
}

struct ReadRowsOutcome {
    rows: Vec<Row>,
    tag: String,
    done: bool,
}

async fn read_rows(reader: &mut PipelineReader<'_>, layout: &mut Arc<RowLayout>, codecs: &Arc<CodecRegistry>, stdout: &mut CopySink) -> PgResult<ReadRowsOutcome> {
    let mut rows = Vec::new();
    loop {
        match reader.recv().await? {
            BackendMessage::DataRow { columns } => rows.push(Row::new(layout.clone(), columns)),
            BackendMessage::CommandComplete { tag } => return Ok(ReadRowsOutcome { rows, tag, done: true }),
            BackendMessage::PortalSuspended => return Ok(ReadRowsOutcome { rows, tag: String::new(), done: false }),
            BackendMessage::EmptyQueryResponse => return Ok(ReadRowsOutcome { rows, tag: String::new(), done: true }),
            BackendMessage::RowDescription { fields } => *layout = Arc::new(RowLayout::new(&fields, codecs.clone())),
            BackendMessage::NoData => {}
            BackendMessage::CopyInResponse => {}
            BackendMessage::CopyOutResponse | BackendMessage::CopyBothResponse => loop {
                match reader.recv().await? {
                    BackendMessage::CopyData { data } => stdout.write(&data).await?,
                    BackendMessage::CopyDone => break,
                    BackendMessage::CommandComplete { tag } => return Ok(ReadRowsOutcome { rows, tag, done: true }),
                    BackendMessage::ErrorResponse(e) => return Err(e.into()),
                    _ => {}
                }
            },
            BackendMessage::ErrorResponse(e) => return Err(e.into()),
            BackendMessage::CloseComplete => {}
            other => return Err(PgError::Protocol(format!("unexpected message in result stream: {other:?}"))),
        }
    }
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(read: &mut R, buf: &mut BytesMut) -> PgResult<BackendMessage> {
    loop {
        if let Some(header) = Header::peek(buf) {
            let total = Header::SIZE + header.body_len;
            if buf.len() >= total {
                let frame = buf.split_to(total);
                return BackendMessage::decode(header, &frame[Header::SIZE..]);
            }
        }
        buf.reserve(4096);
        let n = read.read_buf(buf).await?;
        if n == 0 {
            return Err(PgError::Closed);
        }
    }
}

async fn run_auth(
    config: &ConnectConfig,
    read: &mut ReadHalf<PgStream>,
    write: &mut WriteHalf<PgStream>,
) -> PgResult<HashMap<String, String>> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut scram: Option<ScramClient> = None;
    let mut params = HashMap::new();
    loop {
        let msg = read_frame(read, &mut buf).await?;
        match msg {
            BackendMessage::Authentication(AuthRequest::Ok) => {}
            BackendMessage::Authentication(AuthRequest::SASL(mechanisms)) => {
                if !mechanisms.iter().any(|m| m == auth::MECHANISM) {
                    return Err(PgError::Auth(format!("server does not support {}", auth::MECHANISM)));
                }
                let password = config.password.as_deref().ok_or_else(|| PgError::Auth("password required for SASL authentication".into()))?;
                let client = ScramClient::new(&config.user, password);
                let first = client.client_first_message();
                write
                    .write_all(&FrontendMessage::SASLInitialResponse { mechanism: auth::MECHANISM.to_string(), data: first }.encode())
                    .await?;
                scram = Some(client);
            }
            BackendMessage::Authentication(AuthRequest::SASLContinue(data)) => {
                let client = scram.as_mut().ok_or_else(|| PgError::Auth("SASLContinue received before SASLInitialResponse".into()))?;
                let final_msg = client.process_server_first(&data)?;
                write.write_all(&FrontendMessage::SASLResponse { data: final_msg }.encode()).await?;
            }
            BackendMessage::Authentication(AuthRequest::SASLFinal(data)) => {
                let client = scram.as_ref().ok_or_else(|| PgError::Auth("SASLFinal received before handshake".into()))?;
                client.verify_server_final(&data)?;
            }
            BackendMessage::Authentication(AuthRequest::Unsupported(status)) => {
                return Err(PgError::Auth(format!(
                    "unsupported authentication method (status {status}); only {} is supported",
                    auth::MECHANISM
                )));
            }
            BackendMessage::ParameterStatus { name, value } => {
                params.insert(name, value);
            }
            BackendMessage::BackendKeyData { .. } => {}
            BackendMessage::NegotiateProtocolVersion => {}
            BackendMessage::ErrorResponse(e) => return Err(e.into()),
            BackendMessage::ReadyForQuery { .. } => return Ok(params),
            other => return Err(PgError::Protocol(format!("unexpected message during startup: {other:?}"))),
        }
    }
}

async fn reader_loop(mut read: ReadHalf<PgStream>, tx: mpsc::UnboundedSender<BackendMessage>, inner: Arc<WireInner>) {
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        let msg = match read_frame(&mut read, &mut buf).await {
            Ok(m) => m,
            Err(e) => {
                on_disconnect(&inner, e.to_string()).await;
                return;
            }
        };
        match msg {
            BackendMessage::NoticeResponse(fields) => {
                log_notice(&fields);
                let _ = inner.events.send(WireEvent::Notice(fields));
            }
            BackendMessage::ParameterStatus { name, value } => {
                let prev = inner.state.lock().await.server_params.insert(name.clone(), value.clone());
                let _ = inner.events.send(WireEvent::Parameter { name, value, prev });
            }
            BackendMessage::NotificationResponse { process_id, channel, payload } => {
                let notification = Notification { channel, payload, process_id };
                inner.channels.lock().await.dispatch(notification.clone());
                let _ = inner.events.send(WireEvent::Notify(notification));
            }
            other => {
                if tx.send(other).is_err() {
                    return;
                }
            }
        }
    }
}

async fn writer_loop(mut write: WriteHalf<PgStream>, mut rx: mpsc::UnboundedReceiver<BytesMut>, inner: Arc<WireInner>) {
    loop {
        let Some(first) = rx.recv().await else { return };
        let mut buf = first;
        while let Ok(more) = rx.try_recv() {
            buf.extend_from_slice(&more);
        }
        if let Err(e) = write.write_all(&buf).await {
            on_disconnect(&inner, e.to_string()).await;
            return;
        }
    }
}

async fn on_disconnect(inner: &Arc<WireInner>, reason: String) {
    let (was_connected, explicit) = {
        let mut st = inner.state.lock().await;
        if st.conn.is_none() {
            return;
        }
        st.conn = None;
        st.server_params.clear();
        st.stmt_cache.clear();
        st.stmt_counter = 0;
        st.tx_status = TransactionStatus::Idle;
        st.tx_stack = TxStack::new();
        (st.was_connected, st.closed_explicitly)
    };
    log::warn!("pglue: connection closed: {reason}");
    let _ = inner.events.send(WireEvent::Close(reason));

    if was_connected && !explicit {
        if let Some(delay) = inner.config.reconnect_delay {
            let inner = inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let wire = Wire { inner };
                if let Err(e) = wire.connect().await {
                    log::warn!("pglue: reconnect failed: {e}");
                }
            });
        }
    }
}

fn log_notice(fields: &ErrorFields) {
    match fields.severity.as_str() {
        "ERROR" | "FATAL" | "PANIC" => log::error!("pglue: {fields}"),
        "WARNING" => log::warn!("pglue: {fields}"),
        _ => log::debug!("pglue: {fields}"),
    }
}

