//! Connection pool: a bounded semaphore gating wire acquisition, a free
//! list, and an "all connections" registry keyed by a pool-local id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use pglue_sql::Fragment;

use crate::config::PoolConfig;
use crate::error::PgResult;
use crate::query::{Query, QueryResult};
use crate::row::Row;
use crate::transaction::Transaction;
use crate::wire::{Wire, WireEvent};

#[derive(Clone)]
struct PooledWire {
    id: u64,
    wire: Wire,
}

struct PoolState {
    /// Every wire the pool has ever opened that hasn't been forgotten or
    /// closed, borrowed or not — this is what `close()` iterates.
    all: HashMap<u64, Wire>,
    free: Vec<PooledWire>,
}

struct PoolInner {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
}

/// A bounded pool of [`Wire`] connections sharing one [`PoolConfig`].
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        let max = config.max_connections.max(1);
        Pool {
            inner: Arc::new(PoolInner {
                config,
                semaphore: Arc::new(Semaphore::new(max)),
                next_id: AtomicU64::new(0),
                state: Mutex::new(PoolState { all: HashMap::new(), free: Vec::new() }),
            }),
        }
    }

    /// Borrow a connected wire: pop one from the free list, or open a new
    /// one if the pool has room (the semaphore permit gates that room).
    pub async fn acquire(&self) -> PgResult<PoolHandle> {
        let permit = self.inner.semaphore.clone().acquire_owned().await.expect("pool semaphore is never closed");

        let existing = {
            let mut state = self.inner.state.lock().expect("pool state lock poisoned");
            state.free.pop()
        };
        let pooled = match existing {
            Some(p) => p,
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                let wire = Wire::new(self.inner.config.connect.clone());
                wire.connect().await?;
                self.inner.state.lock().expect("pool state lock poisoned").all.insert(id, wire.clone());
                // A wire that closes for good while sitting on the free list
                // (or mid-borrow, surfacing on its next use) should drop out
                // of the pool's bookkeeping rather than linger as a dead
                // entry other acquires keep tripping over.
                let pool = self.clone();
                let mut events = wire.events();
                tokio::spawn(async move {
                    while let Ok(event) = events.recv().await {
                        if let WireEvent::Close(_) = event {
                            pool.forget(id);
                            break;
                        }
                    }
                });
                PooledWire { id, wire }
            }
        };
        pooled.wire.ensure_connected().await?;

        Ok(PoolHandle { pool: self.clone(), permit: Some(permit), slot: Some(pooled) })
    }

    /// Convenience: acquire a wire and build a [`Query`] against it. The
    /// returned [`PooledQuery`] holds the borrow for as long as the query
    /// itself is alive, releasing the wire back to the free list only once
    /// the caller drops it — the query keeps running against a connection
    /// the pool still considers checked out.
    pub async fn query(&self, fragment: &Fragment) -> PgResult<PooledQuery> {
        let handle = self.acquire().await?;
        let query = handle.wire().query_fragment(fragment);
        Ok(PooledQuery { handle, query })
    }

    pub async fn begin(&self) -> PgResult<PoolTransaction> {
        let handle = self.acquire().await?;
        let tx = handle.wire().begin().await?;
        Ok(PoolTransaction { handle: Some(handle), tx: Some(tx) })
    }

    fn forget(&self, id: u64) {
        let mut state = self.inner.state.lock().expect("pool state lock poisoned");
        state.all.remove(&id);
        state.free.retain(|p| p.id != id);
    }

    fn release(&self, pooled: PooledWire) {
        let mut state = self.inner.state.lock().expect("pool state lock poisoned");
        if state.all.contains_key(&pooled.id) && !state.free.iter().any(|p| p.id == pooled.id) {
            state.free.push(pooled);
        }
    }

    /// Close every wire the pool knows about, including ones currently
    /// borrowed out — their next use surfaces a connection-closed error,
    /// same as an unsolicited socket close. Clears both collections; the
    /// semaphore permits outstanding borrows hold are simply let go when
    /// those borrows are eventually dropped.
    pub async fn close(&self) {
        let all = {
            let mut state = self.inner.state.lock().expect("pool state lock poisoned");
            state.free.clear();
            std::mem::take(&mut state.all)
        };
        for (_, wire) in all {
            wire.close().await;
        }
    }
}

/// A borrowed wire. Returns itself to the pool's free list on drop unless
/// [`PoolHandle::forget`] was called first.
pub struct PoolHandle {
    pool: Pool,
    permit: Option<OwnedSemaphorePermit>,
    slot: Option<PooledWire>,
}

impl PoolHandle {
    pub fn wire(&self) -> &Wire {
        &self.slot.as_ref().expect("pool handle used after release").wire
    }

    /// Remove this wire from the pool entirely rather than returning it to
    /// the free list — for a connection observed to be broken.
    pub fn forget(mut self) {
        if let Some(pooled) = self.slot.take() {
            self.pool.forget(pooled.id);
        }
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if let Some(pooled) = self.slot.take() {
            self.pool.release(pooled);
        }
        // `self.permit` drops here too, returning the semaphore's capacity.
    }
}

/// A [`Query`] paired with the [`PoolHandle`] it was built from. Keeping the
/// handle alive here, rather than releasing it as soon as the query is
/// constructed, means the wire stays checked out of the pool's free list for
/// as long as this value lives — another `acquire()` can't be handed the
/// same connection while a query against it is still in flight.
pub struct PooledQuery {
    handle: PoolHandle,
    query: Query,
}

impl PooledQuery {
    pub fn wire(&self) -> &Wire {
        self.handle.wire()
    }

    pub fn simple(mut self, simple: bool) -> Self {
        self.query = self.query.simple(simple);
        self
    }

    pub fn chunked(mut self, n: usize) -> Self {
        self.query = self.query.chunked(n);
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.query = self.query.stdin(data);
        self
    }

    pub async fn run(&self) -> PgResult<QueryResult> {
        self.query.run().await
    }

    pub async fn run_with_stdout(&self, sink: &mut crate::copy::CopySink) -> PgResult<QueryResult> {
        self.query.run_with_stdout(sink).await
    }

    pub async fn run_chunks(&self) -> PgResult<(Vec<Vec<Row>>, String)> {
        self.query.run_chunks().await
    }

    pub async fn execute(&self) -> PgResult<String> {
        self.query.execute().await
    }

    pub async fn collect(&self) -> PgResult<Vec<Row>> {
        self.query.collect().await
    }

    pub async fn collect_up_to(&self, count: usize) -> PgResult<Vec<Row>> {
        self.query.collect_up_to(count).await
    }

    pub async fn count(&self) -> PgResult<usize> {
        self.query.count().await
    }

    pub async fn first(&self) -> PgResult<Row> {
        self.query.first().await
    }

    pub async fn first_opt(&self) -> PgResult<Option<Row>> {
        self.query.first_opt().await
    }

    pub async fn first_or(&self, default: Row) -> PgResult<Row> {
        self.query.first_or(default).await
    }

    pub async fn map<T>(&self, f: impl Fn(&Row) -> Result<T, pglue_sql::TypeError>) -> PgResult<Vec<T>> {
        self.query.map(f).await
    }

    pub async fn filter(&self, pred: impl Fn(&Row) -> bool) -> PgResult<Vec<Row>> {
        self.query.filter(pred).await
    }

    pub async fn parse<T>(&self, schema: impl Fn(&Row) -> Result<T, pglue_sql::TypeError>) -> PgResult<Vec<T>> {
        self.query.parse(schema).await
    }
}

/// Owns a `(wire, transaction)` pair acquired from a [`Pool`]; commit or
/// rollback releases the wire back to the pool afterward.
pub struct PoolTransaction {
    handle: Option<PoolHandle>,
    tx: Option<Transaction>,
}

impl PoolTransaction {
    pub fn wire(&self) -> &Wire {
        self.handle.as_ref().expect("pool transaction used after commit/rollback").wire()
    }

    pub async fn commit(mut self) -> PgResult<()> {
        let tx = self.tx.take().expect("pool transaction used after commit/rollback");
        let result = tx.commit().await;
        self.handle.take();
        result
    }

    pub async fn rollback(mut self) -> PgResult<()> {
        let tx = self.tx.take().expect("pool transaction used after commit/rollback");
        let result = tx.rollback().await;
        self.handle.take();
        result
    }
}
