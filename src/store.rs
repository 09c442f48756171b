//! Snapshot persistence
//!
//! [`TradeStore`] keeps at most one pending snapshot per trade id and a single
//! writer task that drains them. Scheduling a persist while an older snapshot
//! of the same trade is still pending replaces that snapshot; the callers of
//! both requests are answered by the one write that finally happens. The
//! store reports failures to its callers and never retries on its own.

use crate::error::{PersistenceFailure, StoreError};
use crate::snapshot::PersistedSnapshot;
use crate::trade::Trade;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

const TRADES_TREE: &str = "trades";

/// Durable key/value storage for encoded snapshots, keyed by trade id.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Returns only once the bytes are durable.
    async fn write(&self, trade_id: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn read_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

pub struct SledBackend {
    instance: Arc<sled::Db>,
    trades: sled::Tree,
}

impl SledBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_db(Arc::new(sled::open(path)?))
    }

    /// In-memory database, removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(Arc::new(sled::Config::new().temporary(true).open()?))
    }

    pub fn from_db(instance: Arc<sled::Db>) -> Result<Self, StoreError> {
        let trades = instance.open_tree(TRADES_TREE)?;
        Ok(Self { instance, trades })
    }

    pub fn db(&self) -> &Arc<sled::Db> {
        &self.instance
    }
}

#[async_trait]
impl SnapshotBackend for SledBackend {
    async fn write(&self, trade_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.trades.insert(trade_id.as_bytes(), bytes)?;
        self.trades.flush_async().await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut records = Vec::new();
        for entry in self.trades.iter() {
            let (key, value) = entry?;
            records.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(records)
    }
}

/// Volatile backend for ephemeral nodes and tests.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn write(&self, trade_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.records.lock().insert(trade_id.to_owned(), bytes.to_vec());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|(trade_id, bytes)| (trade_id.clone(), bytes.clone()))
            .collect())
    }
}

type Waiter = oneshot::Sender<Result<(), PersistenceFailure>>;

struct Pending {
    bytes: Vec<u8>,
    sequence: u64,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct Slots {
    pending: BTreeMap<String, Pending>,
    // trade ids in the order they became pending
    order: VecDeque<String>,
    // highest sequence ever scheduled per trade id
    highest: BTreeMap<String, u64>,
    writing: bool,
    closed: bool,
    flush_waiters: Vec<oneshot::Sender<()>>,
}

impl Slots {
    fn idle(&self) -> bool {
        self.order.is_empty() && !self.writing
    }
}

struct Shared {
    backend: Arc<dyn SnapshotBackend>,
    slots: Mutex<Slots>,
    wake: Notify,
    writes: AtomicU64,
}

/// Answer to one `schedule_persist` call.
#[derive(Debug)]
pub struct PersistTicket {
    trade_id: String,
    sequence: u64,
    receiver: oneshot::Receiver<Result<(), PersistenceFailure>>,
}

impl PersistTicket {
    pub fn trade_id(&self) -> &str {
        &self.trade_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Resolves once a write covering this snapshot finished.
    pub async fn wait(self) -> Result<(), PersistenceFailure> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(PersistenceFailure {
                trade_id: self.trade_id,
                sequence: self.sequence,
                message: "store writer stopped".to_string(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct TradeStore {
    shared: Arc<Shared>,
    writer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TradeStore {
    /// Spawns the writer task; must be called inside a Tokio runtime.
    pub fn open(backend: Arc<dyn SnapshotBackend>) -> Self {
        let shared = Arc::new(Shared {
            backend,
            slots: Mutex::new(Slots::default()),
            wake: Notify::new(),
            writes: AtomicU64::new(0),
        });
        let writer = tokio::spawn(run_writer(Arc::clone(&shared)));
        Self {
            shared,
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Queues the trade's current snapshot without waiting for the write.
    ///
    /// A request older than a snapshot already scheduled for the same trade
    /// is superseded and never written: it is answered together with the
    /// pending write, or right away when that write already finished.
    pub fn schedule_persist(&self, trade: &Trade) -> PersistTicket {
        let (sender, receiver) = oneshot::channel();
        let ticket = PersistTicket {
            trade_id: trade.id().to_owned(),
            sequence: trade.sequence(),
            receiver,
        };

        let bytes = match trade.to_snapshot().encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = sender.send(Err(failure(trade.id(), trade.sequence(), &e)));
                return ticket;
            }
        };

        {
            let mut slots = self.shared.slots.lock();
            if slots.closed {
                let _ = sender.send(Err(PersistenceFailure {
                    trade_id: trade.id().to_owned(),
                    sequence: trade.sequence(),
                    message: "store is closed".to_string(),
                }));
                return ticket;
            }

            let stale = slots
                .highest
                .get(trade.id())
                .is_some_and(|highest| trade.sequence() < *highest);
            if !stale {
                slots.highest.insert(trade.id().to_owned(), trade.sequence());
            }

            match slots.pending.get_mut(trade.id()) {
                Some(pending) => {
                    if !stale {
                        pending.bytes = bytes;
                        pending.sequence = trade.sequence();
                    }
                    pending.waiters.push(sender);
                    tracing::trace!(trade_id = trade.id(), sequence = trade.sequence(), "snapshot coalesced");
                }
                None if stale => {
                    tracing::debug!(trade_id = trade.id(), sequence = trade.sequence(), "superseded snapshot dropped");
                    let _ = sender.send(Ok(()));
                    return ticket;
                }
                None => {
                    slots.pending.insert(
                        trade.id().to_owned(),
                        Pending {
                            bytes,
                            sequence: trade.sequence(),
                            waiters: vec![sender],
                        },
                    );
                    slots.order.push_back(trade.id().to_owned());
                }
            }
        }
        self.shared.wake.notify_one();
        ticket
    }

    /// Decodes every stored snapshot. Records that cannot be decoded are
    /// logged and skipped so one bad record does not block the others.
    pub async fn load_all(&self) -> Result<Vec<PersistedSnapshot>, StoreError> {
        let records = self.shared.backend.read_all().await?;
        let mut snapshots = Vec::with_capacity(records.len());
        for (trade_id, bytes) in records {
            match PersistedSnapshot::decode(&bytes) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::error!(%trade_id, error = %e, "skipping unreadable snapshot"),
            }
        }
        Ok(snapshots)
    }

    /// Waits until nothing is pending or being written.
    pub async fn flush(&self) {
        let receiver = {
            let mut slots = self.shared.slots.lock();
            if slots.idle() {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            slots.flush_waiters.push(sender);
            receiver
        };
        let _ = receiver.await;
    }

    /// Number of writes handed to the backend so far, failed ones included.
    pub fn physical_writes(&self) -> u64 {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Drains what is pending, then stops the writer. Later requests fail.
    pub async fn close(&self) {
        self.shared.slots.lock().closed = true;
        self.shared.wake.notify_one();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::error!(error = %e, "store writer ended abnormally");
            }
        }
    }
}

fn failure(trade_id: &str, sequence: u64, error: &StoreError) -> PersistenceFailure {
    PersistenceFailure {
        trade_id: trade_id.to_owned(),
        sequence,
        message: error.to_string(),
    }
}

async fn run_writer(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut slots = shared.slots.lock();
            let mut next = None;
            if let Some(trade_id) = slots.order.pop_front() {
                next = slots.pending.remove(&trade_id).map(|pending| (trade_id, pending));
            }
            slots.writing = next.is_some();
            if slots.idle() {
                for waiter in slots.flush_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if slots.closed {
                    break;
                }
            }
            next
        };

        let Some((trade_id, pending)) = next else {
            shared.wake.notified().await;
            continue;
        };

        tracing::debug!(
            %trade_id,
            sequence = pending.sequence,
            covered = pending.waiters.len(),
            "writing snapshot"
        );
        let result = shared.backend.write(&trade_id, &pending.bytes).await;
        shared.writes.fetch_add(1, Ordering::SeqCst);

        let result = result.map_err(|e| {
            tracing::error!(%trade_id, sequence = pending.sequence, error = %e, "snapshot write failed");
            failure(&trade_id, pending.sequence, &e)
        });
        for waiter in pending.waiters {
            let _ = waiter.send(result.clone());
        }
    }
    tracing::debug!("store writer stopped");
}
