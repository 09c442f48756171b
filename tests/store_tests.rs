//! Persistence and restart tests
//!
//! Covers the store's coalescing writer, failure reporting, and resuming a
//! dispatcher from what an earlier one persisted, deadlines included.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Notify, Semaphore};
use trade_protocol::config::{DeadlineSettings, DispatcherSettings};
use trade_protocol::crypto::DigestCommitment;
use trade_protocol::error::{DispatchError, StoreError};
use trade_protocol::notice::{NoticeKind, TradeSubscription};
use trade_protocol::snapshot::PersistedSnapshot;
use trade_protocol::store::{MemoryBackend, SledBackend, SnapshotBackend, TradeStore};
use trade_protocol::terms::{AmountSpec, PaymentMethod, PaymentRail, PriceSpec, TradeTerms};
use trade_protocol::transport::LoopbackTransport;
use trade_protocol::utils::new_peer_id;
use trade_protocol::{
    CommandKind, ConfigurationError, CounterpartyRef, DeadlineKind, Dispatcher, Event,
    InboundMessage, MessageKind, PersistenceFailure, ProtocolEngine, ProtocolRegistry,
    ProtocolVariant, Trade, TradeRole, TradeState,
};

fn engine() -> anyhow::Result<Arc<ProtocolEngine>> {
    Ok(Arc::new(ProtocolEngine::new(
        Arc::new(ProtocolRegistry::standard()?),
        Arc::new(DigestCommitment),
        DeadlineSettings::default(),
    )))
}

fn terms() -> TradeTerms {
    TradeTerms::new()
        .set_base_currency("BTC")
        .set_quote_currency("GBP")
        .set_amount(AmountSpec::QuoteSideRange {
            min: 10_000,
            max: 250_000,
        })
        .set_price(PriceSpec::Fixed(5_200_000))
        .set_payment_method(PaymentMethod::new(PaymentRail::NationalBank, "GBP").in_country("GB"))
}

/// A buyer-as-taker trade that has sent its take-offer request.
fn taker_trade(engine: &ProtocolEngine) -> anyhow::Result<Trade> {
    let mut trade = engine.create_trade(
        ProtocolVariant::ReputationFiat,
        TradeRole::BuyerAsTaker,
        terms(),
        CounterpartyRef::new(new_peer_id()),
    )?;
    let outcome = engine.handle_event(&mut trade, &Event::command(CommandKind::TakeOffer));
    assert!(outcome.is_committed());
    Ok(trade)
}

/// The returned outbox must stay alive for sends to succeed; nobody reads it.
fn dispatcher(
    engine: Arc<ProtocolEngine>,
    store: TradeStore,
    settings: DispatcherSettings,
) -> (Dispatcher, UnboundedReceiver<InboundMessage>) {
    let (transport, outbox) = LoopbackTransport::new(CounterpartyRef::new(new_peer_id()));
    (Dispatcher::new(engine, store, transport, settings), outbox)
}

/// Holds every write until the test hands out permits.
struct GatedBackend {
    inner: MemoryBackend,
    started: Notify,
    gate: Semaphore,
}

impl GatedBackend {
    fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            started: Notify::new(),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl SnapshotBackend for GatedBackend {
    async fn write(&self, trade_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.started.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        permit.forget();
        self.inner.write(trade_id, bytes).await
    }

    async fn read_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.inner.read_all().await
    }
}

/// Every write fails as if the disk were full.
#[derive(Default)]
struct FailingBackend {
    attempts: AtomicU64,
}

#[async_trait]
impl SnapshotBackend for FailingBackend {
    async fn write(&self, _: &str, _: &[u8]) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Backend("no space left on device".to_string()))
    }

    async fn read_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(vec![])
    }
}

/// Serves one stored trade and fails every write, recording the sequence
/// each attempt carried. When gated, every write waits for a permit.
struct ScriptedBackend {
    records: Vec<(String, Vec<u8>)>,
    written: parking_lot::Mutex<Vec<u64>>,
    started: Notify,
    gate: Option<Semaphore>,
}

impl ScriptedBackend {
    /// Seeds a fresh buyer-as-taker trade, still at Init.
    fn seeded(engine: &ProtocolEngine, gated: bool) -> anyhow::Result<Self> {
        let trade = engine.create_trade(
            ProtocolVariant::ReputationFiat,
            TradeRole::BuyerAsTaker,
            terms(),
            CounterpartyRef::new(new_peer_id()),
        )?;
        Ok(Self {
            records: vec![(trade.id().to_owned(), trade.to_snapshot().encode()?)],
            written: parking_lot::Mutex::new(vec![]),
            started: Notify::new(),
            gate: gated.then(|| Semaphore::new(0)),
        })
    }

    fn release(&self, writes: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(writes);
        }
    }

    fn written(&self) -> Vec<u64> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl SnapshotBackend for ScriptedBackend {
    async fn write(&self, _: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .forget();
        }
        let snapshot = PersistedSnapshot::decode(bytes)?;
        self.written.lock().push(snapshot.sequence);
        Err(StoreError::Backend("no space left on device".to_string()))
    }

    async fn read_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self.records.clone())
    }
}

async fn next_failure(notices: &mut TradeSubscription) -> anyhow::Result<PersistenceFailure> {
    let failure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match notices.recv().await.map(|n| n.kind) {
                Some(NoticeKind::PersistenceFailed(failure)) => return Some(failure),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await?;
    failure.ok_or_else(|| anyhow::anyhow!("notice bus closed"))
}

#[tokio::test]
async fn burst_of_requests_is_one_write_of_the_latest() -> anyhow::Result<()> {
    let engine = engine()?;
    let store = TradeStore::open(Arc::new(MemoryBackend::new()));
    let mut trade = taker_trade(&engine)?;

    // no await between the requests, so the writer has not started yet
    let mut tickets = vec![store.schedule_persist(&trade)];
    for sequence in 2..=5u64 {
        let response = Event::Inbound(InboundMessage {
            trade_id: trade.id().to_owned(),
            sequence,
            sender: trade.counterparty().clone(),
            kind: MessageKind::TakeOfferResponse,
            payload: vec![],
            signature: vec![],
        });
        // only the first response commits, the rest are rejected; both are fine here
        engine.handle_event(&mut trade, &response);
        tickets.push(store.schedule_persist(&trade));
    }
    let cancel = engine.handle_event(&mut trade, &Event::command(CommandKind::CancelTrade));
    assert!(cancel.is_committed());
    tickets.push(store.schedule_persist(&trade));

    for ticket in tickets {
        ticket.wait().await?;
    }

    assert_eq!(store.physical_writes(), 1);
    let stored = store.load_all().await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sequence, trade.sequence());
    assert_eq!(stored[0].state, TradeState::Cancelled);
    Ok(())
}

#[tokio::test]
async fn at_most_one_write_in_flight_and_one_pending() -> anyhow::Result<()> {
    let engine = engine()?;
    let backend = Arc::new(GatedBackend::new());
    let store = TradeStore::open(backend.clone());
    let mut trade = taker_trade(&engine)?;

    let first = store.schedule_persist(&trade);
    backend.started.notified().await;

    // the first write is blocked in the backend; these all collapse into one
    let response = Event::Inbound(InboundMessage {
        trade_id: trade.id().to_owned(),
        sequence: 1,
        sender: trade.counterparty().clone(),
        kind: MessageKind::TakeOfferResponse,
        payload: vec![],
        signature: vec![],
    });
    assert!(engine.handle_event(&mut trade, &response).is_committed());
    let second = store.schedule_persist(&trade);
    let cancel = engine.handle_event(&mut trade, &Event::command(CommandKind::CancelTrade));
    assert!(cancel.is_committed());
    let third = store.schedule_persist(&trade);

    backend.gate.add_permits(8);
    first.wait().await?;
    second.wait().await?;
    third.wait().await?;

    assert_eq!(store.physical_writes(), 2);
    let stored = store.load_all().await?;
    assert_eq!(stored[0].sequence, 3);
    assert!(stored[0].finalized);
    Ok(())
}

#[tokio::test]
async fn write_failure_reaches_every_covered_caller() -> anyhow::Result<()> {
    let engine = engine()?;
    let backend = Arc::new(FailingBackend::default());
    let store = TradeStore::open(backend.clone());
    let trade = taker_trade(&engine)?;

    let a = store.schedule_persist(&trade);
    let b = store.schedule_persist(&trade);

    let failure_a = a.wait().await.unwrap_err();
    let failure_b = b.wait().await.unwrap_err();
    assert_eq!(failure_a, failure_b);
    assert_eq!(failure_a.trade_id, trade.id());
    assert!(failure_a.message.contains("no space left"));

    // the store itself never retries
    store.flush().await;
    assert_eq!(backend.attempts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn worker_reports_failure_and_keeps_trading() -> anyhow::Result<()> {
    let backend = Arc::new(FailingBackend::default());
    let store = TradeStore::open(backend.clone());
    let settings = DispatcherSettings {
        persist_retry_limit: 1,
        ..DispatcherSettings::default()
    };
    let (dispatcher, _outbox) = dispatcher(engine()?, store.clone(), settings);

    let trade_id = dispatcher.create_trade(
        ProtocolVariant::ReputationFiat,
        TradeRole::BuyerAsTaker,
        terms(),
        CounterpartyRef::new(new_peer_id()),
    )?;
    let mut notices = dispatcher.subscribe(&trade_id);

    let outcome = dispatcher
        .submit(&trade_id, Event::command(CommandKind::TakeOffer))
        .await?;
    assert!(outcome.is_committed());

    let failure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match notices.recv().await.map(|n| n.kind) {
                Some(NoticeKind::PersistenceFailed(failure)) => return Some(failure),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await?
    .expect("persistence failure notice");
    assert!(failure.message.contains("no space left"));

    // in-memory state stays authoritative
    let trade = dispatcher.snapshot(&trade_id).await?;
    assert_eq!(trade.state(), TradeState::TakeOfferSent);
    assert_eq!(trade.sequence(), 1);
    Ok(())
}

#[tokio::test]
async fn worker_retries_failed_persist_up_to_the_limit() -> anyhow::Result<()> {
    for limit in [0u32, 1, 3] {
        let engine = engine()?;
        let backend = Arc::new(ScriptedBackend::seeded(&engine, false)?);
        let settings = DispatcherSettings {
            persist_retry_limit: limit,
            ..DispatcherSettings::default()
        };
        let (dispatcher, _outbox) = dispatcher(engine, TradeStore::open(backend.clone()), settings);
        // resuming does not persist, so the commit below is the only write
        let report = dispatcher.resume().await?;
        let trade_id = report.resumed[0].clone();
        let mut notices = dispatcher.subscribe(&trade_id);

        let outcome = dispatcher
            .submit(&trade_id, Event::command(CommandKind::TakeOffer))
            .await?;
        assert!(outcome.is_committed());

        for _ in 0..=limit {
            assert_eq!(next_failure(&mut notices).await?.sequence, 1);
        }
        dispatcher.shutdown().await;

        // the first write plus one retry per allowed attempt, nothing after
        assert_eq!(backend.written(), vec![1; limit as usize + 1], "retry limit {limit}");
        while let Some(notice) = notices.try_recv() {
            assert!(!matches!(notice.kind, NoticeKind::PersistenceFailed(_)));
        }
    }
    Ok(())
}

#[tokio::test]
async fn failure_of_superseded_snapshot_is_not_retried() -> anyhow::Result<()> {
    let engine = engine()?;
    let backend = Arc::new(ScriptedBackend::seeded(&engine, true)?);
    let settings = DispatcherSettings {
        persist_retry_limit: 1,
        ..DispatcherSettings::default()
    };
    let (dispatcher, _outbox) = dispatcher(engine, TradeStore::open(backend.clone()), settings);
    let trade_id = dispatcher.resume().await?.resumed[0].clone();
    let mut notices = dispatcher.subscribe(&trade_id);

    dispatcher
        .submit(&trade_id, Event::command(CommandKind::TakeOffer))
        .await?;
    backend.started.notified().await;

    // sequence 2 is committed while the write of sequence 1 is held
    let cancel = dispatcher
        .submit(&trade_id, Event::command(CommandKind::CancelTrade))
        .await?;
    assert_eq!(cancel.commit().map(|c| c.sequence), Some(2));

    backend.release(1);
    assert_eq!(next_failure(&mut notices).await?.sequence, 1);
    backend.release(1);
    assert_eq!(next_failure(&mut notices).await?.sequence, 2);
    backend.release(1);
    assert_eq!(next_failure(&mut notices).await?.sequence, 2);

    backend.release(8);
    dispatcher.shutdown().await;
    assert_eq!(backend.written(), vec![1, 2, 2]);
    Ok(())
}

#[tokio::test]
async fn resume_skips_trade_with_changed_definition() -> anyhow::Result<()> {
    let engine = engine()?;
    let backend = Arc::new(MemoryBackend::new());

    let kept = taker_trade(&engine)?;
    let mut stale = taker_trade(&engine)?.to_snapshot();
    stale.definition_fingerprint = "0".repeat(64);
    backend.write(kept.id(), &kept.to_snapshot().encode()?).await?;
    backend.write(&stale.trade_id, &stale.encode()?).await?;

    let (dispatcher, _outbox) =
        dispatcher(engine, TradeStore::open(backend), DispatcherSettings::default());
    let report = dispatcher.resume().await?;

    assert_eq!(report.resumed, vec![kept.id().to_owned()]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, stale.trade_id);
    assert!(matches!(
        report.skipped[0].1,
        ConfigurationError::DefinitionMismatch { .. }
    ));
    assert_eq!(dispatcher.live_trades(), vec![kept.id().to_owned()]);
    assert!(matches!(
        dispatcher.snapshot(&stale.trade_id).await,
        Err(DispatchError::UnknownTrade(_))
    ));
    Ok(())
}

#[tokio::test]
async fn resumed_trade_continues_where_it_stopped() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("restart.db"))?);

    let maker = CounterpartyRef::new(new_peer_id());
    let (trade_id, before) = {
        let store = TradeStore::open(Arc::new(SledBackend::from_db(db.clone())?));
        let (first, _outbox) = dispatcher(engine()?, store.clone(), DispatcherSettings::default());
        let trade_id = first.create_trade(
            ProtocolVariant::MultisigEscrow,
            TradeRole::BuyerAsTaker,
            terms(),
            maker.clone(),
        )?;
        first
            .submit(&trade_id, Event::command(CommandKind::TakeOffer))
            .await?;
        let before = first.snapshot(&trade_id).await?;
        first.shutdown().await;
        store.close().await;
        (trade_id, before)
    };

    // a fresh registry, engine, store and dispatcher over the same database
    let store = TradeStore::open(Arc::new(SledBackend::from_db(db)?));
    let (second, _outbox) = dispatcher(engine()?, store, DispatcherSettings::default());
    let report = second.resume().await?;
    assert_eq!(report.resumed, vec![trade_id.clone()]);
    assert!(report.skipped.is_empty());

    let after = second.snapshot(&trade_id).await?;
    assert_eq!(after.state(), before.state());
    assert_eq!(after.sequence(), before.sequence());
    assert_eq!(after.definition().fingerprint(), before.definition().fingerprint());
    assert_eq!(
        after.deadline(DeadlineKind::TakeOfferResponse),
        before.deadline(DeadlineKind::TakeOfferResponse)
    );

    let response = Event::Inbound(InboundMessage {
        trade_id: trade_id.clone(),
        sequence: 1,
        sender: maker,
        kind: MessageKind::TakeOfferResponse,
        payload: vec![],
        signature: vec![],
    });
    let outcome = second.submit(&trade_id, response).await?;
    assert_eq!(outcome.commit().map(|c| c.to), Some(TradeState::AwaitingDeposit));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deadline_fires_after_resume() -> anyhow::Result<()> {
    let backend = Arc::new(MemoryBackend::new());

    let trade_id = {
        let store = TradeStore::open(backend.clone());
        let (first, _outbox) = dispatcher(engine()?, store.clone(), DispatcherSettings::default());
        let trade_id = first.create_trade(
            ProtocolVariant::ReputationFiat,
            TradeRole::SellerAsTaker,
            terms(),
            CounterpartyRef::new(new_peer_id()),
        )?;
        first
            .submit(&trade_id, Event::command(CommandKind::TakeOffer))
            .await?;
        first.shutdown().await;
        store.close().await;
        trade_id
    };

    let (second, _outbox) =
        dispatcher(engine()?, TradeStore::open(backend), DispatcherSettings::default());
    let mut notices = second.subscribe(&trade_id);
    second.resume().await?;

    // the paused clock jumps straight to the re-armed deadline
    let mut expired = false;
    loop {
        let notice = notices.recv().await.expect("notice bus open");
        match notice.kind {
            NoticeKind::DeadlineExpired(id) => {
                assert_eq!(id.kind, DeadlineKind::TakeOfferResponse);
                assert_eq!(id.armed_at, 1);
                expired = true;
            }
            NoticeKind::Finalized(state) => {
                assert_eq!(state, TradeState::Failed);
                break;
            }
            _ => {}
        }
    }
    assert!(expired);

    let trade = second.snapshot(&trade_id).await?;
    assert!(trade.is_finalized());
    assert_eq!(trade.deadlines().count(), 0);
    Ok(())
}
