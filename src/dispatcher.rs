//! Event dispatcher
//!
//! Every live trade is owned by one worker task with a bounded mailbox.
//! Inbound messages, deadline expiries and user commands for a trade all go
//! through that mailbox, so they are applied one at a time in arrival order.
//! Different trades run on different tasks and are not ordered relative to
//! each other.
//!
//! Persistence is at-most-once. A committed transition is applied in memory
//! first and its snapshot is written afterwards, so a crash before that write
//! completes loses the transition; the resumed trade continues from the last
//! snapshot that reached the store.
//!
//! Workers of finalized trades stay registered until [`Dispatcher::shutdown`]
//! so that late events are answered with `Finalized`. A node therefore keeps
//! one idle task per trade it has run since start.

use crate::config::DispatcherSettings;
use crate::engine::{Commit, Effect, Outcome, ProtocolEngine};
use crate::error::{ConfigurationError, DispatchError, PersistenceFailure};
use crate::event::{DeadlineId, DeadlineKind, Event};
use crate::notice::{NoticeBus, NoticeKind, TradeNotice, TradeSubscription};
use crate::store::TradeStore;
use crate::terms::TradeTerms;
use crate::trade::{CounterpartyRef, ProtocolVariant, Trade, TradeRole};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum WorkerMsg {
    Event {
        event: Event,
        reply: Option<oneshot::Sender<Outcome>>,
    },
    Inspect(oneshot::Sender<Trade>),
    PersistFailed {
        failure: PersistenceFailure,
        attempt: u32,
    },
}

struct WorkerHandle {
    mailbox: mpsc::Sender<WorkerMsg>,
    task: JoinHandle<()>,
}

/// Trades brought back by [`Dispatcher::resume`].
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub resumed: Vec<String>,
    pub skipped: Vec<(String, ConfigurationError)>,
}

struct Inner {
    engine: Arc<ProtocolEngine>,
    store: TradeStore,
    transport: Arc<dyn Transport>,
    notices: NoticeBus,
    settings: DispatcherSettings,
    workers: Mutex<BTreeMap<String, WorkerHandle>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<ProtocolEngine>,
        store: TradeStore,
        transport: Arc<dyn Transport>,
        settings: DispatcherSettings,
    ) -> Self {
        let notices = NoticeBus::new(settings.notice_capacity);
        Self {
            inner: Arc::new(Inner {
                engine,
                store,
                transport,
                notices,
                settings,
                workers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.inner.engine
    }

    pub fn store(&self) -> &TradeStore {
        &self.inner.store
    }

    /// Creates a trade under a fresh id and starts its worker.
    pub fn create_trade(
        &self,
        variant: ProtocolVariant,
        role: TradeRole,
        terms: TradeTerms,
        counterparty: CounterpartyRef,
    ) -> Result<String, DispatchError> {
        let trade = self.inner.engine.create_trade(variant, role, terms, counterparty)?;
        let trade_id = trade.id().to_owned();
        self.launch(trade)?;
        Ok(trade_id)
    }

    pub fn create_trade_with_id(
        &self,
        trade_id: impl Into<String>,
        variant: ProtocolVariant,
        role: TradeRole,
        terms: TradeTerms,
        counterparty: CounterpartyRef,
    ) -> Result<String, DispatchError> {
        let trade = self
            .inner
            .engine
            .create_trade_with_id(trade_id, variant, role, terms, counterparty)?;
        let trade_id = trade.id().to_owned();
        self.launch(trade)?;
        Ok(trade_id)
    }

    /// Takes ownership of a new trade and persists its initial snapshot.
    pub fn launch(&self, trade: Trade) -> Result<(), DispatchError> {
        self.spawn_worker(trade, true)
    }

    /// Restores every stored trade and starts a worker for it. Armed
    /// deadlines are re-armed with the time they had left.
    pub async fn resume(&self) -> Result<ResumeReport, DispatchError> {
        let mut report = ResumeReport::default();
        for snapshot in self.inner.store.load_all().await? {
            let trade_id = snapshot.trade_id.clone();
            match self.inner.engine.restore(snapshot) {
                Ok(trade) => match self.spawn_worker(trade, false) {
                    Ok(()) => report.resumed.push(trade_id),
                    Err(e) => tracing::warn!(%trade_id, error = %e, "not resuming trade"),
                },
                Err(e) => {
                    tracing::error!(%trade_id, error = %e, "cannot restore trade");
                    report.skipped.push((trade_id, e));
                }
            }
        }
        tracing::info!(
            resumed = report.resumed.len(),
            skipped = report.skipped.len(),
            "trades resumed"
        );
        Ok(report)
    }

    /// Queues `event` for the trade without waiting for its outcome.
    pub async fn dispatch(&self, trade_id: &str, event: Event) -> Result<(), DispatchError> {
        self.send(trade_id, WorkerMsg::Event { event, reply: None }).await
    }

    /// Queues `event` and waits until the worker handled it, effects included.
    pub async fn submit(&self, trade_id: &str, event: Event) -> Result<Outcome, DispatchError> {
        let (reply, outcome) = oneshot::channel();
        self.send(
            trade_id,
            WorkerMsg::Event {
                event,
                reply: Some(reply),
            },
        )
        .await?;
        outcome
            .await
            .map_err(|_| DispatchError::WorkerStopped(trade_id.to_owned()))
    }

    /// Copy of the trade as its worker currently sees it.
    pub async fn snapshot(&self, trade_id: &str) -> Result<Trade, DispatchError> {
        let (reply, trade) = oneshot::channel();
        self.send(trade_id, WorkerMsg::Inspect(reply)).await?;
        trade
            .await
            .map_err(|_| DispatchError::WorkerStopped(trade_id.to_owned()))
    }

    pub fn live_trades(&self) -> Vec<String> {
        self.inner.workers.lock().keys().cloned().collect()
    }

    pub fn subscribe(&self, trade_id: impl Into<String>) -> TradeSubscription {
        self.inner.notices.subscribe(trade_id)
    }

    pub fn subscribe_all(&self) -> TradeSubscription {
        self.inner.notices.subscribe_all()
    }

    /// Stops every worker after it drained its mailbox, then waits for the
    /// store to write what is still pending.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for (trade_id, worker) in workers {
            drop(worker.mailbox);
            if let Err(e) = worker.task.await {
                tracing::error!(%trade_id, error = %e, "trade worker ended abnormally");
            }
        }
        self.inner.store.flush().await;
    }

    async fn send(&self, trade_id: &str, msg: WorkerMsg) -> Result<(), DispatchError> {
        let mailbox = self.inner.workers.lock().get(trade_id).map(|w| w.mailbox.clone());
        let Some(mailbox) = mailbox else {
            tracing::warn!(%trade_id, "event for unknown trade dropped");
            return Err(DispatchError::UnknownTrade(trade_id.to_owned()));
        };
        mailbox
            .send(msg)
            .await
            .map_err(|_| DispatchError::WorkerStopped(trade_id.to_owned()))
    }

    fn spawn_worker(&self, trade: Trade, persist_initial: bool) -> Result<(), DispatchError> {
        let mut workers = self.inner.workers.lock();
        if workers.contains_key(trade.id()) {
            return Err(DispatchError::TradeExists(trade.id().to_owned()));
        }

        let (mailbox, receiver) = mpsc::channel(self.inner.settings.mailbox_capacity.max(1));
        let trade_id = trade.id().to_owned();
        let mut worker = Worker {
            trade,
            engine: Arc::clone(&self.inner.engine),
            store: self.inner.store.clone(),
            transport: Arc::clone(&self.inner.transport),
            notices: self.inner.notices.clone(),
            retry_limit: self.inner.settings.persist_retry_limit,
            mailbox: mailbox.downgrade(),
            timers: BTreeMap::new(),
            handled_failure: None,
        };
        if persist_initial {
            worker.persist(0);
        }
        worker.rearm_deadlines();

        tracing::debug!(%trade_id, state = %worker.trade.state(), "trade worker started");
        let task = tokio::spawn(worker.run(receiver));
        workers.insert(trade_id, WorkerHandle { mailbox, task });
        Ok(())
    }
}

struct Worker {
    trade: Trade,
    engine: Arc<ProtocolEngine>,
    store: TradeStore,
    transport: Arc<dyn Transport>,
    notices: NoticeBus,
    retry_limit: u32,
    // weak so that pending timers never keep a stopped worker alive
    mailbox: mpsc::WeakSender<WorkerMsg>,
    timers: BTreeMap<DeadlineKind, JoinHandle<()>>,
    // (sequence, attempt) of the last persistence failure acted upon
    handled_failure: Option<(u64, u32)>,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::Receiver<WorkerMsg>) {
        while let Some(msg) = receiver.recv().await {
            match msg {
                WorkerMsg::Event { event, reply } => {
                    let outcome = self.handle(event).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                WorkerMsg::Inspect(reply) => {
                    let _ = reply.send(self.trade.clone());
                }
                WorkerMsg::PersistFailed { failure, attempt } => {
                    self.persist_failed(failure, attempt);
                }
            }
        }
        for timer in self.timers.into_values() {
            timer.abort();
        }
        tracing::debug!(trade_id = self.trade.id(), "trade worker stopped");
    }

    async fn handle(&mut self, event: Event) -> Outcome {
        let outcome = self.engine.handle_event(&mut self.trade, &event);
        match &outcome {
            Outcome::Rejected(rejection) => {
                self.notify(NoticeKind::Rejected(rejection.clone()));
            }
            Outcome::Committed(commit) => {
                self.persist(0);
                if let Event::Timeout(id) = event {
                    self.notify(NoticeKind::DeadlineExpired(id));
                }
                self.apply(commit).await;
                self.notify(NoticeKind::StateChanged {
                    from: commit.from,
                    to: commit.to,
                });
                if commit.finalized {
                    self.notify(NoticeKind::Finalized(commit.to));
                }
            }
        }
        outcome
    }

    async fn apply(&mut self, commit: &Commit) {
        for effect in &commit.effects {
            match effect {
                Effect::ClearDeadline(kind) => {
                    if let Some(timer) = self.timers.remove(kind) {
                        timer.abort();
                    }
                }
                Effect::ArmDeadline { id, after } => self.arm_timer(*id, *after),
                Effect::Send(message) => {
                    let sent = self.transport.send(&commit.trade_id, message.clone()).await;
                    if let Err(e) = sent {
                        tracing::warn!(
                            trade_id = %commit.trade_id,
                            kind = ?message.kind,
                            error = %e,
                            "outbound message not delivered"
                        );
                        self.notify(NoticeKind::DeliveryFailed(e));
                    }
                }
            }
        }
    }

    fn arm_timer(&mut self, id: DeadlineId, after: Duration) {
        if let Some(previous) = self.timers.remove(&id.kind) {
            previous.abort();
        }
        let mailbox = self.mailbox.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let event = Event::Timeout(id);
                let _ = mailbox.send(WorkerMsg::Event { event, reply: None }).await;
            }
        });
        self.timers.insert(id.kind, timer);
    }

    fn rearm_deadlines(&mut self) {
        let armed: Vec<_> = self
            .trade
            .deadlines()
            .map(|deadline| (deadline.id, deadline.expires_at.remaining()))
            .collect();
        for (id, remaining) in armed {
            tracing::debug!(trade_id = self.trade.id(), kind = ?id.kind, ?remaining, "deadline re-armed");
            self.arm_timer(id, remaining);
        }
    }

    /// Schedules the current snapshot. Not awaited: the in-memory trade is
    /// already authoritative and a crash before the write loses this state.
    fn persist(&self, attempt: u32) {
        let ticket = self.store.schedule_persist(&self.trade);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            if let Err(failure) = ticket.wait().await {
                if let Some(mailbox) = mailbox.upgrade() {
                    let _ = mailbox.send(WorkerMsg::PersistFailed { failure, attempt }).await;
                }
            }
        });
    }

    fn persist_failed(&mut self, failure: PersistenceFailure, attempt: u32) {
        // one failed write answers every coalesced request; act on it once
        if let Some((sequence, handled)) = self.handled_failure {
            if sequence == failure.sequence && handled >= attempt {
                return;
            }
        }
        self.handled_failure = Some((failure.sequence, attempt));

        tracing::error!(
            trade_id = self.trade.id(),
            sequence = failure.sequence,
            attempt,
            error = %failure.message,
            "snapshot not persisted"
        );
        self.notify(NoticeKind::PersistenceFailed(failure.clone()));

        if failure.sequence < self.trade.sequence() {
            // a newer snapshot was scheduled after this one
            return;
        }
        if attempt < self.retry_limit {
            self.persist(attempt + 1);
        } else {
            tracing::warn!(
                trade_id = self.trade.id(),
                sequence = self.trade.sequence(),
                "giving up on persisting; in-memory state stays authoritative"
            );
        }
    }

    fn notify(&self, kind: NoticeKind) {
        self.notices.publish(TradeNotice {
            trade_id: self.trade.id().to_owned(),
            sequence: self.trade.sequence(),
            kind,
        });
    }
}
