//! The trade aggregate and its identifying value types
use crate::error::ConfigurationError;
use crate::event::{DeadlineId, DeadlineKind};
use crate::protocol::ProtocolDefinition;
use crate::registry::ProtocolRegistry;
use crate::snapshot::{PersistedSnapshot, SNAPSHOT_VERSION};
use crate::terms::TradeTerms;
use crate::utils::new_trade_id;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// how many consumed command ids a trade remembers for replay detection
const CONSUMED_COMMAND_WINDOW: usize = 64;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TradeRole {
    #[n(0)]
    BuyerAsMaker,
    #[n(1)]
    BuyerAsTaker,
    #[n(2)]
    SellerAsMaker,
    #[n(3)]
    SellerAsTaker,
}

impl TradeRole {
    pub const ALL: [TradeRole; 4] = [
        TradeRole::BuyerAsMaker,
        TradeRole::BuyerAsTaker,
        TradeRole::SellerAsMaker,
        TradeRole::SellerAsTaker,
    ];

    pub fn is_buyer(&self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::BuyerAsTaker)
    }
    pub fn is_maker(&self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::SellerAsMaker)
    }
    /// The role the other side of the same trade plays.
    pub fn counterpart(&self) -> TradeRole {
        match self {
            TradeRole::BuyerAsMaker => TradeRole::SellerAsTaker,
            TradeRole::BuyerAsTaker => TradeRole::SellerAsMaker,
            TradeRole::SellerAsMaker => TradeRole::BuyerAsTaker,
            TradeRole::SellerAsTaker => TradeRole::BuyerAsMaker,
        }
    }
}

impl fmt::Display for TradeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Settlement mechanism family.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolVariant {
    // fiat payment rail, seller protected by the buyer's reputation
    #[n(0)]
    ReputationFiat,
    // cooperative 2-of-2 on-chain escrow
    #[n(1)]
    MultisigEscrow,
}

impl ProtocolVariant {
    pub const ALL: [ProtocolVariant; 2] =
        [ProtocolVariant::ReputationFiat, ProtocolVariant::MultisigEscrow];
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Union of the state sets of every variant. A definition only uses its own subset.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TradeState {
    #[n(0)]
    Init,
    #[n(1)]
    TakeOfferSent,
    #[n(2)]
    OfferAccepted,
    #[n(3)]
    AccountDataSent,
    #[n(4)]
    AccountDataReceived,
    #[n(5)]
    FiatSent,
    #[n(6)]
    FiatSentReceived,
    #[n(7)]
    FiatReceiptConfirmed,
    #[n(8)]
    BtcSentReceived,
    #[n(9)]
    AwaitingDeposit,
    #[n(10)]
    DepositConfirmed,
    #[n(11)]
    Completed,
    #[n(12)]
    Cancelled,
    #[n(13)]
    Failed,
    #[n(14)]
    Disputed,
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Opaque identity handle of a peer.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterpartyRef(#[n(0)] String);

impl CounterpartyRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterpartyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// This instant shifted forward; saturates at the original instant on overflow.
    pub fn after(&self, delay: Duration) -> Self {
        chrono::TimeDelta::from_std(delay)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(TimeStamp)
            .unwrap_or_else(|| self.clone())
    }
    /// Time left until this instant, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        (self.0 - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// An armed deadline; `expires_at` is wall-clock so it survives a restart.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Deadline {
    #[n(0)]
    pub id: DeadlineId,
    #[n(1)]
    pub expires_at: TimeStamp<Utc>,
}

/// One trade instance. Role and variant are fixed at creation; everything
/// else changes only through the protocol engine.
#[derive(Debug, Clone)]
pub struct Trade {
    id: String,
    role: TradeRole,
    variant: ProtocolVariant,
    state: TradeState,
    sequence: u64,
    terms: TradeTerms,
    terms_fingerprint: String,
    counterparty: CounterpartyRef,
    created_at: TimeStamp<Utc>,
    updated_at: TimeStamp<Utc>,
    finalized: bool,
    last_peer_sequence: u64,
    consumed_commands: VecDeque<String>,
    deadlines: BTreeMap<DeadlineKind, Deadline>,
    definition: Arc<ProtocolDefinition>,
}

impl Trade {
    /// Creates a trade under a freshly generated id.
    pub fn create(
        registry: &ProtocolRegistry,
        variant: ProtocolVariant,
        role: TradeRole,
        terms: TradeTerms,
        counterparty: CounterpartyRef,
    ) -> Result<Self, ConfigurationError> {
        Self::create_with_id(registry, new_trade_id(), variant, role, terms, counterparty)
    }

    /// Fails fast when no definition exists for (role, variant) or the terms
    /// do not verify; no partial trade is ever returned.
    pub fn create_with_id(
        registry: &ProtocolRegistry,
        trade_id: impl Into<String>,
        variant: ProtocolVariant,
        role: TradeRole,
        terms: TradeTerms,
        counterparty: CounterpartyRef,
    ) -> Result<Self, ConfigurationError> {
        let id = trade_id.into();
        if id.is_empty() {
            return Err(ConfigurationError::EmptyTradeId);
        }
        let definition = registry.lookup(role, variant)?;
        terms.verify()?;
        let terms_fingerprint = terms.fingerprint()?;
        let now = TimeStamp::new();

        Ok(Self {
            id,
            role,
            variant,
            state: definition.initial_state(),
            sequence: 0,
            terms,
            terms_fingerprint,
            counterparty,
            created_at: now.clone(),
            updated_at: now,
            finalized: false,
            last_peer_sequence: 0,
            consumed_commands: VecDeque::new(),
            deadlines: BTreeMap::new(),
            definition,
        })
    }

    /// Rebuilds a trade from its snapshot and re-attaches the definition
    /// registered for its (role, variant).
    pub fn restore(
        registry: &ProtocolRegistry,
        snapshot: PersistedSnapshot,
    ) -> Result<Self, ConfigurationError> {
        if snapshot.trade_id.is_empty() {
            return Err(ConfigurationError::EmptyTradeId);
        }
        let definition = registry.lookup(snapshot.role, snapshot.variant)?;
        if definition.fingerprint() != snapshot.definition_fingerprint {
            return Err(ConfigurationError::DefinitionMismatch {
                stored: snapshot.definition_fingerprint,
                registered: definition.fingerprint().to_owned(),
            });
        }
        snapshot.terms.verify()?;
        let terms_fingerprint = snapshot.terms.fingerprint()?;

        Ok(Self {
            id: snapshot.trade_id,
            role: snapshot.role,
            variant: snapshot.variant,
            state: snapshot.state,
            sequence: snapshot.sequence,
            terms: snapshot.terms,
            terms_fingerprint,
            counterparty: snapshot.counterparty,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            finalized: snapshot.finalized,
            last_peer_sequence: snapshot.last_peer_sequence,
            consumed_commands: snapshot.consumed_commands.into_iter().collect(),
            deadlines: snapshot
                .deadlines
                .into_iter()
                .map(|deadline| (deadline.id.kind, deadline))
                .collect(),
            definition,
        })
    }

    pub fn to_snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            trade_id: self.id.clone(),
            role: self.role,
            variant: self.variant,
            state: self.state,
            sequence: self.sequence,
            terms: self.terms.clone(),
            counterparty: self.counterparty.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            finalized: self.finalized,
            last_peer_sequence: self.last_peer_sequence,
            consumed_commands: self.consumed_commands.iter().cloned().collect(),
            deadlines: self.deadlines.values().cloned().collect(),
            definition_fingerprint: self.definition.fingerprint().to_owned(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn role(&self) -> TradeRole {
        self.role
    }
    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }
    pub fn state(&self) -> TradeState {
        self.state
    }
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
    pub fn terms(&self) -> &TradeTerms {
        &self.terms
    }
    pub fn terms_fingerprint(&self) -> &str {
        &self.terms_fingerprint
    }
    pub fn counterparty(&self) -> &CounterpartyRef {
        &self.counterparty
    }
    pub fn created_at(&self) -> &TimeStamp<Utc> {
        &self.created_at
    }
    pub fn updated_at(&self) -> &TimeStamp<Utc> {
        &self.updated_at
    }
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
    pub fn last_peer_sequence(&self) -> u64 {
        self.last_peer_sequence
    }
    pub fn definition(&self) -> &Arc<ProtocolDefinition> {
        &self.definition
    }
    pub fn deadline(&self, kind: DeadlineKind) -> Option<&Deadline> {
        self.deadlines.get(&kind)
    }
    pub fn deadlines(&self) -> impl Iterator<Item = &Deadline> {
        self.deadlines.values()
    }
    pub fn has_consumed_command(&self, command_id: &str) -> bool {
        self.consumed_commands.iter().any(|id| id == command_id)
    }

    // Mutators below are only reachable from the engine's commit step.

    pub(crate) fn advance(&mut self, target: TradeState) -> u64 {
        self.sequence += 1;
        self.state = target;
        self.updated_at = TimeStamp::new();
        self.sequence
    }

    pub(crate) fn record_peer_sequence(&mut self, sequence: u64) {
        self.last_peer_sequence = sequence;
    }

    pub(crate) fn record_command(&mut self, command_id: &str) {
        self.consumed_commands.push_back(command_id.to_owned());
        while self.consumed_commands.len() > CONSUMED_COMMAND_WINDOW {
            self.consumed_commands.pop_front();
        }
    }

    pub(crate) fn arm_deadline(&mut self, id: DeadlineId, expires_at: TimeStamp<Utc>) {
        self.deadlines.insert(id.kind, Deadline { id, expires_at });
    }

    pub(crate) fn disarm_deadline(&mut self, kind: DeadlineKind) -> Option<Deadline> {
        self.deadlines.remove(&kind)
    }

    pub(crate) fn finalize(&mut self) -> Vec<Deadline> {
        self.finalized = true;
        std::mem::take(&mut self.deadlines).into_values().collect()
    }
}
