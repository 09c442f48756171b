//! Error taxonomy for trade creation, event handling and persistence
use crate::trade::{ProtocolVariant, TradeRole};
use std::fmt;

/// Raised while building the registry or creating/restoring a trade.
/// Never raised mid-protocol.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no protocol registered for {role} in {variant}")]
    UnsupportedCombination {
        role: TradeRole,
        variant: ProtocolVariant,
    },
    #[error("protocol for {role} in {variant} is registered twice")]
    DuplicateRegistration {
        role: TradeRole,
        variant: ProtocolVariant,
    },
    #[error("transition from {state} on {event} is declared twice")]
    ConflictingTransition { state: String, event: String },
    #[error("invalid trade terms: {0}")]
    InvalidTerms(#[from] TermsError),
    #[error("trade id must not be empty")]
    EmptyTradeId,
    #[error("stored protocol fingerprint {stored} does not match registered {registered}")]
    DefinitionMismatch { stored: String, registered: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TermsError {
    #[error("amount is not set")]
    MissingAmount,
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("amount range {min}..={max} is invalid")]
    InvalidRange { min: u64, max: u64 },
    #[error("price is not set")]
    MissingPrice,
    #[error("fixed price must be greater than zero")]
    ZeroPrice,
    #[error("float price offset {0} bps is outside +/-10000")]
    FloatOutOfRange(i32),
    #[error("payment method is not set")]
    MissingPaymentMethod,
    #[error("{0} currency is not set")]
    MissingCurrency(&'static str),
    #[error("currency code {0:?} is malformed")]
    MalformedCurrency(String),
    #[error("failed to encode terms: {0}")]
    Encoding(String),
}

/// Why an event was refused. The trade is left untouched in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    NoMatchingTransition,
    GuardFailed,
    InvalidOperation,
    Finalized,
    Duplicate,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::NoMatchingTransition => "no matching transition",
            RejectReason::GuardFailed => "guard failed",
            RejectReason::InvalidOperation => "invalid operation",
            RejectReason::Finalized => "trade is finalized",
            RejectReason::Duplicate => "duplicate event",
        };
        f.write_str(text)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {detail}")]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

impl Rejection {
    pub fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("snapshot version {found} is newer than supported {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("backend failure: {0}")]
    Backend(String),
}

/// A write that did not reach durable storage. Every caller whose snapshot
/// was covered by the write receives a copy.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("persisting trade {trade_id} at sequence {sequence} failed: {message}")]
pub struct PersistenceFailure {
    pub trade_id: String,
    pub sequence: u64,
    pub message: String,
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("unknown trade {0}")]
    UnknownTrade(String),
    #[error("trade {0} is already live")]
    TradeExists(String),
    #[error("worker for trade {0} has stopped")]
    WorkerStopped(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("message refused: {0}")]
    Refused(String),
}
