pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod notice;
pub mod protocol;
pub mod protocols;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod terms;
pub mod trade;
pub mod transport;
pub mod utils;

pub use dispatcher::{Dispatcher, ResumeReport};
pub use engine::{Commit, Effect, Outcome, ProtocolEngine};
pub use error::{ConfigurationError, DispatchError, PersistenceFailure, RejectReason, Rejection};
pub use event::{CommandKind, DeadlineKind, Event, InboundMessage, MessageKind, UserCommand};
pub use registry::ProtocolRegistry;
pub use trade::{CounterpartyRef, ProtocolVariant, Trade, TradeRole, TradeState};
