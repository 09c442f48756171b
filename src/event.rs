//! Events consumed by a trade and the messages it emits
use crate::trade::CounterpartyRef;
use crate::utils::new_command_id;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    #[n(0)]
    TakeOfferRequest,
    #[n(1)]
    TakeOfferResponse,
    #[n(2)]
    AccountData,
    #[n(3)]
    FiatSent,
    #[n(4)]
    FiatReceiptConfirmed,
    #[n(5)]
    BtcSent,
    #[n(6)]
    DepositTxSigned,
    #[n(7)]
    PayoutSigned,
    #[n(8)]
    TradeCancelled,
    #[n(9)]
    DisputeOpened,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    #[n(0)]
    TakeOffer,
    #[n(1)]
    SendAccountData,
    #[n(2)]
    ConfirmFiatSent,
    #[n(3)]
    ConfirmFiatReceipt,
    #[n(4)]
    ConfirmBtcSent,
    #[n(5)]
    ConfirmBtcReceipt,
    #[n(6)]
    SignDeposit,
    #[n(7)]
    SignPayout,
    #[n(8)]
    CancelTrade,
    #[n(9)]
    OpenDispute,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeadlineKind {
    #[n(0)]
    TakeOfferResponse,
    #[n(1)]
    FiatPayment,
    #[n(2)]
    BtcSettlement,
    #[n(3)]
    Deposit,
    #[n(4)]
    Payout,
}

/// A deadline is identified by its kind plus the trade sequence that armed it,
/// so a re-armed deadline never matches an older expiry.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeadlineId {
    #[n(0)]
    pub kind: DeadlineKind,
    #[n(1)]
    pub armed_at: u64,
}

/// The key half of a transition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Message(MessageKind),
    Timeout(DeadlineKind),
    Command(CommandKind),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Message(kind) => write!(f, "message {kind:?}"),
            EventKind::Timeout(kind) => write!(f, "timeout {kind:?}"),
            EventKind::Command(kind) => write!(f, "command {kind:?}"),
        }
    }
}

/// A message received from the counterparty through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub trade_id: String,
    // the sender's own trade sequence when it emitted the message
    pub sequence: u64,
    pub sender: CounterpartyRef,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// An instruction from the local user or wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCommand {
    pub command_id: String,
    pub kind: CommandKind,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl UserCommand {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            command_id: new_command_id(),
            kind,
            payload: vec![],
            signature: vec![],
        }
    }
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
    pub fn with_signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.signature = signature.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Inbound(InboundMessage),
    Timeout(DeadlineId),
    Command(UserCommand),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Inbound(message) => EventKind::Message(message.kind),
            Event::Timeout(id) => EventKind::Timeout(id.kind),
            Event::Command(command) => EventKind::Command(command.kind),
        }
    }
    pub fn command(kind: CommandKind) -> Self {
        Event::Command(UserCommand::new(kind))
    }
    pub fn as_message(&self) -> Option<&InboundMessage> {
        match self {
            Event::Inbound(message) => Some(message),
            _ => None,
        }
    }
    pub fn as_command(&self) -> Option<&UserCommand> {
        match self {
            Event::Command(command) => Some(command),
            _ => None,
        }
    }
}

/// A message the local side asks the transport to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub trade_id: String,
    pub sequence: u64,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl OutboundMessage {
    /// What the counterparty sees once the transport delivered it.
    pub fn into_inbound(self, sender: CounterpartyRef) -> InboundMessage {
        InboundMessage {
            trade_id: self.trade_id,
            sequence: self.sequence,
            sender,
            kind: self.kind,
            payload: self.payload,
            signature: self.signature,
        }
    }
}
