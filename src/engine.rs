//! Protocol engine
//!
//! Validates an event against the trade's transition table and, when every
//! check passes, commits the transition. The order of checks is fixed:
//!
//! 1. a finalized trade refuses everything (`Finalized`)
//! 2. replays are refused before any guard runs (`Duplicate`)
//! 3. no table entry: `InvalidOperation` for user commands,
//!    `NoMatchingTransition` for messages and timeouts
//! 4. guards, in declaration order (`GuardFailed`)
//!
//! Deciding is synchronous and side-effect free. Committing stamps the next
//! sequence number, moves the state and returns the effects as data; sending,
//! timers and persistence are carried out by the caller.

use crate::config::DeadlineSettings;
use crate::crypto::SignatureVerifier;
use crate::error::{ConfigurationError, RejectReason, Rejection};
use crate::event::{DeadlineId, DeadlineKind, Event, EventKind, OutboundMessage};
use crate::protocol::{GuardContext, Outbound, PayloadSource, ProtocolDefinition, Transition};
use crate::registry::ProtocolRegistry;
use crate::snapshot::PersistedSnapshot;
use crate::terms::TradeTerms;
use crate::trade::{CounterpartyRef, ProtocolVariant, TimeStamp, Trade, TradeRole, TradeState};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(OutboundMessage),
    ArmDeadline { id: DeadlineId, after: Duration },
    ClearDeadline(DeadlineKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub trade_id: String,
    pub from: TradeState,
    pub to: TradeState,
    pub sequence: u64,
    pub effects: Vec<Effect>,
    pub finalized: bool,
}

impl Commit {
    pub fn sent(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.effects.iter().filter_map(|effect| match effect {
            Effect::Send(message) => Some(message),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed(Commit),
    Rejected(Rejection),
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed(_))
    }
    pub fn commit(&self) -> Option<&Commit> {
        match self {
            Outcome::Committed(commit) => Some(commit),
            Outcome::Rejected(_) => None,
        }
    }
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Committed(_) => None,
            Outcome::Rejected(rejection) => Some(rejection),
        }
    }
    pub fn reject_reason(&self) -> Option<RejectReason> {
        self.rejection().map(|rejection| rejection.reason)
    }
}

pub struct ProtocolEngine {
    registry: Arc<ProtocolRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    deadlines: DeadlineSettings,
}

impl ProtocolEngine {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
        deadlines: DeadlineSettings,
    ) -> Self {
        Self {
            registry,
            verifier,
            deadlines,
        }
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn deadlines(&self) -> &DeadlineSettings {
        &self.deadlines
    }

    pub fn create_trade(
        &self,
        variant: ProtocolVariant,
        role: TradeRole,
        terms: TradeTerms,
        counterparty: CounterpartyRef,
    ) -> Result<Trade, ConfigurationError> {
        Trade::create(&self.registry, variant, role, terms, counterparty)
    }

    /// Both sides of one trade share an id, so the second side is created
    /// with the id the first one announced.
    pub fn create_trade_with_id(
        &self,
        trade_id: impl Into<String>,
        variant: ProtocolVariant,
        role: TradeRole,
        terms: TradeTerms,
        counterparty: CounterpartyRef,
    ) -> Result<Trade, ConfigurationError> {
        Trade::create_with_id(&self.registry, trade_id, variant, role, terms, counterparty)
    }

    pub fn restore(&self, snapshot: PersistedSnapshot) -> Result<Trade, ConfigurationError> {
        Trade::restore(&self.registry, snapshot)
    }

    pub fn handle_event(&self, trade: &mut Trade, event: &Event) -> Outcome {
        let definition = Arc::clone(trade.definition());
        let transition = match self.select(&definition, trade, event) {
            Ok(transition) => transition,
            Err(rejection) => {
                tracing::warn!(
                    trade_id = trade.id(),
                    state = %trade.state(),
                    event = %event.kind(),
                    reason = %rejection.reason,
                    detail = %rejection.detail,
                    "event rejected"
                );
                return Outcome::Rejected(rejection);
            }
        };

        let commit = self.commit(trade, event, transition);
        tracing::info!(
            trade_id = trade.id(),
            from = %commit.from,
            to = %commit.to,
            sequence = commit.sequence,
            finalized = commit.finalized,
            "transition committed"
        );
        Outcome::Committed(commit)
    }

    /// Picks the transition `event` would take without touching the trade.
    pub fn select<'d>(
        &self,
        definition: &'d ProtocolDefinition,
        trade: &Trade,
        event: &Event,
    ) -> Result<&'d Transition, Rejection> {
        if trade.is_finalized() {
            return Err(Rejection::new(
                RejectReason::Finalized,
                format!("trade {} already ended in {}", trade.id(), trade.state()),
            ));
        }
        check_replay(trade, event)?;

        let kind = event.kind();
        let Some(transition) = definition.lookup(trade.state(), kind) else {
            let reason = match kind {
                EventKind::Command(_) => RejectReason::InvalidOperation,
                EventKind::Message(_) | EventKind::Timeout(_) => RejectReason::NoMatchingTransition,
            };
            return Err(Rejection::new(
                reason,
                format!("{kind} is not accepted in state {}", trade.state()),
            ));
        };

        let ctx = GuardContext {
            verifier: self.verifier.as_ref(),
        };
        for guard in &transition.guards {
            (guard.check)(trade, event, &ctx).map_err(|detail| {
                Rejection::new(RejectReason::GuardFailed, format!("{}: {detail}", guard.name))
            })?;
        }
        Ok(transition)
    }

    fn commit(&self, trade: &mut Trade, event: &Event, transition: &Transition) -> Commit {
        let from = trade.state();
        let sequence = trade.advance(transition.target);

        match event {
            Event::Inbound(message) => trade.record_peer_sequence(message.sequence),
            Event::Command(command) => trade.record_command(&command.command_id),
            Event::Timeout(id) => {
                trade.disarm_deadline(id.kind);
            }
        }

        let mut effects = Vec::new();
        for kind in &transition.clear {
            if trade.disarm_deadline(*kind).is_some() {
                effects.push(Effect::ClearDeadline(*kind));
            }
        }
        if let Some(outbound) = transition.send {
            effects.push(Effect::Send(outbound_message(trade, event, outbound, sequence)));
        }

        let finalized = trade.definition().is_terminal(transition.target);
        if finalized {
            for deadline in trade.finalize() {
                effects.push(Effect::ClearDeadline(deadline.id.kind));
            }
        } else {
            for kind in &transition.arm {
                let after = self.deadlines.duration(*kind);
                let id = DeadlineId {
                    kind: *kind,
                    armed_at: sequence,
                };
                trade.arm_deadline(id, TimeStamp::new().after(after));
                effects.push(Effect::ArmDeadline { id, after });
            }
        }

        Commit {
            trade_id: trade.id().to_owned(),
            from,
            to: transition.target,
            sequence,
            effects,
            finalized,
        }
    }
}

fn check_replay(trade: &Trade, event: &Event) -> Result<(), Rejection> {
    match event {
        Event::Inbound(message) if message.sequence <= trade.last_peer_sequence() => {
            Err(Rejection::new(
                RejectReason::Duplicate,
                format!(
                    "{:?} with sequence {} already consumed (last {})",
                    message.kind,
                    message.sequence,
                    trade.last_peer_sequence()
                ),
            ))
        }
        Event::Command(command) if trade.has_consumed_command(&command.command_id) => {
            Err(Rejection::new(
                RejectReason::Duplicate,
                format!("command {} already consumed", command.command_id),
            ))
        }
        Event::Timeout(id) => match trade.deadline(id.kind) {
            Some(armed) if armed.id == *id => Ok(()),
            _ => Err(Rejection::new(
                RejectReason::Duplicate,
                format!(
                    "deadline {:?} armed at {} is no longer pending",
                    id.kind, id.armed_at
                ),
            )),
        },
        _ => Ok(()),
    }
}

fn outbound_message(
    trade: &Trade,
    event: &Event,
    outbound: Outbound,
    sequence: u64,
) -> OutboundMessage {
    let (payload, signature) = match outbound.payload {
        PayloadSource::Empty => (vec![], vec![]),
        PayloadSource::TermsFingerprint => (trade.terms_fingerprint().as_bytes().to_vec(), vec![]),
        PayloadSource::Command => event
            .as_command()
            .map(|command| (command.payload.clone(), command.signature.clone()))
            .unwrap_or_default(),
    };
    OutboundMessage {
        trade_id: trade.id().to_owned(),
        sequence,
        kind: outbound.kind,
        payload,
        signature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DigestCommitment;
    use crate::event::{CommandKind, UserCommand};
    use crate::terms::{AmountSpec, PaymentMethod, PaymentRail, PriceSpec};

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(
            Arc::new(ProtocolRegistry::standard().unwrap()),
            Arc::new(DigestCommitment),
            DeadlineSettings::default(),
        )
    }

    fn terms() -> TradeTerms {
        TradeTerms::new()
            .set_base_currency("BTC")
            .set_quote_currency("EUR")
            .set_amount(AmountSpec::BaseSideFixed(250_000))
            .set_price(PriceSpec::Market)
            .set_payment_method(PaymentMethod::new(PaymentRail::Sepa, "EUR"))
    }

    fn taker(engine: &ProtocolEngine) -> Trade {
        engine
            .create_trade(
                ProtocolVariant::ReputationFiat,
                TradeRole::BuyerAsTaker,
                terms(),
                CounterpartyRef::new("peer_maker"),
            )
            .unwrap()
    }

    #[test]
    fn take_offer_sends_terms_and_arms_deadline() {
        let engine = engine();
        let mut trade = taker(&engine);

        let outcome = engine.handle_event(&mut trade, &Event::command(CommandKind::TakeOffer));
        let commit = outcome.commit().unwrap();

        assert_eq!(commit.to, TradeState::TakeOfferSent);
        assert_eq!(commit.sequence, 1);
        let sent: Vec<_> = commit.sent().collect();
        assert_eq!(sent[0].payload, trade.terms_fingerprint().as_bytes());
        assert!(commit.effects.iter().any(|e| matches!(
            e,
            Effect::ArmDeadline { id, .. } if id.kind == DeadlineKind::TakeOfferResponse && id.armed_at == 1
        )));
        assert!(trade.deadline(DeadlineKind::TakeOfferResponse).is_some());
    }

    #[test]
    fn repeated_command_id_is_a_duplicate() {
        let engine = engine();
        let mut trade = taker(&engine);
        let command = Event::Command(UserCommand::new(CommandKind::TakeOffer));

        assert!(engine.handle_event(&mut trade, &command).is_committed());
        assert_eq!(
            engine.handle_event(&mut trade, &command).reject_reason(),
            Some(RejectReason::Duplicate)
        );
        assert_eq!(trade.sequence(), 1);
    }

    #[test]
    fn undeclared_command_is_invalid_operation() {
        let engine = engine();
        let mut trade = taker(&engine);

        let outcome = engine.handle_event(&mut trade, &Event::command(CommandKind::ConfirmBtcReceipt));
        assert_eq!(outcome.reject_reason(), Some(RejectReason::InvalidOperation));
        assert_eq!(trade.state(), TradeState::Init);
        assert_eq!(trade.sequence(), 0);
    }

    #[test]
    fn finalized_trade_refuses_everything() {
        let engine = engine();
        let mut trade = taker(&engine);

        let cancel = engine.handle_event(&mut trade, &Event::command(CommandKind::CancelTrade));
        let commit = cancel.commit().unwrap();
        assert!(commit.finalized);
        assert!(trade.is_finalized());

        let outcome = engine.handle_event(&mut trade, &Event::command(CommandKind::TakeOffer));
        assert_eq!(outcome.reject_reason(), Some(RejectReason::Finalized));
    }

    #[test]
    fn stale_timeout_is_refused() {
        let engine = engine();
        let mut trade = taker(&engine);
        engine.handle_event(&mut trade, &Event::command(CommandKind::TakeOffer));

        let stale = Event::Timeout(DeadlineId {
            kind: DeadlineKind::TakeOfferResponse,
            armed_at: 0,
        });
        assert_eq!(
            engine.handle_event(&mut trade, &stale).reject_reason(),
            Some(RejectReason::Duplicate)
        );

        let live = Event::Timeout(DeadlineId {
            kind: DeadlineKind::TakeOfferResponse,
            armed_at: 1,
        });
        let outcome = engine.handle_event(&mut trade, &live);
        assert_eq!(outcome.commit().unwrap().to, TradeState::Failed);
        assert!(trade.is_finalized());
    }
}
