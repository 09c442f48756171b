//! Transition tables
//!
//! A [`ProtocolDefinition`] maps `(state, event kind)` to a [`Transition`]:
//! a target state, the guards that must hold, and a declarative description
//! of the effect (message to send, deadlines to arm or clear). Definitions
//! are plain data built once per (role, variant) and shared by every trade
//! using that combination. The table is a `BTreeMap`, so iteration order and
//! the derived fingerprint are identical across process runs.

use crate::crypto::SignatureVerifier;
use crate::error::ConfigurationError;
use crate::event::{DeadlineKind, Event, EventKind, MessageKind};
use crate::trade::{ProtocolVariant, Trade, TradeRole, TradeState};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// What guards may consult besides the trade and the event.
pub struct GuardContext<'a> {
    pub verifier: &'a dyn SignatureVerifier,
}

/// Pure predicate. `Err` carries the diagnostic shown to the user.
pub type GuardFn = fn(&Trade, &Event, &GuardContext<'_>) -> Result<(), String>;

#[derive(Clone, Copy)]
pub struct Guard {
    pub name: &'static str,
    pub check: GuardFn,
}

impl Guard {
    pub const fn new(name: &'static str, check: GuardFn) -> Self {
        Self { name, check }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Where the body of an outbound message comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Empty,
    // the trade's terms fingerprint, as utf-8 hex
    TermsFingerprint,
    // payload and signature of the command that triggered the transition
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outbound {
    pub kind: MessageKind,
    pub payload: PayloadSource,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub target: TradeState,
    pub guards: Vec<Guard>,
    pub send: Option<Outbound>,
    pub arm: Vec<DeadlineKind>,
    pub clear: Vec<DeadlineKind>,
}

impl Transition {
    pub fn to(target: TradeState) -> Self {
        Self {
            target,
            guards: vec![],
            send: None,
            arm: vec![],
            clear: vec![],
        }
    }
    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }
    pub fn sending(mut self, kind: MessageKind, payload: PayloadSource) -> Self {
        self.send = Some(Outbound { kind, payload });
        self
    }
    pub fn arming(mut self, kind: DeadlineKind) -> Self {
        self.arm.push(kind);
        self
    }
    pub fn clearing(mut self, kind: DeadlineKind) -> Self {
        self.clear.push(kind);
        self
    }
}

pub struct ProtocolDefinition {
    role: TradeRole,
    variant: ProtocolVariant,
    initial: TradeState,
    transitions: BTreeMap<(TradeState, EventKind), Transition>,
    fingerprint: String,
}

impl ProtocolDefinition {
    pub fn role(&self) -> TradeRole {
        self.role
    }
    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }
    pub fn initial_state(&self) -> TradeState {
        self.initial
    }
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn lookup(&self, state: TradeState, event: EventKind) -> Option<&Transition> {
        self.transitions.get(&(state, event))
    }

    /// A state is terminal when the table declares no way out of it.
    pub fn is_terminal(&self, state: TradeState) -> bool {
        !self.transitions.keys().any(|(from, _)| *from == state)
    }

    /// Event kinds accepted in `state`, in table order.
    pub fn accepted_events(&self, state: TradeState) -> Vec<EventKind> {
        self.transitions
            .keys()
            .filter(|(from, _)| *from == state)
            .map(|(_, event)| *event)
            .collect()
    }

    pub fn transitions(&self) -> impl Iterator<Item = (&(TradeState, EventKind), &Transition)> {
        self.transitions.iter()
    }
}

impl fmt::Debug for ProtocolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDefinition")
            .field("role", &self.role)
            .field("variant", &self.variant)
            .field("transitions", &self.transitions.len())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Collects transitions for one (role, variant) and freezes them into a
/// [`ProtocolDefinition`]. Transitions on inbound messages get the envelope
/// guard (`guards::envelope`) prepended automatically.
pub struct DefinitionBuilder {
    role: TradeRole,
    variant: ProtocolVariant,
    initial: TradeState,
    transitions: BTreeMap<(TradeState, EventKind), Transition>,
    envelope: Guard,
}

impl DefinitionBuilder {
    pub fn new(role: TradeRole, variant: ProtocolVariant, envelope: Guard) -> Self {
        Self {
            role,
            variant,
            initial: TradeState::Init,
            transitions: BTreeMap::new(),
            envelope,
        }
    }

    /// Declares `transition` for `event` from each of `from`.
    pub fn on(
        &mut self,
        from: &[TradeState],
        event: EventKind,
        transition: Transition,
    ) -> Result<&mut Self, ConfigurationError> {
        let mut transition = transition;
        if matches!(event, EventKind::Message(_)) {
            transition.guards.insert(0, self.envelope);
        }
        for state in from {
            if self.transitions.contains_key(&(*state, event)) {
                return Err(ConfigurationError::ConflictingTransition {
                    state: state.to_string(),
                    event: event.to_string(),
                });
            }
            self.transitions.insert((*state, event), transition.clone());
        }
        Ok(self)
    }

    pub fn build(self) -> ProtocolDefinition {
        let fingerprint = fingerprint(self.role, self.variant, self.initial, &self.transitions);
        ProtocolDefinition {
            role: self.role,
            variant: self.variant,
            initial: self.initial,
            transitions: self.transitions,
            fingerprint,
        }
    }
}

fn fingerprint(
    role: TradeRole,
    variant: ProtocolVariant,
    initial: TradeState,
    transitions: &BTreeMap<(TradeState, EventKind), Transition>,
) -> String {
    let mut canonical = format!("{role:?}/{variant:?}/{initial:?}\n");
    for ((from, event), transition) in transitions {
        // writing into a String cannot fail
        let _ = writeln!(
            canonical,
            "{from:?}|{event:?}->{:?}|{:?}|{:?}|{:?}|{:?}",
            transition.target, transition.guards, transition.send, transition.arm, transition.clear
        );
    }
    sha256::digest(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CommandKind;

    fn pass(_: &Trade, _: &Event, _: &GuardContext<'_>) -> Result<(), String> {
        Ok(())
    }

    const ENVELOPE: Guard = Guard::new("envelope", pass);

    fn sample() -> DefinitionBuilder {
        let mut builder = DefinitionBuilder::new(
            TradeRole::BuyerAsTaker,
            ProtocolVariant::ReputationFiat,
            ENVELOPE,
        );
        builder
            .on(
                &[TradeState::Init],
                EventKind::Command(CommandKind::TakeOffer),
                Transition::to(TradeState::TakeOfferSent),
            )
            .unwrap()
            .on(
                &[TradeState::TakeOfferSent],
                EventKind::Message(MessageKind::TakeOfferResponse),
                Transition::to(TradeState::OfferAccepted),
            )
            .unwrap();
        builder
    }

    #[test]
    fn message_transitions_get_envelope_guard() {
        let definition = sample().build();
        let transition = definition
            .lookup(
                TradeState::TakeOfferSent,
                EventKind::Message(MessageKind::TakeOfferResponse),
            )
            .unwrap();
        assert_eq!(transition.guards[0].name, "envelope");

        let command = definition
            .lookup(TradeState::Init, EventKind::Command(CommandKind::TakeOffer))
            .unwrap();
        assert!(command.guards.is_empty());
    }

    #[test]
    fn conflicting_declarations_are_configuration_errors() {
        let mut builder = sample();
        let result = builder.on(
            &[TradeState::Init],
            EventKind::Command(CommandKind::TakeOffer),
            Transition::to(TradeState::Cancelled),
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::ConflictingTransition { .. })
        ));
    }

    #[test]
    fn terminal_states_have_no_way_out() {
        let definition = sample().build();
        assert!(!definition.is_terminal(TradeState::Init));
        assert!(definition.is_terminal(TradeState::OfferAccepted));
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(sample().build().fingerprint(), sample().build().fingerprint());
    }
}
