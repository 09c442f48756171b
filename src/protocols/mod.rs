//! Built-in transition tables and the building blocks they share
pub mod guards;
pub mod multisig;
pub mod reputation;

use crate::error::ConfigurationError;
use crate::event::{CommandKind, DeadlineKind, EventKind, MessageKind};
use crate::protocol::{DefinitionBuilder, PayloadSource, Transition};
use crate::trade::TradeState;

pub(crate) fn msg(kind: MessageKind) -> EventKind {
    EventKind::Message(kind)
}

pub(crate) fn cmd(kind: CommandKind) -> EventKind {
    EventKind::Command(kind)
}

pub(crate) fn timeout(kind: DeadlineKind) -> EventKind {
    EventKind::Timeout(kind)
}

/// Taker side: commit to the terms, wait for the maker's answer.
pub(crate) fn taker_handshake(
    builder: &mut DefinitionBuilder,
    accepted: TradeState,
    arm_on_accept: Option<DeadlineKind>,
) -> Result<(), ConfigurationError> {
    let mut on_response =
        Transition::to(accepted).clearing(DeadlineKind::TakeOfferResponse);
    if let Some(kind) = arm_on_accept {
        on_response = on_response.arming(kind);
    }

    builder
        .on(
            &[TradeState::Init],
            cmd(CommandKind::TakeOffer),
            Transition::to(TradeState::TakeOfferSent)
                .sending(MessageKind::TakeOfferRequest, PayloadSource::TermsFingerprint)
                .arming(DeadlineKind::TakeOfferResponse),
        )?
        .on(
            &[TradeState::TakeOfferSent],
            msg(MessageKind::TakeOfferResponse),
            on_response,
        )?
        .on(
            &[TradeState::TakeOfferSent],
            timeout(DeadlineKind::TakeOfferResponse),
            Transition::to(TradeState::Failed),
        )?;
    Ok(())
}

/// Maker side: accept a take-offer request that commits to our terms.
pub(crate) fn maker_handshake(
    builder: &mut DefinitionBuilder,
    accepted: TradeState,
    arm_on_accept: Option<DeadlineKind>,
) -> Result<(), ConfigurationError> {
    let mut on_request = Transition::to(accepted)
        .guarded(guards::TERMS_MATCH)
        .sending(MessageKind::TakeOfferResponse, PayloadSource::Empty);
    if let Some(kind) = arm_on_accept {
        on_request = on_request.arming(kind);
    }

    builder.on(
        &[TradeState::Init],
        msg(MessageKind::TakeOfferRequest),
        on_request,
    )?;
    Ok(())
}

/// Either side may walk away while no payment has moved.
pub(crate) fn abort_from(
    builder: &mut DefinitionBuilder,
    states: &[TradeState],
) -> Result<(), ConfigurationError> {
    builder
        .on(
            states,
            cmd(CommandKind::CancelTrade),
            Transition::to(TradeState::Cancelled)
                .sending(MessageKind::TradeCancelled, PayloadSource::Empty),
        )?
        .on(
            states,
            msg(MessageKind::TradeCancelled),
            Transition::to(TradeState::Cancelled),
        )?;
    Ok(())
}

/// Once value is in flight the only way out besides completion is a dispute.
pub(crate) fn dispute_from(
    builder: &mut DefinitionBuilder,
    states: &[TradeState],
) -> Result<(), ConfigurationError> {
    builder
        .on(
            states,
            cmd(CommandKind::OpenDispute),
            Transition::to(TradeState::Disputed)
                .sending(MessageKind::DisputeOpened, PayloadSource::Command),
        )?
        .on(
            states,
            msg(MessageKind::DisputeOpened),
            Transition::to(TradeState::Disputed),
        )?;
    Ok(())
}
