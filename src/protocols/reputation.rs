//! Fiat-rail trades secured by the buyer's reputation.
//!
//! The seller shares payment account data, the buyer pays over the fiat rail
//! and the seller releases BTC once the fiat arrived. All four role
//! combinations are supported; maker/taker only changes the handshake and
//! buyer/seller the settlement half of the table.

use super::{abort_from, cmd, dispute_from, guards, maker_handshake, msg, taker_handshake, timeout};
use crate::error::ConfigurationError;
use crate::event::{CommandKind, DeadlineKind, MessageKind};
use crate::protocol::{DefinitionBuilder, PayloadSource, ProtocolDefinition, Transition};
use crate::trade::{ProtocolVariant, TradeRole, TradeState};

const PRE_PAYMENT: [TradeState; 5] = [
    TradeState::Init,
    TradeState::TakeOfferSent,
    TradeState::OfferAccepted,
    TradeState::AccountDataSent,
    TradeState::AccountDataReceived,
];

const POST_PAYMENT: [TradeState; 4] = [
    TradeState::FiatSent,
    TradeState::FiatSentReceived,
    TradeState::FiatReceiptConfirmed,
    TradeState::BtcSentReceived,
];

pub fn definition(role: TradeRole) -> Result<ProtocolDefinition, ConfigurationError> {
    let mut builder = DefinitionBuilder::new(role, ProtocolVariant::ReputationFiat, guards::ENVELOPE);

    if role.is_maker() {
        maker_handshake(&mut builder, TradeState::OfferAccepted, None)?;
    } else {
        taker_handshake(&mut builder, TradeState::OfferAccepted, None)?;
    }

    if role.is_buyer() {
        buyer_settlement(&mut builder)?;
    } else {
        seller_settlement(&mut builder)?;
    }

    abort_from(&mut builder, &PRE_PAYMENT)?;
    dispute_from(&mut builder, &POST_PAYMENT)?;

    Ok(builder.build())
}

fn seller_settlement(builder: &mut DefinitionBuilder) -> Result<(), ConfigurationError> {
    builder
        .on(
            &[TradeState::OfferAccepted],
            cmd(CommandKind::SendAccountData),
            Transition::to(TradeState::AccountDataSent)
                .guarded(guards::COMMAND_PAYLOAD)
                .sending(MessageKind::AccountData, PayloadSource::Command)
                .arming(DeadlineKind::FiatPayment),
        )?
        .on(
            &[TradeState::AccountDataSent],
            msg(MessageKind::FiatSent),
            Transition::to(TradeState::FiatSentReceived).clearing(DeadlineKind::FiatPayment),
        )?
        .on(
            &[TradeState::AccountDataSent],
            timeout(DeadlineKind::FiatPayment),
            Transition::to(TradeState::Failed),
        )?
        .on(
            &[TradeState::FiatSentReceived],
            cmd(CommandKind::ConfirmFiatReceipt),
            Transition::to(TradeState::FiatReceiptConfirmed)
                .sending(MessageKind::FiatReceiptConfirmed, PayloadSource::Empty),
        )?
        .on(
            &[TradeState::FiatReceiptConfirmed],
            cmd(CommandKind::ConfirmBtcSent),
            // payload is the settlement transaction id
            Transition::to(TradeState::Completed)
                .guarded(guards::COMMAND_PAYLOAD)
                .sending(MessageKind::BtcSent, PayloadSource::Command),
        )?;
    Ok(())
}

fn buyer_settlement(builder: &mut DefinitionBuilder) -> Result<(), ConfigurationError> {
    builder
        .on(
            &[TradeState::OfferAccepted],
            msg(MessageKind::AccountData),
            Transition::to(TradeState::AccountDataReceived).guarded(guards::MESSAGE_PAYLOAD),
        )?
        .on(
            &[TradeState::AccountDataReceived],
            cmd(CommandKind::ConfirmFiatSent),
            Transition::to(TradeState::FiatSent)
                .sending(MessageKind::FiatSent, PayloadSource::Command)
                .arming(DeadlineKind::BtcSettlement),
        )?
        .on(
            &[TradeState::FiatSent],
            msg(MessageKind::FiatReceiptConfirmed),
            Transition::to(TradeState::FiatReceiptConfirmed),
        )?
        // the receipt confirmation may be lost; BtcSent alone is enough
        .on(
            &[TradeState::FiatSent, TradeState::FiatReceiptConfirmed],
            msg(MessageKind::BtcSent),
            Transition::to(TradeState::BtcSentReceived)
                .guarded(guards::MESSAGE_PAYLOAD)
                .clearing(DeadlineKind::BtcSettlement),
        )?
        .on(
            &[TradeState::FiatSent, TradeState::FiatReceiptConfirmed],
            timeout(DeadlineKind::BtcSettlement),
            Transition::to(TradeState::Disputed),
        )?
        .on(
            &[TradeState::BtcSentReceived],
            cmd(CommandKind::ConfirmBtcReceipt),
            Transition::to(TradeState::Completed),
        )?;
    Ok(())
}
