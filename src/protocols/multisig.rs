//! Cooperative 2-of-2 multisig escrow.
//!
//! Both parties lock funds in a jointly signed deposit transaction; after the
//! fiat leg the seller confirms receipt and the buyer finishes the cooperative
//! payout. Only the seller-as-maker and buyer-as-taker tables exist. The other
//! two combinations are declared unimplemented so trade creation rejects them.

use super::{abort_from, cmd, dispute_from, guards, maker_handshake, msg, taker_handshake, timeout};
use crate::error::ConfigurationError;
use crate::event::{CommandKind, DeadlineKind, MessageKind};
use crate::protocol::{DefinitionBuilder, PayloadSource, ProtocolDefinition, Transition};
use crate::trade::{ProtocolVariant, TradeRole, TradeState};

pub const UNIMPLEMENTED_ROLES: [TradeRole; 2] = [TradeRole::BuyerAsMaker, TradeRole::SellerAsTaker];

const ABORTABLE: [TradeState; 3] = [
    TradeState::Init,
    TradeState::TakeOfferSent,
    TradeState::AwaitingDeposit,
];

const DISPUTABLE: [TradeState; 4] = [
    TradeState::DepositConfirmed,
    TradeState::FiatSent,
    TradeState::FiatSentReceived,
    TradeState::FiatReceiptConfirmed,
];

pub fn seller_as_maker() -> Result<ProtocolDefinition, ConfigurationError> {
    let mut builder = DefinitionBuilder::new(
        TradeRole::SellerAsMaker,
        ProtocolVariant::MultisigEscrow,
        guards::ENVELOPE,
    );
    maker_handshake(
        &mut builder,
        TradeState::AwaitingDeposit,
        Some(DeadlineKind::Deposit),
    )?;

    builder
        .on(
            &[TradeState::AwaitingDeposit],
            msg(MessageKind::DepositTxSigned),
            Transition::to(TradeState::DepositConfirmed)
                .guarded(guards::SIGNATURE)
                .clearing(DeadlineKind::Deposit)
                .arming(DeadlineKind::FiatPayment),
        )?
        .on(
            &[TradeState::AwaitingDeposit],
            timeout(DeadlineKind::Deposit),
            Transition::to(TradeState::Failed),
        )?
        .on(
            &[TradeState::DepositConfirmed],
            msg(MessageKind::FiatSent),
            Transition::to(TradeState::FiatSentReceived).clearing(DeadlineKind::FiatPayment),
        )?
        // funds are locked at this point, so a silent buyer means dispute
        .on(
            &[TradeState::DepositConfirmed],
            timeout(DeadlineKind::FiatPayment),
            Transition::to(TradeState::Disputed),
        )?
        .on(
            &[TradeState::FiatSentReceived],
            cmd(CommandKind::ConfirmFiatReceipt),
            // payload is the seller's partial payout signature
            Transition::to(TradeState::FiatReceiptConfirmed)
                .guarded(guards::COMMAND_PAYLOAD)
                .sending(MessageKind::FiatReceiptConfirmed, PayloadSource::Command)
                .arming(DeadlineKind::Payout),
        )?
        // declared wherever it could plausibly arrive so that early delivery
        // is reported by the guards instead of as an unknown message
        .on(
            &[
                TradeState::AwaitingDeposit,
                TradeState::DepositConfirmed,
                TradeState::FiatSentReceived,
                TradeState::FiatReceiptConfirmed,
            ],
            msg(MessageKind::PayoutSigned),
            Transition::to(TradeState::Completed)
                .guarded(guards::DEPOSIT_CONFIRMED)
                .guarded(guards::FIAT_RECEIPT_CONFIRMED)
                .guarded(guards::SIGNATURE)
                .clearing(DeadlineKind::Payout),
        )?
        .on(
            &[TradeState::FiatReceiptConfirmed],
            timeout(DeadlineKind::Payout),
            Transition::to(TradeState::Disputed),
        )?;

    abort_from(&mut builder, &ABORTABLE)?;
    dispute_from(&mut builder, &DISPUTABLE)?;
    Ok(builder.build())
}

pub fn buyer_as_taker() -> Result<ProtocolDefinition, ConfigurationError> {
    let mut builder = DefinitionBuilder::new(
        TradeRole::BuyerAsTaker,
        ProtocolVariant::MultisigEscrow,
        guards::ENVELOPE,
    );
    taker_handshake(
        &mut builder,
        TradeState::AwaitingDeposit,
        Some(DeadlineKind::Deposit),
    )?;

    builder
        .on(
            &[TradeState::AwaitingDeposit],
            cmd(CommandKind::SignDeposit),
            Transition::to(TradeState::DepositConfirmed)
                .guarded(guards::COMMAND_PAYLOAD)
                .guarded(guards::COMMAND_SIGNED)
                .sending(MessageKind::DepositTxSigned, PayloadSource::Command)
                .clearing(DeadlineKind::Deposit),
        )?
        .on(
            &[TradeState::AwaitingDeposit],
            timeout(DeadlineKind::Deposit),
            Transition::to(TradeState::Failed),
        )?
        .on(
            &[TradeState::DepositConfirmed],
            cmd(CommandKind::ConfirmFiatSent),
            Transition::to(TradeState::FiatSent)
                .sending(MessageKind::FiatSent, PayloadSource::Command)
                .arming(DeadlineKind::Payout),
        )?
        .on(
            &[TradeState::FiatSent],
            msg(MessageKind::FiatReceiptConfirmed),
            Transition::to(TradeState::FiatReceiptConfirmed)
                .guarded(guards::MESSAGE_PAYLOAD)
                .clearing(DeadlineKind::Payout),
        )?
        .on(
            &[TradeState::FiatSent],
            timeout(DeadlineKind::Payout),
            Transition::to(TradeState::Disputed),
        )?
        .on(
            &[TradeState::FiatReceiptConfirmed],
            cmd(CommandKind::SignPayout),
            Transition::to(TradeState::Completed)
                .guarded(guards::COMMAND_PAYLOAD)
                .guarded(guards::COMMAND_SIGNED)
                .sending(MessageKind::PayoutSigned, PayloadSource::Command),
        )?;

    abort_from(&mut builder, &ABORTABLE)?;
    dispute_from(&mut builder, &DISPUTABLE)?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn payout_is_declared_before_deposit_confirmation() {
        let definition = seller_as_maker().unwrap();
        let transition = definition
            .lookup(
                TradeState::AwaitingDeposit,
                EventKind::Message(MessageKind::PayoutSigned),
            )
            .unwrap();
        let names: Vec<_> = transition.guards.iter().map(|g| g.name).collect();

        assert_eq!(
            names,
            ["envelope", "deposit-confirmed", "fiat-receipt-confirmed", "signature"]
        );
    }

    #[test]
    fn tables_differ_per_role() {
        assert_ne!(
            seller_as_maker().unwrap().fingerprint(),
            buyer_as_taker().unwrap().fingerprint()
        );
    }
}
