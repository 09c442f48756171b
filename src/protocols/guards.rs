//! Guards shared by the built-in protocols
use crate::event::{Event, InboundMessage, UserCommand};
use crate::protocol::{Guard, GuardContext};
use crate::trade::{Trade, TradeState};

/// Prepended to every inbound-message transition.
pub const ENVELOPE: Guard = Guard::new("envelope", envelope);
pub const TERMS_MATCH: Guard = Guard::new("terms-match", terms_match);
pub const SIGNATURE: Guard = Guard::new("signature", signature);
pub const MESSAGE_PAYLOAD: Guard = Guard::new("message-payload", message_payload);
pub const COMMAND_PAYLOAD: Guard = Guard::new("command-payload", command_payload);
pub const COMMAND_SIGNED: Guard = Guard::new("command-signed", command_signed);
pub const DEPOSIT_CONFIRMED: Guard = Guard::new("deposit-confirmed", deposit_confirmed);
pub const FIAT_RECEIPT_CONFIRMED: Guard =
    Guard::new("fiat-receipt-confirmed", fiat_receipt_confirmed);

fn message(event: &Event) -> Result<&InboundMessage, String> {
    event
        .as_message()
        .ok_or_else(|| "expected an inbound message".to_string())
}

fn command(event: &Event) -> Result<&UserCommand, String> {
    event
        .as_command()
        .ok_or_else(|| "expected a user command".to_string())
}

fn envelope(trade: &Trade, event: &Event, _: &GuardContext<'_>) -> Result<(), String> {
    let message = message(event)?;
    if message.trade_id != trade.id() {
        return Err(format!(
            "message references trade {} but was routed to {}",
            message.trade_id,
            trade.id()
        ));
    }
    if &message.sender != trade.counterparty() {
        return Err(format!(
            "sender {} is not the reserved counterparty {}",
            message.sender,
            trade.counterparty()
        ));
    }
    Ok(())
}

fn terms_match(trade: &Trade, event: &Event, _: &GuardContext<'_>) -> Result<(), String> {
    let message = message(event)?;
    if message.payload != trade.terms_fingerprint().as_bytes() {
        return Err("taker committed to different terms".to_string());
    }
    Ok(())
}

fn signature(_: &Trade, event: &Event, ctx: &GuardContext<'_>) -> Result<(), String> {
    let message = message(event)?;
    if !ctx
        .verifier
        .verify(&message.sender, &message.payload, &message.signature)
    {
        return Err(format!("{:?} carries an invalid signature", message.kind));
    }
    Ok(())
}

fn message_payload(_: &Trade, event: &Event, _: &GuardContext<'_>) -> Result<(), String> {
    if message(event)?.payload.is_empty() {
        return Err("message payload is empty".to_string());
    }
    Ok(())
}

fn command_payload(_: &Trade, event: &Event, _: &GuardContext<'_>) -> Result<(), String> {
    if command(event)?.payload.is_empty() {
        return Err("command requires a payload".to_string());
    }
    Ok(())
}

fn command_signed(_: &Trade, event: &Event, _: &GuardContext<'_>) -> Result<(), String> {
    if command(event)?.signature.is_empty() {
        return Err("command requires a wallet signature".to_string());
    }
    Ok(())
}

fn deposit_confirmed(trade: &Trade, _: &Event, _: &GuardContext<'_>) -> Result<(), String> {
    match trade.state() {
        TradeState::DepositConfirmed
        | TradeState::FiatSent
        | TradeState::FiatSentReceived
        | TradeState::FiatReceiptConfirmed => Ok(()),
        state => Err(format!("deposit transaction is not confirmed yet (state {state})")),
    }
}

fn fiat_receipt_confirmed(trade: &Trade, _: &Event, _: &GuardContext<'_>) -> Result<(), String> {
    if trade.state() != TradeState::FiatReceiptConfirmed {
        return Err(format!(
            "fiat receipt is not confirmed yet (state {})",
            trade.state()
        ));
    }
    Ok(())
}
