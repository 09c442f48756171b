//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode it using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// A fresh `trade_1...` identifier.
pub fn new_trade_id() -> String {
    encode_fixed("trade_")
}

/// A fresh `peer_1...` identity handle.
pub fn new_peer_id() -> String {
    encode_fixed("peer_")
}

/// A fresh command id. Plain uuid7 text, unique per issued command.
pub fn new_command_id() -> String {
    uuid7().to_string()
}

// the prefixes above are constant and valid, encoding 16 bytes cannot overflow
fn encode_fixed(prefix: &'static str) -> String {
    match new_uuid_to_bech32(prefix) {
        Ok(id) => id,
        Err(_) => format!("{prefix}{}", uuid7()),
    }
}
