//! Versioned persisted form of a trade
use crate::error::StoreError;
use crate::terms::TradeTerms;
use crate::trade::{CounterpartyRef, Deadline, ProtocolVariant, TimeStamp, TradeRole, TradeState};
use chrono::Utc;

pub const SNAPSHOT_VERSION: u32 = 1;

// Map encoding keyed by field index, so a later version can add fields (as
// `Option`s) and still decode records written by this one. Records carrying
// a newer version are refused by `decode` rather than read partially.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
#[cbor(map)]
pub struct PersistedSnapshot {
    #[n(0)]
    pub version: u32,
    #[n(1)]
    pub trade_id: String,
    #[n(2)]
    pub role: TradeRole,
    #[n(3)]
    pub variant: ProtocolVariant,
    #[n(4)]
    pub state: TradeState,
    #[n(5)]
    pub sequence: u64,
    #[n(6)]
    pub terms: TradeTerms,
    #[n(7)]
    pub counterparty: CounterpartyRef,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
    #[n(10)]
    pub finalized: bool,
    #[n(11)]
    pub last_peer_sequence: u64,
    #[n(12)]
    pub consumed_commands: Vec<String>,
    #[n(13)]
    pub deadlines: Vec<Deadline>,
    #[n(14)]
    pub definition_fingerprint: String,
}

impl PersistedSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        minicbor::to_vec(self).map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let snapshot: PersistedSnapshot = minicbor::decode(bytes)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: snapshot.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }
}
