//! Node configuration.
//!
//! Loaded from a TOML file; every section and field has a default so a
//! partial (or missing) file still yields a usable configuration.

use crate::event::DeadlineKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub deadlines: DeadlineSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory of the sled database
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSettings {
    /// Queued events per trade before senders wait
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Notices buffered per subscriber before it lags
    #[serde(default = "default_notice_capacity")]
    pub notice_capacity: usize,
    /// How often a worker re-schedules its snapshot after failed writes
    #[serde(default = "default_persist_retry_limit")]
    pub persist_retry_limit: u32,
}

/// Deadline lengths in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadlineSettings {
    #[serde(default = "default_take_offer_response")]
    pub take_offer_response_secs: u64,
    #[serde(default = "default_fiat_payment")]
    pub fiat_payment_secs: u64,
    #[serde(default = "default_btc_settlement")]
    pub btc_settlement_secs: u64,
    #[serde(default = "default_deposit")]
    pub deposit_secs: u64,
    #[serde(default = "default_payout")]
    pub payout_secs: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/trades")
}
fn default_mailbox_capacity() -> usize {
    64
}
fn default_notice_capacity() -> usize {
    256
}
fn default_persist_retry_limit() -> u32 {
    1
}
fn default_take_offer_response() -> u64 {
    120
}
fn default_fiat_payment() -> u64 {
    24 * 3600
}
fn default_btc_settlement() -> u64 {
    24 * 3600
}
fn default_deposit() -> u64 {
    3600
}
fn default_payout() -> u64 {
    48 * 3600
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            notice_capacity: default_notice_capacity(),
            persist_retry_limit: default_persist_retry_limit(),
        }
    }
}

impl Default for DeadlineSettings {
    fn default() -> Self {
        Self {
            take_offer_response_secs: default_take_offer_response(),
            fiat_payment_secs: default_fiat_payment(),
            btc_settlement_secs: default_btc_settlement(),
            deposit_secs: default_deposit(),
            payout_secs: default_payout(),
        }
    }
}

impl DeadlineSettings {
    pub fn duration(&self, kind: DeadlineKind) -> Duration {
        let secs = match kind {
            DeadlineKind::TakeOfferResponse => self.take_offer_response_secs,
            DeadlineKind::FiatPayment => self.fiat_payment_secs,
            DeadlineKind::BtcSettlement => self.btc_settlement_secs,
            DeadlineKind::Deposit => self.deposit_secs,
            DeadlineKind::Payout => self.payout_secs,
        };
        Duration::from_secs(secs)
    }
}

impl NodeConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Like [`NodeConfig::load`] but falls back to defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config");
                config
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "no usable config, using defaults");
                Self::default()
            }
        }
    }
}
