use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use trade_protocol::config::NodeConfig;
use trade_protocol::registry::ProtocolRegistry;
use trade_protocol::store::{SledBackend, TradeStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,trade_protocol=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("trade-node.toml"));
    let config = NodeConfig::load_or_default(&config_path);

    let registry = ProtocolRegistry::standard()?;
    for (role, variant) in registry.supported() {
        tracing::debug!(%role, %variant, "protocol registered");
    }

    let backend = SledBackend::open(&config.store.path)?;
    let store = TradeStore::open(Arc::new(backend));
    let snapshots = store.load_all().await?;
    tracing::info!(path = %config.store.path.display(), trades = snapshots.len(), "store opened");

    for snapshot in snapshots {
        let trade_id = snapshot.trade_id.clone();
        match trade_protocol::Trade::restore(&registry, snapshot) {
            Ok(trade) => {
                let deadlines: Vec<String> = trade
                    .deadlines()
                    .map(|d| format!("{:?}@{}", d.id.kind, d.expires_at.to_datetime_utc()))
                    .collect();
                tracing::info!(
                    trade_id = trade.id(),
                    role = %trade.role(),
                    variant = %trade.variant(),
                    state = %trade.state(),
                    sequence = trade.sequence(),
                    finalized = trade.is_finalized(),
                    deadlines = ?deadlines,
                    "trade"
                );
            }
            Err(e) => tracing::error!(%trade_id, error = %e, "cannot restore trade"),
        }
    }

    store.close().await;
    Ok(())
}
