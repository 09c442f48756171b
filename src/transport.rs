//! Network transport seam and an in-process loopback
use crate::dispatcher::Dispatcher;
use crate::error::TransportError;
use crate::event::{Event, InboundMessage, OutboundMessage};
use crate::trade::CounterpartyRef;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub trade_id: String,
    pub sequence: u64,
}

/// Delivers outbound messages to the counterparty. Connection handling and
/// retries below the message level are the implementation's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, trade_id: &str, message: OutboundMessage) -> Result<DeliveryAck, TransportError>;
}

/// Hands every sent message, stamped with the local identity, to an
/// unbounded outbox that another node consumes.
pub struct LoopbackTransport {
    local: CounterpartyRef,
    outbox: mpsc::UnboundedSender<InboundMessage>,
    reachable: AtomicBool,
    sent: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(local: CounterpartyRef) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (outbox, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local,
            outbox,
            reachable: AtomicBool::new(true),
            sent: AtomicU64::new(0),
        });
        (transport, receiver)
    }

    pub fn local(&self) -> &CounterpartyRef {
        &self.local
    }

    /// Messages delivered so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// While unreachable every send fails without delivering.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, trade_id: &str, message: OutboundMessage) -> Result<DeliveryAck, TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(format!("loopback peer of {}", self.local)));
        }
        let ack = DeliveryAck {
            trade_id: trade_id.to_owned(),
            sequence: message.sequence,
        };
        self.outbox
            .send(message.into_inbound(self.local.clone()))
            .map_err(|_| TransportError::Refused("loopback outbox closed".to_string()))?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(ack)
    }
}

/// Feeds everything arriving on `inbox` into `dispatcher`, in arrival order.
///
/// Messages are handed over one at a time, so a trade whose mailbox is full
/// holds back the messages of every other trade behind it until it drains.
pub fn forward(
    mut inbox: mpsc::UnboundedReceiver<InboundMessage>,
    dispatcher: Dispatcher,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            let trade_id = message.trade_id.clone();
            if let Err(e) = dispatcher.dispatch(&trade_id, Event::Inbound(message)).await {
                tracing::warn!(%trade_id, error = %e, "inbound message dropped");
            }
        }
    })
}
