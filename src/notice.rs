//! Trade notices for external observers
use crate::error::{PersistenceFailure, Rejection, TransportError};
use crate::event::DeadlineId;
use crate::trade::TradeState;
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    StateChanged { from: TradeState, to: TradeState },
    // the trade reached a terminal state and accepts nothing further
    Finalized(TradeState),
    Rejected(Rejection),
    PersistenceFailed(PersistenceFailure),
    DeliveryFailed(TransportError),
    DeadlineExpired(DeadlineId),
}

/// One human readable record, always tied to a trade id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeNotice {
    pub trade_id: String,
    // trade sequence when the notice was raised
    pub sequence: u64,
    pub kind: NoticeKind,
}

impl fmt::Display for TradeNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} #{}] ", self.trade_id, self.sequence)?;
        match &self.kind {
            NoticeKind::StateChanged { from, to } => write!(f, "state changed {from} -> {to}"),
            NoticeKind::Finalized(state) => write!(f, "trade finished in {state}"),
            NoticeKind::Rejected(rejection) => write!(f, "event rejected: {rejection}"),
            NoticeKind::PersistenceFailed(failure) => write!(f, "{failure}"),
            NoticeKind::DeliveryFailed(e) => write!(f, "delivery failed: {e}"),
            NoticeKind::DeadlineExpired(id) => {
                write!(f, "deadline {:?} armed at #{} expired", id.kind, id.armed_at)
            }
        }
    }
}

/// Publish-subscribe fan-out of notices. Publishing never blocks; a slow
/// subscriber loses the oldest notices instead of stalling workers.
#[derive(Clone)]
pub struct NoticeBus {
    sender: broadcast::Sender<TradeNotice>,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, notice: TradeNotice) {
        tracing::trace!(%notice, "notice");
        // no subscribers is fine
        let _ = self.sender.send(notice);
    }

    pub fn subscribe(&self, trade_id: impl Into<String>) -> TradeSubscription {
        TradeSubscription {
            trade_id: Some(trade_id.into()),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscribe_all(&self) -> TradeSubscription {
        TradeSubscription {
            trade_id: None,
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct TradeSubscription {
    trade_id: Option<String>,
    receiver: broadcast::Receiver<TradeNotice>,
}

impl TradeSubscription {
    /// Next notice for the followed trade, `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<TradeNotice> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) if self.matches(&notice) => return Some(notice),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, trade_id = ?self.trade_id, "notice subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Like [`TradeSubscription::recv`] without waiting.
    pub fn try_recv(&mut self) -> Option<TradeNotice> {
        loop {
            match self.receiver.try_recv() {
                Ok(notice) if self.matches(&notice) => return Some(notice),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, notice: &TradeNotice) -> bool {
        self.trade_id
            .as_deref()
            .is_none_or(|trade_id| trade_id == notice.trade_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;

    fn notice(trade_id: &str, sequence: u64) -> TradeNotice {
        TradeNotice {
            trade_id: trade_id.into(),
            sequence,
            kind: NoticeKind::StateChanged {
                from: TradeState::Init,
                to: TradeState::TakeOfferSent,
            },
        }
    }

    #[tokio::test]
    async fn subscription_follows_one_trade() {
        let bus = NoticeBus::new(16);
        let mut only_a = bus.subscribe("trade_a");
        let mut everything = bus.subscribe_all();

        bus.publish(notice("trade_b", 1));
        bus.publish(notice("trade_a", 1));

        assert_eq!(only_a.recv().await.unwrap().trade_id, "trade_a");
        assert_eq!(everything.recv().await.unwrap().trade_id, "trade_b");
        assert_eq!(everything.recv().await.unwrap().trade_id, "trade_a");
        assert!(only_a.try_recv().is_none());
    }

    #[test]
    fn notices_read_as_text() {
        let rejected = TradeNotice {
            trade_id: "trade_x".into(),
            sequence: 4,
            kind: NoticeKind::Rejected(Rejection::new(
                RejectReason::GuardFailed,
                "signature: PayoutSigned carries an invalid signature",
            )),
        };
        assert_eq!(
            rejected.to_string(),
            "[trade_x #4] event rejected: guard failed: signature: PayoutSigned carries an invalid signature"
        );
    }
}
