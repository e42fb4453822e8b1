//! Routing between bridges and the agent runtime.
//!
//! Inbound envelopes go through [`InboundRouter`], which restores per
//! conversation order before the agent inbox sees them. Outbound envelopes go
//! through [`MessageRouter::route_outbound`], which numbers them and places
//! them on the owning connector's lane in one step per conversation.

pub mod inbound;
pub mod outbound;
pub mod reorder;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nanobot_common::{BridgeState, Direction, Envelope, NackReason};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::status::StatusBoard;

pub use inbound::InboundRouter;
pub use outbound::{
    OutboundLanes, OutboundOutcome, OutboundRequest, PendingDelivery, SequenceAllocator,
};

#[derive(Debug, Default)]
pub struct RouterStats {
    delivered: AtomicU64,
    gaps: AtomicU64,
    stale: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub delivered: u64,
    pub gaps_reported: u64,
    pub stale: u64,
}

impl RouterStats {
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self) {
        self.gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            gaps_reported: self.gaps.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

/// Outbound side of the router.
pub struct MessageRouter {
    lanes: Arc<OutboundLanes>,
    board: Arc<StatusBoard>,
    sequences: SequenceAllocator,
    ack_timeout: Duration,
}

impl MessageRouter {
    pub fn new(lanes: Arc<OutboundLanes>, board: Arc<StatusBoard>, ack_timeout: Duration) -> Self {
        Self {
            lanes,
            board,
            sequences: SequenceAllocator::default(),
            ack_timeout,
        }
    }

    /// Send `envelope` to the bridge serving its connector.
    ///
    /// A ready connector gets up to the ack timeout to confirm before the
    /// delivery is reported as queued. A connector that is starting or
    /// degraded holds the envelope in its lane until it is ready again.
    /// Nothing is ever reported acked without a bridge confirmation.
    pub async fn route_outbound(&self, envelope: Envelope) -> OutboundOutcome {
        match self.enqueue_outbound(envelope) {
            Ok(pending) => self.settle(pending).await,
            Err(reason) => OutboundOutcome::Nacked(reason),
        }
    }

    /// Number `envelope` and place it on its connector's lane without waiting.
    ///
    /// Envelopes enqueued one after another for the same conversation reach
    /// the bridge in the order they were numbered.
    pub fn enqueue_outbound(&self, mut envelope: Envelope) -> Result<PendingDelivery, NackReason> {
        envelope.direction = Direction::Outbound;
        let connector_id = envelope.connector_id.clone();

        let state = match self.board.state_of(&connector_id) {
            Some(BridgeState::Failed) => return Err(NackReason::ConnectorFailed),
            Some(BridgeState::Stopped) => return Err(NackReason::ConnectorStopped),
            Some(state) => state,
            None => return Err(NackReason::UnknownConnector),
        };
        let Some(lane) = self.lanes.get(&connector_id) else {
            return Err(NackReason::ConnectorStopped);
        };

        let pending = self
            .sequences
            .allocate(envelope.conversation_key(), |sequence| {
                envelope.sequence = sequence;
                let (reply, rx) = oneshot::channel();
                let pending = PendingDelivery::new(&envelope, rx);
                match lane.try_send(OutboundRequest { envelope, reply }) {
                    Ok(()) => Ok(pending),
                    Err(TrySendError::Full(_)) => {
                        warn!(connector = %connector_id, "outbound queue full");
                        Err(NackReason::QueueFull)
                    }
                    Err(TrySendError::Closed(_)) => Err(NackReason::ConnectorStopped),
                }
            })?;
        debug!(
            connector = %connector_id,
            sequence = pending.sequence(),
            state = %state,
            "queued outbound envelope"
        );
        Ok(pending)
    }

    /// Give a ready connector up to the ack timeout to confirm `pending`.
    pub async fn settle(&self, pending: PendingDelivery) -> OutboundOutcome {
        if self.board.state_of(pending.connector_id()) == Some(BridgeState::Ready) {
            pending.resolve_within(self.ack_timeout).await
        } else {
            OutboundOutcome::Queued(pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_common::{ConnectorId, ConnectorStatus, DeliveryAck};
    use tokio::sync::mpsc;

    fn board_with(id: &str, state: BridgeState) -> Arc<StatusBoard> {
        let board = Arc::new(StatusBoard::new(8));
        let mut status = ConnectorStatus::new(ConnectorId::from_string(id), "whatsapp", false);
        status.state = state;
        board.publish(status);
        board
    }

    fn outbound(id: &str) -> Envelope {
        Envelope::outbound(id.into(), "c1".into(), serde_json::json!({"text": "hi"}))
    }

    #[tokio::test]
    async fn unknown_connector_is_nacked() {
        let router = MessageRouter::new(
            Arc::new(OutboundLanes::default()),
            Arc::new(StatusBoard::new(8)),
            Duration::from_secs(1),
        );
        let outcome = router.route_outbound(outbound("nope")).await;
        assert!(matches!(
            outcome,
            OutboundOutcome::Nacked(NackReason::UnknownConnector)
        ));
    }

    #[tokio::test]
    async fn failed_connector_is_nacked() {
        let router = MessageRouter::new(
            Arc::new(OutboundLanes::default()),
            board_with("wa1", BridgeState::Failed),
            Duration::from_secs(1),
        );
        let outcome = router.route_outbound(outbound("wa1")).await;
        assert!(matches!(
            outcome,
            OutboundOutcome::Nacked(NackReason::ConnectorFailed)
        ));
    }

    #[tokio::test]
    async fn full_lane_is_nacked_queue_full() {
        let lanes = Arc::new(OutboundLanes::default());
        let (lane_tx, _lane_rx) = mpsc::channel(1);
        lanes.insert(ConnectorId::from_string("wa1"), lane_tx);
        let router = MessageRouter::new(
            lanes,
            board_with("wa1", BridgeState::Degraded),
            Duration::from_secs(1),
        );

        assert!(matches!(
            router.route_outbound(outbound("wa1")).await,
            OutboundOutcome::Queued(_)
        ));
        assert!(matches!(
            router.route_outbound(outbound("wa1")).await,
            OutboundOutcome::Nacked(NackReason::QueueFull)
        ));
    }

    #[tokio::test]
    async fn ready_connector_returns_bridge_ack() {
        let lanes = Arc::new(OutboundLanes::default());
        let (lane_tx, mut lane_rx) = mpsc::channel::<OutboundRequest>(4);
        lanes.insert(ConnectorId::from_string("wa1"), lane_tx);
        let router = MessageRouter::new(
            lanes,
            board_with("wa1", BridgeState::Ready),
            Duration::from_secs(5),
        );

        tokio::spawn(async move {
            while let Some(request) = lane_rx.recv().await {
                let ack = DeliveryAck {
                    conversation_id: request.envelope.conversation_id.clone(),
                    sequence: request.envelope.sequence,
                    platform_message_id: None,
                };
                request.resolve(Ok(ack));
            }
        });

        for expected in 1..=2 {
            match router.route_outbound(outbound("wa1")).await {
                OutboundOutcome::Acked(ack) => assert_eq!(ack.sequence, expected),
                other => panic!("expected ack, got {}", other.label()),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_reach_the_lane_in_sequence_order() {
        let lanes = Arc::new(OutboundLanes::default());
        let (lane_tx, mut lane_rx) = mpsc::channel::<OutboundRequest>(512);
        lanes.insert(ConnectorId::from_string("wa1"), lane_tx);
        let router = Arc::new(MessageRouter::new(
            lanes,
            board_with("wa1", BridgeState::Degraded),
            Duration::from_secs(1),
        ));

        let mut senders = Vec::new();
        for _ in 0..4 {
            let router = Arc::clone(&router);
            senders.push(tokio::spawn(async move {
                for _ in 0..100 {
                    router.enqueue_outbound(outbound("wa1")).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let mut expected = 1;
        while let Ok(request) = lane_rx.try_recv() {
            assert_eq!(request.envelope.sequence, expected);
            expected += 1;
        }
        assert_eq!(expected, 401);
    }

    #[tokio::test]
    async fn refused_envelope_leaves_no_sequence_gap() {
        let lanes = Arc::new(OutboundLanes::default());
        let (lane_tx, mut lane_rx) = mpsc::channel(1);
        lanes.insert(ConnectorId::from_string("wa1"), lane_tx);
        let router = MessageRouter::new(
            lanes,
            board_with("wa1", BridgeState::Degraded),
            Duration::from_secs(1),
        );

        assert_eq!(router.enqueue_outbound(outbound("wa1")).unwrap().sequence(), 1);
        assert_eq!(
            router.enqueue_outbound(outbound("wa1")).unwrap_err(),
            NackReason::QueueFull
        );
        lane_rx.recv().await.unwrap();
        assert_eq!(router.enqueue_outbound(outbound("wa1")).unwrap().sequence(), 2);
    }
}
