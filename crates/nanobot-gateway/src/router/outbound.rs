use std::time::Duration;

use dashmap::DashMap;
use nanobot_common::{ConnectorId, ConversationId, DeliveryAck, DeliveryResult, Envelope, NackReason};
use tokio::sync::{mpsc, oneshot};

/// An outbound envelope on its way to a bridge, with the channel its
/// delivery result goes back on.
#[derive(Debug)]
pub struct OutboundRequest {
    pub envelope: Envelope,
    pub reply: oneshot::Sender<DeliveryResult>,
}

impl OutboundRequest {
    /// Resolve the request. The caller may have stopped listening, which is fine.
    pub fn resolve(self, result: DeliveryResult) {
        let _ = self.reply.send(result);
    }
}

/// Per-connector outbound queues, registered by the supervisor while an
/// instance is running.
#[derive(Default)]
pub struct OutboundLanes {
    lanes: DashMap<ConnectorId, mpsc::Sender<OutboundRequest>>,
}

impl OutboundLanes {
    pub fn insert(&self, connector_id: ConnectorId, lane: mpsc::Sender<OutboundRequest>) {
        self.lanes.insert(connector_id, lane);
    }

    pub fn remove(&self, connector_id: &ConnectorId) {
        self.lanes.remove(connector_id);
    }

    pub fn get(&self, connector_id: &ConnectorId) -> Option<mpsc::Sender<OutboundRequest>> {
        self.lanes.get(connector_id).map(|lane| lane.value().clone())
    }
}

/// Hands out outbound sequence numbers, per `(connector, conversation)`,
/// starting at 1. Numbers are never reused while the gateway runs.
#[derive(Default)]
pub struct SequenceAllocator {
    next: DashMap<(ConnectorId, ConversationId), u64>,
}

impl SequenceAllocator {
    /// Offer the next number for `key` to `accept` while the conversation's
    /// counter is locked. The number is consumed only if `accept` succeeds,
    /// so callers racing on one conversation hand off numbers in order.
    pub fn allocate<T, E>(
        &self,
        key: (ConnectorId, ConversationId),
        accept: impl FnOnce(u64) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut counter = self.next.entry(key).or_insert(0);
        let value = accept(*counter + 1)?;
        *counter += 1;
        Ok(value)
    }
}

/// Immediate result of routing one outbound envelope.
#[derive(Debug)]
pub enum OutboundOutcome {
    Acked(DeliveryAck),
    Nacked(NackReason),
    /// Accepted but not yet delivered; the final result arrives later.
    Queued(PendingDelivery),
}

impl OutboundOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            OutboundOutcome::Acked(_) => "acked",
            OutboundOutcome::Nacked(_) => "nacked",
            OutboundOutcome::Queued(_) => "queued",
        }
    }
}

/// An outbound envelope waiting for its bridge to confirm or refuse it.
#[derive(Debug)]
pub struct PendingDelivery {
    connector_id: ConnectorId,
    conversation_id: ConversationId,
    sequence: u64,
    rx: oneshot::Receiver<DeliveryResult>,
}

impl PendingDelivery {
    pub(crate) fn new(envelope: &Envelope, rx: oneshot::Receiver<DeliveryResult>) -> Self {
        Self {
            connector_id: envelope.connector_id.clone(),
            conversation_id: envelope.conversation_id.clone(),
            sequence: envelope.sequence,
            rx,
        }
    }

    pub fn connector_id(&self) -> &ConnectorId {
        &self.connector_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wait for the final result. If the owning instance goes away without
    /// answering, the delivery counts as refused with `connector-stopped`.
    pub async fn wait(self) -> DeliveryResult {
        self.rx.await.unwrap_or(Err(NackReason::ConnectorStopped))
    }

    /// Wait up to `timeout`; still pending afterwards means `Queued`.
    pub(crate) async fn resolve_within(mut self, timeout: Duration) -> OutboundOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Ok(ack))) => OutboundOutcome::Acked(ack),
            Ok(Ok(Err(reason))) => OutboundOutcome::Nacked(reason),
            Ok(Err(_)) => OutboundOutcome::Nacked(NackReason::ConnectorStopped),
            Err(_) => OutboundOutcome::Queued(self),
        }
    }
}
