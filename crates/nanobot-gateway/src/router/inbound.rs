use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nanobot_common::{ConnectorId, ConnectorStatus, ConversationId, Envelope};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::RouterStats;
use super::reorder::{FIRST_SEQUENCE, Release, ReorderBuffer};

type ConversationKey = (ConnectorId, ConversationId);

/// Orders inbound envelopes per conversation and hands them to the agent inbox.
///
/// Runs as a single task fed by every supervisor instance, so ordering state
/// is owned here and needs no locking.
pub struct InboundRouter {
    /// Conversations holding envelopes ahead of a gap.
    buffers: HashMap<ConversationKey, ReorderBuffer>,
    /// Next expected sequence of every conversation with nothing held.
    cursors: HashMap<ConversationKey, u64>,
    window: u64,
    gap_timeout: Duration,
    inbox: mpsc::Sender<Envelope>,
    stats: Arc<RouterStats>,
}

impl InboundRouter {
    pub fn new(
        window: u64,
        gap_timeout: Duration,
        inbox: mpsc::Sender<Envelope>,
        stats: Arc<RouterStats>,
    ) -> Self {
        Self {
            buffers: HashMap::new(),
            cursors: HashMap::new(),
            window,
            gap_timeout,
            inbox,
            stats,
        }
    }

    /// Consume envelopes until every sender is gone, flushing a connector's
    /// conversations when it stops or fails.
    pub async fn run(
        mut self,
        mut envelopes: mpsc::Receiver<Envelope>,
        mut statuses: broadcast::Receiver<ConnectorStatus>,
    ) {
        let mut tick = tokio::time::interval((self.gap_timeout / 4).max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut statuses_open = true;

        loop {
            tokio::select! {
                envelope = envelopes.recv() => match envelope {
                    Some(envelope) => self.route_inbound(envelope).await,
                    None => break,
                },
                status = statuses.recv(), if statuses_open => match status {
                    Ok(status) if status.state.is_terminal() => {
                        self.flush_connector(&status.connector_id).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("router missed {skipped} status updates");
                    }
                    Err(RecvError::Closed) => statuses_open = false,
                },
                _ = tick.tick() => self.expire_gaps(Instant::now()).await,
            }
        }

        let keys: Vec<_> = self.buffers.keys().cloned().collect();
        for key in keys {
            self.flush(&key).await;
        }
        info!("inbound router stopped");
    }

    /// Buffer `envelope` and deliver whatever it makes ready.
    pub async fn route_inbound(&mut self, envelope: Envelope) {
        let key = envelope.conversation_key();
        let window = self.window;
        let cursors = &mut self.cursors;
        let release = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| {
                let next_expected = cursors.remove(&key).unwrap_or(FIRST_SEQUENCE);
                ReorderBuffer::resume(window, next_expected)
            })
            .push(envelope, Instant::now());
        self.apply(&key, release).await;
        self.park_if_drained(&key);
    }

    /// Shrink a buffer with nothing left in it down to its cursor.
    fn park_if_drained(&mut self, key: &ConversationKey) {
        if self.buffers.get(key).is_some_and(ReorderBuffer::is_empty)
            && let Some(buffer) = self.buffers.remove(key)
        {
            self.cursors.insert(key.clone(), buffer.next_expected());
        }
    }

    async fn expire_gaps(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (key, buffer) in &mut self.buffers {
            if buffer.is_empty() {
                continue;
            }
            let release = buffer.expire(now, self.gap_timeout);
            if !release.ready.is_empty() || !release.gaps.is_empty() {
                expired.push((key.clone(), release));
            }
        }
        for (key, release) in expired {
            self.apply(&key, release).await;
            self.park_if_drained(&key);
        }
    }

    async fn flush_connector(&mut self, connector_id: &ConnectorId) {
        let keys: Vec<_> = self
            .buffers
            .keys()
            .filter(|(connector, _)| connector == connector_id)
            .cloned()
            .collect();
        for key in keys {
            self.flush(&key).await;
        }
    }

    async fn flush(&mut self, key: &ConversationKey) {
        let Some(buffer) = self.buffers.get_mut(key) else {
            return;
        };
        if buffer.is_empty() {
            return;
        }
        let release = buffer.flush();
        debug!(
            connector = %key.0,
            conversation = %key.1,
            released = release.ready.len(),
            "flushed reorder buffer"
        );
        self.apply(key, release).await;
        self.park_if_drained(key);
    }

    async fn apply(&self, key: &ConversationKey, release: Release) {
        if let Some(sequence) = release.stale {
            self.stats.record_stale();
            warn!(
                connector = %key.0,
                conversation = %key.1,
                sequence,
                "dropping duplicate or late inbound envelope"
            );
        }
        for gap in &release.gaps {
            self.stats.record_gap();
            warn!(
                connector = %key.0,
                conversation = %key.1,
                first_missing = gap.first_missing,
                last_missing = gap.last_missing,
                "skipping {} missing inbound envelope(s)",
                gap.len()
            );
        }
        for envelope in release.ready {
            if self.inbox.send(envelope).await.is_err() {
                warn!(connector = %key.0, "agent inbox closed, dropping inbound envelope");
                return;
            }
            self.stats.record_delivered();
        }
    }
}
