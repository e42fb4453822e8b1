//! The task that owns one running bridge.
//!
//! `Starting -> Handshaking -> Ready`, with `Degraded` whenever the bridge is
//! unhealthy or backed up, `Failed` after too many starts that never reached
//! `Ready`, and `Stopped` on deactivation. The process handle and channel
//! never leave this task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use nanobot_bridge::{
    BRIDGE_PROTOCOL_VERSION, BridgeCapability, BridgeChannel, BridgeChild, BridgeFrame,
    BridgeHandshake, BridgeSender, BridgeSpawner, ChannelLimits, SessionGrant, SpawnedBridge,
    decode_credential,
};
use nanobot_common::{
    BridgeState, ConnectorStatus, ConversationId, DeliveryAck, DeliveryResult,
    Envelope, Error, NackReason, PairingStatus, Result,
};
use nanobot_config::SupervisorConfig;
use nanobot_store::{RestartLedger, RestartRecord, SessionStore};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use crate::connector::Connector;
use crate::router::{OutboundLanes, OutboundRequest};
use crate::status::StatusBoard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceCommand {
    Deactivate,
    Pair,
    Restart,
}

/// Shared services every instance talks to.
#[derive(Clone)]
pub struct InstanceContext {
    pub spawner: Arc<dyn BridgeSpawner>,
    pub sessions: Arc<SessionStore>,
    pub ledger: Arc<RestartLedger>,
    pub board: Arc<StatusBoard>,
    pub lanes: Arc<OutboundLanes>,
    /// Feeds the inbound router.
    pub inbound: mpsc::Sender<Envelope>,
    pub timing: SupervisorConfig,
    pub limits: ChannelLimits,
}

/// Why a bridge run ended.
enum Exit {
    Deactivated,
    Restart,
    Down(String),
}

/// How a wait between runs ended.
enum Resume {
    Elapsed,
    Restart,
    Deactivate,
}

#[derive(Debug, Clone, Copy)]
enum PressureSource {
    Channel,
    Router,
}

type DeliveryKey = (ConversationId, u64);

struct Delivery {
    key: DeliveryKey,
    reply: oneshot::Sender<DeliveryResult>,
}

/// An envelope the bridge has taken, waiting for its receipt.
struct InFlight {
    sent_at: Instant,
    reply: oneshot::Sender<DeliveryResult>,
}

/// An encoded frame waiting for room in the bridge's outbound queue.
struct HeldFrame {
    body: Bytes,
    delivery: Option<Delivery>,
}

pub struct BridgeInstance {
    connector: Connector,
    ctx: InstanceContext,
    commands: mpsc::Receiver<InstanceCommand>,
    lane: mpsc::Receiver<OutboundRequest>,
    backoff: Backoff,
    status: ConnectorStatus,
    record: RestartRecord,
    /// Newest record for the ledger writer. `None` once the instance has finished.
    records: Option<watch::Sender<RestartRecord>>,
    ledger_writer: JoinHandle<()>,
    in_flight: HashMap<DeliveryKey, InFlight>,
    /// Whether the running bridge reports a result for every envelope.
    receipts: bool,
    held_outbound: Option<HeldFrame>,
    held_inbound: Option<Envelope>,
    /// Protocol errors counted by earlier channels of this instance.
    protocol_errors_base: u64,
    pair_pending: bool,
    channel_pressure: bool,
    router_pressure: bool,
    degraded_by_pressure: bool,
}

impl BridgeInstance {
    pub fn new(
        connector: Connector,
        ctx: InstanceContext,
        commands: mpsc::Receiver<InstanceCommand>,
        lane: mpsc::Receiver<OutboundRequest>,
    ) -> Self {
        let status = initial_status(&connector, &ctx);
        let mut record = match ctx.ledger.load(&connector.id) {
            Ok(Some(record)) => record,
            Ok(None) => RestartRecord::new(connector.id.clone()),
            Err(e) => {
                warn!(connector = %connector.id, error = %e, "ignoring unreadable restart record");
                RestartRecord::new(connector.id.clone())
            }
        };
        // A new activation starts with a clean failure streak.
        record.consecutive_failures = 0;
        record.failed = false;

        let backoff = Backoff::new(&connector.restart);
        let mut status = status;
        status.restart_count = record.restart_count;
        let (records, pending_records) = watch::channel(record.clone());
        let ledger_writer = spawn_ledger_writer(Arc::clone(&ctx.ledger), pending_records);

        Self {
            connector,
            ctx,
            commands,
            lane,
            backoff,
            status,
            record,
            records: Some(records),
            ledger_writer,
            in_flight: HashMap::new(),
            receipts: false,
            held_outbound: None,
            held_inbound: None,
            protocol_errors_base: 0,
            pair_pending: false,
            channel_pressure: false,
            router_pressure: false,
            degraded_by_pressure: false,
        }
    }

    pub async fn run(mut self) {
        info!(connector = %self.connector.id, "supervising connector");
        loop {
            let reason = match self.run_bridge().await {
                Exit::Deactivated => break,
                Exit::Restart => {
                    info!(connector = %self.connector.id, "restarting bridge on operator request");
                    self.reset_failures();
                    self.count_restart();
                    continue;
                }
                Exit::Down(reason) => reason,
            };

            if self.record.consecutive_failures >= self.connector.restart.max_attempts {
                self.enter_failed(reason);
                match self.wait_while_failed().await {
                    Resume::Deactivate => break,
                    Resume::Restart | Resume::Elapsed => {
                        info!(connector = %self.connector.id, "leaving failed state on operator request");
                        self.reset_failures();
                        self.count_restart();
                        continue;
                    }
                }
            }

            let delay = self.backoff.next_delay();
            warn!(
                connector = %self.connector.id,
                error = %reason,
                attempt = self.backoff.attempt(),
                consecutive_failures = self.record.consecutive_failures,
                "bridge down, restarting in {delay:?}"
            );
            match self.wait_backoff(delay).await {
                Resume::Deactivate => break,
                Resume::Restart => self.reset_failures(),
                Resume::Elapsed => {}
            }
            self.count_restart();
        }
        self.finish().await;
    }

    /// Spawn, handshake and serve one bridge process until it goes away.
    async fn run_bridge(&mut self) -> Exit {
        self.transition(BridgeState::Starting);
        let request = self
            .connector
            .spawn_request(self.ctx.timing.heartbeat_interval());
        let SpawnedBridge {
            reader,
            writer,
            mut child,
        } = match self.ctx.spawner.spawn(&request).await {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = e.to_string();
                self.bridge_down(&reason, true);
                return Exit::Down(reason);
            }
        };

        let mut channel =
            BridgeChannel::open(self.connector.id.as_str(), reader, writer, self.ctx.limits);
        self.protocol_errors_base = self.status.protocol_errors;
        self.transition(BridgeState::Handshaking);

        let (exit, reached_ready) = match self.handshake(&mut channel, child.as_mut()).await {
            Ok(handshake) => {
                self.receipts = handshake.supports(&BridgeCapability::DeliveryReceipts);
                self.on_ready();
                (self.serve(&mut channel, child.as_mut()).await, true)
            }
            Err(exit) => (exit, false),
        };

        if let Exit::Down(reason) = &exit {
            self.bridge_down(reason, !reached_ready);
        }
        let nack = match &exit {
            Exit::Deactivated => NackReason::ConnectorStopped,
            _ => NackReason::BridgeRestarted,
        };
        if self
            .held_outbound
            .as_ref()
            .is_some_and(|held| held.delivery.is_none())
        {
            // The pair request never reached this bridge; ask the next one.
            self.pair_pending = true;
        }
        self.fail_in_flight(nack);
        self.held_outbound = None;
        self.sync_protocol_errors(&channel);
        self.stop_bridge(&channel, child.as_mut()).await;
        self.channel_pressure = false;
        self.router_pressure = false;
        self.degraded_by_pressure = false;
        exit
    }

    async fn handshake(
        &mut self,
        channel: &mut BridgeChannel,
        child: &mut dyn BridgeChild,
    ) -> std::result::Result<BridgeHandshake, Exit> {
        let limit = self.ctx.timing.handshake_timeout();
        let deadline = sleep(limit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(Exit::Down(format!("no handshake within {}s", limit.as_secs())));
                }
                exit = child.wait() => {
                    return Err(Exit::Down(format!(
                        "bridge exited during handshake ({})",
                        describe_exit(exit)
                    )));
                }
                command = self.commands.recv() => match command {
                    Some(InstanceCommand::Pair) => self.pair_pending = true,
                    Some(InstanceCommand::Restart) => return Err(Exit::Restart),
                    Some(InstanceCommand::Deactivate) | None => return Err(Exit::Deactivated),
                },
                frame = channel.recv() => match frame {
                    Some(BridgeFrame::Handshake { payload }) => {
                        return self.accept_handshake(channel, payload).await;
                    }
                    Some(other) => {
                        channel.stats().record_invalid();
                        warn!(
                            connector = %self.connector.id,
                            kind = other.kind(),
                            "expected handshake, dropping frame"
                        );
                    }
                    None => {
                        return Err(Exit::Down("bridge closed its stream during handshake".into()));
                    }
                },
            }
        }
    }

    async fn accept_handshake(
        &mut self,
        channel: &BridgeChannel,
        handshake: BridgeHandshake,
    ) -> std::result::Result<BridgeHandshake, Exit> {
        let heartbeat_interval_secs = self.ctx.timing.heartbeat_interval_secs;

        if let Err(e) = handshake.validate(&self.connector.connector_type) {
            let reject = BridgeFrame::HandshakeAck {
                protocol_version: BRIDGE_PROTOCOL_VERSION,
                accepted: false,
                message: Some(e.to_string()),
                heartbeat_interval_secs,
                session: None,
            };
            if let Err(send_err) = channel.send(&reject).await {
                debug!(connector = %self.connector.id, error = %send_err, "could not send handshake rejection");
            }
            return Err(Exit::Down(format!("handshake rejected: {e}")));
        }

        let ack = BridgeFrame::HandshakeAck {
            protocol_version: BRIDGE_PROTOCOL_VERSION,
            accepted: true,
            message: None,
            heartbeat_interval_secs,
            session: self.session_grant(),
        };
        if let Err(e) = channel.send(&ack).await {
            return Err(Exit::Down(e.to_string()));
        }

        info!(
            connector = %self.connector.id,
            bridge = %handshake.bridge_name,
            version = %handshake.bridge_version,
            receipts = handshake.supports(&BridgeCapability::DeliveryReceipts),
            "bridge handshake complete"
        );
        Ok(handshake)
    }

    /// Pump frames both ways until the bridge goes away or is told to stop.
    ///
    /// Nothing here waits on a full queue. A frame that finds no room is held
    /// and its source stops being polled until a reserve branch frees it, so
    /// commands and the poll tick are always served.
    async fn serve(&mut self, channel: &mut BridgeChannel, child: &mut dyn BridgeChild) -> Exit {
        let heartbeat_timeout = self.ctx.timing.heartbeat_timeout();
        let mut poll = tokio::time::interval(self.ctx.timing.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pressure = channel.pressure();
        let sender = channel.sender();
        let inbound = self.ctx.inbound.clone();
        let ready_since = Instant::now();
        let mut last_heartbeat = Instant::now();

        if self.held_inbound.is_some() {
            self.set_pressure(PressureSource::Router, true);
        }
        if self.pair_pending {
            self.request_pairing(&sender);
        }

        loop {
            let reading = self.held_inbound.is_none();
            let writing = self.held_outbound.is_none();
            let accepting = writing && self.status.state == BridgeState::Ready;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(InstanceCommand::Pair) => self.request_pairing(&sender),
                    Some(InstanceCommand::Restart) => return Exit::Restart,
                    Some(InstanceCommand::Deactivate) | None => return Exit::Deactivated,
                },
                frame = channel.recv(), if reading => match frame {
                    Some(frame) => {
                        if matches!(frame, BridgeFrame::Heartbeat { .. }) {
                            last_heartbeat = Instant::now();
                        }
                        self.handle_frame(channel, frame).await;
                    }
                    None => return Exit::Down("bridge closed its stream".into()),
                },
                permit = inbound.reserve(), if !reading => {
                    match (permit, self.held_inbound.take()) {
                        (Ok(permit), Some(envelope)) => permit.send(envelope),
                        (Err(_), Some(_)) => {
                            warn!(connector = %self.connector.id, "router stopped, dropping inbound envelope");
                        }
                        (_, None) => {}
                    }
                    self.set_pressure(PressureSource::Router, false);
                }
                permit = sender.reserve(), if !writing => match permit {
                    Ok(permit) => {
                        if let Some(held) = self.held_outbound.take() {
                            permit.send(held.body);
                            if let Some(delivery) = held.delivery {
                                self.track(delivery);
                            }
                        }
                        if self.pair_pending {
                            self.request_pairing(&sender);
                        }
                    }
                    Err(e) => return Exit::Down(e.to_string()),
                },
                exit = child.wait() => {
                    return Exit::Down(format!("bridge exited ({})", describe_exit(exit)));
                }
                Some(request) = self.lane.recv(), if accepting => {
                    self.dispatch(&sender, request);
                }
                Ok(()) = pressure.changed() => {
                    let raised = *pressure.borrow_and_update();
                    self.set_pressure(PressureSource::Channel, raised);
                }
                _ = poll.tick() => {
                    if *pressure.borrow() || self.router_pressure {
                        // A backed-up channel can hold heartbeats; judge liveness after it drains.
                        last_heartbeat = Instant::now();
                    } else if last_heartbeat.elapsed() > heartbeat_timeout {
                        return Exit::Down(format!(
                            "no heartbeat for {}s",
                            heartbeat_timeout.as_secs()
                        ));
                    }
                    if self.backoff.note_ready_for(ready_since.elapsed()) {
                        debug!(connector = %self.connector.id, "bridge healthy, restart delay reset");
                    }
                    self.expire_deliveries();
                    self.sync_protocol_errors(channel);
                }
            }
        }
    }

    async fn handle_frame(&mut self, channel: &BridgeChannel, frame: BridgeFrame) {
        if let Err(e) = frame.validate_from_bridge(&self.connector.id) {
            channel.stats().record_invalid();
            self.sync_protocol_errors(channel);
            warn!(
                connector = %self.connector.id,
                kind = frame.kind(),
                error = %e,
                "dropping invalid bridge frame"
            );
            return;
        }

        match frame {
            BridgeFrame::Heartbeat { .. } => {
                self.status.last_heartbeat = Some(Utc::now());
                self.ctx.board.refresh(self.status.clone());
            }
            BridgeFrame::InboundEnvelope { envelope } => self.forward_inbound(envelope),
            BridgeFrame::DeliveryAck(ack) => {
                let key = (ack.conversation_id.clone(), ack.sequence);
                self.resolve_delivery(key, Ok(ack));
            }
            BridgeFrame::DeliveryNack {
                conversation_id,
                sequence,
                reason,
            } => self.resolve_delivery((conversation_id, sequence), Err(NackReason::Bridge(reason))),
            BridgeFrame::PairPrompt { code } => self.on_pair_prompt(code),
            BridgeFrame::PairResult {
                success,
                credential,
                reason,
                ..
            } => self.on_pair_result(success, credential, reason).await,
            BridgeFrame::SessionRevoked { reason } => self.on_session_revoked(reason).await,
            BridgeFrame::Error { code, message } => {
                warn!(connector = %self.connector.id, code = %code, "bridge error: {message}");
            }
            other => {
                channel.stats().record_invalid();
                self.sync_protocol_errors(channel);
                warn!(
                    connector = %self.connector.id,
                    kind = other.kind(),
                    "unexpected frame after handshake"
                );
            }
        }
    }

    fn forward_inbound(&mut self, envelope: Envelope) {
        match self.ctx.inbound.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                self.held_inbound = Some(envelope);
                self.set_pressure(PressureSource::Router, true);
            }
            Err(TrySendError::Closed(_)) => {
                warn!(connector = %self.connector.id, "router stopped, dropping inbound envelope");
            }
        }
    }

    fn dispatch(&mut self, sender: &BridgeSender, request: OutboundRequest) {
        let OutboundRequest { envelope, reply } = request;
        let key = (envelope.conversation_id.clone(), envelope.sequence);
        let body = match sender.encode(&BridgeFrame::OutboundEnvelope { envelope }) {
            Ok(body) => body,
            Err(Error::Protocol(e)) => {
                warn!(connector = %self.connector.id, error = %e, "outbound envelope too large");
                let _ = reply.send(Err(NackReason::FrameTooLarge));
                return;
            }
            Err(e) => {
                warn!(connector = %self.connector.id, error = %e, "could not encode outbound envelope");
                let _ = reply.send(Err(NackReason::Bridge(e.to_string())));
                return;
            }
        };

        let delivery = Delivery { key, reply };
        match sender.try_send(body) {
            Ok(()) => self.track(delivery),
            Err(TrySendError::Full(body)) => {
                self.held_outbound = Some(HeldFrame {
                    body,
                    delivery: Some(delivery),
                });
            }
            Err(TrySendError::Closed(_)) => {
                warn!(connector = %self.connector.id, "could not hand envelope to bridge");
                let _ = delivery.reply.send(Err(NackReason::BridgeRestarted));
            }
        }
    }

    /// Wait for the bridge's receipt, or settle now if it never sends one.
    fn track(&mut self, delivery: Delivery) {
        let Delivery { key, reply } = delivery;
        if self.receipts {
            self.in_flight.insert(
                key,
                InFlight {
                    sent_at: Instant::now(),
                    reply,
                },
            );
        } else {
            // Taking the frame is all a bridge without receipts ever reports.
            let (conversation_id, sequence) = key;
            let _ = reply.send(Ok(DeliveryAck {
                conversation_id,
                sequence,
                platform_message_id: None,
            }));
        }
    }

    fn resolve_delivery(&mut self, key: DeliveryKey, result: DeliveryResult) {
        match self.in_flight.remove(&key) {
            Some(entry) => {
                let _ = entry.reply.send(result);
            }
            None => debug!(
                connector = %self.connector.id,
                conversation = %key.0,
                sequence = key.1,
                "delivery result for unknown envelope"
            ),
        }
    }

    /// Refuse deliveries whose receipt is overdue with `ack-timeout`.
    fn expire_deliveries(&mut self) {
        let timeout = self.ctx.timing.delivery_timeout();
        let overdue: Vec<DeliveryKey> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.sent_at.elapsed() >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in overdue {
            if let Some(entry) = self.in_flight.remove(&key) {
                warn!(
                    connector = %self.connector.id,
                    conversation = %key.0,
                    sequence = key.1,
                    "no delivery receipt within {}s",
                    timeout.as_secs()
                );
                let _ = entry.reply.send(Err(NackReason::AckTimeout));
            }
        }
    }

    fn request_pairing(&mut self, sender: &BridgeSender) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = BridgeFrame::PairRequest {
            request_id: request_id.clone(),
        };
        let sent = sender.encode(&frame).and_then(|body| match sender.try_send(body) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(body)) if self.held_outbound.is_none() => {
                self.held_outbound = Some(HeldFrame {
                    body,
                    delivery: None,
                });
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                Err(Error::Bridge("outbound bridge queue is full".into()))
            }
            Err(TrySendError::Closed(_)) => Err(sender.closed()),
        });
        match sent {
            Ok(()) => {
                self.pair_pending = false;
                self.status.pairing = PairingStatus::Pairing;
                self.status.pairing_prompt = None;
                self.publish();
                info!(connector = %self.connector.id, request_id = %request_id, "pairing requested");
            }
            Err(e) => {
                self.pair_pending = true;
                warn!(connector = %self.connector.id, error = %e, "could not send pair request yet");
            }
        }
    }

    fn on_pair_prompt(&mut self, code: String) {
        info!(connector = %self.connector.id, "pairing prompt available");
        self.status.pairing = PairingStatus::Pairing;
        self.status.pairing_prompt = Some(code);
        self.publish();
    }

    async fn on_pair_result(
        &mut self,
        success: bool,
        credential: Option<String>,
        reason: Option<String>,
    ) {
        let id = self.connector.id.clone();
        let sessions = Arc::clone(&self.ctx.sessions);
        self.status.pairing_prompt = None;

        if success {
            let saved = match credential
                .as_deref()
                .ok_or_else(|| Error::Protocol("pair_result carries no credential".into()))
                .and_then(decode_credential)
            {
                Ok(blob) => {
                    let id = id.clone();
                    off_runtime(move || sessions.save(&id, &blob, PairingStatus::Paired)).await
                }
                Err(e) => Err(e),
            };
            match saved {
                Ok(_) => {
                    info!(connector = %id, "pairing succeeded");
                    self.status.pairing = PairingStatus::Paired;
                    self.status.last_error = None;
                }
                Err(e) => {
                    error!(connector = %id, error = %e, "failed to persist paired session");
                    self.status.last_error = Some(format!("failed to persist session: {e}"));
                }
            }
        } else {
            let reason = reason.unwrap_or_else(|| "pairing failed".to_string());
            warn!(connector = %id, reason = %reason, "pairing failed");
            let recorded = {
                let id = id.clone();
                let reason = reason.clone();
                off_runtime(move || {
                    let previous = match sessions.load(&id) {
                        Ok(Some(session)) => session.credential,
                        _ => Vec::new(),
                    };
                    sessions.save_with_reason(&id, &previous, PairingStatus::Unpaired, Some(&reason))
                })
                .await
            };
            if let Err(e) = recorded {
                error!(connector = %id, error = %e, "failed to record pairing failure");
            }
            self.status.pairing = PairingStatus::Unpaired;
            self.status.last_error = Some(format!("pairing failed: {reason}"));
        }
        self.publish();
    }

    async fn on_session_revoked(&mut self, reason: String) {
        let id = self.connector.id.clone();
        warn!(connector = %id, reason = %reason, "session revoked by platform");
        let recorded = {
            let sessions = Arc::clone(&self.ctx.sessions);
            let id = id.clone();
            let reason = reason.clone();
            off_runtime(move || match sessions.invalidate(&id, &reason) {
                Ok(Some(_)) => Ok(()),
                Ok(None) => sessions
                    .save_with_reason(&id, &[], PairingStatus::Revoked, Some(&reason))
                    .map(|_| ()),
                Err(e) => Err(e),
            })
            .await
        };
        if let Err(e) = recorded {
            error!(connector = %id, error = %e, "failed to record session revocation");
        }
        self.status.pairing = PairingStatus::Revoked;
        self.status.pairing_prompt = None;
        self.status.last_error = Some(format!("session revoked: {reason}"));
        self.publish();
    }

    /// Backpressure from either side marks a ready connector degraded until
    /// both sides drain again. It never restarts the bridge.
    fn set_pressure(&mut self, source: PressureSource, raised: bool) {
        match source {
            PressureSource::Channel => self.channel_pressure = raised,
            PressureSource::Router => self.router_pressure = raised,
        }
        let any = self.channel_pressure || self.router_pressure;

        if any && self.status.state == BridgeState::Ready {
            warn!(connector = %self.connector.id, source = ?source, "backpressure, connector degraded");
            self.degraded_by_pressure = true;
            self.status.last_error = Some("backpressure".into());
            self.transition(BridgeState::Degraded);
        } else if !any && self.degraded_by_pressure {
            info!(connector = %self.connector.id, "backpressure cleared");
            self.degraded_by_pressure = false;
            self.status.last_error = None;
            self.transition(BridgeState::Ready);
        }
    }

    async fn wait_while_failed(&mut self) -> Resume {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(InstanceCommand::Restart) => return Resume::Restart,
                    Some(InstanceCommand::Pair) => {
                        warn!(connector = %self.connector.id, "cannot pair a failed connector; restart it first");
                    }
                    Some(InstanceCommand::Deactivate) | None => return Resume::Deactivate,
                },
                Some(request) = self.lane.recv() => {
                    request.resolve(Err(NackReason::ConnectorFailed));
                }
            }
        }
    }

    /// Sleep out the restart delay. Outbound envelopes stay queued meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> Resume {
        let wake = sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = &mut wake => return Resume::Elapsed,
                command = self.commands.recv() => match command {
                    Some(InstanceCommand::Pair) => self.pair_pending = true,
                    Some(InstanceCommand::Restart) => return Resume::Restart,
                    Some(InstanceCommand::Deactivate) | None => return Resume::Deactivate,
                },
            }
        }
    }

    /// Ask the bridge to exit, then kill it if the grace period runs out.
    async fn stop_bridge(&mut self, channel: &BridgeChannel, child: &mut dyn BridgeChild) {
        let grace = self.ctx.timing.shutdown_grace();
        let shutdown = BridgeFrame::Shutdown {
            grace_period_ms: grace.as_millis() as u64,
        };
        match tokio::time::timeout(grace, channel.send(&shutdown)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connector = %self.connector.id, error = %e, "could not send shutdown"),
            Err(_) => debug!(connector = %self.connector.id, "shutdown frame not accepted in time"),
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(exit) => debug!(
                connector = %self.connector.id,
                "bridge exited ({})",
                describe_exit(exit)
            ),
            Err(_) => {
                warn!(connector = %self.connector.id, "bridge ignored shutdown, killing it");
                if let Err(e) = child.kill().await {
                    warn!(connector = %self.connector.id, error = %e, "failed to kill bridge");
                }
            }
        }
    }

    fn on_ready(&mut self) {
        self.record.consecutive_failures = 0;
        self.record.failed = false;
        self.record.last_error = None;
        self.persist();
        self.status.last_error = None;
        self.transition(BridgeState::Ready);
    }

    fn bridge_down(&mut self, reason: &str, failed_start: bool) {
        if failed_start {
            self.record.consecutive_failures += 1;
        }
        self.record.last_error = Some(reason.to_string());
        self.persist();
        self.status.last_error = Some(reason.to_string());
        self.transition(BridgeState::Degraded);
    }

    fn enter_failed(&mut self, reason: String) {
        error!(
            connector = %self.connector.id,
            attempts = self.record.consecutive_failures,
            error = %reason,
            "bridge failed to start too many times, giving up until restarted"
        );
        self.record.failed = true;
        self.record.last_error = Some(reason.clone());
        self.persist();
        self.status.last_error = Some(reason);
        self.transition(BridgeState::Failed);
        self.drain_lane(NackReason::ConnectorFailed);
    }

    async fn finish(mut self) {
        self.ctx.lanes.remove(&self.connector.id);
        self.lane.close();
        self.drain_lane(NackReason::ConnectorStopped);
        self.fail_in_flight(NackReason::ConnectorStopped);
        if let Some(envelope) = self.held_inbound.take()
            && self.ctx.inbound.try_send(envelope).is_err()
        {
            warn!(connector = %self.connector.id, "router backed up, dropping inbound envelope");
        }

        // Let the last restart record reach disk before reporting the stop.
        self.records.take();
        if let Err(e) = (&mut self.ledger_writer).await {
            warn!(connector = %self.connector.id, error = %e, "restart ledger writer failed");
        }

        self.status.pairing_prompt = None;
        self.transition(BridgeState::Stopped);
        info!(connector = %self.connector.id, "connector deactivated");
    }

    fn drain_lane(&mut self, reason: NackReason) {
        while let Ok(request) = self.lane.try_recv() {
            request.resolve(Err(reason.clone()));
        }
    }

    fn fail_in_flight(&mut self, reason: NackReason) {
        for (_, entry) in self.in_flight.drain() {
            let _ = entry.reply.send(Err(reason.clone()));
        }
        if let Some(delivery) = self.held_outbound.as_mut().and_then(|held| held.delivery.take()) {
            let _ = delivery.reply.send(Err(reason));
        }
    }

    fn reset_failures(&mut self) {
        self.record.consecutive_failures = 0;
        self.record.failed = false;
        self.backoff.reset();
        self.persist();
    }

    fn count_restart(&mut self) {
        self.record.restart_count = self.record.restart_count.saturating_add(1);
        self.persist();
    }

    /// Hand the record to the ledger writer. Only the newest pending copy is written.
    fn persist(&mut self) {
        self.record.updated_at = Utc::now();
        self.status.restart_count = self.record.restart_count;
        self.status.consecutive_failures = self.record.consecutive_failures;
        if let Some(records) = &self.records {
            records.send_replace(self.record.clone());
        }
    }

    /// Fold the current channel's drop count into the connector's running total.
    fn sync_protocol_errors(&mut self, channel: &BridgeChannel) {
        let total = self.protocol_errors_base + channel.stats().malformed();
        if total != self.status.protocol_errors {
            self.status.protocol_errors = total;
            self.ctx.board.refresh(self.status.clone());
        }
    }

    fn session_grant(&self) -> Option<SessionGrant> {
        match self.ctx.sessions.load(&self.connector.id) {
            Ok(Some(session)) if session.status == PairingStatus::Paired => {
                Some(SessionGrant::new(session.status, &session.credential))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(connector = %self.connector.id, error = %e, "could not load session for handshake");
                None
            }
        }
    }

    fn transition(&mut self, state: BridgeState) {
        let previous = self.status.state;
        self.status.state = state;
        self.status.updated_at = Utc::now();
        if previous != state {
            info!(connector = %self.connector.id, from = %previous, to = %state, "connector state changed");
        }
        self.publish();
    }

    fn publish(&mut self) {
        self.status.updated_at = Utc::now();
        self.ctx.board.publish(self.status.clone());
    }
}

/// Status before the first spawn: pairing comes from the persisted session.
pub fn initial_status(connector: &Connector, ctx: &InstanceContext) -> ConnectorStatus {
    let mut status = ConnectorStatus::new(
        connector.id.clone(),
        connector.connector_type.clone(),
        connector.required,
    );
    match ctx.sessions.load(&connector.id) {
        Ok(Some(session)) => status.pairing = session.status,
        Ok(None) => {}
        Err(e) => {
            warn!(connector = %connector.id, error = %e, "could not load session");
            status.last_error = Some(e.to_string());
        }
    }
    status
}

/// Write restart records off the runtime threads, oldest first, skipping
/// any that were replaced before their turn came.
fn spawn_ledger_writer(
    ledger: Arc<RestartLedger>,
    mut records: watch::Receiver<RestartRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while records.changed().await.is_ok() {
            let record = records.borrow_and_update().clone();
            let connector_id = record.connector_id.clone();
            let ledger = Arc::clone(&ledger);
            if let Err(e) = off_runtime(move || ledger.save(&record)).await {
                warn!(connector = %connector_id, error = %e, "failed to persist restart record");
            }
        }
    })
}

/// Run blocking store I/O on the blocking pool.
async fn off_runtime<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Store(format!("store task failed: {e}")))?
}

fn describe_exit(exit: Result<String>) -> String {
    match exit {
        Ok(status) => status,
        Err(e) => e.to_string(),
    }
}
