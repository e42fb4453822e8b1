//! In-memory bridges for exercising supervisor instances without processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nanobot_bridge::{
    BRIDGE_PROTOCOL_VERSION, BridgeCapability, BridgeChild, BridgeCodec, BridgeFrame,
    BridgeHandshake, BridgeSpawner, ChannelLimits, SpawnRequest, SpawnedBridge,
};
use nanobot_common::{ConnectorId, ConnectorStatus, Envelope, Error, Result};
use nanobot_config::{RestartPolicyConfig, SupervisorConfig};
use nanobot_store::{RestartLedger, SessionStore};
use tempfile::TempDir;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::connector::Connector;
use crate::router::{MessageRouter, OutboundLanes};
use crate::status::StatusBoard;
use crate::supervisor::Supervisor;
use crate::supervisor::instance::InstanceContext;

const MAX_FRAME: usize = 256 * 1024;

pub fn handshake_for(connector_type: &str) -> BridgeHandshake {
    BridgeHandshake {
        protocol_version: BRIDGE_PROTOCOL_VERSION,
        bridge_name: "fake-bridge".into(),
        bridge_version: "0.0.1".into(),
        connector_type: connector_type.into(),
        capabilities: vec![
            BridgeCapability::Pair,
            BridgeCapability::Send,
            BridgeCapability::Receive,
            BridgeCapability::Heartbeat,
            BridgeCapability::DeliveryReceipts,
        ],
    }
}

/// Spawner that hands the bridge end of every spawn to the test.
pub struct FakeSpawner {
    bridges: mpsc::UnboundedSender<FakeBridge>,
    fail: AtomicBool,
    spawns: AtomicU32,
}

impl FakeSpawner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeBridge>) {
        let (bridges, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            bridges,
            fail: AtomicBool::new(false),
            spawns: AtomicU32::new(0),
        });
        (spawner, rx)
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BridgeSpawner for FakeSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedBridge> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Bridge(format!(
                "failed to spawn bridge '{}'",
                request.command
            )));
        }

        let (gateway_side, bridge_side) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(gateway_side);
        let (bridge_reader, bridge_writer) = tokio::io::split(bridge_side);
        let (alive, alive_rx) = watch::channel(());

        let bridge = FakeBridge {
            request: request.clone(),
            frames: FramedRead::new(bridge_reader, BridgeCodec::new(MAX_FRAME)),
            sink: FramedWrite::new(bridge_writer, BridgeCodec::new(MAX_FRAME)),
            alive: Some(alive),
        };
        let _ = self.bridges.send(bridge);

        Ok(SpawnedBridge {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: Box::new(FakeChild {
                alive: alive_rx,
                killed: false,
            }),
        })
    }
}

struct FakeChild {
    alive: watch::Receiver<()>,
    killed: bool,
}

#[async_trait]
impl BridgeChild for FakeChild {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<String> {
        if self.killed {
            return Ok("killed".into());
        }
        while self.alive.changed().await.is_ok() {}
        Ok("exited".into())
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed = true;
        Ok(())
    }
}

/// The bridge side of a fake spawn. Dropping it, or calling [`exit`](Self::exit),
/// makes the child look like it exited.
pub struct FakeBridge {
    pub request: SpawnRequest,
    frames: FramedRead<ReadHalf<DuplexStream>, BridgeCodec>,
    sink: FramedWrite<WriteHalf<DuplexStream>, BridgeCodec>,
    alive: Option<watch::Sender<()>>,
}

impl FakeBridge {
    pub async fn send(&mut self, frame: BridgeFrame) {
        self.sink
            .send(frame.to_bytes().unwrap())
            .await
            .expect("gateway side open");
    }

    pub async fn send_raw(&mut self, body: &'static [u8]) {
        self.sink
            .send(Bytes::from_static(body))
            .await
            .expect("gateway side open");
    }

    /// Next well-formed frame from the gateway, `None` once it hung up.
    pub async fn recv(&mut self) -> Option<BridgeFrame> {
        loop {
            match self.frames.next().await? {
                Ok(Ok(frame)) => return Some(frame),
                Ok(Err(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Send a valid handshake for the requested type and return the reply.
    pub async fn handshake(&mut self) -> BridgeFrame {
        let payload = handshake_for(&self.request.connector_type);
        self.send(BridgeFrame::Handshake { payload }).await;
        self.recv().await.expect("handshake reply")
    }

    pub fn exit(&mut self) {
        self.alive.take();
    }
}

pub struct HarnessOptions {
    pub max_attempts: u32,
    pub inbound_capacity: usize,
    pub channel_queue_depth: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            inbound_capacity: 64,
            channel_queue_depth: ChannelLimits::default().queue_depth,
        }
    }
}

/// A supervisor for one `wa1` whatsapp connector, wired to fake bridges.
pub struct Harness {
    pub supervisor: Arc<Supervisor>,
    pub board: Arc<StatusBoard>,
    pub sessions: Arc<SessionStore>,
    pub ledger: Arc<RestartLedger>,
    pub router: Arc<MessageRouter>,
    pub spawner: Arc<FakeSpawner>,
    pub inbound: mpsc::Receiver<Envelope>,
    bridges: mpsc::UnboundedReceiver<FakeBridge>,
    updates: broadcast::Receiver<ConnectorStatus>,
    _dir: TempDir,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::open(&dir.path().join("sessions")).unwrap());
        let ledger = Arc::new(RestartLedger::open(&dir.path().join("supervisor")).unwrap());
        let board = Arc::new(StatusBoard::new(1024));
        let updates = board.subscribe();
        let lanes = Arc::new(OutboundLanes::default());
        let (inbound_tx, inbound) = mpsc::channel(options.inbound_capacity);
        let (spawner, bridges) = FakeSpawner::new();

        let ctx = InstanceContext {
            spawner: Arc::clone(&spawner) as Arc<dyn BridgeSpawner>,
            sessions: Arc::clone(&sessions),
            ledger: Arc::clone(&ledger),
            board: Arc::clone(&board),
            lanes: Arc::clone(&lanes),
            inbound: inbound_tx,
            timing: SupervisorConfig::default(),
            limits: ChannelLimits {
                queue_depth: options.channel_queue_depth,
                ..ChannelLimits::default()
            },
        };
        let supervisor = Arc::new(Supervisor::new(ctx, 8));
        let restart = RestartPolicyConfig {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            reset_after_secs: 300,
            max_attempts: options.max_attempts,
        };
        supervisor.register(Connector {
            id: ConnectorId::from_string("wa1"),
            connector_type: "whatsapp".into(),
            command: "whatsapp-bridge".into(),
            args: Vec::new(),
            env: Default::default(),
            working_dir: None,
            required: true,
            restart,
        });

        let router = Arc::new(MessageRouter::new(
            lanes,
            Arc::clone(&board),
            Duration::from_secs(10),
        ));

        Self {
            supervisor,
            board,
            sessions,
            ledger,
            router,
            spawner,
            inbound,
            bridges,
            updates,
            _dir: dir,
        }
    }

    pub fn wa1(&self) -> ConnectorId {
        ConnectorId::from_string("wa1")
    }

    pub async fn next_bridge(&mut self) -> FakeBridge {
        tokio::time::timeout(Duration::from_secs(3600), self.bridges.recv())
            .await
            .expect("bridge was never spawned")
            .expect("spawner dropped")
    }

    /// Consume published statuses until one matches.
    pub async fn wait_for(&mut self, predicate: impl Fn(&ConnectorStatus) -> bool) -> ConnectorStatus {
        let updates = &mut self.updates;
        let wait = async {
            loop {
                match updates.recv().await {
                    Ok(status) if predicate(&status) => return status,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        panic!("status updates lagged by {n}")
                    }
                    Err(broadcast::error::RecvError::Closed) => panic!("status board dropped"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(3600), wait)
            .await
            .expect("status never reached")
    }
}
