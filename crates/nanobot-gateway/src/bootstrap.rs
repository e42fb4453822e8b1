use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use nanobot_bridge::{BridgeSpawner, ChannelLimits};
use nanobot_common::{BridgeState, Error, Result};
use nanobot_config::AppConfig;
use nanobot_store::{RestartLedger, SessionStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::connector::Connector;
use crate::inbox::AgentInbox;
use crate::router::{InboundRouter, MessageRouter, OutboundLanes, RouterStats};
use crate::state::{AppState, SharedState};
use crate::status::StatusBoard;
use crate::supervisor::Supervisor;
use crate::supervisor::instance::InstanceContext;

/// The running core: stores, router and supervisor, with every enabled
/// connector activated.
pub struct Gateway {
    state: SharedState,
    router_task: JoinHandle<()>,
}

impl Gateway {
    pub async fn start(
        config: AppConfig,
        data_dir: &Path,
        spawner: Arc<dyn BridgeSpawner>,
    ) -> Result<Self> {
        let sessions = Arc::new(SessionStore::open(&data_dir.join("sessions"))?);
        let ledger = Arc::new(RestartLedger::open(&data_dir.join("supervisor"))?);
        let board = Arc::new(StatusBoard::new(config.router.event_queue_capacity));
        let lanes = Arc::new(OutboundLanes::default());
        let router_stats = Arc::new(RouterStats::default());

        let (inbox_tx, inbox) = AgentInbox::channel(config.router.inbox_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.router.event_queue_capacity.max(1));
        let inbound = InboundRouter::new(
            config.router.reorder_window,
            config.router.gap_timeout(),
            inbox_tx,
            Arc::clone(&router_stats),
        );
        let router_task = tokio::spawn(inbound.run(inbound_rx, board.subscribe()));

        let ctx = InstanceContext {
            spawner,
            sessions: Arc::clone(&sessions),
            ledger,
            board: Arc::clone(&board),
            lanes: Arc::clone(&lanes),
            inbound: inbound_tx,
            timing: config.supervisor.clone(),
            limits: ChannelLimits {
                queue_depth: config.channel.queue_depth,
                max_frame_bytes: config.channel.max_frame_bytes,
            },
        };
        let supervisor = Arc::new(Supervisor::new(ctx, config.router.outbound_queue_capacity));
        let router = Arc::new(MessageRouter::new(
            lanes,
            Arc::clone(&board),
            config.router.ack_timeout(),
        ));

        let connectors = Connector::all_from(&config);
        for connector in &connectors {
            supervisor.register(connector.clone());
        }
        for connector in &connectors {
            supervisor.activate(&connector.id)?;
        }
        info!("gateway started with {} connector(s)", connectors.len());

        let state = Arc::new(AppState {
            config,
            supervisor,
            router,
            board,
            sessions,
            inbox,
            router_stats,
            started_at: Instant::now(),
        });
        Ok(Self { state, router_task })
    }

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Wait for every required connector to come up. Fails if one of them
    /// ends up `Failed`.
    pub async fn wait_for_required(&self) -> Result<()> {
        for id in self.state.supervisor.required_connectors() {
            match self.state.supervisor.wait_settled(&id).await {
                BridgeState::Failed => {
                    let reason = self
                        .state
                        .board
                        .get(&id)
                        .and_then(|s| s.last_error)
                        .unwrap_or_else(|| "unknown error".into());
                    return Err(Error::Supervisor(format!(
                        "required connector '{id}' failed to start: {reason}"
                    )));
                }
                state => info!(connector = %id, state = %state, "required connector settled"),
            }
        }
        Ok(())
    }

    /// Stop every bridge, then the router.
    pub async fn shutdown(self) {
        self.state.supervisor.shutdown().await;
        self.router_task.abort();
        info!("gateway stopped");
    }
}
