use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use nanobot_bridge::{BridgeSpawner, CommandSpawner};
use nanobot_common::{Error, Result};
use nanobot_config::AppConfig;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::bootstrap::Gateway;
use crate::routes::build_router;

/// The main gateway server: binds the control port, runs the supervisor and
/// serves the API until shut down.
pub struct GatewayServer {
    config: AppConfig,
    data_dir: PathBuf,
    spawner: Arc<dyn BridgeSpawner>,
}

impl GatewayServer {
    pub fn new(config: AppConfig, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            data_dir: data_dir.into(),
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn BridgeSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = format!("{}:{}", self.config.gateway.host, self.config.gateway.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Gateway(format!("failed to bind {addr}: {e}")))?;
        info!("nanobot gateway listening on {}", addr);

        let gateway = Gateway::start(self.config, &self.data_dir, self.spawner).await?;
        let app = build_router(gateway.state());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        tokio::pin!(shutdown);
        let result = tokio::select! {
            ready = gateway.wait_for_required() => match ready {
                Ok(()) => {
                    info!("gateway ready");
                    (&mut shutdown).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            _ = &mut shutdown => Ok(()),
        };

        info!("shutting down gateway");
        let _ = stop_tx.send(());
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("server error during shutdown: {e}"),
            Err(e) => warn!("server task failed: {e}"),
        }
        gateway.shutdown().await;
        result
    }
}

/// Completes on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
