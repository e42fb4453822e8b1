use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use nanobot_common::Error;
use nanobot_config::{AppConfig, ConnectorConfig, RestartPolicyConfig};
use nanobot_gateway::GatewayServer;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;

/// Pick a random available port.
fn random_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
    listener.local_addr().unwrap().port()
}

/// A connector whose bridge binary does not exist, so it fails on first spawn.
fn broken_connector(required: bool) -> ConnectorConfig {
    ConnectorConfig {
        connector_type: "whatsapp".to_string(),
        command: "/nonexistent/nanobot-test-bridge".to_string(),
        args: vec![],
        env: Default::default(),
        working_dir: None,
        required,
        enabled: None,
        restart: Some(RestartPolicyConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            reset_after_secs: 300,
            max_attempts: 1,
        }),
    }
}

fn test_config(api_key: Option<&str>, required: bool) -> AppConfig {
    let mut config = AppConfig::default();
    config.gateway.host = "127.0.0.1".to_string();
    config.gateway.port = random_port();
    config.gateway.api_key = api_key.map(str::to_string);
    config
        .connectors
        .insert("wa1".to_string(), broken_connector(required));
    config
}

struct TestGateway {
    base: String,
    client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<nanobot_common::Result<()>>,
    _dir: TempDir,
}

impl TestGateway {
    async fn start(config: AppConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = config.gateway.port;
        let (stop, stopped) = oneshot::channel::<()>();
        let server = GatewayServer::new(config, dir.path());
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        // Wait for the server to be ready
        for _ in 0..50 {
            if TcpListener::bind(format!("127.0.0.1:{port}")).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Self {
            base: format!("127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            stop: Some(stop),
            task,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.base, path)
    }

    async fn get_json(&self, path: &str) -> (u16, serde_json::Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    async fn post(&self, path: &str) -> (u16, serde_json::Value) {
        let resp = self.client.post(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    async fn wait_for_state(&self, state: &str) {
        for _ in 0..100 {
            let (_, body) = self.get_json("/api/connectors/wa1").await;
            if body["state"] == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("wa1 never reached {state}");
    }

    async fn stop(mut self) -> nanobot_common::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("gateway did not stop")
            .expect("gateway task panicked")
    }
}

#[tokio::test]
async fn health_is_open_but_api_requires_key() {
    let gw = TestGateway::start(test_config(Some("secret-token"), false)).await;

    let health = gw.client.get(gw.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let (status, _) = gw.get_json("/api/connectors").await;
    assert_eq!(status, 401);

    let wrong = gw
        .client
        .get(gw.url("/api/connectors"))
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let bearer = gw
        .client
        .get(gw.url("/api/connectors"))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(bearer.status(), 200);

    let (status, _) = gw.get_json("/api/status?token=secret-token").await;
    assert_eq!(status, 200);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn connectors_are_listed_and_unknown_ids_are_404() {
    let gw = TestGateway::start(test_config(None, false)).await;

    let (status, body) = gw.get_json("/api/connectors").await;
    assert_eq!(status, 200);
    let connectors = body["connectors"].as_array().unwrap();
    assert_eq!(connectors.len(), 1);
    assert_eq!(connectors[0]["connector_id"], "wa1");
    assert_eq!(connectors[0]["connector_type"], "whatsapp");

    gw.wait_for_state("failed").await;
    let (status, body) = gw.get_json("/api/connectors/wa1").await;
    assert_eq!(status, 200);
    assert_eq!(body["consecutive_failures"], 1);
    assert!(body["last_error"].is_string());

    let (status, _) = gw.get_json("/api/connectors/nope").await;
    assert_eq!(status, 404);

    // Never paired, so there is no session to show.
    let (status, _) = gw.get_json("/api/connectors/wa1/session").await;
    assert_eq!(status, 404);

    let (status, body) = gw.get_json("/api/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["connectors"], 1);
    assert_eq!(body["agent_attached"], false);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn operator_commands_are_accepted_or_conflict() {
    let gw = TestGateway::start(test_config(None, false)).await;
    gw.wait_for_state("failed").await;

    let (status, body) = gw.post("/api/connectors/wa1/pair").await;
    assert_eq!(status, 202);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["command"], "pair");

    let (status, body) = gw.post("/api/connectors/wa1/deactivate").await;
    assert_eq!(status, 202);
    assert_eq!(body["command"], "deactivate");
    gw.wait_for_state("stopped").await;

    let mut conflicted = false;
    for _ in 0..50 {
        let (status, _) = gw.post("/api/connectors/wa1/deactivate").await;
        if status == 409 {
            conflicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(conflicted, "deactivating a stopped connector should conflict");

    let (status, _) = gw.post("/api/connectors/wa1/restart").await;
    assert_eq!(status, 202);
    gw.wait_for_state("failed").await;

    let (status, _) = gw.post("/api/connectors/nope/pair").await;
    assert_eq!(status, 404);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn second_agent_attach_is_refused() {
    let gw = TestGateway::start(test_config(None, false)).await;
    let ws_url = format!("ws://{}/ws/agent", gw.base);

    let (mut first, _) = connect_async(&ws_url).await.expect("first agent attaches");
    let hello = tokio::time::timeout(Duration::from_secs(5), first.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let hello: serde_json::Value = serde_json::from_str(hello.to_text().unwrap()).unwrap();
    assert_eq!(hello["type"], "attached");

    match connect_async(&ws_url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status(), 409)
        }
        other => panic!("expected 409, got {:?}", other.map(|_| ())),
    }

    let (_, body) = gw.get_json("/api/status").await;
    assert_eq!(body["agent_attached"], true);

    drop(first);
    gw.stop().await.unwrap();
}

#[tokio::test]
async fn failed_required_connector_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    let server = GatewayServer::new(test_config(None, true), dir.path());

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        server.run_until(std::future::pending::<()>()),
    )
    .await
    .expect("startup should settle");

    match result {
        Err(Error::Supervisor(msg)) => assert!(msg.contains("wa1"), "{msg}"),
        other => panic!("expected supervisor error, got {other:?}"),
    }
    assert_state_persisted(dir.path());
}

fn assert_state_persisted(data_dir: &Path) {
    assert!(data_dir.join("supervisor").is_dir());
    assert!(data_dir.join("sessions").is_dir());
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = test_config(None, false);
    config.gateway.port = taken.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();

    let result = GatewayServer::new(config, dir.path())
        .run_until(std::future::pending::<()>())
        .await;
    match result {
        Err(Error::Gateway(msg)) => assert!(msg.contains("failed to bind"), "{msg}"),
        other => panic!("expected bind error, got {other:?}"),
    }
}
