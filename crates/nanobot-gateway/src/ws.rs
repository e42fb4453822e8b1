use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use nanobot_common::{ConnectorId, ConversationId, DeliveryResult, Envelope, Error};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::api::error_response;
use crate::inbox::InboxLease;
use crate::router::OutboundOutcome;
use crate::state::SharedState;

/// Messages the agent runtime sends over its socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentMessage {
    Send {
        #[serde(default)]
        request_id: Option<String>,
        connector_id: ConnectorId,
        conversation_id: ConversationId,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Ping,
}

/// GET /ws/agent: attach the agent runtime. Only one agent at a time.
pub async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    let Some(lease) = state.inbox.attach() else {
        warn!("refused second agent attachment");
        return error_response(&Error::Conflict("an agent is already attached".into()));
    };
    ws.on_upgrade(move |socket| handle_agent(socket, state, lease))
        .into_response()
}

async fn handle_agent(socket: WebSocket, state: SharedState, mut lease: InboxLease) {
    info!("agent attached");
    let (mut sender, mut receiver) = socket.split();
    let mut statuses = state.board.subscribe();
    let (replies_tx, mut replies) = mpsc::unbounded_channel::<serde_json::Value>();

    let hello = serde_json::json!({
        "type": "attached",
        "connectors": state.board.list(),
    });
    if push(&mut sender, &hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            envelope = lease.recv() => {
                let Some(envelope) = envelope else {
                    info!("inbound router stopped, closing agent socket");
                    break;
                };
                let msg = serde_json::json!({ "type": "inbound", "envelope": &envelope });
                if push(&mut sender, &msg).await.is_err() {
                    lease.give_back(envelope);
                    break;
                }
            }
            status = statuses.recv() => match status {
                Ok(status) => {
                    let msg = serde_json::json!({ "type": "status", "status": status });
                    if push(&mut sender, &msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("agent socket skipped {n} status updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(reply) = replies.recv() => {
                if push(&mut sender, &reply).await.is_err() {
                    break;
                }
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_agent_message(&state, text.as_str(), &replies_tx);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("agent socket error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    info!("agent detached");
}

fn handle_agent_message(
    state: &SharedState,
    text: &str,
    replies: &mpsc::UnboundedSender<serde_json::Value>,
) {
    let message = match serde_json::from_str::<AgentMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("unparseable agent message: {e}");
            let _ = replies.send(serde_json::json!({
                "type": "error",
                "error": format!("invalid message: {e}"),
            }));
            return;
        }
    };

    match message {
        AgentMessage::Ping => {
            let _ = replies.send(serde_json::json!({ "type": "pong" }));
        }
        AgentMessage::Send {
            request_id,
            connector_id,
            conversation_id,
            payload,
        } => {
            // Enqueue here, on the socket task, so sends keep the agent's order.
            let envelope = Envelope::outbound(connector_id, conversation_id, payload);
            let pending = match state.router.enqueue_outbound(envelope) {
                Ok(pending) => pending,
                Err(reason) => {
                    let refused = OutboundOutcome::Nacked(reason);
                    let _ = replies.send(outbound_result(request_id.as_deref(), &refused));
                    return;
                }
            };
            let router = std::sync::Arc::clone(&state.router);
            let replies = replies.clone();
            tokio::spawn(async move {
                let pending = match router.settle(pending).await {
                    OutboundOutcome::Queued(pending) => {
                        let _ = replies.send(serde_json::json!({
                            "type": "outbound_result",
                            "request_id": request_id,
                            "outcome": "queued",
                            "sequence": pending.sequence(),
                        }));
                        pending
                    }
                    done => {
                        let _ = replies.send(outbound_result(request_id.as_deref(), &done));
                        return;
                    }
                };

                let connector_id = pending.connector_id().clone();
                let conversation_id = pending.conversation_id().clone();
                let sequence = pending.sequence();
                let result = pending.wait().await;
                let mut msg = delivery_fields(&result);
                msg["type"] = "delivery".into();
                msg["request_id"] = serde_json::json!(request_id);
                msg["connector_id"] = serde_json::json!(connector_id);
                msg["conversation_id"] = serde_json::json!(conversation_id);
                msg["sequence"] = sequence.into();
                let _ = replies.send(msg);
            });
        }
    }
}

fn outbound_result(request_id: Option<&str>, outcome: &OutboundOutcome) -> serde_json::Value {
    let mut msg = match outcome {
        OutboundOutcome::Acked(ack) => {
            let mut msg = delivery_fields(&Ok(ack.clone()));
            msg["sequence"] = ack.sequence.into();
            msg
        }
        OutboundOutcome::Nacked(reason) => delivery_fields(&Err(reason.clone())),
        OutboundOutcome::Queued(pending) => serde_json::json!({
            "outcome": "queued",
            "sequence": pending.sequence(),
        }),
    };
    msg["type"] = "outbound_result".into();
    msg["request_id"] = serde_json::json!(request_id);
    msg
}

fn delivery_fields(result: &DeliveryResult) -> serde_json::Value {
    match result {
        Ok(ack) => serde_json::json!({
            "outcome": "acked",
            "platform_message_id": ack.platform_message_id,
        }),
        Err(reason) => serde_json::json!({
            "outcome": "nacked",
            "reason": reason.as_code(),
        }),
    }
}

async fn push(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &serde_json::Value,
) -> Result<(), axum::Error> {
    sender.send(Message::Text(msg.to_string().into())).await
}
