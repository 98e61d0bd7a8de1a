//! Live anomaly stream over `/ws`.
//!
//! Clients receive only durable anomalies (published after the store insert
//! succeeded), filtered per subscriber. A subscriber whose queue saturates
//! is disconnected with reason `slow_consumer` without affecting others.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::bus::{ws_json, BusEvent, ClientMessage, SubscriberFilter};
use crate::state::AppState;

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(guard) = state.bus.try_connect() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "subscriber limit reached").into_response();
    };
    ws.on_upgrade(move |socket| async move {
        let _guard = guard;
        handle_ws(socket, state).await;
    })
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.bus.subscribe();
    let mut filter = SubscriberFilter::default();
    let mut heartbeat = tokio::time::interval(state.config.ws.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let hello = ws_json("connected", Some(json!({ "filters": filter })));
    if sender.send(Message::Text(hello.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(BusEvent::Anomaly(anomaly)) => {
                    if !filter.matches(&anomaly) {
                        continue;
                    }
                    let msg = ws_json("anomaly", Some(anomaly.as_ref()));
                    if sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Ok(BusEvent::Shutdown) => {
                    close(&mut sender, "shutdown").await;
                    break;
                }
                Err(RecvError::Lagged(dropped)) => {
                    debug!(dropped, "subscriber queue saturated");
                    close(&mut sender, "slow_consumer").await;
                    break;
                }
                Err(RecvError::Closed) => break,
            },

            _ = heartbeat.tick() => {
                let msg = ws_json::<()>("heartbeat", None);
                if sender.send(Message::Text(msg.into())).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Subscribe { filters }) => {
                            info!(?filters, "subscriber updated filters");
                            filter = filters;
                            let ack = ws_json("subscribed", Some(json!({ "filters": filter })));
                            if sender.send(Message::Text(ack.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(ClientMessage::Ping) => {
                            let pong = ws_json::<()>("pong", None);
                            if sender.send(Message::Text(pong.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("ignoring unparsable client message: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

async fn close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    reason: &'static str,
) {
    let frame = CloseFrame {
        code: axum::extract::ws::close_code::AWAY,
        reason: reason.into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}
