//! WebSocket gateway: upgrade, session I/O tasks, event routing

use std::sync::{Arc, Mutex};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{GameMatch, InputPayload};
use crate::util::time::{monotonic_ms, unix_millis};
use crate::ws::protocol::{ClientMsg, ServerMsg};
use crate::ws::{Outbound, SessionHandle};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().simple().to_string();
    info!(session_id = %session_id, "new session");

    let (ws_sink, mut ws_stream) = socket.split();
    let (handle, outbound_rx) = SessionHandle::new(session_id.clone());

    // Writer task: session channel -> WebSocket
    let writer = tokio::spawn(run_writer(ws_sink, outbound_rx));

    // Set once the matchmaker places this session
    let mut binding: Option<(Arc<Mutex<GameMatch>>, String)> = None;

    // Reader loop: WebSocket -> owning match
    while let Some(result) = ws_stream.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "websocket error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "unparseable client message");
                        continue;
                    }
                };
                if !dispatch(&state, &handle, &mut binding, client_msg) {
                    break;
                }
            }
            Message::Close(_) => {
                info!(session_id = %session_id, "client initiated close");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                warn!(session_id = %session_id, "binary message ignored");
            }
        }
    }

    // The owning match runs the disconnect state machine; the gateway only
    // reports the session closing
    if let Some((game_match, player_id)) = &binding {
        game_match
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle_disconnect(player_id, monotonic_ms());
    }

    writer.abort();
    info!(session_id = %session_id, "session closed");
}

/// Route one client event. Returns false when the session must end.
fn dispatch(
    state: &AppState,
    handle: &SessionHandle,
    binding: &mut Option<(Arc<Mutex<GameMatch>>, String)>,
    msg: ClientMsg,
) -> bool {
    match msg {
        ClientMsg::JoinQueue {
            region,
            name,
            player_match_id,
        } => {
            if binding.is_some() {
                warn!(session_id = %handle.session_id(), "joinQueue while already placed");
                return true;
            }
            if !state.config.valid_regions.contains(&region) {
                warn!(session_id = %handle.session_id(), %region, "invalid region");
                state.metrics.record_error();
                handle.emit(ServerMsg::Error {
                    message: format!("Invalid region: {}", region),
                });
                handle.disconnect();
                return false;
            }

            match state.matchmaker.enqueue_player(
                handle.clone(),
                &name,
                region,
                player_match_id,
                monotonic_ms(),
            ) {
                Ok(placed) => {
                    *binding = Some(placed);
                    true
                }
                Err(e) => {
                    state.metrics.record_error();
                    handle.emit(ServerMsg::Error {
                        message: e.to_string(),
                    });
                    handle.disconnect();
                    false
                }
            }
        }

        ClientMsg::PlayerInput { tick, vector } => {
            if let Some((game_match, player_id)) = binding {
                game_match.lock().unwrap_or_else(|e| e.into_inner()).queue_input(
                    player_id,
                    InputPayload {
                        tick,
                        vector: vector.sanitized(),
                    },
                    monotonic_ms(),
                );
            }
            true
        }

        ClientMsg::ProjectileHit {
            enemy_id,
            projectile_id,
        } => {
            if let Some((game_match, player_id)) = binding {
                game_match
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handle_projectile_hit(player_id, &enemy_id, &projectile_id, monotonic_ms());
            }
            true
        }

        ClientMsg::ToggleBystander => {
            if let Some((game_match, player_id)) = binding {
                game_match
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .toggle_bystander(player_id);
            }
            true
        }

        // Answered in place: the probe is opaque and touches no match state
        ClientMsg::MPing { payload } => {
            handle.emit(ServerMsg::MPong {
                server_time: unix_millis(),
                echoed: payload,
            });
            true
        }
    }
}

/// Pump serialized frames from the session channel into the socket.
async fn run_writer(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Msg(msg) => match serde_json::to_string(&msg) {
                Ok(json) => sink.send(Message::Text(json)).await,
                Err(e) => {
                    warn!(error = %e, "outbound serialization failed");
                    continue;
                }
            },
            Outbound::Frame(frame) => sink.send(Message::Text(frame.to_string())).await,
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}
