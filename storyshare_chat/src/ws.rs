use crate::api::AppState;
use crate::auth::AuthUser;
use crate::relay::RelayConnection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Extension, State},
    response::IntoResponse,
};
use chat_api::{ClientEvent, ServerEvent};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tracing::{debug, warn};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(stream: WebSocket, state: AppState, user: AuthUser) {
    let (mut sender, mut receiver) = stream.split();
    let mut conn = state.relay.connect();
    debug!(conn = conn.id(), user_id = user.id, "socket connected");
    loop {
        tokio::select! {
            Some(event) = conn.recv() => {
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(conn = conn.id(), error = %e, "socket read failed");
                        break;
                    }
                };
                if let Some(reply) = handle_client_event(&state, &mut conn, user, &text) {
                    if send_event(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!(conn = conn.id(), user_id = user.id, "socket closed");
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(WsMessage::Text(text)).await
}

fn error_event(error: &str) -> ServerEvent {
    ServerEvent::Error {
        error: error.into(),
    }
}

/// Apply one client event to the connection, returning the direct reply if
/// the event warrants one.
fn handle_client_event(
    state: &AppState,
    conn: &mut RelayConnection,
    user: AuthUser,
    text: &str,
) -> Option<ServerEvent> {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(_) => return Some(error_event("invalid_event")),
    };
    match event {
        ClientEvent::Join { user_id } => {
            // a socket may only join as the user its token names
            if user_id != user.id {
                return Some(error_event("join_forbidden"));
            }
            conn.join(user_id);
            Some(ServerEvent::Joined { user_id })
        }
        ClientEvent::Leave => {
            conn.leave();
            Some(ServerEvent::Left)
        }
        ClientEvent::Typing { receiver_id } => match conn.user_id() {
            Some(from) if from == receiver_id => Some(error_event("cannot_message_self")),
            Some(from) => {
                state.relay.typing(from, receiver_id);
                None
            }
            None => Some(error_event("not_joined")),
        },
        ClientEvent::StopTyping { receiver_id } => match conn.user_id() {
            Some(from) if from == receiver_id => Some(error_event("cannot_message_self")),
            Some(from) => {
                state.relay.stop_typing(from, receiver_id);
                None
            }
            None => Some(error_event("not_joined")),
        },
    }
}
