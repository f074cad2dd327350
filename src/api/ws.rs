//! Websocket adapter onto `BroadcastHub`

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use super::routes::AppState;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let hub = state.hub.clone();
    let (id, mut outbound) = hub.connect();
    let (mut sender, mut receiver) = socket.split();

    // Writer drains the connection's queue; it ends when the hub drops the
    // connection or the socket closes
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = hub.handle_client_text(id, &text) {
                            debug!(connection = %id, error = %e, "Client message not applied");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "Websocket read error");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(id);
    writer.abort();
}
