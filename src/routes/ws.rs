use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use crate::streamer::Streamer;

/// `GET /ws/state` — upgrades to a push feed of replay state: a snapshot on
/// connect, then incremental updates as the job steps, plus a reset envelope
/// whenever the working list or job changes underneath the subscriber.
pub async fn ws_handler(ws: WebSocketUpgrade, State(streamer): State<Arc<Streamer>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, streamer))
}

async fn handle_socket(socket: WebSocket, streamer: Arc<Streamer>) {
    let mut rx = streamer.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let envelope = match envelope {
                    Some(envelope) => envelope,
                    None => break,
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(%err, "failed to encode ws envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Clients only receive on this feed; anything else is ignored.
                    _ => {}
                }
            }
        }
    }
}
