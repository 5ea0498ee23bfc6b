//! The websocket side of a client: two tasks per connection, one draining
//! the subscriber queue to the socket and one feeding socket frames into the
//! room. Whichever side finishes first aborts the other, and a final leave
//! is always posted so the room's roster stays honest.

use crate::room::{RoomHandle, SentMsg, Subscriber, SubscriberId, SubscriberMsg};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::Player;
use tokio::sync::mpsc;

/// Runs one client's session from the websocket upgrade to disconnect.
pub async fn client_session(socket: WebSocket, room: RoomHandle, player: Player) {
    // By splitting, we can send and receive at the same time.
    let (sink, stream) = socket.split();

    let (subscriber, sub_rx) = Subscriber::channel();
    let subscriber_id = subscriber.id();
    tracing::info!(player = %player.name, "client joined a room");
    room.join(SubscriberMsg { subscriber, player }).await;

    let mut write_task = tokio::spawn(write_to_socket(sink, sub_rx));
    let reader_room = room.clone();
    let mut read_task = tokio::spawn(read_from_socket(stream, reader_room, subscriber_id));

    // If any one of the tasks runs to completion, we abort the other.
    tokio::select! {
        _ = &mut write_task => read_task.abort(),
        _ = &mut read_task => write_task.abort(),
    }

    // harmless when the room already dropped this subscriber (or is gone)
    room.leave(subscriber_id).await;
}

/// Forwards every client frame to the room in arrival order.
async fn read_from_socket(
    mut stream: SplitStream<WebSocket>,
    room: RoomHandle,
    subscriber_id: SubscriberId,
) {
    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Text(text)) => {
                let message = Bytes::from(text.as_str().to_owned());
                room.send_message(SentMsg { message, sender: subscriber_id }).await;
            }
            Ok(Message::Binary(buf)) => {
                room.send_message(SentMsg { message: Bytes::from(buf), sender: subscriber_id }).await;
            }
            Ok(Message::Close(_)) => return,
            Ok(_) => {} // ping/pong is answered by axum itself
            Err(err) => {
                tracing::debug!(%err, "client closed the connection");
                return;
            }
        }
    }
}

/// Drains the subscriber queue to the socket until the room closes it.
async fn write_to_socket(
    mut sink: SplitSink<WebSocket, Message>,
    mut sub_rx: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = sub_rx.recv().await {
        let text = match String::from_utf8(frame.to_vec()) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(%err, "dropping non-utf8 frame");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    // the room closed the channel: say goodbye to the socket
    let _ = sink.send(Message::Close(None)).await;
}
