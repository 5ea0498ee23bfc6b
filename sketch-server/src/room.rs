//! The room runtime: a single loop task that owns one game's state and
//! multiplexes every event against it. External tasks only ever talk to a
//! room through its channels. No lock guards the game state because only the
//! loop touches it.

use crate::handlers::{error_frame, leave_frame, terminate_frame};
use crate::state::{unix_now, GameResult, GameState, Snapshot};
use bytes::Bytes;
use protocol::{Player, CHANNEL_BUFFER_SIZE};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a room lives past its last start or reset.
const ROOM_TTL_SECS: i64 = 15 * 60;

/// Side effects a room triggers outside its own loop. Implementations must
/// not block: anything slow belongs on a spawned task.
pub trait RoomHandler: Send + 'static {
    /// Called once per finished game with the ranked results.
    fn do_shutdown(&self, results: Vec<GameResult>);
    /// Called for every save request with the captured drawing.
    fn do_capture(&self, snapshot: Snapshot);
}

/// The face a room shows the broker store.
pub trait Broker: Send + Sync + 'static {
    fn stop(&self, code: u8);
    fn is_expired(&self, now_unix: i64) -> bool;
    fn is_public(&self) -> bool;
}

pub type SubscriberId = u64;

/// One client's handle for receiving room broadcasts. Created by the
/// transport, handed to the room on join. The room keeps the only sender, so
/// removing it from the subscriber table is what closes the channel, and
/// that can only ever happen once per subscriber.
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Bytes>,
}

impl Subscriber {
    /// Allocates a fresh subscriber with its bounded frame queue.
    pub fn channel() -> (Subscriber, mpsc::Receiver<Bytes>) {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        (Subscriber { id, tx }, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

/// A join request: the new subscriber and who they are.
pub struct SubscriberMsg {
    pub subscriber: Subscriber,
    pub player: Player,
}

/// A raw client frame and who sent it.
pub struct SentMsg {
    pub message: Bytes,
    pub sender: SubscriberId,
}

/// The cloneable handle used by the store and the transports to reach a
/// running room.
#[derive(Clone)]
pub struct RoomHandle {
    join_tx: mpsc::Sender<SubscriberMsg>,
    leave_tx: mpsc::Sender<SubscriberId>,
    message_tx: mpsc::Sender<SentMsg>,
    stop_tx: mpsc::Sender<u8>,
    expire_time: Arc<AtomicI64>,
    is_public: bool,
}

impl RoomHandle {
    /// Enqueues a join. A send failure means the room already terminated, in
    /// which case the subscriber is simply dropped.
    pub async fn join(&self, msg: SubscriberMsg) {
        let _ = self.join_tx.send(msg).await;
    }

    pub async fn leave(&self, subscriber: SubscriberId) {
        let _ = self.leave_tx.send(subscriber).await;
    }

    pub async fn send_message(&self, msg: SentMsg) {
        let _ = self.message_tx.send(msg).await;
    }
}

impl Broker for RoomHandle {
    /// Non-blocking by design: the sweeper must never wait on a room loop.
    fn stop(&self, code: u8) {
        let _ = self.stop_tx.try_send(code);
    }

    fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expire_time.load(Ordering::Relaxed)
    }

    fn is_public(&self) -> bool {
        self.is_public
    }
}

struct RoomSubscriber {
    tx: mpsc::Sender<Bytes>,
    player: Player,
}

/// The loop half of a room. Everything in here is only ever touched from
/// [`Room::run`].
pub struct Room<H: RoomHandler> {
    join_rx: mpsc::Receiver<SubscriberMsg>,
    leave_rx: mpsc::Receiver<SubscriberId>,
    message_rx: mpsc::Receiver<SentMsg>,
    reset_rx: mpsc::Receiver<()>,
    stop_rx: mpsc::Receiver<u8>,
    reset_tx: mpsc::Sender<()>,
    pub(crate) state: GameState,
    subscribers: HashMap<SubscriberId, RoomSubscriber>,
    expire_time: Arc<AtomicI64>,
    pub(crate) handler: H,
}

impl<H: RoomHandler> Room<H> {
    pub fn new(state: GameState, handler: H) -> (RoomHandle, Room<H>) {
        let (join_tx, join_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (leave_tx, leave_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (message_tx, message_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let expire_time = Arc::new(AtomicI64::new(unix_now() + ROOM_TTL_SECS));
        let handle = RoomHandle {
            join_tx,
            leave_tx,
            message_tx,
            stop_tx,
            expire_time: Arc::clone(&expire_time),
            is_public: state.settings.is_public,
        };
        let room = Room {
            join_rx,
            leave_rx,
            message_rx,
            reset_rx,
            stop_rx,
            reset_tx,
            state,
            subscribers: HashMap::new(),
            expire_time,
            handler,
        };
        (handle, room)
    }

    /// Drives the room until it is stopped or every handle is gone. Waits for
    /// exactly one event at a time and processes it to completion before
    /// waiting again.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(sub_msg) = self.join_rx.recv() => {
                    self.guard(|room| room.on_subscribe(sub_msg));
                }
                Some(subscriber) = self.leave_rx.recv() => {
                    self.guard(|room| room.on_unsubscribe(subscriber));
                }
                Some(sent_msg) = self.message_rx.recv() => {
                    self.guard(|room| room.on_message(sent_msg));
                }
                Some(()) = self.reset_rx.recv() => {
                    self.guard(|room| room.on_reset_state());
                }
                Some(term_code) = self.stop_rx.recv() => {
                    self.guard(|room| room.on_terminate(term_code));
                    return;
                }
                else => return,
            }
        }
    }

    /// Runs one event handler, containing any panic so a single bad event
    /// cannot take the room down with it.
    fn guard(&mut self, handle_event: impl FnOnce(&mut Self)) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handle_event(self)));
        if let Err(panic_info) = outcome {
            let desc = panic_info
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic_info.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            tracing::error!(code = %self.state.code, panic = %desc, "fatal error in room handler");
        }
    }

    pub(crate) fn on_subscribe(&mut self, sub_msg: SubscriberMsg) {
        let SubscriberMsg { subscriber, player } = sub_msg;

        let resp = match self.handle_join(player.clone()) {
            Ok(resp) => resp,
            Err(err) => {
                // only the sender hears about it; dropping the sender is the close
                let _ = subscriber.tx.try_send(error_frame(&err.to_string()));
                return;
            }
        };
        tracing::info!(code = %self.state.code, player = %player.name, "player subscribed to the room");

        let id = subscriber.id;
        self.subscribers.insert(id, RoomSubscriber { tx: subscriber.tx, player });
        self.broadcast(resp);

        match self.handle_state() {
            Ok(state_frame) => self.send_to(id, state_frame),
            Err(err) => {
                self.send_to(id, error_frame(&err.to_string()));
                self.evict(id);
            }
        }
    }

    fn on_unsubscribe(&mut self, subscriber: SubscriberId) {
        let Some(sub) = self.subscribers.get(&subscriber) else {
            // the transport posts a final leave even when the room already
            // dropped this subscriber
            return;
        };
        let player = sub.player.clone();

        let Some(leave_index) = self.state.leave(&player) else {
            self.send_to(subscriber, error_frame("Failed to leave, player couldn't be found"));
            return;
        };
        tracing::info!(code = %self.state.code, player = %player.name, "player unsubscribed from the room");

        // close first, then tell the others
        self.subscribers.remove(&subscriber);
        match leave_frame(leave_index, &player) {
            Ok(frame) => self.broadcast(frame),
            Err(err) => tracing::error!(code = %self.state.code, %err, "failed to encode leave frame"),
        }
    }

    fn on_message(&mut self, sent_msg: SentMsg) {
        let Some(sub) = self.subscribers.get(&sent_msg.sender) else {
            tracing::debug!(code = %self.state.code, "dropping message from unknown subscriber");
            return;
        };
        let player = sub.player.clone();

        match self.handle_message(&sent_msg.message, player) {
            // only the sender should receive the error response
            Err(err) => self.send_to(sent_msg.sender, error_frame(&err.to_string())),
            Ok(Some(resp)) => self.broadcast(resp),
            Ok(None) => {}
        }
    }

    pub(crate) fn on_reset_state(&mut self) {
        let (resp, finished) = self.handle_reset();
        self.broadcast(resp);
        if finished {
            self.handler.do_shutdown(self.state.create_game_results());
        }
    }

    fn on_terminate(&mut self, term_code: u8) {
        match terminate_frame(term_code) {
            Ok(frame) => self.broadcast(frame),
            Err(err) => tracing::error!(code = %self.state.code, %err, "failed to encode terminate frame"),
        }
        // dropping the senders closes every subscriber channel
        self.subscribers.clear();
        tracing::info!(code = %self.state.code, term_code, "room terminated");
    }

    /// Queues a frame on every subscriber. A subscriber whose queue is full
    /// or already closed is evicted on the spot; the loop never waits for a
    /// slow consumer.
    pub(crate) fn broadcast(&mut self, resp: Bytes) {
        if resp.is_empty() {
            return;
        }
        let mut dead = Vec::new();
        for (id, sub) in &self.subscribers {
            if sub.tx.try_send(resp.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            self.evict(id);
        }
    }

    fn send_to(&mut self, subscriber: SubscriberId, resp: Bytes) {
        if resp.is_empty() {
            return;
        }
        let Some(sub) = self.subscribers.get(&subscriber) else {
            return;
        };
        if sub.tx.try_send(resp).is_err() {
            self.evict(subscriber);
        }
    }

    /// Removes an unresponsive or rejected subscriber, treating it as a
    /// leave so the remaining players see a consistent roster.
    fn evict(&mut self, subscriber: SubscriberId) {
        let Some(sub) = self.subscribers.remove(&subscriber) else {
            return;
        };
        tracing::warn!(code = %self.state.code, player = %sub.player.name, "evicting unresponsive subscriber");
        if let Some(leave_index) = self.state.leave(&sub.player) {
            if let Ok(frame) = leave_frame(leave_index, &sub.player) {
                self.broadcast(frame);
            }
        }
    }

    /// Arms the one-shot turn timer. At most one is ever in flight because a
    /// new timer is only started from the handler of the previous reset or
    /// from a game start.
    pub(crate) fn start_reset_timer(&self, time_secs: i64) {
        let reset_tx = self.reset_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(time_secs.max(0) as u64)).await;
            let _ = reset_tx.send(()).await;
        });
    }

    pub(crate) fn postpone_expiration(&self) {
        self.expire_time.store(unix_now() + ROOM_TTL_SECS, Ordering::Relaxed);
    }
}
