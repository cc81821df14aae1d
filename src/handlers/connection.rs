//! Protocol connection state shared by the raw-socket and websocket transports
//!
//! A connection decodes client frames, drives the store, and forwards room
//! events back to the client as frames once it has registered a user.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::event_bus::Inbox;
use crate::core::events::Event;
use crate::core::message::{Message, MessageDraft, MessageSource, SpeechMode};
use crate::core::session::ClientState;
use crate::core::store::{ChatStore, Registration, SendOutcome};
use crate::core::user::ClientInfo;
use crate::error::ChatError;
use crate::protocol::schema::TIME_FORMAT;
use crate::protocol::{
    decode, encode, ClientMessage, Frame, FrameReader, Framing, MessageSent, ServerMessage,
    WireUser,
};

/// What the transport's writer task should do next
#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing {
    Frame(Vec<u8>),
    /// Flush and close the connection
    Close,
}

// Frames are queued to the writer task so event forwarding never waits on the peer
#[derive(Clone)]
struct FrameSender {
    connection_id: String,
    framing: Framing,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl FrameSender {
    fn send(&self, message: &ServerMessage) -> bool {
        match encode(self.framing, message) {
            Ok(bytes) => self.tx.send(Outgoing::Frame(bytes)).is_ok(),
            Err(e) => {
                warn!("Dropping frame for {}: {}", self.connection_id, e);
                false
            }
        }
    }

    fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

struct Registered {
    user_id: String,
    room_id: String,
    source: MessageSource,
    stop: watch::Sender<bool>,
    forwarder: JoinHandle<()>,
}

pub struct ProtocolConnection {
    id: String,
    store: Arc<ChatStore>,
    state: ClientState,
    reader: FrameReader,
    default_framing: Framing,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    registered: Option<Registered>,
}

impl ProtocolConnection {
    /// A connection for a peer identified by `client_key` for flood control.
    ///
    /// `default_framing` is used for replies until the first byte from the
    /// peer fixes the framing.
    pub fn new(
        store: Arc<ChatStore>,
        client_key: impl Into<String>,
        default_framing: Framing,
        outgoing: mpsc::UnboundedSender<Outgoing>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            store,
            state: ClientState::new(client_key),
            reader: FrameReader::new(),
            default_framing,
            outgoing,
            registered: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn framing(&self) -> Framing {
        self.reader.framing().unwrap_or(self.default_framing)
    }

    /// Id of the user registered on this connection
    pub fn user_id(&self) -> Option<&str> {
        self.registered.as_ref().map(|r| r.user_id.as_str())
    }

    fn sender(&self) -> FrameSender {
        FrameSender {
            connection_id: self.id.clone(),
            framing: self.framing(),
            tx: self.outgoing.clone(),
        }
    }

    fn send(&self, message: &ServerMessage) {
        self.sender().send(message);
    }

    fn send_error(&self, error: &ChatError) {
        self.send(&ServerMessage::error(error.user_message()));
    }

    /// Feed received bytes and handle every complete frame
    pub async fn receive(&mut self, data: &[u8]) {
        self.reader.push(data);
        loop {
            match self.reader.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("Bad frame from {}: {}", self.id, e);
                    self.send_error(&e);
                }
            }
        }
    }

    pub async fn handle_frame(&mut self, frame: Frame) {
        match decode::<ClientMessage>(&frame) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!("Undecodable frame {} from {}: {}", frame.code, self.id, e);
                self.send_error(&e);
            }
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::RegisterUser {
                nickname,
                color,
                room_id,
                client,
            } => self.register(&room_id, &nickname, &color, &client).await,
            ClientMessage::SendMessage {
                user_id,
                to,
                speech_mode,
                message,
                privately,
                room_id,
            } => {
                self.send_chat(&user_id, &room_id, &to, &speech_mode, message, privately)
                    .await
            }
            ClientMessage::ColorListRequest => self.send(&ServerMessage::color_list()),
            ClientMessage::RoomListRequest => {
                let rooms = self.store.rooms();
                for message in ServerMessage::room_list(self.framing(), &rooms) {
                    self.send(&message);
                }
            }
            ClientMessage::Ping { .. } => {
                if let Some(user_id) = self.user_id() {
                    self.store.ping(user_id).await;
                }
            }
        }
    }

    async fn register(&mut self, room_id: &str, nickname: &str, color: &str, client: &str) {
        // One user per connection; a new registration replaces the old one
        self.leave().await;

        let client = ClientInfo::parse(client);
        let source = client.message_source();
        let registration = Registration::socket(room_id, &self.id, nickname, color, client)
            .with_client_key(self.state.client_key.clone());

        let user = match self.store.register_user(registration).await {
            Ok(user) => user,
            Err(e) => {
                info!("Registration of {} on {} refused: {}", nickname, self.id, e);
                self.send_error(&e);
                return;
            }
        };

        let subscriber_id = format!("conn:{}", self.id);
        let inbox = match self.store.subscribe(room_id, &subscriber_id) {
            Ok(inbox) => inbox,
            Err(e) => {
                self.store.deregister_user(&user.id).await;
                self.send_error(&e);
                return;
            }
        };

        // The current user list, the new user included, precedes the success reply
        let sender = self.sender();
        for present in self.store.online_users(room_id).await {
            sender.send(&ServerMessage::UserJoined(WireUser::from(&present.to_ref())));
        }
        sender.send(&ServerMessage::RegistrationSuccess(WireUser::from(&user.to_ref())));

        // Replay history after subscribing; the forwarder only reads what is unread
        match self.store.messages_for(&user.id).await {
            Ok(backlog) => {
                for message in backlog {
                    sender.send(&message_frame(&message, true));
                }
            }
            Err(e) => warn!("No backlog for {}: {}", user.id, e),
        }

        let (stop, stop_rx) = watch::channel(false);
        let forwarder = tokio::spawn(forward_events(
            self.store.clone(),
            inbox,
            user.id.clone(),
            room_id.to_string(),
            sender,
            stop_rx,
        ));

        info!("Connection {} registered {} in {}", self.id, user.nickname, room_id);
        self.registered = Some(Registered {
            user_id: user.id,
            room_id: room_id.to_string(),
            source,
            stop,
            forwarder,
        });
    }

    async fn send_chat(
        &mut self,
        claimed_user_id: &str,
        room_id: &str,
        to: &str,
        speech_mode: &str,
        body: String,
        privately: bool,
    ) {
        let Some(registered) = &self.registered else {
            self.send(&ServerMessage::error("You must register before sending messages."));
            return;
        };
        if claimed_user_id != registered.user_id || room_id != registered.room_id {
            debug!(
                "Connection {} sent as {}/{}, using its registered user",
                self.id, claimed_user_id, room_id
            );
        }

        let mut draft = MessageDraft::new(registered.room_id.clone(), registered.user_id.clone(), body)
            .mode(SpeechMode::parse(speech_mode).unwrap_or_default())
            .source(registered.source);
        if !to.is_empty() {
            draft = draft.to(to);
        }
        if privately {
            draft = draft.privately();
        }

        match self.store.send_message(draft, &mut self.state).await {
            Ok(SendOutcome::Posted(message)) => {
                trace!("Connection {} posted message {}", self.id, message.seq);
            }
            Ok(SendOutcome::Rejected { reason, .. }) => {
                debug!("Message from {} rejected: {:?}", self.id, reason);
            }
            Err(e) => self.send_error(&e),
        }
    }

    /// Push the server clock to the client
    pub fn send_server_time(&self) {
        self.send(&ServerMessage::ServerTime {
            time: Utc::now().format(TIME_FORMAT).to_string(),
        });
    }

    // Stop forwarding and remove the registered user, if any
    async fn leave(&mut self) {
        if let Some(registered) = self.registered.take() {
            let _ = registered.stop.send(true);
            let _ = registered.forwarder.await;
            self.store.deregister_user(&registered.user_id).await;
        }
    }

    /// Tear down after the peer went away
    pub async fn close(&mut self) {
        self.leave().await;
        debug!("Connection {} closed", self.id);
    }
}

fn message_frame(message: &Message, is_history: bool) -> ServerMessage {
    ServerMessage::MessageSent(MessageSent::from_message(message, is_history))
}

/// Map room events to frames until stopped or kicked
async fn forward_events(
    store: Arc<ChatStore>,
    inbox: Arc<Inbox>,
    user_id: String,
    room_id: String,
    sender: FrameSender,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = inbox.recv() => event,
            _ = stop.changed() => break,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            Event::MessagePosted(message) => {
                if !message.is_visible_to(&user_id) {
                    continue;
                }
                // The outbox keeps the order; a kicked user has none, so send the event itself
                let unread = store
                    .unread_messages(&user_id)
                    .await
                    .unwrap_or_else(|_| vec![message]);
                for message in unread {
                    sender.send(&message_frame(&message, false));
                }
            }
            Event::UserJoined(user) => {
                if user.id != user_id {
                    sender.send(&ServerMessage::UserJoined(WireUser::from(&user)));
                }
            }
            Event::UserLeft(user) => {
                sender.send(&ServerMessage::UserLeft {
                    user_id: user.id,
                    room_id: user.room_id,
                });
            }
            Event::UserListChanged { room_id, total } => {
                sender.send(&ServerMessage::UserListUpdated {
                    room_id,
                    total: total as u32,
                });
            }
            Event::UserKicked { user, reason } => {
                if user.id == user_id {
                    info!("Closing connection {} of kicked user {}", sender.connection_id, user_id);
                    sender.send(&ServerMessage::UserKicked { reason });
                    sender.close();
                    break;
                }
            }
        }
    }

    store.unsubscribe(&room_id, &format!("conn:{}", sender.connection_id));
}
