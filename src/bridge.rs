//! Mirroring of bridged rooms to an external chat service
//!
//! Rooms with a `bridge_channel` are relayed to that channel through a
//! [`BridgeAdapter`]. Messages arriving from the channel are posted as the
//! bridged author, who is registered on first sight.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use lru::LruCache;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::constants::BRIDGE_MAX_TRACKED_AUTHORS;
use crate::core::events::Event;
use crate::core::message::{Message, MessageDraft, MessageSource};
use crate::core::session::ClientState;
use crate::core::store::{ChatStore, Registration, SendOutcome};
use crate::error::{ChatError, Result};

const RELAY_SUBSCRIBER: &str = "bridge-relay";

/// Outbound side of the bridged service
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    async fn send_to_channel(&self, channel_id: &str, message: &str) -> Result<()>;
}

/// Adapter used when no external service is connected: outbound traffic is only logged
#[derive(Debug, Default)]
pub struct LoggingBridge;

#[async_trait]
impl BridgeAdapter for LoggingBridge {
    async fn send_to_channel(&self, channel_id: &str, message: &str) -> Result<()> {
        info!("[bridge:{}] {}", channel_id, message);
        Ok(())
    }
}

/// A message posted on the bridged service
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
}

pub struct Bridge {
    store: Arc<ChatStore>,
    adapter: Arc<dyn BridgeAdapter>,
    // Flood-control state per bridged author, least recently active forgotten first
    authors: Mutex<LruCache<String, Arc<Mutex<ClientState>>>>,
}

impl Bridge {
    pub fn new(store: Arc<ChatStore>, adapter: Arc<dyn BridgeAdapter>) -> Self {
        Self::with_max_authors(store, adapter, BRIDGE_MAX_TRACKED_AUTHORS)
    }

    pub fn with_max_authors(
        store: Arc<ChatStore>,
        adapter: Arc<dyn BridgeAdapter>,
        max_authors: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_authors).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            adapter,
            authors: Mutex::new(LruCache::new(capacity)),
        }
    }

    // The map lock is only held for the lookup; sends lock the author's own state
    async fn author_state(&self, author_id: &str) -> Arc<Mutex<ClientState>> {
        let mut authors = self.authors.lock().await;
        authors
            .get_or_insert(author_id.to_string(), || {
                Arc::new(Mutex::new(ClientState::new(format!("bridge:{}", author_id))))
            })
            .clone()
    }

    /// Spawn one relay task per bridged room
    pub fn start_relay(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for room in self.store.rooms().into_iter().filter(|r| r.is_bridged()) {
            let Some(channel) = room.bridge_channel.clone() else {
                continue;
            };
            let inbox = match self.store.subscribe(&room.id, RELAY_SUBSCRIBER) {
                Ok(inbox) => inbox,
                Err(e) => {
                    error!("Cannot relay room {}: {}", room.id, e);
                    continue;
                }
            };
            info!("Relaying room {} to channel {}", room.id, channel);

            let bridge = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = inbox.recv().await {
                    if let Event::MessagePosted(message) = event {
                        bridge.relay(&channel, &message).await;
                    }
                }
                debug!("Relay for {} stopped", channel);
            }));
        }
        handles
    }

    async fn relay(&self, channel: &str, message: &Message) {
        if !should_relay(message) {
            return;
        }
        let text = format_outbound(message);
        trace!("Relaying message {} to {}", message.seq, channel);
        if let Err(e) = self.adapter.send_to_channel(channel, &text).await {
            warn!("Failed to relay message to {}: {}", channel, e);
        }
    }

    /// Post a message from the bridged service into its room
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<SendOutcome> {
        let room = self
            .store
            .find_room_by_bridge_channel(&inbound.channel_id)
            .ok_or_else(|| ChatError::RoomNotFound(inbound.channel_id.clone()))?;

        let author = match self
            .store
            .find_user_by_bridge_id(&room.id, &inbound.author_id)
            .await
        {
            Some(user) => user,
            None => {
                let registration =
                    Registration::bridge(&room.id, &inbound.author_id, &inbound.author_name);
                let user = self.store.register_user(registration).await?;
                debug!("Registered bridged user {} in {}", user.nickname, room.id);
                user
            }
        };

        let mut draft = MessageDraft::new(&room.id, &author.id, inbound.text.as_str())
            .source(MessageSource::Bridge);
        if let Some((nickname, body)) = parse_addressee(&inbound.text) {
            if let Some(addressee) = self.store.find_user_by_nickname(&room.id, nickname).await {
                draft = MessageDraft::new(&room.id, &author.id, body)
                    .to(addressee.id)
                    .privately()
                    .source(MessageSource::Bridge);
            }
        }

        let state = self.author_state(&inbound.author_id).await;
        let mut state = state.lock().await;
        self.store.send_message(draft, &mut state).await
    }
}

// Bridged messages came from the channel and private ones stay in the room
fn should_relay(message: &Message) -> bool {
    message.source != MessageSource::Bridge && !message.private
}

fn format_outbound(message: &Message) -> String {
    let body = message.rendered_body();
    if message.is_system {
        return body;
    }
    let sender = message.from.as_ref().map_or("?", |u| u.nickname.as_str());
    match &message.to {
        Some(to) => format!("<{}> @{}: {}", sender, to.nickname, body),
        None => format!("<{}> {}", sender, body),
    }
}

/// Split `@nickname: text` into its parts
fn parse_addressee(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('@')?;
    let (nickname, body) = rest.split_once(':')?;
    let nickname = nickname.trim();
    let body = body.trim_start();
    if nickname.is_empty() || body.is_empty() {
        return None;
    }
    Some((nickname, body))
}
