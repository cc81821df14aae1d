//! In-memory rooms, users and messages
//!
//! Each room keeps its users, outboxes and public history behind its own
//! lock. Events are published on the room's bus only after that lock is
//! released, so a slow subscriber never stalls a mutation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::{AdminConfig, RoomsFile, ServerConfig};
use crate::constants::{
    BE_NICE_TEMPLATE, COLOR_BLACK, COOLDOWN_NOTICE_TEMPLATE, DEFAULT_HISTORY_CAPACITY,
    FLOOD_KICK_REASON, FLOOD_KICK_TEMPLATE, JOINED_TEMPLATE, LEFT_TEMPLATE,
    MAX_OUTBOX_MESSAGES, SCREAM_INTERVAL_SECS, SCREAM_TOO_SOON_TEMPLATE,
    USER_STALE_TIMEOUT_SECS,
};
use crate::core::event_bus::{EventBus, Inbox};
use crate::core::events::Event;
use crate::core::flood_control::{FloodControl, FloodPolicy, FloodVerdict};
use crate::core::message::{Message, MessageDraft};
use crate::core::nickname::{is_nick_variation, nickname_key, validate_nickname};
use crate::core::room::{parse_hex_color, MessageHistory, Room};
use crate::core::session::ClientState;
use crate::core::user::{combined_id, ClientInfo, Origin, User, UserRef};
use crate::error::{ChatError, Result};
use crate::profanity::ProfanityFilter;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub history_capacity: usize,
    pub stale_timeout: Duration,
    /// Minimum time between two loud messages from one client
    pub scream_interval: Duration,
    pub flood_policy: FloodPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            stale_timeout: Duration::seconds(USER_STALE_TIMEOUT_SECS as i64),
            scream_interval: Duration::seconds(SCREAM_INTERVAL_SECS),
            flood_policy: FloodPolicy::default(),
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            history_capacity: config.history_capacity,
            stale_timeout: Duration::from_std(config.stale_timeout)
                .unwrap_or_else(|_| Duration::seconds(USER_STALE_TIMEOUT_SECS as i64)),
            ..Self::default()
        }
    }
}

/// A registration request from any transport
#[derive(Debug, Clone)]
pub struct Registration {
    pub room_id: String,
    /// Client- or session-supplied id, combined with the room id into the user id
    pub raw_id: String,
    pub nickname: String,
    pub color: String,
    pub origin: Origin,
    pub client: ClientInfo,
    pub bridge_id: Option<String>,
    /// Web session the user is bound to
    pub session_id: Option<String>,
    /// Flood-control identity; banned identities cannot register
    pub client_key: Option<String>,
}

impl Registration {
    pub fn web(
        room_id: impl Into<String>,
        session_id: impl Into<String>,
        nickname: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            room_id: room_id.into(),
            raw_id: session_id.clone(),
            nickname: nickname.into(),
            color: color.into(),
            origin: Origin::Web,
            client: ClientInfo::web(),
            bridge_id: None,
            session_id: Some(session_id),
            client_key: None,
        }
    }

    pub fn socket(
        room_id: impl Into<String>,
        raw_id: impl Into<String>,
        nickname: impl Into<String>,
        color: impl Into<String>,
        client: ClientInfo,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            raw_id: raw_id.into(),
            nickname: nickname.into(),
            color: color.into(),
            origin: Origin::Socket,
            client,
            bridge_id: None,
            session_id: None,
            client_key: None,
        }
    }

    /// A user mirrored from the bridged service
    pub fn bridge(
        room_id: impl Into<String>,
        bridge_id: impl Into<String>,
        nickname: impl Into<String>,
    ) -> Self {
        let bridge_id = bridge_id.into();
        Self {
            room_id: room_id.into(),
            raw_id: bridge_id.clone(),
            nickname: nickname.into(),
            color: COLOR_BLACK.to_string(),
            origin: Origin::Bridge,
            client: ClientInfo::bridge(),
            bridge_id: Some(bridge_id),
            session_id: None,
            client_key: None,
        }
    }

    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }
}

/// Why a message was not posted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Cooldown,
    Banned,
    Blocked,
    ScreamTooSoon,
}

/// Result of a send attempt that passed basic validation
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Posted(Arc<Message>),
    /// Not posted; `notice` is the system message shown to the sender, if any
    Rejected {
        reason: RejectReason,
        notice: Option<Arc<Message>>,
    },
}

impl SendOutcome {
    pub fn is_posted(&self) -> bool {
        matches!(self, SendOutcome::Posted(_))
    }

    pub fn posted(&self) -> Option<&Arc<Message>> {
        match self {
            SendOutcome::Posted(message) => Some(message),
            SendOutcome::Rejected { .. } => None,
        }
    }

    pub fn notice(&self) -> Option<&Arc<Message>> {
        match self {
            SendOutcome::Posted(_) => None,
            SendOutcome::Rejected { notice, .. } => notice.as_ref(),
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            SendOutcome::Posted(_) => None,
            SendOutcome::Rejected { reason, .. } => Some(*reason),
        }
    }
}

struct UserEntry {
    user: User,
    session_id: Option<String>,
    last_ping: DateTime<Utc>,
    last_read_seq: u64,
    seen_user_list_version: u64,
    outbox: VecDeque<Arc<Message>>,
}

impl UserEntry {
    fn new(
        user: User,
        session_id: Option<String>,
        now: DateTime<Utc>,
        backfill: Vec<Arc<Message>>,
        seen_user_list_version: u64,
    ) -> Self {
        let mut entry = Self {
            user,
            session_id,
            last_ping: now,
            last_read_seq: 0,
            seen_user_list_version,
            outbox: VecDeque::with_capacity(backfill.len()),
        };
        for message in backfill {
            entry.deliver(message);
        }
        entry
    }

    fn deliver(&mut self, message: Arc<Message>) {
        while self.outbox.len() >= MAX_OUTBOX_MESSAGES {
            self.outbox.pop_front();
        }
        self.outbox.push_back(message);
    }

    fn latest_seq(&self) -> u64 {
        self.outbox.back().map_or(0, |m| m.seq)
    }
}

struct RoomInner {
    users: HashMap<String, UserEntry>,
    history: MessageHistory,
    user_list_version: u64,
    next_seq: u64,
}

impl RoomInner {
    /// Stamp the next sequence number and deliver to every user who can see it
    fn append(&mut self, mut message: Message) -> Arc<Message> {
        self.next_seq += 1;
        message.seq = self.next_seq;
        let message = Arc::new(message);

        for (id, entry) in self.users.iter_mut() {
            if message.is_visible_to(id) {
                entry.deliver(message.clone());
            }
        }
        if !message.private {
            self.history.push(message.clone());
        }
        message
    }

    fn nickname_in_use(&self, nickname: &str) -> bool {
        let key = nickname_key(nickname);
        self.users
            .values()
            .any(|entry| nickname_key(&entry.user.nickname) == key)
    }

    fn online_total(&self) -> usize {
        self.users
            .values()
            .filter(|entry| entry.user.is_listed_online())
            .count()
    }
}

/// A room with its users, history and event bus
pub struct RoomState {
    room: Room,
    inner: Mutex<RoomInner>,
    bus: EventBus,
}

impl RoomState {
    fn new(room: Room, history_capacity: usize) -> Self {
        Self {
            bus: EventBus::new(format!("room:{}", room.id)),
            inner: Mutex::new(RoomInner {
                users: HashMap::new(),
                history: MessageHistory::with_capacity(history_capacity),
                user_list_version: 0,
                next_seq: 0,
            }),
            room,
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn publish_all(&self, events: Vec<Event>) {
        for event in events {
            self.bus.publish(event);
        }
    }
}

enum Removal {
    Leave,
    Kick(String),
}

pub struct ChatStore {
    rooms: HashMap<String, Arc<RoomState>>,
    room_order: Vec<String>,
    // user id -> room id
    user_rooms: RwLock<HashMap<String, String>>,
    flood: Arc<FloodControl>,
    filter: Arc<dyn ProfanityFilter>,
    admin: AdminConfig,
    options: StoreOptions,
}

impl ChatStore {
    pub fn new(config: &RoomsFile, options: StoreOptions, filter: Arc<dyn ProfanityFilter>) -> Self {
        let flood = Arc::new(FloodControl::new(options.flood_policy.clone()));
        let mut rooms = HashMap::new();
        let mut room_order = Vec::new();
        let mut user_rooms = HashMap::new();
        let now = Utc::now();

        for room_config in &config.rooms {
            let room = Room::from_config(room_config);
            let mut state = RoomState::new(room, options.history_capacity);

            // The administrator is always present in bridged rooms
            if let (Some(bridge_id), true) = (&config.admin.bridge_id, state.room.is_bridged()) {
                let admin = User {
                    id: combined_id(&state.room.id, &config.admin.id),
                    room_id: state.room.id.clone(),
                    nickname: config.admin.nickname.clone(),
                    color: config.admin.color.clone(),
                    is_admin: true,
                    origin: Origin::Bridge,
                    bridge_id: Some(bridge_id.clone()),
                    client: ClientInfo::bridge(),
                };
                user_rooms.insert(admin.id.clone(), state.room.id.clone());
                debug!("Administrator present in bridged room {}", state.room.id);
                let id = admin.id.clone();
                state
                    .inner
                    .get_mut()
                    .users
                    .insert(id, UserEntry::new(admin, None, now, Vec::new(), 0));
            }

            room_order.push(state.room.id.clone());
            rooms.insert(state.room.id.clone(), Arc::new(state));
        }

        info!("Chat store ready with {} rooms", room_order.len());
        Self {
            rooms,
            room_order,
            user_rooms: RwLock::new(user_rooms),
            flood,
            filter,
            admin: config.admin.clone(),
            options,
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn flood_control(&self) -> &Arc<FloodControl> {
        &self.flood
    }

    pub fn admin(&self) -> &AdminConfig {
        &self.admin
    }

    // ----- rooms -----

    /// All rooms in configuration order
    pub fn rooms(&self) -> Vec<Room> {
        self.room_order
            .iter()
            .filter_map(|id| self.rooms.get(id))
            .map(|state| state.room.clone())
            .collect()
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).map(|state| state.room.clone())
    }

    pub fn room_state(&self, room_id: &str) -> Option<Arc<RoomState>> {
        self.rooms.get(room_id).cloned()
    }

    fn require_room(&self, room_id: &str) -> Result<Arc<RoomState>> {
        self.room_state(room_id)
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))
    }

    pub fn find_room_by_bridge_channel(&self, channel: &str) -> Option<Room> {
        self.room_order
            .iter()
            .filter_map(|id| self.rooms.get(id))
            .find(|state| state.room.bridge_channel.as_deref() == Some(channel))
            .map(|state| state.room.clone())
    }

    pub fn subscribe(&self, room_id: &str, subscriber_id: &str) -> Result<Arc<Inbox>> {
        Ok(self.require_room(room_id)?.bus.subscribe(subscriber_id))
    }

    pub fn unsubscribe(&self, room_id: &str, subscriber_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|state| state.bus.unsubscribe(subscriber_id))
    }

    /// Public messages kept for backfilling, oldest first
    pub async fn history(&self, room_id: &str) -> Result<Vec<Arc<Message>>> {
        let room = self.require_room(room_id)?;
        let inner = room.inner.lock().await;
        Ok(inner.history.all())
    }

    // ----- users -----

    pub async fn user_room_id(&self, user_id: &str) -> Option<String> {
        self.user_rooms.read().await.get(user_id).cloned()
    }

    async fn user_room(&self, user_id: &str) -> Option<Arc<RoomState>> {
        let room_id = self.user_room_id(user_id).await?;
        self.room_state(&room_id)
    }

    pub async fn user(&self, user_id: &str) -> Option<User> {
        let room = self.user_room(user_id).await?;
        let inner = room.inner.lock().await;
        inner.users.get(user_id).map(|entry| entry.user.clone())
    }

    pub async fn is_present(&self, user_id: &str) -> bool {
        self.user(user_id).await.is_some()
    }

    /// Case-insensitive, whitespace-trimmed nickname lookup within a room
    pub async fn find_user_by_nickname(&self, room_id: &str, nickname: &str) -> Option<User> {
        let room = self.room_state(room_id)?;
        let key = nickname_key(nickname);
        let inner = room.inner.lock().await;
        inner
            .users
            .values()
            .find(|entry| nickname_key(&entry.user.nickname) == key)
            .map(|entry| entry.user.clone())
    }

    pub async fn find_user_by_bridge_id(&self, room_id: &str, bridge_id: &str) -> Option<User> {
        let room = self.room_state(room_id)?;
        let inner = room.inner.lock().await;
        inner
            .users
            .values()
            .find(|entry| entry.user.bridge_id.as_deref() == Some(bridge_id))
            .map(|entry| entry.user.clone())
    }

    /// Everyone in the room, including bridged users
    pub async fn room_users(&self, room_id: &str) -> Vec<User> {
        let Some(room) = self.room_state(room_id) else {
            return Vec::new();
        };
        let inner = room.inner.lock().await;
        let mut users: Vec<User> = inner.users.values().map(|entry| entry.user.clone()).collect();
        users.sort_by(|a, b| nickname_key(&a.nickname).cmp(&nickname_key(&b.nickname)));
        users
    }

    /// Users shown in the room's online list: administrators and non-bridged users
    pub async fn online_users(&self, room_id: &str) -> Vec<User> {
        let mut users = self.room_users(room_id).await;
        users.retain(User::is_listed_online);
        users
    }

    /// Web sessions currently bound to a live user
    pub async fn bound_sessions(&self) -> HashSet<String> {
        let mut sessions = HashSet::new();
        for room in self.rooms.values() {
            let inner = room.inner.lock().await;
            sessions.extend(
                inner
                    .users
                    .values()
                    .filter_map(|entry| entry.session_id.clone()),
            );
        }
        sessions
    }

    pub async fn register_user(&self, registration: Registration) -> Result<User> {
        let room = self.require_room(&registration.room_id)?;

        if let Some(key) = &registration.client_key {
            if self.flood.is_ip_banned(key).await {
                return Err(ChatError::FloodBanned);
            }
        }

        let nickname = registration.nickname.trim().to_string();
        if registration.origin != Origin::Bridge {
            validate_nickname(&nickname, self.filter.as_ref())?;
        } else if nickname.is_empty() {
            return Err(ChatError::InvalidNickname(
                "You must provide a Nickname.".to_string(),
            ));
        }

        let color = if parse_hex_color(&registration.color).is_some() {
            registration.color.clone()
        } else {
            COLOR_BLACK.to_string()
        };

        let user = User {
            id: combined_id(&room.room.id, &registration.raw_id),
            room_id: room.room.id.clone(),
            nickname,
            color,
            is_admin: false,
            origin: registration.origin,
            bridge_id: registration.bridge_id.clone(),
            client: registration.client.clone(),
        };
        let user_ref = user.to_ref();
        let mut events = Vec::new();

        {
            let mut inner = room.inner.lock().await;
            if inner.users.contains_key(&user.id) {
                return Err(ChatError::UserExists);
            }
            let reserved = is_nick_variation(&user.nickname, &self.admin.nickname);
            if reserved || inner.nickname_in_use(&user.nickname) {
                return Err(ChatError::NicknameTaken);
            }

            let backfill = inner.history.all();
            let seen = inner.user_list_version;
            inner.users.insert(
                user.id.clone(),
                UserEntry::new(
                    user.clone(),
                    registration.session_id.clone(),
                    Utc::now(),
                    backfill,
                    seen,
                ),
            );

            if !user.is_bridged() {
                let joined = inner.append(Message::system(&room.room.id, JOINED_TEMPLATE, &user_ref));
                events.push(Event::MessagePosted(joined));

                if let (true, Some(intro)) = (user.is_web_user(), &room.room.intro_message) {
                    let intro = inner.append(Message::notice(&room.room.id, intro, &user_ref));
                    events.push(Event::MessagePosted(intro));
                }

                inner.user_list_version += 1;
                let version = inner.user_list_version;
                if let Some(entry) = inner.users.get_mut(&user.id) {
                    entry.seen_user_list_version = version;
                }
                events.push(Event::UserJoined(user_ref.clone()));
                events.push(Event::UserListChanged {
                    room_id: room.room.id.clone(),
                    total: inner.online_total(),
                });
            }

            // Indexed under the room lock so a concurrent removal cannot interleave
            self.user_rooms
                .write()
                .await
                .insert(user.id.clone(), room.room.id.clone());
        }

        room.publish_all(events);

        info!(
            "{} joined room {} as {} ({:?})",
            user.nickname, room.room.id, user.id, user.origin
        );
        Ok(user)
    }

    /// Remove a user and announce the departure.
    ///
    /// The protected administrator stays; only its session binding is cleared.
    pub async fn deregister_user(&self, user_id: &str) -> Option<User> {
        self.remove_user(user_id, Removal::Leave)
            .await
            .map(|(user, _)| user)
    }

    /// Remove a user with a public kick message, which the kicked user also receives
    pub async fn kick_user(&self, user_id: &str, reason: &str) -> Option<Arc<Message>> {
        self.remove_user(user_id, Removal::Kick(reason.to_string()))
            .await
            .and_then(|(_, message)| message)
    }

    async fn remove_user(
        &self,
        user_id: &str,
        removal: Removal,
    ) -> Option<(User, Option<Arc<Message>>)> {
        let room = self.user_room(user_id).await?;
        let room_id = room.room.id.clone();
        let mut events = Vec::new();
        let mut announcement = None;

        let user = {
            let mut inner = room.inner.lock().await;
            match inner.users.get_mut(user_id) {
                None => return None,
                Some(entry) if entry.user.is_protected() => {
                    entry.session_id = None;
                    debug!("Cleared session of protected user {}", user_id);
                    return None;
                }
                Some(_) => {}
            }

            if let Removal::Kick(_) = &removal {
                if let Some(entry) = inner.users.get(user_id) {
                    let subject = entry.user.to_ref();
                    let kicked = inner.append(Message::system(&room_id, FLOOD_KICK_TEMPLATE, &subject));
                    announcement = Some(kicked.clone());
                    events.push(Event::MessagePosted(kicked));
                }
            }

            let entry = inner.users.remove(user_id)?;
            let user = entry.user;

            if !user.is_bridged() {
                let user_ref = user.to_ref();
                match removal {
                    Removal::Leave => {
                        let left = inner.append(Message::system(&room_id, LEFT_TEMPLATE, &user_ref));
                        announcement = Some(left.clone());
                        events.push(Event::MessagePosted(left));
                    }
                    Removal::Kick(reason) => {
                        events.push(Event::UserKicked {
                            user: user_ref.clone(),
                            reason,
                        });
                    }
                }
                inner.user_list_version += 1;
                events.push(Event::UserLeft(user_ref));
                events.push(Event::UserListChanged {
                    room_id: room_id.clone(),
                    total: inner.online_total(),
                });
            }
            self.user_rooms.write().await.remove(user_id);
            user
        };

        room.publish_all(events);
        info!("{} left room {}", user.nickname, room_id);
        Some((user, announcement))
    }

    // ----- messages -----

    pub async fn send_message(
        &self,
        draft: MessageDraft,
        state: &mut ClientState,
    ) -> Result<SendOutcome> {
        self.send_message_at(draft, state, Utc::now()).await
    }

    /// Screen a message and post it if accepted.
    ///
    /// Rejections caused by rate limits or content rules are not errors:
    /// they come back as `SendOutcome::Rejected` with the notice, if any,
    /// already delivered to the sender.
    pub async fn send_message_at(
        &self,
        draft: MessageDraft,
        state: &mut ClientState,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        let room = self.require_room(&draft.room_id)?;

        let (sender, addressee) = {
            let inner = room.inner.lock().await;
            let sender = inner
                .users
                .get(&draft.from)
                .map(|entry| entry.user.to_ref())
                .ok_or_else(|| ChatError::UserNotFound(draft.from.clone()))?;
            let addressee = match draft.to.as_deref().filter(|to| !to.is_empty()) {
                Some(to) => Some(
                    inner
                        .users
                        .get(to)
                        .map(|entry| entry.user.to_ref())
                        .ok_or_else(|| ChatError::UserNotFound(to.to_string()))?,
                ),
                None => None,
            };
            (sender, addressee)
        };

        if draft.body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let key = state.client_key.clone();

        if self.flood.is_ip_banned_at(&key, now).await {
            return Ok(SendOutcome::Rejected {
                reason: RejectReason::Banned,
                notice: None,
            });
        }

        if self.flood.is_cooldown_period_at(&key, now).await {
            // Counts as an attempt and pushes the cooldown back
            self.flood.record_message_at(&key, now).await;
            let notice = self.cooldown_notice(&room, &sender, state, now).await;
            return Ok(SendOutcome::Rejected {
                reason: RejectReason::Cooldown,
                notice,
            });
        }

        if draft.mode.is_loud()
            && state
                .last_scream
                .is_some_and(|last| now - last < self.options.scream_interval)
        {
            let notice = self
                .post_notice(&room, &sender, SCREAM_TOO_SOON_TEMPLATE, now)
                .await;
            return Ok(SendOutcome::Rejected {
                reason: RejectReason::ScreamTooSoon,
                notice: Some(notice),
            });
        }

        match self.flood.record_message_at(&key, now).await {
            FloodVerdict::Allowed => {}
            FloodVerdict::Flooded { .. } | FloodVerdict::Cooldown { .. } => {
                let notice = self.cooldown_notice(&room, &sender, state, now).await;
                return Ok(SendOutcome::Rejected {
                    reason: RejectReason::Cooldown,
                    notice,
                });
            }
            FloodVerdict::Banned { .. } => {
                warn!("Kicking {} from {} for flooding", sender.nickname, room.room.id);
                let notice = self.kick_user(&sender.id, FLOOD_KICK_REASON).await;
                return Ok(SendOutcome::Rejected {
                    reason: RejectReason::Banned,
                    notice,
                });
            }
        }

        if self.filter.has_blocked_words(&draft.body) {
            let notice = self.post_notice(&room, &sender, BE_NICE_TEMPLATE, now).await;
            return Ok(SendOutcome::Rejected {
                reason: RejectReason::Blocked,
                notice: Some(notice),
            });
        }

        state.cooldown_notice_sent = false;
        if draft.mode.is_loud() {
            state.last_scream = Some(now);
        }

        let private = draft.private && addressee.is_some();
        let message = Message {
            id: Uuid::new_v4(),
            seq: 0,
            room_id: room.room.id.clone(),
            timestamp: now,
            body: self.filter.mask_censored_words(&draft.body),
            from: Some(sender),
            to: addressee,
            private,
            mode: draft.mode,
            is_system: false,
            subject: None,
            source: draft.source,
        };

        let posted = room.inner.lock().await.append(message);
        room.bus.publish(Event::MessagePosted(posted.clone()));
        trace!("Posted message {} in {}", posted.seq, room.room.id);
        Ok(SendOutcome::Posted(posted))
    }

    // Cooldown notices are shown once per cooldown
    async fn cooldown_notice(
        &self,
        room: &RoomState,
        sender: &UserRef,
        state: &mut ClientState,
        now: DateTime<Utc>,
    ) -> Option<Arc<Message>> {
        if state.cooldown_notice_sent {
            return None;
        }
        state.cooldown_notice_sent = true;
        Some(
            self.post_notice(room, sender, COOLDOWN_NOTICE_TEMPLATE, now)
                .await,
        )
    }

    async fn post_notice(
        &self,
        room: &RoomState,
        recipient: &UserRef,
        template: &str,
        now: DateTime<Utc>,
    ) -> Arc<Message> {
        let mut notice = Message::notice(&room.room.id, template, recipient);
        notice.timestamp = now;
        let notice = room.inner.lock().await.append(notice);
        room.bus.publish(Event::MessagePosted(notice.clone()));
        notice
    }

    /// The user's whole outbox, oldest first; marks everything as read
    pub async fn messages_for(&self, user_id: &str) -> Result<Vec<Arc<Message>>> {
        self.read_outbox(user_id, false).await
    }

    /// Messages not yet read, oldest first; marks them as read
    pub async fn unread_messages(&self, user_id: &str) -> Result<Vec<Arc<Message>>> {
        self.read_outbox(user_id, true).await
    }

    async fn read_outbox(&self, user_id: &str, unread_only: bool) -> Result<Vec<Arc<Message>>> {
        let room = self
            .user_room(user_id)
            .await
            .ok_or_else(|| ChatError::UserNotFound(user_id.to_string()))?;
        let mut inner = room.inner.lock().await;
        let entry = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| ChatError::UserNotFound(user_id.to_string()))?;

        let since = entry.last_read_seq;
        let messages = entry
            .outbox
            .iter()
            .filter(|m| !unread_only || m.seq > since)
            .cloned()
            .collect();
        entry.last_read_seq = entry.latest_seq();
        Ok(messages)
    }

    // ----- liveness and change detection -----

    /// Record that the user is still around; false if unknown
    pub async fn ping(&self, user_id: &str) -> bool {
        self.ping_at(user_id, Utc::now()).await
    }

    pub async fn ping_at(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        let Some(room) = self.user_room(user_id).await else {
            return false;
        };
        let mut inner = room.inner.lock().await;
        match inner.users.get_mut(user_id) {
            Some(entry) => {
                entry.last_ping = now;
                true
            }
            None => false,
        }
    }

    pub async fn is_stale(&self, user_id: &str) -> bool {
        self.is_stale_at(user_id, Utc::now()).await
    }

    pub async fn is_stale_at(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        let Some(room) = self.user_room(user_id).await else {
            return false;
        };
        let inner = room.inner.lock().await;
        inner
            .users
            .get(user_id)
            .is_some_and(|entry| now - entry.last_ping > self.options.stale_timeout)
    }

    /// Whether the outbox holds messages the user has not read
    pub async fn has_new_messages(&self, user_id: &str) -> bool {
        let Some(room) = self.user_room(user_id).await else {
            return false;
        };
        let inner = room.inner.lock().await;
        inner
            .users
            .get(user_id)
            .is_some_and(|entry| entry.latest_seq() > entry.last_read_seq)
    }

    /// Whether the room's user list changed since the user last asked
    pub async fn has_user_list_changed(&self, user_id: &str) -> bool {
        let Some(room) = self.user_room(user_id).await else {
            return false;
        };
        let mut inner = room.inner.lock().await;
        let version = inner.user_list_version;
        match inner.users.get_mut(user_id) {
            Some(entry) if entry.seen_user_list_version < version => {
                entry.seen_user_list_version = version;
                true
            }
            _ => false,
        }
    }

    /// Deregister web users that stopped pinging
    pub async fn sweep_stale_users_at(&self, now: DateTime<Utc>) -> Vec<User> {
        let mut stale = Vec::new();
        for room in self.rooms.values() {
            let inner = room.inner.lock().await;
            stale.extend(
                inner
                    .users
                    .values()
                    .filter(|entry| entry.user.is_web_user())
                    .filter(|entry| now - entry.last_ping > self.options.stale_timeout)
                    .map(|entry| entry.user.id.clone()),
            );
        }

        let mut removed = Vec::new();
        for user_id in stale {
            if let Some(user) = self.deregister_user(&user_id).await {
                removed.push(user);
            }
        }
        removed
    }

    pub fn start_stale_sweeper(self: Arc<Self>, every: std::time::Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = self.sweep_stale_users_at(Utc::now()).await;
                if !removed.is_empty() {
                    info!("Logged out {} stale web users", removed.len());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::core::message::SpeechMode;
    use crate::profanity::WordListFilter;

    fn rooms() -> RoomsFile {
        let mut lobby = RoomConfig::new("lobby", "Lobby", "#FFFF00");
        lobby.intro_message = Some("Welcome {nickname}".to_string());
        let mut bridged = RoomConfig::new("bridged", "Bridged", "#000080");
        bridged.bridge_channel = Some("chan-1".to_string());
        RoomsFile {
            admin: AdminConfig {
                id: "owner".to_string(),
                nickname: "Webmaster".to_string(),
                color: "#FF0000".to_string(),
                bridge_id: Some("admin-bridge".to_string()),
            },
            rooms: vec![lobby, bridged],
        }
    }

    fn store() -> ChatStore {
        let filter = WordListFilter::new(["darn"], ["villain"]);
        ChatStore::new(&rooms(), StoreOptions::default(), Arc::new(filter))
    }

    async fn join(store: &ChatStore, session: &str, nickname: &str) -> User {
        store
            .register_user(Registration::socket(
                "lobby",
                session,
                nickname,
                "#FF0000",
                ClientInfo::default(),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_admin_present_in_bridged_room_only() {
        let store = store();
        assert_eq!(store.online_users("bridged").await.len(), 1);
        assert!(store.online_users("lobby").await.is_empty());

        let admin_id = combined_id("bridged", "owner");
        assert!(store.deregister_user(&admin_id).await.is_none());
        assert!(store.is_present(&admin_id).await);
    }

    #[tokio::test]
    async fn test_nickname_rules() {
        let store = store();
        join(&store, "a", "Alice").await;

        let taken = Registration::socket("lobby", "b", " alice ", "#000000", ClientInfo::default());
        assert!(matches!(store.register_user(taken).await, Err(ChatError::NicknameTaken)));

        let admin_like = Registration::socket("lobby", "c", "Web_Master", "#000000", ClientInfo::default());
        assert!(matches!(store.register_user(admin_like).await, Err(ChatError::NicknameTaken)));

        let profane = Registration::socket("lobby", "d", "darn it", "#000000", ClientInfo::default());
        assert!(matches!(store.register_user(profane).await, Err(ChatError::InvalidNickname(_))));

        // Uniqueness is per room
        let elsewhere = Registration::socket("bridged", "a", "Alice", "#000000", ClientInfo::default());
        assert!(store.register_user(elsewhere).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_room_and_bad_color() {
        let store = store();
        let missing = Registration::socket("nowhere", "a", "Alice", "#000000", ClientInfo::default());
        assert!(matches!(store.register_user(missing).await, Err(ChatError::RoomNotFound(_))));

        let user = store
            .register_user(Registration::socket("lobby", "a", "Alice", "red", ClientInfo::default()))
            .await
            .unwrap();
        assert_eq!(user.color, COLOR_BLACK);
    }

    #[tokio::test]
    async fn test_web_user_gets_private_intro() {
        let store = store();
        let bob = join(&store, "b", "Bob").await;
        let alice = store
            .register_user(Registration::web("lobby", "sess-1", "Alice", "#FF0000"))
            .await
            .unwrap();

        let alice_msgs = store.messages_for(&alice.id).await.unwrap();
        let intro = alice_msgs.last().unwrap();
        assert!(intro.private);
        assert_eq!(intro.rendered_body(), "Welcome Alice");

        let bob_msgs = store.messages_for(&bob.id).await.unwrap();
        assert!(bob_msgs.iter().all(|m| !m.private));
    }

    #[tokio::test]
    async fn test_backfill_and_read_tracking() {
        let store = store();
        let alice = join(&store, "a", "Alice").await;
        let mut state = ClientState::new("1.1.1.1");
        store
            .send_message(MessageDraft::new("lobby", &alice.id, "hello"), &mut state)
            .await
            .unwrap();

        let bob = join(&store, "b", "Bob").await;
        let bodies: Vec<String> = store
            .messages_for(&bob.id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.rendered_body())
            .collect();
        assert_eq!(
            bodies,
            vec!["Alice has joined the room!", "hello", "Bob has joined the room!"]
        );
        assert!(!store.has_new_messages(&bob.id).await);

        store
            .send_message(MessageDraft::new("lobby", &alice.id, "again"), &mut state)
            .await
            .unwrap();
        assert!(store.has_new_messages(&bob.id).await);
        let unread = store.unread_messages(&bob.id).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].body, "again");
    }

    #[tokio::test]
    async fn test_user_list_change_is_consumed() {
        let store = store();
        let alice = join(&store, "a", "Alice").await;
        assert!(!store.has_user_list_changed(&alice.id).await);

        join(&store, "b", "Bob").await;
        assert!(store.has_user_list_changed(&alice.id).await);
        assert!(!store.has_user_list_changed(&alice.id).await);
    }

    #[tokio::test]
    async fn test_content_screening() {
        let store = store();
        let alice = join(&store, "a", "Alice").await;
        let mut state = ClientState::new("ip");

        let masked = store
            .send_message(MessageDraft::new("lobby", &alice.id, "oh darn"), &mut state)
            .await
            .unwrap();
        assert_eq!(masked.posted().unwrap().body, "oh d**n");

        let blocked = store
            .send_message(MessageDraft::new("lobby", &alice.id, "you villain"), &mut state)
            .await
            .unwrap();
        assert_eq!(blocked.reject_reason(), Some(RejectReason::Blocked));
        assert!(blocked.notice().unwrap().rendered_body().contains("Let's be nice"));

        let empty = store
            .send_message(MessageDraft::new("lobby", &alice.id, "   "), &mut state)
            .await;
        assert!(matches!(empty, Err(ChatError::EmptyMessage)));

        let stranger = store
            .send_message(MessageDraft::new("lobby", "nobody", "hi"), &mut state)
            .await;
        assert!(matches!(stranger, Err(ChatError::UserNotFound(_))));
    }

    #[tokio::test]
    async fn test_scream_interval_is_not_charged_to_flood_control() {
        let store = store();
        let alice = join(&store, "a", "Alice").await;
        let mut state = ClientState::new("ip");
        let now = Utc::now();
        let scream = || MessageDraft::new("lobby", &alice.id, "HEY").mode(SpeechMode::ScreamsAt);

        let first = store.send_message_at(scream(), &mut state, now).await.unwrap();
        assert!(first.is_posted());

        // Many rejected screams in one window never trip the flood limit
        for i in 1..=20 {
            let again = store
                .send_message_at(scream(), &mut state, now + Duration::milliseconds(i * 10))
                .await
                .unwrap();
            assert_eq!(again.reject_reason(), Some(RejectReason::ScreamTooSoon));
        }
        assert!(!store.flood_control().is_cooldown_period_at("ip", now + Duration::seconds(1)).await);

        let later = now + Duration::seconds(SCREAM_INTERVAL_SECS + 1);
        assert!(store.send_message_at(scream(), &mut state, later).await.unwrap().is_posted());
    }

    #[tokio::test]
    async fn test_cooldown_notice_is_sent_once() {
        let store = store();
        let alice = join(&store, "a", "Alice").await;
        let mut state = ClientState::new("ip");
        let now = Utc::now();

        for i in 0..10 {
            let outcome = store
                .send_message_at(
                    MessageDraft::new("lobby", &alice.id, format!("msg {}", i)),
                    &mut state,
                    now + Duration::milliseconds(i * 100),
                )
                .await
                .unwrap();
            assert!(outcome.is_posted());
        }

        let tripped = store
            .send_message_at(MessageDraft::new("lobby", &alice.id, "one more"), &mut state, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(tripped.reject_reason(), Some(RejectReason::Cooldown));
        assert!(tripped.notice().is_some());

        let silent = store
            .send_message_at(MessageDraft::new("lobby", &alice.id, "still"), &mut state, now + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(silent.reject_reason(), Some(RejectReason::Cooldown));
        assert!(silent.notice().is_none());
    }

    #[tokio::test]
    async fn test_stale_sweep_only_removes_web_users() {
        let store = store();
        let socket_user = join(&store, "a", "Alice").await;
        let web_user = store
            .register_user(Registration::web("lobby", "sess", "Bob", "#000000"))
            .await
            .unwrap();

        let later = Utc::now() + Duration::seconds(USER_STALE_TIMEOUT_SECS as i64 + 5);
        assert!(store.is_stale_at(&web_user.id, later).await);

        let removed = store.sweep_stale_users_at(later).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, web_user.id);
        assert!(store.is_present(&socket_user.id).await);
        assert!(!store.bound_sessions().await.contains("sess"));
    }

    #[tokio::test]
    async fn test_bridged_users_are_quiet_and_unlisted() {
        let store = store();
        let user = store
            .register_user(Registration::bridge("bridged", "discord-7", "some.one"))
            .await
            .unwrap();
        assert!(user.is_bridged());
        assert_eq!(store.online_users("bridged").await.len(), 1);
        assert_eq!(store.room_users("bridged").await.len(), 2);
        assert!(store.history("bridged").await.unwrap().is_empty());
        assert_eq!(
            store.find_user_by_bridge_id("bridged", "discord-7").await.unwrap().id,
            user.id
        );
        assert_eq!(store.find_room_by_bridge_channel("chan-1").unwrap().id, "bridged");
    }

    #[tokio::test]
    async fn test_trimmed_nickname_must_be_long_enough() {
        let store = store();
        let short = Registration::socket("lobby", "a", " ab ", "#000000", ClientInfo::default());
        assert!(matches!(
            store.register_user(short).await,
            Err(ChatError::InvalidNickname(_))
        ));
        assert!(store.room_users("lobby").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rejoin_racing_leave_keeps_user_reachable() {
        let store = Arc::new(store());
        let rejoin = || Registration::web("lobby", "sess", "Alice", "#FF0000");

        for round in 0..200 {
            let user = store.register_user(rejoin()).await.unwrap();

            let leaving = {
                let store = store.clone();
                let user_id = user.id.clone();
                tokio::spawn(async move { store.deregister_user(&user_id).await })
            };
            let joining = {
                let store = store.clone();
                tokio::spawn(async move { store.register_user(rejoin()).await })
            };
            leaving.await.unwrap();
            let _ = joining.await.unwrap();

            // A user listed in the room must also be reachable by id
            let listed = store.room_users("lobby").await.iter().any(|u| u.id == user.id);
            assert_eq!(store.is_present(&user.id).await, listed, "round {}", round);
            assert_eq!(store.ping(&user.id).await, listed, "round {}", round);

            store.deregister_user(&user.id).await;
            assert!(store.room_users("lobby").await.is_empty(), "round {}", round);
        }
    }
}
