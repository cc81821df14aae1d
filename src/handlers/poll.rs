//! JSON long-poll API for web clients
//!
//! Web users are bound to a session id. Their user id in a room is derived
//! from the room and session, so every request only needs the session id.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::http::{HeaderMap, StatusCode};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::core::message::{Message, MessageDraft, MessageSource, SpeechMode};
use crate::core::room::Room;
use crate::core::session::Sessions;
use crate::core::store::{ChatStore, Registration, SendOutcome};
use crate::core::update_waiter::UpdateWaiter;
use crate::core::user::{combined_id, User, UserRef};
use crate::error::ChatError;
use crate::handlers::ip::extract_client_ip;
use crate::protocol::schema::TIME_FORMAT;

const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Everything the poll handlers need
#[derive(Clone)]
pub struct PollContext {
    pub store: Arc<ChatStore>,
    pub sessions: Sessions,
    pub waiter: UpdateWaiter,
    pub poll_timeout: Duration,
    pub trust_proxy_headers: bool,
}

impl PollContext {
    pub fn new(store: Arc<ChatStore>, sessions: Sessions, poll_timeout: Duration) -> Self {
        Self {
            waiter: UpdateWaiter::new(store.clone()),
            store,
            sessions,
            poll_timeout,
            trust_proxy_headers: false,
        }
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub nickname: String,
    #[serde(default)]
    pub color: String,
    /// Reuse an existing session instead of starting a new one
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub session_id: String,
    pub body: String,
    /// Addressee user id
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub mode: SpeechMode,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
    /// Return the whole outbox instead of only unread messages
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub session_id: String,
}

#[derive(Serialize)]
struct RoomView {
    #[serde(flatten)]
    room: Room,
    online: usize,
}

#[derive(Serialize)]
struct JoinResponse {
    session_id: String,
    user: User,
}

/// A message as rendered for web clients
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub time: String,
    pub from: Option<UserRef>,
    pub to: Option<UserRef>,
    pub private: bool,
    pub mode: SpeechMode,
    pub is_system: bool,
    pub source: MessageSource,
    pub body: String,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            seq: message.seq,
            timestamp: message.timestamp,
            time: message.timestamp.format(TIME_FORMAT).to_string(),
            from: message.from.clone(),
            to: message.to.clone(),
            private: message.private,
            mode: message.mode,
            is_system: message.is_system,
            source: message.source,
            body: message.rendered_body(),
        }
    }
}

#[derive(Serialize)]
struct SendResponse {
    posted: bool,
    message: Option<MessageView>,
    notice: Option<MessageView>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: message.into(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn status_for(error: &ChatError) -> StatusCode {
    match error {
        ChatError::RoomNotFound(_) | ChatError::UserNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::UserExists | ChatError::NicknameTaken => StatusCode::CONFLICT,
        ChatError::FloodBanned => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn chat_error(error: &ChatError) -> Response {
    json_error(status_for(error), error.user_message())
}

fn with_context(ctx: PollContext) -> impl Filter<Extract = (PollContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// All `/api` routes
pub fn poll_routes(ctx: PollContext) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let rooms = warp::path!("api" / "rooms")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(list_rooms);

    let users = warp::path!("api" / "rooms" / String / "users")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(list_users);

    let join = warp::path!("api" / "rooms" / String / "join")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_context(ctx.clone()))
        .and_then(join_room);

    let send = warp::path!("api" / "rooms" / String / "messages")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_context(ctx.clone()))
        .and_then(send_message);

    let messages = warp::path!("api" / "rooms" / String / "messages")
        .and(warp::get())
        .and(warp::query::<SessionQuery>())
        .and(with_context(ctx.clone()))
        .and_then(get_messages);

    let updates = warp::path!("api" / "rooms" / String / "updates")
        .and(warp::get())
        .and(warp::query::<SessionQuery>())
        .and(with_context(ctx.clone()))
        .and_then(wait_for_updates);

    let logout = warp::path!("api" / "rooms" / String / "logout")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_context(ctx))
        .and_then(logout);

    rooms
        .or(users)
        .or(join)
        .or(send)
        .or(messages)
        .or(updates)
        .or(logout)
}

async fn list_rooms(ctx: PollContext) -> Result<Response, Rejection> {
    let mut views = Vec::new();
    for room in ctx.store.rooms() {
        let online = ctx.store.online_users(&room.id).await.len();
        views.push(RoomView { room, online });
    }
    Ok(warp::reply::json(&views).into_response())
}

async fn list_users(room_id: String, ctx: PollContext) -> Result<Response, Rejection> {
    if ctx.store.room(&room_id).is_none() {
        return Ok(chat_error(&ChatError::RoomNotFound(room_id)));
    }
    let users = ctx.store.online_users(&room_id).await;
    Ok(warp::reply::json(&users).into_response())
}

async fn join_room(
    room_id: String,
    request: JoinRequest,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    ctx: PollContext,
) -> Result<Response, Rejection> {
    let client_ip =
        extract_client_ip(&headers, remote, ctx.trust_proxy_headers).map(|ip| ip.to_string());
    let session = match request.session_id.filter(|id| !id.is_empty()) {
        Some(id) => ctx.sessions.get_or_create(&id, client_ip.as_deref()).await,
        None => ctx.sessions.create(client_ip.as_deref()).await,
    };
    let client_key = session.state.lock().await.client_key.clone();

    let registration = Registration::web(&room_id, &session.id, request.nickname, request.color)
        .with_client_key(client_key);
    match ctx.store.register_user(registration).await {
        Ok(user) => {
            info!("Web user {} joined {} with session {}", user.nickname, room_id, session.id);
            let response = JoinResponse {
                session_id: session.id.clone(),
                user,
            };
            Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::CREATED)
                .into_response())
        }
        Err(e) => {
            debug!("Web join to {} refused: {}", room_id, e);
            Ok(chat_error(&e))
        }
    }
}

async fn send_message(
    room_id: String,
    request: SendRequest,
    ctx: PollContext,
) -> Result<Response, Rejection> {
    let Some(session) = ctx.sessions.get(&request.session_id).await else {
        return Ok(json_error(StatusCode::UNAUTHORIZED, "Your session has expired."));
    };
    let user_id = combined_id(&room_id, &session.id);
    ctx.store.ping(&user_id).await;

    let mut draft = MessageDraft::new(&room_id, &user_id, request.body)
        .mode(request.mode)
        .source(MessageSource::Web);
    if let Some(to) = request.to.filter(|to| !to.is_empty()) {
        draft = draft.to(to);
    }
    if request.private {
        draft = draft.privately();
    }

    let mut state = session.state.lock().await;
    let response = match ctx.store.send_message(draft, &mut state).await {
        Ok(SendOutcome::Posted(message)) => SendResponse {
            posted: true,
            message: Some(MessageView::from(message.as_ref())),
            notice: None,
        },
        Ok(SendOutcome::Rejected { reason, notice }) => {
            debug!("Web message from {} rejected: {:?}", user_id, reason);
            SendResponse {
                posted: false,
                message: None,
                notice: notice.as_deref().map(MessageView::from),
            }
        }
        Err(e) => return Ok(chat_error(&e)),
    };
    Ok(warp::reply::json(&response).into_response())
}

async fn get_messages(
    room_id: String,
    query: SessionQuery,
    ctx: PollContext,
) -> Result<Response, Rejection> {
    let user_id = combined_id(&room_id, &query.session_id);
    ctx.store.ping(&user_id).await;

    let messages = if query.all {
        ctx.store.messages_for(&user_id).await
    } else {
        ctx.store.unread_messages(&user_id).await
    };
    match messages {
        Ok(messages) => {
            let views: Vec<MessageView> = messages.iter().map(|m| MessageView::from(m.as_ref())).collect();
            Ok(warp::reply::json(&views).into_response())
        }
        Err(e) => Ok(chat_error(&e)),
    }
}

async fn wait_for_updates(
    room_id: String,
    query: SessionQuery,
    ctx: PollContext,
) -> Result<Response, Rejection> {
    let user_id = combined_id(&room_id, &query.session_id);
    // Holding a poll open counts as being online
    ctx.store.ping(&user_id).await;
    let status = ctx.waiter.await_next(&room_id, &user_id, ctx.poll_timeout).await;
    Ok(warp::reply::json(&status).into_response())
}

async fn logout(
    room_id: String,
    request: LogoutRequest,
    ctx: PollContext,
) -> Result<Response, Rejection> {
    let user_id = combined_id(&room_id, &request.session_id);
    let left = ctx.store.deregister_user(&user_id).await.is_some();
    // The session may still be bound to a user in another room
    if !ctx.store.bound_sessions().await.contains(&request.session_id)
        && ctx.sessions.remove(&request.session_id).await
    {
        debug!("Dropped session {} on logout", request.session_id);
    }
    Ok(warp::reply::json(&serde_json::json!({ "left": left })).into_response())
}

/// Turn warp rejections into JSON errors
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };
    Ok(json_error(status, message))
}
