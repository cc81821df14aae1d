// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_SOCKET_PORT: u16 = 3000;
pub const DEFAULT_ROOMS_FILE: &str = "rooms.json";
pub const WS_PATH: &str = "ws";

// Room and user bookkeeping
pub const DEFAULT_HISTORY_CAPACITY: usize = 200;
pub const MAX_OUTBOX_MESSAGES: usize = 200;
pub const USER_STALE_TIMEOUT_SECS: u64 = 120;
pub const STALE_SWEEP_INTERVAL_SECS: u64 = 20;
pub const SESSION_CLEANUP_INTERVAL_SECS: u64 = 120;
pub const UPDATER_WAIT_TIMEOUT_MS: u64 = 30_000;
pub const SCREAM_INTERVAL_SECS: i64 = 120;
pub const EVENT_INBOX_CAPACITY: usize = 64;
pub const SERVER_TIME_INTERVAL_SECS: u64 = 300;

// Nickname rules
pub const NICKNAME_MIN_LEN: usize = 3;
pub const NICKNAME_MAX_LEN: usize = 20;

// Flood control: a flood is more than FLOOD_MAX_MESSAGES within FLOOD_WINDOW_SECS
pub const FLOOD_WINDOW_SECS: i64 = 5;
pub const FLOOD_MAX_MESSAGES: usize = 10;
pub const FLOOD_COOLDOWN_SECS: i64 = 120;
pub const FLOOD_MAX_FLOODS: u32 = 4;
pub const FLOOD_BAN_MINUTES: i64 = 30;
pub const FLOOD_MAX_TRACKED_CLIENTS: usize = 10_000;
// Bridged authors whose flood-control state is remembered
pub const BRIDGE_MAX_TRACKED_AUTHORS: usize = 1_000;

// System message templates; NICKNAME_PLACEHOLDER is replaced by the subject's nickname
pub const NICKNAME_PLACEHOLDER: &str = "{nickname}";
pub const JOINED_TEMPLATE: &str = "{nickname} has joined the room!";
pub const LEFT_TEMPLATE: &str = "{nickname} has left the room!";
pub const FLOOD_KICK_TEMPLATE: &str =
    "{nickname} was kicked for flooding the channel too many times.";
pub const BE_NICE_TEMPLATE: &str =
    "Come on {nickname}! Let's be nice! This is a place for having fun!";
pub const FLOOD_KICK_REASON: &str = "You have been temporarily kicked out for flooding.";

pub const COLOR_BLACK: &str = "#000000";

/// Nickname color palette offered to clients, as (hex color, display name)
pub const NICKNAME_COLORS: [(&str, &str); 10] = [
    (COLOR_BLACK, "Black"),
    ("#878700", "Beige"),
    ("#875f00", "Brown"),
    ("#FF00AF", "Pink"),
    ("#800080", "Purple"),
    ("#004080", "Navy"),
    ("#008080", "Teal"),
    ("#FFAF00", "Orange"),
    ("#FF0000", "Red"),
    ("#0000FF", "Blue"),
];

pub const COOLDOWN_NOTICE_TEMPLATE: &str =
    "Hey {nickname}, chill out, you'll be able to send messages again 2 minutes after your last message attempt.";
pub const SCREAM_TOO_SOON_TEMPLATE: &str =
    "Hi {nickname}, you're only allowed to scream once every 2 minutes.";
