//! Core functionality for the chat rooms

pub mod event_bus;
pub mod events;
pub mod flood_control;
pub mod message;
pub mod nickname;
pub mod room;
pub mod session;
pub mod store;
pub mod update_waiter;
pub mod user;

// Re-export main components for convenience
pub use event_bus::{EventBus, Inbox, Subscription};
pub use events::Event;
pub use flood_control::{FloodControl, FloodPolicy, FloodVerdict};
pub use message::{Message, MessageDraft, MessageSource, SpeechMode};
pub use room::Room;
pub use session::{create_session_registry, ClientState, Session, SessionRegistry, Sessions};
pub use store::{ChatStore, Registration, RejectReason, SendOutcome, StoreOptions};
pub use update_waiter::{UpdateStatus, UpdateWaiter};
pub use user::{ClientInfo, Origin, User, UserRef};
