//! Long-poll support: block until a user has something new, or time out

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use serde::Serialize;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::core::event_bus::Subscription;
use crate::core::events::Event;
use crate::core::store::ChatStore;

/// What changed for a user while they waited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UpdateStatus {
    pub has_new_messages: bool,
    pub user_list_changed: bool,
    /// False once the user has left or been removed from the room
    pub still_present: bool,
}

impl UpdateStatus {
    pub fn gone() -> Self {
        Self::default()
    }

    pub fn has_changes(&self) -> bool {
        self.has_new_messages || self.user_list_changed
    }
}

#[derive(Clone)]
pub struct UpdateWaiter {
    store: Arc<ChatStore>,
}

impl UpdateWaiter {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self { store }
    }

    /// Wait until `user_id` has unread messages or a changed user list in `room_id`.
    ///
    /// Returns immediately if something is already pending. The subscription
    /// taken for the wait is released on every return path.
    pub async fn await_next(&self, room_id: &str, user_id: &str, timeout: Duration) -> UpdateStatus {
        let Some(room) = self.store.room_state(room_id) else {
            return UpdateStatus::gone();
        };
        if self.store.user_room_id(user_id).await.as_deref() != Some(room_id) {
            return UpdateStatus::gone();
        }

        // Subscribe before checking pending state so nothing slips between the two
        let subscriber_id = format!("poll:{}:{}", user_id, Uuid::new_v4());
        let subscription = Subscription::new(room.bus(), &subscriber_id);
        let deadline = Instant::now() + timeout;

        let mut status = UpdateStatus {
            has_new_messages: self.store.has_new_messages(user_id).await,
            user_list_changed: self.store.has_user_list_changed(user_id).await,
            still_present: true,
        };

        while !status.has_changes() {
            let event = tokio::select! {
                event = subscription.inbox().recv() => event,
                _ = sleep_until(deadline) => {
                    trace!("Update wait for {} timed out", user_id);
                    break;
                }
            };

            let Some(event) = event else {
                break;
            };

            match event {
                event if event.delivers_message_to(user_id) => {
                    status.has_new_messages = true;
                }
                Event::UserLeft(user) | Event::UserKicked { user, .. } if user.id == user_id => {
                    debug!("{} left while waiting for updates", user_id);
                    break;
                }
                event if event.changes_user_list() => {
                    status.user_list_changed = self.store.has_user_list_changed(user_id).await;
                }
                _ => {}
            }
        }

        drop(subscription);
        status.still_present = self.store.is_present(user_id).await;
        if !status.still_present {
            return UpdateStatus::gone();
        }

        // One mutation can publish several events; report everything it changed
        if !status.user_list_changed {
            status.user_list_changed = self.store.has_user_list_changed(user_id).await;
        }
        if !status.has_new_messages {
            status.has_new_messages = self.store.has_new_messages(user_id).await;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoomConfig, RoomsFile};
    use crate::core::message::MessageDraft;
    use crate::core::session::ClientState;
    use crate::core::store::{Registration, StoreOptions};
    use crate::core::user::ClientInfo;
    use crate::profanity::WordListFilter;

    async fn setup() -> (Arc<ChatStore>, String, String) {
        let rooms = RoomsFile {
            admin: Default::default(),
            rooms: vec![RoomConfig::new("lobby", "Lobby", "#FFFFFF")],
        };
        let store = Arc::new(ChatStore::new(
            &rooms,
            StoreOptions::default(),
            Arc::new(WordListFilter::default()),
        ));
        let alice = store
            .register_user(Registration::socket("lobby", "a", "Alice", "#FF0000", ClientInfo::default()))
            .await
            .unwrap();
        let bob = store
            .register_user(Registration::socket("lobby", "b", "Bob", "#0000FF", ClientInfo::default()))
            .await
            .unwrap();
        // Clear what Alice has pending from the joins
        store.messages_for(&alice.id).await.unwrap();
        store.has_user_list_changed(&alice.id).await;
        (store, alice.id, bob.id)
    }

    #[tokio::test]
    async fn test_times_out_without_changes() {
        let (store, alice, _) = setup().await;
        let waiter = UpdateWaiter::new(store.clone());

        let status = waiter
            .await_next("lobby", &alice, Duration::from_millis(50))
            .await;
        assert_eq!(
            status,
            UpdateStatus {
                has_new_messages: false,
                user_list_changed: false,
                still_present: true
            }
        );
        assert_eq!(store.room_state("lobby").unwrap().bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_returns_immediately_when_pending() {
        let (store, alice, bob) = setup().await;
        let mut state = ClientState::new("bob-ip");
        store
            .send_message(MessageDraft::new("lobby", &bob, "hi"), &mut state)
            .await
            .unwrap();

        let waiter = UpdateWaiter::new(store);
        let status = waiter
            .await_next("lobby", &alice, Duration::from_secs(30))
            .await;
        assert!(status.has_new_messages);
    }

    #[tokio::test]
    async fn test_wakes_on_user_list_change() {
        let (store, alice, _) = setup().await;
        let waiter = UpdateWaiter::new(store.clone());
        let handle = {
            let alice = alice.clone();
            tokio::spawn(async move { waiter.await_next("lobby", &alice, Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .register_user(Registration::socket("lobby", "c", "Carol", "#000000", ClientInfo::default()))
            .await
            .unwrap();

        let status = handle.await.unwrap();
        assert!(status.user_list_changed);
        assert!(status.still_present);
    }

    #[tokio::test]
    async fn test_reports_gone_for_unknown_or_removed_user() {
        let (store, alice, _) = setup().await;
        let waiter = UpdateWaiter::new(store.clone());

        assert_eq!(
            waiter.await_next("lobby", "ghost", Duration::from_secs(1)).await,
            UpdateStatus::gone()
        );
        assert_eq!(
            waiter.await_next("nowhere", &alice, Duration::from_secs(1)).await,
            UpdateStatus::gone()
        );

        let handle = {
            let waiter = waiter.clone();
            let alice = alice.clone();
            tokio::spawn(async move { waiter.await_next("lobby", &alice, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.deregister_user(&alice).await;

        let status = handle.await.unwrap();
        assert!(!status.still_present);
    }
}
