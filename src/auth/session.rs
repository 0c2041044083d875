// Process-wide session state container
//
// Readers get snapshots, a watch subscription, and an event stream.
// Writers are crate-private: session operations and the refresh
// coordinator's terminal-failure path.

use tokio::sync::{broadcast, watch};

use super::types::{SessionEvent, SessionState, User};

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 16;

/// Single source of truth for who, if anyone, is signed in
pub struct SessionStore {
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::initial());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state, events }
    }

    /// Current state
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Current user, if signed in
    pub fn user(&self) -> Option<User> {
        self.state.borrow().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Receive sign-in, sign-out and expiry notifications
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn begin_loading(&self) {
        self.state.send_if_modified(|state| {
            let changed = !state.is_loading;
            state.is_loading = true;
            changed
        });
    }

    /// Settle on a user (or none) and stop loading
    pub(crate) fn settle(&self, user: Option<User>) {
        self.state.send_modify(|state| {
            state.user = user;
            state.is_loading = false;
        });
    }

    pub(crate) fn signed_in(&self, user: User) {
        let user_id = user.id.clone();
        self.settle(Some(user));
        tracing::info!(user_id = %user_id, "Signed in");
        self.publish(SessionEvent::SignedIn { user_id });
    }

    /// Replace the user record after a profile update, keeping the session
    pub(crate) fn update_user(&self, user: User) {
        self.settle(Some(user));
    }

    pub(crate) fn signed_out(&self) {
        self.settle(None);
        tracing::info!("Signed out");
        self.publish(SessionEvent::SignedOut);
    }

    /// Drop the user after an unrecoverable authentication failure
    pub(crate) fn expire(&self) {
        let had_user = self.is_authenticated();
        self.settle(None);
        tracing::warn!(had_user, "Session expired, sign-in required");
        self.publish(SessionEvent::Expired);
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
