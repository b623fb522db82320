// Chat data-access layer
// Contact listing, message retrieval and sending, read-state changes and the
// realtime subscription, all on top of one backend handle.
//
// Nothing here is fatal: failures are logged and degrade to an empty, None or
// false result.

use log::error;
use std::sync::Arc;

use crate::backend::Backend;

pub mod contacts;
pub mod format;
pub mod messages;
pub mod realtime;

pub use contacts::sort_contacts;
pub use realtime::{Subscription, SubscriptionState};

/// Maximum number of profiles returned by a user search
pub const SEARCH_LIMIT: usize = 10;

/// One client session's view of the chat backend.
///
/// Owns the two pieces of mutable state the layer needs: the cached
/// permission-denied flag and the single active realtime subscription.
pub struct ChatService {
    backend: Arc<dyn Backend>,
    permission_denied: bool,
    subscription: SubscriptionState,
}

impl ChatService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        ChatService {
            backend,
            permission_denied: false,
            subscription: SubscriptionState::Idle,
        }
    }

    /// True once a permission probe has failed; stays set for the lifetime
    /// of this service
    pub fn permission_denied(&self) -> bool {
        self.permission_denied
    }

    /// Whether the backend handle currently holds a live session
    pub async fn ensure_authenticated(&self) -> bool {
        match self.backend.get_session().await {
            Ok(session) => session.is_some(),
            Err(e) => {
                error!("Authentication error: {}", e);
                false
            }
        }
    }
}

impl Drop for ChatService {
    fn drop(&mut self) {
        if let SubscriptionState::Subscribed(subscription) = &self.subscription {
            subscription.abort_listener();
        }
    }
}
