// Realtime subscription for ChatService
// At most one subscription is active per service. Subscribing again tears the
// previous one down first (Subscribed -> Idle -> Subscribed).

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use super::ChatService;
use crate::backend::{Backend, ChangeKind, ChannelBinding, ChannelId, MessageFilter, RealtimeChannel};
use crate::models::{Message, MessageStatus};

pub enum SubscriptionState {
    Idle,
    Subscribed(Subscription),
}

/// Teardown handle for a realtime subscription.
///
/// Clones share state; `unsubscribe` on any of them is the same as
/// [`ChatService::unsubscribe_from_messages`] for that subscription and is
/// safe to call more than once.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    backend: Arc<dyn Backend>,
    channel_id: ChannelId,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Subscription {
    fn new(backend: Arc<dyn Backend>, channel_id: ChannelId, listener: JoinHandle<()>) -> Self {
        Subscription {
            inner: Arc::new(SubscriptionInner {
                backend,
                channel_id,
                listener: Mutex::new(Some(listener)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.channel_id
    }

    pub fn is_active(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn unsubscribe(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.abort_listener();
        if let Err(e) = self.inner.backend.remove_channel(self.inner.channel_id).await {
            warn!("Failed to remove realtime channel {}: {}", self.inner.channel_id, e);
        }
        info!("Unsubscribed from realtime channel {}", self.inner.channel_id);
    }

    pub(super) fn abort_listener(&self) {
        if let Ok(mut listener) = self.inner.listener.lock() {
            if let Some(task) = listener.take() {
                task.abort();
            }
        }
    }
}

impl ChatService {
    /// Listen for messages addressed to `user_id` and for status changes.
    ///
    /// An inbound message is first promoted to `received`; `on_new_message`
    /// runs only after that write has been accepted and gets the message
    /// with its promoted status. `on_status_change` gets every updated row,
    /// unfiltered, so consumers ignore messages they do not track.
    ///
    /// Returns `None` if the backend refused the subscription.
    pub async fn subscribe_to_messages<N, S>(
        &mut self,
        user_id: &str,
        on_new_message: N,
        on_status_change: S,
    ) -> Option<Subscription>
    where
        N: Fn(Message) + Send + Sync + 'static,
        S: Fn(Message) + Send + Sync + 'static,
    {
        self.unsubscribe_from_messages().await;

        let bindings = vec![ChannelBinding::inserts_for(user_id), ChannelBinding::all_updates()];
        let channel = match self.backend.subscribe(bindings).await {
            Ok(channel) => channel,
            Err(e) => {
                error!("Failed to subscribe to messages for {}: {}", user_id, e);
                return None;
            }
        };

        let channel_id = channel.id();
        let listener = tokio::spawn(listen(
            self.backend.clone(),
            channel,
            user_id.to_string(),
            on_new_message,
            on_status_change,
        ));

        let subscription = Subscription::new(self.backend.clone(), channel_id, listener);
        self.subscription = SubscriptionState::Subscribed(subscription.clone());
        info!("Subscribed to messages for {} on channel {}", user_id, channel_id);
        Some(subscription)
    }

    /// Release the active subscription, if any
    pub async fn unsubscribe_from_messages(&mut self) {
        if let SubscriptionState::Subscribed(subscription) =
            std::mem::replace(&mut self.subscription, SubscriptionState::Idle)
        {
            subscription.unsubscribe().await;
        }
    }

    pub fn is_subscribed(&self) -> bool {
        match &self.subscription {
            SubscriptionState::Subscribed(subscription) => subscription.is_active(),
            SubscriptionState::Idle => false,
        }
    }
}

// Events are handled one at a time, so a promotion write always completes
// before the next event is looked at.
async fn listen<N, S>(
    backend: Arc<dyn Backend>,
    mut channel: RealtimeChannel,
    user_id: String,
    on_new_message: N,
    on_status_change: S,
) where
    N: Fn(Message) + Send + Sync + 'static,
    S: Fn(Message) + Send + Sync + 'static,
{
    while let Some(event) = channel.recv().await {
        match event.kind {
            ChangeKind::Insert => {
                let mut message = event.new;
                if message.receiver_id != user_id {
                    continue;
                }

                let filters = [
                    MessageFilter::IdIn(vec![message.id.clone()]),
                    MessageFilter::StatusBelow(MessageStatus::Received),
                ];
                match backend
                    .update_message_status(&filters, MessageStatus::Received)
                    .await
                {
                    Ok(_) => message.status = message.status.max(MessageStatus::Received),
                    Err(e) => warn!("Failed to mark message {} as received: {}", message.id, e),
                }
                debug!("New message {} from {}", message.id, message.sender_id);
                on_new_message(message);
            }
            ChangeKind::Update => on_status_change(event.new),
        }
    }
    debug!("Realtime channel {} closed, listener exiting", channel.id());
}
