// Conversation retrieval, sending and read-state changes for ChatService

use log::{debug, error, info};

use super::ChatService;
use crate::backend::{MessageFilter, MessageQuery};
use crate::models::{Message, MessageStatus, NewMessage};

impl ChatService {
    /// Every message exchanged between `user_id` and `contact_id`, oldest first
    pub async fn get_messages(&self, user_id: &str, contact_id: &str) -> Vec<Message> {
        let query = MessageQuery::new(vec![MessageFilter::Between(
            user_id.to_string(),
            contact_id.to_string(),
        )]);

        match self.backend.select_messages(&query).await {
            Ok(messages) => messages,
            Err(e) => {
                error!("Error fetching messages with {}: {}", contact_id, e);
                Vec::new()
            }
        }
    }

    /// Insert a message with status `sent`. `None` means it was not sent.
    pub async fn send_message(&self, sender_id: &str, receiver_id: &str, content: &str) -> Option<Message> {
        let new_message = NewMessage {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            status: MessageStatus::Sent,
        };

        match self.backend.insert_message(&new_message).await {
            Ok(message) => {
                info!("Sent message {} to {}", message.id, receiver_id);
                Some(message)
            }
            Err(e) => {
                error!("Error sending message to {}: {}", receiver_id, e);
                None
            }
        }
    }

    /// Mark everything `contact_id` sent to `user_id` as read
    pub async fn mark_messages_as_read(&self, user_id: &str, contact_id: &str) {
        let filters = [
            MessageFilter::SenderIs(contact_id.to_string()),
            MessageFilter::ReceiverIs(user_id.to_string()),
            MessageFilter::StatusBelow(MessageStatus::Read),
        ];

        match self
            .backend
            .update_message_status(&filters, MessageStatus::Read)
            .await
        {
            Ok(changed) => debug!("Marked {} message(s) from {} as read", changed, contact_id),
            Err(e) => error!("Error marking messages as read: {}", e),
        }
    }

    /// Mark the given messages as read. Ownership is not checked; callers
    /// pass ids of inbound messages the user has actually seen.
    pub async fn mark_specific_messages_as_read(&self, message_ids: &[String]) {
        if message_ids.is_empty() {
            return;
        }

        // Rows already read are left alone so they emit no update
        let filters = [
            MessageFilter::IdIn(message_ids.to_vec()),
            MessageFilter::StatusBelow(MessageStatus::Read),
        ];

        match self
            .backend
            .update_message_status(&filters, MessageStatus::Read)
            .await
        {
            Ok(changed) => debug!("Marked {} of {} viewed message(s) as read", changed, message_ids.len()),
            Err(e) => error!("Error marking specific messages as read: {}", e),
        }
    }
}
