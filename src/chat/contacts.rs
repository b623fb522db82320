// Contact list, contact edges and user search for ChatService

use chrono::Local;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::cmp::Ordering;

use super::format::{format_message_date, sent_state_for};
use super::{ChatService, SEARCH_LIMIT};
use crate::backend::{BackendError, MessageFilter, MessageQuery, SortOrder, Table};
use crate::models::{Contact, ContactEdge, MessageStatus, Profile};

impl ChatService {
    /// Contacts of `user_id` with latest-message preview, unread count and
    /// sent-state ticks, most recent conversation first.
    ///
    /// Returns an empty list on any failure. A failed permission probe is
    /// remembered and every later call returns empty without querying.
    pub async fn get_contacts(&mut self, user_id: &str) -> Vec<Contact> {
        if user_id.is_empty() {
            error!("Cannot fetch contacts: user id is empty");
            return Vec::new();
        }

        if self.permission_denied {
            debug!("Skipping contact fetch, permission previously denied");
            return Vec::new();
        }

        if !self.ensure_authenticated().await {
            error!("User is not authenticated");
            return Vec::new();
        }

        if let Err(e) = self.backend.probe(Table::Profiles).await {
            error!("Permission check failed: {}", e);
            self.permission_denied = true;
            return Vec::new();
        }

        match self.load_contacts(user_id).await {
            Ok(contacts) => contacts,
            Err(e) => {
                error!("Error fetching contacts for {}: {}", user_id, e);
                Vec::new()
            }
        }
    }

    async fn load_contacts(&self, user_id: &str) -> Result<Vec<Contact>, BackendError> {
        if self.backend.fetch_profile(user_id).await?.is_none() {
            error!("No profile found for user {}", user_id);
            return Ok(Vec::new());
        }

        let contact_ids = self.backend.contact_ids(user_id).await?;
        if contact_ids.is_empty() {
            return Ok(Vec::new());
        }

        let profiles = self.backend.profiles_by_ids(&contact_ids).await?;

        // One independent fetch per contact; join_all keeps profile order
        let mut contacts = join_all(
            profiles
                .into_iter()
                .map(|profile| self.summarize_contact(user_id, profile)),
        )
        .await;

        sort_contacts(&mut contacts);
        debug!("Loaded {} contacts for {}", contacts.len(), user_id);
        Ok(contacts)
    }

    async fn summarize_contact(&self, user_id: &str, profile: Profile) -> Contact {
        let latest_query = MessageQuery::new(vec![MessageFilter::Between(
            user_id.to_string(),
            profile.id.clone(),
        )])
        .order(SortOrder::Descending)
        .limit(1);

        let latest = match self.backend.select_messages(&latest_query).await {
            Ok(mut messages) => messages.pop(),
            Err(e) => {
                warn!("Failed to load latest message with {}: {}", profile.id, e);
                None
            }
        };

        let unread_filters = [
            MessageFilter::SenderIs(profile.id.clone()),
            MessageFilter::ReceiverIs(user_id.to_string()),
            MessageFilter::StatusIs(MessageStatus::Received),
        ];
        let unread_count = match self.backend.count_messages(&unread_filters).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to count unread messages from {}: {}", profile.id, e);
                0
            }
        };

        let mut contact = Contact::from_profile(profile);
        contact.unread_count = unread_count;
        if let Some(message) = latest {
            contact.last_message_date = format_message_date(Some(message.created_at), &Local::now());
            contact.last_message_at = Some(message.created_at);
            contact.sent_state = sent_state_for(&message, user_id);
            contact.latest_message = message.content;
        }
        contact
    }

    /// Add a contact edge `user_id -> contact_id`. Succeeds without
    /// duplicating when the edge already exists.
    pub async fn add_contact(&self, user_id: &str, contact_id: &str) -> bool {
        match self.backend.find_contact_edge(user_id, contact_id).await {
            Ok(Some(_)) => {
                debug!("Contact {} already in list of {}", contact_id, user_id);
                return true;
            }
            Ok(None) => {}
            // Lookup failures fall through to the insert, which decides
            Err(e) => warn!("Error checking existing contact {}: {}", contact_id, e),
        }

        let edge = ContactEdge {
            user_id: user_id.to_string(),
            contact_id: contact_id.to_string(),
        };
        match self.backend.insert_contact_edge(&edge).await {
            Ok(()) => {
                info!("Added contact {} for {}", contact_id, user_id);
                true
            }
            Err(e) => {
                error!("Error adding contact {}: {}", contact_id, e);
                false
            }
        }
    }

    /// Profiles whose username contains `query` (case-insensitive), without
    /// the current user, at most ten
    pub async fn search_users(&self, query: &str, current_user_id: &str) -> Vec<Contact> {
        if query.is_empty() {
            return Vec::new();
        }

        match self
            .backend
            .search_profiles(query, current_user_id, SEARCH_LIMIT)
            .await
        {
            Ok(profiles) => profiles.into_iter().map(Contact::from_profile).collect(),
            Err(e) => {
                error!("Error searching users: {}", e);
                Vec::new()
            }
        }
    }
}

/// Most recent conversation first; contacts without history go last.
/// The sort is stable, so ties keep their current relative order.
pub fn sort_contacts(contacts: &mut [Contact]) {
    contacts.sort_by(|a, b| match (a.last_message_at, b.last_message_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
