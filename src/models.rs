use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Row of the `profiles` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
}

/// Row of the `contacts` table: a directional edge user -> contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEdge {
    pub user_id: String,
    pub contact_id: String,
}

/// A contact as shown in the contacts list.
///
/// Built fresh on every fetch by joining the contact edge, the contact's
/// profile and the latest message exchanged with them.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub latest_message: String,
    pub unread_count: u64,
    pub sent_state: Option<UserSentState>,
    pub last_message_date: String,
    // Only used for ordering the list
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn from_profile(profile: Profile) -> Self {
        Contact {
            id: profile.id,
            username: profile.username,
            avatar_url: profile.avatar_url,
            phone: profile.phone,
            latest_message: String::new(),
            unread_count: 0,
            sent_state: None,
            last_message_date: String::new(),
            last_message_at: None,
        }
    }

    pub fn has_history(&self) -> bool {
        self.last_message_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    /// Whether this message was addressed to `user_id` and has not been read yet
    pub fn is_unread_for(&self, user_id: &str) -> bool {
        self.receiver_id == user_id && self.status < MessageStatus::Read
    }

    pub fn involves(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

/// Payload for inserting a message; the backend assigns id and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub status: MessageStatus,
}

/// Delivery state of a message. Only ever advances sent -> received -> read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent = 0,
    Received = 1,
    Read = 2,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Received => "received",
            MessageStatus::Read => "read",
        }
    }

    /// Statuses strictly earlier than `self` in the delivery order
    pub fn predecessors(&self) -> &'static [MessageStatus] {
        match self {
            MessageStatus::Sent => &[],
            MessageStatus::Received => &[MessageStatus::Sent],
            MessageStatus::Read => &[MessageStatus::Sent, MessageStatus::Received],
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(MessageStatus::Sent),
            "received" => Ok(MessageStatus::Received),
            "read" => Ok(MessageStatus::Read),
            other => Err(format!("unknown message status '{}'", other)),
        }
    }
}

/// Tick state shown next to a message the current user sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSentState {
    Sent,
    Received,
    Read,
}

impl From<MessageStatus> for UserSentState {
    fn from(status: MessageStatus) -> Self {
        match status {
            MessageStatus::Sent => UserSentState::Sent,
            MessageStatus::Received => UserSentState::Received,
            MessageStatus::Read => UserSentState::Read,
        }
    }
}

/// Authenticated session held by a backend handle
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
