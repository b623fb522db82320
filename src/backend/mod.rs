// Backend client contract
// The chat layer only ever talks to the hosted service through the Backend trait,
// so the service can be swapped for the local SQLite stand-in or a test double.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::models::{ContactEdge, Message, MessageStatus, NewMessage, Profile, Session};

pub mod realtime;
pub mod sqlite;

pub use realtime::{ChangeEvent, ChangeKind, ChannelBinding, ChannelId, ChannelRegistry, RealtimeChannel};
pub use sqlite::SqliteBackend;

/// Tables exposed by the hosted service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Profiles,
    Contacts,
    Messages,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Contacts => "contacts",
            Table::Messages => "messages",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("No authenticated session")]
    NotAuthenticated,

    #[error("Permission denied for table {0}")]
    PermissionDenied(Table),

    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("User already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Row filter on the `messages` table. Filters in a list are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageFilter {
    /// Exchanged between the two parties, in either direction
    Between(String, String),
    SenderIs(String),
    ReceiverIs(String),
    StatusIs(MessageStatus),
    /// Strictly earlier than the given status in the delivery order
    StatusBelow(MessageStatus),
    IdIn(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Select on `messages`, ordered by creation time
#[derive(Debug, Clone, PartialEq)]
pub struct MessageQuery {
    pub filters: Vec<MessageFilter>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn new(filters: Vec<MessageFilter>) -> Self {
        MessageQuery {
            filters,
            order: SortOrder::Ascending,
            limit: None,
        }
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Authenticated handle to the hosted service.
///
/// Implementations own the auth session; every table call runs as the
/// signed-in user.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Current session, refreshed if it has expired
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    /// Cheap canary read used to detect access denial
    async fn probe(&self, table: Table) -> Result<(), BackendError>;

    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, BackendError>;

    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<Profile>, BackendError>;

    /// Case-insensitive substring match on username
    async fn search_profiles(
        &self,
        pattern: &str,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<Profile>, BackendError>;

    async fn contact_ids(&self, user_id: &str) -> Result<Vec<String>, BackendError>;

    async fn find_contact_edge(
        &self,
        user_id: &str,
        contact_id: &str,
    ) -> Result<Option<ContactEdge>, BackendError>;

    async fn insert_contact_edge(&self, edge: &ContactEdge) -> Result<(), BackendError>;

    async fn select_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, BackendError>;

    async fn count_messages(&self, filters: &[MessageFilter]) -> Result<u64, BackendError>;

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, BackendError>;

    /// Returns the number of rows changed
    async fn update_message_status(
        &self,
        filters: &[MessageFilter],
        status: MessageStatus,
    ) -> Result<usize, BackendError>;

    async fn subscribe(&self, bindings: Vec<ChannelBinding>) -> Result<RealtimeChannel, BackendError>;

    /// Idempotent
    async fn remove_channel(&self, id: ChannelId) -> Result<(), BackendError>;
}
