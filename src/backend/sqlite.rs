// Local stand-in for the hosted backend
// Auth, the profiles/contacts/messages tables and the realtime feed, on top of SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use log::{debug, error, info, warn};
use rand::RngCore;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use super::realtime::{ChangeEvent, ChangeKind, ChannelBinding, ChannelId, ChannelRegistry, RealtimeChannel};
use super::{Backend, BackendError, MessageFilter, MessageQuery, SortOrder, Table};
use crate::models::{ContactEdge, Message, MessageStatus, NewMessage, Profile, Session};
use crate::validation;

type HmacSha256 = Hmac<Sha256>;

const SESSION_TTL_MINUTES: i64 = 60;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth_users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        password_salt TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS profiles (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        avatar_url TEXT,
        phone TEXT
    );
    CREATE TABLE IF NOT EXISTS contacts (
        user_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (user_id, contact_id)
    );
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        sender_id TEXT NOT NULL,
        receiver_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'sent',
        CHECK (status IN ('sent', 'received', 'read'))
    );
    CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages (sender_id, receiver_id, created_at);
";

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, created_at, status";

struct Store {
    conn: TokioMutex<Connection>,
    realtime: ChannelRegistry,
    token_secret: [u8; 32],
    revoked: std::sync::Mutex<HashSet<Table>>,
}

/// Handle to a SQLite-backed service.
///
/// Handles created with [`SqliteBackend::handle`] share the store but each
/// carries its own auth session.
pub struct SqliteBackend {
    store: Arc<Store>,
    session: TokioMutex<Option<Session>>,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BackendError> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opened backend database at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, BackendError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch(SCHEMA)?;

        let mut token_secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_secret);

        Ok(SqliteBackend {
            store: Arc::new(Store {
                conn: TokioMutex::new(conn),
                realtime: ChannelRegistry::new(),
                token_secret,
                revoked: std::sync::Mutex::new(HashSet::new()),
            }),
            session: TokioMutex::new(None),
        })
    }

    /// A new signed-out handle on the same store
    pub fn handle(&self) -> SqliteBackend {
        SqliteBackend {
            store: self.store.clone(),
            session: TokioMutex::new(None),
        }
    }

    /// Register a user and sign this handle in as them
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
        phone: Option<&str>,
    ) -> Result<Session, BackendError> {
        if !validation::validate_email(email) {
            return Err(BackendError::Validation(format!("invalid email '{}'", email)));
        }
        if !validation::validate_password(password) {
            return Err(BackendError::Validation(format!(
                "password must be at least {} characters",
                validation::MIN_PASSWORD_LEN
            )));
        }
        if !validation::validate_username(username) {
            return Err(BackendError::Validation(format!(
                "username must be {} to {} characters",
                validation::MIN_USERNAME_LEN,
                validation::MAX_USERNAME_LEN
            )));
        }
        if let Some(phone) = phone {
            if !validation::validate_phone(phone) {
                return Err(BackendError::Validation(format!("invalid phone number '{}'", phone)));
            }
        }

        let user_id = Uuid::new_v4().to_string();
        let salt = random_hex(16);
        let hash = hash_password(&salt, password);
        let email = email.trim().to_lowercase();

        {
            let mut conn = self.store.conn.lock().await;
            let tx = conn.transaction()?;

            let email_taken: bool = tx
                .query_row("SELECT 1 FROM auth_users WHERE email = ?1", params![email], |_| Ok(true))
                .optional()?
                .unwrap_or(false);
            if email_taken {
                return Err(BackendError::AlreadyRegistered(email));
            }

            let username_taken: bool = tx
                .query_row("SELECT 1 FROM profiles WHERE username = ?1", params![username], |_| Ok(true))
                .optional()?
                .unwrap_or(false);
            if username_taken {
                return Err(BackendError::Validation(format!("username '{}' is taken", username)));
            }

            tx.execute(
                "INSERT INTO auth_users (id, email, password_salt, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, email, salt, hash, timestamp(Utc::now())],
            )?;
            tx.execute(
                "INSERT INTO profiles (id, username, avatar_url, phone) VALUES (?1, ?2, NULL, ?3)",
                params![user_id, username, phone],
            )?;
            tx.commit()?;
        }

        info!("Registered user {} ({})", username, user_id);
        let session = self.issue_session(&user_id, &email);
        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let email = email.trim().to_lowercase();
        let row = {
            let conn = self.store.conn.lock().await;
            conn.query_row(
                "SELECT id, password_salt, password_hash FROM auth_users WHERE email = ?1",
                params![email],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?
        };

        let (user_id, salt, expected) = match row {
            Some(row) => row,
            None => {
                warn!("Sign in attempted for unknown email {}", email);
                return Err(BackendError::InvalidCredentials);
            }
        };

        if hash_password(&salt, password) != expected {
            warn!("Wrong password for {}", email);
            return Err(BackendError::InvalidCredentials);
        }

        let session = self.issue_session(&user_id, &email);
        *self.session.lock().await = Some(session.clone());
        info!("Signed in as {}", email);
        Ok(session)
    }

    pub async fn sign_out(&self) {
        if let Some(session) = self.session.lock().await.take() {
            info!("Signed out {}", session.email);
        }
    }

    /// Deny all access to a table, as a row-level policy change would
    pub fn revoke(&self, table: Table) {
        if let Ok(mut revoked) = self.store.revoked.lock() {
            revoked.insert(table);
        }
        warn!("Access to table {} revoked", table);
    }

    pub fn grant(&self, table: Table) {
        if let Ok(mut revoked) = self.store.revoked.lock() {
            revoked.remove(&table);
        }
        info!("Access to table {} granted", table);
    }

    pub fn active_channels(&self) -> usize {
        self.store.realtime.active_channels()
    }

    #[cfg(test)]
    async fn expire_session(&self) {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.expires_at = Utc::now() - Duration::minutes(1);
        }
    }

    fn issue_session(&self, user_id: &str, email: &str) -> Session {
        let expires_at = Utc::now() + Duration::minutes(SESSION_TTL_MINUTES);
        Session {
            user_id: user_id.to_string(),
            email: email.to_string(),
            access_token: self.sign_token(user_id, expires_at),
            expires_at,
        }
    }

    fn sign_token(&self, user_id: &str, expires_at: DateTime<Utc>) -> String {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(&self.store.token_secret) {
            Ok(mac) => mac,
            Err(e) => {
                error!("Failed to initialise token MAC: {}", e);
                return String::new();
            }
        };
        mac.update(user_id.as_bytes());
        mac.update(b":");
        mac.update(timestamp(expires_at).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Session check shared by every table operation
    async fn authorize(&self, table: Table) -> Result<Session, BackendError> {
        let session = self.get_session().await?.ok_or(BackendError::NotAuthenticated)?;
        let revoked = self
            .store
            .revoked
            .lock()
            .map(|r| r.contains(&table))
            .unwrap_or(false);
        if revoked {
            return Err(BackendError::PermissionDenied(table));
        }
        Ok(session)
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.is_expired(Utc::now()) {
                debug!("Session for {} expired, refreshing", session.email);
                *session = self.issue_session(&session.user_id, &session.email);
            }
        }
        Ok(guard.clone())
    }

    async fn probe(&self, table: Table) -> Result<(), BackendError> {
        self.authorize(table).await?;
        let conn = self.store.conn.lock().await;
        let sql = format!("SELECT count(*) FROM {} LIMIT 1", table.name());
        conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, BackendError> {
        self.authorize(Table::Profiles).await?;
        let conn = self.store.conn.lock().await;
        let profile = conn
            .query_row(
                "SELECT id, username, avatar_url, phone FROM profiles WHERE id = ?1",
                params![id],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<Profile>, BackendError> {
        self.authorize(Table::Profiles).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.store.conn.lock().await;
        let sql = format!(
            "SELECT id, username, avatar_url, phone FROM profiles WHERE id IN ({}) ORDER BY rowid",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let profiles = stmt
            .query_map(params_from_iter(ids.iter()), profile_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    async fn search_profiles(
        &self,
        pattern: &str,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<Profile>, BackendError> {
        self.authorize(Table::Profiles).await?;
        let conn = self.store.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, username, avatar_url, phone FROM profiles
             WHERE lower(username) LIKE '%' || lower(?1) || '%' ESCAPE '\\' AND id != ?2
             ORDER BY username
             LIMIT ?3",
        )?;
        let profiles = stmt
            .query_map(params![escape_like(pattern), exclude_id, limit as i64], profile_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    async fn contact_ids(&self, user_id: &str) -> Result<Vec<String>, BackendError> {
        self.authorize(Table::Contacts).await?;
        let conn = self.store.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT contact_id FROM contacts WHERE user_id = ?1 ORDER BY created_at, rowid",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    async fn find_contact_edge(
        &self,
        user_id: &str,
        contact_id: &str,
    ) -> Result<Option<ContactEdge>, BackendError> {
        self.authorize(Table::Contacts).await?;
        let conn = self.store.conn.lock().await;
        let edge = conn
            .query_row(
                "SELECT user_id, contact_id FROM contacts WHERE user_id = ?1 AND contact_id = ?2",
                params![user_id, contact_id],
                |row| {
                    Ok(ContactEdge {
                        user_id: row.get(0)?,
                        contact_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(edge)
    }

    async fn insert_contact_edge(&self, edge: &ContactEdge) -> Result<(), BackendError> {
        let session = self.authorize(Table::Contacts).await?;
        if session.user_id != edge.user_id {
            return Err(BackendError::PermissionDenied(Table::Contacts));
        }
        let conn = self.store.conn.lock().await;
        conn.execute(
            "INSERT INTO contacts (user_id, contact_id, created_at) VALUES (?1, ?2, ?3)",
            params![edge.user_id, edge.contact_id, timestamp(Utc::now())],
        )?;
        debug!("Inserted contact edge {} -> {}", edge.user_id, edge.contact_id);
        Ok(())
    }

    async fn select_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, BackendError> {
        self.authorize(Table::Messages).await?;
        let (clause, values) = where_clause(&query.filters);
        let direction = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let mut sql = format!(
            "SELECT {} FROM messages WHERE {} ORDER BY created_at {}, rowid {}",
            MESSAGE_COLUMNS, clause, direction, direction
        );
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.store.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(params_from_iter(values.iter()), message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    async fn count_messages(&self, filters: &[MessageFilter]) -> Result<u64, BackendError> {
        self.authorize(Table::Messages).await?;
        let (clause, values) = where_clause(filters);
        let sql = format!("SELECT count(*) FROM messages WHERE {}", clause);
        let conn = self.store.conn.lock().await;
        let count: i64 = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, BackendError> {
        let session = self.authorize(Table::Messages).await?;
        if session.user_id != message.sender_id {
            return Err(BackendError::PermissionDenied(Table::Messages));
        }

        let row = Message {
            id: Uuid::new_v4().to_string(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            created_at: Utc::now(),
            status: message.status,
        };

        // Publish before releasing the connection so events follow commit order
        let conn = self.store.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (id, sender_id, receiver_id, content, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.sender_id,
                row.receiver_id,
                row.content,
                timestamp(row.created_at),
                row.status.as_str()
            ],
        )?;
        self.store.realtime.publish(&ChangeEvent {
            kind: ChangeKind::Insert,
            table: Table::Messages,
            new: row.clone(),
        });
        drop(conn);

        debug!("Inserted message {} from {} to {}", row.id, row.sender_id, row.receiver_id);
        Ok(row)
    }

    async fn update_message_status(
        &self,
        filters: &[MessageFilter],
        status: MessageStatus,
    ) -> Result<usize, BackendError> {
        self.authorize(Table::Messages).await?;
        let (clause, values) = where_clause(filters);

        let changed = {
            let mut conn = self.store.conn.lock().await;
            let tx = conn.transaction()?;
            let rows = {
                let sql = format!("SELECT {} FROM messages WHERE {} ORDER BY created_at, rowid", MESSAGE_COLUMNS, clause);
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values.iter()), message_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            let mut update_values = vec![Value::Text(status.as_str().to_string())];
            update_values.extend(values.iter().cloned());
            // Filter placeholders are numbered after the status parameter
            let sql = format!("UPDATE messages SET status = ? WHERE {}", clause);
            tx.execute(&sql, params_from_iter(update_values.iter()))?;
            tx.commit()?;

            // Still holding the connection, so no later write can publish first
            for mut row in rows.iter().cloned() {
                row.status = status;
                self.store.realtime.publish(&ChangeEvent {
                    kind: ChangeKind::Update,
                    table: Table::Messages,
                    new: row,
                });
            }
            rows
        };

        debug!("Updated {} message(s) to {}", changed.len(), status);
        Ok(changed.len())
    }

    async fn subscribe(&self, bindings: Vec<ChannelBinding>) -> Result<RealtimeChannel, BackendError> {
        self.authorize(Table::Messages).await?;
        Ok(self.store.realtime.open(bindings))
    }

    async fn remove_channel(&self, id: ChannelId) -> Result<(), BackendError> {
        self.store.realtime.close(id);
        Ok(())
    }
}

fn timestamp(ts: DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn escape_like(pattern: &str) -> String {
    pattern
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Translate message filters into a SQL condition with positional parameters
fn where_clause(filters: &[MessageFilter]) -> (String, Vec<Value>) {
    let mut parts = Vec::new();
    let mut values = Vec::new();

    for filter in filters {
        match filter {
            MessageFilter::Between(a, b) => {
                parts.push("((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?))".to_string());
                values.push(Value::Text(a.clone()));
                values.push(Value::Text(b.clone()));
                values.push(Value::Text(b.clone()));
                values.push(Value::Text(a.clone()));
            }
            MessageFilter::SenderIs(id) => {
                parts.push("sender_id = ?".to_string());
                values.push(Value::Text(id.clone()));
            }
            MessageFilter::ReceiverIs(id) => {
                parts.push("receiver_id = ?".to_string());
                values.push(Value::Text(id.clone()));
            }
            MessageFilter::StatusIs(status) => {
                parts.push("status = ?".to_string());
                values.push(Value::Text(status.as_str().to_string()));
            }
            MessageFilter::StatusBelow(status) => {
                let earlier = status.predecessors();
                if earlier.is_empty() {
                    parts.push("0".to_string());
                } else {
                    parts.push(format!("status IN ({})", placeholders(earlier.len())));
                    values.extend(earlier.iter().map(|s| Value::Text(s.as_str().to_string())));
                }
            }
            MessageFilter::IdIn(ids) => {
                if ids.is_empty() {
                    parts.push("0".to_string());
                } else {
                    parts.push(format!("id IN ({})", placeholders(ids.len())));
                    values.extend(ids.iter().map(|id| Value::Text(id.clone())));
                }
            }
        }
    }

    if parts.is_empty() {
        ("1".to_string(), values)
    } else {
        (parts.join(" AND "), values)
    }
}

fn profile_from_row(row: &Row) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        username: row.get(1)?,
        avatar_url: row.get(2)?,
        phone: row.get(3)?,
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let created_at: String = row.get(4)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);
    let status: String = row.get(5)?;
    let status = status
        .parse::<MessageStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    Ok(Message {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        created_at,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn signed_up(backend: &SqliteBackend, name: &str) -> Session {
        backend
            .sign_up(&format!("{}@example.com", name), "password123", name, None)
            .await
            .expect("sign up failed")
    }

    fn new_message(from: &str, to: &str, content: &str) -> NewMessage {
        NewMessage {
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            content: content.to_string(),
            status: MessageStatus::Sent,
        }
    }

    #[tokio::test]
    async fn test_sign_up_and_sign_in() {
        let backend = SqliteBackend::in_memory().unwrap();
        let session = signed_up(&backend, "alice").await;
        assert_eq!(session.email, "alice@example.com");

        backend.sign_out().await;
        assert!(backend.get_session().await.unwrap().is_none());

        let again = backend.sign_in("Alice@Example.com", "password123").await.unwrap();
        assert_eq!(again.user_id, session.user_id);

        let wrong = backend.sign_in("alice@example.com", "nope-nope").await;
        assert!(matches!(wrong, Err(BackendError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_sign_up_rejects_duplicates_and_bad_input() {
        let backend = SqliteBackend::in_memory().unwrap();
        signed_up(&backend, "alice").await;

        let other = backend.handle();
        let dup = other.sign_up("alice@example.com", "password123", "alice2", None).await;
        assert!(matches!(dup, Err(BackendError::AlreadyRegistered(_))));

        let taken = other.sign_up("al@example.com", "password123", "alice", None).await;
        assert!(matches!(taken, Err(BackendError::Validation(_))));

        let short = other.sign_up("bob@example.com", "123", "bob", None).await;
        assert!(matches!(short, Err(BackendError::Validation(_))));

        let phone = other.sign_up("bob@example.com", "password123", "bob", Some("call me")).await;
        assert!(matches!(phone, Err(BackendError::Validation(_))));
    }

    #[tokio::test]
    async fn test_tables_require_session_and_grant() {
        let backend = SqliteBackend::in_memory().unwrap();
        assert!(matches!(backend.probe(Table::Profiles).await, Err(BackendError::NotAuthenticated)));

        signed_up(&backend, "alice").await;
        backend.probe(Table::Profiles).await.unwrap();

        backend.revoke(Table::Profiles);
        assert!(matches!(
            backend.probe(Table::Profiles).await,
            Err(BackendError::PermissionDenied(Table::Profiles))
        ));
        backend.grant(Table::Profiles);
        backend.probe(Table::Profiles).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_update_publish_changes() {
        let backend = SqliteBackend::in_memory().unwrap();
        let alice = signed_up(&backend, "alice").await;
        let bob_handle = backend.handle();
        let bob = signed_up(&bob_handle, "bob").await;

        let mut channel = bob_handle
            .subscribe(vec![ChannelBinding::inserts_for(&bob.user_id), ChannelBinding::all_updates()])
            .await
            .unwrap();

        let sent = backend.insert_message(&new_message(&alice.user_id, &bob.user_id, "hi")).await.unwrap();
        let insert = channel.recv().await.unwrap();
        assert_eq!(insert.kind, ChangeKind::Insert);
        assert_eq!(insert.new.id, sent.id);

        let changed = bob_handle
            .update_message_status(&[MessageFilter::IdIn(vec![sent.id.clone()])], MessageStatus::Received)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        let update = channel.recv().await.unwrap();
        assert_eq!(update.kind, ChangeKind::Update);
        assert_eq!(update.new.status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn test_expired_session_is_refreshed() {
        let backend = SqliteBackend::in_memory().unwrap();
        let issued = signed_up(&backend, "alice").await;

        // A live session comes back unchanged
        let current = backend.get_session().await.unwrap().unwrap();
        assert_eq!(current, issued);

        backend.expire_session().await;
        let refreshed = backend.get_session().await.unwrap().unwrap();
        assert_eq!(refreshed.user_id, issued.user_id);
        assert_eq!(refreshed.email, issued.email);
        assert_ne!(refreshed.access_token, issued.access_token);
        assert!(refreshed.expires_at >= issued.expires_at);
        assert!(!refreshed.is_expired(Utc::now()));
        assert!(refreshed.expires_at > Utc::now() + Duration::minutes(SESSION_TTL_MINUTES - 1));

        // Table access keeps working on the refreshed session
        backend.probe(Table::Messages).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_status_updates_publish_in_commit_order() {
        let backend = SqliteBackend::in_memory().unwrap();
        let alice = signed_up(&backend, "alice").await;
        let bob_handle = backend.handle();
        let bob = signed_up(&bob_handle, "bob").await;
        let bob_handle = Arc::new(bob_handle);

        let mut channel = bob_handle.subscribe(vec![ChannelBinding::all_updates()]).await.unwrap();

        for i in 0..200 {
            let sent = backend
                .insert_message(&new_message(&alice.user_id, &bob.user_id, &format!("m{}", i)))
                .await
                .unwrap();

            let promote = {
                let handle = bob_handle.clone();
                let filters = vec![
                    MessageFilter::IdIn(vec![sent.id.clone()]),
                    MessageFilter::StatusBelow(MessageStatus::Received),
                ];
                tokio::spawn(async move { handle.update_message_status(&filters, MessageStatus::Received).await })
            };
            let read = {
                let handle = bob_handle.clone();
                let filters = vec![
                    MessageFilter::IdIn(vec![sent.id.clone()]),
                    MessageFilter::StatusBelow(MessageStatus::Read),
                ];
                tokio::spawn(async move { handle.update_message_status(&filters, MessageStatus::Read).await })
            };
            promote.await.unwrap().unwrap();
            read.await.unwrap().unwrap();
        }

        // Every publish happened before its update returned
        let mut last_seen: std::collections::HashMap<String, MessageStatus> = std::collections::HashMap::new();
        let mut events = 0;
        while let Some(event) = channel.try_recv() {
            events += 1;
            if let Some(previous) = last_seen.insert(event.new.id.clone(), event.new.status) {
                assert!(
                    previous < event.new.status,
                    "status of {} went from {} to {}",
                    event.new.id,
                    previous,
                    event.new.status
                );
            }
        }
        assert_eq!(last_seen.len(), 200);
        assert!(last_seen.values().all(|s| *s == MessageStatus::Read));
        assert!(events >= 200);
    }

    #[tokio::test]
    async fn test_insert_rejects_impersonation() {
        let backend = SqliteBackend::in_memory().unwrap();
        signed_up(&backend, "alice").await;
        let result = backend.insert_message(&new_message("someone-else", "bob", "hi")).await;
        assert!(matches!(result, Err(BackendError::PermissionDenied(Table::Messages))));
    }

    #[tokio::test]
    async fn test_search_escapes_wildcards() {
        let backend = SqliteBackend::in_memory().unwrap();
        let alice = signed_up(&backend, "alice").await;
        signed_up(&backend.handle(), "bob_smith").await;
        signed_up(&backend.handle(), "bobby").await;

        let underscore = backend.search_profiles("_", &alice.user_id, 10).await.unwrap();
        assert_eq!(underscore.len(), 1);
        assert_eq!(underscore[0].username, "bob_smith");

        let bob = backend.search_profiles("BOB", &alice.user_id, 10).await.unwrap();
        assert_eq!(bob.len(), 2);

        let percent = backend.search_profiles("%", &alice.user_id, 10).await.unwrap();
        assert!(percent.is_empty());
    }

    #[tokio::test]
    async fn test_select_orders_by_creation_time() {
        let backend = SqliteBackend::in_memory().unwrap();
        let alice = signed_up(&backend, "alice").await;
        for i in 0..5 {
            backend
                .insert_message(&new_message(&alice.user_id, "bob", &format!("m{}", i)))
                .await
                .unwrap();
        }

        let asc = backend
            .select_messages(&MessageQuery::new(vec![MessageFilter::SenderIs(alice.user_id.clone())]))
            .await
            .unwrap();
        let contents: Vec<_> = asc.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);

        let latest = backend
            .select_messages(
                &MessageQuery::new(vec![MessageFilter::SenderIs(alice.user_id.clone())])
                    .order(SortOrder::Descending)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].content, "m4");
    }

    #[test]
    fn test_where_clause_empty_id_list_matches_nothing() {
        let (clause, values) = where_clause(&[MessageFilter::IdIn(Vec::new())]);
        assert_eq!(clause, "0");
        assert!(values.is_empty());
    }
}
