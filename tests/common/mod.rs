// Common test utilities for integration tests
// Seeded in-memory stores, a backend wrapper that counts and fails calls on
// request, and helpers for waiting on realtime callbacks.
#![allow(dead_code)]

use async_trait::async_trait;
use log::{info, LevelFilter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use parley::backend::{
    Backend, BackendError, ChannelBinding, ChannelId, MessageFilter, MessageQuery, RealtimeChannel, SqliteBackend,
    Table,
};
use parley::chat::ChatService;
use parley::models::{ContactEdge, Message, MessageStatus, NewMessage, Profile, Session};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

pub const TEST_PASSWORD: &str = "correct-horse";

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// A registered user with a signed-in handle of their own
pub struct TestUser {
    pub id: String,
    pub name: String,
    pub handle: Arc<SqliteBackend>,
}

impl TestUser {
    pub fn backend(&self) -> Arc<dyn Backend> {
        self.handle.clone()
    }

    pub fn service(&self) -> ChatService {
        ChatService::new(self.backend())
    }
}

pub fn email_for(name: &str) -> String {
    format!("{}@example.com", name)
}

/// Register `names` on `store`, each on its own handle
pub async fn register_users(store: &SqliteBackend, names: &[&str]) -> Vec<TestUser> {
    let mut users = Vec::new();
    for name in names {
        let handle = store.handle();
        let session = handle
            .sign_up(&email_for(name), TEST_PASSWORD, name, None)
            .await
            .unwrap_or_else(|e| panic!("failed to register {}: {}", name, e));
        info!("Registered test user {} as {}", name, session.user_id);
        users.push(TestUser {
            id: session.user_id,
            name: name.to_string(),
            handle: Arc::new(handle),
        });
    }
    users
}

/// Fresh in-memory store with the given users registered
pub async fn setup_users(names: &[&str]) -> (SqliteBackend, Vec<TestUser>) {
    setup_logging();
    let store = SqliteBackend::in_memory().expect("in-memory store");
    let users = register_users(&store, names).await;
    (store, users)
}

/// Receive the next callback payload or give up after `wait`
pub async fn wait_for_message(rx: &mut mpsc::UnboundedReceiver<Message>, wait: Duration) -> Option<Message> {
    match timeout(wait, rx.recv()).await {
        Ok(message) => message,
        Err(_) => None,
    }
}

/// Wait for the first payload matching `pred`, skipping the rest
pub async fn wait_for_matching<F>(rx: &mut mpsc::UnboundedReceiver<Message>, wait: Duration, pred: F) -> Option<Message>
where
    F: Fn(&Message) -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let message = wait_for_message(rx, remaining).await?;
        if pred(&message) {
            return Some(message);
        }
    }
}

/// Callback pair that forwards into two channels
pub fn forwarding_callbacks() -> (
    impl Fn(Message) + Send + Sync + 'static,
    impl Fn(Message) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Message>,
    mpsc::UnboundedReceiver<Message>,
) {
    let (new_tx, new_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    (
        move |message: Message| {
            let _ = new_tx.send(message);
        },
        move |message: Message| {
            let _ = status_tx.send(message);
        },
        new_rx,
        status_rx,
    )
}

/// Read a message's stored status through `backend`
pub async fn stored_status(backend: &dyn Backend, id: &str) -> MessageStatus {
    let query = MessageQuery::new(vec![MessageFilter::IdIn(vec![id.to_string()])]);
    let rows = backend.select_messages(&query).await.expect("select message");
    rows.first().map(|m| m.status).expect("message exists")
}

/// Backend wrapper that counts calls and fails selected operations.
///
/// Everything else is delegated to the wrapped backend.
pub struct ScriptedBackend {
    inner: Arc<dyn Backend>,
    pub deny_probe: AtomicBool,
    pub fail_updates: AtomicBool,
    pub fail_inserts: AtomicBool,
    pub probe_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub select_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        ScriptedBackend {
            inner,
            deny_probe: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_inserts: AtomicBool::new(false),
            probe_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            select_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        self.inner.get_session().await
    }

    async fn probe(&self, table: Table) -> Result<(), BackendError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.deny_probe.load(Ordering::SeqCst) {
            return Err(BackendError::PermissionDenied(table));
        }
        self.inner.probe(table).await
    }

    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, BackendError> {
        self.inner.fetch_profile(id).await
    }

    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<Profile>, BackendError> {
        self.inner.profiles_by_ids(ids).await
    }

    async fn search_profiles(&self, pattern: &str, exclude_id: &str, limit: usize) -> Result<Vec<Profile>, BackendError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.search_profiles(pattern, exclude_id, limit).await
    }

    async fn contact_ids(&self, user_id: &str) -> Result<Vec<String>, BackendError> {
        self.inner.contact_ids(user_id).await
    }

    async fn find_contact_edge(&self, user_id: &str, contact_id: &str) -> Result<Option<ContactEdge>, BackendError> {
        self.inner.find_contact_edge(user_id, contact_id).await
    }

    async fn insert_contact_edge(&self, edge: &ContactEdge) -> Result<(), BackendError> {
        self.inner.insert_contact_edge(edge).await
    }

    async fn select_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, BackendError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.select_messages(query).await
    }

    async fn count_messages(&self, filters: &[MessageFilter]) -> Result<u64, BackendError> {
        self.inner.count_messages(filters).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, BackendError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(BackendError::PermissionDenied(Table::Messages));
        }
        self.inner.insert_message(message).await
    }

    async fn update_message_status(&self, filters: &[MessageFilter], status: MessageStatus) -> Result<usize, BackendError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(BackendError::PermissionDenied(Table::Messages));
        }
        self.inner.update_message_status(filters, status).await
    }

    async fn subscribe(&self, bindings: Vec<ChannelBinding>) -> Result<RealtimeChannel, BackendError> {
        self.inner.subscribe(bindings).await
    }

    async fn remove_channel(&self, id: ChannelId) -> Result<(), BackendError> {
        self.inner.remove_channel(id).await
    }
}
