// Demo data and an echo companion for trying the client alone.
// Each demo user gets its own backend handle and ChatService, so the
// companion talks to the signed-in user through the same realtime path a
// second client would.

use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use parley::backend::{Backend, BackendError, SqliteBackend};
use parley::chat::ChatService;
use parley::models::Message;
use parley::validation::generate_random_phone;

pub const DEMO_PASSWORD: &str = "parley-demo";
pub const DEMO_USERS: [&str; 3] = ["ada", "grace", "linus"];
const REPLY_DELAY: Duration = Duration::from_millis(600);

pub fn demo_email(name: &str) -> String {
    format!("{}@demo.parley.local", name)
}

/// Make sure every demo user exists and is a mutual contact of `user_id`.
/// Returns signed-in handles for the demo users.
pub async fn seed(store: &SqliteBackend, user_service: &ChatService, user_id: &str) -> Result<Vec<(String, Arc<SqliteBackend>)>> {
    let mut handles = Vec::new();

    for name in DEMO_USERS {
        let handle = store.handle();
        let session = match handle
            .sign_up(&demo_email(name), DEMO_PASSWORD, name, Some(generate_random_phone().as_str()))
            .await
        {
            Ok(session) => {
                info!("Seeded demo user {}", name);
                session
            }
            Err(BackendError::AlreadyRegistered(_)) => handle.sign_in(&demo_email(name), DEMO_PASSWORD).await?,
            Err(BackendError::Validation(reason)) => {
                warn!("Skipping demo user {}: {}", name, reason);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let demo_id = session.user_id.clone();
        if demo_id == user_id {
            continue;
        }

        let handle = Arc::new(handle);
        let demo_service = ChatService::new(handle.clone());
        if !demo_service.add_contact(&demo_id, user_id).await {
            warn!("Demo user {} could not add the current user", name);
        }
        if !user_service.add_contact(user_id, &demo_id).await {
            warn!("Could not add demo user {} as contact", name);
        }

        if demo_service.get_messages(&demo_id, user_id).await.is_empty() {
            let greeting = format!("Hi, I'm {}. Say something and I'll echo it back.", name);
            demo_service.send_message(&demo_id, user_id, &greeting).await;
        }

        handles.push((demo_id, handle));
    }

    Ok(handles)
}

/// Run an echo companion for one demo user until its subscription ends.
/// Every inbound message is marked read and answered.
pub fn spawn_echo_companion(demo_id: String, handle: Arc<SqliteBackend>) {
    tokio::spawn(async move {
        let backend: Arc<dyn Backend> = handle;
        let mut service = ChatService::new(backend);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let subscription = service
            .subscribe_to_messages(
                &demo_id,
                move |message| {
                    let _ = tx.send(message);
                },
                |_| {},
            )
            .await;
        if subscription.is_none() {
            error!("Echo companion {} could not subscribe", demo_id);
            return;
        }

        while let Some(message) = rx.recv().await {
            debug!("Echo companion {} got {}", demo_id, message.id);
            tokio::time::sleep(REPLY_DELAY).await;
            service.mark_specific_messages_as_read(&[message.id.clone()]).await;
            let reply = echo_reply(&message.content);
            if service.send_message(&demo_id, &message.sender_id, &reply).await.is_none() {
                warn!("Echo companion {} failed to reply", demo_id);
            }
        }
    });
}

fn echo_reply(content: &str) -> String {
    format!("You said: {}", content.trim())
}
