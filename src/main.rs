#![deny(dead_code)]
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

mod config;
mod demo;
mod ui;
mod utils;

use crate::{
    config::{clear_credentials, load_credentials, save_credentials, Credentials},
    ui::{ChatUI, UiAction},
};
use parley::backend::{Backend, BackendError, SqliteBackend};
use parley::chat::ChatService;
use parley::models::{Message, Session};
use parley::validation;

/// Command line arguments for parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "parley: a terminal chat client with contacts, read receipts and live delivery.",
    long_about = "parley is a terminal chat client backed by a local SQLite service.\n\n\
    Credentials are taken from PARLEY_EMAIL / PARLEY_PASSWORD, then from the saved\n\
    credentials file, and are prompted for otherwise."
)]
struct Args {
    /// Directory holding parley.db and parley.log
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Create demo users that echo back whatever you send them
    #[arg(long)]
    seed_demo: bool,

    /// Log level written to parley.log
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LevelFilter,
}

/// Realtime events forwarded from the subscription callbacks
enum RealtimeUpdate {
    NewMessage(Message),
    StatusChanged(Message),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = config::get_data_dir(args.data_dir.as_deref())?;
    let log_file_path = data_dir.join("parley.log");
    utils::setup_logging(Some(&log_file_path), args.log_level)?;
    info!("parley starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    info!("Logging to file: {}", log_file_path.display());

    let store = SqliteBackend::open(data_dir.join("parley.db"))?;
    let user_handle = Arc::new(store.handle());
    let session = authenticate(&user_handle).await?;
    let user_id = session.user_id.clone();

    let backend: Arc<dyn Backend> = user_handle.clone();
    let mut chat_service = ChatService::new(backend.clone());

    let username = backend
        .fetch_profile(&user_id)
        .await?
        .map(|p| p.username)
        .unwrap_or_else(|| session.email.clone());
    info!("Signed in as {} ({})", username, user_id);

    if args.seed_demo {
        for (demo_id, handle) in demo::seed(&store, &chat_service, &user_id).await? {
            demo::spawn_echo_companion(demo_id, handle);
        }
    }

    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<RealtimeUpdate>();
    subscribe(&mut chat_service, &user_id, &update_tx).await;

    let mut chat_ui = ChatUI::new(&user_id, &username);
    reload_contacts(&mut chat_ui, &mut chat_service, &user_id).await;

    let mut terminal = ui::setup_terminal()?;
    let result = run_main_loop(
        &mut chat_ui,
        &mut terminal,
        &mut chat_service,
        &backend,
        &user_id,
        &update_tx,
        &mut update_rx,
    )
    .await;
    ui::restore_terminal(terminal)?;

    chat_service.unsubscribe_from_messages().await;
    user_handle.sign_out().await;
    info!("parley shut down");
    result
}

/// Sign in from the environment, saved credentials or an interactive prompt
async fn authenticate(backend: &SqliteBackend) -> Result<Session> {
    if let Some(credentials) = Credentials::from_env() {
        info!("Using credentials from environment for {}", credentials.email);
        let password = credentials.get_password().unwrap_or_default();
        return Ok(backend.sign_in(&credentials.email, &password).await?);
    }

    if let Some(credentials) = load_credentials()? {
        let password = match credentials.get_password() {
            Some(password) => password,
            None => utils::prompt(&format!("Password for {}", credentials.email))?,
        };
        match backend.sign_in(&credentials.email, &password).await {
            Ok(session) => return Ok(session),
            Err(BackendError::InvalidCredentials) => {
                warn!("Saved credentials for {} were rejected", credentials.email);
                eprintln!("Saved credentials were rejected, please sign in again.");
                clear_credentials()?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    loop {
        let choice = utils::prompt("(l)og in or (s)ign up")?;
        let attempt = match choice.to_lowercase().as_str() {
            "l" | "login" | "log in" => prompt_sign_in(backend).await,
            "s" | "signup" | "sign up" => prompt_sign_up(backend).await,
            _ => continue,
        };

        match attempt {
            Ok((session, credentials)) => {
                if let Err(e) = save_credentials(&credentials) {
                    warn!("Failed to save credentials: {}", e);
                }
                return Ok(session);
            }
            Err(e) => eprintln!("{}", e),
        }
    }
}

async fn prompt_sign_in(backend: &SqliteBackend) -> Result<(Session, Credentials)> {
    let email = utils::prompt("Email")?;
    let password = utils::prompt("Password")?;
    let session = backend.sign_in(&email, &password).await?;
    Ok((session, Credentials::new(&email, &password)))
}

async fn prompt_sign_up(backend: &SqliteBackend) -> Result<(Session, Credentials)> {
    let username = prompt_valid(
        "Username",
        validation::validate_username,
        &format!(
            "Username must be {} to {} characters",
            validation::MIN_USERNAME_LEN,
            validation::MAX_USERNAME_LEN
        ),
    )?;
    let email = prompt_valid("Email", validation::validate_email, "Please enter a valid email address")?;
    let password = prompt_valid(
        "Password",
        validation::validate_password,
        &format!("Password must be at least {} characters", validation::MIN_PASSWORD_LEN),
    )?;
    let phone = prompt_valid(
        "Phone (optional)",
        |phone| phone.is_empty() || validation::validate_phone(phone),
        "Please enter a valid phone number",
    )?;

    let phone = if phone.is_empty() { None } else { Some(phone.as_str()) };
    let session = backend.sign_up(&email, &password, &username, phone).await?;
    Ok((session, Credentials::new(&email, &password)))
}

fn prompt_valid(label: &str, valid: impl Fn(&str) -> bool, hint: &str) -> Result<String> {
    for _ in 0..5 {
        let value = utils::prompt(label)?;
        if valid(&value) {
            return Ok(value);
        }
        eprintln!("{}", hint);
    }
    Err(anyhow!("Too many invalid attempts for {}", label.to_lowercase()))
}

async fn subscribe(chat_service: &mut ChatService, user_id: &str, update_tx: &mpsc::UnboundedSender<RealtimeUpdate>) {
    let new_tx = update_tx.clone();
    let status_tx = update_tx.clone();
    let subscription = chat_service
        .subscribe_to_messages(
            user_id,
            move |message| {
                let _ = new_tx.send(RealtimeUpdate::NewMessage(message));
            },
            move |message| {
                let _ = status_tx.send(RealtimeUpdate::StatusChanged(message));
            },
        )
        .await;
    if subscription.is_none() {
        error!("Live updates are unavailable");
    }
}

async fn reload_contacts(chat_ui: &mut ChatUI, chat_service: &mut ChatService, user_id: &str) {
    let contacts = chat_service.get_contacts(user_id).await;
    chat_ui.set_permission_denied(chat_service.permission_denied());
    chat_ui.set_contacts(contacts);
}

async fn run_main_loop(
    chat_ui: &mut ChatUI,
    terminal: &mut ui::Terminal<ui::CrosstermBackend<io::Stdout>>,
    chat_service: &mut ChatService,
    backend: &Arc<dyn Backend>,
    user_id: &str,
    update_tx: &mpsc::UnboundedSender<RealtimeUpdate>,
    update_rx: &mut mpsc::UnboundedReceiver<RealtimeUpdate>,
) -> Result<()> {
    loop {
        terminal.draw(|f| chat_ui.draw(f))?;

        // Inbound messages that are now on screen
        let viewed = chat_ui.take_viewed_batch();
        if !viewed.is_empty() {
            debug!("Marking {} viewed message(s) as read", viewed.len());
            chat_service.mark_specific_messages_as_read(&viewed).await;
        }

        if let Some(action) = chat_ui.handle_input()? {
            match action {
                UiAction::Quit => break,
                UiAction::SelectContact(contact_id) => {
                    let messages = chat_service.get_messages(user_id, &contact_id).await;
                    chat_ui.open_conversation(&contact_id, messages);
                    chat_service.mark_messages_as_read(user_id, &contact_id).await;
                    reload_contacts(chat_ui, chat_service, user_id).await;
                }
                UiAction::SendMessage { receiver_id, content } => {
                    match chat_service.send_message(user_id, &receiver_id, &content).await {
                        Some(message) => {
                            chat_ui.upsert_message(message);
                            reload_contacts(chat_ui, chat_service, user_id).await;
                        }
                        None => chat_ui.add_notice("Message could not be sent"),
                    }
                }
                UiAction::SearchUsers(query) => {
                    let results = chat_service.search_users(&query, user_id).await;
                    chat_ui.set_search_results(&query, results);
                }
                UiAction::AddContact(contact_id) => {
                    if chat_service.add_contact(user_id, &contact_id).await {
                        chat_ui.close_add_contact_dialog();
                        reload_contacts(chat_ui, chat_service, user_id).await;
                        let messages = chat_service.get_messages(user_id, &contact_id).await;
                        chat_ui.open_conversation(&contact_id, messages);
                    } else {
                        chat_ui.add_notice("Contact could not be added");
                    }
                }
                UiAction::RetryContacts => {
                    // The denied flag lives as long as the service, so retrying
                    // means starting a fresh one
                    info!("Retrying contact list with a new chat service");
                    chat_service.unsubscribe_from_messages().await;
                    *chat_service = ChatService::new(backend.clone());
                    subscribe(chat_service, user_id, update_tx).await;
                    reload_contacts(chat_ui, chat_service, user_id).await;
                }
            }
        }

        let mut contacts_stale = false;
        while let Ok(update) = update_rx.try_recv() {
            match update {
                RealtimeUpdate::NewMessage(message) => {
                    debug!("Realtime: new message {} from {}", message.id, message.sender_id);
                    chat_ui.upsert_message(message);
                    contacts_stale = true;
                }
                RealtimeUpdate::StatusChanged(message) => {
                    if chat_ui.apply_status_change(&message) || message.sender_id == user_id || message.receiver_id == user_id {
                        contacts_stale = true;
                    }
                }
            }
        }
        if contacts_stale {
            reload_contacts(chat_ui, chat_service, user_id).await;
        }
    }

    Ok(())
}
