use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::debug;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};
use std::{collections::HashSet, io, time::Duration};
use textwrap::wrap;
use tui_input::{backend::crossterm::EventHandler, Input};

use parley::chat::format::{format_message_date, format_message_time, is_same_day, sent_state_for, ticks};
use parley::models::{Contact, Message};

// Export types needed by main module
pub use ratatui::backend::CrosstermBackend;
pub use ratatui::Terminal;

pub const PERMISSION_DENIED_NOTICE: &str = "Permission denied – press Ctrl+R to retry";
const NO_HISTORY_PREVIEW: &str = "Send new message";

/// What the user asked for; main turns these into data-access calls
#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    Quit,
    SelectContact(String),
    SendMessage { receiver_id: String, content: String },
    SearchUsers(String),
    AddContact(String),
    RetryContacts,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Focus {
    Contacts,
    Composer,
}

struct AddContactDialog {
    input: Input,
    results: Vec<Contact>,
    selected: usize,
}

/// A line shown under the conversation that is not a stored message
struct Notice {
    at: DateTime<Utc>,
    text: String,
}

pub struct ChatUI {
    user_id: String,
    username: String,
    contacts: Vec<Contact>,
    selected: usize,
    active_contact: Option<String>,
    messages: Vec<Message>,
    notices: Vec<Notice>,
    input: Input,
    name_filter: Input,
    focus: Focus,
    unread_only: bool,
    permission_denied: bool,
    add_dialog: Option<AddContactDialog>,
    reported_viewed: HashSet<String>,
    // Message ids with a line inside the message pane on the last draw
    on_screen: HashSet<String>,
}

impl ChatUI {
    pub fn new(user_id: &str, username: &str) -> Self {
        ChatUI {
            user_id: user_id.to_string(),
            username: username.to_string(),
            contacts: Vec::new(),
            selected: 0,
            active_contact: None,
            messages: Vec::new(),
            notices: Vec::new(),
            input: Input::default(),
            name_filter: Input::default(),
            focus: Focus::Contacts,
            unread_only: false,
            permission_denied: false,
            add_dialog: None,
            reported_viewed: HashSet::new(),
            on_screen: HashSet::new(),
        }
    }

    pub fn set_contacts(&mut self, contacts: Vec<Contact>) {
        // Keep the highlighted contact across reloads
        let highlighted = self.highlighted_contact().map(|c| c.id.clone());
        self.contacts = contacts;
        self.selected = highlighted
            .and_then(|id| self.visible_contacts().iter().position(|c| c.id == id))
            .unwrap_or(0);
    }

    pub fn set_permission_denied(&mut self, denied: bool) {
        self.permission_denied = denied;
    }

    /// Contacts after the unread-only toggle and the name filter
    fn visible_contacts(&self) -> Vec<&Contact> {
        let filter = self.name_filter.value().to_lowercase();
        self.contacts
            .iter()
            .filter(|c| !self.unread_only || c.unread_count > 0)
            .filter(|c| filter.is_empty() || c.username.to_lowercase().contains(&filter))
            .collect()
    }

    fn highlighted_contact(&self) -> Option<&Contact> {
        self.visible_contacts().get(self.selected).copied()
    }

    fn active_contact_profile(&self) -> Option<&Contact> {
        let id = self.active_contact.as_deref()?;
        self.contacts.iter().find(|c| c.id == id)
    }

    pub fn open_conversation(&mut self, contact_id: &str, messages: Vec<Message>) {
        self.active_contact = Some(contact_id.to_string());
        self.messages = messages;
        self.notices.clear();
        self.focus = Focus::Composer;
    }

    /// Insert or replace a message of the open conversation. Messages for
    /// other conversations are ignored.
    pub fn upsert_message(&mut self, message: Message) {
        let contact = match &self.active_contact {
            Some(contact) => contact,
            None => return,
        };
        if !message.involves(&self.user_id, contact) {
            return;
        }

        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                if message.status > existing.status {
                    existing.status = message.status;
                }
            }
            None => {
                self.messages.push(message);
                self.messages.sort_by_key(|m| m.created_at);
            }
        }
    }

    /// Apply a status change pushed by the backend. Returns whether the
    /// message is tracked here.
    pub fn apply_status_change(&mut self, message: &Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                if message.status > existing.status {
                    existing.status = message.status;
                }
                true
            }
            None => false,
        }
    }

    pub fn add_notice(&mut self, text: &str) {
        self.notices.push(Notice {
            at: Utc::now(),
            text: text.to_string(),
        });
    }

    /// Ids of inbound unread messages on screen that were not reported yet.
    /// Each id is returned at most once.
    pub fn take_viewed_batch(&mut self) -> Vec<String> {
        if self.active_contact.is_none() {
            return Vec::new();
        }

        let batch: Vec<String> = self
            .messages
            .iter()
            .filter(|m| self.on_screen.contains(&m.id))
            .filter(|m| m.is_unread_for(&self.user_id))
            .filter(|m| !self.reported_viewed.contains(&m.id))
            .map(|m| m.id.clone())
            .collect();
        self.reported_viewed.extend(batch.iter().cloned());
        batch
    }

    pub fn show_add_contact_dialog(&mut self) {
        self.add_dialog = Some(AddContactDialog {
            input: Input::default(),
            results: Vec::new(),
            selected: 0,
        });
    }

    pub fn close_add_contact_dialog(&mut self) {
        self.add_dialog = None;
    }

    /// Results for `query`; dropped if the dialog moved on to another query
    pub fn set_search_results(&mut self, query: &str, results: Vec<Contact>) {
        if let Some(dialog) = &mut self.add_dialog {
            if dialog.input.value() == query {
                dialog.results = results;
                dialog.selected = 0;
            }
        }
    }

    pub fn handle_input(&mut self) -> Result<Option<UiAction>> {
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(self.handle_key(key));
                }
            }
        }
        Ok(None)
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Option<UiAction> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Some(UiAction::Quit);
        }

        if self.add_dialog.is_some() {
            return self.handle_dialog_key(key);
        }

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('u') => {
                    self.unread_only = !self.unread_only;
                    self.selected = 0;
                    return None;
                }
                KeyCode::Char('a') => {
                    self.show_add_contact_dialog();
                    return None;
                }
                KeyCode::Char('r') if self.permission_denied => return Some(UiAction::RetryContacts),
                _ => {}
            }
        }

        match key.code {
            KeyCode::Esc => return Some(UiAction::Quit),
            KeyCode::Tab => {
                self.focus = match self.focus {
                    Focus::Contacts => Focus::Composer,
                    Focus::Composer => Focus::Contacts,
                };
                return None;
            }
            _ => {}
        }

        match self.focus {
            Focus::Contacts => self.handle_contacts_key(key),
            Focus::Composer => self.handle_composer_key(key),
        }
    }

    fn handle_contacts_key(&mut self, key: KeyEvent) -> Option<UiAction> {
        let visible = self.visible_contacts().len();
        match key.code {
            KeyCode::Up => {
                self.selected = self.selected.saturating_sub(1);
                None
            }
            KeyCode::Down => {
                if self.selected + 1 < visible {
                    self.selected += 1;
                }
                None
            }
            KeyCode::Enter => self
                .highlighted_contact()
                .map(|c| UiAction::SelectContact(c.id.clone())),
            _ => {
                self.name_filter.handle_event(&Event::Key(key));
                self.selected = 0;
                None
            }
        }
    }

    fn handle_composer_key(&mut self, key: KeyEvent) -> Option<UiAction> {
        match key.code {
            KeyCode::Enter => {
                let receiver_id = self.active_contact.clone()?;
                let content = self.input.value().to_string();
                if content.trim().is_empty() {
                    return None;
                }
                self.input.reset();
                Some(UiAction::SendMessage { receiver_id, content })
            }
            _ => {
                self.input.handle_event(&Event::Key(key));
                None
            }
        }
    }

    fn handle_dialog_key(&mut self, key: KeyEvent) -> Option<UiAction> {
        let dialog = self.add_dialog.as_mut()?;
        match key.code {
            KeyCode::Esc => {
                self.add_dialog = None;
                None
            }
            KeyCode::Up => {
                dialog.selected = dialog.selected.saturating_sub(1);
                None
            }
            KeyCode::Down => {
                if dialog.selected + 1 < dialog.results.len() {
                    dialog.selected += 1;
                }
                None
            }
            KeyCode::Enter => dialog
                .results
                .get(dialog.selected)
                .map(|c| UiAction::AddContact(c.id.clone())),
            _ => {
                let before = dialog.input.value().to_string();
                dialog.input.handle_event(&Event::Key(key));
                let query = dialog.input.value().to_string();
                if query == before {
                    return None;
                }
                if query.is_empty() {
                    dialog.results.clear();
                }
                debug!("Searching users for '{}'", query);
                Some(UiAction::SearchUsers(query))
            }
        }
    }

    pub fn draw<B: Backend>(&mut self, frame: &mut Frame<B>) {
        let size = frame.size();

        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(30), // Contacts panel
                Constraint::Percentage(70), // Chat panel
            ])
            .split(size);

        let contact_chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Name filter
                Constraint::Min(3),    // Contacts
            ])
            .split(chunks[0]);

        let chat_chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(5),    // Messages
                Constraint::Length(3), // Composer
                Constraint::Length(1), // Help line
            ])
            .split(chunks[1]);

        self.draw_filter(frame, contact_chunks[0]);
        self.draw_contacts(frame, contact_chunks[1]);
        self.draw_header(frame, chat_chunks[0]);
        self.draw_messages(frame, chat_chunks[1]);

        let input_widget = Paragraph::new(self.input.value()).block(
            Block::default()
                .title("Message")
                .borders(Borders::ALL)
                .border_style(focus_style(self.focus == Focus::Composer)),
        );
        frame.render_widget(input_widget, chat_chunks[2]);

        let help = Paragraph::new(Line::from(vec![Span::styled(
            format!(
                "{} | ESC quit | TAB switch | Ctrl+A add | Ctrl+U unread only{}",
                self.username,
                if self.unread_only { " [on]" } else { "" }
            ),
            Style::default().fg(Color::Gray),
        )]));
        frame.render_widget(help, chat_chunks[3]);

        match self.focus {
            Focus::Composer if self.add_dialog.is_none() => frame.set_cursor(
                chat_chunks[2].x + self.input.cursor() as u16 + 1,
                chat_chunks[2].y + 1,
            ),
            Focus::Contacts if self.add_dialog.is_none() => frame.set_cursor(
                contact_chunks[0].x + self.name_filter.cursor() as u16 + 1,
                contact_chunks[0].y + 1,
            ),
            _ => {}
        }

        if let Some(dialog) = &self.add_dialog {
            draw_add_contact_dialog(frame, dialog, size);
        }
    }

    fn draw_filter<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let filter = Paragraph::new(self.name_filter.value()).block(
            Block::default()
                .title("Search contacts")
                .borders(Borders::ALL)
                .border_style(focus_style(self.focus == Focus::Contacts)),
        );
        frame.render_widget(filter, area);
    }

    fn draw_contacts<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let block = Block::default()
            .title(if self.unread_only { "Contacts (unread)" } else { "Contacts" })
            .borders(Borders::ALL)
            .border_style(focus_style(self.focus == Focus::Contacts));

        if self.permission_denied {
            let notice = Paragraph::new(PERMISSION_DENIED_NOTICE)
                .style(Style::default().fg(Color::Red))
                .block(block);
            frame.render_widget(notice, area);
            return;
        }

        let width = area.width.saturating_sub(4) as usize;
        let items: Vec<ListItem> = self
            .visible_contacts()
            .into_iter()
            .enumerate()
            .map(|(i, c)| contact_item(c, i == self.selected, width))
            .collect();

        if items.is_empty() {
            let empty = Paragraph::new("No contacts. Ctrl+A to add one.")
                .style(Style::default().fg(Color::Gray))
                .block(block);
            frame.render_widget(empty, area);
            return;
        }

        let mut state = ListState::default();
        state.select(Some(self.selected));
        let list = List::new(items)
            .block(block)
            .highlight_style(Style::default().add_modifier(Modifier::BOLD));
        frame.render_stateful_widget(list, area, &mut state);
    }

    fn draw_header<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let line = match self.active_contact_profile() {
            Some(contact) => Line::from(vec![
                Span::styled(contact.username.clone(), Style::default().add_modifier(Modifier::BOLD)),
                Span::raw("  "),
                Span::styled(
                    contact.phone.clone().unwrap_or_else(|| "No phone number".to_string()),
                    Style::default().fg(Color::Gray),
                ),
            ]),
            None => Line::from(Span::styled(
                "Select a contact to start chatting",
                Style::default().fg(Color::Gray),
            )),
        };
        let header = Paragraph::new(line).block(Block::default().borders(Borders::ALL));
        frame.render_widget(header, area);
    }

    fn draw_messages<B: Backend>(&mut self, frame: &mut Frame<B>, area: Rect) {
        let wrap_width = area.width.saturating_sub(2) as usize;
        let contact_name = self
            .active_contact_profile()
            .map(|c| c.username.clone())
            .unwrap_or_else(|| "Them".to_string());

        // Each row remembers which message it belongs to
        let mut rows: Vec<(ListItem, Option<usize>)> = Vec::new();
        for (text, style, owner) in self.message_lines(&contact_name, &Local::now()) {
            rows.extend(
                wrap(&text, wrap_width.max(1))
                    .into_iter()
                    .map(|l| (ListItem::new(l.into_owned()).style(style), owner)),
            );
        }

        for notice in &self.notices {
            let text = format!("[{}] {}", format_message_time(notice.at, &Local), notice.text);
            rows.extend(
                wrap(&text, wrap_width.max(1))
                    .into_iter()
                    .map(|l| (ListItem::new(l.into_owned()).style(Style::default().fg(Color::Red)), None)),
            );
        }

        // The list is pinned to its last row, so only the tail is visible
        let visible_rows = area.height.saturating_sub(2) as usize;
        let tail_start = rows.len().saturating_sub(visible_rows);
        self.on_screen = rows[tail_start..]
            .iter()
            .filter_map(|(_, owner)| *owner)
            .filter_map(|index| self.messages.get(index).map(|m| m.id.clone()))
            .collect();

        let items: Vec<ListItem> = rows.into_iter().map(|(item, _)| item).collect();

        // Keep the newest line in view
        let mut state = ListState::default();
        if !items.is_empty() {
            state.select(Some(items.len() - 1));
        }
        let list = List::new(items)
            .block(Block::default().borders(Borders::ALL).title("Messages"))
            .highlight_style(Style::default());
        frame.render_stateful_widget(list, area, &mut state);
    }

    /// Date separators, group headers and message lines, before wrapping.
    /// Message lines carry the index of their message.
    fn message_lines(&self, contact_name: &str, now: &DateTime<Local>) -> Vec<(String, Style, Option<usize>)> {
        let mut lines = Vec::new();
        let mut previous: Option<&Message> = None;

        for (index, message) in self.messages.iter().enumerate() {
            let new_day = previous.map_or(true, |p| !is_same_day(p.created_at, message.created_at, &Local));
            if new_day {
                lines.push((
                    format!("── {} ──", format_message_date(Some(message.created_at), now)),
                    Style::default().fg(Color::DarkGray),
                    None,
                ));
            }

            let own = message.sender_id == self.user_id;
            if new_day || previous.map_or(true, |p| p.sender_id != message.sender_id) {
                let name = if own { "You" } else { contact_name };
                lines.push((name.to_string(), Style::default().add_modifier(Modifier::BOLD), None));
            }

            let tick = sent_state_for(message, &self.user_id)
                .map(|state| format!(" {}", ticks(state)))
                .unwrap_or_default();
            let style = if own {
                Style::default().fg(Color::Cyan)
            } else {
                Style::default()
            };
            lines.push((
                format!("  {} {}{}", format_message_time(message.created_at, &Local), message.content, tick),
                style,
                Some(index),
            ));
            previous = Some(message);
        }
        lines
    }
}

fn focus_style(focused: bool) -> Style {
    if focused {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    }
}

fn contact_item(contact: &Contact, selected: bool, width: usize) -> ListItem<'static> {
    let marker = if selected { "> " } else { "  " };
    let mut first = vec![Span::raw(format!("{}{}", marker, contact.username))];
    if !contact.last_message_date.is_empty() {
        first.push(Span::styled(
            format!("  {}", contact.last_message_date),
            Style::default().fg(Color::Gray),
        ));
    }
    if contact.unread_count > 0 {
        first.push(Span::styled(
            format!(" ({})", contact.unread_count),
            Style::default().fg(Color::Black).bg(Color::Green),
        ));
    }

    let preview = if contact.has_history() {
        let tick = contact
            .sent_state
            .map(|state| format!("{} ", ticks(state)))
            .unwrap_or_default();
        format!("{}{}", tick, contact.latest_message)
    } else {
        NO_HISTORY_PREVIEW.to_string()
    };
    let preview: String = preview.chars().take(width.max(1)).collect();

    ListItem::new(vec![
        Line::from(first),
        Line::from(Span::styled(format!("  {}", preview), Style::default().fg(Color::Gray))),
    ])
}

fn draw_add_contact_dialog<B: Backend>(f: &mut Frame<B>, dialog: &AddContactDialog, area: Rect) {
    let popup_width = 50.min(area.width.saturating_sub(4));
    let popup_height = 16.min(area.height.saturating_sub(4));
    let popup_area = Rect::new(
        (area.width - popup_width) / 2,
        (area.height - popup_height) / 2,
        popup_width,
        popup_height,
    );

    let popup_block = Block::default()
        .title("Add Contact (Enter add, Esc close)")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    f.render_widget(Clear, popup_area);
    f.render_widget(popup_block, popup_area);

    let inner_area = popup_area.inner(&Margin {
        vertical: 1,
        horizontal: 2,
    });

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Query
            Constraint::Min(1),    // Results
        ])
        .split(inner_area);

    let input_widget = Paragraph::new(dialog.input.value()).block(
        Block::default()
            .title("Username")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Blue)),
    );
    f.render_widget(input_widget, chunks[0]);

    let results: Vec<ListItem> = if dialog.results.is_empty() {
        let hint = if dialog.input.value().is_empty() {
            "Type to search users"
        } else {
            "No users found"
        };
        vec![ListItem::new(hint).style(Style::default().fg(Color::Gray))]
    } else {
        dialog
            .results
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let marker = if i == dialog.selected { "> " } else { "  " };
                ListItem::new(format!("{}{}", marker, c.username))
            })
            .collect()
    };
    f.render_widget(List::new(results), chunks[1]);

    f.set_cursor(chunks[0].x + dialog.input.cursor() as u16 + 1, chunks[0].y + 1);
}

pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

pub fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
