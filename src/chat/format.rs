//! Display helpers for message timestamps and delivery ticks.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt::Display;

use crate::models::{Message, UserSentState};

/// Label for the day a message was sent, relative to `now`: "Today",
/// "Yesterday", or the date as `M/D/YYYY` in `now`'s time zone.
pub fn format_message_date<Tz>(created_at: Option<DateTime<Utc>>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let created_at = match created_at {
        Some(ts) => ts.with_timezone(&now.timezone()),
        None => return String::new(),
    };

    let day = created_at.date_naive();
    let today = now.date_naive();
    if day == today {
        return "Today".to_string();
    }
    if today.pred_opt() == Some(day) {
        return "Yesterday".to_string();
    }
    created_at.format("%-m/%-d/%Y").to_string()
}

/// Whether two timestamps fall on the same calendar day in `tz`
pub fn is_same_day<Tz: TimeZone>(a: DateTime<Utc>, b: DateTime<Utc>, tz: &Tz) -> bool {
    a.with_timezone(tz).date_naive() == b.with_timezone(tz).date_naive()
}

pub fn format_message_time<Tz>(created_at: DateTime<Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    created_at.with_timezone(tz).format("%H:%M").to_string()
}

/// Ticks to show for `message`, only when `user_id` sent it
pub fn sent_state_for(message: &Message, user_id: &str) -> Option<UserSentState> {
    if message.sender_id == user_id {
        Some(UserSentState::from(message.status))
    } else {
        None
    }
}

pub fn ticks(state: UserSentState) -> &'static str {
    match state {
        UserSentState::Sent => "✓",
        UserSentState::Received => "✓✓",
        UserSentState::Read => "✓✓✓",
    }
}
