//! Chat list grouping by recency.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::api::Chat;

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: [&str; 2] = ["%Y/%m/%d", "%Y-%m-%d"];

/// Chats bucketed by how recently they were updated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatGroups {
    /// Updated today.
    pub today: Vec<Chat>,
    /// Updated earlier this week (weeks start on Sunday).
    pub this_week: Vec<Chat>,
    /// Updated earlier this month.
    pub this_month: Vec<Chat>,
    /// Everything older, and chats without a parsable timestamp.
    pub furthermore: Vec<Chat>,
}

impl ChatGroups {
    /// Total number of grouped chats.
    #[must_use]
    pub fn len(&self) -> usize {
        self.today.len() + self.this_week.len() + self.this_month.len() + self.furthermore.len()
    }

    /// Returns true if no chats were grouped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Group `chats` relative to `now`, keeping their order within each bucket.
///
/// Uses `update_time`, falling back to `create_time` when it is empty.
#[must_use]
pub fn group_by_recency(chats: impl IntoIterator<Item = Chat>, now: NaiveDateTime) -> ChatGroups {
    let today = now.date();
    let mut groups = ChatGroups::default();

    for chat in chats {
        let stamp = if chat.update_time.is_empty() {
            &chat.create_time
        } else {
            &chat.update_time
        };

        let bucket = match parse_timestamp(stamp).map(|t| t.date()) {
            Some(date) if date == today => &mut groups.today,
            Some(date) if week_start(date) == week_start(today) => &mut groups.this_week,
            Some(date) if (date.year(), date.month()) == (today.year(), today.month()) => {
                &mut groups.this_month
            }
            _ => &mut groups.furthermore,
        };
        bucket.push(chat);
    }

    groups
}

/// Parse a server timestamp in either slash or dash notation.
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_sunday()))
}
