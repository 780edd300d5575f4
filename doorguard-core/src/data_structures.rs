// Read models supplied by the persistence layer. The core only ever holds
// immutable snapshots of these.

use chrono::{NaiveDate, NaiveTime, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

// Prefixed to bare national numbers (10 digits, no `+`/`00`).
pub const DEFAULT_COUNTRY_CODE: &str = "1";

fn e164_digits() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[1-9]\d{9,14}$").ok()).as_ref()
}

/// Canonical key for a phone number: E.164 digits without the `+`.
/// `+1 (555) 010-0001`, `0015550100001` and `555 010 0001` all map to
/// `15550100001`. `None` if the result is not 10 to 15 digits.
pub fn canonical_phone(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let international = raw.starts_with('+') || raw.starts_with("00");
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if raw.starts_with("00") {
        digits.drain(..2);
    }
    if !international && digits.len() == 10 {
        digits.insert_str(0, DEFAULT_COUNTRY_CODE);
    }
    e164_digits().filter(|p| p.is_match(&digits)).map(|_| digits)
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: Option<String>,
    pub phone_number: String,
    pub is_allowed: bool,
    pub low_security: bool, // Exempt from the second factor inside gated windows
    pub encoding_ids: Vec<u64>,
}

/// One row of the building-wide weekly schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalScheduleEntry {
    pub weekday: Weekday,
    pub open_time: Option<NaiveTime>,
    pub close_time: Option<NaiveTime>,
    pub force_unlocked: bool,
}

impl GlobalScheduleEntry {
    pub fn closed(weekday: Weekday) -> Self {
        GlobalScheduleEntry { weekday, open_time: None, close_time: None, force_unlocked: false }
    }

    pub fn open(weekday: Weekday, open_time: NaiveTime, close_time: NaiveTime) -> Self {
        GlobalScheduleEntry { weekday, open_time: Some(open_time), close_time: Some(close_time), force_unlocked: false }
    }

    /// Whether `time` falls inside `[open_time, close_time)`. A null bound
    /// means closed all day. An open time later than the close time is an
    /// overnight window wrapping past midnight.
    pub fn contains(&self, time: NaiveTime) -> bool {
        match (self.open_time, self.close_time) {
            (Some(open), Some(close)) if open < close => open <= time && time < close,
            (Some(open), Some(close)) if open > close => time >= open || time < close,
            _ => false, // Null bound, or an empty open == close interval
        }
    }
}

/// Weekly schedule keyed by weekday. Missing days are closed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSchedule {
    entries: HashMap<Weekday, GlobalScheduleEntry>,
}

impl GlobalSchedule {
    pub fn new(entries: impl IntoIterator<Item = GlobalScheduleEntry>) -> Self {
        GlobalSchedule { entries: entries.into_iter().map(|e| (e.weekday, e)).collect() }
    }

    pub fn entry(&self, weekday: Weekday) -> Option<&GlobalScheduleEntry> {
        self.entries.get(&weekday)
    }

    pub fn upsert(&mut self, entry: GlobalScheduleEntry) {
        self.entries.insert(entry.weekday, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-user inclusive date range granting conditional access outside the
/// global window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserScheduleWindow {
    pub user_id: UserId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl UserScheduleWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

/// How an access attempt authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    Face,
    Otp,
    Combined,
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMethod::Face => "face",
            AccessMethod::Otp => "otp",
            AccessMethod::Combined => "combined",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn day_window_is_half_open() {
        let entry = GlobalScheduleEntry::open(Weekday::Mon, t(8, 0), t(18, 0));
        assert!(entry.contains(t(8, 0)));
        assert!(entry.contains(t(17, 59)));
        assert!(!entry.contains(t(18, 0)));
        assert!(!entry.contains(t(7, 59)));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let entry = GlobalScheduleEntry::open(Weekday::Fri, t(22, 0), t(6, 0));
        assert!(entry.contains(t(23, 30)));
        assert!(entry.contains(t(0, 0)));
        assert!(entry.contains(t(5, 59)));
        assert!(!entry.contains(t(6, 0)));
        assert!(!entry.contains(t(12, 0)));
    }

    #[test]
    fn null_or_empty_bounds_mean_closed() {
        assert!(!GlobalScheduleEntry::closed(Weekday::Sun).contains(t(12, 0)));
        let half = GlobalScheduleEntry { open_time: Some(t(8, 0)), ..GlobalScheduleEntry::closed(Weekday::Sun) };
        assert!(!half.contains(t(12, 0)));
        let empty = GlobalScheduleEntry::open(Weekday::Sun, t(9, 0), t(9, 0));
        assert!(!empty.contains(t(9, 0)));
    }

    #[test]
    fn phone_forms_share_one_key() {
        for raw in ["+1 (555) 010-0001", "555 010 0001", "5550100001", "0015550100001", "15550100001"] {
            assert_eq!(canonical_phone(raw).as_deref(), Some("15550100001"), "{}", raw);
        }
        assert_eq!(canonical_phone("+44 7399 963248").as_deref(), Some("447399963248"));
        assert_eq!(canonical_phone("555-0100"), None);
        assert_eq!(canonical_phone("+1234567890123456"), None);
        assert_eq!(canonical_phone(""), None);
    }

    #[test]
    fn user_window_is_inclusive() {
        let window = UserScheduleWindow {
            user_id: UserId::new("u1"),
            start_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
        };
        assert!(window.contains(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()));
        assert!(window.contains(NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()));
        assert!(!window.contains(NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()));
    }
}
