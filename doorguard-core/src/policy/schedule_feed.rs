// Parses the weekly schedule pushed to the device on the schedule topic:
// [{"day": "Monday", "open_time": "08:00", "close_time": "18:00", "forceUnlocked": false}, ...]

use crate::data_structures::{GlobalSchedule, GlobalScheduleEntry};
use crate::directory::ScheduleStore;
use crate::network::{schedule_topic, BusError, BusMessage, CommandBus};
use chrono::{NaiveTime, Weekday};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ScheduleFeedError {
    #[error("malformed schedule payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown weekday `{0}`")]
    UnknownDay(String),
    #[error("bad time `{value}` for {day}: expected HH:MM")]
    BadTime { day: String, value: String },
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    day: String,
    open_time: Option<String>,
    close_time: Option<String>,
    #[serde(default, alias = "forceUnlocked")]
    force_unlocked: bool,
}

fn parse_day(raw: &str) -> Result<Weekday, ScheduleFeedError> {
    // chrono accepts both "Mon" and "Monday", case-insensitively
    raw.trim().parse::<Weekday>().map_err(|_| ScheduleFeedError::UnknownDay(raw.to_string()))
}

fn parse_time(day: &str, raw: Option<String>) -> Result<Option<NaiveTime>, ScheduleFeedError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => NaiveTime::parse_from_str(value, "%H:%M")
            .map(Some)
            .map_err(|_| ScheduleFeedError::BadTime { day: day.to_string(), value: value.to_string() }),
    }
}

/// Parses a full weekly schedule. Later entries for the same day replace
/// earlier ones; days absent from the payload are closed.
pub fn parse_schedule_payload(payload: &[u8]) -> Result<GlobalSchedule, ScheduleFeedError> {
    let raw: Vec<RawEntry> = serde_json::from_slice(payload)?;
    let mut schedule = GlobalSchedule::default();
    for entry in raw {
        let weekday = parse_day(&entry.day)?;
        schedule.upsert(GlobalScheduleEntry {
            weekday,
            open_time: parse_time(&entry.day, entry.open_time)?,
            close_time: parse_time(&entry.day, entry.close_time)?,
            force_unlocked: entry.force_unlocked,
        });
    }
    Ok(schedule)
}

/// Keeps the local schedule in step with the schedule topic.
pub struct ScheduleListener;

impl ScheduleListener {
    /// Subscribes to the schedule topic and applies every well-formed payload
    /// until the subscription closes.
    pub async fn spawn(bus: Arc<dyn CommandBus>, store: Arc<dyn ScheduleStore>) -> Result<JoinHandle<()>, BusError> {
        let updates = bus.subscribe(&schedule_topic()).await?;
        info!("[ScheduleFeed] Listening on {}", schedule_topic());
        Ok(tokio::spawn(apply_updates(updates, store)))
    }
}

async fn apply_updates(mut updates: mpsc::Receiver<BusMessage>, store: Arc<dyn ScheduleStore>) {
    while let Some(msg) = updates.recv().await {
        match parse_schedule_payload(&msg.payload) {
            Ok(schedule) => {
                info!("[ScheduleFeed] Applying schedule update ({} days)", schedule.len());
                store.replace_schedule(schedule);
            }
            // The previous schedule stays in force.
            Err(e) => warn!("[ScheduleFeed] Ignoring schedule update on {}: {}", msg.topic, e),
        }
    }
    debug!("[ScheduleFeed] Schedule subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_payload() {
        let payload = br#"[
            {"day": "Monday", "open_time": "08:00", "close_time": "18:00", "forceUnlocked": false},
            {"day": "Saturday", "open_time": null, "close_time": null, "forceUnlocked": true},
            {"day": "sun", "open_time": "", "close_time": ""}
        ]"#;
        let schedule = parse_schedule_payload(payload).unwrap();
        assert_eq!(schedule.len(), 3);
        let monday = schedule.entry(Weekday::Mon).unwrap();
        assert_eq!(monday.open_time, NaiveTime::from_hms_opt(8, 0, 0));
        assert!(!monday.force_unlocked);
        assert!(schedule.entry(Weekday::Sat).unwrap().force_unlocked);
        assert_eq!(schedule.entry(Weekday::Sun).unwrap().open_time, None);
    }

    #[test]
    fn rejects_bad_rows() {
        let err = parse_schedule_payload(br#"[{"day": "Caturday", "open_time": null, "close_time": null}]"#).unwrap_err();
        assert!(matches!(err, ScheduleFeedError::UnknownDay(d) if d == "Caturday"));

        let err = parse_schedule_payload(br#"[{"day": "Monday", "open_time": "8am", "close_time": "18:00"}]"#).unwrap_err();
        assert!(matches!(err, ScheduleFeedError::BadTime { .. }));

        assert!(matches!(parse_schedule_payload(b"{}"), Err(ScheduleFeedError::Json(_))));
    }

    #[tokio::test]
    async fn listener_applies_good_updates_and_skips_bad_ones() {
        use crate::config::AccessConfig;
        use crate::directory::{AccessDirectory, InMemoryDirectory};
        use crate::network::EmulatedBroker;
        use crate::test_utils::office_hours;
        use std::time::Duration;

        let broker = Arc::new(EmulatedBroker::new(AccessConfig::default().bus()));
        let directory = Arc::new(InMemoryDirectory::new());
        directory.replace_schedule(office_hours());
        ScheduleListener::spawn(broker.clone(), directory.clone()).await.unwrap();

        broker.publish("door/schedule", b"not json".to_vec()).await.unwrap();
        broker
            .publish("door/schedule", br#"[{"day": "Sunday", "open_time": "10:00", "close_time": "14:00"}]"#.to_vec())
            .await
            .unwrap();

        let mut applied = None;
        for _ in 0..100 {
            let schedule = directory.global_schedule().await.unwrap();
            if schedule.len() == 1 {
                applied = Some(schedule);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let schedule = applied.expect("schedule update was not applied");
        assert_eq!(schedule.entry(Weekday::Sun).unwrap().open_time, NaiveTime::from_hms_opt(10, 0, 0));
        assert!(schedule.entry(Weekday::Mon).is_none());
    }
}
