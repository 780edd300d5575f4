// Read-only view of users, schedules and biometric encodings. Owned by the
// persistence layer; the in-memory implementation backs tests and the simulator.

use crate::data_structures::{canonical_phone, GlobalSchedule, User, UserId, UserScheduleWindow};
use crate::liveness::types::Embedding;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// A stored face encoding belonging to one user.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEncoding {
    pub encoding_id: u64,
    pub user_id: UserId,
    pub embedding: Embedding,
}

#[async_trait]
pub trait AccessDirectory: Send + Sync {
    async fn user(&self, id: &UserId) -> Result<Option<User>, DirectoryError>;
    async fn user_by_phone(&self, phone: &str) -> Result<Option<User>, DirectoryError>;
    async fn global_schedule(&self) -> Result<GlobalSchedule, DirectoryError>;
    async fn user_windows(&self, id: &UserId) -> Result<Vec<UserScheduleWindow>, DirectoryError>;
    async fn encodings(&self) -> Result<Vec<StoredEncoding>, DirectoryError>;
}

/// Write side for the one piece of directory data the device itself keeps
/// current: the weekly schedule it receives over the bus.
pub trait ScheduleStore: Send + Sync {
    fn replace_schedule(&self, schedule: GlobalSchedule);
}

#[derive(Debug, Default)]
struct DirectoryState {
    users: HashMap<UserId, User>,
    schedule: GlobalSchedule,
    windows: Vec<UserScheduleWindow>,
    encodings: Vec<StoredEncoding>,
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn upsert_user(&self, user: User) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.users.insert(user.id.clone(), user);
    }

    pub fn add_encoding(&self, encoding: StoredEncoding) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(user) = state.users.get_mut(&encoding.user_id) {
            if !user.encoding_ids.contains(&encoding.encoding_id) {
                user.encoding_ids.push(encoding.encoding_id);
            }
        }
        state.encodings.push(encoding);
    }

    pub fn add_window(&self, window: UserScheduleWindow) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.windows.push(window);
    }

}

impl ScheduleStore for InMemoryDirectory {
    /// Swaps in a whole weekly schedule, as delivered by the schedule feed.
    fn replace_schedule(&self, schedule: GlobalSchedule) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        debug!("[Directory] Replacing global schedule ({} days)", schedule.len());
        state.schedule = schedule;
    }
}

#[async_trait]
impl AccessDirectory for InMemoryDirectory {
    async fn user(&self, id: &UserId) -> Result<Option<User>, DirectoryError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.users.get(id).cloned())
    }

    async fn user_by_phone(&self, phone: &str) -> Result<Option<User>, DirectoryError> {
        // Both sides compared in canonical form; stored numbers may carry
        // formatting or omit the country code.
        let Some(wanted) = canonical_phone(phone) else {
            return Ok(None);
        };
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .users
            .values()
            .find(|u| canonical_phone(&u.phone_number).as_deref() == Some(wanted.as_str()))
            .cloned())
    }

    async fn global_schedule(&self) -> Result<GlobalSchedule, DirectoryError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.schedule.clone())
    }

    async fn user_windows(&self, id: &UserId) -> Result<Vec<UserScheduleWindow>, DirectoryError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.windows.iter().filter(|w| &w.user_id == id).cloned().collect())
    }

    async fn encodings(&self) -> Result<Vec<StoredEncoding>, DirectoryError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.encodings.clone())
    }
}
