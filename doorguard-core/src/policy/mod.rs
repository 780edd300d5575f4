// Access policy: pure decision over a user snapshot, the weekly schedule and
// the user's own windows.

pub mod evaluator;
pub mod schedule_feed;

pub use evaluator::{AccessDecision, AccessPolicy, DecisionRule};
pub use schedule_feed::{parse_schedule_payload, ScheduleFeedError, ScheduleListener};
