use chrono::{DateTime, Duration, Utc};
use voicebot_contracts::ActivityRecord;

pub mod casemap;
pub mod command;

pub use casemap::{CaseMapping, IdentityNormalizer};
pub use command::{
    acknowledge_add, acknowledge_remove, addressed_command, authorize, console_help, chat_help,
    has_operator_prefix, parse_command, AddOutcome, AuthorizationError, Command, CommandSource,
    InvalidCommandThrottle, ParseError, RemoveOutcome, Requester,
};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceDecision {
    NoChange,
    Voice,
    Devoice,
}

/// Merged view of one user: every matched record folded into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activity {
    pub last_active: DateTime<Utc>,
    pub voiced: bool,
}

impl From<&ActivityRecord> for Activity {
    fn from(record: &ActivityRecord) -> Self {
        Self {
            last_active: record.last_active,
            voiced: record.voiced,
        }
    }
}

pub fn decide(record: &ActivityRecord, now: DateTime<Utc>, idle_timeout: Duration) -> VoiceDecision {
    decide_activity(&Activity::from(record), now, idle_timeout)
}

pub fn decide_activity(
    activity: &Activity,
    now: DateTime<Utc>,
    idle_timeout: Duration,
) -> VoiceDecision {
    let idle = now - activity.last_active;
    match (activity.voiced, idle <= idle_timeout) {
        (false, true) => VoiceDecision::Voice,
        (true, false) => VoiceDecision::Devoice,
        _ => VoiceDecision::NoChange,
    }
}

/// Folds the records matched for one user. The most recent activity wins;
/// `live_voiced` (the channel's current state, when known) overrides the
/// persisted flags.
pub fn merge_activity<'a, I>(records: I, live_voiced: Option<bool>) -> Option<Activity>
where
    I: IntoIterator<Item = &'a ActivityRecord>,
{
    let mut merged: Option<Activity> = None;
    for record in records {
        merged = Some(match merged {
            None => Activity::from(record),
            Some(acc) => Activity {
                last_active: acc.last_active.max(record.last_active),
                voiced: acc.voiced || record.voiced,
            },
        });
    }
    merged.map(|mut activity| {
        if let Some(voiced) = live_voiced {
            activity.voiced = voiced;
        }
        activity
    })
}

/// Whether the retention policy allows dropping a record.
pub fn prunable(
    record: &ActivityRecord,
    now: DateTime<Utc>,
    idle_timeout: Duration,
    grace: Duration,
) -> bool {
    match idle_timeout.checked_add(&grace) {
        Some(limit) => !record.voiced && now - record.last_active > limit,
        None => false,
    }
}

/// Sweep cadence: the configured interval, otherwise a tenth of the idle
/// timeout capped at one minute; never below `min`.
pub fn sweep_interval(
    idle_timeout: std::time::Duration,
    configured: Option<std::time::Duration>,
    min: std::time::Duration,
) -> std::time::Duration {
    let derived = (idle_timeout / 10).min(std::time::Duration::from_secs(60));
    configured.unwrap_or(derived).max(min)
}
