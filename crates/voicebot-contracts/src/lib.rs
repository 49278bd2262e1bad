use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CONTRACT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Nickname,
    Account,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::Nickname => "nickname",
            IdentityKind::Account => "account",
        }
    }

    /// Name of the list file and data-file section holding this kind.
    pub fn plural(self) -> &'static str {
        match self {
            IdentityKind::Nickname => "nicknames",
            IdentityKind::Account => "accounts",
        }
    }
}

/// A managed identity. `value` is always stored in normalized form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity {
    pub kind: IdentityKind,
    pub value: String,
}

impl Identity {
    pub fn nickname(value: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Nickname,
            value: value.into(),
        }
    }

    pub fn account(value: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Account,
            value: value.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityRecord {
    pub identity: Identity,
    pub last_active: DateTime<Utc>,
    pub voiced: bool,
}

impl ActivityRecord {
    pub fn new(identity: Identity, last_active: DateTime<Utc>) -> Self {
        Self {
            identity,
            last_active,
            voiced: false,
        }
    }
}

/// A channel member as reported by the adapter in a `names` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MemberSnapshot {
    pub nickname: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub prefixes: String,
}

/// Events delivered by the protocol adapter.
///
/// `prefixes` always describes the sender's current prefix set in the managed
/// channel (e.g. `"@"`, `"+"`, `"@+"`), even for private messages. `at`
/// defaults to the time the engine receives the event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Message {
        nickname: String,
        #[serde(default)]
        account: Option<String>,
        #[serde(default)]
        channel: Option<String>,
        text: String,
        #[serde(default)]
        prefixes: String,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Join {
        nickname: String,
        #[serde(default)]
        account: Option<String>,
        channel: String,
        #[serde(default)]
        prefixes: String,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Part {
        nickname: String,
        channel: String,
    },
    Nick {
        old: String,
        new: String,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Account {
        nickname: String,
        #[serde(default)]
        account: Option<String>,
    },
    Names {
        channel: String,
        members: Vec<MemberSnapshot>,
    },
}

impl ProtocolEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolEvent::Message { .. } => "message",
            ProtocolEvent::Join { .. } => "join",
            ProtocolEvent::Part { .. } => "part",
            ProtocolEvent::Nick { .. } => "nick",
            ProtocolEvent::Account { .. } => "account",
            ProtocolEvent::Names { .. } => "names",
        }
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            ProtocolEvent::Message { at, .. }
            | ProtocolEvent::Join { at, .. }
            | ProtocolEvent::Nick { at, .. } => *at,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModeChangeRequest {
    pub v: u32,
    pub channel: String,
    pub nickname: String,
    pub mode: String,
}

impl ModeChangeRequest {
    pub fn new(channel: &str, nickname: &str, voice: bool) -> Self {
        Self {
            v: CONTRACT_VERSION,
            channel: channel.to_string(),
            nickname: nickname.to_string(),
            mode: if voice { "+v" } else { "-v" }.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OutboundMessage {
    pub v: u32,
    pub target: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModeChangeReport {
    pub nickname: String,
    pub voice: bool,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Reply {
    pub target: String,
    pub text: String,
}

/// What the engine did in response to one input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventReport {
    pub v: u32,
    #[serde(default)]
    pub mode_changes: Vec<ModeChangeReport>,
    #[serde(default)]
    pub replies: Vec<Reply>,
}

impl Default for EventReport {
    fn default() -> Self {
        Self {
            v: CONTRACT_VERSION,
            mode_changes: Vec::new(),
            replies: Vec::new(),
        }
    }
}

impl EventReport {
    pub fn voiced(&self) -> Vec<&str> {
        self.applied(true)
    }

    pub fn devoiced(&self) -> Vec<&str> {
        self.applied(false)
    }

    fn applied(&self, voice: bool) -> Vec<&str> {
        self.mode_changes
            .iter()
            .filter(|m| m.applied && m.voice == voice)
            .map(|m| m.nickname.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
