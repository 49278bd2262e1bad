use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use voicebot_contracts::MemberSnapshot;
use voicebot_kernel::IdentityNormalizer;

const VOICE_PREFIX: char = '+';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub nickname: String,
    pub account: Option<String>,
    /// Live voice state as last observed or applied.
    pub voiced: bool,
    pub last_spoke: Option<DateTime<Utc>>,
}

/// Who is currently in the managed channel. Never persisted.
pub struct Roster {
    members: HashMap<String, Member>,
    normalizer: Arc<dyn IdentityNormalizer>,
}

impl Roster {
    pub fn new(normalizer: Arc<dyn IdentityNormalizer>) -> Self {
        Self {
            members: HashMap::new(),
            normalizer,
        }
    }

    pub fn get(&self, nickname: &str) -> Option<&Member> {
        self.members.get(&self.normalizer.normalize(nickname))
    }

    pub fn get_mut(&mut self, nickname: &str) -> Option<&mut Member> {
        let key = self.normalizer.normalize(nickname);
        self.members.get_mut(&key)
    }

    pub fn contains(&self, nickname: &str) -> bool {
        self.get(nickname).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Adds the member, or refreshes the account of one already present.
    pub fn join(&mut self, nickname: &str, account: Option<&str>, prefixes: &str) -> &mut Member {
        let key = self.normalizer.normalize(nickname);
        let member = self.members.entry(key).or_insert_with(|| Member {
            nickname: nickname.to_string(),
            account: None,
            voiced: prefixes.contains(VOICE_PREFIX),
            last_spoke: None,
        });
        if account.is_some() {
            member.account = account.map(str::to_string);
        }
        member
    }

    pub fn part(&mut self, nickname: &str) -> Option<Member> {
        self.members.remove(&self.normalizer.normalize(nickname))
    }

    /// Moves a member to a new nickname, keeping voice and activity.
    pub fn rename(&mut self, old: &str, new: &str) -> Option<&mut Member> {
        let mut member = self.members.remove(&self.normalizer.normalize(old))?;
        member.nickname = new.to_string();
        let key = self.normalizer.normalize(new);
        self.members.insert(key.clone(), member);
        self.members.get_mut(&key)
    }

    /// Replaces the whole roster with a names snapshot. Activity already seen
    /// for members that stay is kept.
    pub fn replace_all(&mut self, snapshot: &[MemberSnapshot]) {
        let mut previous = std::mem::take(&mut self.members);
        for entry in snapshot {
            let key = self.normalizer.normalize(&entry.nickname);
            let last_spoke = previous.remove(&key).and_then(|m| m.last_spoke);
            self.members.insert(
                key,
                Member {
                    nickname: entry.nickname.clone(),
                    account: entry.account.clone(),
                    voiced: entry.prefixes.contains(VOICE_PREFIX),
                    last_spoke,
                },
            );
        }
    }

    /// Display nicknames, sorted for stable iteration.
    pub fn nicknames(&self) -> Vec<String> {
        let mut nicks: Vec<String> = self.members.values().map(|m| m.nickname.clone()).collect();
        nicks.sort();
        nicks
    }

    pub fn with_account(&self, account: &str) -> Vec<String> {
        let mut nicks: Vec<String> = self
            .members
            .values()
            .filter(|m| {
                m.account
                    .as_deref()
                    .map(|a| self.normalizer.same(a, account))
                    .unwrap_or(false)
            })
            .map(|m| m.nickname.clone())
            .collect();
        nicks.sort();
        nicks
    }
}
