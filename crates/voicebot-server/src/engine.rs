use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use voicebot_config::Config;
use voicebot_contracts::{
    EventReport, Identity, IdentityKind, MemberSnapshot, ModeChangeReport, ProtocolEvent, Reply,
};
use voicebot_kernel::{
    acknowledge_add, acknowledge_remove, addressed_command, authorize, chat_help, console_help,
    decide_activity, merge_activity, parse_command, prunable, AddOutcome, CaseMapping, Command,
    CommandSource, IdentityNormalizer, InvalidCommandThrottle, RemoveOutcome, Requester,
    VoiceDecision,
};

use crate::adapter::ChannelAdapter;
use crate::registry::Registry;
use crate::roster::{Member, Roster};
use crate::store::{ActivityStore, StorageError};

pub const CONSOLE_TARGET: &str = "console";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("engine is not running")]
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub channel: String,
    pub bot_nickname: String,
    pub idle_timeout: Duration,
    pub operator_prefixes: String,
    pub force_identified: bool,
    pub prune_grace: Option<Duration>,
    pub source_url: Option<String>,
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        Ok(Self {
            channel: cfg.bot.channel.clone(),
            bot_nickname: cfg.bot.nickname.clone(),
            idle_timeout: seconds("bot.idle_timeout_secs", cfg.bot.idle_timeout_secs)?,
            operator_prefixes: cfg.bot.operator_prefixes.clone(),
            force_identified: cfg.bot.force_identified,
            prune_grace: cfg
                .store
                .prune_grace_secs
                .map(|secs| seconds("store.prune_grace_secs", secs))
                .transpose()?,
            source_url: cfg.bot.source_url.clone(),
        })
    }
}

fn seconds(name: &str, secs: u64) -> Result<Duration, String> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| format!("{name}={secs} is out of range"))
}

/// One unit of work for the engine. Every input is processed to completion
/// before the next one starts.
#[derive(Debug, Clone)]
pub enum EngineInput {
    Protocol {
        event: ProtocolEvent,
        received_at: DateTime<Utc>,
    },
    Console {
        line: String,
        at: DateTime<Utc>,
    },
    Sweep {
        at: DateTime<Utc>,
    },
}

/// Owns the registry, the activity store and the roster.
pub struct Engine {
    settings: EngineSettings,
    normalizer: Arc<dyn IdentityNormalizer>,
    registry: Registry,
    store: ActivityStore,
    roster: Roster,
    throttle: InvalidCommandThrottle,
    adapter: Arc<dyn ChannelAdapter>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        normalizer: Arc<dyn IdentityNormalizer>,
        registry: Registry,
        store: ActivityStore,
        adapter: Arc<dyn ChannelAdapter>,
    ) -> Self {
        Self {
            roster: Roster::new(Arc::clone(&normalizer)),
            settings,
            normalizer,
            registry,
            store,
            throttle: InvalidCommandThrottle::default(),
            adapter,
        }
    }

    /// Loads persisted state. Malformed files abort startup.
    pub fn open(cfg: &Config, adapter: Arc<dyn ChannelAdapter>) -> Result<Self, String> {
        let mapping = CaseMapping::from_name(&cfg.bot.casemapping)
            .ok_or_else(|| format!("unsupported casemapping {}", cfg.bot.casemapping))?;
        let normalizer: Arc<dyn IdentityNormalizer> = Arc::new(mapping);
        let registry = Registry::open(
            Path::new(&cfg.store.nicknames_path),
            Path::new(&cfg.store.accounts_path),
            Arc::clone(&normalizer),
        )
        .map_err(|e| e.to_string())?;
        let store = ActivityStore::open(&cfg.store).map_err(|e| e.to_string())?;
        info!(
            nicknames = registry.list(IdentityKind::Nickname).len(),
            accounts = registry.list(IdentityKind::Account).len(),
            records = store.len(),
            "loaded persisted state"
        );
        Ok(Self::new(
            EngineSettings::from_config(cfg)?,
            normalizer,
            registry,
            store,
            adapter,
        ))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &ActivityStore {
        &self.store
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.registry.flush()?;
        self.store.flush()
    }

    pub async fn handle(&mut self, input: EngineInput) -> Result<EventReport, EngineError> {
        match input {
            EngineInput::Protocol { event, received_at } => {
                let at = event.at().unwrap_or(received_at);
                self.on_event(event, at).await
            }
            EngineInput::Console { line, at } => Ok(self.on_console(&line, at).await),
            EngineInput::Sweep { at } => self.sweep(at).await,
        }
    }

    pub async fn on_event(
        &mut self,
        event: ProtocolEvent,
        at: DateTime<Utc>,
    ) -> Result<EventReport, EngineError> {
        validate_event(&event)?;
        debug!(kind = event.kind(), "protocol event");
        let mut report = EventReport::default();
        match event {
            ProtocolEvent::Message {
                nickname,
                account,
                channel,
                text,
                prefixes,
                ..
            } => {
                self.on_message(
                    &nickname,
                    account.as_deref(),
                    channel.as_deref(),
                    &text,
                    &prefixes,
                    at,
                    &mut report,
                )
                .await?
            }
            ProtocolEvent::Join {
                nickname,
                account,
                channel,
                prefixes,
                ..
            } => {
                if self.is_managed_channel(&channel) {
                    self.on_join(&nickname, account.as_deref(), &prefixes, at, &mut report)
                        .await?
                }
            }
            ProtocolEvent::Part { nickname, channel } => {
                if self.is_managed_channel(&channel) {
                    self.on_part(&nickname)?
                }
            }
            ProtocolEvent::Nick { old, new, .. } => self.on_nick(&old, &new, at, &mut report).await?,
            ProtocolEvent::Account { nickname, account } => {
                if let Some(member) = self.roster.get_mut(&nickname) {
                    member.account = account;
                    self.refresh(&nickname, at, false, &mut report).await?;
                }
            }
            ProtocolEvent::Names { channel, members } => {
                if self.is_managed_channel(&channel) {
                    self.on_names(&members, at, &mut report).await?
                }
            }
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_message(
        &mut self,
        nickname: &str,
        account: Option<&str>,
        channel: Option<&str>,
        text: &str,
        prefixes: &str,
        at: DateTime<Utc>,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        let channel = match channel {
            Some(channel) => channel,
            None => {
                if let (Some(member), Some(account)) = (self.roster.get_mut(nickname), account) {
                    member.account = Some(account.to_string());
                }
                self.dispatch_chat(nickname, prefixes, text, CommandSource::PrivateMessage, at, report)
                    .await;
                return Ok(());
            }
        };
        if !self.is_managed_channel(channel) || self.is_self(nickname) {
            return Ok(());
        }

        self.roster.join(nickname, account, prefixes).last_spoke = Some(at);
        let addressed = addressed_command(
            &self.settings.bot_nickname,
            text,
            self.normalizer.as_ref(),
        )
        .map(str::to_string);
        if let Some(command_text) = addressed {
            self.dispatch_chat(
                nickname,
                prefixes,
                &command_text,
                CommandSource::ChannelMention,
                at,
                report,
            )
            .await;
        }
        self.refresh(nickname, at, true, report).await
    }

    async fn on_join(
        &mut self,
        nickname: &str,
        account: Option<&str>,
        prefixes: &str,
        at: DateTime<Utc>,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        if self.is_self(nickname) {
            debug!("joined managed channel; waiting for names");
            return Ok(());
        }
        self.roster.join(nickname, account, prefixes);
        self.refresh(nickname, at, false, report).await
    }

    fn on_part(&mut self, nickname: &str) -> Result<(), EngineError> {
        if self.is_self(nickname) {
            info!(members = self.roster.len(), "left managed channel; clearing roster");
            for nick in self.roster.nicknames() {
                self.forget_member(&nick)?;
            }
            return Ok(());
        }
        self.forget_member(nickname)
    }

    /// Removes a member from the roster. Their records stay, unvoiced.
    fn forget_member(&mut self, nickname: &str) -> Result<(), EngineError> {
        if let Some(member) = self.roster.part(nickname) {
            let ids = self.managed_identities(&member);
            self.sync_voiced(&ids, false)?;
        }
        Ok(())
    }

    async fn on_nick(
        &mut self,
        old: &str,
        new: &str,
        at: DateTime<Utc>,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        if self.is_self(old) {
            self.settings.bot_nickname = new.to_string();
            return Ok(());
        }
        let voiced = match self.roster.rename(old, new) {
            Some(member) => member.voiced,
            None => return Ok(()),
        };
        let old_id = self.identity(IdentityKind::Nickname, old);
        self.store.set_voiced(&old_id, false)?;
        self.refresh(new, at, !voiced, report).await
    }

    async fn on_names(
        &mut self,
        members: &[MemberSnapshot],
        at: DateTime<Utc>,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        let others: Vec<MemberSnapshot> = members
            .iter()
            .filter(|m| !self.is_self(&m.nickname))
            .cloned()
            .collect();
        self.roster.replace_all(&others);

        let present = self.present_identities();
        let stale: Vec<Identity> = self
            .store
            .all()
            .filter(|r| r.voiced && !present.contains(&r.identity))
            .map(|r| r.identity.clone())
            .collect();
        self.sync_voiced(&stale, false)?;

        info!(members = self.roster.len(), "roster synchronized");
        for nick in self.roster.nicknames() {
            self.refresh(&nick, at, false, report).await?;
        }
        Ok(())
    }

    /// Re-evaluates a present member. `bump` marks the call as fresh activity;
    /// otherwise missing records are created at `at`.
    async fn refresh(
        &mut self,
        nickname: &str,
        at: DateTime<Utc>,
        bump: bool,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        let member = match self.roster.get(nickname) {
            Some(member) => member.clone(),
            None => return Ok(()),
        };
        let ids = self.managed_identities(&member);
        if !ids.is_empty() && self.eligible(&member) {
            for id in &ids {
                if bump {
                    self.store.record_activity(id, at)?;
                } else {
                    self.store.ensure(id, at)?;
                }
            }
            self.sync_voiced(&ids, member.voiced)?;
        }
        self.evaluate(&member, &ids, at, report).await
    }

    async fn evaluate(
        &mut self,
        member: &Member,
        ids: &[Identity],
        now: DateTime<Utc>,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        if self.is_self(&member.nickname) {
            return Ok(());
        }
        let decision = if ids.is_empty() || !self.eligible(member) {
            if member.voiced {
                VoiceDecision::Devoice
            } else {
                VoiceDecision::NoChange
            }
        } else {
            let records = ids.iter().filter_map(|id| self.store.get(id));
            match merge_activity(records, Some(member.voiced)) {
                Some(activity) => decide_activity(&activity, now, self.settings.idle_timeout),
                None => VoiceDecision::NoChange,
            }
        };
        self.apply(&member.nickname, ids, decision, report).await
    }

    /// Sends the mode change. The voiced flag only follows a confirmed change,
    /// so failures are retried by a later sweep.
    async fn apply(
        &mut self,
        nickname: &str,
        ids: &[Identity],
        decision: VoiceDecision,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        let voice = match decision {
            VoiceDecision::Voice => true,
            VoiceDecision::Devoice => false,
            VoiceDecision::NoChange => return Ok(()),
        };
        let applied = match self
            .adapter
            .set_channel_mode(&self.settings.channel, nickname, voice)
            .await
        {
            Ok(()) => {
                info!(nickname, voice, "mode change applied");
                true
            }
            Err(err) => {
                warn!(nickname, voice, error = %err, "mode change failed");
                false
            }
        };
        report.mode_changes.push(ModeChangeReport {
            nickname: nickname.to_string(),
            voice,
            applied,
        });
        if applied {
            if let Some(member) = self.roster.get_mut(nickname) {
                member.voiced = voice;
            }
            self.sync_voiced(ids, voice)?;
        }
        Ok(())
    }

    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<EventReport, EngineError> {
        let mut report = EventReport::default();
        for nick in self.roster.nicknames() {
            let member = match self.roster.get(&nick) {
                Some(member) => member.clone(),
                None => continue,
            };
            let ids = self.managed_identities(&member);
            self.evaluate(&member, &ids, now, &mut report).await?;
        }

        let registry = &self.registry;
        let mut pruned = self
            .store
            .retain(|r| registry.contains(r.identity.kind, &r.identity.value))?;
        if let Some(grace) = self.settings.prune_grace {
            let idle_timeout = self.settings.idle_timeout;
            let present = self.present_identities();
            pruned += self.store.retain(|r| {
                present.contains(&r.identity) || !prunable(r, now, idle_timeout, grace)
            })?;
        }
        if pruned > 0 {
            debug!(pruned, "pruned activity records");
        }
        Ok(report)
    }

    pub async fn on_console(&mut self, line: &str, at: DateTime<Utc>) -> EventReport {
        let mut report = EventReport::default();
        let lines = match parse_command(line, CommandSource::Console) {
            Ok(command) => self.execute(command, CommandSource::Console, at, &mut report).await,
            Err(err) => vec![err.response(CommandSource::Console)],
        };
        for text in lines {
            report.replies.push(Reply {
                target: CONSOLE_TARGET.to_string(),
                text,
            });
        }
        report
    }

    async fn dispatch_chat(
        &mut self,
        nickname: &str,
        prefixes: &str,
        text: &str,
        source: CommandSource,
        at: DateTime<Utc>,
        report: &mut EventReport,
    ) {
        let (target, lead) = match source {
            CommandSource::ChannelMention => (self.settings.channel.clone(), format!("{nickname}: ")),
            _ => (nickname.to_string(), String::new()),
        };
        let requester_key = self.normalizer.normalize(nickname);

        let command = match parse_command(text, source) {
            Ok(command) => command,
            Err(err) => {
                debug!(nickname, source = source.as_str(), error = %err, "unparsed chat command");
                if self.throttle.allow(&requester_key, at) {
                    self.reply(&target, format!("{lead}{}", err.response(source)), report)
                        .await;
                }
                return;
            }
        };
        self.throttle.reset(&requester_key);

        let requester = Requester {
            nickname,
            present: self.roster.contains(nickname),
            prefixes,
        };
        if let Err(err) = authorize(
            &command,
            source,
            Some(&requester),
            &self.settings.operator_prefixes,
        ) {
            warn!(nickname, verb = command.verb(), error = %err, "command rejected");
            self.reply(&target, format!("{lead}Permission denied: {err}."), report)
                .await;
            return;
        }

        let lines = self.execute(command, source, at, report).await;
        for line in lines {
            self.reply(&target, format!("{lead}{line}"), report).await;
        }
    }

    async fn execute(
        &mut self,
        command: Command,
        source: CommandSource,
        at: DateTime<Utc>,
        report: &mut EventReport,
    ) -> Vec<String> {
        match command {
            Command::Help if source.is_chat() => chat_help(self.settings.source_url.as_deref()),
            Command::Help => vec![console_help().to_string()],
            Command::List(kind) => {
                let entries = self.registry.list(kind);
                if entries.is_empty() {
                    vec![format!("No {} managed.", kind.plural())]
                } else {
                    vec![entries.join("\n")]
                }
            }
            Command::Add(kind, value) => match self.registry.add(kind, &value) {
                Ok(outcome) => {
                    info!(kind = kind.as_str(), value = %value, source = source.as_str(), ?outcome, "add");
                    let mut lines = vec![acknowledge_add(kind, outcome)];
                    if outcome == AddOutcome::Added {
                        if let Err(err) = self.on_managed_added(kind, &value, at, report).await {
                            error!(error = %err, "could not evaluate newly managed identity");
                            lines.push(format!("Could not save activity: {err}"));
                        }
                    }
                    lines
                }
                Err(err) => {
                    error!(kind = kind.as_str(), value = %value, error = %err, "add failed");
                    vec![format!("Could not save {}: {err}", kind.plural())]
                }
            },
            Command::Remove(kind, value) => match self.registry.remove(kind, &value) {
                Ok(outcome) => {
                    info!(kind = kind.as_str(), value = %value, source = source.as_str(), ?outcome, "remove");
                    let mut lines = vec![acknowledge_remove(kind, outcome)];
                    if outcome == RemoveOutcome::Removed {
                        if let Err(err) = self.on_managed_removed(kind, &value, at, report).await {
                            error!(error = %err, "could not update removed identity");
                            lines.push(format!("Could not save activity: {err}"));
                        }
                    }
                    lines
                }
                Err(err) => {
                    error!(kind = kind.as_str(), value = %value, error = %err, "remove failed");
                    vec![format!("Could not save {}: {err}", kind.plural())]
                }
            },
        }
    }

    /// A newly managed identity that spoke within the window is evaluated at
    /// once, using the time it was last seen speaking.
    async fn on_managed_added(
        &mut self,
        kind: IdentityKind,
        value: &str,
        at: DateTime<Utc>,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        let id = self.identity(kind, value);
        for nick in self.members_matching(kind, value) {
            let member = match self.roster.get(&nick) {
                Some(member) => member.clone(),
                None => continue,
            };
            let spoke = match member.last_spoke {
                Some(spoke) if at - spoke <= self.settings.idle_timeout => spoke,
                _ => continue,
            };
            if !self.eligible(&member) {
                continue;
            }
            if self.store.get(&id).map_or(true, |r| r.last_active < spoke) {
                self.store.record_activity(&id, spoke)?;
            }
            let ids = self.managed_identities(&member);
            self.sync_voiced(&ids, member.voiced)?;
            self.evaluate(&member, &ids, at, report).await?;
        }
        Ok(())
    }

    async fn on_managed_removed(
        &mut self,
        kind: IdentityKind,
        value: &str,
        at: DateTime<Utc>,
        report: &mut EventReport,
    ) -> Result<(), EngineError> {
        let id = self.identity(kind, value);
        self.store.remove(&id)?;
        for nick in self.members_matching(kind, value) {
            let member = match self.roster.get(&nick) {
                Some(member) => member.clone(),
                None => continue,
            };
            let ids = self.managed_identities(&member);
            self.evaluate(&member, &ids, at, report).await?;
        }
        Ok(())
    }

    async fn reply(&mut self, target: &str, text: String, report: &mut EventReport) {
        if let Err(err) = self.adapter.send_message(target, &text).await {
            warn!(to = target, error = %err, "reply failed");
        }
        report.replies.push(Reply {
            target: target.to_string(),
            text,
        });
    }

    fn members_matching(&self, kind: IdentityKind, value: &str) -> Vec<String> {
        match kind {
            IdentityKind::Nickname => self
                .roster
                .get(value)
                .map(|m| vec![m.nickname.clone()])
                .unwrap_or_default(),
            IdentityKind::Account => self.roster.with_account(value),
        }
    }

    /// Managed identities matching a member; nickname and account are
    /// evaluated together as one user.
    fn managed_identities(&self, member: &Member) -> Vec<Identity> {
        let mut ids = Vec::with_capacity(2);
        if self.registry.contains(IdentityKind::Nickname, &member.nickname) {
            ids.push(self.identity(IdentityKind::Nickname, &member.nickname));
        }
        if let Some(account) = member.account.as_deref() {
            if self.registry.contains(IdentityKind::Account, account) {
                ids.push(self.identity(IdentityKind::Account, account));
            }
        }
        ids
    }

    /// Managed identities of everyone currently in the channel.
    fn present_identities(&self) -> Vec<Identity> {
        self.roster
            .nicknames()
            .iter()
            .filter_map(|nick| self.roster.get(nick))
            .flat_map(|member| self.managed_identities(member))
            .collect()
    }

    fn sync_voiced(&mut self, ids: &[Identity], voiced: bool) -> Result<(), StorageError> {
        for id in ids {
            self.store.set_voiced(id, voiced)?;
        }
        Ok(())
    }

    fn eligible(&self, member: &Member) -> bool {
        !self.settings.force_identified || member.account.is_some()
    }

    fn identity(&self, kind: IdentityKind, value: &str) -> Identity {
        Identity {
            kind,
            value: self.normalizer.normalize(value),
        }
    }

    fn is_managed_channel(&self, channel: &str) -> bool {
        self.normalizer.same(channel, &self.settings.channel)
    }

    fn is_self(&self, nickname: &str) -> bool {
        self.normalizer.same(nickname, &self.settings.bot_nickname)
    }
}

fn validate_event(event: &ProtocolEvent) -> Result<(), EngineError> {
    let names: Vec<&str> = match event {
        ProtocolEvent::Message { nickname, .. }
        | ProtocolEvent::Join { nickname, .. }
        | ProtocolEvent::Part { nickname, .. }
        | ProtocolEvent::Account { nickname, .. } => vec![nickname.as_str()],
        ProtocolEvent::Nick { old, new, .. } => vec![old.as_str(), new.as_str()],
        ProtocolEvent::Names { members, .. } => {
            members.iter().map(|m| m.nickname.as_str()).collect()
        }
    };
    for name in names {
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(EngineError::InvalidEvent(format!(
                "nickname {name:?} must be a single non-empty word"
            )));
        }
    }
    match event {
        ProtocolEvent::Join { channel, .. }
        | ProtocolEvent::Part { channel, .. }
        | ProtocolEvent::Names { channel, .. }
            if channel.trim().is_empty() =>
        {
            Err(EngineError::InvalidEvent("channel is required".to_string()))
        }
        _ => Ok(()),
    }
}
