use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use voicebot_contracts::IdentityKind;

use crate::casemap::IdentityNormalizer;

const CHAT_HELP: &str = "Commands (channel operators only): add-nickname <nickname>, \
add-account <account>, remove-nickname <nickname>, remove-account <account>";

const CONSOLE_HELP: &str = "\
Commands:
  add-nickname <nickname>
  add-account <account>
  remove-nickname <nickname>
  remove-account <account>
  list-nicknames
  list-accounts
  help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Console,
    ChannelMention,
    PrivateMessage,
}

impl CommandSource {
    pub fn is_chat(self) -> bool {
        !matches!(self, CommandSource::Console)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandSource::Console => "console",
            CommandSource::ChannelMention => "channel",
            CommandSource::PrivateMessage => "private",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(IdentityKind, String),
    Remove(IdentityKind, String),
    List(IdentityKind),
    Help,
}

impl Command {
    pub fn is_mutating(&self) -> bool {
        matches!(self, Command::Add(..) | Command::Remove(..))
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::Add(IdentityKind::Nickname, _) => "add-nickname",
            Command::Add(IdentityKind::Account, _) => "add-account",
            Command::Remove(IdentityKind::Nickname, _) => "remove-nickname",
            Command::Remove(IdentityKind::Account, _) => "remove-account",
            Command::List(IdentityKind::Nickname) => "list-nicknames",
            Command::List(IdentityKind::Account) => "list-accounts",
            Command::Help => "help",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command \"{0}\"")]
    UnknownVerb(String),
    #[error("{verb} takes {expected} argument(s)")]
    WrongArguments { verb: String, expected: usize },
    #[error("{0} is only available on the console")]
    ConsoleOnly(String),
    #[error("\"{0}\" is not a valid name")]
    InvalidArgument(String),
}

impl ParseError {
    /// The user-visible response for this error.
    pub fn response(&self, source: CommandSource) -> String {
        match source {
            CommandSource::Console => format!("{self}\n{CONSOLE_HELP}"),
            _ => format!("{}. Type \"help\" for help.", capitalize(&self.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("{0} is not in the channel")]
    NotPresent(String),
    #[error("{0} is not a channel operator")]
    NotOperator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    WasAbsent,
}

/// The requester of a chat command, as seen at the moment of the request.
#[derive(Debug, Clone, Copy)]
pub struct Requester<'a> {
    pub nickname: &'a str,
    pub present: bool,
    pub prefixes: &'a str,
}

pub fn parse_command(text: &str, source: CommandSource) -> Result<Command, ParseError> {
    let mut words = text.split_whitespace();
    let verb = words.next().ok_or(ParseError::Empty)?;
    let args: Vec<&str> = words.collect();

    let (command, arity) = match verb {
        "add-nickname" => (Some(IdentityKind::Nickname), 1),
        "add-account" => (Some(IdentityKind::Account), 1),
        "remove-nickname" => (Some(IdentityKind::Nickname), 1),
        "remove-account" => (Some(IdentityKind::Account), 1),
        "list-nicknames" | "list-accounts" | "help" => (None, 0),
        v if v.eq_ignore_ascii_case("help") => (None, 0),
        other => return Err(ParseError::UnknownVerb(other.to_string())),
    };
    if args.len() != arity {
        return Err(ParseError::WrongArguments {
            verb: verb.to_string(),
            expected: arity,
        });
    }

    if let Some(arg) = args.first().filter(|a| a.starts_with('#')) {
        return Err(ParseError::InvalidArgument(arg.to_string()));
    }

    let parsed = match (verb, command) {
        (v, Some(kind)) if v.starts_with("add-") => Command::Add(kind, args[0].to_string()),
        (_, Some(kind)) => Command::Remove(kind, args[0].to_string()),
        ("list-nicknames", None) => Command::List(IdentityKind::Nickname),
        ("list-accounts", None) => Command::List(IdentityKind::Account),
        _ => Command::Help,
    };
    if matches!(parsed, Command::List(_)) && source.is_chat() {
        return Err(ParseError::ConsoleOnly(verb.to_string()));
    }
    Ok(parsed)
}

/// Console commands are always allowed. Mutating chat commands need a
/// present requester carrying one of `operator_prefixes`.
pub fn authorize(
    command: &Command,
    source: CommandSource,
    requester: Option<&Requester<'_>>,
    operator_prefixes: &str,
) -> Result<(), AuthorizationError> {
    if !source.is_chat() || !command.is_mutating() {
        return Ok(());
    }
    let requester = match requester {
        Some(r) => r,
        None => return Err(AuthorizationError::NotPresent(String::new())),
    };
    if !requester.present {
        return Err(AuthorizationError::NotPresent(requester.nickname.to_string()));
    }
    if !has_operator_prefix(requester.prefixes, operator_prefixes) {
        return Err(AuthorizationError::NotOperator(requester.nickname.to_string()));
    }
    Ok(())
}

pub fn has_operator_prefix(prefixes: &str, operator_prefixes: &str) -> bool {
    prefixes.chars().any(|c| operator_prefixes.contains(c))
}

/// Returns the command part of a channel message addressed to the bot
/// (`bot: cmd` or `bot, cmd`).
pub fn addressed_command<'a>(
    bot_nickname: &str,
    text: &'a str,
    normalizer: &dyn IdentityNormalizer,
) -> Option<&'a str> {
    let text = text.trim_start();
    let end = text.find([':', ','])?;
    let (target, rest) = text.split_at(end);
    if target.is_empty() || target.contains(char::is_whitespace) {
        return None;
    }
    if !normalizer.same(target, bot_nickname) {
        return None;
    }
    Some(rest[1..].trim())
}

pub fn acknowledge_add(kind: IdentityKind, outcome: AddOutcome) -> String {
    match outcome {
        AddOutcome::Added => format!("{} added.", capitalize(kind.as_str())),
        AddOutcome::AlreadyPresent => format!("{} is already managed.", capitalize(kind.as_str())),
    }
}

pub fn acknowledge_remove(kind: IdentityKind, outcome: RemoveOutcome) -> String {
    match outcome {
        RemoveOutcome::Removed => format!("{} removed.", capitalize(kind.as_str())),
        RemoveOutcome::WasAbsent => format!("{} was not managed.", capitalize(kind.as_str())),
    }
}

pub fn console_help() -> &'static str {
    CONSOLE_HELP
}

pub fn chat_help(source_url: Option<&str>) -> Vec<String> {
    let mut lines = vec![CHAT_HELP.to_string()];
    if let Some(url) = source_url {
        lines.push(format!("Source: {url}"));
    }
    lines
}

/// Caps how many "type help" replies one requester can trigger. Entries idle
/// for longer than the window are forgotten.
#[derive(Debug)]
pub struct InvalidCommandThrottle {
    max_replies: u32,
    window: Duration,
    counts: HashMap<String, (u32, DateTime<Utc>)>,
}

impl Default for InvalidCommandThrottle {
    fn default() -> Self {
        Self::new(10, Duration::seconds(120))
    }
}

impl InvalidCommandThrottle {
    pub fn new(max_replies: u32, window: Duration) -> Self {
        Self {
            max_replies,
            window,
            counts: HashMap::new(),
        }
    }

    /// Records an invalid command; true while a reply is still allowed.
    pub fn allow(&mut self, requester: &str, now: DateTime<Utc>) -> bool {
        self.collect_garbage(now);
        let entry = self.counts.entry(requester.to_string()).or_insert((0, now));
        let allowed = entry.0 < self.max_replies;
        entry.0 = entry.0.saturating_add(1);
        entry.1 = now;
        allowed
    }

    pub fn reset(&mut self, requester: &str) {
        self.counts.remove(requester);
    }

    pub fn tracked(&self) -> usize {
        self.counts.len()
    }

    fn collect_garbage(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.counts.retain(|_, (_, last)| now - *last < window);
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CaseMapping;

    #[test]
    fn parses_mutating_verbs() {
        assert_eq!(
            parse_command("add-nickname alice", CommandSource::Console),
            Ok(Command::Add(IdentityKind::Nickname, "alice".to_string()))
        );
        assert_eq!(
            parse_command("  remove-account   acct1 ", CommandSource::PrivateMessage),
            Ok(Command::Remove(IdentityKind::Account, "acct1".to_string()))
        );
        assert_eq!(
            parse_command("HELP", CommandSource::PrivateMessage),
            Ok(Command::Help)
        );
    }

    #[test]
    fn rejects_wrong_arity_and_unknown_verbs() {
        assert_eq!(
            parse_command("add-account", CommandSource::Console),
            Err(ParseError::WrongArguments {
                verb: "add-account".to_string(),
                expected: 1
            })
        );
        assert_eq!(
            parse_command("add-nickname a b", CommandSource::Console).unwrap_err(),
            ParseError::WrongArguments {
                verb: "add-nickname".to_string(),
                expected: 1
            }
        );
        assert_eq!(
            parse_command("voice bob", CommandSource::ChannelMention),
            Err(ParseError::UnknownVerb("voice".to_string()))
        );
        assert_eq!(parse_command("   ", CommandSource::Console), Err(ParseError::Empty));
        assert_eq!(
            parse_command("add-account #chan", CommandSource::Console),
            Err(ParseError::InvalidArgument("#chan".to_string()))
        );
    }

    #[test]
    fn list_commands_are_console_only() {
        assert_eq!(
            parse_command("list-accounts", CommandSource::Console),
            Ok(Command::List(IdentityKind::Account))
        );
        assert_eq!(
            parse_command("list-nicknames", CommandSource::PrivateMessage),
            Err(ParseError::ConsoleOnly("list-nicknames".to_string()))
        );
    }

    #[test]
    fn parse_error_responses_differ_by_source() {
        let err = ParseError::UnknownVerb("x".to_string());
        assert_eq!(
            err.response(CommandSource::PrivateMessage),
            "Unknown command \"x\". Type \"help\" for help."
        );
        assert!(err.response(CommandSource::Console).contains("list-accounts"));
    }

    #[test]
    fn console_is_always_authorized() {
        let cmd = Command::Add(IdentityKind::Nickname, "bob".to_string());
        assert_eq!(authorize(&cmd, CommandSource::Console, None, "@"), Ok(()));
    }

    #[test]
    fn chat_mutation_requires_present_operator() {
        let cmd = Command::Add(IdentityKind::Nickname, "bob".to_string());
        let op = Requester {
            nickname: "carol",
            present: true,
            prefixes: "@+",
        };
        assert_eq!(authorize(&cmd, CommandSource::ChannelMention, Some(&op), "@"), Ok(()));

        let voiced = Requester {
            prefixes: "+",
            ..op
        };
        assert_eq!(
            authorize(&cmd, CommandSource::ChannelMention, Some(&voiced), "@"),
            Err(AuthorizationError::NotOperator("carol".to_string()))
        );

        let absent = Requester {
            present: false,
            ..op
        };
        assert_eq!(
            authorize(&cmd, CommandSource::PrivateMessage, Some(&absent), "@"),
            Err(AuthorizationError::NotPresent("carol".to_string()))
        );

        let halfop = Requester {
            prefixes: "%",
            ..op
        };
        assert_eq!(
            authorize(&cmd, CommandSource::PrivateMessage, Some(&halfop), "@%"),
            Ok(())
        );
    }

    #[test]
    fn help_needs_no_privilege() {
        let nobody = Requester {
            nickname: "dave",
            present: false,
            prefixes: "",
        };
        assert_eq!(
            authorize(&Command::Help, CommandSource::PrivateMessage, Some(&nobody), "@"),
            Ok(())
        );
    }

    #[test]
    fn addressed_command_matches_bot_nickname() {
        let m = CaseMapping::Rfc1459;
        assert_eq!(
            addressed_command("voicebot", "VoiceBot: add-nickname bob", &m),
            Some("add-nickname bob")
        );
        assert_eq!(
            addressed_command("voicebot", "voicebot, help", &m),
            Some("help")
        );
        assert_eq!(addressed_command("voicebot", "hello: there", &m), None);
        assert_eq!(addressed_command("voicebot", "hi voicebot: x", &m), None);
        assert_eq!(addressed_command("voicebot", "no addressing", &m), None);
    }

    #[test]
    fn acknowledgements_distinguish_outcomes() {
        assert_eq!(
            acknowledge_add(IdentityKind::Nickname, AddOutcome::Added),
            "Nickname added."
        );
        assert_eq!(
            acknowledge_add(IdentityKind::Account, AddOutcome::AlreadyPresent),
            "Account is already managed."
        );
        assert_eq!(
            acknowledge_remove(IdentityKind::Account, RemoveOutcome::WasAbsent),
            "Account was not managed."
        );
    }

    #[test]
    fn chat_help_includes_source_when_configured() {
        assert_eq!(chat_help(None).len(), 1);
        let lines = chat_help(Some("https://example.org/voicebot"));
        assert_eq!(lines[1], "Source: https://example.org/voicebot");
    }

    #[test]
    fn throttle_caps_replies_and_forgets_idle_requesters() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut throttle = InvalidCommandThrottle::new(2, Duration::seconds(120));
        assert!(throttle.allow("eve", start));
        assert!(throttle.allow("eve", start));
        assert!(!throttle.allow("eve", start));

        throttle.reset("eve");
        assert!(throttle.allow("eve", start));

        assert!(throttle.allow("mallory", start));
        let later = start + Duration::seconds(121);
        assert!(throttle.allow("eve", later));
        assert_eq!(throttle.tracked(), 1);
    }
}
