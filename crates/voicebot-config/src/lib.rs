use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub adapter: Adapter,
    pub bot: Bot,
    pub store: Store,
    #[serde(default)]
    pub sweep: Sweep,
    #[serde(default)]
    pub console: Console,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

/// Where mode changes and replies are sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adapter {
    pub endpoint: String,
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub nickname: String,
    pub channel: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_operator_prefixes")]
    pub operator_prefixes: String,
    #[serde(default)]
    pub force_identified: bool,
    #[serde(default = "default_casemapping")]
    pub casemapping: String,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl Bot {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default = "default_nicknames_path")]
    pub nicknames_path: String,
    #[serde(default = "default_accounts_path")]
    pub accounts_path: String,
    #[serde(default)]
    pub prune_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweep {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

impl Default for Sweep {
    fn default() -> Self {
        Self {
            interval_secs: None,
            min_interval_secs: default_min_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Console {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_retry_max_attempts() -> usize {
    1
}

fn default_idle_timeout_secs() -> u64 {
    86_400
}

fn default_operator_prefixes() -> String {
    "@".to_string()
}

fn default_casemapping() -> String {
    "rfc1459".to_string()
}

fn default_data_path() -> String {
    "voicebot-data".to_string()
}

fn default_nicknames_path() -> String {
    "nicknames".to_string()
}

fn default_accounts_path() -> String {
    "accounts".to_string()
}

fn default_min_interval_secs() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Largest second count a millisecond-precision signed duration can hold.
pub const MAX_DURATION_SECS: u64 = i64::MAX as u64 / 1000;

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if !matches!(cfg.store.kind.as_str(), "memory" | "json" | "sqlite") {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, json, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind != "sqlite" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.sqlite_path is not supported when store.type={}",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.store.kind == "json" && cfg.store.data_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "store.data_path is required when store.type=json".to_string(),
        ));
    }
    if cfg.store.nicknames_path.trim().is_empty() || cfg.store.accounts_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "store.nicknames_path and store.accounts_path must not be empty".to_string(),
        ));
    }
    if cfg.bot.idle_timeout_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "bot.idle_timeout_secs must be >= 1".to_string(),
        ));
    }
    if cfg.bot.idle_timeout_secs > MAX_DURATION_SECS {
        return Err(ConfigError::UnsupportedConfig(
            "bot.idle_timeout_secs is out of range".to_string(),
        ));
    }
    if cfg
        .store
        .prune_grace_secs
        .is_some_and(|secs| secs > MAX_DURATION_SECS)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.prune_grace_secs is out of range".to_string(),
        ));
    }
    if cfg.bot.nickname.trim().is_empty() || cfg.bot.nickname.contains(char::is_whitespace) {
        return Err(ConfigError::UnsupportedConfig(
            "bot.nickname must be a single non-empty word".to_string(),
        ));
    }
    if cfg.bot.channel.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "bot.channel must not be empty".to_string(),
        ));
    }
    if cfg.bot.operator_prefixes.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "bot.operator_prefixes must list at least one prefix".to_string(),
        ));
    }
    if !matches!(
        cfg.bot.casemapping.as_str(),
        "ascii" | "rfc1459" | "strict-rfc1459"
    ) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "bot.casemapping={} is not implemented; supported: ascii, rfc1459, strict-rfc1459",
            cfg.bot.casemapping
        )));
    }
    if cfg.adapter.endpoint.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "adapter.endpoint must not be empty".to_string(),
        ));
    }
    if cfg.adapter.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "adapter.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.adapter.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "adapter.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.sweep.interval_secs == Some(0) || cfg.sweep.min_interval_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "sweep intervals must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("voicebot-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r##"
server:
  listen_addr: "127.0.0.1:0"

adapter:
  endpoint: "http://127.0.0.1:9000"
  timeout_ms: 500

bot:
  nickname: "voicebot"
  channel: "#lounge"
  idle_timeout_secs: 3600

store:
  type: "json"
  data_path: "./voicebot-data"
"##
        .to_string()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.bot.operator_prefixes, "@");
        assert_eq!(cfg.bot.casemapping, "rfc1459");
        assert!(!cfg.bot.force_identified);
        assert_eq!(cfg.bot.idle_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.store.nicknames_path, "nicknames");
        assert_eq!(cfg.store.accounts_path, "accounts");
        assert_eq!(cfg.adapter.retry_max_attempts, 1);
        assert_eq!(cfg.sweep.min_interval_secs, 1);
        assert!(cfg.console.enabled);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"json\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_for_json_store() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"json\"",
            "type: \"json\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_store_type() {
        let path = write_temp_config(&base_yaml().replace("type: \"json\"", "type: \"redis\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_idle_timeout() {
        let path = write_temp_config(
            &base_yaml().replace("idle_timeout_secs: 3600", "idle_timeout_secs: 0"),
        );
        let err = load_and_validate(&path).expect_err("expected invalid config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_missing_bot_section() {
        let yaml = base_yaml()
            .replace("bot:\n", "")
            .replace("  nickname: \"voicebot\"\n", "")
            .replace("  channel: \"#lounge\"\n", "")
            .replace("  idle_timeout_secs: 3600\n", "");
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected schema failure");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::Parse(_)
        ));
    }

    #[test]
    fn runtime_checks_reject_unknown_casemapping() {
        let path = write_temp_config(&base_yaml());
        let mut cfg = load_and_validate(&path).unwrap();
        cfg.bot.casemapping = "unicode".to_string();
        assert!(matches!(
            validate_runtime_support(&cfg),
            Err(ConfigError::UnsupportedConfig(_))
        ));
        cfg.bot.casemapping = "ascii".to_string();
        cfg.adapter.retry_max_attempts = 0;
        assert!(validate_runtime_support(&cfg).is_err());
    }

    #[test]
    fn rejects_out_of_range_grace_period() {
        let huge = base_yaml().replace(
            "data_path: \"./voicebot-data\"",
            "data_path: \"./voicebot-data\"\n  prune_grace_secs: 10000000000000000",
        );
        let err = load_and_validate(&write_temp_config(&huge)).expect_err("expected invalid config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));

        let mut cfg = load_and_validate(&write_temp_config(&base_yaml())).unwrap();
        cfg.store.prune_grace_secs = Some(u64::MAX);
        assert!(matches!(
            validate_runtime_support(&cfg),
            Err(ConfigError::UnsupportedConfig(_))
        ));
        cfg.store.prune_grace_secs = Some(MAX_DURATION_SECS);
        assert!(validate_runtime_support(&cfg).is_ok());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_and_validate("/nonexistent/voicebot.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
