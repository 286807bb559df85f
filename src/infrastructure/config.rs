use crate::domain::rewards::RewardPolicy;
use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const ENGINE_JSON: &str = "engine.json";
const CONFIG_SCHEMA: u64 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PomodoroDurations {
    pub focus_seconds: u64,
    pub break_seconds: u64,
    pub long_break_seconds: u64,
    /// Zero disables long breaks.
    pub long_break_every: u32,
}

impl Default for PomodoroDurations {
    fn default() -> Self {
        Self {
            focus_seconds: 1500,
            break_seconds: 300,
            long_break_seconds: 900,
            long_break_every: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub schema: u8,
    pub rewards: RewardPolicy,
    pub pomodoro: PomodoroDurations,
    pub away_threshold_seconds: u64,
    pub tick_interval_ms: u64,
    pub heartbeat_every_ticks: u32,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: CONFIG_SCHEMA as u8,
            rewards: RewardPolicy::default(),
            pomodoro: PomodoroDurations::default(),
            away_threshold_seconds: 30,
            tick_interval_ms: 1000,
            heartbeat_every_ticks: 10,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        self.rewards.validate().map_err(InfraError::InvalidConfig)?;
        if self.pomodoro.focus_seconds == 0 {
            return Err(InfraError::InvalidConfig(
                "pomodoro.focusSeconds must be > 0".to_string(),
            ));
        }
        if self.pomodoro.break_seconds == 0 {
            return Err(InfraError::InvalidConfig(
                "pomodoro.breakSeconds must be > 0".to_string(),
            ));
        }
        if self.pomodoro.long_break_every > 0 && self.pomodoro.long_break_seconds == 0 {
            return Err(InfraError::InvalidConfig(
                "pomodoro.longBreakSeconds must be > 0 when long breaks are enabled".to_string(),
            ));
        }
        if self.away_threshold_seconds == 0 {
            return Err(InfraError::InvalidConfig(
                "awayThresholdSeconds must be > 0".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(InfraError::InvalidConfig("tickIntervalMs must be > 0".to_string()));
        }
        if self.heartbeat_every_ticks == 0 {
            return Err(InfraError::InvalidConfig(
                "heartbeatEveryTicks must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies `FOCUSFORGE_*` overrides resolved through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), InfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_lookup_u64(&lookup, "FOCUSFORGE_AWAY_THRESHOLD_SECONDS")? {
            self.away_threshold_seconds = value;
        }
        if let Some(value) = parse_lookup_u64(&lookup, "FOCUSFORGE_SESSION_FLOOR_SECONDS")? {
            self.rewards.session_floor_seconds = value;
        }
        if let Some(value) = parse_lookup_u64(&lookup, "FOCUSFORGE_FOCUS_SECONDS")? {
            self.pomodoro.focus_seconds = value;
        }
        if let Some(value) = parse_lookup_u64(&lookup, "FOCUSFORGE_BREAK_SECONDS")? {
            self.pomodoro.break_seconds = value;
        }
        if let Some(level) = optional_lookup_value(&lookup, &["FOCUSFORGE_LOG_LEVEL"]) {
            self.log_level = level;
        }
        Ok(())
    }
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(ENGINE_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&EngineConfig::default())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != CONFIG_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_engine_config(config_dir: &Path) -> Result<EngineConfig, InfraError> {
    load_engine_config_with_lookup(config_dir, |key| std::env::var(key).ok())
}

pub fn load_engine_config_with_lookup<F>(
    config_dir: &Path,
    lookup: F,
) -> Result<EngineConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = read_config(&config_dir.join(ENGINE_JSON))?;
    let mut config: EngineConfig = serde_json::from_value(raw)?;
    config.apply_overrides(lookup)?;
    config.validate()?;
    Ok(config)
}

fn parse_lookup_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, &[key])
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| {
                InfraError::InvalidConfig(format!("{key} must be a non-negative integer, got {raw}"))
            })
        })
        .transpose()
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DIR: AtomicUsize = AtomicUsize::new(0);

    struct TempConfigDir {
        path: PathBuf,
    }

    impl TempConfigDir {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DIR.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "focusforge-config-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp config dir");
            Self { path }
        }
    }

    impl Drop for TempConfigDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn default_config_is_written_once_and_loads() {
        let dir = TempConfigDir::new();
        ensure_default_configs(&dir.path).expect("write defaults");
        let config = load_engine_config_with_lookup(&dir.path, |_| None).expect("load config");
        assert_eq!(config, EngineConfig::default());

        let mut edited = config.clone();
        edited.away_threshold_seconds = 45;
        fs::write(
            dir.path.join(ENGINE_JSON),
            serde_json::to_string_pretty(&edited).expect("serialize"),
        )
        .expect("write edited config");
        ensure_default_configs(&dir.path).expect("defaults are not rewritten");
        let reloaded = load_engine_config_with_lookup(&dir.path, |_| None).expect("reload");
        assert_eq!(reloaded.away_threshold_seconds, 45);
    }

    #[test]
    fn config_file_uses_camel_case_keys() {
        let json = serde_json::to_value(EngineConfig::default()).expect("serialize");
        assert_eq!(json["schema"], 1);
        assert_eq!(json["awayThresholdSeconds"], 30);
        assert_eq!(json["rewards"]["sessionFloorSeconds"], 10);
        assert_eq!(json["pomodoro"]["focusSeconds"], 1500);
    }

    #[test]
    fn unsupported_schema_is_rejected() {
        let dir = TempConfigDir::new();
        fs::write(dir.path.join(ENGINE_JSON), r#"{ "schema": 2 }"#).expect("write config");
        match load_engine_config_with_lookup(&dir.path, |_| None) {
            Err(InfraError::InvalidConfig(message)) => assert!(message.contains("unsupported schema")),
            other => panic!("expected invalid config error, got {other:?}"),
        }
    }

    #[test]
    fn env_overrides_are_applied() {
        let dir = TempConfigDir::new();
        ensure_default_configs(&dir.path).expect("write defaults");
        let config = load_engine_config_with_lookup(&dir.path, |key| match key {
            "FOCUSFORGE_AWAY_THRESHOLD_SECONDS" => Some("60".to_string()),
            "FOCUSFORGE_FOCUS_SECONDS" => Some(" 3000 ".to_string()),
            "FOCUSFORGE_LOG_LEVEL" => Some("debug".to_string()),
            _ => None,
        })
        .expect("load config");
        assert_eq!(config.away_threshold_seconds, 60);
        assert_eq!(config.pomodoro.focus_seconds, 3000);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.pomodoro.break_seconds, 300);
    }

    #[test]
    fn malformed_override_reports_key() {
        let mut config = EngineConfig::default();
        let result = config.apply_overrides(|key| match key {
            "FOCUSFORGE_SESSION_FLOOR_SECONDS" => Some("ten".to_string()),
            _ => None,
        });
        match result {
            Err(InfraError::InvalidConfig(message)) => {
                assert!(message.contains("FOCUSFORGE_SESSION_FLOOR_SECONDS"))
            }
            other => panic!("expected invalid config error, got {other:?}"),
        }
    }

    #[test]
    fn zero_durations_fail_validation() {
        let mut config = EngineConfig::default();
        config.pomodoro.focus_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.away_threshold_seconds = 0;
        assert!(config.validate().is_err());
    }
}
