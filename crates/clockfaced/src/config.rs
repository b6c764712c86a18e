use chrono::{FixedOffset, NaiveTime, Timelike};
use clockface_core::ShiftPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShiftConfig {
    /// Local shift start, `HH:MM` or `HH:MM:SS`.
    pub start: String,
    pub grace_minutes: u32,
    pub end: String,
    /// Check-outs earlier than this many minutes before `end` are early leave.
    pub early_leave_minutes: u32,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            start: "09:00".into(),
            grace_minutes: 10,
            end: "17:00".into(),
            early_leave_minutes: 0,
        }
    }
}

/// Daemon configuration: TOML file, then `CLOCKFACE_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: BusKind,
    /// Embedding length the store is opened with; must match the extractor.
    pub embedding_dim: usize,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Required lead of the best employee over the runner-up.
    pub min_margin: f32,
    /// Enrollment samples below this capture quality are dropped.
    pub quality_floor: f32,
    pub min_samples: usize,
    pub max_embeddings_per_employee: usize,
    /// Time budget for a verify request; past it no attendance change is made.
    pub verify_timeout_secs: u64,
    pub lock_timeout_ms: u64,
    /// OS threads serving engine requests.
    pub engine_workers: usize,
    /// Offset of the local calendar from UTC.
    pub utc_offset_minutes: i32,
    pub shift: ShiftConfig,
    /// 64 hex characters; embeddings are sealed at rest when set.
    pub embedding_key_hex: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("clockface");

        Self {
            db_path: data_dir.join("clockface.db"),
            bus: BusKind::Session,
            embedding_dim: 64,
            similarity_threshold: 0.6,
            min_margin: 0.05,
            quality_floor: 0.5,
            min_samples: 3,
            max_embeddings_per_employee: 5,
            verify_timeout_secs: 5,
            lock_timeout_ms: 2000,
            engine_workers: 4,
            utc_offset_minutes: 7 * 60,
            shift: ShiftConfig::default(),
            embedding_key_hex: None,
        }
    }
}

impl Config {
    /// Load from `CLOCKFACE_CONFIG` (or the XDG default path, if present),
    /// then apply process environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CLOCKFACE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());

        let mut config = if path.exists() {
            tracing::info!(path = %path.display(), "loading config file");
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `CLOCKFACE_*` variables. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);
        if let Some(path) = lookup("CLOCKFACE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        env.set("CLOCKFACE_BUS", &mut self.bus);
        env.set("CLOCKFACE_EMBEDDING_DIM", &mut self.embedding_dim);
        env.set("CLOCKFACE_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env.set("CLOCKFACE_MIN_MARGIN", &mut self.min_margin);
        env.set("CLOCKFACE_QUALITY_FLOOR", &mut self.quality_floor);
        env.set("CLOCKFACE_MIN_SAMPLES", &mut self.min_samples);
        env.set("CLOCKFACE_MAX_EMBEDDINGS", &mut self.max_embeddings_per_employee);
        env.set("CLOCKFACE_VERIFY_TIMEOUT_SECS", &mut self.verify_timeout_secs);
        env.set("CLOCKFACE_LOCK_TIMEOUT_MS", &mut self.lock_timeout_ms);
        env.set("CLOCKFACE_ENGINE_WORKERS", &mut self.engine_workers);
        env.set("CLOCKFACE_UTC_OFFSET_MINUTES", &mut self.utc_offset_minutes);
        if let Some(start) = lookup("CLOCKFACE_SHIFT_START") {
            self.shift.start = start;
        }
        env.set("CLOCKFACE_SHIFT_GRACE_MINUTES", &mut self.shift.grace_minutes);
        if let Some(end) = lookup("CLOCKFACE_SHIFT_END") {
            self.shift.end = end;
        }
        env.set("CLOCKFACE_SHIFT_EARLY_LEAVE_MINUTES", &mut self.shift.early_leave_minutes);
        if let Some(key) = lookup("CLOCKFACE_EMBEDDING_KEY") {
            self.embedding_key_hex = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if self.min_margin < 0.0 {
            return Err(ConfigError::Invalid("min_margin must not be negative".into()));
        }
        if self.min_samples == 0 || self.max_embeddings_per_employee == 0 || self.engine_workers == 0 {
            return Err(ConfigError::Invalid(
                "min_samples, max_embeddings_per_employee and engine_workers must be at least 1".into(),
            ));
        }
        self.shift_policy()?;
        self.utc_offset()?;
        Ok(())
    }

    /// The early-leave window must end at or after midnight of the same day.
    pub fn shift_policy(&self) -> Result<ShiftPolicy, ConfigError> {
        let end = parse_time(&self.shift.end)?;
        let early_leave_secs = u64::from(self.shift.early_leave_minutes) * 60;
        if early_leave_secs > u64::from(end.num_seconds_from_midnight()) {
            return Err(ConfigError::Invalid(format!(
                "shift.early_leave_minutes {} reaches past midnight before shift end {}",
                self.shift.early_leave_minutes, self.shift.end
            )));
        }
        Ok(ShiftPolicy::new(
            parse_time(&self.shift.start)?,
            self.shift.grace_minutes,
            end,
            self.shift.early_leave_minutes,
        ))
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::Invalid(format!("utc_offset_minutes {} out of range", self.utc_offset_minutes))
            })
    }

    pub fn verify_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn set<T: FromStr>(&self, key: &str, field: &mut T) {
        if let Some(value) = (self.0)(key) {
            match value.parse() {
                Ok(v) => *field = v,
                Err(_) => tracing::warn!(key, value = %value, "ignoring unparseable environment override"),
            }
        }
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("clockface/config.toml")
}

fn parse_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::Invalid(format!("invalid time of day: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.embedding_dim, 64);
        assert_eq!(c.similarity_threshold, 0.6);
        assert_eq!(c.min_samples, 3);
        assert_eq!(c.utc_offset().unwrap().local_minus_utc(), 7 * 3600);
        assert_eq!(c.shift_policy().unwrap(), ShiftPolicy::default());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_toml_partial_file() {
        let c: Config = toml::from_str(
            r#"
            db_path = "/var/lib/clockface/db.sqlite"
            bus = "system"
            similarity_threshold = 0.7

            [shift]
            start = "08:30"
            grace_minutes = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.bus, BusKind::System);
        assert_eq!(c.similarity_threshold, 0.7);
        assert_eq!(c.min_margin, 0.05);
        assert_eq!(c.shift.end, "17:00");
        let p = c.shift_policy().unwrap();
        assert_eq!(p.start, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CLOCKFACE_SIMILARITY_THRESHOLD", "0.75"),
            ("CLOCKFACE_BUS", "system"),
            ("CLOCKFACE_SHIFT_START", "07:45:30"),
            ("CLOCKFACE_MIN_SAMPLES", "not-a-number"),
            ("CLOCKFACE_DB_PATH", "/tmp/cf.db"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(c.similarity_threshold, 0.75);
        assert_eq!(c.bus, BusKind::System);
        assert_eq!(c.min_samples, 3);
        assert_eq!(c.db_path, PathBuf::from("/tmp/cf.db"));
        assert_eq!(
            c.shift_policy().unwrap().start,
            NaiveTime::from_hms_opt(7, 45, 30).unwrap()
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut c = Config::default();
        c.shift.end = "25:00".into();
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.utc_offset_minutes = 24 * 60;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.similarity_threshold = 1.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_extreme_utc_offset_rejected() {
        let mut c = Config::default();
        c.utc_offset_minutes = i32::MAX;
        assert!(matches!(c.utc_offset(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.apply_env(|k| (k == "CLOCKFACE_UTC_OFFSET_MINUTES").then(|| i32::MIN.to_string()));
        assert_eq!(c.utc_offset_minutes, i32::MIN);
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_early_leave_past_midnight_rejected() {
        let mut c = Config::default();
        c.shift.end = "00:30".into();
        c.shift.early_leave_minutes = 45;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        c.shift.early_leave_minutes = 30;
        let policy = c.shift_policy().unwrap();
        assert_eq!(policy.early_leave_before, NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }
}
