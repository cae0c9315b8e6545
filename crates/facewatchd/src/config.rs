use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `max_placeholder_age_hours` (100 years).
pub const MAX_PLACEHOLDER_AGE_HOURS: u64 = 100 * 365 * 24;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Daemon configuration: TOML file first, then `FACEWATCH_*` environment
/// variables on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a face matches a Confirmed identity.
    pub match_threshold: f32,
    /// Minimum seconds between two accepted placeholder creations.
    pub new_face_cooldown_secs: u64,
    /// Minimum seconds between two notifications for the same label.
    pub notification_cooldown_secs: u64,
    /// Seconds a notification stays up before the consumer releases it.
    pub notification_display_secs: u64,
    /// Only important identities raise notifications.
    pub notify_only_important: bool,
    pub notifications_enabled: bool,
    /// Create placeholder identities for unmatched faces.
    pub auto_create_placeholders: bool,
    /// Resolve placeholders through the external recognition service.
    pub resolution_enabled: bool,
    /// Accept a new face while another placeholder is still resolving.
    pub allow_concurrent_new_faces: bool,
    pub recognition_url: String,
    pub recognition_timeout_secs: u64,
    pub resolution_workers: usize,
    pub resolution_queue_depth: usize,
    /// Unresolved placeholders older than this are deleted by the reaper.
    pub max_placeholder_age_hours: u64,
    pub reap_interval_secs: u64,
    /// Detection loop period.
    pub tick_interval_ms: u64,
    /// Face batches buffered between the D-Bus surface and the detection loop.
    pub face_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: facewatch_core::default_db_path(),
            match_threshold: 0.48,
            new_face_cooldown_secs: 2,
            notification_cooldown_secs: 30,
            notification_display_secs: 10,
            notify_only_important: true,
            notifications_enabled: true,
            auto_create_placeholders: true,
            resolution_enabled: true,
            allow_concurrent_new_faces: false,
            recognition_url: "http://localhost:5000/api/recognize_face".to_string(),
            recognition_timeout_secs: 10,
            resolution_workers: 2,
            resolution_queue_depth: 16,
            max_placeholder_age_hours: 24,
            reap_interval_secs: 3600,
            tick_interval_ms: 60,
            face_queue_depth: 32,
        }
    }
}

impl Config {
    /// Load from the config file (if present) and `FACEWATCH_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::info!(path = %path.display(), "loading config file");
                Self::from_toml(&text)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACEWATCH_*` overrides from the given lookup.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(path) = get("FACEWATCH_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(url) = get("FACEWATCH_RECOGNITION_URL") {
            self.recognition_url = url;
        }
        override_parsed(&get, "FACEWATCH_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&get, "FACEWATCH_NEW_FACE_COOLDOWN_SECS", &mut self.new_face_cooldown_secs);
        override_parsed(
            &get,
            "FACEWATCH_NOTIFICATION_COOLDOWN_SECS",
            &mut self.notification_cooldown_secs,
        );
        override_parsed(
            &get,
            "FACEWATCH_NOTIFICATION_DISPLAY_SECS",
            &mut self.notification_display_secs,
        );
        override_parsed(
            &get,
            "FACEWATCH_RECOGNITION_TIMEOUT_SECS",
            &mut self.recognition_timeout_secs,
        );
        override_parsed(&get, "FACEWATCH_RESOLUTION_WORKERS", &mut self.resolution_workers);
        override_parsed(&get, "FACEWATCH_RESOLUTION_QUEUE_DEPTH", &mut self.resolution_queue_depth);
        override_parsed(
            &get,
            "FACEWATCH_MAX_PLACEHOLDER_AGE_HOURS",
            &mut self.max_placeholder_age_hours,
        );
        override_parsed(&get, "FACEWATCH_REAP_INTERVAL_SECS", &mut self.reap_interval_secs);
        override_parsed(&get, "FACEWATCH_TICK_INTERVAL_MS", &mut self.tick_interval_ms);
        override_parsed(&get, "FACEWATCH_FACE_QUEUE_DEPTH", &mut self.face_queue_depth);
        override_flag(&get, "FACEWATCH_NOTIFY_ONLY_IMPORTANT", &mut self.notify_only_important);
        override_flag(&get, "FACEWATCH_NOTIFICATIONS_ENABLED", &mut self.notifications_enabled);
        override_flag(&get, "FACEWATCH_AUTO_CREATE_PLACEHOLDERS", &mut self.auto_create_placeholders);
        override_flag(&get, "FACEWATCH_RESOLUTION_ENABLED", &mut self.resolution_enabled);
        override_flag(
            &get,
            "FACEWATCH_ALLOW_CONCURRENT_NEW_FACES",
            &mut self.allow_concurrent_new_faces,
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(invalid("match_threshold", "must be a positive number"));
        }
        if self.resolution_workers == 0 {
            return Err(invalid("resolution_workers", "must be at least 1"));
        }
        if self.resolution_queue_depth == 0 {
            return Err(invalid("resolution_queue_depth", "must be at least 1"));
        }
        if self.face_queue_depth == 0 {
            return Err(invalid("face_queue_depth", "must be at least 1"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms", "must be at least 1"));
        }
        if self.reap_interval_secs == 0 {
            return Err(invalid("reap_interval_secs", "must be at least 1"));
        }
        if self.max_placeholder_age_hours > MAX_PLACEHOLDER_AGE_HOURS {
            return Err(ConfigError::Invalid {
                field: "max_placeholder_age_hours",
                reason: format!("must be at most {MAX_PLACEHOLDER_AGE_HOURS}"),
            });
        }
        if self.recognition_url.trim().is_empty() {
            return Err(invalid("recognition_url", "must not be empty"));
        }
        Ok(())
    }

    pub fn new_face_cooldown(&self) -> Duration {
        Duration::from_secs(self.new_face_cooldown_secs)
    }

    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_secs(self.notification_cooldown_secs)
    }

    pub fn notification_display(&self) -> Duration {
        Duration::from_secs(self.notification_display_secs)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_secs(self.recognition_timeout_secs)
    }

    /// Saturates at `chrono::Duration::MAX` for values `validate` would reject.
    pub fn max_placeholder_age(&self) -> chrono::Duration {
        i64::try_from(self.max_placeholder_age_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// `$FACEWATCH_CONFIG`, else `$XDG_CONFIG_HOME/facewatch/config.toml`.
fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FACEWATCH_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facewatch")
        .join("config.toml")
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn override_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = get(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
        }
    }
}

fn override_flag(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    if let Some(raw) = get(key) {
        *slot = raw.trim() != "0" && !raw.trim().eq_ignore_ascii_case("false");
    }
}
