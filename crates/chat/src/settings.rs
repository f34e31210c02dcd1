use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_transport::{ReplyMode, TransportConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::session::SessionConfig;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";
pub const ENV_PREFIX: &str = "PARLEY_";
pub const DEFAULT_GREETING: &str = "Hi, I can answer questions about HR policies.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub reply_mode: ReplyMode,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_first_byte_timeout_ms")]
    pub first_byte_timeout_ms: u64,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    /// An empty greeting turns it off.
    #[serde(default = "default_greeting")]
    pub greeting: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            reply_mode: ReplyMode::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            first_byte_timeout_ms: default_first_byte_timeout_ms(),
            idle_timeout_ms: None,
            greeting: default_greeting(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        let base_url = self.base_url.trim().trim_end_matches('/');
        self.base_url = if base_url.is_empty() {
            default_base_url()
        } else {
            base_url.to_string()
        };

        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = default_connect_timeout_ms();
        }
        if self.first_byte_timeout_ms == 0 {
            self.first_byte_timeout_ms = default_first_byte_timeout_ms();
        }
        self.idle_timeout_ms = self.idle_timeout_ms.filter(|timeout| *timeout > 0);
        self.greeting = self
            .greeting
            .map(|greeting| greeting.trim().to_string())
            .filter(|greeting| !greeting.is_empty());

        self
    }

    /// Layers defaults, the JSON file at `path` and `PARLEY_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, SettingsError> {
        figment
            .extract::<Settings>()
            .map(Settings::normalized)
            .context(ExtractSnafu {
                stage: "extract-settings",
            })
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new(self.base_url.as_str(), self.reply_mode)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            first_byte_timeout: Duration::from_millis(self.first_byte_timeout_ms),
            idle_timeout: self.idle_timeout_ms.map(Duration::from_millis),
            greeting: self.greeting.clone(),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    /// `PARLEY_CONFIG` when set, otherwise the per-user config directory.
    pub fn default_config_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_config_dir().join(SETTINGS_FILE_NAME))
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Re-reads every layer and swaps in the result.
    pub fn reload(&self) -> Arc<Settings> {
        let settings = Arc::new(Self::load_from(&self.config_path));
        self.settings.store(Arc::clone(&settings));
        settings
    }

    fn load_from(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(
                path = ?path,
                "settings file not found, using defaults and environment"
            );
        }

        match Settings::from_figment(&Settings::figment(path)) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to load settings, using defaults"
                );
                Settings::default()
            }
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to extract settings on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_greeting() -> Option<String> {
    Some(DEFAULT_GREETING.to_string())
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_first_byte_timeout_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn file_figment(contents: &str) -> (tempfile::NamedTempFile, Figment) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(file.path()));
        (file, figment)
    }

    #[test]
    fn defaults_target_local_backend_with_json_replies() {
        let settings = Settings::default();

        assert_eq!(settings.base_url, "http://127.0.0.1:8000");
        assert_eq!(settings.reply_mode, ReplyMode::Json);
        assert_eq!(
            settings.transport_config().endpoint_url(),
            "http://127.0.0.1:8000/chat"
        );
        assert_eq!(
            settings.session_config().greeting.as_deref(),
            Some(DEFAULT_GREETING)
        );
        assert_eq!(
            settings.session_config().first_byte_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(settings.session_config().idle_timeout, None);
    }

    #[test]
    fn json_file_overrides_defaults() {
        let (_file, figment) = file_figment(
            r#"{
                "base_url": " https://hr.example.com/ ",
                "reply_mode": "stream",
                "idle_timeout_ms": 2500,
                "greeting": "Ask me about leave."
            }"#,
        );

        let settings = Settings::from_figment(&figment).unwrap();

        assert_eq!(settings.base_url, "https://hr.example.com");
        assert_eq!(settings.reply_mode, ReplyMode::EventStream);
        assert_eq!(settings.connect_timeout_ms, 5_000);
        assert_eq!(
            settings.transport_config().endpoint_url(),
            "https://hr.example.com/chat-stream"
        );
        assert_eq!(
            settings.session_config().idle_timeout,
            Some(Duration::from_millis(2500))
        );
        assert_eq!(
            settings.greeting.as_deref(),
            Some("Ask me about leave.")
        );
    }

    #[test]
    fn normalization_restores_unusable_values() {
        let settings = Settings {
            base_url: "   ".to_string(),
            connect_timeout_ms: 0,
            first_byte_timeout_ms: 0,
            idle_timeout_ms: Some(0),
            ..Settings::default()
        }
        .normalized();

        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn blank_greeting_turns_greeting_off() {
        let (_file, figment) = file_figment(r#"{ "greeting": "  " }"#);

        let settings = Settings::from_figment(&figment).unwrap();

        assert_eq!(settings.greeting, None);
        assert_eq!(settings.session_config().greeting, None);
    }

    #[test]
    fn invalid_reply_mode_fails_extraction() {
        let (_file, figment) = file_figment(r#"{ "reply_mode": "websocket" }"#);

        assert!(Settings::from_figment(&figment).is_err());
    }

    #[test]
    fn store_falls_back_to_defaults_on_broken_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();

        let store = SettingsStore::new(file.path().to_path_buf());

        assert_eq!(store.config_path(), file.path());
        assert_eq!(store.settings().reply_mode, ReplyMode::Json);
        assert_eq!(store.settings().connect_timeout_ms, 5_000);
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "first_byte_timeout_ms": 1000 }"#).unwrap();
        let store = SettingsStore::new(file.path().to_path_buf());
        assert_eq!(store.settings().first_byte_timeout_ms, 1_000);

        std::fs::write(file.path(), r#"{ "first_byte_timeout_ms": 2000 }"#).unwrap();

        assert_eq!(store.reload().first_byte_timeout_ms, 2_000);
        assert_eq!(store.settings().first_byte_timeout_ms, 2_000);
    }
}
