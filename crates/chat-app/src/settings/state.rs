use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_chat::SessionConfig;
use murmur_llm::{BackendConfig, DEFAULT_MAX_TOKENS, DEFAULT_OPENAI_MODEL};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "history.sqlite3";
pub const ENV_PREFIX: &str = "MURMUR_";
pub const API_KEY_FALLBACK_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Blank means the backend's own default endpoint.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub preamble: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub scripted_reply: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            preamble: String::new(),
            temperature: None,
            database_path: None,
            scripted_reply: String::new(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(&self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model = non_blank_or(&self.model, default_model);
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        self.preamble = self.preamble.trim().to_string();
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        self
    }

    pub fn backend_config(&self) -> BackendConfig {
        let mut config = BackendConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
            .with_model(&self.model)
            .with_max_tokens(self.max_tokens);
        if !self.scripted_reply.trim().is_empty() {
            config = config.with_scripted_reply(&self.scripted_reply);
        }
        config
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default()
            .with_model(&self.model)
            .with_max_tokens(self.max_tokens);
        if !self.preamble.is_empty() {
            config = config.with_preamble(&self.preamble);
        }
        if let Some(temperature) = self.temperature {
            config = config.with_temperature(temperature);
        }
        config
    }

    pub fn database_location(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }
}

/// Layered settings source: defaults, then the JSON file, then `MURMUR_*`
/// environment variables.
pub struct SettingsStore {
    config_path: PathBuf,
    env_prefix: String,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    pub fn with_env_prefix(mut self, env_prefix: impl Into<String>) -> Self {
        self.env_prefix = env_prefix.into();
        self
    }

    pub fn load(&self) -> Result<Settings, SettingsError> {
        if !self.config_path.exists() {
            tracing::info!(path = ?self.config_path, "settings file not found, using defaults");
        }

        let mut settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(&self.config_path))
            .merge(Env::prefixed(&self.env_prefix))
            .extract::<Settings>()
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: self.config_path.clone(),
            })?;

        if settings.api_key.trim().is_empty()
            && let Ok(api_key) = std::env::var(API_KEY_FALLBACK_ENV)
        {
            settings.api_key = api_key;
        }

        Ok(settings.normalized())
    }

    /// Like [`SettingsStore::load`], but a broken settings source degrades to
    /// defaults instead of stopping the program.
    pub fn load_or_default(&self) -> Settings {
        match self.load() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(stage = error.stage(), "{error}. using defaults");
                Settings::default()
            }
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to read settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

impl SettingsError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Extract { stage, .. } => stage,
        }
    }
}

pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".murmur"))
        .join(DATABASE_FILE_NAME)
}

fn non_blank_or(value: &str, default: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        default()
    } else {
        value.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;

    // A prefix nothing in the test environment sets, so real MURMUR_* vars do not leak in.
    const TEST_PREFIX: &str = "MURMUR_SETTINGS_TEST_UNSET_";

    fn store_for(path: PathBuf) -> SettingsStore {
        SettingsStore::new(path).with_env_prefix(TEST_PREFIX)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let directory = tempfile::tempdir().expect("tempdir");
        let settings = store_for(directory.path().join("absent.json"))
            .load()
            .expect("load");

        assert_eq!(settings.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(settings.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(settings.max_tokens, 1000);
        assert!(settings.database_path.is_none());
    }

    #[test]
    fn file_values_override_defaults_and_are_trimmed() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "provider_id": " http ",
                "endpoint": " http://127.0.0.1:9000 ",
                "model": "   ",
                "max_tokens": 256,
                "database_path": "/tmp/murmur-test/history.sqlite3"
            }"#,
        )
        .expect("write settings");

        let settings = store_for(path).load().expect("load");
        assert_eq!(settings.provider_id, "http");
        assert_eq!(settings.endpoint, "http://127.0.0.1:9000");
        assert_eq!(settings.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(settings.max_tokens, 256);
        assert_eq!(
            settings.database_location(),
            PathBuf::from("/tmp/murmur-test/history.sqlite3")
        );
    }

    #[test]
    fn malformed_file_is_an_error_and_degrades_to_defaults() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").expect("write settings");

        let store = store_for(path);
        assert!(matches!(store.load(), Err(SettingsError::Extract { .. })));
        assert_eq!(store.load_or_default(), Settings::default());
    }

    #[test]
    fn blank_values_normalize_to_defaults() {
        let settings = Settings {
            provider_id: "  ".to_string(),
            max_tokens: 0,
            preamble: "  be brief  ".to_string(),
            database_path: Some(PathBuf::new()),
            ..Settings::default()
        }
        .normalized();

        assert_eq!(settings.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(settings.preamble, "be brief");
        assert_eq!(settings.database_location(), default_database_path());
    }

    #[test]
    fn settings_flow_into_backend_and_session_configs() {
        let settings = Settings {
            provider_id: "scripted".to_string(),
            model: "tiny".to_string(),
            max_tokens: 64,
            preamble: "be brief".to_string(),
            scripted_reply: "canned".to_string(),
            ..Settings::default()
        };

        let backend = settings.backend_config();
        assert_eq!(backend.provider_id, "scripted");
        assert_eq!(backend.model_id.as_deref(), Some("tiny"));
        assert_eq!(backend.max_tokens, Some(64));
        assert_eq!(backend.scripted_reply.as_deref(), Some("canned"));

        let session = settings.session_config();
        assert_eq!(session.model_id.as_deref(), Some("tiny"));
        assert_eq!(session.preamble.as_deref(), Some("be brief"));
        assert_eq!(session.max_tokens, Some(64));
    }
}
