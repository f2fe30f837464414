use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tewahedo_llm::{
    CompletionSettings, DEFAULT_GEMINI_MODEL, GEMINI_PROVIDER_ID, ProviderConfig, RigBackend,
    Sampling,
};

use crate::catalog::SYSTEM_INSTRUCTION;

pub const SETTINGS_DIRECTORY_NAME: &str = "tewahedo";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "TEWAHEDO_";
/// Checked in order when no API key is configured.
pub const API_KEY_FALLBACK_VARS: &[&str] = &["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Overrides the provider's base URL when non-empty.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Replaces the built-in system instruction when set.
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub sampling: Sampling,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: String::new(),
            model: default_model(),
            system_instruction: None,
            sampling: Sampling::default(),
        }
    }
}

impl ChatSettings {
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
        ))
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn completion_settings(&self) -> CompletionSettings {
        let instruction = self
            .system_instruction
            .clone()
            .unwrap_or_else(|| SYSTEM_INSTRUCTION.to_string());

        CompletionSettings::new(self.model.clone())
            .with_system_instruction(instruction)
            .with_sampling(self.sampling)
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_ascii_lowercase()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model = if self.model.trim().is_empty() {
            // Keep the model valid for whichever backend was picked.
            RigBackend::from_provider_id(&self.provider_id)
                .map(|backend| backend.default_model().to_string())
                .unwrap_or_else(default_model)
        } else {
            self.model.trim().to_string()
        };
        self.system_instruction = self
            .system_instruction
            .map(|instruction| instruction.trim().to_string())
            .filter(|instruction| !instruction.is_empty());

        self
    }
}

pub struct SettingsStore {
    settings: ArcSwap<ChatSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tewahedo"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file, then `TEWAHEDO_*` variables; the API key falls back
    /// to the conventional provider variables.
    fn load_from_disk(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut settings = match figment.extract::<ChatSettings>() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        };

        if settings.api_key.trim().is_empty()
            && let Some(api_key) = api_key_from_environment()
        {
            settings.api_key = api_key;
        }

        settings.normalized()
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn api_key_from_environment() -> Option<String> {
    API_KEY_FALLBACK_VARS.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn default_provider_id() -> String {
    GEMINI_PROVIDER_ID.to_string()
}

fn default_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use tewahedo_llm::DEFAULT_OPENAI_MODEL;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let store = SettingsStore::new(jail.directory().join(SETTINGS_FILE_NAME));
            let settings = store.settings();

            assert_eq!(*settings, ChatSettings::default());
            assert!(!settings.is_valid());
            assert!(settings.to_provider_config().is_none());
            Ok(())
        });
    }

    #[test]
    fn file_and_environment_layer_over_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{ "model": "gemini-from-file", "sampling": { "temperature": 0.2 } }"#,
            )?;
            jail.set_env("TEWAHEDO_MODEL", "gemini-from-env");
            jail.set_env("TEWAHEDO_SAMPLING__TOP_K", "40");

            let store = SettingsStore::new(jail.directory().join(SETTINGS_FILE_NAME));
            let settings = store.settings();

            assert_eq!(settings.model, "gemini-from-env");
            assert_eq!(settings.sampling.temperature, Some(0.2));
            assert_eq!(settings.sampling.top_p, Some(0.95));
            assert_eq!(settings.sampling.top_k, Some(40));
            Ok(())
        });
    }

    #[test]
    fn api_key_falls_back_to_provider_variables() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("API_KEY", "generic-key");
            let path = jail.directory().join(SETTINGS_FILE_NAME);
            assert_eq!(SettingsStore::new(path.clone()).settings().api_key, "generic-key");

            jail.set_env("GEMINI_API_KEY", " gemini-key ");
            let settings = SettingsStore::new(path).settings();
            assert_eq!(settings.api_key, "gemini-key");
            assert!(settings.is_valid());
            Ok(())
        });
    }

    #[test]
    fn update_normalizes_and_persists() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let path = jail.directory().join("nested").join(SETTINGS_FILE_NAME);
            let store = SettingsStore::new(path.clone());

            store
                .update(ChatSettings {
                    provider_id: " OpenAI ".to_string(),
                    api_key: " sk-test ".to_string(),
                    model: "  ".to_string(),
                    system_instruction: Some("   ".to_string()),
                    ..ChatSettings::default()
                })
                .expect("settings persist");

            let settings = store.settings();
            assert_eq!(settings.provider_id, "openai");
            assert_eq!(settings.api_key, "sk-test");
            assert_eq!(settings.model, DEFAULT_OPENAI_MODEL);
            assert_eq!(settings.system_instruction, None);

            let reloaded = SettingsStore::new(path);
            assert_eq!(*reloaded.settings(), *settings);
            Ok(())
        });
    }

    #[test]
    fn completion_settings_use_builtin_instruction_by_default() {
        let completion = ChatSettings::default().completion_settings();

        assert_eq!(completion.model_id, DEFAULT_GEMINI_MODEL);
        assert_eq!(
            completion.system_instruction.as_deref(),
            Some(SYSTEM_INSTRUCTION)
        );
        assert_eq!(completion.sampling, Sampling::default());
    }
}
