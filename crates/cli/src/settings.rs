use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use opas_client::{
    BearerAuth, FollowUp, FunctionCatalog, HttpTransport, NoAuth, SessionOptions, chat_endpoint,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_ASSISTANT_ID: &str = "hooli";
pub const SETTINGS_DIRECTORY_NAME: &str = "opas";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "OPAS_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_assistant_id")]
    pub assistant_id: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub autorun: Option<bool>,
    #[serde(default)]
    pub force_select_function: Option<String>,
    /// Printed above an empty conversation.
    #[serde(default)]
    pub welcome_message: Option<String>,
    /// Suggestions offered while the conversation is empty.
    #[serde(default)]
    pub starter_prompts: Vec<FollowUp>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            assistant_id: default_assistant_id(),
            api_token: String::new(),
            stream: default_stream(),
            autorun: None,
            force_select_function: None,
            welcome_message: None,
            starter_prompts: Vec::new(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.base_url = match self.base_url.trim().trim_end_matches('/') {
            "" => default_base_url(),
            base_url => base_url.to_string(),
        };
        self.assistant_id = match self.assistant_id.trim() {
            "" => default_assistant_id(),
            assistant_id => assistant_id.to_string(),
        };
        self.api_token = self.api_token.trim().to_string();
        self.force_select_function = self
            .force_select_function
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        self.welcome_message = self
            .welcome_message
            .filter(|message| !message.trim().is_empty());
        self.starter_prompts
            .retain(|prompt| !prompt.prompt.trim().is_empty());
        self
    }

    pub fn chat_endpoint(&self) -> String {
        chat_endpoint(&self.base_url, &self.assistant_id)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            stream: self.stream,
            autorun: self.autorun,
            force_select_function: self.force_select_function.clone(),
        }
    }

    pub fn transport(&self) -> HttpTransport {
        if self.api_token.is_empty() {
            HttpTransport::new(self.chat_endpoint(), NoAuth)
        } else {
            HttpTransport::new(
                self.chat_endpoint(),
                BearerAuth::static_token(self.api_token.clone()),
            )
        }
    }

    pub fn catalog(&self) -> FunctionCatalog {
        if self.api_token.is_empty() {
            FunctionCatalog::new(self.base_url.clone(), NoAuth)
        } else {
            FunctionCatalog::new(
                self.base_url.clone(),
                BearerAuth::static_token(self.api_token.clone()),
            )
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".opas"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Defaults, then the JSON file, then `OPAS_*` environment variables.
    pub fn new(config_path: PathBuf) -> Self {
        let figment = Self::figment(&config_path).merge(Env::prefixed(ENV_PREFIX));
        Self::from_figment(figment, config_path)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    fn figment(path: &Path) -> Figment {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }
        Figment::from(Serialized::defaults(ClientSettings::default())).merge(Json::file(path))
    }

    fn from_figment(figment: Figment, config_path: PathBuf) -> Self {
        let settings = match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %config_path.display(),
                    %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        };
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    /// Swaps in new settings for this process without touching the file.
    pub fn replace(&self, settings: ClientSettings) {
        self.settings.store(Arc::new(settings.normalized()));
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
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

        tracing::info!(path = %self.config_path.display(), "saved settings");
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

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_assistant_id() -> String {
    DEFAULT_ASSISTANT_ID.to_string()
}

fn default_stream() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_at(path: PathBuf) -> SettingsStore {
        let figment = SettingsStore::figment(&path);
        SettingsStore::from_figment(figment, path)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path().join(SETTINGS_FILE_NAME));
        assert_eq!(*store.settings(), ClientSettings::default());
    }

    #[test]
    fn file_values_override_defaults_and_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "base_url": " https://assist.example.com/ ",
                "assistant_id": "  ",
                "stream": false,
                "starter_prompts": [
                    {"title": "Emails", "prompt": "Find Richard's email"},
                    {"title": "Blank", "prompt": "  "}
                ]
            }"#,
        )
        .unwrap();

        let settings = store_at(path).settings();
        assert_eq!(settings.base_url, "https://assist.example.com");
        assert_eq!(settings.assistant_id, DEFAULT_ASSISTANT_ID);
        assert!(!settings.stream);
        assert_eq!(settings.starter_prompts.len(), 1);
        assert_eq!(
            settings.chat_endpoint(),
            "https://assist.example.com/v1alpha/assistants/hooli/chat"
        );
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"stream": "sometimes"}"#).unwrap();
        assert_eq!(*store_at(path).settings(), ClientSettings::default());
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = store_at(path.clone());

        let settings = ClientSettings {
            api_token: " secret ".to_string(),
            autorun: Some(true),
            ..ClientSettings::default()
        };
        store.update(settings).unwrap();

        assert_eq!(store.settings().api_token, "secret");
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = store_at(path).settings();
        assert_eq!(reloaded.api_token, "secret");
        assert_eq!(reloaded.autorun, Some(true));
    }
}
