use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::service::discord::DEFAULT_API_BASE_URL;
use crate::{Error, Result};

pub const SETTINGS_FILE_NAME: &str = "config.toml";
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server_id: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub discord: DiscordSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordSettings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Name of the environment variable holding the bot token.
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_bot_token_env() -> String {
    "BOT_TOKEN".to_string()
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            bot_token_env: default_bot_token_env(),
            page_size: default_page_size(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            output_dir: default_output_dir(),
            discord: DiscordSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let id = self.server_id.trim();
        if id.is_empty() {
            return Err(Error::InvalidConfig {
                message: "server_id is required (set SERVER_ID or server_id in config.toml)"
                    .to_string(),
            });
        }
        if !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidConfig {
                message: format!("server_id must be numeric: {id}"),
            });
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.discord.page_size) {
            return Err(Error::InvalidConfig {
                message: format!("discord.page_size must be within 1..={MAX_PAGE_SIZE}"),
            });
        }
        if self.discord.bot_token_env.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "discord.bot_token_env must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Applies `SERVER_ID` and `GUILDBACKUP_OUTPUT_DIR` from `lookup`.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SERVER_ID").filter(|v| !v.trim().is_empty()) {
            self.server_id = v.trim().to_string();
        }
        if let Some(v) = lookup("GUILDBACKUP_OUTPUT_DIR").filter(|v| !v.trim().is_empty()) {
            self.output_dir = PathBuf::from(v.trim());
        }
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|k| std::env::var(k).ok());
    }

    pub fn bot_token_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
        lookup(&self.discord.bot_token_env)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("bot token missing: set {}", self.discord.bot_token_env),
            })
    }

    pub fn bot_token(&self) -> Result<String> {
        self.bot_token_with(|k| std::env::var(k).ok())
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE_NAME)
}

/// Reads `config.toml`; a missing file means all defaults.
pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = settings_path(config_dir);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(e) => return Err(e.into()),
    };
    toml::from_str(&raw).map_err(|e| Error::InvalidConfig {
        message: format!("{}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let settings = load_settings(temp.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.discord.page_size, 100);
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            settings_path(temp.path()),
            "server_id = \"123\"\n[discord]\npage_size = 50\n",
        )
        .unwrap();
        let settings = load_settings(temp.path()).unwrap();
        assert_eq!(settings.server_id, "123");
        assert_eq!(settings.discord.page_size, 50);
        assert_eq!(settings.discord.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(settings.output_dir, PathBuf::from("."));
    }

    #[test]
    fn invalid_toml_is_invalid_config() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(settings_path(temp.path()), "server_id = [").unwrap();
        assert!(matches!(
            load_settings(temp.path()),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut settings = Settings {
            server_id: "1".to_string(),
            ..Settings::default()
        };
        settings.apply_env_with(env(&[
            ("SERVER_ID", " 42 "),
            ("GUILDBACKUP_OUTPUT_DIR", "/tmp/out"),
        ]));
        assert_eq!(settings.server_id, "42");
        assert_eq!(settings.output_dir, PathBuf::from("/tmp/out"));
        settings.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_err());

        settings.server_id = "abc".to_string();
        assert!(settings.validate().is_err());

        settings.server_id = "123".to_string();
        settings.discord.page_size = 0;
        assert!(settings.validate().is_err());

        settings.discord.page_size = 101;
        assert!(settings.validate().is_err());

        settings.discord.page_size = 100;
        settings.validate().unwrap();
    }

    #[test]
    fn bot_token_comes_from_named_variable() {
        let mut settings = Settings::default();
        settings.discord.bot_token_env = "MY_TOKEN".to_string();
        assert_eq!(
            settings.bot_token_with(env(&[("MY_TOKEN", "abc\n")])).unwrap(),
            "abc"
        );
        assert!(settings.bot_token_with(env(&[("BOT_TOKEN", "x")])).is_err());
    }
}
