use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DISCORD_TOKEN_VAR: &str = "DISCORD_TOKEN";
pub const OPENROUTER_KEY_VAR: &str = "OPENROUTER_KEY";
pub const ALLOWED_CHANNEL_VAR: &str = "ALLOWED_CHANNEL_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Tunables for the OpenRouter request. Defaults are the values the bot has
/// always shipped with; the file only exists to override them.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CompletionConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Filled from `OPENROUTER_KEY`, never from the file.
    #[serde(skip)]
    pub api_key: String,
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_log_file")]
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
            file_name: default_log_file(),
        }
    }
}

/// Optional `relaybot.toml` contents.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub token: String,
    pub allowed_channel_id: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub discord: DiscordConfig,
    pub completion: CompletionConfig,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "meta-llama/llama-3.1-70b-instruct".to_string()
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_file() -> String {
    "relaybot.log".to_string()
}

impl FileConfig {
    /// Load the tunables file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`load`](Self::load), but hands back the defaults alongside the
    /// error so logging can be set up before the error is reported.
    pub fn load_or_default(path: &Path) -> (Self, Option<ConfigError>) {
        match Self::load(path) {
            Ok(file) => (file, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }
}

impl Config {
    /// Build the config from the process environment, after loading `.env`.
    pub fn from_env(file: FileConfig) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(file, |name| std::env::var(name).ok())
    }

    /// Build the config from an arbitrary variable lookup.
    ///
    /// Every missing or malformed variable is collected so the error names
    /// all of them at once.
    pub fn from_lookup<F>(file: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let token = read(DISCORD_TOKEN_VAR);
        let api_key = read(OPENROUTER_KEY_VAR);
        let channel = read(ALLOWED_CHANNEL_VAR).and_then(|raw| match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => {
                tracing::error!("{} must be a valid non-zero integer", ALLOWED_CHANNEL_VAR);
                None
            }
            Ok(id) => Some(id),
        });

        let mut missing = Vec::new();
        if token.is_none() {
            missing.push(DISCORD_TOKEN_VAR);
        }
        if api_key.is_none() {
            missing.push(OPENROUTER_KEY_VAR);
        }
        if channel.is_none() {
            missing.push(ALLOWED_CHANNEL_VAR);
        }

        match (token, api_key, channel) {
            (Some(token), Some(api_key), Some(allowed_channel_id)) => {
                let mut completion = file.completion;
                completion.api_key = api_key;
                Ok(Config {
                    discord: DiscordConfig {
                        token,
                        allowed_channel_id,
                    },
                    completion,
                })
            }
            _ => Err(ConfigError::Missing(missing)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(vars: &HashMap<String, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(FileConfig::default(), |name| vars.get(name).cloned())
    }

    #[test]
    fn test_all_values_present() {
        let vars = env(&[
            ("DISCORD_TOKEN", "tok"),
            ("OPENROUTER_KEY", "sk-or-1"),
            ("ALLOWED_CHANNEL_ID", "123456789012345678"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.discord.token, "tok");
        assert_eq!(config.discord.allowed_channel_id, 123456789012345678);
        assert_eq!(config.completion.api_key, "sk-or-1");
        assert_eq!(config.completion.model, "meta-llama/llama-3.1-70b-instruct");
        assert_eq!(config.completion.max_tokens, 1000);
        assert_eq!(config.completion.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_values_all_named() {
        let err = load(&HashMap::new()).unwrap_err();
        match &err {
            ConfigError::Missing(names) => assert_eq!(
                names,
                &vec!["DISCORD_TOKEN", "OPENROUTER_KEY", "ALLOWED_CHANNEL_ID"]
            ),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            err.to_string(),
            "Missing required environment variables: DISCORD_TOKEN, OPENROUTER_KEY, ALLOWED_CHANNEL_ID"
        );
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let vars = env(&[
            ("DISCORD_TOKEN", "  "),
            ("OPENROUTER_KEY", "k"),
            ("ALLOWED_CHANNEL_ID", "42"),
        ]);
        match load(&vars).unwrap_err() {
            ConfigError::Missing(names) => assert_eq!(names, vec!["DISCORD_TOKEN"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_channel_id() {
        for raw in ["general", "-5", "0", "12.5"] {
            let vars = env(&[
                ("DISCORD_TOKEN", "t"),
                ("OPENROUTER_KEY", "k"),
                ("ALLOWED_CHANNEL_ID", raw),
            ]);
            match load(&vars).unwrap_err() {
                ConfigError::Missing(names) => assert_eq!(names, vec!["ALLOWED_CHANNEL_ID"]),
                other => panic!("unexpected error for {raw}: {other}"),
            }
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(file.completion, CompletionConfig::default());
        assert_eq!(file.logging, LoggingConfig::default());
    }

    #[test]
    fn test_file_overrides_completion_tunables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaybot.toml");
        std::fs::write(
            &path,
            "[completion]\nmodel = \"openai/gpt-4o-mini\"\ntimeout_secs = 10\n\n[logging]\ndirectory = \"/var/log/relaybot\"\n",
        )
        .unwrap();

        let file = FileConfig::load(&path).unwrap();
        assert_eq!(file.completion.model, "openai/gpt-4o-mini");
        assert_eq!(file.completion.timeout_secs, 10);
        assert_eq!(file.completion.max_tokens, 1000);
        assert_eq!(file.completion.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(file.logging.directory, PathBuf::from("/var/log/relaybot"));
        assert_eq!(file.logging.file_name, "relaybot.log");
    }

    #[test]
    fn test_file_api_key_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaybot.toml");
        std::fs::write(&path, "[completion]\napi_key = \"from-file\"\n").unwrap();

        let file = FileConfig::load(&path).unwrap();
        let vars = env(&[
            ("DISCORD_TOKEN", "t"),
            ("OPENROUTER_KEY", "from-env"),
            ("ALLOWED_CHANNEL_ID", "7"),
        ]);
        let config = Config::from_lookup(file, |name| vars.get(name).cloned()).unwrap();
        assert_eq!(config.completion.api_key, "from-env");
    }

    #[test]
    fn test_unreadable_file_still_yields_log_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaybot.toml");
        std::fs::write(&path, "[logging]\ndirectory = 5\n").unwrap();

        let (file, err) = FileConfig::load_or_default(&path);
        assert_eq!(file.logging, LoggingConfig::default());
        let err = err.expect("parse error");
        assert!(err.to_string().contains("relaybot.toml"));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaybot.toml");
        std::fs::write(&path, "[completion\nmodel = ").unwrap();
        assert!(matches!(
            FileConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
