use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub library: LibraryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Layout of the local working copy.
///
/// `root` is the library repository; prompts and fragments live in the
/// named subdirectories beneath it, mirroring the upstream repository.
#[derive(Debug, Deserialize, Clone)]
pub struct LibraryConfig {
    pub root: PathBuf,
    #[serde(default = "default_prompts_subdir")]
    pub prompts_subdir: String,
    #[serde(default = "default_fragments_subdir")]
    pub fragments_subdir: String,
    #[serde(default = "default_prompt_file")]
    pub prompt_file: String,
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

fn default_prompts_subdir() -> String {
    "prompts".to_string()
}
fn default_fragments_subdir() -> String {
    "fragments".to_string()
}
fn default_prompt_file() -> String {
    "prompt.md".to_string()
}
fn default_metadata_file() -> String {
    "metadata.yml".to_string()
}

impl LibraryConfig {
    pub fn prompts_dir(&self) -> PathBuf {
        self.root.join(&self.prompts_subdir)
    }

    pub fn fragments_dir(&self) -> PathBuf {
        self.root.join(&self.fragments_subdir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            branch: default_branch(),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Upper bound on items processed concurrently during regeneration.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Regenerate metadata even when the content fingerprint matches.
    #[serde(default)]
    pub force_regenerate: bool,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            force_regenerate: false,
            exclude_globs: default_exclude_globs(),
        }
    }
}

fn default_max_parallel() -> usize {
    4
}
fn default_exclude_globs() -> Vec<String> {
    vec![
        ".git".to_string(),
        ".git/**".to_string(),
        "**/.DS_Store".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Analyzer prompt template with `{{PROMPT_TO_ANALYZE}}` and
    /// `{{AVAILABLE_PROMPT_FRAGMENTS}}` placeholders.
    #[serde(default)]
    pub analyzer_prompt: Option<PathBuf>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            analyzer_prompt: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}
fn default_max_tokens() -> u32 {
    8000
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    120
}

impl GeneratorConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// A configuration rooted at `root` with every optional section defaulted.
    pub fn minimal(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("data").join("library.sqlite"),
            },
            library: LibraryConfig {
                root: root.join("library"),
                prompts_subdir: default_prompts_subdir(),
                fragments_subdir: default_fragments_subdir(),
                prompt_file: default_prompt_file(),
                metadata_file: default_metadata_file(),
            },
            remote: RemoteConfig::default(),
            sync: SyncConfig::default(),
            generator: GeneratorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Apply process environment overrides. Called once at load time so the
    /// rest of the program only ever sees the resulting snapshot.
    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REMOTE_REPOSITORY").filter(|u| !u.trim().is_empty()) {
            self.remote.url = Some(url);
        }
        if let Some(flag) = lookup("FORCE_REGENERATE") {
            self.sync.force_regenerate = flag.eq_ignore_ascii_case("true") || flag == "1";
        }
        if let Some(level) = lookup("LOG_LEVEL").filter(|l| !l.trim().is_empty()) {
            self.logging.level = level;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sync.max_parallel == 0 {
            anyhow::bail!("sync.max_parallel must be > 0");
        }

        for (key, value) in [
            ("library.prompt_file", &self.library.prompt_file),
            ("library.metadata_file", &self.library.metadata_file),
            ("library.prompts_subdir", &self.library.prompts_subdir),
            ("library.fragments_subdir", &self.library.fragments_subdir),
        ] {
            if value.trim().is_empty() || value.contains('/') || value.contains('\\') {
                anyhow::bail!("{} must be a single non-empty path component", key);
            }
        }

        if self.library.prompt_file == self.library.metadata_file {
            anyhow::bail!("library.prompt_file and library.metadata_file must differ");
        }

        match self.generator.provider.as_str() {
            "disabled" | "anthropic" => {}
            other => anyhow::bail!(
                "Unknown generator provider: '{}'. Must be disabled or anthropic.",
                other
            ),
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("Unknown logging.format '{}'. Must be text or json.", other),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[db]
path = "/tmp/psync/library.sqlite"

[library]
root = "/tmp/psync/library"

[remote]
url = "https://example.com/prompts.git"
"#;

    #[test]
    fn defaults_fill_optional_sections() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.library.prompt_file, "prompt.md");
        assert_eq!(config.library.metadata_file, "metadata.yml");
        assert_eq!(config.remote.branch, "main");
        assert_eq!(config.sync.max_parallel, 4);
        assert!(!config.generator.is_enabled());
        assert_eq!(
            config.library.prompts_dir(),
            PathBuf::from("/tmp/psync/library/prompts")
        );
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_take_precedence_over_file() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("REMOTE_REPOSITORY", "git@example.com:other.git"),
            ("FORCE_REGENERATE", "TRUE"),
        ]
        .into_iter()
        .collect();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(
            config.remote.url.as_deref(),
            Some("git@example.com:other.git")
        );
        assert!(config.sync.force_regenerate);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn empty_env_url_is_ignored() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.apply_env_overrides(|k| (k == "REMOTE_REPOSITORY").then(String::new));
        assert_eq!(
            config.remote.url.as_deref(),
            Some("https://example.com/prompts.git")
        );
    }

    #[test]
    fn rejects_nested_file_names() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.library.prompt_file = "nested/prompt.md".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.generator.provider = "openai".to_string();
        assert!(config.validate().is_err());
    }
}
