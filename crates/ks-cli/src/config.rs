use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use ks_core::{Framing, Settings, constants::DEFAULT_DIMENSIONS};

pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_PORT: u16 = 8300;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Offline feature-hashing embedder.
    #[default]
    Hashing,
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
}

impl EmbeddingProvider {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "hashing" => Some(Self::Hashing),
            "ollama" => Some(Self::Ollama),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorProvider {
    #[default]
    None,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

impl GeneratorProvider {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "openai" => Some(Self::OpenAi),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    /// Provider endpoint; each client has its own default.
    pub base_url: Option<String>,
    pub dimensions: usize,
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Upper bound on concurrent ingest workers; unset means one per core.
    pub workers: Option<usize>,
    #[serde(flatten)]
    pub framing: Framing,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "nomic-embed-text".to_string(),
            base_url: None,
            dimensions: DEFAULT_DIMENSIONS,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
            workers: None,
            framing: Framing::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub provider: GeneratorProvider,
    pub model: String,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: GeneratorProvider::None,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.7,
            max_tokens: 800,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Everything `ks` reads from `config.toml`. Engine tables (`[segment]`,
/// `[weights]`, `[gate]`, `[retrieval]`, `[[poles]]`) sit at the top level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub generator: GeneratorConfig,
    pub server: ServerConfig,
    #[serde(flatten)]
    pub engine: Settings,
}

impl Config {
    /// Load from `explicit`, or from `<data_dir>/config.toml` when present.
    /// An explicit path that does not exist is an error; a missing default
    /// file means all defaults.
    pub fn load(explicit: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let path: PathBuf = match explicit {
            Some(p) => p.to_path_buf(),
            None => data_dir.join(CONFIG_FILE),
        };
        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("invalid config {}", path.display()))?
        } else if explicit.is_some() {
            bail!("config file {} does not exist", path.display());
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// `KS_EMBED_PROVIDER`, `KS_LLM_PROVIDER` and `PORT` override the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("KS_EMBED_PROVIDER") {
            self.embedding.provider = EmbeddingProvider::parse(&v)
                .with_context(|| format!("unknown KS_EMBED_PROVIDER '{v}'"))?;
        }
        if let Some(v) = lookup("KS_LLM_PROVIDER") {
            self.generator.provider = GeneratorProvider::parse(&v)
                .with_context(|| format!("unknown KS_LLM_PROVIDER '{v}'"))?;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = v
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT '{v}'"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.embedding.dimensions == 0 {
            bail!("embedding.dimensions must be at least 1");
        }
        if self.embedding.workers == Some(0) {
            bail!("embedding.workers must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.generator.temperature) {
            bail!(
                "generator.temperature must be within [0, 2], got {}",
                self.generator.temperature
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_core::PolicyKind;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.engine.segment.window, 1200);
        config.validate().unwrap();
    }

    #[test]
    fn test_parses_all_tables() {
        let raw = r#"
            [embedding]
            provider = "ollama"
            model = "e5-base"
            dimensions = 384
            workers = 2
            use_prefixes = true

            [generator]
            provider = "openai"
            model = "gpt-4o"
            temperature = 0.2

            [server]
            port = 9000

            [segment]
            window = 400
            overlap = 50

            [gate]
            policy = "rules"
            extreme_scar_threshold = 0.9

            [retrieval]
            top_k = 4

            [[poles]]
            label = "honor"
            keywords = ["honor", "shame"]
        "#;
        let config = Config::from_toml(raw).unwrap();
        assert_eq!(config.embedding.provider, EmbeddingProvider::Ollama);
        assert!(config.embedding.framing.use_prefixes);
        assert_eq!(config.embedding.framing.query_prefix, "query: ");
        assert_eq!(config.embedding.dimensions, 384);
        assert_eq!(config.embedding.workers, Some(2));
        assert_eq!(config.generator.provider, GeneratorProvider::OpenAi);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.engine.segment.window, 400);
        assert_eq!(config.engine.gate.policy, Some(PolicyKind::Rules));
        assert_eq!(config.engine.retrieval.top_k, 4);
        assert_eq!(config.engine.poles.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "KS_EMBED_PROVIDER" => Some("OpenAI".to_string()),
                "KS_LLM_PROVIDER" => Some("ollama".to_string()),
                "PORT" => Some("8411".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.embedding.provider, EmbeddingProvider::OpenAi);
        assert_eq!(config.generator.provider, GeneratorProvider::Ollama);
        assert_eq!(config.server.port, 8411);
    }

    #[test]
    fn test_unknown_env_provider_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "KS_LLM_PROVIDER").then(|| "claude".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("KS_LLM_PROVIDER"));
    }

    #[test]
    fn test_invalid_engine_settings_fail_validation() {
        let config = Config::from_toml("[segment]\nwindow = 10\noverlap = 10\n").unwrap();
        assert!(config.validate().is_err());
        let config = Config::from_toml("[weights]\npair = 0.9\nscar_phase = 0.9\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_default_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(None, dir.path()).unwrap();
        assert_eq!(config.engine, Settings::default());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn test_load_reads_data_dir_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[retrieval]\ntop_k = 3\n").unwrap();
        let config = Config::load(None, dir.path()).unwrap();
        assert_eq!(config.engine.retrieval.top_k, 3);
    }
}
