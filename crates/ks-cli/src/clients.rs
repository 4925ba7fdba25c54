//! HTTP clients for the embedding and generation collaborators.
//!
//! All clients are blocking. They are built before any async runtime starts
//! and are only called from plain threads or `spawn_blocking`.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use ks_core::{
    CoreError, CoreResult, EmbedRole, Embedder, Framing, Generator, HashingEmbedder, Upstream,
};

use crate::config::{EmbeddingConfig, EmbeddingProvider, GeneratorConfig, GeneratorProvider};

const OLLAMA_URL: &str = "http://localhost:11434";
const OPENAI_URL: &str = "https://api.openai.com/v1";

fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to build http client")
}

fn api_key(env_name: &str) -> Result<String> {
    std::env::var(env_name)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .with_context(|| format!("${env_name} is not set"))
}

fn trim_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn check_dimensions(vectors: &[Vec<f32>], expected: usize) -> CoreResult<()> {
    match vectors.iter().find(|v| v.len() != expected) {
        Some(v) => Err(CoreError::upstream(
            Upstream::Embedding,
            format!("model returned {}-dim vector, expected {expected}", v.len()),
        )),
        None => Ok(()),
    }
}

// --- Embedders ---

pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
    framing: Framing,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: trim_url(config.base_url.as_deref().unwrap_or(OLLAMA_URL)),
            model: config.model.clone(),
            dimensions: config.dimensions,
            framing: config.framing.clone(),
        })
    }

    /// Older servers only have the per-item `/api/embeddings` endpoint.
    fn embed_one_legacy(&self, text: &str) -> CoreResult<Vec<f32>> {
        #[derive(Deserialize)]
        struct LegacyResp {
            embedding: Vec<f32>,
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .map_err(|e| embed_err(format!("failed to reach ollama at {url}: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(embed_err(format!("ollama http error {status}: {body}")));
        }
        let out: LegacyResp = resp
            .json()
            .map_err(|e| embed_err(format!("ollama returned invalid JSON: {e}")))?;
        Ok(out.embedding)
    }
}

fn embed_err(message: String) -> CoreError {
    CoreError::upstream(Upstream::Embedding, message)
}

impl Embedder for OllamaEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[&str], role: EmbedRole) -> CoreResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let framed: Vec<String> = texts
            .iter()
            .map(|t| self.framing.apply(role, t).into_owned())
            .collect();

        #[derive(Deserialize)]
        struct EmbedResp {
            embeddings: Vec<Vec<f32>>,
        }

        let url = format!("{}/api/embed", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": framed, "truncate": true }))
            .send()
            .map_err(|e| embed_err(format!("failed to reach ollama at {url}: {e}")))?;

        let vectors = if resp.status().is_success() {
            let out: EmbedResp = resp
                .json()
                .map_err(|e| embed_err(format!("ollama /api/embed returned invalid JSON: {e}")))?;
            if out.embeddings.len() != framed.len() {
                return Err(embed_err(format!(
                    "ollama /api/embed returned {} embeddings for {} inputs",
                    out.embeddings.len(),
                    framed.len()
                )));
            }
            out.embeddings
        } else {
            tracing::debug!(status = %resp.status(), "falling back to /api/embeddings");
            framed
                .iter()
                .map(|t| self.embed_one_legacy(t))
                .collect::<CoreResult<Vec<_>>>()?
        };
        check_dimensions(&vectors, self.dimensions)?;
        Ok(vectors)
    }
}

pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    dimensions: usize,
    framing: Framing,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: trim_url(config.base_url.as_deref().unwrap_or(OPENAI_URL)),
            model: config.model.clone(),
            api_key: api_key(&config.api_key_env)?,
            dimensions: config.dimensions,
            framing: config.framing.clone(),
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[&str], role: EmbedRole) -> CoreResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let framed: Vec<String> = texts
            .iter()
            .map(|t| self.framing.apply(role, t).into_owned())
            .collect();

        #[derive(Deserialize)]
        struct Item {
            index: usize,
            embedding: Vec<f32>,
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            data: Vec<Item>,
        }

        let url = format!("{}/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": framed }))
            .send()
            .map_err(|e| embed_err(format!("failed to reach {url}: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(embed_err(format!("embedding http error {status}: {body}")));
        }
        let mut out: EmbedResp = resp
            .json()
            .map_err(|e| embed_err(format!("embedding service returned invalid JSON: {e}")))?;
        if out.data.len() != framed.len() {
            return Err(embed_err(format!(
                "embedding service returned {} vectors for {} inputs",
                out.data.len(),
                framed.len()
            )));
        }
        out.data.sort_by_key(|item| item.index);
        let vectors: Vec<Vec<f32>> = out.data.into_iter().map(|item| item.embedding).collect();
        check_dimensions(&vectors, self.dimensions)?;
        Ok(vectors)
    }
}

pub fn build_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    let embedder: Box<dyn Embedder> = match config.provider {
        EmbeddingProvider::Hashing => Box::new(HashingEmbedder::new(config.dimensions)?),
        EmbeddingProvider::Ollama => Box::new(OllamaEmbedder::new(config)?),
        EmbeddingProvider::OpenAi => Box::new(
            OpenAiEmbedder::new(config).context("openai embedding provider needs an API key")?,
        ),
    };
    tracing::info!(
        provider = ?config.provider,
        dimensions = embedder.dimensions(),
        "embedder ready"
    );
    Ok(embedder)
}

// --- Generators ---

fn generate_err(message: String) -> CoreError {
    CoreError::upstream(Upstream::Generation, message)
}

pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: trim_url(config.base_url.as_deref().unwrap_or(OPENAI_URL)),
            model: config.model.clone(),
            api_key: api_key(&config.api_key_env)?,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    fn generate(&self, system_prompt: &str, user_prompt: &str) -> CoreResult<String> {
        #[derive(Deserialize)]
        struct Message {
            content: Option<String>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            choices: Vec<Choice>,
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| generate_err(format!("failed to reach {url}: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(generate_err(format!("generation http error {status}: {text}")));
        }
        let out: ChatResp = resp
            .json()
            .map_err(|e| generate_err(format!("generation service returned invalid JSON: {e}")))?;
        out.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| generate_err("generation service returned no choices".to_string()))
    }
}

pub struct OllamaGenerator {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: trim_url(config.base_url.as_deref().unwrap_or(OLLAMA_URL)),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    fn generate(&self, system_prompt: &str, user_prompt: &str) -> CoreResult<String> {
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            message: Message,
        }

        let url = format!("{}/api/chat", self.base_url);
        let body = json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| generate_err(format!("failed to reach ollama at {url}: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(generate_err(format!("ollama http error {status}: {text}")));
        }
        let out: ChatResp = resp
            .json()
            .map_err(|e| generate_err(format!("ollama returned invalid JSON: {e}")))?;
        Ok(out.message.content)
    }
}

pub fn build_generator(config: &GeneratorConfig) -> Result<Option<Box<dyn Generator>>> {
    let generator: Box<dyn Generator> = match config.provider {
        GeneratorProvider::None => {
            tracing::info!("no generator configured, answers use the template composer");
            return Ok(None);
        }
        GeneratorProvider::OpenAi => Box::new(
            OpenAiGenerator::new(config).context("openai generator needs an API key")?,
        ),
        GeneratorProvider::Ollama => Box::new(OllamaGenerator::new(config)?),
    };
    tracing::info!(provider = ?config.provider, model = generator.name(), "generator ready");
    Ok(Some(generator))
}
