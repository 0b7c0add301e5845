use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

/// Computes one vector per input text, in input order.
pub trait TextEmbedder {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

impl<T: TextEmbedder + ?Sized> TextEmbedder for &T {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(texts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProviderKind {
    /// text-embeddings-inference style `/embed` endpoint.
    Tei,
    /// OpenAI-compatible `/embeddings` endpoint.
    Openai,
}

impl EmbeddingProviderKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tei" | "bge" | "local" => Ok(Self::Tei),
            "openai" => Ok(Self::Openai),
            other => bail!(
                "Unsupported TABLEGRAPH_EMBED_PROVIDER `{other}`. Supported: tei (bge/local), openai."
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tei => "tei",
            Self::Openai => "openai",
        }
    }

    pub fn response_contract(&self) -> ResponseContract {
        match self {
            Self::Tei => ResponseContract::Flat,
            Self::Openai => ResponseContract::Envelope,
        }
    }
}

/// Shape a provider promises to answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseContract {
    /// A bare JSON array of vectors.
    Flat,
    /// `{"data": [{"index": n, "embedding": [...]}, ...]}`
    Envelope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeItem {
    #[serde(default)]
    pub index: Option<usize>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingEnvelope {
    pub data: Vec<EnvelopeItem>,
}

#[derive(Debug, Clone)]
pub enum EmbeddingResponse {
    Flat(Vec<Vec<f32>>),
    Envelope(EmbeddingEnvelope),
}

impl EmbeddingResponse {
    pub fn decode(contract: ResponseContract, body: Value) -> Result<Self> {
        match contract {
            ResponseContract::Flat => serde_json::from_value(body)
                .map(Self::Flat)
                .context("Embedding response was not an array of vectors"),
            ResponseContract::Envelope => serde_json::from_value(body)
                .map(Self::Envelope)
                .context("Embedding response did not match the `data[].embedding` envelope"),
        }
    }

    pub fn into_vectors(self, expected: usize) -> Result<Vec<Vec<f32>>> {
        let vectors = match self {
            Self::Flat(vectors) => vectors,
            Self::Envelope(mut envelope) => {
                if envelope.data.iter().all(|item| item.index.is_some()) {
                    envelope.data.sort_by_key(|item| item.index);
                }
                envelope.data.into_iter().map(|item| item.embedding).collect()
            }
        };

        if vectors.len() != expected {
            bail!(
                "Embedding provider returned {} vectors for {expected} inputs",
                vectors.len()
            );
        }
        if vectors.iter().any(Vec::is_empty) {
            bail!("Embedding provider returned an empty embedding vector");
        }
        Ok(vectors)
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingRuntimeConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub text_instruction: Option<String>,
    pub request_timeout_seconds: u64,
}

impl EmbeddingRuntimeConfig {
    pub fn new(
        provider: &str,
        model: &str,
        base_url: &str,
        api_key: Option<String>,
        text_instruction: Option<String>,
        request_timeout_seconds: u64,
    ) -> Result<Self> {
        let provider = EmbeddingProviderKind::parse(provider)?;
        let model = model.trim().to_string();
        if model.is_empty() {
            bail!("TABLEGRAPH_EMBED_MODEL must be non-empty.");
        }

        let config = Self {
            provider,
            model,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            text_instruction: text_instruction
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            request_timeout_seconds: request_timeout_seconds.max(1),
        };
        config.validate_runtime_requirements()?;
        Ok(config)
    }

    fn validate_runtime_requirements(&self) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("Embedding misconfiguration: TABLEGRAPH_EMBED_BASE_URL is required.");
        }
        if self.provider == EmbeddingProviderKind::Openai && self.api_key.is_none() {
            bail!("Embedding misconfiguration: provider=openai requires TABLEGRAPH_EMBED_API_KEY.");
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        match self.provider {
            EmbeddingProviderKind::Tei => format!("{}/embed", self.base_url),
            EmbeddingProviderKind::Openai => format!("{}/embeddings", self.base_url),
        }
    }

    fn request_body(&self, texts: &[String]) -> Value {
        let inputs: Vec<String> = texts
            .iter()
            .map(|text| match &self.text_instruction {
                Some(instruction) => format!("{instruction}{text}"),
                None => text.clone(),
            })
            .collect();

        match self.provider {
            EmbeddingProviderKind::Tei => json!({ "inputs": inputs }),
            EmbeddingProviderKind::Openai => json!({ "model": self.model, "input": inputs }),
        }
    }
}

impl TextEmbedder for EmbeddingRuntimeConfig {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_runtime_requirements()?;

        let url = self.endpoint();
        let response = execute_curl_json(
            &url,
            self.api_key
                .as_deref()
                .map(|key| format!("Authorization: Bearer {key}")),
            self.request_timeout_seconds,
            self.request_body(texts).to_string(),
        )?;

        EmbeddingResponse::decode(self.provider.response_contract(), response)
            .with_context(|| format!("Unexpected embedding response from {url}"))?
            .into_vectors(texts.len())
    }
}

fn execute_curl_json(
    url: &str,
    auth_header: Option<String>,
    timeout_seconds: u64,
    body: String,
) -> Result<Value> {
    let mut command = Command::new("curl");
    command
        .arg("-sS")
        .arg("--max-time")
        .arg(timeout_seconds.to_string())
        .arg("-X")
        .arg("POST")
        .arg(url)
        .arg("-H")
        .arg("Content-Type: application/json")
        .arg("-d")
        .arg(body);

    if let Some(header) = auth_header {
        command.arg("-H").arg(header);
    }

    let output = command
        .output()
        .with_context(|| format!("Failed to execute curl for embedding request to {url}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("Embedding request failed: {}", stderr.trim());
    }

    let stdout =
        String::from_utf8(output.stdout).context("Embedding provider response was not UTF-8")?;
    let parsed = serde_json::from_str::<Value>(&stdout).with_context(|| {
        format!(
            "Embedding provider response was not valid JSON for {url}: {}",
            stdout.trim()
        )
    })?;

    if let Some(error) = parsed.get("error") {
        bail!("Embedding provider returned error: {error}");
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EmbeddingProviderKind, EmbeddingResponse, EmbeddingRuntimeConfig, ResponseContract};

    #[test]
    fn flat_contract_decodes_bare_arrays() {
        let response =
            EmbeddingResponse::decode(ResponseContract::Flat, json!([[0.1, 0.2], [0.3, 0.4]]))
                .expect("decode");
        let vectors = response.into_vectors(2).expect("vectors");
        assert_eq!(vectors[1], vec![0.3, 0.4]);
    }

    #[test]
    fn envelope_contract_orders_by_index() {
        let body = json!({
            "data": [
                { "index": 1, "embedding": [2.0] },
                { "index": 0, "embedding": [1.0] }
            ]
        });
        let vectors = EmbeddingResponse::decode(ResponseContract::Envelope, body)
            .expect("decode")
            .into_vectors(2)
            .expect("vectors");
        assert_eq!(vectors, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn contract_is_not_guessed_from_shape() {
        assert!(EmbeddingResponse::decode(ResponseContract::Flat, json!({ "data": [] })).is_err());
        assert!(EmbeddingResponse::decode(ResponseContract::Envelope, json!([[1.0]])).is_err());
    }

    #[test]
    fn vector_count_must_match_inputs() {
        let response =
            EmbeddingResponse::decode(ResponseContract::Flat, json!([[0.1]])).expect("decode");
        assert!(response.into_vectors(2).is_err());
    }

    #[test]
    fn openai_provider_requires_api_key() {
        assert!(EmbeddingRuntimeConfig::new("openai", "m", "http://x", None, None, 5).is_err());
        let config =
            EmbeddingRuntimeConfig::new("tei", "bge", "http://127.0.0.1:8080/", None, None, 0)
                .expect("config");
        assert_eq!(config.endpoint(), "http://127.0.0.1:8080/embed");
        assert_eq!(config.request_timeout_seconds, 1);
        assert_eq!(config.provider, EmbeddingProviderKind::Tei);
    }

    #[test]
    fn instruction_is_prepended_to_each_input() {
        let config = EmbeddingRuntimeConfig::new(
            "openai",
            "text-embedding-3-small",
            "https://api.example.com/v1",
            Some("sk-test".into()),
            Some("passage: ".into()),
            30,
        )
        .expect("config");
        let body = config.request_body(&["a".to_string(), "b".to_string()]);
        assert_eq!(body["input"], json!(["passage: a", "passage: b"]));
        assert_eq!(body["model"], "text-embedding-3-small");
    }
}
