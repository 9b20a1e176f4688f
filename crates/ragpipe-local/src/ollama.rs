use ragpipe_core::{Embedder, Error, Result, TextGenerator};
use serde::{Deserialize, Serialize};

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(key: &str) -> bool {
    env(key)
        .and_then(|s| s.parse::<bool>().ok())
        .unwrap_or(false)
}

/// Local Ollama server, used both for chat-style generation and for
/// embeddings (separate model per concern).
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embed_model: String,
}

impl OllamaClient {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        model: String,
        embed_model: String,
    ) -> Self {
        Self {
            client,
            base_url,
            model,
            embed_model,
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        // Opt-in: don't accidentally start calling localhost if the user didn't ask for it.
        let enabled = env_bool("RAGPIPE_OLLAMA_ENABLE");
        if !enabled {
            return Err(Error::NotConfigured(
                "RAGPIPE_OLLAMA_ENABLE is not set (or false)".to_string(),
            ));
        }
        let base_url =
            env("RAGPIPE_OLLAMA_BASE_URL").unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        // Pragmatic defaults; override based on what is installed locally.
        let model =
            env("RAGPIPE_OLLAMA_MODEL").unwrap_or_else(|| "qwen2.5:3b-instruct".to_string());
        let embed_model =
            env("RAGPIPE_OLLAMA_EMBED_MODEL").unwrap_or_else(|| "nomic-embed-text".to_string());
        Ok(Self::new(client, base_url, model, embed_model))
    }

    fn endpoint_chat(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    fn endpoint_embed(&self) -> String {
        format!("{}/api/embed", self.base_url.trim_end_matches('/'))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn chat(&self, system: &str, user: &str, timeout_ms: u64) -> Result<String> {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            stream: Some(false),
        };

        let resp = self
            .client
            .post(self.endpoint_chat())
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("ollama chat HTTP {status}")));
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        Ok(parsed.message.content)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Clone, Serialize)]
struct EmbedRequest {
    model: String,
    input: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait::async_trait]
impl TextGenerator for OllamaClient {
    async fn generate(&self, system: &str, prompt: &str, timeout_ms: u64) -> Result<String> {
        let out = self.chat(system, prompt, timeout_ms).await?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Err(Error::Llm("empty completion".to_string()));
        }
        Ok(trimmed.to_string())
    }
}

#[async_trait::async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, text: &str, timeout_ms: u64) -> Result<Vec<f32>> {
        let req = EmbedRequest {
            model: self.embed_model.clone(),
            input: text.to_string(),
        };
        let resp = self
            .client
            .post(self.endpoint_embed())
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Embedding(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Embedding(format!("ollama embed HTTP {status}")));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| Error::Embedding(e.to_string()))?;
        parsed
            .embeddings
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Embedding("empty embedding in response".to_string()))
    }
}
