use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

pub use lex_error::{LexError, Result};

#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub content: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, system: &str, user: &str) -> Result<ChatCompletion>;

    fn model_id(&self) -> &str;
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ========== OpenAI-compatible (covers OpenAI, DeepSeek, local proxies) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<OaiChatReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: String,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
    usage: Option<OaiUsage>,
}

fn service_error(provider: &str, status: reqwest::StatusCode, body: String) -> LexError {
    // 429/5xx 视为瞬时，带上重试提示
    let retry_after = if status.as_u16() == 429 || status.is_server_error() {
        Some(std::time::Duration::from_secs(30))
    } else {
        None
    };
    LexError::LlmService {
        provider: provider.to_string(),
        message: format!("status={} body={}", status, body),
        retry_after,
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, system, user))]
    async fn chat(&self, system: &str, user: &str) -> Result<ChatCompletion> {
        let url = format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let body = OaiChatReq {
            model: self.cfg.chat_model.clone(),
            messages: vec![
                OaiChatReqMsg {
                    role: "system".into(),
                    content: system.to_string(),
                },
                OaiChatReqMsg {
                    role: "user".into(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.1),
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LexError::Network {
                operation: "http_request".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(service_error("openai_compat", status, txt));
        }

        let data: OaiChatResp = resp.json().await.map_err(|e| LexError::Network {
            operation: "http_request".to_string(),
            message: e.to_string(),
        })?;
        let content = data
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        let (prompt_tokens, completion_tokens) = data
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));
        Ok(ChatCompletion {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }

    fn model_id(&self) -> &str {
        &self.cfg.chat_model
    }
}

#[derive(Serialize)]
struct OaiEmbedReq {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
    #[instrument(skip(self, texts))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .clone()
            .ok_or_else(|| LexError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;
        let url = format!("{}/v1/embeddings", self.cfg.base_url.trim_end_matches('/'));
        let body = OaiEmbedReq {
            model,
            input: texts.to_vec(),
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LexError::Network {
                operation: "http_request".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            let retry_after = if status.as_u16() == 429 || status.is_server_error() {
                Some(std::time::Duration::from_secs(30))
            } else {
                None
            };
            return Err(LexError::EmbeddingService {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after,
            });
        }

        let data: OaiEmbedResp = resp.json().await.map_err(|e| LexError::Network {
            operation: "http_request".to_string(),
            message: e.to_string(),
        })?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,   // e.g. claude-3-5-sonnet-latest
    pub api_url: String, // default https://api.anthropic.com
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(cfg: AnthropicConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct AnthMessageReqMsg {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct AnthMessageReq {
    model: String,
    system: String,
    messages: Vec<AnthMessageReqMsg>,
    max_tokens: u32,
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    content: Vec<AnthMessageRespContent>,
    usage: Option<AnthUsage>,
}

#[async_trait]
impl ChatModel for AnthropicClient {
    #[instrument(skip(self, system, user))]
    async fn chat(&self, system: &str, user: &str) -> Result<ChatCompletion> {
        let url = format!("{}/v1/messages", self.cfg.api_url.trim_end_matches('/'));
        let body = AnthMessageReq {
            model: self.cfg.model.clone(),
            system: system.to_string(),
            messages: vec![AnthMessageReqMsg {
                role: "user",
                content: user.to_string(),
            }],
            max_tokens: 2048,
            temperature: Some(0.1),
        };

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| LexError::Network {
                operation: "http_request".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(service_error("anthropic", status, txt));
        }

        let data: AnthMessageResp = resp.json().await.map_err(|e| LexError::Network {
            operation: "http_request".to_string(),
            message: e.to_string(),
        })?;
        let mut out = String::new();
        for c in data.content.into_iter() {
            if let Some(t) = c.text {
                out.push_str(&t);
            }
        }
        let (prompt_tokens, completion_tokens) = data
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((None, None));
        Ok(ChatCompletion {
            content: out,
            prompt_tokens,
            completion_tokens,
        })
    }

    fn model_id(&self) -> &str {
        &self.cfg.model
    }
}

// ========== Provider Registry & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "anthropic")]
    Anthropic {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
    /// Fixed response, for offline development and tests
    #[serde(rename = "static")]
    Static { response: String },
}

/// Chat model that always returns the same completion
pub struct StaticChatModel {
    response: String,
}

impl StaticChatModel {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
        }
    }
}

#[async_trait]
impl ChatModel for StaticChatModel {
    async fn chat(&self, _system: &str, _user: &str) -> Result<ChatCompletion> {
        Ok(ChatCompletion {
            content: self.response.clone(),
            prompt_tokens: None,
            completion_tokens: None,
        })
    }

    fn model_id(&self) -> &str {
        "static"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
}

/// Per-request provider/model selection: the pipeline asks for a chat
/// client by provider name and may override the configured model id.
#[derive(Default)]
pub struct ProviderRegistry {
    chat: std::collections::HashMap<String, ChatProviderConfig>,
    shared: std::collections::HashMap<String, Arc<dyn ChatModel>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_chat(mut self, name: &str, cfg: ChatProviderConfig) -> Self {
        self.chat.insert(name.to_string(), cfg);
        self
    }

    /// Register an already constructed client under a provider name
    pub fn register_shared(mut self, name: &str, model: Arc<dyn ChatModel>) -> Self {
        self.shared.insert(name.to_string(), model);
        self
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.chat.contains_key(name) || self.shared.contains_key(name)
    }

    pub fn chat_model(&self, provider: &str, model: Option<&str>) -> Result<Arc<dyn ChatModel>> {
        if let Some(shared) = self.shared.get(provider) {
            return Ok(shared.clone());
        }
        let cfg = self
            .chat
            .get(provider)
            .ok_or_else(|| LexError::Configuration {
                key: format!("provider.{}", provider),
                reason: "chat provider not configured".to_string(),
            })?;
        Ok(match cfg.clone() {
            ChatProviderConfig::OpenAiCompat {
                base_url,
                api_key,
                model: configured,
            } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
                base_url,
                api_key,
                chat_model: model.map(str::to_string).unwrap_or(configured),
                embedding_model: None,
            })),
            ChatProviderConfig::Anthropic {
                api_url,
                api_key,
                model: configured,
            } => Arc::new(AnthropicClient::new(AnthropicConfig {
                api_url: api_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
                api_key,
                model: model.map(str::to_string).unwrap_or(configured),
            })),
            ChatProviderConfig::Static { response } => Arc::new(StaticChatModel::new(&response)),
        })
    }
}

pub fn make_embed_model(cfg: EmbedProviderConfig) -> Box<dyn EmbedModel> {
    match cfg {
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
        })),
    }
}
