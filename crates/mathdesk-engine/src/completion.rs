use anyhow::Result;
use mathdesk_contracts::messages::{ChatMessage, MessageContent, Role};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::{AppConfig, CompletionProvider};
use crate::error::{truncate_text, ServiceError, TurnError, TurnResult};

/// Sampling temperature sent with every completion request.
pub const TEMPERATURE: f64 = 0.0;

pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, model: &str, messages: &[ChatMessage], temperature: f64) -> Result<String>;
}

pub struct OpenAiChatService {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiChatService {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, http: HttpClient) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

impl CompletionService for OpenAiChatService {
    fn name(&self) -> &str {
        "openai"
    }

    fn complete(&self, model: &str, messages: &[ChatMessage], temperature: f64) -> Result<String> {
        let payload = chat_completion_payload(model, messages, temperature);
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|source| ServiceError::Transport {
                provider: "OpenAI".to_string(),
                source,
            })?;
        let parsed = response_json_or_error("OpenAI", response)?;
        let text = extract_chat_completion_text(&parsed).ok_or_else(|| {
            ServiceError::InvalidResponse {
                provider: "OpenAI".to_string(),
                reason: "no message content in choices[0]".to_string(),
            }
        })?;
        Ok(text)
    }
}

/// Offline service that answers without a network call. The answer names the
/// question and the image it was given so sessions can be exercised end to end.
pub struct DryrunChatService;

impl CompletionService for DryrunChatService {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, model: &str, messages: &[ChatMessage], _temperature: f64) -> Result<String> {
        let question = messages
            .iter()
            .filter(|message| message.role == Role::User)
            .find_map(|message| match &message.content {
                MessageContent::Text(text) => Some(text.as_str()),
                MessageContent::Parts(_) => None,
            });
        let image = messages.iter().find_map(ChatMessage::image_url);

        let mut lines = vec![format!("**Dry run** (`{model}`)")];
        if let Some(question) = question {
            lines.push(format!("- question: {}", question.trim()));
        }
        if let Some(image) = image {
            lines.push(format!("- image: `{}`", image_digest(image)));
        }
        if question.is_none() && image.is_none() {
            lines.push("- nothing to solve".to_string());
        }
        Ok(lines.join("\n"))
    }
}

pub fn completion_service_from_config(
    config: &AppConfig,
    http: HttpClient,
) -> TurnResult<Box<dyn CompletionService>> {
    match config.provider {
        CompletionProvider::OpenAi => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| TurnError::Config("missing OpenAI API key".to_string()))?;
            Ok(Box::new(OpenAiChatService::new(
                config.api_base.clone(),
                api_key,
                http,
            )))
        }
        CompletionProvider::Dryrun => Ok(Box::new(DryrunChatService)),
    }
}

pub fn chat_completion_payload(model: &str, messages: &[ChatMessage], temperature: f64) -> Value {
    json!({
        "model": model,
        "messages": messages,
        "temperature": temperature,
    })
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value, ServiceError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|source| ServiceError::Transport {
        provider: provider.to_string(),
        source,
    })?;
    if !status.is_success() {
        return Err(ServiceError::Status {
            provider: provider.to_string(),
            status: code,
            body: truncate_text(body.trim(), 512),
        });
    }
    serde_json::from_str(&body).map_err(|err| ServiceError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("invalid JSON payload ({err})"),
    })
}

/// Pulls `choices[0].message.content`, accepting both the plain string form
/// and the list-of-parts form.
pub fn extract_chat_completion_text(response: &Value) -> Option<String> {
    let content = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))?;

    let text = match content {
        Value::String(text) => text.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter(|part| {
                matches!(
                    part.get("type").and_then(Value::as_str),
                    Some("text" | "output_text")
                )
            })
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect::<Vec<&str>>()
            .join("\n"),
        _ => String::new(),
    };
    if text.is_empty() {
        return None;
    }
    Some(text)
}

fn image_digest(reference: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    hex::encode(&hasher.finalize()[..6])
}
