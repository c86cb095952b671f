//! Remote language-model client.
//!
//! Wraps an OpenAI-compatible chat-completions endpoint. Network/5xx
//! failures are retried internally with a bounded backoff (`spec.md` §4.2,
//! §7); once that budget is exhausted the call fails permanently and the
//! caller treats it as a retryable format-failure at the stage level.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Response plus token accounting, per `spec.md` §4.2.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub body: String,
    pub up_tokens: u64,
    pub down_tokens: u64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, prompt: &str, system: Option<&str>) -> Result<ChatResponse, LlmError>;
}

/// An OpenAI-compatible chat-completions client over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_transport_retries: u32,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_transport_retries: 3,
        }
    }

    fn request_body(&self, prompt: &str, system: Option<&str>) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system".to_owned(),
                content: system.to_owned(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_owned(),
            content: prompt.to_owned(),
        });
        ChatRequest {
            model: self.model.clone(),
            messages,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, prompt: &str, system: Option<&str>) -> Result<ChatResponse, LlmError> {
        let body = self.request_body(prompt, system);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) => break response,
                Err(source) if attempt < self.max_transport_retries => {
                    tracing::warn!(attempt, error = %source, "LLM transport error, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                    continue;
                }
                Err(source) => {
                    return Err(LlmError::Transport {
                        attempts: attempt,
                        source,
                    })
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletion = response.json().await.map_err(|source| LlmError::Transport {
            attempts: attempt,
            source,
        })?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();
        let (up_tokens, down_tokens) = completion
            .usage
            .map(|usage| (usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            body: text,
            up_tokens,
            down_tokens,
        })
    }
}

fn fence_pattern(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)```{tag}\s*\n(?P<block>.*?)```")).expect("fence pattern is a valid regex")
}

static SQL_FENCE: LazyLock<Regex> = LazyLock::new(|| fence_pattern("sql"));
static PYTHON_FENCE: LazyLock<Regex> = LazyLock::new(|| fence_pattern("python"));

/// Extracts the first fenced code block tagged `tag` from `body`. Only `sql`
/// and `python` are backed by precompiled patterns; any other tag compiles
/// one on the fly.
pub fn extract_fenced(body: &str, tag: &'static str) -> Result<String, LlmError> {
    let captures = match tag {
        "sql" => SQL_FENCE.captures(body),
        "python" => PYTHON_FENCE.captures(body),
        other => fence_pattern(other).captures(body).map(|c| c.to_owned()),
    };
    captures
        .and_then(|cap| cap.name("block").map(|m| m.as_str().trim().to_owned()))
        .filter(|block| !block.is_empty())
        .ok_or(LlmError::NoFencedBlock { tag })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_sql_block() {
        let body = "here you go:\n```sql\nSELECT 1;\n```\nand more text";
        assert_eq!(extract_fenced(body, "sql").unwrap(), "SELECT 1;");
    }

    #[test]
    fn missing_block_is_a_format_error() {
        let body = "no fenced block here";
        assert!(matches!(
            extract_fenced(body, "sql"),
            Err(LlmError::NoFencedBlock { tag: "sql" })
        ));
    }

    #[test]
    fn empty_fenced_block_is_a_format_error() {
        let body = "```sql\n\n```";
        assert!(extract_fenced(body, "sql").is_err());
    }

    #[test]
    fn extracts_first_of_several_blocks() {
        let body = "```sql\nSELECT 1;\n```\n```sql\nSELECT 2;\n```";
        assert_eq!(extract_fenced(body, "sql").unwrap(), "SELECT 1;");
    }
}
