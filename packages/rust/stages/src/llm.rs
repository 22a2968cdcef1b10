//! The language-model collaborator.
//!
//! The model is consumed through [`LanguageModel`] only: a list of chat
//! messages in, one content string out. Stages wrap calls with a fixed
//! system instruction and parse the output by literal marker strings, not a
//! structured format — fragile, but that is the contract the upstream
//! services speak.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flywheel_shared::{FlywheelError, Result};

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("flywheel/", env!("CARGO_PKG_VERSION"));

/// Preamble the model emits before the query list.
pub const QUERY_PREAMBLE: &str = "Here are the 25 question-answer pairs:";

/// Line marker tagging a generated search query.
pub const QUERY_MARKER: &str = "Query:";

/// Preamble the model emits before a summary.
pub const SUMMARY_PREAMBLE: &str = "Here is the summary of the passage:";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One chat message in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Chat-completion collaborator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send a conversation and return the assistant's content.
    async fn respond(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Marker parsing
// ---------------------------------------------------------------------------

/// Drop everything up to and including `marker`, if present.
pub fn strip_preamble<'a>(response: &'a str, marker: &str) -> &'a str {
    match response.rsplit_once(marker) {
        Some((_, rest)) => rest.trim(),
        None => response.trim(),
    }
}

/// Collect the remainder of every line starting with `marker`.
pub fn extract_marked_lines(text: &str, marker: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix(marker)
                .map(|rest| rest.trim().to_string())
        })
        .filter(|rest| !rest.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Client for an OpenAI-style chat-completions endpoint.
pub struct HttpLanguageModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLanguageModel {
    /// Build a client. `api_key` is read from the configured env var by the
    /// caller; `None` targets unauthenticated local servers.
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| FlywheelError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn respond(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut request = self.client.post(&self.endpoint).json(&ChatRequest {
            model: &self.model,
            messages,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FlywheelError::Llm(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlywheelError::Llm(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| FlywheelError::malformed(format!("chat response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| FlywheelError::malformed("chat response has no choices"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_preamble_takes_text_after_marker() {
        let response = format!("Sure!\n{QUERY_PREAMBLE}\nQuery: one\nQuery: two");
        let stripped = strip_preamble(&response, QUERY_PREAMBLE);
        assert!(stripped.starts_with("Query: one"));
    }

    #[test]
    fn strip_preamble_without_marker_is_identity() {
        assert_eq!(strip_preamble("  plain text  ", QUERY_PREAMBLE), "plain text");
    }

    #[test]
    fn extract_marked_lines_finds_queries() {
        let text = "Q1: what is X?\nQuery: define X\nAnswer: ...\n  Query: X examples \nQuery:\n";
        let queries = extract_marked_lines(text, QUERY_MARKER);
        assert_eq!(queries, vec!["define X".to_string(), "X examples".to_string()]);
    }

    #[tokio::test]
    async fn http_model_extracts_first_choice() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(
                serde_json::json!({
                    "choices": [
                        { "message": { "role": "assistant", "content": "hello there" } }
                    ]
                }),
            ))
            .mount(&server)
            .await;

        let model = HttpLanguageModel::new(server.uri(), "test-model", None).unwrap();
        let content = model.respond(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(content, "hello there");
    }

    #[tokio::test]
    async fn http_model_maps_empty_choices_to_malformed() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let model = HttpLanguageModel::new(server.uri(), "test-model", None).unwrap();
        let err = model.respond(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, FlywheelError::Malformed { .. }));
    }
}
