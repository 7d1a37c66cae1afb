//! Chat-completion client — the only network boundary of the pipeline
//!
//! Defines the client trait and the two implementations:
//! - `HttpChatClient`: OpenAI-compatible chat-completions endpoint (production)
//! - `MockChatClient`: marker-keyed scripted replies (testing)
//!
//! The structured wrapper (`StructuredClient`) and the coercion layer live in
//! the sibling modules; everything above this layer speaks typed payloads.

mod coerce;
mod structured;

pub use coerce::{coerce_value, CoerceMode};
pub use structured::{StructuredClient, DEFAULT_SYSTEM_MESSAGE};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Abstract model tiers. Concrete model identifiers are configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    /// Cheap, high-volume: claim extraction, TOC detection, density analysis.
    Extraction,
    /// Medium: claim filtering.
    Filtering,
    /// Strong: clustering, expansion, reconstruction, chapter compression,
    /// book assembly.
    Reasoning,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Extraction => "extraction",
            ModelTier::Filtering => "filtering",
            ModelTier::Reasoning => "reasoning",
        }
    }
}

/// Concrete model identifier per tier.
#[derive(Debug, Clone)]
pub struct TierModels {
    pub extraction: String,
    pub filtering: String,
    pub reasoning: String,
}

impl TierModels {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Extraction => &self.extraction,
            ModelTier::Filtering => &self.filtering,
            ModelTier::Reasoning => &self.reasoning,
        }
    }
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            extraction: "gpt-4o-mini".into(),
            filtering: "gpt-4o-mini".into(),
            reasoning: "gpt-4o".into(),
        }
    }
}

/// One chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// Errors from chat client operations.
///
/// Both kinds are recoverable at the stage level: `parallel_map` records the
/// error for the failing item and continues with the rest.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("schema validation failed: {message}")]
    SchemaValidation {
        message: String,
        /// Raw model reply, kept for diagnostics.
        raw: String,
    },
}

/// Client trait for chat-completion endpoints.
///
/// Abstracts over transport (HTTP, mock) so pipeline stages don't depend on
/// how the model is reached.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a message list to the named model, returning the reply text.
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

// ---------------------------------------------------------------------------
// HTTP client (OpenAI-compatible)
// ---------------------------------------------------------------------------

/// Chat client for an OpenAI-compatible chat-completions endpoint.
pub struct HttpChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionsResponse {
    choices: Vec<CompletionsChoice>,
}

#[derive(Deserialize)]
struct CompletionsChoice {
    message: CompletionsMessage,
}

#[derive(Deserialize)]
struct CompletionsMessage {
    content: Option<String>,
}

impl HttpChatClient {
    /// Create a client for the given base URL (e.g. `https://api.openai.com/v1`)
    /// and bearer token.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let body = CompletionsRequest {
            model,
            messages,
            // Low temperature: extraction, not generation.
            temperature: 0.2,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Transport(format!(
                "endpoint returned {}: {}",
                status, text
            )));
        }

        let parsed: CompletionsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("malformed completion response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Transport("no choices in completion response".into()))
    }
}

// ---------------------------------------------------------------------------
// Mock client
// ---------------------------------------------------------------------------

/// One scripted reply: either a reply body or a transport failure.
type ScriptedReply = Result<String, String>;

struct MockRule {
    /// Substring matched against the last user message.
    marker: String,
    /// Replies consumed front-to-back; the last one repeats.
    replies: VecDeque<ScriptedReply>,
}

/// Mock chat client for testing — returns scripted replies keyed by a
/// substring of the prompt.
///
/// Rules are checked in registration order; the first whose marker occurs in
/// the last user message wins. A rule's replies are consumed front to back,
/// and the final reply repeats for any further matching calls (so one
/// scripted reply covers a whole fan-out stage).
pub struct MockChatClient {
    rules: Mutex<Vec<MockRule>>,
    prompts: Mutex<Vec<String>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Script a reply for prompts containing `marker`.
    pub fn reply(self, marker: impl Into<String>, body: impl Into<String>) -> Self {
        self.push(marker.into(), Ok(body.into()));
        self
    }

    /// Script a transport failure for prompts containing `marker`.
    pub fn fail(self, marker: impl Into<String>, message: impl Into<String>) -> Self {
        self.push(marker.into(), Err(message.into()));
        self
    }

    fn push(&self, marker: String, reply: ScriptedReply) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.marker == marker) {
            rule.replies.push_back(reply);
        } else {
            rules.push(MockRule {
                marker,
                replies: VecDeque::from([reply]),
            });
        }
    }

    /// All prompts seen so far (last user message of each call).
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Number of calls whose prompt contained `marker`.
    pub fn calls_matching(&self, marker: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(marker))
            .count()
    }
}

impl Default for MockChatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn chat(&self, _model: &str, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt.clone());

        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| prompt.contains(&r.marker))
            .ok_or_else(|| {
                LlmError::Transport(format!(
                    "no scripted reply matches prompt: {:.60}",
                    prompt
                ))
            })?;

        let reply = if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap_or(Ok(String::new()))
        } else {
            rule.replies
                .front()
                .cloned()
                .unwrap_or(Ok(String::new()))
        };
        reply.map_err(LlmError::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_matches_marker_and_repeats_last_reply() {
        let mock = MockChatClient::new().reply("extract", "{\"ok\": 1}");
        let messages = [ChatMessage::user("please extract things")];
        assert_eq!(
            mock.chat("m", &messages).await.unwrap(),
            "{\"ok\": 1}"
        );
        assert_eq!(
            mock.chat("m", &messages).await.unwrap(),
            "{\"ok\": 1}"
        );
        assert_eq!(mock.calls_matching("extract"), 2);
    }

    #[tokio::test]
    async fn mock_consumes_queue_in_order() {
        let mock = MockChatClient::new()
            .fail("extract", "boom")
            .reply("extract", "second");
        let messages = [ChatMessage::user("extract")];
        assert!(mock.chat("m", &messages).await.is_err());
        assert_eq!(mock.chat("m", &messages).await.unwrap(), "second");
        // Last reply repeats.
        assert_eq!(mock.chat("m", &messages).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn mock_unmatched_prompt_is_transport_error() {
        let mock = MockChatClient::new().reply("alpha", "a");
        let err = mock
            .chat("m", &[ChatMessage::user("beta")])
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)));
    }
}
