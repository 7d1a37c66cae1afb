//! Structured LLM invocation
//!
//! `invoke` turns a chat reply into a typed value: the declared schema is
//! appended to the prompt as a JSON-shape hint, the reply is stripped of
//! fences and prose, parsed, coerced (see `coerce`), and validated by
//! deserializing into the payload type. Validation failure triggers one more
//! coercion pass in enum-fuzzy mode before giving up with the raw reply
//! attached for diagnostics.

use super::coerce::{coerce_value, CoerceMode};
use super::{ChatClient, ChatMessage, LlmError, ModelTier, TierModels};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// System message used unless a call site overrides it.
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are not a summarizer. You are a signal \
extraction system. If removing something does not reduce understanding, remove it.";

/// Typed wrapper over a chat client: schema-validated calls per model tier.
#[derive(Clone)]
pub struct StructuredClient {
    client: Arc<dyn ChatClient>,
    models: TierModels,
}

impl StructuredClient {
    pub fn new(client: Arc<dyn ChatClient>, models: TierModels) -> Self {
        Self { client, models }
    }

    /// Invoke the tier's model and return a value satisfying `T`'s schema.
    pub async fn invoke<T>(
        &self,
        prompt: &str,
        tier: ModelTier,
        system: Option<&str>,
    ) -> Result<T, LlmError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| LlmError::Transport(format!("schema generation failed: {}", e)))?;

        let full_prompt = format!("{}\n\n{}", prompt, shape_hint(&schema));
        let reply = self.chat(&full_prompt, tier, system).await?;

        let json_text = extract_json(&reply).ok_or_else(|| LlmError::SchemaValidation {
            message: "no JSON object or array in reply".into(),
            raw: reply.clone(),
        })?;
        let parsed: Value =
            serde_json::from_str(&json_text).map_err(|e| LlmError::SchemaValidation {
                message: format!("reply is not valid JSON: {}", e),
                raw: reply.clone(),
            })?;

        let coerced = coerce_value(&parsed, &schema, CoerceMode::Strict);
        match serde_json::from_value::<T>(coerced) {
            Ok(value) => Ok(value),
            Err(first_err) => {
                // One more pass with fuzzy enum matching before failing.
                let fuzzed = coerce_value(&parsed, &schema, CoerceMode::FuzzyEnums);
                serde_json::from_value::<T>(fuzzed).map_err(|_| LlmError::SchemaValidation {
                    message: first_err.to_string(),
                    raw: reply,
                })
            }
        }
    }

    /// Invoke the tier's model and return the reply verbatim.
    pub async fn invoke_text(
        &self,
        prompt: &str,
        tier: ModelTier,
        system: Option<&str>,
    ) -> Result<String, LlmError> {
        self.chat(prompt, tier, system).await
    }

    async fn chat(
        &self,
        prompt: &str,
        tier: ModelTier,
        system: Option<&str>,
    ) -> Result<String, LlmError> {
        let model = self.models.model_for(tier);
        let messages = [
            ChatMessage::system(system.unwrap_or(DEFAULT_SYSTEM_MESSAGE)),
            ChatMessage::user(prompt),
        ];
        let reply = self.client.chat(model, &messages).await?;
        debug!(
            tier = tier.as_str(),
            model,
            reply_len = reply.len(),
            "chat reply received"
        );
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// Shape hint
// ---------------------------------------------------------------------------

/// Deterministically render a schema as a JSON-shape hint, including enum
/// value lists, plus the only-JSON directive.
fn shape_hint(schema: &Value) -> String {
    let mut rendered = String::new();
    render_shape(schema, schema, 0, &mut rendered);
    format!(
        "Return ONLY a JSON value of exactly this shape, with no code fences and no prose:\n{}",
        rendered
    )
}

fn render_shape(schema: &Value, root: &Value, indent: usize, out: &mut String) {
    let schema = resolve(schema, root);

    if let Some(branches) = schema
        .get("anyOf")
        .or_else(|| schema.get("oneOf"))
        .and_then(Value::as_array)
    {
        if let Some(branch) = branches
            .iter()
            .find(|b| b.get("type").and_then(Value::as_str) != Some("null"))
        {
            return render_shape(branch, root, indent, out);
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        let list = allowed
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" | ");
        out.push_str(&format!("one of: {}", list));
        return;
    }

    let ty = primary_type(schema);
    match ty.as_deref() {
        Some("object") => {
            let pad = "  ".repeat(indent + 1);
            out.push_str("{\n");
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                let required: Vec<&str> = schema
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|r| r.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                let count = properties.len();
                for (i, (key, field)) in properties.iter().enumerate() {
                    out.push_str(&format!("{}\"{}\": ", pad, key));
                    render_shape(field, root, indent + 1, out);
                    if !required.contains(&key.as_str()) {
                        out.push_str("  // optional");
                    }
                    if i + 1 < count {
                        out.push(',');
                    }
                    out.push('\n');
                }
            }
            out.push_str(&format!("{}}}", "  ".repeat(indent)));
        }
        Some("array") => {
            out.push('[');
            if let Some(items) = schema.get("items") {
                render_shape(items, root, indent, out);
                out.push_str(", ...");
            }
            out.push(']');
        }
        Some("integer") => out.push_str("integer"),
        Some("number") => out.push_str("number"),
        Some("boolean") => out.push_str("true|false"),
        _ => out.push_str("string"),
    }
}

fn resolve<'a>(schema: &'a Value, root: &'a Value) -> &'a Value {
    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        let name = reference.rsplit('/').next().unwrap_or_default();
        for section in ["$defs", "definitions"] {
            if let Some(resolved) = root.get(section).and_then(|d| d.get(name)) {
                return resolved;
            }
        }
    }
    schema
}

fn primary_type(schema: &Value) -> Option<String> {
    match schema.get("type") {
        Some(Value::String(t)) => Some(t.clone()),
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .map(String::from),
        _ => {
            if schema.get("properties").is_some() {
                Some("object".into())
            } else if schema.get("items").is_some() {
                Some("array".into())
            } else {
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Extract the first JSON object or array from a reply, stripping
/// triple-backtick fences if present.
pub fn extract_json(reply: &str) -> Option<String> {
    let body = strip_fences(reply);
    let start = body.find(['{', '['])?;
    let bytes = body.as_bytes();
    let open = bytes[start] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(body[start..start + i + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    if let Some(after_open) = trimmed.strip_prefix("```") {
        // Skip an optional language tag on the fence line.
        let body = match after_open.find('\n') {
            Some(newline) => &after_open[newline + 1..],
            None => after_open,
        };
        if let Some(fence_end) = body.rfind("```") {
            return &body[..fence_end];
        }
        return body;
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockChatClient;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    #[serde(rename_all = "snake_case")]
    enum Verdict {
        Keep,
        Discard,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Evaluation {
        verdict: Verdict,
        score: f64,
        notes: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct EvaluationList {
        evaluations: Vec<Evaluation>,
    }

    fn client(mock: MockChatClient) -> StructuredClient {
        StructuredClient::new(Arc::new(mock), TierModels::default())
    }

    #[test]
    fn extract_json_strips_fences() {
        let reply = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(reply).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn extract_json_skips_leading_prose() {
        let reply = "Here is the result you asked for:\n[{\"a\": \"b}\"}] trailing";
        assert_eq!(extract_json(reply).unwrap(), "[{\"a\": \"b}\"}]");
    }

    #[test]
    fn extract_json_none_when_absent() {
        assert!(extract_json("I could not comply.").is_none());
    }

    #[test]
    fn shape_hint_lists_enum_values_and_directive() {
        let schema = serde_json::to_value(schemars::schema_for!(EvaluationList)).unwrap();
        let hint = shape_hint(&schema);
        assert!(hint.contains("no code fences"));
        assert!(hint.contains("\"keep\""));
        assert!(hint.contains("\"discard\""));
        assert!(hint.contains("\"evaluations\""));
    }

    #[tokio::test]
    async fn invoke_parses_fenced_drifted_reply() {
        let mock = MockChatClient::new().reply(
            "judge",
            "```json\n{\"Evaluations\": [{\"Verdict\": \"Keep\", \"Score\": \"0.8\"}]}\n```",
        );
        let result: EvaluationList = client(mock)
            .invoke("judge these", ModelTier::Filtering, None)
            .await
            .unwrap();
        assert_eq!(result.evaluations.len(), 1);
        assert_eq!(result.evaluations[0].verdict, Verdict::Keep);
        assert_eq!(result.evaluations[0].score, 0.8);
    }

    #[tokio::test]
    async fn invoke_retries_with_fuzzy_enums() {
        // "definitely a keep" fails strict coercion, passes fuzzy containment.
        let mock = MockChatClient::new().reply(
            "judge",
            "{\"evaluations\": [{\"verdict\": \"definitely a keep\", \"score\": 1}]}",
        );
        let result: EvaluationList = client(mock)
            .invoke("judge these", ModelTier::Filtering, None)
            .await
            .unwrap();
        assert_eq!(result.evaluations[0].verdict, Verdict::Keep);
    }

    #[tokio::test]
    async fn invoke_failure_carries_raw_reply() {
        let mock = MockChatClient::new().reply("judge", "no json here at all");
        let err = client(mock)
            .invoke::<EvaluationList>("judge these", ModelTier::Filtering, None)
            .await
            .unwrap_err();
        match err {
            LlmError::SchemaValidation { raw, .. } => assert_eq!(raw, "no json here at all"),
            other => panic!("expected SchemaValidation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invoke_text_returns_reply_verbatim() {
        let mock = MockChatClient::new().reply("write", "# A Document\n\nBody.");
        let text = client(mock)
            .invoke_text("write it", ModelTier::Reasoning, None)
            .await
            .unwrap();
        assert_eq!(text, "# A Document\n\nBody.");
    }
}
