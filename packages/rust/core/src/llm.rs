//! Language-model boundary.
//!
//! Stages talk to the model only through [`LanguageModel`], asking for JSON
//! that matches a declared schema. [`OpenRouterClient`] is the shipped
//! implementation (OpenAI-compatible chat completions with
//! `response_format = json_schema`).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use docdrift_shared::{DocDriftError, LlmConfig, Result};

/// Usage and provenance of one model call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
}

/// A parsed structured response.
#[derive(Debug, Clone)]
pub struct StructuredResponse {
    pub data: serde_json::Value,
    pub metadata: ModelMetadata,
}

/// Provider-agnostic structured-output model.
///
/// `purpose` tags the call for usage accounting (e.g. `"classification"`).
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn request_structured_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        purpose: &str,
    ) -> Result<StructuredResponse>;
}

/// Run a model call under a caller deadline. Expiry is a [`DocDriftError::Timeout`].
pub async fn request_with_timeout(
    llm: &dyn LanguageModel,
    timeout: Duration,
    prompt: &str,
    schema: &serde_json::Value,
    purpose: &str,
) -> Result<StructuredResponse> {
    match tokio::time::timeout(timeout, llm.request_structured_json(prompt, schema, purpose)).await
    {
        Ok(result) => result,
        Err(_) => Err(DocDriftError::timeout(format!("{purpose} model call"), timeout)),
    }
}

// ---------------------------------------------------------------------------
// OpenRouter client
// ---------------------------------------------------------------------------

/// Chat-completions client for OpenRouter or any OpenAI-compatible endpoint.
pub struct OpenRouterClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenRouterClient {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| DocDriftError::config(format!("llm.base_url: {e}")))?;
        let endpoint = base
            .join("chat/completions")
            .map_err(|e| DocDriftError::config(format!("llm.base_url: {e}")))?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("DocDrift/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DocDriftError::Network(format!("client build: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenRouterClient {
    #[instrument(skip_all, fields(purpose = %purpose, model = %self.model))]
    async fn request_structured_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        purpose: &str,
    ) -> Result<StructuredResponse> {
        let start = Instant::now();
        let body = completion_request(&self.model, self.temperature, prompt, schema, purpose);

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DocDriftError::Network(format!("{purpose}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DocDriftError::Network(format!("{purpose}: {e}")))?;

        if !status.is_success() {
            return Err(DocDriftError::Network(format!(
                "{purpose}: HTTP {status}: {}",
                text.chars().take(300).collect::<String>()
            )));
        }

        let mut parsed = parse_completion(&text, purpose)?;
        parsed.metadata.latency_ms = start.elapsed().as_millis() as u64;
        debug!(
            tokens_in = parsed.metadata.tokens_in,
            tokens_out = parsed.metadata.tokens_out,
            latency_ms = parsed.metadata.latency_ms,
            "model call complete"
        );
        Ok(parsed)
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn completion_request(
    model: &str,
    temperature: f32,
    prompt: &str,
    schema: &serde_json::Value,
    purpose: &str,
) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "temperature": temperature,
        "messages": [
            {
                "role": "system",
                "content": "Respond with a single JSON document that matches the provided schema. No prose.",
            },
            { "role": "user", "content": prompt },
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": { "name": purpose, "strict": true, "schema": schema },
        },
    })
}

/// Parse a chat-completions body into the structured payload.
fn parse_completion(body: &str, purpose: &str) -> Result<StructuredResponse> {
    let response: CompletionResponse = serde_json::from_str(body).map_err(|e| {
        DocDriftError::validation(format!(
            "{purpose}: invalid completion envelope: {e} (got: {})",
            body.chars().take(200).collect::<String>()
        ))
    })?;

    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| DocDriftError::validation(format!("{purpose}: completion has no content")))?;

    let data: serde_json::Value = serde_json::from_str(strip_code_fence(&content)).map_err(|e| {
        DocDriftError::validation(format!("{purpose}: model output is not JSON: {e}"))
    })?;

    let usage = response.usage.unwrap_or(CompletionUsage {
        prompt_tokens: 0,
        completion_tokens: 0,
    });

    Ok(StructuredResponse {
        data,
        metadata: ModelMetadata {
            model: response.model,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            latency_ms: 0,
        },
    })
}

/// Some providers wrap JSON output in a markdown fence despite the schema.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```").unwrap_or(rest).trim()
        }
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowModel;

    #[async_trait]
    impl LanguageModel for SlowModel {
        async fn request_structured_json(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
            _purpose: &str,
        ) -> Result<StructuredResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StructuredResponse {
                data: serde_json::json!({}),
                metadata: ModelMetadata::default(),
            })
        }
    }

    #[tokio::test]
    async fn timeout_is_reported_as_timeout_error() {
        let err = request_with_timeout(
            &SlowModel,
            Duration::from_millis(20),
            "prompt",
            &serde_json::json!({}),
            "classification",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DocDriftError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn request_body_carries_schema_and_purpose() {
        let schema = serde_json::json!({ "type": "object" });
        let body = completion_request("m", 0.2, "hello", &schema, "proposal_generation");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "proposal_generation");
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
        assert_eq!(body["messages"][1]["content"], "hello");
    }

    #[test]
    fn parses_completion_with_usage() {
        let body = r#"{"model":"kimi","choices":[{"message":{"content":"{\"threads\":[]}"}}],"usage":{"prompt_tokens":120,"completion_tokens":8}}"#;
        let parsed = parse_completion(body, "classification").expect("parse");
        assert_eq!(parsed.data, serde_json::json!({ "threads": [] }));
        assert_eq!(parsed.metadata.model, "kimi");
        assert_eq!(parsed.metadata.tokens_in, 120);
        assert_eq!(parsed.metadata.tokens_out, 8);
    }

    #[test]
    fn fenced_json_is_accepted() {
        let body = r#"{"choices":[{"message":{"content":"```json\n{\"proposals\":[]}\n```"}}]}"#;
        let parsed = parse_completion(body, "proposal_generation").expect("parse");
        assert_eq!(parsed.data["proposals"], serde_json::json!([]));
    }

    #[test]
    fn non_json_content_is_a_validation_error() {
        let body = r#"{"choices":[{"message":{"content":"Sure! Here are the threads."}}]}"#;
        let err = parse_completion(body, "classification").unwrap_err();
        assert!(matches!(err, DocDriftError::Validation { .. }));
    }

    #[test]
    fn empty_choices_is_a_validation_error() {
        let err = parse_completion(r#"{"choices":[]}"#, "classification").unwrap_err();
        assert!(err.to_string().contains("no content"));
    }
}
