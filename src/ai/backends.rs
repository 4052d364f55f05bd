use crate::ai::Classification;
use crate::config::AnalyzerConfig;
use crate::error::ExternalClassifierError;
use crate::events::Severity;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trait for external classifier implementations
///
/// Implementations receive the composite prompt built by the analyzer and answer
/// with a single classification. Every error is recovered by the caller.
pub trait ExternalClassifier: Send + Sync {
    /// Name used in log messages
    fn name(&self) -> &str;

    fn classify<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Classification, ExternalClassifierError>> + Send + 'a>>;
}

/// System instruction sent with every request
pub const SYSTEM_PROMPT: &str = "You are an expert log analyzer. Analyze logs and respond ONLY with valid JSON. No markdown, no code blocks, just pure JSON.";

/// Backend for OpenAI-compatible chat completion APIs (Groq, OpenAI, local gateways)
pub struct OpenAICompatibleBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

/// Request format for the Chat Completions API
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Response format from the Chat Completions API
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    error: Option<ChatError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    message: String,
    #[serde(rename = "type", default)]
    error_type: String,
}

/// JSON object the model is asked to produce
#[derive(Debug, Serialize, Deserialize)]
struct ClassifierResponse {
    summary: String,
    #[serde(default)]
    root_cause: String,
    severity: String,
    #[serde(default)]
    fixes: Vec<String>,
    #[serde(default)]
    context: Option<String>,
}

impl OpenAICompatibleBackend {
    /// Create a new backend
    ///
    /// # Arguments
    /// * `api_key` - Bearer token for the API
    /// * `model` - Model name (e.g., "llama-3.3-70b-versatile")
    /// * `base_url` - API root, `/chat/completions` is appended
    /// * `timeout` - Upper bound for one request
    ///
    /// # Errors
    ///
    /// Returns `ExternalClassifierError::BackendError` if the HTTP client cannot be built.
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ExternalClassifierError> {
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| {
                ExternalClassifierError::BackendError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url,
        })
    }

    /// Build a backend from configuration, `None` when no API key is set
    pub fn from_config(config: &AnalyzerConfig) -> Result<Option<Self>, ExternalClassifierError> {
        match config.effective_api_key() {
            Some(key) => Self::new(
                key.to_string(),
                config.model.clone(),
                config.endpoint.clone(),
                Duration::from_secs(config.timeout_seconds),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl ExternalClassifier for OpenAICompatibleBackend {
    fn name(&self) -> &str {
        &self.model
    }

    fn classify<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Classification, ExternalClassifierError>> + Send + 'a>>
    {
        Box::pin(async move {
            let request = ChatRequest {
                model: self.model.clone(),
                messages: vec![
                    ChatMessage {
                        role: "system".to_string(),
                        content: SYSTEM_PROMPT.to_string(),
                    },
                    ChatMessage {
                        role: "user".to_string(),
                        content: prompt.to_string(),
                    },
                ],
                temperature: 0.3,
            };

            let response = self
                .client
                .post(self.api_url())
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(ExternalClassifierError::BackendError(format!(
                    "API returned error {}: {}",
                    status, error_text
                )));
            }

            let chat: ChatResponse = response.json().await.map_err(|e| {
                ExternalClassifierError::InvalidResponse(format!("Failed to parse API response: {}", e))
            })?;

            if let Some(error) = chat.error {
                return Err(ExternalClassifierError::BackendError(format!(
                    "API error ({}): {}",
                    error.error_type, error.message
                )));
            }

            let content = chat
                .choices
                .first()
                .map(|choice| choice.message.content.as_str())
                .ok_or_else(|| {
                    ExternalClassifierError::InvalidResponse("No choices in response".to_string())
                })?;

            parse_classification(content)
        })
    }
}

/// Extract the JSON object from model output
///
/// Models sometimes wrap JSON in markdown fences or surround it with prose.
pub fn extract_json(response_text: &str) -> &str {
    let text = response_text.trim();

    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let body = &text[start + 3..];
        if let Some(end) = body.find("```") {
            let candidate = body[..end].trim();
            if candidate.starts_with('{') && candidate.ends_with('}') {
                return candidate;
            }
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}

/// Parse model output into a classification
///
/// # Errors
///
/// Returns `ExternalClassifierError::InvalidResponse` when the content is not a JSON
/// object of the expected shape, the summary is empty, or the severity is not P0-P3.
pub fn parse_classification(content: &str) -> Result<Classification, ExternalClassifierError> {
    let json = extract_json(content);
    let response: ClassifierResponse = serde_json::from_str(json).map_err(|e| {
        ExternalClassifierError::InvalidResponse(format!(
            "Failed to parse classifier JSON: {}. Response was: {}",
            e, json
        ))
    })?;

    if response.summary.trim().is_empty() {
        return Err(ExternalClassifierError::InvalidResponse(
            "Empty summary".to_string(),
        ));
    }

    let severity = Severity::parse(&response.severity).ok_or_else(|| {
        ExternalClassifierError::InvalidResponse(format!(
            "Unknown severity: {}",
            response.severity
        ))
    })?;

    Ok(Classification {
        summary: response.summary,
        root_cause: response.root_cause,
        severity,
        fixes: response.fixes,
        context: response.context,
    })
}

/// Mock classifier for tests and offline development
///
/// Responses are returned in order and cycle after the last one.
pub struct MockBackend {
    responses: Vec<Result<Classification, ExternalClassifierError>>,
    state: Arc<Mutex<MockState>>,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct MockState {
    next: usize,
    call_count: usize,
    last_prompt: Option<String>,
}

impl MockBackend {
    pub fn with_responses(responses: Vec<Result<Classification, ExternalClassifierError>>) -> Self {
        Self {
            responses,
            state: Arc::new(Mutex::new(MockState::default())),
            delay: None,
        }
    }

    pub fn with_response(response: Result<Classification, ExternalClassifierError>) -> Self {
        Self::with_responses(vec![response])
    }

    /// Always answers with a P0 classification
    pub fn success() -> Self {
        Self::with_response(Ok(Classification {
            summary: "Mock outage".to_string(),
            root_cause: "Mock root cause".to_string(),
            severity: Severity::P0,
            fixes: vec!["Mock fix".to_string()],
            context: None,
        }))
    }

    pub fn error(message: &str) -> Self {
        Self::with_response(Err(ExternalClassifierError::BackendError(
            message.to_string(),
        )))
    }

    pub fn timeout() -> Self {
        Self::with_response(Err(ExternalClassifierError::Timeout))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().map(|s| s.call_count).unwrap_or(0)
    }

    /// Prompt passed to the most recent call
    pub fn last_prompt(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.last_prompt.clone())
    }
}

impl ExternalClassifier for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn classify<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Classification, ExternalClassifierError>> + Send + 'a>>
    {
        Box::pin(async move {
            let index = {
                let mut state = self
                    .state
                    .lock()
                    .map_err(|_| ExternalClassifierError::BackendError("poisoned".to_string()))?;
                state.call_count += 1;
                state.last_prompt = Some(prompt.to_string());
                let index = state.next;
                state.next += 1;
                index
            };

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.responses.is_empty() {
                return Err(ExternalClassifierError::BackendError(
                    "no mock responses configured".to_string(),
                ));
            }
            self.responses[index % self.responses.len()].clone()
        })
    }
}
