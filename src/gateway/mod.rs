//! Provider gateway for OpenAI and Gemini text generation.
//!
//! The two backends sit behind [`ChatProvider`]; [`ProviderGateway`] picks one by
//! [`ProviderKind`] and records usage for every call. There is deliberately no
//! retry loop: a failed call is reported once and the caller moves on.

pub mod error;
pub mod gemini;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use gemini::{strip_code_fences, GeminiAdapter, DEFAULT_GEMINI_BASE_URL};
pub use openai::{OpenAiAdapter, DEFAULT_OPENAI_BASE_URL};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, TracingUsageSink, UsageSink};

/// Default request timeout. Judging a full batch can take reasoning models minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Maximum allowed response body length (1MB).
pub const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters.
pub const MAX_INPUT_CHARS: usize = 500_000;

/// Trait for a single backend's request/response envelope.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name used in logs and usage records.
    fn name(&self) -> &'static str;

    /// Endpoint label used in usage records.
    fn endpoint(&self) -> &'static str;

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// What the rating layer talks to.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Gateway over one selected provider, with usage recording.
pub struct ProviderGateway<U: UsageSinkTrait> {
    provider: Box<dyn ChatProvider>,
    usage_sink: Arc<U>,
}

#[async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    /// Build the adapter for `kind`. `base_url` overrides the public endpoint.
    pub fn for_provider(
        kind: ProviderKind,
        api_key: &str,
        base_url: Option<&str>,
        timeout: Duration,
        usage_sink: Arc<U>,
    ) -> Result<Self, ProviderError> {
        let provider: Box<dyn ChatProvider> = match kind {
            ProviderKind::OpenAi => Box::new(OpenAiAdapter::with_config(
                api_key,
                base_url.unwrap_or(DEFAULT_OPENAI_BASE_URL),
                timeout,
            )?),
            ProviderKind::Gemini => Box::new(GeminiAdapter::with_config(
                api_key,
                base_url.unwrap_or(DEFAULT_GEMINI_BASE_URL),
                timeout,
            )?),
        };
        Ok(Self::with_provider(provider, usage_sink))
    }

    pub fn with_provider(provider: Box<dyn ChatProvider>, usage_sink: Arc<U>) -> Self {
        Self {
            provider,
            usage_sink,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();
        let result = self.provider.chat(&req).await;

        let record = ProviderCallRecord::new(
            self.provider.name(),
            self.provider.endpoint(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id)
        .latency(start.elapsed().as_millis() as u64);

        let record = match &result {
            Ok(resp) => record
                .tokens(resp.input_tokens, resp.output_tokens)
                .request_id(resp.request_id.clone()),
            Err(err) => record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string)),
        };
        self.usage_sink.record(record).await;

        result
    }
}

/// Read a response body, refusing anything larger than [`MAX_RESPONSE_LEN`].
pub(crate) async fn read_body_capped(
    provider: &'static str,
    mut response: reqwest::Response,
    timeout: Duration,
) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ProviderError::from_transport(e, timeout))?
    {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::malformed(
                provider,
                format!("Response too large: {new_len} bytes"),
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}
