//! Narrow LLM client seam (`spec.md` §6: "provide an LLM client (model
//! selection, temperature, persona style) keyed by the principal").
//!
//! The teacher's `llms::base_llm::BaseLLM` is a full provider abstraction
//! (call-type tracking, stop sequences, litellm detection, streaming). Per-
//! agent LLM content generation is explicitly out of scope here — the core
//! only needs to hand an agent *a* client and let it invoke it; the trait is
//! kept intentionally thin so any real provider crate can implement it.

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};

/// One invocation of an LLM: a system prompt, a rolled-up message history,
/// and the knobs an agent node can tune.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub messages: Vec<LlmMessage>,
    pub temperature: f32,
    pub model_hint: Option<String>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

/// Cooperative cancellation signal threaded through a step's suspension
/// points (§5: LLM calls, tool calls, checkpoint writes).
#[derive(Clone)]
pub struct CancelSignal(tokio::sync::watch::Receiver<bool>);

impl CancelSignal {
    pub fn new(receiver: tokio::sync::watch::Receiver<bool>) -> Self {
        Self(receiver)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// An LLM client an agent node invokes. Implementors own provider selection,
/// retries and rate limiting; the core only asks for text back.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, request: LlmRequest, cancel: &CancelSignal) -> CoreResult<String>;
}

/// A deterministic, network-free client for tests and the in-process
/// end-to-end scenarios of §8 — returns whatever text its constructor was
/// given, so a test can assert on the rest of the pipeline without a real
/// model in the loop.
pub struct FakeLlmClient {
    pub response: String,
}

impl FakeLlmClient {
    pub fn new(response: impl Into<String>) -> Self {
        Self { response: response.into() }
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn invoke(&self, _request: LlmRequest, cancel: &CancelSignal) -> CoreResult<String> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(self.response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_client_returns_configured_response() {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let client = FakeLlmClient::new("hello");
        let out = client
            .invoke(
                LlmRequest { system: "sys".into(), messages: vec![], temperature: 0.0, model_hint: None, reasoning_effort: None },
                &CancelSignal::new(rx),
            )
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn cancelled_signal_short_circuits_invoke() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        let client = FakeLlmClient::new("hello");
        let err = client
            .invoke(
                LlmRequest { system: "sys".into(), messages: vec![], temperature: 0.0, model_hint: None, reasoning_effort: None },
                &CancelSignal::new(rx),
            )
            .await;
        assert!(matches!(err, Err(CoreError::Cancelled)));
    }
}
