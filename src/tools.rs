//! Tool-client seam (§6: "a family of RPC endpoints for web search, URL
//! fetch, weather, pricing, etc. Each tool call has an idempotency key
//! where possible"). Real tool implementations (the actual HTTP calls) are
//! out of scope; this crate defines the trait agent nodes call through and
//! a deterministic fake for tests, grounded on the teacher's
//! `tools::cache_tools::CacheTools` pattern of wrapping a call behind a
//! stable cache/idempotency key.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreResult;

/// One tool invocation record, appended to a step's `tools_used` trail
/// (§3 `AgentResult.tools_used`) regardless of whether the call succeeded —
/// failures are captured, not propagated, per §4.6's failure semantics.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub idempotency_key: Option<String>,
    pub input: Value,
    pub output: Result<Value, String>,
}

/// A callable tool. `idempotency_key` lets a caller dedupe retried calls
/// (e.g. the same web-search query re-issued after a step retry) against a
/// backend that supports it; tools that can't deduplicate ignore it.
#[async_trait]
pub trait ToolClient: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, input: Value, idempotency_key: Option<&str>) -> CoreResult<Value>;
}

/// Deterministic, network-free tool for tests: always returns the
/// configured output, recording the call for assertions.
pub struct FakeToolClient {
    pub name: String,
    pub output: Value,
}

impl FakeToolClient {
    pub fn new(name: impl Into<String>, output: Value) -> Self {
        Self { name: name.into(), output }
    }
}

#[async_trait]
impl ToolClient for FakeToolClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, _input: Value, _idempotency_key: Option<&str>) -> CoreResult<Value> {
        Ok(self.output.clone())
    }
}

/// Invoke a tool, turning any error into a recorded failure rather than
/// propagating it, matching §4.6 ("tool call errors are captured into the
/// `tools_used` trail").
pub async fn invoke_recording(
    tool: &dyn ToolClient,
    input: Value,
    idempotency_key: Option<&str>,
) -> ToolInvocation {
    let result = tool.call(input.clone(), idempotency_key).await;
    ToolInvocation {
        tool_name: tool.name().to_string(),
        idempotency_key: idempotency_key.map(str::to_string),
        input,
        output: result.map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fake_tool_call_is_recorded_on_success() {
        let tool = FakeToolClient::new("web_search", json!({"results": []}));
        let invocation = invoke_recording(&tool, json!({"q": "rust"}), Some("key-1")).await;
        assert_eq!(invocation.tool_name, "web_search");
        assert!(invocation.output.is_ok());
    }
}
