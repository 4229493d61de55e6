//! Agent Registry (component D) and Agent Nodes (component F).

pub mod node;
pub mod registry;
pub mod result;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::llm::{CancelSignal, LlmClient};

pub use node::{AgentNodeInput, ContentGenerator, GenerateOutput, GraphContext};
pub use registry::{Agent, AgentRegistry};
pub use result::{AgentResult, ExecutionStatus};

/// Wraps a [`ContentGenerator`] into a runnable [`Agent`] by driving it
/// through the shared canonical node graph. This is the only `Agent`
/// implementation the registry ever needs to register — concrete agent
/// types (research, writing, proofreading, continuity, ...) are just
/// distinct `ContentGenerator`s.
pub struct NodeGraphAgent<G: ContentGenerator> {
    generator: G,
    llm: Arc<dyn LlmClient>,
}

impl<G: ContentGenerator> NodeGraphAgent<G> {
    pub fn new(generator: G, llm: Arc<dyn LlmClient>) -> Self {
        Self { generator, llm }
    }
}

#[async_trait]
impl<G: ContentGenerator> Agent for NodeGraphAgent<G> {
    fn capabilities(&self) -> &[String] {
        self.generator.capabilities()
    }

    async fn process(&self, input: AgentNodeInput) -> CoreResult<AgentResult> {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let cancel = CancelSignal::new(rx);
        node::run_node_graph(&self.generator, input, self.llm.as_ref(), &cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FakeLlmClient, LlmRequest};

    struct EchoGenerator;

    #[async_trait]
    impl ContentGenerator for EchoGenerator {
        fn agent_type(&self) -> &str {
            "echo_agent"
        }

        fn capabilities(&self) -> &[String] {
            &[]
        }

        async fn generate(
            &self,
            _ctx: &GraphContext,
            llm: &dyn LlmClient,
            cancel: &CancelSignal,
        ) -> CoreResult<GenerateOutput> {
            let text = llm
                .invoke(
                    LlmRequest { system: "echo".into(), messages: vec![], temperature: 0.0, model_hint: None, reasoning_effort: None },
                    cancel,
                )
                .await?;
            Ok(GenerateOutput {
                response_text: text,
                raw_operations_json: None,
                data_outputs: Default::default(),
                tools_used: vec![],
            })
        }
    }

    #[tokio::test]
    async fn node_graph_agent_registers_and_runs_through_registry() {
        let llm: Arc<dyn LlmClient> = Arc::new(FakeLlmClient::new("hi there"));
        let mut registry = AgentRegistry::new();
        registry.register("echo_agent", move || Arc::new(NodeGraphAgent::new(EchoGenerator, llm.clone())));

        let agent = registry.build("echo_agent").unwrap();
        let result = agent.process(AgentNodeInput::default()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.response, "hi there");
    }
}
