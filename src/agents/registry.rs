//! Agent Registry (§4.4, component D): `agent_type → factory`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};

use super::node::AgentNodeInput;
use super::result::AgentResult;

/// A runnable agent. `process` is pure with respect to its inputs modulo
/// the LLM/tool calls it dispatches through injected clients (§4.4).
#[async_trait]
pub trait Agent: Send + Sync {
    fn capabilities(&self) -> &[String];
    async fn process(&self, input: AgentNodeInput) -> CoreResult<AgentResult>;
}

type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

/// Maps `agent_type` strings to factories producing fresh `Agent` instances.
/// An unknown agent type is a loader error that fails the owning step with
/// `FatalConfig`, never retried (§4.4).
#[derive(Default, Clone)]
pub struct AgentRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_type: impl Into<String>, factory: impl Fn() -> Arc<dyn Agent> + Send + Sync + 'static) {
        self.factories.insert(agent_type.into(), Arc::new(factory));
    }

    pub fn build(&self, agent_type: &str) -> CoreResult<Arc<dyn Agent>> {
        let factory = self
            .factories
            .get(agent_type)
            .ok_or_else(|| CoreError::FatalConfig(format!("unknown agent type: {agent_type}")))?;
        Ok(factory())
    }

    pub fn is_registered(&self, agent_type: &str) -> bool {
        self.factories.contains_key(agent_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::result::ExecutionStatus;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;
    use uuid::Uuid;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        fn capabilities(&self) -> &[String] {
            &[]
        }

        async fn process(&self, input: AgentNodeInput) -> CoreResult<AgentResult> {
            Ok(AgentResult {
                agent_type: "echo".into(),
                execution_id: Uuid::new_v4(),
                status: ExecutionStatus::Success,
                response: format!("{:?}", input.step_input),
                data_outputs: StdHashMap::new(),
                tools_used: vec![],
                execution_time: Duration::from_millis(1),
                timestamp: chrono::Utc::now(),
                confidence_score: None,
                error_message: None,
                metadata: StdHashMap::new(),
            })
        }
    }

    #[test]
    fn unknown_agent_type_is_fatal_config() {
        let registry = AgentRegistry::new();
        let err = match registry.build("does_not_exist") {
            Err(e) => e,
            Ok(_) => panic!("expected build to fail for an unregistered agent type"),
        };
        assert!(matches!(err, CoreError::FatalConfig(_)));
    }

    #[tokio::test]
    async fn registered_agent_type_builds_and_runs() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", || Arc::new(EchoAgent));

        let agent = registry.build("echo").unwrap();
        let result = agent.process(AgentNodeInput::default()).await.unwrap();
        assert!(result.is_success());
    }
}
