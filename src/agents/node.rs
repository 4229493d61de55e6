//! Agent Nodes (§4.6, component F): the canonical
//! `prepare_context → extract_content → generate → [resolve_operations] →
//! format_response` graph every concrete agent runs through, grounded
//! directly on `article_writing_agent.py`'s `StateGraph` node wiring.
//!
//! Concrete agent types differ only in how they generate content
//! (`ContentGenerator::generate`); the surrounding graph — editing-mode
//! detection, edit resolution, `AgentResult` assembly — is shared, so it is
//! implemented once in [`run_node_graph`] rather than duplicated per agent.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::edit::{resolve_batch, EditorOperation};
use crate::error::CoreResult;
use crate::llm::{CancelSignal, LlmClient};
use crate::memory::{ActiveEditorSnapshot, Message, ReferencedDocument};

use super::result::{AgentResult, ExecutionStatus};

/// Everything a step hands an agent at the start of one execution: the
/// namespaced handoff inputs the scheduler assembled, a shared-memory
/// snapshot, and conversational history merged with prior checkpoint state
/// (§4.6: "preserve conversational continuity across turns").
#[derive(Debug, Clone, Default)]
pub struct AgentNodeInput {
    pub step_input: HashMap<String, Value>,
    pub shared_memory: HashMap<String, Value>,
    pub messages: Vec<Message>,
    pub persona: Option<String>,
}

impl AgentNodeInput {
    pub fn active_editor(&self) -> Option<ActiveEditorSnapshot> {
        self.shared_memory
            .get(crate::memory::KEY_ACTIVE_EDITOR)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn referenced_context(&self) -> HashMap<String, Vec<ReferencedDocument>> {
        self.shared_memory
            .get(crate::memory::KEY_REFERENCED_CONTEXT)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// `prepare_context`'s output: the `generate` node's view of the world.
pub struct GraphContext {
    pub editing_mode: bool,
    pub active_editor: Option<ActiveEditorSnapshot>,
    pub referenced_context: HashMap<String, Vec<ReferencedDocument>>,
    pub persona: Option<String>,
    pub step_input: HashMap<String, Value>,
    pub messages: Vec<Message>,
}

/// What `generate` produces, before edit resolution.
pub struct GenerateOutput {
    pub response_text: String,
    /// Present only in editing mode, where the LLM emits a structured edit
    /// plan instead of (or alongside) prose.
    pub raw_operations_json: Option<String>,
    pub data_outputs: HashMap<String, Value>,
    pub tools_used: Vec<String>,
}

/// The part of an agent that's actually specific to its type: everything
/// else in the canonical graph is shared plumbing.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    fn agent_type(&self) -> &str;
    fn capabilities(&self) -> &[String];

    async fn generate(
        &self,
        ctx: &GraphContext,
        llm: &dyn LlmClient,
        cancel: &CancelSignal,
    ) -> CoreResult<GenerateOutput>;
}

/// `prepare_context`: editor has a non-empty body ⇒ editing mode (§4.6).
fn prepare_context(input: &AgentNodeInput) -> GraphContext {
    let active_editor = input.active_editor();
    let editing_mode = active_editor.as_ref().is_some_and(|e| !e.content.trim().is_empty());
    GraphContext {
        editing_mode,
        active_editor,
        referenced_context: input.referenced_context(),
        persona: input.persona.clone(),
        step_input: input.step_input.clone(),
        messages: input.messages.clone(),
    }
}

/// `extract_content` is a no-op pass-through in this core: the context is
/// already fully materialized by `prepare_context`. Kept as a named step so
/// the graph shape matches the canonical one (§4.6) even though nothing
/// needs to happen between preparing context and generating from it.
fn extract_content(ctx: GraphContext) -> GraphContext {
    ctx
}

/// `resolve_operations`: route every emitted operation through the Edit
/// Resolver (C). Dropped operations are logged by the resolver itself and
/// do not fail the step.
fn resolve_operations(ctx: &GraphContext, raw_json: &str) -> (Vec<EditorOperation>, Option<String>) {
    let (operations, warning) = parse_edit_plan(raw_json);
    let body = ctx.active_editor.as_ref().map(|e| e.content.as_str()).unwrap_or("");
    let fm_end = frontmatter_end(body);
    let batch = resolve_batch(body, operations, fm_end, None);
    (batch.resolved.into_iter().map(resolved_to_operation).collect(), warning)
}

fn resolved_to_operation(resolved: crate::edit::ResolvedEdit) -> EditorOperation {
    EditorOperation {
        op_type: crate::edit::OpType::ReplaceRange,
        start: Some(resolved.start),
        end: Some(resolved.end),
        text: Some(resolved.text),
        original_text: None,
        anchor_text: None,
        occurrence_index: 0,
        confidence: resolved.confidence,
    }
}

/// Offset just past the closing `---` of a leading YAML frontmatter block,
/// or `0` if the document has none.
pub fn frontmatter_end(body: &str) -> usize {
    if !body.starts_with("---") {
        return 0;
    }
    match body[3..].find("\n---") {
        Some(relative) => {
            let close_start = 3 + relative;
            let after_marker = close_start + 4;
            body[after_marker..].find('\n').map(|i| after_marker + i + 1).unwrap_or(body.len())
        }
        None => 0,
    }
}

/// §4.6 JSON-repair policy: strip code fences and trailing commas once,
/// re-parse; on a second failure return an empty plan with a warning
/// instead of failing the step.
pub fn parse_edit_plan(raw: &str) -> (Vec<EditorOperation>, Option<String>) {
    if let Ok(ops) = serde_json::from_str::<Vec<EditorOperation>>(raw) {
        return (ops, None);
    }

    let repaired = strip_code_fences(raw);
    let repaired = strip_trailing_commas(&repaired);
    match serde_json::from_str::<Vec<EditorOperation>>(&repaired) {
        Ok(ops) => (ops, None),
        Err(e) => (Vec::new(), Some(format!("edit plan JSON unparseable after repair: {e}"))),
    }
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fences = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_fences.strip_suffix("```").unwrap_or(without_fences).trim().to_string()
}

fn strip_trailing_commas(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == ']' || chars[j] == '}') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// `format_response`: assemble the `AgentResult` the scheduler collects.
fn format_response(
    agent_type: &str,
    output: GenerateOutput,
    operations: Vec<EditorOperation>,
    warning: Option<String>,
    started_at: Instant,
) -> AgentResult {
    let mut data_outputs = output.data_outputs;
    if !operations.is_empty() {
        data_outputs.insert("operations".to_string(), serde_json::to_value(&operations).unwrap_or(Value::Null));
    }

    let mut metadata = HashMap::new();
    if let Some(warning) = warning {
        metadata.insert("warning".to_string(), Value::String(warning));
    }

    let confidence_score = if operations.is_empty() {
        None
    } else {
        Some(operations.iter().map(|op| op.confidence).sum::<f64>() / operations.len() as f64)
    };

    AgentResult {
        agent_type: agent_type.to_string(),
        execution_id: Uuid::new_v4(),
        status: ExecutionStatus::Success,
        response: output.response_text,
        data_outputs,
        tools_used: output.tools_used,
        execution_time: started_at.elapsed(),
        timestamp: chrono::Utc::now(),
        confidence_score,
        error_message: None,
        metadata,
    }
}

/// Run the canonical node graph for one agent invocation:
/// `prepare_context → extract_content → generate → [resolve_operations] →
/// format_response`.
pub async fn run_node_graph(
    generator: &dyn ContentGenerator,
    input: AgentNodeInput,
    llm: &dyn LlmClient,
    cancel: &CancelSignal,
) -> CoreResult<AgentResult> {
    let started_at = Instant::now();
    let ctx = extract_content(prepare_context(&input));

    let output = generator.generate(&ctx, llm, cancel).await?;

    let (operations, warning) = match (ctx.editing_mode, output.raw_operations_json.as_deref()) {
        (true, Some(raw_json)) => resolve_operations(&ctx, raw_json),
        _ => (Vec::new(), None),
    };

    Ok(format_response(generator.agent_type(), output, operations, warning, started_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_end_finds_closing_marker() {
        let body = "---\ntitle: x\n---\nbody text";
        let end = frontmatter_end(body);
        assert_eq!(&body[end..], "body text");
    }

    #[test]
    fn frontmatter_end_is_zero_without_frontmatter() {
        assert_eq!(frontmatter_end("just body text"), 0);
    }

    #[test]
    fn parse_edit_plan_repairs_code_fence_and_trailing_comma() {
        let raw = "```json\n[{\"op_type\": \"insert_after\", \"text\": \"x\", \"confidence\": 0.5,},]\n```";
        let (ops, warning) = parse_edit_plan(raw);
        assert_eq!(ops.len(), 1);
        assert!(warning.is_none());
    }

    #[test]
    fn parse_edit_plan_degrades_gracefully_on_unrecoverable_json() {
        let (ops, warning) = parse_edit_plan("not json at all {{{");
        assert!(ops.is_empty());
        assert!(warning.is_some());
    }

    struct StubGenerator;

    #[async_trait]
    impl ContentGenerator for StubGenerator {
        fn agent_type(&self) -> &str {
            "stub_agent"
        }

        fn capabilities(&self) -> &[String] {
            &[]
        }

        async fn generate(&self, _ctx: &GraphContext, llm: &dyn LlmClient, cancel: &CancelSignal) -> CoreResult<GenerateOutput> {
            let text = llm
                .invoke(
                    crate::llm::LlmRequest {
                        system: "you are a test agent".into(),
                        messages: vec![],
                        temperature: 0.0,
                        model_hint: None,
                        reasoning_effort: None,
                    },
                    cancel,
                )
                .await?;
            Ok(GenerateOutput { response_text: text, raw_operations_json: None, data_outputs: HashMap::new(), tools_used: vec![] })
        }
    }

    #[tokio::test]
    async fn node_graph_produces_a_successful_result_in_generation_mode() {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let cancel = CancelSignal::new(rx);
        let llm = crate::llm::FakeLlmClient::new("generated article text");
        let result = run_node_graph(&StubGenerator, AgentNodeInput::default(), &llm, &cancel).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.response, "generated article text");
    }
}
