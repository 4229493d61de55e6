//! Workflow templates (§4.5): named DAGs of steps, shipped as data and
//! registered at startup; callers may also submit a fully dynamic plan,
//! validated the same way a template's steps are.

use std::collections::{HashMap, HashSet};

use crate::error::{CoreError, CoreResult};

use super::types::{Step, StepStatus};

/// One step as it appears in a template, before `max_retries`/status are
/// attached to a concrete workflow instance.
#[derive(Debug, Clone)]
pub struct StepTemplate {
    pub step_id: &'static str,
    pub agent_type: &'static str,
    pub task_description: &'static str,
    pub input_requirements: &'static [&'static str],
    pub output_specifications: &'static [&'static str],
    pub depends_on: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub max_parallel: usize,
    pub steps: &'static [StepTemplate],
}

/// `research_analysis_synthesis`: research feeds analysis, analysis feeds
/// synthesis — a strictly sequential three-step chain.
pub const RESEARCH_ANALYSIS_SYNTHESIS: WorkflowTemplate = WorkflowTemplate {
    name: "research_analysis_synthesis",
    description: "Multi-stage research with analysis and synthesis",
    max_parallel: 4,
    steps: &[
        StepTemplate {
            step_id: "research_phase",
            agent_type: "research",
            task_description: "Conduct comprehensive research on the topic",
            input_requirements: &["user_query", "research_scope"],
            output_specifications: &["research_findings", "source_citations", "confidence_metrics"],
            depends_on: &[],
        },
        StepTemplate {
            step_id: "analysis_phase",
            agent_type: "analysis",
            task_description: "Analyze research findings for patterns and insights",
            input_requirements: &["research_findings", "analysis_framework"],
            output_specifications: &["key_insights", "patterns_identified", "recommendations"],
            depends_on: &["research_phase"],
        },
        StepTemplate {
            step_id: "synthesis_phase",
            agent_type: "synthesis",
            task_description: "Synthesize analysis into a comprehensive response",
            input_requirements: &["key_insights", "user_intent"],
            output_specifications: &["final_response", "supporting_evidence"],
            depends_on: &["analysis_phase"],
        },
    ],
};

/// `research_coding_implementation`: research technical approaches, design,
/// then implement — also sequential.
pub const RESEARCH_CODING_IMPLEMENTATION: WorkflowTemplate = WorkflowTemplate {
    name: "research_coding_implementation",
    description: "Research technical solutions then implement code",
    max_parallel: 4,
    steps: &[
        StepTemplate {
            step_id: "technical_research",
            agent_type: "research",
            task_description: "Research technical approaches and best practices",
            input_requirements: &["technical_requirements", "constraints"],
            output_specifications: &["technical_approaches", "code_examples", "best_practices"],
            depends_on: &[],
        },
        StepTemplate {
            step_id: "solution_design",
            agent_type: "coding",
            task_description: "Design solution architecture based on research",
            input_requirements: &["technical_approaches", "requirements"],
            output_specifications: &["solution_architecture", "implementation_plan"],
            depends_on: &["technical_research"],
        },
        StepTemplate {
            step_id: "code_implementation",
            agent_type: "coding",
            task_description: "Implement the designed solution",
            input_requirements: &["solution_architecture", "implementation_plan"],
            output_specifications: &["implemented_code", "documentation", "usage_examples"],
            depends_on: &["solution_design"],
        },
    ],
};

/// `parallel_research_synthesis`: two independent research steps (the
/// diamond shape of §8's "boundary behaviours") fan in to one synthesis
/// step, which only becomes ready once both complete.
pub const PARALLEL_RESEARCH_SYNTHESIS: WorkflowTemplate = WorkflowTemplate {
    name: "parallel_research_synthesis",
    description: "Multiple research agents exploring different aspects",
    max_parallel: 4,
    steps: &[
        StepTemplate {
            step_id: "primary_research",
            agent_type: "research",
            task_description: "Primary research on the main topic",
            input_requirements: &["main_topic", "research_depth"],
            output_specifications: &["primary_findings", "core_sources"],
            depends_on: &[],
        },
        StepTemplate {
            step_id: "secondary_research",
            agent_type: "research",
            task_description: "Secondary research on related aspects",
            input_requirements: &["related_topics", "research_scope"],
            output_specifications: &["secondary_findings", "supporting_sources"],
            depends_on: &[],
        },
        StepTemplate {
            step_id: "synthesis_coordination",
            agent_type: "synthesis",
            task_description: "Synthesize findings from multiple research streams",
            input_requirements: &["primary_findings", "secondary_findings"],
            output_specifications: &["comprehensive_analysis", "integrated_insights"],
            depends_on: &["primary_research", "secondary_research"],
        },
    ],
};

/// Registry of shipped templates, plus any registered at startup by a
/// caller (§4.5: "new ones can be registered at startup").
#[derive(Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, WorkflowTemplate>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        let mut templates = HashMap::new();
        for tpl in [RESEARCH_ANALYSIS_SYNTHESIS, RESEARCH_CODING_IMPLEMENTATION, PARALLEL_RESEARCH_SYNTHESIS] {
            templates.insert(tpl.name.to_string(), tpl);
        }
        Self { templates }
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: WorkflowTemplate) {
        self.templates.insert(template.name.to_string(), template);
    }

    pub fn get(&self, name: &str) -> CoreResult<&WorkflowTemplate> {
        self.templates.get(name).ok_or_else(|| CoreError::BadInput(format!("unknown workflow template: {name}")))
    }

    pub fn build_steps(&self, name: &str) -> CoreResult<(Vec<Step>, usize)> {
        let template = self.get(name)?;
        let steps = template
            .steps
            .iter()
            .map(|t| Step {
                step_id: t.step_id.to_string(),
                agent_type: t.agent_type.to_string(),
                task_description: t.task_description.to_string(),
                input_requirements: t.input_requirements.iter().map(|s| s.to_string()).collect(),
                output_specifications: t.output_specifications.iter().map(|s| s.to_string()).collect(),
                depends_on: t.depends_on.iter().map(|s| s.to_string()).collect(),
                status: StepStatus::Pending,
                retry_count: 0,
                max_retries: 2,
                result: None,
                failure_reason: None,
                retry_not_before: None,
            })
            .collect();
        Ok((steps, template.max_parallel))
    }
}

/// Validate a caller-submitted dynamic plan (§4.5: "validated (acyclicity,
/// unknown agent types, dangling `depends_on`) before accepted").
/// `known_agent_types` is the set of registered agent types; an unknown
/// type is rejected here rather than deferred to step-execution time.
pub fn validate_plan(steps: &[Step], known_agent_types: &HashSet<String>) -> CoreResult<()> {
    if steps.is_empty() {
        return Err(CoreError::BadInput("plan must contain at least one step".into()));
    }

    let step_ids: HashSet<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
    if step_ids.len() != steps.len() {
        return Err(CoreError::BadInput("duplicate step_id in plan".into()));
    }

    for step in steps {
        if !known_agent_types.contains(&step.agent_type) {
            return Err(CoreError::BadInput(format!("unknown agent type in plan: {}", step.agent_type)));
        }
        for dep in &step.depends_on {
            if !step_ids.contains(dep.as_str()) {
                return Err(CoreError::BadInput(format!("dangling depends_on: {dep} (referenced by {})", step.step_id)));
            }
        }
    }

    detect_cycle(steps)?;
    Ok(())
}

fn detect_cycle(steps: &[Step]) -> CoreResult<()> {
    #[derive(PartialEq, Clone, Copy)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.step_id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> = steps.iter().map(|s| (s.step_id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Step>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> CoreResult<()> {
        match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(CoreError::BadInput(format!("cyclic plan: cycle through {id}"))),
            Mark::Unvisited => {}
        }
        marks.insert(id, Mark::InProgress);
        if let Some(step) = by_id.get(id) {
            for dep in &step.depends_on {
                visit(dep.as_str(), by_id, marks)?;
            }
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for id in by_id.keys() {
        visit(id, &by_id, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            step_id: id.to_string(),
            agent_type: "research".to_string(),
            task_description: "x".into(),
            input_requirements: vec![],
            output_specifications: vec![],
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: 2,
            result: None,
            failure_reason: None,
            retry_not_before: None,
        }
    }

    fn known() -> HashSet<String> {
        ["research".to_string()].into_iter().collect()
    }

    #[test]
    fn shipped_templates_build_without_error() {
        let registry = TemplateRegistry::new();
        for name in ["research_analysis_synthesis", "research_coding_implementation", "parallel_research_synthesis"] {
            let (steps, max_parallel) = registry.build_steps(name).unwrap();
            assert!(!steps.is_empty());
            assert!(max_parallel > 0);
        }
    }

    #[test]
    fn unknown_template_is_bad_input() {
        let registry = TemplateRegistry::new();
        assert!(matches!(registry.get("does_not_exist"), Err(CoreError::BadInput(_))));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let steps = vec![step("a", &["missing"])];
        assert!(matches!(validate_plan(&steps, &known()), Err(CoreError::BadInput(_))));
    }

    #[test]
    fn cyclic_plan_is_rejected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert!(matches!(validate_plan(&steps, &known()), Err(CoreError::BadInput(_))));
    }

    #[test]
    fn unknown_agent_type_is_rejected() {
        let mut s = step("a", &[]);
        s.agent_type = "not_registered".into();
        assert!(matches!(validate_plan(&[s], &known()), Err(CoreError::BadInput(_))));
    }

    #[test]
    fn acyclic_diamond_plan_is_accepted() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a"]), step("d", &["b", "c"])];
        assert!(validate_plan(&steps, &known()).is_ok());
    }
}
