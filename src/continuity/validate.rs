//! Content validation against tracked continuity state (§4.7): read-only —
//! it never mutates a `ContinuityState`, only reports violations against it.
//!
//! Grounded on `fiction_continuity_tracker.py`'s `_build_validation_prompt`/
//! `validate_new_content`.

use crate::llm::{CancelSignal, LlmClient, LlmRequest};
use crate::error::CoreResult;

use super::types::{ContinuityState, ContinuityValidationResult};

const VALIDATION_TEMPERATURE: f32 = 0.1;

/// Build the validation prompt: the proposed new content plus a digest of
/// tracked character states, active plot threads, recent timeline entries,
/// and permanent world changes for the LLM to check it against.
pub fn build_validation_prompt(new_content: &str, chapter_number: u32, state: &ContinuityState) -> String {
    let mut prompt = format!("=== CONTINUITY VALIDATION TASK ===\nCheck Chapter {chapter_number} for continuity violations against tracked state.\n\n=== NEW CONTENT ===\n{new_content}\n\n");

    prompt.push_str("=== CHARACTER STATES ===\n");
    for character in state.character_states.values() {
        prompt.push_str(&format!(
            "{}: location={:?}, knows_about={:?}, has_items={:?}, injuries={:?}\n",
            character.character_name, character.location, character.knows_about, character.has_items, character.injuries_or_conditions
        ));
    }

    prompt.push_str("\n=== ACTIVE PLOT THREADS ===\n");
    for thread in state.plot_threads.values().filter(|t| t.status == super::types::ThreadStatus::Active) {
        prompt.push_str(&format!("{}: {} (last mentioned ch. {})\n", thread.thread_name, thread.description, thread.last_mentioned_chapter));
    }

    prompt.push_str("\n=== RECENT TIMELINE ===\n");
    for marker in state.timeline.iter().rev().take(10) {
        prompt.push_str(&format!("ch.{}: {}\n", marker.chapter_number, marker.description));
    }

    prompt.push_str("\n=== PERMANENT WORLD CHANGES ===\n");
    for change in state.world_state_changes.iter().filter(|c| c.is_permanent) {
        prompt.push_str(&format!("ch.{}: {}\n", change.chapter_number, change.description));
    }

    prompt.push_str(
        "\n=== YOUR TASK ===\nReturn ONLY valid JSON: \
         {\"is_valid\": bool, \"violations\": [{\"violation_type\", \"severity\", \"description\", \
         \"expected\", \"found\", \"affected_character\", \"suggestion\"}], \"warnings\": [string], \
         \"confidence\": float}.\n",
    );
    prompt
}

/// §4.7: on unrecoverable JSON failure, validation fails open rather than
/// blocking the caller — `is_valid: true` with a low confidence score and a
/// warning, matching the source's safe-fallback behaviour.
pub async fn validate_new_content(
    llm: &dyn LlmClient,
    cancel: &CancelSignal,
    new_content: &str,
    chapter_number: u32,
    state: &ContinuityState,
) -> CoreResult<ContinuityValidationResult> {
    let prompt = build_validation_prompt(new_content, chapter_number, state);
    let raw = llm
        .invoke(
            LlmRequest {
                system: "You are a continuity checker for serialized fiction. Respond with JSON only.".to_string(),
                messages: vec![crate::llm::LlmMessage { role: "user".to_string(), content: prompt }],
                temperature: VALIDATION_TEMPERATURE,
                model_hint: None,
                reasoning_effort: None,
            },
            cancel,
        )
        .await?;

    Ok(parse_validation_result(&raw))
}

fn parse_validation_result(raw: &str) -> ContinuityValidationResult {
    if let Ok(result) = serde_json::from_str::<ContinuityValidationResult>(raw) {
        return result;
    }

    let repaired = strip_code_fences(raw);
    let repaired = strip_trailing_commas(&repaired);
    match serde_json::from_str::<ContinuityValidationResult>(&repaired) {
        Ok(result) => result,
        Err(e) => {
            log::warn!("continuity validation JSON unparseable after repair, failing open: {e}");
            ContinuityValidationResult {
                is_valid: true,
                violations: Vec::new(),
                warnings: vec!["Failed to fully validate continuity - proceeding with caution".to_string()],
                confidence: 0.3,
            }
        }
    }
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fences = trimmed.strip_prefix("```json").or_else(|| trimmed.strip_prefix("```")).unwrap_or(trimmed);
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

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn validates_against_fake_client() {
        let state = ContinuityState::new(Uuid::new_v4(), Uuid::new_v4());
        let llm = crate::llm::FakeLlmClient::new(r#"{"is_valid": true, "violations": [], "warnings": [], "confidence": 0.9}"#);
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let cancel = CancelSignal::new(rx);
        let result = validate_new_content(&llm, &cancel, "Alice walked in.", 3, &state).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn unparseable_response_fails_open() {
        let result = parse_validation_result("not json at all {{{");
        assert!(result.is_valid);
        assert_eq!(result.confidence, 0.3);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn fenced_json_is_repaired() {
        let raw = "```json\n{\"is_valid\": false, \"violations\": [], \"warnings\": [],  \"confidence\": 0.7,}\n```";
        let result = parse_validation_result(raw);
        assert!(!result.is_valid);
        assert_eq!(result.confidence, 0.7);
    }
}
