//! Continuity Tracker (§4.7, component G): per-(user, manuscript) tracked
//! state for characters, plot threads, timeline and world changes, kept
//! current by folding LLM-extracted patches chapter by chapter, and used to
//! validate new content against what's already been established.
//!
//! Grounded on `fiction_continuity_tracker.py`'s `FictionContinuityTracker`.

mod extract;
mod merge;
mod validate;
mod types;

pub use types::{
    ChangeType, CharacterState, ContinuityState, ContinuityValidationResult, ContinuityViolation, PlotThread, TensionType, ThreadStatus, TimeMarker,
    TimeType, UnresolvedTension, ViolationSeverity,
};

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::llm::{CancelSignal, LlmClient, LlmMessage, LlmRequest};

const EXTRACTION_TEMPERATURE: f32 = 0.2;

/// One row per `(user_id, manuscript_id)` (§6 "Persisted state layout").
/// Process-lifetime storage, same granularity as the Shared Memory Store
/// (component A) — continuity state has no dedicated SQLite path in
/// `CoreConfig` the way checkpoints and messaging do, so it stays an
/// in-process map keyed the same way the registry looks it up.
#[derive(Default)]
pub struct ContinuityStore {
    states: DashMap<(Uuid, Uuid), ContinuityState>,
}

impl ContinuityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: Uuid, manuscript_id: Uuid) -> CoreResult<ContinuityState> {
        self.states
            .get(&(user_id, manuscript_id))
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::NotFound(format!("continuity state for manuscript {manuscript_id}")))
    }

    pub fn upsert(&self, state: ContinuityState) {
        self.states.insert((state.user_id, state.manuscript_id), state);
    }
}

/// `^## Chapter N` headings split a manuscript into chapters (§4.7).
static CHAPTER_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^##\s+Chapter\s+(\d+)\b.*$").unwrap());

pub struct ContinuityTracker {
    llm: Arc<dyn LlmClient>,
}

impl ContinuityTracker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Extract continuity facts from one chapter and fold them into
    /// `existing`. A second JSON-repair failure preserves `existing`
    /// unchanged rather than failing the step (§4.7).
    pub async fn extract_continuity_from_chapter(
        &self,
        cancel: &CancelSignal,
        existing: ContinuityState,
        chapter_text: &str,
        chapter_number: u32,
    ) -> CoreResult<ContinuityState> {
        let prompt = extract::build_extraction_prompt(chapter_text, chapter_number, Some(&existing));
        let raw = self
            .llm
            .invoke(
                LlmRequest {
                    system: "You are a continuity tracker for serialized fiction. Respond with JSON only.".to_string(),
                    messages: vec![LlmMessage { role: "user".to_string(), content: prompt }],
                    temperature: EXTRACTION_TEMPERATURE,
                    model_hint: None,
                    reasoning_effort: None,
                },
                cancel,
            )
            .await?;

        match extract::parse_continuity_patch(&raw) {
            (Some(patch), _) => Ok(merge::merge_and_prune(existing, patch, chapter_number)),
            (None, warning) => {
                if let Some(warning) = warning {
                    log::warn!("chapter {chapter_number} continuity extraction dropped: {warning}");
                }
                Ok(existing)
            }
        }
    }

    /// Split a manuscript on `## Chapter N` headings and fold each chapter
    /// through [`Self::extract_continuity_from_chapter`] in order.
    pub async fn extract_continuity_from_manuscript(
        &self,
        cancel: &CancelSignal,
        manuscript_id: Uuid,
        user_id: Uuid,
        manuscript_text: &str,
    ) -> CoreResult<ContinuityState> {
        let mut state = ContinuityState::new(manuscript_id, user_id);
        for (chapter_number, chapter_text) in split_chapters(manuscript_text) {
            state = self.extract_continuity_from_chapter(cancel, state, &chapter_text, chapter_number).await?;
        }
        Ok(state)
    }

    /// Check `new_content` against `state` for continuity violations.
    /// Read-only: never mutates `state` (§4.7).
    pub async fn validate_new_content(
        &self,
        cancel: &CancelSignal,
        new_content: &str,
        chapter_number: u32,
        state: &ContinuityState,
    ) -> CoreResult<ContinuityValidationResult> {
        validate::validate_new_content(self.llm.as_ref(), cancel, new_content, chapter_number, state).await
    }

    /// A short human-readable digest of tracked state, for surfacing to a
    /// caller without exposing the full structure.
    pub fn summarize(state: &ContinuityState) -> String {
        let active_threads = state.plot_threads.values().filter(|t| t.status == ThreadStatus::Active).count();
        let open_tensions = state.unresolved_tensions.len();
        format!(
            "Chapter {}: tracking {} characters, {} active plot threads, {} unresolved tensions, {} timeline events.",
            state.last_analyzed_chapter,
            state.character_states.len(),
            active_threads,
            open_tensions,
            state.timeline.len(),
        )
    }
}

fn split_chapters(manuscript_text: &str) -> Vec<(u32, String)> {
    let headings: Vec<(usize, u32)> = CHAPTER_PATTERN
        .captures_iter(manuscript_text)
        .filter_map(|c| {
            let m = c.get(0)?;
            let number: u32 = c.get(1)?.as_str().parse().ok()?;
            Some((m.start(), number))
        })
        .collect();

    let mut chapters = Vec::with_capacity(headings.len());
    for (i, &(start, number)) in headings.iter().enumerate() {
        let end = headings.get(i + 1).map(|(s, _)| *s).unwrap_or(manuscript_text.len());
        chapters.push((number, manuscript_text[start..end].to_string()));
    }
    chapters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_chapters_finds_each_heading() {
        let manuscript = "## Chapter 1\nAlice arrives.\n\n## Chapter 2\nBob leaves.\n";
        let chapters = split_chapters(manuscript);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].0, 1);
        assert!(chapters[0].1.contains("Alice arrives"));
        assert_eq!(chapters[1].0, 2);
        assert!(chapters[1].1.contains("Bob leaves"));
    }

    #[tokio::test]
    async fn manuscript_extraction_folds_chapters_in_order() {
        let llm = Arc::new(crate::llm::FakeLlmClient::new(
            r#"{"character_states": {"Alice": {"knows_about": ["the secret"]}}}"#,
        ));
        let tracker = ContinuityTracker::new(llm);
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let cancel = CancelSignal::new(rx);
        let manuscript = "## Chapter 1\nAlice arrives.\n\n## Chapter 2\nAlice leaves.\n";
        let state = tracker.extract_continuity_from_manuscript(&cancel, Uuid::new_v4(), Uuid::new_v4(), manuscript).await.unwrap();
        assert_eq!(state.last_analyzed_chapter, 2);
        assert_eq!(state.character_states["Alice"].knows_about, vec!["the secret".to_string()]);
    }

    #[test]
    fn store_round_trips_by_user_and_manuscript() {
        let store = ContinuityStore::new();
        let user_id = Uuid::new_v4();
        let manuscript_id = Uuid::new_v4();
        store.upsert(ContinuityState::new(manuscript_id, user_id));
        assert!(store.get(user_id, manuscript_id).is_ok());
        assert!(store.get(Uuid::new_v4(), manuscript_id).is_err());
    }

    #[tokio::test]
    async fn unparseable_extraction_preserves_existing_state() {
        let llm = Arc::new(crate::llm::FakeLlmClient::new("not json at all {{{"));
        let tracker = ContinuityTracker::new(llm);
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let cancel = CancelSignal::new(rx);
        let existing = ContinuityState::new(Uuid::new_v4(), Uuid::new_v4());
        let before = existing.last_analyzed_chapter;
        let state = tracker.extract_continuity_from_chapter(&cancel, existing, "some chapter text", 3).await.unwrap();
        assert_eq!(state.last_analyzed_chapter, before);
    }
}
