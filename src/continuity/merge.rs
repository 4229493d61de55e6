//! Merge and prune (§4.7, §8 invariant 8): fold an extracted patch into an
//! existing `ContinuityState`, then bound every collection so the state
//! never grows without limit across a long manuscript.
//!
//! Grounded on `fiction_continuity_tracker.py`'s `_merge_continuity_states`
//! and `_prune_continuity_state`.

use std::collections::HashSet;

use super::extract::{raw_change_into, raw_character_into, raw_thread_into, raw_tension_into, ContinuityPatch};
use super::types::{CharacterState, ContinuityState, PlotThread, ThreadStatus};

const MAX_KNOWS_ABOUT: usize = 20;
const MAX_HAS_ITEMS: usize = 15;
const MAX_INJURIES: usize = 5;
const MAX_KEY_EVENTS: usize = 12;
const MAX_UNRESOLVED_QUESTIONS: usize = 8;
const MAX_TIMELINE: usize = 30;
const TIMELINE_RECENT_CHAPTERS: u32 = 25;
const RESOLVED_THREAD_RETENTION_CHAPTERS: u32 = 5;
const STALE_TENSION_CHAPTERS: u32 = 10;
const MAX_WORLD_STATE_CHANGES: usize = 50;
const WORLD_STATE_RECENT_CHAPTERS: u32 = 20;

/// Merge `patch` into `existing` at `chapter_number`, then prune. Mutates
/// and returns `existing` (the source's in-place merge shape).
pub fn merge_and_prune(mut existing: ContinuityState, patch: ContinuityPatch, chapter_number: u32) -> ContinuityState {
    for (name, raw) in patch.character_states {
        existing
            .character_states
            .entry(name.clone())
            .and_modify(|old| merge_character(old, &raw, chapter_number))
            .or_insert_with(|| raw_character_into(&name, chapter_number, clone_raw_character(&raw)));
    }

    for (thread_id, raw) in patch.plot_threads {
        existing
            .plot_threads
            .entry(thread_id.clone())
            .and_modify(|old| merge_thread(old, &raw, chapter_number))
            .or_insert_with(|| raw_thread_into(&thread_id, chapter_number, clone_raw_thread(&raw)));
    }

    existing.timeline.extend(patch.timeline);

    existing.world_state_changes.extend(patch.world_state_changes.into_iter().map(|raw| raw_change_into(chapter_number, raw)));

    for (tension_id, raw) in patch.unresolved_tensions {
        if let Some(old) = existing.unresolved_tensions.get_mut(&tension_id) {
            old.description = raw.description.clone().unwrap_or_else(|| old.description.clone());
            old.tension_type = super::extract::parse_tension_type(raw.tension_type.as_deref().unwrap_or("mystery"));
            if !raw.involves_characters.is_empty() {
                old.involves_characters = raw.involves_characters.clone();
            }
            if raw.stakes.is_some() {
                old.stakes = raw.stakes.clone();
            }
            old.last_escalated_chapter = chapter_number;
        } else {
            existing.unresolved_tensions.insert(tension_id.clone(), raw_tension_into(&tension_id, chapter_number, raw));
        }
    }

    existing.last_analyzed_chapter = chapter_number;
    existing.last_updated = chrono::Utc::now();
    if let Some(summary) = patch.current_chapter_summary {
        existing.current_chapter_summary = Some(summary);
    }

    prune(&mut existing, chapter_number);
    existing
}

fn clone_raw_character(raw: &super::extract::RawCharacterState) -> super::extract::RawCharacterState {
    super::extract::RawCharacterState {
        location: raw.location.clone(),
        emotional_state: raw.emotional_state.clone(),
        knows_about: raw.knows_about.clone(),
        relationships: raw.relationships.clone(),
        injuries_or_conditions: raw.injuries_or_conditions.clone(),
        has_items: raw.has_items.clone(),
    }
}

fn clone_raw_thread(raw: &super::extract::RawPlotThread) -> super::extract::RawPlotThread {
    super::extract::RawPlotThread {
        thread_name: raw.thread_name.clone(),
        description: raw.description.clone(),
        status: raw.status.clone(),
        key_events: raw.key_events.clone(),
        unresolved_questions: raw.unresolved_questions.clone(),
        expected_resolution_chapter: raw.expected_resolution_chapter,
    }
}

/// Union `old` and `new`, deduplicating by value while keeping each value's
/// last occurrence in its later position. `prune`'s front-truncation relies
/// on this ordering to evict the oldest facts, not an arbitrary hash order
/// (§8 invariant 8).
fn union_preserving_order(old: Vec<String>, new: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut combined = old;
    combined.extend(new);
    let mut seen = HashSet::with_capacity(combined.len());
    let mut out = Vec::with_capacity(combined.len());
    for item in combined.into_iter().rev() {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out.reverse();
    out
}

/// Per-character fields overwritten with newest non-null; `knows_about` and
/// `has_items` unioned (§4.7).
fn merge_character(old: &mut CharacterState, new: &super::extract::RawCharacterState, chapter_number: u32) {
    old.chapter_number = chapter_number;
    if new.location.is_some() {
        old.location = new.location.clone();
    }
    if new.emotional_state.is_some() {
        old.emotional_state = new.emotional_state.clone();
    }

    old.knows_about = union_preserving_order(std::mem::take(&mut old.knows_about), new.knows_about.iter().cloned());
    old.has_items = union_preserving_order(std::mem::take(&mut old.has_items), new.has_items.iter().cloned());

    for (k, v) in &new.relationships {
        old.relationships.insert(k.clone(), v.clone());
    }

    if !new.injuries_or_conditions.is_empty() {
        old.injuries_or_conditions = new.injuries_or_conditions.clone();
    }
}

/// `last_mentioned_chapter` updated; `key_events` appended; if the thread
/// becomes `resolved`, its old `unresolved_questions` are cleared (§4.7).
fn merge_thread(old: &mut PlotThread, new: &super::extract::RawPlotThread, chapter_number: u32) {
    if let Some(name) = &new.thread_name {
        old.thread_name = name.clone();
    }
    if let Some(description) = &new.description {
        old.description = description.clone();
    }
    old.last_mentioned_chapter = chapter_number;
    old.key_events.extend(new.key_events.iter().cloned());

    let new_status = new.status.as_deref().map(super::extract::parse_thread_status).unwrap_or(old.status);
    if new_status == ThreadStatus::Resolved {
        old.unresolved_questions = new.unresolved_questions.clone();
    } else {
        old.unresolved_questions =
            union_preserving_order(std::mem::take(&mut old.unresolved_questions), new.unresolved_questions.iter().cloned());
    }
    old.status = new_status;

    if new.expected_resolution_chapter.is_some() {
        old.expected_resolution_chapter = new.expected_resolution_chapter;
    }
}

/// Bound every collection in `state` (§8 invariant 8).
pub fn prune(state: &mut ContinuityState, current_chapter: u32) {
    for char_state in state.character_states.values_mut() {
        if char_state.knows_about.len() > MAX_KNOWS_ABOUT {
            let start = char_state.knows_about.len() - MAX_KNOWS_ABOUT;
            char_state.knows_about.drain(..start);
        }
        if char_state.has_items.len() > MAX_HAS_ITEMS {
            let start = char_state.has_items.len() - MAX_HAS_ITEMS;
            char_state.has_items.drain(..start);
        }
        if char_state.injuries_or_conditions.len() > MAX_INJURIES {
            let start = char_state.injuries_or_conditions.len() - MAX_INJURIES;
            char_state.injuries_or_conditions.drain(..start);
        }
    }

    state.plot_threads.retain(|_, thread| {
        !(thread.status == ThreadStatus::Resolved && current_chapter.saturating_sub(thread.last_mentioned_chapter) > RESOLVED_THREAD_RETENTION_CHAPTERS)
    });
    for thread in state.plot_threads.values_mut() {
        if thread.key_events.len() > MAX_KEY_EVENTS {
            let start = thread.key_events.len() - MAX_KEY_EVENTS;
            thread.key_events.drain(..start);
        }
        if thread.unresolved_questions.len() > MAX_UNRESOLVED_QUESTIONS {
            let start = thread.unresolved_questions.len() - MAX_UNRESOLVED_QUESTIONS;
            thread.unresolved_questions.drain(..start);
        }
    }

    if state.timeline.len() > MAX_TIMELINE {
        let recent_chapters = current_chapter.saturating_sub(TIMELINE_RECENT_CHAPTERS).max(1);
        state.timeline.retain(|marker| marker.chapter_number >= recent_chapters);
        if state.timeline.len() > MAX_TIMELINE {
            let start = state.timeline.len() - MAX_TIMELINE;
            state.timeline.drain(..start);
        }
    }

    state
        .unresolved_tensions
        .retain(|_, tension| current_chapter.saturating_sub(tension.last_escalated_chapter) <= STALE_TENSION_CHAPTERS);

    if state.world_state_changes.len() > MAX_WORLD_STATE_CHANGES {
        let recent_cutoff = current_chapter.saturating_sub(WORLD_STATE_RECENT_CHAPTERS).max(1);
        state.world_state_changes.retain(|change| change.is_permanent || change.chapter_number >= recent_cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuity::types::{ThreadStatus, TimeType};
    use uuid::Uuid;

    fn empty_state() -> ContinuityState {
        ContinuityState::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn knows_about_unions_then_truncates_to_twenty() {
        let mut state = empty_state();
        for chapter in 1..=40u32 {
            let patch_json = serde_json::json!({
                "character_states": {
                    "Alice": { "knows_about": [format!("fact_{chapter}")] }
                }
            });
            let patch: super::super::extract::ContinuityPatch = serde_json::from_value(patch_json).unwrap();
            state = merge_and_prune(state, patch, chapter);
        }
        assert_eq!(state.character_states["Alice"].knows_about.len(), 20);
        assert!(state.character_states["Alice"].knows_about.contains(&"fact_40".to_string()));
        assert!(!state.character_states["Alice"].knows_about.contains(&"fact_1".to_string()));
    }

    #[test]
    fn resolved_thread_clears_old_questions() {
        let mut state = empty_state();
        let patch1 = serde_json::from_value(serde_json::json!({
            "plot_threads": {
                "mystery": { "status": "active", "unresolved_questions": ["who did it"] }
            }
        }))
        .unwrap();
        state = merge_and_prune(state, patch1, 1);
        assert_eq!(state.plot_threads["mystery"].unresolved_questions.len(), 1);

        let patch2 = serde_json::from_value(serde_json::json!({
            "plot_threads": {
                "mystery": { "status": "resolved", "unresolved_questions": [] }
            }
        }))
        .unwrap();
        state = merge_and_prune(state, patch2, 2);
        assert!(state.plot_threads["mystery"].unresolved_questions.is_empty());
        assert_eq!(state.plot_threads["mystery"].status, ThreadStatus::Resolved);
    }

    #[test]
    fn resolved_thread_is_dropped_after_retention_window() {
        let mut state = empty_state();
        let patch = serde_json::from_value(serde_json::json!({
            "plot_threads": { "t1": { "status": "resolved" } }
        }))
        .unwrap();
        state = merge_and_prune(state, patch, 1);
        assert!(state.plot_threads.contains_key("t1"));

        let noop = ContinuityPatch::default();
        state = merge_and_prune(state, noop, 10);
        assert!(!state.plot_threads.contains_key("t1"));
    }

    #[test]
    fn stale_tension_is_pruned_after_ten_chapters() {
        let mut state = empty_state();
        let patch = serde_json::from_value(serde_json::json!({
            "unresolved_tensions": { "t1": { "description": "x", "tension_type": "mystery" } }
        }))
        .unwrap();
        state = merge_and_prune(state, patch, 1);
        assert!(state.unresolved_tensions.contains_key("t1"));

        let noop = ContinuityPatch::default();
        state = merge_and_prune(state, noop, 12);
        assert!(!state.unresolved_tensions.contains_key("t1"));
    }

    #[test]
    fn timeline_is_bounded_to_thirty_markers() {
        let mut state = empty_state();
        state.timeline = (1..=50u32)
            .map(|n| crate::continuity::types::TimeMarker { chapter_number: n, time_type: TimeType::TimeOfDay, description: "x".into(), time_of_day: None })
            .collect();
        prune(&mut state, 50);
        assert!(state.timeline.len() <= 30);
    }
}
