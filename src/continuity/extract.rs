//! Continuity extraction (§4.7): build the extraction prompt, parse the
//! LLM's patch with the same repair-once policy as the edit resolver's JSON
//! intake, and normalise enum-like fields before the patch is merged.
//!
//! Grounded directly on `fiction_continuity_tracker.py`'s
//! `_build_extraction_prompt`/`_extract_json_from_response`/
//! `_validate_and_fix_continuity_data`/`_fix_json_common_issues`.

use std::collections::HashMap;

use serde::Deserialize;

use super::types::{CharacterState, ChangeType, PlotThread, ThreadStatus, TensionType, TimeMarker, UnresolvedTension, WorldStateChange};

/// A loosely-typed patch as emitted by the LLM, before per-field
/// normalisation. Mirrors the source's plain `Dict[str, Any]` intermediate.
#[derive(Debug, Default, Deserialize)]
pub struct ContinuityPatch {
    #[serde(default)]
    pub character_states: HashMap<String, RawCharacterState>,
    #[serde(default)]
    pub plot_threads: HashMap<String, RawPlotThread>,
    #[serde(default)]
    pub timeline: Vec<TimeMarker>,
    #[serde(default)]
    pub world_state_changes: Vec<RawWorldStateChange>,
    #[serde(default)]
    pub unresolved_tensions: HashMap<String, RawUnresolvedTension>,
    #[serde(default)]
    pub current_chapter_summary: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawCharacterState {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub emotional_state: Option<String>,
    #[serde(default)]
    pub knows_about: Vec<String>,
    #[serde(default)]
    pub relationships: HashMap<String, String>,
    #[serde(default)]
    pub injuries_or_conditions: Vec<String>,
    #[serde(default)]
    pub has_items: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawPlotThread {
    #[serde(default)]
    pub thread_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub unresolved_questions: Vec<String>,
    #[serde(default)]
    pub expected_resolution_chapter: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RawWorldStateChange {
    #[serde(default)]
    pub chapter_number: Option<u32>,
    #[serde(default)]
    pub change_type: String,
    pub description: String,
    #[serde(default)]
    pub affects: Vec<String>,
    #[serde(default)]
    pub is_permanent: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RawUnresolvedTension {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tension_type: Option<String>,
    #[serde(default)]
    pub involves_characters: Vec<String>,
    #[serde(default)]
    pub stakes: Option<String>,
}

/// §4.7: "Malformed JSON is repaired once; a second failure preserves
/// existing state and logs a warning." Returns `None` on the second
/// failure; the caller is responsible for preserving `existing_state`.
pub fn parse_continuity_patch(raw: &str) -> (Option<ContinuityPatch>, Option<String>) {
    if let Ok(patch) = serde_json::from_str::<ContinuityPatch>(raw) {
        return (Some(normalize_patch(patch)), None);
    }

    let repaired = strip_code_fences(raw);
    let repaired = strip_trailing_commas(&repaired);
    match serde_json::from_str::<ContinuityPatch>(&repaired) {
        Ok(patch) => (Some(normalize_patch(patch)), None),
        Err(e) => (None, Some(format!("continuity patch JSON unparseable after repair: {e}"))),
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

/// Coerce enum-like string fields into the canonical enum values, mirroring
/// `_validate_and_fix_continuity_data`'s remapping table.
fn normalize_patch(mut patch: ContinuityPatch) -> ContinuityPatch {
    for thread in patch.plot_threads.values_mut() {
        thread.status = Some(normalize_thread_status(thread.status.as_deref()));
    }
    for tension in patch.unresolved_tensions.values_mut() {
        tension.tension_type = Some(normalize_tension_type(tension.tension_type.as_deref()));
    }
    patch
}

fn normalize_thread_status(raw: Option<&str>) -> String {
    match raw {
        Some("active") | Some("resolved") | Some("abandoned") | Some("background") => raw.unwrap().to_string(),
        _ => "active".to_string(),
    }
}

pub fn parse_thread_status(raw: &str) -> ThreadStatus {
    match raw {
        "resolved" => ThreadStatus::Resolved,
        "abandoned" => ThreadStatus::Abandoned,
        "background" => ThreadStatus::Background,
        _ => ThreadStatus::Active,
    }
}

fn normalize_tension_type(raw: Option<&str>) -> String {
    let lower = raw.unwrap_or("mystery").to_lowercase();
    match lower.as_str() {
        "conflict" | "mystery" | "relationship" | "internal" | "external" | "external_threat" | "character_conflict" => lower,
        _ if lower.contains("conflict") => "conflict".to_string(),
        _ if lower.contains("threat") => "external_threat".to_string(),
        _ => "mystery".to_string(),
    }
}

pub fn parse_tension_type(raw: &str) -> TensionType {
    match raw {
        "conflict" => TensionType::Conflict,
        "relationship" => TensionType::Relationship,
        "internal" => TensionType::Internal,
        "external" => TensionType::External,
        "external_threat" => TensionType::ExternalThreat,
        "character_conflict" => TensionType::CharacterConflict,
        _ => TensionType::Mystery,
    }
}

/// Canonical `change_type` values; an unrecognised one is remapped to its
/// closest match, defaulting to `social` (§4.7, `_validate_and_fix_continuity_data`).
pub fn normalize_change_type(raw: &str) -> ChangeType {
    match raw {
        "location" => ChangeType::Location,
        "weather" => ChangeType::Weather,
        "political" => ChangeType::Political,
        "magical" => ChangeType::Magical,
        "technological" => ChangeType::Technological,
        "social" => ChangeType::Social,
        "location_status" => ChangeType::LocationStatus,
        "character_inventory" | "inventory" | "items" => ChangeType::CharacterInventory,
        "character_possession" | "possession" | "ownership" => ChangeType::CharacterPossession,
        "relationship" | "character_relationship" => ChangeType::Relationship,
        _ => ChangeType::Social,
    }
}

pub fn raw_character_into(name: &str, chapter_number: u32, raw: RawCharacterState) -> CharacterState {
    CharacterState {
        character_name: name.to_string(),
        chapter_number,
        location: raw.location,
        emotional_state: raw.emotional_state,
        knows_about: raw.knows_about,
        relationships: raw.relationships,
        injuries_or_conditions: raw.injuries_or_conditions,
        has_items: raw.has_items,
    }
}

pub fn raw_thread_into(thread_id: &str, chapter_number: u32, raw: RawPlotThread) -> PlotThread {
    PlotThread {
        thread_id: thread_id.to_string(),
        thread_name: raw.thread_name.unwrap_or_else(|| thread_id.to_string()),
        description: raw.description.unwrap_or_default(),
        introduced_chapter: chapter_number,
        last_mentioned_chapter: chapter_number,
        status: parse_thread_status(raw.status.as_deref().unwrap_or("active")),
        key_events: raw.key_events,
        unresolved_questions: raw.unresolved_questions,
        expected_resolution_chapter: raw.expected_resolution_chapter,
    }
}

pub fn raw_change_into(chapter_number: u32, raw: RawWorldStateChange) -> WorldStateChange {
    WorldStateChange {
        chapter_number: raw.chapter_number.unwrap_or(chapter_number),
        change_type: normalize_change_type(&raw.change_type),
        description: raw.description,
        affects: raw.affects,
        is_permanent: raw.is_permanent.unwrap_or(true),
    }
}

pub fn raw_tension_into(tension_id: &str, chapter_number: u32, raw: RawUnresolvedTension) -> UnresolvedTension {
    UnresolvedTension {
        tension_id: tension_id.to_string(),
        description: raw.description.unwrap_or_default(),
        introduced_chapter: chapter_number,
        last_escalated_chapter: chapter_number,
        tension_type: parse_tension_type(raw.tension_type.as_deref().unwrap_or("mystery")),
        involves_characters: raw.involves_characters,
        stakes: raw.stakes,
    }
}

/// Build the extraction prompt (§4.7): chapter text plus a summary of
/// existing state so the LLM only reports what's new or changed.
pub fn build_extraction_prompt(chapter_text: &str, chapter_number: u32, existing: Option<&super::types::ContinuityState>) -> String {
    let mut prompt = format!(
        "=== CONTINUITY EXTRACTION TASK ===\nExtract plot continuity information from Chapter {chapter_number}.\n\n=== CHAPTER {chapter_number} TEXT ===\n{chapter_text}\n\n"
    );

    if let Some(state) = existing {
        prompt.push_str("=== EXISTING CONTINUITY STATE ===\n");
        prompt.push_str(&format!("Characters currently tracked: {:?}\n", state.character_states.keys().collect::<Vec<_>>()));
        prompt.push_str(&format!("Active plot threads: {}\n", state.plot_threads.len()));
        prompt.push_str(&format!("Timeline events: {}\n", state.timeline.len()));
        prompt.push_str(&format!("Last analyzed: Chapter {}\n\n", state.last_analyzed_chapter));
    }

    prompt.push_str(
        "=== YOUR TASK ===\nReturn ONLY valid JSON describing character_states, plot_threads, timeline, \
         world_state_changes, unresolved_tensions and current_chapter_summary for this chapter. \
         Only include characters who appear in this chapter. Focus on new or changed information.\n",
    );
    prompt
}
