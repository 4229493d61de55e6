//! Continuity data model (§3, §4.7): one `ContinuityState` per
//! (user, manuscript), plus the patch shape the extractor produces and the
//! read-only validation result shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterState {
    pub character_name: String,
    pub chapter_number: u32,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Active,
    Resolved,
    Abandoned,
    Background,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotThread {
    pub thread_id: String,
    pub thread_name: String,
    #[serde(default)]
    pub description: String,
    pub introduced_chapter: u32,
    pub last_mentioned_chapter: u32,
    pub status: ThreadStatus,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub unresolved_questions: Vec<String>,
    #[serde(default)]
    pub expected_resolution_chapter: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeType {
    SpecificTime,
    TimePassage,
    Flashback,
    Flashforward,
    TimeOfDay,
    RelativeTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeMarker {
    pub chapter_number: u32,
    pub time_type: TimeType,
    pub description: String,
    #[serde(default)]
    pub time_of_day: Option<String>,
}

/// Canonical `change_type` values (§4.7); an extracted value outside this
/// set is coerced during normalisation rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Location,
    Weather,
    Political,
    Magical,
    Technological,
    Social,
    LocationStatus,
    CharacterInventory,
    CharacterPossession,
    Relationship,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldStateChange {
    pub chapter_number: u32,
    pub change_type: ChangeType,
    pub description: String,
    #[serde(default)]
    pub affects: Vec<String>,
    #[serde(default = "default_true")]
    pub is_permanent: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensionType {
    Conflict,
    Mystery,
    Relationship,
    Internal,
    External,
    ExternalThreat,
    CharacterConflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedTension {
    pub tension_id: String,
    pub description: String,
    pub introduced_chapter: u32,
    pub last_escalated_chapter: u32,
    pub tension_type: TensionType,
    #[serde(default)]
    pub involves_characters: Vec<String>,
    #[serde(default)]
    pub stakes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuityState {
    pub manuscript_id: Uuid,
    pub user_id: Uuid,
    pub last_analyzed_chapter: u32,
    #[serde(default)]
    pub character_states: HashMap<String, CharacterState>,
    #[serde(default)]
    pub plot_threads: HashMap<String, PlotThread>,
    #[serde(default)]
    pub timeline: Vec<TimeMarker>,
    #[serde(default)]
    pub world_state_changes: Vec<WorldStateChange>,
    #[serde(default)]
    pub unresolved_tensions: HashMap<String, UnresolvedTension>,
    #[serde(default)]
    pub current_chapter_summary: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl ContinuityState {
    pub fn new(manuscript_id: Uuid, user_id: Uuid) -> Self {
        Self {
            manuscript_id,
            user_id,
            last_analyzed_chapter: 0,
            character_states: HashMap::new(),
            plot_threads: HashMap::new(),
            timeline: Vec::new(),
            world_state_changes: Vec::new(),
            unresolved_tensions: HashMap::new(),
            current_chapter_summary: None,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuityViolation {
    pub violation_type: String,
    pub severity: ViolationSeverity,
    pub description: String,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub found: Option<String>,
    #[serde(default)]
    pub affected_character: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Emitted by `validate_new_content`; read-only with respect to state (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuityValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub violations: Vec<ContinuityViolation>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub confidence: f32,
}
