//! Text extraction for embedding.
//!
//! Each entity type has a fixed, ordered list of textual fields. Extraction
//! walks that list, skips absent or blank values and joins the rest.

use serde_json::{Map, Value};

use crate::models::EntityType;

const SEPARATOR: &str = "\n";

const CHARACTER_FIELDS: &[&str] = &[
    "name",
    "description",
    "background",
    "personality",
    "appearance",
    "notes",
];
const LOCATION_FIELDS: &[&str] = &["name", "description", "geography", "history", "notes"];
const ITEM_FIELDS: &[&str] = &["name", "description", "properties", "history", "notes"];
const FACTION_FIELDS: &[&str] = &["name", "description", "goals", "history", "notes"];
const QUEST_FIELDS: &[&str] = &["name", "description", "objectives", "rewards", "notes"];
const SESSION_FIELDS: &[&str] = &["name", "summary", "notes"];
const NOTE_FIELDS: &[&str] = &["name", "title", "content"];
const GENERIC_FIELDS: &[&str] = &["name", "description", "notes"];

/// Ordered text fields for an entity type
pub fn text_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Character => CHARACTER_FIELDS,
        EntityType::Location => LOCATION_FIELDS,
        EntityType::Item => ITEM_FIELDS,
        EntityType::Faction => FACTION_FIELDS,
        EntityType::Quest => QUEST_FIELDS,
        EntityType::Session => SESSION_FIELDS,
        EntityType::Note => NOTE_FIELDS,
        EntityType::Event => GENERIC_FIELDS,
    }
}

/// Build the text that represents an entity for embedding.
///
/// Returns an empty string when every relevant field is absent or blank.
pub fn extract_text(entity_type: EntityType, fields: &Map<String, Value>) -> String {
    text_fields(entity_type)
        .iter()
        .filter_map(|name| fields.get(*name).and_then(field_text))
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Whether the embedded text of an entity differs between two snapshots
pub fn text_changed(
    entity_type: EntityType,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
) -> bool {
    text_fields(entity_type)
        .iter()
        .any(|name| before.get(*name) != after.get(*name))
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        // tags, traits and similar lists
        Value::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}
