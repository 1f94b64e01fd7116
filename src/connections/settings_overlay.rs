//! Settings Overlay (C4, §4.4): a per-row JSON storage idiom
//! (`storage/migrations.rs`'s `metadata TEXT NOT NULL DEFAULT '{}'` columns)
//! for the upsert shape, and a `PermissionSet`-style union-merge pattern for
//! how a custom list is folded over a system default list.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::{ClassificationSchema, MergedTaxonomy, SettingsOverlay, TaxonomyItem};

/// Built-in defaults every connection starts from before any customization.
pub fn system_entity_types() -> Vec<TaxonomyItem> {
    ["person", "organization", "location", "concept", "event", "artifact"]
        .into_iter()
        .map(|id| TaxonomyItem { id: id.to_string(), label: titlecase(id) })
        .collect()
}

pub fn system_relationship_types() -> Vec<TaxonomyItem> {
    ["related_to", "evolved_into", "derived_from", "part_of", "references"]
        .into_iter()
        .map(|id| TaxonomyItem { id: id.to_string(), label: titlecase(id) })
        .collect()
}

pub fn system_memory_types() -> Vec<TaxonomyItem> {
    ["note", "fact", "decision", "preference", "task"]
        .into_iter()
        .map(|id| TaxonomyItem { id: id.to_string(), label: titlecase(id) })
        .collect()
}

fn titlecase(id: &str) -> String {
    id.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Set-union merge by id: custom items appended after system items, with
/// duplicate ids kept once (the system entry wins, matching first-seen order).
fn merge_by_id(system: Vec<TaxonomyItem>, custom: &[TaxonomyItem]) -> Vec<TaxonomyItem> {
    let mut seen: HashSet<String> = system.iter().map(|i| i.id.clone()).collect();
    let mut merged = system;
    for item in custom {
        if seen.insert(item.id.clone()) {
            merged.push(item.clone());
        }
    }
    merged
}

/// Merge classification schemas by category name: a custom schema entirely
/// replaces the system schema of the same category (§4.4).
fn merge_schemas(
    system: Vec<ClassificationSchema>,
    custom: &[ClassificationSchema],
) -> Vec<ClassificationSchema> {
    let custom_categories: HashSet<&str> = custom.iter().map(|s| s.category.as_str()).collect();
    let mut merged: Vec<ClassificationSchema> = system
        .into_iter()
        .filter(|s| !custom_categories.contains(s.category.as_str()))
        .collect();
    merged.extend(custom.iter().cloned());
    merged
}

/// Query + upsert the `settings_overlay` table (§4.4). One optional row per
/// connection id.
pub struct SettingsOverlayStore;

impl SettingsOverlayStore {
    pub fn load(conn: &Connection, connection_id: &str) -> Result<SettingsOverlay> {
        let row = conn
            .query_row(
                "SELECT custom_entity_types, custom_relationship_types, custom_memory_types,
                        custom_classification_schemas, active_classification_category
                 FROM settings_overlay WHERE connection_id = ?1",
                params![connection_id],
                |row| {
                    let entity: String = row.get(0)?;
                    let relationship: String = row.get(1)?;
                    let memory: String = row.get(2)?;
                    let schemas: String = row.get(3)?;
                    let active: Option<String> = row.get(4)?;
                    Ok((entity, relationship, memory, schemas, active))
                },
            )
            .optional()?;

        let Some((entity, relationship, memory, schemas, active)) = row else {
            return Ok(SettingsOverlay {
                connection_id: connection_id.to_string(),
                ..Default::default()
            });
        };

        Ok(SettingsOverlay {
            connection_id: connection_id.to_string(),
            custom_entity_types: serde_json::from_str(&entity).unwrap_or_default(),
            custom_relationship_types: serde_json::from_str(&relationship).unwrap_or_default(),
            custom_memory_types: serde_json::from_str(&memory).unwrap_or_default(),
            custom_classification_schemas: serde_json::from_str(&schemas).unwrap_or_default(),
            active_classification_category: active,
        })
    }

    /// Upsert the overlay row. An empty list is stored as `[]`, not cleared to
    /// NULL, so the row's presence still records "customized to nothing" (§4.4).
    pub fn save(conn: &Connection, overlay: &SettingsOverlay) -> Result<()> {
        conn.execute(
            "INSERT INTO settings_overlay (
                connection_id, custom_entity_types, custom_relationship_types,
                custom_memory_types, custom_classification_schemas, active_classification_category
             ) VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(connection_id) DO UPDATE SET
                custom_entity_types=excluded.custom_entity_types,
                custom_relationship_types=excluded.custom_relationship_types,
                custom_memory_types=excluded.custom_memory_types,
                custom_classification_schemas=excluded.custom_classification_schemas,
                active_classification_category=excluded.active_classification_category",
            params![
                overlay.connection_id,
                serde_json::to_string(&overlay.custom_entity_types)?,
                serde_json::to_string(&overlay.custom_relationship_types)?,
                serde_json::to_string(&overlay.custom_memory_types)?,
                serde_json::to_string(&overlay.custom_classification_schemas)?,
                overlay.active_classification_category,
            ],
        )?;
        Ok(())
    }

    /// System defaults ∪ custom additions, classification schemas merged by category (§4.4).
    pub fn merge(overlay: &SettingsOverlay) -> MergedTaxonomy {
        MergedTaxonomy {
            all_entity_types: merge_by_id(system_entity_types(), &overlay.custom_entity_types),
            all_relationship_types: merge_by_id(
                system_relationship_types(),
                &overlay.custom_relationship_types,
            ),
            all_memory_types: merge_by_id(system_memory_types(), &overlay.custom_memory_types),
            all_classification_schemas: merge_schemas(
                Vec::new(),
                &overlay.custom_classification_schemas,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    #[test]
    fn missing_row_returns_defaults() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let overlay = storage
            .with_connection(|conn| SettingsOverlayStore::load(conn, "default"))
            .unwrap();
        assert!(overlay.custom_entity_types.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let overlay = SettingsOverlay {
            connection_id: "default".to_string(),
            custom_entity_types: vec![TaxonomyItem { id: "pet".to_string(), label: "Pet".to_string() }],
            active_classification_category: Some("sentiment".to_string()),
            ..Default::default()
        };
        storage
            .with_connection(|conn| SettingsOverlayStore::save(conn, &overlay))
            .unwrap();
        let loaded = storage
            .with_connection(|conn| SettingsOverlayStore::load(conn, "default"))
            .unwrap();
        assert_eq!(loaded.custom_entity_types.len(), 1);
        assert_eq!(loaded.active_classification_category.as_deref(), Some("sentiment"));
    }

    #[test]
    fn merge_union_keeps_system_entry_on_duplicate_id() {
        let overlay = SettingsOverlay {
            custom_entity_types: vec![
                TaxonomyItem { id: "person".to_string(), label: "Human".to_string() },
                TaxonomyItem { id: "pet".to_string(), label: "Pet".to_string() },
            ],
            ..Default::default()
        };
        let merged = SettingsOverlayStore::merge(&overlay);
        let person = merged.all_entity_types.iter().find(|i| i.id == "person").unwrap();
        assert_eq!(person.label, "Person");
        assert!(merged.all_entity_types.iter().any(|i| i.id == "pet"));
    }

    #[test]
    fn custom_schema_replaces_system_schema_by_category() {
        let overlay = SettingsOverlay {
            custom_classification_schemas: vec![ClassificationSchema {
                category: "sentiment".to_string(),
                values: vec!["positive".to_string(), "negative".to_string()],
            }],
            ..Default::default()
        };
        let merged = SettingsOverlayStore::merge(&overlay);
        assert_eq!(merged.all_classification_schemas.len(), 1);
        assert_eq!(merged.all_classification_schemas[0].category, "sentiment");
    }
}
