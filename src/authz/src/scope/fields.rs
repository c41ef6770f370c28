//! Field-permission merging across contributing roles
//!
//! Two permissions naming the same field of the same resource key conflict.
//! The permission whose role has the higher priority wins; on equal priority
//! the more restrictive visibility is kept (hidden > masked > visible).

use std::collections::BTreeMap;

use crate::types::{FieldPermissions, FieldVisibility, ResourceId, ResourceType};

/// Key under which field rules are merged: `entity` or `entity:<id>`
pub fn resource_key(resource_type: ResourceType, resource_id: Option<ResourceId>) -> String {
    match resource_id {
        Some(id) => format!("{}:{}", resource_type, id),
        None => resource_type.as_str().to_string(),
    }
}

#[derive(Debug, Default)]
pub(crate) struct FieldMerger {
    entries: BTreeMap<String, BTreeMap<String, (i32, FieldVisibility)>>,
}

impl FieldMerger {
    pub(crate) fn offer(&mut self, key: &str, field: &str, priority: i32, visibility: FieldVisibility) {
        let fields = self.entries.entry(key.to_string()).or_default();
        match fields.get_mut(field) {
            None => {
                fields.insert(field.to_string(), (priority, visibility));
            }
            Some(current) if priority > current.0 => *current = (priority, visibility),
            Some(current) if priority == current.0 => {
                current.1 = current.1.most_restrictive(visibility);
            }
            Some(_) => {}
        }
    }

    pub(crate) fn finish(self) -> FieldPermissions {
        self.entries
            .into_iter()
            .map(|(key, fields)| {
                let fields = fields.into_iter().map(|(f, (_, v))| (f, v)).collect();
                (key, fields)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FieldVisibility::*;

    #[test]
    fn test_higher_priority_wins() {
        let mut merger = FieldMerger::default();
        merger.offer("entity", "salary", 50, Hidden);
        merger.offer("entity", "salary", 80, Visible);
        assert_eq!(merger.finish()["entity"]["salary"], Visible);

        // Order of offers does not matter
        let mut merger = FieldMerger::default();
        merger.offer("entity", "salary", 80, Visible);
        merger.offer("entity", "salary", 50, Hidden);
        assert_eq!(merger.finish()["entity"]["salary"], Visible);
    }

    #[test]
    fn test_tie_keeps_more_restrictive() {
        let mut merger = FieldMerger::default();
        merger.offer("entity", "ssn", 50, Visible);
        merger.offer("entity", "ssn", 50, Masked);
        merger.offer("entity", "ssn", 50, Visible);
        assert_eq!(merger.finish()["entity"]["ssn"], Masked);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut merger = FieldMerger::default();
        merger.offer("entity", "salary", 50, Hidden);
        merger.offer("page", "salary", 50, Visible);
        let merged = merger.finish();
        assert_eq!(merged["entity"]["salary"], Hidden);
        assert_eq!(merged["page"]["salary"], Visible);
    }

    #[test]
    fn test_resource_key_format() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(resource_key(ResourceType::Entity, None), "entity");
        assert_eq!(resource_key(ResourceType::Entity, Some(id)), format!("entity:{}", id));
    }
}
