// Shared fixtures for in-crate unit tests.

use crate::core::{EntityKey, PersistError, Result, Value};
use crate::entity::{EntityRef, FieldValue, Persistable, entity_ref};

pub struct StubEntity {
    entity_type: &'static str,
    table: String,
    key: Option<EntityKey>,
    fields: Vec<(String, FieldValue)>,
    changed: bool,
    orphan: bool,
}

impl StubEntity {
    pub fn new(entity_type: &'static str, table: &str) -> Self {
        Self {
            entity_type,
            table: table.to_string(),
            key: None,
            fields: Vec::new(),
            changed: false,
            orphan: false,
        }
    }

    pub fn with_key(mut self, key: EntityKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.push((name.to_string(), value));
        self
    }

    pub fn changed(mut self) -> Self {
        self.changed = true;
        self
    }

    pub fn orphaned(mut self) -> Self {
        self.orphan = true;
        self
    }

    pub fn into_ref(self) -> EntityRef {
        entity_ref(self)
    }
}

impl Persistable for StubEntity {
    fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn key(&self) -> Option<EntityKey> {
        self.key.clone()
    }

    fn set_key(&mut self, key: Option<EntityKey>) {
        self.key = key;
    }

    fn is_changed(&self) -> bool {
        self.changed
    }

    fn is_orphan(&self) -> bool {
        self.orphan
    }

    fn reset_change_tracking(&mut self) {
        self.changed = false;
    }

    fn field_values(&self) -> Vec<(String, FieldValue)> {
        self.fields.clone()
    }

    fn force_set_field(&mut self, name: &str, value: Value) -> Result<()> {
        for (field, slot) in &mut self.fields {
            if field.as_str() == name {
                *slot = FieldValue::Scalar(value);
                return Ok(());
            }
        }
        Err(PersistError::FieldNotFound(
            name.to_string(),
            self.entity_type.to_string(),
        ))
    }
}

pub fn note(title: &str) -> EntityRef {
    StubEntity::new("note", "notes")
        .with_field("title", FieldValue::Scalar(Value::Text(title.to_string())))
        .into_ref()
}

pub fn persisted_note(title: &str, key: i64) -> EntityRef {
    StubEntity::new("note", "notes")
        .with_key(EntityKey::Int(key))
        .with_field("title", FieldValue::Scalar(Value::Text(title.to_string())))
        .into_ref()
}
