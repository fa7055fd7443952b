// ============================================================================
// Entity Capability Contract
// ============================================================================

pub mod lob;

use crate::core::{EntityKey, Result, Value};
use std::sync::{Arc, RwLock};

pub use lob::{LargeObject, LobRef};

/// Contract every persistable entity implements.
///
/// Entities are shared as [`EntityRef`] so the identity map, pending tasks,
/// and the caller all observe the same instance. Accessors are synchronous;
/// all I/O happens in the task layer.
pub trait Persistable: Send + Sync {
    /// Concrete shape name, used for homogeneity checks and diagnostics.
    fn entity_type(&self) -> &'static str;

    /// Backing table.
    fn table(&self) -> &str;

    /// Column(s) holding the identity key. One entry unless the key is
    /// composite.
    fn key_columns(&self) -> Vec<String> {
        vec!["id".to_string()]
    }

    /// Identity key, `None` until the entity has been persisted (or a key
    /// has been generated for a pending insert).
    fn key(&self) -> Option<EntityKey>;

    /// Assign or clear the identity key.
    fn set_key(&mut self, key: Option<EntityKey>);

    fn is_changed(&self) -> bool;

    /// An orphan has lost a required relationship and must be deleted
    /// rather than updated.
    fn is_orphan(&self) -> bool;

    fn reset_change_tracking(&mut self);

    /// Current field values, in column order.
    fn field_values(&self) -> Vec<(String, FieldValue)>;

    /// Overwrite a single field without marking the entity changed.
    fn force_set_field(&mut self, name: &str, value: Value) -> Result<()>;
}

/// Shared handle to a persistable entity.
pub type EntityRef = Arc<RwLock<dyn Persistable>>;

/// Wrap a concrete entity into a shared handle.
pub fn entity_ref<T: Persistable + 'static>(entity: T) -> EntityRef {
    Arc::new(RwLock::new(entity))
}

/// Instance identity, not value equality.
pub fn entities_same(a: &EntityRef, b: &EntityRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// What an entity field can hold. The cascade resolver scans these for
/// dependent work: new or changed blobs and not-yet-persisted related
/// entities must commit before the row referencing them.
#[derive(Clone)]
pub enum FieldValue {
    Scalar(Value),
    Blob(LobRef),
    Related(EntityRef),
}

impl FieldValue {
    pub fn scalar(value: Value) -> Self {
        FieldValue::Scalar(value)
    }

    /// Render the value as it appears in a DML statement.
    ///
    /// A blob renders as its storage handle (NULL before upload); a related
    /// entity renders as its key.
    pub fn to_sql_literal(&self, quoting: &crate::core::QuoteContext) -> Result<String> {
        match self {
            FieldValue::Scalar(value) => Ok(value.to_sql_literal(quoting)),
            FieldValue::Blob(lob) => {
                let guard = lob.read()?;
                match guard.handle() {
                    Some(handle) => Ok(Value::Text(handle.to_string()).to_sql_literal(quoting)),
                    None => Ok("NULL".to_string()),
                }
            }
            FieldValue::Related(entity) => {
                let guard = entity.read()?;
                match guard.key() {
                    Some(key) => Ok(key.as_value()?.to_sql_literal(quoting)),
                    None => Ok("NULL".to_string()),
                }
            }
        }
    }
}

impl std::fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Scalar(value) => write!(f, "Scalar({:?})", value),
            FieldValue::Blob(_) => write!(f, "Blob(..)"),
            FieldValue::Related(_) => write!(f, "Related(..)"),
        }
    }
}
