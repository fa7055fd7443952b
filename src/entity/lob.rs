// ============================================================================
// Large Binary Object Value
// ============================================================================

use crate::core::{PersistError, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Shared handle to a large binary object.
pub type LobRef = Arc<RwLock<LargeObject>>;

/// A large binary value attached to an entity field.
///
/// The object carries its bytes until upload; the binary-object task uploads
/// them and records the resulting storage handle here. The referencing row
/// then stores only the handle.
pub struct LargeObject {
    content: Vec<u8>,
    handle: Option<Uuid>,
    changed: bool,
    created_at: DateTime<Utc>,
}

impl LargeObject {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            handle: None,
            changed: false,
            created_at: Utc::now(),
        }
    }

    /// Read a file into a new large object.
    pub async fn import(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref())
            .await
            .map_err(|err| PersistError::Lob(format!("import failed: {}", err)))?;
        Ok(Self::new(bytes))
    }

    /// Wrap into a shared handle.
    pub fn into_ref(self) -> LobRef {
        Arc::new(RwLock::new(self))
    }

    pub fn is_new(&self) -> bool {
        self.handle.is_none()
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Replace the content, marking the object changed.
    pub fn set_content(&mut self, content: Vec<u8>) {
        self.content = content;
        if self.handle.is_some() {
            self.changed = true;
        }
    }

    /// Storage handle, assigned at upload.
    pub fn handle(&self) -> Option<Uuid> {
        self.handle
    }

    pub(crate) fn assign_handle(&mut self, handle: Uuid) {
        self.handle = Some(handle);
    }

    pub(crate) fn clear_handle(&mut self) {
        self.handle = None;
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.changed = false;
    }

    /// SHA-256 digest of the content, hex encoded.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.content);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }

    /// Write the content to a file.
    pub async fn export(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path.as_ref(), &self.content)
            .await
            .map_err(|err| PersistError::Lob(format!("export failed: {}", err)))
    }
}

impl std::fmt::Debug for LargeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeObject")
            .field("len", &self.content.len())
            .field("handle", &self.handle)
            .field("changed", &self.changed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lob_has_no_handle() {
        let lob = LargeObject::new(vec![1, 2, 3]);
        assert!(lob.is_new());
        assert!(!lob.is_changed());
        assert_eq!(lob.len(), 3);
    }

    #[test]
    fn test_set_content_after_upload_marks_changed() {
        let mut lob = LargeObject::new(vec![1]);
        lob.assign_handle(Uuid::new_v4());
        assert!(!lob.is_new());

        lob.set_content(vec![2]);
        assert!(lob.is_changed());
    }

    #[test]
    fn test_checksum_is_stable() {
        let a = LargeObject::new(b"hello".to_vec());
        let b = LargeObject::new(b"hello".to_vec());
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[tokio::test]
    async fn test_export_and_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");

        let original = LargeObject::new(b"payload".to_vec());
        original.export(&path).await.unwrap();

        let restored = LargeObject::import(&path).await.unwrap();
        assert_eq!(restored.content(), b"payload");
        assert_eq!(restored.checksum(), original.checksum());
    }
}
