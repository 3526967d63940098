//! Gallery snapshots.
//!
//! Readers take an Arc to the current snapshot and never hold a lock
//! across matching. Writers build a whole new snapshot and publish it
//! with a version bump.

use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;
use wire::EyeSide;

use crate::code::TemplateCodes;

/// Encrypted candidate: ciphertext chunks plus the public metadata the
/// match protocol needs.
#[derive(Debug, Clone)]
pub struct EncryptedCandidate {
    pub blob: he::EncryptedBlob,
    pub total_bits: u64,
}

#[derive(Debug, Clone)]
pub enum GalleryCodes {
    Plain(TemplateCodes),
    Encrypted(EncryptedCandidate),
}

#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub template_id: Uuid,
    pub identity_id: Uuid,
    pub identity_name: String,
    pub eye_side: EyeSide,
    pub codes: GalleryCodes,
}

#[derive(Debug, Clone)]
pub struct GallerySnapshot {
    pub version: u64,
    pub entries: Vec<Arc<GalleryEntry>>,
}

impl GallerySnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Copy-on-modify gallery handle.
pub struct Gallery {
    current: RwLock<Arc<GallerySnapshot>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(GallerySnapshot::empty())),
        }
    }

    /// Cheap: clones the Arc, not the entries.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        self.current.read().clone()
    }

    /// Publish a rebuilt snapshot (full reload).
    pub fn replace(&self, entries: Vec<Arc<GalleryEntry>>) -> u64 {
        let mut guard = self.current.write();
        let version = guard.version + 1;
        *guard = Arc::new(GallerySnapshot { version, entries });
        version
    }

    /// Publish a snapshot with one entry appended (enrollment fast path).
    pub fn append(&self, entry: GalleryEntry) -> u64 {
        let mut guard = self.current.write();
        let mut entries = guard.entries.clone();
        entries.push(Arc::new(entry));
        let version = guard.version + 1;
        *guard = Arc::new(GallerySnapshot { version, entries });
        version
    }

    /// Publish a snapshot without one identity (deletion).
    pub fn remove_identity(&self, identity_id: Uuid) -> u64 {
        let mut guard = self.current.write();
        let entries = guard
            .entries
            .iter()
            .filter(|e| e.identity_id != identity_id)
            .cloned()
            .collect();
        let version = guard.version + 1;
        *guard = Arc::new(GallerySnapshot { version, entries });
        version
    }
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeArray;

    fn entry(identity_id: Uuid) -> GalleryEntry {
        GalleryEntry {
            template_id: Uuid::new_v4(),
            identity_id,
            identity_name: "subject".to_string(),
            eye_side: EyeSide::Left,
            codes: GalleryCodes::Plain(TemplateCodes {
                scales: vec![CodeArray::new(8, 1)],
                masks: vec![CodeArray::filled(8, 1)],
            }),
        }
    }

    #[test]
    fn old_snapshots_survive_replacement() {
        let gallery = Gallery::new();
        gallery.append(entry(Uuid::new_v4()));

        let before = gallery.snapshot();
        gallery.append(entry(Uuid::new_v4()));
        let after = gallery.snapshot();

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert!(after.version > before.version);
    }

    #[test]
    fn remove_identity_drops_all_its_templates() {
        let gallery = Gallery::new();
        let victim = Uuid::new_v4();
        gallery.append(entry(victim));
        gallery.append(entry(victim));
        gallery.append(entry(Uuid::new_v4()));

        gallery.remove_identity(victim);
        assert_eq!(gallery.snapshot().len(), 1);
    }
}
