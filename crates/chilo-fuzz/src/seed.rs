//! The seed registry: an append-only, content-addressed store of distinct
//! seed byte-strings, each assigned a dense integer id on first insertion.

use std::collections::HashMap;
use std::sync::Mutex;

use derive_more::Display;
use tracing::{debug, trace};

/// Dense integer id assigned to a [`Seed`] on first insertion. Stable for the
/// lifetime of the process.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeedId(pub u32);

/// A distinct seed byte-string and its derived pipeline state.
#[derive(Debug, Clone)]
pub struct Seed {
    pub id: SeedId,
    pub bytes: Vec<u8>,
    pub text: String,
    annotated: Option<String>,
    pub selection_count: u64,
    pub mutation_count: u64,
}

impl Seed {
    fn new(id: SeedId, bytes: Vec<u8>) -> Self {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Self {
            id,
            bytes,
            text,
            annotated: None,
            selection_count: 0,
            mutation_count: 0,
        }
    }

    pub fn is_annotated(&self) -> bool {
        self.annotated.is_some()
    }

    pub fn annotated_text(&self) -> Option<&str> {
        self.annotated.as_deref()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    seeds: Vec<Seed>,
    index: HashMap<Vec<u8>, SeedId>,
}

/// Append-only store of distinct seed byte-strings. See `spec.md` §4.1.
#[derive(Debug, Default)]
pub struct SeedRegistry {
    inner: Mutex<RegistryInner>,
}

impl SeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content-addresses `bytes`: returns the existing id if already present,
    /// otherwise appends a new [`Seed`] and returns the freshly minted id.
    /// Always increments `selection_count` for the resolved id.
    pub fn intake(&self, bytes: &[u8]) -> (SeedId, bool) {
        let mut inner = self.inner.lock().expect("seed registry mutex poisoned");
        if let Some(&id) = inner.index.get(bytes) {
            inner.seeds[id.0 as usize].selection_count += 1;
            trace!(seed_id = id.0, "seed resubmitted");
            return (id, false);
        }
        let id = SeedId(inner.seeds.len() as u32);
        inner.seeds.push(Seed::new(id, bytes.to_vec()));
        inner.index.insert(bytes.to_vec(), id);
        inner.seeds[id.0 as usize].selection_count += 1;
        debug!(seed_id = id.0, len = bytes.len(), "new seed registered");
        (id, true)
    }

    /// Idempotent: the first writer wins. Later calls for an already
    /// annotated seed are no-ops, matching `spec.md`'s "first-writer-wins"
    /// annotation invariant.
    pub fn record_annotation(&self, id: SeedId, annotated: String) {
        let mut inner = self.inner.lock().expect("seed registry mutex poisoned");
        let seed = &mut inner.seeds[id.0 as usize];
        if seed.annotated.is_none() {
            seed.annotated = Some(annotated);
        }
    }

    pub fn record_mutation(&self, id: SeedId) {
        let mut inner = self.inner.lock().expect("seed registry mutex poisoned");
        inner.seeds[id.0 as usize].mutation_count += 1;
    }

    pub fn lookup(&self, id: SeedId) -> Seed {
        let inner = self.inner.lock().expect("seed registry mutex poisoned");
        inner.seeds[id.0 as usize].clone()
    }

    pub fn is_annotated(&self, id: SeedId) -> bool {
        let inner = self.inner.lock().expect("seed registry mutex poisoned");
        inner.seeds[id.0 as usize].is_annotated()
    }

    pub fn selection_count(&self, id: SeedId) -> u64 {
        let inner = self.inner.lock().expect("seed registry mutex poisoned");
        inner.seeds[id.0 as usize].selection_count
    }

    pub fn index_of(&self, bytes: &[u8]) -> Option<SeedId> {
        let inner = self.inner.lock().expect("seed registry mutex poisoned");
        inner.index.get(bytes).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("seed registry mutex poisoned").seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_is_idempotent_on_identity() {
        let registry = SeedRegistry::new();
        let (id1, is_new1) = registry.intake(b"SELECT 1;");
        let (id2, is_new2) = registry.intake(b"SELECT 1;");
        assert_eq!(id1, id2);
        assert!(is_new1);
        assert!(!is_new2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.selection_count(id1), 2);
    }

    #[test]
    fn distinct_bytes_get_distinct_ids() {
        let registry = SeedRegistry::new();
        let (id1, _) = registry.intake(b"SELECT 1;");
        let (id2, _) = registry.intake(b"SELECT 2;");
        assert_ne!(id1, id2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn annotation_is_first_writer_wins() {
        let registry = SeedRegistry::new();
        let (id, _) = registry.intake(b"SELECT 1;");
        registry.record_annotation(id, "first".to_owned());
        registry.record_annotation(id, "second".to_owned());
        assert_eq!(registry.lookup(id).annotated_text(), Some("first"));
    }

    #[test]
    fn empty_seed_bytes_are_accepted() {
        let registry = SeedRegistry::new();
        let (id, is_new) = registry.intake(b"");
        assert!(is_new);
        assert_eq!(registry.lookup(id).text, "");
    }

    #[test]
    fn non_utf8_bytes_decode_with_replacement() {
        let registry = SeedRegistry::new();
        let (id, _) = registry.intake(&[0xFF, 0xFE, b'a']);
        assert!(registry.lookup(id).text.contains('a'));
    }

    #[test]
    fn resubmission_n_times_increments_selection_count_to_n() {
        let registry = SeedRegistry::new();
        let (id, _) = registry.intake(b"SELECT 1;");
        for _ in 0..9 {
            registry.intake(b"SELECT 1;");
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.selection_count(id), 10);
    }
}
