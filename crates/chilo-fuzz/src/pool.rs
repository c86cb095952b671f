//! The mutator pool: a keyed store of produced mutator artifacts, retained
//! for the remainder of the run and available for random re-selection.

use std::path::PathBuf;
use std::sync::Mutex;

use rand::Rng;

use crate::seed::SeedId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutatorId(pub u32);

/// A produced, fixer-validated mutator artifact. Identified by
/// `(seed_id, mutator_id, global_index)` per `spec.md` §3.
#[derive(Debug, Clone)]
pub struct MutatorArtifact {
    pub seed_id: SeedId,
    pub mutator_id: MutatorId,
    pub global_index: u32,
    pub file_path: PathBuf,
    pub error_flag: bool,
    pub error_count: u32,
    /// Whether the owning seed entered the pipeline through a structural
    /// rewrite rather than as a host-supplied seed.
    pub from_structural: bool,
}

#[derive(Debug, Default)]
struct PoolInner {
    artifacts: Vec<MutatorArtifact>,
    next_mutator_id_by_seed: std::collections::HashMap<SeedId, u32>,
}

/// Keyed store of all successfully fixed mutator artifacts. See `spec.md` §4.2.
#[derive(Debug, Default)]
pub struct MutatorPool {
    inner: Mutex<PoolInner>,
}

impl MutatorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly fixed artifact, minting a `mutator_id` dense within
    /// its seed and a pool-global index.
    pub fn register(&self, seed_id: SeedId, file_path: PathBuf, from_structural: bool) -> MutatorArtifact {
        let mut inner = self.inner.lock().expect("mutator pool mutex poisoned");
        let next_local = inner.next_mutator_id_by_seed.entry(seed_id).or_insert(0);
        let mutator_id = MutatorId(*next_local);
        *next_local += 1;
        let global_index = inner.artifacts.len() as u32;
        let artifact = MutatorArtifact {
            seed_id,
            mutator_id,
            global_index,
            file_path,
            error_flag: false,
            error_count: 0,
            from_structural,
        };
        inner.artifacts.push(artifact.clone());
        artifact
    }

    /// Whether `seed_id` owns at least one registered artifact. Used as a
    /// readiness signal by callers that need to know a seed has actually
    /// produced a dispatchable mutator, as opposed to `mutation_count` (which
    /// only counts `fuzz()` dispatches).
    pub fn has_artifact_for(&self, seed_id: SeedId) -> bool {
        let inner = self.inner.lock().expect("mutator pool mutex poisoned");
        inner.artifacts.iter().any(|artifact| artifact.seed_id == seed_id)
    }

    pub fn record_dispatch_error(&self, global_index: u32) {
        let mut inner = self.inner.lock().expect("mutator pool mutex poisoned");
        if let Some(artifact) = inner.artifacts.get_mut(global_index as usize) {
            artifact.error_flag = true;
            artifact.error_count += 1;
        }
    }

    /// Uniformly selects one artifact at random, or `None` if the pool is empty.
    pub fn random_select(&self) -> Option<MutatorArtifact> {
        let inner = self.inner.lock().expect("mutator pool mutex poisoned");
        if inner.artifacts.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..inner.artifacts.len());
        inner.artifacts.get(idx).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mutator pool mutex poisoned").artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutator_ids_are_dense_within_a_seed() {
        let pool = MutatorPool::new();
        let seed = SeedId(0);
        let a = pool.register(seed, "a.py".into(), false);
        let b = pool.register(seed, "b.py".into(), false);
        assert_eq!(a.mutator_id, MutatorId(0));
        assert_eq!(b.mutator_id, MutatorId(1));
    }

    #[test]
    fn random_select_on_empty_pool_returns_none() {
        let pool = MutatorPool::new();
        assert!(pool.random_select().is_none());
    }

    #[test]
    fn random_select_finds_registered_artifact() {
        let pool = MutatorPool::new();
        pool.register(SeedId(0), "a.py".into(), false);
        assert!(pool.random_select().is_some());
    }

    #[test]
    fn dispatch_error_is_recorded_on_the_artifact() {
        let pool = MutatorPool::new();
        let artifact = pool.register(SeedId(0), "a.py".into(), false);
        pool.record_dispatch_error(artifact.global_index);
        let reselected = pool.random_select().expect("pool is non-empty");
        assert!(reselected.error_flag);
        assert_eq!(reselected.error_count, 1);
    }

    #[test]
    fn has_artifact_for_reflects_registration() {
        let pool = MutatorPool::new();
        let seed = SeedId(0);
        assert!(!pool.has_artifact_for(seed));
        pool.register(seed, "a.py".into(), true);
        assert!(pool.has_artifact_for(seed));
        assert!(!pool.has_artifact_for(SeedId(1)));
    }
}
