//! The `Factory`: wires the Seed Registry, Mutator Pool, queues, LLM client,
//! sandbox, telemetry, and stage workers together, and implements the
//! `mutate_once` dispatch policy the host ABI calls into.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{prepare_dir, Config};
use crate::error::ChiloError;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::pipeline::{self, PipelineContext};
use crate::pool::{MutatorArtifact, MutatorPool};
use crate::queue::{Queues, SeedTask};
use crate::sandbox::{MutationSandbox, Sandbox};
use crate::seed::{SeedId, SeedRegistry};
use crate::telemetry::{MainRow, Telemetry};

/// Structural rewrite cadence: every `K`-th resubmission of a seed routes to
/// **structural** instead of **parse** (`spec.md` §4.1).
const STRUCTURAL_CADENCE: u64 = 10;

/// `fuzz_count`'s fixed mutate budget (`spec.md` §6.1).
const DEFAULT_MUTATE_BUDGET: u32 = 64;

/// Result of one `mutate_once()` dispatch, mirrored onto the main telemetry
/// sink by the ABI layer.
pub struct DispatchOutcome {
    pub bytes: Vec<u8>,
    pub is_random: bool,
    /// The seed id passed into `fuzz()` by the host.
    pub source_seed_id: SeedId,
    /// The seed id owning the artifact actually dispatched — may differ
    /// from `source_seed_id` when a random pool pick served a different
    /// seed's artifact.
    pub dispatched_seed_id: SeedId,
    pub mutator_id: u32,
    pub error_occurred: bool,
    pub from_structural_mutator: bool,
}

pub struct Factory {
    pub registry: Arc<SeedRegistry>,
    pub pool: Arc<MutatorPool>,
    pub queues: Queues,
    pub telemetry: Arc<Telemetry>,
    pub config: Arc<Config>,
    dispatch_sandbox: Arc<dyn MutationSandbox>,
    fuzz_count_invocations: AtomicU64,
    fuzz_invocations: AtomicU64,
}

impl Factory {
    /// Reads configuration, prepares output directories, opens telemetry,
    /// and spawns all stage worker groups. Corresponds to the host's
    /// `init` callback (`spec.md` §4.7).
    pub fn start(config_path: &Path) -> Result<Self, ChiloError> {
        Self::start_with_worker_override(config_path, None)
    }

    /// Same as [`Factory::start`], but `worker_override` (when given)
    /// replaces every stage's configured worker count. Used by the CLI's
    /// `--workers` flag.
    pub fn start_with_worker_override(config_path: &Path, worker_override: Option<usize>) -> Result<Self, ChiloError> {
        Self::start_with_components(config_path, worker_override, None, None)
    }

    /// Same as [`Factory::start_with_worker_override`], but lets a caller
    /// substitute its own [`LlmClient`]/[`MutationSandbox`] in place of the
    /// real HTTP client and subprocess sandbox. This is the seam the CLI
    /// crate's integration tests use to drive a `Factory` end-to-end against
    /// in-process fakes (`spec.md` §8).
    pub fn start_with_components(
        config_path: &Path,
        worker_override: Option<usize>,
        llm_override: Option<Arc<dyn LlmClient>>,
        sandbox_override: Option<Arc<dyn MutationSandbox>>,
    ) -> Result<Self, ChiloError> {
        let mut config = Config::load(config_path)?;
        if let Some(count) = worker_override {
            config.workers.parser = count;
            config.workers.generator = count;
            config.workers.fixer = count;
            config.workers.structural = count;
        }
        for dir in config.output_dirs() {
            prepare_dir(dir)?;
        }

        let registry = Arc::new(SeedRegistry::new());
        let pool = Arc::new(MutatorPool::new());
        let queues = Queues::new(1024);
        let telemetry = Arc::new(Telemetry::open(&config.csv)?);
        let llm: Arc<dyn LlmClient> = llm_override.unwrap_or_else(|| {
            Arc::new(HttpLlmClient::new(
                config.llm.base_url.clone(),
                config.llm.api_key.clone(),
                config.llm.model.clone(),
            ))
        });
        let sandbox: Arc<dyn MutationSandbox> =
            sandbox_override.unwrap_or_else(|| Arc::new(Sandbox::new("python3", Duration::from_secs(30))));
        let dispatch_sandbox = Arc::clone(&sandbox);
        let config = Arc::new(config);

        let ctx = PipelineContext {
            registry: Arc::clone(&registry),
            pool: Arc::clone(&pool),
            queues: queues.clone(),
            llm,
            sandbox,
            telemetry: Arc::clone(&telemetry),
            config: Arc::clone(&config),
        };

        pipeline::spawn_workers(config.workers.parser, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { pipeline::parser::run(ctx).await }
            }
        });
        pipeline::spawn_workers(config.workers.generator, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { pipeline::generator::run(ctx).await }
            }
        });
        pipeline::spawn_workers(config.workers.fixer, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { pipeline::fixer::run(ctx).await }
            }
        });
        pipeline::spawn_workers(config.workers.structural, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { pipeline::structural::run(ctx).await }
            }
        });

        info!(
            parser = config.workers.parser,
            generator = config.workers.generator,
            fixer = config.workers.fixer,
            structural = config.workers.structural,
            "chilo factory started"
        );

        Ok(Self {
            registry,
            pool,
            queues,
            telemetry,
            config,
            dispatch_sandbox,
            fuzz_count_invocations: AtomicU64::new(0),
            fuzz_invocations: AtomicU64::new(0),
        })
    }

    /// Host's `fuzz_count` callback: intake the seed, route it, and return
    /// the fixed budget. Never blocks on the pipeline (`spec.md` §4.7).
    pub fn intake(&self, bytes: &[u8]) -> u32 {
        self.fuzz_count_invocations.fetch_add(1, Ordering::Relaxed);
        let (seed_id, _is_new) = self.registry.intake(bytes);
        let selection_count = self.registry.selection_count(seed_id);
        // Host-supplied seeds are never structural-origin; only `structural::process_one`
        // constructs a `SeedTask` with `from_structural: true`.
        let task = SeedTask {
            seed_id,
            mutate_budget: DEFAULT_MUTATE_BUDGET,
            from_structural: false,
        };
        if selection_count % STRUCTURAL_CADENCE == 0 {
            if self.queues.structural.try_send(task).is_err() {
                warn!(seed_id = seed_id.0, "structural queue full, dropping resubmission task");
            }
        } else if self.queues.parse.try_send(task).is_err() {
            warn!(seed_id = seed_id.0, "parse queue full, dropping resubmission task");
        }
        DEFAULT_MUTATE_BUDGET
    }

    /// Host's `fuzz` callback body. Truncation to `max_size` is the ABI
    /// layer's job; this returns the untruncated bytes plus dispatch
    /// metadata for the main telemetry row.
    pub fn fuzz(&self, source_seed_id: SeedId) -> DispatchOutcome {
        self.fuzz_invocations.fetch_add(1, Ordering::Relaxed);
        self.mutate_once(source_seed_id)
    }

    /// `mutate_once()` selection policy: ready queue first (non-blocking),
    /// then a random pool pick, then a blocking wait on ready.
    fn mutate_once(&self, source_seed_id: SeedId) -> DispatchOutcome {
        if let Some(artifact) = self.queues.ready.try_recv() {
            return self.dispatch(artifact, false, source_seed_id);
        }
        if let Some(artifact) = self.pool.random_select() {
            return self.dispatch(artifact, true, source_seed_id);
        }
        match self.queues.ready.blocking_recv() {
            Some(artifact) => self.dispatch(artifact, false, source_seed_id),
            None => DispatchOutcome {
                bytes: Vec::new(),
                is_random: true,
                source_seed_id,
                dispatched_seed_id: source_seed_id,
                mutator_id: 0,
                error_occurred: true,
                from_structural_mutator: false,
            },
        }
    }

    fn dispatch(&self, artifact: MutatorArtifact, is_random: bool, source_seed_id: SeedId) -> DispatchOutcome {
        // Runs synchronously on the host's calling thread: `fuzz()` must
        // never hop onto the tokio runtime, it only ever blocks on **ready**
        // (`spec.md` §5).
        let result = self.dispatch_sandbox.dispatch_blocking(&artifact.file_path);
        self.registry.record_mutation(artifact.seed_id);

        match result {
            Ok(mutated) => DispatchOutcome {
                bytes: mutated.into_bytes(),
                is_random,
                source_seed_id,
                dispatched_seed_id: artifact.seed_id,
                mutator_id: artifact.mutator_id.0,
                error_occurred: false,
                from_structural_mutator: artifact.from_structural,
            },
            Err(err) => {
                warn!(seed_id = artifact.seed_id.0, error = %err, "dispatch evaluator raised, degrading");
                self.pool.record_dispatch_error(artifact.global_index);
                DispatchOutcome {
                    bytes: Vec::new(),
                    is_random,
                    source_seed_id,
                    dispatched_seed_id: artifact.seed_id,
                    mutator_id: artifact.mutator_id.0,
                    error_occurred: true,
                    from_structural_mutator: artifact.from_structural,
                }
            }
        }
    }

    pub fn record_main_row(&self, outcome: &DispatchOutcome, started_at: Instant, ready_queue_depth: usize, ori_size: usize, real_size: usize, was_truncated: bool) {
        let timestamp_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let _ = self.telemetry.record_main(MainRow {
            timestamp_unix_ms,
            fuzz_count_invocations: self.fuzz_count_invocations.load(Ordering::Relaxed),
            fuzz_invocations: self.fuzz_invocations.load(Ordering::Relaxed),
            is_random: outcome.is_random,
            duration_ms: started_at.elapsed().as_millis() as u64,
            dispatched_seed_id: outcome.dispatched_seed_id.0,
            source_seed_id: outcome.source_seed_id.0,
            mutator_id: outcome.mutator_id,
            ready_queue_depth,
            original_output_size: ori_size,
            truncated_output_size: real_size,
            was_truncated,
            is_error_occur: outcome.error_occurred,
            is_from_structural_mutator: outcome.from_structural_mutator,
        });
    }

    /// Host's `deinit` callback: background workers exit with the process,
    /// so there is nothing left to do beyond letting telemetry's append
    /// mutexes drop.
    pub fn shutdown(&self) {
        info!("chilo factory shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_factory_counters_start_at_zero() {
        let registry = Arc::new(SeedRegistry::new());
        assert_eq!(registry.len(), 0);
    }
}
