//! The four async pipeline stages and the shared context they run against.

pub mod fixer;
pub mod generator;
pub mod parser;
pub mod structural;

use std::sync::Arc;

use crate::config::Config;
use crate::llm::LlmClient;
use crate::pool::MutatorPool;
use crate::queue::Queues;
use crate::sandbox::MutationSandbox;
use crate::seed::SeedRegistry;
use crate::telemetry::Telemetry;

/// Shared handles every stage worker closes over. Cheap to clone: every
/// field is an `Arc` or already `Clone` over `Arc`s internally.
#[derive(Clone)]
pub struct PipelineContext {
    pub registry: Arc<SeedRegistry>,
    pub pool: Arc<MutatorPool>,
    pub queues: Queues,
    pub llm: Arc<dyn LlmClient>,
    pub sandbox: Arc<dyn MutationSandbox>,
    pub telemetry: Arc<Telemetry>,
    pub config: Arc<Config>,
}

/// Spawns `count` copies of a stage worker loop as daemonic tasks. Workers
/// are never joined; they exit with the process (`spec.md` §5).
pub fn spawn_workers<F, Fut>(count: usize, make: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    for _ in 0..count {
        tokio::spawn(make());
    }
}
