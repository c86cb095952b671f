use std::path::PathBuf;

use anyhow::Context;
use chilo_fuzz::Factory;

use super::GlobalOptions;

/// Intakes a single seed file, waits for it to clear the pipeline, then
/// dispatches one mutated copy and prints it to stdout. Useful for checking
/// a single test case's annotation/generation/fix loop end to end without
/// running a full fuzzing loop.
#[derive(Debug, clap::Parser)]
pub(super) struct ReplayCommand {
    /// Path to the seed SQL file to replay.
    seed_path: PathBuf,

    /// How long to poll the ready queue before giving up, in seconds.
    #[clap(long, default_value_t = 120)]
    timeout_secs: u64,
}

impl ReplayCommand {
    pub(super) fn run(self, global_options: GlobalOptions) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
        let _guard = runtime.enter();

        let factory = Factory::start_with_worker_override(global_options.config_path(), global_options.workers)
            .context("starting chilo factory")?;

        let bytes = std::fs::read(&self.seed_path)
            .with_context(|| format!("reading seed file {}", self.seed_path.display()))?;
        factory.intake(&bytes);
        let seed_id = factory
            .registry
            .index_of(&bytes)
            .expect("just interned by Factory::intake");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(self.timeout_secs);
        loop {
            if factory.pool.has_artifact_for(seed_id) {
                break;
            }
            if std::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "timed out after {}s waiting for seed {} to produce a mutator",
                    self.timeout_secs,
                    seed_id
                );
            }
            std::thread::sleep(std::time::Duration::from_millis(200));
        }

        let outcome = factory.fuzz(seed_id);
        anyhow::ensure!(!outcome.error_occurred, "dispatch evaluator raised for seed {seed_id}");
        println!("{}", String::from_utf8_lossy(&outcome.bytes));

        factory.shutdown();
        Ok(())
    }
}
