use std::io::{self, BufRead, Write};

use anyhow::Context;
use chilo_fuzz::Factory;
use tracing::info;

use super::GlobalOptions;

/// Drives a `Factory` standalone, outside an AFL++ process, for local
/// testing of the pipeline against a real LLM endpoint. Each stdin line is
/// treated as a UTF-8 seed: it is intaken, then immediately dispatched once,
/// with the mutated bytes written to stdout as a line.
#[derive(Debug, clap::Parser)]
pub(super) struct RunCommand {
    /// Number of `fuzz()`-equivalent dispatches to request per input line,
    /// beyond the first.
    #[clap(long, default_value_t = 1)]
    iterations: u32,
}

impl RunCommand {
    pub(super) fn run(self, global_options: GlobalOptions) -> anyhow::Result<()> {
        // `Factory::start` spawns its stage workers via `tokio::spawn`, which
        // needs a runtime context even though this harness otherwise drives
        // the factory synchronously (`spec.md` §5: the host's `fuzz()` path
        // never touches the runtime itself, but background workers do).
        let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
        let _guard = runtime.enter();

        let factory = Factory::start_with_worker_override(global_options.config_path(), global_options.workers)
            .context("starting chilo factory")?;

        let stdin = io::stdin();
        let mut stdout = io::stdout().lock();
        for line in stdin.lock().lines() {
            let line = line.context("reading seed line from stdin")?;
            if line.is_empty() {
                continue;
            }
            let mutate_budget = factory.intake(line.as_bytes());
            let seed_id = factory
                .registry
                .index_of(line.as_bytes())
                .expect("just interned by Factory::intake");
            info!(mutate_budget, seed_id = seed_id.0, "seed intaken");

            for _ in 0..self.iterations {
                let outcome = factory.fuzz(seed_id);
                if outcome.error_occurred {
                    info!(seed_id = seed_id.0, "dispatch raised, skipping output line");
                    continue;
                }
                stdout
                    .write_all(&outcome.bytes)
                    .and_then(|()| stdout.write_all(b"\n"))
                    .context("writing mutated output to stdout")?;
            }
        }

        factory.shutdown();
        Ok(())
    }
}
