mod replay;
mod run;

use anyhow::Context;
use clap::Parser;
use replay::ReplayCommand;
use run::RunCommand;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    #[clap(flatten)]
    global_options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub(super) fn run(self) -> anyhow::Result<()> {
        setup_logger(&self.global_options).context("setting up logger")?;
        match self.command {
            Command::Run(cmd) => cmd.run(self.global_options),
            Command::Replay(cmd) => cmd.run(self.global_options),
        }
    }
}

/// Flags shared by every subcommand, mirroring the teacher's
/// `GlobalOptions` (config path, log level, worker overrides).
#[derive(Debug, clap::Parser)]
pub(super) struct GlobalOptions {
    /// Path to the YAML configuration file (`spec.md` §6.2).
    #[clap(long, short = 'c', global = true, default_value = "chilo-fuzz.yaml")]
    config: std::path::PathBuf,

    #[clap(long, global = true, default_value = "info")]
    default_log_level: LevelFilter,

    /// Override every stage's worker count, ignoring the config file's
    /// per-stage values.
    #[clap(long, global = true)]
    workers: Option<usize>,
}

impl GlobalOptions {
    pub(super) fn config_path(&self) -> &std::path::Path {
        &self.config
    }
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start the factory standalone and drive it with `fuzz_count`/`fuzz`
    /// calls read from stdin, outside an AFL++ process.
    Run(RunCommand),
    /// Replay a single seed file through the pipeline once and print the
    /// resulting mutated bytes.
    Replay(ReplayCommand),
}

fn setup_logger(global_opts: &GlobalOptions) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned())))
        .with(
            EnvFilter::builder()
                .with_default_directive(global_opts.default_log_level.into())
                .from_env()
                .context("constructing log filter from env")?,
        )
        .init();
    Ok(())
}
