//! Run configuration, loaded from a single YAML file (`spec.md` §6.2).

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub dbms: String,
    pub dbms_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub parser_log_path: PathBuf,
    pub generator_log_path: PathBuf,
    pub fixer_log_path: PathBuf,
    pub structural_log_path: PathBuf,
    pub main_log_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsvConfig {
    pub parser_csv_path: PathBuf,
    pub generator_csv_path: PathBuf,
    pub fixer_csv_path: PathBuf,
    pub structural_csv_path: PathBuf,
    pub main_csv_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilePathConfig {
    pub parsed_sql_path: PathBuf,
    pub generated_mutator_path: PathBuf,
    pub structural_mutate_path: PathBuf,
    pub mutator_fix_tmp_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OthersConfig {
    pub fix_mutator_try_time: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "WorkersConfig::default_count")]
    pub parser: usize,
    #[serde(default = "WorkersConfig::default_count")]
    pub generator: usize,
    #[serde(default = "WorkersConfig::default_count")]
    pub structural: usize,
    #[serde(default = "WorkersConfig::default_count")]
    pub fixer: usize,
}

impl WorkersConfig {
    fn default_count() -> usize {
        (num_cpus::get() / 4).max(1)
    }
}

fn default_llm_format_error_max_retry() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    pub llm: LlmConfig,
    pub log: LogConfig,
    pub csv: CsvConfig,
    pub file_path: FilePathConfig,
    pub others: OthersConfig,
    #[serde(default = "WorkersConfig::default_all")]
    pub workers: WorkersConfig,
    #[serde(default = "default_llm_format_error_max_retry")]
    pub llm_format_error_max_retry: u32,
}

impl WorkersConfig {
    fn default_all() -> Self {
        Self {
            parser: Self::default_count(),
            generator: Self::default_count(),
            structural: Self::default_count(),
            fixer: Self::default_count(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Every output directory this run will write into, enforced by
    /// [`prepare_dir`] before the pipeline starts.
    pub fn output_dirs(&self) -> Vec<&Path> {
        vec![
            self.file_path.parsed_sql_path.as_path(),
            self.file_path.generated_mutator_path.as_path(),
            self.file_path.structural_mutate_path.as_path(),
            self.file_path.mutator_fix_tmp_path.as_path(),
        ]
    }
}

/// A directory must either not exist (then be created) or exist and be
/// empty; otherwise the run is rejected to avoid mixing output across runs.
pub fn prepare_dir(path: &Path) -> Result<(), ConfigError> {
    match fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(ConfigError::DirtyOutputDir { path: path.to_owned() });
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|source| ConfigError::PrepareDir {
                path: path.to_owned(),
                source,
            })
        }
        Err(source) => Err(ConfigError::PrepareDir {
            path: path.to_owned(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
target:
  dbms: sqlite
  dbms_version: "3.45"
llm:
  api_key: sk-test
  model: gpt-test
  base_url: https://example.invalid/v1
log:
  parser_log_path: /tmp/chilo/parser.log
  generator_log_path: /tmp/chilo/generator.log
  fixer_log_path: /tmp/chilo/fixer.log
  structural_log_path: /tmp/chilo/structural.log
  main_log_path: /tmp/chilo/main.log
csv:
  parser_csv_path: /tmp/chilo/parser.tsv
  generator_csv_path: /tmp/chilo/generator.tsv
  fixer_csv_path: /tmp/chilo/fixer.tsv
  structural_csv_path: /tmp/chilo/structural.tsv
  main_csv_path: /tmp/chilo/main.tsv
file_path:
  parsed_sql_path: /tmp/chilo/parsed
  generated_mutator_path: /tmp/chilo/generated
  structural_mutate_path: /tmp/chilo/structural
  mutator_fix_tmp_path: /tmp/chilo/fix_tmp
others:
  fix_mutator_try_time: 5
"#
    }

    #[test]
    fn parses_minimal_config_with_worker_defaults() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(config.target.dbms, "sqlite");
        assert_eq!(config.others.fix_mutator_try_time, 5);
        assert_eq!(config.llm_format_error_max_retry, 3);
        assert!(config.workers.parser >= 1);
    }

    #[test]
    fn prepare_dir_creates_missing_directory() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("nested").join("output");
        prepare_dir(&target).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn prepare_dir_accepts_existing_empty_directory() {
        let base = tempfile::tempdir().unwrap();
        prepare_dir(base.path()).unwrap();
    }

    #[test]
    fn prepare_dir_rejects_nonempty_directory() {
        let base = tempfile::tempdir().unwrap();
        fs::write(base.path().join("leftover.txt"), "stale run").unwrap();
        let result = prepare_dir(base.path());
        assert!(matches!(result, Err(ConfigError::DirtyOutputDir { .. })));
    }
}
