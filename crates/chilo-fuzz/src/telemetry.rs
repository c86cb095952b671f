//! Append-only telemetry sinks.
//!
//! Five tab-delimited CSV files — parser, generator, fixer, structural, main
//! — each with a fixed header row and one append mutex, per `spec.md` §6.4
//! and §5. Column sets are an implementation property, not a stable
//! contract, so each row type lives here as a plain struct serialized
//! through `csv::Writer`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::config::CsvConfig;
use crate::error::ChiloError;

fn append_writer(path: &Path) -> Result<csv::Writer<std::fs::File>, ChiloError> {
    let needs_header = !path.exists();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ChiloError::Telemetry {
            path: path.to_owned(),
            source: csv::Error::from(source),
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ChiloError::Telemetry {
            path: path.to_owned(),
            source: csv::Error::from(source),
        })?;
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(needs_header)
        .from_writer(file))
}

/// One append-only tab-delimited sink guarded by its own mutex.
struct Sink {
    path: PathBuf,
    writer: Mutex<csv::Writer<std::fs::File>>,
}

impl Sink {
    fn open(path: PathBuf) -> Result<Self, ChiloError> {
        let writer = append_writer(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    fn write<R: Serialize>(&self, row: &R) -> Result<(), ChiloError> {
        let mut writer = self.writer.lock().expect("telemetry sink mutex poisoned");
        writer.serialize(row).map_err(|source| ChiloError::Telemetry {
            path: self.path.clone(),
            source,
        })?;
        writer.flush().map_err(|err| ChiloError::Telemetry {
            path: self.path.clone(),
            source: csv::Error::from(err),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ParserRow {
    pub seed_id: u32,
    pub duration_ms: u64,
    pub up_tokens: u64,
    pub down_tokens: u64,
    pub format_error_count: u32,
}

#[derive(Debug, Serialize)]
pub struct GeneratorRow {
    pub seed_id: u32,
    pub duration_ms: u64,
    pub up_tokens: u64,
    pub down_tokens: u64,
    pub format_error_count: u32,
}

#[derive(Debug, Serialize)]
pub struct FixerRow {
    pub seed_id: u32,
    pub mutator_id: u32,
    pub duration_ms: u64,
    pub static_check_attempts: u32,
    pub execution_check_attempts: u32,
    pub up_tokens: u64,
    pub down_tokens: u64,
    pub discarded: bool,
    /// The fixer error's `Display` text when `discarded`, `None` otherwise.
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StructuralRow {
    pub source_seed_id: u32,
    pub new_seed_id: u32,
    pub duration_ms: u64,
    pub format_error_count: u32,
    pub fell_back_to_identity: bool,
}

/// Per-dispatch row, supplemented with `is_error_occur` and
/// `is_from_structural_mutator` recovered from the original's
/// `write_main_csv` call.
#[derive(Debug, Serialize)]
pub struct MainRow {
    pub timestamp_unix_ms: u64,
    pub fuzz_count_invocations: u64,
    pub fuzz_invocations: u64,
    pub is_random: bool,
    pub duration_ms: u64,
    pub dispatched_seed_id: u32,
    pub source_seed_id: u32,
    pub mutator_id: u32,
    pub ready_queue_depth: usize,
    pub original_output_size: usize,
    pub truncated_output_size: usize,
    pub was_truncated: bool,
    pub is_error_occur: bool,
    pub is_from_structural_mutator: bool,
}

/// The five sinks wired together, one per stage plus the dispatch-level one.
pub struct Telemetry {
    parser: Sink,
    generator: Sink,
    fixer: Sink,
    structural: Sink,
    main: Sink,
}

impl Telemetry {
    /// Opens the five sinks at the paths named by the config file's `csv`
    /// section (`spec.md` §6.2), creating parent directories as needed.
    pub fn open(csv_config: &CsvConfig) -> Result<Self, ChiloError> {
        Ok(Self {
            parser: Sink::open(csv_config.parser_csv_path.clone())?,
            generator: Sink::open(csv_config.generator_csv_path.clone())?,
            fixer: Sink::open(csv_config.fixer_csv_path.clone())?,
            structural: Sink::open(csv_config.structural_csv_path.clone())?,
            main: Sink::open(csv_config.main_csv_path.clone())?,
        })
    }

    pub fn record_parser(&self, row: ParserRow) -> Result<(), ChiloError> {
        self.parser.write(&row)
    }

    pub fn record_generator(&self, row: GeneratorRow) -> Result<(), ChiloError> {
        self.generator.write(&row)
    }

    pub fn record_fixer(&self, row: FixerRow) -> Result<(), ChiloError> {
        self.fixer.write(&row)
    }

    pub fn record_structural(&self, row: StructuralRow) -> Result<(), ChiloError> {
        self.structural.write(&row)
    }

    pub fn record_main(&self, row: MainRow) -> Result<(), ChiloError> {
        self.main.write(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_csv_config(dir: &Path) -> CsvConfig {
        CsvConfig {
            parser_csv_path: dir.join("parser.tsv"),
            generator_csv_path: dir.join("generator.tsv"),
            fixer_csv_path: dir.join("fixer.tsv"),
            structural_csv_path: dir.join("structural.tsv"),
            main_csv_path: dir.join("main.tsv"),
        }
    }

    #[test]
    fn opening_twice_appends_without_duplicating_headers() {
        let dir = tempfile::tempdir().unwrap();
        let csv_config = sample_csv_config(dir.path());
        {
            let telemetry = Telemetry::open(&csv_config).unwrap();
            telemetry
                .record_parser(ParserRow {
                    seed_id: 0,
                    duration_ms: 5,
                    up_tokens: 10,
                    down_tokens: 20,
                    format_error_count: 0,
                })
                .unwrap();
        }
        {
            let telemetry = Telemetry::open(&csv_config).unwrap();
            telemetry
                .record_parser(ParserRow {
                    seed_id: 1,
                    duration_ms: 6,
                    up_tokens: 11,
                    down_tokens: 21,
                    format_error_count: 1,
                })
                .unwrap();
        }
        let contents = std::fs::read_to_string(dir.path().join("parser.tsv")).unwrap();
        let header_lines = contents.lines().filter(|line| line.starts_with("seed_id")).count();
        assert_eq!(header_lines, 1);
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn main_row_round_trips_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Telemetry::open(&sample_csv_config(dir.path())).unwrap();
        telemetry
            .record_main(MainRow {
                timestamp_unix_ms: 0,
                fuzz_count_invocations: 1,
                fuzz_invocations: 1,
                is_random: true,
                duration_ms: 3,
                dispatched_seed_id: 0,
                source_seed_id: 0,
                mutator_id: 0,
                ready_queue_depth: 0,
                original_output_size: 10,
                truncated_output_size: 10,
                was_truncated: false,
                is_error_occur: false,
                is_from_structural_mutator: false,
            })
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("main.tsv")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
