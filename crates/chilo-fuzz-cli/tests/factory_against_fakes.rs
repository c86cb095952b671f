//! End-to-end pipeline test driving a `Factory` against an in-process fake
//! `LlmClient` (no network) and a fake sandbox (deterministic string
//! transform), per `spec.md` §8's testable properties.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chilo_fuzz::error::LlmError;
use chilo_fuzz::llm::{ChatResponse, LlmClient};
use chilo_fuzz::sandbox::{EvalMode, MutationSandbox};
use chilo_fuzz::{ChiloError, Factory};

/// Always returns a fenced block matching whichever stage is asking: the
/// generator's prompt names the `mutate() -> str` contract, every other
/// stage (parser, structural, fixer repair) wants SQL.
struct FakeLlmClient;

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn chat(&self, prompt: &str, _system: Option<&str>) -> Result<ChatResponse, LlmError> {
        let body = if prompt.contains("mutate() -> str") {
            "```python\ndef mutate():\n    return \"SELECT 1;\"\n```".to_owned()
        } else {
            "```sql\nSELECT 1;\n```".to_owned()
        };
        Ok(ChatResponse {
            body,
            up_tokens: 10,
            down_tokens: 10,
        })
    }
}

/// Never fails either soundness check and always dispatches the same
/// string, so the pipeline runs to completion without a real `python3`.
struct FakeSandbox;

#[async_trait]
impl MutationSandbox for FakeSandbox {
    async fn evaluate(&self, _code_text: &str, _mode: EvalMode) -> Result<String, chilo_fuzz::error::SandboxError> {
        Ok("SELECT 1;".to_owned())
    }

    async fn static_check(&self, _code_text: &str) -> Result<(), String> {
        Ok(())
    }

    fn dispatch_blocking(&self, _artifact_path: &Path) -> Result<String, chilo_fuzz::error::SandboxError> {
        Ok("SELECT 1;".to_owned())
    }
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let config_path = dir.join("chilo-fuzz.yaml");
    let d = dir.display();
    std::fs::write(
        &config_path,
        format!(
            r#"
target:
  dbms: sqlite
  dbms_version: "3.45"
llm:
  api_key: unused
  model: unused
  base_url: https://example.invalid/v1
log:
  parser_log_path: {d}/parser.log
  generator_log_path: {d}/generator.log
  fixer_log_path: {d}/fixer.log
  structural_log_path: {d}/structural.log
  main_log_path: {d}/main.log
csv:
  parser_csv_path: {d}/parser.tsv
  generator_csv_path: {d}/generator.tsv
  fixer_csv_path: {d}/fixer.tsv
  structural_csv_path: {d}/structural.tsv
  main_csv_path: {d}/main.tsv
file_path:
  parsed_sql_path: {d}/parsed
  generated_mutator_path: {d}/generated
  structural_mutate_path: {d}/structural
  mutator_fix_tmp_path: {d}/fix_tmp
others:
  fix_mutator_try_time: 3
workers:
  parser: 1
  generator: 1
  structural: 1
  fixer: 1
"#
        ),
    )
    .expect("writing scratch config");
    config_path
}

#[test]
fn factory_drives_a_seed_through_the_pipeline_against_fakes() -> Result<(), ChiloError> {
    let runtime = tokio::runtime::Runtime::new().expect("building tokio runtime");
    let _guard = runtime.enter();

    let workdir = tempfile::tempdir().expect("creating scratch dir");
    let config_path = write_config(workdir.path());

    let factory = Factory::start_with_components(
        &config_path,
        None,
        Some(Arc::new(FakeLlmClient) as Arc<dyn LlmClient>),
        Some(Arc::new(FakeSandbox) as Arc<dyn MutationSandbox>),
    )?;

    factory.intake(b"SELECT 1;");
    let seed_id = factory.registry.index_of(b"SELECT 1;").expect("just interned by intake");

    let deadline = Instant::now() + Duration::from_secs(30);
    while !factory.pool.has_artifact_for(seed_id) {
        assert!(Instant::now() < deadline, "timed out waiting for a mutator artifact");
        std::thread::sleep(Duration::from_millis(20));
    }

    let outcome = factory.fuzz(seed_id);
    assert!(!outcome.error_occurred, "dispatch evaluator raised against fakes");
    assert_eq!(outcome.bytes, b"SELECT 1;");

    factory.shutdown();
    Ok(())
}
