//! Generator stage: turns an annotated seed into a Python mutator artifact.
//!
//! Grounded on `LLMMutatorGenerater.py`'s `chilo_mutator_generator` loop and
//! its `_get_constant_mutator_prompt` template.

use std::time::Instant;

use tracing::warn;

use crate::queue::FixTask;
use crate::telemetry::GeneratorRow;

use super::PipelineContext;

fn mutator_prompt(parsed_sql: &str, target_dbms: &str, dbms_version: &str) -> String {
    format!(
        "Instruction: You are a DBMS fuzzing and SQL mutation expert. The input below is a \
test case annotated with mask tokens of the form [CONSTANT|OPERATOR|FUNCTION|KEYWORD, \
number:<n>, type:<type>, ori:<value>]. Produce a single, import-safe Python module (Python \
3.12, standard library only, no top-level side effects, no I/O) exposing exactly one callable:\n\n\
    mutate() -> str\n\n\
Each call must replace every mask with a concrete value: at least one mask must be replaced \
with a context-aware, non-ori candidate, and every other mask falls back to its ori value; the \
result must be a single complete, syntactically valid SQL string with no masks remaining. Aim \
for high output variation across repeated calls.\n\n\
Target test case (for testing {target_dbms} version {dbms_version}):\n{parsed_sql}\n\n\
Reply with only the module, inside a single fenced ```python``` block."
    )
}

pub async fn run(ctx: PipelineContext) {
    loop {
        let Some(task) = ctx.queues.generate.recv().await else {
            return;
        };
        process_one(&ctx, task).await;
    }
}

async fn process_one(ctx: &PipelineContext, task: crate::queue::SeedTask) {
    let start = Instant::now();
    let seed_id = task.seed_id;
    let seed = ctx.registry.lookup(seed_id);
    let Some(parsed_sql) = seed.annotated_text().map(str::to_owned) else {
        warn!(seed_id = seed_id.0, "generator task for an unannotated seed, dropping");
        return;
    };

    let mut up_tokens = 0;
    let mut down_tokens = 0;
    let mut format_error_count = 0;

    let code_text = loop {
        let prompt = mutator_prompt(&parsed_sql, &ctx.config.target.dbms, &ctx.config.target.dbms_version);
        let response = match ctx.llm.chat(&prompt, None).await {
            Ok(response) => response,
            Err(err) => {
                warn!(seed_id = seed_id.0, error = %err, "LLM transport error during generation, retrying");
                format_error_count += 1;
                continue;
            }
        };
        up_tokens += response.up_tokens;
        down_tokens += response.down_tokens;
        match crate::llm::extract_fenced(&response.body, "python") {
            Ok(block) => break block,
            Err(_) => {
                format_error_count += 1;
                warn!(seed_id = seed_id.0, "generator LLM response had no fenced python block, retrying");
                continue;
            }
        }
    };

    ctx.queues
        .fix
        .send(FixTask {
            seed_id,
            mutate_budget: task.mutate_budget,
            code_text,
            from_structural: task.from_structural,
        })
        .await;

    let _ = ctx.telemetry.record_generator(GeneratorRow {
        seed_id: seed_id.0,
        duration_ms: start.elapsed().as_millis() as u64,
        up_tokens,
        down_tokens,
        format_error_count,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_the_mutate_entry_point() {
        let prompt = mutator_prompt("SELECT 1;", "sqlite", "3.45");
        assert!(prompt.contains("mutate() -> str"));
        assert!(prompt.contains("sqlite"));
    }
}
