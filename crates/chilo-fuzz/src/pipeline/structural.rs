//! Structural stage: whole-seed crash-pattern rewrites that re-enter the
//! pipeline as brand-new seeds.
//!
//! Grounded on `LLMStructuralMutator.py`'s `_get_structural_prompt`.
//! Unlike parser/generator, format-error retries here are bounded
//! (`llm_format_error_max_retry`); on exhaustion the stage falls back to the
//! original SQL rather than discarding the task (`spec.md` §4.6, §7).

use std::time::Instant;

use tracing::warn;

use crate::queue::SeedTask;
use crate::telemetry::StructuralRow;

use super::PipelineContext;

fn structural_prompt(sql: &str, target_dbms: &str, dbms_version: &str) -> String {
    format!(
        "You are an expert in database fuzzing targeting {target_dbms} version {dbms_version}. \
Apply aggressive structural mutations to the test case below while keeping it syntactically \
valid: nested subqueries, recursive CTEs, type-confusing casts, boundary values, window \
functions, or transaction edge cases. Preserve the original intent but maximize the chance of \
exposing crashes.\n\n\
Input test case:\n```sql\n{sql}\n```\n\n\
Return only the mutated SQL inside a single fenced ```sql``` block."
    )
}

pub async fn run(ctx: PipelineContext) {
    loop {
        let Some(task) = ctx.queues.structural.recv().await else {
            return;
        };
        process_one(&ctx, task).await;
    }
}

async fn process_one(ctx: &PipelineContext, task: SeedTask) {
    let start = Instant::now();
    let source_seed_id = task.seed_id;
    let seed = ctx.registry.lookup(source_seed_id);
    let ceiling = ctx.config.llm_format_error_max_retry;

    let mut format_error_count = 0;
    let mut fell_back_to_identity = false;

    let rewritten = 'rewrite: {
        for _ in 0..ceiling.max(1) {
            let prompt = structural_prompt(&seed.text, &ctx.config.target.dbms, &ctx.config.target.dbms_version);
            let response = match ctx.llm.chat(&prompt, None).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(seed_id = source_seed_id.0, error = %err, "LLM transport error during structural mutation, retrying");
                    format_error_count += 1;
                    continue;
                }
            };
            match crate::llm::extract_fenced(&response.body, "sql") {
                Ok(block) => break 'rewrite block,
                Err(_) => {
                    format_error_count += 1;
                    warn!(seed_id = source_seed_id.0, "structural LLM response had no fenced sql block, retrying");
                    continue;
                }
            }
        }
        fell_back_to_identity = true;
        seed.text.clone()
    };

    let (new_seed_id, is_new) = ctx.registry.intake(rewritten.as_bytes());
    if is_new {
        let path = ctx
            .config
            .file_path
            .structural_mutate_path
            .join(format!("{}.sql", new_seed_id.0));
        if let Err(err) = tokio::fs::write(&path, &rewritten).await {
            warn!(seed_id = new_seed_id.0, error = %err, "failed to persist structurally mutated seed");
        }
    }
    // Unconditional: a structural output re-enters parse regardless of
    // whether it deduplicated to an already-known seed.
    ctx.queues
        .parse
        .send(SeedTask {
            seed_id: new_seed_id,
            mutate_budget: task.mutate_budget,
            from_structural: true,
        })
        .await;

    let _ = ctx.telemetry.record_structural(StructuralRow {
        source_seed_id: source_seed_id.0,
        new_seed_id: new_seed_id.0,
        duration_ms: start.elapsed().as_millis() as u64,
        format_error_count,
        fell_back_to_identity,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_mentions_target_and_input_sql() {
        let prompt = structural_prompt("SELECT 1;", "sqlite", "3.45");
        assert!(prompt.contains("sqlite"));
        assert!(prompt.contains("SELECT 1;"));
    }
}
