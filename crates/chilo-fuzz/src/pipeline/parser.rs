//! Parser stage: annotates a seed with mask tokens via the LLM, once.
//!
//! Grounded on `LLMParser.py`'s `chilo_parser` loop and `_get_constant_prompt`
//! template: re-entrant seeds that are already annotated skip straight to
//! **generate** and never re-prompt the model.

use std::time::Instant;

use tracing::{info, warn};

use crate::queue::SeedTask;
use crate::telemetry::ParserRow;

use super::PipelineContext;

fn constant_annotation_prompt(ori_sql: &str, target_dbms: &str, dbms_version: &str) -> String {
    format!(
        "Instruction: You are a DBMS fuzz testing expert. Identify and annotate every \
constant in the given test case with the form [CONSTANT, number:X, type:<type>, ori:<value>], \
numbering from 1 in order of appearance, and do not mark table/column names, aliases, function \
names, or keywords. Optionally annotate operators, functions, and keywords the same way with \
[OPERATOR, ...], [FUNCTION, ...], [KEYWORD, ...]. Wrap the fully annotated SQL in a single \
fenced ```sql``` block and output nothing else.\n\n\
Now annotate the following SQL, which targets {target_dbms} version {dbms_version}:\n\
```sql\n{ori_sql}\n```\n"
    )
}

pub async fn run(ctx: PipelineContext) {
    loop {
        let Some(task) = ctx.queues.parse.recv().await else {
            return;
        };
        process_one(&ctx, task).await;
    }
}

async fn process_one(ctx: &PipelineContext, task: SeedTask) {
    let start = Instant::now();
    let seed_id = task.seed_id;

    if ctx.registry.is_annotated(seed_id) {
        info!(seed_id = seed_id.0, "seed already annotated, skipping parse");
        ctx.queues.generate.send(task).await;
        let _ = ctx.telemetry.record_parser(ParserRow {
            seed_id: seed_id.0,
            duration_ms: start.elapsed().as_millis() as u64,
            up_tokens: 0,
            down_tokens: 0,
            format_error_count: 0,
        });
        return;
    }

    let seed = ctx.registry.lookup(seed_id);
    let mut up_tokens = 0;
    let mut down_tokens = 0;
    let mut format_error_count = 0;

    let annotated = loop {
        let prompt = constant_annotation_prompt(&seed.text, &ctx.config.target.dbms, &ctx.config.target.dbms_version);
        let response = match ctx.llm.chat(&prompt, None).await {
            Ok(response) => response,
            Err(err) => {
                warn!(seed_id = seed_id.0, error = %err, "LLM transport error during parse, retrying");
                format_error_count += 1;
                continue;
            }
        };
        up_tokens += response.up_tokens;
        down_tokens += response.down_tokens;
        match crate::llm::extract_fenced(&response.body, "sql") {
            Ok(block) => break block,
            Err(_) => {
                format_error_count += 1;
                warn!(seed_id = seed_id.0, "parser LLM response had no fenced sql block, retrying");
                continue;
            }
        }
    };

    let output_path = ctx.config.file_path.parsed_sql_path.join(format!("{}.txt", seed_id.0));
    if let Err(err) = tokio::fs::write(&output_path, &annotated).await {
        warn!(seed_id = seed_id.0, error = %err, "failed to persist annotated seed");
    }

    ctx.registry.record_annotation(seed_id, annotated);
    ctx.queues.generate.send(task).await;

    let _ = ctx.telemetry.record_parser(ParserRow {
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
    fn prompt_embeds_target_and_sql() {
        let prompt = constant_annotation_prompt("SELECT 1;", "sqlite", "3.45");
        assert!(prompt.contains("sqlite"));
        assert!(prompt.contains("3.45"));
        assert!(prompt.contains("SELECT 1;"));
    }
}
