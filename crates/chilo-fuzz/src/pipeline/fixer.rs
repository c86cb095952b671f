//! Fixer stage: two independent repair loops bring a generated artifact to
//! static and execution soundness before it enters the Mutator Pool.
//!
//! Grounded on `spec.md` §4.5. Phase A mirrors a syntax-repair loop bounded
//! by `FIX_MUTATOR_TRY_TIME`; Phase B mirrors the same bound applied to a
//! sandboxed dual invocation (mask-respecting, then random).

use std::time::Instant;

use tracing::warn;

use crate::error::FixerError;
use crate::queue::FixTask;
use crate::sandbox::EvalMode;
use crate::telemetry::FixerRow;

use super::PipelineContext;

fn static_repair_prompt(original: &str, errors: &str) -> String {
    format!(
        "The following Python module was supposed to be import-safe and expose \
`mutate() -> str`, but failed to compile:\n\n{errors}\n\n\
Original module:\n```python\n{original}\n```\n\n\
Return a corrected module satisfying the same contract (standard library only, no \
top-level side effects), inside a single fenced ```python``` block."
    )
}

fn execution_repair_prompt(original: &str, exception: &str) -> String {
    format!(
        "Calling `mutate()` on the following Python module raised an exception:\n\n{exception}\n\n\
Original module:\n```python\n{original}\n```\n\n\
Return a corrected module whose `mutate()` always returns a complete, syntactically valid SQL \
string with every mask replaced, inside a single fenced ```python``` block."
    )
}

pub async fn run(ctx: PipelineContext) {
    loop {
        let Some(task) = ctx.queues.fix.recv().await else {
            return;
        };
        process_one(&ctx, task).await;
    }
}

async fn process_one(ctx: &PipelineContext, task: FixTask) {
    let start = Instant::now();
    let seed_id = task.seed_id;
    let try_limit = ctx.config.others.fix_mutator_try_time;

    let mut code_text = task.code_text;
    let mut up_tokens_total = 0u64;
    let mut down_tokens_total = 0u64;

    let static_attempts = match static_soundness_loop(ctx, seed_id, &mut code_text, try_limit, &mut up_tokens_total, &mut down_tokens_total).await {
        Ok(attempts) => attempts,
        Err(err) => {
            warn!(seed_id = seed_id.0, error = %err, "static soundness exhausted, discarding artifact");
            let _ = ctx.telemetry.record_fixer(FixerRow {
                seed_id: seed_id.0,
                mutator_id: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                static_check_attempts: try_limit,
                execution_check_attempts: 0,
                up_tokens: up_tokens_total,
                down_tokens: down_tokens_total,
                discarded: true,
                last_error: Some(err.to_string()),
            });
            return;
        }
    };

    let execution_attempts = match execution_soundness_loop(ctx, seed_id, &mut code_text, try_limit, &mut up_tokens_total, &mut down_tokens_total).await {
        Ok(attempts) => attempts,
        Err(err) => {
            warn!(seed_id = seed_id.0, error = %err, "execution soundness exhausted, discarding artifact");
            let _ = ctx.telemetry.record_fixer(FixerRow {
                seed_id: seed_id.0,
                mutator_id: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                static_check_attempts: static_attempts,
                execution_check_attempts: try_limit,
                up_tokens: up_tokens_total,
                down_tokens: down_tokens_total,
                discarded: true,
                last_error: Some(err.to_string()),
            });
            return;
        }
    };

    let artifact_path = ctx
        .config
        .file_path
        .generated_mutator_path
        .join(format!("{}_{}.py", seed_id.0, artifact_suffix()));
    if let Err(err) = tokio::fs::write(&artifact_path, &code_text).await {
        warn!(seed_id = seed_id.0, error = %err, "failed to persist fixed artifact");
        return;
    }

    let artifact = ctx.pool.register(seed_id, artifact_path, task.from_structural);
    for _ in 0..task.mutate_budget.max(1) {
        ctx.queues.ready.send(artifact.clone()).await;
    }

    let _ = ctx.telemetry.record_fixer(FixerRow {
        seed_id: seed_id.0,
        mutator_id: artifact.mutator_id.0,
        duration_ms: start.elapsed().as_millis() as u64,
        static_check_attempts: static_attempts,
        execution_check_attempts: execution_attempts,
        up_tokens: up_tokens_total,
        down_tokens: down_tokens_total,
        discarded: false,
        last_error: None,
    });
}

/// Runs the static-soundness repair loop. `Ok(attempts)` carries the attempt
/// on which `py_compile` first passed; `Err` carries the last compiler error
/// seen once `try_limit` is exhausted without a pass (`spec.md` §4.5 Phase A).
async fn static_soundness_loop(
    ctx: &PipelineContext,
    seed_id: crate::seed::SeedId,
    code_text: &mut String,
    try_limit: u32,
    up_tokens_total: &mut u64,
    down_tokens_total: &mut u64,
) -> Result<u32, FixerError> {
    let mut last_errors = String::new();
    for attempt in 1..=try_limit {
        match ctx.sandbox.static_check(code_text).await {
            Ok(()) => return Ok(attempt),
            Err(errors) => {
                warn!(seed_id = seed_id.0, attempt, "static check failed, requesting repair");
                last_errors = errors;
                match repair(ctx, &static_repair_prompt(code_text, &last_errors)).await {
                    Some((fixed, up, down)) => {
                        *code_text = fixed;
                        *up_tokens_total += up;
                        *down_tokens_total += down;
                    }
                    None => continue,
                }
            }
        }
    }
    Err(FixerError::StaticCheckExhausted { attempts: try_limit, last_errors })
}

/// Runs the execution-soundness repair loop (`spec.md` §4.5 Phase B).
async fn execution_soundness_loop(
    ctx: &PipelineContext,
    seed_id: crate::seed::SeedId,
    code_text: &mut String,
    try_limit: u32,
    up_tokens_total: &mut u64,
    down_tokens_total: &mut u64,
) -> Result<u32, FixerError> {
    let mut last_error = String::new();
    for attempt in 1..=try_limit {
        let mask_respecting = ctx.sandbox.evaluate(code_text, EvalMode::MaskRespecting).await;
        let random = ctx.sandbox.evaluate(code_text, EvalMode::Random).await;
        match (mask_respecting, random) {
            (Ok(_), Ok(_)) => return Ok(attempt),
            (result_a, result_b) => {
                last_error = result_a
                    .err()
                    .or_else(|| result_b.err())
                    .map(|err| err.to_string())
                    .unwrap_or_default();
                warn!(seed_id = seed_id.0, attempt, "execution check failed, requesting repair");
                match repair(ctx, &execution_repair_prompt(code_text, &last_error)).await {
                    Some((fixed, up, down)) => {
                        *code_text = fixed;
                        *up_tokens_total += up;
                        *down_tokens_total += down;
                    }
                    None => continue,
                }
            }
        }
    }
    Err(FixerError::ExecutionCheckExhausted { attempts: try_limit, last_error })
}

/// Requests one repaired module from the LLM. `None` means the response was
/// malformed; the caller retries the same phase iteration with unchanged
/// code rather than spending a repair attempt on a format error.
async fn repair(ctx: &PipelineContext, prompt: &str) -> Option<(String, u64, u64)> {
    let response = ctx.llm.chat(prompt, None).await.ok()?;
    let code = crate::llm::extract_fenced(&response.body, "python").ok()?;
    Some((code, response.up_tokens, response.down_tokens))
}

fn artifact_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_repair_prompt_carries_original_and_errors() {
        let prompt = static_repair_prompt("def mutate(): return 1", "SyntaxError: bad");
        assert!(prompt.contains("SyntaxError: bad"));
        assert!(prompt.contains("def mutate(): return 1"));
    }

    #[test]
    fn artifact_suffix_is_monotonic_within_process() {
        let a = artifact_suffix();
        let b = artifact_suffix();
        assert!(b > a);
    }
}
