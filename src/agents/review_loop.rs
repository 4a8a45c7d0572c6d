//! Bounded review/refine loop.
//!
//! `Reviewing -> CheckingCompletion -> {Complete | Refining -> Reviewing}`. Each review
//! cycle is one `review_agent` call; the loop fails once `max_iterations` cycles have run
//! without a positive completion check. On completion the last review result is returned.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{COMPLETION_CHECK_AGENT, EXTRACTION_REFINEMENT_AGENT, REVIEW_AGENT, REVIEW_AND_COMPLETION_LOOP};
use crate::config::WorkflowOptions;
use crate::{Error, OrchestrationContext, OrchestrationRegistry, durable_info, durable_warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewLoopInput {
    /// Initial refined extraction.
    pub refined: Value,
    /// Review cycles allowed before the loop fails. Falls back to the configured bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Reviewing { refined: Value },
    CheckingCompletion { reviewed: Value },
    Refining { reviewed: Value },
}

pub fn orchestrations(options: &WorkflowOptions) -> OrchestrationRegistry {
    let default_bound = options.max_review_iterations;
    OrchestrationRegistry::builder()
        .register_typed(REVIEW_AND_COMPLETION_LOOP, move |ctx, input: ReviewLoopInput| {
            review_and_completion_loop(ctx, input, default_bound)
        })
        .build()
}

pub async fn review_and_completion_loop(
    ctx: OrchestrationContext,
    input: ReviewLoopInput,
    default_bound: u32,
) -> Result<Value, Error> {
    let max_iterations = input.max_iterations.unwrap_or(default_bound);
    if max_iterations == 0 {
        return Err(Error::InvalidInput("max_iterations must be at least 1".to_string()));
    }

    let mut iterations: u32 = 0;
    let mut stage = Stage::Reviewing { refined: input.refined };
    loop {
        stage = match stage {
            Stage::Reviewing { refined } => {
                if iterations == max_iterations {
                    durable_warn!(ctx, iterations, "review loop hit its iteration bound");
                    return Err(Error::Activity(format!(
                        "review loop did not complete within {max_iterations} iterations"
                    )));
                }
                iterations += 1;
                let reviewed: Value = ctx.call_activity_typed(REVIEW_AGENT, &refined).await?;
                Stage::CheckingCompletion { reviewed }
            }
            Stage::CheckingCompletion { reviewed } => {
                let check: Value = ctx.call_activity_typed(COMPLETION_CHECK_AGENT, &reviewed).await?;
                if is_complete(&check)? {
                    durable_info!(ctx, iterations, "review loop complete");
                    return Ok(reviewed);
                }
                Stage::Refining { reviewed }
            }
            Stage::Refining { reviewed } => {
                let refined: Value = ctx.call_activity_typed(EXTRACTION_REFINEMENT_AGENT, &reviewed).await?;
                Stage::Reviewing { refined }
            }
        };
    }
}

fn is_complete(check: &Value) -> Result<bool, Error> {
    check.get("is_complete").and_then(Value::as_bool).ok_or_else(|| {
        Error::InvalidInput(format!("completion check result has no boolean is_complete: {check}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bound_is_optional_in_input() {
        let input: ReviewLoopInput = serde_json::from_str(r#"{"refined": {"refined_data": "x"}}"#).unwrap();
        assert_eq!(input.max_iterations, None);
        assert_eq!(serde_json::to_value(&input).unwrap(), json!({"refined": {"refined_data": "x"}}));
    }

    #[test]
    fn completion_flag_must_be_boolean() {
        assert!(is_complete(&json!({"is_complete": true})).unwrap());
        assert!(!is_complete(&json!({"is_complete": false})).unwrap());
        assert_eq!(is_complete(&json!({"done": 1})).unwrap_err().kind(), "InvalidInput");
    }
}
