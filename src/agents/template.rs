//! Two-step starter workflow. Generated workflows are written against this shape.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{AGENT_1, AGENT_2, TEMPLATE_ORCHESTRATOR};
use crate::{ActivityContext, ActivityRegistry, Error, OrchestrationContext, OrchestrationRegistry};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateInput {
    #[serde(default)]
    pub arg1: Value,
    #[serde(default)]
    pub arg2: Value,
}

pub fn activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register_typed(AGENT_1, agent_1)
        .register_typed(AGENT_2, agent_2)
        .build()
}

pub fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register_typed(TEMPLATE_ORCHESTRATOR, |ctx, input: Option<TemplateInput>| {
            template_orchestrator(ctx, input.unwrap_or_default())
        })
        .build()
}

pub async fn template_orchestrator(ctx: OrchestrationContext, input: TemplateInput) -> Result<Value, Error> {
    let first: Value = ctx.call_activity_typed(AGENT_1, &json!({ "arg1": input.arg1 })).await?;
    ctx.call_activity_typed(AGENT_2, &json!({ "arg2": input.arg2, "result": first }))
        .await
}

pub async fn agent_1(_ctx: ActivityContext, payload: Value) -> Result<Value, Error> {
    let arg1 = payload
        .get("arg1")
        .ok_or_else(|| Error::InvalidInput("agent_1 expects an arg1 field".to_string()))?;
    Ok(json!({ "agent_1": arg1 }))
}

pub async fn agent_2(_ctx: ActivityContext, payload: Value) -> Result<Value, Error> {
    let (Some(arg2), Some(result)) = (payload.get("arg2"), payload.get("result")) else {
        return Err(Error::InvalidInput("agent_2 expects arg2 and result fields".to_string()));
    };
    Ok(json!({ "agent_2": arg2, "previous": result }))
}
