//! Agent workflows served by the front door.
//!
//! - [`invoice`]: the invoice-processing pipeline `agent_orchestrator`
//! - [`review_loop`]: the bounded `review_and_completion_loop` sub-orchestration
//! - [`template`]: the two-step starter workflow that generated workflows begin from
//!
//! Activity bodies are deterministic stand-ins that validate their payloads; real agent
//! calls slot in behind the same names.

pub mod invoice;
pub mod review_loop;
pub mod template;

use crate::config::WorkflowOptions;
use crate::{ActivityRegistry, OrchestrationRegistry};

pub const AGENT_ORCHESTRATOR: &str = "agent_orchestrator";
pub const REVIEW_AND_COMPLETION_LOOP: &str = "review_and_completion_loop";
pub const TEMPLATE_ORCHESTRATOR: &str = "template_orchestrator";

pub const EMAIL_RECEIPT_AGENT: &str = "email_receipt_agent";
pub const OCR_EXTRACTION_AGENT: &str = "ocr_extraction_agent";
pub const DOCUMENT_ANALYSIS_AGENT: &str = "document_analysis_agent";
pub const EXTRACTION_REFINEMENT_AGENT: &str = "extraction_refinement_agent";
pub const REVIEW_AGENT: &str = "review_agent";
pub const COMPLETION_CHECK_AGENT: &str = "completion_check_agent";
pub const FINAL_FORMATTING_AGENT: &str = "final_formatting_agent";
pub const AGENT_1: &str = "agent_1";
pub const AGENT_2: &str = "agent_2";

/// Every activity used by the bundled workflows.
pub fn activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .merge(invoice::activities())
        .merge(template::activities())
        .build()
}

/// Every bundled orchestration, with the review loop bounded by `options`.
pub fn orchestrations(options: &WorkflowOptions) -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .merge(invoice::orchestrations(options))
        .merge(review_loop::orchestrations(options))
        .merge(template::orchestrations())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_registries_have_no_collisions() {
        let acts = ActivityRegistry::builder()
            .merge(invoice::activities())
            .merge(template::activities())
            .build_result()
            .unwrap();
        assert_eq!(acts.count(), 9);
        let orchs = orchestrations(&WorkflowOptions::default());
        assert_eq!(
            orchs.list_names(),
            vec![AGENT_ORCHESTRATOR, REVIEW_AND_COMPLETION_LOOP, TEMPLATE_ORCHESTRATOR]
        );
    }
}
