//! Invoice-processing pipeline.
//!
//! `email_receipt_agent -> ocr_extraction_agent -> document_analysis_agent ->
//! extraction_refinement_agent -> review_and_completion_loop -> final_formatting_agent`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::review_loop::ReviewLoopInput;
use super::{
    AGENT_ORCHESTRATOR, COMPLETION_CHECK_AGENT, DOCUMENT_ANALYSIS_AGENT, EMAIL_RECEIPT_AGENT,
    EXTRACTION_REFINEMENT_AGENT, FINAL_FORMATTING_AGENT, OCR_EXTRACTION_AGENT, REVIEW_AGENT,
    REVIEW_AND_COMPLETION_LOOP,
};
use crate::config::WorkflowOptions;
use crate::{ActivityContext, ActivityRegistry, Error, OrchestrationContext, OrchestrationRegistry, durable_info};

/// Start payload. Any JSON object describing where the invoice arrived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailReceiptRequest {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub invoice_document: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrExtraction {
    pub extracted_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAnalysis {
    pub categorized_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinedExtraction {
    pub refined_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub reviewed_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCheck {
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedInvoice {
    pub formatted_data: String,
}

/// Refinement runs once on the analysis and again on every incomplete review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefinementSource {
    Analysis(DocumentAnalysis),
    Review(ReviewResult),
}

fn require(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

pub fn activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register_typed(EMAIL_RECEIPT_AGENT, email_receipt_agent)
        .register_typed(OCR_EXTRACTION_AGENT, ocr_extraction_agent)
        .register_typed(DOCUMENT_ANALYSIS_AGENT, document_analysis_agent)
        .register_typed(EXTRACTION_REFINEMENT_AGENT, extraction_refinement_agent)
        .register_typed(REVIEW_AGENT, review_agent)
        .register_typed(COMPLETION_CHECK_AGENT, completion_check_agent)
        .register_typed(FINAL_FORMATTING_AGENT, final_formatting_agent)
        .build()
}

pub async fn email_receipt_agent(ctx: ActivityContext, request: EmailReceiptRequest) -> Result<EmailReceipt, Error> {
    ctx.trace_info(format!("receiving invoice email ({} fields)", request.fields.len()));
    let source = request
        .fields
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or("inbox");
    Ok(EmailReceipt {
        invoice_document: format!("invoice_document from {source}"),
    })
}

pub async fn ocr_extraction_agent(_ctx: ActivityContext, receipt: EmailReceipt) -> Result<OcrExtraction, Error> {
    require("invoice_document", &receipt.invoice_document)?;
    Ok(OcrExtraction {
        extracted_text: format!("text of {}", receipt.invoice_document),
    })
}

pub async fn document_analysis_agent(_ctx: ActivityContext, ocr: OcrExtraction) -> Result<DocumentAnalysis, Error> {
    require("extracted_text", &ocr.extracted_text)?;
    Ok(DocumentAnalysis {
        categorized_data: format!("categories of {}", ocr.extracted_text),
    })
}

pub async fn extraction_refinement_agent(
    _ctx: ActivityContext,
    source: RefinementSource,
) -> Result<RefinedExtraction, Error> {
    let basis = match &source {
        RefinementSource::Analysis(a) => &a.categorized_data,
        RefinementSource::Review(r) => &r.reviewed_data,
    };
    require("refinement input", basis)?;
    Ok(RefinedExtraction {
        refined_data: format!("refined {basis}"),
    })
}

pub async fn review_agent(_ctx: ActivityContext, refined: RefinedExtraction) -> Result<ReviewResult, Error> {
    require("refined_data", &refined.refined_data)?;
    Ok(ReviewResult {
        reviewed_data: format!("reviewed {}", refined.refined_data),
    })
}

pub async fn completion_check_agent(_ctx: ActivityContext, review: ReviewResult) -> Result<CompletionCheck, Error> {
    require("reviewed_data", &review.reviewed_data)?;
    Ok(CompletionCheck { is_complete: true })
}

pub async fn final_formatting_agent(_ctx: ActivityContext, review: ReviewResult) -> Result<FormattedInvoice, Error> {
    require("reviewed_data", &review.reviewed_data)?;
    Ok(FormattedInvoice {
        formatted_data: format!("formatted {}", review.reviewed_data),
    })
}

pub fn orchestrations(options: &WorkflowOptions) -> OrchestrationRegistry {
    let max_iterations = options.max_review_iterations;
    OrchestrationRegistry::builder()
        // A start with no body arrives as `null`
        .register_typed(AGENT_ORCHESTRATOR, move |ctx, request: Option<EmailReceiptRequest>| {
            agent_orchestrator(ctx, request.unwrap_or_default(), max_iterations)
        })
        .build()
}

pub async fn agent_orchestrator(
    ctx: OrchestrationContext,
    request: EmailReceiptRequest,
    max_review_iterations: u32,
) -> Result<FormattedInvoice, Error> {
    let receipt: EmailReceipt = ctx.call_activity_typed(EMAIL_RECEIPT_AGENT, &request).await?;
    let ocr: OcrExtraction = ctx.call_activity_typed(OCR_EXTRACTION_AGENT, &receipt).await?;
    let analysis: DocumentAnalysis = ctx.call_activity_typed(DOCUMENT_ANALYSIS_AGENT, &ocr).await?;
    let refined: RefinedExtraction = ctx
        .call_activity_typed(EXTRACTION_REFINEMENT_AGENT, &RefinementSource::Analysis(analysis))
        .await?;
    durable_info!(ctx, "extraction refined, starting review loop");

    let loop_input = ReviewLoopInput {
        refined: serde_json::to_value(&refined).map_err(|e| Error::InvalidInput(e.to_string()))?,
        max_iterations: Some(max_review_iterations),
    };
    let reviewed: ReviewResult = ctx
        .call_sub_orchestration_typed(REVIEW_AND_COMPLETION_LOOP, &loop_input)
        .await?;

    let formatted: FormattedInvoice = ctx.call_activity_typed(FINAL_FORMATTING_AGENT, &reviewed).await?;
    durable_info!(ctx, "invoice formatted");
    Ok(formatted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ActivityContext {
        ActivityContext::new("inst", "agent", 2, 1)
    }

    #[test]
    fn refinement_source_accepts_analysis_and_review() {
        let a: RefinementSource = serde_json::from_str(r#"{"categorized_data":"c"}"#).unwrap();
        assert!(matches!(a, RefinementSource::Analysis(_)));
        let r: RefinementSource = serde_json::from_str(r#"{"reviewed_data":"r"}"#).unwrap();
        assert!(matches!(r, RefinementSource::Review(_)));
        assert!(serde_json::from_str::<RefinementSource>(r#"{"other":1}"#).is_err());
    }

    #[test]
    fn start_payload_must_be_an_object() {
        assert!(serde_json::from_str::<EmailReceiptRequest>(r#"{"source":"ap@example.com"}"#).is_ok());
        assert!(serde_json::from_str::<EmailReceiptRequest>("null").is_err());
        assert!(serde_json::from_str::<EmailReceiptRequest>("[1]").is_err());
    }

    #[tokio::test]
    async fn empty_fields_are_invalid_input() {
        let err = review_agent(ctx(), RefinedExtraction { refined_data: " ".into() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }

    #[tokio::test]
    async fn stubs_thread_their_inputs_through() {
        let receipt = email_receipt_agent(ctx(), EmailReceiptRequest::default()).await.unwrap();
        assert_eq!(receipt.invoice_document, "invoice_document from inbox");
        let check = completion_check_agent(ctx(), ReviewResult { reviewed_data: "r".into() })
            .await
            .unwrap();
        assert!(check.is_complete);
    }
}
