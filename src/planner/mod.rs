//! Workflow generation from a process diagram.
//!
//! An [`AgentPlanner`] turns a diagram into an agent description, writes orchestration
//! source from the bundled template and reviews it. [`WorkflowGenerator`] drives the three
//! steps and writes the artifacts to disk. The orchestration runtime never depends on this
//! module; generated source is compiled into a crate like any other workflow.

pub mod azure_openai;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;

pub use azure_openai::AzureOpenAiPlanner;

/// Starter workflow the planner writes generated source against.
pub const WORKFLOW_TEMPLATE: &str = include_str!("../../templates/agent_workflow.rs.tmpl");

pub const AGENTS_FILE: &str = "agents.txt";
pub const WORKFLOW_FILE: &str = "agent_workflow.rs";

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Diagram image handed to the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowImage {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
}

impl WorkflowImage {
    pub fn new(bytes: Vec<u8>, media_type: &'static str) -> Self {
        Self { bytes, media_type }
    }

    /// Read an image file. The media type comes from the extension.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PlannerError> {
        let path = path.as_ref();
        let media_type = media_type_for(path)
            .ok_or_else(|| PlannerError::Config(format!("unsupported image type: {}", path.display())))?;
        let bytes = tokio::fs::read(path).await?;
        Ok(Self { bytes, media_type })
    }

    /// `data:` URL as accepted by vision chat models.
    pub fn to_data_url(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{encoded}", self.media_type)
    }
}

fn media_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[async_trait]
pub trait AgentPlanner: Send + Sync {
    /// Describe the agents a diagram implies and the order they run in.
    async fn describe_agents(&self, image: &WorkflowImage) -> Result<String, PlannerError>;

    /// Write orchestration source for `agent_description`, starting from `template_source`.
    async fn generate_orchestration_source(
        &self,
        agent_description: &str,
        template_source: &str,
    ) -> Result<String, PlannerError>;

    /// Return a revised version of `source`.
    async fn review_orchestration_source(&self, source: &str) -> Result<String, PlannerError>;
}

/// Paths and final source produced by [`WorkflowGenerator::generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedWorkflow {
    pub agents_path: PathBuf,
    pub source_path: PathBuf,
    pub source: String,
}

pub struct WorkflowGenerator<P: AgentPlanner> {
    planner: P,
    out_dir: PathBuf,
    template: String,
}

impl<P: AgentPlanner> WorkflowGenerator<P> {
    pub fn new(planner: P, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            planner,
            out_dir: out_dir.into(),
            template: WORKFLOW_TEMPLATE.to_string(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Describe, generate, then review. Each step's output is written before the next runs,
    /// so a failed review still leaves the agent description and first draft on disk.
    pub async fn generate(&self, image: &WorkflowImage) -> Result<GeneratedWorkflow, PlannerError> {
        tokio::fs::create_dir_all(&self.out_dir).await?;

        let agents = self.planner.describe_agents(image).await?;
        let agents_path = self.out_dir.join(AGENTS_FILE);
        tokio::fs::write(&agents_path, &agents).await?;
        tracing::info!(target: "agentflow::planner", path = %agents_path.display(), "agent description written");

        let draft = self
            .planner
            .generate_orchestration_source(&agents, &self.template)
            .await?;
        let source_path = self.out_dir.join(WORKFLOW_FILE);
        tokio::fs::write(&source_path, strip_code_fences(&draft)).await?;
        tracing::info!(target: "agentflow::planner", path = %source_path.display(), "workflow draft written");

        let draft = tokio::fs::read_to_string(&source_path).await?;
        let reviewed = strip_code_fences(&self.planner.review_orchestration_source(&draft).await?);
        tokio::fs::write(&source_path, &reviewed).await?;
        tracing::info!(target: "agentflow::planner", path = %source_path.display(), "workflow reviewed");

        Ok(GeneratedWorkflow {
            agents_path,
            source_path,
            source: reviewed,
        })
    }
}

/// Drop Markdown fence lines (```` ``` ```` with or without a language tag).
pub fn strip_code_fences(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();
    let mut out = kept.join("\n").trim_matches('\n').to_string();
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_removed() {
        let text = "```rust\nfn main() {}\n```\n";
        assert_eq!(strip_code_fences(text), "fn main() {}\n");
        assert_eq!(strip_code_fences("let a = 1;"), "let a = 1;\n");
    }

    #[test]
    fn media_type_follows_extension() {
        assert_eq!(media_type_for(Path::new("a/flow.PNG")), Some("image/png"));
        assert_eq!(media_type_for(Path::new("flow.jpeg")), Some("image/jpeg"));
        assert_eq!(media_type_for(Path::new("flow.bmp")), None);
        assert_eq!(media_type_for(Path::new("flow")), None);
    }

    #[test]
    fn data_url_is_base64() {
        let img = WorkflowImage::new(b"abc".to_vec(), "image/png");
        assert_eq!(img.to_data_url(), "data:image/png;base64,YWJj");
    }

    #[test]
    fn template_uses_the_public_api() {
        assert!(WORKFLOW_TEMPLATE.contains("OrchestrationRegistry"));
        assert!(WORKFLOW_TEMPLATE.contains("agent_1"));
    }
}
