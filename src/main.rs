//! agentflow CLI: serve the durable agent workflows over HTTP, or generate a new workflow
//! from a process diagram.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use agentflow::config::{DEFAULT_MAX_REVIEW_ITERATIONS, PlannerConfig, ServerConfig, WorkflowOptions};
use agentflow::planner::{AzureOpenAiPlanner, WorkflowGenerator, WorkflowImage};
use agentflow::providers::sqlite::SqliteProvider;
use agentflow::runtime::{Runtime, RuntimeOptions};
use agentflow::server::{self, AppState};
use agentflow::{Client, agents, logging};

#[derive(Parser)]
#[command(name = "agentflow", version, about = "Durable orchestration of agent workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the runtime and the HTTP front door
    Serve {
        /// Host to bind to
        #[arg(long, env = "AGENTFLOW_HOST", default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, env = "AGENTFLOW_PORT", default_value_t = 7071)]
        port: u16,
        /// sqlx SQLite URL of the instance store
        #[arg(long, env = "AGENTFLOW_DATABASE_URL", default_value = "sqlite:agentflow.db")]
        database_url: String,
        /// Base URL used in returned status URIs
        #[arg(long, env = "AGENTFLOW_PUBLIC_BASE_URL")]
        public_base_url: Option<String>,
        /// Review cycles before the review loop fails
        #[arg(long, default_value_t = DEFAULT_MAX_REVIEW_ITERATIONS)]
        max_review_iterations: u32,
        /// Concurrent orchestration workers
        #[arg(long, default_value_t = 2)]
        orchestration_concurrency: usize,
        /// Concurrent activity workers
        #[arg(long, default_value_t = 4)]
        worker_concurrency: usize,
    },

    /// Generate orchestration source from a workflow diagram (needs the AOAI_* variables)
    Generate {
        /// Diagram image (png, jpg, gif or webp)
        #[arg(long)]
        image: PathBuf,
        /// Directory for agents.txt and agent_workflow.rs
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_tracing("agentflow=info,tower_http=info");

    let result = match cli.command {
        Commands::Serve {
            host,
            port,
            database_url,
            public_base_url,
            max_review_iterations,
            orchestration_concurrency,
            worker_concurrency,
        } => {
            let config = ServerConfig {
                host,
                port,
                database_url,
                public_base_url,
            };
            let options = RuntimeOptions {
                orchestration_concurrency,
                worker_concurrency,
                ..RuntimeOptions::default()
            };
            serve(config, WorkflowOptions { max_review_iterations }, options).await
        }
        Commands::Generate { image, out_dir } => generate(image, out_dir).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn serve(config: ServerConfig, workflows: WorkflowOptions, options: RuntimeOptions) -> Result<(), String> {
    if workflows.max_review_iterations == 0 {
        return Err("--max-review-iterations must be at least 1".to_string());
    }
    let addr = config.socket_addr().await.map_err(|e| format!("invalid listen address: {e}"))?;
    let store = SqliteProvider::new(&config.database_url)
        .await
        .map_err(|e| format!("failed to open {}: {e}", config.database_url))?;
    let store = Arc::new(store);

    let orchestrations = agents::orchestrations(&workflows);
    let runtime = Runtime::start_with_options(
        store.clone(),
        Arc::new(agents::activities()),
        orchestrations.clone(),
        options,
    )
    .await;

    let mut state = AppState::new(Client::new(store), orchestrations);
    if let Some(base) = config.public_base_url {
        state = state.with_public_base_url(base);
    }
    let served = server::serve(addr, state).await;
    runtime.shutdown().await;
    served.map_err(|e| format!("server error: {e}"))
}

async fn generate(image: PathBuf, out_dir: PathBuf) -> Result<(), String> {
    let config = PlannerConfig::from_env().map_err(|e| e.to_string())?;
    let image = WorkflowImage::load(&image).await.map_err(|e| e.to_string())?;
    let generator = WorkflowGenerator::new(AzureOpenAiPlanner::new(config), out_dir);
    let generated = generator.generate(&image).await.map_err(|e| e.to_string())?;
    println!("Agent description: {}", generated.agents_path.display());
    println!("Workflow source:   {}", generated.source_path.display());
    Ok(())
}
