//! Command-line driver: registers adapters from the environment and runs a
//! prompt through an analysis pattern or preset mode.

use anyhow::{anyhow, Result};
use clap::Parser;
use futures::StreamExt;
use log::{info, warn};
use quorum_core::config::{ModelConfig, ProviderKind, use_mock_from_env};
use quorum_orchestrator::{Orchestrator, OrchestrationRequest};
use std::io::Write;

#[derive(Parser)]
#[command(name = "quorum", version, about = "Multi-provider LLM orchestration engine")]
struct Cli {
    /// Prompt to analyze
    prompt: String,

    /// Analysis pattern: gut, confidence, perspective, comparative
    #[arg(long, conflicts_with = "mode")]
    pattern: Option<String>,

    /// Preset analysis mode: standard, fast, thorough, creative
    #[arg(long)]
    mode: Option<String>,

    /// Restrict the run to these model ids
    #[arg(long, value_delimiter = ',')]
    models: Option<Vec<String>>,

    /// Stream the first stage from the lead model
    #[arg(long)]
    stream: bool,

    /// Bypass the response cache
    #[arg(long)]
    no_cache: bool,

    /// Print per-model metrics after the run
    #[arg(long)]
    metrics: bool,
}

/// Default model per provider when only credentials are configured.
const DEFAULT_MODELS: &[(ProviderKind, &str)] = &[
    (ProviderKind::OpenAi, "gpt-4o"),
    (ProviderKind::Anthropic, "claude-3-5-sonnet-20240620"),
    (ProviderKind::Google, "gemini-1.5-pro"),
    (ProviderKind::Cohere, "command-r-plus"),
    (ProviderKind::Mistral, "mistral-large-latest"),
];

fn register_from_env(engine: &Orchestrator) -> Result<usize> {
    let mut registered = 0usize;
    for (provider, model_id) in DEFAULT_MODELS {
        let config = ModelConfig::from_env(*provider, *model_id);
        if config.api_key.is_none() && !use_mock_from_env() {
            continue;
        }
        match engine.register_model(config) {
            Ok(()) => {
                info!("registered {} ({})", model_id, provider);
                registered += 1;
            }
            Err(error) => warn!("could not register {}: {}", model_id, error),
        }
    }

    if registered == 0 {
        warn!("no provider credentials found, registering the mock adapter");
        engine.register_model(ModelConfig::new(ProviderKind::Mock, "mock-analyst"))?;
        registered = 1;
    }
    Ok(registered)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let engine = Orchestrator::with_defaults();
    let handles = engine.start_monitoring();
    let count = register_from_env(&engine)?;
    info!("{} model(s) registered", count);

    let mut request = OrchestrationRequest::new(cli.prompt.clone());
    request.pattern = cli.pattern;
    request.analysis_mode = cli.mode;
    request.models = cli.models;
    request.skip_cache = cli.no_cache;

    if cli.stream {
        let mut updates = engine.stream_process(request);
        let mut stdout = std::io::stdout();
        while let Some(update) = updates.next().await {
            if update.done {
                println!();
                break;
            }
            if update.model.is_empty() {
                println!("\n[{}] {}", update.stage, update.content);
            } else {
                print!("{}", update.content);
                stdout.flush()?;
            }
        }
    } else {
        let result = engine
            .process(&request)
            .await
            .map_err(|error| anyhow!("{}", error))?;

        for stage in &result.stages {
            println!("=== stage: {} ===", stage.stage);
            let mut models: Vec<&String> = stage.responses.keys().collect();
            models.sort();
            for model in models {
                println!("\n--- {} ---", model);
                println!("{}", stage.responses[model]);
            }
            if let Some(error) = &stage.error {
                println!("(stage error: {})", error);
            }
            println!();
        }

        if let Some((model, _)) = engine.best_response(&result) {
            println!("best answer: {}", model);
        }
    }

    if cli.metrics {
        println!("{}", serde_json::to_string_pretty(&engine.metrics())?);
    }

    for handle in handles {
        handle.abort();
    }
    Ok(())
}
