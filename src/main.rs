//! prefclean CLI - Clean preference datasets with an LLM judge.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prefclean::{
    ArgillaSink, CleaningPipeline, Config, HealthStatus, LlmClient, PreviewDocs, SaveOptions,
    preview_version,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "prefclean")]
#[command(version)]
#[command(about = "Shuffle, rate, prune and curate preference-pair datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cleaning pipeline
    Run {
        /// Input pairs JSONL (overrides loader.path)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output JSONL (overrides output.path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Save the distiset to this directory (overrides output.distiset_dir)
        #[arg(long)]
        distiset_dir: Option<PathBuf>,

        /// Split the distiset into train/test with this train fraction
        #[arg(long)]
        train_size: Option<f64>,
    },

    /// Validate configuration file and check endpoints
    Validate,

    /// Show example configuration
    Example,

    /// Delete a pull request's preview documentation
    DocsCleanup {
        /// Pull request number
        #[arg(long)]
        pr: u64,

        /// Git remote to push to
        #[arg(long)]
        remote: Option<String>,

        /// Branch holding the built docs
        #[arg(long)]
        branch: Option<String>,
    },
}

/// Console logging, plus a plain-text copy in `log_file` when given.
fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    let file_layer = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path.file_name().context("Log path has no file name")?;
            // One log per run
            if path.exists() {
                std::fs::remove_file(path)
                    .with_context(|| format!("Failed to remove old log {path:?}"))?;
            }
            let appender = tracing_appender::rolling::never(dir, name);
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(appender),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# prefclean configuration file

[llm]
# OpenAI-compatible endpoint serving the judge model
base_url = "https://api-inference.huggingface.co/v1"
# api_key = "${HF_TOKEN}"
api_key_env = "HF_TOKEN"
timeout_secs = 120
max_retries = 3

[loader]
path = "data/pairs.jsonl"
batch_size = 50
shuffle = true
# seed = 42

[loader.rename]
question = "instruction"

[scorer]
# helpfulness | honesty | instruction-following | truthfulness | overall-rating
aspect = "overall-rating"
concurrency = 4

[scorer.model]
id = "meta-llama/Meta-Llama-3.1-70B-Instruct"
tokenizer_id = "meta-llama/Meta-Llama-3.1-70B-Instruct"
max_tokens = 512
temperature = 0.7
input_price_per_1m = 0.0
output_price_per_1m = 0.0

[pruner]
columns = ["instruction", "generations", "order", "ratings", "rationales", "model_name"]

# Optional: forward cleaned records to an Argilla server for human review
# [sink]
# dataset_name = "preference-pairs"
# workspace = "argilla"
# api_url = "http://localhost:6900"
# api_key_env = "ARGILLA_API_KEY"
# batch_size = 100

[output]
path = "output/clean.jsonl"
# distiset_dir = "output/distiset"
save_card = true
save_pipeline_config = true
# Run log is written next to `path` with a .log extension
save_pipeline_log = true
"#;
    println!("{example}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::DocsCleanup { pr, remote, branch } => {
            setup_logging(cli.verbose, None)?;
            let mut docs = PreviewDocs::new();
            if let Some(remote) = remote {
                docs = docs.with_remote(remote);
            }
            if let Some(branch) = branch {
                docs = docs.with_branch(branch);
            }
            docs.delete(pr)
                .await
                .with_context(|| format!("Failed to delete docs version {}", preview_version(pr)))?;
            return Ok(());
        }

        Commands::Validate => {
            setup_logging(cli.verbose, None)?;
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            let api_key = config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            info!("Configuration is valid");
            info!("  Loader: {} (batch size {})", config.loader.path.display(), config.loader.batch_size);
            info!(
                "  Scorer: {} on {} ({} concurrent)",
                config.scorer.aspect.as_str(),
                config.scorer.model.id,
                config.scorer.concurrency
            );
            info!("  Keep columns: {}", config.pruner.columns.join(", "));

            let client = LlmClient::from_config(&config.llm, api_key)?;
            let health = client.health_check().await;
            match health.status {
                HealthStatus::Healthy => info!(
                    "  Endpoint {}: {} ({} ms)",
                    health.endpoint,
                    health.status,
                    health.latency_ms.unwrap_or_default()
                ),
                _ => warn!(
                    "  Endpoint {}: {} ({})",
                    health.endpoint,
                    health.status,
                    health.error.as_deref().unwrap_or("no details")
                ),
            }

            if let Some(sink_config) = &config.sink {
                let sink = ArgillaSink::from_config(sink_config)
                    .context("Failed to configure curation sink")?;
                match sink.health_check().await {
                    Ok(()) => info!("  Argilla {}: healthy", sink.api_url()),
                    Err(e) => warn!("  Argilla {}: {e}", sink.api_url()),
                }
            }
            return Ok(());
        }

        Commands::Run {
            input,
            output,
            distiset_dir,
            train_size,
        } => {
            let mut config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            if let Some(input) = input {
                config.loader.path = input;
            }
            if let Some(output) = output {
                config.output.path = output;
            }
            if distiset_dir.is_some() {
                config.output.distiset_dir = distiset_dir;
            }

            if let Some(parent) = config.output.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {parent:?}"))?;
            }
            let log_path = config.output.log_path();
            setup_logging(cli.verbose, Some(&log_path))?;

            let api_key = config
                .resolve_api_key()
                .context("Failed to resolve API key")?;
            let client = Arc::new(LlmClient::from_config(&config.llm, api_key)?);

            let pipeline = CleaningPipeline::from_config(&config, client.clone())?;
            let source = CleaningPipeline::load_source(&config)
                .with_context(|| format!("Failed to load {:?}", config.loader.path))?;

            let run = pipeline.run(source, &config.output.path).await?;
            let stats = run.stats;
            let mut distiset = run.distiset;

            if let Some(train_size) = train_size {
                distiset = distiset.train_test_split(train_size, config.loader.seed)?;
            }
            if let Some(dir) = &config.output.distiset_dir {
                if config.output.save_pipeline_log {
                    match std::fs::read_to_string(&log_path) {
                        Ok(log) => distiset = distiset.with_pipeline_log(log),
                        Err(e) => warn!(path = %log_path.display(), error = %e, "Run log unavailable"),
                    }
                }
                distiset.save_to_disk(
                    dir,
                    SaveOptions {
                        save_card: config.output.save_card,
                        save_pipeline_config: config.output.save_pipeline_config,
                        save_pipeline_log: config.output.save_pipeline_log,
                    },
                )?;
            }

            let limiter = client.rate_limiter().stats();

            println!("\n=== Cleaning Complete ===");
            println!("Records:     {}", stats.total_records);
            println!("Batches:     {}", stats.total_batches);
            println!("Scored:      {}", stats.total_scored);
            println!("Failures:    {}", stats.scoring_failures);
            println!("Success:     {:.1}%", stats.scoring_success_rate * 100.0);
            println!("Written:     {}", stats.total_written);
            if config.sink.is_some() {
                println!("Forwarded:   {}", stats.total_forwarded);
            }
            println!("Tokens:      {} in / {} out", stats.tokens_in, stats.tokens_out);
            println!("Cost:        ${:.4}", stats.scoring_cost_usd);
            println!("Rate limits: {} hits, {:.1}s waited", limiter.total_429s, limiter.total_wait_secs);
            println!("Runtime:     {:.1}s", stats.runtime_secs);
            println!("Throughput:  {:.0}/hr", stats.throughput_per_hour);
            println!("Output:      {}", config.output.path.display());
            println!("Log:         {}", log_path.display());
            if let Some(dir) = &config.output.distiset_dir {
                println!("Distiset:    {}", dir.display());
            }
        }
    }

    Ok(())
}
