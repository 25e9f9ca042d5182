mod page;
mod runner;
mod server;
mod telemetry;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use refinery_engine::config::{DEFAULT_GEMINI_MODEL, DEFAULT_PROVIDER, DEFAULT_REQUEST_TIMEOUT};
use refinery_engine::gemini::DEFAULT_GEMINI_API_BASE;
use refinery_engine::intake::{IntakeOptions, DEFAULT_MAX_MODEL_DIM};
use refinery_engine::refine::{RefinementPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_TARGET_SCORE};
use refinery_engine::{ApiKey, EngineConfig};
use tracing::{info, Level};

use crate::runner::RunArgs;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(
    name = "refinery",
    version,
    about = "Multi-image analysis with an audited refinement loop"
)]
struct Cli {
    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, env = "REFINERY_LOG_LEVEL", default_value = "info")]
    log_level: Level,
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "REFINERY_LOG_JSON")]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the upload form and the processing endpoints.
    Serve(ServeArgs),
    /// Process local image files once and print the frames.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "REFINERY_BIND", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,
    #[arg(long, env = "REFINERY_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Clone, Parser)]
pub(crate) struct EngineArgs {
    #[arg(
        long,
        env = "REFINERY_PROVIDER",
        default_value = DEFAULT_PROVIDER,
        value_parser = ["gemini", "dryrun"]
    )]
    provider: String,
    /// Model name; unset picks the provider's default.
    #[arg(long, env = "GEMINI_MODEL")]
    model: Option<String>,
    #[arg(long, env = "GEMINI_API_BASE", default_value = DEFAULT_GEMINI_API_BASE)]
    api_base: String,
    /// Falls back to GOOGLE_API_KEY.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(
        long,
        env = "REFINERY_MAX_ATTEMPTS",
        default_value_t = DEFAULT_MAX_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..=10)
    )]
    max_attempts: u32,
    #[arg(
        long,
        env = "REFINERY_TARGET_SCORE",
        default_value_t = DEFAULT_TARGET_SCORE,
        value_parser = clap::value_parser!(u8).range(0..=100)
    )]
    target_score: u8,
    #[arg(
        long,
        env = "REFINERY_REQUEST_TIMEOUT_SECS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    request_timeout_secs: u64,
    /// Longest image side sent to the model; 0 sends originals.
    #[arg(long, env = "REFINERY_MAX_IMAGE_DIM", default_value_t = DEFAULT_MAX_MODEL_DIM)]
    max_image_dim: u32,
    #[arg(
        long,
        env = "REFINERY_STREAM_SYNTHESIS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    stream_synthesis: bool,
    /// Directory with analysis.md, synthesis.md or audit.md overrides.
    #[arg(long, env = "REFINERY_PROMPTS_DIR")]
    prompts_dir: Option<PathBuf>,
}

impl EngineArgs {
    pub(crate) fn into_config(self) -> EngineConfig {
        let api_key = self
            .api_key
            .and_then(ApiKey::new)
            .or_else(|| env::var("GOOGLE_API_KEY").ok().and_then(ApiKey::new));
        let model = self
            .model
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| (self.provider == "gemini").then(|| DEFAULT_GEMINI_MODEL.to_string()));
        EngineConfig {
            provider: self.provider,
            model,
            api_base: self.api_base,
            api_key,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            policy: RefinementPolicy {
                max_attempts: self.max_attempts,
                target_score: self.target_score,
            },
            intake: IntakeOptions {
                max_model_dim: self.max_image_dim,
            },
            stream_synthesis: self.stream_synthesis,
            prompts_dir: self.prompts_dir,
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("refinery error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_json, cli.log_level);
    match cli.command {
        Command::Serve(args) => {
            run_serve(args)?;
            Ok(0)
        }
        Command::Run(args) => runner::run_local(args),
    }
}

fn run_serve(args: ServeArgs) -> Result<()> {
    // The blocking HTTP client must be built before any runtime exists, and
    // `pipeline` outlives the runtime so the client is never dropped inside it.
    let pipeline = args.engine.into_config().build_pipeline()?;
    info!(
        provider = pipeline.provider(),
        model = pipeline.model(),
        max_attempts = pipeline.policy().max_attempts,
        target_score = pipeline.policy().target_score,
        "pipeline ready"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let app = server::router(pipeline.clone(), args.max_upload_bytes);
    runtime.block_on(server::serve(args.bind, app))?;
    drop(runtime);
    drop(pipeline);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn serve_defaults_match_documented_settings() {
        let cli = Cli::try_parse_from(["refinery", "serve", "--provider", "dryrun"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.max_upload_bytes, 32 * 1024 * 1024);
        let config = args.engine.into_config();
        assert_eq!(config.provider, "dryrun");
        assert_eq!(config.model, None);
        assert_eq!(config.policy.max_attempts, 3);
        assert_eq!(config.policy.target_score, 85);
        assert_eq!(config.intake.max_model_dim, 2048);
        assert_eq!(config.request_timeout.as_secs(), 180);
        assert!(config.stream_synthesis);
    }

    #[test]
    fn out_of_range_settings_are_rejected() {
        assert!(Cli::try_parse_from(["refinery", "serve", "--target-score", "101"]).is_err());
        assert!(Cli::try_parse_from(["refinery", "serve", "--max-attempts", "0"]).is_err());
        assert!(Cli::try_parse_from(["refinery", "serve", "--provider", "openai"]).is_err());
    }

    #[test]
    fn run_accepts_repeated_images_and_text_format() {
        let cli = Cli::try_parse_from([
            "refinery",
            "run",
            "--image",
            "a.png",
            "--image",
            "b.png",
            "--format",
            "text",
            "--stream-synthesis",
            "false",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.images.len(), 2);
        assert!(!args.engine.into_config().stream_synthesis);
    }
}
