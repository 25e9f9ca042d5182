use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use refinery_contracts::models::{ModelSelector, CAPABILITY_VISION};
use tracing::{info, warn};

use crate::dryrun::{DryrunGateway, DRYRUN_MODEL};
use crate::gateway::{ApiKey, GatewayRegistry};
use crate::gemini::{GeminiGateway, DEFAULT_GEMINI_API_BASE};
use crate::intake::IntakeOptions;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::prompts::PromptSet;
use crate::refine::RefinementPolicy;

pub const DEFAULT_PROVIDER: &str = "gemini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);
pub const PROVIDERS: [&str; 2] = ["gemini", "dryrun"];

/// Everything the engine needs, resolved once at process start.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider: String,
    pub model: Option<String>,
    pub api_base: String,
    pub api_key: Option<ApiKey>,
    pub request_timeout: Duration,
    pub policy: RefinementPolicy,
    pub intake: IntakeOptions,
    pub stream_synthesis: bool,
    pub prompts_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: None,
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            api_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            policy: RefinementPolicy::default(),
            intake: IntakeOptions::default(),
            stream_synthesis: true,
            prompts_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !PROVIDERS.contains(&self.provider.as_str()) {
            bail!(
                "unknown provider '{}'; available: {}",
                self.provider,
                PROVIDERS.join(", ")
            );
        }
        if self.policy.max_attempts == 0 {
            bail!("max attempts must be at least 1");
        }
        if self.policy.target_score > 100 {
            bail!(
                "target score must be within 0..=100, got {}",
                self.policy.target_score
            );
        }
        if self.request_timeout.is_zero() {
            bail!("request timeout must be positive");
        }
        Ok(())
    }

    pub fn build_pipeline(&self) -> Result<Pipeline> {
        self.validate()?;
        let selection = ModelSelector::new(None)
            .select_for_provider(self.model.as_deref(), CAPABILITY_VISION, &self.provider)
            .map_err(anyhow::Error::msg)?;
        let model = selection.model.name.clone();
        if let Some(reason) = selection.fallback_reason.as_deref() {
            if self.model.is_some() {
                warn!(reason, model = %model, "model fallback");
            } else {
                info!(model = %model, "using default model");
            }
        }

        let registry = self.gateway_registry(&model)?;
        let Some(gateway) = registry.get(&self.provider) else {
            bail!("provider '{}' is not registered", self.provider);
        };
        if gateway.name() == "gemini" && self.api_key.is_none() {
            warn!("no Gemini API key configured; every request will fail at the analysis stage");
        }

        let prompts = match self.prompts_dir.as_deref() {
            Some(dir) => PromptSet::with_overrides(dir)
                .with_context(|| format!("failed loading prompts from {}", dir.display()))?,
            None => PromptSet::default(),
        };

        // The default-model notice is noise for clients; only a real fallback is surfaced.
        let model_notice = selection
            .fallback_reason
            .filter(|_| self.model.is_some());

        Ok(Pipeline::new(
            gateway,
            prompts,
            PipelineSettings {
                policy: self.policy,
                intake: self.intake,
                stream_synthesis: self.stream_synthesis,
                model_notice,
            },
        ))
    }

    fn gateway_registry(&self, model: &str) -> Result<GatewayRegistry> {
        let mut registry = GatewayRegistry::new();
        registry.register(DryrunGateway::new(if self.provider == "dryrun" {
            model
        } else {
            DRYRUN_MODEL
        }));
        registry.register(
            GeminiGateway::new(
                &self.api_base,
                self.api_key.clone(),
                if self.provider == "gemini" {
                    model
                } else {
                    DEFAULT_GEMINI_MODEL
                },
                self.request_timeout,
            )
            .context("failed to build the Gemini HTTP client")?,
        );
        Ok(registry)
    }
}
