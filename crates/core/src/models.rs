//! # Interpreter Models
//!
//! Which LLM backs the last-resort output interpreter. API keys come from
//! the provider's usual environment variable (`ANTHROPIC_API_KEY`,
//! `OPENAI_API_KEY`, `OPENROUTER_API_KEY`).

use serde::{Deserialize, Serialize};

/// Supported LLM providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    OpenRouter,
}

impl LlmProvider {
    pub fn env_key(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenAI => "OPENAI_API_KEY",
            LlmProvider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    /// Key is present in the environment
    pub fn is_configured(&self) -> bool {
        std::env::var(self.env_key())
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Provider and model for the interpreter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    pub model: String,
    /// OpenAI-compatible endpoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            model: "claude-3-5-haiku-latest".to_string(),
            base_url: None,
        }
    }
}

impl ModelConfig {
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Run a radkit `LlmFunction` producing `$output_type` against whichever
/// provider `$config` names.
macro_rules! run_llm_function {
    ($config:expr, $output_type:ty, $system_prompt:expr, $input:expr) => {{
        use radkit::agent::LlmFunction;
        use radkit::models::providers::{AnthropicLlm, OpenAILlm, OpenRouterLlm};
        use $crate::models::LlmProvider;

        let config: &$crate::models::ModelConfig = $config;
        let result: anyhow::Result<$output_type> = match config.provider {
            LlmProvider::Anthropic => {
                let llm = AnthropicLlm::from_env(&config.model)?;
                LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt)
                    .run($input)
                    .await
                    .map_err(Into::into)
            }
            LlmProvider::OpenAI => {
                let mut llm = OpenAILlm::from_env(&config.model)?;
                if let Some(base_url) = &config.base_url {
                    llm = llm.with_base_url(base_url);
                }
                LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt)
                    .run($input)
                    .await
                    .map_err(Into::into)
            }
            LlmProvider::OpenRouter => {
                let llm = OpenRouterLlm::from_env(&config.model)?;
                LlmFunction::<$output_type>::new_with_system_instructions(llm, $system_prompt)
                    .run($input)
                    .await
                    .map_err(Into::into)
            }
        };
        result
    }};
}

pub(crate) use run_llm_function;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_anthropic() {
        let config = ModelConfig::default();
        assert_eq!(config.provider, LlmProvider::Anthropic);
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_provider_serialization() {
        let config = ModelConfig::with_provider(LlmProvider::OpenAI, "gpt-4o-mini")
            .with_base_url("http://localhost:8080/v1");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"openai\""));

        let parsed: ModelConfig =
            serde_json::from_str(r#"{"provider": "openrouter", "model": "m"}"#).unwrap();
        assert_eq!(parsed.provider, LlmProvider::OpenRouter);
    }

    #[test]
    fn test_env_keys() {
        assert_eq!(LlmProvider::OpenRouter.env_key(), "OPENROUTER_API_KEY");
    }
}
