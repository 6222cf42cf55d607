//! Tier 3: hand the raw text to an interpreter (normally an LLM) and keep
//! whatever well-formed records come back.

use anyhow::Result;
use async_trait::async_trait;
use radkit::macros::LLMOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{
    Abandon, ComponentGrade, Decision, Doubt, ExtractionTier, Extractor, StructuredOutput,
    WorkerRole,
};
use crate::models::{run_llm_function, ModelConfig};

/// Longest slice of worker output sent to the interpreter
const MAX_INTERPRETER_INPUT: usize = 24_000;

const SYSTEM_PROMPT: &str = r#"You read the output of an autonomous worker taking part in a code experiment and pull out structured findings.

Return only what the text actually states:
- decisions: choices the worker made, each with an evidence level of exactly one of
  proof, test, strong_consensus, consensus, analogy, judgment
- grades: per-component verdicts of exactly one of sound, good, weak, rejected
- doubts: concerns raised, each with severity critical, moderate or minor
- abandon: only if the worker declared the hypothesis unworkable; give the reason and the structural constraint that makes it so

Leave a list empty rather than inventing entries."#;

/// Something that can turn free text into structured output
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn interpret(&self, role: WorkerRole, text: &str) -> Result<StructuredOutput>;
}

/// Wraps an [`Interpreter`]; any error means "nothing found"
pub struct FallbackExtractor {
    interpreter: Arc<dyn Interpreter>,
}

impl FallbackExtractor {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self { interpreter }
    }
}

#[async_trait]
impl Extractor for FallbackExtractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Fallback
    }

    async fn extract(&self, role: WorkerRole, text: &str) -> Option<StructuredOutput> {
        match self.interpreter.interpret(role, text).await {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!(%role, "Interpreter failed: {:#}", e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct InterpretedDecision {
    pub evidence: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct InterpretedGrade {
    pub component: String,
    pub grade: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct InterpretedDoubt {
    pub description: String,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct InterpretedAbandon {
    pub reason: String,
    pub structural_constraint: String,
}

/// Loosely-typed interpreter reply; enum fields arrive as strings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct InterpretedOutput {
    #[serde(default)]
    pub decisions: Vec<InterpretedDecision>,
    #[serde(default)]
    pub grades: Vec<InterpretedGrade>,
    #[serde(default)]
    pub doubts: Vec<InterpretedDoubt>,
    #[serde(default)]
    pub abandon: Option<InterpretedAbandon>,
}

impl InterpretedOutput {
    /// Keep entries whose enum values parse; drop the rest
    pub fn into_structured(self) -> StructuredOutput {
        StructuredOutput {
            decisions: self
                .decisions
                .into_iter()
                .filter_map(|d| {
                    Some(Decision {
                        evidence: d.evidence.parse().ok()?,
                        description: d.description,
                    })
                })
                .collect(),
            grades: self
                .grades
                .into_iter()
                .filter_map(|g| {
                    Some(ComponentGrade {
                        grade: g.grade.parse().ok()?,
                        component: g.component,
                    })
                })
                .collect(),
            doubts: self
                .doubts
                .into_iter()
                .filter_map(|d| {
                    Some(Doubt {
                        severity: d.severity.parse().ok()?,
                        description: d.description,
                    })
                })
                .collect(),
            abandon: self
                .abandon
                .filter(|a| !a.reason.trim().is_empty())
                .map(|a| Abandon {
                    reason: a.reason,
                    structural_constraint: a.structural_constraint,
                }),
        }
    }
}

/// LLM-backed interpreter
pub struct LlmInterpreter {
    config: ModelConfig,
}

impl LlmInterpreter {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Only build one when the provider's API key is set
    pub fn from_env(config: ModelConfig) -> Option<Self> {
        if config.provider.is_configured() {
            Some(Self::new(config))
        } else {
            tracing::debug!(
                "{} not set; interpreter fallback disabled",
                config.provider.env_key()
            );
            None
        }
    }

    async fn run(&self, prompt: String) -> Result<InterpretedOutput> {
        run_llm_function!(&self.config, InterpretedOutput, SYSTEM_PROMPT, prompt)
    }
}

#[async_trait]
impl Interpreter for LlmInterpreter {
    async fn interpret(&self, role: WorkerRole, text: &str) -> Result<StructuredOutput> {
        let excerpt: String = text.chars().take(MAX_INTERPRETER_INPUT).collect();
        let prompt = format!("Worker role: {}\n\nWorker output:\n{}", role, excerpt);
        let reply = self.run(prompt).await?;
        Ok(reply.into_structured())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{EvidenceLevel, ExtractionPipeline, Severity};

    struct Canned(InterpretedOutput);

    #[async_trait]
    impl Interpreter for Canned {
        async fn interpret(&self, _role: WorkerRole, _text: &str) -> Result<StructuredOutput> {
            Ok(self.0.clone().into_structured())
        }
    }

    struct Broken;

    #[async_trait]
    impl Interpreter for Broken {
        async fn interpret(&self, _role: WorkerRole, _text: &str) -> Result<StructuredOutput> {
            anyhow::bail!("provider unavailable")
        }
    }

    fn reply() -> InterpretedOutput {
        InterpretedOutput {
            decisions: vec![
                InterpretedDecision {
                    evidence: "analogy".to_string(),
                    description: "like the old cache".to_string(),
                },
                InterpretedDecision {
                    evidence: "vibes".to_string(),
                    description: "dropped".to_string(),
                },
            ],
            doubts: vec![InterpretedDoubt {
                description: "flaky bench".to_string(),
                severity: "Moderate".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_unparseable_entries_are_dropped() {
        let output = reply().into_structured();
        assert_eq!(output.decisions.len(), 1);
        assert_eq!(output.decisions[0].evidence, EvidenceLevel::Analogy);
        assert_eq!(output.doubts[0].severity, Severity::Moderate);
    }

    #[tokio::test]
    async fn test_pipeline_uses_fallback_when_text_is_unstructured() {
        let pipeline = ExtractionPipeline::standard(Some(Arc::new(Canned(reply()))));
        let extraction = pipeline
            .extract(WorkerRole::Critic, "rambling prose with no tags")
            .await;
        assert_eq!(extraction.tier, ExtractionTier::Fallback);
        assert_eq!(extraction.output.unwrap().decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_interpreter_error_yields_no_data() {
        let pipeline = ExtractionPipeline::standard(Some(Arc::new(Broken)));
        let extraction = pipeline.extract(WorkerRole::Critic, "prose").await;
        assert_eq!(extraction.tier, ExtractionTier::None);
        assert!(extraction.output.is_none());
    }
}
