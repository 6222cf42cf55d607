//! # Output Extraction
//!
//! Turns free-form worker output into typed records. Tiers are tried in
//! order and the first one that yields data wins:
//!
//! ```text
//! Block (<!-- crucible-json ... -->) → Pattern (regex scans) → Fallback (interpreter)
//! ```
//!
//! Nothing here returns an error: a tier that finds nothing simply hands the
//! text to the next one, and total failure is reported as [`ExtractionTier::None`].

pub mod block;
pub mod fallback;
pub mod patterns;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::lifecycle::Grade;

pub use block::BlockExtractor;
pub use fallback::{FallbackExtractor, Interpreter, LlmInterpreter};
pub use patterns::PatternExtractor;

/// Role of the worker that produced a piece of output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Gatekeeper,
    Builder,
    Adversary,
    Critic,
    Scout,
    Verifier,
    Compressor,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gatekeeper => "gatekeeper",
            Self::Builder => "builder",
            Self::Adversary => "adversary",
            Self::Critic => "critic",
            Self::Scout => "scout",
            Self::Verifier => "verifier",
            Self::Compressor => "compressor",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How strongly a decision is supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceLevel {
    Proof,
    Test,
    StrongConsensus,
    Consensus,
    Analogy,
    Judgment,
}

impl EvidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proof => "proof",
            Self::Test => "test",
            Self::StrongConsensus => "strong_consensus",
            Self::Consensus => "consensus",
            Self::Analogy => "analogy",
            Self::Judgment => "judgment",
        }
    }
}

impl FromStr for EvidenceLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proof" => Ok(Self::Proof),
            "test" => Ok(Self::Test),
            "strong_consensus" => Ok(Self::StrongConsensus),
            "consensus" => Ok(Self::Consensus),
            "analogy" => Ok(Self::Analogy),
            "judgment" => Ok(Self::Judgment),
            other => anyhow::bail!("unknown evidence level '{}'", other),
        }
    }
}

/// How badly a doubt threatens the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Moderate,
    Minor,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Moderate => "moderate",
            Self::Minor => "minor",
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "moderate" => Ok(Self::Moderate),
            "minor" => Ok(Self::Minor),
            other => anyhow::bail!("unknown severity '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(alias = "evidence_level")]
    pub evidence: EvidenceLevel,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentGrade {
    pub component: String,
    pub grade: Grade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doubt {
    pub description: String,
    pub severity: Severity,
}

/// Builder's declaration that the hypothesis cannot work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abandon {
    pub reason: String,
    #[serde(alias = "constraint")]
    pub structural_constraint: String,
}

/// Everything extracted from one piece of worker output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredOutput {
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub grades: Vec<ComponentGrade>,
    #[serde(default)]
    pub doubts: Vec<Doubt>,
    #[serde(default)]
    pub abandon: Option<Abandon>,
}

impl StructuredOutput {
    /// No field carries data
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
            && self.grades.is_empty()
            && self.doubts.is_empty()
            && self.abandon.is_none()
    }

    /// Drop what the role is not allowed to produce (only builders abandon)
    pub fn restricted_to(mut self, role: WorkerRole) -> Self {
        if role != WorkerRole::Builder {
            self.abandon = None;
        }
        self
    }

    /// Worst component grade, if any grades were recorded
    pub fn worst_grade(&self) -> Option<Grade> {
        self.grades.iter().map(|g| g.grade).max()
    }
}

/// Which tier produced an extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    Block,
    Pattern,
    Fallback,
    None,
}

impl ExtractionTier {
    /// Numeric tier (1-3), 0 for none
    pub fn number(&self) -> u8 {
        match self {
            Self::Block => 1,
            Self::Pattern => 2,
            Self::Fallback => 3,
            Self::None => 0,
        }
    }
}

/// Result of running the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub tier: ExtractionTier,
    pub output: Option<StructuredOutput>,
}

impl Extraction {
    fn nothing() -> Self {
        Self {
            tier: ExtractionTier::None,
            output: None,
        }
    }
}

/// One extraction strategy
#[async_trait]
pub trait Extractor: Send + Sync {
    fn tier(&self) -> ExtractionTier;

    /// `None` or an empty output both mean "nothing usable here"
    async fn extract(&self, role: WorkerRole, text: &str) -> Option<StructuredOutput>;
}

/// Ordered chain of extractors
pub struct ExtractionPipeline {
    tiers: Vec<Box<dyn Extractor>>,
}

impl ExtractionPipeline {
    pub fn new(tiers: Vec<Box<dyn Extractor>>) -> Self {
        Self { tiers }
    }

    /// Block and pattern tiers, plus the interpreter fallback when one is given
    pub fn standard(interpreter: Option<Arc<dyn Interpreter>>) -> Self {
        let mut tiers: Vec<Box<dyn Extractor>> =
            vec![Box::new(BlockExtractor), Box::new(PatternExtractor::new())];
        if let Some(interpreter) = interpreter {
            tiers.push(Box::new(FallbackExtractor::new(interpreter)));
        }
        Self::new(tiers)
    }

    /// Run the tiers in order until one yields data
    pub async fn extract(&self, role: WorkerRole, text: &str) -> Extraction {
        for extractor in &self.tiers {
            let tier = extractor.tier();
            match extractor.extract(role, text).await {
                Some(output) => {
                    let output = output.restricted_to(role);
                    if output.is_empty() {
                        tracing::debug!(tier = tier.number(), %role, "Tier yielded no data");
                        continue;
                    }
                    tracing::debug!(tier = tier.number(), %role, "Extraction succeeded");
                    return Extraction {
                        tier,
                        output: Some(output),
                    };
                }
                None => tracing::debug!(tier = tier.number(), %role, "Tier found nothing"),
            }
        }

        tracing::info!(%role, "No structured data in worker output");
        Extraction::nothing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ExtractionTier, Option<StructuredOutput>);

    #[async_trait]
    impl Extractor for Fixed {
        fn tier(&self) -> ExtractionTier {
            self.0
        }

        async fn extract(&self, _role: WorkerRole, _text: &str) -> Option<StructuredOutput> {
            self.1.clone()
        }
    }

    fn with_doubt() -> StructuredOutput {
        StructuredOutput {
            doubts: vec![Doubt {
                description: "d".to_string(),
                severity: Severity::Minor,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_tier_with_data_wins() {
        let pipeline = ExtractionPipeline::new(vec![
            Box::new(Fixed(ExtractionTier::Block, None)),
            Box::new(Fixed(ExtractionTier::Pattern, Some(StructuredOutput::default()))),
            Box::new(Fixed(ExtractionTier::Fallback, Some(with_doubt()))),
        ]);

        let extraction = pipeline.extract(WorkerRole::Critic, "text").await;
        assert_eq!(extraction.tier, ExtractionTier::Fallback);
        assert_eq!(extraction.tier.number(), 3);
        assert_eq!(extraction.output, Some(with_doubt()));
    }

    #[tokio::test]
    async fn test_no_tier_yields_none() {
        let pipeline = ExtractionPipeline::new(vec![Box::new(Fixed(ExtractionTier::Block, None))]);
        let extraction = pipeline.extract(WorkerRole::Critic, "text").await;
        assert_eq!(extraction.tier, ExtractionTier::None);
        assert!(extraction.output.is_none());
    }

    #[tokio::test]
    async fn test_abandon_only_survives_for_builder() {
        let abandon_only = StructuredOutput {
            abandon: Some(Abandon {
                reason: "r".to_string(),
                structural_constraint: "c".to_string(),
            }),
            ..Default::default()
        };
        let pipeline = ExtractionPipeline::new(vec![Box::new(Fixed(
            ExtractionTier::Block,
            Some(abandon_only.clone()),
        ))]);

        let builder = pipeline.extract(WorkerRole::Builder, "x").await;
        assert_eq!(builder.output, Some(abandon_only));

        let verifier = pipeline.extract(WorkerRole::Verifier, "x").await;
        assert_eq!(verifier.tier, ExtractionTier::None);
    }

    #[test]
    fn test_worst_grade() {
        let output = StructuredOutput {
            grades: vec![
                ComponentGrade {
                    component: "a".to_string(),
                    grade: Grade::Sound,
                },
                ComponentGrade {
                    component: "b".to_string(),
                    grade: Grade::Weak,
                },
            ],
            ..Default::default()
        };
        assert_eq!(output.worst_grade(), Some(Grade::Weak));
        assert_eq!(StructuredOutput::default().worst_grade(), None);
    }
}
