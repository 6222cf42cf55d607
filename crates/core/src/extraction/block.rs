//! Tier 1: an explicit JSON block embedded in the output.

use async_trait::async_trait;

use super::{ExtractionTier, Extractor, StructuredOutput, WorkerRole};

pub const BLOCK_START: &str = "<!-- crucible-json";
pub const BLOCK_END: &str = "-->";

/// Reads `<!-- crucible-json {...} -->` blocks
pub struct BlockExtractor;

impl BlockExtractor {
    /// Payloads of every delimited block, in order
    pub fn payloads(text: &str) -> Vec<&str> {
        let mut payloads = Vec::new();
        let mut rest = text;

        while let Some(start) = rest.find(BLOCK_START) {
            let after_marker = &rest[start + BLOCK_START.len()..];
            let Some(end) = after_marker.find(BLOCK_END) else {
                break;
            };
            payloads.push(after_marker[..end].trim());
            rest = &after_marker[end + BLOCK_END.len()..];
        }

        payloads
    }

    /// First block that parses into a non-empty output
    pub fn parse(text: &str) -> Option<StructuredOutput> {
        Self::payloads(text).into_iter().find_map(|payload| {
            match serde_json::from_str::<StructuredOutput>(payload) {
                Ok(output) if !output.is_empty() => Some(output),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!("Malformed crucible-json block: {}", e);
                    None
                }
            }
        })
    }
}

#[async_trait]
impl Extractor for BlockExtractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Block
    }

    async fn extract(&self, _role: WorkerRole, text: &str) -> Option<StructuredOutput> {
        Self::parse(text)
    }
}
