//! Tier 2: line-oriented scans for tagged decisions, grades, doubts and
//! builder abandon notices.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use super::{
    Abandon, ComponentGrade, Decision, Doubt, ExtractionTier, Extractor, StructuredOutput,
    WorkerRole,
};

static DECISION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^[ \t]*(?:[-*][ \t]+)?\[(judgment|test|analogy|strong_consensus|consensus|proof)\][ \t]*(.+?)[ \t]*$",
    )
    .expect("decision regex is valid")
});

static GRADE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^[ \t]*(?:[-*][ \t]+)?(?:\*\*)?([A-Za-z0-9_][\w ./\-]*?)(?:\*\*)?[ \t]*:[ \t]*(?:\*\*)?(sound|good|weak|rejected)(?:\*\*)?[ \t]*\.?[ \t]*\r?$",
    )
    .expect("grade regex is valid")
});

static DOUBT_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^[ \t]*(?:#{1,6}[ \t]*|\*\*)?doubt\b[ \t]*#?\d*[ \t]*[:.)\-]?[ \t]*(.*?)[ \t*]*$")
        .expect("doubt title regex is valid")
});

static SEVERITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^[ \t]*(?:[-*][ \t]+)?(?:\*\*)?severity(?:\*\*)?[ \t]*:[ \t]*(?:\*\*)?(critical|moderate|minor)\b",
    )
    .expect("severity regex is valid")
});

static ABANDON_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\[abandon\][ \t]*([^\n]*).*?structural[ _]constraint(?:\*\*)?[ \t]*:[ \t]*([^\n]+)")
        .expect("abandon regex is valid")
});

static HYPOTHESIS_INVALID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)HYPOTHESIS INVALID:[ \t]*([^\n]+)").expect("invalid-hypothesis regex is valid")
});

static CONSTRAINT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)structural[ _]constraint(?:\*\*)?[ \t]*:[ \t]*([^\n]+)")
        .expect("constraint regex is valid")
});

/// Regex scanner over free text
#[derive(Debug, Default)]
pub struct PatternExtractor;

impl PatternExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Scan everything; the result may be empty
    pub fn scan(role: WorkerRole, text: &str) -> StructuredOutput {
        StructuredOutput {
            decisions: scan_decisions(text),
            grades: scan_grades(text),
            doubts: scan_doubts(text),
            abandon: if role == WorkerRole::Builder {
                scan_abandon(text)
            } else {
                None
            },
        }
    }
}

#[async_trait]
impl Extractor for PatternExtractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Pattern
    }

    async fn extract(&self, role: WorkerRole, text: &str) -> Option<StructuredOutput> {
        Some(Self::scan(role, text))
    }
}

fn scan_decisions(text: &str) -> Vec<Decision> {
    DECISION
        .captures_iter(text)
        .filter_map(|caps| {
            let evidence = caps[1].parse().ok()?;
            Some(Decision {
                evidence,
                description: caps[2].trim().to_string(),
            })
        })
        .collect()
}

fn scan_grades(text: &str) -> Vec<ComponentGrade> {
    GRADE
        .captures_iter(text)
        .filter_map(|caps| {
            let grade = caps[2].parse().ok()?;
            Some(ComponentGrade {
                component: caps[1].trim().to_string(),
                grade,
            })
        })
        .collect()
}

/// Each doubt runs from its title line to the next title (or end of text)
fn scan_doubts(text: &str) -> Vec<Doubt> {
    let titles: Vec<_> = DOUBT_TITLE.captures_iter(text).collect();
    let mut doubts = Vec::new();

    for (i, caps) in titles.iter().enumerate() {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let body_end = titles
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let body = &text[whole.end()..body_end];

        let Some(severity_caps) = SEVERITY.captures(body) else {
            tracing::debug!("Doubt block without severity skipped");
            continue;
        };
        let Ok(severity) = severity_caps[1].parse() else {
            continue;
        };

        let title = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let description = if title.is_empty() {
            let before_severity = severity_caps
                .get(0)
                .map(|m| &body[..m.start()])
                .unwrap_or(body);
            before_severity
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            title.to_string()
        };
        if description.is_empty() {
            continue;
        }

        doubts.push(Doubt {
            description,
            severity,
        });
    }

    doubts
}

fn scan_abandon(text: &str) -> Option<Abandon> {
    if let Some(caps) = ABANDON_TAG.captures(text) {
        let constraint = caps[2].trim().to_string();
        let reason = match caps[1].trim() {
            "" => constraint.clone(),
            reason => reason.to_string(),
        };
        return Some(Abandon {
            reason,
            structural_constraint: constraint,
        });
    }

    let caps = HYPOTHESIS_INVALID.captures(text)?;
    let reason = caps[1].trim().to_string();
    let structural_constraint = CONSTRAINT_LINE
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| reason.clone());
    Some(Abandon {
        reason,
        structural_constraint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{EvidenceLevel, Severity};
    use crate::lifecycle::Grade;

    #[test]
    fn test_tagged_decisions_in_order() {
        let text = "\
Work log
[test] hashing is 3x faster on the large fixture
- [judgment] keep the old API surface
[strong_consensus] everyone agrees the cache is the bottleneck
[opinion] not a real tag
";
        let output = PatternExtractor::scan(WorkerRole::Builder, text);
        assert_eq!(output.decisions.len(), 3);
        assert_eq!(output.decisions[0].evidence, EvidenceLevel::Test);
        assert_eq!(
            output.decisions[0].description,
            "hashing is 3x faster on the large fixture"
        );
        assert_eq!(output.decisions[1].evidence, EvidenceLevel::Judgment);
        assert_eq!(output.decisions[2].evidence, EvidenceLevel::StrongConsensus);
    }

    #[test]
    fn test_component_grades() {
        let text = "\
## Verdict
- parser: sound
- **cache layer**: weak
scheduler: GOOD
notes: pending
";
        let output = PatternExtractor::scan(WorkerRole::Verifier, text);
        assert_eq!(output.grades.len(), 3);
        assert_eq!(output.grades[0].component, "parser");
        assert_eq!(output.grades[1].component, "cache layer");
        assert_eq!(output.grades[1].grade, Grade::Weak);
        assert_eq!(output.grades[2].grade, Grade::Good);
        assert_eq!(output.worst_grade(), Some(Grade::Weak));
    }

    #[test]
    fn test_component_grades_with_crlf_endings() {
        let text = "parser: sound\r\ncache: weak\r\n";
        let output = PatternExtractor::scan(WorkerRole::Verifier, text);
        assert_eq!(output.grades.len(), 2);
        assert_eq!(output.grades[0].component, "parser");
        assert_eq!(output.grades[0].grade, Grade::Sound);
        assert_eq!(output.grades[1].grade, Grade::Weak);
    }

    #[test]
    fn test_doubt_blocks_pair_with_severity() {
        let text = "\
### Doubt 1: eviction order is untested
The LRU path never runs in the suite.
Severity: critical

### Doubt 2: naming
Severity: minor

### Doubt 3: no severity given here
";
        let output = PatternExtractor::scan(WorkerRole::Critic, text);
        assert_eq!(output.doubts.len(), 2);
        assert_eq!(output.doubts[0].description, "eviction order is untested");
        assert_eq!(output.doubts[0].severity, Severity::Critical);
        assert_eq!(output.doubts[1].description, "naming");
        assert_eq!(output.doubts[1].severity, Severity::Minor);
    }

    #[test]
    fn test_untitled_doubt_uses_body() {
        let text = "**Doubt**\nthe benchmark is noisy\nSeverity: moderate\n";
        let output = PatternExtractor::scan(WorkerRole::Critic, text);
        assert_eq!(output.doubts.len(), 1);
        assert_eq!(output.doubts[0].description, "the benchmark is noisy");
        assert_eq!(output.doubts[0].severity, Severity::Moderate);
    }

    #[test]
    fn test_abandon_tag_for_builder() {
        let text = "\
[abandon] the allocator cannot be swapped per request
Structural constraint: global allocator is process-wide
";
        let abandon = PatternExtractor::scan(WorkerRole::Builder, text)
            .abandon
            .unwrap();
        assert_eq!(abandon.reason, "the allocator cannot be swapped per request");
        assert_eq!(
            abandon.structural_constraint,
            "global allocator is process-wide"
        );
    }

    #[test]
    fn test_hypothesis_invalid_line() {
        let text = "Tried three ways.\nHYPOTHESIS INVALID: lock contention is not the cause\n";
        let abandon = PatternExtractor::scan(WorkerRole::Builder, text)
            .abandon
            .unwrap();
        assert_eq!(abandon.reason, "lock contention is not the cause");
        assert_eq!(abandon.structural_constraint, abandon.reason);
    }

    #[test]
    fn test_abandon_ignored_for_other_roles() {
        let text = "HYPOTHESIS INVALID: nope\n[abandon] x\nStructural constraint: y\n";
        let output = PatternExtractor::scan(WorkerRole::Adversary, text);
        assert!(output.abandon.is_none());
        assert!(output.is_empty());
    }

    #[test]
    fn test_plain_prose_is_empty() {
        let output = PatternExtractor::scan(WorkerRole::Builder, "Nothing structured here.");
        assert!(output.is_empty());
    }
}
