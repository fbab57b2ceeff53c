//! Artifact validation
//!
//! Rules-based structural completeness checks on a gathered artifact.
//! Deterministic and I/O free: the same artifact always gets the same verdict,
//! which is what lets resume re-derive outcomes from persisted artifacts.

use crate::models::{ResearchArtifact, Task, Verdict};
use serde_json::Value;
use tracing::debug;

/// Trait for artifact rules
pub trait ArtifactRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, task: &Task, artifact: &ResearchArtifact) -> Verdict;
}

/// Validation engine that applies rules in registration order
pub struct Validator {
    rules: Vec<Box<dyn ArtifactRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn ArtifactRule>) {
        self.rules.push(rule);
    }

    /// The most severe failing rule decides; ties go to the earlier rule.
    pub fn evaluate(&self, task: &Task, artifact: &ResearchArtifact) -> Verdict {
        let mut verdict = Verdict::Satisfied;

        for rule in &self.rules {
            let result = rule.check(task, artifact);
            if severity(&result) > severity(&verdict) {
                debug!(
                    rule = rule.name(),
                    capability = %task.capability,
                    reason = result.reason().unwrap_or_default(),
                    "artifact rule failed"
                );
                verdict = match result {
                    Verdict::Satisfied => Verdict::Satisfied,
                    Verdict::InsufficientData(reason) => {
                        Verdict::InsufficientData(format!("{}: {}", rule.name(), reason))
                    }
                    Verdict::Error(reason) => Verdict::Error(format!("{}: {}", rule.name(), reason)),
                };
            }
        }

        verdict
    }
}

impl Default for Validator {
    fn default() -> Self {
        create_default_validator()
    }
}

fn severity(verdict: &Verdict) -> u8 {
    match verdict {
        Verdict::Satisfied => 0,
        Verdict::InsufficientData(_) => 1,
        Verdict::Error(_) => 2,
    }
}

//
// ================= Rules =================
//

/// Rule: the artifact answers the task that was dispatched
pub struct CapabilityMatchRule;

impl ArtifactRule for CapabilityMatchRule {
    fn name(&self) -> &'static str {
        "capability_match"
    }

    fn check(&self, task: &Task, artifact: &ResearchArtifact) -> Verdict {
        if task.capability == artifact.capability {
            Verdict::Satisfied
        } else {
            Verdict::Error(format!(
                "expected {}, got {}",
                task.capability, artifact.capability
            ))
        }
    }
}

/// Rule: payload is a non-empty object
pub struct PayloadPresentRule;

impl ArtifactRule for PayloadPresentRule {
    fn name(&self) -> &'static str {
        "payload_present"
    }

    fn check(&self, _task: &Task, artifact: &ResearchArtifact) -> Verdict {
        match &artifact.payload {
            Value::Object(map) if !map.is_empty() => Verdict::Satisfied,
            Value::Object(_) => Verdict::InsufficientData("payload is empty".to_string()),
            Value::Null => Verdict::Error("payload is missing".to_string()),
            _ => Verdict::Error("payload is not an object".to_string()),
        }
    }
}

/// Rule: the capability's data field is present and non-empty
pub struct ExpectedFieldRule;

impl ArtifactRule for ExpectedFieldRule {
    fn name(&self) -> &'static str {
        "expected_field"
    }

    fn check(&self, task: &Task, artifact: &ResearchArtifact) -> Verdict {
        let field = task.capability.payload_field();

        let value = match artifact.payload.get(field) {
            Some(value) if !value.is_null() => value,
            _ => {
                return Verdict::InsufficientData(format!("'{}' missing from response", field))
            }
        };

        if task.capability.is_snapshot() {
            match value {
                Value::Object(map) if !map.is_empty() => Verdict::Satisfied,
                Value::Object(_) => Verdict::InsufficientData(format!("'{}' is empty", field)),
                _ => Verdict::Error(format!("'{}' is not an object", field)),
            }
        } else {
            match value {
                Value::Array(rows) if !rows.is_empty() => Verdict::Satisfied,
                Value::Array(_) => {
                    Verdict::InsufficientData("no rows for requested period".to_string())
                }
                _ => Verdict::Error(format!("'{}' is not a list", field)),
            }
        }
    }
}

/// Rule: the artifact can be cited
pub struct SourcePresentRule;

impl ArtifactRule for SourcePresentRule {
    fn name(&self) -> &'static str {
        "source_present"
    }

    fn check(&self, _task: &Task, artifact: &ResearchArtifact) -> Verdict {
        if artifact.source.trim().is_empty() {
            Verdict::Error("source descriptor is empty".to_string())
        } else {
            Verdict::Satisfied
        }
    }
}

/// Create a validator with the standard rules
pub fn create_default_validator() -> Validator {
    let mut validator = Validator::new();
    validator.add_rule(Box::new(CapabilityMatchRule));
    validator.add_rule(Box::new(PayloadPresentRule));
    validator.add_rule(Box::new(ExpectedFieldRule));
    validator.add_rule(Box::new(SourcePresentRule));
    validator
}

//
// ================= Tests =================
//
